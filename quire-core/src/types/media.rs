//! Media type helpers

/// Lowercase a media type, strip parameters and fix common misspellings.
pub fn canonical_media_type(raw: &str) -> String {
    let base = raw.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
    match base.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        "text/xhtml" | "application/xhtml" => "application/xhtml+xml".to_string(),
        "application/x-font-ttf" | "application/font-sfnt" | "font/truetype" => {
            "font/ttf".to_string()
        }
        "application/x-font-otf" | "application/vnd.ms-opentype" => "font/otf".to_string(),
        "application/font-woff" => "font/woff".to_string(),
        "text/x-oeb1-document" => "application/xhtml+xml".to_string(),
        "text/x-oeb1-css" => "text/css".to_string(),
        _ => base,
    }
}

/// Guess a media type from a file name's extension.
pub fn guess_media_type(name: &str) -> &'static str {
    let ext = name
        .rsplit('/')
        .next()
        .and_then(|file| file.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "xhtml" | "xht" | "html" | "htm" | "shtml" => "application/xhtml+xml",
        "css" => "text/css",
        "ncx" => "application/x-dtbncx+xml",
        "opf" => "application/oebps-package+xml",
        "jpg" | "jpeg" | "jpe" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        "tif" | "tiff" => "image/tiff",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "js" => "application/javascript",
        "xml" => "application/xml",
        "txt" => "text/plain",
        "smil" => "application/smil+xml",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        "pdf" => "application/pdf",
        "xpgt" => "application/adobe-page-template+xml",
        _ => "application/octet-stream",
    }
}

/// Default file extension for a media type
pub fn extension_for(media_type: &str) -> &'static str {
    match media_type {
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/svg+xml" => "svg",
        "image/webp" => "webp",
        "image/bmp" => "bmp",
        "image/tiff" => "tif",
        "text/css" => "css",
        "application/xhtml+xml" | "text/html" => "xhtml",
        "font/ttf" => "ttf",
        "font/otf" => "otf",
        "font/woff" => "woff",
        "font/woff2" => "woff2",
        _ => "bin",
    }
}

pub fn is_html(media_type: &str) -> bool {
    matches!(media_type, "application/xhtml+xml" | "text/html")
}

pub fn is_css(media_type: &str) -> bool {
    media_type == "text/css"
}

/// XML types that get a parsed tree in the container
pub fn is_xml(media_type: &str) -> bool {
    matches!(
        media_type,
        "image/svg+xml"
            | "application/x-dtbncx+xml"
            | "application/xml"
            | "application/oebps-package+xml"
            | "application/smil+xml"
    )
}

/// Raster image types the image pipeline can process
pub fn is_raster_image(media_type: &str) -> bool {
    matches!(
        media_type,
        "image/jpeg" | "image/png" | "image/gif" | "image/webp" | "image/bmp"
    )
}

/// Media type of an image payload judged by its magic bytes
pub fn sniff_image(data: &[u8]) -> Option<&'static str> {
    if data.starts_with(b"<svg") || (data.starts_with(b"<?xml") && find_svg(data)) {
        return Some("image/svg+xml");
    }
    let format = image::guess_format(data).ok()?;
    Some(match format {
        image::ImageFormat::Jpeg => "image/jpeg",
        image::ImageFormat::Png => "image/png",
        image::ImageFormat::Gif => "image/gif",
        image::ImageFormat::WebP => "image/webp",
        image::ImageFormat::Bmp => "image/bmp",
        image::ImageFormat::Tiff => "image/tiff",
        _ => return None,
    })
}

fn find_svg(data: &[u8]) -> bool {
    let head = &data[..data.len().min(512)];
    head.windows(4).any(|w| w == b"<svg")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical() {
        assert_eq!(canonical_media_type("Image/JPG"), "image/jpeg");
        assert_eq!(
            canonical_media_type("text/html; charset=utf-8"),
            "text/html"
        );
    }

    #[test]
    fn test_guess() {
        assert_eq!(guess_media_type("OEBPS/Text/ch1.XHTML"), "application/xhtml+xml");
        assert_eq!(guess_media_type("img/x.png"), "image/png");
        assert_eq!(guess_media_type("dir.d/README"), "application/octet-stream");
    }

    #[test]
    fn test_sniff() {
        assert_eq!(sniff_image(b"\x89PNG\r\n\x1a\n\0\0"), Some("image/png"));
        assert_eq!(sniff_image(&[0xFF, 0xD8, 0xFF, 0xE0]), Some("image/jpeg"));
        assert_eq!(sniff_image(b"<?xml version='1.0'?><svg/>"), Some("image/svg+xml"));
        assert_eq!(sniff_image(b"hello"), None);
    }
}
