//! Extraction of `data:` URL images into manifest resources.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};

use crate::container::paths::{dir_of, href_for_name};
use crate::dom::{Document, NodeId};
use crate::error::Result;
use crate::patterns::DATA_URL;
use crate::pipeline::StageContext;
use crate::types::media::{extension_for, sniff_image};
use crate::types::Book;

use super::Transform;

pub struct DataUrls;

impl DataUrls {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DataUrls {
    fn default() -> Self {
        Self::new()
    }
}

/// Payload of a `data:` URL
pub(crate) fn decode_data_url(url: &str) -> Option<Vec<u8>> {
    let caps = DATA_URL.captures(url.trim())?;
    let params = caps.get(2).map_or("", |m| m.as_str());
    let payload = caps.get(3).map_or("", |m| m.as_str());
    if params.split(';').any(|p| p.trim().eq_ignore_ascii_case("base64")) {
        let compact: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        let compact = percent_decode_str(&compact).decode_utf8_lossy().into_owned();
        STANDARD.decode(compact.trim_end_matches('=').to_string() + padding(&compact)).ok()
    } else {
        Some(percent_decode_str(payload).collect())
    }
}

fn padding(b64: &str) -> &'static str {
    match b64.trim_end_matches('=').len() % 4 {
        2 => "==",
        3 => "=",
        _ => "",
    }
}

/// Image elements and the attribute holding their source
fn image_sources(doc: &Document) -> Vec<(NodeId, String)> {
    let mut out = Vec::new();
    for node in doc.descendants(doc.root()) {
        let Some(el) = doc.element(node) else {
            continue;
        };
        let attr = match el.local_name() {
            "img" | "input" => "src",
            "image" if el.attr("xlink:href").is_some() => "xlink:href",
            "image" => "href",
            _ => continue,
        };
        if el
            .attr(attr)
            .is_some_and(|v| v.trim_start().get(..5).is_some_and(|p| p.eq_ignore_ascii_case("data:")))
        {
            out.push((node, attr.to_string()));
        }
    }
    out
}

impl Transform for DataUrls {
    fn name(&self) -> &'static str {
        "data_urls"
    }

    fn description(&self) -> &'static str {
        "Turn data: URL images into manifest resources"
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        // digest -> container name, so repeated payloads share one file
        let mut extracted: HashMap<String, String> = HashMap::new();
        // spine order first so shared payloads are named after the earliest use
        let mut names = book.spine_names();
        for item in book.manifest().iter().filter(|i| i.is_html()) {
            if !names.contains(&item.href) {
                names.push(item.href.clone());
            }
        }
        for name in names {
            ctx.checkpoint()?;
            let mut doc = match book.container.html(&name) {
                Ok(doc) if !image_sources(doc).is_empty() => doc.clone(),
                Ok(_) => continue,
                Err(e) => {
                    ctx.log.warn(format!("{name}: {e}"));
                    continue;
                }
            };
            let mut changed = false;
            for (node, attr) in image_sources(&doc) {
                let url = doc.attr(node, &attr).unwrap_or_default().to_string();
                let Some(data) = decode_data_url(&url) else {
                    ctx.log.warn(format!("{name}: undecodable data URL"));
                    continue;
                };
                let Some(media_type) = sniff_image(&data) else {
                    ctx.log.warn(format!("{name}: data URL is not a known image format"));
                    continue;
                };
                let digest = hex::encode(Sha256::digest(&data));
                let target = match extracted.get(&digest) {
                    Some(target) => target.clone(),
                    None => {
                        let wanted = format!(
                            "{}data-url-image.{}",
                            dir_of(&name),
                            extension_for(media_type)
                        );
                        let target = book.container.unique_name(&wanted);
                        book.container.add_name(&target, &data, Some(media_type), &[])?;
                        ctx.log.debug(format!("extracted {target} from {name}"));
                        extracted.insert(digest, target.clone());
                        target
                    }
                };
                doc.set_attr(node, &attr, href_for_name(&target, &name));
                changed = true;
            }
            if changed {
                book.container
                    .set_parsed(&name, crate::container::Parsed::Html(doc))?;
            }
        }
        if !extracted.is_empty() {
            ctx.log.info(format!("extracted {} data URL images", extracted.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};

    fn png_data_url() -> String {
        let img = image::RgbImage::new(16, 16);
        let mut bytes = std::io::Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut bytes, image::ImageFormat::Png)
            .unwrap();
        format!("data:image/png;base64,{}", STANDARD.encode(bytes.into_inner()))
    }

    #[test]
    fn test_extracts_and_rewrites() {
        let url = png_data_url();
        let body = format!(r#"<p><img src="{url}"/><img src="{url}"/><img src="data:image/png;base64,AAAA"/></p>"#);
        let mut book = book(&[("text/a.xhtml", &xhtml(&body))]);
        let (ctx, _dir) = context(vec![], &[]);
        DataUrls.run(&mut book, &ctx).unwrap();

        let item = book.manifest().by_href("text/data-url-image.png").unwrap();
        assert_eq!(item.media_type, "image/png");
        let pngs = book.manifest().iter().filter(|i| i.media_type == "image/png").count();
        assert_eq!(pngs, 1);
        let html = book.container.read_text("text/a.xhtml").unwrap();
        assert_eq!(html.matches(r#"src="data-url-image.png""#).count(), 2);
        assert!(html.contains("data:image/png;base64,AAAA"));

        let before = book.manifest().len();
        DataUrls.run(&mut book, &ctx).unwrap();
        assert_eq!(book.manifest().len(), before);
    }

    #[test]
    fn test_decode_plain_and_base64() {
        assert_eq!(decode_data_url("data:,a%20b").unwrap(), b"a b");
        assert_eq!(decode_data_url("data:text/plain;base64,aGk").unwrap(), b"hi");
        assert!(decode_data_url("http://x").is_none());
    }

    #[test]
    fn test_extracts_from_documents_outside_the_spine() {
        let url = png_data_url();
        let mut book = book(&[("a.xhtml", &xhtml("<p>text</p>"))]);
        let notes = xhtml(&format!(r#"<p><img src="{url}"/></p>"#));
        book.container.add_name("notes.xhtml", notes.as_bytes(), None, &[]).unwrap();
        let (ctx, _dir) = context(vec![], &[]);
        DataUrls.run(&mut book, &ctx).unwrap();

        assert!(book.manifest().by_href("data-url-image.png").is_some());
        let html = book.container.read_text("notes.xhtml").unwrap();
        assert!(html.contains(r#"src="data-url-image.png""#), "{html}");
        assert!(!html.contains("data:image"));
    }
}
