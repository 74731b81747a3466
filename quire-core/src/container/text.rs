//! Decoding entry bytes to text.

use encoding_rs::{Encoding, UTF_8, WINDOWS_1252};

use crate::patterns::{META_CHARSET, XML_ENCODING};

/// Decode text: a byte order mark wins, then valid UTF-8, then an encoding
/// declared in an XML declaration or `<meta charset>`, else Windows-1252.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Some((encoding, bom_len)) = Encoding::for_bom(bytes) {
        let (text, _) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
        return text.into_owned();
    }
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.to_string();
    }
    let encoding = declared_encoding(bytes).unwrap_or(WINDOWS_1252);
    let (text, _, _) = encoding.decode(bytes);
    text.into_owned()
}

/// Encoding declared inside the first kilobyte of a document
pub fn declared_encoding(bytes: &[u8]) -> Option<&'static Encoding> {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(1024)]);
    let label = XML_ENCODING
        .captures(&head)
        .or_else(|| META_CHARSET.captures(&head))?
        .get(1)?
        .as_str()
        .to_string();
    let encoding = Encoding::for_label(label.as_bytes())?;
    // a UTF-8 label on bytes that failed UTF-8 validation is wrong
    (encoding != UTF_8).then_some(encoding)
}

/// Drop the XML declaration so the text can be re-parsed as UTF-8
pub fn strip_xml_declaration(text: &str) -> &str {
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    if trimmed.starts_with("<?xml") {
        if let Some(end) = trimmed.find("?>") {
            return &trimmed[end + 2..];
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_utf8_and_bom() {
        assert_eq!(decode_text("héllo".as_bytes()), "héllo");
        let mut bom = vec![0xEF, 0xBB, 0xBF];
        bom.extend_from_slice(b"x");
        assert_eq!(decode_text(&bom), "x");
        let utf16 = [0xFF, 0xFE, b'a', 0];
        assert_eq!(decode_text(&utf16), "a");
    }

    #[test]
    fn test_decode_declared_and_fallback() {
        let latin = b"<?xml version='1.0' encoding='iso-8859-1'?><p>caf\xe9</p>";
        assert!(decode_text(latin).ends_with("<p>café</p>"));
        assert_eq!(decode_text(b"\x93quoted\x94"), "\u{201c}quoted\u{201d}");
    }

    #[test]
    fn test_strip_xml_declaration() {
        assert_eq!(strip_xml_declaration("<?xml version='1.0'?>\n<a/>"), "\n<a/>");
        assert_eq!(strip_xml_declaration("<a/>"), "<a/>");
    }
}
