//! EPUB and OEBPS decoders.
//!
//! Both open the input as a [`Container`] directly; the package, manifest
//! and spine are used as they are. EPUB 2 packages are upgraded by the
//! `upgrade_opf` transform unless EPUB 2 output was asked for.

use std::path::Path;

use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use super::{first_zip_entry, has_extension, is_zip, Decoder};
use crate::container::Container;
use crate::dom::Document;
use crate::error::{ParseError, Result};
use crate::options::OptionsMap;
use crate::pipeline::StageContext;
use crate::types::Book;

const ENCRYPTION_XML: &str = "META-INF/encryption.xml";
const IDPF_OBFUSCATION: &str = "http://www.idpf.org/2008/embedding";
const ADOBE_OBFUSCATION: &str = "http://ns.adobe.com/pdf/enc#RC";

/// Decoder for EPUB 2/3 archives
pub struct EpubDecoder;

impl EpubDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EpubDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder for unpacked OEBPS trees and bare OPF files
pub struct OebDecoder;

impl OebDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OebDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn upgrade_needed(book: &Book, options: &OptionsMap) -> Vec<&'static str> {
    if book.container.opf().is_epub3() || options.str("epub_version") == Some("2") {
        Vec::new()
    } else {
        vec!["upgrade_opf"]
    }
}

/// Text of the package's unique identifier
fn unique_identifier(container: &Container) -> Option<String> {
    let opf = container.opf();
    let doc = &opf.metadata;
    doc.element_by_id(&opf.unique_identifier)
        .map(|n| doc.text_content(n))
}

/// First `urn:uuid:` identifier, as raw bytes
fn uuid_key(container: &Container) -> Option<[u8; 16]> {
    let opf = container.opf();
    let doc = &opf.metadata;
    doc.descendants(opf.metadata_element())
        .into_iter()
        .filter(|&n| doc.local_name(n) == Some("identifier"))
        .find_map(|n| {
            let text = doc.text_content(n);
            let raw = text.trim();
            let raw = raw
                .strip_prefix("urn:uuid:")
                .or_else(|| doc.attr(n, "opf:scheme").filter(|s| s.eq_ignore_ascii_case("uuid")).map(|_| raw))?;
            uuid::Uuid::parse_str(raw).ok().map(|u| *u.as_bytes())
        })
}

/// XOR the first `len` bytes of `data` with a repeating key
fn xor_prefix(data: &mut [u8], key: &[u8], len: usize) {
    for (i, byte) in data.iter_mut().take(len).enumerate() {
        *byte ^= key[i % key.len()];
    }
}

/// Undo IDPF and Adobe font obfuscation. Any other encryption is DRM.
fn deobfuscate_fonts(container: &mut Container) -> Result<()> {
    if !container.exists(ENCRYPTION_XML) {
        return Ok(());
    }
    let doc = Document::parse_xml(&container.read_text(ENCRYPTION_XML)?)?;
    let mut fonts = Vec::new();
    for data in doc.elements_by_name(doc.root(), "EncryptedData") {
        let algorithm = doc
            .find_first(data, "EncryptionMethod")
            .and_then(|m| doc.attr(m, "Algorithm"))
            .unwrap_or_default()
            .to_string();
        let Some(uri) = doc
            .find_first(data, "CipherReference")
            .and_then(|r| doc.attr(r, "URI"))
            .and_then(crate::container::paths::normalize_name)
        else {
            continue;
        };
        match algorithm.as_str() {
            IDPF_OBFUSCATION | ADOBE_OBFUSCATION => fonts.push((uri, algorithm)),
            other => {
                return Err(ParseError::InvalidEbook(format!(
                    "{uri} is encrypted with {other}; DRM-protected books cannot be converted"
                ))
                .into())
            }
        }
    }

    let idpf_key = unique_identifier(container).map(|uid| {
        let cleaned: String = uid.chars().filter(|c| !matches!(c, ' ' | '\t' | '\r' | '\n')).collect();
        Sha1::digest(cleaned.as_bytes()).to_vec()
    });
    let adobe_key = uuid_key(container);
    for (name, algorithm) in fonts {
        if !container.exists(&name) {
            warn!(font = %name, "obfuscated font is missing");
            continue;
        }
        let mut data = container.read(&name)?;
        match (algorithm.as_str(), &idpf_key, &adobe_key) {
            (IDPF_OBFUSCATION, Some(key), _) => xor_prefix(&mut data, key, 1040),
            (ADOBE_OBFUSCATION, _, Some(key)) => xor_prefix(&mut data, key, 1024),
            _ => {
                warn!(font = %name, "no key to de-obfuscate font");
                continue;
            }
        }
        debug!(font = %name, "de-obfuscated font");
        container.write(&name, &data)?;
    }
    container.remove_name(ENCRYPTION_XML)
}

fn open(input: &Path, ctx: &StageContext) -> Result<Book> {
    let mut container = Container::open_in(input, ctx.book_dir())?;
    deobfuscate_fonts(&mut container)?;
    let mut book = Book::new(container);
    if book.spine().len() == 0 {
        return Err(ParseError::InvalidEbook(format!("{} has an empty spine", input.display())).into());
    }
    ctx.log.debug(format!(
        "opened package {} version {}",
        book.container.opf_name(),
        book.container.opf().version
    ));
    let report = book.check_integrity();
    for warning in report.warnings {
        ctx.log.warn(warning);
    }
    Ok(book)
}

impl Decoder for EpubDecoder {
    fn name(&self) -> &'static str {
        "epub"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["epub", "kepub"]
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &["application/epub+zip"]
    }

    fn sniff(&self, path: &Path, head: &[u8]) -> bool {
        match first_zip_entry(head) {
            Some(b"mimetype") => head.windows(20).any(|w| w == b"application/epub+zip"),
            _ => is_zip(head) && has_extension(path, &["epub", "kepub"]),
        }
    }

    fn required_transforms(&self, book: &Book, options: &OptionsMap) -> Vec<&'static str> {
        upgrade_needed(book, options)
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        open(input, ctx)
    }
}

impl Decoder for OebDecoder {
    fn name(&self) -> &'static str {
        "oeb"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["opf", "oeb"]
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &["application/oebps-package+xml"]
    }

    fn sniff(&self, path: &Path, _head: &[u8]) -> bool {
        path.is_dir()
    }

    fn required_transforms(&self, book: &Book, options: &OptionsMap) -> Vec<&'static str> {
        upgrade_needed(book, options)
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        open(input, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const OPF: &str = r#"<?xml version="1.0"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    <dc:title>Hello</dc:title>
    <dc:identifier id="uid" opf:scheme="uuid">urn:uuid:12345678-1234-1234-1234-123456789abc</dc:identifier>
  </metadata>
  <manifest>
    <item id="c1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="f" href="font.otf" media-type="font/otf"/>
  </manifest>
  <spine><itemref idref="c1"/></spine>
</package>"#;

    fn oebps(dir: &Path) {
        fs::write(dir.join("content.opf"), OPF).unwrap();
        fs::write(
            dir.join("ch1.xhtml"),
            r#"<html xmlns="http://www.w3.org/1999/xhtml"><body><p>Hi</p></body></html>"#,
        )
        .unwrap();
    }

    #[test]
    fn test_open_directory_requires_upgrade() {
        let src = tempfile::tempdir().unwrap();
        oebps(src.path());
        fs::write(src.path().join("font.otf"), b"OTTO").unwrap();
        let (ctx, _tmp) = crate::transform::test_support::context(Vec::new(), &[]);
        let decoder = OebDecoder::new();
        assert!(decoder.sniff(src.path(), b""));
        let book = decoder.decode(src.path(), &ctx).unwrap();
        assert_eq!(book.spine_names(), vec!["ch1.xhtml"]);
        assert_eq!(book.title(), "Hello");
        assert_eq!(
            decoder.required_transforms(&book, &OptionsMap::default()),
            vec!["upgrade_opf"]
        );
    }

    #[test]
    fn test_idpf_font_deobfuscation() {
        let src = tempfile::tempdir().unwrap();
        oebps(src.path());
        let uid = "urn:uuid:12345678-1234-1234-1234-123456789abc";
        let key = Sha1::digest(uid.as_bytes());
        let mut font = vec![0u8; 2000];
        font[..4].copy_from_slice(b"OTTO");
        let original = font.clone();
        xor_prefix(&mut font, &key, 1040);
        fs::write(src.path().join("font.otf"), &font).unwrap();
        fs::create_dir(src.path().join("META-INF")).unwrap();
        fs::write(
            src.path().join(ENCRYPTION_XML),
            r#"<encryption xmlns="urn:oasis:names:tc:opendocument:xmlns:container" xmlns:enc="http://www.w3.org/2001/04/xmlenc#">
  <enc:EncryptedData>
    <enc:EncryptionMethod Algorithm="http://www.idpf.org/2008/embedding"/>
    <enc:CipherData><enc:CipherReference URI="font.otf"/></enc:CipherData>
  </enc:EncryptedData>
</encryption>"#,
        )
        .unwrap();
        let (ctx, _tmp) = crate::transform::test_support::context(Vec::new(), &[]);
        let book = OebDecoder::new().decode(src.path(), &ctx).unwrap();
        assert_eq!(book.container.read("font.otf").unwrap(), original);
        assert!(!book.container.exists(ENCRYPTION_XML));
    }

    #[test]
    fn test_drm_is_rejected() {
        let src = tempfile::tempdir().unwrap();
        oebps(src.path());
        fs::create_dir(src.path().join("META-INF")).unwrap();
        fs::write(
            src.path().join(ENCRYPTION_XML),
            r#"<encryption xmlns:enc="http://www.w3.org/2001/04/xmlenc#"><enc:EncryptedData>
  <enc:EncryptionMethod Algorithm="http://www.w3.org/2001/04/xmlenc#aes128-cbc"/>
  <enc:CipherData><enc:CipherReference URI="ch1.xhtml"/></enc:CipherData>
</enc:EncryptedData></encryption>"#,
        )
        .unwrap();
        let (ctx, _tmp) = crate::transform::test_support::context(Vec::new(), &[]);
        let err = OebDecoder::new().decode(src.path(), &ctx).unwrap_err();
        assert_eq!(err.code(), "E_INVALID_EBOOK");
    }
}
