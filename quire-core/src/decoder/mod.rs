//! Input codecs: each one turns a file into a [`Book`]

mod azw4;
mod comic;
mod docx;
mod epub;
mod fb2;
mod html;
mod mobi;
mod pdb;
mod pdf;
mod tcr;
mod txt;

pub use azw4::Azw4Decoder;
pub use comic::ComicDecoder;
pub use docx::DocxDecoder;
pub use epub::{EpubDecoder, OebDecoder};
pub use fb2::Fb2Decoder;
pub use html::{HtmlDecoder, HtmlzDecoder};
pub use mobi::MobiDecoder;
pub use pdb::PdbDecoder;
pub(crate) use pdf::ORIGINAL_PDF;
pub use pdf::{PdfBackend, PdfDecoder, PdfExtractBackend};
pub use tcr::TcrDecoder;
pub use txt::TxtDecoder;

use std::io::{Read, Seek};
use std::path::Path;

use zip::ZipArchive;

use crate::container::Container;
use crate::dom::Document;
use crate::error::{ParseError, Result};
use crate::options::{OptionDef, OptionsMap, Recommendation};
use crate::pipeline::StageContext;
use crate::types::media::extension_for;
use crate::types::{Book, Metadata, TocNode};

/// Trait for decoding ebook formats into a [`Book`]
pub trait Decoder: Send + Sync {
    /// Stable codec name
    fn name(&self) -> &'static str;

    /// File extensions this decoder supports
    fn supported_extensions(&self) -> &[&'static str];

    /// MIME types this decoder supports
    fn supported_mime_types(&self) -> &[&'static str] {
        &[]
    }

    /// Whether the first bytes of the file identify it as this format
    fn sniff(&self, _path: &Path, _head: &[u8]) -> bool {
        false
    }

    /// Wins ties when several decoders accept the same file
    fn priority(&self) -> i32 {
        0
    }

    fn options(&self) -> Vec<OptionDef> {
        Vec::new()
    }

    fn recommendations(&self) -> Vec<Recommendation> {
        Vec::new()
    }

    /// Transforms that must run on books this decoder produced
    fn required_transforms(&self, _book: &Book, _options: &OptionsMap) -> Vec<&'static str> {
        Vec::new()
    }

    /// Decode `input` into a book rooted at [`StageContext::book_dir`]
    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book>;
}

/// Every built-in decoder
pub fn builtin() -> Vec<Box<dyn Decoder>> {
    vec![
        Box::new(EpubDecoder::new()),
        Box::new(OebDecoder::new()),
        Box::new(HtmlDecoder::new()),
        Box::new(HtmlzDecoder::new()),
        Box::new(TxtDecoder::new()),
        Box::new(Fb2Decoder::new()),
        Box::new(DocxDecoder::new()),
        Box::new(MobiDecoder::new()),
        Box::new(Azw4Decoder::new()),
        Box::new(PdbDecoder::new()),
        Box::new(PdfDecoder::new()),
        Box::new(ComicDecoder::new()),
        Box::new(TcrDecoder::new()),
    ]
}

/// Get the decoder registered for a file extension
pub fn decoder_for_extension(ext: &str) -> Option<Box<dyn Decoder>> {
    let ext = ext.to_ascii_lowercase();
    builtin()
        .into_iter()
        .filter(|d| d.supported_extensions().contains(&ext.as_str()))
        .max_by_key(|d| d.priority())
}

/// Get the decoder registered for a MIME type
pub fn decoder_for_mime_type(mime: &str) -> Option<Box<dyn Decoder>> {
    builtin()
        .into_iter()
        .find(|d| d.supported_mime_types().contains(&mime))
}

pub(crate) fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .is_some_and(|e| extensions.contains(&e.as_str()))
}

pub(crate) fn is_zip(head: &[u8]) -> bool {
    head.starts_with(b"PK\x03\x04")
}

/// Name of the first local file entry of a zip, read from its header
pub(crate) fn first_zip_entry(head: &[u8]) -> Option<&[u8]> {
    if !is_zip(head) || head.len() < 30 {
        return None;
    }
    let len = u16::from_le_bytes([head[26], head[27]]) as usize;
    head.get(30..30 + len)
}

pub(crate) fn read_zip_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut file = archive.by_name(name)?;
    let mut data = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut data)?;
    Ok(data)
}

pub(crate) fn corrupt(path: &Path, message: impl std::fmt::Display) -> crate::error::QuireError {
    ParseError::CorruptInput(format!("{}: {message}", path.display())).into()
}

/// Stem of the input file, used as a fallback title
pub(crate) fn file_title(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().replace(['_', '-'], " "))
        .unwrap_or_else(|| "Unknown".to_string())
}

/// Assembles a book from generated documents and resources
pub(crate) struct BookBuilder {
    container: Container,
    toc: TocNode,
    cover: Option<String>,
}

impl BookBuilder {
    pub fn new(ctx: &StageContext) -> Result<Self> {
        Ok(Self {
            container: Container::new(ctx.book_dir())?,
            toc: TocNode::root(),
            cover: None,
        })
    }

    /// Add a document at the end of the spine
    pub fn add_document(&mut self, name: &str, doc: &Document) -> Result<String> {
        let name = self.container.unique_name(name);
        let id = self
            .container
            .add_name(&name, doc.to_xml().as_bytes(), Some("application/xhtml+xml"), &[])?;
        self.container.opf_mut().spine.push(id, true);
        Ok(name)
    }

    /// Add a non-spine file under a free name, returning that name
    pub fn add_resource(&mut self, name: &str, data: &[u8], media_type: Option<&str>) -> Result<String> {
        let name = self.container.unique_name(name);
        self.container.add_name(&name, data, media_type, &[])?;
        Ok(name)
    }

    /// Add an image named `stem` plus the extension of its sniffed type
    pub fn add_image(&mut self, stem: &str, data: &[u8]) -> Result<Option<String>> {
        let Some(media) = crate::types::media::sniff_image(data) else {
            return Ok(None);
        };
        let name = format!("{stem}.{}", extension_for(media));
        self.add_resource(&name, data, Some(media)).map(Some)
    }

    pub fn set_cover(&mut self, name: &str) {
        self.cover = Some(name.to_string());
    }

    pub fn toc_mut(&mut self) -> &mut TocNode {
        &mut self.toc
    }

    pub fn container_mut(&mut self) -> &mut Container {
        &mut self.container
    }

    pub fn finish(mut self, meta: &Metadata) -> Result<Book> {
        if !self.toc.is_empty() {
            self.container.set_toc(self.toc);
        }
        let cover_id = self
            .cover
            .as_deref()
            .and_then(|name| self.container.manifest_id_for_name(name))
            .map(str::to_string);
        if let Some(id) = cover_id {
            crate::transform::mark_cover(self.container.opf_mut(), &id);
        }
        let mut book = Book::new(self.container);
        book.set_metadata(meta);
        Ok(book)
    }
}

/// Split text into paragraphs at blank lines, joining the lines of each
pub(crate) fn paragraphs(text: &str) -> Vec<String> {
    crate::patterns::PARAGRAPH_BREAK
        .split(text.trim())
        .map(|p| p.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect()
}

/// XHTML document holding `paragraphs` as `<p>` elements
pub(crate) fn text_document(title: &str, lang: Option<&str>, paragraphs: &[String]) -> Document {
    let (mut doc, body) = Document::xhtml_skeleton(title, lang);
    for p in paragraphs {
        doc.append_text_element(body, "p", p);
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let names: Vec<&str> = builtin().iter().map(|d| d.name()).collect();
        assert!(names.contains(&"epub"));
        assert!(names.contains(&"mobi"));
        assert_eq!(decoder_for_extension("AZW4").unwrap().name(), "azw4");
        assert_eq!(decoder_for_extension("md").unwrap().name(), "txt");
        assert_eq!(decoder_for_mime_type("application/epub+zip").unwrap().name(), "epub");
        assert!(decoder_for_extension("lrf").is_none());
    }

    #[test]
    fn test_first_zip_entry() {
        let mut head = b"PK\x03\x04".to_vec();
        head.extend_from_slice(&[0; 22]);
        head.extend_from_slice(&8u16.to_le_bytes());
        head.extend_from_slice(&[0, 0]);
        head.extend_from_slice(b"mimetypeapplication/epub+zip");
        assert_eq!(first_zip_entry(&head), Some(&b"mimetype"[..]));
        assert_eq!(first_zip_entry(b"hello"), None);
    }

    #[test]
    fn test_paragraphs() {
        let text = "One\nline\n\n  Two  \n\n\n";
        assert_eq!(paragraphs(text), vec!["One line", "Two"]);
    }
}
