//! PDF decoder.
//!
//! PDF is a visual format, so structure is inferred: text comes from a
//! [`PdfBackend`], paragraphs from blank lines and headings from the same
//! heuristics the text decoder uses. The original file is kept in the book
//! so PDF output can pass it through unchanged.

use std::path::Path;
use std::sync::Arc;

use super::txt::{add_chapters, heuristic_blocks, TextBlock};
use super::{file_title, BookBuilder, Decoder};
use crate::error::{ParseError, Result};
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::{Book, Metadata};

/// Manifest name of a pass-through copy of the source PDF
pub(crate) const ORIGINAL_PDF: &str = "original.pdf";

/// Text extraction from PDF bytes
pub trait PdfBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Text of every page, pages separated by form feeds or blank lines
    fn extract_text(&self, data: &[u8]) -> Result<String>;
}

/// Backend built on the `pdf-extract` crate
pub struct PdfExtractBackend;

impl PdfBackend for PdfExtractBackend {
    fn name(&self) -> &'static str {
        "pdf-extract"
    }

    fn extract_text(&self, data: &[u8]) -> Result<String> {
        pdf_extract::extract_text_from_mem(data)
            .map_err(|e| ParseError::NotParseable(format!("failed to extract PDF text: {e}")).into())
    }
}

/// Decoder for PDF files
pub struct PdfDecoder {
    backend: Arc<dyn PdfBackend>,
}

impl PdfDecoder {
    pub fn new() -> Self {
        Self::with_backend(Arc::new(PdfExtractBackend))
    }

    pub fn with_backend(backend: Arc<dyn PdfBackend>) -> Self {
        Self { backend }
    }

    /// Build a book from PDF bytes. Without a `title` the first chapter
    /// heading is used, then `fallback`.
    pub(crate) fn decode_bytes(
        &self,
        data: &[u8],
        title: Option<&str>,
        fallback: &str,
        keep_original: bool,
        ctx: &StageContext,
    ) -> Result<Book> {
        let text = self.backend.extract_text(data)?;
        ctx.log.debug(format!("{} extracted {} characters", self.backend.name(), text.len()));
        let blocks = heuristic_blocks(pdf_paragraphs(&text));
        let title = title.map(str::to_string).unwrap_or_else(|| {
            first_heading(&blocks).unwrap_or_else(|| fallback.to_string())
        });

        let mut builder = BookBuilder::new(ctx)?;
        if blocks.is_empty() {
            ctx.log.warn("no text found; the PDF may consist of scanned images".to_string());
        }
        add_chapters(&mut builder, &title, None, blocks)?;
        if keep_original {
            builder.add_resource(ORIGINAL_PDF, data, Some("application/pdf"))?;
        }
        builder.finish(&Metadata {
            title,
            ..Metadata::default()
        })
    }
}

impl Default for PdfDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn first_heading(blocks: &[TextBlock]) -> Option<String> {
    blocks.iter().find_map(|b| match b {
        TextBlock::Heading(level, text) if *level <= 2 => Some(text.clone()),
        _ => None,
    })
}

/// Paragraphs of extracted text. Lines are joined with spaces, except that
/// a word hyphenated across a line break is put back together.
fn pdf_paragraphs(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let flush = |current: &mut String, out: &mut Vec<String>| {
        if !current.is_empty() {
            out.push(std::mem::take(current));
        }
    };
    for line in text.lines() {
        let line = line.trim_matches(|c: char| c.is_whitespace() || c == '\u{c}');
        if line.is_empty() {
            flush(&mut current, &mut out);
            continue;
        }
        let joins_word = current.ends_with('-')
            && current[..current.len() - 1].ends_with(char::is_alphabetic)
            && line.starts_with(char::is_lowercase);
        if joins_word {
            current.pop();
        } else if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(&line.split_whitespace().collect::<Vec<_>>().join(" "));
    }
    flush(&mut current, &mut out);
    out
}

impl Decoder for PdfDecoder {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["pdf"]
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &["application/pdf"]
    }

    fn sniff(&self, _path: &Path, head: &[u8]) -> bool {
        head.starts_with(b"%PDF-")
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::bool(
            "keep_original_pdf",
            true,
            "Keep the source PDF so PDF output can reuse it",
        )]
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let data = std::fs::read(input)?;
        if !data.starts_with(b"%PDF") {
            return Err(ParseError::CorruptInput(format!("{} is not a PDF file", input.display())).into());
        }
        let keep = ctx.options.bool("keep_original_pdf");
        self.decode_bytes(&data, None, &file_title(input), keep, ctx)
    }
}
