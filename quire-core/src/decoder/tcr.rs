//! TCR decoder: Psion phrase-compressed plain text.

use std::path::Path;

use super::txt::{add_chapters, heuristic_blocks, read_text};
use super::{file_title, paragraphs, BookBuilder, Decoder};
use crate::compression::tcr::{self, TCR_HEADER};
use crate::error::Result;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::{Book, Metadata};

pub struct TcrDecoder;

impl TcrDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcrDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for TcrDecoder {
    fn name(&self) -> &'static str {
        "tcr"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["tcr"]
    }

    fn sniff(&self, _path: &Path, head: &[u8]) -> bool {
        head.starts_with(TCR_HEADER)
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::string(
            "input_encoding",
            None,
            "Encoding of the decompressed text, detected when unset",
        )]
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let raw = tcr::decompress(&std::fs::read(input)?)?;
        let text = read_text(&raw, ctx.options.str("input_encoding"))?;
        let title = file_title(input);
        let mut builder = BookBuilder::new(ctx)?;
        add_chapters(&mut builder, &title, None, heuristic_blocks(paragraphs(&text)))?;
        builder.finish(&Metadata {
            title,
            ..Metadata::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::context;

    #[test]
    fn test_tcr_decode() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("old_notes.tcr");
        let text = "Some words, some words and more words.\n\nAgain some words.\n";
        std::fs::write(&input, tcr::compress(text.as_bytes())).unwrap();

        let decoder = TcrDecoder::new();
        let head = std::fs::read(&input).unwrap();
        assert!(decoder.sniff(&input, &head));
        let (ctx, _tmp) = context(decoder.options(), &[]);
        let book = decoder.decode(&input, &ctx).unwrap();
        assert_eq!(book.title(), "old notes");
        let html = book.container.read_text(&book.spine_names()[0]).unwrap();
        assert!(html.contains("<p>Again some words.</p>"));
    }

    #[test]
    fn test_missing_header() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("bad.tcr");
        std::fs::write(&input, b"plain").unwrap();
        let (ctx, _tmp) = context(Vec::new(), &[]);
        assert!(TcrDecoder::new().decode(&input, &ctx).is_err());
    }
}
