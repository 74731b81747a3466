//! TCR output: plain text with Psion phrase compression.

use std::path::Path;

use super::text::{join_blocks, TextRenderer, TextStyle};
use super::txt::encode_text;
use super::Encoder;
use crate::compression::tcr;
use crate::error::Result;
use crate::options::{OptionDef, OptionsMap};
use crate::pipeline::StageContext;
use crate::types::{Book, MetadataField};

pub struct TcrEncoder;

impl TcrEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TcrEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for TcrEncoder {
    fn name(&self) -> &'static str {
        "tcr"
    }

    fn file_extension(&self) -> &'static str {
        "tcr"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["tcr"]
    }

    fn mime_type(&self) -> &'static str {
        "application/x-tcr"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::string(
            "tcr_output_encoding",
            Some("utf-8"),
            "Character encoding of the text before compression",
        )]
    }

    fn required_transforms(&self, _options: &OptionsMap) -> Vec<&'static str> {
        vec!["linearize_tables"]
    }

    fn metadata_fields(&self) -> &'static [MetadataField] {
        &[MetadataField::Title]
    }

    fn encode(&self, book: &mut Book, output: &Path, ctx: &StageContext) -> Result<()> {
        let blocks = TextRenderer::new(TextStyle::Plain).render_book(book)?;
        let text = join_blocks(&blocks, 0);
        let bytes = encode_text(&text, ctx.options.str("tcr_output_encoding").unwrap_or("utf-8"), ctx)?;
        ctx.checkpoint()?;
        let compressed = tcr::compress(&bytes);
        ctx.log.debug(format!("tcr: {} bytes compressed to {}", bytes.len(), compressed.len()));
        std::fs::write(output, compressed)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};

    #[test]
    fn test_tcr_output() {
        let mut book = book(&[("a.xhtml", &xhtml("<p>The same words. The same words.</p>"))]);
        let encoder = TcrEncoder::new();
        let (ctx, tmp) = context(encoder.options(), &[]);
        let out = tmp.path().join("out.tcr");
        encoder.encode(&mut book, &out, &ctx).unwrap();
        let data = std::fs::read(out).unwrap();
        assert!(data.starts_with(tcr::TCR_HEADER));
        assert_eq!(tcr::decompress(&data).unwrap(), b"The same words. The same words.\n");
    }
}
