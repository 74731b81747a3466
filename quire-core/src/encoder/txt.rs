//! Plain text and markdown output.

use std::path::Path;

use encoding_rs::Encoding;

use super::text::{join_blocks, TextRenderer, TextStyle};
use super::{book_title, output_failed, Encoder};
use crate::error::{ConversionError, Result};
use crate::options::{OptionDef, OptionsMap};
use crate::pipeline::StageContext;
use crate::types::{Book, MetadataField};

pub struct TxtEncoder;

impl TxtEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TxtEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Newline sequence for a `newline` option value
fn newline(style: &str) -> &'static str {
    match style {
        "windows" => "\r\n",
        "old_mac" => "\r",
        "unix" => "\n",
        _ if cfg!(windows) => "\r\n",
        _ => "\n",
    }
}

/// Encode `text` in the named encoding. Characters the encoding cannot
/// represent become numeric character references.
pub(crate) fn encode_text(text: &str, label: &str, ctx: &StageContext) -> Result<Vec<u8>> {
    let encoding = Encoding::for_label(label.trim().as_bytes()).ok_or_else(|| {
        ConversionError::InvalidOption {
            name: "txt_output_encoding".into(),
            message: format!("unknown encoding {label:?}"),
        }
    })?;
    if encoding == encoding_rs::UTF_16LE || encoding == encoding_rs::UTF_16BE {
        let le = encoding == encoding_rs::UTF_16LE;
        let mut out = if le { vec![0xFF, 0xFE] } else { vec![0xFE, 0xFF] };
        for unit in text.encode_utf16() {
            out.extend_from_slice(&if le { unit.to_le_bytes() } else { unit.to_be_bytes() });
        }
        return Ok(out);
    }
    let (bytes, used, had_errors) = encoding.encode(text);
    if had_errors {
        ctx.log.warn(format!(
            "some characters cannot be represented in {}",
            used.name()
        ));
    }
    Ok(bytes.into_owned())
}

impl Encoder for TxtEncoder {
    fn name(&self) -> &'static str {
        "txt"
    }

    fn file_extension(&self) -> &'static str {
        "txt"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["txt", "text", "md", "markdown"]
    }

    fn mime_type(&self) -> &'static str {
        "text/plain"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![
            OptionDef::choice(
                "txt_output_formatting",
                &["plain", "markdown"],
                "plain",
                "Formatting of the text output",
            ),
            OptionDef::int(
                "max_line_length",
                0,
                "Wrap lines longer than this many characters, 0 disables wrapping",
            ),
            OptionDef::choice(
                "newline",
                &["system", "unix", "windows", "old_mac"],
                "system",
                "Line ending style",
            ),
            OptionDef::string("txt_output_encoding", Some("utf-8"), "Character encoding of the output"),
            OptionDef::bool("keep_links", false, "Keep external links when formatting as markdown"),
            OptionDef::bool(
                "keep_image_references",
                false,
                "Keep image references when formatting as markdown",
            ),
        ]
    }

    fn required_transforms(&self, _options: &OptionsMap) -> Vec<&'static str> {
        vec!["linearize_tables"]
    }

    fn metadata_fields(&self) -> &'static [MetadataField] {
        MetadataField::TITLE_AUTHOR
    }

    fn encode(&self, book: &mut Book, output: &Path, ctx: &StageContext) -> Result<()> {
        let opts = &ctx.options;
        let markdown = opts.str("txt_output_formatting") == Some("markdown");
        let mut renderer = TextRenderer::new(if markdown { TextStyle::Markdown } else { TextStyle::Plain });
        renderer.keep_links = opts.bool("keep_links");
        renderer.keep_images = opts.bool("keep_image_references");

        let blocks = renderer.render_book(book)?;
        if blocks.is_empty() {
            ctx.log.warn(format!("{} has no text content", book_title(book)));
        }
        let width = opts.int("max_line_length").unwrap_or(0).max(0) as usize;
        let text = join_blocks(&blocks, width);
        let eol = newline(opts.str("newline").unwrap_or("system"));
        let text = if eol == "\n" { text } else { text.replace('\n', eol) };
        let bytes = encode_text(&text, opts.str("txt_output_encoding").unwrap_or("utf-8"), ctx)?;
        std::fs::write(output, bytes).map_err(|e| output_failed(format!("{}: {e}", output.display())))?;
        ctx.log.info(format!("wrote {} text blocks", blocks.len()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};

    fn encode(opts: &[(&str, &str)]) -> Vec<u8> {
        let mut book = book(&[
            ("a.xhtml", &xhtml("<h1>One</h1><p>First paragraph of text.</p>")),
            ("b.xhtml", &xhtml("<p>Caf\u{e9} <em>two</em></p>")),
        ]);
        let encoder = TxtEncoder::new();
        let (ctx, tmp) = context(encoder.options(), opts);
        let out = tmp.path().join("out.txt");
        encoder.encode(&mut book, &out, &ctx).unwrap();
        std::fs::read(out).unwrap()
    }

    #[test]
    fn test_plain_unix() {
        let out = encode(&[("newline", "unix")]);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "One\n\nFirst paragraph of text.\n\nCaf\u{e9} two\n"
        );
    }

    #[test]
    fn test_markdown_wrapped_windows() {
        let out = encode(&[
            ("newline", "windows"),
            ("txt_output_formatting", "markdown"),
            ("max_line_length", "10"),
        ]);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "# One\r\n\r\nFirst\r\nparagraph\r\nof text.\r\n\r\nCaf\u{e9} *two*\r\n"
        );
    }

    #[test]
    fn test_output_encoding() {
        let out = encode(&[("newline", "unix"), ("txt_output_encoding", "latin1")]);
        assert!(out.windows(5).any(|w| w == b"Caf\xe9 "));
        let out = encode(&[("txt_output_encoding", "utf-16le")]);
        assert_eq!(&out[..2], &[0xFF, 0xFE]);
    }

    #[test]
    fn test_unknown_encoding() {
        let mut book = book(&[("a.xhtml", &xhtml("<p>x</p>"))]);
        let encoder = TxtEncoder::new();
        let (ctx, tmp) = context(encoder.options(), &[("txt_output_encoding", "klingon")]);
        let err = encoder.encode(&mut book, &tmp.path().join("o.txt"), &ctx).unwrap_err();
        assert_eq!(err.code(), "E_INVALID_OPTION");
    }
}
