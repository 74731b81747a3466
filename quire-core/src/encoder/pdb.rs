//! Palm database text output: PalmDoc and zTXT.

use std::path::Path;

use super::text::{join_blocks, TextRenderer, TextStyle};
use super::txt::encode_text;
use super::{book_title, Encoder};
use crate::error::Result;
use crate::options::{OptionDef, OptionsMap};
use crate::pdb::text::{write_palmdoc, write_ztxt};
use crate::pipeline::StageContext;
use crate::types::{Book, MetadataField};

pub struct PdbEncoder;

impl PdbEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdbEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for PdbEncoder {
    fn name(&self) -> &'static str {
        "pdb"
    }

    fn file_extension(&self) -> &'static str {
        "pdb"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["pdb"]
    }

    fn mime_type(&self) -> &'static str {
        "application/vnd.palm"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![
            OptionDef::choice(
                "pdb_format",
                &["palmdoc", "ztxt"],
                "palmdoc",
                "Database type to write",
            ),
            OptionDef::string("pdb_output_encoding", Some("cp1252"), "Character encoding of the text"),
            OptionDef::bool("pdb_compress", true, "Compress PalmDoc records"),
        ]
    }

    fn required_transforms(&self, _options: &OptionsMap) -> Vec<&'static str> {
        vec!["linearize_tables"]
    }

    fn metadata_fields(&self) -> &'static [MetadataField] {
        MetadataField::TITLE_AUTHOR
    }

    fn encode(&self, book: &mut Book, output: &Path, ctx: &StageContext) -> Result<()> {
        let blocks = TextRenderer::new(TextStyle::Plain).render_book(book)?;
        let text = join_blocks(&blocks, 0);
        let bytes = encode_text(&text, ctx.options.str("pdb_output_encoding").unwrap_or("cp1252"), ctx)?;
        let name = book_title(book);
        ctx.checkpoint()?;
        let db = match ctx.options.str("pdb_format") {
            Some("ztxt") => write_ztxt(&name, &bytes)?,
            _ => write_palmdoc(&name, &bytes, ctx.options.bool("pdb_compress")),
        };
        ctx.log.info(format!("{} database with {} records", db.kind.name(), db.records.len()));
        std::fs::write(output, db.to_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdb::text::{read_palmdoc, read_ztxt};
    use crate::pdb::{PdbFile, PdbKind};
    use crate::transform::test_support::{book, context, xhtml};

    fn encode(opts: &[(&str, &str)]) -> PdbFile {
        let mut book = book(&[("a.xhtml", &xhtml("<h1>Heading</h1><p>Body text.</p>"))]);
        let mut meta = book.metadata();
        meta.title = "A title much longer than thirty-one bytes".into();
        book.set_metadata(&meta);
        let encoder = PdbEncoder::new();
        let (ctx, tmp) = context(encoder.options(), opts);
        let out = tmp.path().join("out.pdb");
        encoder.encode(&mut book, &out, &ctx).unwrap();
        PdbFile::parse(&std::fs::read(out).unwrap()).unwrap()
    }

    #[test]
    fn test_palmdoc_output() {
        let db = encode(&[]);
        assert_eq!(db.kind, PdbKind::PalmDoc);
        assert_eq!(db.name, "A_title_much_longer_than_thirty");
        assert_eq!(read_palmdoc(&db).unwrap(), b"Heading\n\nBody text.\n");
    }

    #[test]
    fn test_ztxt_output() {
        let db = encode(&[("pdb_format", "ztxt")]);
        assert_eq!(db.kind, PdbKind::Ztxt);
        assert_eq!(read_ztxt(&db).unwrap(), b"Heading\n\nBody text.\n");
    }
}
