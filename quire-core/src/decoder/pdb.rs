//! Palm database decoder for PalmDoc and zTXT text books.
//!
//! The 8-byte type/creator identifier picks the reader. MOBI databases are
//! handed to the MOBI decoder; the other Palm formats are reported as
//! unsupported.

use std::path::Path;

use super::mobi::MobiDecoder;
use super::txt::{add_chapters, heuristic_blocks, read_text};
use super::{paragraphs, BookBuilder, Decoder};
use crate::error::{ParseError, Result};
use crate::options::OptionDef;
use crate::pdb::text::{read_palmdoc, read_ztxt};
use crate::pdb::{self, PdbFile, PdbKind};
use crate::pipeline::StageContext;
use crate::types::{Book, Metadata};

/// Decoder for PalmDoc and zTXT databases
pub struct PdbDecoder;

impl PdbDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for PdbDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PdbDecoder {
    fn name(&self) -> &'static str {
        "pdb"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["pdb", "prc"]
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &["application/vnd.palm"]
    }

    fn sniff(&self, _path: &Path, head: &[u8]) -> bool {
        matches!(pdb::sniff(head), Some(PdbKind::PalmDoc | PdbKind::Ztxt))
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::string(
            "input_encoding",
            None,
            "Encoding of the database text, detected when unset",
        )]
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let data = std::fs::read(input)?;
        let db = PdbFile::parse(&data)?;
        ctx.log.debug(format!("{} database with {} records", db.kind.name(), db.records.len()));
        let raw = match &db.kind {
            PdbKind::PalmDoc => read_palmdoc(&db)?,
            PdbKind::Ztxt => read_ztxt(&db)?,
            PdbKind::Mobi => return MobiDecoder::new().decode(input, ctx),
            other => {
                return Err(ParseError::UnsupportedFormat(format!(
                    "{} databases are not supported",
                    other.name()
                ))
                .into())
            }
        };
        ctx.checkpoint()?;
        let text = read_text(&raw, ctx.options.str("input_encoding"))?;
        let title = match db.name.trim() {
            "" => super::file_title(input),
            name => name.to_string(),
        };

        let mut builder = BookBuilder::new(ctx)?;
        add_chapters(&mut builder, &title, None, heuristic_blocks(paragraphs(&text)))?;
        builder.finish(&Metadata {
            title,
            ..Metadata::default()
        })
    }
}
