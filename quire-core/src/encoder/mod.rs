//! Output codecs: writers from the container model to a target file or
//! directory.

mod epub;
mod fb2;
mod htmlz;
mod merge;
mod mobi;
mod pdb;
mod pdf;
mod tcr;
pub(crate) mod text;
mod txt;

pub use epub::{EpubEncoder, OebEncoder};
pub use fb2::Fb2Encoder;
pub use htmlz::HtmlzEncoder;
pub use mobi::MobiEncoder;
pub use pdb::PdbEncoder;
pub use pdf::{ExternalRenderer, PageSetup, PdfEncoder, PdfRenderer};
pub use tcr::TcrEncoder;
pub use txt::TxtEncoder;

use std::path::Path;

use crate::error::{ConversionError, Result};
use crate::options::{OptionDef, OptionsMap, Recommendation};
use crate::pipeline::StageContext;
use crate::types::{Book, MetadataField};

/// A writer for one output format
pub trait Encoder: Send + Sync {
    /// Registry name, e.g. "epub"
    fn name(&self) -> &'static str;

    /// Extension of files this encoder writes
    fn file_extension(&self) -> &'static str;

    /// Output path extensions that select this encoder
    fn supported_extensions(&self) -> &[&'static str];

    fn mime_type(&self) -> &'static str;

    fn options(&self) -> Vec<OptionDef> {
        Vec::new()
    }

    fn recommendations(&self) -> Vec<Recommendation> {
        Vec::new()
    }

    /// Transforms this format needs whatever the user asked for
    fn required_transforms(&self, _options: &OptionsMap) -> Vec<&'static str> {
        Vec::new()
    }

    /// Metadata fields the format can carry
    fn metadata_fields(&self) -> &'static [MetadataField] {
        MetadataField::ALL
    }

    /// Whether `encode` writes a directory instead of a file
    fn writes_directory(&self) -> bool {
        false
    }

    /// Write `book` to `output`
    fn encode(&self, book: &mut Book, output: &Path, ctx: &StageContext) -> Result<()>;
}

/// All built-in encoders
pub fn builtin() -> Vec<Box<dyn Encoder>> {
    vec![
        Box::new(EpubEncoder::new()),
        Box::new(OebEncoder::new()),
        Box::new(HtmlzEncoder::new()),
        Box::new(TxtEncoder::new()),
        Box::new(PdbEncoder::new()),
        Box::new(TcrEncoder::new()),
        Box::new(Fb2Encoder::new()),
        Box::new(MobiEncoder::new()),
        Box::new(PdfEncoder::new()),
    ]
}

/// Get an encoder by output extension
pub fn encoder_for_extension(ext: &str) -> Option<Box<dyn Encoder>> {
    let ext = ext.to_ascii_lowercase();
    builtin()
        .into_iter()
        .find(|e| e.supported_extensions().contains(&ext.as_str()))
}

/// Failure while writing the output
pub(crate) fn output_failed(message: impl std::fmt::Display) -> crate::error::QuireError {
    ConversionError::OutputFailed(message.to_string()).into()
}

/// Book title, falling back to "Unknown"
pub(crate) fn book_title(book: &Book) -> String {
    let title = book.title();
    if title.trim().is_empty() {
        "Unknown".to_string()
    } else {
        title
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        let names: Vec<&str> = builtin().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["epub", "oeb", "htmlz", "txt", "pdb", "tcr", "fb2", "mobi", "pdf"]);
        assert_eq!(encoder_for_extension("EPUB").unwrap().name(), "epub");
        assert_eq!(encoder_for_extension("md").unwrap().name(), "txt");
        assert!(encoder_for_extension("lrf").is_none());
        assert!(builtin().iter().filter(|e| e.writes_directory()).all(|e| e.name() == "oeb"));
    }
}
