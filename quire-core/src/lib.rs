//! Quire Core Library
//!
//! This crate provides the book model and the conversion pipeline of the
//! Quire ebook converter. Every input format is decoded into a [`Book`]
//! backed by an on-disk [`Container`], run through a chain of transforms
//! and encoded to the target format.

pub mod compression;
pub mod container;
pub mod css;
pub mod decoder;
pub mod dom;
pub mod encoder;
pub mod error;
pub mod opf;
pub mod options;
pub(crate) mod patterns;
pub mod pdb;
pub mod pipeline;
pub mod transform;
pub mod types;

pub use container::Container;
pub use error::{ConversionError, Location, ParseError, QuireError, Result};
pub use options::{OptionDef, OptionValue, OptionsMap};
pub use pipeline::{CancelToken, ConversionReport, Log, Pipeline, PipelineContext, StageContext};
pub use types::{Book, Metadata, TocNode};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_book_creation() {
        let mut book = Book::empty().unwrap();
        book.set_metadata(&Metadata::new("Test Book", "en"));
        assert_eq!(book.title(), "Test Book");
        assert_eq!(book.metadata().language(), Some("en"));
    }
}
