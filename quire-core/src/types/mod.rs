//! Core types of the canonical book representation

mod book;
mod manifest;
pub mod media;
mod metadata;
mod toc;

pub use book::{Book, IntegrityReport};
pub use manifest::{Guide, GuideReference, Manifest, ManifestItem, Spine, SpineItem};
pub use metadata::{
    canonicalize_language, parse_date, CoverData, Metadata, MetadataField, UserField,
};
pub use toc::TocNode;
