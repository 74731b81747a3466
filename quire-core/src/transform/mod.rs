//! Book-to-book transforms.
//!
//! Each transform is a value implementing [`Transform`]; the pipeline runs
//! them in [`CANONICAL_ORDER`]. Transforms work on the container's parsed
//! trees and only dirty the documents they actually change.

mod clean_html;
mod data_urls;
mod detect_cover;
mod detect_structure;
mod embed_metadata;
mod flatten_css;
mod generate_toc;
mod jacket;
mod linearize_tables;
mod normalize_guide;
mod normalize_images;
mod remove_fake_margins;
mod upgrade_opf;

pub use clean_html::CleanHtml;
pub use data_urls::DataUrls;
pub use detect_cover::DetectCover;
pub(crate) use detect_cover::mark_cover;
pub use detect_structure::DetectStructure;
pub use embed_metadata::EmbedMetadata;
pub use flatten_css::FlattenCss;
pub use generate_toc::GenerateToc;
pub use jacket::Jacket;
pub use linearize_tables::LinearizeTables;
pub use normalize_guide::NormalizeGuide;
pub use normalize_images::NormalizeImages;
pub use remove_fake_margins::RemoveFakeMargins;
pub use upgrade_opf::UpgradeOpf;

use crate::container::Parsed;
use crate::css::{parse_declarations, serialize_declarations, Declaration};
use crate::dom::{Document, NodeId};
use crate::error::Result;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::media::is_html;
use crate::types::Book;

/// Order in which transforms run when selected
pub const CANONICAL_ORDER: &[&str] = &[
    "normalize_guide",
    "upgrade_opf",
    "clean_html",
    "data_urls",
    "detect_cover",
    "detect_structure",
    "generate_toc",
    "jacket",
    "flatten_css",
    "remove_fake_margins",
    "linearize_tables",
    "normalize_images",
    "embed_metadata",
];

/// A named, order-sensitive rewrite of a [`Book`]
pub trait Transform: Send + Sync {
    /// Stable name used in options and logs
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Options this transform reads
    fn options(&self) -> Vec<OptionDef> {
        Vec::new()
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()>;
}

/// Every built-in transform, in canonical order
pub fn builtin() -> Vec<Box<dyn Transform>> {
    vec![
        Box::new(NormalizeGuide::new()),
        Box::new(UpgradeOpf::new()),
        Box::new(CleanHtml::new()),
        Box::new(DataUrls::new()),
        Box::new(DetectCover::new()),
        Box::new(DetectStructure::new()),
        Box::new(GenerateToc::new()),
        Box::new(Jacket::new()),
        Box::new(FlattenCss::new()),
        Box::new(RemoveFakeMargins::new()),
        Box::new(LinearizeTables::new()),
        Box::new(NormalizeImages::new()),
        Box::new(EmbedMetadata::new()),
    ]
}

/// Look a built-in transform up by name
pub fn by_name(name: &str) -> Option<Box<dyn Transform>> {
    builtin().into_iter().find(|t| t.name() == name)
}

/// Call `edit` on a copy of every HTML spine document, in spine order, and
/// store the copies `edit` reports as changed. Documents that fail to parse
/// are logged and skipped. Cancellation is polled between documents.
pub(crate) fn edit_spine(
    book: &mut Book,
    ctx: &StageContext,
    edit: impl FnMut(&str, &mut Document) -> Result<bool>,
) -> Result<()> {
    let names = book.spine_names();
    edit_documents(book, ctx, &names, edit)
}

/// [`edit_spine`] over an explicit list of names
pub(crate) fn edit_documents(
    book: &mut Book,
    ctx: &StageContext,
    names: &[String],
    mut edit: impl FnMut(&str, &mut Document) -> Result<bool>,
) -> Result<()> {
    for name in names {
        ctx.checkpoint()?;
        if !is_html(&book.container.media_type(name)) {
            continue;
        }
        let mut doc = match book.container.html(name) {
            Ok(doc) => doc.clone(),
            Err(e) => {
                ctx.log.warn(format!("{name}: {e}"));
                continue;
            }
        };
        if edit(name, &mut doc)? {
            book.container.set_parsed(name, Parsed::Html(doc))?;
        }
    }
    Ok(())
}

/// Set one property in an element's inline `style`, keeping the others
pub(crate) fn set_style(doc: &mut Document, node: NodeId, name: &str, value: &str) {
    let mut decls = doc.attr(node, "style").map(parse_declarations).unwrap_or_default();
    match decls.iter_mut().find(|d| d.name == name) {
        Some(decl) => decl.value = value.to_string(),
        None => decls.push(Declaration::new(name, value)),
    }
    doc.set_attr(node, "style", serialize_declarations(&decls));
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::options::{OptionsMap, Recommendation};

    /// A context whose options are the defaults of `defs` plus `user`
    pub fn context(defs: Vec<OptionDef>, user: &[(&str, &str)]) -> (StageContext, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let user: Vec<(String, String)> = user
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let recs: Vec<Recommendation> = Vec::new();
        let options = OptionsMap::resolve(&defs, &recs, &user).unwrap();
        (StageContext::new(options, dir.path()), dir)
    }

    /// A book whose spine holds the given `(name, xhtml)` documents
    pub fn book(docs: &[(&str, &str)]) -> Book {
        let mut book = Book::empty().unwrap();
        for (name, html) in docs {
            let id = book
                .container
                .add_name(name, html.as_bytes(), None, &[])
                .unwrap();
            book.container.opf_mut().spine.push(id, true);
        }
        book
    }

    pub fn xhtml(body: &str) -> String {
        format!(
            "<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>T</title></head><body>{body}</body></html>"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_matches_canonical_order() {
        let names: Vec<&str> = builtin().iter().map(|t| t.name()).collect();
        assert_eq!(names, CANONICAL_ORDER);
        assert!(by_name("flatten_css").is_some());
        assert!(by_name("nope").is_none());
    }
}
