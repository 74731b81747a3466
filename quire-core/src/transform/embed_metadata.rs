//! Metadata embedding: apply the user's overrides and keep only what the
//! output format can carry.

use std::path::Path;

use crate::error::{ConversionError, Result};
use crate::options::{OptionDef, OptionsMap};
use crate::pipeline::StageContext;
use crate::types::media::{extension_for, sniff_image};
use crate::types::{parse_date, Book, Metadata};

use super::detect_cover::mark_cover;
use super::Transform;

pub struct EmbedMetadata;

impl EmbedMetadata {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EmbedMetadata {
    fn default() -> Self {
        Self::new()
    }
}

fn invalid(name: &str, message: impl Into<String>) -> ConversionError {
    ConversionError::InvalidOption {
        name: name.to_string(),
        message: message.into(),
    }
}

fn number(opts: &OptionsMap, name: &str) -> Result<Option<f64>> {
    match opts.str(name) {
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| invalid(name, format!("'{raw}' is not a number")).into()),
        None => Ok(None),
    }
}

/// Apply the metadata options to `meta`
pub(crate) fn apply_overrides(meta: &mut Metadata, opts: &OptionsMap) -> Result<()> {
    let text = |name: &str| opts.str(name).map(|s| s.trim().to_string());
    if let Some(title) = text("title") {
        meta.title = title;
    }
    if let Some(authors) = text("authors") {
        meta.authors = authors
            .split('&')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(sort) = text("title_sort") {
        meta.title_sort = Some(sort);
    }
    if let Some(sort) = text("author_sort") {
        meta.author_sort = Some(sort);
    }
    if let Some(publisher) = text("publisher") {
        meta.publisher = Some(publisher);
    }
    if let Some(raw) = text("pubdate") {
        let date = parse_date(&raw).ok_or_else(|| invalid("pubdate", format!("'{raw}' is not a date")))?;
        meta.pubdate = Some(date);
    }
    if let Some(lang) = text("language") {
        meta.set_languages([lang]);
    }
    if !opts.list("tags").is_empty() {
        meta.tags = opts.list("tags").to_vec();
    }
    let index = number(opts, "series_index")?;
    match text("series") {
        Some(series) => meta.set_series(Some(series), index.or(meta.series_index)),
        None if index.is_some() && meta.series.is_some() => {
            let series = meta.series.clone();
            meta.set_series(series, index);
        }
        None => {}
    }
    if let Some(rating) = number(opts, "rating")? {
        meta.set_rating(Some(rating));
    }
    if let Some(comments) = text("comments") {
        meta.comments = Some(comments);
    }
    if let Some(isbn) = text("isbn") {
        meta.set_identifier("isbn", isbn);
    }
    Ok(())
}

impl EmbedMetadata {
    fn embed_cover(&self, book: &mut Book, path: &Path, ctx: &StageContext) -> Result<()> {
        let data = std::fs::read(path)?;
        let media_type = sniff_image(&data).ok_or_else(|| {
            invalid("cover", format!("{} is not a recognized image", path.display()))
        })?;
        let name = book
            .container
            .unique_name(&format!("cover.{}", extension_for(media_type)));
        let id = book.container.add_name(&name, &data, Some(media_type), &[])?;
        mark_cover(book.container.opf_mut(), &id);
        ctx.log.info(format!("embedded cover {name}"));
        Ok(())
    }
}

impl Transform for EmbedMetadata {
    fn name(&self) -> &'static str {
        "embed_metadata"
    }

    fn description(&self) -> &'static str {
        "Write the final metadata record into the book"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![
            OptionDef::string("title", None, "Set the title"),
            OptionDef::string("authors", None, "Set the authors, separated by &"),
            OptionDef::string("title_sort", None, "Title used for sorting"),
            OptionDef::string("author_sort", None, "Author used for sorting"),
            OptionDef::string("publisher", None, "Set the publisher"),
            OptionDef::string("pubdate", None, "Set the publication date"),
            OptionDef::string("language", None, "Set the language"),
            OptionDef::list("tags", "Set the tags, separated by commas"),
            OptionDef::string("series", None, "Set the series"),
            OptionDef::string("series_index", None, "Position in the series"),
            OptionDef::string("rating", None, "Rating from 0 to 10"),
            OptionDef::string("comments", None, "Set the description"),
            OptionDef::string("isbn", None, "Set the ISBN"),
            OptionDef::string("cover", None, "Path of an image to use as the cover"),
        ]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        let original = book.metadata();
        let mut meta = original.clone();
        apply_overrides(&mut meta, &ctx.options)?;
        meta.restrict_to(ctx.metadata_fields);
        if meta != original {
            ctx.log.debug("rewriting package metadata");
            book.set_metadata(&meta);
        }
        let cover_allowed = ctx
            .metadata_fields
            .contains(&crate::types::MetadataField::Cover);
        if let Some(path) = ctx.options.str("cover").filter(|_| cover_allowed) {
            self.embed_cover(book, Path::new(path), ctx)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};
    use crate::types::MetadataField;

    #[test]
    fn test_overrides() {
        let mut book = book(&[("a.xhtml", &xhtml("<p>x</p>"))]);
        book.set_metadata(&Metadata::new("Old", "en").with_author("A"));
        let (ctx, _dir) = context(
            EmbedMetadata.options(),
            &[
                ("title", "New"),
                ("authors", "Jane Doe & John Roe"),
                ("series", "Saga"),
                ("series_index", "2.5"),
                ("tags", "a, b"),
                ("isbn", "9780000000002"),
            ],
        );
        EmbedMetadata.run(&mut book, &ctx).unwrap();

        let meta = book.metadata();
        assert_eq!(meta.title, "New");
        assert_eq!(meta.authors, ["Jane Doe", "John Roe"]);
        assert_eq!(meta.series_index, Some(2.5));
        assert_eq!(meta.tags, ["a", "b"]);
        assert_eq!(meta.isbn(), Some("9780000000002"));
        assert_eq!(meta.language(), Some("en"));
    }

    #[test]
    fn test_restricted_to_output_fields() {
        let mut book = book(&[("a.xhtml", &xhtml("<p>x</p>"))]);
        book.set_metadata(&Metadata::new("T", "en").with_author("A").with_publisher("P"));
        let (mut ctx, _dir) = context(EmbedMetadata.options(), &[]);
        ctx.metadata_fields = MetadataField::TITLE_AUTHOR;
        EmbedMetadata.run(&mut book, &ctx).unwrap();
        let meta = book.metadata();
        assert_eq!(meta.title, "T");
        assert!(meta.publisher.is_none());
    }

    #[test]
    fn test_cover_file_and_bad_rating() {
        let mut book = book(&[("a.xhtml", &xhtml("<p>x</p>"))]);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.png");
        std::fs::write(&path, b"\x89PNG\r\n\x1a\n\0\0\0\0").unwrap();
        let (ctx, _tmp) = context(EmbedMetadata.options(), &[("cover", path.to_str().unwrap())]);
        EmbedMetadata.run(&mut book, &ctx).unwrap();
        assert_eq!(book.cover_name().as_deref(), Some("cover.png"));

        let (ctx, _tmp) = context(EmbedMetadata.options(), &[("rating", "lots")]);
        assert!(EmbedMetadata.run(&mut book, &ctx).unwrap_err().is_usage());
    }
}
