//! EPUB and OEB directory output.
//!
//! Both write the container as it stands after the transform chain. The
//! only format work left here is choosing the package version and which
//! table of contents documents to keep.

use std::path::Path;

use super::{output_failed, Encoder};
use crate::error::Result;
use crate::options::{OptionDef, OptionsMap};
use crate::pipeline::StageContext;
use crate::types::Book;

/// Encoder for EPUB 2 and EPUB 3 archives
pub struct EpubEncoder;

impl EpubEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EpubEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Which navigation documents to write: `(ncx, nav)`
fn toc_documents(version: &str, policy: &str) -> (bool, bool) {
    if version == "2" {
        return (true, false);
    }
    match policy {
        "ncx" => (true, false),
        "nav" => (false, true),
        _ => (true, true),
    }
}

/// Set the package version and regenerate the TOC documents
fn prepare(book: &mut Book, ctx: &StageContext) -> Result<()> {
    let version = ctx.options.str("epub_version").unwrap_or("3");
    let policy = ctx.options.str("epub_toc").unwrap_or("both");
    let (ncx, nav) = toc_documents(version, policy);
    let package = book.container.opf_mut();
    if version == "2" && package.is_epub3() {
        ctx.log.warn("writing an EPUB 3 package as EPUB 2; EPUB 3 only metadata is kept as is");
    }
    package.version = if version == "2" { "2.0" } else { "3.0" }.to_string();
    book.container.write_toc_documents(ncx, nav)?;
    ctx.log.debug(format!("epub {version}, ncx: {ncx}, nav: {nav}"));
    Ok(())
}

fn epub_options() -> Vec<OptionDef> {
    vec![
        OptionDef::choice("epub_version", &["2", "3"], "3", "EPUB version of the output"),
        OptionDef::choice(
            "epub_toc",
            &["both", "ncx", "nav"],
            "both",
            "Table of contents documents to write for EPUB 3",
        ),
    ]
}

fn epub_transforms(options: &OptionsMap) -> Vec<&'static str> {
    if options.str("epub_version") == Some("2") {
        Vec::new()
    } else {
        vec!["upgrade_opf"]
    }
}

impl Encoder for EpubEncoder {
    fn name(&self) -> &'static str {
        "epub"
    }

    fn file_extension(&self) -> &'static str {
        "epub"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["epub"]
    }

    fn mime_type(&self) -> &'static str {
        "application/epub+zip"
    }

    fn options(&self) -> Vec<OptionDef> {
        epub_options()
    }

    fn required_transforms(&self, options: &OptionsMap) -> Vec<&'static str> {
        epub_transforms(options)
    }

    fn encode(&self, book: &mut Book, output: &Path, ctx: &StageContext) -> Result<()> {
        prepare(book, ctx)?;
        ctx.checkpoint()?;
        book.container
            .commit(output)
            .map_err(|e| output_failed(format!("{}: {e}", output.display())))
    }
}

/// Encoder for an unpacked OEBPS directory
pub struct OebEncoder;

impl OebEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OebEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for OebEncoder {
    fn name(&self) -> &'static str {
        "oeb"
    }

    fn file_extension(&self) -> &'static str {
        ""
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["oeb"]
    }

    fn mime_type(&self) -> &'static str {
        "application/oebps-package+xml"
    }

    fn options(&self) -> Vec<OptionDef> {
        epub_options()
    }

    fn required_transforms(&self, options: &OptionsMap) -> Vec<&'static str> {
        epub_transforms(options)
    }

    fn writes_directory(&self) -> bool {
        true
    }

    fn encode(&self, book: &mut Book, output: &Path, ctx: &StageContext) -> Result<()> {
        prepare(book, ctx)?;
        book.container.commit_to_dir(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::Container;
    use crate::transform::test_support::{book, context, xhtml};
    use crate::types::TocNode;

    fn sample() -> Book {
        let mut book = book(&[("ch1.xhtml", &xhtml("<h1>One</h1>")), ("ch2.xhtml", &xhtml("<h1>Two</h1>"))]);
        let mut toc = TocNode::root();
        toc.add_child(TocNode::new("One", "ch1.xhtml"));
        toc.add_child(TocNode::new("Two", "ch2.xhtml"));
        book.container.set_toc(toc);
        book
    }

    #[test]
    fn test_toc_documents() {
        assert_eq!(toc_documents("2", "nav"), (true, false));
        assert_eq!(toc_documents("3", "both"), (true, true));
        assert_eq!(toc_documents("3", "nav"), (false, true));
    }

    #[test]
    fn test_epub3_output() {
        let mut book = sample();
        book.container.opf_mut().version = "3.0".into();
        let encoder = EpubEncoder::new();
        let (ctx, tmp) = context(encoder.options(), &[]);
        let out = tmp.path().join("book.epub");
        encoder.encode(&mut book, &out, &ctx).unwrap();

        let mut reopened = Book::new(Container::open(&out).unwrap());
        assert!(reopened.container.opf().is_epub3());
        assert!(reopened.container.ncx_name().is_some());
        assert!(reopened.container.nav_name().is_some());
        assert_eq!(reopened.toc().count(), 2);
        assert_eq!(reopened.spine_names(), vec!["ch1.xhtml", "ch2.xhtml"]);
    }

    #[test]
    fn test_epub2_drops_nav() {
        let mut book = sample();
        let encoder = EpubEncoder::new();
        let (ctx, tmp) = context(encoder.options(), &[("epub_version", "2")]);
        assert!(encoder.required_transforms(&ctx.options).is_empty());
        let out = tmp.path().join("book.epub");
        encoder.encode(&mut book, &out, &ctx).unwrap();

        let reopened = Container::open(&out).unwrap();
        assert_eq!(reopened.opf().version, "2.0");
        assert!(reopened.ncx_name().is_some());
        assert!(reopened.nav_name().is_none());
    }

    #[test]
    fn test_oeb_directory() {
        let mut book = sample();
        let encoder = OebEncoder::new();
        let (ctx, tmp) = context(encoder.options(), &[("epub_toc", "ncx")]);
        let out = tmp.path().join("book_dir");
        encoder.encode(&mut book, &out, &ctx).unwrap();
        assert!(out.join("ch1.xhtml").is_file());
        let opf = std::fs::read_dir(&out)
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.path().extension().is_some_and(|x| x == "opf"));
        assert!(opf);
    }
}
