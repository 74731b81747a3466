//! HTML and HTMLZ decoders.
//!
//! An HTML file is the index of a book: every local file it reaches, up to
//! `max_levels` hops, is pulled in and the reached HTML files make up the
//! spine in link-traversal order.

use std::fs;
use std::path::{Path, PathBuf};

use super::{file_title, has_extension, is_zip, Decoder};
use crate::container::text::decode_text;
use crate::container::{extract_zip, Container};
use crate::dom::Document;
use crate::error::{ParseError, Result};
use crate::opf::metadata::read_metadata;
use crate::opf::Package;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::transform::mark_cover;
use crate::types::media::{guess_media_type, is_html};
use crate::types::{Book, Metadata};

/// Decoder for a single HTML file and what it links to
pub struct HtmlDecoder;

impl HtmlDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HtmlDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoder for calibre-style zipped HTML
pub struct HtmlzDecoder;

impl HtmlzDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HtmlzDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn max_levels_option() -> OptionDef {
    OptionDef::int("max_levels", 5, "How many link hops to follow from the index file")
}

fn max_levels(ctx: &StageContext) -> usize {
    ctx.options.int("max_levels").unwrap_or(5).max(0) as usize
}

/// Metadata found in the `<head>` of an HTML document
pub(crate) fn html_metadata(doc: &Document, fallback_title: &str) -> Metadata {
    let mut meta = Metadata::default();
    meta.title = doc
        .head()
        .and_then(|h| doc.find_first(h, "title"))
        .map(|t| doc.normalized_text(t))
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| fallback_title.to_string());
    if let Some(lang) = doc.document_element().and_then(|h| doc.attr(h, "lang").or_else(|| doc.attr(h, "xml:lang"))) {
        meta.set_languages([lang.to_string()]);
    }
    let Some(head) = doc.head() else {
        return meta;
    };
    for m in doc.elements_by_name(head, "meta") {
        let (Some(name), Some(content)) = (doc.attr(m, "name"), doc.attr(m, "content")) else {
            continue;
        };
        let content = content.trim();
        if content.is_empty() {
            continue;
        }
        match name.to_ascii_lowercase().as_str() {
            "author" | "dc.creator" => meta.authors.extend(
                content
                    .split(['&', ';'])
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string),
            ),
            "description" | "dc.description" => meta.comments = Some(content.to_string()),
            "keywords" | "dc.subject" => meta.tags.extend(
                content
                    .split(',')
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            ),
            "dc.publisher" => meta.publisher = Some(content.to_string()),
            "dc.language" if meta.languages.is_empty() => meta.set_languages([content.to_string()]),
            _ => {}
        }
    }
    meta
}

fn spidered_book(index: &Path, ctx: &StageContext) -> Result<(Book, Metadata)> {
    let container = Container::from_html(index, ctx.book_dir(), max_levels(ctx))?;
    let mut book = Book::new(container);
    let Some(first) = book.spine_names().into_iter().next() else {
        return Err(ParseError::InvalidEbook(format!("{} has no HTML content", index.display())).into());
    };
    let meta = html_metadata(book.container.html(&first)?, &file_title(index));
    ctx.log.info(format!(
        "collected {} files, {} in the spine",
        book.container.names().count(),
        book.spine().len()
    ));
    Ok((book, meta))
}

impl Decoder for HtmlDecoder {
    fn name(&self) -> &'static str {
        "html"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["html", "htm", "xhtml", "xhtm", "shtml"]
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &["text/html", "application/xhtml+xml"]
    }

    fn sniff(&self, _path: &Path, head: &[u8]) -> bool {
        let text = String::from_utf8_lossy(&head[..head.len().min(1024)]).to_ascii_lowercase();
        let text = text.trim_start_matches('\u{feff}').trim_start();
        text.starts_with("<!doctype html")
            || text.starts_with("<html")
            || (text.starts_with("<?xml") && text.contains("<html"))
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![max_levels_option()]
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let (mut book, meta) = spidered_book(input, ctx)?;
        book.set_metadata(&meta);
        Ok(book)
    }
}

/// The index of an unpacked HTMLZ: `index.*`, then `toc.*`, then the
/// largest HTML file
fn find_index(dir: &Path) -> Option<PathBuf> {
    let mut html: Vec<(PathBuf, u64)> = Vec::new();
    for entry in fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
        if path.is_file() && is_html(guess_media_type(&name)) {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            html.push((path, size));
        }
    }
    html.sort();
    let stem_is = |path: &Path, stem: &str| {
        path.file_stem()
            .is_some_and(|s| s.to_string_lossy().eq_ignore_ascii_case(stem))
    };
    for stem in ["index", "toc"] {
        if let Some((path, _)) = html.iter().find(|(p, _)| stem_is(p, stem)) {
            return Some(path.clone());
        }
    }
    html.into_iter().max_by_key(|(_, size)| *size).map(|(p, _)| p)
}

impl Decoder for HtmlzDecoder {
    fn name(&self) -> &'static str {
        "htmlz"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["htmlz"]
    }

    fn sniff(&self, path: &Path, head: &[u8]) -> bool {
        is_zip(head) && has_extension(path, &["htmlz"])
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![max_levels_option()]
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let unpacked = ctx.temp_dir.join("htmlz");
        extract_zip(input, &unpacked)?;
        let index = find_index(&unpacked)
            .ok_or_else(|| ParseError::InvalidEbook(format!("{} holds no HTML file", input.display())))?;
        ctx.log.debug(format!("htmlz index is {}", index.display()));
        let (mut book, mut meta) = spidered_book(&index, ctx)?;

        let opf_path = unpacked.join("metadata.opf");
        if opf_path.is_file() {
            match Package::parse_str(&decode_text(&fs::read(&opf_path)?), "metadata.opf") {
                Ok(pkg) => {
                    let cover = pkg.guide.get("cover").map(|r| r.href.clone());
                    meta = read_metadata(&pkg);
                    if let Some(cover) = cover.filter(|c| unpacked.join(c).is_file()) {
                        if !book.container.exists(&cover) {
                            book.container
                                .add_name(&cover, &fs::read(unpacked.join(&cover))?, None, &[])?;
                        }
                        if let Some(id) = book.container.manifest_id_for_name(&cover).map(str::to_string) {
                            mark_cover(book.container.opf_mut(), &id);
                        }
                    }
                }
                Err(e) => ctx.log.warn(format!("ignoring unreadable metadata.opf: {e}")),
            }
        }
        book.set_metadata(&meta);
        Ok(book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::context;

    #[test]
    fn test_html_spider_and_metadata() {
        let src = tempfile::tempdir().unwrap();
        fs::write(
            src.path().join("index.html"),
            r#"<html lang="fr"><head><title>Le Livre</title><meta name="author" content="A. Auteur"/></head>
<body><a href="two.html">next</a><img src="pic.png"/></body></html>"#,
        )
        .unwrap();
        fs::write(src.path().join("two.html"), "<html><body><p>Two</p></body></html>").unwrap();
        fs::write(src.path().join("pic.png"), b"\x89PNG\r\n\x1a\n").unwrap();
        fs::write(src.path().join("unlinked.html"), "<p>no</p>").unwrap();

        let decoder = HtmlDecoder::new();
        assert!(decoder.sniff(Path::new("x"), b"<!DOCTYPE html><html>"));
        let (ctx, _tmp) = context(decoder.options(), &[]);
        let book = decoder.decode(&src.path().join("index.html"), &ctx).unwrap();
        assert_eq!(book.spine_names(), vec!["index.html", "two.html"]);
        assert!(book.container.exists("pic.png"));
        assert!(!book.container.exists("unlinked.html"));
        let meta = book.metadata();
        assert_eq!(meta.title, "Le Livre");
        assert_eq!(meta.authors, vec!["A. Auteur"]);
        assert_eq!(meta.language(), Some("fr"));
    }

    #[test]
    fn test_find_index_prefers_name_then_size() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.html"), "x".repeat(10)).unwrap();
        fs::write(dir.path().join("b.html"), "x".repeat(100)).unwrap();
        assert_eq!(find_index(dir.path()).unwrap().file_name().unwrap(), "b.html");
        fs::write(dir.path().join("toc.htm"), "x").unwrap();
        assert_eq!(find_index(dir.path()).unwrap().file_name().unwrap(), "toc.htm");
        fs::write(dir.path().join("Index.xhtml"), "x").unwrap();
        assert_eq!(find_index(dir.path()).unwrap().file_name().unwrap(), "Index.xhtml");
    }
}
