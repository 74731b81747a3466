//! Book jacket: a generated first page summarizing the metadata.

use crate::container::Parsed;
use crate::dom::{Document, NodeId};
use crate::error::Result;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::{Book, Metadata};

use super::Transform;

pub const JACKET_NAME: &str = "jacket.xhtml";

/// Generator marker that identifies a jacket written by an earlier run
const GENERATOR: &str = "quire-jacket";

pub struct Jacket;

impl Jacket {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Jacket {
    fn default() -> Self {
        Self::new()
    }
}

fn is_jacket(doc: &Document) -> bool {
    doc.elements_by_name(doc.root(), "meta").into_iter().any(|m| {
        doc.attr(m, "name") == Some("generator") && doc.attr(m, "content") == Some(GENERATOR)
    })
}

fn format_index(index: f64) -> String {
    if index.fract() == 0.0 {
        format!("{}", index as i64)
    } else {
        format!("{index}")
    }
}

/// Append the comments, which may be markup or plain text paragraphs
fn append_comments(doc: &mut Document, parent: NodeId, comments: &str) {
    if comments.contains('<') {
        let parsed = Document::parse_html(comments);
        let source = parsed.body().unwrap_or_else(|| parsed.root());
        for child in parsed.children(source).to_vec() {
            doc.import(parent, &parsed, child);
        }
        return;
    }
    for para in comments.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
        doc.append_text_element(parent, "p", para);
    }
}

/// Render the jacket page for `meta`; `cover` is the cover image's href
/// relative to the jacket
pub(crate) fn render(meta: &Metadata, cover: Option<&str>) -> Document {
    let lang = meta.language().map(str::to_string);
    let (mut doc, body) = Document::xhtml_skeleton(&meta.title, lang.as_deref());
    if let Some(head) = doc.head() {
        let generator =
            doc.create_element_with("meta", &[("name", "generator"), ("content", GENERATOR)]);
        doc.append(head, generator);
    }
    let root = doc.create_element_with("div", &[("class", "jacket")]);
    doc.append(body, root);

    if let Some(href) = cover {
        let block = doc.append_element(root, "div");
        doc.set_attr(block, "class", "jacket-cover");
        let img = doc.create_element_with("img", &[("src", href), ("alt", "Cover")]);
        doc.set_attr(img, "style", "max-height: 12em");
        doc.append(block, img);
    }
    let title = doc.append_text_element(root, "h1", &meta.title);
    doc.set_attr(title, "class", "jacket-title");
    if !meta.authors.is_empty() {
        let authors = doc.append_text_element(root, "p", &meta.authors_display());
        doc.set_attr(authors, "class", "jacket-authors");
    }
    if let Some(series) = &meta.series {
        let text = match meta.series_index {
            Some(index) => format!("Book {} of {series}", format_index(index)),
            None => series.clone(),
        };
        let p = doc.append_text_element(root, "p", &text);
        doc.set_attr(p, "class", "jacket-series");
    }
    if !meta.tags.is_empty() {
        let p = doc.append_text_element(root, "p", &meta.tags.join(", "));
        doc.set_attr(p, "class", "jacket-tags");
    }
    if let Some(comments) = meta.comments.as_deref().filter(|c| !c.trim().is_empty()) {
        let block = doc.append_element(root, "div");
        doc.set_attr(block, "class", "jacket-comments");
        append_comments(&mut doc, block, comments);
    }
    doc
}

impl Transform for Jacket {
    fn name(&self) -> &'static str {
        "jacket"
    }

    fn description(&self) -> &'static str {
        "Insert a page with the book's metadata at the start"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::bool("insert_jacket", false, "Insert a metadata page at the start")]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        if book.container.exists(JACKET_NAME) {
            let previous = book.container.html(JACKET_NAME).map(is_jacket).unwrap_or(false);
            if previous {
                ctx.log.debug("replacing the jacket of an earlier run");
                book.container.remove_name(JACKET_NAME)?;
            }
        }

        let meta = book.metadata();
        let cover = book
            .cover_name()
            .map(|name| book.container.href_for_name(&name, JACKET_NAME));
        let doc = render(&meta, cover.as_deref());
        let id = book.container.add_name(
            JACKET_NAME,
            doc.to_xml().as_bytes(),
            Some("application/xhtml+xml"),
            &[],
        )?;
        book.container.set_parsed(JACKET_NAME, Parsed::Html(doc))?;

        let opf = book.container.opf_mut();
        opf.spine.insert(0, id, true);
        if opf.guide.get("text").is_none() {
            opf.guide.set("text", "Start", JACKET_NAME, None);
        }
        ctx.log.info("inserted jacket");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};

    fn sample() -> Book {
        let mut book = book(&[("ch1.xhtml", &xhtml("<p>x</p>"))]);
        let mut meta = Metadata::new("Dune", "en")
            .with_author("Frank Herbert")
            .with_series("Dune", 1.0)
            .with_comments("First line.\n\nSecond <b>bold</b>.");
        meta.tags = vec!["sf".into(), "classic".into()];
        book.set_metadata(&meta);
        book.container.add_name("images/cover.jpg", b"jpg", None, &["cover-image"]).unwrap();
        book
    }

    #[test]
    fn test_jacket_is_first_and_replaced_on_rerun() {
        let mut book = sample();
        let (ctx, _dir) = context(vec![], &[]);
        Jacket.run(&mut book, &ctx).unwrap();

        assert_eq!(book.spine_names(), ["jacket.xhtml", "ch1.xhtml"]);
        assert_eq!(book.guide().get("text").unwrap().href, JACKET_NAME);
        let html = book.container.read_text(JACKET_NAME).unwrap();
        assert!(html.contains(r#"src="images/cover.jpg""#), "{html}");
        assert!(html.contains("Book 1 of Dune"));
        assert!(html.contains("sf, classic"));
        assert!(html.contains("<b>bold</b>"));

        Jacket.run(&mut book, &ctx).unwrap();
        assert_eq!(book.spine_names(), ["jacket.xhtml", "ch1.xhtml"]);
    }

    #[test]
    fn test_foreign_file_conflicts() {
        let mut book = book(&[("jacket.xhtml", &xhtml("<p>mine</p>"))]);
        let (ctx, _dir) = context(vec![], &[]);
        let err = Jacket.run(&mut book, &ctx).unwrap_err();
        assert!(err.is_conflict());
    }
}
