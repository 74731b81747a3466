//! Merging the spine into a single XHTML document.
//!
//! Used by the outputs that carry one flow of markup (HTMLZ, MOBI and the
//! HTML handed to a PDF renderer). Each spine document becomes a
//! `<div class="chapter">` whose id is the target of links to the document.
//! Ids repeated across documents are renamed, links between spine
//! documents become fragment links and links to resources are rebased onto
//! the name of the merged document.

use std::collections::{HashMap, HashSet};

use crate::container::links::{markup_links, LinkLocation};
use crate::container::paths::{href_for_name, name_for_href, split_fragment};
use crate::css::rewrite_urls;
use crate::dom::{Document, NodeId};
use crate::error::Result;
use crate::types::Book;

pub(crate) struct Merged {
    pub doc: Document,
    pub body: NodeId,
    /// Id of the chapter div of each spine document, in spine order
    pub chapters: Vec<(String, String)>,
    anchors: HashMap<String, (String, IdMap)>,
}

impl Merged {
    /// Merged id for `fragment` in spine document `name`, or the id of the
    /// document's chapter div
    pub fn anchor(&self, name: &str, fragment: Option<&str>) -> Option<&str> {
        let (chapter, ids) = self.anchors.get(name)?;
        Some(fragment.and_then(|f| ids.get(f)).unwrap_or(chapter).as_str())
    }
}

/// Id renames for one spine document: old id to merged id
type IdMap = HashMap<String, String>;

fn unique(id: &str, taken: &mut HashSet<String>) -> String {
    let mut candidate = id.to_string();
    let mut n = 1;
    while taken.contains(&candidate) {
        candidate = format!("{id}-{n}");
        n += 1;
    }
    taken.insert(candidate.clone());
    candidate
}

/// New value of a link found in spine document `name`
fn relink(
    href: &str,
    name: &str,
    base: &str,
    anchors: &HashMap<String, (String, IdMap)>,
) -> Option<String> {
    let (path, fragment) = split_fragment(href.trim());
    let target = if path.is_empty() {
        name.to_string()
    } else {
        name_for_href(href, name)?
    };
    if let Some((chapter, ids)) = anchors.get(&target) {
        let id = fragment
            .and_then(|f| ids.get(f))
            .unwrap_or(chapter);
        return Some(format!("#{id}"));
    }
    let mut out = href_for_name(&target, base);
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    Some(out)
}

/// Merge every spine document of `book` into one document named `base`
pub(crate) fn merge_spine(book: &mut Book, base: &str) -> Result<Merged> {
    let meta = book.metadata();
    let spine = book.spine_names();

    let mut taken = HashSet::new();
    let mut anchors: HashMap<String, (String, IdMap)> = HashMap::new();
    let mut chapters = Vec::new();
    for (i, name) in spine.iter().enumerate() {
        let doc = book.container.html(name)?;
        let chapter = unique(&format!("chapter{}", i + 1), &mut taken);
        let mut ids = IdMap::new();
        for node in doc.descendants(doc.root()) {
            if let Some(id) = doc.attr(node, "id") {
                if !ids.contains_key(id) {
                    ids.insert(id.to_string(), unique(id, &mut taken));
                }
            }
        }
        chapters.push((name.clone(), chapter.clone()));
        anchors.insert(name.clone(), (chapter, ids));
    }

    let (mut merged, body) = Document::xhtml_skeleton(&meta.title, meta.language());
    let head = merged.head().unwrap_or(body);
    let mut sheets = HashSet::new();
    for (name, chapter) in &chapters {
        let mut doc = book.container.html(name)?.clone();
        let ids = &anchors[name].1;
        for node in doc.descendants(doc.root()) {
            if let Some(new) = doc.attr(node, "id").and_then(|id| ids.get(id)).cloned() {
                doc.set_attr(node, "id", new);
            }
        }
        let local: Vec<(NodeId, String)> = doc
            .descendants(doc.root())
            .into_iter()
            .filter_map(|n| doc.attr(n, "href").filter(|h| h.starts_with('#')).map(|h| (n, h.to_string())))
            .collect();
        for link in markup_links(&doc, name) {
            match link.location {
                LinkLocation::Attr { node, attr } => {
                    if let Some(new) = relink(&link.href, name, base, &anchors) {
                        doc.set_attr(node, &attr, new);
                    }
                }
                LinkLocation::StyleAttr { node } => {
                    let style = doc.attr(node, "style").unwrap_or_default().to_string();
                    if let Some(new) = rewrite_urls(&style, |u| relink(u, name, base, &anchors)) {
                        doc.set_attr(node, "style", new);
                    }
                }
                LinkLocation::StyleElement { .. } | LinkLocation::Stylesheet => {}
            }
        }
        // fragment-only links are not reported as container links
        for (node, href) in local {
            if let Some(new) = relink(&href, name, base, &anchors) {
                doc.set_attr(node, "href", new);
            }
        }

        if let Some(doc_head) = doc.head() {
            for node in doc.element_children(doc_head) {
                let is_sheet = doc.is(node, "link")
                    && doc.attr(node, "rel").is_some_and(|r| r.eq_ignore_ascii_case("stylesheet"));
                if is_sheet {
                    let target = doc.attr(node, "href").and_then(|h| name_for_href(h, base));
                    if target.is_some_and(|t| sheets.insert(t)) {
                        merged.import(head, &doc, node);
                    }
                } else if doc.is(node, "style") {
                    let css = doc.text_content(node);
                    let css = rewrite_urls(&css, |u| relink(u, name, base, &anchors)).unwrap_or(css);
                    let style = merged.append_text_element(head, "style", &css);
                    merged.set_attr(style, "type", "text/css");
                }
            }
        }

        let div = merged.append_element(body, "div");
        merged.set_attr(div, "class", "chapter");
        merged.set_attr(div, "id", chapter.as_str());
        if let Some(doc_body) = doc.body() {
            for &child in doc.children(doc_body) {
                merged.import(div, &doc, child);
            }
        }
    }
    Ok(Merged {
        doc: merged,
        body,
        chapters,
        anchors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, xhtml};

    #[test]
    fn test_merge_spine() {
        let mut book = book(&[
            (
                "text/a.xhtml",
                &xhtml(r##"<p id="x">A</p><a href="b.xhtml#x">to b</a><a href="#x">self</a><img src="../img/p.png"/>"##),
            ),
            ("text/b.xhtml", &xhtml(r#"<p id="x">B</p><a href="a.xhtml">to a</a>"#)),
        ]);
        let merged = merge_spine(&mut book, "index.html").unwrap();
        let out = merged.doc.to_xml();
        assert!(out.contains(r#"<div class="chapter" id="chapter1"><p id="x">A</p>"#));
        assert!(out.contains(r#"<p id="x-1">B</p>"#));
        assert!(out.contains(r##"<a href="#x-1">to b</a>"##));
        assert!(out.contains(r##"<a href="#x">self</a>"##));
        assert!(out.contains(r##"<a href="#chapter1">to a</a>"##));
        assert!(out.contains(r#"src="img/p.png""#));
        assert_eq!(merged.chapters.len(), 2);
        assert_eq!(merged.anchor("text/b.xhtml", Some("x")), Some("x-1"));
        assert_eq!(merged.anchor("text/b.xhtml", None), Some("chapter2"));
        assert_eq!(merged.anchor("missing.xhtml", None), None);
    }
}
