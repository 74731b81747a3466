//! Markup cleanup of spine documents.

use regex::Regex;

use crate::dom::{Document, Flavor, NodeData, NodeId};
use crate::error::{ConversionError, Result};
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::Book;

use super::{edit_spine, Transform};

pub struct CleanHtml;

impl CleanHtml {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CleanHtml {
    fn default() -> Self {
        Self::new()
    }
}

fn heading_level(doc: &Document, node: NodeId) -> Option<u8> {
    let name = doc.local_name(node)?.to_ascii_lowercase();
    let level = name.strip_prefix('h')?.parse::<u8>().ok()?;
    (1..=6).contains(&level).then_some(level)
}

fn rename_element(doc: &mut Document, node: NodeId, local: &str) {
    if let Some(el) = doc.element_mut(node) {
        el.name = match el.name.rsplit_once(':') {
            Some((prefix, _)) => format!("{prefix}:{local}"),
            None => local.to_string(),
        };
    }
}

/// `<h1>A</h1><h2>B</h2>` becomes `<h1>A</h1><h3>B</h3>`. Levels are read
/// after earlier demotions, so a second pass changes nothing.
pub(crate) fn demote_heading_chains(doc: &mut Document) -> bool {
    let mut changed = false;
    for node in doc.descendants(doc.root()) {
        let Some(level) = heading_level(doc, node) else {
            continue;
        };
        let Some(prev) = doc.prev_sibling(node).and_then(|p| {
            let mut cur = Some(p);
            while let Some(n) = cur {
                match doc.data(n) {
                    NodeData::Element(_) => return Some(n),
                    NodeData::Text(t) if !t.trim().is_empty() => return None,
                    _ => cur = doc.prev_sibling(n),
                }
            }
            None
        }) else {
            continue;
        };
        let Some(prev_level) = heading_level(doc, prev) else {
            continue;
        };
        if level == prev_level + 1 && prev_level + 2 <= 6 {
            rename_element(doc, node, &format!("h{}", prev_level + 2));
            changed = true;
        }
    }
    changed
}

fn is_entity_doctype(doc: &Document, node: NodeId) -> bool {
    matches!(doc.data(node), NodeData::Doctype(d) if d.contains("<!ENTITY") || d.contains('['))
}

fn is_stray_declaration(doc: &Document, node: NodeId) -> bool {
    match doc.data(node) {
        NodeData::ProcessingInstruction { target, .. } => target.eq_ignore_ascii_case("xml"),
        NodeData::Comment(c) => c.trim_start().starts_with("?xml"),
        _ => false,
    }
}

/// Drop characters matching `pattern` from every text node
fn strip_chars(doc: &mut Document, pattern: &Regex) -> bool {
    let mut changed = false;
    for node in doc.descendants(doc.root()) {
        if let NodeData::Text(text) = doc.data_mut(node) {
            if pattern.is_match(text) {
                *text = pattern.replace_all(text, "").into_owned();
                changed = true;
            }
        }
    }
    changed
}

fn clean(doc: &mut Document, title: &str, special: Option<&Regex>) -> bool {
    let mut changed = false;
    if doc.flavor() != Flavor::Xhtml {
        doc.set_flavor(Flavor::Xhtml);
        changed = true;
    }
    for node in doc.descendants(doc.root()) {
        if is_stray_declaration(doc, node) || is_entity_doctype(doc, node) {
            doc.detach(node);
            changed = true;
        }
    }
    if let Some(head) = doc.head() {
        for t in doc.elements_by_name(head, "title") {
            if doc.text_content(t).trim().is_empty() {
                doc.detach(t);
                changed = true;
            }
        }
        if doc.child_named(head, "title").is_none() && !title.is_empty() {
            let t = doc.create_element("title");
            doc.set_text(t, title);
            doc.prepend(head, t);
            changed = true;
        }
    }
    changed |= demote_heading_chains(doc);
    if let Some(pattern) = special {
        changed |= strip_chars(doc, pattern);
    }
    changed
}

impl Transform for CleanHtml {
    fn name(&self) -> &'static str {
        "clean_html"
    }

    fn description(&self) -> &'static str {
        "Normalize markup: void tags, empty titles, stray declarations, heading chains"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::bool(
            "keep_special_chars",
            false,
            "Keep characters the output profile asks to remove",
        )]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        let special = match &ctx.output_profile.remove_special_chars {
            Some(pattern) if !ctx.options.bool("keep_special_chars") => {
                Some(Regex::new(pattern).map_err(|e| ConversionError::InvalidOption {
                    name: "remove_special_chars".into(),
                    message: e.to_string(),
                })?)
            }
            _ => None,
        };
        let title = book.title();
        let mut cleaned = 0;
        edit_spine(book, ctx, |_, doc| {
            let changed = clean(doc, &title, special.as_ref());
            cleaned += changed as usize;
            Ok(changed)
        })?;
        ctx.log.debug(format!("cleaned {cleaned} documents"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context};

    #[test]
    fn test_heading_demotion_is_idempotent() {
        let mut doc = Document::parse_html(
            "<html><body><h1>A</h1><h2>B</h2><h3>C</h3><p>x</p><h2>D</h2></body></html>",
        );
        assert!(demote_heading_chains(&mut doc));
        let body = doc.body().unwrap();
        let names: Vec<String> = doc
            .element_children(body)
            .into_iter()
            .map(|n| doc.local_name(n).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["h1", "h3", "h3", "p", "h2"]);
        assert!(!demote_heading_chains(&mut doc));
    }

    #[test]
    fn test_clean_spine_document() {
        let mut book = book(&[(
            "a.xhtml",
            "<html><head><title></title></head><body><div/><p>soft\u{00AD}hyphen</p></body></html>",
        )]);
        book.set_metadata(&crate::types::Metadata::new("Book", "en"));
        let (mut ctx, _dir) = context(CleanHtml.options(), &[]);
        ctx.output_profile = crate::options::OutputProfile::by_name("kindle").unwrap();
        CleanHtml.run(&mut book, &ctx).unwrap();
        let text = book.container.read_text("a.xhtml").unwrap();
        assert!(text.contains("<title>Book</title>"));
        assert!(text.contains("<div></div>"));
        assert!(text.contains("<p>softhyphen</p>"));
        assert!(book.container.is_dirty("a.xhtml"));
    }
}
