//! Removal of margins that conversion tools put on every paragraph.
//!
//! Two shapes are recognized, both judged on inline styles so the pass
//! belongs after CSS flattening: wrapper `<div>`s that only carry a margin
//! and hold nothing but paragraphs, and one left/right margin pair repeated
//! on most paragraphs of a document.

use crate::css::{parse_declarations, serialize_declarations, Declaration};
use crate::css::values::length_to_pt;
use crate::dom::{Document, NodeId};
use crate::error::Result;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::Book;

use super::{edit_spine, Transform};

pub struct RemoveFakeMargins;

impl RemoveFakeMargins {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RemoveFakeMargins {
    fn default() -> Self {
        Self::new()
    }
}

fn style_of(doc: &Document, node: NodeId) -> Vec<Declaration> {
    doc.attr(node, "style").map(parse_declarations).unwrap_or_default()
}

fn is_margin(name: &str) -> bool {
    name == "margin" || name.starts_with("margin-")
}

fn nonzero(value: &str) -> bool {
    value
        .split_whitespace()
        .any(|v| length_to_pt(v, 12.0, 12.0).map_or(true, |pt| pt != 0.0))
}

/// A `div` whose style is only non-zero margins and whose element children
/// are all paragraphs
fn is_margin_wrapper(doc: &Document, node: NodeId) -> bool {
    if !doc.is(node, "div") || doc.attr(node, "id").is_some() {
        return false;
    }
    let style = style_of(doc, node);
    let children = doc.element_children(node);
    !style.is_empty()
        && style.iter().all(|d| is_margin(&d.name))
        && style.iter().any(|d| nonzero(&d.value))
        && !children.is_empty()
        && children.iter().all(|&c| doc.is(c, "p"))
}

fn side_margins(doc: &Document, node: NodeId) -> Option<(String, String)> {
    let style = style_of(doc, node);
    let get = |name: &str| {
        style
            .iter()
            .rev()
            .find(|d| d.name == name)
            .map(|d| d.value.clone())
            .unwrap_or_else(|| "0".to_string())
    };
    let pair = (get("margin-left"), get("margin-right"));
    (nonzero(&pair.0) || nonzero(&pair.1)).then_some(pair)
}

fn drop_properties(doc: &mut Document, node: NodeId, names: &[&str]) {
    let style: Vec<Declaration> = style_of(doc, node)
        .into_iter()
        .filter(|d| !names.contains(&d.name.as_str()))
        .collect();
    if style.is_empty() {
        doc.remove_attr(node, "style");
    } else {
        doc.set_attr(node, "style", serialize_declarations(&style));
    }
}

/// Returns true if the document changed
fn remove_margins(doc: &mut Document, threshold: f64) -> bool {
    let Some(body) = doc.body() else {
        return false;
    };
    let paragraphs = doc.elements_by_name(body, "p");
    if paragraphs.is_empty() {
        return false;
    }
    let total = paragraphs.len() as f64;
    let mut changed = false;

    let wrappers: Vec<NodeId> = doc
        .elements_by_name(body, "div")
        .into_iter()
        .filter(|&d| is_margin_wrapper(doc, d))
        .collect();
    let wrapped: usize = wrappers.iter().map(|&d| doc.element_children(d).len()).sum();
    if !wrappers.is_empty() && wrapped as f64 / total >= threshold {
        for wrapper in wrappers {
            doc.unwrap(wrapper);
        }
        changed = true;
    }

    // margin pairs in order of first appearance
    let mut counts: Vec<((String, String), Vec<NodeId>)> = Vec::new();
    for &p in &paragraphs {
        if let Some(pair) = side_margins(doc, p) {
            match counts.iter_mut().find(|(seen, _)| *seen == pair) {
                Some((_, nodes)) => nodes.push(p),
                None => counts.push((pair, vec![p])),
            }
        }
    }
    // reversed so that on a tie the pair seen first wins
    let common = counts
        .into_iter()
        .rev()
        .map(|(_, nodes)| nodes)
        .max_by_key(|nodes| nodes.len());
    if let Some(nodes) = common {
        if nodes.len() as f64 / total >= threshold {
            for p in nodes {
                drop_properties(doc, p, &["margin-left", "margin-right"]);
            }
            changed = true;
        }
    }
    changed
}

impl Transform for RemoveFakeMargins {
    fn name(&self) -> &'static str {
        "remove_fake_margins"
    }

    fn description(&self) -> &'static str {
        "Remove margins that are repeated on nearly every paragraph"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![
            OptionDef::bool("remove_fake_margins", false, "Remove tool-inserted paragraph margins"),
            OptionDef::float(
                "fake_margin_threshold",
                0.8,
                "Share of paragraphs that must carry the margin",
            ),
        ]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        let threshold = ctx
            .options
            .float("fake_margin_threshold")
            .unwrap_or(0.8)
            .clamp(0.0, 1.0);
        let mut documents = 0;
        edit_spine(book, ctx, |_, doc| {
            let changed = remove_margins(doc, threshold);
            documents += usize::from(changed);
            Ok(changed)
        })?;
        if documents > 0 {
            ctx.log.info(format!("removed fake margins in {documents} documents"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};

    #[test]
    fn test_unwraps_margin_wrappers() {
        let body = r#"<div style="margin-left: 36pt"><p>a</p><p>b</p></div><div style="margin-left: 36pt"><p>c</p><p>d</p></div><p>e</p>"#;
        let mut book = book(&[("a.xhtml", &xhtml(body))]);
        let (ctx, _dir) = context(RemoveFakeMargins.options(), &[]);
        RemoveFakeMargins.run(&mut book, &ctx).unwrap();
        let html = book.container.read_text("a.xhtml").unwrap();
        assert!(html.contains("<body><p>a</p><p>b</p><p>c</p><p>d</p><p>e</p></body>"), "{html}");
    }

    #[test]
    fn test_common_paragraph_margins() {
        let mut body = String::new();
        for _ in 0..9 {
            body.push_str(r#"<p style="margin-left: 20pt; margin-right: 20pt; text-indent: 1em">x</p>"#);
        }
        body.push_str(r#"<p style="margin-left: 40pt">quote</p>"#);
        let mut book = book(&[("a.xhtml", &xhtml(&body))]);
        let (ctx, _dir) = context(RemoveFakeMargins.options(), &[]);
        RemoveFakeMargins.run(&mut book, &ctx).unwrap();
        let html = book.container.read_text("a.xhtml").unwrap();
        assert_eq!(html.matches(r#"<p style="text-indent: 1em">"#).count(), 9);
        assert!(html.contains(r#"<p style="margin-left: 40pt">quote</p>"#));
    }

    #[test]
    fn test_below_threshold_untouched() {
        let body = r#"<div style="margin: 1em"><p>a</p></div><p>b</p><p>c</p>"#;
        let mut book = book(&[("a.xhtml", &xhtml(body))]);
        let before = book.container.read_text("a.xhtml").unwrap();
        let (ctx, _dir) = context(RemoveFakeMargins.options(), &[]);
        RemoveFakeMargins.run(&mut book, &ctx).unwrap();
        assert!(!book.container.is_dirty("a.xhtml"));
        assert_eq!(book.container.read_text("a.xhtml").unwrap(), before);
    }

    #[test]
    fn test_tied_margins_pick_first_seen() {
        let mut body = String::new();
        for _ in 0..2 {
            body.push_str(r#"<p style="margin-left: 30pt">wide</p><p style="margin-left: 10pt">narrow</p>"#);
        }
        for _ in 0..3 {
            let mut book = book(&[("a.xhtml", &xhtml(&body))]);
            let (ctx, _dir) = context(RemoveFakeMargins.options(), &[("fake_margin_threshold", "0.5")]);
            RemoveFakeMargins.run(&mut book, &ctx).unwrap();
            let html = book.container.read_text("a.xhtml").unwrap();
            assert_eq!(html.matches("<p>wide</p>").count(), 2, "{html}");
            assert_eq!(html.matches(r#"<p style="margin-left: 10pt">narrow</p>"#).count(), 2, "{html}");
        }
    }
}
