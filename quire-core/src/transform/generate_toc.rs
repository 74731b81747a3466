//! Table of contents generation and cleanup.

use std::collections::HashSet;

use regex::Regex;

use crate::container::paths::{file_name, name_for_href, split_fragment};
use crate::dom::{Document, NodeId, XPath};
use crate::error::{ConversionError, Result};
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::{Book, TocNode};

use super::{edit_spine, Transform};

pub struct GenerateToc;

impl GenerateToc {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GenerateToc {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a tree from `(level, entry)` pairs in reading order. An entry
/// nests under the closest preceding entry of a lower level.
fn nest(entries: Vec<(usize, TocNode)>) -> TocNode {
    fn open_parent(node: &mut TocNode, depth: usize) -> &mut TocNode {
        if depth == 0 || node.children.is_empty() {
            return node;
        }
        let last = node.children.len() - 1;
        open_parent(&mut node.children[last], depth - 1)
    }

    let mut root = TocNode::root();
    let mut open: Vec<usize> = Vec::new();
    for (level, entry) in entries {
        while open.last().is_some_and(|&l| l >= level) {
            open.pop();
        }
        open_parent(&mut root, open.len()).children.push(entry);
        open.push(level);
    }
    root
}

fn merge_adjacent(node: &mut TocNode) {
    let children = std::mem::take(&mut node.children);
    for mut child in children {
        merge_adjacent(&mut child);
        let same = child.target().is_some()
            && node.children.last().is_some_and(|prev| prev.target() == child.target());
        if !same {
            node.children.push(child);
        } else if let Some(prev) = node.children.last_mut() {
            prev.children.append(&mut child.children);
        }
    }
}

fn dedup_siblings(node: &mut TocNode) {
    let mut seen = HashSet::new();
    node.children
        .retain(|c| c.target().map_or(true, |target| seen.insert(target)));
    for child in &mut node.children {
        dedup_siblings(child);
    }
}

fn cap_depth(node: &mut TocNode, levels: usize) {
    if levels == 0 {
        node.children.clear();
        return;
    }
    for child in &mut node.children {
        cap_depth(child, levels - 1);
    }
}

fn cap_links(node: &mut TocNode, max: usize) {
    node.children.truncate(max);
    for child in &mut node.children {
        cap_links(child, max);
    }
}

fn heading_level(doc: &Document, node: NodeId) -> Option<usize> {
    match doc.local_name(node)? {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        _ if doc.element(node).is_some_and(|e| e.has_class("chapter")) => Some(1),
        _ => None,
    }
}

/// Title for a whole file: its `<title>`, else its first heading, else the file name
fn file_title(doc: &Document, name: &str) -> String {
    let from = |local: &str| {
        doc.find_first(doc.root(), local)
            .map(|n| doc.normalized_text(n))
            .filter(|t| !t.is_empty())
    };
    from("title")
        .or_else(|| from("h1"))
        .or_else(|| from("h2"))
        .unwrap_or_else(|| {
            let file = file_name(name);
            file.rsplit_once('.').map_or(file, |(stem, _)| stem).to_string()
        })
}

impl GenerateToc {
    /// Entries for the elements matched by the level expressions
    fn from_xpath(
        &self,
        book: &mut Book,
        ctx: &StageContext,
        levels: &[Option<XPath>],
    ) -> Result<Vec<(usize, TocNode)>> {
        let mut entries = Vec::new();
        edit_spine(book, ctx, |name, doc| {
            let mut found: Vec<(usize, NodeId)> = Vec::new();
            for (i, xpath) in levels.iter().enumerate() {
                if let Some(xpath) = xpath {
                    found.extend(xpath.select(doc, doc.root()).into_iter().map(|n| (i + 1, n)));
                }
            }
            let order = doc.document_order();
            found.sort_by_key(|(_, n)| order.get(n).copied().unwrap_or(usize::MAX));
            found.dedup_by_key(|(_, n)| *n);
            let mut changed = false;
            for (level, node) in found {
                let title = doc.normalized_text(node);
                if title.is_empty() {
                    continue;
                }
                changed |= doc.attr(node, "id").is_none();
                let id = doc.ensure_id(node, "toc");
                entries.push((level, TocNode::new(title, name).with_fragment(id)));
            }
            Ok(changed)
        })?;
        Ok(entries)
    }

    fn from_headings(&self, book: &mut Book, ctx: &StageContext) -> Result<Vec<(usize, TocNode)>> {
        let mut entries = Vec::new();
        edit_spine(book, ctx, |name, doc| {
            let mut changed = false;
            let Some(body) = doc.body() else {
                return Ok(false);
            };
            for node in doc.descendants(body) {
                let Some(level) = heading_level(doc, node) else {
                    continue;
                };
                let title = doc.normalized_text(node);
                if title.is_empty() {
                    continue;
                }
                changed |= doc.attr(node, "id").is_none();
                let id = doc.ensure_id(node, "toc");
                entries.push((level, TocNode::new(title, name).with_fragment(id)));
            }
            Ok(changed)
        })?;
        Ok(entries)
    }

    /// Links in the text that point at other spine documents
    fn from_links(&self, book: &mut Book) -> Vec<(usize, TocNode)> {
        let spine = book.spine_names();
        let mut entries = Vec::new();
        for name in &spine {
            let Ok(doc) = book.container.html(name) else {
                continue;
            };
            for a in doc.elements_by_name(doc.root(), "a") {
                let Some(href) = doc.attr(a, "href") else {
                    continue;
                };
                let (path, fragment) = split_fragment(href);
                let Some(target) = name_for_href(path, name) else {
                    continue;
                };
                let title = doc.normalized_text(a);
                if title.is_empty() || !spine.contains(&target) {
                    continue;
                }
                let mut entry = TocNode::new(title, target);
                if let Some(fragment) = fragment {
                    entry = entry.with_fragment(fragment);
                }
                entries.push((1, entry));
            }
        }
        entries
    }

    fn per_file(&self, book: &mut Book) -> Vec<(usize, TocNode)> {
        let mut entries = Vec::new();
        for name in book.spine_names() {
            if let Ok(doc) = book.container.html(&name) {
                let title = file_title(doc, &name);
                entries.push((1, TocNode::new(title, name)));
            }
        }
        entries
    }

    fn build(&self, book: &mut Book, ctx: &StageContext) -> Result<TocNode> {
        let opts = &ctx.options;
        if !opts.bool("use_auto_toc") && book.toc().count() > 0 {
            ctx.log.debug("keeping the table of contents from the input");
            return Ok(book.toc().clone());
        }

        let levels = [
            opts.xpath("level1_toc")?,
            opts.xpath("level2_toc")?,
            opts.xpath("level3_toc")?,
        ];
        if levels[0].is_some() {
            let entries = self.from_xpath(book, ctx, &levels)?;
            if !entries.is_empty() {
                ctx.log.info(format!("{} entries from the level expressions", entries.len()));
                return Ok(nest(entries));
            }
        }

        let mut entries = Vec::new();
        if !opts.bool("no_chapters_in_toc") {
            entries = self.from_headings(book, ctx)?;
        }
        let threshold = opts.int("toc_threshold").unwrap_or(6).max(0) as usize;
        if entries.len() < threshold {
            entries.extend(self.from_links(book));
        }
        if entries.is_empty() {
            entries = self.per_file(book);
        }
        Ok(nest(entries))
    }
}

impl Transform for GenerateToc {
    fn name(&self) -> &'static str {
        "generate_toc"
    }

    fn description(&self) -> &'static str {
        "Build the table of contents and tidy it up"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![
            OptionDef::xpath("level1_toc", None, "Elements that become top level entries"),
            OptionDef::xpath("level2_toc", None, "Elements that become second level entries"),
            OptionDef::xpath("level3_toc", None, "Elements that become third level entries"),
            OptionDef::bool("use_auto_toc", false, "Ignore the table of contents of the input"),
            OptionDef::bool("no_chapters_in_toc", false, "Do not add detected chapters"),
            OptionDef::int(
                "toc_threshold",
                6,
                "Add links from the text when fewer chapters than this are found",
            ),
            OptionDef::int("max_toc_links", 50, "Most entries per level, 0 for no limit"),
            OptionDef::bool(
                "duplicate_links_in_toc",
                false,
                "Keep sibling entries that point to the same place",
            ),
            OptionDef::string("toc_filter", None, "Remove entries whose title matches this regex"),
            OptionDef::int("toc_max_depth", 3, "Deepest nesting level kept"),
        ]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        let mut toc = self.build(book, ctx)?;
        let opts = &ctx.options;

        merge_adjacent(&mut toc);
        if !opts.bool("duplicate_links_in_toc") {
            dedup_siblings(&mut toc);
        }
        if let Some(pattern) = opts.str("toc_filter") {
            let filter = Regex::new(pattern).map_err(|e| ConversionError::InvalidOption {
                name: "toc_filter".into(),
                message: e.to_string(),
            })?;
            toc.retain(&mut |node| !filter.is_match(&node.title));
        }
        cap_depth(&mut toc, opts.int("toc_max_depth").unwrap_or(3).max(1) as usize);
        let max_links = opts.int("max_toc_links").unwrap_or(50).max(0) as usize;
        if max_links > 0 {
            cap_links(&mut toc, max_links);
        }

        if *book.toc() != toc {
            ctx.log.debug(format!("table of contents has {} entries", toc.count()));
            book.container.set_toc(toc);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};

    #[test]
    fn test_toc_from_level_expression() {
        let body: String = (1..=5)
            .map(|i| format!("<h1 id=\"c{i}\">Chapter {i}</h1><p>text</p>"))
            .collect();
        let mut book = book(&[("doc.xhtml", &xhtml(&body))]);
        let (ctx, _dir) = context(GenerateToc.options(), &[("level1_toc", "//h:h1")]);
        GenerateToc.run(&mut book, &ctx).unwrap();

        let toc = book.toc();
        assert_eq!(toc.children.len(), 5);
        for (i, entry) in toc.children.iter().enumerate() {
            assert_eq!(entry.target().unwrap(), format!("doc.xhtml#c{}", i + 1));
            assert_eq!(entry.title, format!("Chapter {}", i + 1));
        }
    }

    #[test]
    fn test_headings_nest_and_get_ids() {
        let mut book = book(&[(
            "a.xhtml",
            &xhtml("<h1>One</h1><h2>One.A</h2><h3>Deep</h3><h1>Two</h1>"),
        )]);
        let (ctx, _dir) = context(GenerateToc.options(), &[("toc_max_depth", "2")]);
        GenerateToc.run(&mut book, &ctx).unwrap();

        let toc = book.toc().clone();
        assert_eq!(toc.children.len(), 2);
        assert_eq!(toc.children[0].children[0].title, "One.A");
        assert!(toc.children[0].children[0].children.is_empty());
        assert_eq!(toc.children[1].target().unwrap(), "a.xhtml#toc4");
        assert!(book.container.read_text("a.xhtml").unwrap().contains(r#"<h1 id="toc1">One</h1>"#));
    }

    #[test]
    fn test_existing_toc_cleanup() {
        let mut book = book(&[("a.xhtml", &xhtml("<p>x</p>")), ("b.xhtml", &xhtml("<p>y</p>"))]);
        book.container.set_toc(TocNode::root().with_children(vec![
            TocNode::new("A", "a.xhtml"),
            TocNode::new("A again", "a.xhtml").with_children(vec![TocNode::new("Sub", "b.xhtml")]),
            TocNode::new("Index", "b.xhtml").with_fragment("ix"),
            TocNode::new("B", "b.xhtml"),
        ]));
        let (ctx, _dir) = context(GenerateToc.options(), &[("toc_filter", "^Index$")]);
        GenerateToc.run(&mut book, &ctx).unwrap();

        let toc = book.toc();
        let titles: Vec<&str> = toc.children.iter().map(|c| c.title.as_str()).collect();
        assert_eq!(titles, ["A", "B"]);
        assert_eq!(toc.children[0].children[0].title, "Sub");
    }

    #[test]
    fn test_one_entry_per_file_fallback() {
        let mut book = book(&[("a.xhtml", &xhtml("<p>x</p>")), ("b.xhtml", &xhtml("<p>y</p>"))]);
        let (ctx, _dir) = context(GenerateToc.options(), &[]);
        GenerateToc.run(&mut book, &ctx).unwrap();
        let targets: Vec<String> = book.toc().children.iter().filter_map(|c| c.target()).collect();
        assert_eq!(targets, ["a.xhtml", "b.xhtml"]);
    }
}
