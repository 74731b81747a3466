//! FictionBook 2 output.
//!
//! The spine is merged into one flow first, so every internal link is a
//! fragment link. Each spine document becomes a top level `<section>` (or
//! the whole book one section when `fb2_sectionize` is `nothing`). Images
//! are embedded as base64 `<binary>` elements.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::merge::merge_spine;
use super::{book_title, Encoder};
use crate::container::paths::{file_name, is_external, name_for_href};
use crate::dom::{Document, Flavor, NodeData, NodeId};
use crate::error::Result;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::media::guess_media_type;
use crate::types::{Book, Metadata};

const FB2_NS: &str = "http://www.gribuser.ru/xml/fictionbook/2.0";
const XLINK_NS: &str = "http://www.w3.org/1999/xlink";
const MERGED: &str = "index.xhtml";

pub struct Fb2Encoder;

impl Fb2Encoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Fb2Encoder {
    fn default() -> Self {
        Self::new()
    }
}

fn is_fb2_image(media_type: &str) -> bool {
    matches!(media_type, "image/jpeg" | "image/png" | "image/gif")
}

/// `<author>` element parts for a display name
fn author_parts(name: &str) -> Vec<(&'static str, String)> {
    let words: Vec<&str> = name.split_whitespace().collect();
    match words.as_slice() {
        [] => Vec::new(),
        [single] => vec![("nickname", single.to_string())],
        [first, middle @ .., last] => {
            let mut parts = vec![("first-name", first.to_string())];
            if !middle.is_empty() {
                parts.push(("middle-name", middle.join(" ")));
            }
            parts.push(("last-name", last.to_string()));
            parts
        }
    }
}

/// Plain paragraphs of an HTML comments fragment
fn comment_paragraphs(html: &str) -> Vec<String> {
    let doc = Document::parse_html(html);
    let root = doc.body().unwrap_or_else(|| doc.root());
    let paragraphs: Vec<String> = doc
        .elements_by_name(root, "p")
        .into_iter()
        .map(|p| doc.normalized_text(p))
        .filter(|t| !t.is_empty())
        .collect();
    if paragraphs.is_empty() {
        let text = doc.normalized_text(root);
        if text.is_empty() {
            Vec::new()
        } else {
            vec![text]
        }
    } else {
        paragraphs
    }
}

fn write_description(out: &mut Document, root: NodeId, meta: &Metadata, title: &str, cover: Option<&str>) {
    let desc = out.append_element(root, "description");
    let info = out.append_element(desc, "title-info");
    if meta.tags.is_empty() {
        out.append_text_element(info, "genre", "antique");
    }
    for tag in &meta.tags {
        out.append_text_element(info, "genre", tag);
    }
    let authors = if meta.authors.is_empty() {
        vec!["Unknown".to_string()]
    } else {
        meta.authors.clone()
    };
    for name in &authors {
        let author = out.append_element(info, "author");
        for (part, value) in author_parts(name) {
            out.append_text_element(author, part, &value);
        }
    }
    out.append_text_element(info, "book-title", title);
    if let Some(comments) = &meta.comments {
        let paragraphs = comment_paragraphs(comments);
        if !paragraphs.is_empty() {
            let annotation = out.append_element(info, "annotation");
            for p in paragraphs {
                out.append_text_element(annotation, "p", &p);
            }
        }
    }
    if let Some(date) = meta.pubdate {
        let el = out.append_text_element(info, "date", &date.format("%Y").to_string());
        out.set_attr(el, "value", date.format("%Y-%m-%d").to_string());
    }
    if let Some(id) = cover {
        let page = out.append_element(info, "coverpage");
        let image = out.append_element(page, "image");
        out.set_attr(image, "l:href", format!("#{id}"));
    }
    out.append_text_element(info, "lang", meta.language().unwrap_or("en"));
    if let Some(series) = &meta.series {
        let seq = out.append_element(info, "sequence");
        out.set_attr(seq, "name", series.as_str());
        if let Some(index) = meta.series_index {
            out.set_attr(seq, "number", format!("{}", index.trunc() as i64));
        }
    }

    let doc_info = out.append_element(desc, "document-info");
    let author = out.append_element(doc_info, "author");
    out.append_text_element(author, "nickname", "quire");
    out.append_text_element(doc_info, "program-used", concat!("quire ", env!("CARGO_PKG_VERSION")));
    let now = chrono::Utc::now();
    let date = out.append_text_element(doc_info, "date", &now.format("%Y-%m-%d").to_string());
    out.set_attr(date, "value", now.format("%Y-%m-%d").to_string());
    let id = meta
        .identifiers
        .get("fb2")
        .or_else(|| meta.identifiers.get("uuid"))
        .cloned()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    out.append_text_element(doc_info, "id", &id);
    out.append_text_element(doc_info, "version", "1.0");

    if meta.publisher.is_some() || meta.isbn().is_some() {
        let publish = out.append_element(desc, "publish-info");
        if let Some(publisher) = &meta.publisher {
            out.append_text_element(publish, "publisher", publisher);
        }
        if let Some(date) = meta.pubdate {
            out.append_text_element(publish, "year", &date.format("%Y").to_string());
        }
        if let Some(isbn) = meta.isbn() {
            out.append_text_element(publish, "isbn", isbn);
        }
    }
}

/// Walks the merged XHTML and writes FB2 body markup
struct Writer<'a> {
    src: &'a Document,
    out: Document,
    /// Container name to binary id
    binaries: &'a HashMap<String, String>,
    /// Where block content goes: a section or a cite
    container: NodeId,
    para: Option<NodeId>,
    has_content: bool,
    /// Ids that could not be placed, to the id of their section
    aliases: HashMap<String, String>,
    section_id: Option<String>,
}

impl<'a> Writer<'a> {
    fn para(&mut self) -> NodeId {
        if let Some(p) = self.para {
            return p;
        }
        let p = self.out.append_element(self.container, "p");
        self.para = Some(p);
        self.has_content = true;
        p
    }

    fn close(&mut self) {
        self.para = None;
    }

    fn carry_id(&mut self, src: NodeId, to: Option<NodeId>) {
        let source = self.src;
        let Some(id) = source.attr(src, "id") else {
            return;
        };
        match to {
            Some(node) if self.out.attr(node, "id").is_none() => {
                self.out.set_attr(node, "id", id);
            }
            _ => {
                if let Some(section) = &self.section_id {
                    self.aliases.insert(id.to_string(), section.clone());
                }
            }
        }
    }

    fn image_id(&self, node: NodeId) -> Option<String> {
        let src = self.src.attr(node, "src").or_else(|| self.src.element(node)?.attr_local("href"))?;
        let name = name_for_href(src, MERGED)?;
        self.binaries.get(&name).cloned()
    }

    fn children_block(&mut self, node: NodeId) {
        let src = self.src;
        for &child in src.children(node) {
            self.block(child);
        }
    }

    fn block(&mut self, node: NodeId) {
        let src = self.src;
        let local = match src.data(node) {
            NodeData::Text(text) => {
                if !text.trim().is_empty() {
                    let p = self.para();
                    self.out.append_text(p, text);
                }
                return;
            }
            NodeData::Element(el) => el.local_name().to_ascii_lowercase(),
            _ => return,
        };
        match local.as_str() {
            "script" | "style" | "head" => {}
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                self.close();
                let text = self.src.normalized_text(node);
                if text.is_empty() {
                    return;
                }
                let first = !self.has_content && self.out.is(self.container, "section");
                if first {
                    let title = self.out.append_element(self.container, "title");
                    self.out.append_text_element(title, "p", &text);
                    self.carry_id(node, None);
                } else {
                    let sub = self.out.append_text_element(self.container, "subtitle", &text);
                    self.carry_id(node, Some(sub));
                }
                self.has_content = true;
            }
            "p" => {
                self.close();
                let p = self.para();
                self.carry_id(node, Some(p));
                self.children_inline(node, p);
                self.close();
            }
            "br" => self.close(),
            "hr" => {
                self.close();
                self.out.append_element(self.container, "empty-line");
                self.has_content = true;
            }
            "img" | "image" => {
                self.close();
                if let Some(id) = self.image_id(node) {
                    let image = self.out.append_element(self.container, "image");
                    self.out.set_attr(image, "l:href", format!("#{id}"));
                    self.has_content = true;
                }
            }
            "pre" => {
                self.close();
                for line in self.src.text_content(node).lines() {
                    let p = self.out.append_element(self.container, "p");
                    self.out.append_text_element(p, "code", line);
                }
                self.has_content = true;
            }
            "blockquote" => {
                self.close();
                let cite = self.out.append_element(self.container, "cite");
                self.carry_id(node, Some(cite));
                let outer = std::mem::replace(&mut self.container, cite);
                self.children_block(node);
                self.close();
                self.container = outer;
                self.has_content = true;
            }
            "ul" | "ol" => {
                self.close();
                let ordered = local == "ol";
                let items: Vec<NodeId> = self
                    .src
                    .element_children(node)
                    .into_iter()
                    .filter(|&c| self.src.is(c, "li"))
                    .collect();
                for (i, li) in items.into_iter().enumerate() {
                    let p = self.para();
                    self.carry_id(li, Some(p));
                    let marker = if ordered { format!("{}. ", i + 1) } else { "\u{2022} ".to_string() };
                    self.out.append_text(p, &marker);
                    self.children_inline(li, p);
                    self.close();
                }
            }
            "table" => {
                self.close();
                let table = self.out.append_element(self.container, "table");
                for row in self.src.elements_by_name(node, "tr") {
                    let tr = self.out.append_element(table, "tr");
                    for cell in self.src.element_children(row) {
                        let kind = if self.src.is(cell, "th") { "th" } else { "td" };
                        let out_cell = self.out.append_element(tr, kind);
                        self.children_inline(cell, out_cell);
                    }
                }
                self.has_content = true;
            }
            "a" | "span" | "em" | "i" | "strong" | "b" | "u" | "s" | "strike" | "del" | "sub" | "sup" | "code"
            | "tt" | "cite" | "small" | "big" | "abbr" | "q" | "font" => {
                let p = self.para();
                self.inline(node, p);
            }
            _ => {
                self.close();
                self.carry_id(node, None);
                self.children_block(node);
                self.close();
            }
        }
    }

    fn children_inline(&mut self, node: NodeId, parent: NodeId) {
        let src = self.src;
        for &child in src.children(node) {
            self.inline(child, parent);
        }
    }

    fn wrap(&mut self, node: NodeId, parent: NodeId, tag: &str) {
        let el = self.out.append_element(parent, tag);
        self.children_inline(node, el);
    }

    fn inline(&mut self, node: NodeId, parent: NodeId) {
        let src = self.src;
        let local = match src.data(node) {
            NodeData::Text(text) => {
                self.out.append_text(parent, text);
                return;
            }
            NodeData::Element(el) => el.local_name().to_ascii_lowercase(),
            _ => return,
        };
        if self.out.is(parent, "p") {
            self.carry_id(node, Some(parent));
        }
        match local.as_str() {
            "script" | "style" => {}
            "em" | "i" | "cite" => self.wrap(node, parent, "emphasis"),
            "strong" | "b" => self.wrap(node, parent, "strong"),
            "s" | "strike" | "del" => self.wrap(node, parent, "strikethrough"),
            "sub" | "sup" | "code" => self.wrap(node, parent, &local),
            "tt" => self.wrap(node, parent, "code"),
            "br" => self.out.append_text(parent, " "),
            "img" | "image" => {
                if let Some(id) = self.image_id(node) {
                    let image = self.out.append_element(parent, "image");
                    self.out.set_attr(image, "l:href", format!("#{id}"));
                }
            }
            "a" => match src.attr(node, "href") {
                Some(href) if href.starts_with('#') || is_external(href) => {
                    let a = self.out.append_element(parent, "a");
                    self.out.set_attr(a, "l:href", href);
                    self.children_inline(node, a);
                }
                _ => self.children_inline(node, parent),
            },
            _ => self.children_inline(node, parent),
        }
    }

    /// Point links at ids that were folded into their section
    fn resolve_aliases(&mut self) {
        let present: HashSet<String> = self
            .out
            .descendants(self.out.root())
            .into_iter()
            .filter_map(|n| self.out.attr(n, "id").map(str::to_string))
            .collect();
        for node in self.out.descendants(self.out.root()) {
            let Some(target) = self.out.attr(node, "l:href").and_then(|h| h.strip_prefix('#')) else {
                continue;
            };
            if present.contains(target) || self.binaries.values().any(|b| b == target) {
                continue;
            }
            if let Some(section) = self.aliases.get(target).cloned() {
                self.out.set_attr(node, "l:href", format!("#{section}"));
            }
        }
    }
}

impl Encoder for Fb2Encoder {
    fn name(&self) -> &'static str {
        "fb2"
    }

    fn file_extension(&self) -> &'static str {
        "fb2"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["fb2"]
    }

    fn mime_type(&self) -> &'static str {
        "application/x-fictionbook+xml"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::choice(
            "fb2_sectionize",
            &["files", "nothing"],
            "files",
            "Write one section per input file, or a single section",
        )]
    }

    fn encode(&self, book: &mut Book, output: &Path, ctx: &StageContext) -> Result<()> {
        let merged = merge_spine(book, MERGED)?;
        let meta = book.metadata();
        let title = book_title(book);

        // binaries: every supported image the text uses, plus the cover
        let mut binaries: HashMap<String, String> = HashMap::new();
        let mut order = Vec::new();
        let mut used_ids = HashSet::new();
        let mut wanted: Vec<String> = merged
            .doc
            .descendants(merged.doc.root())
            .into_iter()
            .filter(|&n| merged.doc.is(n, "img") || merged.doc.is(n, "image"))
            .filter_map(|n| {
                let src = merged.doc.attr(n, "src").or_else(|| merged.doc.element(n)?.attr_local("href"))?;
                name_for_href(src, MERGED)
            })
            .collect();
        let cover = book.cover_name();
        wanted.extend(cover.clone());
        for name in wanted {
            if binaries.contains_key(&name) || !book.container.exists(&name) {
                continue;
            }
            let media = book.container.media_type(&name);
            if !is_fb2_image(&media) && !is_fb2_image(guess_media_type(&name)) {
                ctx.log.warn(format!("FB2 cannot embed {name} ({media}), dropping it"));
                continue;
            }
            let base = file_name(&name).replace(|c: char| !c.is_ascii_alphanumeric() && c != '.' && c != '_' && c != '-', "_");
            let mut id = base.clone();
            let mut n = 1;
            while !used_ids.insert(id.clone()) {
                id = format!("{n}_{base}");
                n += 1;
            }
            binaries.insert(name.clone(), id);
            order.push(name);
        }

        let (mut out, root) = Document::with_root("FictionBook", Flavor::Xml);
        out.set_attr(root, "xmlns", FB2_NS);
        out.set_attr(root, "xmlns:l", XLINK_NS);
        let cover_id = cover.as_ref().and_then(|c| binaries.get(c)).cloned();
        write_description(&mut out, root, &meta, &title, cover_id.as_deref());
        let body = out.append_element(root, "body");

        let mut writer = Writer {
            src: &merged.doc,
            out,
            binaries: &binaries,
            container: body,
            para: None,
            has_content: false,
            aliases: HashMap::new(),
            section_id: None,
        };
        let one_section = ctx.options.str("fb2_sectionize") == Some("nothing");
        if one_section {
            let section = writer.out.append_element(body, "section");
            writer.container = section;
        }
        for chapter in merged.doc.element_children(merged.body) {
            ctx.checkpoint()?;
            if !one_section {
                let section = writer.out.append_element(body, "section");
                writer.container = section;
                writer.has_content = false;
                writer.section_id = merged.doc.attr(chapter, "id").map(str::to_string);
                if let Some(id) = &writer.section_id {
                    writer.out.set_attr(section, "id", id.as_str());
                }
            } else {
                writer.carry_id(chapter, None);
            }
            writer.close();
            writer.children_block(chapter);
            writer.close();
        }
        // a section must hold at least one paragraph
        for section in writer.out.elements_by_name(body, "section") {
            let empty = writer
                .out
                .element_children(section)
                .iter()
                .all(|&c| writer.out.is(c, "title"));
            if empty {
                writer.out.append_element(section, "empty-line");
            }
        }
        writer.resolve_aliases();
        let mut out = writer.out;

        for name in &order {
            let data = book.container.read(name)?;
            let binary = out.append_text_element(root, "binary", &STANDARD.encode(&data));
            out.set_attr(binary, "id", binaries[name].as_str());
            out.set_attr(binary, "content-type", guess_media_type(name));
        }
        ctx.log.info(format!("fb2 with {} binaries", order.len()));
        std::fs::write(output, format!("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n{}", out.outer_xml(root)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Decoder, Fb2Decoder};
    use crate::transform::test_support::{book, context, xhtml};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x06\0\0\0";

    #[test]
    fn test_author_parts() {
        assert_eq!(
            author_parts("Leo Tolstoy"),
            vec![("first-name", "Leo".to_string()), ("last-name", "Tolstoy".to_string())]
        );
        assert_eq!(author_parts("Homer"), vec![("nickname", "Homer".to_string())]);
        assert_eq!(author_parts("J. R. R. Tolkien")[1], ("middle-name", "R. R.".to_string()));
    }

    #[test]
    fn test_fb2_output() {
        let mut book = book(&[
            (
                "a.xhtml",
                &xhtml(r##"<h1>First</h1><p>Hello <em>there</em> <a href="b.xhtml#end">jump</a></p><img src="pic.png"/>"##),
            ),
            ("b.xhtml", &xhtml(r#"<h1>Second</h1><blockquote><p>Quote</p></blockquote><p id="end">End</p>"#)),
        ]);
        book.container.add_name("pic.png", PNG, None, &[]).unwrap();
        let mut meta = book.metadata();
        meta.title = "Output Test".into();
        meta.authors = vec!["Ann Writer".into()];
        meta.set_series(Some("Tests".into()), Some(2.0));
        book.set_metadata(&meta);

        let encoder = Fb2Encoder::new();
        let (ctx, tmp) = context(encoder.options(), &[]);
        let out = tmp.path().join("out.fb2");
        encoder.encode(&mut book, &out, &ctx).unwrap();
        let xml = std::fs::read_to_string(&out).unwrap();
        assert!(xml.contains("<title><p>First</p></title>"));
        assert!(xml.contains("<p>Hello <emphasis>there</emphasis> <a l:href=\"#end\">jump</a></p>"));
        assert!(xml.contains("<cite><p>Quote</p></cite>"));
        assert!(xml.contains(r##"<image l:href="#pic.png"/>"##));
        assert!(xml.contains(r#"<binary id="pic.png" content-type="image/png">"#));

        let decoder = Fb2Decoder::new();
        let (ctx, _tmp2) = context(decoder.options(), &[]);
        let back = decoder.decode(&out, &ctx).unwrap();
        let meta = back.metadata();
        assert_eq!(meta.title, "Output Test");
        assert_eq!(meta.authors, vec!["Ann Writer"]);
        assert_eq!(meta.series.as_deref(), Some("Tests"));
        assert_eq!(back.spine_names().len(), 2);
    }
}
