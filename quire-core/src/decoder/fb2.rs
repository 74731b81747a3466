//! FictionBook 2 decoder.
//!
//! The `<description>` becomes the metadata record, every top level
//! `<section>` of the main body becomes one XHTML file, note bodies go to
//! `notes.xhtml` and `<binary>` payloads become manifest images.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use zip::ZipArchive;

use super::{corrupt, file_title, has_extension, is_zip, read_zip_entry, BookBuilder, Decoder};
use crate::container::text::decode_text;
use crate::dom::{Document, NodeData, NodeId};
use crate::error::{ParseError, Result};
use crate::patterns::UNSAFE_FILENAME;
use crate::pipeline::StageContext;
use crate::types::media::extension_for;
use crate::types::{parse_date, Book, Metadata, TocNode};

const STYLESHEET_NAME: &str = "fb2.css";

const STYLESHEET: &str = "\
.epigraph { margin-left: 30%; font-style: italic; }
.text-author { text-align: right; font-style: italic; }
.subtitle { text-align: center; font-weight: bold; }
.poem { margin: 1em 0 1em 10%; }
.stanza { margin-bottom: 1em; }
.stanza p { margin: 0; text-indent: 0; }
.empty-line { height: 1em; margin: 0; }
.image { text-align: center; }
a.noteref { vertical-align: super; font-size: 0.75em; }
";

/// Decoder for FB2 and zipped FB2 files
pub struct Fb2Decoder;

impl Fb2Decoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Fb2Decoder {
    fn default() -> Self {
        Self::new()
    }
}

fn child_text(doc: &Document, node: NodeId, local: &str) -> Option<String> {
    doc.child_named(node, local)
        .map(|n| doc.normalized_text(n))
        .filter(|t| !t.is_empty())
}

fn href_of(doc: &Document, node: NodeId) -> Option<&str> {
    doc.element(node)?.attr_local("href")
}

fn author_name(doc: &Document, author: NodeId) -> Option<String> {
    let parts: Vec<String> = ["first-name", "middle-name", "last-name"]
        .iter()
        .filter_map(|p| child_text(doc, author, p))
        .collect();
    if parts.is_empty() {
        child_text(doc, author, "nickname")
    } else {
        Some(parts.join(" "))
    }
}

/// Metadata from `<description>`. Returns the record and the binary id of
/// the cover image.
fn read_description(doc: &Document, fallback_title: &str) -> (Metadata, Option<String>) {
    let mut meta = Metadata {
        title: fallback_title.to_string(),
        ..Metadata::default()
    };
    let Some(root) = doc.document_element() else {
        return (meta, None);
    };
    let Some(desc) = doc.child_named(root, "description") else {
        return (meta, None);
    };
    let mut cover = None;
    if let Some(info) = doc.child_named(desc, "title-info") {
        if let Some(title) = child_text(doc, info, "book-title") {
            meta.title = title;
        }
        meta.authors = doc
            .children_named(info, "author")
            .into_iter()
            .filter_map(|a| author_name(doc, a))
            .collect();
        meta.tags = doc
            .children_named(info, "genre")
            .into_iter()
            .map(|g| doc.normalized_text(g))
            .filter(|g| !g.is_empty())
            .collect();
        if let Some(keywords) = child_text(doc, info, "keywords") {
            meta.tags.extend(keywords.split(',').map(|k| k.trim().to_string()).filter(|k| !k.is_empty()));
        }
        if let Some(annotation) = doc.child_named(info, "annotation") {
            let paragraphs: Vec<String> = doc
                .elements_by_name(annotation, "p")
                .into_iter()
                .map(|p| format!("<p>{}</p>", crate::dom::escape_text(&doc.normalized_text(p))))
                .collect();
            if !paragraphs.is_empty() {
                meta.comments = Some(paragraphs.concat());
            }
        }
        if let Some(lang) = child_text(doc, info, "lang") {
            meta.set_languages([lang]);
        }
        if let Some(date) = doc.child_named(info, "date") {
            let raw = doc
                .attr(date, "value")
                .map(str::to_string)
                .unwrap_or_else(|| doc.normalized_text(date));
            meta.pubdate = parse_date(&raw);
        }
        if let Some(seq) = doc.child_named(info, "sequence") {
            let name = doc.attr(seq, "name").map(str::trim).filter(|n| !n.is_empty());
            let number = doc.attr(seq, "number").and_then(|n| n.trim().parse::<f64>().ok());
            meta.set_series(name.map(str::to_string), number.or(Some(1.0)));
        }
        cover = doc
            .child_named(info, "coverpage")
            .and_then(|c| doc.find_first(c, "image"))
            .and_then(|i| href_of(doc, i))
            .map(|h| h.trim_start_matches('#').to_string());
    }
    if let Some(publish) = doc.child_named(desc, "publish-info") {
        meta.publisher = child_text(doc, publish, "publisher");
        if let Some(isbn) = child_text(doc, publish, "isbn") {
            meta.set_identifier("isbn", isbn.replace(['-', ' '], ""));
        }
        if meta.pubdate.is_none() {
            meta.pubdate = child_text(doc, publish, "year").and_then(|y| parse_date(&y));
        }
    }
    if let Some(id) = doc
        .child_named(desc, "document-info")
        .and_then(|d| child_text(doc, d, "id"))
    {
        meta.set_identifier("fb2", id);
    }
    (meta, cover)
}

/// Shared state while turning FB2 markup into XHTML
struct Render<'a> {
    src: &'a Document,
    /// Binary id to manifest name
    images: &'a HashMap<String, String>,
    /// Element id to the file it ends up in
    targets: &'a HashMap<String, String>,
    /// File being written
    current: String,
}

impl Render<'_> {
    fn link(&self, href: &str) -> String {
        match href.strip_prefix('#') {
            Some(id) => match self.targets.get(id) {
                Some(file) if *file == self.current => format!("#{id}"),
                Some(file) => format!("{file}#{id}"),
                None => format!("#{id}"),
            },
            None => href.to_string(),
        }
    }

    fn image(&self, out: &mut Document, parent: NodeId, node: NodeId) -> Option<NodeId> {
        let id = href_of(self.src, node)?.trim_start_matches('#');
        let name = self.images.get(id)?;
        let img = out.create_element_with("img", &[("src", name), ("alt", self.src.attr(node, "alt").unwrap_or(""))]);
        out.append(parent, img);
        Some(img)
    }

    fn children(&self, out: &mut Document, parent: NodeId, node: NodeId, depth: usize) {
        for &child in self.src.children(node) {
            self.node(out, parent, child, depth);
        }
    }

    fn wrap(&self, out: &mut Document, parent: NodeId, node: NodeId, tag: &str, class: Option<&str>, depth: usize) -> NodeId {
        let el = out.append_element(parent, tag);
        if let Some(class) = class {
            out.set_attr(el, "class", class);
        }
        if let Some(id) = self.src.attr(node, "id") {
            out.set_attr(el, "id", id);
        }
        self.children(out, el, node, depth);
        el
    }

    fn node(&self, out: &mut Document, parent: NodeId, node: NodeId, depth: usize) {
        let local = match self.src.data(node) {
            NodeData::Text(text) => {
                out.append_text(parent, text);
                return;
            }
            NodeData::Element(el) => el.local_name().to_string(),
            _ => return,
        };
        match local.as_str() {
            "section" => {
                self.wrap(out, parent, node, "div", Some("section"), depth + 1);
            }
            "title" => {
                let h = out.append_element(parent, &format!("h{}", depth.clamp(1, 6)));
                if let Some(id) = self.src.attr(node, "id") {
                    out.set_attr(h, "id", id);
                }
                let lines: Vec<NodeId> = self.src.children_named(node, "p");
                for (i, &p) in lines.iter().enumerate() {
                    if i > 0 {
                        out.append_element(h, "br");
                    }
                    self.children(out, h, p, depth);
                }
            }
            "p" => {
                self.wrap(out, parent, node, "p", None, depth);
            }
            "subtitle" => {
                self.wrap(out, parent, node, "p", Some("subtitle"), depth);
            }
            "text-author" => {
                self.wrap(out, parent, node, "p", Some("text-author"), depth);
            }
            "date" => {
                self.wrap(out, parent, node, "p", Some("date"), depth);
            }
            "empty-line" => {
                let p = out.append_element(parent, "p");
                out.set_attr(p, "class", "empty-line");
            }
            "epigraph" => {
                self.wrap(out, parent, node, "blockquote", Some("epigraph"), depth);
            }
            "cite" => {
                self.wrap(out, parent, node, "blockquote", Some("cite"), depth);
            }
            "poem" => {
                self.wrap(out, parent, node, "div", Some("poem"), depth);
            }
            "stanza" => {
                self.wrap(out, parent, node, "div", Some("stanza"), depth);
            }
            "v" => {
                self.wrap(out, parent, node, "p", Some("verse"), depth);
            }
            "emphasis" => {
                self.wrap(out, parent, node, "em", None, depth);
            }
            "strong" => {
                self.wrap(out, parent, node, "strong", None, depth);
            }
            "strikethrough" => {
                self.wrap(out, parent, node, "del", None, depth);
            }
            "sub" | "sup" | "code" | "table" | "tr" | "td" | "th" => {
                let el = self.wrap(out, parent, node, &local, None, depth);
                for attr in ["colspan", "rowspan", "align"] {
                    if let Some(v) = self.src.attr(node, attr) {
                        out.set_attr(el, attr, v);
                    }
                }
            }
            "style" => {
                self.wrap(out, parent, node, "span", self.src.attr(node, "name"), depth);
            }
            "a" => {
                let a = self.wrap(out, parent, node, "a", None, depth);
                if let Some(href) = href_of(self.src, node) {
                    out.set_attr(a, "href", self.link(href));
                }
                if self.src.attr(node, "type") == Some("note") {
                    out.set_attr(a, "class", "noteref");
                }
            }
            "image" => {
                let inline = self
                    .src
                    .parent(node)
                    .and_then(|p| self.src.local_name(p))
                    .is_some_and(|p| matches!(p, "p" | "v" | "emphasis" | "strong" | "a" | "subtitle"));
                if inline {
                    self.image(out, parent, node);
                } else {
                    let div = out.append_element(parent, "div");
                    out.set_attr(div, "class", "image");
                    if let Some(id) = self.src.attr(node, "id") {
                        out.set_attr(div, "id", id);
                    }
                    self.image(out, div, node);
                }
            }
            "annotation" => {
                self.wrap(out, parent, node, "div", Some("annotation"), depth);
            }
            _ => self.children(out, parent, node, depth),
        }
    }
}

fn section_title(doc: &Document, section: NodeId) -> Option<String> {
    let title = doc.child_named(section, "title")?;
    let text = doc
        .children_named(title, "p")
        .into_iter()
        .map(|p| doc.normalized_text(p))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!text.is_empty()).then_some(text)
}

fn section_toc(doc: &Document, section: NodeId, file: &str) -> Option<TocNode> {
    let title = section_title(doc, section)?;
    let mut node = TocNode::new(title, file);
    if let Some(id) = doc.attr(section, "id") {
        node = node.with_fragment(id);
    }
    for child in doc.children_named(section, "section") {
        if let Some(sub) = section_toc(doc, child, file) {
            node.add_child(sub);
        }
    }
    Some(node)
}

/// Read the FB2 text of a plain or zipped file
fn read_source(input: &Path) -> Result<String> {
    let bytes = std::fs::read(input)?;
    if !is_zip(&bytes) {
        return Ok(decode_text(&bytes));
    }
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|e| corrupt(input, e))?;
    let name = archive
        .file_names()
        .find(|n| n.to_ascii_lowercase().ends_with(".fb2"))
        .map(str::to_string)
        .ok_or_else(|| ParseError::InvalidEbook(format!("{} holds no .fb2 file", input.display())))?;
    Ok(decode_text(&read_zip_entry(&mut archive, &name)?))
}

impl Decoder for Fb2Decoder {
    fn name(&self) -> &'static str {
        "fb2"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["fb2", "fbz"]
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &["application/x-fictionbook+xml"]
    }

    fn sniff(&self, path: &Path, head: &[u8]) -> bool {
        if is_zip(head) {
            return has_extension(path, &["fbz"]);
        }
        let text = String::from_utf8_lossy(&head[..head.len().min(1024)]);
        text.contains("<FictionBook")
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let text = read_source(input)?;
        let src = Document::parse_xml(&text)?;
        let root = src
            .document_element()
            .filter(|&r| src.local_name(r) == Some("FictionBook"))
            .ok_or_else(|| corrupt(input, "not a FictionBook document"))?;
        let (meta, cover_id) = read_description(&src, &file_title(input));
        let lang = meta.language().map(str::to_string);
        let mut builder = BookBuilder::new(ctx)?;

        let mut images = HashMap::new();
        for binary in src.children_named(root, "binary") {
            let Some(id) = src.attr(binary, "id") else {
                continue;
            };
            let payload: String = src.text_content(binary).split_whitespace().collect();
            let data = match STANDARD.decode(payload.as_bytes()) {
                Ok(data) => data,
                Err(e) => {
                    ctx.log.warn(format!("skipping undecodable binary '{id}': {e}"));
                    continue;
                }
            };
            let media = src
                .attr(binary, "content-type")
                .map(crate::types::media::canonical_media_type)
                .or_else(|| crate::types::media::sniff_image(&data).map(str::to_string))
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let stem = UNSAFE_FILENAME.replace_all(id, "_");
            let stem = stem.rsplit_once('.').map_or(stem.as_ref(), |(s, _)| s);
            let name = format!("images/{stem}.{}", extension_for(&media));
            let name = builder.add_resource(&name, &data, Some(&media))?;
            images.insert(id.to_string(), name);
        }
        builder.add_resource(STYLESHEET_NAME, STYLESHEET.as_bytes(), Some("text/css"))?;

        // decide file names first so links between files can be resolved
        let bodies = src.children_named(root, "body");
        let mut files: Vec<(String, NodeId, bool)> = Vec::new();
        let mut targets: HashMap<String, String> = HashMap::new();
        for &body in &bodies {
            let notes = src.attr(body, "name").is_some();
            let units: Vec<NodeId> = if notes {
                vec![body]
            } else {
                let sections = src.children_named(body, "section");
                if sections.is_empty() {
                    vec![body]
                } else {
                    sections
                }
            };
            for unit in units {
                let file = if notes {
                    format!("{}.xhtml", UNSAFE_FILENAME.replace_all(src.attr(body, "name").unwrap_or("notes"), "_"))
                } else {
                    format!("chapter{:03}.xhtml", files.len() + 1)
                };
                for n in src.descendants(unit) {
                    if let Some(id) = src.attr(n, "id") {
                        targets.insert(id.to_string(), file.clone());
                    }
                }
                files.push((file, unit, notes));
            }
        }
        if files.is_empty() {
            return Err(ParseError::InvalidEbook(format!("{} has no body", input.display())).into());
        }

        // body-level title and epigraphs go in front of the first chapter
        let main = bodies.iter().copied().find(|&b| src.attr(b, "name").is_none());
        for (i, (file, unit, notes)) in files.iter().enumerate() {
            ctx.checkpoint()?;
            let title = section_title(&src, *unit).unwrap_or_else(|| meta.title.clone());
            let (mut out, body) = Document::xhtml_skeleton(&title, lang.as_deref());
            if let Some(head) = out.head() {
                let link = out.create_element_with(
                    "link",
                    &[("rel", "stylesheet"), ("type", "text/css"), ("href", STYLESHEET_NAME)],
                );
                out.append(head, link);
            }
            let render = Render {
                src: &src,
                images: &images,
                targets: &targets,
                current: file.clone(),
            };
            if i == 0 && !notes {
                if let Some(main) = main.filter(|&m| m != *unit) {
                    for &child in src.children(main) {
                        if matches!(src.local_name(child), Some("title" | "epigraph" | "image")) {
                            render.node(&mut out, body, child, 1);
                        }
                    }
                }
            }
            if *unit == main.unwrap_or(*unit) || *notes {
                render.children(&mut out, body, *unit, 1);
            } else {
                render.node(&mut out, body, *unit, 0);
            }
            let name = builder.add_document(file, &out)?;
            if *notes {
                continue;
            }
            if let Some(entry) = section_toc(&src, *unit, &name) {
                builder.toc_mut().add_child(entry);
            }
        }

        if let Some(name) = cover_id.and_then(|id| images.get(&id)) {
            builder.set_cover(name);
        }
        ctx.log.info(format!("read {} files and {} images", files.len(), images.len()));
        builder.finish(&meta)
    }
}
