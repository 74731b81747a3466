//! DOCX decoder.
//!
//! Reads `word/document.xml` together with its style table, numbering
//! definitions, relationships and footnotes, and writes one XHTML file per
//! section break (`w:sectPr`).

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use zip::ZipArchive;

use super::{corrupt, file_title, first_zip_entry, has_extension, is_zip, read_zip_entry, BookBuilder, Decoder};
use crate::container::paths;
use crate::container::text::decode_text;
use crate::dom::{Document, NodeId};
use crate::error::{ParseError, Result};
use crate::pipeline::StageContext;
use crate::transform::set_style;
use crate::types::{parse_date, Book, Metadata, TocNode};

const DOCUMENT_XML: &str = "word/document.xml";

/// Decoder for Word 2007+ documents
pub struct DocxDecoder;

impl DocxDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DocxDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// `w:val`-style attribute lookup ignoring the namespace prefix
fn wattr<'a>(doc: &'a Document, node: NodeId, local: &str) -> Option<&'a str> {
    doc.element(node)?.attr_local(local)
}

fn child_val<'a>(doc: &'a Document, node: NodeId, local: &str) -> Option<&'a str> {
    doc.child_named(node, local).and_then(|c| wattr(doc, c, "val"))
}

/// On/off properties such as `<w:b/>` or `<w:b w:val="0"/>`
fn toggle(doc: &Document, props: NodeId, local: &str) -> bool {
    doc.child_named(props, local)
        .is_some_and(|p| !matches!(wattr(doc, p, "val"), Some("0" | "false" | "none")))
}

fn read_xml(archive: &mut ZipArchive<File>, name: &str) -> Result<Option<Document>> {
    if archive.by_name(name).is_err() {
        return Ok(None);
    }
    let text = decode_text(&read_zip_entry(archive, name)?);
    Ok(Some(Document::parse_xml(&text)?))
}

/// Heading level of paragraph styles, by style id
fn heading_styles(styles: Option<&Document>) -> HashMap<String, u8> {
    let mut out = HashMap::new();
    let Some(doc) = styles else {
        return out;
    };
    for style in doc.elements_by_name(doc.root(), "style") {
        let Some(id) = wattr(doc, style, "styleId") else {
            continue;
        };
        let name = child_val(doc, style, "name").unwrap_or(id).to_ascii_lowercase();
        let level = if name == "title" {
            Some(1)
        } else {
            name.strip_prefix("heading")
                .map(str::trim)
                .and_then(|n| n.parse::<u8>().ok())
                .or_else(|| {
                    doc.find_first(style, "outlineLvl")
                        .and_then(|o| wattr(doc, o, "val"))
                        .and_then(|v| v.parse::<u8>().ok())
                        .map(|v| v + 1)
                })
        };
        if let Some(level) = level {
            out.insert(id.to_string(), level.clamp(1, 6));
        }
    }
    out
}

/// Whether each `(numId, ilvl)` list is ordered
fn list_kinds(numbering: Option<&Document>) -> HashMap<(String, String), bool> {
    let mut out = HashMap::new();
    let Some(doc) = numbering else {
        return out;
    };
    let mut abstract_levels: HashMap<String, Vec<(String, bool)>> = HashMap::new();
    for abs in doc.elements_by_name(doc.root(), "abstractNum") {
        let Some(id) = wattr(doc, abs, "abstractNumId") else {
            continue;
        };
        let levels = doc
            .children_named(abs, "lvl")
            .into_iter()
            .map(|lvl| {
                let ilvl = wattr(doc, lvl, "ilvl").unwrap_or("0").to_string();
                let ordered = child_val(doc, lvl, "numFmt") != Some("bullet");
                (ilvl, ordered)
            })
            .collect();
        abstract_levels.insert(id.to_string(), levels);
    }
    for num in doc.elements_by_name(doc.root(), "num") {
        let (Some(num_id), Some(abs)) = (wattr(doc, num, "numId"), child_val(doc, num, "abstractNumId")) else {
            continue;
        };
        for (ilvl, ordered) in abstract_levels.get(abs).into_iter().flatten() {
            out.insert((num_id.to_string(), ilvl.clone()), *ordered);
        }
    }
    out
}

fn relationships(rels: Option<&Document>) -> HashMap<String, (String, bool)> {
    let mut out = HashMap::new();
    let Some(doc) = rels else {
        return out;
    };
    for rel in doc.elements_by_name(doc.root(), "Relationship") {
        if let (Some(id), Some(target)) = (doc.attr(rel, "Id"), doc.attr(rel, "Target")) {
            let external = doc.attr(rel, "TargetMode") == Some("External");
            out.insert(id.to_string(), (target.to_string(), external));
        }
    }
    out
}

fn core_metadata(core: Option<&Document>, fallback_title: &str) -> Metadata {
    let mut meta = Metadata {
        title: fallback_title.to_string(),
        ..Metadata::default()
    };
    let Some(doc) = core else {
        return meta;
    };
    let text = |local: &str| {
        doc.find_first(doc.root(), local)
            .map(|n| doc.normalized_text(n))
            .filter(|t| !t.is_empty())
    };
    if let Some(title) = text("title") {
        meta.title = title;
    }
    if let Some(creator) = text("creator") {
        meta.authors = creator
            .split([';', '&'])
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
    }
    meta.comments = text("description");
    if let Some(keywords) = text("keywords") {
        meta.tags = keywords
            .split([',', ';'])
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(lang) = text("language") {
        meta.set_languages([lang]);
    }
    meta.pubdate = text("created").and_then(|d| parse_date(&d));
    meta
}

/// Writes DOCX body content into a sequence of XHTML files
struct Writer<'a> {
    src: &'a Document,
    headings: &'a HashMap<String, u8>,
    lists: &'a HashMap<(String, String), bool>,
    rels: &'a HashMap<String, (String, bool)>,
    /// Relationship id to manifest name of extracted images
    images: HashMap<String, String>,
    /// Footnote id to the file that references it
    footnote_refs: HashMap<String, String>,
    title: String,
    lang: Option<String>,
    doc: Document,
    body: NodeId,
    /// Open lists: (list element, level, ordered)
    list_stack: Vec<(NodeId, usize, bool)>,
    parts: Vec<Document>,
}

impl<'a> Writer<'a> {
    fn part_name(index: usize) -> String {
        format!("part{:03}.xhtml", index + 1)
    }

    fn current_name(&self) -> String {
        Self::part_name(self.parts.len())
    }

    fn break_section(&mut self) {
        let (doc, body) = Document::xhtml_skeleton(&self.title, self.lang.as_deref());
        let finished = std::mem::replace(&mut self.doc, doc);
        self.body = body;
        self.list_stack.clear();
        self.parts.push(finished);
    }

    fn block(&mut self, node: NodeId, parent: NodeId) {
        match self.src.local_name(node) {
            Some("p") => self.paragraph(node, parent),
            Some("tbl") => {
                self.list_stack.clear();
                self.table(node, parent);
            }
            Some("sdt") => {
                if let Some(content) = self.src.child_named(node, "sdtContent") {
                    for &child in self.src.children(content) {
                        self.block(child, parent);
                    }
                }
            }
            _ => {}
        }
    }

    fn table(&mut self, tbl: NodeId, parent: NodeId) {
        let table = self.doc.append_element(parent, "table");
        for tr in self.src.children_named(tbl, "tr") {
            let row = self.doc.append_element(table, "tr");
            for tc in self.src.children_named(tr, "tc") {
                let cell = self.doc.append_element(row, "td");
                if let Some(span) = self
                    .src
                    .child_named(tc, "tcPr")
                    .and_then(|p| child_val(self.src, p, "gridSpan"))
                {
                    self.doc.set_attr(cell, "colspan", span);
                }
                for &child in self.src.children(tc) {
                    self.block(child, cell);
                }
            }
        }
    }

    /// Parent for a list item at `level`, opening and closing lists as needed
    fn list_item(&mut self, level: usize, ordered: bool) -> NodeId {
        while self.list_stack.last().is_some_and(|&(_, l, o)| l > level || (l == level && o != ordered)) {
            self.list_stack.pop();
        }
        while self.list_stack.last().map_or(true, |&(_, l, _)| l < level) {
            let parent = match self.list_stack.last() {
                Some(&(list, _, _)) => self
                    .doc
                    .element_children(list)
                    .last()
                    .copied()
                    .unwrap_or(list),
                None => self.body,
            };
            let list = self.doc.append_element(parent, if ordered { "ol" } else { "ul" });
            let depth = self.list_stack.last().map_or(level, |&(_, l, _)| l + 1).min(level);
            self.list_stack.push((list, depth, ordered));
            if depth == level {
                break;
            }
        }
        let list = self.list_stack.last().map_or(self.body, |&(list, _, _)| list);
        self.doc.append_element(list, "li")
    }

    fn paragraph(&mut self, p: NodeId, parent: NodeId) {
        let src = self.src;
        let props = src.child_named(p, "pPr");
        let style = props.and_then(|pp| child_val(src, pp, "pStyle")).unwrap_or("");
        let numbering = props
            .and_then(|pp| src.child_named(pp, "numPr"))
            .and_then(|np| {
                let num = child_val(src, np, "numId")?;
                let ilvl = child_val(src, np, "ilvl").unwrap_or("0");
                (num != "0").then(|| (num.to_string(), ilvl.to_string()))
            });

        let in_body = parent == self.body;
        let target = match (&numbering, self.headings.get(style)) {
            (_, Some(&level)) => {
                self.list_stack.clear();
                self.doc.append_element(parent, &format!("h{level}"))
            }
            (Some((num, ilvl)), None) if in_body => {
                let ordered = self.lists.get(&(num.clone(), ilvl.clone())).copied().unwrap_or(false);
                let level = ilvl.parse().unwrap_or(0);
                self.list_item(level, ordered)
            }
            _ => {
                if in_body {
                    self.list_stack.clear();
                }
                self.doc.append_element(parent, "p")
            }
        };
        if !style.is_empty() && !self.headings.contains_key(style) {
            self.doc.set_attr(target, "class", style);
        }
        if let Some(align) = props.and_then(|pp| child_val(src, pp, "jc")) {
            let align = match align {
                "center" => Some("center"),
                "right" | "end" => Some("right"),
                "both" | "distribute" => Some("justify"),
                _ => None,
            };
            if let Some(align) = align {
                set_style(&mut self.doc, target, "text-align", align);
            }
        }
        self.inline_children(p, target);

        if in_body && props.and_then(|pp| src.child_named(pp, "sectPr")).is_some() {
            self.break_section();
        }
    }

    fn inline_children(&mut self, node: NodeId, parent: NodeId) {
        for &child in self.src.children(node) {
            match self.src.local_name(child) {
                Some("r") => self.run(child, parent),
                Some("hyperlink") => {
                    let href = match (wattr(self.src, child, "id"), wattr(self.src, child, "anchor")) {
                        (_, Some(anchor)) => Some(format!("#{anchor}")),
                        (Some(rid), None) => self.rels.get(rid).map(|(t, _)| t.clone()),
                        _ => None,
                    };
                    let a = self.doc.append_element(parent, "a");
                    if let Some(href) = href {
                        self.doc.set_attr(a, "href", href);
                    }
                    self.inline_children(child, a);
                }
                Some("bookmarkStart") => {
                    if let Some(name) = wattr(self.src, child, "name").filter(|n| *n != "_GoBack") {
                        let anchor = self.doc.append_element(parent, "a");
                        self.doc.set_attr(anchor, "id", name);
                    }
                }
                Some("smartTag" | "ins" | "fldSimple") => self.inline_children(child, parent),
                _ => {}
            }
        }
    }

    fn run(&mut self, r: NodeId, parent: NodeId) {
        let src = self.src;
        let mut target = parent;
        if let Some(props) = src.child_named(r, "rPr") {
            let wrappers = [
                ("b", "strong"),
                ("i", "em"),
                ("u", "u"),
                ("strike", "del"),
            ];
            for (prop, tag) in wrappers {
                if toggle(src, props, prop) {
                    target = self.doc.append_element(target, tag);
                }
            }
            match child_val(src, props, "vertAlign") {
                Some("superscript") => target = self.doc.append_element(target, "sup"),
                Some("subscript") => target = self.doc.append_element(target, "sub"),
                _ => {}
            }
        }
        for &child in src.children(r) {
            match src.local_name(child) {
                Some("t") => self.doc.append_text(target, &src.text_content(child)),
                Some("tab") => self.doc.append_text(target, "\t"),
                Some("br") if wattr(src, child, "type") != Some("page") => {
                    self.doc.append_element(target, "br");
                }
                Some("drawing" | "pict") => {
                    for blip in src
                        .descendants(child)
                        .into_iter()
                        .filter(|&n| matches!(src.local_name(n), Some("blip" | "imagedata")))
                    {
                        let rid = wattr(src, blip, "embed").or_else(|| wattr(src, blip, "id"));
                        if let Some(name) = rid.and_then(|rid| self.images.get(rid)) {
                            let img = self.doc.create_element_with("img", &[("src", name), ("alt", "")]);
                            self.doc.append(target, img);
                        }
                    }
                }
                Some("footnoteReference") => {
                    if let Some(id) = wattr(src, child, "id") {
                        let a = self.doc.append_element(target, "a");
                        self.doc.set_attr(a, "href", format!("footnotes.xhtml#fn{id}"));
                        self.doc.set_attr(a, "id", format!("fnref{id}"));
                        self.doc.set_attr(a, "class", "noteref");
                        self.doc.append_text_element(a, "sup", id);
                        self.footnote_refs.insert(id.to_string(), self.current_name());
                    }
                }
                _ => {}
            }
        }
        // drop formatting wrappers that ended up empty
        let mut node = target;
        while node != parent && self.doc.children(node).is_empty() {
            let up = self.doc.parent(node).unwrap_or(parent);
            self.doc.detach(node);
            node = up;
        }
    }
}

fn is_docx(head: &[u8]) -> bool {
    first_zip_entry(head).is_some_and(|n| n == b"[Content_Types].xml")
        && head.windows(5).any(|w| w == b"word/")
}

impl Decoder for DocxDecoder {
    fn name(&self) -> &'static str {
        "docx"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["docx", "docm"]
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &["application/vnd.openxmlformats-officedocument.wordprocessingml.document"]
    }

    fn sniff(&self, path: &Path, head: &[u8]) -> bool {
        is_docx(head) || (is_zip(head) && has_extension(path, &["docx", "docm"]))
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let mut archive = ZipArchive::new(File::open(input)?).map_err(|e| corrupt(input, e))?;
        let document = read_xml(&mut archive, DOCUMENT_XML)?
            .ok_or_else(|| ParseError::InvalidEbook(format!("{} has no {DOCUMENT_XML}", input.display())))?;
        let styles = read_xml(&mut archive, "word/styles.xml")?;
        let numbering = read_xml(&mut archive, "word/numbering.xml")?;
        let rels = read_xml(&mut archive, "word/_rels/document.xml.rels")?;
        let footnotes = read_xml(&mut archive, "word/footnotes.xml")?;
        let core = read_xml(&mut archive, "docProps/core.xml")?;

        let meta = core_metadata(core.as_ref(), &file_title(input));
        let lang = meta.language().map(str::to_string);
        let headings = heading_styles(styles.as_ref());
        let lists = list_kinds(numbering.as_ref());
        let rels = relationships(rels.as_ref());
        let mut builder = BookBuilder::new(ctx)?;

        let mut images = HashMap::new();
        for (rid, (target, external)) in &rels {
            if *external {
                continue;
            }
            let Some(entry) = paths::name_for_href(target, "word/") else {
                continue;
            };
            let is_media = entry.starts_with("word/media/") || entry.starts_with("media/");
            if !is_media {
                continue;
            }
            let data = match read_zip_entry(&mut archive, &entry) {
                Ok(data) => data,
                Err(e) => {
                    ctx.log.warn(format!("missing image {entry}: {e}"));
                    continue;
                }
            };
            let stem = paths::file_name(&entry);
            let stem = stem.rsplit_once('.').map_or(stem, |(s, _)| s);
            match builder.add_image(&format!("images/{stem}"), &data)? {
                Some(name) => {
                    images.insert(rid.clone(), name);
                }
                None => ctx.log.warn(format!("skipping {entry}: not a supported image")),
            }
        }

        let (doc, body) = Document::xhtml_skeleton(&meta.title, lang.as_deref());
        let mut writer = Writer {
            src: &document,
            headings: &headings,
            lists: &lists,
            rels: &rels,
            images,
            footnote_refs: HashMap::new(),
            title: meta.title.clone(),
            lang: lang.clone(),
            doc,
            body,
            list_stack: Vec::new(),
            parts: Vec::new(),
        };
        let src_body = document
            .document_element()
            .and_then(|d| document.child_named(d, "body"))
            .ok_or_else(|| corrupt(input, "document has no body"))?;
        for &child in document.children(src_body) {
            ctx.checkpoint()?;
            let body = writer.body;
            writer.block(child, body);
        }
        if !writer.doc.children(writer.body).is_empty() || writer.parts.is_empty() {
            writer.break_section();
        }

        let footnote_refs = std::mem::take(&mut writer.footnote_refs);
        let parts = std::mem::take(&mut writer.parts);
        ctx.log.info(format!("read {} sections and {} images", parts.len(), writer.images.len()));
        for (i, mut part) in parts.into_iter().enumerate() {
            let mut headings = Vec::new();
            for h in part.descendants(part.root()) {
                if part.is(h, "h1") || part.is(h, "h2") {
                    let title = part.normalized_text(h);
                    if !title.is_empty() {
                        headings.push((title, part.ensure_id(h, "heading")));
                    }
                }
            }
            let name = builder.add_document(&Writer::part_name(i), &part)?;
            for (title, id) in headings {
                builder.toc_mut().add_child(TocNode::new(title, name.clone()).with_fragment(id));
            }
        }

        if let (Some(notes), false) = (footnotes.as_ref(), footnote_refs.is_empty()) {
            let (doc, body) = Document::xhtml_skeleton("Notes", lang.as_deref());
            let mut note_writer = Writer {
                src: notes,
                headings: &headings,
                lists: &lists,
                rels: &rels,
                images: HashMap::new(),
                footnote_refs: HashMap::new(),
                title: "Notes".to_string(),
                lang: lang.clone(),
                doc,
                body,
                list_stack: Vec::new(),
                parts: Vec::new(),
            };
            for note in notes.elements_by_name(notes.root(), "footnote") {
                let Some(id) = wattr(notes, note, "id") else {
                    continue;
                };
                let Some(referrer) = footnote_refs.get(id) else {
                    continue;
                };
                let doc = &mut note_writer.doc;
                let aside = doc.append_element(body, "div");
                doc.set_attr(aside, "id", format!("fn{id}"));
                doc.set_attr(aside, "class", "footnote");
                let back = doc.append_element(aside, "a");
                doc.set_attr(back, "href", format!("{referrer}#fnref{id}"));
                doc.append_text(back, id);
                for &child in notes.children(note) {
                    note_writer.block(child, aside);
                }
            }
            let doc = note_writer.doc;
            builder.add_document("footnotes.xhtml", &doc)?;
        }

        builder.finish(&meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::context;
    use std::io::Write;

    const W: &str = r#"xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships""#;

    fn docx(path: &Path) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        let opts = zip::write::SimpleFileOptions::default();
        let mut add = |name: &str, body: String| {
            zip.start_file(name, opts).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        };
        add("[Content_Types].xml", "<Types/>".into());
        add(
            "word/document.xml",
            format!(
                r#"<w:document {W}><w:body>
<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Start</w:t></w:r></w:p>
<w:p><w:r><w:rPr><w:b/></w:rPr><w:t>Bold</w:t></w:r><w:r><w:t xml:space="preserve"> text</w:t></w:r><w:r><w:footnoteReference w:id="1"/></w:r></w:p>
<w:p><w:pPr><w:numPr><w:ilvl w:val="0"/><w:numId w:val="1"/></w:numPr></w:pPr><w:r><w:t>one</w:t></w:r></w:p>
<w:p><w:pPr><w:numPr><w:ilvl w:val="1"/><w:numId w:val="1"/></w:numPr></w:pPr><w:r><w:t>nested</w:t></w:r></w:p>
<w:p><w:pPr><w:sectPr/></w:pPr><w:hyperlink r:id="rId2"><w:r><w:t>link</w:t></w:r></w:hyperlink></w:p>
<w:p><w:pPr><w:pStyle w:val="Heading1"/></w:pPr><w:r><w:t>Next</w:t></w:r></w:p>
<w:tbl><w:tr><w:tc><w:p><w:r><w:t>cell</w:t></w:r></w:p></w:tc></w:tr></w:tbl>
<w:sectPr/></w:body></w:document>"#
            ),
        );
        add(
            "word/styles.xml",
            format!(r#"<w:styles {W}><w:style w:type="paragraph" w:styleId="Heading1"><w:name w:val="heading 1"/></w:style></w:styles>"#),
        );
        add(
            "word/numbering.xml",
            format!(
                r#"<w:numbering {W}><w:abstractNum w:abstractNumId="0"><w:lvl w:ilvl="0"><w:numFmt w:val="bullet"/></w:lvl><w:lvl w:ilvl="1"><w:numFmt w:val="bullet"/></w:lvl></w:abstractNum><w:num w:numId="1"><w:abstractNumId w:val="0"/></w:num></w:numbering>"#
            ),
        );
        add(
            "word/_rels/document.xml.rels",
            r#"<Relationships><Relationship Id="rId2" Type="hyperlink" Target="https://example.com" TargetMode="External"/></Relationships>"#.into(),
        );
        add(
            "word/footnotes.xml",
            format!(r#"<w:footnotes {W}><w:footnote w:id="1"><w:p><w:r><w:t>The note.</w:t></w:r></w:p></w:footnote></w:footnotes>"#),
        );
        add(
            "docProps/core.xml",
            r#"<cp:coreProperties xmlns:cp="c" xmlns:dc="http://purl.org/dc/elements/1.1/"><dc:title>Report</dc:title><dc:creator>Ann Lee</dc:creator></cp:coreProperties>"#.into(),
        );
        zip.finish().unwrap();
    }

    #[test]
    fn test_docx_sections_lists_and_notes() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("report.docx");
        docx(&input);
        let decoder = DocxDecoder::new();
        let head = std::fs::read(&input).unwrap();
        assert!(decoder.sniff(Path::new("x"), &head[..head.len().min(4096)]));
        let (ctx, _tmp) = context(Vec::new(), &[]);
        let mut book = decoder.decode(&input, &ctx).unwrap();

        assert_eq!(book.spine_names(), vec!["part001.xhtml", "part002.xhtml", "footnotes.xhtml"]);
        let meta = book.metadata();
        assert_eq!(meta.title, "Report");
        assert_eq!(meta.authors, vec!["Ann Lee"]);

        let one = book.container.read_text("part001.xhtml").unwrap();
        assert!(one.contains("<strong>Bold</strong> text"));
        assert!(one.contains(r#"href="footnotes.xhtml#fn1""#));
        assert!(one.contains("<ul><li>one<ul><li>nested</li></ul></li></ul>"));
        assert!(one.contains(r#"<a href="https://example.com">link</a>"#));
        let two = book.container.read_text("part002.xhtml").unwrap();
        assert!(two.contains("<td><p>cell</p></td>"));
        let notes = book.container.read_text("footnotes.xhtml").unwrap();
        assert!(notes.contains(r#"href="part001.xhtml#fnref1""#));
        assert!(notes.contains("The note."));

        let titles: Vec<String> = book.toc().children.iter().map(|c| c.title.clone()).collect();
        assert_eq!(titles, vec!["Start", "Next"]);
        assert!(book.check_integrity().is_ok());
    }
}
