//! MOBI 6 output.
//!
//! The merged spine is serialized as MOBI markup: links become fixed width
//! `filepos` byte offsets, images become `recindex` references to image
//! records and chapters are separated by `<mbp:pagebreak/>`. The text is
//! PalmDoc compressed with multibyte trailing entries, followed by the
//! image records and the FLIS, FCIS and EOF records.

use std::collections::HashMap;
use std::path::Path;

use super::merge::{merge_spine, Merged};
use super::{book_title, Encoder};
use crate::container::paths::name_for_href;
use crate::dom::{escape_text, Document, NodeData, NodeId};
use crate::error::Result;
use crate::options::{OptionDef, OptionsMap};
use crate::pdb::mobi::{
    exth, fcis_record, flis_record, locale_for_language, text_records, Exth, Record0, EOF_RECORD,
};
use crate::pdb::text::RECORD_SIZE;
use crate::pdb::{PdbFile, PdbKind};
use crate::pipeline::StageContext;
use crate::types::media::sniff_image;
use crate::types::{Book, Metadata, TocNode};

const MERGED: &str = "index.html";
const FILEPOS_WIDTH: usize = 10;
const PAGEBREAK: &str = "<mbp:pagebreak/>";

/// Tags MOBI 6 readers understand, written as is
const KEPT_TAGS: &[&str] = &[
    "a", "b", "big", "blockquote", "br", "caption", "center", "cite", "code", "dd", "del", "div",
    "dl", "dt", "em", "font", "h1", "h2", "h3", "h4", "h5", "h6", "hr", "i", "ins", "li", "ol", "p",
    "pre", "q", "s", "small", "strike", "strong", "sub", "sup", "table", "tbody", "td", "tfoot",
    "th", "thead", "tr", "tt", "u", "ul", "var",
];

/// Block containers written as `<div>`
const DIV_TAGS: &[&str] = &[
    "article", "aside", "figcaption", "figure", "footer", "header", "main", "nav", "section",
];

const VOID_TAGS: &[&str] = &["br", "hr"];

pub struct MobiEncoder;

impl MobiEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MobiEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Serializes XHTML as MOBI markup while tracking byte offsets
struct Markup<'a> {
    src: &'a Document,
    out: String,
    /// Byte offset of each element id
    anchors: HashMap<String, usize>,
    /// Placeholder offsets waiting for the offset of an id
    links: Vec<(usize, String)>,
    /// Container name to 1-based image record index
    images: &'a HashMap<String, usize>,
}

impl<'a> Markup<'a> {
    fn new(src: &'a Document, images: &'a HashMap<String, usize>) -> Self {
        Self {
            src,
            out: String::new(),
            anchors: HashMap::new(),
            links: Vec::new(),
            images,
        }
    }

    fn link(&mut self, id: &str) {
        self.out.push_str(" filepos=");
        self.links.push((self.out.len(), id.to_string()));
        self.out.push_str(&"0".repeat(FILEPOS_WIDTH));
    }

    fn mark(&mut self, node: NodeId) {
        if let Some(id) = self.src.attr(node, "id") {
            self.anchors.entry(id.to_string()).or_insert(self.out.len());
        }
    }

    fn children(&mut self, node: NodeId) {
        let src = self.src;
        for &child in src.children(node) {
            self.node(child);
        }
    }

    fn node(&mut self, node: NodeId) {
        let src = self.src;
        let element = match src.data(node) {
            NodeData::Text(text) => {
                self.out.push_str(&escape_text(text));
                return;
            }
            NodeData::Element(e) => e,
            _ => return,
        };
        let local = element.local_name().to_ascii_lowercase();
        let local = local.as_str();
        if matches!(local, "script" | "style" | "head" | "title" | "link" | "meta") {
            return;
        }
        self.mark(node);
        if matches!(local, "img" | "image") {
            let images = self.images;
            let href = element.attr("src").or_else(|| element.attr_local("href"));
            let index = href
                .and_then(|h| name_for_href(h, MERGED))
                .and_then(|name| images.get(&name).copied());
            if let Some(index) = index {
                self.out.push_str(&format!("<img recindex=\"{index:05}\""));
                if let Some(alt) = element.attr("alt") {
                    self.out.push_str(&format!(" alt=\"{}\"", escape_text(alt).replace('"', "&quot;")));
                }
                self.out.push_str("/>");
            }
            return;
        }
        let tag = if KEPT_TAGS.contains(&local) {
            local
        } else if DIV_TAGS.contains(&local) {
            "div"
        } else {
            self.children(node);
            return;
        };
        self.out.push('<');
        self.out.push_str(tag);
        if tag == "a" {
            match element.attr("href") {
                Some(href) if href.starts_with('#') => self.link(&href[1..]),
                Some(href) if crate::container::paths::is_external(href) => {
                    self.out.push_str(&format!(" href=\"{}\"", escape_text(href).replace('"', "&quot;")));
                }
                _ => {}
            }
        }
        let align = element
            .attr("style")
            .and_then(|s| s.split(';').find_map(|d| d.trim().strip_prefix("text-align:")))
            .map(str::trim)
            .filter(|a| matches!(*a, "left" | "right" | "center" | "justify"));
        if let Some(align) = align {
            self.out.push_str(&format!(" align=\"{align}\""));
        }
        for attr in ["colspan", "rowspan"] {
            if let Some(v) = element.attr(attr) {
                self.out.push_str(&format!(" {attr}=\"{v}\""));
            }
        }
        if VOID_TAGS.contains(&tag) {
            self.out.push_str("/>");
            return;
        }
        self.out.push('>');
        self.children(node);
        self.out.push_str(&format!("</{tag}>"));
    }

    /// Fill in every filepos placeholder. Links to unknown ids point at
    /// `fallback`.
    fn resolve(mut self, fallback: usize) -> Vec<u8> {
        let mut bytes = std::mem::take(&mut self.out).into_bytes();
        for (at, id) in &self.links {
            let offset = self.anchors.get(id).copied().unwrap_or(fallback);
            let digits = format!("{offset:0width$}", width = FILEPOS_WIDTH);
            bytes[*at..*at + FILEPOS_WIDTH].copy_from_slice(digits.as_bytes());
        }
        bytes
    }
}

fn toc_entries(markup: &mut Markup<'_>, merged: &Merged, entries: &[TocNode]) {
    if entries.is_empty() {
        return;
    }
    markup.out.push_str("<ul>");
    for entry in entries {
        markup.out.push_str("<li>");
        let target = entry
            .href
            .as_deref()
            .and_then(|name| merged.anchor(name, entry.fragment.as_deref()))
            .map(str::to_string);
        match target {
            Some(id) => {
                markup.out.push_str("<a");
                markup.link(&id);
                markup.out.push('>');
                markup.out.push_str(&escape_text(&entry.title));
                markup.out.push_str("</a>");
            }
            None => markup.out.push_str(&escape_text(&entry.title)),
        }
        toc_entries(markup, merged, &entry.children);
        markup.out.push_str("</li>");
    }
    markup.out.push_str("</ul>");
}

/// The inline table of contents page, returning its offset
fn write_toc(markup: &mut Markup<'_>, merged: &Merged, toc: &TocNode, title: &str) -> usize {
    let offset = markup.out.len();
    markup.out.push_str(&format!("<h2>{}</h2>", escape_text(title)));
    toc_entries(markup, merged, &toc.children);
    offset
}

fn exth_for(meta: &Metadata, cover: Option<usize>) -> Exth {
    let mut ex = Exth::default();
    for author in &meta.authors {
        ex.push(exth::AUTHOR, author.as_bytes());
    }
    if let Some(publisher) = &meta.publisher {
        ex.push(exth::PUBLISHER, publisher.as_bytes());
    }
    if let Some(comments) = &meta.comments {
        ex.push(exth::DESCRIPTION, comments.as_bytes());
    }
    if let Some(isbn) = meta.isbn() {
        ex.push(exth::ISBN, isbn.as_bytes());
    }
    for tag in &meta.tags {
        ex.push(exth::SUBJECT, tag.as_bytes());
    }
    if let Some(date) = meta.pubdate {
        ex.push(exth::PUBDATE, date.to_rfc3339().as_bytes());
    }
    if let Some(asin) = meta.identifiers.get("mobi-asin") {
        ex.push(exth::ASIN, asin.as_bytes());
    }
    ex.push(exth::CDE_TYPE, &b"EBOK"[..]);
    if let Some(index) = cover {
        ex.push(exth::COVER_OFFSET, (index as u32 - 1).to_be_bytes().to_vec());
        ex.push(exth::THUMB_OFFSET, (index as u32 - 1).to_be_bytes().to_vec());
    }
    ex.push(exth::UPDATED_TITLE, meta.title.as_bytes());
    if let Some(lang) = meta.language() {
        ex.push(exth::LANGUAGE, lang.as_bytes());
    }
    ex
}

impl Encoder for MobiEncoder {
    fn name(&self) -> &'static str {
        "mobi"
    }

    fn file_extension(&self) -> &'static str {
        "mobi"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["mobi", "azw", "prc"]
    }

    fn mime_type(&self) -> &'static str {
        "application/x-mobipocket-ebook"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![
            OptionDef::bool("no_inline_toc", false, "Do not add a table of contents page to the text"),
            OptionDef::bool(
                "mobi_toc_at_start",
                false,
                "Put the table of contents page at the start of the book",
            ),
        ]
    }

    fn required_transforms(&self, _options: &OptionsMap) -> Vec<&'static str> {
        vec!["flatten_css"]
    }

    fn encode(&self, book: &mut Book, output: &Path, ctx: &StageContext) -> Result<()> {
        let merged = merge_spine(book, MERGED)?;
        let meta = book.metadata();
        let title = book_title(book);
        let toc = book.toc().clone();

        // image records in first-use order, then the cover
        let mut images: HashMap<String, usize> = HashMap::new();
        let mut records: Vec<Vec<u8>> = Vec::new();
        let mut wanted: Vec<String> = merged
            .doc
            .descendants(merged.doc.root())
            .into_iter()
            .filter(|&n| merged.doc.is(n, "img") || merged.doc.is(n, "image"))
            .filter_map(|n| {
                let el = merged.doc.element(n)?;
                let src = el.attr("src").or_else(|| el.attr_local("href"))?;
                name_for_href(src, MERGED)
            })
            .collect();
        let cover_name = book.cover_name();
        wanted.extend(cover_name.clone());
        for name in wanted {
            if images.contains_key(&name) {
                continue;
            }
            let Ok(data) = book.container.read(&name) else {
                continue;
            };
            if !matches!(sniff_image(&data), Some("image/jpeg" | "image/png" | "image/gif")) {
                ctx.log.warn(format!("MOBI cannot hold {name}, dropping it"));
                continue;
            }
            records.push(data);
            images.insert(name, records.len());
        }
        let cover = cover_name.as_ref().and_then(|c| images.get(c)).copied();

        let mut markup = Markup::new(&merged.doc, &images);
        markup.out.push_str("<html><head><guide>");
        let mut toc_link = None;
        let inline_toc = !ctx.options.bool("no_inline_toc") && toc.count() > 0;
        if inline_toc {
            markup.out.push_str("<reference type=\"toc\" title=\"Table of Contents\"");
            markup.out.push_str(" filepos=");
            toc_link = Some(markup.out.len());
            markup.out.push_str(&"0".repeat(FILEPOS_WIDTH));
            markup.out.push_str(" />");
        }
        markup.out.push_str("</guide></head><body>");
        let body_start = markup.out.len();

        let toc_at_start = ctx.options.bool("mobi_toc_at_start");
        let mut toc_offset = None;
        if inline_toc && toc_at_start {
            toc_offset = Some(write_toc(&mut markup, &merged, &toc, "Table of Contents"));
            markup.out.push_str(PAGEBREAK);
        }
        let chapters = merged.doc.element_children(merged.body);
        for (i, chapter) in chapters.iter().enumerate() {
            ctx.checkpoint()?;
            if i > 0 {
                markup.out.push_str(PAGEBREAK);
            }
            markup.node(*chapter);
        }
        if inline_toc && !toc_at_start {
            markup.out.push_str(PAGEBREAK);
            toc_offset = Some(write_toc(&mut markup, &merged, &toc, "Table of Contents"));
        }
        markup.out.push_str("</body></html>");

        let mut text = markup.resolve(body_start);
        if let (Some(at), Some(offset)) = (toc_link, toc_offset) {
            let digits = format!("{offset:0width$}", width = FILEPOS_WIDTH);
            text[at..at + FILEPOS_WIDTH].copy_from_slice(digits.as_bytes());
        }
        ctx.checkpoint()?;

        let text_records = text_records(&text, RECORD_SIZE);
        let count = text_records.len() as u32;
        let first_resource = count + 1;
        let flis_index = first_resource + records.len() as u32;
        let uid = u32::from_be_bytes(book.id.as_bytes()[..4].try_into().unwrap_or([0; 4]));
        let record0 = Record0 {
            title: title.clone(),
            text_length: text.len() as u32,
            text_record_count: count as u16,
            record_size: RECORD_SIZE as u16,
            uid,
            locale: meta.language().map(locale_for_language).unwrap_or(9),
            first_non_text: count + 1,
            first_resource,
            flis_index,
            fcis_index: flis_index + 1,
            exth: exth_for(&meta, cover),
        };

        let mut pdb = PdbFile::new(&title, PdbKind::Mobi);
        pdb.records.push(record0.to_bytes());
        pdb.records.extend(text_records);
        let image_count = records.len();
        pdb.records.extend(records);
        pdb.records.push(flis_record());
        pdb.records.push(fcis_record(text.len() as u32));
        pdb.records.push(EOF_RECORD.to_vec());
        ctx.log.info(format!(
            "mobi: {} text records, {image_count} images, {} bytes of markup",
            count,
            text.len()
        ));
        std::fs::write(output, pdb.to_bytes())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::{Decoder, MobiDecoder};
    use crate::transform::test_support::{book, context, xhtml};

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x06\0\0\0";

    #[test]
    fn test_markup_filepos() {
        let doc = Document::parse_xhtml(&xhtml(
            r##"<section><p><a href="#t">go</a></p><span>inline</span><p id="t" style="text-align: center">here</p></section>"##,
        ))
        .unwrap();
        let images = HashMap::new();
        let mut markup = Markup::new(&doc, &images);
        let body = doc.body().unwrap();
        markup.children(body);
        let text = String::from_utf8(markup.resolve(0)).unwrap();
        let target = text.find("<p align").unwrap();
        assert!(text.starts_with("<div><p><a filepos="));
        assert!(text.contains(&format!("filepos={target:010}>go</a>")));
        assert!(text.contains("</p>inline<p"));
    }

    #[test]
    fn test_mobi_round_trip() {
        let mut book = book(&[
            (
                "a.xhtml",
                &xhtml(r##"<h1>First</h1><p><a href="b.xhtml#deep">Jump</a></p><img src="pic.png" alt="pic"/>"##),
            ),
            ("b.xhtml", &xhtml(r#"<h1>Second</h1><p id="deep">Deep target</p>"#)),
        ]);
        let id = book.container.add_name("pic.png", PNG, None, &[]).unwrap();
        book.container.opf_mut().manifest.set_cover_image(Some(&id));
        let mut meta = book.metadata();
        meta.title = "Kindle Test".into();
        meta.authors = vec!["K. Writer".into()];
        meta.publisher = Some("Pub".into());
        book.set_metadata(&meta);
        let mut toc = TocNode::root();
        toc.add_child(TocNode::new("First", "a.xhtml"));
        toc.add_child(TocNode::new("Second", "b.xhtml"));
        book.container.set_toc(toc);

        let encoder = MobiEncoder::new();
        let (ctx, tmp) = context(encoder.options(), &[]);
        let out = tmp.path().join("out.mobi");
        encoder.encode(&mut book, &out, &ctx).unwrap();

        let decoder = MobiDecoder::new();
        let head = std::fs::read(&out).unwrap();
        assert!(decoder.sniff(&out, &head[..head.len().min(4096)]));
        let (ctx, _tmp2) = context(decoder.options(), &[]);
        let back = decoder.decode(&out, &ctx).unwrap();
        let meta = back.metadata();
        assert_eq!(meta.title, "Kindle Test");
        assert_eq!(meta.authors, vec!["K. Writer"]);
        assert_eq!(meta.publisher.as_deref(), Some("Pub"));
        assert!(back.cover_name().is_some());
        // two chapters plus the inline table of contents
        let spine = back.spine_names();
        assert_eq!(spine.len(), 3);
        let first = back.container.read_text(&spine[0]).unwrap();
        assert!(first.contains("#filepos"));
        assert!(first.contains("<img"));
        let second = back.container.read_text(&spine[1]).unwrap();
        assert!(second.contains("id=\"filepos"));
        assert!(second.contains("Deep target"));
    }
}
