//! MOBI, AZW and AZW3 decoder.
//!
//! MOBI 6 text is one HTML stream: `filepos` links point at byte offsets
//! in it, images are addressed by record index and `<mbp:pagebreak/>`
//! separates the files we write. KF8 text is cut into skeletons and
//! fragments which [`Kf8Layout`] reassembles; `kindle:` URLs are resolved
//! against the resource records, the secondary flows and the reassembled
//! parts. Joint files are read from their KF8 half unless `prefer_mobi6`
//! is set.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use super::{file_title, BookBuilder, Decoder};
use crate::container::paths;
use crate::dom::{Document, NodeId};
use crate::error::{ParseError, Result};
use crate::options::OptionDef;
use crate::patterns::{FILEPOS, ID_ATTR, KINDLE_EMBED, KINDLE_FLOW, KINDLE_POS, RECINDEX};
use crate::pdb::index::{from_base32, Kf8Layout, Part};
use crate::pdb::mobi::{decode_font, exth, is_auxiliary_record, MobiSection};
use crate::pdb::{self, PdbFile, PdbKind};
use crate::pipeline::StageContext;
use crate::types::{parse_date, Book, Metadata, TocNode};

/// Decoder for Mobipocket and Kindle books
pub struct MobiDecoder;

impl MobiDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for MobiDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Book metadata from the EXTH block and the MOBI header
pub(crate) fn exth_metadata(section: &MobiSection, fallback_title: &str) -> Metadata {
    let exth_text = |kind: u32| {
        section
            .exth
            .get(kind)
            .map(|v| section.header.decode(v).trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let mut meta = Metadata {
        title: exth_text(exth::UPDATED_TITLE)
            .or_else(|| Some(section.header.full_name.trim().to_string()).filter(|t| !t.is_empty()))
            .unwrap_or_else(|| fallback_title.to_string()),
        ..Metadata::default()
    };
    meta.authors = section
        .exth
        .all(exth::AUTHOR)
        .map(|a| section.header.decode(a).trim().to_string())
        .filter(|a| !a.is_empty())
        .collect();
    meta.publisher = exth_text(exth::PUBLISHER);
    meta.comments = exth_text(exth::DESCRIPTION);
    meta.tags = section
        .exth
        .all(exth::SUBJECT)
        .flat_map(|s| {
            section
                .header
                .decode(s)
                .split(';')
                .map(|t| t.trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|t| !t.is_empty())
        .collect();
    meta.pubdate = exth_text(exth::PUBDATE).and_then(|d| parse_date(&d));
    if let Some(isbn) = exth_text(exth::ISBN) {
        meta.set_identifier("isbn", isbn.replace('-', ""));
    }
    if let Some(asin) = exth_text(exth::ASIN) {
        meta.set_identifier("mobi-asin", asin);
    }
    let lang = exth_text(exth::LANGUAGE).or_else(|| section.header.language().map(str::to_string));
    if let Some(lang) = lang {
        meta.set_languages([lang]);
    }
    meta
}

/// Store resource records, returning manifest names by 1-based index
fn add_resources(
    builder: &mut BookBuilder,
    section: &MobiSection,
    pdb: &PdbFile,
    ctx: &StageContext,
) -> Result<HashMap<usize, String>> {
    let mut names = HashMap::new();
    for (index, data) in section.resources(pdb) {
        if is_auxiliary_record(data) {
            continue;
        }
        if let Some(font) = decode_font(data) {
            let ext = if font.starts_with(b"OTTO") { "otf" } else { "ttf" };
            let name = builder.add_resource(&format!("fonts/font{index:05}.{ext}"), &font, None)?;
            names.insert(index, name);
        } else if let Some(name) = builder.add_image(&format!("images/image{index:05}"), data)? {
            names.insert(index, name);
        } else if !data.starts_with(b"RESC") {
            ctx.log.debug(format!("skipping unrecognized resource record {index}"));
        }
    }
    Ok(names)
}

/// Insert `<a id="fileposN">` at every byte offset a `filepos` link
/// targets, moving offsets that fall inside a tag to its start
fn insert_filepos_anchors(text: &[u8]) -> Vec<u8> {
    let source = String::from_utf8_lossy(text);
    let targets: BTreeSet<usize> = FILEPOS
        .captures_iter(&source)
        .filter_map(|c| c[1].parse().ok())
        .collect();
    let mut out = text.to_vec();
    for &target in targets.iter().rev() {
        let mut at = target.min(out.len());
        let open = out[..at].iter().rposition(|&b| b == b'<');
        let close = out[..at].iter().rposition(|&b| b == b'>');
        if let Some(open) = open {
            if close.map_or(true, |c| c < open) {
                at = open;
            }
        }
        let anchor = format!("<a id=\"filepos{target}\"></a>");
        out.splice(at..at, anchor.bytes());
    }
    out
}

/// Id of the first element starting at or after `offset`, adding one
/// when it has none
fn anchor_at(content: &mut Vec<u8>, offset: usize, counter: &mut usize) -> Option<String> {
    let mut pos = offset.min(content.len());
    let tag_start = loop {
        let start = pos + content[pos..].iter().position(|&b| b == b'<')?;
        match content.get(start + 1) {
            Some(b'/' | b'!' | b'?') => pos = start + 1,
            Some(_) => break start,
            None => return None,
        }
    };
    let tag_end = tag_start + content[tag_start..].iter().position(|&b| b == b'>')?;
    let tag = String::from_utf8_lossy(&content[tag_start..tag_end]);
    if let Some(id) = ID_ATTR.captures(&tag) {
        return Some(id[1].to_string());
    }
    let name_end = tag_start
        + 1
        + content[tag_start + 1..tag_end]
            .iter()
            .position(|b| b.is_ascii_whitespace() || *b == b'/')
            .unwrap_or(tag_end - tag_start - 1);
    *counter += 1;
    let id = format!("kpos{counter}");
    let attr = format!(" id=\"{id}\"");
    content.splice(name_end..name_end, attr.bytes());
    Some(id)
}

fn is_pagebreak(doc: &Document, node: NodeId) -> bool {
    doc.name(node).is_some_and(|n| n.to_ascii_lowercase().ends_with("pagebreak"))
}

/// Copy `src` into fresh XHTML documents, one per top-level page break
fn split_pages(src: &Document, title: &str, lang: Option<&str>) -> Vec<Document> {
    let mut pages = Vec::new();
    let (mut doc, mut body) = Document::xhtml_skeleton(title, lang);
    copy_head(src, &mut doc);
    if let Some(src_body) = src.body() {
        for &child in src.children(src_body) {
            if is_pagebreak(src, child) {
                if !doc.normalized_text(body).is_empty() || has_media(&doc, body) {
                    pages.push(doc);
                    (doc, body) = Document::xhtml_skeleton(title, lang);
                    copy_head(src, &mut doc);
                }
                continue;
            }
            doc.import(body, src, child);
        }
    }
    pages.push(doc);
    pages
}

fn has_media(doc: &Document, node: NodeId) -> bool {
    doc.descendants(node)
        .into_iter()
        .any(|n| doc.is(n, "img") || doc.is(n, "svg") || doc.is(n, "image"))
}

/// Stylesheet links and style blocks of `src`
fn copy_head(src: &Document, doc: &mut Document) {
    let (Some(src_head), Some(head)) = (src.head(), doc.head()) else {
        return;
    };
    for &child in src.children(src_head) {
        let keep = src.is(child, "style")
            || (src.is(child, "link")
                && src.attr(child, "rel").is_some_and(|r| r.eq_ignore_ascii_case("stylesheet")));
        if keep {
            doc.import(head, src, child);
        }
    }
}

/// Remove MOBI-only markup and attributes
fn strip_mobi_markup(doc: &mut Document) {
    let root = doc.root();
    for node in doc.descendants(root) {
        let Some(name) = doc.name(node).map(str::to_ascii_lowercase) else {
            continue;
        };
        if name == "guide" || name == "reference" || is_pagebreak(doc, node) {
            doc.detach(node);
        } else if name.starts_with("mbp:") {
            doc.unwrap(node);
        } else {
            for attr in ["filepos", "recindex", "hirecindex", "lorecindex", "aid"] {
                doc.remove_attr(node, attr);
            }
        }
    }
}

/// Point `#id` links at the page now holding `id`
fn relink_pages(pages: &mut [(String, Document)]) {
    let mut owner: HashMap<String, String> = HashMap::new();
    for (name, doc) in pages.iter() {
        for node in doc.descendants(doc.root()) {
            if let Some(id) = doc.attr(node, "id") {
                owner.entry(id.to_string()).or_insert_with(|| name.clone());
            }
        }
    }
    for (name, doc) in pages.iter_mut() {
        for a in doc.elements_by_name(doc.root(), "a") {
            let Some(target) = doc.attr(a, "href").and_then(|h| h.strip_prefix('#')) else {
                continue;
            };
            match owner.get(target) {
                Some(page) if page != name => {
                    let href = format!("{page}#{target}");
                    doc.set_attr(a, "href", href);
                }
                Some(_) => {}
                None => {
                    doc.remove_attr(a, "href");
                }
            }
        }
    }
}

fn add_pages(builder: &mut BookBuilder, pages: Vec<(String, Document)>) -> Result<()> {
    for (name, doc) in pages {
        builder.add_document(&name, &doc)?;
    }
    Ok(())
}

fn decode_mobi6(
    builder: &mut BookBuilder,
    pdb: &PdbFile,
    section: &MobiSection,
    meta: &Metadata,
    ctx: &StageContext,
) -> Result<HashMap<usize, String>> {
    let resources = add_resources(builder, section, pdb, ctx)?;
    let raw = section.text(pdb)?;
    ctx.checkpoint()?;
    let anchored = insert_filepos_anchors(&raw);
    let html = section.header.decode(&anchored);
    let html = FILEPOS.replace_all(&html, |c: &regex::Captures<'_>| format!("href=\"#filepos{}\"", &c[1]));
    let html = RECINDEX.replace_all(&html, |c: &regex::Captures<'_>| {
        let index: usize = c[1].parse().unwrap_or(0);
        match resources.get(&index) {
            Some(name) => format!("src=\"{name}\""),
            None => String::new(),
        }
    });

    let src = Document::parse_html(&html);
    let lang = meta.language();
    let mut pages: Vec<(String, Document)> = split_pages(&src, &meta.title, lang)
        .into_iter()
        .enumerate()
        .map(|(i, mut doc)| {
            strip_mobi_markup(&mut doc);
            (format!("part{:04}.xhtml", i), doc)
        })
        .collect();
    relink_pages(&mut pages);
    ctx.log.debug(format!("mobi text split into {} files", pages.len()));
    add_pages(builder, pages)?;
    Ok(resources)
}

fn part_name(part: &Part) -> String {
    format!("part{:04}.xhtml", part.file_number)
}

fn decode_kf8(
    builder: &mut BookBuilder,
    pdb: &PdbFile,
    section: &MobiSection,
    meta: &Metadata,
    ctx: &StageContext,
) -> Result<HashMap<usize, String>> {
    let resources = add_resources(builder, section, pdb, ctx)?;
    let text = section.text(pdb)?;
    ctx.checkpoint()?;
    let layout = Kf8Layout::read(pdb, section)?;
    let flow0 = layout.flow(&text, 0).unwrap_or(&text);
    let mut parts = layout.assemble(flow0);
    if parts.is_empty() {
        return Err(ParseError::InvalidEbook("KF8 book has no skeleton".into()).into());
    }

    // anchors for kindle:pos targets, inserted back to front per part
    let mut targets: BTreeSet<(u32, u32)> = BTreeSet::new();
    for part in &parts {
        let content = String::from_utf8_lossy(&part.content);
        for c in KINDLE_POS.captures_iter(&content) {
            if let (Some(fid), Some(off)) = (from_base32(&c[1]), from_base32(&c[2])) {
                targets.insert((fid, off));
            }
        }
    }
    let ncx_targets = layout.ncx.iter().filter_map(|e| e.pos_fid);
    targets.extend(ncx_targets);
    let mut by_part: BTreeMap<usize, Vec<(usize, (u32, u32))>> = BTreeMap::new();
    for &(fid, off) in &targets {
        match layout.locate(&parts, fid, off) {
            Some((index, offset)) => by_part.entry(index).or_default().push((offset, (fid, off))),
            None => ctx.log.debug(format!("unresolved kindle:pos fid {fid} off {off}")),
        }
    }
    let mut anchors: HashMap<(u32, u32), (String, String)> = HashMap::new();
    let mut counter = 0;
    for (index, mut offsets) in by_part {
        offsets.sort_by(|a, b| b.0.cmp(&a.0));
        let name = part_name(&parts[index]);
        for (offset, key) in offsets {
            if let Some(id) = anchor_at(&mut parts[index].content, offset, &mut counter) {
                anchors.insert(key, (name.clone(), id));
            }
        }
    }

    // secondary flows referenced by the parts
    let mut flow_names: HashMap<usize, String> = HashMap::new();
    for part in &parts {
        let content = String::from_utf8_lossy(&part.content);
        for c in KINDLE_FLOW.captures_iter(&content) {
            let Some(n) = from_base32(&c[1]).map(|n| n as usize) else {
                continue;
            };
            if flow_names.contains_key(&n) {
                continue;
            }
            let Some(flow) = layout.flow(&text, n) else {
                continue;
            };
            let (stem, media) = match &c[2] {
                "text/css" => (format!("styles/flow{n:04}.css"), "text/css"),
                "image/svg+xml" => (format!("images/flow{n:04}.svg"), "image/svg+xml"),
                _ => continue,
            };
            let body = embed_hrefs(&section.header.decode(flow), &resources, &stem);
            let name = builder.add_resource(&stem, body.as_bytes(), Some(media))?;
            flow_names.insert(n, name);
        }
    }

    let lang = meta.language();
    let mut pages = Vec::with_capacity(parts.len());
    for part in &parts {
        let name = part_name(part);
        let html = section.header.decode(&part.content);
        let html = KINDLE_POS.replace_all(&html, |c: &regex::Captures<'_>| {
            let key = (from_base32(&c[1]).unwrap_or(0), from_base32(&c[2]).unwrap_or(0));
            match anchors.get(&key) {
                Some((page, id)) => format!("{page}#{id}"),
                None => String::new(),
            }
        });
        let html = KINDLE_FLOW.replace_all(&html, |c: &regex::Captures<'_>| {
            from_base32(&c[1])
                .and_then(|n| flow_names.get(&(n as usize)))
                .cloned()
                .unwrap_or_default()
        });
        let html = embed_hrefs(&html, &resources, &name);
        let src = Document::parse_html(&html);
        let mut doc = split_pages(&src, &meta.title, lang)
            .into_iter()
            .reduce(|mut first, next| {
                if let (Some(to), Some(from)) = (first.body(), next.body()) {
                    for &child in next.children(from) {
                        first.import(to, &next, child);
                    }
                }
                first
            })
            .unwrap_or_else(|| Document::xhtml_skeleton(&meta.title, lang).0);
        strip_mobi_markup(&mut doc);
        pages.push((name, doc));
    }
    relink_pages(&mut pages);
    add_pages(builder, pages)?;

    // NCX entries, nested through their parent index
    let mut nodes: Vec<Option<TocNode>> = layout
        .ncx
        .iter()
        .map(|entry| {
            let (page, id) = entry.pos_fid.and_then(|k| anchors.get(&k)).cloned().unzip();
            let mut node = TocNode::new(entry.title.clone(), page.unwrap_or_default());
            node.fragment = id;
            Some(node)
        })
        .collect();
    for i in (0..nodes.len()).rev() {
        if let Some(parent) = layout.ncx[i].parent.filter(|&p| p < i) {
            if let Some(child) = nodes[i].take() {
                if let Some(p) = nodes[parent].as_mut() {
                    p.children.insert(0, child);
                }
            }
        }
    }
    for node in nodes.into_iter().flatten() {
        builder.toc_mut().add_child(node);
    }
    Ok(resources)
}

/// Replace `kindle:embed` URLs in text that will live at `base`
fn embed_hrefs(text: &str, resources: &HashMap<usize, String>, base: &str) -> String {
    KINDLE_EMBED
        .replace_all(text, |c: &regex::Captures<'_>| {
            from_base32(&c[1])
                .and_then(|n| resources.get(&(n as usize)))
                .map(|name| paths::href_for_name(name, base))
                .unwrap_or_default()
        })
        .into_owned()
}

impl Decoder for MobiDecoder {
    fn name(&self) -> &'static str {
        "mobi"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["mobi", "azw", "azw3", "prc"]
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &["application/x-mobipocket-ebook", "application/vnd.amazon.ebook"]
    }

    fn sniff(&self, _path: &Path, head: &[u8]) -> bool {
        pdb::sniff(head) == Some(PdbKind::Mobi)
    }

    fn priority(&self) -> i32 {
        1
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::bool(
            "prefer_mobi6",
            false,
            "Read the MOBI 6 part of joint MOBI/KF8 files instead of the KF8 part",
        )]
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let data = std::fs::read(input)?;
        let pdb = PdbFile::parse(&data)?;
        if pdb.kind != PdbKind::Mobi {
            return Err(ParseError::InvalidEbook(format!(
                "{} is a {} database, not a MOBI book",
                input.display(),
                pdb.kind.name()
            ))
            .into());
        }
        let first = MobiSection::parse(&pdb, 0)?;
        let kf8 = if first.header.is_kf8() {
            Some(first.clone())
        } else {
            match first.exth.get_u32(exth::KF8_BOUNDARY) {
                Some(boundary) if !ctx.options.bool("prefer_mobi6") => {
                    match MobiSection::parse(&pdb, boundary as usize) {
                        Ok(section) if section.header.is_kf8() => Some(section),
                        Ok(_) => None,
                        Err(e) => {
                            ctx.log.warn(format!("ignoring unreadable KF8 section: {e}"));
                            None
                        }
                    }
                }
                _ => None,
            }
        };
        let section = kf8.as_ref().unwrap_or(&first);
        let meta = exth_metadata(section, &file_title(input));
        ctx.log.info(format!(
            "reading {} section (version {}, {:?} compression)",
            if kf8.is_some() { "KF8" } else { "MOBI 6" },
            section.header.version,
            section.header.compression
        ));

        let mut builder = BookBuilder::new(ctx)?;
        let resources = if kf8.is_some() {
            decode_kf8(&mut builder, &pdb, section, &meta, ctx)?
        } else {
            decode_mobi6(&mut builder, &pdb, section, &meta, ctx)?
        };
        let cover = section
            .exth
            .get_u32(exth::COVER_OFFSET)
            .and_then(|offset| resources.get(&(offset as usize + 1)));
        if let Some(cover) = cover {
            builder.set_cover(cover);
        }
        builder.finish(&meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdb::mobi::{fcis_record, flis_record, locale_for_language, text_records, Exth, Record0, EOF_RECORD};
    use crate::pdb::text::RECORD_SIZE;
    use crate::transform::test_support::context;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR\0\0\0\x01\0\0\0\x01\x08\x06\0\0\0";

    /// A MOBI 6 file whose first page links to the second
    fn mobi6(path: &Path) {
        let template = "<html><head><guide><reference type=\"toc\" filepos=0000000000 /></guide></head><body>\
<p><a filepos=XXXXXXXXXX>Jump</a></p><img recindex=\"00001\"/><mbp:pagebreak/>\
<p>Target here</p></body></html>";
        let target = template.find("<p>Target").unwrap();
        let html = template.replace("XXXXXXXXXX", &format!("{target:010}"));
        let text = html.as_bytes();

        let records = text_records(text, RECORD_SIZE);
        let count = records.len() as u32;
        let mut exth = Exth::default();
        exth.push(exth::AUTHOR, "Jane Doe");
        exth.push(exth::UPDATED_TITLE, "Linked");
        exth.push(exth::COVER_OFFSET, 0u32.to_be_bytes().to_vec());
        let record0 = Record0 {
            title: "Linked".into(),
            text_length: text.len() as u32,
            text_record_count: count as u16,
            record_size: RECORD_SIZE as u16,
            uid: 7,
            locale: locale_for_language("en"),
            first_non_text: count + 1,
            first_resource: count + 1,
            flis_index: count + 2,
            fcis_index: count + 3,
            exth,
        };
        let mut pdb = PdbFile::new("Linked", PdbKind::Mobi);
        pdb.records.push(record0.to_bytes());
        pdb.records.extend(records);
        pdb.records.push(PNG.to_vec());
        pdb.records.push(flis_record());
        pdb.records.push(fcis_record(text.len() as u32));
        pdb.records.push(EOF_RECORD.to_vec());
        std::fs::write(path, pdb.to_bytes()).unwrap();
    }

    #[test]
    fn test_mobi6_decode() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("linked.mobi");
        mobi6(&input);
        let decoder = MobiDecoder::new();
        let head = std::fs::read(&input).unwrap();
        assert!(decoder.sniff(&input, &head[..head.len().min(4096)]));

        let (ctx, _tmp) = context(decoder.options(), &[]);
        let book = decoder.decode(&input, &ctx).unwrap();
        let meta = book.metadata();
        assert_eq!(meta.title, "Linked");
        assert_eq!(meta.authors, vec!["Jane Doe"]);
        assert_eq!(meta.language(), Some("en"));
        assert_eq!(book.spine_names(), vec!["part0000.xhtml", "part0001.xhtml"]);
        assert_eq!(book.cover_name().as_deref(), Some("images/image00001.png"));

        let first = book.container.read_text("part0000.xhtml").unwrap();
        let target = first
            .split("href=\"")
            .nth(1)
            .and_then(|s| s.split('"').next())
            .unwrap()
            .to_string();
        assert!(target.starts_with("part0001.xhtml#filepos"), "{target}");
        assert!(first.contains("src=\"images/image00001.png\""));
        assert!(!first.contains("guide"));
        let second = book.container.read_text("part0001.xhtml").unwrap();
        assert!(second.contains(&format!("id=\"{}\"", target.split('#').nth(1).unwrap())));
        assert!(second.contains("Target here"));
    }

    #[test]
    fn test_filepos_anchor_moves_out_of_tags() {
        let out = insert_filepos_anchors(b"<p>ab</p><p class=\"x\">cd</p>filepos=12");
        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("<p>ab</p><a id=\"filepos12\"></a><p class=\"x\">"), "{out}");
    }

    #[test]
    fn test_anchor_at_reuses_and_adds_ids() {
        let mut content = b"text <div id=\"keep\">a</div> <p class=\"c\">b</p>".to_vec();
        let mut counter = 0;
        assert_eq!(anchor_at(&mut content, 0, &mut counter).as_deref(), Some("keep"));
        let at = content.windows(2).position(|w| w == b"<p").unwrap();
        assert_eq!(anchor_at(&mut content, at - 1, &mut counter).as_deref(), Some("kpos1"));
        assert!(String::from_utf8_lossy(&content).contains("<p id=\"kpos1\" class=\"c\">"));
        let len = content.len();
        assert_eq!(anchor_at(&mut content, len, &mut counter), None);
    }

    #[test]
    fn test_not_a_mobi() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("doc.prc");
        let pdb = crate::pdb::text::write_palmdoc("Doc", b"hello", true);
        std::fs::write(&input, pdb.to_bytes()).unwrap();
        let (ctx, _tmp) = context(Vec::new(), &[]);
        let err = MobiDecoder::new().decode(&input, &ctx).unwrap_err();
        assert_eq!(err.code(), "E_INVALID_EBOOK");
    }
}
