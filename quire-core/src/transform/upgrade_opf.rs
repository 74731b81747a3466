//! EPUB 2 to EPUB 3 package upgrade.

use std::collections::BTreeSet;

use chrono::Utc;

use crate::dom::{Document, NodeId};
use crate::error::Result;
use crate::opf::metadata::parse_identifier;
use crate::pipeline::StageContext;
use crate::types::media::is_html;
use crate::types::{parse_date, Book};

use super::Transform;

/// Manifest properties derived from document content
const CONTENT_PROPERTIES: &[&str] = &["svg", "scripted", "mathml", "switch"];

pub struct UpgradeOpf;

impl UpgradeOpf {
    pub fn new() -> Self {
        Self
    }
}

impl Default for UpgradeOpf {
    fn default() -> Self {
        Self::new()
    }
}

fn is_dc(doc: &Document, node: NodeId, local: &str) -> bool {
    doc.name(node)
        .is_some_and(|n| n.strip_prefix("dc:").is_some_and(|l| l.eq_ignore_ascii_case(local)))
}

fn opf_attr_name(doc: &Document, node: NodeId, local: &str) -> Option<String> {
    doc.element(node)?
        .attrs
        .iter()
        .find(|a| a.name.eq_ignore_ascii_case(&format!("opf:{local}")))
        .map(|a| a.name.clone())
}

/// Append `<meta refines="#id" property=...>value</meta>` unless present
fn refine(doc: &mut Document, md: NodeId, id: &str, property: &str, value: &str) {
    let target = format!("#{id}");
    let exists = doc.children_named(md, "meta").into_iter().any(|m| {
        doc.attr(m, "refines") == Some(target.as_str()) && doc.attr(m, "property") == Some(property)
    });
    if exists {
        return;
    }
    let meta = doc.append_text_element(md, "meta", value);
    doc.set_attr(meta, "refines", target);
    doc.set_attr(meta, "property", property);
    if property == "role" {
        doc.set_attr(meta, "scheme", "marc:relators");
    }
}

/// Rewrite the metadata element of an EPUB 2 package in EPUB 3 form
fn upgrade_metadata(doc: &mut Document, md: NodeId) {
    for ident in doc.children(md).to_vec() {
        if !is_dc(doc, ident, "identifier") {
            continue;
        }
        let Some(attr) = opf_attr_name(doc, ident, "scheme") else {
            continue;
        };
        let scheme = doc.remove_attr(ident, &attr).unwrap_or_default();
        let text = doc.text_content(ident);
        if let Some((scheme, value)) = parse_identifier(&text, Some(&scheme)) {
            let written = match scheme.as_str() {
                "isbn" | "uuid" | "doi" => format!("urn:{scheme}:{value}"),
                other => format!("{other}:{value}"),
            };
            doc.set_text(ident, written);
        }
    }

    let titles: Vec<NodeId> = doc
        .children(md)
        .iter()
        .copied()
        .filter(|&c| is_dc(doc, c, "title"))
        .collect();
    if let Some(&first) = titles.first() {
        let id = doc.ensure_id(first, "title");
        refine(doc, md, &id, "title-type", "main");
        if let Some(attr) = opf_attr_name(doc, first, "file-as") {
            let sort = doc.remove_attr(first, &attr).unwrap_or_default();
            refine(doc, md, &id, "file-as", &sort);
        }
        let title_sort = doc
            .children_named(md, "meta")
            .into_iter()
            .find(|&m| doc.attr(m, "name") == Some("calibre:title_sort"));
        if let Some(meta) = title_sort {
            let sort = doc.attr(meta, "content").unwrap_or("").trim().to_string();
            doc.detach(meta);
            if !sort.is_empty() {
                refine(doc, md, &id, "file-as", &sort);
            }
        }
    }

    let creators: Vec<NodeId> = doc
        .children(md)
        .iter()
        .copied()
        .filter(|&c| is_dc(doc, c, "creator") || is_dc(doc, c, "contributor"))
        .collect();
    for creator in creators {
        let role = opf_attr_name(doc, creator, "role");
        let file_as = opf_attr_name(doc, creator, "file-as");
        if role.is_none() && file_as.is_none() {
            continue;
        }
        let id = doc.ensure_id(creator, "creator");
        if let Some(attr) = role {
            let role = doc.remove_attr(creator, &attr).unwrap_or_default();
            refine(doc, md, &id, "role", role.trim());
        }
        if let Some(attr) = file_as {
            let sort = doc.remove_attr(creator, &attr).unwrap_or_default();
            refine(doc, md, &id, "file-as", sort.trim());
        }
    }

    let mut modified = None;
    for date in doc.children(md).to_vec() {
        if !is_dc(doc, date, "date") {
            continue;
        }
        let Some(attr) = opf_attr_name(doc, date, "event") else {
            continue;
        };
        let event = doc.remove_attr(date, &attr).unwrap_or_default();
        match event.to_ascii_lowercase().as_str() {
            "publication" | "" => {}
            "modification" => {
                modified.get_or_insert_with(|| doc.text_content(date).trim().to_string());
                doc.detach(date);
            }
            _ => doc.detach(date),
        }
    }
    let has_modified = doc
        .children_named(md, "meta")
        .into_iter()
        .any(|m| doc.attr(m, "property") == Some("dcterms:modified"));
    if !has_modified {
        let when = modified
            .as_deref()
            .and_then(parse_date)
            .unwrap_or_else(Utc::now);
        let value = when.format("%Y-%m-%dT%H:%M:%SZ").to_string();
        let meta = doc.append_text_element(md, "meta", &value);
        doc.set_attr(meta, "property", "dcterms:modified");
    }
}

/// Content-derived manifest properties of an XHTML document
fn content_properties(doc: &Document) -> BTreeSet<&'static str> {
    let mut found = BTreeSet::new();
    for node in doc.descendants(doc.root()) {
        let Some(el) = doc.element(node) else {
            continue;
        };
        if el.name == "epub:switch" {
            found.insert("switch");
            continue;
        }
        match el.local_name() {
            "svg" => {
                found.insert("svg");
            }
            "math" => {
                found.insert("mathml");
            }
            "script" | "form" => {
                found.insert("scripted");
            }
            _ => {}
        }
    }
    found
}

impl Transform for UpgradeOpf {
    fn name(&self) -> &'static str {
        "upgrade_opf"
    }

    fn description(&self) -> &'static str {
        "Upgrade an EPUB 2 package document to EPUB 3"
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        if book.container.opf().is_epub3() {
            ctx.log.debug("package is already EPUB 3");
            return Ok(());
        }

        let mut properties: Vec<(String, BTreeSet<&'static str>)> = Vec::new();
        let html_items: Vec<String> = book
            .manifest()
            .iter()
            .filter(|i| is_html(&i.media_type))
            .map(|i| i.href.clone())
            .collect();
        for name in html_items {
            ctx.checkpoint()?;
            match book.container.html(&name) {
                Ok(doc) => properties.push((name, content_properties(doc))),
                Err(e) => ctx.log.warn(format!("{name}: {e}")),
            }
        }

        let cover_id = {
            let opf = book.container.opf();
            let doc = &opf.metadata;
            doc.children_named(opf.metadata_element(), "meta")
                .into_iter()
                .find(|&m| doc.attr(m, "name") == Some("cover"))
                .and_then(|m| doc.attr(m, "content"))
                .map(str::to_string)
                .filter(|id| opf.manifest.get(id).is_some_and(|i| i.is_image()))
        };

        let opf = book.container.opf_mut();
        let md = opf.metadata_element();
        upgrade_metadata(&mut opf.metadata, md);
        for (name, found) in properties {
            if let Some(item) = opf.manifest.by_href_mut(&name) {
                for property in CONTENT_PROPERTIES {
                    if found.contains(property) {
                        item.properties.insert(property.to_string());
                    }
                }
            }
        }
        if opf.manifest.cover_image().is_none() {
            if let Some(id) = cover_id {
                opf.manifest.set_cover_image(Some(&id));
            }
        }
        opf.version = "3.0".to_string();
        ctx.log.info("upgraded package to EPUB 3");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opf::Package;
    use crate::transform::test_support::{book, context, xhtml};

    const METADATA: &str = r#"<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    <dc:identifier id="uid" opf:scheme="ISBN">9780000000002</dc:identifier>
    <dc:title>Hello</dc:title>
    <dc:creator opf:role="aut" opf:file-as="Doe, Jane">Jane Doe</dc:creator>
    <meta name="calibre:title_sort" content="Hello"/>
  </metadata>
  <manifest/><spine/>
</package>"#;

    fn upgraded() -> Book {
        let mut book = book(&[(
            "ch1.xhtml",
            &xhtml(r#"<svg xmlns="http://www.w3.org/2000/svg"><rect/></svg>"#),
        )]);
        let mut pkg = Package::parse_str(METADATA, "content.opf").unwrap();
        pkg.manifest = book.container.opf().manifest.clone();
        pkg.spine = book.container.opf().spine.clone();
        *book.container.opf_mut() = pkg;
        let (ctx, _dir) = context(vec![], &[]);
        UpgradeOpf.run(&mut book, &ctx).unwrap();
        book
    }

    #[test]
    fn test_upgrade_rewrites_metadata() {
        let book = upgraded();
        let xml = book.container.opf().to_xml("content.opf");
        assert!(xml.contains(r#"version="3.0""#));
        assert!(xml.contains(">urn:isbn:9780000000002</dc:identifier>"));
        assert!(!xml.contains("opf:scheme"));
        assert!(xml.contains(r##"<meta refines="#title1" property="title-type">main</meta>"##));
        assert!(xml.contains(r##"property="file-as">Hello</meta>"##));
        assert!(!xml.contains("calibre:title_sort"));
        assert!(xml.contains(r#"property="role" scheme="marc:relators">aut</meta>"#));
        assert!(xml.contains("dcterms:modified"));
        let item = book.manifest().by_href("ch1.xhtml").unwrap();
        assert!(item.properties.contains("svg"));
    }

    #[test]
    fn test_upgrade_is_idempotent() {
        let mut book = upgraded();
        let before = book.container.opf().to_xml("content.opf");
        let (ctx, _dir) = context(vec![], &[]);
        UpgradeOpf.run(&mut book, &ctx).unwrap();
        assert_eq!(book.container.opf().to_xml("content.opf"), before);
    }
}
