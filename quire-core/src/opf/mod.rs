//! The OPF package document.
//!
//! Manifest, spine and guide are lifted into typed values whose hrefs are
//! container names; `<metadata>` stays an XML tree so that refinements and
//! vendor metas survive untouched. [`metadata`] maps it to [`Metadata`].
//!
//! [`Metadata`]: crate::types::Metadata

pub mod metadata;
pub mod nav;
pub mod ncx;

use tracing::warn;

use crate::container::paths::{href_for_name, name_for_href, split_fragment};
use crate::dom::{Document, Flavor, NodeId};
use crate::error::ParseError;
use crate::types::{Guide, GuideReference, Manifest, ManifestItem, Spine};

pub const OPF_NS: &str = "http://www.idpf.org/2007/opf";
pub const DC_NS: &str = "http://purl.org/dc/elements/1.1/";

/// Id given to the unique identifier when the package lacks one
pub const DEFAULT_UID: &str = "uuid_id";

#[derive(Debug, Clone)]
pub struct Package {
    /// `2.0` or `3.0`
    pub version: String,
    /// Id of the `dc:identifier` that identifies the publication
    pub unique_identifier: String,
    pub prefix: Option<String>,
    pub lang: Option<String>,
    pub dir: Option<String>,
    /// Document whose document element is `<metadata>`
    pub metadata: Document,
    pub manifest: Manifest,
    pub spine: Spine,
    pub guide: Guide,
}

impl Default for Package {
    fn default() -> Self {
        Self::new()
    }
}

impl Package {
    /// An empty EPUB 2 package
    pub fn new() -> Self {
        Self {
            version: "2.0".to_string(),
            unique_identifier: DEFAULT_UID.to_string(),
            prefix: None,
            lang: None,
            dir: None,
            metadata: empty_metadata(),
            manifest: Manifest::new(),
            spine: Spine::default(),
            guide: Guide::default(),
        }
    }

    pub fn is_epub3(&self) -> bool {
        self.version.trim().starts_with('3')
    }

    /// The `<metadata>` element
    pub fn metadata_element(&self) -> NodeId {
        self.metadata
            .document_element()
            .unwrap_or_else(|| self.metadata.root())
    }

    pub fn parse_str(text: &str, opf_name: &str) -> Result<Self, ParseError> {
        let doc = Document::parse_xml(text).map_err(|e| e.in_file(opf_name))?;
        Self::parse(&doc, opf_name)
    }

    /// Read a parsed package document stored at `opf_name`
    pub fn parse(doc: &Document, opf_name: &str) -> Result<Self, ParseError> {
        let root = doc
            .document_element()
            .filter(|&r| doc.is(r, "package"))
            .ok_or_else(|| {
                ParseError::InvalidEbook(format!("{opf_name}: root element is not <package>"))
            })?;

        let mut pkg = Package::new();
        if let Some(v) = doc.attr(root, "version") {
            pkg.version = v.trim().to_string();
        }
        if let Some(uid) = doc.attr(root, "unique-identifier") {
            pkg.unique_identifier = uid.to_string();
        }
        pkg.prefix = doc.attr(root, "prefix").map(str::to_string);
        pkg.lang = doc.attr(root, "xml:lang").map(str::to_string);
        pkg.dir = doc.attr(root, "dir").map(str::to_string);

        if let Some(md) = doc.child_named(root, "metadata") {
            pkg.metadata = extract_metadata(doc, root, md);
        }

        if let Some(manifest) = doc.child_named(root, "manifest") {
            for item in doc.children_named(manifest, "item") {
                let (Some(id), Some(href)) = (doc.attr(item, "id"), doc.attr(item, "href")) else {
                    warn!(file = opf_name, "manifest item without id or href");
                    continue;
                };
                let Some(name) = name_for_href(href, opf_name) else {
                    warn!(file = opf_name, href, "skipping manifest item outside the book");
                    continue;
                };
                let media_type = doc
                    .attr(item, "media-type")
                    .map(str::to_string)
                    .unwrap_or_else(|| crate::types::media::guess_media_type(&name).to_string());
                let mut entry = ManifestItem::new(id, name, &media_type);
                if let Some(props) = doc.attr(item, "properties") {
                    entry.properties = props.split_whitespace().map(str::to_string).collect();
                }
                entry.fallback = doc.attr(item, "fallback").map(str::to_string);
                if let Err(e) = pkg.manifest.insert(entry) {
                    warn!(file = opf_name, "{e}");
                }
            }
        }

        if let Some(spine) = doc.child_named(root, "spine") {
            pkg.spine.toc = doc.attr(spine, "toc").map(str::to_string);
            pkg.spine.page_progression_direction = doc
                .attr(spine, "page-progression-direction")
                .map(str::to_string);
            for itemref in doc.children_named(spine, "itemref") {
                let Some(idref) = doc.attr(itemref, "idref") else {
                    continue;
                };
                if !pkg.manifest.contains_id(idref) {
                    warn!(file = opf_name, idref, "spine item not in manifest, dropped");
                    continue;
                }
                let linear = doc
                    .attr(itemref, "linear")
                    .map(|l| !l.trim().eq_ignore_ascii_case("no"))
                    .unwrap_or(true);
                pkg.spine.push(idref, linear);
            }
        }

        if let Some(guide) = doc.child_named(root, "guide") {
            for reference in doc.children_named(guide, "reference") {
                let (Some(kind), Some(href)) = (doc.attr(reference, "type"), doc.attr(reference, "href"))
                else {
                    continue;
                };
                let Some(name) = name_for_href(href, opf_name) else {
                    continue;
                };
                pkg.guide.references.push(GuideReference {
                    kind: kind.to_string(),
                    title: doc.attr(reference, "title").unwrap_or("").to_string(),
                    href: name,
                    fragment: split_fragment(href).1.map(str::to_string),
                });
            }
        }

        Ok(pkg)
    }

    /// Build the package document to be stored at `opf_name`
    pub fn to_document(&self, opf_name: &str) -> Document {
        let (mut doc, root) = Document::with_root("package", Flavor::Xml);
        doc.set_attr(root, "xmlns", OPF_NS);
        doc.set_attr(root, "version", &self.version);
        doc.set_attr(root, "unique-identifier", &self.unique_identifier);
        if let Some(prefix) = &self.prefix {
            doc.set_attr(root, "prefix", prefix);
        }
        if let Some(lang) = &self.lang {
            doc.set_attr(root, "xml:lang", lang);
        }
        if let Some(dir) = &self.dir {
            doc.set_attr(root, "dir", dir);
        }

        doc.import(root, &self.metadata, self.metadata_element());

        let manifest = doc.append_element(root, "manifest");
        for item in self.manifest.iter() {
            let el = doc.append_element(manifest, "item");
            doc.set_attr(el, "id", &item.id);
            doc.set_attr(el, "href", href_for_name(&item.href, opf_name));
            doc.set_attr(el, "media-type", &item.media_type);
            if !item.properties.is_empty() {
                let props: Vec<&str> = item.properties.iter().map(String::as_str).collect();
                doc.set_attr(el, "properties", props.join(" "));
            }
            if let Some(fallback) = &item.fallback {
                doc.set_attr(el, "fallback", fallback);
            }
        }

        let spine = doc.append_element(root, "spine");
        if let Some(toc) = self.spine.toc.as_ref().filter(|t| self.manifest.contains_id(t)) {
            doc.set_attr(spine, "toc", toc);
        }
        if let Some(ppd) = &self.spine.page_progression_direction {
            doc.set_attr(spine, "page-progression-direction", ppd);
        }
        for item in &self.spine.items {
            let el = doc.append_element(spine, "itemref");
            doc.set_attr(el, "idref", &item.idref);
            if !item.linear {
                doc.set_attr(el, "linear", "no");
            }
        }

        if !self.guide.is_empty() {
            let guide = doc.append_element(root, "guide");
            for reference in self.guide.iter() {
                let el = doc.append_element(guide, "reference");
                doc.set_attr(el, "type", &reference.kind);
                if !reference.title.is_empty() {
                    doc.set_attr(el, "title", &reference.title);
                }
                let mut href = href_for_name(&reference.href, opf_name);
                if let Some(fragment) = &reference.fragment {
                    href.push('#');
                    href.push_str(fragment);
                }
                doc.set_attr(el, "href", href);
            }
        }
        doc
    }

    pub fn to_xml(&self, opf_name: &str) -> String {
        self.to_document(opf_name).to_xml()
    }
}

fn empty_metadata() -> Document {
    let (mut doc, md) = Document::with_root("metadata", Flavor::Xml);
    doc.set_attr(md, "xmlns:dc", DC_NS);
    doc.set_attr(md, "xmlns:opf", OPF_NS);
    doc
}

/// Copy `<metadata>` into its own document, flattening the OPF 1.x
/// `dc-metadata`/`x-metadata` wrappers and carrying namespace declarations
/// made on `<package>`
fn extract_metadata(doc: &Document, package: NodeId, md: NodeId) -> Document {
    let (mut out, out_md) = Document::with_root("metadata", Flavor::Xml);
    if let Some(el) = doc.element(md) {
        for attr in &el.attrs {
            out.set_attr(out_md, &attr.name, attr.value.clone());
        }
    }
    if let Some(el) = doc.element(package) {
        for attr in el.attrs.iter().filter(|a| a.name.starts_with("xmlns:")) {
            if out.attr(out_md, &attr.name).is_none() {
                out.set_attr(out_md, &attr.name, attr.value.clone());
            }
        }
    }
    if out.attr(out_md, "xmlns:dc").is_none() {
        out.set_attr(out_md, "xmlns:dc", DC_NS);
    }
    if out.attr(out_md, "xmlns:opf").is_none() {
        out.set_attr(out_md, "xmlns:opf", OPF_NS);
    }
    for &child in doc.children(md) {
        if doc.is(child, "dc-metadata") || doc.is(child, "x-metadata") {
            for &grandchild in doc.children(child) {
                out.import(out_md, doc, grandchild);
            }
        } else {
            out.import(out_md, doc, child);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="BookId">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    <dc:title>Hello</dc:title>
    <dc:identifier id="BookId" opf:scheme="ISBN">9780000000002</dc:identifier>
  </metadata>
  <manifest>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="ch1" href="text/ch%201.xhtml" media-type="application/xhtml+xml"/>
    <item id="css" href="style.css" media-type="text/css"/>
  </manifest>
  <spine toc="ncx">
    <itemref idref="ch1"/>
    <itemref idref="missing"/>
  </spine>
  <guide>
    <reference type="start" title="Start" href="text/ch%201.xhtml#top"/>
  </guide>
</package>"#;

    #[test]
    fn test_parse_package() {
        let pkg = Package::parse_str(OPF, "OEBPS/content.opf").unwrap();
        assert_eq!(pkg.version, "2.0");
        assert_eq!(pkg.unique_identifier, "BookId");
        assert_eq!(pkg.manifest.len(), 3);
        assert_eq!(pkg.manifest.get("ch1").unwrap().href, "OEBPS/text/ch 1.xhtml");
        assert_eq!(pkg.spine.ids().collect::<Vec<_>>(), vec!["ch1"]);
        assert_eq!(pkg.spine.toc.as_deref(), Some("ncx"));
        let start = pkg.guide.get("start").unwrap();
        assert_eq!(start.href, "OEBPS/text/ch 1.xhtml");
        assert_eq!(start.fragment.as_deref(), Some("top"));
    }

    #[test]
    fn test_write_package_round_trip() {
        let pkg = Package::parse_str(OPF, "OEBPS/content.opf").unwrap();
        let xml = pkg.to_xml("OEBPS/content.opf");
        assert!(xml.contains(r#"<item id="ch1" href="text/ch%201.xhtml" media-type="application/xhtml+xml"/>"#));
        assert!(xml.contains(r#"<reference type="start" title="Start" href="text/ch%201.xhtml#top"/>"#));
        let again = Package::parse_str(&xml, "OEBPS/content.opf").unwrap();
        assert_eq!(again.manifest, pkg.manifest);
        assert_eq!(again.spine, pkg.spine);
        assert_eq!(again.guide, pkg.guide);
    }

    #[test]
    fn test_rejects_non_package() {
        let err = Package::parse_str("<html/>", "x.opf").unwrap_err();
        assert!(matches!(err, ParseError::InvalidEbook(_)));
    }
}
