//! EPUB 2 navigation control file.

use crate::container::paths::{href_for_name, name_for_href, split_fragment};
use crate::dom::{Document, Flavor, NodeId};
use crate::types::TocNode;

pub const NCX_NS: &str = "http://www.daisy.org/z3986/2005/ncx/";

/// Read the `<navMap>` of an NCX document named `ncx_name`
pub fn read_ncx(doc: &Document, ncx_name: &str) -> TocNode {
    let mut root = TocNode::root();
    if let Some(nav_map) = doc.find_first(doc.root(), "navMap") {
        read_points(doc, nav_map, ncx_name, &mut root);
    }
    root
}

fn read_points(doc: &Document, parent: NodeId, base: &str, into: &mut TocNode) {
    for point in doc.children_named(parent, "navPoint") {
        let title = doc
            .child_named(point, "navLabel")
            .and_then(|l| doc.child_named(l, "text"))
            .map(|t| doc.normalized_text(t))
            .unwrap_or_default();
        let src = doc
            .child_named(point, "content")
            .and_then(|c| doc.attr(c, "src"))
            .unwrap_or("");
        let mut node = TocNode {
            title,
            href: name_for_href(src, base),
            fragment: split_fragment(src.trim()).1.map(str::to_string),
            id: doc.attr(point, "id").map(str::to_string),
            children: Vec::new(),
        };
        read_points(doc, point, base, &mut node);
        if node.href.is_none() && node.title.is_empty() && node.children.is_empty() {
            continue;
        }
        into.children.push(node);
    }
}

/// Build an NCX document for `toc`, to be stored as `ncx_name`
pub fn write_ncx(toc: &TocNode, ncx_name: &str, uid: &str, title: &str) -> Document {
    let (mut doc, ncx) = Document::with_root("ncx", Flavor::Xml);
    doc.set_attr(ncx, "xmlns", NCX_NS);
    doc.set_attr(ncx, "version", "2005-1");
    let head = doc.append_element(ncx, "head");
    for (name, content) in [
        ("dtb:uid", uid.to_string()),
        ("dtb:depth", toc.depth().max(1).to_string()),
        ("dtb:totalPageCount", "0".to_string()),
        ("dtb:maxPageNumber", "0".to_string()),
    ] {
        let meta = doc.append_element(head, "meta");
        doc.set_attr(meta, "name", name);
        doc.set_attr(meta, "content", content);
    }
    let doc_title = doc.append_element(ncx, "docTitle");
    doc.append_text_element(doc_title, "text", title);
    let nav_map = doc.append_element(ncx, "navMap");
    let mut play_order = 0;
    write_points(&mut doc, nav_map, toc, ncx_name, &mut play_order);
    doc
}

fn write_points(doc: &mut Document, parent: NodeId, node: &TocNode, base: &str, order: &mut usize) {
    for child in &node.children {
        *order += 1;
        let point = doc.append_element(parent, "navPoint");
        let id = child.id.clone().unwrap_or_else(|| format!("np-{order}"));
        doc.set_attr(point, "id", id);
        doc.set_attr(point, "playOrder", order.to_string());
        let label = doc.append_element(point, "navLabel");
        doc.append_text_element(label, "text", &child.title);
        let content = doc.append_element(point, "content");
        let mut src = child
            .href
            .as_deref()
            .map(|h| href_for_name(h, base))
            .unwrap_or_default();
        if let Some(fragment) = &child.fragment {
            src.push('#');
            src.push_str(fragment);
        }
        doc.set_attr(content, "src", src);
        write_points(doc, point, child, base, order);
    }
}
