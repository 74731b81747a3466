//! EPUB 3 navigation document.

use crate::container::paths::{href_for_name, name_for_href, split_fragment};
use crate::dom::{Document, NodeId};
use crate::types::{Guide, TocNode};

pub const OPS_NS: &str = "http://www.idpf.org/2007/ops";

fn nav_type(doc: &Document, node: NodeId) -> Option<&str> {
    doc.element(node)?.attr_local("type")
}

/// The `<nav epub:type="toc">` element, else the first `<nav>`
fn toc_nav(doc: &Document) -> Option<NodeId> {
    let navs = doc.elements_by_name(doc.root(), "nav");
    navs.iter()
        .copied()
        .find(|&n| nav_type(doc, n).is_some_and(|t| t.split_whitespace().any(|t| t == "toc")))
        .or_else(|| navs.first().copied())
}

/// Read the table of contents of a navigation document named `nav_name`
pub fn read_nav(doc: &Document, nav_name: &str) -> TocNode {
    let mut root = TocNode::root();
    if let Some(list) = toc_nav(doc).and_then(|n| doc.find_first(n, "ol")) {
        read_list(doc, list, nav_name, &mut root);
    }
    root
}

fn read_list(doc: &Document, list: NodeId, base: &str, into: &mut TocNode) {
    for item in doc.children_named(list, "li") {
        let label = doc
            .child_named(item, "a")
            .or_else(|| doc.child_named(item, "span"));
        let href = label.and_then(|l| doc.attr(l, "href")).unwrap_or("");
        let mut node = TocNode {
            title: label.map(|l| doc.normalized_text(l)).unwrap_or_default(),
            href: name_for_href(href, base),
            fragment: split_fragment(href.trim()).1.map(str::to_string),
            id: doc.attr(item, "id").map(str::to_string),
            children: Vec::new(),
        };
        if let Some(sub) = doc.child_named(item, "ol") {
            read_list(doc, sub, base, &mut node);
        }
        into.children.push(node);
    }
}

fn write_list(doc: &mut Document, parent: NodeId, node: &TocNode, base: &str) {
    let ol = doc.append_element(parent, "ol");
    for child in &node.children {
        let li = doc.append_element(ol, "li");
        match &child.href {
            Some(href) => {
                let a = doc.append_text_element(li, "a", &child.title);
                let mut value = href_for_name(href, base);
                if let Some(fragment) = &child.fragment {
                    value.push('#');
                    value.push_str(fragment);
                }
                doc.set_attr(a, "href", value);
            }
            None => {
                doc.append_text_element(li, "span", &child.title);
            }
        }
        if !child.children.is_empty() {
            write_list(doc, li, child, base);
        }
    }
}

/// Build a navigation document with a toc nav and, when the guide is not
/// empty, a landmarks nav
pub fn write_nav(
    toc: &TocNode,
    guide: &Guide,
    nav_name: &str,
    title: &str,
    lang: Option<&str>,
) -> Document {
    let (mut doc, body) = Document::xhtml_skeleton(title, lang);
    if let Some(html) = doc.document_element() {
        doc.set_attr(html, "xmlns:epub", OPS_NS);
    }
    let nav = doc.append_element(body, "nav");
    doc.set_attr(nav, "epub:type", "toc");
    doc.set_attr(nav, "id", "toc");
    doc.append_text_element(nav, "h1", title);
    write_list(&mut doc, nav, toc, nav_name);

    if !guide.is_empty() {
        let landmarks = doc.append_element(body, "nav");
        doc.set_attr(landmarks, "epub:type", "landmarks");
        doc.set_attr(landmarks, "hidden", "");
        let ol = doc.append_element(landmarks, "ol");
        for reference in guide.iter() {
            let li = doc.append_element(ol, "li");
            let a = doc.append_text_element(li, "a", &reference.title);
            doc.set_attr(a, "epub:type", landmark_type(&reference.kind));
            let mut value = href_for_name(&reference.href, nav_name);
            if let Some(fragment) = &reference.fragment {
                value.push('#');
                value.push_str(fragment);
            }
            doc.set_attr(a, "href", value);
        }
    }
    doc
}

fn landmark_type(guide_kind: &str) -> &str {
    match guide_kind {
        "text" => "bodymatter",
        "title-page" | "titlepage" => "titlepage",
        "copyright-page" => "copyright-page",
        other => other,
    }
}

/// Replace the list of the toc nav in an existing navigation document,
/// leaving its other content alone. Returns false if it has no `<nav>`.
pub fn update_nav(doc: &mut Document, toc: &TocNode, nav_name: &str) -> bool {
    let Some(nav) = toc_nav(doc) else {
        return false;
    };
    for list in doc.children_named(nav, "ol") {
        doc.detach(list);
    }
    write_list(doc, nav, toc, nav_name);
    true
}
