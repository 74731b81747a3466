//! Arena-backed document tree shared by XHTML, OPF, NCX, SVG and other XML.
//!
//! Nodes live in a `Vec` and reference each other by [`NodeId`]; detached
//! nodes simply stay in the arena until the document is dropped.

mod entities;
mod parse;
mod select;
mod serialize;
pub mod xpath;

pub use select::{SelectorError, SelectorMatcher};
pub use xpath::{XPath, XPathError};

pub use serialize::escape_text;

/// Namespace of XHTML documents
pub const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";

/// HTML elements that never have content
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Index of a node inside its [`Document`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }

    pub(crate) fn from_index(index: usize) -> Self {
        NodeId(index)
    }
}

/// How empty elements are written back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    /// Generic XML: every empty element is self-closed
    Xml,
    /// XHTML: only void elements are self-closed
    Xhtml,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub value: String,
}

/// An element with its qualified name (`dc:title`, `svg`, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub name: String,
    pub attrs: Vec<Attribute>,
}

impl Element {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
        }
    }

    /// Name without namespace prefix, lowercased for HTML comparisons
    pub fn local_name(&self) -> &str {
        local_part(&self.name)
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|a| a.name == name)
            .map(|a| a.value.as_str())
    }

    /// Look an attribute up by local name, ignoring any prefix
    pub fn attr_local(&self, local: &str) -> Option<&str> {
        self.attr(local).or_else(|| {
            self.attrs
                .iter()
                .find(|a| local_part(&a.name) == local)
                .map(|a| a.value.as_str())
        })
    }

    pub fn set_attr(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|a| a.name == name) {
            Some(attr) => attr.value = value,
            None => self.attrs.push(Attribute {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let pos = self.attrs.iter().position(|a| a.name == name)?;
        Some(self.attrs.remove(pos).value)
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map(|c| c.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }

    pub fn add_class(&mut self, class: &str) {
        if self.has_class(class) {
            return;
        }
        let value = match self.attr("class") {
            Some(existing) if !existing.trim().is_empty() => {
                format!("{} {}", existing.trim(), class)
            }
            _ => class.to_string(),
        };
        self.set_attr("class", value);
    }
}

pub(crate) fn local_part(name: &str) -> &str {
    name.rsplit_once(':').map(|(_, l)| l).unwrap_or(name)
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Document,
    Element(Element),
    Text(String),
    Comment(String),
    Doctype(String),
    ProcessingInstruction { target: String, data: String },
}

#[derive(Debug, Clone)]
struct Node {
    data: NodeData,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

/// A parsed XML or XHTML document
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
    flavor: Flavor,
}

impl Document {
    /// An empty document holding only the document node
    pub fn new(flavor: Flavor) -> Self {
        Self {
            nodes: vec![Node {
                data: NodeData::Document,
                parent: None,
                children: Vec::new(),
            }],
            flavor,
        }
    }

    /// A document whose document element is `name`
    pub fn with_root(name: &str, flavor: Flavor) -> (Self, NodeId) {
        let mut doc = Self::new(flavor);
        let el = doc.create_element(name);
        doc.append(doc.root(), el);
        (doc, el)
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn set_flavor(&mut self, flavor: Flavor) {
        self.flavor = flavor;
    }

    /// The document node
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// The outermost element
    pub fn document_element(&self) -> Option<NodeId> {
        self.children(self.root())
            .iter()
            .copied()
            .find(|&c| self.element(c).is_some())
    }

    pub fn data(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0].data
    }

    pub fn data_mut(&mut self, id: NodeId) -> &mut NodeData {
        &mut self.nodes[id.0].data
    }

    pub fn element(&self, id: NodeId) -> Option<&Element> {
        match &self.nodes[id.0].data {
            NodeData::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn element_mut(&mut self, id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[id.0].data {
            NodeData::Element(el) => Some(el),
            _ => None,
        }
    }

    pub fn is_element(&self, id: NodeId) -> bool {
        self.element(id).is_some()
    }

    /// Qualified element name
    pub fn name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(|e| e.name.as_str())
    }

    /// Element name without prefix
    pub fn local_name(&self, id: NodeId) -> Option<&str> {
        self.element(id).map(Element::local_name)
    }

    /// True if `id` is an element with the given local name (ASCII case-insensitive)
    pub fn is(&self, id: NodeId, local: &str) -> bool {
        self.local_name(id)
            .map(|n| n.eq_ignore_ascii_case(local))
            .unwrap_or(false)
    }

    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.element(id).and_then(|e| e.attr(name))
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: impl Into<String>) {
        if let Some(el) = self.element_mut(id) {
            el.set_attr(name, value);
        }
    }

    pub fn remove_attr(&mut self, id: NodeId, name: &str) -> Option<String> {
        self.element_mut(id).and_then(|e| e.remove_attr(name))
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0].parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.0].children
    }

    pub fn element_children(&self, id: NodeId) -> Vec<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .filter(|&c| self.is_element(c))
            .collect()
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).first().copied()
    }

    pub fn index_in_parent(&self, id: NodeId) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent).iter().position(|&c| c == id)
    }

    pub fn prev_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let idx = self.index_in_parent(id)?;
        idx.checked_sub(1).map(|i| self.children(parent)[i])
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let idx = self.index_in_parent(id)?;
        self.children(parent).get(idx + 1).copied()
    }

    /// Next sibling element, skipping whitespace-only text and comments.
    /// Returns `None` if non-blank text intervenes.
    pub fn next_element_sibling(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = self.next_sibling(id);
        while let Some(node) = cur {
            match self.data(node) {
                NodeData::Element(_) => return Some(node),
                NodeData::Text(t) if !t.trim().is_empty() => return None,
                _ => cur = self.next_sibling(node),
            }
        }
        None
    }

    /// Ancestors from the parent up to the document node
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cur = self.parent(id);
        while let Some(p) = cur {
            out.push(p);
            cur = self.parent(p);
        }
        out
    }

    /// True if the node is reachable from the document node
    pub fn is_attached(&self, id: NodeId) -> bool {
        id == self.root() || self.ancestors(id).last() == Some(&self.root())
    }

    /// All descendants of `id` in document order, excluding `id`
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(node) = stack.pop() {
            out.push(node);
            stack.extend(self.children(node).iter().rev().copied());
        }
        out
    }

    /// Element descendants with the given local name, in document order
    pub fn elements_by_name(&self, id: NodeId, local: &str) -> Vec<NodeId> {
        self.descendants(id)
            .into_iter()
            .filter(|&n| self.is(n, local))
            .collect()
    }

    pub fn find_first(&self, id: NodeId, local: &str) -> Option<NodeId> {
        self.descendants(id).into_iter().find(|&n| self.is(n, local))
    }

    /// First child element with the given local name
    pub fn child_named(&self, id: NodeId, local: &str) -> Option<NodeId> {
        self.children(id).iter().copied().find(|&c| self.is(c, local))
    }

    pub fn children_named(&self, id: NodeId, local: &str) -> Vec<NodeId> {
        self.children(id)
            .iter()
            .copied()
            .filter(|&c| self.is(c, local))
            .collect()
    }

    /// Element with the given `id` attribute
    pub fn element_by_id(&self, value: &str) -> Option<NodeId> {
        self.descendants(self.root())
            .into_iter()
            .find(|&n| self.attr(n, "id") == Some(value))
    }

    /// `<head>` of an XHTML document
    pub fn head(&self) -> Option<NodeId> {
        self.find_first(self.root(), "head")
    }

    /// `<body>` of an XHTML document
    pub fn body(&self) -> Option<NodeId> {
        self.find_first(self.root(), "body")
    }

    /// Concatenated text of all descendant text nodes
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        if let NodeData::Text(t) = self.data(id) {
            return t.clone();
        }
        for node in self.descendants(id) {
            if let NodeData::Text(t) = self.data(node) {
                out.push_str(t);
            }
        }
        out
    }

    /// Text content with runs of whitespace collapsed
    pub fn normalized_text(&self, id: NodeId) -> String {
        self.text_content(id)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn push(&mut self, data: NodeData) -> NodeId {
        self.nodes.push(Node {
            data,
            parent: None,
            children: Vec::new(),
        });
        NodeId(self.nodes.len() - 1)
    }

    pub fn create_element(&mut self, name: &str) -> NodeId {
        self.push(NodeData::Element(Element::new(name)))
    }

    /// Create an element with attributes in one go
    pub fn create_element_with(&mut self, name: &str, attrs: &[(&str, &str)]) -> NodeId {
        let id = self.create_element(name);
        for (k, v) in attrs {
            self.set_attr(id, k, *v);
        }
        id
    }

    pub fn create_text(&mut self, text: impl Into<String>) -> NodeId {
        self.push(NodeData::Text(text.into()))
    }

    pub fn create_comment(&mut self, text: impl Into<String>) -> NodeId {
        self.push(NodeData::Comment(text.into()))
    }

    pub(crate) fn create_node(&mut self, data: NodeData) -> NodeId {
        self.push(data)
    }

    /// Remove `id` from its parent. The node stays valid and can be re-inserted.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent.take() {
            self.nodes[parent.0].children.retain(|&c| c != id);
        }
    }

    pub fn append(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    pub fn prepend(&mut self, parent: NodeId, child: NodeId) {
        self.detach(child);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.insert(0, child);
    }

    /// Insert `child` immediately before `reference`
    pub fn insert_before(&mut self, reference: NodeId, child: NodeId) {
        let Some(parent) = self.parent(reference) else {
            return;
        };
        self.detach(child);
        let idx = self.index_in_parent(reference).unwrap_or(0);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.insert(idx, child);
    }

    /// Insert `child` immediately after `reference`
    pub fn insert_after(&mut self, reference: NodeId, child: NodeId) {
        let Some(parent) = self.parent(reference) else {
            return;
        };
        self.detach(child);
        let idx = self.index_in_parent(reference).map(|i| i + 1).unwrap_or(0);
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.insert(idx, child);
    }

    /// Put `new` where `old` was and detach `old`
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        self.insert_before(old, new);
        self.detach(old);
    }

    /// Replace an element with its children
    pub fn unwrap(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.children(id).to_vec();
        for child in children {
            self.insert_before(id, child);
        }
        self.detach(id);
    }

    /// Move all children of `from` to the end of `to`
    pub fn move_children(&mut self, from: NodeId, to: NodeId) {
        let children: Vec<NodeId> = self.children(from).to_vec();
        for child in children {
            self.append(to, child);
        }
    }

    pub fn remove_children(&mut self, id: NodeId) {
        let children: Vec<NodeId> = self.children(id).to_vec();
        for child in children {
            self.detach(child);
        }
    }

    /// Replace all children with a single text node
    pub fn set_text(&mut self, id: NodeId, text: impl Into<String>) {
        self.remove_children(id);
        let t = self.create_text(text);
        self.append(id, t);
    }

    /// Append a new element as the last child of `parent`
    pub fn append_element(&mut self, parent: NodeId, name: &str) -> NodeId {
        let el = self.create_element(name);
        self.append(parent, el);
        el
    }

    /// Append a new element containing `text`
    pub fn append_text_element(&mut self, parent: NodeId, name: &str, text: &str) -> NodeId {
        let el = self.append_element(parent, name);
        if !text.is_empty() {
            let t = self.create_text(text);
            self.append(el, t);
        }
        el
    }

    pub fn append_text(&mut self, parent: NodeId, text: &str) {
        if let Some(&last) = self.children(parent).last() {
            if let NodeData::Text(existing) = &mut self.nodes[last.0].data {
                existing.push_str(text);
                return;
            }
        }
        let t = self.create_text(text);
        self.append(parent, t);
    }

    /// Deep-copy a subtree of `other` under `parent` in this document
    pub fn import(&mut self, parent: NodeId, other: &Document, node: NodeId) -> NodeId {
        let copy = self.push(other.data(node).clone());
        self.append(parent, copy);
        for &child in other.children(node) {
            self.import(copy, other, child);
        }
        copy
    }

    /// A new document containing a deep copy of the subtree rooted at `node`
    pub fn extract(&self, node: NodeId) -> Document {
        let mut doc = Document::new(self.flavor);
        let root = doc.root();
        doc.import(root, self, node);
        doc
    }

    /// Document-order index of every attached node
    pub fn document_order(&self) -> std::collections::HashMap<NodeId, usize> {
        let mut order = std::collections::HashMap::new();
        order.insert(self.root(), 0);
        for (i, n) in self.descendants(self.root()).into_iter().enumerate() {
            order.insert(n, i + 1);
        }
        order
    }

    /// Create an id attribute on `id` if it lacks one, avoiding existing ids.
    pub fn ensure_id(&mut self, id: NodeId, prefix: &str) -> String {
        if let Some(existing) = self.attr(id, "id") {
            return existing.to_string();
        }
        let taken: std::collections::HashSet<String> = self
            .descendants(self.root())
            .into_iter()
            .filter_map(|n| self.attr(n, "id").map(str::to_string))
            .collect();
        let value = (1..)
            .map(|n| format!("{prefix}{n}"))
            .find(|candidate| !taken.contains(candidate))
            .unwrap_or_else(|| prefix.to_string());
        self.set_attr(id, "id", value.clone());
        value
    }

    /// A minimal XHTML document with `<head><title>` and an empty `<body>`
    pub fn xhtml_skeleton(title: &str, lang: Option<&str>) -> (Document, NodeId) {
        let (mut doc, html) = Document::with_root("html", Flavor::Xhtml);
        doc.set_attr(html, "xmlns", XHTML_NS);
        if let Some(lang) = lang {
            doc.set_attr(html, "xml:lang", lang);
        }
        let head = doc.append_element(html, "head");
        doc.append_text_element(head, "title", title);
        let body = doc.append_element(html, "body");
        (doc, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_editing() {
        let (mut doc, body) = Document::xhtml_skeleton("T", None);
        let p1 = doc.append_text_element(body, "p", "one");
        let p2 = doc.append_text_element(body, "p", "two");
        let div = doc.create_element("div");
        doc.insert_before(p1, div);
        doc.append(div, p1);
        assert_eq!(doc.children(body), &[div, p2]);
        doc.unwrap(div);
        assert_eq!(doc.children(body), &[p1, p2]);
        assert_eq!(doc.text_content(body), "onetwo");
        assert!(!doc.is_attached(div));
    }

    #[test]
    fn test_ensure_id_avoids_collisions() {
        let (mut doc, body) = Document::xhtml_skeleton("T", None);
        let a = doc.append_element(body, "h1");
        doc.set_attr(a, "id", "toc1");
        let b = doc.append_element(body, "h1");
        assert_eq!(doc.ensure_id(b, "toc"), "toc2");
        assert_eq!(doc.ensure_id(a, "toc"), "toc1");
    }

    #[test]
    fn test_classes() {
        let mut el = Element::new("p");
        el.add_class("chapter");
        el.add_class("chapter");
        el.add_class("x");
        assert_eq!(el.attr("class"), Some("chapter x"));
        assert!(el.has_class("x"));
    }

    #[test]
    fn test_import_deep_copies() {
        let (src, body) = Document::xhtml_skeleton("T", None);
        let (mut dst, dbody) = Document::xhtml_skeleton("U", None);
        let copied = dst.import(dbody, &src, body);
        assert!(dst.is(copied, "body"));
        assert_eq!(dst.children(dbody).len(), 1);
    }
}
