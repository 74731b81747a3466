//! Writing a [`Document`] back to text.

use std::borrow::Cow;
use std::fmt::Write as _;

use super::{Document, Flavor, NodeData, NodeId, VOID_ELEMENTS};

/// Attribute written on every element when serializing for selector matching
pub(crate) const NODE_MARKER: &str = "data-quire-node";

/// Escape `&`, `<` and `>` in character data
pub fn escape_text(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn escape_attr(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>', '"']) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

impl Document {
    /// Serialize with an XML declaration
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        for &child in self.children(self.root()) {
            self.write_node(child, &mut out, false);
            if !matches!(self.data(child), NodeData::Text(_)) {
                out.push('\n');
            }
        }
        out
    }

    /// Serialize a single node and its subtree
    pub fn outer_xml(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.write_node(id, &mut out, false);
        out
    }

    /// Serialize the children of a node
    pub fn inner_xml(&self, id: NodeId) -> String {
        let mut out = String::new();
        for &child in self.children(id) {
            self.write_node(child, &mut out, false);
        }
        out
    }

    /// Serialization carrying a [`NODE_MARKER`] attribute with each element's id
    pub(crate) fn to_marked_html(&self) -> String {
        let mut out = String::new();
        for &child in self.children(self.root()) {
            self.write_node(child, &mut out, true);
        }
        out
    }

    fn write_node(&self, id: NodeId, out: &mut String, marked: bool) {
        match self.data(id) {
            NodeData::Document => {
                for &child in self.children(id) {
                    self.write_node(child, out, marked);
                }
            }
            NodeData::Element(el) => {
                out.push('<');
                out.push_str(&el.name);
                for attr in &el.attrs {
                    let _ = write!(out, " {}=\"{}\"", attr.name, escape_attr(&attr.value));
                }
                if marked {
                    let _ = write!(out, " {}=\"{}\"", NODE_MARKER, id.index());
                }
                let children = self.children(id);
                if children.is_empty() && self.self_closes(el.local_name()) {
                    out.push_str("/>");
                    return;
                }
                out.push('>');
                for &child in children {
                    self.write_node(child, out, marked);
                }
                out.push_str("</");
                out.push_str(&el.name);
                out.push('>');
            }
            NodeData::Text(text) => out.push_str(&escape_text(text)),
            NodeData::Comment(text) => {
                // "--" is not allowed inside XML comments
                let _ = write!(out, "<!--{}-->", text.replace("--", "- -"));
            }
            NodeData::Doctype(text) => {
                let _ = write!(out, "<!DOCTYPE {}>", text);
            }
            NodeData::ProcessingInstruction { target, data } => {
                let _ = write!(out, "<?{} {}?>", target, data);
            }
        }
    }

    fn self_closes(&self, local: &str) -> bool {
        match self.flavor() {
            Flavor::Xml => true,
            Flavor::Xhtml => VOID_ELEMENTS.contains(&local.to_ascii_lowercase().as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xhtml_empty_elements() {
        let doc = Document::parse_html("<html><body><div/><br/><p>a &amp; b</p></body></html>");
        let body = doc.body().unwrap();
        assert_eq!(
            doc.inner_xml(body),
            "<div></div><br/><p>a &amp; b</p>"
        );
    }

    #[test]
    fn test_xml_round_trip() {
        let src = "<package version=\"2.0\"><metadata><dc:title>A &lt; B</dc:title></metadata><spine/></package>";
        let doc = Document::parse_xml(src).unwrap();
        let out = doc.to_xml();
        assert!(out.starts_with("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n"));
        assert!(out.contains(src));
    }

    #[test]
    fn test_marked_output() {
        let doc = Document::parse_html("<html><body><p>x</p></body></html>");
        let p = doc.find_first(doc.root(), "p").unwrap();
        let marked = doc.to_marked_html();
        assert!(marked.contains(&format!("<p {}=\"{}\">", NODE_MARKER, p.index())));
    }
}
