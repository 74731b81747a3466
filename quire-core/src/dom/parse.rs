//! Building a [`Document`] from XML or HTML text.

use std::collections::HashMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::entities::{internal_entities, unescape};
use super::{Attribute, Document, Element, Flavor, NodeData, NodeId, VOID_ELEMENTS, XHTML_NS};
use crate::error::ParseError;
use crate::patterns::SELF_CLOSING_TAG;

impl Document {
    /// Parse well-formed XML. Named HTML entities and entities declared in an
    /// internal DTD subset are expanded.
    pub fn parse_xml(text: &str) -> Result<Document, ParseError> {
        parse_xml_with(text, Flavor::Xml)
    }

    /// Parse XHTML that must be well-formed
    pub fn parse_xhtml(text: &str) -> Result<Document, ParseError> {
        parse_xml_with(text, Flavor::Xhtml)
    }

    /// Parse HTML with error recovery. Well-formed XHTML is taken as is,
    /// anything else goes through an HTML5 parser.
    pub fn parse_html(text: &str) -> Document {
        Self::parse_html_with_errors(text).0
    }

    /// Like [`Document::parse_html`], also returning the recovery messages
    /// produced by the HTML5 parser.
    pub fn parse_html_with_errors(text: &str) -> (Document, Vec<String>) {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        if let Ok(doc) = parse_xml_with(text, Flavor::Xhtml) {
            let is_html = doc
                .document_element()
                .map(|root| doc.is(root, "html"))
                .unwrap_or(false);
            if is_html && doc.body().is_some() {
                return (doc, Vec::new());
            }
        }
        parse_html5(text)
    }
}

fn parse_xml_with(text: &str, flavor: Flavor) -> Result<Document, ParseError> {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = Reader::from_str(text);
    let mut doc = Document::new(flavor);
    let mut stack: Vec<NodeId> = vec![doc.root()];
    let mut entities: HashMap<String, String> = HashMap::new();

    let line_at = |pos: usize| text[..pos.min(text.len())].matches('\n').count() + 1;

    loop {
        let parent = *stack.last().unwrap_or(&NodeId::from_index(0));
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let el = element_from(&e, &entities);
                let id = doc.create_node(NodeData::Element(el));
                doc.append(parent, id);
                stack.push(id);
            }
            Ok(Event::Empty(e)) => {
                let el = element_from(&e, &entities);
                let id = doc.create_node(NodeData::Element(el));
                doc.append(parent, id);
            }
            Ok(Event::End(_)) => {
                if stack.len() <= 1 {
                    return Err(ParseError::malformed(
                        None,
                        Some(line_at(reader.buffer_position() as usize)),
                        "unexpected closing tag",
                    ));
                }
                stack.pop();
            }
            Ok(Event::Text(t)) => {
                let raw = String::from_utf8_lossy(&t);
                if parent == doc.root() {
                    continue;
                }
                let value = unescape(&raw, &entities);
                doc.append_text(parent, &value);
            }
            Ok(Event::CData(c)) => {
                if parent != doc.root() {
                    let raw = String::from_utf8_lossy(&c);
                    doc.append_text(parent, &raw);
                }
            }
            Ok(Event::Comment(c)) => {
                let raw = String::from_utf8_lossy(&c).into_owned();
                let id = doc.create_comment(raw);
                doc.append(parent, id);
            }
            Ok(Event::DocType(d)) => {
                let raw = String::from_utf8_lossy(&d).into_owned();
                entities.extend(internal_entities(&raw));
                // the internal subset is dropped once its entities are expanded
                let public = raw.split('[').next().unwrap_or("").trim().to_string();
                let id = doc.create_node(NodeData::Doctype(public));
                doc.append(doc.root(), id);
            }
            Ok(Event::Eof) => break,
            // XML declarations and processing instructions are regenerated on output
            Ok(_) => {}
            Err(e) => {
                return Err(ParseError::malformed(
                    None,
                    Some(line_at(reader.buffer_position() as usize)),
                    e.to_string(),
                ));
            }
        }
    }

    if stack.len() > 1 {
        return Err(ParseError::malformed(
            None,
            Some(line_at(text.len())),
            "unclosed element at end of document",
        ));
    }
    if doc.document_element().is_none() {
        return Err(ParseError::malformed(None, None, "no root element"));
    }
    Ok(doc)
}

fn element_from(e: &BytesStart<'_>, entities: &HashMap<String, String>) -> Element {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut el = Element::new(name);
    for attr in e.attributes().with_checks(false).flatten() {
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let raw = String::from_utf8_lossy(&attr.value);
        let value = unescape(&raw, entities).into_owned();
        if el.attr(&key).is_none() {
            el.attrs.push(Attribute { name: key, value });
        }
    }
    el
}

/// Expand `<div/>` style self-closing tags of non-void elements, which an
/// HTML5 parser would otherwise treat as unclosed start tags.
fn expand_self_closing(text: &str) -> std::borrow::Cow<'_, str> {
    SELF_CLOSING_TAG.replace_all(text, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        let attrs = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        if VOID_ELEMENTS.contains(&name.to_ascii_lowercase().as_str()) {
            caps[0].to_string()
        } else {
            format!("<{name}{attrs}></{name}>")
        }
    })
}

fn parse_html5(text: &str) -> (Document, Vec<String>) {
    let expanded = expand_self_closing(text);
    let html = scraper::Html::parse_document(&expanded);
    let errors = html.errors.iter().map(|e| e.to_string()).collect();

    let mut doc = Document::new(Flavor::Xhtml);
    let root = doc.root();
    for child in html.tree.root().children() {
        convert_node(&mut doc, root, child);
    }
    if let Some(html_el) = doc.document_element() {
        if doc.attr(html_el, "xmlns").is_none() {
            doc.set_attr(html_el, "xmlns", XHTML_NS);
        }
    }
    (doc, errors)
}

fn convert_node(doc: &mut Document, parent: NodeId, node: ego_tree::NodeRef<'_, scraper::Node>) {
    match node.value() {
        scraper::Node::Element(el) => {
            let id = doc.create_element(el.name());
            for (name, value) in el.attrs() {
                doc.set_attr(id, name, value);
            }
            doc.append(parent, id);
            for child in node.children() {
                convert_node(doc, id, child);
            }
        }
        scraper::Node::Text(text) => {
            if parent != doc.root() {
                doc.append_text(parent, &**text);
            }
        }
        scraper::Node::Comment(comment) => {
            let id = doc.create_comment(&**comment);
            doc.append(parent, id);
        }
        scraper::Node::Doctype(doctype) => {
            let id = doc.create_node(NodeData::Doctype(doctype.name().to_string()));
            doc.append(parent, id);
        }
        _ => {
            for child in node.children() {
                convert_node(doc, parent, child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_xml_with_entities() {
        let doc = Document::parse_xml(
            "<?xml version='1.0'?><!DOCTYPE r [<!ENTITY who \"World\">]><r a=\"x &amp; y\">Hello &who;&nbsp;!</r>",
        )
        .unwrap();
        let root = doc.document_element().unwrap();
        assert_eq!(doc.attr(root, "a"), Some("x & y"));
        assert_eq!(doc.text_content(root), "Hello World\u{a0}!");
    }

    #[test]
    fn test_parse_xml_rejects_mismatched_tags() {
        let err = Document::parse_xml("<a>\n<b></a>").unwrap_err();
        assert!(matches!(err, ParseError::Malformed { .. }));
    }

    #[test]
    fn test_parse_html_recovers() {
        let doc = Document::parse_html("<p>one<br>two<p>three");
        let body = doc.body().unwrap();
        let ps = doc.elements_by_name(body, "p");
        assert_eq!(ps.len(), 2);
        assert_eq!(doc.elements_by_name(body, "br").len(), 1);
    }

    #[test]
    fn test_parse_html_expands_self_closing_div() {
        let doc = Document::parse_html("<html><body><div/><p>after</p><br></body></html>");
        let body = doc.body().unwrap();
        let div = doc.find_first(body, "div").unwrap();
        assert!(doc.children(div).is_empty());
        let p = doc.find_first(body, "p").unwrap();
        assert_eq!(doc.parent(p), Some(body));
    }

    #[test]
    fn test_parse_xhtml_keeps_namespaced_attrs() {
        let src = r#"<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops"><head><title>T</title></head><body><section epub:type="chapter"/></body></html>"#;
        let doc = Document::parse_html(src);
        let section = doc.find_first(doc.root(), "section").unwrap();
        assert_eq!(doc.attr(section, "epub:type"), Some("chapter"));
    }
}
