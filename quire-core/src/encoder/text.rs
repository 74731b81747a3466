//! Rendering XHTML documents as plain text or markdown, shared by the
//! text-based output formats.

use crate::dom::{Document, NodeData, NodeId};
use crate::error::Result;
use crate::types::Book;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TextStyle {
    Plain,
    Markdown,
}

/// A paragraph of output. Preformatted blocks are never re-wrapped.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TextBlock {
    pub text: String,
    pub preformatted: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct TextRenderer {
    pub style: TextStyle,
    /// Markdown only: keep external links as `[text](href)`
    pub keep_links: bool,
    /// Markdown only: keep images as `![alt](src)`
    pub keep_images: bool,
}

const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "body", "center", "dd", "div", "dl", "dt", "figcaption",
    "figure", "footer", "form", "header", "li", "main", "nav", "ol", "p", "section", "table",
    "tbody", "td", "tfoot", "th", "thead", "tr", "ul",
];

const SKIPPED: &[&str] = &["head", "script", "style", "title", "noscript"];

#[derive(Default)]
struct State {
    blocks: Vec<TextBlock>,
    inline: String,
}

impl State {
    fn flush(&mut self) {
        let text = self
            .inline
            .lines()
            .map(str::trim)
            .collect::<Vec<_>>()
            .join("\n");
        let text = text.trim_matches('\n');
        if !text.is_empty() {
            self.blocks.push(TextBlock {
                text: text.to_string(),
                preformatted: false,
            });
        }
        self.inline.clear();
    }

    fn push_text(&mut self, text: &str) {
        let mut last_space = self.inline.is_empty() || self.inline.ends_with([' ', '\n']);
        for c in text.chars() {
            if c.is_whitespace() {
                if !last_space {
                    self.inline.push(' ');
                    last_space = true;
                }
            } else {
                self.inline.push(c);
                last_space = false;
            }
        }
    }

    fn push_raw(&mut self, text: &str) {
        self.inline.push_str(text);
    }
}

impl TextRenderer {
    pub fn new(style: TextStyle) -> Self {
        Self {
            style,
            keep_links: false,
            keep_images: false,
        }
    }

    fn markdown(&self) -> bool {
        self.style == TextStyle::Markdown
    }

    /// Blocks of every spine document, in reading order
    pub fn render_book(&self, book: &mut Book) -> Result<Vec<TextBlock>> {
        let mut blocks = Vec::new();
        for name in book.spine_names() {
            let doc = book.container.html(&name)?;
            blocks.extend(self.render(doc));
        }
        Ok(blocks)
    }

    pub fn render(&self, doc: &Document) -> Vec<TextBlock> {
        let mut state = State::default();
        let start = doc.body().unwrap_or_else(|| doc.root());
        self.walk(doc, start, &mut state);
        state.flush();
        state.blocks
    }

    fn children(&self, doc: &Document, node: NodeId, state: &mut State) {
        for &child in doc.children(node) {
            self.walk(doc, child, state);
        }
    }

    /// Render `node`'s children into their own blocks
    fn nested(&self, doc: &Document, node: NodeId) -> Vec<TextBlock> {
        let mut inner = State::default();
        self.children(doc, node, &mut inner);
        inner.flush();
        inner.blocks
    }

    fn walk(&self, doc: &Document, node: NodeId, state: &mut State) {
        let element = match doc.data(node) {
            NodeData::Text(text) => {
                state.push_text(text);
                return;
            }
            NodeData::Element(e) => e,
            NodeData::Document => {
                self.children(doc, node, state);
                return;
            }
            _ => return,
        };
        let name = element.local_name().to_ascii_lowercase();
        let name = name.as_str();
        if SKIPPED.contains(&name) {
            return;
        }
        match name {
            "br" => state.push_raw("\n"),
            "hr" => {
                state.flush();
                state.blocks.push(TextBlock {
                    text: "* * *".into(),
                    preformatted: true,
                });
            }
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                state.flush();
                if self.markdown() {
                    let level = name[1..].parse::<usize>().unwrap_or(1);
                    state.push_raw(&format!("{} ", "#".repeat(level)));
                }
                self.children(doc, node, state);
                state.inline = state.inline.replace('\n', " ");
                state.flush();
            }
            "pre" => {
                state.flush();
                let code = doc.text_content(node);
                let code = code.trim_end_matches('\n');
                let text = if self.markdown() {
                    format!("```\n{code}\n```")
                } else {
                    code.to_string()
                };
                state.blocks.push(TextBlock {
                    text,
                    preformatted: true,
                });
            }
            "blockquote" => {
                state.flush();
                for mut block in self.nested(doc, node) {
                    if self.markdown() {
                        block.text = block
                            .text
                            .lines()
                            .map(|l| format!("> {l}"))
                            .collect::<Vec<_>>()
                            .join("\n");
                    }
                    state.blocks.push(block);
                }
            }
            "ul" | "ol" => {
                state.flush();
                let ordered = name == "ol";
                let start: usize = doc.attr(node, "start").and_then(|s| s.parse().ok()).unwrap_or(1);
                let items = doc.element_children(node).into_iter().filter(|&c| doc.is(c, "li"));
                for (i, li) in items.enumerate() {
                    let marker = if ordered { format!("{}. ", start + i) } else { "* ".to_string() };
                    let indent = " ".repeat(marker.len());
                    let text = self
                        .nested(doc, li)
                        .into_iter()
                        .map(|b| b.text)
                        .collect::<Vec<_>>()
                        .join("\n");
                    let text = text
                        .lines()
                        .enumerate()
                        .map(|(n, l)| if n == 0 { format!("{marker}{l}") } else { format!("{indent}{l}") })
                        .collect::<Vec<_>>()
                        .join("\n");
                    if !text.trim().is_empty() {
                        state.blocks.push(TextBlock {
                            text,
                            preformatted: false,
                        });
                    }
                }
            }
            "em" | "i" | "cite" | "strong" | "b" | "code" | "tt" if self.markdown() => {
                let mark = match name {
                    "strong" | "b" => "**",
                    "code" | "tt" => "`",
                    _ => "*",
                };
                let mut inner = State::default();
                self.children(doc, node, &mut inner);
                let text = inner.inline.trim();
                if !text.is_empty() {
                    if !state.inline.is_empty() && !state.inline.ends_with([' ', '\n']) && inner.inline.starts_with(' ') {
                        state.push_raw(" ");
                    }
                    state.push_raw(&format!("{mark}{text}{mark}"));
                    if inner.inline.ends_with(' ') {
                        state.push_raw(" ");
                    }
                }
            }
            "a" if self.markdown() && self.keep_links => {
                let href = doc.attr(node, "href").filter(|h| crate::container::paths::is_external(h));
                match href {
                    Some(href) => {
                        let mut inner = State::default();
                        self.children(doc, node, &mut inner);
                        let text = inner.inline.trim().to_string();
                        state.push_text(" ");
                        state.push_raw(&format!("[{text}]({href})"));
                    }
                    None => self.children(doc, node, state),
                }
            }
            "img" | "image" => {
                let alt = doc.attr(node, "alt").unwrap_or("").trim();
                if self.markdown() && self.keep_images {
                    let src = doc
                        .attr(node, "src")
                        .or_else(|| doc.element(node).and_then(|e| e.attr_local("href")))
                        .unwrap_or("");
                    state.push_raw(&format!("![{alt}]({src})"));
                } else if !alt.is_empty() {
                    state.push_text(alt);
                }
            }
            _ if BLOCK_ELEMENTS.contains(&name) => {
                state.flush();
                self.children(doc, node, state);
                state.flush();
            }
            _ => self.children(doc, node, state),
        }
    }
}

/// Greedy word wrap of every line longer than `width` characters
pub(crate) fn wrap(text: &str, width: usize) -> String {
    if width == 0 {
        return text.to_string();
    }
    let mut out = Vec::new();
    for line in text.lines() {
        if line.chars().count() <= width {
            out.push(line.to_string());
            continue;
        }
        let mut current = String::new();
        for word in line.split(' ') {
            let len = current.chars().count();
            if len > 0 && len + 1 + word.chars().count() > width {
                out.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        out.push(current);
    }
    out.join("\n")
}

/// Join blocks into one text with blank lines between them
pub(crate) fn join_blocks(blocks: &[TextBlock], width: usize) -> String {
    let mut out = blocks
        .iter()
        .map(|b| if b.preformatted { b.text.clone() } else { wrap(&b.text, width) })
        .collect::<Vec<_>>()
        .join("\n\n");
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::xhtml;

    fn render(style: TextStyle, body: &str) -> String {
        let doc = Document::parse_xhtml(&xhtml(body)).unwrap();
        let mut renderer = TextRenderer::new(style);
        renderer.keep_links = true;
        join_blocks(&renderer.render(&doc), 0)
    }

    #[test]
    fn test_plain() {
        let body = "<h1>Title</h1><p>Some   <em>styled</em>\n text.<br/>Next line.</p><ul><li>one</li><li>two</li></ul>";
        assert_eq!(
            render(TextStyle::Plain, body),
            "Title\n\nSome styled text.\nNext line.\n\n* one\n\n* two\n"
        );
    }

    #[test]
    fn test_markdown() {
        let body = r#"<h2>Part</h2><p>A <strong>bold</strong> and <a href="https://x.org">link</a>.</p><blockquote><p>Quoted</p></blockquote><ol><li>first</li></ol><pre>code
  block</pre>"#;
        assert_eq!(
            render(TextStyle::Markdown, body),
            "## Part\n\nA **bold** and [link](https://x.org).\n\n> Quoted\n\n1. first\n\n```\ncode\n  block\n```\n"
        );
    }

    #[test]
    fn test_wrap() {
        assert_eq!(wrap("aaa bbb ccc", 7), "aaa bbb\nccc");
        assert_eq!(wrap("short", 10), "short");
        assert_eq!(wrap("longword x", 3), "longword\nx");
    }
}
