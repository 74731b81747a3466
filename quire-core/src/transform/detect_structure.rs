//! Chapter, page break and start-of-text detection.

use crate::dom::{Document, NodeId, XPath};
use crate::error::Result;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::Book;

use super::{edit_spine, set_style, Transform};

const DEFAULT_CHAPTER: &str = "//*[((name()='h1' or name()='h2') and re:test(., '\\s*((chapter|book|section|part)\\s+)|((prolog|prologue|epilogue)(\\s+|$))', 'i')) or @class = 'chapter']";

const DEFAULT_PAGE_BREAKS: &str = "//*[name()='h1' or name()='h2']";

/// Longest paragraph, in characters, that can pass for a title line
const TITLE_LINE_MAX: usize = 60;

pub struct DetectStructure;

impl DetectStructure {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DetectStructure {
    fn default() -> Self {
        Self::new()
    }
}

struct Expressions {
    chapter: Option<XPath>,
    page_breaks: Option<XPath>,
    start: Option<XPath>,
    mark: String,
}

fn mark_chapter(doc: &mut Document, node: NodeId, mark: &str) {
    if let Some(el) = doc.element_mut(node) {
        el.add_class("chapter");
    }
    if matches!(mark, "pagebreak" | "both") {
        set_style(doc, node, "page-break-before", "always");
    }
    if matches!(mark, "rule" | "both") {
        let before = doc
            .prev_sibling(node)
            .filter(|&p| doc.is(p, "hr") && doc.attr(p, "class") == Some("chapter-rule"));
        if before.is_none() {
            let hr = doc.create_element_with("hr", &[("class", "chapter-rule")]);
            doc.insert_before(node, hr);
        }
    }
}

/// `<hr class="chapter">` markers: the element after each one starts a chapter
fn rule_marked(doc: &Document) -> Vec<NodeId> {
    doc.elements_by_name(doc.root(), "hr")
        .into_iter()
        .filter(|&hr| doc.element(hr).is_some_and(|e| e.has_class("chapter")))
        .filter_map(|hr| doc.next_element_sibling(hr))
        .collect()
}

fn headings(doc: &Document) -> Vec<NodeId> {
    doc.descendants(doc.root())
        .into_iter()
        .filter(|&n| doc.is(n, "h1") || doc.is(n, "h2"))
        .collect()
}

/// Short paragraphs that read like titles: no closing punctuation and every
/// word capitalized
fn is_title_line(text: &str) -> bool {
    let text = text.trim();
    if text.is_empty() || text.chars().count() > TITLE_LINE_MAX {
        return false;
    }
    if text.ends_with(['.', ',', ';', ':', '!', '?', '"']) {
        return false;
    }
    let words: Vec<&str> = text.split_whitespace().collect();
    words.len() <= 8
        && words.iter().any(|w| w.chars().any(char::is_alphabetic))
        && words.iter().all(|w| {
            w.chars()
                .find(|c| c.is_alphanumeric())
                .is_some_and(|c| c.is_uppercase() || c.is_numeric())
        })
}

fn title_lines(doc: &Document) -> Vec<NodeId> {
    let paragraphs = doc.elements_by_name(doc.root(), "p");
    let titles: Vec<NodeId> = paragraphs
        .iter()
        .copied()
        .filter(|&p| is_title_line(&doc.normalized_text(p)))
        .collect();
    // a text where most lines look like titles has no usable signal
    if titles.len() < 2 || titles.len() * 5 > paragraphs.len() {
        return Vec::new();
    }
    titles
}

impl DetectStructure {
    fn expressions(&self, ctx: &StageContext) -> Result<Expressions> {
        Ok(Expressions {
            chapter: ctx.options.xpath("chapter")?,
            page_breaks: ctx.options.xpath("page_breaks_before")?,
            start: ctx.options.xpath("start_reading_at")?,
            mark: ctx.options.str("chapter_mark").unwrap_or("pagebreak").to_string(),
        })
    }

    /// Heuristic chapter starts for books the chapter expression misses
    fn heuristic(&self, book: &mut Book, ctx: &StageContext, mark: &str) -> Result<usize> {
        let mut marked = 0;
        edit_spine(book, ctx, |_, doc| {
            let found = rule_marked(doc);
            if found.is_empty() {
                return Ok(false);
            }
            for node in &found {
                mark_chapter(doc, *node, mark);
            }
            marked += found.len();
            Ok(true)
        })?;
        if marked > 0 {
            return Ok(marked);
        }

        let mut heading_count = 0;
        for name in book.spine_names() {
            if let Ok(doc) = book.container.html(&name) {
                heading_count += headings(doc).len();
            }
        }
        if heading_count >= 2 {
            edit_spine(book, ctx, |_, doc| {
                let found = headings(doc);
                for node in &found {
                    mark_chapter(doc, *node, mark);
                }
                marked += found.len();
                Ok(!found.is_empty())
            })?;
            return Ok(marked);
        }

        edit_spine(book, ctx, |_, doc| {
            let found = title_lines(doc);
            for node in &found {
                if let Some(el) = doc.element_mut(*node) {
                    el.name = "h2".to_string();
                }
                mark_chapter(doc, *node, mark);
            }
            marked += found.len();
            Ok(!found.is_empty())
        })?;
        Ok(marked)
    }
}

impl Transform for DetectStructure {
    fn name(&self) -> &'static str {
        "detect_structure"
    }

    fn description(&self) -> &'static str {
        "Mark chapters, insert page breaks and find the start of the text"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![
            OptionDef::xpath("chapter", Some(DEFAULT_CHAPTER), "Elements that start chapters"),
            OptionDef::choice(
                "chapter_mark",
                &["pagebreak", "rule", "both", "none"],
                "pagebreak",
                "How detected chapters are marked",
            ),
            OptionDef::xpath(
                "page_breaks_before",
                Some(DEFAULT_PAGE_BREAKS),
                "Elements that get a page break before them",
            ),
            OptionDef::xpath("start_reading_at", None, "First element of the main text"),
        ]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        let expr = self.expressions(ctx)?;
        let mut chapters = 0;
        let mut start: Option<(String, String)> = None;

        edit_spine(book, ctx, |name, doc| {
            let mut changed = false;
            if let Some(xpath) = &expr.chapter {
                let found = xpath.select(doc, doc.root());
                for node in &found {
                    mark_chapter(doc, *node, &expr.mark);
                }
                chapters += found.len();
                changed |= !found.is_empty();
            }
            if let Some(xpath) = &expr.page_breaks {
                for node in xpath.select(doc, doc.root()) {
                    set_style(doc, node, "page-break-before", "always");
                    changed = true;
                }
            }
            if start.is_none() {
                if let Some(xpath) = &expr.start {
                    if let Some(&node) = xpath.select(doc, doc.root()).first() {
                        let id = doc.ensure_id(node, "start");
                        start = Some((name.to_string(), id));
                        changed = true;
                    }
                }
            }
            Ok(changed)
        })?;

        if chapters == 0 && expr.chapter.is_some() {
            let found = self.heuristic(book, ctx, &expr.mark)?;
            if found > 0 {
                ctx.log.info(format!("heuristics found {found} chapter starts"));
            }
        } else {
            ctx.log.debug(format!("{chapters} chapter starts matched"));
        }

        if let Some((name, fragment)) = start {
            book.container
                .opf_mut()
                .guide
                .set("text", "Start", name, Some(fragment));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};

    #[test]
    fn test_chapter_expression_and_start() {
        let mut book = book(&[(
            "a.xhtml",
            &xhtml("<h1>Chapter 1</h1><p>x</p><h2>Notes</h2><p id=\"s\">Begin</p>"),
        )]);
        let (ctx, _dir) = context(
            DetectStructure.options(),
            &[("start_reading_at", "//h:p[2]")],
        );
        DetectStructure.run(&mut book, &ctx).unwrap();

        let html = book.container.read_text("a.xhtml").unwrap();
        assert!(html.contains(r#"<h1 class="chapter" style="page-break-before: always">"#), "{html}");
        assert!(html.contains(r#"<h2 style="page-break-before: always">Notes</h2>"#), "{html}");
        let text = book.guide().get("text").unwrap();
        assert_eq!(text.fragment.as_deref(), Some("s"));

        DetectStructure.run(&mut book, &ctx).unwrap();
        assert_eq!(book.container.read_text("a.xhtml").unwrap(), html);
    }

    #[test]
    fn test_hr_marker_heuristic() {
        let mut book = book(&[(
            "a.xhtml",
            &xhtml(r#"<p>intro</p><hr class="chapter"/><p>One</p><hr class="chapter"/><p>Two</p>"#),
        )]);
        let (ctx, _dir) = context(DetectStructure.options(), &[("chapter_mark", "none")]);
        DetectStructure.run(&mut book, &ctx).unwrap();
        let html = book.container.read_text("a.xhtml").unwrap();
        assert_eq!(html.matches(r#"<p class="chapter">"#).count(), 2, "{html}");
    }

    #[test]
    fn test_title_lines_become_headings() {
        let mut body = String::new();
        for title in ["The Beginning", "Into The Woods"] {
            body.push_str(&format!("<p>{title}</p>"));
            for _ in 0..5 {
                body.push_str("<p>Some ordinary sentence, with a comma.</p>");
            }
        }
        let mut book = book(&[("a.xhtml", &xhtml(&body))]);
        let (ctx, _dir) = context(DetectStructure.options(), &[("chapter_mark", "none")]);
        DetectStructure.run(&mut book, &ctx).unwrap();
        let html = book.container.read_text("a.xhtml").unwrap();
        assert!(html.contains(r#"<h2 class="chapter">Into The Woods</h2>"#), "{html}");
    }

    #[test]
    fn test_title_line_shapes() {
        assert!(is_title_line("Part II"));
        assert!(!is_title_line("It was a dark night."));
        assert!(!is_title_line("lowercase words here"));
    }
}
