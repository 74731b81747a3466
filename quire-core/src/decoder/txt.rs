//! Plain text and markdown decoder.
//!
//! Text is split into paragraphs according to `paragraph_type`, then either
//! kept as is, scanned for chapter headings, or rendered as markdown. Each
//! chapter becomes its own XHTML file.

use std::path::Path;

use encoding_rs::Encoding;
use pulldown_cmark::{html, Options, Parser};

use super::{file_title, has_extension, BookBuilder, Decoder};
use crate::container::paths;
use crate::container::text::decode_text;
use crate::dom::Document;
use crate::error::{ConversionError, Result};
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::{Book, Metadata, TocNode};

const FORMATTING: &[&str] = &["auto", "plain", "heuristic", "markdown"];
const PARAGRAPHS: &[&str] = &["auto", "block", "single", "print", "unformatted"];
const MARKDOWN_EXTENSIONS: &[&str] = &["md", "markdown", "mdown", "mkd", "mkdn"];

/// Decoder for TXT and markdown files
pub struct TxtDecoder;

impl TxtDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TxtDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// A unit of text recovered from a flat stream
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TextBlock {
    Heading(u8, String),
    Paragraph(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParagraphType {
    Block,
    Single,
    Print,
    Unformatted,
}

/// Guess how paragraphs are separated
fn detect_paragraph_type(text: &str) -> ParagraphType {
    let lines: Vec<&str> = text.lines().collect();
    let content = lines.iter().filter(|l| !l.trim().is_empty()).count().max(1);
    let blank = lines.len() - content.min(lines.len());
    let indented = lines
        .iter()
        .filter(|l| l.starts_with([' ', '\t']) && !l.trim().is_empty())
        .count();
    if blank * 4 >= content {
        ParagraphType::Block
    } else if indented * 4 >= content {
        ParagraphType::Print
    } else if lines.iter().map(|l| l.len()).sum::<usize>() / content > 120 {
        ParagraphType::Single
    } else {
        ParagraphType::Unformatted
    }
}

fn ends_sentence(line: &str) -> bool {
    line.trim_end()
        .ends_with(['.', '!', '?', '"', '\'', '\u{201d}', '\u{2019}', ':'])
}

fn join(lines: &[&str]) -> String {
    lines
        .iter()
        .flat_map(|l| l.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split text into paragraphs
fn split_paragraphs(text: &str, kind: ParagraphType) -> Vec<String> {
    match kind {
        ParagraphType::Block => super::paragraphs(text),
        ParagraphType::Single => text
            .lines()
            .map(|l| l.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|l| !l.is_empty())
            .collect(),
        ParagraphType::Print => {
            let mut out = Vec::new();
            let mut current: Vec<&str> = Vec::new();
            for line in text.lines() {
                let starts_new = line.starts_with([' ', '\t']) || line.trim().is_empty();
                if starts_new && !current.is_empty() {
                    out.push(join(&current));
                    current.clear();
                }
                if !line.trim().is_empty() {
                    current.push(line);
                }
            }
            if !current.is_empty() {
                out.push(join(&current));
            }
            out
        }
        ParagraphType::Unformatted => {
            // hard-wrapped text: a line shorter than the wrap width that ends a
            // sentence closes its paragraph
            let mut widths: Vec<usize> = text.lines().map(|l| l.trim_end().len()).filter(|&w| w > 0).collect();
            widths.sort_unstable();
            let wrap = widths.get(widths.len() * 3 / 4).copied().unwrap_or(0);
            let mut out = Vec::new();
            let mut current: Vec<&str> = Vec::new();
            for line in text.lines() {
                if line.trim().is_empty() {
                    if !current.is_empty() {
                        out.push(join(&current));
                        current.clear();
                    }
                    continue;
                }
                current.push(line);
                if ends_sentence(line) && line.trim_end().len() * 10 < wrap * 8 {
                    out.push(join(&current));
                    current.clear();
                }
            }
            if !current.is_empty() {
                out.push(join(&current));
            }
            out
        }
    }
}

const HEADING_KEYWORDS: &[&str] = &[
    "chapter", "part", "section", "book", "volume", "prologue", "epilogue", "introduction",
    "conclusion", "preface", "appendix", "foreword", "afterword",
];

const ROMAN: &[&str] = &["I.", "II.", "III.", "IV.", "V.", "VI.", "VII.", "VIII.", "IX.", "X."];

/// Heading level of a short line that looks like a chapter title
pub(crate) fn heading_level(text: &str) -> Option<u8> {
    let text = text.trim();
    if text.is_empty()
        || text.chars().count() >= 100
        || text.ends_with(['.', '?', '!', ',', ';'])
    {
        return None;
    }
    let lower = text.to_lowercase();
    let keyword = HEADING_KEYWORDS.iter().any(|k| lower.starts_with(k));
    let all_caps = text.chars().count() < 60
        && text.chars().any(|c| c.is_alphabetic())
        && text.chars().filter(|c| c.is_alphabetic()).all(|c| c.is_uppercase());
    let numbered = text.chars().next().is_some_and(|c| c.is_numeric()) && text.chars().count() < 40;
    let roman = ROMAN.iter().any(|r| text.starts_with(r));
    if !(keyword || all_caps || numbered || roman) {
        return None;
    }
    if lower.starts_with("book ") || lower.starts_with("part ") || lower.starts_with("volume ") {
        Some(1)
    } else if lower.starts_with("section ") {
        Some(3)
    } else {
        Some(2)
    }
}

/// Classify paragraphs, turning likely chapter titles into headings
pub(crate) fn heuristic_blocks(paragraphs: Vec<String>) -> Vec<TextBlock> {
    paragraphs
        .into_iter()
        .map(|p| match heading_level(&p) {
            Some(level) => TextBlock::Heading(level, p),
            None => TextBlock::Paragraph(p),
        })
        .collect()
}

/// Chapters of blocks, split before every level 1 or 2 heading
pub(crate) fn split_chapters(blocks: Vec<TextBlock>) -> Vec<(Option<String>, Vec<TextBlock>)> {
    let mut chapters: Vec<(Option<String>, Vec<TextBlock>)> = Vec::new();
    for block in blocks {
        match &block {
            TextBlock::Heading(level, title) if *level <= 2 => {
                chapters.push((Some(title.clone()), vec![block]));
            }
            _ => match chapters.last_mut() {
                Some((_, body)) => body.push(block),
                None => chapters.push((None, vec![block])),
            },
        }
    }
    chapters
}

/// Add one XHTML file per chapter, with a TOC entry for each titled one
pub(crate) fn add_chapters(
    builder: &mut BookBuilder,
    book_title: &str,
    lang: Option<&str>,
    blocks: Vec<TextBlock>,
) -> Result<()> {
    let chapters = split_chapters(blocks);
    if chapters.is_empty() {
        let (doc, _) = Document::xhtml_skeleton(book_title, lang);
        builder.add_document("index.xhtml", &doc)?;
        return Ok(());
    }
    for (i, (title, blocks)) in chapters.into_iter().enumerate() {
        let (mut doc, body) = Document::xhtml_skeleton(title.as_deref().unwrap_or(book_title), lang);
        let mut anchor = None;
        for block in blocks {
            match block {
                TextBlock::Heading(level, text) => {
                    let h = doc.append_text_element(body, &format!("h{}", level.clamp(1, 6)), &text);
                    if anchor.is_none() {
                        anchor = Some(doc.ensure_id(h, "heading"));
                    }
                }
                TextBlock::Paragraph(text) => {
                    doc.append_text_element(body, "p", &text);
                }
            }
        }
        let name = builder.add_document(&format!("chapter{:03}.xhtml", i + 1), &doc)?;
        if let Some(title) = title {
            let mut node = TocNode::new(title, name);
            if let Some(anchor) = anchor {
                node = node.with_fragment(anchor);
            }
            builder.toc_mut().add_child(node);
        }
    }
    Ok(())
}

fn looks_like_markdown(text: &str) -> bool {
    let mut hits = 0;
    let mut in_fence = false;
    for line in text.lines() {
        let line = line.trim_start();
        if line.starts_with("```") {
            in_fence = !in_fence;
            hits += 1;
        } else if !in_fence
            && (line.starts_with("# ") || line.starts_with("## ") || line.starts_with("> ") || line.starts_with("* "))
        {
            hits += 1;
        }
    }
    hits >= 3
}

/// Markdown source split before each top-level heading
fn markdown_chapters(text: &str) -> Vec<&str> {
    let mut starts = vec![0];
    let mut in_fence = false;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        } else if !in_fence && line.starts_with("# ") && offset > 0 {
            starts.push(offset);
        }
        offset += line.len();
    }
    starts.push(text.len());
    starts
        .windows(2)
        .map(|w| &text[w[0]..w[1]])
        .filter(|chunk| !chunk.trim().is_empty())
        .collect()
}

fn render_markdown(source: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_FOOTNOTES);
    options.insert(Options::ENABLE_HEADING_ATTRIBUTES);
    let mut out = String::new();
    html::push_html(&mut out, Parser::new_ext(source, options));
    out
}

fn add_markdown(
    builder: &mut BookBuilder,
    text: &str,
    base: &Path,
    fallback_title: &str,
    lang: Option<&str>,
) -> Result<String> {
    let mut book_title = None;
    for (i, chunk) in markdown_chapters(text).into_iter().enumerate() {
        let rendered = Document::parse_html(&render_markdown(chunk));
        let Some(rendered_body) = rendered.body() else {
            continue;
        };
        let heading = rendered
            .find_first(rendered_body, "h1")
            .or_else(|| rendered.find_first(rendered_body, "h2"));
        let title = heading.map(|h| rendered.normalized_text(h));
        if book_title.is_none() {
            book_title = title.clone();
        }
        let (mut doc, body) = Document::xhtml_skeleton(title.as_deref().unwrap_or(fallback_title), lang);
        for &child in rendered.children(rendered_body) {
            doc.import(body, &rendered, child);
        }
        let anchor = doc
            .find_first(body, "h1")
            .or_else(|| doc.find_first(body, "h2"))
            .map(|h| doc.ensure_id(h, "heading"));

        for img in doc.elements_by_name(body, "img") {
            let Some(src) = doc.attr(img, "src").map(str::to_string) else {
                continue;
            };
            if paths::is_external(&src) {
                continue;
            }
            let Some(name) = paths::normalize_name(&src) else {
                continue;
            };
            let path = base.join(&name);
            if path.is_file() && !builder.container_mut().exists(&name) {
                builder.add_resource(&name, &std::fs::read(&path)?, None)?;
            }
        }

        let name = builder.add_document(&format!("chapter{:03}.xhtml", i + 1), &doc)?;
        if let Some(title) = title {
            let mut node = TocNode::new(title, name);
            if let Some(anchor) = anchor {
                node = node.with_fragment(anchor);
            }
            builder.toc_mut().add_child(node);
        }
    }
    Ok(book_title.unwrap_or_else(|| fallback_title.to_string()))
}

/// Read a text file in the requested encoding, else by detection
pub(crate) fn read_text(bytes: &[u8], encoding: Option<&str>) -> Result<String> {
    let text = match encoding {
        Some(label) => {
            let encoding = Encoding::for_label(label.as_bytes()).ok_or_else(|| ConversionError::InvalidOption {
                name: "input_encoding".into(),
                message: format!("unknown encoding '{label}'"),
            })?;
            encoding.decode(bytes).0.into_owned()
        }
        None => decode_text(bytes),
    };
    Ok(text.replace("\r\n", "\n").replace('\r', "\n"))
}

impl Decoder for TxtDecoder {
    fn name(&self) -> &'static str {
        "txt"
    }

    fn supported_extensions(&self) -> &[&'static str] {
        &["txt", "text", "md", "markdown", "mdown", "mkd", "mkdn"]
    }

    fn supported_mime_types(&self) -> &[&'static str] {
        &["text/plain", "text/markdown", "text/x-markdown"]
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![
            OptionDef::string("input_encoding", None, "Encoding of the input text, detected when unset"),
            OptionDef::choice("formatting_type", FORMATTING, "auto", "How to interpret the text"),
            OptionDef::choice("paragraph_type", PARAGRAPHS, "auto", "How paragraphs are separated"),
        ]
    }

    fn decode(&self, input: &Path, ctx: &StageContext) -> Result<Book> {
        let bytes = std::fs::read(input)?;
        let text = read_text(&bytes, ctx.options.str("input_encoding"))?;
        let fallback_title = file_title(input);
        let mut builder = BookBuilder::new(ctx)?;

        let formatting = match ctx.options.str("formatting_type").unwrap_or("auto") {
            "auto" if has_extension(input, MARKDOWN_EXTENSIONS) || looks_like_markdown(&text) => "markdown",
            "auto" => "heuristic",
            other => other,
        };
        ctx.log.debug(format!("formatting text as {formatting}"));

        let title = if formatting == "markdown" {
            let base = input.parent().unwrap_or(Path::new("."));
            add_markdown(&mut builder, &text, base, &fallback_title, None)?
        } else {
            let kind = match ctx.options.str("paragraph_type").unwrap_or("auto") {
                "block" => ParagraphType::Block,
                "single" => ParagraphType::Single,
                "print" => ParagraphType::Print,
                "unformatted" => ParagraphType::Unformatted,
                _ => detect_paragraph_type(&text),
            };
            let paragraphs = split_paragraphs(&text, kind);
            let blocks = if formatting == "heuristic" {
                heuristic_blocks(paragraphs)
            } else {
                paragraphs.into_iter().map(TextBlock::Paragraph).collect()
            };
            add_chapters(&mut builder, &fallback_title, None, blocks)?;
            fallback_title
        };
        builder.finish(&Metadata {
            title,
            ..Metadata::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::context;

    #[test]
    fn test_paragraph_types() {
        let block = "One\ntwo\n\nThree\n";
        assert_eq!(detect_paragraph_type(block), ParagraphType::Block);
        assert_eq!(split_paragraphs(block, ParagraphType::Block), vec!["One two", "Three"]);

        let print = "  First line\ncontinues.\n  Second\ngoes on.\n";
        assert_eq!(detect_paragraph_type(print), ParagraphType::Print);
        assert_eq!(
            split_paragraphs(print, ParagraphType::Print),
            vec!["First line continues.", "Second goes on."]
        );

        assert_eq!(split_paragraphs("a\nb\n", ParagraphType::Single), vec!["a", "b"]);
    }

    #[test]
    fn test_unformatted_reflow() {
        let text = "This is a long hard wrapped line of text that\nkeeps going for a while until it ends.\nShort end.\nNext paragraph starts here and it is long\nenough to be wrapped as well okay.\n";
        let paras = split_paragraphs(text, ParagraphType::Unformatted);
        assert_eq!(paras.len(), 2);
        assert!(paras[0].ends_with("Short end."));
    }

    #[test]
    fn test_heading_level() {
        assert_eq!(heading_level("Chapter 1"), Some(2));
        assert_eq!(heading_level("INTRODUCTION"), Some(2));
        assert_eq!(heading_level("Part I"), Some(1));
        assert_eq!(heading_level("Section 3.1"), Some(3));
        assert_eq!(
            heading_level("This is a regular paragraph that continues for a while and discusses various topics."),
            None
        );
    }

    #[test]
    fn test_heuristic_chapters() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("my_book.txt");
        std::fs::write(&input, "Chapter 1\n\nIt began.\n\nChapter 2\n\nIt ended.\n").unwrap();
        let decoder = TxtDecoder::new();
        let (ctx, _tmp) = context(decoder.options(), &[]);
        let mut book = decoder.decode(&input, &ctx).unwrap();
        assert_eq!(book.spine_names(), vec!["chapter001.xhtml", "chapter002.xhtml"]);
        assert_eq!(book.title(), "my book");
        let toc = book.toc().clone();
        assert_eq!(toc.children.len(), 2);
        assert_eq!(toc.children[1].title, "Chapter 2");
        assert!(book.check_integrity().is_ok());
    }

    #[test]
    fn test_markdown() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("notes.md");
        std::fs::write(&input, "# Title\n\nSome *text*.\n\n![pic](img/a.png)\n\n# Second\n\n```\n# not a heading\n```\n").unwrap();
        std::fs::create_dir(dir.path().join("img")).unwrap();
        std::fs::write(dir.path().join("img/a.png"), b"\x89PNG\r\n\x1a\n").unwrap();
        let decoder = TxtDecoder::new();
        let (ctx, _tmp) = context(decoder.options(), &[]);
        let mut book = decoder.decode(&input, &ctx).unwrap();
        assert_eq!(book.title(), "Title");
        assert_eq!(book.spine().len(), 2);
        assert!(book.container.exists("img/a.png"));
        let html = book.container.read_text("chapter001.xhtml").unwrap();
        assert!(html.contains("<em>text</em>"));
    }

    #[test]
    fn test_explicit_encoding() {
        assert_eq!(read_text(b"caf\xe9\r\n", Some("latin1")).unwrap(), "café\n");
        assert!(read_text(b"x", Some("nope")).unwrap_err().is_usage());
    }
}
