//! CSS flattening: every rule that applies to an element is resolved into
//! its inline `style`, with font sizes and margins in points.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::container::paths::{href_for_name, name_for_href};
use crate::container::Parsed;
use crate::css::values::{font_size_to_pt, format_pt, length_to_pt, specificity};
use crate::css::{
    parse_declarations, rewrite_urls, serialize_declarations, AtRule, Declaration, Rule,
    StyleRule, Stylesheet,
};
use crate::dom::{Document, NodeId, SelectorMatcher};
use crate::error::Result;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::Book;

use super::{edit_documents, Transform};

/// Selector parts that depend on state or generate content; rules using
/// them stay in the stylesheet
const UNFLATTENABLE: &[&str] = &[
    "::",
    ":before",
    ":after",
    ":first-line",
    ":first-letter",
    ":hover",
    ":active",
    ":focus",
    ":visited",
    ":link",
    ":target",
    ":selection",
];

const MARGINS: [&str; 4] = ["margin-top", "margin-right", "margin-bottom", "margin-left"];

pub struct FlattenCss;

impl FlattenCss {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FlattenCss {
    fn default() -> Self {
        Self::new()
    }
}

fn flattenable(selector: &str) -> bool {
    let lower = selector.to_ascii_lowercase();
    !UNFLATTENABLE.iter().any(|p| lower.contains(p))
}

fn print_only(media: &str) -> bool {
    let media = media.to_ascii_lowercase();
    media.contains("print") && !media.contains("screen") && !media.contains("all")
}

/// `margin` shorthand into the four longhands
fn expand(decl: &Declaration) -> Vec<Declaration> {
    if decl.name != "margin" {
        return vec![decl.clone()];
    }
    let parts: Vec<&str> = decl.value.split_whitespace().collect();
    let (top, right, bottom, left) = match parts.as_slice() {
        [a] => (*a, *a, *a, *a),
        [a, b] => (*a, *b, *a, *b),
        [a, b, c] => (*a, *b, *c, *b),
        [a, b, c, d] => (*a, *b, *c, *d),
        _ => return vec![decl.clone()],
    };
    MARGINS
        .iter()
        .zip([top, right, bottom, left])
        .map(|(name, value)| Declaration {
            name: name.to_string(),
            value: value.to_string(),
            important: decl.important,
        })
        .collect()
}

/// Style rules of `sheet` that take part in the cascade, with `@media`
/// groups opened up and print-only groups left out
fn cascade_rules(sheet: &Stylesheet, out: &mut Vec<StyleRule>) {
    for rule in &sheet.rules {
        match rule {
            Rule::Style(style) => out.push(style.clone()),
            Rule::At(at) if print_only(&at.prelude) => {}
            Rule::At(at) => {
                if let Some(nested) = at.nested() {
                    cascade_rules(&nested, out);
                }
            }
        }
    }
}

/// What remains of `sheet` once its flattenable rules are inlined
fn residual(sheet: &Stylesheet) -> Stylesheet {
    let mut rules = Vec::new();
    for rule in &sheet.rules {
        match rule {
            Rule::Style(style) => {
                let kept: Vec<String> = style
                    .selector_list()
                    .into_iter()
                    .filter(|s| !flattenable(s))
                    .collect();
                if !kept.is_empty() {
                    rules.push(Rule::Style(StyleRule {
                        selectors: kept.join(", "),
                        declarations: style.declarations.clone(),
                    }));
                }
            }
            Rule::At(at) => match at.name.as_str() {
                "import" | "charset" | "namespace" => {}
                "media" if print_only(&at.prelude) => {}
                _ => match at.nested() {
                    Some(nested) => {
                        let rest = residual(&nested);
                        if !rest.is_empty() {
                            rules.push(Rule::At(AtRule {
                                block: Some(rest.to_css()),
                                ..at.clone()
                            }));
                        }
                    }
                    None => rules.push(rule.clone()),
                },
            },
        }
    }
    Stylesheet {
        rules,
        errors: Vec::new(),
    }
}

/// A stylesheet as seen from one document: its rules and the name URLs in
/// it are relative to (`None` for `<style>` blocks)
struct Source {
    base: Option<String>,
    rules: Vec<StyleRule>,
}

struct Sheets {
    parsed: HashMap<String, Stylesheet>,
    used: HashSet<String>,
}

impl Sheets {
    fn collect(&mut self, name: &str, seen: &mut HashSet<String>, out: &mut Vec<Source>) {
        if !seen.insert(name.to_string()) {
            return;
        }
        let Some(sheet) = self.parsed.get(name).cloned() else {
            return;
        };
        self.used.insert(name.to_string());
        for import in sheet.imports() {
            if let Some(target) = name_for_href(&import, name) {
                self.collect(&target, seen, out);
            }
        }
        let mut rules = Vec::new();
        cascade_rules(&sheet, &mut rules);
        out.push(Source {
            base: Some(name.to_string()),
            rules,
        });
    }

    /// Every style source of `doc` in document order
    fn sources(&mut self, doc: &Document, doc_name: &str) -> Vec<Source> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        for node in doc.descendants(doc.root()) {
            if doc.is(node, "link") {
                let rel = doc.attr(node, "rel").unwrap_or("").to_ascii_lowercase();
                if !rel.split_whitespace().any(|r| r == "stylesheet")
                    || doc.attr(node, "media").is_some_and(print_only)
                {
                    continue;
                }
                if let Some(target) = doc.attr(node, "href").and_then(|h| name_for_href(h, doc_name)) {
                    self.collect(&target, &mut seen, &mut out);
                }
            } else if doc.is(node, "style") && !doc.attr(node, "media").is_some_and(print_only) {
                let sheet = Stylesheet::parse(&doc.text_content(node));
                let mut rules = Vec::new();
                cascade_rules(&sheet, &mut rules);
                out.push(Source { base: None, rules });
            }
        }
        out
    }
}

/// Cascade priority: importance, inline origin, specificity, source order
type Priority = (bool, bool, (u32, u32, u32), usize);

fn relocate(value: &str, from: &str, to: &str) -> String {
    rewrite_urls(value, |url| {
        name_for_href(url, from).map(|name| href_for_name(&name, to))
    })
    .unwrap_or_else(|| value.to_string())
}

/// Resolve the cascade of one document into inline styles. Returns true if
/// any `style` attribute changed.
fn flatten_document(doc: &mut Document, doc_name: &str, sources: &[Source], base_pt: f64) -> bool {
    let matcher = SelectorMatcher::new(doc);
    let mut applied: HashMap<NodeId, BTreeMap<String, (Priority, String)>> = HashMap::new();
    let mut apply = |node: NodeId, priority: Priority, decl: &Declaration| {
        for decl in expand(decl) {
            let slot = applied.entry(node).or_default();
            let wins = slot
                .get(&decl.name)
                .map_or(true, |(current, _)| priority >= *current);
            if wins {
                slot.insert(decl.name, (priority, decl.value));
            }
        }
    };

    let mut order = 0;
    for source in sources {
        for rule in &source.rules {
            for selector in rule.selector_list() {
                order += 1;
                if !flattenable(&selector) {
                    continue;
                }
                let Ok(nodes) = matcher.select(&selector) else {
                    continue;
                };
                let spec = specificity(&selector);
                for node in nodes {
                    for decl in &rule.declarations {
                        let mut decl = decl.clone();
                        if let Some(base) = &source.base {
                            decl.value = relocate(&decl.value, base, doc_name);
                        }
                        apply(node, (decl.important, false, spec, order), &decl);
                    }
                }
            }
        }
    }
    let nodes = doc.descendants(doc.root());
    for &node in &nodes {
        if let Some(style) = doc.attr(node, "style") {
            for decl in parse_declarations(style) {
                order += 1;
                apply(node, (decl.important, true, (0, 0, 0), order), &decl);
            }
        }
    }

    let mut font_pt: HashMap<NodeId, f64> = HashMap::new();
    let mut changed = false;
    for node in nodes {
        if !doc.is_element(node) {
            continue;
        }
        let parent_pt = doc
            .parent(node)
            .and_then(|p| font_pt.get(&p).copied())
            .unwrap_or(base_pt);
        let mut props: BTreeMap<String, String> = applied
            .remove(&node)
            .unwrap_or_default()
            .into_iter()
            .map(|(name, (_, value))| (name, value))
            .collect();
        let mut pt = parent_pt;
        if let Some(size) = props.get("font-size") {
            if let Some(resolved) = font_size_to_pt(size, parent_pt, base_pt) {
                pt = resolved;
                props.insert("font-size".to_string(), format_pt(pt));
            }
        }
        for margin in MARGINS {
            if let Some(value) = props.get(margin) {
                let relative = value.trim().ends_with('%') || value.trim() == "auto";
                if let Some(points) = length_to_pt(value, pt, base_pt).filter(|_| !relative) {
                    props.insert(margin.to_string(), format_pt(points));
                }
            }
        }
        font_pt.insert(node, pt);

        let style: Vec<Declaration> = props
            .into_iter()
            .map(|(name, value)| Declaration::new(name, value))
            .collect();
        let new = (!style.is_empty()).then(|| serialize_declarations(&style));
        if doc.attr(node, "style").map(str::to_string) != new {
            match new {
                Some(value) => doc.set_attr(node, "style", value),
                None => {
                    doc.remove_attr(node, "style");
                }
            }
            changed = true;
        }
    }
    changed
}

/// Replace `<style>` contents with their residual and drop links to sheets
/// that end up empty
fn strip_sources(doc: &mut Document, doc_name: &str, emptied: &HashSet<String>) -> bool {
    let mut changed = false;
    for node in doc.descendants(doc.root()) {
        if doc.is(node, "link") {
            let target = doc.attr(node, "href").and_then(|h| name_for_href(h, doc_name));
            if target.is_some_and(|t| emptied.contains(&t)) {
                doc.detach(node);
                changed = true;
            }
        } else if doc.is(node, "style") {
            let text = doc.text_content(node);
            let rest = residual(&Stylesheet::parse(&text));
            if rest.is_empty() {
                doc.detach(node);
                changed = true;
            } else {
                let css = rest.to_css();
                if css != text {
                    doc.set_text(node, css);
                    changed = true;
                }
            }
        }
    }
    changed
}

impl Transform for FlattenCss {
    fn name(&self) -> &'static str {
        "flatten_css"
    }

    fn description(&self) -> &'static str {
        "Resolve stylesheets into inline styles"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::float(
            "base_font_size",
            0.0,
            "Base font size in pt, 0 to use the output profile's",
        )]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        let base_pt = ctx
            .options
            .float("base_font_size")
            .filter(|pt| *pt > 0.0)
            .unwrap_or(ctx.output_profile.fbase);

        let css_names: Vec<String> = book
            .manifest()
            .iter()
            .filter(|i| i.is_css())
            .map(|i| i.href.clone())
            .collect();
        let mut sheets = Sheets {
            parsed: HashMap::new(),
            used: HashSet::new(),
        };
        for name in css_names {
            match book.container.css(&name) {
                Ok(sheet) => {
                    sheets.parsed.insert(name, sheet.clone());
                }
                Err(e) => ctx.log.warn(format!("{name}: {e}")),
            }
        }
        let residuals: HashMap<String, Stylesheet> = sheets
            .parsed
            .iter()
            .map(|(name, sheet)| (name.clone(), residual(sheet)))
            .collect();
        let emptied: HashSet<String> = residuals
            .iter()
            .filter(|(_, sheet)| sheet.is_empty())
            .map(|(name, _)| name.clone())
            .collect();

        let html_names: Vec<String> = book
            .manifest()
            .iter()
            .filter(|i| i.is_html())
            .map(|i| i.href.clone())
            .collect();
        edit_documents(book, ctx, &html_names, |name, doc| {
            let sources = sheets.sources(doc, name);
            let styled = flatten_document(doc, name, &sources, base_pt);
            let stripped = strip_sources(doc, name, &emptied);
            Ok(styled || stripped)
        })?;

        let mut used: Vec<String> = sheets.used.into_iter().collect();
        used.sort();
        for name in used {
            let Some(rest) = residuals.get(&name) else {
                continue;
            };
            if rest.is_empty() {
                ctx.log.debug(format!("removing flattened stylesheet {name}"));
                book.container.remove_name(&name)?;
            } else if sheets.parsed.get(&name) != Some(rest) {
                book.container.set_parsed(&name, Parsed::Css(rest.clone()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context};

    const PAGE: &str = r#"<html xmlns="http://www.w3.org/1999/xhtml"><head><title>T</title><link rel="stylesheet" href="../css/style.css"/><style>p.x { color: red }</style></head><body><div class="box"><p class="x" style="margin: 1em 0">Hi</p><p id="y">There</p></div></body></html>"#;

    const CSS: &str = "body { font-size: 12pt }\n.box { font-size: 1.5em; background: url(../img/bg.png) }\n#y { font-size: smaller !important }\np { margin-left: 2px }\na:hover { color: blue }\n@font-face { font-family: F; src: url(f.ttf) }\n@media print { p { color: gray } }\n";

    fn sample() -> Book {
        let mut book = book(&[("text/a.xhtml", PAGE)]);
        book.container.add_name("css/style.css", CSS.as_bytes(), None, &[]).unwrap();
        book.container.add_name("img/bg.png", b"png", None, &[]).unwrap();
        book
    }

    #[test]
    fn test_cascade_into_inline_styles() {
        let mut book = sample();
        let (ctx, _dir) = context(FlattenCss.options(), &[]);
        FlattenCss.run(&mut book, &ctx).unwrap();

        let html = book.container.read_text("text/a.xhtml").unwrap();
        assert!(
            html.contains(r#"<div class="box" style="background: url(../img/bg.png); font-size: 18pt">"#),
            "{html}"
        );
        assert!(
            html.contains(r#"<p class="x" style="color: red; margin-bottom: 18pt; margin-left: 0pt; margin-right: 0pt; margin-top: 18pt">"#),
            "{html}"
        );
        assert!(html.contains(r#"<p id="y" style="font-size: 15pt; margin-left: 1.5pt">"#), "{html}");
        assert!(!html.contains("<style"));

        let css = book.container.read_text("css/style.css").unwrap();
        assert!(css.contains("a:hover"));
        assert!(css.contains("@font-face"));
        assert!(!css.contains("print"));
        assert!(!css.contains(".box"));
    }

    #[test]
    fn test_flattening_is_idempotent() {
        let mut book = sample();
        let (ctx, _dir) = context(FlattenCss.options(), &[]);
        FlattenCss.run(&mut book, &ctx).unwrap();
        let first = book.container.read_text("text/a.xhtml").unwrap();
        FlattenCss.run(&mut book, &ctx).unwrap();
        assert_eq!(book.container.read_text("text/a.xhtml").unwrap(), first);
    }

    #[test]
    fn test_empty_sheet_is_removed() {
        let page = r#"<html xmlns="http://www.w3.org/1999/xhtml"><head><title>T</title><link rel="stylesheet" href="s.css"/></head><body><p>x</p></body></html>"#;
        let mut book = book(&[("a.xhtml", page)]);
        book.container.add_name("s.css", b"p { text-align: center }", None, &[]).unwrap();
        let (ctx, _dir) = context(FlattenCss.options(), &[]);
        FlattenCss.run(&mut book, &ctx).unwrap();

        assert!(!book.container.exists("s.css"));
        let html = book.container.read_text("a.xhtml").unwrap();
        assert!(!html.contains("<link"));
        assert!(html.contains(r#"<p style="text-align: center">x</p>"#));
    }
}
