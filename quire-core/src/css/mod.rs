//! Tolerant CSS stylesheets.
//!
//! Stylesheets are split into rules with `cssparser`'s tokenizer. Nothing is
//! rejected: malformed parts are recorded in [`Stylesheet::errors`] and
//! skipped, everything else is kept as source text so it survives a
//! round trip unchanged.

mod urls;
pub mod values;

use std::fmt::Write as _;

use cssparser::{ParseError, Parser, ParserInput, Token};
use serde::Serialize;

pub use urls::{find_urls, rewrite_urls, UrlRef};

type CssParseError<'i> = ParseError<'i, ()>;

/// A recovered syntax error, with 1-based line and column
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CssError {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

/// `name: value [!important]`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Declaration {
    /// Lowercased property name
    pub name: String,
    pub value: String,
    pub important: bool,
}

impl Declaration {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into().to_ascii_lowercase(),
            value: value.into(),
            important: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StyleRule {
    /// Selector list as written
    pub selectors: String,
    pub declarations: Vec<Declaration>,
}

impl StyleRule {
    /// The comma separated selectors of the rule
    pub fn selector_list(&self) -> Vec<String> {
        values::split_selector_list(&self.selectors)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AtRule {
    /// Lowercased name without `@`
    pub name: String,
    pub prelude: String,
    /// Raw block contents, `None` for statement rules such as `@import`
    pub block: Option<String>,
}

impl AtRule {
    /// Rules nested in a conditional group such as `@media`
    pub fn nested(&self) -> Option<Stylesheet> {
        match self.name.as_str() {
            "media" | "supports" | "document" => self.block.as_deref().map(Stylesheet::parse),
            _ => None,
        }
    }

    /// Declarations of a descriptor block such as `@font-face` or `@page`
    pub fn declarations(&self) -> Vec<Declaration> {
        self.block
            .as_deref()
            .map(parse_declarations)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Rule {
    Style(StyleRule),
    At(AtRule),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stylesheet {
    pub rules: Vec<Rule>,
    pub errors: Vec<CssError>,
}

impl Stylesheet {
    pub fn parse(css: &str) -> Stylesheet {
        let mut input = ParserInput::new(css);
        let mut parser = Parser::new(&mut input);
        let mut sheet = Stylesheet::default();
        parse_rules(&mut parser, &mut sheet);
        sheet
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn style_rules(&self) -> impl Iterator<Item = &StyleRule> {
        self.rules.iter().filter_map(|r| match r {
            Rule::Style(s) => Some(s),
            Rule::At(_) => None,
        })
    }

    pub fn at_rules(&self) -> impl Iterator<Item = &AtRule> {
        self.rules.iter().filter_map(|r| match r {
            Rule::At(a) => Some(a),
            Rule::Style(_) => None,
        })
    }

    /// Targets of `@import` rules
    pub fn imports(&self) -> Vec<String> {
        self.at_rules()
            .filter(|a| a.name == "import")
            .flat_map(|a| find_urls(&format!("@import {};", a.prelude)))
            .map(|u| u.url)
            .collect()
    }

    pub fn to_css(&self) -> String {
        let mut out = String::new();
        for rule in &self.rules {
            match rule {
                Rule::Style(style) => {
                    let _ = writeln!(out, "{} {{", style.selectors);
                    for decl in &style.declarations {
                        let _ = writeln!(out, "  {};", format_declaration(decl));
                    }
                    out.push_str("}\n");
                }
                Rule::At(at) => {
                    out.push('@');
                    out.push_str(&at.name);
                    if !at.prelude.is_empty() {
                        out.push(' ');
                        out.push_str(&at.prelude);
                    }
                    match &at.block {
                        Some(block) => {
                            let _ = writeln!(out, " {{{}}}", block);
                        }
                        None => out.push_str(";\n"),
                    }
                }
            }
        }
        out
    }
}

fn location_error(parser: &Parser<'_, '_>, message: impl Into<String>) -> CssError {
    let loc = parser.current_source_location();
    CssError {
        line: loc.line + 1,
        column: loc.column,
        message: message.into(),
    }
}

fn parse_rules(parser: &mut Parser<'_, '_>, sheet: &mut Stylesheet) {
    loop {
        parser.skip_whitespace();
        let state = parser.state();
        let token = match parser.next() {
            Ok(t) => t.clone(),
            Err(_) => break,
        };
        match token {
            Token::CDO | Token::CDC | Token::Semicolon => {}
            Token::CloseCurlyBracket | Token::CloseParenthesis | Token::CloseSquareBracket => {
                sheet.errors.push(location_error(parser, "unbalanced closing bracket"));
            }
            Token::AtKeyword(name) => {
                let name = name.to_ascii_lowercase();
                let start = parser.position();
                let (end, block) = loop {
                    let before = parser.position();
                    match parser.next_including_whitespace_and_comments() {
                        Ok(Token::Semicolon) => break (before, None),
                        Ok(Token::CurlyBracketBlock) => {
                            break (before, parser.parse_nested_block(raw_block).ok());
                        }
                        Ok(_) => {}
                        Err(_) => break (parser.position(), None),
                    }
                };
                let prelude = parser.slice(start..end).trim().to_string();
                sheet.rules.push(Rule::At(AtRule {
                    name,
                    prelude,
                    block,
                }));
            }
            _ => {
                parser.reset(&state);
                let start = parser.position();
                let location = parser.current_source_location();
                let mut found = None;
                loop {
                    let before = parser.position();
                    match parser.next_including_whitespace_and_comments() {
                        Ok(Token::CurlyBracketBlock) => {
                            let prelude = parser.slice(start..before).trim().to_string();
                            let body = parser.parse_nested_block(raw_block).unwrap_or_default();
                            found = Some((prelude, body));
                            break;
                        }
                        Ok(Token::Semicolon) => break,
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
                match found {
                    Some((selectors, body)) if !selectors.is_empty() => {
                        let (declarations, errors) = parse_declaration_list(&body);
                        sheet.errors.extend(errors.into_iter().map(|mut e| {
                            if e.line == 1 {
                                e.column += location.column;
                            }
                            e.line += location.line;
                            e
                        }));
                        sheet.rules.push(Rule::Style(StyleRule {
                            selectors,
                            declarations,
                        }));
                    }
                    Some(_) => sheet.errors.push(CssError {
                        line: location.line + 1,
                        column: location.column,
                        message: "rule without selector".into(),
                    }),
                    None => sheet.errors.push(CssError {
                        line: location.line + 1,
                        column: location.column,
                        message: "selector without a declaration block".into(),
                    }),
                }
            }
        }
    }
}

fn raw_block<'i>(p: &mut Parser<'i, '_>) -> Result<String, CssParseError<'i>> {
    let start = p.position();
    while p.next_including_whitespace_and_comments().is_ok() {}
    Ok(p.slice_from(start).to_string())
}

/// Parse the contents of a declaration block or a `style` attribute
pub fn parse_declarations(text: &str) -> Vec<Declaration> {
    parse_declaration_list(text).0
}

pub(crate) fn parse_declaration_list(text: &str) -> (Vec<Declaration>, Vec<CssError>) {
    let mut input = ParserInput::new(text);
    let mut parser = Parser::new(&mut input);
    let mut decls = Vec::new();
    let mut errors = Vec::new();

    loop {
        parser.skip_whitespace();
        let name = match parser.next() {
            Err(_) => break,
            Ok(Token::Semicolon) => continue,
            Ok(Token::Ident(name)) => name.to_ascii_lowercase(),
            Ok(other) => {
                let message = format!("unexpected {other:?} in declaration list");
                errors.push(location_error(&parser, message));
                skip_to_semicolon(&mut parser);
                continue;
            }
        };
        parser.skip_whitespace();
        if parser.expect_colon().is_err() {
            errors.push(location_error(&parser, format!("expected ':' after '{name}'")));
            skip_to_semicolon(&mut parser);
            continue;
        }
        let start = parser.position();
        let end = loop {
            let before = parser.position();
            match parser.next_including_whitespace_and_comments() {
                Ok(Token::Semicolon) => break before,
                Ok(_) => {}
                Err(_) => break parser.position(),
            }
        };
        let (value, important) = split_important(parser.slice(start..end).trim());
        if value.is_empty() {
            errors.push(location_error(&parser, format!("empty value for '{name}'")));
            continue;
        }
        decls.push(Declaration {
            name,
            value: value.to_string(),
            important,
        });
    }
    (decls, errors)
}

fn skip_to_semicolon(parser: &mut Parser<'_, '_>) {
    while let Ok(token) = parser.next() {
        if matches!(token, Token::Semicolon) {
            break;
        }
    }
}

fn split_important(value: &str) -> (&str, bool) {
    if let Some(idx) = value.rfind('!') {
        if value[idx + 1..].trim().eq_ignore_ascii_case("important") {
            return (value[..idx].trim_end(), true);
        }
    }
    (value, false)
}

fn format_declaration(decl: &Declaration) -> String {
    if decl.important {
        format!("{}: {} !important", decl.name, decl.value)
    } else {
        format!("{}: {}", decl.name, decl.value)
    }
}

/// Write declarations in `style` attribute form
pub fn serialize_declarations(decls: &[Declaration]) -> String {
    decls
        .iter()
        .map(format_declaration)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rules_and_at_rules() {
        let sheet = Stylesheet::parse(
            "@charset \"utf-8\";\n@import url(base.css);\nh1, h2 { color: red; FONT-SIZE: 2em !important }\n@font-face { font-family: X; src: url(x.ttf) }\n@media screen { p { margin: 0 } }",
        );
        assert!(sheet.errors.is_empty(), "{:?}", sheet.errors);
        assert_eq!(sheet.rules.len(), 5);
        let style = sheet.style_rules().next().unwrap();
        assert_eq!(style.selector_list(), vec!["h1", "h2"]);
        assert_eq!(style.declarations[1], Declaration {
            name: "font-size".into(),
            value: "2em".into(),
            important: true,
        });
        assert_eq!(sheet.imports(), vec!["base.css"]);
        let media = sheet.at_rules().find(|a| a.name == "media").unwrap();
        assert_eq!(media.nested().unwrap().style_rules().count(), 1);
        let font = sheet.at_rules().find(|a| a.name == "font-face").unwrap();
        assert_eq!(font.declarations().len(), 2);
    }

    #[test]
    fn test_errors_are_recovered() {
        let sheet = Stylesheet::parse("p { color red; margin: 1em }\n} div { }\nspan");
        assert_eq!(sheet.style_rules().count(), 2);
        let p = sheet.style_rules().next().unwrap();
        assert_eq!(p.declarations, vec![Declaration::new("margin", "1em")]);
        assert_eq!(sheet.errors.len(), 3);
        assert_eq!(sheet.errors[0].line, 1);
        assert_eq!(sheet.errors[1].line, 2);
    }

    #[test]
    fn test_to_css_round_trip() {
        let sheet = Stylesheet::parse("p{margin:0 auto;color:#333}@page{margin:5pt}");
        let out = sheet.to_css();
        assert_eq!(out, "p {\n  margin: 0 auto;\n  color: #333;\n}\n@page {margin:5pt}\n");
        assert_eq!(Stylesheet::parse(&out).rules, sheet.rules);
    }

    #[test]
    fn test_inline_declarations() {
        let decls = parse_declarations("font-weight: bold; ; text-indent:1.5em");
        assert_eq!(serialize_declarations(&decls), "font-weight: bold; text-indent: 1.5em");
    }
}
