//! Locating and rewriting resource references in CSS text.

use std::ops::Range;

use cssparser::{Parser, ParserInput, Token};

use super::CssParseError;

/// A `url()` or `@import` reference. `range` covers the URL text only, so
/// replacing it keeps the original quoting.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlRef {
    pub range: Range<usize>,
    pub url: String,
}

/// All references in a stylesheet or declaration list, in source order
pub fn find_urls(css: &str) -> Vec<UrlRef> {
    let mut input = ParserInput::new(css);
    let mut parser = Parser::new(&mut input);
    let mut out = Vec::new();
    collect(&mut parser, &mut out);
    out.sort_by_key(|u| u.range.start);
    out
}

fn collect(parser: &mut Parser<'_, '_>, out: &mut Vec<UrlRef>) {
    let mut import_pending = false;
    loop {
        let before = parser.position();
        let token = match parser.next_including_whitespace_and_comments() {
            Ok(t) => t.clone(),
            Err(_) => break,
        };
        let after = parser.position();
        match token {
            Token::UnquotedUrl(url) => {
                let text = parser.slice(before..after);
                if let Some(inner) = unquoted_inner(text) {
                    let base = before.byte_index();
                    out.push(UrlRef {
                        range: base + inner.start..base + inner.end,
                        url: url.to_string(),
                    });
                }
                import_pending = false;
            }
            Token::Function(name) if name.eq_ignore_ascii_case("url") => {
                let _ = parser.parse_nested_block(|p| {
                    p.skip_whitespace();
                    let start = p.position();
                    if let Ok(Token::QuotedString(s)) = p.next().cloned() {
                        let end = p.position();
                        if let Some(range) = quoted_inner(p.slice(start..end), start.byte_index()) {
                            out.push(UrlRef {
                                range,
                                url: s.to_string(),
                            });
                        }
                    }
                    while p.next().is_ok() {}
                    Ok::<_, CssParseError>(())
                });
                import_pending = false;
            }
            Token::AtKeyword(name) => import_pending = name.eq_ignore_ascii_case("import"),
            Token::QuotedString(s) if import_pending => {
                if let Some(range) = quoted_inner(parser.slice(before..after), before.byte_index()) {
                    out.push(UrlRef {
                        range,
                        url: s.to_string(),
                    });
                }
                import_pending = false;
            }
            Token::Function(_)
            | Token::CurlyBracketBlock
            | Token::ParenthesisBlock
            | Token::SquareBracketBlock => {
                let _ = parser.parse_nested_block(|p| {
                    collect(p, out);
                    Ok::<_, CssParseError>(())
                });
                import_pending = false;
            }
            Token::WhiteSpace(_) | Token::Comment(_) => {}
            _ => import_pending = false,
        }
    }
}

/// Span of the URL inside `url(  x  )`
fn unquoted_inner(text: &str) -> Option<Range<usize>> {
    let open = text.find('(')? + 1;
    let close = text.rfind(')').unwrap_or(text.len());
    let inner = &text[open..close];
    let lead = inner.len() - inner.trim_start().len();
    let trimmed = inner.trim();
    let start = open + lead;
    Some(start..start + trimmed.len())
}

/// Span inside a complete quoted string starting at `base`
fn quoted_inner(text: &str, base: usize) -> Option<Range<usize>> {
    let quote = text.chars().next()?;
    if text.len() < 2 || !text.ends_with(quote) {
        return None;
    }
    Some(base + 1..base + text.len() - 1)
}

/// Replace every reference for which `rewrite` returns a new URL. Returns
/// `None` when nothing changed.
pub fn rewrite_urls<F>(css: &str, mut rewrite: F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    let mut replacements: Vec<(Range<usize>, String)> = find_urls(css)
        .into_iter()
        .filter_map(|u| {
            let new = rewrite(&u.url)?;
            (new != u.url).then_some((u.range, new))
        })
        .collect();
    if replacements.is_empty() {
        return None;
    }
    let mut result = css.to_string();
    replacements.sort_by_key(|(r, _)| r.start);
    for (range, new) in replacements.into_iter().rev() {
        result.replace_range(range, &new);
    }
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_all_reference_kinds() {
        let css = r#"@import "a.css"; @import url('b.css');
            p { background: url(img/x.png) no-repeat }
            @media screen { h1 { background-image: url( "img/y.png" ) } }"#;
        let urls: Vec<String> = find_urls(css).into_iter().map(|u| u.url).collect();
        assert_eq!(urls, vec!["a.css", "b.css", "img/x.png", "img/y.png"]);
    }

    #[test]
    fn test_ranges_point_at_url_text() {
        let css = "p { background: url( img/x.png ) }";
        let refs = find_urls(css);
        assert_eq!(&css[refs[0].range.clone()], "img/x.png");
    }

    #[test]
    fn test_rewrite_keeps_quoting() {
        let css = "a { background: url(img/x.png) } b { src: url(\"img/x.png\") } c { x: url(other.png) }";
        let out = rewrite_urls(css, |u| (u == "img/x.png").then(|| "images/y.png".to_string())).unwrap();
        assert_eq!(
            out,
            "a { background: url(images/y.png) } b { src: url(\"images/y.png\") } c { x: url(other.png) }"
        );
        assert!(rewrite_urls(css, |_| None).is_none());
    }
}
