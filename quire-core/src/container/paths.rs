//! Container names and the hrefs that point at them.
//!
//! A name is a percent-decoded, forward-slash path relative to the book root
//! (`OEBPS/text/ch1.xhtml`). An href is what appears in markup: relative to
//! the referring document and percent-encoded.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

/// Characters escaped when writing an href
const HREF_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'|')
    .add(b'\\')
    .add(b'^');

/// Normalize a path into a container name: backslashes become slashes, `.`
/// segments vanish and `..` segments are resolved. `None` if the path
/// escapes the root.
pub fn normalize_name(path: &str) -> Option<String> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            s => parts.push(s),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Directory part of a name, with a trailing slash, or "" at the root
pub fn dir_of(name: &str) -> &str {
    match name.rfind('/') {
        Some(i) => &name[..=i],
        None => "",
    }
}

/// File part of a name
pub fn file_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// True for hrefs with a scheme (`http:`, `mailto:`, `data:`) or a network path
pub fn is_external(href: &str) -> bool {
    if href.starts_with("//") {
        return true;
    }
    let Some(colon) = href.find(':') else {
        return false;
    };
    let scheme = &href[..colon];
    !scheme.is_empty()
        && scheme.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        // a single letter before ':' is a drive letter, not a scheme
        && scheme.len() > 1
}

/// Split `path#fragment`
pub fn split_fragment(href: &str) -> (&str, Option<&str>) {
    match href.split_once('#') {
        Some((path, frag)) => (path, Some(frag)),
        None => (href, None),
    }
}

/// Resolve an href found in `base` to a container name. `None` for external
/// links, pure fragments and paths escaping the root.
pub fn name_for_href(href: &str, base: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || is_external(href) {
        return None;
    }
    let (path, _) = split_fragment(href);
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return None;
    }
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    if let Some(absolute) = decoded.strip_prefix('/') {
        return normalize_name(absolute);
    }
    normalize_name(&format!("{}{}", dir_of(base), decoded))
}

/// Relative, percent-encoded href from `base` to `name`
pub fn href_for_name(name: &str, base: &str) -> String {
    let target: Vec<&str> = name.split('/').collect();
    let from: Vec<&str> = dir_of(base).split('/').filter(|s| !s.is_empty()).collect();
    let common = from
        .iter()
        .zip(&target)
        .take_while(|(a, b)| a == b)
        .count()
        .min(target.len().saturating_sub(1));
    let mut parts: Vec<String> = std::iter::repeat("..".to_string())
        .take(from.len() - common)
        .collect();
    parts.extend(
        target[common..]
            .iter()
            .map(|s| utf8_percent_encode(s, HREF_ESCAPE).to_string()),
    );
    parts.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("OEBPS/./text/../a.xhtml").as_deref(), Some("OEBPS/a.xhtml"));
        assert_eq!(normalize_name("\\a\\b.css").as_deref(), Some("a/b.css"));
        assert_eq!(normalize_name("../x"), None);
    }

    #[test]
    fn test_name_for_href() {
        assert_eq!(
            name_for_href("../images/My%20Pic.png#x", "OEBPS/text/ch1.xhtml").as_deref(),
            Some("OEBPS/images/My Pic.png")
        );
        assert_eq!(name_for_href("#frag", "a.xhtml"), None);
        assert_eq!(name_for_href("http://example.com/a", "a.xhtml"), None);
        assert_eq!(name_for_href("mailto:x@y", "a.xhtml"), None);
        assert_eq!(name_for_href("/style.css", "a/b.xhtml").as_deref(), Some("style.css"));
    }

    #[test]
    fn test_href_for_name() {
        assert_eq!(href_for_name("OEBPS/images/a b.png", "OEBPS/text/ch1.xhtml"), "../images/a%20b.png");
        assert_eq!(href_for_name("images/y.png", "a.xhtml"), "images/y.png");
        assert_eq!(href_for_name("a.xhtml", "a.xhtml"), "a.xhtml");
        assert_eq!(href_for_name("OEBPS/ch1.xhtml", "OEBPS/content.opf"), "ch1.xhtml");
    }

    #[test]
    fn test_href_round_trip() {
        let base = "OEBPS/text/ch1.xhtml";
        for name in ["OEBPS/style.css", "OEBPS/text/ch 2.xhtml", "cover.jpg", "OEBPS/text/sub/x#y.png"] {
            let href = href_for_name(name, base);
            assert_eq!(name_for_href(&href, base).as_deref(), Some(name));
        }
    }
}
