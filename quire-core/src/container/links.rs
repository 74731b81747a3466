//! References between container entries.

use crate::css::{find_urls, rewrite_urls};
use crate::dom::{Document, NodeId};

use super::paths::{href_for_name, name_for_href, split_fragment};

/// Where a reference lives inside its referring entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkLocation {
    /// A URL-valued attribute (`href`, `src`, `xlink:href`, `poster`, `data`)
    Attr { node: NodeId, attr: String },
    /// A `url()` inside an inline `style` attribute
    StyleAttr { node: NodeId },
    /// A `url()` or `@import` inside a `<style>` element
    StyleElement { node: NodeId },
    /// A `url()` or `@import` in a stylesheet entry
    Stylesheet,
}

/// One reference from a referrer to a container name
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    /// Href as written
    pub href: String,
    /// Resolved container name
    pub target: String,
    pub fragment: Option<String>,
    pub location: LinkLocation,
}

/// What to do with the references to one target
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Retarget {
    Keep,
    Move(String),
    Break,
}

fn is_link_attr(element: &str, attr: &str) -> bool {
    let local = attr.rsplit(':').next().unwrap_or(attr);
    match local {
        "href" | "src" | "poster" => true,
        "data" => element.eq_ignore_ascii_case("object"),
        _ => false,
    }
}

fn link(href: &str, base: &str, location: LinkLocation) -> Option<Link> {
    let target = name_for_href(href, base)?;
    let fragment = split_fragment(href.trim()).1.map(str::to_string);
    Some(Link {
        href: href.to_string(),
        target,
        fragment,
        location,
    })
}

/// References made by an HTML, SVG or NCX document named `base`
pub fn markup_links(doc: &Document, base: &str) -> Vec<Link> {
    let mut out = Vec::new();
    for node in doc.descendants(doc.root()) {
        let Some(el) = doc.element(node) else {
            continue;
        };
        let local = el.local_name();
        for attr in &el.attrs {
            if is_link_attr(local, &attr.name) {
                out.extend(link(
                    &attr.value,
                    base,
                    LinkLocation::Attr {
                        node,
                        attr: attr.name.clone(),
                    },
                ));
            } else if attr.name == "style" {
                for url in find_urls(&attr.value) {
                    out.extend(link(&url.url, base, LinkLocation::StyleAttr { node }));
                }
            }
        }
        if local.eq_ignore_ascii_case("style") {
            for url in find_urls(&doc.text_content(node)) {
                out.extend(link(&url.url, base, LinkLocation::StyleElement { node }));
            }
        }
    }
    out
}

/// References made by a stylesheet named `base`
pub fn css_links(css: &str, base: &str) -> Vec<Link> {
    find_urls(css)
        .into_iter()
        .filter_map(|u| link(&u.url, base, LinkLocation::Stylesheet))
        .collect()
}

/// New href for `url` written in `old_base`, after the referrer moved to
/// `new_base` and its target was retargeted by `decide`. `None` if unchanged.
pub(crate) fn retarget_url(
    url: &str,
    old_base: &str,
    new_base: &str,
    decide: &dyn Fn(&str) -> Retarget,
) -> Option<String> {
    let target = name_for_href(url, old_base)?;
    let (_, fragment) = split_fragment(url.trim());
    let new_target = match decide(&target) {
        Retarget::Keep if old_base == new_base => return None,
        Retarget::Keep => target,
        Retarget::Move(name) => name,
        Retarget::Break => return Some(String::new()),
    };
    let mut href = href_for_name(&new_target, new_base);
    if let Some(fragment) = fragment {
        href.push('#');
        href.push_str(fragment);
    }
    (href != url).then_some(href)
}

/// Rewrite the references at `locations` in a markup document. Returns the
/// number of values changed.
pub(crate) fn rewrite_markup(
    doc: &mut Document,
    locations: &[LinkLocation],
    old_base: &str,
    new_base: &str,
    decide: &dyn Fn(&str) -> Retarget,
) -> usize {
    let mut changed = 0;
    let mut done: Vec<&LinkLocation> = Vec::new();
    for location in locations {
        if done.contains(&location) {
            continue;
        }
        done.push(location);
        match location {
            LinkLocation::Attr { node, attr } => {
                let Some(value) = doc.attr(*node, attr).map(str::to_string) else {
                    continue;
                };
                if let Some(new) = retarget_url(&value, old_base, new_base, decide) {
                    doc.set_attr(*node, attr, new);
                    changed += 1;
                }
            }
            LinkLocation::StyleAttr { node } => {
                let Some(style) = doc.attr(*node, "style").map(str::to_string) else {
                    continue;
                };
                if let Some(new) =
                    rewrite_urls(&style, |u| retarget_url(u, old_base, new_base, decide))
                {
                    doc.set_attr(*node, "style", new);
                    changed += 1;
                }
            }
            LinkLocation::StyleElement { node } => {
                let text = doc.text_content(*node);
                if let Some(new) =
                    rewrite_urls(&text, |u| retarget_url(u, old_base, new_base, decide))
                {
                    doc.set_text(*node, new);
                    changed += 1;
                }
            }
            LinkLocation::Stylesheet => {}
        }
    }
    changed
}

/// Rewrite the references of a stylesheet, `None` if nothing changed
pub(crate) fn rewrite_css(
    css: &str,
    old_base: &str,
    new_base: &str,
    decide: &dyn Fn(&str) -> Retarget,
) -> Option<String> {
    rewrite_urls(css, |u| retarget_url(u, old_base, new_base, decide))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Document {
        Document::parse_html(
            r##"<html><head><link rel="stylesheet" href="../style.css"/><style>p { background: url("../img/x.png") }</style></head>
            <body><a href="ch2.xhtml#s1">next</a><a href="#top">top</a><a href="http://x.org/">ext</a>
            <img src="../img/x.png" style="border-image: url(../img/b.png)"/>
            <svg xmlns:xlink="http://www.w3.org/1999/xlink"><image xlink:href="../img/x.png"/></svg></body></html>"##,
        )
    }

    #[test]
    fn test_markup_links() {
        let d = doc();
        let links = markup_links(&d, "text/ch1.xhtml");
        let targets: Vec<&str> = links.iter().map(|l| l.target.as_str()).collect();
        assert_eq!(
            targets,
            vec!["style.css", "img/x.png", "text/ch2.xhtml", "img/x.png", "img/b.png", "img/x.png"]
        );
        assert_eq!(links[2].fragment.as_deref(), Some("s1"));
    }

    #[test]
    fn test_rewrite_markup_moves_and_breaks() {
        let mut d = doc();
        let links = markup_links(&d, "text/ch1.xhtml");
        let locations: Vec<LinkLocation> = links.into_iter().map(|l| l.location).collect();
        let decide = |t: &str| match t {
            "img/x.png" => Retarget::Move("images/y.png".into()),
            "img/b.png" => Retarget::Break,
            _ => Retarget::Keep,
        };
        let changed = rewrite_markup(&mut d, &locations, "text/ch1.xhtml", "text/ch1.xhtml", &decide);
        assert_eq!(changed, 4);
        let out = d.to_xml();
        assert!(out.contains(r#"src="../images/y.png""#));
        assert!(out.contains(r#"xlink:href="../images/y.png""#));
        assert!(out.contains(r#"url("../images/y.png")"#));
        assert!(out.contains(r#"border-image: url()"#));
        assert!(out.contains(r#"href="ch2.xhtml#s1""#));
    }

    #[test]
    fn test_rebase_when_referrer_moves() {
        let new = retarget_url("ch2.xhtml#s1", "text/ch1.xhtml", "ch1.xhtml", &|_| Retarget::Keep);
        assert_eq!(new.as_deref(), Some("text/ch2.xhtml#s1"));
    }
}
