//! Collecting an HTML file together with the local files it links to.

use std::collections::{HashSet, VecDeque};
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::dom::Document;
use crate::types::media::{guess_media_type, is_css, is_html};

use super::links::{css_links, markup_links};
use super::text::decode_text;

/// Files reached from an index document, as names relative to its directory
#[derive(Debug, Default)]
pub struct Spidered {
    /// Every reached file, in discovery order
    pub names: Vec<String>,
    /// HTML documents in link-traversal order
    pub spine: Vec<String>,
}

/// Breadth-first walk of local links starting at `index` inside `base_dir`.
/// HTML links are followed up to `max_levels` hops from the index; images,
/// stylesheets and other resources are always collected.
pub fn spider(base_dir: &Path, index: &str, max_levels: usize) -> Spidered {
    let mut out = Spidered::default();
    let mut seen: HashSet<String> = HashSet::new();
    let mut queue: VecDeque<(String, usize)> = VecDeque::new();
    seen.insert(index.to_string());
    queue.push_back((index.to_string(), 0));

    while let Some((name, level)) = queue.pop_front() {
        let path = base_dir.join(&name);
        let Ok(bytes) = fs::read(&path) else {
            debug!(name = %name, "linked file not found, skipping");
            continue;
        };
        out.names.push(name.clone());
        let media_type = guess_media_type(&name);
        let links = if is_html(media_type) {
            out.spine.push(name.clone());
            let doc = Document::parse_html(&decode_text(&bytes));
            markup_links(&doc, &name)
        } else if is_css(media_type) {
            css_links(&decode_text(&bytes), &name)
        } else {
            continue;
        };
        for link in links {
            if seen.contains(&link.target) {
                continue;
            }
            if is_html(guess_media_type(&link.target)) && level + 1 > max_levels {
                continue;
            }
            seen.insert(link.target.clone());
            queue.push_back((link.target, level + 1));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spider_follows_local_links() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("img")).unwrap();
        fs::write(
            root.join("index.html"),
            r#"<html><head><link rel="stylesheet" href="s.css"/></head><body>
            <a href="a.html">a</a><a href="http://example.com/">x</a><a href="missing.html">m</a></body></html>"#,
        )
        .unwrap();
        fs::write(root.join("a.html"), r#"<html><body><a href="b.html">b</a></body></html>"#).unwrap();
        fs::write(root.join("b.html"), "<html><body>deep</body></html>").unwrap();
        fs::write(root.join("s.css"), "body { background: url(img/bg.png) }").unwrap();
        fs::write(root.join("img/bg.png"), b"png").unwrap();

        let found = spider(root, "index.html", 1);
        assert_eq!(found.spine, vec!["index.html", "a.html"]);
        assert!(found.names.contains(&"img/bg.png".to_string()));
        assert!(!found.names.contains(&"b.html".to_string()));
    }
}
