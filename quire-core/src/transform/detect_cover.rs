//! Cover detection for books that do not declare a cover image.

use crate::container::paths::{file_name, name_for_href};
use crate::dom::Document;
use crate::error::Result;
use crate::opf::Package;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::Book;

use super::{edit_spine, Transform};

pub struct DetectCover;

impl DetectCover {
    pub fn new() -> Self {
        Self
    }
}

impl Default for DetectCover {
    fn default() -> Self {
        Self::new()
    }
}

/// The one image a text-free page shows, as a container name
fn sole_image(doc: &Document, doc_name: &str) -> Option<String> {
    let body = doc.body()?;
    if !doc.normalized_text(body).is_empty() {
        return None;
    }
    let mut sources = Vec::new();
    for node in doc.descendants(body) {
        let src = match doc.local_name(node) {
            Some("img") => doc.attr(node, "src"),
            Some("image") => doc.attr(node, "xlink:href").or_else(|| doc.attr(node, "href")),
            _ => None,
        };
        if let Some(src) = src {
            sources.push(src);
        }
    }
    match sources.as_slice() {
        [only] => name_for_href(only, doc_name),
        _ => None,
    }
}

/// Make `id` the cover image, in both the EPUB 3 and EPUB 2 ways
pub(crate) fn mark_cover(opf: &mut Package, id: &str) {
    opf.manifest.set_cover_image(Some(id));
    let md = opf.metadata_element();
    let doc = &mut opf.metadata;
    let existing = doc
        .children_named(md, "meta")
        .into_iter()
        .find(|&m| doc.attr(m, "name") == Some("cover"));
    match existing {
        Some(meta) => doc.set_attr(meta, "content", id),
        None => {
            let meta = doc.create_element_with("meta", &[("name", "cover"), ("content", id)]);
            doc.append(md, meta);
        }
    }
}

impl DetectCover {
    fn find(&self, book: &mut Book) -> Option<(String, Option<String>)> {
        let guide_pages: Vec<String> = ["cover", "titlepage", "title-page"]
            .iter()
            .filter_map(|kind| book.guide().get(kind).map(|r| r.href.clone()))
            .collect();
        for page in guide_pages {
            if book.manifest().by_href(&page).is_some_and(|i| i.is_image()) {
                return Some((page, None));
            }
            if let Ok(doc) = book.container.html(&page) {
                if let Some(image) = sole_image(doc, &page) {
                    return Some((image, Some(page)));
                }
            }
        }

        if let Some(first) = book.spine_names().into_iter().next() {
            if let Ok(doc) = book.container.html(&first) {
                if let Some(image) = sole_image(doc, &first) {
                    return Some((image, Some(first)));
                }
            }
        }

        book.manifest()
            .iter()
            .filter(|i| i.is_image())
            .find(|i| {
                let file = file_name(&i.href);
                let stem = file.rsplit_once('.').map_or(file, |(stem, _)| stem);
                stem.eq_ignore_ascii_case("cover")
            })
            .map(|i| (i.href.clone(), None))
    }
}

impl Transform for DetectCover {
    fn name(&self) -> &'static str {
        "detect_cover"
    }

    fn description(&self) -> &'static str {
        "Find a cover image when the package does not declare one"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::bool(
            "remove_first_image",
            false,
            "Remove the first image of the text when it is the cover",
        )]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        if let Some(name) = book.cover_name() {
            // a declared cover still gets the manifest property
            let id = book.container.manifest_id_for_name(&name).map(str::to_string);
            if let Some(id) = id {
                if book.manifest().cover_image().is_none() {
                    mark_cover(book.container.opf_mut(), &id);
                }
            }
            return Ok(());
        }
        let Some((image, page)) = self.find(book) else {
            ctx.log.debug("no cover candidate found");
            return Ok(());
        };
        let Some(id) = book
            .manifest()
            .by_href(&image)
            .filter(|i| i.is_image())
            .map(|i| i.id.clone())
        else {
            ctx.log.warn(format!("cover candidate {image} is not a manifest image"));
            return Ok(());
        };
        mark_cover(book.container.opf_mut(), &id);
        if let Some(page) = &page {
            if book.guide().get("cover").is_none() {
                book.container
                    .opf_mut()
                    .guide
                    .set("cover", "Cover", page, None);
            }
        }
        ctx.log.info(format!("using {image} as the cover"));

        if ctx.options.bool("remove_first_image") && page.is_none() {
            let mut removed = false;
            edit_spine(book, ctx, |name, doc| {
                if removed {
                    return Ok(false);
                }
                let Some(body) = doc.body() else {
                    return Ok(false);
                };
                let first = doc.elements_by_name(body, "img").into_iter().find(|&img| {
                    doc.attr(img, "src")
                        .and_then(|src| name_for_href(src, name))
                        .is_some_and(|target| target == image)
                });
                match first {
                    Some(img) => {
                        doc.detach(img);
                        removed = true;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};

    #[test]
    fn test_cover_page_with_single_image() {
        let mut book = book(&[
            ("titlepage.xhtml", &xhtml(r#"<div><img src="images/c.jpg" alt=""/></div>"#)),
            ("ch1.xhtml", &xhtml("<p>Text</p>")),
        ]);
        book.container.add_name("images/c.jpg", b"jpg", None, &[]).unwrap();
        let (ctx, _dir) = context(DetectCover.options(), &[]);
        DetectCover.run(&mut book, &ctx).unwrap();

        assert_eq!(book.cover_name().as_deref(), Some("images/c.jpg"));
        assert_eq!(book.guide().get("cover").unwrap().href, "titlepage.xhtml");
        let xml = book.container.opf().to_xml("content.opf");
        assert!(xml.contains(r#"<meta name="cover" content="c.jpg"/>"#), "{xml}");
    }

    #[test]
    fn test_cover_by_file_name_and_removal() {
        let mut book = book(&[("ch1.xhtml", &xhtml(r#"<p>Hi</p><img src="Cover.png"/>"#))]);
        book.container.add_name("Cover.png", b"png", None, &[]).unwrap();
        let (ctx, _dir) = context(DetectCover.options(), &[("remove_first_image", "true")]);
        DetectCover.run(&mut book, &ctx).unwrap();

        assert_eq!(book.manifest().cover_image().unwrap().href, "Cover.png");
        let html = book.container.read_text("ch1.xhtml").unwrap();
        assert!(!html.contains("<img"));
    }

    #[test]
    fn test_existing_cover_untouched() {
        let mut book = book(&[("ch1.xhtml", &xhtml(r#"<img src="cover.jpg"/>"#))]);
        book.container.add_name("a.jpg", b"a", None, &["cover-image"]).unwrap();
        book.container.add_name("cover.jpg", b"c", None, &[]).unwrap();
        let (ctx, _dir) = context(DetectCover.options(), &[]);
        DetectCover.run(&mut book, &ctx).unwrap();
        assert_eq!(book.cover_name().as_deref(), Some("a.jpg"));
    }
}
