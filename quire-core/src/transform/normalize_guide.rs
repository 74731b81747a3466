//! Guide normalization: one `cover` entry, `text` instead of `start`, and
//! only the reference types readers understand.

use crate::error::Result;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::media::is_raster_image;
use crate::types::{Book, GuideReference};

use super::Transform;

/// `cover` and the vendor types that also mean "the cover image"
const COVER_SYNONYMS: &[&str] = &[
    "cover",
    "other.ms-coverimage",
    "coverimagestandard",
    "other.ms-titleimage",
    "other.ms-coverimage-standard",
    "other.ms-thumbimage",
    "thumbimagestandard",
    "other.ms-thumbimage-standard",
];

const ALLOWED: &[&str] = &[
    "cover",
    "titlepage",
    "masthead",
    "toc",
    "title-page",
    "copyright-page",
    "text",
];

fn is_cover_kind(kind: &str) -> bool {
    COVER_SYNONYMS.iter().any(|s| kind.eq_ignore_ascii_case(s))
}

pub struct NormalizeGuide;

impl NormalizeGuide {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NormalizeGuide {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for NormalizeGuide {
    fn name(&self) -> &'static str {
        "normalize_guide"
    }

    fn description(&self) -> &'static str {
        "Collapse cover synonyms, rename start to text and drop unknown guide types"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![OptionDef::choice(
            "guide_cover_pick",
            &["largest", "smallest"],
            "largest",
            "Which of several guide cover images to keep",
        )]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        let refs = book.guide().references.clone();
        if refs.is_empty() {
            return Ok(());
        }
        let smallest = ctx.options.str("guide_cover_pick") == Some("smallest");

        let covers: Vec<&GuideReference> = refs.iter().filter(|r| is_cover_kind(&r.kind)).collect();
        let images: Vec<&GuideReference> = covers
            .iter()
            .copied()
            .filter(|r| is_raster_image(&book.container.media_type(&r.href)))
            .collect();
        let mut sized: Vec<(u64, &GuideReference)> = images
            .iter()
            .map(|r| (book.container.size(&r.href).unwrap_or(0), *r))
            .collect();
        // stable: among equal sizes the first listed wins
        sized.sort_by(|a, b| if smallest { a.0.cmp(&b.0) } else { b.0.cmp(&a.0) });
        if sized.is_empty() {
            // no cover image: a plain cover page reference stands as is
            let page = covers
                .iter()
                .find(|r| r.kind.eq_ignore_ascii_case("cover"))
                .or_else(|| covers.first());
            sized.extend(page.map(|r| (0, *r)));
        }
        let cover = sized.first().map(|(size, r)| {
            if covers.len() > 1 {
                ctx.log.info(format!(
                    "{} cover references, keeping {} ({size} bytes)",
                    covers.len(),
                    r.href
                ));
            }
            GuideReference {
                kind: "cover".to_string(),
                title: if r.title.is_empty() { "Cover".to_string() } else { r.title.clone() },
                href: r.href.clone(),
                fragment: r.fragment.clone(),
            }
        });

        let mut out: Vec<GuideReference> = Vec::new();
        let mut cover_placed = false;
        for reference in &refs {
            if is_cover_kind(&reference.kind) {
                if !cover_placed {
                    if let Some(cover) = &cover {
                        out.push(cover.clone());
                    }
                    cover_placed = true;
                }
                continue;
            }
            let mut reference = reference.clone();
            reference.kind = reference.kind.to_ascii_lowercase();
            if reference.kind == "start" {
                reference.kind = "text".to_string();
            }
            if !ALLOWED.contains(&reference.kind.as_str()) {
                ctx.log.debug(format!("dropping guide reference of type {}", reference.kind));
                continue;
            }
            if out.iter().any(|r| r.kind == reference.kind) {
                continue;
            }
            out.push(reference);
        }

        if out != refs {
            book.container.opf_mut().guide.references = out;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::test_support::{book, context, xhtml};

    fn guide_book() -> Book {
        let mut book = book(&[("text.xhtml", &xhtml("<p>x</p>"))]);
        let c = &mut book.container;
        c.add_name("a.jpg", &[0u8; 50], None, &[]).unwrap();
        c.add_name("b.jpg", &[0u8; 5000], None, &[]).unwrap();
        let guide = &mut c.opf_mut().guide;
        guide.set("other.ms-coverimage", "", "a.jpg", None);
        guide.set("coverimagestandard", "", "b.jpg", None);
        guide.set("start", "Start", "text.xhtml", None);
        guide.set("other.weird", "", "text.xhtml", None);
        book
    }

    #[test]
    fn test_keeps_largest_cover() {
        let mut book = guide_book();
        let (ctx, _dir) = context(NormalizeGuide.options(), &[]);
        NormalizeGuide.run(&mut book, &ctx).unwrap();
        let kinds: Vec<(&str, &str)> = book
            .guide()
            .iter()
            .map(|r| (r.kind.as_str(), r.href.as_str()))
            .collect();
        assert_eq!(kinds, vec![("cover", "b.jpg"), ("text", "text.xhtml")]);
        assert!(book.manifest().by_href("a.jpg").is_some());
    }

    #[test]
    fn test_smallest_pick_and_idempotence() {
        let mut book = guide_book();
        let (ctx, _dir) = context(NormalizeGuide.options(), &[("guide_cover_pick", "smallest")]);
        NormalizeGuide.run(&mut book, &ctx).unwrap();
        assert_eq!(book.guide().get("cover").unwrap().href, "a.jpg");
        let before = book.guide().clone();
        NormalizeGuide.run(&mut book, &ctx).unwrap();
        assert_eq!(book.guide(), &before);
    }

    #[test]
    fn test_cover_image_beats_larger_cover_page() {
        let page = xhtml(&"<p>A long title page.</p>".repeat(150));
        let mut book = book(&[("titlepage.xhtml", &page), ("text.xhtml", &xhtml("<p>x</p>"))]);
        let c = &mut book.container;
        c.add_name("cover.jpg", &[0u8; 2000], None, &[]).unwrap();
        let guide = &mut c.opf_mut().guide;
        guide.set("cover", "Cover", "titlepage.xhtml", None);
        guide.set("other.ms-coverimage-standard", "", "cover.jpg", None);
        assert!(book.container.size("titlepage.xhtml").unwrap() > 2000);

        let (ctx, _dir) = context(NormalizeGuide.options(), &[]);
        NormalizeGuide.run(&mut book, &ctx).unwrap();
        let kinds: Vec<(&str, &str)> = book
            .guide()
            .iter()
            .map(|r| (r.kind.as_str(), r.href.as_str()))
            .collect();
        assert_eq!(kinds, vec![("cover", "cover.jpg")]);
    }

    #[test]
    fn test_cover_page_kept_without_image() {
        let mut book = book(&[("titlepage.xhtml", &xhtml("<p>Title</p>"))]);
        book.container
            .opf_mut()
            .guide
            .set("cover", "Cover", "titlepage.xhtml", None);
        let (ctx, _dir) = context(NormalizeGuide.options(), &[]);
        NormalizeGuide.run(&mut book, &ctx).unwrap();
        let cover = book.guide().get("cover").unwrap();
        assert_eq!((cover.href.as_str(), cover.title.as_str()), ("titlepage.xhtml", "Cover"));
    }
}
