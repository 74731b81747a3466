//! Property tests for the book model and transforms

use std::io::Cursor;

use image::{DynamicImage, GenericImageView, ImageFormat};
use proptest::prelude::*;
use quire_core::decoder::{Decoder, TxtDecoder};
use quire_core::opf::Package;
use quire_core::transform::{
    FlattenCss, NormalizeImages, Transform, UpgradeOpf, CANONICAL_ORDER,
};
use quire_core::{Book, OptionDef, OptionsMap, Pipeline, StageContext};

fn context(defs: Vec<OptionDef>) -> (StageContext, tempfile::TempDir) {
    context_with(defs, &[])
}

fn context_with(defs: Vec<OptionDef>, user: &[(&str, String)]) -> (StageContext, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let user: Vec<(String, String)> = user.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
    let options = OptionsMap::resolve(&defs, &[], &user).unwrap();
    (StageContext::new(options, dir.path()), dir)
}

fn png(w: u32, h: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(w, h, |x, y| image::Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, 90]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img).write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn xhtml(body: &str) -> String {
    format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>T</title><link rel=\"stylesheet\" href=\"s.css\"/></head><body>{body}</body></html>"
    )
}

fn word() -> impl Strategy<Value = String> {
    "[a-zA-Z]{1,10}"
}

fn paragraph() -> impl Strategy<Value = String> {
    prop::collection::vec(word(), 1..12).prop_map(|w| w.join(" "))
}

/// Markdown-ish text: paragraphs, some of them headings
fn document() -> impl Strategy<Value = String> {
    prop::collection::vec((any::<bool>(), paragraph()), 1..20).prop_map(|parts| {
        parts
            .into_iter()
            .map(|(heading, p)| if heading { format!("# {p}") } else { p })
            .collect::<Vec<_>>()
            .join("\n\n")
    })
}

fn css_rule() -> impl Strategy<Value = String> {
    let selector = prop::sample::select(vec!["p", "div", ".a", "#b", "div p", "a:hover", "body"]);
    let property = prop::sample::select(vec![
        "color: red",
        "font-size: 1.2em",
        "margin: 1em 0",
        "text-indent: 2em",
        "font-weight: bold",
    ]);
    (selector, property).prop_map(|(s, p)| format!("{s} {{ {p} }}"))
}

fn body() -> impl Strategy<Value = String> {
    let element = prop::sample::select(vec![
        "<p>one</p>",
        "<p class=\"a\">two</p>",
        "<div id=\"b\"><p>three</p></div>",
        "<div class=\"a\"><a href=\"#b\">four</a></div>",
        "<p style=\"color: blue\">five</p>",
    ]);
    prop::collection::vec(element, 1..8).prop_map(|e| e.concat())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn txt_spine_is_manifested(text in document()) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("book.md");
        std::fs::write(&input, &text).unwrap();

        let decoder = TxtDecoder::new();
        let (ctx, _tmp) = context(decoder.options());
        let book = decoder.decode(&input, &ctx).unwrap();

        prop_assert!(!book.spine().items.is_empty());
        for id in book.spine().ids() {
            let item = book.manifest().get(id);
            prop_assert!(item.is_some(), "spine id {} not in manifest", id);
            prop_assert!(book.container.exists(&item.unwrap().href));
        }
    }

    #[test]
    fn rename_updates_every_reference(stem in "[a-z]{1,8}", dir_name in "[a-z]{1,6}") {
        let mut book = Book::empty().unwrap();
        let target = format!("c-{stem}.xhtml");
        let linking = xhtml(&format!("<p><a href=\"{target}#x\">go</a></p>"));
        let a = book.container.add_name("a.xhtml", linking.as_bytes(), None, &[]).unwrap();
        let t = book.container.add_name(&target, xhtml("<p id=\"x\">here</p>").as_bytes(), None, &[]).unwrap();
        book.container.opf_mut().spine.push(a, true);
        book.container.opf_mut().spine.push(t, true);

        let new = format!("{dir_name}/moved-{stem}.xhtml");
        book.container.rename(&target, &new).unwrap();

        prop_assert!(!book.container.exists(&target));
        prop_assert!(book.container.exists(&new));
        prop_assert!(book.manifest().by_href(&new).is_some());
        let links = book.container.links("a.xhtml").unwrap();
        prop_assert_eq!(links.len(), 1);
        prop_assert_eq!(&links[0].target, &new);
        prop_assert_eq!(links[0].fragment.as_deref(), Some("x"));
    }

    #[test]
    fn flatten_css_is_idempotent(rules in prop::collection::vec(css_rule(), 0..8), body in body()) {
        let mut book = Book::empty().unwrap();
        let id = book.container.add_name("a.xhtml", xhtml(&body).as_bytes(), None, &[]).unwrap();
        book.container.opf_mut().spine.push(id, true);
        book.container.add_name("s.css", rules.join("\n").as_bytes(), None, &[]).unwrap();

        let (ctx, _tmp) = context(FlattenCss.options());
        FlattenCss.run(&mut book, &ctx).unwrap();
        let first = book.container.read_text("a.xhtml").unwrap();
        FlattenCss.run(&mut book, &ctx).unwrap();
        prop_assert_eq!(book.container.read_text("a.xhtml").unwrap(), first);
    }

    #[test]
    fn upgrade_opf_is_idempotent(title in paragraph(), isbn in "97[89][0-9]{10}", creator in paragraph()) {
        let opf = format!(
            r#"<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="uid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    <dc:identifier id="uid" opf:scheme="ISBN">{isbn}</dc:identifier>
    <dc:title>{title}</dc:title>
    <dc:creator opf:role="aut">{creator}</dc:creator>
    <dc:language>en</dc:language>
  </metadata>
  <manifest/><spine/>
</package>"#
        );
        let mut book = Book::empty().unwrap();
        *book.container.opf_mut() = Package::parse_str(&opf, "content.opf").unwrap();

        let (ctx, _tmp) = context(Vec::new());
        UpgradeOpf.run(&mut book, &ctx).unwrap();
        let once = book.container.opf().to_xml("content.opf");
        let urn = format!("urn:isbn:{isbn}");
        prop_assert!(once.contains(&urn));
        UpgradeOpf.run(&mut book, &ctx).unwrap();
        prop_assert_eq!(book.container.opf().to_xml("content.opf"), once);
    }

    #[test]
    fn normalized_images_are_smaller_and_within_limits(
        (w, h) in (1u32..240, 1u32..240),
        (max_w, max_h) in (8u32..200, 8u32..200),
    ) {
        let original = png(w, h);
        let mut book = Book::empty().unwrap();
        book.container.add_name("img.png", &original, None, &[]).unwrap();

        let (ctx, _tmp) = context_with(
            NormalizeImages.options(),
            &[("max_image_size", format!("{max_w}x{max_h}"))],
        );
        NormalizeImages.run(&mut book, &ctx).unwrap();

        let out = book.container.read("img.png").unwrap();
        if w <= max_w && h <= max_h {
            prop_assert_eq!(&out, &original);
        }
        if out != original {
            prop_assert!(out.len() < original.len());
            let (ow, oh) = image::load_from_memory(&out).unwrap().dimensions();
            prop_assert!(ow <= max_w && oh <= max_h, "{}x{} exceeds {}x{}", ow, oh, max_w, max_h);
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn toc_targets_survive_any_transforms(
        text in document(),
        transforms in prop::sample::subsequence(CANONICAL_ORDER.to_vec(), 1..=CANONICAL_ORDER.len()),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("book.md");
        std::fs::write(&input, &text).unwrap();
        let epub = dir.path().join("book.epub");
        let polished = dir.path().join("polished.epub");

        let pipeline = Pipeline::new();
        pipeline.convert(&input, &epub, &[]).unwrap();
        pipeline.polish(&epub, &polished, &transforms, &[]).unwrap();

        let mut opened = pipeline.open(&polished, &[]).unwrap();
        let book = &mut opened.book;
        let report = book.check_integrity();
        prop_assert!(report.errors.is_empty(), "{:?} after {:?}", report.errors, transforms);

        let hrefs: Vec<String> = book
            .toc()
            .flatten()
            .into_iter()
            .filter_map(|(_, node)| node.href.clone())
            .collect();
        for href in hrefs {
            prop_assert!(book.manifest().by_href(&href).is_some(), "{} after {:?}", href, transforms);
        }
    }
}
