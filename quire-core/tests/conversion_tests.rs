//! End-to-end conversions through the pipeline
//!
//! Each test writes a small input file, runs `Pipeline::convert` over it and
//! inspects the written output.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use quire_core::decoder::{Azw4Decoder, PdfBackend};
use quire_core::pdb::mobi::{Exth, Record0};
use quire_core::pdb::{PdbFile, PdbKind};
use quire_core::{Book, Container, Pipeline, PipelineContext};
use tempfile::TempDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

// =============================================================================
// Helpers
// =============================================================================

const CONTAINER_XML: &str = r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#;

const NCX: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head/><docTitle><text>Hello</text></docTitle>
  <navMap><navPoint id="n1" playOrder="1"><navLabel><text>Start</text></navLabel><content src="ch1.xhtml"/></navPoint></navMap>
</ncx>"#;

fn xhtml(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>Hello</title></head><body>{body}</body></html>"#
    )
}

/// Write an EPUB whose package document is `content.opf` at the root
fn write_epub(path: &Path, opf: &str, files: &[(&str, &[u8])]) {
    let mut zip = ZipWriter::new(File::create(path).unwrap());
    let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    zip.start_file("mimetype", stored).unwrap();
    zip.write_all(b"application/epub+zip").unwrap();
    zip.start_file("META-INF/container.xml", stored).unwrap();
    zip.write_all(CONTAINER_XML.as_bytes()).unwrap();
    zip.start_file("content.opf", stored).unwrap();
    zip.write_all(opf.as_bytes()).unwrap();
    for (name, data) in files {
        zip.start_file(*name, stored).unwrap();
        zip.write_all(data).unwrap();
    }
    zip.finish().unwrap();
}

fn zip_text(path: &Path, suffix: &str) -> String {
    let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
    let name = archive
        .file_names()
        .find(|n| n.ends_with(suffix))
        .map(str::to_string)
        .unwrap_or_else(|| panic!("no {suffix} in {}", path.display()));
    let mut text = String::new();
    archive.by_name(&name).unwrap().read_to_string(&mut text).unwrap();
    text
}

fn options(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn epub2_opf(metadata: &str, manifest: &str, spine: &str, guide: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="bookid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/" xmlns:opf="http://www.idpf.org/2007/opf">
    {metadata}
  </metadata>
  <manifest>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    {manifest}
  </manifest>
  <spine toc="ncx">{spine}</spine>
  <guide>{guide}</guide>
</package>"#
    )
}

struct Workspace {
    dir: TempDir,
}

impl Workspace {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn test_epub2_to_epub3_upgrade() {
    let ws = Workspace::new();
    let input = ws.path("hello.epub");
    let opf = epub2_opf(
        r#"<dc:identifier id="bookid" opf:scheme="ISBN">9780000000002</dc:identifier>
    <dc:title>Hello</dc:title>
    <dc:language>en</dc:language>"#,
        r#"<item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>"#,
        r#"<itemref idref="ch1"/>"#,
        "",
    );
    let chapter = xhtml(
        r#"<p>Picture:</p><svg xmlns="http://www.w3.org/2000/svg" width="10" height="10"><rect width="10" height="10"/></svg>"#,
    );
    write_epub(&input, &opf, &[("ch1.xhtml", chapter.as_bytes()), ("toc.ncx", NCX.as_bytes())]);

    let output = ws.path("hello3.epub");
    let report = Pipeline::new().convert(&input, &output, &[]).unwrap();
    assert_eq!(report.input_format, "epub");
    assert!(report.stages.iter().any(|s| s.name == "upgrade_opf"));

    let package = zip_text(&output, ".opf");
    assert!(package.contains(r#"version="3.0""#));
    assert!(package.contains(">urn:isbn:9780000000002</dc:identifier>"));
    assert!(!package.contains("opf:scheme"));
    assert!(package.contains(r#"property="title-type">main</meta>"#));

    let book = Book::new(Container::open(&output).unwrap());
    let item = book.manifest().by_href("ch1.xhtml").unwrap();
    assert!(item.properties.contains("svg"));
}

struct FixedText;

impl PdfBackend for FixedText {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn extract_text(&self, _data: &[u8]) -> quire_core::Result<String> {
        Ok("Chapter One\n\nSome replica text.".to_string())
    }
}

#[test]
fn test_azw4_unwraps_embedded_pdf() {
    let ws = Workspace::new();
    let input = ws.path("replica.azw4");
    let pdf: &[u8] = b"%PDF-1.4\n1 0 obj << >> endobj\ntrailer << >>\n%%EOF";
    let mut text = b"print replica header ".to_vec();
    text.extend_from_slice(pdf);
    text.extend_from_slice(b"\0\0 trailing padding");

    let mut db = PdbFile::new("Replica", PdbKind::Mobi);
    let record0 = Record0 {
        title: "Replica".into(),
        text_length: text.len() as u32,
        text_record_count: 1,
        record_size: 4096,
        uid: 7,
        locale: 9,
        first_non_text: 2,
        first_resource: 2,
        flis_index: 2,
        fcis_index: 3,
        exth: Exth::default(),
    };
    db.records.push(record0.to_bytes());
    db.records.push(text);
    fs::write(&input, db.to_bytes()).unwrap();

    let mut context = PipelineContext::new();
    context.decoders.retain(|d| d.name() != "azw4");
    let context = context.with_decoder(Azw4Decoder::with_backend(Arc::new(FixedText)));
    let output = ws.path("replica.pdf");
    let report = Pipeline::with_context(context).convert(&input, &output, &[]).unwrap();
    assert_eq!(report.input_format, "azw4");

    let written = fs::read(&output).unwrap();
    assert!(written.starts_with(b"%PDF-"));
    assert!(written.ends_with(b"%%EOF"));
    assert_eq!(written, pdf);
}

#[test]
fn test_toc_from_xpath() {
    let ws = Workspace::new();
    let input = ws.path("doc.html");
    let body: String = (1..=5)
        .map(|i| format!(r#"<h1 id="c{i}">Part {i}</h1><p>Text of part {i}.</p>"#))
        .collect();
    fs::write(&input, format!("<html><head><title>Parts</title></head><body>{body}</body></html>")).unwrap();

    let output = ws.path("parts.epub");
    Pipeline::new()
        .convert(&input, &output, &options(&[("level1_toc", "//h:h1")]))
        .unwrap();

    let mut book = Book::new(Container::open(&output).unwrap());
    let toc = book.toc().clone();
    let titles: Vec<&str> = toc.children.iter().map(|n| n.title.as_str()).collect();
    assert_eq!(titles, vec!["Part 1", "Part 2", "Part 3", "Part 4", "Part 5"]);
    for (i, entry) in toc.children.iter().enumerate() {
        assert_eq!(entry.fragment.as_deref(), Some(format!("c{}", i + 1).as_str()));
        assert!(entry.children.is_empty());
        let href = entry.href.as_deref().unwrap();
        assert!(book.container.exists(href), "{href}");
    }
}

#[test]
fn test_duplicate_cover_guide_coalesced() {
    let ws = Workspace::new();
    let input = ws.path("covers.epub");
    let opf = epub2_opf(
        r#"<dc:identifier id="bookid">urn:uuid:3c5d1a7e-1111-4222-8333-944455556666</dc:identifier>
    <dc:title>Covers</dc:title>
    <dc:language>en</dc:language>"#,
        r#"<item id="ch1" href="ch1.xhtml" media-type="application/xhtml+xml"/>
    <item id="a" href="a.jpg" media-type="image/jpeg"/>
    <item id="b" href="b.jpg" media-type="image/jpeg"/>"#,
        r#"<itemref idref="ch1"/>"#,
        r#"<reference type="other.ms-coverimage" title="Small" href="a.jpg"/>
    <reference type="coverimagestandard" title="Large" href="b.jpg"/>"#,
    );
    let chapter = xhtml("<p>Words.</p>");
    let small = [0xFFu8; 50];
    let large = [0xFFu8; 5000];
    write_epub(
        &input,
        &opf,
        &[
            ("ch1.xhtml", chapter.as_bytes()),
            ("toc.ncx", NCX.as_bytes()),
            ("a.jpg", &small),
            ("b.jpg", &large),
        ],
    );

    let output = ws.path("covers-out.epub");
    Pipeline::new()
        .convert(&input, &output, &options(&[("disable_transforms", "normalize_images")]))
        .unwrap();

    let book = Book::new(Container::open(&output).unwrap());
    let covers: Vec<&str> = book
        .guide()
        .references
        .iter()
        .filter(|r| r.kind == "cover")
        .map(|r| r.href.as_str())
        .collect();
    assert_eq!(covers, vec!["b.jpg"]);
    assert!(book.guide().references.iter().all(|r| r.kind != "other.ms-coverimage"));
    assert!(book.manifest().by_href("a.jpg").is_some());
}

#[test]
fn test_data_url_image_extracted() {
    let ws = Workspace::new();
    let mut png = Vec::new();
    image::RgbaImage::from_pixel(16, 16, image::Rgba([200, 30, 30, 255]))
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .unwrap();
    use base64::Engine;
    let url = format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(&png)
    );
    let input = ws.path("inline.html");
    fs::write(
        &input,
        format!(r#"<html><head><title>Inline</title></head><body><p>Dot:</p><img src="{url}" alt="dot"/></body></html>"#),
    )
    .unwrap();

    let output = ws.path("inline.epub");
    Pipeline::new().convert(&input, &output, &[]).unwrap();

    let mut book = Book::new(Container::open(&output).unwrap());
    let pngs: Vec<String> = book
        .manifest()
        .iter()
        .filter(|i| i.media_type == "image/png")
        .map(|i| i.href.clone())
        .collect();
    assert_eq!(pngs.len(), 1);
    let spine = book.spine_names();
    let html = book.container.read_text(&spine[0]).unwrap();
    assert!(!html.contains("data:image"));
    let src = book.container.href_for_name(&pngs[0], &spine[0]);
    assert!(html.contains(&format!(r#"src="{src}""#)), "{html}");
}

#[test]
fn test_rename_propagates_to_archive() {
    let ws = Workspace::new();
    let mut container = Container::temporary().unwrap();
    container
        .add_name("a.xhtml", xhtml(r#"<img src="img/x.png"/>"#).as_bytes(), None, &[])
        .unwrap();
    container
        .add_name("style.css", b"body { background: url(img/x.png) }", None, &[])
        .unwrap();
    container.add_name("img/x.png", b"\x89PNG\r\n\x1a\n", None, &[]).unwrap();

    container.rename("img/x.png", "images/y.png").unwrap();
    assert!(container.is_dirty("a.xhtml"));
    assert!(container.is_dirty("style.css"));
    container.flush().unwrap();
    assert!(container.read_text("a.xhtml").unwrap().contains(r#"src="images/y.png""#));
    assert!(container.read_text("style.css").unwrap().contains("url(images/y.png)"));

    let output = ws.path("renamed.epub");
    container.commit(&output).unwrap();
    let archive = ZipArchive::new(File::open(&output).unwrap()).unwrap();
    let names: Vec<&str> = archive.file_names().collect();
    assert!(names.contains(&"images/y.png"));
    assert!(!names.contains(&"img/x.png"));
}

// =============================================================================
// Cross-format round trips
// =============================================================================

#[test]
fn test_epub_round_trip_preserves_manifest_and_spine() {
    let ws = Workspace::new();
    let input = ws.path("three.epub");
    let opf = epub2_opf(
        r#"<dc:identifier id="bookid">urn:uuid:0b0e2c4a-1f55-4f2e-9d61-5d2f4b7a9c10</dc:identifier>
    <dc:title>Three</dc:title>
    <dc:language>en</dc:language>"#,
        r#"<item id="c1" href="c1.xhtml" media-type="application/xhtml+xml"/>
    <item id="c2" href="c2.xhtml" media-type="application/xhtml+xml"/>
    <item id="c3" href="c3.xhtml" media-type="application/xhtml+xml"/>"#,
        r#"<itemref idref="c3"/><itemref idref="c1"/><itemref idref="c2"/>"#,
        "",
    );
    let pages: Vec<String> = (1..=3).map(|i| xhtml(&format!("<p>Page {i}</p>"))).collect();
    write_epub(
        &input,
        &opf,
        &[
            ("c1.xhtml", pages[0].as_bytes()),
            ("c2.xhtml", pages[1].as_bytes()),
            ("c3.xhtml", pages[2].as_bytes()),
            ("toc.ncx", NCX.as_bytes()),
        ],
    );

    let output = ws.path("three-out.epub");
    Pipeline::new()
        .convert(
            &input,
            &output,
            &options(&[("epub_version", "2"), ("disable_transforms", "generate_toc,detect_structure")]),
        )
        .unwrap();

    let book = Book::new(Container::open(&output).unwrap());
    assert_eq!(book.spine_names(), vec!["c3.xhtml", "c1.xhtml", "c2.xhtml"]);
    for name in ["c1.xhtml", "c2.xhtml", "c3.xhtml", "toc.ncx"] {
        assert!(book.manifest().by_href(name).is_some(), "{name}");
    }
}

#[test]
fn test_epub_to_every_output_format() {
    let ws = Workspace::new();
    let input = ws.path("source.md");
    fs::write(&input, "# Source\n\nOpening.\n\n## One\n\nFirst *chapter*.\n\n## Two\n\nSecond chapter.").unwrap();
    let epub = ws.path("source.epub");
    Pipeline::new().convert(&input, &epub, &[]).unwrap();

    for ext in ["htmlz", "txt", "pdb", "tcr", "fb2", "mobi"] {
        let output = ws.path(&format!("out.{ext}"));
        let report = Pipeline::new()
            .convert(&epub, &output, &[])
            .unwrap_or_else(|e| panic!("{ext}: {e}"));
        assert_eq!(report.input_format, "epub");
        assert!(fs::metadata(&output).unwrap().len() > 0, "{ext}");

        let back = Pipeline::new().open(&output, &[]).unwrap_or_else(|e| panic!("{ext}: {e}"));
        assert!(!back.book.spine_names().is_empty(), "{ext}");
    }
}

#[test]
fn test_cancelled_conversion_leaves_no_output() {
    let ws = Workspace::new();
    let input = ws.path("cancel.md");
    fs::write(&input, "# Cancel\n\nText.").unwrap();
    let output = ws.path("cancel.epub");

    let pipeline = Pipeline::new();
    pipeline.cancel_token().cancel();
    let err = pipeline.convert(&input, &output, &[]).unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(err.code(), "E_CANCELLED");
    assert!(!output.exists());
}
