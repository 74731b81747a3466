//! Snapshot tests for quire-core using insta
//!
//! These tests capture the output of text rendering and metadata
//! round trips to detect unintended changes in the output format.

use quire_core::encoder::{Encoder, TxtEncoder};
use quire_core::opf::metadata::{read_metadata, write_metadata};
use quire_core::opf::Package;
use quire_core::{Book, Container, Metadata, OptionsMap, StageContext};
use serde::Serialize;

/// Helper to create a sample book for testing
fn sample_book() -> Book {
    let mut container = Container::temporary().unwrap();
    let chapters = [
        (
            "ch1.xhtml",
            "<h1>The Art of Testing</h1><p>This is a <strong>comprehensive</strong> guide with <em>real examples</em>.</p><ul><li>First item</li><li>Second item</li></ul>",
        ),
        (
            "ch2.xhtml",
            r#"<h2>Code</h2><pre>fn main() {}</pre><blockquote><p>Quoted words.</p></blockquote><ol start="3"><li>Third</li><li>Fourth</li></ol>"#,
        ),
    ];
    for (name, body) in chapters {
        let doc = format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>T</title></head><body>{body}</body></html>"#
        );
        let id = container.add_name(name, doc.as_bytes(), None, &[]).unwrap();
        container.opf_mut().spine.push(id, true);
    }
    let mut book = Book::new(container);
    book.set_metadata(&Metadata::new("The Art of Testing", "en"));
    book
}

fn encode_txt(book: &mut Book, options: &[(&str, &str)]) -> String {
    let encoder = TxtEncoder::new();
    let dir = tempfile::tempdir().unwrap();
    let user: Vec<(String, String)> = options
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let options = OptionsMap::resolve(&encoder.options(), &[], &user).unwrap();
    let ctx = StageContext::new(options, dir.path());
    let out = dir.path().join("book.txt");
    encoder.encode(book, &out, &ctx).unwrap();
    std::fs::read_to_string(out).unwrap()
}

#[test]
fn test_markdown_text_snapshot() {
    let mut book = sample_book();
    let text = encode_txt(
        &mut book,
        &[("txt_output_formatting", "markdown"), ("newline", "unix")],
    );

    insta::assert_snapshot!(text.trim_end(), @r###"
    # The Art of Testing

    This is a **comprehensive** guide with *real examples*.

    * First item

    * Second item

    ## Code

    ```
    fn main() {}
    ```

    > Quoted words.

    3. Third

    4. Fourth
    "###);
}

#[test]
fn test_plain_text_snapshot() {
    let mut book = sample_book();
    let text = encode_txt(&mut book, &[("newline", "unix"), ("max_line_length", "30")]);

    insta::assert_snapshot!(text.trim_end(), @r###"
    The Art of Testing

    This is a comprehensive guide
    with real examples.

    * First item

    * Second item

    Code

    fn main() {}

    Quoted words.

    3. Third

    4. Fourth
    "###);
}

/// The metadata fields that survive a package round trip
#[derive(Debug, Serialize)]
struct StableMetadata {
    title: String,
    authors: Vec<String>,
    languages: Vec<String>,
    publisher: Option<String>,
    tags: Vec<String>,
    series: Option<String>,
    series_index: Option<f64>,
    isbn: Option<String>,
}

impl From<&Metadata> for StableMetadata {
    fn from(m: &Metadata) -> Self {
        Self {
            title: m.title.clone(),
            authors: m.authors.clone(),
            languages: m.languages.clone(),
            publisher: m.publisher.clone(),
            tags: m.tags.clone(),
            series: m.series.clone(),
            series_index: m.series_index,
            isbn: m.isbn().map(str::to_string),
        }
    }
}

fn round_trip(version: &str) -> StableMetadata {
    let mut meta = Metadata::new("The Art of Testing", "en");
    meta.authors = vec!["Jane Doe".to_string(), "John Smith".to_string()];
    meta.publisher = Some("Test Press".to_string());
    meta.tags = vec!["Testing".to_string(), "Software".to_string()];
    meta.set_series(Some("Craft".to_string()), Some(2.0));
    meta.set_identifier("isbn", "9780000000002");

    let mut pkg = Package::new();
    pkg.version = version.to_string();
    write_metadata(&mut pkg, &meta);
    StableMetadata::from(&read_metadata(&pkg))
}

#[test]
fn test_metadata_round_trip_epub2() {
    insta::assert_json_snapshot!(round_trip("2.0"), @r###"
    {
      "title": "The Art of Testing",
      "authors": [
        "Jane Doe",
        "John Smith"
      ],
      "languages": [
        "en"
      ],
      "publisher": "Test Press",
      "tags": [
        "Testing",
        "Software"
      ],
      "series": "Craft",
      "series_index": 2.0,
      "isbn": "9780000000002"
    }
    "###);
}

#[test]
fn test_metadata_round_trip_epub3() {
    insta::assert_json_snapshot!(round_trip("3.0"), @r###"
    {
      "title": "The Art of Testing",
      "authors": [
        "Jane Doe",
        "John Smith"
      ],
      "languages": [
        "en"
      ],
      "publisher": "Test Press",
      "tags": [
        "Testing",
        "Software"
      ],
      "series": "Craft",
      "series_index": 2.0,
      "isbn": "9780000000002"
    }
    "###);
}
