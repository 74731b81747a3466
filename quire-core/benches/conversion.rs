//! Conversion benchmarks
//!
//! Run with: cargo bench

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use quire_core::compression::{palmdoc, tcr};
use quire_core::transform::{FlattenCss, Transform};
use quire_core::{Book, OptionsMap, Pipeline, StageContext};

/// A markdown book of `chapters` chapters
fn sample_markdown(chapters: usize) -> String {
    let mut text = String::from("# Benchmark Book\n\n");
    for n in 1..=chapters {
        text.push_str(&format!("## Chapter {n}\n\n"));
        for _ in 0..20 {
            text.push_str(
                "The quick brown fox jumps over the lazy dog, *again* and **again**, until the dog gives up.\n\n",
            );
        }
    }
    text
}

fn bench_markdown_to_epub(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("book.md");
    std::fs::write(&input, sample_markdown(10)).unwrap();
    let output = dir.path().join("book.epub");
    let pipeline = Pipeline::new();

    c.bench_function("markdown_to_epub", |b| {
        b.iter(|| pipeline.convert(&input, &output, &[]).unwrap());
    });
}

fn bench_markdown_to_mobi(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("book.md");
    std::fs::write(&input, sample_markdown(10)).unwrap();
    let output = dir.path().join("book.mobi");
    let pipeline = Pipeline::new();

    c.bench_function("markdown_to_mobi", |b| {
        b.iter(|| pipeline.convert(&input, &output, &[]).unwrap());
    });
}

fn bench_compression(c: &mut Criterion) {
    let text = sample_markdown(4).into_bytes();
    let record = &text[..text.len().min(4096)];
    let packed = palmdoc::compress(record);

    c.bench_function("palmdoc_compress", |b| {
        b.iter(|| palmdoc::compress(black_box(record)));
    });
    c.bench_function("palmdoc_decompress", |b| {
        b.iter(|| palmdoc::decompress(black_box(&packed)));
    });
    c.bench_function("tcr_compress", |b| {
        b.iter(|| tcr::compress(black_box(&text)));
    });
}

const STYLESHEET: &str = "body { font-size: 12pt }\n.chapter { margin: 1em 0 }\np { text-indent: 1.5em; margin: 0 }\np.first { text-indent: 0 }\nh2 { font-size: 1.5em; margin-top: 2em }\nem { font-style: italic }\n";

fn styled_chapter(n: usize) -> String {
    let mut body = format!("<div class=\"chapter\"><h2>Chapter {n}</h2><p class=\"first\">Opening line.</p>");
    for _ in 0..50 {
        body.push_str("<p>The quick brown fox jumps over the <em>lazy</em> dog.</p>");
    }
    body.push_str("</div>");
    format!(
        "<html xmlns=\"http://www.w3.org/1999/xhtml\"><head><title>T</title><link rel=\"stylesheet\" href=\"style.css\"/></head><body>{body}</body></html>"
    )
}

fn bench_flatten_css(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let transform = FlattenCss::new();
    let options = OptionsMap::resolve(&transform.options(), &[], &[]).unwrap();
    let ctx = StageContext::new(options, dir.path());

    c.bench_function("flatten_css", |b| {
        b.iter_batched(
            || {
                let mut book = Book::empty().unwrap();
                book.container.add_name("style.css", STYLESHEET.as_bytes(), None, &[]).unwrap();
                for n in 1..=10 {
                    let id = book
                        .container
                        .add_name(&format!("ch{n}.xhtml"), styled_chapter(n).as_bytes(), None, &[])
                        .unwrap();
                    book.container.opf_mut().spine.push(id, true);
                }
                book
            },
            |mut book| transform.run(&mut book, &ctx).unwrap(),
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(
    benches,
    bench_markdown_to_epub,
    bench_markdown_to_mobi,
    bench_compression,
    bench_flatten_css
);
criterion_main!(benches);
