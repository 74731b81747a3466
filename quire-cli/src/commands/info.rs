//! Info command implementation

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use quire_core::{Pipeline, TocNode};
use serde::Serialize;

/// Book info output
#[derive(Serialize)]
struct BookInfo {
    format: String,
    title: String,
    authors: Vec<String>,
    languages: Vec<String>,
    publisher: Option<String>,
    pubdate: Option<String>,
    series: Option<String>,
    series_index: Option<f64>,
    tags: Vec<String>,
    identifiers: BTreeMap<String, String>,
    description: Option<String>,
    cover: Option<String>,
    spine: usize,
    resources: usize,
    toc: Vec<TocEntry>,
}

#[derive(Serialize)]
struct TocEntry {
    title: String,
    target: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    children: Vec<TocEntry>,
}

fn toc_entries(node: &TocNode) -> Vec<TocEntry> {
    node.children
        .iter()
        .map(|c| TocEntry {
            title: c.title.clone(),
            target: c.target(),
            children: toc_entries(c),
        })
        .collect()
}

fn print_toc(entries: &[TocEntry], depth: usize) {
    for entry in entries {
        println!("  {}{}", "  ".repeat(depth), entry.title);
        print_toc(&entry.children, depth + 1);
    }
}

/// Display information about an ebook
pub fn info(pipeline: &Pipeline, input: &Path, json: bool) -> Result<()> {
    let mut opened = pipeline
        .open(input, &[])
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let book = &mut opened.book;
    let meta = book.metadata();

    let info = BookInfo {
        format: opened.format.to_string(),
        title: meta.title.clone(),
        authors: meta.authors.clone(),
        languages: meta.languages.clone(),
        publisher: meta.publisher.clone(),
        pubdate: meta.pubdate.map(|d| d.format("%Y-%m-%d").to_string()),
        series: meta.series.clone(),
        series_index: meta.series_index,
        tags: meta.tags.clone(),
        identifiers: meta.identifiers.clone(),
        description: meta.comments.clone(),
        cover: book.cover_name(),
        spine: book.spine_names().len(),
        resources: book.manifest().len(),
        toc: toc_entries(book.toc()),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!("Format:      {}", info.format.to_uppercase());
    println!("Title:       {}", info.title);
    if !info.authors.is_empty() {
        println!("Authors:     {}", info.authors.join(", "));
    }
    if !info.languages.is_empty() {
        println!("Language:    {}", info.languages.join(", "));
    }
    if let Some(publisher) = &info.publisher {
        println!("Publisher:   {}", publisher);
    }
    if let Some(date) = &info.pubdate {
        println!("Published:   {}", date);
    }
    if let Some(series) = &info.series {
        println!("Series:      {} [{}]", series, info.series_index.unwrap_or(1.0));
    }
    if !info.tags.is_empty() {
        println!("Tags:        {}", info.tags.join(", "));
    }
    for (scheme, value) in &info.identifiers {
        println!("Identifier:  {}:{}", scheme, value);
    }
    if let Some(cover) = &info.cover {
        println!("Cover:       {}", cover);
    }
    println!("Spine:       {} documents", info.spine);
    println!("Resources:   {}", info.resources);
    if !info.toc.is_empty() {
        println!("Contents:");
        print_toc(&info.toc, 0);
    }

    Ok(())
}
