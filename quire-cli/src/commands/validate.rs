//! Validate command implementation

use std::path::Path;

use anyhow::{bail, Result};
use quire_core::{Book, Pipeline};

#[derive(Debug, Default)]
struct Report {
    errors: Vec<String>,
    warnings: Vec<String>,
}

/// Structural checks over a decoded book
fn check(book: &mut Book, report: &mut Report) -> Result<()> {
    let meta = book.metadata();
    if meta.title.trim().is_empty() {
        report.warnings.push("the book has no title".into());
    }
    if meta.languages.is_empty() {
        report.warnings.push("the book declares no language".into());
    }

    let dropped = book.enforce_spine();
    if dropped > 0 {
        report
            .errors
            .push(format!("{dropped} spine entries refer to items missing from the manifest"));
    }
    let spine = book.spine_names();
    if spine.is_empty() {
        report.errors.push("the spine is empty".into());
    }

    if let Some(cover) = book.cover_name() {
        if !book.container.exists(&cover) {
            report.warnings.push(format!("cover image {cover} is missing"));
        }
    }

    let dangling = book.prune_dangling();
    if dangling > 0 {
        report
            .warnings
            .push(format!("{dangling} table of contents entries point at missing files"));
    }

    for name in &spine {
        for link in book.container.links(name)? {
            if !book.container.exists(&link.target) {
                report
                    .warnings
                    .push(format!("{name}: broken link to {}", link.href));
            }
        }
    }
    Ok(())
}

/// Validate an ebook file
pub fn validate(pipeline: &Pipeline, input: &Path, strict: bool) -> Result<()> {
    let mut opened = match pipeline.open(input, &[]) {
        Ok(opened) => opened,
        Err(e) => {
            eprintln!("Invalid file: {}", e);
            return Err(anyhow::Error::new(e).context(format!("Validation failed for {}", input.display())));
        }
    };

    let mut report = Report::default();
    report
        .warnings
        .extend(opened.warnings.iter().map(|r| format!("[{}] {}", r.logger, r.message)));
    check(&mut opened.book, &mut report)?;

    let format = opened.format.to_uppercase();
    for error in &report.errors {
        println!("  error: {error}");
    }
    for warning in &report.warnings {
        println!("  warning: {warning}");
    }
    if !report.errors.is_empty() || (strict && !report.warnings.is_empty()) {
        bail!(
            "Validation failed for {}: {} errors, {} warnings",
            input.display(),
            report.errors.len(),
            report.warnings.len()
        );
    }
    println!("Valid {} file", format);
    println!("  Title: {}", opened.book.title());
    println!("  Spine: {} documents", opened.book.spine_names().len());
    Ok(())
}
