//! Polish command implementation

use std::path::Path;

use anyhow::{Context, Result};
use quire_core::Pipeline;

use super::UsageError;

/// Run container rewrites over an EPUB or OEB directory
pub fn polish(pipeline: &Pipeline, input: &Path, output: &Path, transforms: &[&str]) -> Result<()> {
    if transforms.is_empty() {
        return Err(UsageError(
            "nothing to do: pass at least one of --upgrade-opf, --normalize-guide, --extract-data-urls, --clean-html".into(),
        )
        .into());
    }
    let report = pipeline
        .polish(input, output, transforms, &[])
        .with_context(|| format!("Failed to polish {}", input.display()))?;
    for record in &report.warnings {
        eprintln!("warning: [{}] {}", record.logger, record.message);
    }
    println!(
        "Polished {} -> {} ({})",
        input.display(),
        output.display(),
        transforms.join(", ")
    );
    Ok(())
}
