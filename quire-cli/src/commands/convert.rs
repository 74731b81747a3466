//! Convert command implementation

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use quire_core::pipeline::LogLevel;
use quire_core::Pipeline;

use super::parse_options;

/// Convert an ebook from one format to another
pub fn convert(pipeline: &Pipeline, input: &Path, output: &Path, options: &[String]) -> Result<()> {
    let options = parse_options(options)?;

    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        pb.set_style(style);
    }
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message(format!("Converting {}...", input.display()));

    let result = pipeline.convert(input, output, &options);
    pb.finish_and_clear();
    let report = result.with_context(|| format!("Failed to convert {}", input.display()))?;

    tracing::debug!(
        "stages: {}",
        report
            .stages
            .iter()
            .map(|s| format!("{} ({} ms{})", s.name, s.duration_ms, if s.skipped { ", skipped" } else { "" }))
            .collect::<Vec<_>>()
            .join(", ")
    );
    for record in &report.warnings {
        let level = match record.level {
            LogLevel::Error => "error",
            _ => "warning",
        };
        eprintln!("{level}: [{}] {}", record.logger, record.message);
    }
    println!(
        "Converted {} ({}) -> {} ({})",
        input.display(),
        report.input_format,
        output.display(),
        report.output_format
    );

    Ok(())
}
