//! Batch conversion command implementation

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use quire_core::{ConversionError, Pipeline, QuireError};
use rayon::prelude::*;

use super::{parse_options, UsageError};

/// Batch convert every readable ebook in `input_dir`
pub fn batch(
    pipeline: &Pipeline,
    input_dir: &Path,
    output_dir: &Path,
    format: &str,
    jobs: usize,
    options: &[String],
) -> Result<()> {
    let options = parse_options(options)?;
    let format = format.trim_start_matches('.').to_ascii_lowercase();
    if pipeline
        .context()
        .find_encoder(&output_dir.join(format!("probe.{format}")))
        .is_err()
    {
        return Err(UsageError(format!("no encoder available for {format} output")).into());
    }

    fs::create_dir_all(output_dir)?;

    // Find all files a decoder recognizes
    let mut files: Vec<PathBuf> = fs::read_dir(input_dir)
        .with_context(|| format!("Failed to read {}", input_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && pipeline.context().find_decoder(p).is_ok())
        .collect();
    files.sort();

    if files.is_empty() {
        println!("No supported files found in {}", input_dir.display());
        return Ok(());
    }

    println!("Found {} files to convert", files.len());

    let overall_pb = ProgressBar::new(files.len() as u64);
    if let Ok(style) = ProgressStyle::default_bar()
        .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
    {
        overall_pb.set_style(style.progress_chars("##-"));
    }

    let success_count = AtomicUsize::new(0);
    let error_count = AtomicUsize::new(0);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .build()
        .context("Failed to start worker threads")?;

    pool.install(|| {
        files.par_iter().for_each(|file_path| {
            if pipeline.cancel_token().is_cancelled() {
                return;
            }
            let Some(stem) = file_path.file_stem() else {
                return;
            };
            let output = output_dir.join(format!("{}.{format}", stem.to_string_lossy()));
            match pipeline.convert(file_path, &output, &options) {
                Ok(_) => {
                    success_count.fetch_add(1, Ordering::Relaxed);
                    tracing::info!("Converted {:?} -> {:?}", file_path, output);
                }
                Err(e) if e.is_cancelled() => {}
                Err(e) => {
                    error_count.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Failed to convert {:?}: {}", file_path, e);
                }
            }
            overall_pb.inc(1);
        });
    });

    overall_pb.finish();

    if pipeline.cancel_token().is_cancelled() {
        let cancelled: QuireError = ConversionError::Cancelled.into();
        return Err(cancelled.into());
    }

    let success = success_count.load(Ordering::Relaxed);
    let errors = error_count.load(Ordering::Relaxed);

    println!("\nBatch conversion complete:");
    println!("  Success: {}", success);
    println!("  Errors:  {}", errors);

    if errors > 0 {
        bail!("Batch conversion completed with {} errors", errors);
    }

    Ok(())
}
