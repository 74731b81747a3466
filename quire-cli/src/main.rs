//! Quire CLI - command-line ebook converter

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use quire_core::Pipeline;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Parse and validate jobs argument (must be at least 1)
fn parse_jobs(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|_| format!("'{}' is not a valid number", s))?;
    if n < 1 {
        Err("jobs must be at least 1".to_string())
    } else {
        Ok(n)
    }
}

#[derive(Parser)]
#[command(name = "quire")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert an ebook to another format, chosen by the output extension
    Convert {
        /// Input file path
        input: PathBuf,

        /// Output file path; a path without extension writes an OEB directory
        output: PathBuf,

        /// Conversion options, written as --name=value
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "OPTIONS")]
        options: Vec<String>,
    },

    /// Display information about an ebook
    Info {
        /// Input file path
        input: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate an ebook file
    Validate {
        /// Input file path
        input: PathBuf,

        /// Treat warnings as failures
        #[arg(long)]
        strict: bool,
    },

    /// Batch convert every readable ebook in a directory
    Batch {
        /// Input directory
        input_dir: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Output format, as a file extension
        #[arg(short, long, default_value = "epub")]
        format: String,

        /// Number of parallel jobs (must be at least 1)
        #[arg(short, long, default_value = "4", value_parser = parse_jobs)]
        jobs: usize,

        /// Conversion options applied to every book, written as --name=value
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "OPTIONS")]
        options: Vec<String>,
    },

    /// Rewrite an EPUB or OEB directory in place of a full conversion
    Polish {
        /// Input EPUB file or OEB directory
        input: PathBuf,

        /// Output EPUB file or directory
        output: PathBuf,

        /// Upgrade the package to EPUB 3
        #[arg(long)]
        upgrade_opf: bool,

        /// Repair and complete the guide
        #[arg(long)]
        normalize_guide: bool,

        /// Move data: URLs into separate files
        #[arg(long)]
        extract_data_urls: bool,

        /// Clean up markup
        #[arg(long)]
        clean_html: bool,
    },

    /// List the supported formats and transforms
    Formats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("quire_cli=debug,quire_core=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("quire_cli=info,quire_core=warn"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn run(command: Commands, pipeline: &Pipeline) -> anyhow::Result<()> {
    match command {
        Commands::Convert {
            input,
            output,
            options,
        } => commands::convert(pipeline, &input, &output, &options),

        Commands::Info { input, json } => commands::info(pipeline, &input, json),

        Commands::Validate { input, strict } => commands::validate(pipeline, &input, strict),

        Commands::Batch {
            input_dir,
            output_dir,
            format,
            jobs,
            options,
        } => commands::batch(pipeline, &input_dir, &output_dir, &format, jobs, &options),

        Commands::Polish {
            input,
            output,
            upgrade_opf,
            normalize_guide,
            extract_data_urls,
            clean_html,
        } => {
            let mut transforms = Vec::new();
            if upgrade_opf {
                transforms.push("upgrade_opf");
            }
            if normalize_guide {
                transforms.push("normalize_guide");
            }
            if extract_data_urls {
                transforms.push("data_urls");
            }
            if clean_html {
                transforms.push("clean_html");
            }
            commands::polish(pipeline, &input, &output, &transforms)
        }

        Commands::Formats { json } => commands::formats(pipeline, json),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(commands::EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };
    init_tracing(cli.verbose);

    let pipeline = Arc::new(Pipeline::new());
    let token = pipeline.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            token.cancel();
        }
    });

    let worker = Arc::clone(&pipeline);
    let result = tokio::task::spawn_blocking(move || run(cli.command, &worker)).await;
    match result {
        Ok(Ok(())) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(commands::exit_code(&e))
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(commands::EXIT_FAILURE)
        }
    }
}
