//! Conversion orchestration.
//!
//! A conversion decodes the input into a [`Book`], runs the planned
//! transform chain over it and hands the result to the output codec. The
//! book lives in a temporary working directory that is removed when the
//! conversion ends, whatever the outcome.

mod context;
mod log;
mod plan;

pub use context::{CancelToken, PipelineContext, StageContext};
pub use log::{Log, LogLevel, LogRecord};
pub use plan::{plan, PlannedStage, DEFAULT_CHAIN};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info_span;

use crate::container::Container;
use crate::error::{ConversionError, QuireError, Result};
use crate::options::{InputProfile, OptionDef, OptionsMap, OutputProfile};
use crate::types::Book;

/// Options read by the orchestrator itself
pub fn global_options() -> Vec<OptionDef> {
    vec![
        OptionDef::string("input_profile", Some("default"), "Profile of the device the input was made for"),
        OptionDef::string("output_profile", Some("default"), "Profile of the target reader"),
        OptionDef::string("output_profile_file", None, "JSON file describing a custom output profile"),
        OptionDef::list("enable_transforms", "Extra transforms to run"),
        OptionDef::list("disable_transforms", "Transforms to skip"),
        OptionDef::string("debug_pipeline", None, "Directory receiving an OEBPS snapshot after each stage"),
        OptionDef::float("stage_timeout", 0.0, "Seconds a single stage may take, 0 for no limit"),
    ]
}

#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub duration_ms: u128,
    pub skipped: bool,
}

/// Outcome of a successful conversion
#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub input: PathBuf,
    pub output: PathBuf,
    pub input_format: String,
    pub output_format: String,
    pub stages: Vec<StageReport>,
    /// WARN and ERROR lines logged during the conversion
    pub warnings: Vec<LogRecord>,
}

/// Runs conversions with one set of registries
#[derive(Default)]
pub struct Pipeline {
    context: PipelineContext,
}

struct Run<'a> {
    base: StageContext,
    log: Log,
    timeout: Option<Duration>,
    debug_dir: Option<PathBuf>,
    last_snapshot: Option<PathBuf>,
    stages: Vec<StageReport>,
    context: &'a PipelineContext,
    /// Codec names for the input and output loggers
    codecs: (&'static str, &'static str),
}

impl<'a> Run<'a> {
    fn stage_log(&self, name: &str) -> Log {
        match name {
            "input" => self.log.child(name).child(self.codecs.0),
            "output" => self.log.child(name).child(self.codecs.1),
            _ => self.log.child("transform").child(name),
        }
    }

    /// Run `f` as stage `name`, with timing, deadline and error wrapping
    fn stage<T>(
        &mut self,
        name: &str,
        f: impl FnOnce(&StageContext) -> Result<T>,
    ) -> Result<T> {
        let wrap = |e: QuireError, snapshot: &Option<PathBuf>| match e {
            e @ QuireError::Stage { .. } => e,
            e => e.in_stage(name, snapshot.clone()),
        };
        self.base.cancel.check().map_err(|e| wrap(e, &self.last_snapshot))?;
        let ctx = self.base.for_stage(name, self.stage_log(name), self.timeout);
        let span = info_span!("stage", name = %name);
        let _guard = span.enter();
        let started = Instant::now();
        let out = f(&ctx).map_err(|e| wrap(e, &self.last_snapshot))?;
        let elapsed = started.elapsed();
        if matches!(self.timeout, Some(limit) if elapsed > limit) {
            let e: QuireError = ConversionError::Timeout(name.to_string()).into();
            return Err(wrap(e, &self.last_snapshot));
        }
        ctx.log.debug(format!("finished in {} ms", elapsed.as_millis()));
        self.stages.push(StageReport {
            name: name.to_string(),
            duration_ms: elapsed.as_millis(),
            skipped: false,
        });
        Ok(out)
    }

    fn snapshot(&mut self, name: &str, book: &mut Book) -> Result<()> {
        if let Some(dir) = &self.debug_dir {
            let target = dir.join(name);
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            book.container.commit_to_dir(&target)?;
            self.last_snapshot = Some(target);
        }
        Ok(())
    }

    /// Run the planned transforms over `book`
    fn transforms(&mut self, book: &mut Book, planned: &[PlannedStage]) -> Result<()> {
        let context = self.context;
        for stage in planned {
            let Some(transform) = context.transform(stage.name) else {
                continue;
            };
            let result = self.stage(stage.name, |ctx| {
                transform.run(book, ctx)?;
                ctx.checkpoint()
            });
            match result {
                Ok(()) => {}
                Err(e) if stage.optional && e.is_conflict() => {
                    self.log
                        .child("transform")
                        .child(stage.name)
                        .warn(format!("skipped after a name conflict: {}", e.root()));
                    self.stages.push(StageReport {
                        name: stage.name.to_string(),
                        duration_ms: 0,
                        skipped: true,
                    });
                }
                Err(e) => return Err(e),
            }
            book.prune_dangling();
            self.snapshot(stage.name, book)?;
        }
        Ok(())
    }
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_context(context: PipelineContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Token that cancels every conversion run by this pipeline
    pub fn cancel_token(&self) -> CancelToken {
        self.context.cancel.clone()
    }

    /// Convert `input` into `output`. `user_options` are raw `name=value`
    /// pairs as given on the command line.
    pub fn convert(
        &self,
        input: &Path,
        output: &Path,
        user_options: &[(String, String)],
    ) -> Result<ConversionReport> {
        let log = Log::new("pipeline");
        let decoder = self.context.find_decoder(input)?;
        let encoder = self.context.find_encoder(output)?;
        log.info(format!(
            "converting {} ({}) to {} ({})",
            input.display(),
            decoder.name(),
            output.display(),
            encoder.name()
        ));

        let defs = self.context.option_defs(decoder, encoder);
        let mut recommendations = decoder.recommendations();
        recommendations.extend(encoder.recommendations());
        let first = OptionsMap::resolve(&defs, &recommendations, user_options)?;
        let (input_profile, output_profile) = profiles(&first)?;
        recommendations.extend(output_profile.recommendations());
        let options = OptionsMap::resolve(&defs, &recommendations, user_options)?;

        let temp = tempfile::Builder::new().prefix("quire-").tempdir()?;
        let mut base = StageContext::new(options.clone(), temp.path());
        base.cancel = self.context.cancel.clone();
        base.input_profile = input_profile;
        base.output_profile = output_profile;
        base.metadata_fields = encoder.metadata_fields();

        let mut run = Run {
            base,
            log: log.clone(),
            timeout: options
                .float("stage_timeout")
                .filter(|t| *t > 0.0)
                .map(Duration::from_secs_f64),
            debug_dir: options.str("debug_pipeline").map(PathBuf::from),
            last_snapshot: None,
            stages: Vec::new(),
            context: &self.context,
            codecs: (decoder.name(), encoder.name()),
        };

        let mut book = run.stage("input", |ctx| decoder.decode(input, ctx))?;
        let dropped = book.enforce_spine();
        if dropped > 0 {
            log.warn(format!("dropped {dropped} spine entries missing from the manifest"));
        }
        book.prune_dangling();
        run.snapshot("input", &mut book)?;

        let mut required = decoder.required_transforms(&book, &options);
        required.extend(encoder.required_transforms(&options));
        let planned = plan(&self.context.transform_names(), &required, &options)?;
        log.debug(format!(
            "transform chain: {}",
            planned.iter().map(|s| s.name).collect::<Vec<_>>().join(", ")
        ));
        run.transforms(&mut book, &planned)?;

        run.stage("output", |ctx| {
            write_atomically(output, encoder.writes_directory(), |target| {
                encoder.encode(&mut book, target, ctx)?;
                ctx.checkpoint()
            })
        })?;
        log.info(format!("wrote {}", output.display()));

        Ok(ConversionReport {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            input_format: decoder.name().to_string(),
            output_format: encoder.name().to_string(),
            stages: run.stages,
            warnings: log.records(),
        })
    }

    /// Run `transforms` directly over an existing EPUB or OEBPS container
    /// and commit it to `output`, without going through the codecs.
    pub fn polish(
        &self,
        input: &Path,
        output: &Path,
        transforms: &[&str],
        user_options: &[(String, String)],
    ) -> Result<ConversionReport> {
        let log = Log::new("polish");
        let mut defs = global_options();
        for t in &self.context.transforms {
            defs.extend(t.options());
        }
        let mut seen = std::collections::HashSet::new();
        defs.retain(|d| seen.insert(d.name));
        let first = OptionsMap::resolve(&defs, &[], user_options)?;
        let (input_profile, output_profile) = profiles(&first)?;
        let options = OptionsMap::resolve(&defs, &output_profile.recommendations(), user_options)?;

        let registered = self.context.transform_names();
        let mut planned = Vec::new();
        for &name in &registered {
            if transforms.contains(&name) {
                planned.push(PlannedStage { name, optional: false });
            }
        }
        for name in transforms {
            if !registered.contains(name) {
                return Err(ConversionError::InvalidOption {
                    name: "transforms".into(),
                    message: format!("unknown transform '{name}'"),
                }
                .into());
            }
        }

        let temp = tempfile::Builder::new().prefix("quire-").tempdir()?;
        let mut base = StageContext::new(options.clone(), temp.path());
        base.cancel = self.context.cancel.clone();
        base.input_profile = input_profile;
        base.output_profile = output_profile;
        let mut run = Run {
            base,
            log: log.clone(),
            timeout: None,
            debug_dir: None,
            last_snapshot: None,
            stages: Vec::new(),
            context: &self.context,
            codecs: ("container", "container"),
        };

        let mut book = run.stage("input", |ctx| {
            Ok(Book::new(Container::open_in(input, ctx.book_dir())?))
        })?;
        run.transforms(&mut book, &planned)?;
        let as_dir = output.is_dir() || output.extension().is_none();
        run.stage("output", |_| {
            write_atomically(output, as_dir, |target| {
                if as_dir {
                    book.container.commit_to_dir(target)
                } else {
                    book.container.commit(target)
                }
            })
        })?;

        Ok(ConversionReport {
            input: input.to_path_buf(),
            output: output.to_path_buf(),
            input_format: "container".into(),
            output_format: if as_dir { "oeb".into() } else { "epub".into() },
            stages: run.stages,
            warnings: log.records(),
        })
    }
}

/// A decoded book together with the working directory backing it
pub struct OpenedBook {
    pub book: Book,
    pub format: &'static str,
    /// WARN and ERROR lines logged while decoding
    pub warnings: Vec<LogRecord>,
    _temp: tempfile::TempDir,
}

impl Pipeline {
    /// Decode `input` without transforming or writing it
    pub fn open(&self, input: &Path, user_options: &[(String, String)]) -> Result<OpenedBook> {
        let log = Log::new("open");
        let decoder = self.context.find_decoder(input)?;
        let mut defs = global_options();
        defs.extend(decoder.options());
        let options = OptionsMap::resolve(&defs, &decoder.recommendations(), user_options)?;
        let temp = tempfile::Builder::new().prefix("quire-").tempdir()?;
        let mut ctx = StageContext::new(options, temp.path());
        ctx.cancel = self.context.cancel.clone();
        let ctx = ctx.for_stage("input", log.child(decoder.name()), None);
        let book = decoder
            .decode(input, &ctx)
            .map_err(|e| e.in_stage("input", None))?;
        Ok(OpenedBook {
            book,
            format: decoder.name(),
            warnings: log.records(),
            _temp: temp,
        })
    }
}

fn profiles(options: &OptionsMap) -> Result<(InputProfile, OutputProfile)> {
    let unknown = |option: &str, name: &str| -> QuireError {
        ConversionError::InvalidOption {
            name: option.to_string(),
            message: format!("unknown profile '{name}'"),
        }
        .into()
    };
    let input_name = options.str("input_profile").unwrap_or("default");
    let input = InputProfile::by_name(input_name).ok_or_else(|| unknown("input_profile", input_name))?;
    let output = match options.str("output_profile_file") {
        Some(file) => OutputProfile::from_file(Path::new(file))?,
        None => {
            let name = options.str("output_profile").unwrap_or("default");
            OutputProfile::by_name(name).ok_or_else(|| unknown("output_profile", name))?
        }
    };
    Ok((input, output))
}

/// Let `write` produce the output at a sibling temporary path, then move it
/// into place. Nothing is left at `output` when `write` fails.
fn write_atomically(
    output: &Path,
    directory: bool,
    write: impl FnOnce(&Path) -> Result<()>,
) -> Result<()> {
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    if directory {
        let temp = tempfile::Builder::new().prefix(".quire-").tempdir_in(&parent)?;
        write(temp.path())?;
        if output.exists() {
            fs::remove_dir_all(output)?;
        }
        fs::rename(temp.path(), output)?;
        return Ok(());
    }
    let suffix = output
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let temp = tempfile::Builder::new()
        .prefix(".quire-")
        .suffix(&suffix)
        .tempfile_in(&parent)?;
    write(temp.path())?;
    temp.persist(output)
        .map_err(|e| ConversionError::OutputFailed(format!("{}: {}", output.display(), e.error)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomically_leaves_nothing_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("book.epub");
        let err = write_atomically(&out, false, |_| {
            Err(ConversionError::OutputFailed("boom".into()).into())
        })
        .unwrap_err();
        assert_eq!(err.code(), "E_OUTPUT_FAILED");
        assert!(!out.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);

        write_atomically(&out, false, |p| Ok(fs::write(p, b"ok")?)).unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"ok");
    }

    #[test]
    fn test_unknown_profile() {
        let defs = global_options();
        let opts = OptionsMap::resolve(
            &defs,
            &[],
            &[("output_profile".into(), "nope".into())],
        )
        .unwrap();
        assert!(profiles(&opts).unwrap_err().is_usage());
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.txt");
        fs::write(&input, "Hello\n\nWorld").unwrap();
        let pipeline = Pipeline::new();
        pipeline.cancel_token().cancel();
        let out = dir.path().join("a.epub");
        let err = pipeline.convert(&input, &out, &[]).unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(err.stage(), Some("input"));
        assert!(!out.exists());
    }
}
