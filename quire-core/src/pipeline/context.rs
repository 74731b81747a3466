//! Per-conversion state: codec and transform registries, the cancellation
//! token and the context handed to each stage.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::Log;
use crate::decoder::{self, Decoder};
use crate::encoder::{self, Encoder};
use crate::error::{ConversionError, ParseError, Result};
use crate::options::{InputProfile, OptionDef, OptionsMap, OutputProfile};
use crate::transform::{self, Transform};
use crate::types::MetadataField;

/// Shared flag polled between stages and between spine items
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(ConversionError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

/// What a codec or transform gets to work with
#[derive(Debug, Clone)]
pub struct StageContext {
    pub stage: String,
    pub options: OptionsMap,
    pub log: Log,
    /// Scratch space shared by all stages of a conversion
    pub temp_dir: PathBuf,
    pub cancel: CancelToken,
    pub input_profile: InputProfile,
    pub output_profile: OutputProfile,
    /// Fields the output format keeps
    pub metadata_fields: &'static [MetadataField],
    deadline: Option<Instant>,
}

impl StageContext {
    /// A context outside any pipeline, mostly for tests and polishing
    pub fn new(options: OptionsMap, temp_dir: impl Into<PathBuf>) -> Self {
        let input_profile = options
            .str("input_profile")
            .and_then(InputProfile::by_name)
            .or_else(|| InputProfile::by_name("default"))
            .unwrap_or_else(|| InputProfile::builtin().remove(0));
        let output_profile = options
            .str("output_profile")
            .and_then(OutputProfile::by_name)
            .or_else(|| OutputProfile::by_name("default"))
            .unwrap_or_else(|| OutputProfile::builtin().remove(0));
        Self {
            stage: "standalone".to_string(),
            options,
            log: Log::default(),
            temp_dir: temp_dir.into(),
            cancel: CancelToken::new(),
            input_profile,
            output_profile,
            metadata_fields: MetadataField::ALL,
            deadline: None,
        }
    }

    /// Same context for another stage, with its own logger and deadline
    pub fn for_stage(&self, stage: &str, log: Log, timeout: Option<Duration>) -> Self {
        let mut ctx = self.clone();
        ctx.stage = stage.to_string();
        ctx.log = log;
        ctx.deadline = timeout.map(|t| Instant::now() + t);
        ctx
    }

    /// Fails once the conversion is cancelled or the stage is over time
    pub fn checkpoint(&self) -> Result<()> {
        self.cancel.check()?;
        match self.deadline {
            Some(deadline) if Instant::now() > deadline => {
                Err(ConversionError::Timeout(self.stage.clone()).into())
            }
            _ => Ok(()),
        }
    }

    /// Working directory for the book being built
    pub fn book_dir(&self) -> PathBuf {
        self.temp_dir.join("book")
    }
}

/// Registries for one conversion
pub struct PipelineContext {
    pub decoders: Vec<Box<dyn Decoder>>,
    pub encoders: Vec<Box<dyn Encoder>>,
    /// In canonical order
    pub transforms: Vec<Box<dyn Transform>>,
    pub cancel: CancelToken,
}

impl Default for PipelineContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Extensions of formats this build recognizes but cannot read
const UNSUPPORTED_INPUTS: &[&str] = &[
    "lit", "lrf", "rtf", "djvu", "djv", "chm", "cbr", "cb7", "snb", "rb", "pml", "pmlz", "odt",
];

fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

fn head(path: &Path) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4096);
    if let Ok(file) = File::open(path) {
        let _ = file.take(4096).read_to_end(&mut buf);
    }
    buf
}

impl PipelineContext {
    /// Every built-in codec and transform
    pub fn new() -> Self {
        Self {
            decoders: decoder::builtin(),
            encoders: encoder::builtin(),
            transforms: transform::builtin(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_decoder(mut self, decoder: impl Decoder + 'static) -> Self {
        self.decoders.push(Box::new(decoder));
        self
    }

    pub fn with_encoder(mut self, encoder: impl Encoder + 'static) -> Self {
        self.encoders.push(Box::new(encoder));
        self
    }

    /// Pick the input codec: content sniffing first, then the extension.
    /// Ties go to the higher priority.
    pub fn find_decoder(&self, path: &Path) -> Result<&dyn Decoder> {
        if !path.exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )
            .into());
        }
        let head = head(path);
        let by_priority = |a: &&Box<dyn Decoder>, b: &&Box<dyn Decoder>| {
            a.priority().cmp(&b.priority())
        };
        if let Some(found) = self
            .decoders
            .iter()
            .filter(|d| d.sniff(path, &head))
            .max_by(by_priority)
        {
            return Ok(found.as_ref());
        }
        let ext = extension(path);
        if let Some(found) = self
            .decoders
            .iter()
            .filter(|d| d.supported_extensions().contains(&ext.as_str()))
            .max_by(by_priority)
        {
            return Ok(found.as_ref());
        }
        let message = if UNSUPPORTED_INPUTS.contains(&ext.as_str()) {
            format!("{ext} input is not supported")
        } else {
            format!("cannot identify the format of {}", path.display())
        };
        Err(ParseError::UnsupportedFormat(message).into())
    }

    /// Pick the output codec from the output path's extension. A path
    /// without extension, or ending in `/`, is an OEB directory.
    pub fn find_encoder(&self, path: &Path) -> Result<&dyn Encoder> {
        let mut ext = extension(path);
        if ext.is_empty() || path.to_string_lossy().ends_with('/') || path.is_dir() {
            ext = "oeb".to_string();
        }
        self.encoders
            .iter()
            .find(|e| e.supported_extensions().contains(&ext.as_str()))
            .map(|e| e.as_ref())
            .ok_or_else(|| ConversionError::MissingCodec(format!("{ext} output")).into())
    }

    pub fn encoder_named(&self, name: &str) -> Option<&dyn Encoder> {
        self.encoders
            .iter()
            .find(|e| e.name() == name)
            .map(|e| e.as_ref())
    }

    pub fn transform(&self, name: &str) -> Option<&dyn Transform> {
        self.transforms
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn transform_names(&self) -> Vec<&'static str> {
        self.transforms.iter().map(|t| t.name()).collect()
    }

    /// Every option a conversion between these codecs can read
    pub fn option_defs(&self, decoder: &dyn Decoder, encoder: &dyn Encoder) -> Vec<OptionDef> {
        let mut defs = super::global_options();
        defs.extend(decoder.options());
        defs.extend(encoder.options());
        for t in &self.transforms {
            defs.extend(t.options());
        }
        let mut seen = std::collections::HashSet::new();
        defs.retain(|d| seen.insert(d.name));
        defs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_and_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StageContext::new(OptionsMap::default(), dir.path());
        assert!(ctx.checkpoint().is_ok());
        let timed = ctx.for_stage("slow", Log::default(), Some(Duration::ZERO));
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(timed.checkpoint().unwrap_err().code(), "E_TIMEOUT");
        ctx.cancel.cancel();
        assert!(timed.checkpoint().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_codec_lookup() {
        let ctx = PipelineContext::new();
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("a.txt");
        std::fs::write(&txt, "hello").unwrap();
        assert_eq!(ctx.find_decoder(&txt).unwrap().name(), "txt");
        let lit = dir.path().join("a.lit");
        std::fs::write(&lit, "ITOLITLS").unwrap();
        assert_eq!(
            ctx.find_decoder(&lit).err().map(|e| e.code()),
            Some("E_UNSUPPORTED_FORMAT")
        );
        assert_eq!(ctx.find_encoder(Path::new("out.epub")).unwrap().name(), "epub");
        assert_eq!(ctx.find_encoder(Path::new("out_dir")).unwrap().name(), "oeb");
        assert!(ctx.find_encoder(Path::new("out.lrf")).is_err());
    }
}
