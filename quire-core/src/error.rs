//! Error types for Quire Core
//!
//! Every error carries a stable machine-readable code (see [`QuireError::code`])
//! and, where one is known, the place in the book it refers to.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using QuireError
pub type Result<T> = std::result::Result<T, QuireError>;

/// Where in a book an error was detected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    pub file: Option<String>,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

impl Location {
    pub fn file(name: impl Into<String>) -> Self {
        Self {
            file: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn with_position(mut self, line: usize, column: usize) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.file, self.line, self.column) {
            (Some(file), Some(line), Some(col)) => write!(f, "{file}:{line}:{col}"),
            (Some(file), Some(line), None) => write!(f, "{file}:{line}"),
            (Some(file), _, _) => write!(f, "{file}"),
            (None, Some(line), Some(col)) => write!(f, "line {line}, column {col}"),
            (None, Some(line), None) => write!(f, "line {line}"),
            _ => write!(f, "<unknown>"),
        }
    }
}

/// Top-level error type for all Quire operations
#[derive(Debug, Error)]
pub enum QuireError {
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Conversion error: {0}")]
    Conversion(#[from] ConversionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),

    /// Raised by the pipeline orchestrator around the failure of a stage.
    #[error("stage '{stage}' failed: {source}")]
    Stage {
        stage: String,
        snapshot: Option<PathBuf>,
        #[source]
        source: Box<QuireError>,
    },
}

/// Errors raised while reading input formats
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Corrupt input: {0}")]
    CorruptInput(String),

    #[error("Partial input: {0}")]
    PartialInput(String),

    #[error("Invalid ebook: {0}")]
    InvalidEbook(String),

    #[error("Not parseable: {0}")]
    NotParseable(String),

    #[error("Malformed content at {location}: {message}")]
    Malformed { location: Location, message: String },
}

/// Errors raised by transforms, output codecs and the orchestrator
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("Name conflict: {0}")]
    Conflict(String),

    #[error("Transform '{name}' failed: {message}")]
    TransformFailed { name: String, message: String },

    #[error("Output failed: {0}")]
    OutputFailed(String),

    #[error("Conversion cancelled")]
    Cancelled,

    #[error("Stage '{0}' exceeded its time limit")]
    Timeout(String),

    #[error("Invalid option '{name}': {message}")]
    InvalidOption { name: String, message: String },

    #[error("No codec available for {0}")]
    MissingCodec(String),
}

impl QuireError {
    /// Stable identifier for the error class, suitable for scripts.
    pub fn code(&self) -> &'static str {
        match self {
            QuireError::Parse(e) => match e {
                ParseError::UnsupportedFormat(_) => "E_UNSUPPORTED_FORMAT",
                ParseError::CorruptInput(_) => "E_CORRUPT_INPUT",
                ParseError::PartialInput(_) => "E_PARTIAL_INPUT",
                ParseError::InvalidEbook(_) => "E_INVALID_EBOOK",
                ParseError::NotParseable(_) => "E_NOT_PARSEABLE",
                ParseError::Malformed { .. } => "E_MALFORMED",
            },
            QuireError::Conversion(e) => match e {
                ConversionError::Conflict(_) => "E_CONFLICT",
                ConversionError::TransformFailed { .. } => "E_TRANSFORM_FAILED",
                ConversionError::OutputFailed(_) => "E_OUTPUT_FAILED",
                ConversionError::Cancelled => "E_CANCELLED",
                ConversionError::Timeout(_) => "E_TIMEOUT",
                ConversionError::InvalidOption { .. } => "E_INVALID_OPTION",
                ConversionError::MissingCodec(_) => "E_MISSING_CODEC",
            },
            QuireError::Io(_) => "E_IO",
            QuireError::Zip(_) => "E_CORRUPT_INPUT",
            QuireError::Xml(_) => "E_MALFORMED",
            QuireError::Stage { source, .. } => source.code(),
        }
    }

    /// The location the error refers to, if any.
    pub fn location(&self) -> Option<&Location> {
        match self {
            QuireError::Parse(ParseError::Malformed { location, .. }) => Some(location),
            QuireError::Stage { source, .. } => source.location(),
            _ => None,
        }
    }

    /// Name of the pipeline stage that failed, when raised by the orchestrator.
    pub fn stage(&self) -> Option<&str> {
        match self {
            QuireError::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Innermost error, with any stage wrappers removed.
    pub fn root(&self) -> &QuireError {
        match self {
            QuireError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.root(),
            QuireError::Conversion(ConversionError::Cancelled)
        )
    }

    /// True for errors caused by how the tool was invoked rather than by the book.
    pub fn is_usage(&self) -> bool {
        matches!(
            self.root(),
            QuireError::Conversion(
                ConversionError::InvalidOption { .. } | ConversionError::MissingCodec(_)
            )
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self.root(),
            QuireError::Conversion(ConversionError::Conflict(_))
        )
    }

    pub(crate) fn in_stage(self, stage: &str, snapshot: Option<PathBuf>) -> Self {
        QuireError::Stage {
            stage: stage.to_string(),
            snapshot,
            source: Box::new(self),
        }
    }
}

impl ParseError {
    pub(crate) fn malformed(
        file: Option<&str>,
        line: Option<usize>,
        message: impl Into<String>,
    ) -> Self {
        ParseError::Malformed {
            location: Location {
                file: file.map(str::to_string),
                line,
                column: None,
            },
            message: message.into(),
        }
    }

    /// Attach the container name a malformed-content error came from
    pub(crate) fn in_file(self, name: &str) -> Self {
        match self {
            ParseError::Malformed {
                mut location,
                message,
            } => {
                location.file = Some(name.to_string());
                ParseError::Malformed { location, message }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_survive_stage_wrapping() {
        let err: QuireError = ConversionError::Cancelled.into();
        let err = err.in_stage("flatten_css", None);
        assert_eq!(err.code(), "E_CANCELLED");
        assert!(err.is_cancelled());
        assert_eq!(err.stage(), Some("flatten_css"));
    }

    #[test]
    fn test_location_display() {
        let loc = Location::file("text/ch1.xhtml").with_position(12, 4);
        assert_eq!(loc.to_string(), "text/ch1.xhtml:12:4");
        let err: QuireError = ParseError::Malformed {
            location: loc.clone(),
            message: "unclosed element".into(),
        }
        .into();
        assert_eq!(err.location(), Some(&loc));
    }

    #[test]
    fn test_usage_errors() {
        let err: QuireError = ConversionError::InvalidOption {
            name: "bogus".into(),
            message: "unknown option".into(),
        }
        .into();
        assert!(err.is_usage());
        assert!(!err.is_cancelled());
    }
}
