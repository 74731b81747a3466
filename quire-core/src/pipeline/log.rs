//! Hierarchical conversion log.
//!
//! Every line goes to `tracing`; WARN and ERROR lines are also kept so the
//! conversion report can list them.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    /// Dotted logger path, e.g. `pipeline.transform.flatten_css`
    pub logger: String,
    pub message: String,
}

/// A named logger; children share the parent's record list
#[derive(Debug, Clone)]
pub struct Log {
    name: String,
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl Default for Log {
    fn default() -> Self {
        Self::new("pipeline")
    }
}

impl Log {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn child(&self, name: &str) -> Log {
        Log {
            name: format!("{}.{}", self.name, name),
            records: Arc::clone(&self.records),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn debug(&self, message: impl fmt::Display) {
        tracing::debug!(logger = %self.name, "{message}");
    }

    pub fn info(&self, message: impl fmt::Display) {
        tracing::info!(logger = %self.name, "{message}");
    }

    pub fn warn(&self, message: impl fmt::Display) {
        let message = message.to_string();
        tracing::warn!(logger = %self.name, "{message}");
        self.keep(LogLevel::Warn, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        let message = message.to_string();
        tracing::error!(logger = %self.name, "{message}");
        self.keep(LogLevel::Error, message);
    }

    fn keep(&self, level: LogLevel, message: String) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(LogRecord {
            level,
            logger: self.name.clone(),
            message,
        });
    }

    /// Kept WARN and ERROR lines of this logger tree
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_children_share_records() {
        let log = Log::new("pipeline");
        let child = log.child("transform").child("flatten_css");
        assert_eq!(child.name(), "pipeline.transform.flatten_css");
        child.info("not kept");
        child.warn("kept");
        log.error("also kept");
        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].logger, "pipeline.transform.flatten_css");
        assert_eq!(records[1].level, LogLevel::Error);
    }
}
