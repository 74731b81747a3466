//! CSS selector matching against a [`Document`].
//!
//! The document is serialized with a marker attribute on every element and
//! handed to `scraper`, whose matches are mapped back to arena node ids.

use scraper::{Html, Selector};
use thiserror::Error;

use super::serialize::NODE_MARKER;
use super::{Document, NodeId};

#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid CSS selector '{selector}': {message}")]
pub struct SelectorError {
    pub selector: String,
    pub message: String,
}

/// Matches selectors against a snapshot of a document. Build a new matcher
/// after mutating the document.
pub struct SelectorMatcher {
    html: Html,
}

impl SelectorMatcher {
    pub fn new(doc: &Document) -> Self {
        Self {
            html: Html::parse_document(&doc.to_marked_html()),
        }
    }

    /// Check that `selector` parses
    pub fn validate(selector: &str) -> Result<(), SelectorError> {
        compile(selector).map(|_| ())
    }

    /// Elements matching `selector`, in document order
    pub fn select(&self, selector: &str) -> Result<Vec<NodeId>, SelectorError> {
        let compiled = compile(selector)?;
        Ok(self
            .html
            .select(&compiled)
            .filter_map(|el| el.value().attr(NODE_MARKER))
            .filter_map(|marker| marker.parse::<usize>().ok())
            .map(NodeId::from_index)
            .collect())
    }
}

fn compile(selector: &str) -> Result<Selector, SelectorError> {
    Selector::parse(selector).map_err(|e| SelectorError {
        selector: selector.to_string(),
        message: e.to_string(),
    })
}
