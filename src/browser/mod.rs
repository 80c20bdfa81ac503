//! Thin adapter over a stateful browsing context.
//!
//! The harvester never touches documents directly: it asks the context for
//! table/row/control handles in the *current* frame and moves between frames
//! with `enter_child_frame` / `leave_to_parent`. Handles are stamped with the
//! document generation they were read from; once the context navigates, any
//! older handle reports [`BrowserError::StaleElement`].

pub mod http_context;

#[cfg(test)]
pub mod fixture;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use url::Url;

// Errors

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("timed out: {0}")]
    Timeout(String),

    #[error("stale element: {0}")]
    StaleElement(String),

    #[error("network failure: {0}")]
    Network(String),

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("no child frame at index {0}")]
    NoSuchFrame(usize),

    #[error("already at the root frame")]
    AtRoot,

    #[error("no document loaded")]
    NothingLoaded,

    #[error("invalid selector {0}")]
    Selector(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("browsing context closed")]
    Closed,
}

impl BrowserError {
    /// Timeouts, stale handles, network hiccups and throttling statuses are
    /// worth another attempt; everything else reflects page structure.
    pub fn is_transient(&self) -> bool {
        match self {
            BrowserError::Timeout(_) | BrowserError::StaleElement(_) | BrowserError::Network(_) => {
                true
            }
            BrowserError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for BrowserError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            BrowserError::Timeout(e.to_string())
        } else if let Some(status) = e.status() {
            BrowserError::HttpStatus {
                status: status.as_u16(),
                url: e.url().map(|u| u.to_string()).unwrap_or_default(),
            }
        } else {
            BrowserError::Network(e.to_string())
        }
    }
}

// Handles

/// A table in the current frame, with the texts of its header cells.
#[derive(Debug, Clone, PartialEq)]
pub struct TableHandle {
    pub generation: u64,
    pub index: usize,
    pub headers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowHandle {
    pub generation: u64,
    pub table: usize,
    pub index: usize,
}

/// An activatable control (e.g. a "next page" link).
#[derive(Debug, Clone, PartialEq)]
pub struct ControlHandle {
    pub generation: u64,
    pub label: String,
    pub href: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Anchor {
    pub text: String,
    pub href: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cell {
    pub text: String,
    pub anchors: Vec<Anchor>,
}

#[cfg(test)]
impl Cell {
    pub fn text(text: &str) -> Self {
        Self {
            text: text.to_string(),
            anchors: Vec::new(),
        }
    }

    pub fn link(text: &str, href: &str) -> Self {
        Self {
            text: text.to_string(),
            anchors: vec![Anchor {
                text: text.to_string(),
                href: Some(href.to_string()),
            }],
        }
    }
}

// Context trait

/// One browsing context. Operations on a single context must run strictly
/// sequentially; implementations keep their own frame stack.
#[async_trait]
pub trait BrowsingContext: Send + Sync {
    async fn navigate(&self, url: &Url) -> Result<(), BrowserError>;

    async fn wait_until_loaded(&self, timeout: Duration) -> Result<(), BrowserError>;

    async fn switch_to_root(&self) -> Result<(), BrowserError>;

    async fn child_frame_count(&self) -> Result<usize, BrowserError>;

    /// On failure the current frame is left unchanged.
    async fn enter_child_frame(&self, index: usize) -> Result<(), BrowserError>;

    async fn leave_to_parent(&self) -> Result<(), BrowserError>;

    async fn tables(&self) -> Result<Vec<TableHandle>, BrowserError>;

    async fn rows(&self, table: &TableHandle) -> Result<Vec<RowHandle>, BrowserError>;

    async fn row_cells(&self, row: &RowHandle) -> Result<Vec<Cell>, BrowserError>;

    /// First enabled control whose text contains one of `labels`.
    async fn find_control(&self, labels: &[String]) -> Result<Option<ControlHandle>, BrowserError>;

    async fn activate(&self, control: &ControlHandle) -> Result<(), BrowserError>;

    /// Serialized DOM of the current frame.
    async fn page_source(&self) -> Result<String, BrowserError>;

    /// PNG bytes, when the context can render.
    async fn screenshot(&self) -> Result<Option<Vec<u8>>, BrowserError>;

    fn current_url(&self) -> Option<Url>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(BrowserError::Timeout("load".into()).is_transient());
        assert!(BrowserError::StaleElement("row".into()).is_transient());
        assert!(BrowserError::HttpStatus { status: 503, url: String::new() }.is_transient());
        assert!(BrowserError::HttpStatus { status: 429, url: String::new() }.is_transient());
        assert!(!BrowserError::HttpStatus { status: 404, url: String::new() }.is_transient());
        assert!(!BrowserError::NoSuchFrame(2).is_transient());
    }
}
