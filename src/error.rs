//! Error taxonomy for link-preview resolution.
//!
//! Every variant is recoverable at the pipeline level: a strategy that fails with any of
//! these simply yields to the next one. Only [`PreviewError::Cache`] can end a resolution
//! early, and even then it is reported as a failed thumbnail rather than propagated.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PreviewError {
    /// The strategy has nothing to work with (no index, no URL, tool disabled).
    #[error("not applicable: {0}")]
    NotApplicable(&'static str),

    /// The rich-link blob could not be read or converted to text.
    #[error("metadata decode failed: {0}")]
    Metadata(String),

    #[error("failed to launch {program}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("{program} exited with {status}: {stderr}")]
    ProcessFailed {
        program: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("response from {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    #[error("empty output from {0}")]
    EmptyOutput(String),

    #[error("unsupported image data: {0}")]
    UnsupportedImage(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// The cache directory or a staged file could not be created or published.
    #[error("cache I/O on {path}: {source}")]
    Cache {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PreviewError {
    pub fn is_not_applicable(&self) -> bool {
        matches!(self, PreviewError::NotApplicable(_))
    }
}

pub type Result<T> = std::result::Result<T, PreviewError>;
