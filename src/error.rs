use std::path::PathBuf;

use thiserror::Error;

use crate::usage::Usage;

/// Errors surfaced by the extraction/pagination core.
///
/// Everything except [`PipelineError::Schema`] and store initialization is
/// contained at the per-URL boundary by the batch loop.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No raw content was available for the URL.
    #[error("no raw content for {url}")]
    FetchMissing { url: String },

    /// The requested field list cannot form a record schema.
    #[error("invalid record schema: {0}")]
    Schema(String),

    /// Transport, auth or API failure while calling the model.
    #[error("model call failed: {0}")]
    ModelCall(String),

    /// The model answered, but not in the requested shape. `usage` is what
    /// the rejected answer cost.
    #[error("model output does not match schema: {message}")]
    Parse { message: String, usage: Usage },

    #[error("write {}: {source}", path.display())]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("read {}: {source}", path.display())]
    StoreRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session not found: {0}")]
    SessionNotFound(String),
}

impl PipelineError {
    pub(crate) fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
            usage: Usage::ZERO,
        }
    }

    /// Charge a rejected answer with the usage of the call that produced it.
    pub fn with_usage(self, usage: Usage) -> Self {
        match self {
            Self::Parse { message, .. } => Self::Parse { message, usage },
            other => other,
        }
    }

    /// Model usage already spent when this error was raised.
    pub fn spent_usage(&self) -> Usage {
        match self {
            Self::Parse { usage, .. } => *usage,
            _ => Usage::ZERO,
        }
    }

    pub(crate) fn store_write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StoreWrite {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn store_read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StoreRead {
            path: path.into(),
            source,
        }
    }
}
