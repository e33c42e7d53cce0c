//! Error types for the conversation engine.
//!
//! Errors are classified by how far they travel:
//! - Degraded in place: configuration, decision-tree and LLM failures are
//!   logged and replaced with a fallback (default tree, empty extraction).
//! - Propagated: persistent-store failures surface as `EngineError` so the
//!   host can retry or show a generic failure.

use std::path::PathBuf;
use thiserror::Error;

use crate::db::DbError;

/// Errors surfaced by the session store, workflow machine and pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] DbError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Action execution failed: {0}")]
    Execution(String),
}

impl EngineError {
    /// Store failures are the only class worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(_))
    }

    /// Short text safe to show to the user.
    pub fn user_message(&self) -> &'static str {
        match self {
            EngineError::Store(_) => "I couldn't reach my memory just now. Please try again.",
            EngineError::Serialization(_) => "Something went wrong saving that. Please try again.",
            EngineError::Execution(_) => "I couldn't complete that action.",
        }
    }
}

/// Errors loading `EngineConfig`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Errors building a decision tree from its document.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("Failed to read tree source {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse tree document: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Tree document has no root node")]
    MissingRoot,
}
