//! Error taxonomy shared by the registry, access log, discovery and checker.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::key::PathKey;

#[derive(Error, Debug)]
pub enum IndexError {
    /// Registry lookup miss. Always surfaced, never retried.
    #[error("no registry entry for '{0}'")]
    KeyNotFound(PathKey),

    #[error("invalid index key '{input}': {reason}")]
    InvalidKey { input: String, reason: String },

    /// A dynamic index description that cannot be used for discovery.
    #[error("invalid dynamic index spec '{key}': {reason}")]
    InvalidSpec { key: PathKey, reason: String },

    /// The archive root (and every mirror) could not be listed.
    #[error("discovery unavailable for '{key}': {reason}")]
    DiscoveryUnavailable { key: PathKey, reason: String },

    /// The listing succeeded but no usable version segment was found.
    #[error("no candidates found for '{key}' under {root} ({matched} matched the pattern)")]
    NoCandidatesFound {
        key: PathKey,
        root: String,
        matched: usize,
    },

    #[error("{operation} timed out after {limit:?}")]
    Timeout { operation: String, limit: Duration },

    #[error("transport error for {url}: {reason}")]
    Transport { url: String, reason: String },

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Writing a backing document failed; the committed document is untouched.
    #[error("failed to persist {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backing document exists but could not be read.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The backing document exists but cannot be interpreted.
    #[error("malformed document {}: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },
}

impl IndexError {
    /// Short machine-readable tag, used in check reports.
    pub fn kind(&self) -> &'static str {
        match self {
            IndexError::KeyNotFound(_) => "key_not_found",
            IndexError::InvalidKey { .. } => "invalid_key",
            IndexError::InvalidSpec { .. } => "invalid_spec",
            IndexError::DiscoveryUnavailable { .. } => "discovery_unavailable",
            IndexError::NoCandidatesFound { .. } => "no_candidates_found",
            IndexError::Timeout { .. } => "timeout",
            IndexError::Transport { .. } => "transport",
            IndexError::InvalidUrl { .. } => "invalid_url",
            IndexError::Persistence { .. } => "persistence_failure",
            IndexError::Read { .. } => "read_failure",
            IndexError::Corrupt { .. } => "corrupt_document",
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Persistence {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        IndexError::Read {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        IndexError::Corrupt {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, IndexError>;
