#![forbid(unsafe_code)]

//! Error kinds shared across the sync pipeline.
//!
//! Each enum maps to one propagation level: configuration and startup
//! authentication abort the run, remote errors abort a playlist cycle, and
//! record/fetch errors abort a single item.

use std::path::PathBuf;

use thiserror::Error;

use crate::record::{AssetKind, LifecycleState};

/// Failures raised by the Item Record Store.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record already exists at {0}")]
    AlreadyExists(PathBuf),

    #[error("corrupt record at {path}: {reason}")]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("incomplete assets for {item_id}: {missing}")]
    IncompleteAssets { item_id: String, missing: String },

    #[error("cannot {action} record {item_id} in state {from:?}")]
    InvalidStateTransition {
        item_id: String,
        from: LifecycleState,
        action: &'static str,
    },

    #[error("record I/O at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RecordError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn missing_kinds(item_id: &str, kinds: &[AssetKind]) -> Self {
        let missing = kinds
            .iter()
            .map(|kind| kind.label())
            .collect::<Vec<_>>()
            .join(", ");
        Self::IncompleteAssets {
            item_id: item_id.to_owned(),
            missing,
        }
    }
}

/// Failures raised by the remote playlist collaborators.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Rate limiting, server-side trouble, or a broken connection. Worth retrying.
    #[error("transient remote error: {0}")]
    Transient(String),

    #[error("permanent remote error: {0}")]
    Permanent(String),

    /// HTTP 404. Deleting an entry that is already gone counts as success.
    #[error("remote resource not found: {0}")]
    NotFound(String),

    #[error("authorization failed: {0}")]
    Auth(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Failures raised by the media fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("could not start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}: {detail}")]
    Exited {
        program: String,
        status: String,
        detail: String,
    },

    #[error("scanning {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Invalid or unreadable configuration. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("playlist {name}: {reason}")]
    Playlist { name: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}
