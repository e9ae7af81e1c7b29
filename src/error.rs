//! Error type shared by every component of the crate.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::canonize::ParseMoleculeError;

/// Errors raised while configuring, loading or querying a synthon space.
///
/// Per-item failures inside bulk work (one assembly, one shard lookup) are
/// logged and isolated by the caller; only configuration and load-time errors
/// are expected to reach the user.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("unknown fingerprint handler `{0}`")]
    UnknownFingerprint(String),

    #[error("malformed space descriptor {path:?}: {reason}")]
    Descriptor { path: PathBuf, reason: String },

    #[error("space `{name}` is a {found} space, expected a {expected} space")]
    KindMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("no space named `{0}` is registered")]
    UnknownSpace(String),

    #[error("a space named `{0}` is already registered")]
    DuplicateSpace(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("inconsistent molecule: {0}")]
    Inconsistent(String),

    #[error(transparent)]
    Parse(#[from] ParseMoleculeError),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, SpaceError>;
