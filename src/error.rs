//! Closed error taxonomies for the gateway and the repository store.
//!
//! Plumbing code uses `anyhow`; these enums exist where callers have to
//! branch on the kind of failure (exit codes, client-facing messages).

use std::path::PathBuf;

use thiserror::Error;

/// Exit code reported for rejected commands and repository paths.
pub const EXIT_REJECTED: u32 = 1;

/// Errors raised while resolving a repository name against the store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid repository name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("repository path {0} escapes the store root")]
    Escape(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that stop a gateway session before the backend transport runs.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unrecognised command: {0:?}")]
    InvalidCommand(String),

    #[error(transparent)]
    Repository(#[from] StoreError),
}

impl GatewayError {
    /// Exit code surfaced to the SSH client for this rejection.
    pub fn exit_code(&self) -> u32 {
        EXIT_REJECTED
    }
}
