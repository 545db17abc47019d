//! Error types for the `inbd` core library.

use thiserror::Error;

use crate::exec::ExecError;
use crate::safe_fs::FsError;

/// Result type alias using the core `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types shared by the orchestrator components.
#[derive(Debug, Error)]
pub enum Error {
    /// Filesystem access rejected or failed
    #[error(transparent)]
    Fs(#[from] FsError),

    /// External command could not be run
    #[error(transparent)]
    Exec(#[from] ExecError),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
