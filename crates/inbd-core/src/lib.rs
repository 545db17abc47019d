//! `inbd` Core Library
//!
//! Shared functionality for the update orchestrator:
//! - Command execution through a single argv-only choke point
//! - Allowlisted, symlink-safe filesystem access with atomic writes
//! - Common error types
//! - Tracing initialisation

pub mod error;
pub mod exec;
pub mod safe_fs;
pub mod tracing_init;

pub use error::{Error, Result};
pub use exec::{CommandOutput, CommandRunner, ExecError, Executor, Invocation};
pub use safe_fs::{FsError, OpenMode, SafeFs};
