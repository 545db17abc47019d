//! Durable record of an in-flight update.
//!
//! The state file is the only thing that survives a reboot. It is either
//! absent, size zero (treated as absent), or one well-formed JSON object;
//! every store goes through [`SafeFs::write`], which replaces the file
//! atomically.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use inbd_core::exec::TRUNCATE;
use inbd_core::{CommandRunner, ExecError, FsError, Invocation, SafeFs};

const STATE_MODE: u32 = 0o640;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file access failed: {0}")]
    Fs(#[from] FsError),

    #[error("state file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("failed to truncate state file: {0}")]
    Truncate(#[from] ExecError),
}

/// Why the next boot has work to verify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartReason {
    Sota,
    PackageInstallation,
    KernelArgs,
    #[default]
    None,
}

/// Last durable phase reached by the run that wrote the record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Snapshotted,
    #[default]
    Applied,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistentState {
    pub restart_reason: RestartReason,
    /// Rollback snapshot; 0 means none was taken.
    #[serde(rename = "snapshot_number")]
    pub snapshot_id: u64,
    /// Running image version before the update.
    #[serde(rename = "tiber-version")]
    pub previous_version: String,
    /// Comma-joined package names.
    pub package_list: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub kernel_args: String,
    pub phase: Phase,
    /// Epoch seconds.
    pub start_time: i64,
    /// Epoch seconds; 0 means no deadline.
    pub deadline: i64,
}

impl PersistentState {
    /// Package names recorded for post-boot verification.
    pub fn packages(&self) -> Vec<&str> {
        self.package_list
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect()
    }

    pub fn join_packages(packages: &[String]) -> String {
        packages.join(",")
    }
}

/// Reader/writer for the state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    fs: SafeFs,
    path: PathBuf,
}

impl StateStore {
    pub fn new(fs: SafeFs, path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the record. Missing or size-zero files yield `None`.
    pub fn load(&self) -> Result<Option<PersistentState>, StateError> {
        let bytes = match self.fs.read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    /// Atomically replace the record.
    pub fn store(&self, state: &PersistentState) -> Result<(), StateError> {
        if let Some(dir) = self.path.parent() {
            self.fs.mkdir_all(dir, 0o755)?;
        }
        let bytes = serde_json::to_vec(state)?;
        self.fs.write(&self.path, &bytes, STATE_MODE)?;
        debug!(phase = ?state.phase, reason = ?state.restart_reason, "state stored");
        Ok(())
    }

    /// Empty the file in place with the external `truncate` tool, keeping
    /// its inode.
    pub async fn truncate_to_zero<R: CommandRunner>(&self, runner: &R) -> Result<(), StateError> {
        self.fs.validate(&self.path)?;
        let path = self.path.to_string_lossy();
        runner
            .run(&Invocation::new([TRUNCATE, "-s", "0", path.as_ref()]))
            .await?
            .check("truncate state file")?;
        Ok(())
    }

    pub fn remove(&self) -> Result<(), StateError> {
        self.fs.remove(&self.path)?;
        Ok(())
    }
}
