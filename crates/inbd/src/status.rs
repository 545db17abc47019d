//! Update status and granular progress logs.
//!
//! Both files are rewritten per pipeline run. The status log holds exactly
//! one JSON object; the granular log holds `{"UpdateLog": [...]}` and grows
//! by one entry per recorded step.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::warn;

use inbd_core::SafeFs;

use crate::error::FailureReason;

const LOG_MODE: u32 = 0o640;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusKind {
    Success,
    Fail,
    Pending,
    NoUpdateAvailable,
}

/// The single object stored in the status log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct UpdateStatus {
    pub status: StatusKind,
    #[serde(rename = "Type")]
    pub kind: String,
    /// Local time, `YYYY-MM-DD HH:MM:SS`.
    pub time: String,
    /// Echo of the request that produced this record.
    pub metadata: String,
    pub error: String,
    pub version: String,
}

impl UpdateStatus {
    pub fn new(status: StatusKind, metadata: String) -> Self {
        Self {
            status,
            kind: "sota".into(),
            time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            metadata,
            error: String::new(),
            version: String::new(),
        }
    }

    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = error.into();
        self
    }

    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranularEntry {
    #[serde(rename = "StatusDetail.Status")]
    pub status: StatusKind,
    #[serde(
        rename = "FailureReason",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub failure_reason: Option<FailureReason>,
    #[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GranularLog {
    #[serde(rename = "UpdateLog")]
    pub update_log: Vec<GranularEntry>,
}

/// Writes both log files through the safe filesystem.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    fs: SafeFs,
    status_path: PathBuf,
    granular_path: PathBuf,
}

impl StatusReporter {
    pub fn new(fs: SafeFs, status_path: PathBuf, granular_path: PathBuf) -> Self {
        Self {
            fs,
            status_path,
            granular_path,
        }
    }

    /// Start a new run: clear the granular log and write `PENDING`.
    pub fn begin(&self, metadata: &str) -> inbd_core::Result<()> {
        self.write_json(&self.granular_path, &GranularLog::default())?;
        self.write_status(&UpdateStatus::new(StatusKind::Pending, metadata.to_string()))
    }

    pub fn success(&self, metadata: &str, version: &str) -> inbd_core::Result<()> {
        self.write_status(
            &UpdateStatus::new(StatusKind::Success, metadata.to_string()).with_version(version),
        )?;
        self.append(GranularEntry {
            status: StatusKind::Success,
            failure_reason: None,
            version: Some(version.to_string()),
        })
    }

    /// Success with a human-readable detail in the `Error` field.
    pub fn success_with_detail(
        &self,
        metadata: &str,
        version: &str,
        detail: &str,
    ) -> inbd_core::Result<()> {
        self.write_status(
            &UpdateStatus::new(StatusKind::Success, metadata.to_string())
                .with_version(version)
                .with_error(detail),
        )?;
        self.append(GranularEntry {
            status: StatusKind::Success,
            failure_reason: None,
            version: Some(version.to_string()),
        })
    }

    pub fn fail(
        &self,
        metadata: &str,
        reason: FailureReason,
        error: &str,
    ) -> inbd_core::Result<()> {
        self.write_status(
            &UpdateStatus::new(StatusKind::Fail, metadata.to_string()).with_error(error),
        )?;
        self.append(GranularEntry {
            status: StatusKind::Fail,
            failure_reason: Some(reason),
            version: None,
        })
    }

    pub fn no_update(&self, metadata: &str, version: &str) -> inbd_core::Result<()> {
        self.write_status(
            &UpdateStatus::new(StatusKind::NoUpdateAvailable, metadata.to_string())
                .with_version(version),
        )?;
        self.append(GranularEntry {
            status: StatusKind::NoUpdateAvailable,
            failure_reason: None,
            version: Some(version.to_string()),
        })
    }

    pub fn read_status(&self) -> inbd_core::Result<UpdateStatus> {
        Ok(serde_json::from_slice(&self.fs.read(&self.status_path)?)?)
    }

    pub fn read_granular(&self) -> inbd_core::Result<GranularLog> {
        match self.fs.read(&self.granular_path) {
            Ok(bytes) if bytes.is_empty() => Ok(GranularLog::default()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.is_not_found() => Ok(GranularLog::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_status(&self, status: &UpdateStatus) -> inbd_core::Result<()> {
        self.write_json(&self.status_path, status)
    }

    fn append(&self, entry: GranularEntry) -> inbd_core::Result<()> {
        let mut log = self.read_granular().unwrap_or_else(|e| {
            warn!(error = %e, "granular log unreadable, starting a new one");
            GranularLog::default()
        });
        log.update_log.push(entry);
        self.write_json(&self.granular_path, &log)
    }

    fn write_json<T: Serialize>(&self, path: &std::path::Path, value: &T) -> inbd_core::Result<()> {
        if let Some(dir) = path.parent() {
            self.fs.mkdir_all(dir, 0o755)?;
        }
        self.fs.write(path, &serde_json::to_vec(value)?, LOG_MODE)?;
        Ok(())
    }
}
