//! Pipeline error type and failure-reason classification.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use inbd_core::{ExecError, FsError};

use crate::device_config::ConfigError;
use crate::disk::DiskError;
use crate::fetch::FetchError;
use crate::snapshot::SnapshotError;
use crate::state::StateError;

/// Closed set of reasons written to the granular log on failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureReason {
    Unspecified,
    Download,
    InsufficientStorage,
    RsAuthentication,
    SignatureCheck,
    UtWrite,
    UtBootConfiguration,
    Bootloader,
    CriticalServices,
    Inbm,
    OsCommit,
    UpdateTool,
}

impl FailureReason {
    pub const ALL: [Self; 12] = [
        Self::Unspecified,
        Self::Download,
        Self::InsufficientStorage,
        Self::RsAuthentication,
        Self::SignatureCheck,
        Self::UtWrite,
        Self::UtBootConfiguration,
        Self::Bootloader,
        Self::CriticalServices,
        Self::Inbm,
        Self::OsCommit,
        Self::UpdateTool,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Download => "download",
            Self::InsufficientStorage => "insufficientstorage",
            Self::RsAuthentication => "rsauthentication",
            Self::SignatureCheck => "signaturecheck",
            Self::UtWrite => "utwrite",
            Self::UtBootConfiguration => "utbootconfiguration",
            Self::Bootloader => "bootloader",
            Self::CriticalServices => "criticalservices",
            Self::Inbm => "inbm",
            Self::OsCommit => "oscommit",
            Self::UpdateTool => "updatetool",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any failure that ends a pipeline run.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("source is not in the trusted repository list: {0}")]
    Untrusted(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("insufficient free disk space: {required} bytes required, {free} available")]
    InsufficientStorage { required: u64, free: u64 },

    #[error(transparent)]
    Disk(#[from] DiskError),

    #[error("image write failed: {0}")]
    ImageWrite(#[source] ExecError),

    #[error("image activation failed: {0}")]
    ImageActivate(#[source] ExecError),

    #[error("image commit failed: {0}")]
    ImageCommit(#[source] ExecError),

    #[error("bootloader update failed: {0}")]
    Bootloader(String),

    #[error("package manager failed: {0}")]
    PackageTool(#[source] ExecError),

    #[error("invalid package request: {0}")]
    InvalidPackage(String),

    #[error("package dry run printed no change summary ({0})")]
    DryRunIncomplete(String),

    #[error("package {0} is not installed")]
    PackageNotInstalled(String),

    #[error("no default network route after update")]
    NetworkDown,

    #[error("boot did not switch to the new image (still {0})")]
    ImageNotSwitched(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("partial success - timed out")]
    TimedOut,

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("{0}")]
    Internal(String),
}

impl UpdateError {
    /// Classify this failure for the granular log.
    pub const fn reason(&self) -> FailureReason {
        match self {
            Self::Untrusted(_) => FailureReason::RsAuthentication,
            Self::Fetch(FetchError::HashMismatch { .. }) => FailureReason::SignatureCheck,
            Self::Fetch(_) | Self::InvalidPackage(_) => FailureReason::Download,
            Self::InsufficientStorage { .. } => FailureReason::InsufficientStorage,
            Self::ImageWrite(_) => FailureReason::UtWrite,
            Self::ImageActivate(_) => FailureReason::UtBootConfiguration,
            Self::ImageCommit(_) => FailureReason::OsCommit,
            Self::Bootloader(_) => FailureReason::Bootloader,
            Self::PackageTool(_) | Self::PackageNotInstalled(_) | Self::DryRunIncomplete(_) => {
                FailureReason::UpdateTool
            }
            Self::NetworkDown => FailureReason::CriticalServices,
            Self::ImageNotSwitched(_) => FailureReason::Bootloader,
            Self::Disk(_)
            | Self::Snapshot(_)
            | Self::TimedOut
            | Self::State(_)
            | Self::Config(_)
            | Self::Fs(_)
            | Self::Internal(_) => FailureReason::Inbm,
        }
    }
}
