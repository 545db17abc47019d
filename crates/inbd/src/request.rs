//! Request and response contracts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::distro::OsFamily;

/// What part of an update a request covers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateMode {
    #[default]
    Full,
    DownloadOnly,
    NoDownload,
}

impl UpdateMode {
    /// Whether this mode fetches an artifact.
    pub const fn downloads(self) -> bool {
        matches!(self, Self::Full | Self::DownloadOnly)
    }

    /// Whether this mode installs something.
    pub const fn installs(self) -> bool {
        matches!(self, Self::Full | Self::NoDownload)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    #[default]
    Sha384,
    Sha512,
}

/// A system software update request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateRequest {
    pub mode: UpdateMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Hex digest of the artifact.
    pub signature: String,
    pub hash_algorithm: HashAlgorithm,
    pub package_list: Vec<String>,
    pub kernel_command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_date: Option<DateTime<Utc>>,
    pub do_not_reboot: bool,
    /// Total time budget for the run; 0 means unlimited.
    pub duration_seconds: u64,
}

/// Reasons a request is rejected before any work starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid URL {url}: {reason}")]
    Url { url: String, reason: String },

    #[error("URL is required for {0:?} on the image family")]
    MissingUrl(UpdateMode),

    #[error("signature must be a hex digest")]
    BadSignature,

    #[error("signature is required for {0:?} on the image family")]
    MissingSignature(UpdateMode),

    #[error("invalid package name: {0}")]
    BadPackageName(String),

    #[error("kernel command contains a control character or quote")]
    BadKernelCommand,
}

impl UpdateRequest {
    /// The URL, if one was given and is non-empty.
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.is_empty())
    }

    /// Family-independent checks.
    pub fn validate(&self, policy: UrlPolicy) -> Result<(), ValidationError> {
        if let Some(url) = self.url() {
            validate_url(url, policy)?;
        }
        if !self.signature.is_empty() && hex::decode(&self.signature).is_err() {
            return Err(ValidationError::BadSignature);
        }
        if let Some(bad) = self.package_list.iter().find(|p| !is_package_name(p)) {
            return Err(ValidationError::BadPackageName(bad.clone()));
        }
        if self
            .kernel_command
            .chars()
            .any(|c| c.is_control() || c == '"' || c == '\\')
        {
            return Err(ValidationError::BadKernelCommand);
        }
        Ok(())
    }

    /// Checks that depend on the detected OS family.
    pub fn validate_for(&self, family: OsFamily) -> Result<(), ValidationError> {
        if family == OsFamily::Image && self.kernel_command.is_empty() && self.mode.downloads() {
            if self.url().is_none() {
                return Err(ValidationError::MissingUrl(self.mode));
            }
            if self.signature.is_empty() {
                return Err(ValidationError::MissingSignature(self.mode));
            }
        }
        Ok(())
    }
}

/// URL schemes a request may name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UrlPolicy {
    #[default]
    HttpsOnly,
    /// Also accept `http`; for closed test networks.
    AllowPlainHttp,
}

impl UrlPolicy {
    fn permits(self, scheme: &str) -> bool {
        match self {
            Self::HttpsOnly => scheme == "https",
            Self::AllowPlainHttp => matches!(scheme, "https" | "http"),
        }
    }
}

/// Permitted scheme, non-empty host, parses cleanly.
pub fn validate_url(raw: &str, policy: UrlPolicy) -> Result<Url, ValidationError> {
    let fail = |reason: &str| ValidationError::Url {
        url: raw.to_string(),
        reason: reason.to_string(),
    };
    let url = Url::parse(raw).map_err(|e| fail(&e.to_string()))?;
    if !policy.permits(url.scheme()) {
        return Err(fail(match policy {
            UrlPolicy::HttpsOnly => "scheme must be https",
            UrlPolicy::AllowPlainHttp => "scheme must be https or http",
        }));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(fail("host is empty"));
    }
    Ok(url)
}

/// Debian package names, optionally with `=version` or `:arch`.
fn is_package_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "+-.:=~_".contains(c))
}

/// Requested power transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerState {
    Cycle,
    Off,
}

/// Result returned for every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub status_code: u16,
    #[serde(default)]
    pub error: String,
    /// Payload for read requests such as `GetConfig`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl UpdateResponse {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNSUPPORTED: u16 = 415;
    pub const INTERNAL: u16 = 500;

    pub const fn ok() -> Self {
        Self {
            status_code: Self::OK,
            error: String::new(),
            value: None,
        }
    }

    pub const fn with_value(value: String) -> Self {
        Self {
            status_code: Self::OK,
            error: String::new(),
            value: Some(value),
        }
    }

    pub fn bad_request(error: impl ToString) -> Self {
        Self::error(Self::BAD_REQUEST, error)
    }

    pub fn unsupported(error: impl ToString) -> Self {
        Self::error(Self::UNSUPPORTED, error)
    }

    pub fn internal(error: impl ToString) -> Self {
        Self::error(Self::INTERNAL, error)
    }

    fn error(status_code: u16, error: impl ToString) -> Self {
        Self {
            status_code,
            error: error.to_string(),
            value: None,
        }
    }
}
