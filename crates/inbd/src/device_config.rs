//! Device configuration store.
//!
//! The JSON file at [`Paths::device_config`](crate::config::Paths) is the
//! source of truth. Reads take the shared side of an [`RwLock`], every
//! mutation takes the exclusive side, validates the new document against the
//! schema and replaces the file atomically.

use std::path::PathBuf;

use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use inbd_core::{FsError, SafeFs};

use crate::trust;

/// Leaves that accept `AppendConfig`/`RemoveConfig`.
pub const APPENDABLE_LEAVES: &[&str] = &["sotaSW", "trustedRepositories"];

const CONFIG_MODE: u32 = 0o640;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file access failed: {0}")]
    Fs(#[from] FsError),

    #[error("configuration is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration schema is unusable: {0}")]
    Schema(String),

    #[error("configuration violates schema: {0}")]
    Invalid(String),

    #[error("configuration path not found: {0}")]
    PathNotFound(String),

    #[error("append/remove is not permitted on {0}")]
    NotAppendable(String),

    #[error("malformed config request: {0}")]
    BadRequest(String),

    #[error("value {value} not present at {path}")]
    ValueNotFound { path: String, value: String },
}

/// Settings the update pipeline reads from the `os_updater` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OsUpdaterConfig {
    pub trusted_repositories: Vec<String>,
    pub proceed_without_rollback: bool,
    #[serde(rename = "sotaSW")]
    pub sota_sw: Vec<String>,
}

impl Default for OsUpdaterConfig {
    fn default() -> Self {
        Self {
            trusted_repositories: Vec::new(),
            proceed_without_rollback: true,
            sota_sw: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct DeviceConfig {
    fs: SafeFs,
    path: PathBuf,
    schema_path: PathBuf,
    lock: RwLock<()>,
}

impl DeviceConfig {
    pub fn new(fs: SafeFs, path: PathBuf, schema_path: PathBuf) -> Self {
        Self {
            fs,
            path,
            schema_path,
            lock: RwLock::new(()),
        }
    }

    fn read_document(&self) -> Result<Value, ConfigError> {
        Ok(serde_json::from_slice(&self.fs.read(&self.path)?)?)
    }

    fn commit(&self, document: &Value) -> Result<(), ConfigError> {
        trust::validate_config(&self.fs, &self.schema_path, document)?;
        let bytes = serde_json::to_vec_pretty(document)?;
        self.fs.write(&self.path, &bytes, CONFIG_MODE)?;
        Ok(())
    }

    /// The `os_updater` section, with defaults for anything missing.
    ///
    /// A missing file yields the defaults.
    pub async fn os_updater(&self) -> Result<OsUpdaterConfig, ConfigError> {
        let _guard = self.lock.read().await;
        let document = match self.read_document() {
            Ok(doc) => doc,
            Err(ConfigError::Fs(e)) if e.is_not_found() => return Ok(OsUpdaterConfig::default()),
            Err(e) => return Err(e),
        };
        match document.get("os_updater") {
            Some(section) => Ok(OsUpdaterConfig::deserialize(section)?),
            None => Ok(OsUpdaterConfig::default()),
        }
    }

    /// Value at a dotted path; strings are returned bare, everything else
    /// as JSON text.
    pub async fn get(&self, path: &str) -> Result<String, ConfigError> {
        let _guard = self.lock.read().await;
        let document = self.read_document()?;
        let value = lookup(&document, path)?;
        Ok(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// Apply `key:value` pairs separated by `;`.
    pub async fn set(&self, entry: &str) -> Result<(), ConfigError> {
        let _guard = self.lock.write().await;
        let mut document = self.read_document()?;
        let mut changed = 0usize;
        for pair in entry.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, raw) = split_pair(pair)?;
            *slot(&mut document, key)? = parse_scalar(raw);
            changed += 1;
        }
        if changed == 0 {
            return Err(ConfigError::BadRequest("no key:value pairs".into()));
        }
        self.commit(&document)?;
        info!(keys = changed, "device configuration updated");
        Ok(())
    }

    /// Add `value` to the array at `path` (`path:value`).
    pub async fn append(&self, entry: &str) -> Result<(), ConfigError> {
        let (path, value) = split_pair(entry)?;
        check_appendable(path)?;
        let _guard = self.lock.write().await;
        let mut document = self.read_document()?;
        let leaf = slot(&mut document, path)?;
        if leaf.is_null() {
            *leaf = Value::Array(Vec::new());
        }
        let items = leaf
            .as_array_mut()
            .ok_or_else(|| ConfigError::NotAppendable(path.to_string()))?;
        if !items.iter().any(|v| v.as_str() == Some(value)) {
            items.push(Value::String(value.to_string()));
        }
        self.commit(&document)?;
        info!(path, "device configuration value appended");
        Ok(())
    }

    /// Remove `value` from the array at `path` (`path:value`).
    pub async fn remove(&self, entry: &str) -> Result<(), ConfigError> {
        let (path, value) = split_pair(entry)?;
        check_appendable(path)?;
        let _guard = self.lock.write().await;
        let mut document = self.read_document()?;
        let items = slot(&mut document, path)?
            .as_array_mut()
            .ok_or_else(|| ConfigError::NotAppendable(path.to_string()))?;
        let before = items.len();
        items.retain(|v| v.as_str() != Some(value));
        if items.len() == before {
            return Err(ConfigError::ValueNotFound {
                path: path.to_string(),
                value: value.to_string(),
            });
        }
        self.commit(&document)?;
        info!(path, "device configuration value removed");
        Ok(())
    }

    /// Replace the whole file with `bytes` after schema validation.
    pub async fn replace(&self, bytes: &[u8]) -> Result<(), ConfigError> {
        let _guard = self.lock.write().await;
        let document = trust::validate_config_bytes(&self.fs, &self.schema_path, bytes)?;
        self.commit(&document)?;
        info!(path = %self.path.display(), "device configuration replaced");
        Ok(())
    }
}

fn split_pair(pair: &str) -> Result<(&str, &str), ConfigError> {
    let (key, value) = pair
        .split_once(':')
        .ok_or_else(|| ConfigError::BadRequest(format!("expected path:value, got {pair}")))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::BadRequest(format!("empty path in {pair}")));
    }
    Ok((key, value.trim()))
}

fn check_appendable(path: &str) -> Result<(), ConfigError> {
    let leaf = path.rsplit('.').next().unwrap_or(path);
    if APPENDABLE_LEAVES.contains(&leaf) {
        Ok(())
    } else {
        Err(ConfigError::NotAppendable(path.to_string()))
    }
}

/// Booleans and numbers keep their JSON type; anything else is a string.
fn parse_scalar(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_))) => v,
        _ => Value::String(raw.to_string()),
    }
}

fn lookup<'a>(document: &'a Value, path: &str) -> Result<&'a Value, ConfigError> {
    path.split('.')
        .try_fold(document, |node, key| node.get(key))
        .ok_or_else(|| ConfigError::PathNotFound(path.to_string()))
}

/// Mutable slot at a dotted path, creating intermediate objects.
fn slot<'a>(document: &'a mut Value, path: &str) -> Result<&'a mut Value, ConfigError> {
    let mut node = document;
    for key in path.split('.') {
        if key.is_empty() {
            return Err(ConfigError::BadRequest(format!("empty segment in {path}")));
        }
        if node.is_null() {
            *node = Value::Object(Map::new());
        }
        node = node
            .as_object_mut()
            .ok_or_else(|| ConfigError::PathNotFound(path.to_string()))?
            .entry(key)
            .or_insert(Value::Null);
    }
    Ok(node)
}
