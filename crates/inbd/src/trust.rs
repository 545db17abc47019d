//! Trusted-source checks and device configuration schema validation.

use std::path::Path;

use tracing::debug;
use url::Url;

use inbd_core::SafeFs;

use crate::device_config::ConfigError;

/// Whether `url` lies under one of `trusted` prefixes.
///
/// Scheme, host and port must match exactly and the URL path must start with
/// the prefix path on a segment boundary. Query strings and fragments are
/// ignored. An empty or unparseable URL is never trusted.
pub fn is_trusted(url: &str, trusted: &[String]) -> bool {
    if url.is_empty() {
        return false;
    }
    let Ok(candidate) = Url::parse(url) else {
        return false;
    };
    let ok = trusted
        .iter()
        .filter_map(|prefix| Url::parse(prefix.trim()).ok())
        .any(|prefix| prefix_matches(&prefix, &candidate));
    debug!(url = %redacted(&candidate), trusted = ok, "trusted repository check");
    ok
}

fn prefix_matches(prefix: &Url, candidate: &Url) -> bool {
    if prefix.scheme() != candidate.scheme()
        || prefix.host_str().is_none()
        || prefix.host_str() != candidate.host_str()
        || prefix.port_or_known_default() != candidate.port_or_known_default()
    {
        return false;
    }
    let want = prefix.path();
    let have = candidate.path();
    if want.ends_with('/') {
        return have.starts_with(want);
    }
    have == want
        || have
            .strip_prefix(want)
            .is_some_and(|rest| rest.starts_with('/'))
}

/// The URL without query, fragment or credentials, for logging.
fn redacted(url: &Url) -> String {
    let mut clean = url.clone();
    clean.set_query(None);
    clean.set_fragment(None);
    let _ = clean.set_username("");
    let _ = clean.set_password(None);
    clean.to_string()
}

/// Validate `document` against the JSON schema stored at `schema_path`.
pub fn validate_config(
    fs: &SafeFs,
    schema_path: &Path,
    document: &serde_json::Value,
) -> Result<(), ConfigError> {
    let schema: serde_json::Value = serde_json::from_slice(&fs.read(schema_path)?)?;
    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::Schema(e.to_string()))?;
    let violations: Vec<String> = validator
        .iter_errors(document)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(violations.join("; ")))
    }
}

/// Parse `bytes` as JSON and validate it against the schema.
pub fn validate_config_bytes(
    fs: &SafeFs,
    schema_path: &Path,
    bytes: &[u8],
) -> Result<serde_json::Value, ConfigError> {
    let document: serde_json::Value = serde_json::from_slice(bytes)?;
    validate_config(fs, schema_path, &document)?;
    Ok(document)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn trusted() -> Vec<String> {
        vec![
            "https://repo.example.com/".into(),
            "https://mirror.example.org/edge/images".into(),
        ]
    }

    #[test]
    fn host_prefix_is_trusted() {
        assert!(is_trusted("https://repo.example.com/a.raw", &trusted()));
        assert!(is_trusted("https://REPO.example.com:443/x/y.raw", &trusted()));
    }

    #[test]
    fn query_and_fragment_do_not_matter() {
        let base = "https://mirror.example.org/edge/images/a.raw";
        let t = trusted();
        assert!(is_trusted(base, &t));
        assert!(is_trusted(&format!("{base}?token=1"), &t));
        assert!(is_trusted(&format!("{base}#frag"), &t));
    }

    #[test]
    fn lookalikes_are_rejected() {
        let t = trusted();
        assert!(!is_trusted("", &t));
        assert!(!is_trusted("https://repo.example.com.evil.io/a.raw", &t));
        assert!(!is_trusted("http://repo.example.com/a.raw", &t));
        assert!(!is_trusted("https://repo.example.com:8443/a.raw", &t));
        assert!(!is_trusted("https://mirror.example.org/edge/images-evil/a.raw", &t));
        assert!(!is_trusted("https://mirror.example.org/edge/a.raw", &t));
        assert!(!is_trusted("not a url", &t));
    }

    #[test]
    fn empty_trust_list_trusts_nothing() {
        assert!(!is_trusted("https://repo.example.com/a.raw", &[]));
    }

    #[test]
    fn schema_validation() {
        let dir = tempfile::Builder::new()
            .prefix("inbd-trust-")
            .tempdir_in("/tmp")
            .unwrap();
        let schema = dir.path().join("schema.json");
        std::fs::write(
            &schema,
            r#"{"type":"object","properties":{"os_updater":{"type":"object",
               "properties":{"trustedRepositories":{"type":"array","items":{"type":"string"}}}}}}"#,
        )
        .unwrap();
        let fs = SafeFs::default();

        let good = br#"{"os_updater":{"trustedRepositories":["https://a/"]}}"#;
        assert!(validate_config_bytes(&fs, &schema, good).is_ok());

        let bad = br#"{"os_updater":{"trustedRepositories":"https://a/"}}"#;
        assert!(matches!(
            validate_config_bytes(&fs, &schema, bad),
            Err(ConfigError::Invalid(msg)) if msg.contains("trustedRepositories")
        ));

        assert!(matches!(
            validate_config_bytes(&fs, &schema, b"{oops"),
            Err(ConfigError::Json(_))
        ));
    }
}
