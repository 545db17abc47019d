//! HTTP client for artifact servers.

use std::io::Write;
use std::path::{Path, PathBuf};

use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Response, StatusCode};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use inbd_core::{FsError, SafeFs};

use super::auth::{AuthScheme, fallback_schemes};

/// Artifact fetch errors.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Content-Length header is missing")]
    MissingContentLength,

    #[error("document at {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: u64 },

    #[error("invalid artifact URL {0}")]
    BadUrl(String),

    #[error("failed to load CA bundle: {0}")]
    CaBundle(String),

    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("I/O error writing artifact: {0}")]
    Io(#[from] std::io::Error),
}

/// Largest document [`Fetcher::fetch_bytes`] will hold in memory.
pub const MAX_DOCUMENT_BYTES: u64 = 1024 * 1024;

/// Per-operation client configuration.
#[derive(Debug, Clone, Default)]
pub struct FetchConfig {
    /// Bearer token; `None` or empty means anonymous access.
    pub token: Option<String>,
    /// PEM bundle appended to the system roots.
    pub custom_ca: Option<PathBuf>,
    /// Honour proxy settings from the environment.
    pub system_proxy: bool,
}

/// Result of a size probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeProbe {
    pub size: u64,
    /// The scheme that succeeded; downloads reuse it.
    pub auth: AuthScheme,
}

/// One-shot artifact client. Build a new one per pipeline run.
#[derive(Debug)]
pub struct Fetcher {
    http: reqwest::Client,
    auth: AuthScheme,
}

impl Fetcher {
    /// Build a client with the TLS policy implied by `config`.
    ///
    /// Certificate verification is always on when a token is present, so a
    /// credential is never sent to an unverified peer.
    pub fn new(config: &FetchConfig, fs: &SafeFs) -> Result<Self, FetchError> {
        // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
        // The `Err` case just means it was already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let auth = AuthScheme::initial(config.token.as_deref());
        let mut builder = reqwest::Client::builder()
            .tls_version_min(reqwest::tls::Version::TLS_1_2)
            .tls_danger_accept_invalid_certs(!auth.is_authenticated());
        if !config.system_proxy {
            builder = builder.no_proxy();
        }
        if let Some(ca) = &config.custom_ca {
            let pem = fs.read(ca)?;
            let certs = reqwest::Certificate::from_pem_bundle(&pem)
                .map_err(|e| FetchError::CaBundle(format!("{}: {e}", ca.display())))?;
            debug!(path = %ca.display(), count = certs.len(), "custom CA bundle loaded");
            builder = builder.tls_certs_merge(certs);
        }
        Ok(Self {
            http: builder.build()?,
            auth,
        })
    }

    pub const fn auth(&self) -> &AuthScheme {
        &self.auth
    }

    /// Determine the artifact size without downloading it.
    ///
    /// Tries HEAD, then a one-byte range GET, then (only after a 401 and
    /// only with a token) the fallback authorization schemes.
    pub async fn size(&self, url: &str) -> Result<SizeProbe, FetchError> {
        let mut unauthorized = false;
        let mut missing_length = false;
        let mut last_status = None;

        match self.auth.apply(self.http.head(url)).send().await {
            Ok(resp) if resp.status().is_success() => {
                if let Some(size) = header_u64(&resp, CONTENT_LENGTH.as_str()) {
                    info!(url, size, "artifact size from HEAD");
                    return Ok(SizeProbe { size, auth: self.auth.clone() });
                }
                missing_length = true;
            }
            Ok(resp) => {
                unauthorized |= resp.status() == StatusCode::UNAUTHORIZED;
                last_status = Some(resp.status());
                debug!(url, status = %resp.status(), "HEAD rejected");
            }
            Err(e) => debug!(url, error = %e, "HEAD failed"),
        }

        match self.range_size(url, &self.auth).await {
            Ok(size) => return Ok(SizeProbe { size, auth: self.auth.clone() }),
            Err(RangeError::Unauthorized) => unauthorized = true,
            Err(RangeError::Fetch(FetchError::MissingContentLength)) => missing_length = true,
            Err(RangeError::Fetch(FetchError::Status { status, .. })) => {
                last_status = StatusCode::from_u16(status).ok();
            }
            Err(RangeError::Fetch(e)) => return Err(e),
        }

        if unauthorized && let AuthScheme::Bearer(token) = &self.auth {
            for scheme in fallback_schemes(token) {
                match self.range_size(url, &scheme).await {
                    Ok(size) => {
                        warn!(url, scheme = ?scheme, "artifact server accepted fallback authorization");
                        return Ok(SizeProbe { size, auth: scheme });
                    }
                    Err(RangeError::Unauthorized) => {}
                    Err(RangeError::Fetch(FetchError::MissingContentLength)) => {
                        missing_length = true;
                    }
                    Err(RangeError::Fetch(e)) => debug!(url, error = %e, "fallback probe failed"),
                }
            }
            last_status = Some(StatusCode::UNAUTHORIZED);
        }

        if missing_length {
            return Err(FetchError::MissingContentLength);
        }
        Err(FetchError::Status {
            status: last_status.map_or(0, |s| s.as_u16()),
            url: url.to_string(),
        })
    }

    async fn range_size(&self, url: &str, auth: &AuthScheme) -> Result<u64, RangeError> {
        let resp = auth
            .apply(self.http.get(url).header(RANGE, "bytes=0-0"))
            .send()
            .await
            .map_err(|e| RangeError::Fetch(e.into()))?;
        let status = resp.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(RangeError::Unauthorized);
        }
        if !status.is_success() {
            return Err(RangeError::Fetch(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            }));
        }
        if let Some(total) = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(content_range_total)
        {
            info!(url, size = total, "artifact size from Content-Range");
            return Ok(total);
        }
        // A 206 Content-Length is the range length, not the artifact size.
        if status == StatusCode::OK
            && let Some(len) = header_u64(&resp, CONTENT_LENGTH.as_str())
        {
            info!(url, size = len, "artifact size from Content-Length");
            return Ok(len);
        }
        Err(RangeError::Fetch(FetchError::MissingContentLength))
    }

    /// GET `url` with `auth` and stream it into `dest_dir`.
    ///
    /// The file is named after the last URL path segment. It is written to a
    /// temp sibling and renamed into place once complete.
    pub async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        auth: &AuthScheme,
        fs: &SafeFs,
    ) -> Result<PathBuf, FetchError> {
        let name = artifact_file_name(url)?;
        let dest = dest_dir.join(&name);
        fs.mkdir_all(dest_dir, 0o755)?;

        let mut resp = auth.apply(self.http.get(url)).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }

        let mut tmp = fs.create_temp(dest_dir, &format!(".{name}."))?;
        let mut written: u64 = 0;
        while let Some(chunk) = resp.chunk().await? {
            tmp.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        fs.persist(tmp, &dest)?;
        info!(url, path = %dest.display(), bytes = written, "artifact downloaded");
        Ok(dest)
    }

    /// GET a small document (such as a device configuration) into memory.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.fetch_capped(url, MAX_DOCUMENT_BYTES).await
    }

    pub(crate) async fn fetch_capped(&self, url: &str, limit: u64) -> Result<Vec<u8>, FetchError> {
        let mut schemes = vec![self.auth.clone()];
        if let AuthScheme::Bearer(token) = &self.auth {
            schemes.extend(fallback_schemes(token));
        }
        let mut last = StatusCode::UNAUTHORIZED;
        for scheme in &schemes {
            let resp = scheme.apply(self.http.get(url)).send().await?;
            let status = resp.status();
            if status.is_success() {
                return read_capped(resp, url, limit).await;
            }
            last = status;
            if status != StatusCode::UNAUTHORIZED {
                break;
            }
        }
        Err(FetchError::Status {
            status: last.as_u16(),
            url: url.to_string(),
        })
    }
}

/// Collect a response body, failing as soon as it passes `limit` bytes.
async fn read_capped(mut resp: Response, url: &str, limit: u64) -> Result<Vec<u8>, FetchError> {
    let too_large = || FetchError::TooLarge {
        url: url.to_string(),
        limit,
    };
    if resp.content_length().is_some_and(|len| len > limit) {
        return Err(too_large());
    }
    let mut body = Vec::new();
    while let Some(chunk) = resp.chunk().await? {
        if (body.len() + chunk.len()) as u64 > limit {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

enum RangeError {
    Unauthorized,
    Fetch(FetchError),
}

fn header_u64(resp: &Response, name: &str) -> Option<u64> {
    resp.headers()
        .get(name)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Total from `bytes 0-0/<total>`; `*` totals are unknown.
fn content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

/// Last non-empty path segment of `url`, safe to use as a file name.
pub fn artifact_file_name(url: &str) -> Result<String, FetchError> {
    let parsed = Url::parse(url).map_err(|_| FetchError::BadUrl(url.to_string()))?;
    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(ToString::to_string)
        .ok_or_else(|| FetchError::BadUrl(url.to_string()))
}

#[cfg(test)]
mod unit {
    use super::*;

    #[test]
    fn content_range_parsing() {
        assert_eq!(content_range_total("bytes 0-0/54321"), Some(54321));
        assert_eq!(content_range_total("bytes 0-0/*"), None);
        assert_eq!(content_range_total("garbage"), None);
    }

    #[test]
    fn file_name_from_url() {
        assert_eq!(
            artifact_file_name("https://repo.example.com/images/a.raw?x=1#frag").ok(),
            Some("a.raw".to_string())
        );
        assert!(artifact_file_name("https://repo.example.com/").is_err());
        assert!(artifact_file_name("not a url").is_err());
    }
}
