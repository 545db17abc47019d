//! Authorization schemes for artifact servers.
//!
//! A plain bearer token is tried first. When a server answers 401, the
//! fetcher walks [`fallback_schemes`]: the same token in extra headers,
//! `Basic` with well-known machine-account usernames, and `Basic` with
//! usernames taken from the token's own JWT claims. This exists for
//! compatibility with mirrors that expect those shapes; it is a last resort,
//! not a security feature.

use reqwest::RequestBuilder;
use reqwest::header::AUTHORIZATION;

/// Usernames commonly paired with a token used as a password.
const MACHINE_USERNAMES: &[&str] = &["token", "oauth2", "oauth2accesstoken", "admin", "user"];

/// Extra headers some mirrors read the token from.
const MIRROR_HEADERS: &[&str] = &["X-Auth-Token", "X-Access-Token", "Private-Token"];

/// JWT claims that may carry a username.
const USERNAME_CLAIMS: &[&str] = &["preferred_username", "username", "sub", "email"];

#[derive(Clone, PartialEq, Eq)]
pub enum AuthScheme {
    Anonymous,
    Bearer(String),
    /// Bearer plus the token repeated in [`MIRROR_HEADERS`].
    MirrorHeaders(String),
    Basic { username: String, password: String },
}

// Never print tokens.
impl std::fmt::Debug for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Anonymous => f.write_str("Anonymous"),
            Self::Bearer(_) => f.write_str("Bearer(..)"),
            Self::MirrorHeaders(_) => f.write_str("MirrorHeaders(..)"),
            Self::Basic { username, .. } => write!(f, "Basic({username})"),
        }
    }
}

impl AuthScheme {
    /// The first scheme to try for an optional token.
    pub fn initial(token: Option<&str>) -> Self {
        match token.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => Self::Bearer(t.to_string()),
            None => Self::Anonymous,
        }
    }

    pub const fn is_authenticated(&self) -> bool {
        !matches!(self, Self::Anonymous)
    }

    pub fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::Anonymous => request,
            Self::Bearer(token) => request.bearer_auth(token),
            Self::MirrorHeaders(token) => MIRROR_HEADERS
                .iter()
                .fold(request.bearer_auth(token), |rb, name| rb.header(*name, token)),
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }
}

/// Alternate schemes tried in order after a 401.
pub fn fallback_schemes(token: &str) -> Vec<AuthScheme> {
    let basic = |username: &str| AuthScheme::Basic {
        username: username.to_string(),
        password: token.to_string(),
    };
    let mut schemes = vec![AuthScheme::MirrorHeaders(token.to_string())];
    schemes.extend(MACHINE_USERNAMES.iter().map(|u| basic(u)));
    for name in jwt_usernames(token) {
        let scheme = basic(&name);
        if !schemes.contains(&scheme) {
            schemes.push(scheme);
        }
    }
    schemes
}

/// Usernames found in the claims of `token`, if it is a JWT.
///
/// The signature is not checked; the values only pick a username.
fn jwt_usernames(token: &str) -> Vec<String> {
    let Ok(data) = jsonwebtoken::dangerous::insecure_decode::<serde_json::Value>(token) else {
        return Vec::new();
    };
    let mut names: Vec<String> = Vec::new();
    for claim in USERNAME_CLAIMS {
        if let Some(value) = data.claims.get(*claim).and_then(serde_json::Value::as_str) {
            let value = value.trim();
            if !value.is_empty() && !names.iter().any(|n| n == value) {
                names.push(value.to_string());
            }
            // `user@example.com` is often accepted as `user`.
            if let Some((local, _)) = value.split_once('@')
                && !local.is_empty()
                && !names.iter().any(|n| n == local)
            {
                names.push(local.to_string());
            }
        }
    }
    names
}
