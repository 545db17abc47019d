//! Artifact fetching.
//!
//! Provides a reqwest-based client that probes artifact size, downloads into
//! the artifact cache and verifies digests.

mod auth;
mod client;
mod hash;


pub use auth::{AuthScheme, fallback_schemes};
pub use client::{
    FetchConfig, FetchError, Fetcher, MAX_DOCUMENT_BYTES, SizeProbe, artifact_file_name,
};
pub use hash::{digest_hex, verify_hash};
