//! `inbd` Update Orchestrator Library
//!
//! On-host system software update orchestration:
//! - Artifact size probing, download and hash verification
//! - Trusted-source and device-configuration checks
//! - Image slot switching and package-manager updates with rollback snapshots
//! - Durable state across reboots and post-boot verification
//! - A local request server

pub mod apply;
pub mod config;
pub mod device_config;
pub mod disk;
pub mod distro;
pub mod error;
pub mod fetch;
pub mod pipeline;
pub mod reboot;
pub mod request;
pub mod server;
pub mod snapshot;
pub mod state;
pub mod status;
pub mod trust;
pub mod verify;

pub use error::{FailureReason, UpdateError};
pub use pipeline::Orchestrator;
pub use request::{UpdateRequest, UpdateResponse};
