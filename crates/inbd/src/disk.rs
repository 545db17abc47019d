//! Free-space guard.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

/// Fixed headroom added on top of the artifact size.
pub const HEADROOM_BYTES: u64 = 100 * 1024 * 1024;

#[derive(Debug, Error)]
#[error("failed to query filesystem at {path}: {source}")]
pub struct DiskError {
    path: PathBuf,
    #[source]
    source: nix::Error,
}

impl DiskError {
    fn new(path: &Path, source: nix::Error) -> Self {
        Self {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Free-space and filesystem-type figures for a mount.
pub trait DiskProbe: Send + Sync {
    fn free_bytes(&self, mount: &Path) -> Result<u64, DiskError>;

    /// Whether `mount` is on btrfs, the only filesystem snapshots work on.
    fn is_btrfs(&self, mount: &Path) -> Result<bool, DiskError>;
}

/// `statvfs`/`statfs`-backed probe: free is `f_bavail * f_frsize`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatvfsProbe;

impl DiskProbe for StatvfsProbe {
    fn free_bytes(&self, mount: &Path) -> Result<u64, DiskError> {
        let stat =
            nix::sys::statvfs::statvfs(mount).map_err(|source| DiskError::new(mount, source))?;
        Ok(u64::from(stat.blocks_available()).saturating_mul(u64::from(stat.fragment_size())))
    }

    fn is_btrfs(&self, mount: &Path) -> Result<bool, DiskError> {
        use nix::sys::statfs::{BTRFS_SUPER_MAGIC, statfs};

        let stat = statfs(mount).map_err(|source| DiskError::new(mount, source))?;
        Ok(stat.filesystem_type() == BTRFS_SUPER_MAGIC)
    }
}

/// `max(ceil(1.2 * size), size + 100 MiB)`.
pub const fn required_bytes(artifact_bytes: u64) -> u64 {
    let scaled = artifact_bytes.saturating_mul(6).div_ceil(5);
    let padded = artifact_bytes.saturating_add(HEADROOM_BYTES);
    if scaled > padded { scaled } else { padded }
}

/// Outcome of a space check, kept for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceCheck {
    pub required: u64,
    pub free: u64,
}

impl SpaceCheck {
    pub const fn enough(&self) -> bool {
        self.free >= self.required
    }
}

/// Compare free space on `mount` with what `artifact_bytes` needs.
pub fn check<P: DiskProbe + ?Sized>(
    probe: &P,
    mount: &Path,
    artifact_bytes: u64,
) -> Result<SpaceCheck, DiskError> {
    let check = SpaceCheck {
        required: required_bytes(artifact_bytes),
        free: probe.free_bytes(mount)?,
    };
    info!(
        mount = %mount.display(),
        artifact_bytes,
        required = check.required,
        free = check.free,
        "disk space check"
    );
    Ok(check)
}

/// `true` when free space on `mount` covers [`required_bytes`].
pub fn enough<P: DiskProbe + ?Sized>(
    probe: &P,
    mount: &Path,
    artifact_bytes: u64,
) -> Result<bool, DiskError> {
    check(probe, mount, artifact_bytes).map(|c| c.enough())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    struct Fixed(u64);

    impl DiskProbe for Fixed {
        fn free_bytes(&self, _mount: &Path) -> Result<u64, DiskError> {
            Ok(self.0)
        }

        fn is_btrfs(&self, _mount: &Path) -> Result<bool, DiskError> {
            Ok(false)
        }
    }

    #[test]
    fn small_artifacts_use_fixed_headroom() {
        assert_eq!(required_bytes(50 * MB), 150 * MB);
        assert_eq!(required_bytes(0), HEADROOM_BYTES);
    }

    #[test]
    fn large_artifacts_use_twenty_percent() {
        assert_eq!(required_bytes(1000 * MB), 1200 * MB);
        // ceil(1.2 * 1_000_000_001) = 1_200_000_002
        assert_eq!(required_bytes(1_000_000_001), 1_200_000_002);
    }

    #[test]
    fn formula_is_max_of_both_terms() {
        for size in [1, 7, 499 * MB, 500 * MB, 501 * MB, 10_000 * MB] {
            let want = (size * 6).div_ceil(5).max(size + 100 * MB);
            assert_eq!(required_bytes(size), want, "size {size}");
        }
    }

    #[test]
    fn boundary_equal_is_enough() {
        let size = 50 * MB;
        let p = Path::new("/");
        assert!(enough(&Fixed(150 * MB), p, size).unwrap());
        assert!(!enough(&Fixed(150 * MB - 1), p, size).unwrap());
    }

    #[test]
    fn fifty_megabytes_free_is_not_enough_for_fifty() {
        assert!(!enough(&Fixed(50 * MB), Path::new("/"), 50 * MB).unwrap());
    }

    #[test]
    fn statvfs_reports_something_for_tmp() {
        assert!(StatvfsProbe.free_bytes(Path::new("/tmp")).is_ok());
        assert!(StatvfsProbe.is_btrfs(Path::new("/tmp")).is_ok());
    }

    #[test]
    fn missing_mount_is_an_error() {
        let err = StatvfsProbe
            .is_btrfs(Path::new("/nonexistent/inbd-mount"))
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/inbd-mount"));
    }
}
