//! Distribution detection and running-version lookup.

use std::path::Path;

use thiserror::Error;
use tracing::debug;

use inbd_core::exec::LSB_RELEASE;
use inbd_core::{CommandRunner, ExecError, FsError, Invocation, SafeFs};

/// Markers identifying the immutable-root image distribution.
const IMAGE_MARKERS: &[&str] = &["Tiber", "Edge Microvisor", "EMT"];

/// Distributions updated through the package manager.
const PACKAGE_DISTRIBUTORS: &[&str] = &["Ubuntu", "Debian"];

#[derive(Debug, Error)]
pub enum DistroError {
    #[error("unsupported OS: {0}")]
    Unsupported(String),

    #[error("failed to detect OS: {0}")]
    Exec(#[from] ExecError),

    #[error("failed to read image version: {0}")]
    Fs(#[from] FsError),

    #[error("IMAGE_BUILD_DATE not found in {0}")]
    MissingBuildDate(String),
}

/// Update strategy families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    /// Immutable root, A/B image switch.
    Image,
    /// Mutable root, package manager plus filesystem snapshot.
    Package,
}

impl std::fmt::Display for OsFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Image => "image",
            Self::Package => "package",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsInfo {
    pub family: OsFamily,
    pub distributor: String,
    /// Human-readable release, e.g. `Ubuntu 22.04.4 LTS`.
    pub description: String,
}

/// Run `lsb_release -a` and classify the host.
pub async fn detect<R: CommandRunner>(runner: &R) -> Result<OsInfo, DistroError> {
    let output = runner
        .run(&Invocation::new([LSB_RELEASE, "-a"]))
        .await?
        .check("lsb_release")?;
    let info = parse_lsb_release(&output.stdout_str())?;
    debug!(family = %info.family, distributor = %info.distributor, "OS detected");
    Ok(info)
}

/// Classify `lsb_release -a` output.
pub fn parse_lsb_release(text: &str) -> Result<OsInfo, DistroError> {
    let field = |name: &str| {
        text.lines()
            .filter_map(|line| line.split_once(':'))
            .find(|(key, _)| key.trim() == name)
            .map(|(_, value)| value.trim().to_string())
            .unwrap_or_default()
    };
    let distributor = field("Distributor ID");
    let description = field("Description");

    let family = if PACKAGE_DISTRIBUTORS.contains(&distributor.as_str()) {
        OsFamily::Package
    } else if IMAGE_MARKERS
        .iter()
        .any(|m| distributor.contains(m) || description.contains(m))
    {
        OsFamily::Image
    } else {
        let shown = if distributor.is_empty() {
            "unknown"
        } else {
            distributor.as_str()
        };
        return Err(DistroError::Unsupported(shown.to_string()));
    };
    Ok(OsInfo {
        family,
        distributor,
        description,
    })
}

/// `IMAGE_BUILD_DATE` from the image identification file.
pub fn image_build_date(fs: &SafeFs, image_id: &Path) -> Result<String, DistroError> {
    let text = fs.read_to_string(image_id)?;
    parse_image_build_date(&text)
        .ok_or_else(|| DistroError::MissingBuildDate(image_id.display().to_string()))
}

fn parse_image_build_date(text: &str) -> Option<String> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("IMAGE_BUILD_DATE="))
        .map(|v| v.trim().trim_matches('"').trim_matches('\'').to_string())
        .find(|v| !v.is_empty())
}

/// Build date as a calendar date, accepting `YYYY-MM-DD` or a `YYYYMMDD...`
/// stamp.
pub fn build_date_as_date(build_date: &str) -> Option<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(build_date, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            build_date
                .get(..8)
                .and_then(|d| chrono::NaiveDate::parse_from_str(d, "%Y%m%d").ok())
        })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const UBUNTU: &str = "No LSB modules are available.\n\
        Distributor ID:\tUbuntu\n\
        Description:\tUbuntu 22.04.4 LTS\n\
        Release:\t22.04\n\
        Codename:\tjammy\n";

    const EMT: &str = "Distributor ID:\tEdge Microvisor Toolkit\n\
        Description:\tEdge Microvisor Toolkit 3.0\n";

    #[test]
    fn ubuntu_is_package_family() {
        let info = parse_lsb_release(UBUNTU).unwrap();
        assert_eq!(info.family, OsFamily::Package);
        assert_eq!(info.description, "Ubuntu 22.04.4 LTS");
    }

    #[test]
    fn microvisor_is_image_family() {
        assert_eq!(parse_lsb_release(EMT).unwrap().family, OsFamily::Image);
        let tiber = "Distributor ID:\tTiber\nDescription:\tTiber 1.0\n";
        assert_eq!(parse_lsb_release(tiber).unwrap().family, OsFamily::Image);
    }

    #[test]
    fn others_are_unsupported() {
        let fedora = "Distributor ID:\tFedora\nDescription:\tFedora 40\n";
        assert!(matches!(
            parse_lsb_release(fedora),
            Err(DistroError::Unsupported(d)) if d == "Fedora"
        ));
        assert!(matches!(
            parse_lsb_release(""),
            Err(DistroError::Unsupported(d)) if d == "unknown"
        ));
    }

    #[test]
    fn build_date_parsing() {
        assert_eq!(
            parse_image_build_date("IMAGE_ID=x\nIMAGE_BUILD_DATE=2025-10-01\n").as_deref(),
            Some("2025-10-01")
        );
        assert_eq!(
            parse_image_build_date("IMAGE_BUILD_DATE=\"20251001T1200\"").as_deref(),
            Some("20251001T1200")
        );
        assert_eq!(parse_image_build_date("NOTHING=1"), None);

        let day = chrono::NaiveDate::from_ymd_opt(2025, 10, 1);
        assert_eq!(build_date_as_date("2025-10-01"), day);
        assert_eq!(build_date_as_date("20251001T1200"), day);
        assert_eq!(build_date_as_date("garbage"), None);
    }
}
