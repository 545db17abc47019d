//! Package-manager command sequences.
//!
//! Every command is an argv vector; package names are passed as separate
//! arguments, never spliced into a string.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, info};

use inbd_core::exec::{APT_GET, DPKG};
use inbd_core::{CommandRunner, Invocation};

use crate::error::UpdateError;
use crate::request::UpdateMode;

const CONF_DEF: &str = "Dpkg::Options::=--force-confdef";
const CONF_OLD: &str = "Dpkg::Options::=--force-confold";

static SUMMARY_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(\d+) upgraded, (\d+) newly installed, (\d+) to remove").ok()
});

static SPACE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"After this operation, ([\d.,]+) ?(B|kB|KB|MB|GB) of additional disk space will be used",
    )
    .ok()
});

/// Environment for every package-manager child.
pub fn package_env() -> BTreeMap<String, String> {
    let path = std::env::var("PATH").unwrap_or_default();
    let path = if path.is_empty() {
        "/usr/bin:/bin".to_string()
    } else {
        format!("{path}:/usr/bin:/bin")
    };
    BTreeMap::from([
        ("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string()),
        ("NEEDRESTART_MODE".to_string(), "l".to_string()),
        ("NEEDRESTART_SUSPEND".to_string(), "1".to_string()),
        ("PATH".to_string(), path),
    ])
}

/// What a dry run says the real run would do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DryRun {
    pub upgraded: u64,
    pub newly_installed: u64,
    pub to_remove: u64,
    /// Additional disk space the operation needs.
    pub additional_bytes: u64,
}

impl DryRun {
    pub const fn no_changes(&self) -> bool {
        self.upgraded == 0 && self.newly_installed == 0 && self.to_remove == 0
    }
}

/// Parse `apt-get --assume-no` output.
///
/// Unknown packages and `E:` lines are reported as
/// [`UpdateError::InvalidPackage`]. Output without the
/// `N upgraded, N newly installed, N to remove` line is
/// [`UpdateError::DryRunIncomplete`]; only that line can report no changes.
pub fn parse_dry_run(output: &str) -> Result<DryRun, UpdateError> {
    if let Some(line) = output.lines().find(|l| {
        let l = l.trim_start();
        l.starts_with("E: ") || l.contains("Unable to locate package")
    }) {
        return Err(UpdateError::InvalidPackage(line.trim().to_string()));
    }

    let caps = SUMMARY_RE
        .as_ref()
        .and_then(|re| re.captures(output))
        .ok_or_else(|| {
            let last = output.lines().map(str::trim).rfind(|l| !l.is_empty());
            UpdateError::DryRunIncomplete(last.unwrap_or("no output").to_string())
        })?;
    let count = |i: usize| {
        caps.get(i)
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| UpdateError::DryRunIncomplete(caps[0].to_string()))
    };
    let mut dry = DryRun {
        upgraded: count(1)?,
        newly_installed: count(2)?,
        to_remove: count(3)?,
        additional_bytes: 0,
    };
    if let Some(caps) = SPACE_RE.as_ref().and_then(|re| re.captures(output)) {
        let amount: f64 = caps
            .get(1)
            .map(|m| m.as_str().replace(',', ""))
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let unit: f64 = match caps.get(2).map(|m| m.as_str()) {
            Some("kB" | "KB") => 1e3,
            Some("MB") => 1e6,
            Some("GB") => 1e9,
            _ => 1.0,
        };
        dry.additional_bytes = to_bytes(amount * unit);
    }
    Ok(dry)
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn to_bytes(value: f64) -> u64 {
    value.ceil().max(0.0) as u64
}

/// Commands for one package-family run.
#[derive(Debug, Clone)]
pub struct PackagePlan {
    mode: UpdateMode,
    packages: Vec<String>,
    env: BTreeMap<String, String>,
}

impl PackagePlan {
    pub fn new(mode: UpdateMode, packages: &[String]) -> Self {
        Self {
            mode,
            packages: packages.to_vec(),
            env: package_env(),
        }
    }

    fn apt(&self) -> Invocation {
        Invocation::new([APT_GET]).envs(&self.env)
    }

    fn apt_update(&self) -> Invocation {
        self.apt().arg("update")
    }

    fn dpkg_configure(&self) -> Invocation {
        Invocation::new([DPKG, "--configure", "-a", "--force-confdef", "--force-confold"])
            .envs(&self.env)
    }

    /// `upgrade` for an empty package list, `install <pkgs>` otherwise.
    fn action(&self, inv: Invocation) -> Invocation {
        if self.packages.is_empty() {
            inv.arg("upgrade")
        } else {
            inv.arg("install").args(self.packages.iter().cloned())
        }
    }

    /// Steps that run before the dry run: the index refresh for modes that
    /// download, preceded by the dpkg repair for DOWNLOAD_ONLY.
    pub fn index_steps(&self) -> Vec<Invocation> {
        match self.mode {
            UpdateMode::Full => vec![self.apt_update()],
            UpdateMode::NoDownload => Vec::new(),
            UpdateMode::DownloadOnly => vec![self.dpkg_configure(), self.apt_update()],
        }
    }

    /// The sizing run; its exit code is meaningless (`--assume-no` aborts).
    pub fn dry_run(&self) -> Invocation {
        self.action(
            self.apt()
                .args(["-o", CONF_DEF, "-o", CONF_OLD, "--assume-no"]),
        )
    }

    /// Steps between the dry run and the main command.
    pub fn preparation(&self) -> Vec<Invocation> {
        match self.mode {
            UpdateMode::Full => vec![
                self.apt().args(["-yq", "-f", "install"]),
                self.dpkg_configure(),
            ],
            UpdateMode::NoDownload => vec![
                self.dpkg_configure(),
                self.apt()
                    .args(["-o", CONF_DEF, "-o", CONF_OLD, "-yq", "-f", "install"]),
            ],
            UpdateMode::DownloadOnly => Vec::new(),
        }
    }

    pub fn main_command(&self) -> Invocation {
        let inv = self
            .apt()
            .args(["-o", CONF_DEF, "-o", CONF_OLD, "-yq"]);
        let inv = if self.mode == UpdateMode::DownloadOnly {
            inv.arg("--download-only")
        } else {
            inv
        };
        self.action(inv)
    }
}

/// Run `dry_run` and parse its output.
pub async fn dry_run<R: CommandRunner>(runner: &R, plan: &PackagePlan) -> Result<DryRun, UpdateError> {
    let out = runner
        .run(&plan.dry_run())
        .await
        .map_err(UpdateError::PackageTool)?;
    let text = format!("{}\n{}", out.stdout_str(), out.stderr_str());
    let dry = parse_dry_run(&text).map_err(|e| match e {
        UpdateError::DryRunIncomplete(detail) => {
            UpdateError::DryRunIncomplete(format!("exit code {}: {detail}", out.exit_code))
        }
        other => other,
    })?;
    debug!(?dry, "package dry run");
    Ok(dry)
}

/// Run one step, failing on a non-zero exit.
pub async fn run_step<R: CommandRunner>(
    runner: &R,
    step: &Invocation,
) -> Result<(), UpdateError> {
    runner
        .run(step)
        .await
        .and_then(|out| out.check(&step.display()))
        .map_err(UpdateError::PackageTool)?;
    info!(command = %step.display(), "package step finished");
    Ok(())
}

/// Whether `dpkg -l <pkg>` output shows `pkg` installed.
pub fn dpkg_lists_installed(output: &str, package: &str) -> bool {
    let name = package.split(['=', ':']).next().unwrap_or(package);
    output.lines().any(|line| {
        line.strip_prefix("ii")
            .map(str::trim_start)
            .and_then(|rest| rest.split_whitespace().next())
            .is_some_and(|listed| listed == name || listed.starts_with(&format!("{name}:")))
    })
}

/// Check every package with `dpkg -l`.
pub async fn verify_installed<R: CommandRunner>(
    runner: &R,
    packages: &[&str],
) -> Result<(), UpdateError> {
    for package in packages {
        let out = runner
            .run(&Invocation::new([DPKG, "-l", package]))
            .await
            .map_err(UpdateError::PackageTool)?;
        if !dpkg_lists_installed(&out.stdout_str(), package) {
            return Err(UpdateError::PackageNotInstalled((*package).to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    const NO_OP: &str = "Reading package lists...\n\
        Building dependency tree...\n\
        emacs is already the newest version (1:27.1).\n\
        0 upgraded, 0 newly installed, 0 to remove and 3 not upgraded.\n";

    const UPGRADE: &str = "The following packages will be upgraded:\n  libc6\n\
        12 upgraded, 1 newly installed, 0 to remove and 0 not upgraded.\n\
        Need to get 30.1 MB of archives.\n\
        After this operation, 1,024 kB of additional disk space will be used.\n\
        Do you want to continue? [Y/n] N\nAbort.\n";

    #[test]
    fn parses_no_changes() {
        let dry = parse_dry_run(NO_OP).unwrap();
        assert!(dry.no_changes());
        assert_eq!(dry.additional_bytes, 0);
    }

    #[test]
    fn parses_counts_and_size() {
        let dry = parse_dry_run(UPGRADE).unwrap();
        assert_eq!(dry.upgraded, 12);
        assert_eq!(dry.newly_installed, 1);
        assert!(!dry.no_changes());
        assert_eq!(dry.additional_bytes, 1_024_000);

        let gb = parse_dry_run(
            "1 upgraded, 0 newly installed, 0 to remove\n\
             After this operation, 1.5 GB of additional disk space will be used.",
        )
        .unwrap();
        assert_eq!(gb.additional_bytes, 1_500_000_000);
    }

    #[test]
    fn invalid_packages_abort() {
        for out in [
            "E: Unable to locate package nosuchpkg\n",
            "Reading package lists...\nE: Could not get lock /var/lib/dpkg/lock\n",
        ] {
            assert!(matches!(
                parse_dry_run(out),
                Err(UpdateError::InvalidPackage(_))
            ));
        }
    }

    #[test]
    fn missing_summary_is_not_a_no_op() {
        for out in [
            "",
            "\n",
            "W: Some index files failed to download. They have been ignored.\n",
            "Reading package lists...\nBuilding dependency tree...\n",
        ] {
            assert!(
                matches!(parse_dry_run(out), Err(UpdateError::DryRunIncomplete(_))),
                "{out:?}"
            );
        }
    }

    #[test]
    fn incomplete_dry_run_names_the_last_line() {
        let err = parse_dry_run("Reading package lists...\nW: mirror unreachable\n").unwrap_err();
        assert_eq!(err.to_string(), "package dry run printed no change summary (W: mirror unreachable)");
    }

    #[test]
    fn full_mode_sequence() {
        let plan = PackagePlan::new(UpdateMode::Full, &[]);
        let index: Vec<String> = plan.index_steps().iter().map(Invocation::display).collect();
        assert_eq!(index, vec!["/usr/bin/apt-get update".to_string()]);
        let prep: Vec<String> = plan.preparation().iter().map(Invocation::display).collect();
        assert_eq!(
            prep,
            vec![
                "/usr/bin/apt-get -yq -f install".to_string(),
                "/usr/bin/dpkg --configure -a --force-confdef --force-confold".to_string(),
            ]
        );
        assert_eq!(
            plan.main_command().display(),
            "/usr/bin/apt-get -o Dpkg::Options::=--force-confdef -o Dpkg::Options::=--force-confold -yq upgrade"
        );
    }

    #[test]
    fn no_download_installs_named_packages() {
        let plan = PackagePlan::new(UpdateMode::NoDownload, &["emacs".into(), "wcalc".into()]);
        assert!(plan.index_steps().is_empty());
        assert_eq!(plan.preparation()[0].program(), Some(DPKG));
        let main = plan.main_command();
        assert_eq!(&main.argv()[main.argv().len() - 3..], ["install", "emacs", "wcalc"]);
        let dry = plan.dry_run();
        assert!(dry.argv().contains(&"--assume-no".to_string()));
        assert!(!dry.argv().contains(&"-yq".to_string()));
    }

    #[test]
    fn download_only_repairs_dpkg_before_refreshing() {
        let plan = PackagePlan::new(UpdateMode::DownloadOnly, &[]);
        let index: Vec<String> = plan.index_steps().iter().map(Invocation::display).collect();
        assert_eq!(
            index,
            vec![
                "/usr/bin/dpkg --configure -a --force-confdef --force-confold".to_string(),
                "/usr/bin/apt-get update".to_string(),
            ]
        );
        assert!(plan.preparation().is_empty());
        assert!(plan.main_command().argv().contains(&"--download-only".to_string()));
    }

    #[test]
    fn environment_is_set() {
        let env = package_env();
        assert_eq!(env["DEBIAN_FRONTEND"], "noninteractive");
        assert_eq!(env["NEEDRESTART_MODE"], "l");
        assert_eq!(env["NEEDRESTART_SUSPEND"], "1");
        assert!(env["PATH"].ends_with("/usr/bin:/bin"));
        let plan = PackagePlan::new(UpdateMode::Full, &[]);
        assert_eq!(plan.main_command().environment(), &env);
    }

    #[test]
    fn dpkg_listing() {
        let out = "Desired=Unknown/Install/Remove/Purge/Hold\n\
            ||/ Name           Version      Architecture Description\n\
            +++-==============-============-============-=================\n\
            ii  emacs          1:27.1       all          GNU Emacs editor\n\
            ii  libc6:amd64    2.35         amd64        GNU C Library\n\
            rc  wcalc          2.5          amd64        calculator\n";
        assert!(dpkg_lists_installed(out, "emacs"));
        assert!(dpkg_lists_installed(out, "libc6"));
        assert!(!dpkg_lists_installed(out, "wcalc"));
        assert!(!dpkg_lists_installed(out, "emac"));
    }
}
