//! Shared fixtures for the integration tests: a scripted command runner, a
//! fixed free-space probe and a relocated filesystem sandbox.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use inbd::Orchestrator;
use inbd::config::{Paths, Settings};
use inbd::disk::{DiskError, DiskProbe};
use inbd::request::UrlPolicy;
use inbd_core::exec::{APT_GET, DPKG, LSB_RELEASE, TRUNCATE};
use inbd_core::{CommandOutput, CommandRunner, ExecError, Invocation, SafeFs};

pub const MB: u64 = 1024 * 1024;

pub const UBUNTU: &str = "Distributor ID:\tUbuntu\nDescription:\tUbuntu 22.04.4 LTS\n";
pub const EMT: &str =
    "Distributor ID:\tEdge Microvisor Toolkit\nDescription:\tEdge Microvisor Toolkit 3.0\n";

pub const SCHEMA: &str = r#"{
    "type": "object",
    "properties": {
        "os_updater": {
            "type": "object",
            "properties": {
                "trustedRepositories": {"type": "array", "items": {"type": "string"}},
                "proceedWithoutRollback": {"type": "boolean"},
                "sotaSW": {"type": "array", "items": {"type": "string"}}
            }
        }
    }
}"#;

/// Runner that records every argv and answers from a prefix table.
///
/// Unmatched commands succeed with empty output. `truncate -s 0 <path>` is
/// carried out for real so state-file effects stay observable.
#[derive(Default)]
pub struct FakeRunner {
    calls: Mutex<Vec<Vec<String>>>,
    replies: Mutex<Vec<(Vec<String>, CommandOutput)>>,
    delays: Mutex<Vec<(Vec<String>, Duration)>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer any argv starting with `prefix` with `output`. Later entries win.
    pub fn reply(&self, prefix: &[&str], output: CommandOutput) -> &Self {
        self.replies
            .lock()
            .unwrap()
            .push((prefix.iter().map(ToString::to_string).collect(), output));
        self
    }

    /// Hold any argv starting with `prefix` for `delay` before answering.
    pub fn delay(&self, prefix: &[&str], delay: Duration) -> &Self {
        self.delays
            .lock()
            .unwrap()
            .push((prefix.iter().map(ToString::to_string).collect(), delay));
        self
    }

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().unwrap().clone()
    }

    /// Whether some recorded argv starts with `prefix`.
    pub fn ran(&self, prefix: &[&str]) -> bool {
        self.calls().iter().any(|argv| starts_with(argv, prefix))
    }

    /// Recorded argvs joined with spaces, for order assertions.
    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(|argv| argv.join(" ")).collect()
    }
}

fn starts_with<S: AsRef<str>>(argv: &[String], prefix: &[S]) -> bool {
    argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p.as_ref())
}

impl CommandRunner for FakeRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        let argv = invocation.argv().to_vec();
        self.calls.lock().unwrap().push(argv.clone());

        let delay = self
            .delays
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(prefix, _)| starts_with(&argv, prefix.as_slice()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if argv.first().map(String::as_str) == Some(TRUNCATE) {
            if let Some(path) = argv.last() {
                std::fs::write(path, b"").unwrap();
            }
            return Ok(CommandOutput::ok(""));
        }

        Ok(self
            .replies
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(prefix, _)| starts_with(&argv, prefix.as_slice()))
            .map_or_else(|| CommandOutput::ok(""), |(_, out)| out.clone()))
    }
}

/// Constant free space on every mount, optionally reporting btrfs.
pub struct FixedSpace {
    pub free: u64,
    pub btrfs: bool,
}

impl DiskProbe for FixedSpace {
    fn free_bytes(&self, _mount: &Path) -> Result<u64, DiskError> {
        Ok(self.free)
    }

    fn is_btrfs(&self, _mount: &Path) -> Result<bool, DiskError> {
        Ok(self.btrfs)
    }
}

/// A relocated root under `/tmp` holding config, schema and image id.
pub struct Sandbox {
    pub dir: tempfile::TempDir,
    pub paths: Paths,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::Builder::new()
            .prefix("inbd-it-")
            .tempdir_in("/tmp")
            .unwrap();
        let paths = Paths::under(dir.path());
        let sandbox = Self { dir, paths };
        sandbox.write(&sandbox.paths.config_schema, SCHEMA);
        sandbox.write_config(&serde_json::json!({
            "os_updater": {"trustedRepositories": ["https://repo.example.com/"]}
        }));
        sandbox.write(&sandbox.paths.image_id, "IMAGE_BUILD_DATE=2025-10-01\n");
        sandbox
    }

    pub fn write(&self, path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    pub fn write_config(&self, document: &serde_json::Value) {
        self.write(&self.paths.device_config, &document.to_string());
    }

    pub fn settings(&self) -> Settings {
        Settings::under(self.dir.path())
            .with_reboot_delay(Duration::ZERO)
            .with_system_proxy(false)
    }

    pub fn orchestrator(&self, runner: FakeRunner, free: u64) -> Orchestrator<FakeRunner, FixedSpace> {
        self.orchestrator_with(runner, FixedSpace { free, btrfs: false })
    }

    /// Orchestrator whose root filesystem reports btrfs, so snapshots run.
    pub fn btrfs_orchestrator(
        &self,
        runner: FakeRunner,
        free: u64,
    ) -> Orchestrator<FakeRunner, FixedSpace> {
        self.orchestrator_with(runner, FixedSpace { free, btrfs: true })
    }

    pub fn orchestrator_with(
        &self,
        runner: FakeRunner,
        disk: FixedSpace,
    ) -> Orchestrator<FakeRunner, FixedSpace> {
        Orchestrator::new(self.settings(), SafeFs::default(), runner, disk)
    }

    /// Orchestrator that trusts only `origin` and accepts plain `http`, for
    /// runs that download from an in-process server.
    pub fn local_mirror_orchestrator(
        &self,
        runner: FakeRunner,
        free: u64,
        origin: &str,
    ) -> Orchestrator<FakeRunner, FixedSpace> {
        self.write_config(&serde_json::json!({
            "os_updater": {"trustedRepositories": [origin]}
        }));
        Orchestrator::new(
            self.settings().with_url_policy(UrlPolicy::AllowPlainHttp),
            SafeFs::default(),
            runner,
            FixedSpace { free, btrfs: false },
        )
    }

    /// Files left in the artifact directory.
    pub fn artifacts(&self) -> Vec<std::path::PathBuf> {
        match std::fs::read_dir(&self.paths.artifact_dir) {
            Ok(entries) => entries.map(|e| e.unwrap().path()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Runner pre-loaded with `lsb_release` output.
pub fn runner_for(lsb: &str) -> FakeRunner {
    let runner = FakeRunner::new();
    runner.reply(&[LSB_RELEASE], CommandOutput::ok(lsb));
    runner
}

/// `dpkg -l` listing showing `pkg` installed.
pub fn dpkg_installed(runner: &FakeRunner, pkg: &str) {
    runner.reply(
        &[DPKG, "-l", pkg],
        CommandOutput::ok(format!(
            "||/ Name  Version  Architecture  Description\n\
             +++-=====-========-=============-===========\n\
             ii  {pkg}  1.0  amd64  test package\n"
        )),
    );
}

/// Prefix of the package dry run.
pub const DRY_RUN: &[&str] = &[
    APT_GET,
    "-o",
    "Dpkg::Options::=--force-confdef",
    "-o",
    "Dpkg::Options::=--force-confold",
    "--assume-no",
];
