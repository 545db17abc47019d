//! Command execution choke point.
//!
//! Every external tool the orchestrator runs (package manager, snapshot
//! tool, image-update tool, reboot) goes through a [`CommandRunner`]. The
//! production [`Executor`] only launches programs whose absolute path is on
//! a closed allowlist, passes arguments as a vector (never through a shell),
//! clears the inherited environment and applies only the explicit map carried
//! by the [`Invocation`].
//!
//! The executor never times out on its own; callers check their deadline
//! after the child returns.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, warn};

pub const REBOOT: &str = "/usr/sbin/reboot";
pub const SHUTDOWN: &str = "/usr/sbin/shutdown";
pub const APT_GET: &str = "/usr/bin/apt-get";
pub const DPKG: &str = "/usr/bin/dpkg";
pub const TRUNCATE: &str = "/usr/bin/truncate";
pub const IP: &str = "/usr/bin/ip";
pub const LSB_RELEASE: &str = "/usr/bin/lsb_release";
pub const UPDATE_GRUB: &str = "/usr/sbin/update-grub";
pub const IMAGE_TOOL: &str = "/usr/bin/os-update-tool.sh";
pub const SNAPSHOT_TOOL: &str = "/usr/bin/snapper";

/// `PATH` given to children whose invocation does not set one.
const DEFAULT_PATH: &str = "/usr/sbin:/usr/bin:/sbin:/bin";

/// Errors raised before or while launching a child process.
///
/// A child that runs and exits non-zero is not an error at this level; see
/// [`CommandOutput::check`].
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyArgv,

    #[error("command not allowed: {0}")]
    NotAllowed(String),

    #[error("failed to execute {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{description} failed (exit {exit_code}): {stderr}")]
    Failed {
        description: String,
        exit_code: i32,
        stderr: String,
    },
}

/// A fully specified child process: argv plus an explicit environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    argv: Vec<String>,
    env: BTreeMap<String, String>,
}

impl Invocation {
    /// Build an invocation from an argv vector. `argv[0]` is the program.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set one environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merge an environment map into the child's environment.
    #[must_use]
    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub const fn environment(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    /// The argv joined with spaces, for logs and error messages only.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// Captured result of a finished child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code; `-1` when the child was killed by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    /// A successful output with the given stdout, mostly for test doubles.
    pub fn ok(stdout: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: Vec::new(),
            exit_code: 0,
        }
    }

    /// A failed output with the given stderr and exit code.
    pub fn failed(exit_code: i32, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub const fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Convert a non-zero exit into [`ExecError::Failed`].
    pub fn check(self, description: &str) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::Failed {
                description: description.to_string(),
                exit_code: self.exit_code,
                stderr: self.stderr_str(),
            })
        }
    }
}

/// Something that can run an [`Invocation`] to completion.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        invocation: &Invocation,
    ) -> impl Future<Output = Result<CommandOutput, ExecError>> + Send;
}

/// Production runner backed by `tokio::process`.
#[derive(Debug, Clone)]
pub struct Executor {
    allowed: HashSet<PathBuf>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new([
            REBOOT,
            SHUTDOWN,
            APT_GET,
            DPKG,
            TRUNCATE,
            IP,
            LSB_RELEASE,
            UPDATE_GRUB,
            IMAGE_TOOL,
            SNAPSHOT_TOOL,
        ])
    }
}

impl Executor {
    /// Create an executor allowing exactly the given absolute program paths.
    pub fn new<I, P>(allowed: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }

    /// Allow one more program, e.g. a relocated image-update tool.
    #[must_use]
    pub fn allow(mut self, program: impl Into<PathBuf>) -> Self {
        self.allowed.insert(program.into());
        self
    }

    fn check_allowed(&self, program: &str) -> Result<(), ExecError> {
        let path = Path::new(program);
        if path.is_absolute() && self.allowed.contains(path) {
            Ok(())
        } else {
            Err(ExecError::NotAllowed(program.to_string()))
        }
    }
}

impl CommandRunner for Executor {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        let (program, args) = invocation
            .argv()
            .split_first()
            .ok_or(ExecError::EmptyArgv)?;
        self.check_allowed(program)?;

        debug!(command = %invocation.display(), "exec");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(invocation.environment())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if !invocation.environment().contains_key("PATH") {
            cmd.env("PATH", DEFAULT_PATH);
        }

        let output = cmd.output().await.map_err(|source| ExecError::Spawn {
            program: program.clone(),
            source,
        })?;

        let result = CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.status.code().unwrap_or(-1),
        };
        if !result.success() {
            warn!(
                command = %invocation.display(),
                exit_code = result.exit_code,
                stderr = %result.stderr_str(),
                "command exited non-zero"
            );
        }
        Ok(result)
    }
}
