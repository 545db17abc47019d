//! Rollback snapshots through the filesystem snapshot tool.

use thiserror::Error;
use tracing::info;

use inbd_core::{CommandRunner, ExecError, Invocation};

/// Snapshot tool configuration holding the root filesystem.
pub const SNAPSHOT_CONFIG: &str = "rootConfig";

const SNAPSHOT_DESCRIPTION: &str = "sota_update";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot tool failed: {0}")]
    Exec(#[from] ExecError),

    #[error("snapshot tool returned no snapshot id: {0:?}")]
    BadId(String),

    #[error("root filesystem is not btrfs")]
    NotBtrfs,

    #[error("could not determine root filesystem type: {0}")]
    Probe(String),
}

/// Thin wrapper over the snapshot tool's CLI.
#[derive(Debug)]
pub struct Snapshotter<'a, R> {
    runner: &'a R,
    tool: String,
}

impl<'a, R: CommandRunner> Snapshotter<'a, R> {
    pub fn new(runner: &'a R, tool: impl Into<String>) -> Self {
        Self {
            runner,
            tool: tool.into(),
        }
    }

    fn invocation(&self) -> Invocation {
        Invocation::new([self.tool.as_str(), "-c", SNAPSHOT_CONFIG])
    }

    /// Take a pre-update snapshot and return its id.
    pub async fn create(&self) -> Result<u64, SnapshotError> {
        let out = self
            .runner
            .run(&self.invocation().args([
                "create",
                "-p",
                "--description",
                SNAPSHOT_DESCRIPTION,
            ]))
            .await?
            .check("snapshot create")?;
        let raw = out.stdout_str();
        let id = raw
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| SnapshotError::BadId(raw.trim().to_string()))?;
        info!(snapshot_id = id, "rollback snapshot created");
        Ok(id)
    }

    /// Revert every change made since snapshot `id`.
    pub async fn undo_change(&self, id: u64) -> Result<(), SnapshotError> {
        self.runner
            .run(&self.invocation().args(["undochange".to_string(), format!("{id}..0")]))
            .await?
            .check("snapshot undochange")?;
        info!(snapshot_id = id, "changes since snapshot reverted");
        Ok(())
    }

    pub async fn delete(&self, id: u64) -> Result<(), SnapshotError> {
        self.runner
            .run(&self.invocation().args(["delete".to_string(), id.to_string()]))
            .await?
            .check("snapshot delete")?;
        info!(snapshot_id = id, "snapshot deleted");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use inbd_core::CommandOutput;

    use super::*;

    struct Scripted {
        calls: Mutex<Vec<Vec<String>>>,
        reply: CommandOutput,
    }

    impl CommandRunner for Scripted {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
            self.calls.lock().unwrap().push(invocation.argv().to_vec());
            Ok(self.reply.clone())
        }
    }

    fn scripted(reply: CommandOutput) -> Scripted {
        Scripted {
            calls: Mutex::new(Vec::new()),
            reply,
        }
    }

    #[tokio::test]
    async fn create_parses_id() {
        let runner = scripted(CommandOutput::ok("17\n"));
        let id = Snapshotter::new(&runner, "/usr/bin/snapper")
            .create()
            .await
            .unwrap();
        assert_eq!(id, 17);
        assert_eq!(
            runner.calls.lock().unwrap()[0],
            [
                "/usr/bin/snapper",
                "-c",
                "rootConfig",
                "create",
                "-p",
                "--description",
                "sota_update"
            ]
            .map(String::from)
        );
    }

    #[tokio::test]
    async fn create_rejects_garbage() {
        let runner = scripted(CommandOutput::ok("oops"));
        let err = Snapshotter::new(&runner, "/usr/bin/snapper")
            .create()
            .await
            .unwrap_err();
        assert!(matches!(err, SnapshotError::BadId(_)));
    }

    #[tokio::test]
    async fn undo_and_delete_argv() {
        let runner = scripted(CommandOutput::ok(""));
        let snap = Snapshotter::new(&runner, "/usr/bin/snapper");
        snap.undo_change(5).await.unwrap();
        snap.delete(5).await.unwrap();
        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0][3..], ["undochange", "5..0"].map(String::from));
        assert_eq!(calls[1][3..], ["delete", "5"].map(String::from));
    }

    #[tokio::test]
    async fn tool_failure_is_an_error() {
        let runner = scripted(CommandOutput::failed(1, "no config"));
        assert!(matches!(
            Snapshotter::new(&runner, "/usr/bin/snapper").create().await,
            Err(SnapshotError::Exec(_))
        ));
    }
}
