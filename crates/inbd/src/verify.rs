//! Post-boot verification.
//!
//! Runs once per boot. The persistent state written before the reboot is
//! the only input; the verifier either commits the update, records a
//! failure, or rolls back and reboots again.

use tracing::{info, instrument, warn};

use inbd_core::exec::IP;
use inbd_core::{CommandRunner, Invocation, SafeFs};

use crate::apply::{image, package};
use crate::config::Settings;
use crate::distro::{self, OsFamily, OsInfo};
use crate::error::{FailureReason, UpdateError};
use crate::reboot;
use crate::request::PowerState;
use crate::snapshot::Snapshotter;
use crate::state::{PersistentState, RestartReason, StateStore};
use crate::status::StatusReporter;

pub const KERNEL_ARGS_UPDATED: &str = "Kernel command line parameters updated successfully";

/// Result of one verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    /// No update was in flight.
    Nothing,
    /// The update was confirmed and committed.
    Committed { version: String },
    /// The update failed and nothing else is attempted.
    Failed(FailureReason),
    /// The update failed and a reboot was issued to fall back.
    Reverted(FailureReason),
}

pub struct Verifier<'a, R> {
    runner: &'a R,
    settings: &'a Settings,
    fs: &'a SafeFs,
    state: &'a StateStore,
    status: &'a StatusReporter,
}

impl<'a, R: CommandRunner> Verifier<'a, R> {
    pub const fn new(
        runner: &'a R,
        settings: &'a Settings,
        fs: &'a SafeFs,
        state: &'a StateStore,
        status: &'a StatusReporter,
    ) -> Self {
        Self {
            runner,
            settings,
            fs,
            state,
            status,
        }
    }

    #[instrument(skip_all, name = "verify")]
    pub async fn run(&self) -> Result<Verification, UpdateError> {
        let Some(record) = self.state.load()? else {
            info!("no update pending verification");
            return Ok(Verification::Nothing);
        };
        let os = distro::detect(self.runner)
            .await
            .map_err(|e| UpdateError::Internal(e.to_string()))?;
        info!(family = %os.family, reason = ?record.restart_reason, "verifying update after boot");
        let metadata = serde_json::to_string(&record)
            .map_err(|e| UpdateError::Internal(e.to_string()))?;
        match os.family {
            OsFamily::Image => self.verify_image(&record, &metadata).await,
            OsFamily::Package => self.verify_packages(&record, &os, &metadata).await,
        }
    }

    async fn verify_image(
        &self,
        record: &PersistentState,
        metadata: &str,
    ) -> Result<Verification, UpdateError> {
        let current = distro::image_build_date(self.fs, &self.settings.paths.image_id)
            .map_err(|e| UpdateError::Internal(e.to_string()))?;
        self.state.truncate_to_zero(self.runner).await?;

        if record.restart_reason == RestartReason::KernelArgs {
            self.report_success(metadata, &current, Some(KERNEL_ARGS_UPDATED));
            return Ok(Verification::Committed { version: current });
        }

        if current == record.previous_version {
            let err = UpdateError::ImageNotSwitched(current);
            warn!(error = %err, "image unchanged after reboot, falling back");
            self.report_failure(metadata, &err);
            self.reboot().await;
            return Ok(Verification::Reverted(err.reason()));
        }

        match image::commit(self.runner, &self.settings.image_tool()).await {
            Ok(()) => {
                self.report_success(metadata, &current, None);
                Ok(Verification::Committed { version: current })
            }
            Err(err) => {
                warn!(error = %err, "commit failed, rebooting into previous slot");
                self.report_failure(metadata, &err);
                self.reboot().await;
                Ok(Verification::Reverted(err.reason()))
            }
        }
    }

    async fn verify_packages(
        &self,
        record: &PersistentState,
        os: &OsInfo,
        metadata: &str,
    ) -> Result<Verification, UpdateError> {
        if let Err(err) = package::verify_installed(self.runner, &record.packages()).await {
            warn!(error = %err, "package verification failed");
            self.report_failure(metadata, &err);
            return Ok(Verification::Failed(err.reason()));
        }

        let detail = (!record.kernel_args.is_empty()).then_some(KERNEL_ARGS_UPDATED);
        if record.snapshot_id == 0 {
            self.state.remove()?;
            self.report_success(metadata, &os.description, detail);
            return Ok(Verification::Committed {
                version: os.description.clone(),
            });
        }

        let snapshots = Snapshotter::new(self.runner, self.settings.snapshot_tool());
        if !self.has_default_route().await {
            let err = UpdateError::NetworkDown;
            warn!(snapshot_id = record.snapshot_id, "no network after update, rolling back");
            self.report_failure(metadata, &err);
            if let Err(e) = snapshots.undo_change(record.snapshot_id).await {
                warn!(error = %e, "snapshot rollback failed");
            }
            if let Err(e) = snapshots.delete(record.snapshot_id).await {
                warn!(error = %e, "snapshot delete failed");
            }
            self.state.remove()?;
            self.reboot().await;
            return Ok(Verification::Reverted(err.reason()));
        }

        self.state.remove()?;
        if let Err(e) = snapshots.delete(record.snapshot_id).await {
            warn!(error = %e, snapshot_id = record.snapshot_id, "snapshot delete failed");
        }
        self.report_success(metadata, &os.description, detail);
        Ok(Verification::Committed {
            version: os.description.clone(),
        })
    }

    async fn has_default_route(&self) -> bool {
        match self
            .runner
            .run(&Invocation::new([IP, "route", "show", "default"]))
            .await
        {
            Ok(out) => out.success() && !out.stdout_str().trim().is_empty(),
            Err(e) => {
                warn!(error = %e, "route probe failed");
                false
            }
        }
    }

    async fn reboot(&self) {
        if let Err(e) =
            reboot::trigger(self.runner, PowerState::Cycle, self.settings.reboot_delay).await
        {
            warn!(error = %e, "rollback reboot failed");
        }
    }

    fn report_success(&self, metadata: &str, version: &str, detail: Option<&str>) {
        let written = match detail {
            Some(detail) => self.status.success_with_detail(metadata, version, detail),
            None => self.status.success(metadata, version),
        };
        if let Err(e) = written {
            warn!(error = %e, "failed to write update status");
        }
    }

    fn report_failure(&self, metadata: &str, err: &UpdateError) {
        if let Err(e) = self.status.fail(metadata, err.reason(), &err.to_string()) {
            warn!(error = %e, "failed to write update status");
        }
    }
}
