//! Pipeline coordinator.
//!
//! One update runs at a time. Each run walks a fixed sequence of phases
//! (trust, size, space, fetch, verify, snapshot, apply, reboot) with a
//! deadline check between phases. Any phase error ends the run with a
//! single classified [`FailureReason`] written to both logs.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use inbd_core::{CommandRunner, SafeFs};

use crate::apply::{PackagePlan, image, kernel_args, package};
use crate::config::{CUSTOM_CA_ENV, Settings};
use crate::device_config::{ConfigError, DeviceConfig, OsUpdaterConfig};
use crate::disk::{self, DiskProbe};
use crate::distro::{self, DistroError, OsFamily, OsInfo};
use crate::error::UpdateError;
use crate::fetch::{self, FetchConfig, FetchError, Fetcher};
use crate::reboot::{self, RebootPlan};
use crate::request::{
    HashAlgorithm, PowerState, UpdateMode, UpdateRequest, UpdateResponse, validate_url,
};
use crate::snapshot::{SnapshotError, Snapshotter};
use crate::state::{Phase, PersistentState, RestartReason, StateStore};
use crate::status::StatusReporter;
use crate::trust;
use crate::verify::{Verification, Verifier};

pub const BUSY: &str = "update already in progress";

/// How a run that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Outcome {
    NoUpdate {
        version: String,
    },
    Success {
        version: String,
        system_changed: bool,
        kernel_args_changed: bool,
    },
}

/// Per-run bookkeeping shared by the phases.
struct Run<'a> {
    request: &'a UpdateRequest,
    os: &'a OsInfo,
    start_time: i64,
    deadline_epoch: i64,
    deadline: Option<Instant>,
}

impl<'a> Run<'a> {
    fn new(request: &'a UpdateRequest, os: &'a OsInfo) -> Self {
        let start_time = chrono::Utc::now().timestamp();
        let budget = request.duration_seconds;
        Self {
            request,
            os,
            start_time,
            deadline_epoch: if budget == 0 {
                0
            } else {
                start_time.saturating_add(i64::try_from(budget).unwrap_or(i64::MAX))
            },
            deadline: (budget > 0)
                .then(|| Instant::now().checked_add(Duration::from_secs(budget)))
                .flatten(),
        }
    }

    /// Fail once the request's time budget is spent.
    fn checkpoint(&self, phase: &str) -> Result<(), UpdateError> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                warn!(phase, "deadline reached");
                Err(UpdateError::TimedOut)
            }
            _ => Ok(()),
        }
    }

    fn record(&self, restart_reason: RestartReason, phase: Phase) -> PersistentState {
        PersistentState {
            restart_reason,
            phase,
            start_time: self.start_time,
            deadline: self.deadline_epoch,
            ..Default::default()
        }
    }

    fn has_kernel_args(&self) -> bool {
        !self.request.kernel_command.is_empty()
    }
}

/// Owns every component the update flows need.
pub struct Orchestrator<R, P> {
    settings: Settings,
    fs: SafeFs,
    runner: R,
    probe: P,
    config: DeviceConfig,
    state: StateStore,
    status: StatusReporter,
    in_flight: Mutex<()>,
}

impl<R: CommandRunner, P: DiskProbe> Orchestrator<R, P> {
    pub fn new(settings: Settings, fs: SafeFs, runner: R, probe: P) -> Self {
        let paths = &settings.paths;
        let config = DeviceConfig::new(
            fs.clone(),
            paths.device_config.clone(),
            paths.config_schema.clone(),
        );
        let state = StateStore::new(fs.clone(), paths.state.clone());
        let status = StatusReporter::new(
            fs.clone(),
            paths.status_log.clone(),
            paths.granular_log.clone(),
        );
        Self {
            settings,
            fs,
            runner,
            probe,
            config,
            state,
            status,
            in_flight: Mutex::new(()),
        }
    }

    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    pub const fn runner(&self) -> &R {
        &self.runner
    }

    pub const fn state(&self) -> &StateStore {
        &self.state
    }

    pub const fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub const fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Run one system software update to completion.
    pub async fn update_system_software(&self, request: UpdateRequest) -> UpdateResponse {
        let Ok(_guard) = self.in_flight.try_lock() else {
            warn!("rejecting update request, another update is running");
            return UpdateResponse::internal(BUSY);
        };

        if let Err(e) = request.validate(self.settings.url_policy) {
            return UpdateResponse::bad_request(e);
        }
        let os = match distro::detect(&self.runner).await {
            Ok(os) => os,
            Err(e @ DistroError::Unsupported(_)) => return UpdateResponse::unsupported(e),
            Err(e) => return UpdateResponse::internal(e),
        };
        if let Err(e) = request.validate_for(os.family) {
            return UpdateResponse::bad_request(e);
        }

        let metadata = serde_json::to_string(&request).unwrap_or_default();
        if let Err(e) = self.status.begin(&metadata) {
            warn!(error = %e, "failed to write pending status");
        }

        let span = info_span!(
            "sota",
            run_id = %Uuid::new_v4(),
            mode = ?request.mode,
            family = %os.family,
        );
        async {
            let run = Run::new(&request, &os);
            let result = self.execute(&run).await;
            self.finish(&run, &metadata, result).await
        }
        .instrument(span)
        .await
    }

    async fn execute(&self, run: &Run<'_>) -> Result<Outcome, UpdateError> {
        let cfg = self.config.os_updater().await?;
        let kernel_args_only = run.has_kernel_args()
            && (run.os.family == OsFamily::Image || run.request.package_list.is_empty());
        if kernel_args_only {
            return self.kernel_args_update(run).await;
        }
        match run.os.family {
            OsFamily::Image => self.image_update(run, &cfg).await,
            OsFamily::Package => self.package_update(run, &cfg).await,
        }
    }

    async fn finish(
        &self,
        run: &Run<'_>,
        metadata: &str,
        result: Result<Outcome, UpdateError>,
    ) -> UpdateResponse {
        self.clean_artifacts();
        match result {
            Ok(Outcome::NoUpdate { version }) => {
                info!(version = %version, "no update available");
                if let Err(e) = self.status.no_update(metadata, &version) {
                    warn!(error = %e, "failed to write update status");
                }
                UpdateResponse::ok()
            }
            Ok(Outcome::Success {
                version,
                system_changed,
                kernel_args_changed,
            }) => {
                info!(version = %version, "update succeeded");
                if let Err(e) = self.status.success(metadata, &version) {
                    warn!(error = %e, "failed to write update status");
                }
                let plan = RebootPlan {
                    do_not_reboot: run.request.do_not_reboot,
                    family: run.os.family,
                    system_changed,
                    kernel_args_changed,
                };
                if plan.decide() {
                    if let Err(e) =
                        reboot::trigger(&self.runner, PowerState::Cycle, self.settings.reboot_delay)
                            .await
                    {
                        warn!(error = %e, "update applied but reboot failed");
                    }
                } else {
                    info!(?plan, "no reboot required");
                }
                UpdateResponse::ok()
            }
            Err(err) => {
                error!(error = %err, reason = %err.reason(), "update failed");
                if let Err(e) = self.status.fail(metadata, err.reason(), &err.to_string()) {
                    warn!(error = %e, "failed to write update status");
                }
                self.clear_state(run.os.family).await;
                UpdateResponse::internal(err)
            }
        }
    }

    fn clean_artifacts(&self) {
        if let Err(e) = self.fs.clear_dir(&self.settings.paths.artifact_dir) {
            warn!(error = %e, "failed to clean artifact directory");
        }
    }

    /// Drop the persistent record of a failed run.
    async fn clear_state(&self, family: OsFamily) {
        let result = match family {
            OsFamily::Image => match self.fs.exists(self.state.path()) {
                Ok(true) => self.state.truncate_to_zero(&self.runner).await,
                Ok(false) => Ok(()),
                Err(e) => Err(e.into()),
            },
            OsFamily::Package => self.state.remove(),
        };
        if let Err(e) = result {
            warn!(error = %e, "failed to clear state after failure");
        }
    }

    fn fetcher(&self) -> Result<Fetcher, FetchError> {
        let token = match self.fs.read_to_string(&self.settings.paths.token) {
            Ok(token) => Some(token.trim().to_string()).filter(|t| !t.is_empty()),
            Err(e) if e.is_not_found() => None,
            Err(e) => {
                warn!(error = %e, "access token unreadable, using anonymous access");
                None
            }
        };
        let custom_ca = std::env::var_os(CUSTOM_CA_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        Fetcher::new(
            &FetchConfig {
                token,
                custom_ca,
                system_proxy: self.settings.system_proxy,
            },
            &self.fs,
        )
    }

    fn ensure_trusted(url: &str, cfg: &OsUpdaterConfig) -> Result<(), UpdateError> {
        if trust::is_trusted(url, &cfg.trusted_repositories) {
            Ok(())
        } else {
            Err(UpdateError::Untrusted(url.to_string()))
        }
    }

    fn ensure_space(&self, mount: &std::path::Path, bytes: u64) -> Result<(), UpdateError> {
        let check = disk::check(&self.probe, mount, bytes)?;
        if check.enough() {
            Ok(())
        } else {
            Err(UpdateError::InsufficientStorage {
                required: check.required,
                free: check.free,
            })
        }
    }

    fn image_version(&self) -> Result<String, UpdateError> {
        distro::image_build_date(&self.fs, &self.settings.paths.image_id)
            .map_err(|e| UpdateError::Internal(e.to_string()))
    }

    async fn image_update(
        &self,
        run: &Run<'_>,
        cfg: &OsUpdaterConfig,
    ) -> Result<Outcome, UpdateError> {
        let request = run.request;
        if let Some(url) = request.url() {
            Self::ensure_trusted(url, cfg)?;
        }

        let current = self.image_version()?;
        if let Some(release) = request.release_date
            && let Some(built) = distro::build_date_as_date(&current)
            && release.date_naive() <= built
        {
            info!(release = %release, built = %current, "release is not newer than running image");
            return Ok(Outcome::NoUpdate { version: current });
        }
        run.checkpoint("trust")?;

        if request.mode.downloads() {
            let url = request
                .url()
                .ok_or_else(|| UpdateError::Internal("image download requires a URL".into()))?;
            let tool = self.settings.image_tool();
            let dir = &self.settings.paths.artifact_dir;
            let fetcher = self.fetcher()?;

            let probe = fetcher.size(url).await?;
            info!(url, size = probe.size, "artifact size probed");
            run.checkpoint("size")?;

            self.fs.mkdir_all(dir, 0o755)?;
            self.ensure_space(dir, probe.size)?;

            let file = fetcher.download(url, dir, &probe.auth, &self.fs).await?;
            run.checkpoint("download")?;

            fetch::verify_hash(&self.fs, &file, request.hash_algorithm, &request.signature)?;
            image::write_inactive(&self.runner, &tool, &file, &request.signature).await?;
            run.checkpoint("write")?;

            if request.mode == UpdateMode::DownloadOnly {
                return Ok(Outcome::Success {
                    version: current,
                    system_changed: false,
                    kernel_args_changed: false,
                });
            }
        }

        // OS-level snapshot is not applicable: the inactive slot is the
        // rollback target, so the snapshot marker is the running version.
        let mut record = run.record(RestartReason::Sota, Phase::Snapshotted);
        record.previous_version.clone_from(&current);
        self.state.store(&record)?;

        image::activate(&self.runner, &self.settings.image_tool()).await?;
        record.phase = Phase::Applied;
        self.state.store(&record)?;

        Ok(Outcome::Success {
            version: current,
            system_changed: true,
            kernel_args_changed: false,
        })
    }

    async fn package_update(
        &self,
        run: &Run<'_>,
        cfg: &OsUpdaterConfig,
    ) -> Result<Outcome, UpdateError> {
        let request = run.request;
        let plan = PackagePlan::new(request.mode, &request.package_list);
        let package_only = !request.package_list.is_empty();
        let apply_kernel_args = run.has_kernel_args() && request.mode.installs();

        for step in plan.index_steps() {
            package::run_step(&self.runner, &step).await?;
        }
        run.checkpoint("index")?;

        let dry = package::dry_run(&self.runner, &plan).await?;
        if dry.no_changes() && !apply_kernel_args {
            if !package_only {
                return Ok(Outcome::NoUpdate {
                    version: run.os.description.clone(),
                });
            }
            info!(packages = ?request.package_list, "requested packages already installed");
            let mut record = run.record(RestartReason::PackageInstallation, Phase::Applied);
            record.package_list = PersistentState::join_packages(&request.package_list);
            self.state.store(&record)?;
            return Ok(Outcome::Success {
                version: run.os.description.clone(),
                system_changed: false,
                kernel_args_changed: false,
            });
        }

        self.ensure_space(&self.settings.paths.root_mount, dry.additional_bytes)?;
        run.checkpoint("space")?;

        let stateful = request.mode.installs();
        let snapshot_id = if package_only || !stateful {
            0
        } else {
            self.take_snapshot(cfg).await?
        };

        let mut record = run.record(
            if package_only {
                RestartReason::PackageInstallation
            } else {
                RestartReason::Sota
            },
            Phase::Snapshotted,
        );
        record.snapshot_id = snapshot_id;
        record.package_list = PersistentState::join_packages(&request.package_list);
        if apply_kernel_args {
            record.kernel_args.clone_from(&request.kernel_command);
        }
        let applied = self
            .apply_packages(run, &plan, &mut record, stateful, apply_kernel_args)
            .await;
        if let Err(e) = applied {
            if snapshot_id > 0 {
                self.revert_snapshot(snapshot_id).await;
            }
            return Err(e);
        }

        Ok(Outcome::Success {
            version: run.os.description.clone(),
            system_changed: stateful && !package_only && !dry.no_changes(),
            kernel_args_changed: apply_kernel_args,
        })
    }

    /// Everything after the snapshot: record it, run the apt steps, then
    /// record the applied phase.
    async fn apply_packages(
        &self,
        run: &Run<'_>,
        plan: &PackagePlan,
        record: &mut PersistentState,
        stateful: bool,
        apply_kernel_args: bool,
    ) -> Result<(), UpdateError> {
        if stateful {
            self.state.store(record)?;
        }
        run.checkpoint("snapshot")?;

        for step in plan.preparation() {
            package::run_step(&self.runner, &step).await?;
            run.checkpoint("prepare")?;
        }
        package::run_step(&self.runner, &plan.main_command()).await?;

        if apply_kernel_args {
            self.apply_grub_kernel_args(&run.request.kernel_command).await?;
        }
        if stateful {
            record.phase = Phase::Applied;
            self.state.store(record)?;
        }
        Ok(())
    }

    /// Undo a failed apply and drop its snapshot. The state file is the
    /// only record of `id`, so this runs before the state is cleared.
    async fn revert_snapshot(&self, id: u64) {
        let snapper = Snapshotter::new(&self.runner, self.settings.snapshot_tool());
        if let Err(e) = snapper.undo_change(id).await {
            error!(snapshot_id = id, error = %e, "failed to revert changes after failed update");
            return;
        }
        if let Err(e) = snapper.delete(id).await {
            warn!(snapshot_id = id, error = %e, "failed to delete rollback snapshot");
        }
    }

    /// Snapshot the root filesystem, or proceed without one when allowed.
    async fn take_snapshot(&self, cfg: &OsUpdaterConfig) -> Result<u64, UpdateError> {
        let root = &self.settings.paths.root_mount;
        let result = match self.probe.is_btrfs(root) {
            Ok(true) => {
                Snapshotter::new(&self.runner, self.settings.snapshot_tool())
                    .create()
                    .await
            }
            Ok(false) => Err(SnapshotError::NotBtrfs),
            Err(e) => Err(SnapshotError::Probe(e.to_string())),
        };
        match result {
            Ok(id) => Ok(id),
            Err(e) if cfg.proceed_without_rollback => {
                warn!(error = %e, "continuing without a rollback snapshot");
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn apply_grub_kernel_args(&self, kernel_command: &str) -> Result<(), UpdateError> {
        kernel_args::write_grub_fragment(
            &self.fs,
            &self.settings.paths.grub_fragment,
            kernel_command,
        )?;
        kernel_args::refresh_grub(&self.runner).await
    }

    async fn kernel_args_update(&self, run: &Run<'_>) -> Result<Outcome, UpdateError> {
        let kernel_command = &run.request.kernel_command;
        let (reason, version) = match run.os.family {
            OsFamily::Image => {
                kernel_args::write_boot_entry(&self.fs, &self.settings.paths, kernel_command)?;
                (RestartReason::KernelArgs, self.image_version()?)
            }
            OsFamily::Package => {
                self.apply_grub_kernel_args(kernel_command).await?;
                (RestartReason::Sota, run.os.description.clone())
            }
        };
        run.checkpoint("kernel args")?;

        let mut record = run.record(reason, Phase::Applied);
        record.kernel_args.clone_from(kernel_command);
        self.state.store(&record)?;
        info!(kernel_command = %kernel_command, "kernel arguments updated");

        Ok(Outcome::Success {
            version,
            system_changed: false,
            kernel_args_changed: true,
        })
    }

    /// Reboot or power off after the usual flush delay.
    pub async fn set_power_state(&self, state: PowerState) -> UpdateResponse {
        match reboot::trigger(&self.runner, state, self.settings.reboot_delay).await {
            Ok(()) => UpdateResponse::ok(),
            Err(e) => {
                warn!(error = %e, ?state, "power state change failed");
                UpdateResponse::internal(e)
            }
        }
    }

    /// Verify the update recorded before the last reboot, if any.
    pub async fn verify_after_boot(&self) -> Result<Verification, UpdateError> {
        let _guard = self.in_flight.lock().await;
        Verifier::new(
            &self.runner,
            &self.settings,
            &self.fs,
            &self.state,
            &self.status,
        )
        .run()
        .await
    }

    /// Fetch a complete device configuration from a trusted source and
    /// install it.
    pub async fn load_config(
        &self,
        uri: &str,
        signature: &str,
        algorithm: HashAlgorithm,
    ) -> UpdateResponse {
        if let Err(e) = validate_url(uri, self.settings.url_policy) {
            return UpdateResponse::bad_request(e);
        }
        if !signature.is_empty() && hex::decode(signature).is_err() {
            return UpdateResponse::bad_request("signature must be a hex digest");
        }
        match self.install_config(uri, signature, algorithm).await {
            Ok(()) => UpdateResponse::ok(),
            Err(UpdateError::Config(e)) => config_response(&e),
            Err(e) => {
                warn!(error = %e, uri, "configuration load failed");
                UpdateResponse::internal(e)
            }
        }
    }

    async fn install_config(
        &self,
        uri: &str,
        signature: &str,
        algorithm: HashAlgorithm,
    ) -> Result<(), UpdateError> {
        let cfg = self.config.os_updater().await?;
        Self::ensure_trusted(uri, &cfg)?;
        let bytes = self.fetcher()?.fetch_bytes(uri).await?;
        if !signature.is_empty() {
            let actual = fetch::digest_hex(algorithm, &bytes);
            let expected = signature.trim().to_ascii_lowercase();
            if actual != expected {
                return Err(FetchError::HashMismatch { expected, actual }.into());
            }
        }
        self.config.replace(&bytes).await?;
        Ok(())
    }

    pub async fn get_config(&self, path: &str) -> UpdateResponse {
        match self.config.get(path).await {
            Ok(value) => UpdateResponse::with_value(value),
            Err(e) => config_response(&e),
        }
    }

    pub async fn set_config(&self, entry: &str) -> UpdateResponse {
        unit_response(self.config.set(entry).await)
    }

    pub async fn append_config(&self, entry: &str) -> UpdateResponse {
        unit_response(self.config.append(entry).await)
    }

    pub async fn remove_config(&self, entry: &str) -> UpdateResponse {
        unit_response(self.config.remove(entry).await)
    }
}

fn unit_response(result: Result<(), ConfigError>) -> UpdateResponse {
    match result {
        Ok(()) => UpdateResponse::ok(),
        Err(e) => config_response(&e),
    }
}

/// Caller mistakes are 400; storage and schema problems are 500.
fn config_response(err: &ConfigError) -> UpdateResponse {
    match err {
        ConfigError::Fs(_) | ConfigError::Schema(_) => UpdateResponse::internal(err),
        _ => UpdateResponse::bad_request(err),
    }
}
