//! Daemon settings and well-known paths.

use std::path::{Path, PathBuf};
use std::time::Duration;

use inbd_core::exec::{IMAGE_TOOL, SNAPSHOT_TOOL};

use crate::request::UrlPolicy;

/// Name used in agent-specific file names.
pub const AGENT_NAME: &str = "inbd";

/// Environment variable naming an extra CA bundle for artifact servers.
pub const CUSTOM_CA_ENV: &str = "INBM_CUSTOM_CA_FILE";

/// Default delay before a reboot or shutdown, giving logs time to flush.
pub const DEFAULT_REBOOT_DELAY: Duration = Duration::from_secs(2);

/// Every file and directory the orchestrator reads or writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// JSON device configuration.
    pub device_config: PathBuf,
    /// JSON schema the device configuration must satisfy.
    pub config_schema: PathBuf,
    /// Persistent state crossing reboots.
    pub state: PathBuf,
    /// Single-object update status log.
    pub status_log: PathBuf,
    /// Granular per-step update log.
    pub granular_log: PathBuf,
    /// Download directory for artifacts.
    pub artifact_dir: PathBuf,
    /// Image build identification (image family).
    pub image_id: PathBuf,
    /// Kernel-args fragment for grub (package family).
    pub grub_fragment: PathBuf,
    /// Boot-loader entry carrying kernel args (image family).
    pub boot_entry: PathBuf,
    /// Boot-loader default configuration.
    pub loader_conf: PathBuf,
    /// Directory holding unified kernel images.
    pub efi_linux_dir: PathBuf,
    /// Running kernel command line.
    pub proc_cmdline: PathBuf,
    /// Bearer token for artifact servers.
    pub token: PathBuf,
    /// Mount used for the root filesystem checks (btrfs, free space).
    pub root_mount: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::under(Path::new("/"))
    }
}

impl Paths {
    /// All well-known paths relocated beneath `root`.
    ///
    /// `Paths::under("/")` yields the production layout.
    pub fn under(root: &Path) -> Self {
        let at = |p: &str| root.join(p);
        Self {
            device_config: at("etc/intel_manageability.conf"),
            config_schema: at("usr/share/inbd_schema.json"),
            state: at("var/intel-manageability/inbd_state"),
            status_log: at("var/log/inbm-update-status.log"),
            granular_log: at("var/log/inbm-update-log.log"),
            artifact_dir: at("var/cache/manageability/repository-tool/sota"),
            image_id: at("etc/image-id"),
            grub_fragment: at(&format!("etc/default/grub.d/90-{AGENT_NAME}.cfg")),
            boot_entry: at(&format!(
                "boot/efi/loader/entries/{AGENT_NAME}_user_kernel_param.conf"
            )),
            loader_conf: at("boot/efi/loader/loader.conf"),
            efi_linux_dir: at("boot/efi/EFI/Linux"),
            proc_cmdline: at("proc/cmdline"),
            token: at("etc/intel_edge_node/tokens/release-service/access_token"),
            root_mount: root.to_path_buf(),
        }
    }
}

/// Runtime settings for the orchestrator.
#[derive(Debug, Clone)]
pub struct Settings {
    pub paths: Paths,
    /// Image-update tool (image family).
    pub image_tool: PathBuf,
    /// Filesystem snapshot tool (package family).
    pub snapshot_tool: PathBuf,
    /// Pause before reboot/shutdown.
    pub reboot_delay: Duration,
    /// Honour `HTTP(S)_PROXY` from the environment when fetching.
    pub system_proxy: bool,
    /// Schemes accepted in update and configuration URLs.
    pub url_policy: UrlPolicy,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            paths: Paths::default(),
            image_tool: PathBuf::from(IMAGE_TOOL),
            snapshot_tool: PathBuf::from(SNAPSHOT_TOOL),
            reboot_delay: DEFAULT_REBOOT_DELAY,
            system_proxy: true,
            url_policy: UrlPolicy::HttpsOnly,
        }
    }
}

impl Settings {
    /// Settings with every path relocated under `root`.
    pub fn under(root: &Path) -> Self {
        Self {
            paths: Paths::under(root),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_image_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.image_tool = tool.into();
        self
    }

    #[must_use]
    pub fn with_snapshot_tool(mut self, tool: impl Into<PathBuf>) -> Self {
        self.snapshot_tool = tool.into();
        self
    }

    #[must_use]
    pub const fn with_reboot_delay(mut self, delay: Duration) -> Self {
        self.reboot_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_system_proxy(mut self, enabled: bool) -> Self {
        self.system_proxy = enabled;
        self
    }

    #[must_use]
    pub const fn with_url_policy(mut self, policy: UrlPolicy) -> Self {
        self.url_policy = policy;
        self
    }

    pub fn image_tool(&self) -> String {
        self.image_tool.to_string_lossy().into_owned()
    }

    pub fn snapshot_tool(&self) -> String {
        self.snapshot_tool.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_paths_match_host_layout() {
        let paths = Paths::default();
        assert_eq!(paths.state, PathBuf::from("/var/intel-manageability/inbd_state"));
        assert_eq!(paths.status_log, PathBuf::from("/var/log/inbm-update-status.log"));
        assert_eq!(paths.grub_fragment, PathBuf::from("/etc/default/grub.d/90-inbd.cfg"));
        assert_eq!(
            paths.boot_entry,
            PathBuf::from("/boot/efi/loader/entries/inbd_user_kernel_param.conf")
        );
        assert_eq!(paths.root_mount, PathBuf::from("/"));
    }

    #[test]
    fn relocated_paths_stay_under_root() {
        let paths = Paths::under(Path::new("/tmp/sandbox"));
        assert_eq!(paths.image_id, PathBuf::from("/tmp/sandbox/etc/image-id"));
        assert!(paths.artifact_dir.starts_with("/tmp/sandbox"));
    }

    #[test]
    fn builder_overrides_tools() {
        let s = Settings::default()
            .with_image_tool("/opt/tool")
            .with_reboot_delay(Duration::ZERO);
        assert_eq!(s.image_tool(), "/opt/tool");
        assert_eq!(s.snapshot_tool(), SNAPSHOT_TOOL);
        assert_eq!(s.reboot_delay, Duration::ZERO);
        assert_eq!(s.url_policy, UrlPolicy::HttpsOnly);
        let s = s.with_url_policy(UrlPolicy::AllowPlainHttp);
        assert_eq!(s.url_policy, UrlPolicy::AllowPlainHttp);
    }
}
