//! Persisting extra kernel command-line arguments.
//!
//! Package family: a grub drop-in followed by `update-grub`.
//! Image family: a boot-loader entry pointing at the first unified kernel
//! image, plus `loader.conf` selecting it when no default exists yet.

use std::path::Path;

use tracing::info;

use inbd_core::exec::UPDATE_GRUB;
use inbd_core::{CommandRunner, Invocation, SafeFs};

use crate::config::Paths;
use crate::error::UpdateError;

const CONF_MODE: u32 = 0o644;
const ENTRY_TITLE: &str = "Edge Microvisor Toolkit (user kernel parameters)";

/// Grub drop-in body. No trailing newline.
pub fn grub_fragment(kernel_command: &str) -> String {
    format!("GRUB_CMDLINE_LINUX_DEFAULT=\"{kernel_command}\"")
}

/// Write the grub drop-in (package family).
pub fn write_grub_fragment(fs: &SafeFs, path: &Path, kernel_command: &str) -> Result<(), UpdateError> {
    if let Some(dir) = path.parent() {
        fs.mkdir_all(dir, 0o755)?;
    }
    fs.write(path, grub_fragment(kernel_command).as_bytes(), CONF_MODE)?;
    info!(path = %path.display(), "grub kernel arguments written");
    Ok(())
}

/// Regenerate the grub configuration.
pub async fn refresh_grub<R: CommandRunner>(runner: &R) -> Result<(), UpdateError> {
    runner
        .run(&Invocation::new([UPDATE_GRUB]))
        .await
        .and_then(|out| out.check("update-grub"))
        .map_err(|e| UpdateError::Bootloader(e.to_string()))?;
    Ok(())
}

/// Build a fresh boot entry.
///
/// The last line preserves the original command line so later edits can
/// rebuild `options` without stacking arguments.
pub fn new_boot_entry(kernel_image: &str, original: &str, kernel_command: &str) -> String {
    format!(
        "title {ENTRY_TITLE}\nlinux /EFI/Linux/{kernel_image}\noptions {}\n# {original}\n",
        options_line(original, kernel_command)
    )
}

fn options_line(original: &str, kernel_command: &str) -> String {
    format!("{original} {kernel_command}").trim().to_string()
}

/// Original command line preserved in an existing entry.
fn preserved_original(entry: &str) -> Option<&str> {
    entry
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix("# "))
        .map(str::trim)
}

/// Replace only the `options` line of an existing entry.
pub fn rewrite_boot_entry(entry: &str, original: &str, kernel_command: &str) -> String {
    let options = format!("options {}", options_line(original, kernel_command));
    let mut replaced = false;
    let mut lines: Vec<String> = entry
        .lines()
        .map(|line| {
            if line.starts_with("options ") || line == "options" {
                replaced = true;
                options.clone()
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(options);
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// First `.efi` image (sorted by name) in the unified kernel directory.
fn first_kernel_image(fs: &SafeFs, dir: &Path) -> Result<String, UpdateError> {
    fs.list_dir(dir)?
        .into_iter()
        .filter(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case("efi")))
        .find_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .ok_or_else(|| {
            UpdateError::Bootloader(format!("no kernel image found in {}", dir.display()))
        })
}

/// Write or update the boot entry and make sure `loader.conf` exists
/// (image family).
pub fn write_boot_entry(fs: &SafeFs, paths: &Paths, kernel_command: &str) -> Result<(), UpdateError> {
    let existing = match fs.read_to_string(&paths.boot_entry) {
        Ok(text) => Some(text),
        Err(e) if e.is_not_found() => None,
        Err(e) => return Err(e.into()),
    };

    let body = match existing.as_deref().map(|text| (text, preserved_original(text))) {
        Some((text, Some(original))) => rewrite_boot_entry(text, original, kernel_command),
        _ => {
            let original = fs.read_to_string(&paths.proc_cmdline)?;
            let image = first_kernel_image(fs, &paths.efi_linux_dir)?;
            new_boot_entry(&image, original.trim(), kernel_command)
        }
    };

    if let Some(dir) = paths.boot_entry.parent() {
        fs.mkdir_all(dir, 0o755)?;
    }
    fs.write(&paths.boot_entry, body.as_bytes(), CONF_MODE)?;
    info!(path = %paths.boot_entry.display(), "boot entry written");

    if !fs.exists(&paths.loader_conf)? {
        let name = paths
            .boot_entry
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        fs.write(&paths.loader_conf, format!("default {name}\n").as_bytes(), CONF_MODE)?;
        info!(path = %paths.loader_conf.display(), "loader default set");
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sandbox() -> (tempfile::TempDir, Paths) {
        let dir = tempfile::Builder::new()
            .prefix("inbd-kargs-")
            .tempdir_in("/tmp")
            .unwrap();
        let paths = Paths::under(dir.path());
        std::fs::create_dir_all(&paths.efi_linux_dir).unwrap();
        std::fs::create_dir_all(paths.proc_cmdline.parent().unwrap()).unwrap();
        std::fs::write(&paths.proc_cmdline, "root=/dev/sda2 ro quiet\n").unwrap();
        std::fs::write(paths.efi_linux_dir.join("linux-b.efi"), b"").unwrap();
        std::fs::write(paths.efi_linux_dir.join("linux-a.efi"), b"").unwrap();
        (dir, paths)
    }

    #[test]
    fn grub_fragment_is_single_line() {
        assert_eq!(
            grub_fragment("intel_iommu=on"),
            "GRUB_CMDLINE_LINUX_DEFAULT=\"intel_iommu=on\""
        );
    }

    #[test]
    fn grub_fragment_is_written() {
        let (_dir, paths) = sandbox();
        write_grub_fragment(&SafeFs::default(), &paths.grub_fragment, "a=1").unwrap();
        assert_eq!(
            std::fs::read_to_string(&paths.grub_fragment).unwrap(),
            "GRUB_CMDLINE_LINUX_DEFAULT=\"a=1\""
        );
    }

    #[test]
    fn fresh_boot_entry_and_loader_conf() {
        let (_dir, paths) = sandbox();
        write_boot_entry(&SafeFs::default(), &paths, "intel_iommu=on").unwrap();
        let entry = std::fs::read_to_string(&paths.boot_entry).unwrap();
        let lines: Vec<&str> = entry.lines().collect();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].starts_with("title "));
        assert_eq!(lines[1], "linux /EFI/Linux/linux-a.efi");
        assert_eq!(lines[2], "options root=/dev/sda2 ro quiet intel_iommu=on");
        assert_eq!(lines[3], "# root=/dev/sda2 ro quiet");
        assert_eq!(
            std::fs::read_to_string(&paths.loader_conf).unwrap(),
            "default inbd_user_kernel_param.conf\n"
        );
    }

    #[test]
    fn rewriting_does_not_stack_arguments() {
        let (_dir, paths) = sandbox();
        let fs = SafeFs::default();
        write_boot_entry(&fs, &paths, "a=1").unwrap();
        std::fs::write(&paths.proc_cmdline, "root=/dev/sda2 ro quiet a=1\n").unwrap();
        write_boot_entry(&fs, &paths, "b=2").unwrap();
        let entry = std::fs::read_to_string(&paths.boot_entry).unwrap();
        assert!(entry.contains("\noptions root=/dev/sda2 ro quiet b=2\n"));
        assert!(!entry.contains("a=1"));
    }

    #[test]
    fn existing_loader_conf_is_kept() {
        let (_dir, paths) = sandbox();
        std::fs::create_dir_all(paths.loader_conf.parent().unwrap()).unwrap();
        std::fs::write(&paths.loader_conf, "default other.conf\n").unwrap();
        write_boot_entry(&SafeFs::default(), &paths, "a=1").unwrap();
        assert_eq!(
            std::fs::read_to_string(&paths.loader_conf).unwrap(),
            "default other.conf\n"
        );
    }

    #[test]
    fn missing_kernel_image_is_a_bootloader_error() {
        let (_dir, paths) = sandbox();
        for f in std::fs::read_dir(&paths.efi_linux_dir).unwrap() {
            std::fs::remove_file(f.unwrap().path()).unwrap();
        }
        assert!(matches!(
            write_boot_entry(&SafeFs::default(), &paths, "a=1"),
            Err(UpdateError::Bootloader(_))
        ));
    }
}
