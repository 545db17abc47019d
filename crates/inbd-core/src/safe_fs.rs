//! Allowlisted, symlink-safe filesystem access.
//!
//! Every path the orchestrator touches is checked here before any I/O:
//!
//! 1. it must be absolute, free of `..` components, and lie under one of the
//!    allowlisted roots;
//! 2. no existing component of the path may be a symlink (checked with
//!    `lstat` from the root down), and after opening, the real path of the
//!    file descriptor (read back through `/proc/self/fd`) must equal the
//!    requested path;
//! 3. an opened handle must be a regular file.
//!
//! Paths under the DMI roots are exempt from the symlink rules because the
//! kernel exposes them through symlinked sysfs directories.
//!
//! Writes go to a sibling temp file which is fsynced and renamed over the
//! destination, so readers observe either the old or the new content. The
//! containing directory is fsynced after the rename.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Component, Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

/// Roots the orchestrator may read or write under.
pub const DEFAULT_ROOTS: &[&str] = &[
    "/etc",
    "/tmp",
    "/usr/share",
    "/usr/bin",
    "/usr/sbin",
    "/opt",
    "/var/cache/manageability",
    "/var/intel-manageability",
    "/var/log",
    "/sys/class/dmi/id/",
    "/sys/devices/virtual/dmi/id/",
    "/proc",
    "/boot/efi",
];

/// Roots whose traversal may include symlinks.
pub const SYMLINK_ROOTS: &[&str] = &["/sys/class/dmi/id/", "/sys/devices/virtual/dmi/id/"];

/// Filesystem access errors.
#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(PathBuf),

    #[error("path contains parent or relative components: {0}")]
    NotNormalized(PathBuf),

    #[error("path is outside the allowed roots: {0}")]
    NotAllowed(PathBuf),

    #[error("path traverses a symlink: {0}")]
    Symlink(PathBuf),

    #[error("opened path {requested} resolved to {actual}")]
    PathMismatch { requested: PathBuf, actual: PathBuf },

    #[error("not a regular file: {0}")]
    NotRegularFile(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// How [`SafeFs::open`] should open a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    /// Create if missing, truncate if present.
    Truncate,
    /// Create if missing, append if present.
    Append,
}

/// Policy object for allowlisted file access.
#[derive(Debug, Clone)]
pub struct SafeFs {
    roots: Vec<PathBuf>,
    symlink_roots: Vec<PathBuf>,
}

impl Default for SafeFs {
    fn default() -> Self {
        Self::new(
            DEFAULT_ROOTS.iter().map(PathBuf::from),
            SYMLINK_ROOTS.iter().map(PathBuf::from),
        )
    }
}

impl SafeFs {
    pub fn new(
        roots: impl IntoIterator<Item = PathBuf>,
        symlink_roots: impl IntoIterator<Item = PathBuf>,
    ) -> Self {
        Self {
            roots: roots.into_iter().collect(),
            symlink_roots: symlink_roots.into_iter().collect(),
        }
    }

    /// Validate `path` against the allowlist without touching the disk.
    fn check_lexical(&self, path: &Path) -> Result<(), FsError> {
        if !path.is_absolute() {
            return Err(FsError::NotAbsolute(path.to_path_buf()));
        }
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::CurDir))
        {
            return Err(FsError::NotNormalized(path.to_path_buf()));
        }
        if self.roots.iter().any(|root| path.starts_with(root)) {
            Ok(())
        } else {
            Err(FsError::NotAllowed(path.to_path_buf()))
        }
    }

    fn allows_symlinks(&self, path: &Path) -> bool {
        self.symlink_roots.iter().any(|root| path.starts_with(root))
    }

    /// `lstat` every existing prefix of `path`; fail on the first symlink.
    fn check_no_symlinks(&self, path: &Path) -> Result<(), FsError> {
        if self.allows_symlinks(path) {
            return Ok(());
        }
        let mut prefix = PathBuf::new();
        for component in path.components() {
            prefix.push(component);
            match fs::symlink_metadata(&prefix) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    return Err(FsError::Symlink(prefix));
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(FsError::io(&prefix, e)),
            }
        }
        Ok(())
    }

    /// Full pre-open validation of a path.
    pub fn validate(&self, path: &Path) -> Result<(), FsError> {
        self.check_lexical(path)?;
        self.check_no_symlinks(path)
    }

    /// Post-open validation: the descriptor must still name `path` and be a
    /// regular file.
    fn check_handle(&self, file: &File, path: &Path) -> Result<(), FsError> {
        if !self.allows_symlinks(path) {
            let fd_link = PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd()));
            let actual = fs::read_link(&fd_link).map_err(|e| FsError::io(path, e))?;
            if actual != path {
                return Err(FsError::PathMismatch {
                    requested: path.to_path_buf(),
                    actual,
                });
            }
        }
        let meta = file.metadata().map_err(|e| FsError::io(path, e))?;
        if !meta.file_type().is_file() {
            return Err(FsError::NotRegularFile(path.to_path_buf()));
        }
        Ok(())
    }

    /// Open `path` after validating it; `mode` applies when creating.
    pub fn open(&self, path: &Path, how: OpenMode, mode: u32) -> Result<File, FsError> {
        self.validate(path)?;
        let mut options = OpenOptions::new();
        match how {
            OpenMode::Read => {
                options.read(true);
            }
            OpenMode::Truncate => {
                options.write(true).create(true).truncate(true).mode(mode);
            }
            OpenMode::Append => {
                options.append(true).create(true).mode(mode);
            }
        }
        if !self.allows_symlinks(path) {
            options.custom_flags(libc::O_NOFOLLOW);
        }
        let file = options.open(path).map_err(|e| FsError::io(path, e))?;
        self.check_handle(&file, path)?;
        Ok(file)
    }

    /// Read the whole file at `path`.
    pub fn read(&self, path: &Path) -> Result<Vec<u8>, FsError> {
        let mut file = self.open(path, OpenMode::Read, 0)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)
            .map_err(|e| FsError::io(path, e))?;
        Ok(buf)
    }

    /// Read the whole file at `path` as UTF-8 (lossy).
    pub fn read_to_string(&self, path: &Path) -> Result<String, FsError> {
        self.read(path)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Whether `path` exists (without following a final symlink).
    pub fn exists(&self, path: &Path) -> Result<bool, FsError> {
        self.check_lexical(path)?;
        match fs::symlink_metadata(path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FsError::io(path, e)),
        }
    }

    /// Size in bytes of the regular file at `path`.
    pub fn size(&self, path: &Path) -> Result<u64, FsError> {
        let file = self.open(path, OpenMode::Read, 0)?;
        file.metadata()
            .map(|m| m.len())
            .map_err(|e| FsError::io(path, e))
    }

    /// Atomically replace `path` with `contents`.
    pub fn write(&self, path: &Path, contents: &[u8], mode: u32) -> Result<(), FsError> {
        self.validate(path)?;
        let dir = path
            .parent()
            .ok_or_else(|| FsError::NotAllowed(path.to_path_buf()))?;
        let name = path
            .file_name()
            .map(|n| format!(".{}.", n.to_string_lossy()))
            .unwrap_or_default();
        let mut tmp = self.create_temp(dir, &name)?;
        tmp.write_all(contents)
            .map_err(|e| FsError::io(path, e))?;
        tmp.as_file()
            .set_permissions(fs::Permissions::from_mode(mode))
            .map_err(|e| FsError::io(path, e))?;
        self.persist(tmp, path)?;
        debug!(path = %path.display(), bytes = contents.len(), "file replaced");
        Ok(())
    }

    /// Fsync a temp file from [`SafeFs::create_temp`] and rename it to `path`.
    pub fn persist(&self, tmp: NamedTempFile, path: &Path) -> Result<(), FsError> {
        self.validate(path)?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| FsError::io(path, e))?;
        // On failure the temp file is removed when `PersistError` drops it.
        tmp.persist(path).map_err(|e| FsError::io(path, e.error))?;
        self.sync_parent(path)
    }

    /// Fsync the directory holding `path` so a completed rename survives
    /// power loss.
    fn sync_parent(&self, path: &Path) -> Result<(), FsError> {
        let dir = path
            .parent()
            .ok_or_else(|| FsError::NotAllowed(path.to_path_buf()))?;
        self.validate(dir)?;
        let mut options = OpenOptions::new();
        options
            .read(true)
            .custom_flags(libc::O_DIRECTORY | libc::O_NOFOLLOW);
        options
            .open(dir)
            .and_then(|handle| handle.sync_all())
            .map_err(|e| FsError::io(dir, e))
    }

    /// Create a temp file in `dir` whose name starts with `prefix`.
    ///
    /// The file is deleted when the handle drops unless it is persisted.
    pub fn create_temp(&self, dir: &Path, prefix: &str) -> Result<NamedTempFile, FsError> {
        self.validate(dir)?;
        let tmp = tempfile::Builder::new()
            .prefix(prefix)
            .tempfile_in(dir)
            .map_err(|e| FsError::io(dir, e))?;
        self.check_handle(tmp.as_file(), tmp.path())?;
        Ok(tmp)
    }

    /// Create `path` and any missing parents with permissions `mode`.
    pub fn mkdir_all(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        self.validate(path)?;
        fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(path)
            .map_err(|e| FsError::io(path, e))?;
        // Re-check now that every component exists.
        self.check_no_symlinks(path)
    }

    /// Remove the file at `path`. A missing file is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), FsError> {
        self.validate(path)?;
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::io(path, e)),
        }
    }

    /// Remove every regular file directly inside `dir`.
    pub fn clear_dir(&self, dir: &Path) -> Result<(), FsError> {
        for entry in self.list_dir(dir)? {
            self.remove(&entry)?;
        }
        Ok(())
    }

    /// Regular files directly inside `dir`, sorted by name.
    pub fn list_dir(&self, dir: &Path) -> Result<Vec<PathBuf>, FsError> {
        self.validate(dir)?;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(FsError::io(dir, e)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| FsError::io(dir, e))?;
            let file_type = entry.file_type().map_err(|e| FsError::io(dir, e))?;
            if file_type.is_file() {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}
