//! Backup-protected, atomic configuration writes
//!
//! Every managed file is written to a temporary file in the destination
//! directory and renamed over the target, so nginx only ever sees the old
//! file or the new one. Whole-config writes additionally keep the previous
//! file as `<path>.prev` and restore it if the write fails.

use crate::error::{Error, Result};
use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{error, info, warn};

const BACKUP_SUFFIX: &str = ".prev";

/// `<path>.prev`
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Write `content` to `path` via a temp file and an atomic rename
///
/// The temp file lives next to `path` so the rename never crosses
/// filesystems. An existing file's permissions are carried over.
pub fn atomic_write(path: &Path, content: &str) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;

    match std::fs::metadata(path) {
        Ok(meta) => tmp.as_file().set_permissions(meta.permissions())?,
        #[cfg(unix)]
        Err(_) => {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o644))?;
        }
        #[cfg(not(unix))]
        Err(_) => {}
    }

    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Writes whole configuration files, keeping the previous version as a backup
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigWriter;

impl ConfigWriter {
    pub fn new() -> Self {
        Self
    }

    /// Replace `path` with `content`
    ///
    /// A failed backup is logged and does not stop the write. A failed write
    /// restores the backup, when one was taken, and returns
    /// [`Error::ConfigWrite`].
    pub fn write_config(&self, path: &Path, content: &str) -> Result<()> {
        self.write_config_with(path, content, atomic_write)
    }

    pub(crate) fn write_config_with<F>(&self, path: &Path, content: &str, write: F) -> Result<()>
    where
        F: FnOnce(&Path, &str) -> io::Result<()>,
    {
        let backup = backup_path(path);
        let has_backup = path.is_file() && self.take_backup(path, &backup);

        info!(path = %path.display(), "Writing new config");
        let err = match write(path, content) {
            Ok(()) => {
                info!(path = %path.display(), bytes = content.len(), "Config written");
                return Ok(());
            }
            Err(e) => e,
        };

        error!(path = %path.display(), error = %err, "Error writing new config");
        let message = if has_backup {
            warn!(backup = %backup.display(), "Attempting to restore previous config");
            let restored =
                std::fs::read_to_string(&backup).and_then(|previous| atomic_write(path, &previous));
            match restored {
                Ok(()) => {
                    info!(path = %path.display(), "Previous config restored");
                    format!("{}; previous config restored", err)
                }
                Err(restore_err) => {
                    error!(
                        path = %path.display(),
                        error = %restore_err,
                        "Could not restore previous config"
                    );
                    format!(
                        "{}; restoring {} also failed: {}",
                        err,
                        backup.display(),
                        restore_err
                    )
                }
            }
        } else {
            err.to_string()
        };

        Err(Error::ConfigWrite {
            target: file_label(path),
            path: path.to_path_buf(),
            message,
        })
    }

    fn take_backup(&self, path: &Path, backup: &Path) -> bool {
        info!(backup = %backup.display(), "Saving copy of previous config");
        match std::fs::copy(path, backup) {
            Ok(_) => true,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "Could not create backup of config; continuing without one"
                );
                false
            }
        }
    }
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
