//! Exclusive lock on the data root shared by every launcher process.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt as _;

use crate::error::{AppError, Result};

/// Held for as long as a process may touch servers, data directories or settings.
/// The OS releases the lock when the file handle is dropped or the process dies.
#[derive(Debug)]
pub struct DataRootLock {
    _file: File,
    path: PathBuf,
}

impl DataRootLock {
    /// Take the lock without waiting. A lock held elsewhere is `OperationInProgress`.
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(|e| AppError::io(format!("Failed to open {}: {e}", path.display())))?;

        if let Err(e) = file.try_lock_exclusive() {
            log::debug!("{} is locked: {}", path.display(), e);
            return Err(AppError::operation_in_progress(
                path.parent().unwrap_or(path),
            ));
        }
        log::debug!("Locked {}", path.display());
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn second_holder_is_rejected_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grocy-desktop.lock");

        let held = DataRootLock::acquire(&path).unwrap();
        let err = DataRootLock::acquire(&path).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationInProgress);
        assert_eq!(
            err.payload().get("data_dir").map(String::as_str),
            Some(dir.path().to_string_lossy().as_ref())
        );

        drop(held);
        let again = DataRootLock::acquire(&path).unwrap();
        assert_eq!(again.path(), path);
    }

    #[test]
    fn missing_parent_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = DataRootLock::acquire(&dir.path().join("absent").join("x.lock")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
    }
}
