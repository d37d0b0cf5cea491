//! Archive packing and extraction for staged releases and data backups.

mod path;
mod tar_gz;
mod zip_ops;

use std::fs;
use std::io;
use std::path::Path;

use crate::error::{AppError, Result};

pub(crate) use zip_ops::{extract_zip_exact, pack_dir_to_zip};

/// Archive formats accepted as dependency sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
}

impl ArchiveKind {
    /// Guess the format from a file name or URL.
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else {
            None
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Zip => "zip",
            Self::TarGz => "tar.gz",
        }
    }
}

/// Extract a release archive into `dest_dir`.
///
/// Upstream release archives often wrap everything in `<release>-<version>/`. A single
/// top-level folder is dropped only when its name starts with `release`, so a runtime
/// shipped as `bin/php` keeps its `bin/` directory.
pub(crate) fn extract_release(
    kind: ArchiveKind,
    archive_path: &Path,
    dest_dir: &Path,
    release: &str,
) -> Result<()> {
    match kind {
        ArchiveKind::Zip => zip_ops::extract_zip_flat(archive_path, dest_dir, release),
        ArchiveKind::TarGz => tar_gz::extract_tar_gz_flat(archive_path, dest_dir, release),
    }
}

#[cfg(unix)]
fn set_unix_permissions(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;

    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| AppError::io(format!("failed to set permissions on {path:?}: {e}")))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn set_unix_permissions(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

/// Write one archive entry, creating parents and checking the declared size.
fn write_entry<R>(
    out_path: &Path,
    is_dir: bool,
    reader: &mut R,
    unix_mode: Option<u32>,
    declared_size: Option<u64>,
) -> Result<()>
where
    R: io::Read,
{
    if is_dir {
        fs::create_dir_all(out_path)
            .map_err(|e| AppError::io(format!("failed to create directory {out_path:?}: {e}")))?;
        return Ok(());
    }

    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| AppError::io(format!("failed to create directory {parent:?}: {e}")))?;
    }

    let mut outfile = fs::File::create(out_path)
        .map_err(|e| AppError::io(format!("failed to create {out_path:?}: {e}")))?;
    let written = io::copy(reader, &mut outfile)
        .map_err(|e| AppError::io(format!("failed to write {out_path:?}: {e}")))?;
    if let Some(expected) = declared_size {
        if written != expected {
            return Err(AppError::io(format!(
                "archive entry {out_path:?} is truncated: expected {expected} bytes, wrote {written}",
            )));
        }
    }
    set_unix_permissions(out_path, unix_mode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_kinds() {
        assert_eq!(ArchiveKind::detect("php-8.3.zip"), Some(ArchiveKind::Zip));
        assert_eq!(
            ArchiveKind::detect("https://example.org/php.TAR.GZ"),
            Some(ArchiveKind::TarGz)
        );
        assert_eq!(ArchiveKind::detect("release.tgz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::detect("release.rar"), None);
    }
}
