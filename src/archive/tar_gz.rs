use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

use super::path::{detect_release_wrapper, parse_entry_rel_path, resolve_within_dir, strip_top_dir};
use super::write_entry;

fn open_archive(archive_path: &Path) -> Result<tar::Archive<flate2::read::GzDecoder<fs::File>>> {
    let file = fs::File::open(archive_path)
        .map_err(|e| AppError::io(format!("failed to open {archive_path:?}: {e}")))?;
    Ok(tar::Archive::new(flate2::read::GzDecoder::new(file)))
}

/// Entry names with a trailing slash for directories, as zip reports them.
fn entry_names(archive_path: &Path) -> Result<Vec<String>> {
    let mut archive = open_archive(archive_path)?;
    let mut names = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let path = entry.path()?;
        let mut name = path.to_string_lossy().into_owned();
        if entry.header().entry_type().is_dir() && !name.ends_with('/') {
            name.push('/');
        }
        names.push(name);
    }
    Ok(names)
}

/// Symlinks are created after every regular entry so their targets can be validated.
struct PendingSymlink {
    link: PathBuf,
    target: PathBuf,
}

#[cfg(unix)]
fn create_symlinks(pending: Vec<PendingSymlink>) -> Result<()> {
    for item in pending {
        if let Some(parent) = item.link.parent() {
            fs::create_dir_all(parent).map_err(|e| AppError::io(e.to_string()))?;
        }
        std::os::unix::fs::symlink(&item.target, &item.link).map_err(|e| {
            AppError::io(format!("failed to create symlink {:?}: {e}", item.link))
        })?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn create_symlinks(pending: Vec<PendingSymlink>) -> Result<()> {
    for item in pending {
        let source = item
            .link
            .parent()
            .map(|parent| parent.join(&item.target))
            .ok_or_else(|| AppError::io("symlink entry has no parent directory"))?;
        if source.is_file() {
            fs::copy(&source, &item.link).map_err(|e| {
                AppError::io(format!("failed to copy {source:?} to {:?}: {e}", item.link))
            })?;
        } else {
            log::warn!("Skipping symlink {:?} with non-file target", item.link);
        }
    }
    Ok(())
}

/// Extract a tar.gz archive, stripping a top-level folder named after `release`.
pub(super) fn extract_tar_gz_flat(archive_path: &Path, dest_dir: &Path, release: &str) -> Result<()> {
    let names = entry_names(archive_path)?;
    let top_dir = detect_release_wrapper(names.iter().map(String::as_str), release);

    fs::create_dir_all(dest_dir).map_err(|e| AppError::io(e.to_string()))?;
    let mut archive = open_archive(archive_path)?;
    let mut pending = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw_name = entry.path()?.to_string_lossy().into_owned();
        let relative = parse_entry_rel_path(&raw_name).ok_or_else(|| {
            AppError::io(format!("archive contains unsafe entry path: {raw_name:?}"))
        })?;
        let Some(mapped) = strip_top_dir(&relative, top_dir.as_deref()) else {
            continue;
        };
        let out_path = resolve_within_dir(dest_dir, &mapped)?;
        let entry_type = entry.header().entry_type();

        if entry_type.is_symlink() {
            let target = entry
                .link_name()?
                .ok_or_else(|| AppError::io(format!("symlink {raw_name:?} has no target")))?
                .into_owned();
            if target.is_absolute() {
                return Err(AppError::io(format!(
                    "symlink {raw_name:?} has an absolute target"
                )));
            }
            let parent = mapped.parent().unwrap_or_else(|| Path::new(""));
            resolve_within_dir(dest_dir, &parent.join(&target))?;
            pending.push(PendingSymlink {
                link: out_path,
                target,
            });
        } else if entry_type.is_dir() || entry_type.is_file() {
            let unix_mode = entry.header().mode().ok();
            let declared_size = if entry_type.is_file() {
                Some(entry.header().size()?)
            } else {
                None
            };
            write_entry(
                &out_path,
                entry_type.is_dir(),
                &mut entry,
                unix_mode,
                declared_size,
            )?;
        } else {
            return Err(AppError::io(format!(
                "unsupported tar entry type at {raw_name:?}: {entry_type:?}"
            )));
        }
    }

    create_symlinks(pending)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tar_gz(path: &Path, files: &[(&str, &[u8])]) {
        let encoder = flate2::write::GzEncoder::new(
            fs::File::create(path).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn extracts_and_strips_wrapper() {
        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("php.tar.gz");
        write_tar_gz(
            &archive,
            &[("php-8.3/bin/php", b"#!/bin/sh\n"), ("php-8.3/php.ini", b"")],
        );

        let dest = work.path().join("php");
        extract_tar_gz_flat(&archive, &dest, "php").unwrap();

        assert!(dest.join("bin/php").is_file());
        assert!(dest.join("php.ini").is_file());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            let mode = fs::metadata(dest.join("bin/php")).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }
}
