use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

use super::path::{detect_release_wrapper, parse_entry_rel_path, resolve_within_dir, strip_top_dir};
use super::write_entry;

/// Zip the contents of `dir` so that the archive root mirrors the directory root.
pub(crate) fn pack_dir_to_zip(dir: &Path, archive_path: &Path) -> Result<()> {
    let file = fs::File::create(archive_path)
        .map_err(|e| AppError::io(format!("failed to create {archive_path:?}: {e}")))?;
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .large_file(true);

    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        let path = entry.path();
        if path == dir {
            continue;
        }
        let relative = path
            .strip_prefix(dir)
            .map_err(|e| AppError::io(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        if entry.file_type().is_dir() {
            writer.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(name, options)?;
            let mut source = fs::File::open(path)
                .map_err(|e| AppError::io(format!("failed to open {path:?}: {e}")))?;
            io::copy(&mut source, &mut writer)
                .map_err(|e| AppError::io(format!("failed to archive {path:?}: {e}")))?;
        } else {
            log::warn!("Skipping non-regular file {:?} while archiving", path);
        }
    }

    writer.finish()?;
    Ok(())
}

/// Extract zip entries using a caller-provided destination resolver.
///
/// Returning `None` from `destination_for` skips the entry. Symlink entries are rejected.
fn extract_zip_mapped<F>(archive_path: &Path, dest_dir: &Path, mut destination_for: F) -> Result<()>
where
    F: FnMut(&Path) -> Option<PathBuf>,
{
    fs::create_dir_all(dest_dir).map_err(|e| AppError::io(e.to_string()))?;
    let file = fs::File::open(archive_path)
        .map_err(|e| AppError::io(format!("failed to open {archive_path:?}: {e}")))?;
    let mut archive = zip::ZipArchive::new(file)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let raw_name = entry.name().to_string();

        let relative = parse_entry_rel_path(&raw_name).ok_or_else(|| {
            AppError::io(format!("archive contains unsafe zip path: {raw_name:?}"))
        })?;
        let Some(mapped) = destination_for(&relative) else {
            continue;
        };
        if entry.is_symlink() {
            return Err(AppError::io(format!(
                "symlink entries are not supported in zip archives: {raw_name:?}"
            )));
        }

        let out_path = resolve_within_dir(dest_dir, &mapped)?;
        let is_dir = entry.is_dir();
        let unix_mode = entry.unix_mode();
        let declared_size = if is_dir { None } else { Some(entry.size()) };
        write_entry(&out_path, is_dir, &mut entry, unix_mode, declared_size)?;
    }

    Ok(())
}

/// Extract every entry to the same relative location under `dest_dir`.
pub(crate) fn extract_zip_exact(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    extract_zip_mapped(archive_path, dest_dir, |relative| Some(relative.to_path_buf()))
}

/// Extract a zip archive, stripping a top-level folder named after `release`.
pub(super) fn extract_zip_flat(archive_path: &Path, dest_dir: &Path, release: &str) -> Result<()> {
    let top_dir = {
        let file = fs::File::open(archive_path)
            .map_err(|e| AppError::io(format!("failed to open {archive_path:?}: {e}")))?;
        let archive = zip::ZipArchive::new(file)?;
        detect_release_wrapper(archive.file_names(), release)
    };

    extract_zip_mapped(archive_path, dest_dir, |relative| {
        strip_top_dir(relative, top_dir.as_deref())
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            if name.ends_with('/') {
                writer.add_directory(*name, options).unwrap();
            } else {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
        }
        writer.finish().unwrap();
    }

    #[test]
    fn pack_then_extract_reproduces_tree() {
        let work = tempfile::tempdir().unwrap();
        let source = work.path().join("source");
        fs::create_dir_all(source.join("storage/uploads")).unwrap();
        fs::create_dir_all(source.join("empty")).unwrap();
        fs::write(source.join("grocy.db"), b"\x00\x01sqlite").unwrap();
        fs::write(source.join("storage/uploads/a.png"), b"png").unwrap();

        let archive = work.path().join("backup.zip");
        pack_dir_to_zip(&source, &archive).unwrap();

        let target = work.path().join("target");
        extract_zip_exact(&archive, &target).unwrap();

        assert_eq!(fs::read(target.join("grocy.db")).unwrap(), b"\x00\x01sqlite");
        assert_eq!(fs::read(target.join("storage/uploads/a.png")).unwrap(), b"png");
        assert!(target.join("empty").is_dir());
    }

    #[test]
    fn flat_extraction_strips_wrapper_folder() {
        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("release.zip");
        write_zip(
            &archive,
            &[
                ("barcodebuddy-1.8/", ""),
                ("barcodebuddy-1.8/index.php", "<?php"),
                ("barcodebuddy-1.8/wsserver.php", "ws"),
            ],
        );

        let dest = work.path().join("out");
        extract_zip_flat(&archive, &dest, "barcodebuddy").unwrap();

        assert_eq!(fs::read_to_string(dest.join("index.php")).unwrap(), "<?php");
        assert!(dest.join("wsserver.php").exists());
        assert!(!dest.join("barcodebuddy-1.8").exists());
    }

    #[test]
    fn single_content_folder_is_kept() {
        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("php.zip");
        write_zip(&archive, &[("bin/", ""), ("bin/php", "#!/bin/sh")]);

        let dest = work.path().join("out");
        extract_zip_flat(&archive, &dest, "php").unwrap();

        assert!(dest.join("bin/php").is_file());
        assert!(!dest.join("php").exists());
    }

    #[test]
    fn traversal_entries_fail_extraction() {
        let work = tempfile::tempdir().unwrap();
        let archive = work.path().join("evil.zip");
        write_zip(&archive, &[("../escape.txt", "boom")]);

        let dest = work.path().join("out");
        assert!(extract_zip_exact(&archive, &dest).is_err());
        assert!(!work.path().join("escape.txt").exists());
    }
}
