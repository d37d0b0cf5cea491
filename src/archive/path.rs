use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, Result};

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic()
}

/// Convert an archive entry name into a relative path.
///
/// Returns `None` for empty names, absolute names, drive prefixes and `..` traversal.
pub(super) fn parse_entry_rel_path(raw: &str) -> Option<PathBuf> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return None;
    }

    let mut relative = PathBuf::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => {}
            ".." => return None,
            _ => relative.push(part),
        }
    }

    if relative.as_os_str().is_empty() {
        None
    } else {
        Some(relative)
    }
}

/// Return the single top-level folder shared by every entry, if there is one.
///
/// Archives whose entries all sit directly at the root, or that have more than one
/// top-level name, have no wrapping folder.
fn detect_common_top_dir<'a, I>(names: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut top: Option<String> = None;
    let mut nested = false;

    for name in names {
        let Some(relative) = parse_entry_rel_path(name) else {
            continue;
        };
        let mut components = relative.components();
        let first = components.next()?.as_os_str().to_str()?.to_string();
        if components.next().is_some() {
            nested = true;
        } else if !name.ends_with('/') && !name.ends_with('\\') {
            // A plain file at the root means there is no wrapper folder.
            return None;
        }

        match &top {
            None => top = Some(first),
            Some(existing) if *existing == first => {}
            Some(_) => return None,
        }
    }

    top.filter(|_| nested)
}

/// The common top-level folder, but only when it is named after the release,
/// e.g. `grocy-4.2.0/` for `grocy`. Any other single folder such as `bin/` is content.
pub(super) fn detect_release_wrapper<'a, I>(names: I, release: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let release = release.to_ascii_lowercase();
    detect_common_top_dir(names).filter(|top| top.to_ascii_lowercase().starts_with(&release))
}

/// Strip `top_dir` from `relative`; the wrapper folder entry itself maps to `None`.
pub(super) fn strip_top_dir(relative: &Path, top_dir: Option<&str>) -> Option<PathBuf> {
    let Some(top) = top_dir else {
        return Some(relative.to_path_buf());
    };

    let stripped = relative.strip_prefix(top).ok()?;
    if stripped.as_os_str().is_empty() {
        None
    } else {
        Some(stripped.to_path_buf())
    }
}

/// Resolve `relative` under `base_dir` and verify the result stays inside it,
/// following any symlinks that already exist on disk.
pub(super) fn resolve_within_dir(base_dir: &Path, relative: &Path) -> Result<PathBuf> {
    let canonical_base = base_dir
        .canonicalize()
        .map_err(|e| AppError::io(format!("failed to canonicalize {base_dir:?}: {e}")))?;
    let candidate = canonicalize_existing_prefix(&canonical_base.join(relative))?;

    if !candidate.starts_with(&canonical_base) {
        return Err(AppError::io(format!(
            "archive entry {relative:?} escapes the destination directory"
        )));
    }
    Ok(candidate)
}

/// Canonicalize the longest prefix of `path` that exists and re-append the rest.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                if !existing.pop() {
                    return Err(AppError::io(format!("{path:?} escapes the filesystem root")));
                }
            }
            Component::CurDir => {}
            other => existing.push(other.as_os_str()),
        }
    }

    let mut suffix = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(mut canonical) => {
                for part in suffix.into_iter().rev() {
                    canonical.push(part);
                }
                return Ok(canonical);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name().map(|n| n.to_owned()) else {
                    return Err(AppError::io(format!("failed to resolve {path:?}")));
                };
                suffix.push(name);
                existing.pop();
            }
            Err(e) => return Err(AppError::io(format!("failed to resolve {existing:?}: {e}"))),
        }
    }
}
