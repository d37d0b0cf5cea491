use std::path::{Component, Path, PathBuf};

use crate::error::{AppError, Result};

#[cfg(windows)]
const INVALID_PATH_CHARS: &[char] = &['\0', '"', '<', '>', '|'];

#[cfg(not(windows))]
const INVALID_PATH_CHARS: &[char] = &['\0'];

/// A usable data path is rooted and free of characters the host filesystem rejects.
pub fn is_valid_path(path: &Path) -> bool {
    if !path.is_absolute() {
        return false;
    }

    let Some(text) = path.to_str() else {
        return false;
    };

    if text.chars().any(|c| c.is_control() && c != '\t') || text.contains(INVALID_PATH_CHARS) {
        return false;
    }

    !path
        .components()
        .any(|component| matches!(component, Component::ParentDir))
}

/// Validate a data directory path and return it as an owned buffer.
pub fn validate_data_dir(path: &Path) -> Result<PathBuf> {
    if is_valid_path(path) {
        Ok(path.to_path_buf())
    } else {
        Err(AppError::invalid_path(path))
    }
}

/// Version tags become directory names, so only a conservative alphabet is accepted.
pub fn validate_version_tag(version: &str) -> Result<()> {
    let is_safe = !version.is_empty()
        && !version.starts_with('.')
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+'));

    if !is_safe {
        return Err(AppError::invalid_path(version));
    }

    Ok(())
}

/// Reject relocation targets that would nest one directory inside the other.
pub fn ensure_disjoint(from: &Path, to: &Path) -> Result<()> {
    if from == to || to.starts_with(from) || from.starts_with(to) {
        return Err(AppError::invalid_path(to));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_relative_paths() {
        assert!(!is_valid_path(Path::new("not/rooted")));
        assert!(validate_data_dir(Path::new("not/rooted")).is_err());
    }

    #[test]
    fn rejects_nul_bytes() {
        let root = std::env::temp_dir();
        let bad = PathBuf::from(format!("{}/bad\0name", root.display()));
        assert!(!is_valid_path(&bad));
    }

    #[test]
    fn accepts_absolute_paths() {
        let dir = std::env::temp_dir().join("grocy-desktop");
        assert!(is_valid_path(&dir));
    }

    #[test]
    fn version_tags() {
        assert!(validate_version_tag("4.2.0").is_ok());
        assert!(validate_version_tag("../4.2.0").is_err());
        assert!(validate_version_tag("").is_err());
    }

    #[test]
    fn nested_relocation_is_rejected() {
        let base = std::env::temp_dir().join("data");
        assert!(ensure_disjoint(&base, &base.join("inner")).is_err());
        assert!(ensure_disjoint(&base, &std::env::temp_dir().join("other")).is_ok());
    }
}
