//! Filesystem layout of the launcher.
//!
//! ```text
//! <user-data-root>/settings.toml
//! <user-data-root>/grocy-desktop.lock                    held while the data root is in use
//! <user-data-root>/<app-name>/                          default data dir per app
//! <user-data-root>/runtime-dependencies/<version>/<dep>/ staged dependencies
//! <exe-dir>/portable                                     optional data root override
//! <exe-dir>/dependencies/<dep>.zip                       bundled archives
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::validation::is_valid_path;

/// Directory name used under the platform data dir and next to a portable executable.
pub const APP_DIR_NAME: &str = "grocy-desktop";

/// Name of the marker file that points to an alternate data root.
pub const PORTABLE_MARKER: &str = "portable";

const SETTINGS_FILE: &str = "settings.toml";
const LOCK_FILE: &str = "grocy-desktop.lock";
const RUNTIME_DEPENDENCIES_DIR: &str = "runtime-dependencies";
const BUNDLED_DEPENDENCIES_DIR: &str = "dependencies";

/// Version string of the running launcher, used to qualify staged dependencies.
pub fn running_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Resolved locations for one launcher process.
#[derive(Debug, Clone)]
pub struct Layout {
    data_root: PathBuf,
    exe_dir: PathBuf,
    version: String,
}

impl Layout {
    pub fn new(data_root: PathBuf, exe_dir: PathBuf, version: impl Into<String>) -> Self {
        Self {
            data_root,
            exe_dir,
            version: version.into(),
        }
    }

    /// Resolve the layout for the current executable. An explicit data root
    /// (`--data-root`) wins over the portable marker and the user data dir.
    pub fn discover(data_root: Option<PathBuf>) -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| AppError::io(format!("Failed to get current exe path: {e}")))?;
        let exe_dir = exe
            .parent()
            .ok_or_else(|| AppError::io("Failed to get exe directory"))?
            .to_path_buf();
        let data_root = match data_root {
            Some(root) => root,
            None => resolve_data_root(&exe_dir, default_data_root()?),
        };
        Ok(Self::new(data_root, exe_dir, running_version()))
    }

    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn settings_path(&self) -> PathBuf {
        self.data_root.join(SETTINGS_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_root.join(LOCK_FILE)
    }

    /// Default data directory of a hosted application.
    pub fn default_app_data_dir(&self, app_name: &str) -> PathBuf {
        self.data_root.join(app_name)
    }

    pub fn runtime_dependencies_root(&self) -> PathBuf {
        self.data_root.join(RUNTIME_DEPENDENCIES_DIR)
    }

    /// Staged directories of the running version live here.
    pub fn runtime_dependencies_executing_path(&self) -> PathBuf {
        self.runtime_dependencies_root().join(&self.version)
    }

    /// Archive shipped next to the executable for a dependency.
    pub fn bundled_archive(&self, dependency: &str) -> PathBuf {
        self.exe_dir
            .join(BUNDLED_DEPENDENCIES_DIR)
            .join(format!("{dependency}.zip"))
    }

    /// Ensure the data root exists.
    pub fn ensure_data_root(&self) -> Result<()> {
        fs::create_dir_all(&self.data_root).map_err(|e| {
            AppError::io(format!(
                "Failed to create data root {}: {e}",
                self.data_root.display()
            ))
        })
    }
}

fn default_data_root() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| AppError::config("Cannot find the user data directory"))
}

/// Pick the data root: a valid portable marker wins, an invalid or unreadable one
/// falls back to `<exe-dir>/grocy-desktop`, no marker means `default_root`.
pub fn resolve_data_root(exe_dir: &Path, default_root: PathBuf) -> PathBuf {
    let marker = exe_dir.join(PORTABLE_MARKER);
    if !marker.exists() {
        return default_root;
    }

    let fallback = exe_dir.join(APP_DIR_NAME);
    match fs::read_to_string(&marker) {
        Ok(content) => {
            let first_line = content.lines().next().unwrap_or_default().trim();
            let candidate = PathBuf::from(first_line);
            if !first_line.is_empty() && is_valid_path(&candidate) {
                candidate
            } else {
                log::warn!(
                    "Portable marker {} does not name a usable path, using {}",
                    marker.display(),
                    fallback.display()
                );
                fallback
            }
        }
        Err(e) => {
            log::warn!("Failed to read portable marker {}: {}", marker.display(), e);
            fallback
        }
    }
}

/// Locate the PHP executable inside a staged runtime directory.
pub fn runtime_executable(runtime_dir: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        runtime_dir.join("php.exe")
    }

    #[cfg(not(target_os = "windows"))]
    {
        let in_bin = runtime_dir.join("bin").join("php");
        if in_bin.exists() {
            in_bin
        } else {
            runtime_dir.join("php")
        }
    }
}
