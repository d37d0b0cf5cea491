//! Persisted user settings.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Settings record owned by a [`SettingsStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSettings {
    #[serde(default)]
    pub integration_enabled: bool,
    #[serde(default)]
    pub external_access_enabled: bool,
    #[serde(default)]
    pub apps: BTreeMap<String, AppSettings>,
}

/// Per hosted application settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppSettings {
    /// Overrides `<user-data-root>/<app-name>` when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_location: Option<PathBuf>,
    /// Preferred listening port, 0 for "any".
    #[serde(default)]
    pub desired_port: u16,
}

impl UserSettings {
    pub fn app(&self, name: &str) -> Option<&AppSettings> {
        self.apps.get(name)
    }

    pub fn app_mut(&mut self, name: &str) -> &mut AppSettings {
        self.apps.entry(name.to_string()).or_default()
    }

    pub fn desired_port(&self, name: &str) -> Option<u16> {
        self.app(name)
            .map(|app| app.desired_port)
            .filter(|&port| port > 0)
    }
}

/// Loads settings once, hands out snapshots, and saves every accepted mutation.
pub struct SettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
    current: RwLock<Arc<UserSettings>>,
}

impl SettingsStore {
    /// Load settings from `path`, writing defaults when the file does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let settings = if path.exists() {
            let content = fs::read_to_string(&path).map_err(|e| {
                AppError::config(format!("Failed to read {}: {}", path.display(), e))
            })?;
            toml::from_str(&content)?
        } else {
            let defaults = UserSettings::default();
            save_to_disk(&path, &defaults)?;
            defaults
        };

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            current: RwLock::new(Arc::new(settings)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<UserSettings> {
        let current = self.current.read().unwrap_or_else(|e| e.into_inner());
        Arc::clone(&current)
    }

    /// Execute a read-modify-write on the settings while holding the write lock.
    /// The new record is published only after it has been saved.
    pub fn update<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut UserSettings) -> Result<T>,
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut updated = (*self.snapshot()).clone();
        let result = f(&mut updated)?;
        save_to_disk(&self.path, &updated)?;

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(updated);

        Ok(result)
    }

    /// Write the current record to disk.
    pub fn save(&self) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        save_to_disk(&self.path, &self.snapshot())
    }
}

fn save_to_disk(path: &Path, settings: &UserSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::config(e.to_string()))?;
    }
    let content = toml::to_string_pretty(settings)?;
    fs::write(path, content)
        .map_err(|e| AppError::config(format!("Failed to write {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");

        let store = SettingsStore::load(&path).unwrap();

        assert!(path.exists());
        assert_eq!(*store.snapshot(), UserSettings::default());
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let store = SettingsStore::load(&path).unwrap();

        store
            .update(|settings| {
                settings.integration_enabled = true;
                settings.app_mut("grocy").desired_port = 8111;
                settings.app_mut("grocy").data_location = Some(dir.path().join("grocy-data"));
                Ok(())
            })
            .unwrap();

        let reloaded = SettingsStore::load(&path).unwrap().snapshot();
        assert!(reloaded.integration_enabled);
        assert_eq!(reloaded.desired_port("grocy"), Some(8111));
        assert_eq!(
            reloaded.app("grocy").unwrap().data_location,
            Some(dir.path().join("grocy-data"))
        );
    }

    #[test]
    fn failed_update_leaves_settings_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = SettingsStore::load(dir.path().join("settings.toml")).unwrap();

        let result: Result<()> = store.update(|settings| {
            settings.external_access_enabled = true;
            Err(AppError::other("rejected"))
        });

        assert!(result.is_err());
        assert!(!store.snapshot().external_access_enabled);
    }

    #[test]
    fn partial_file_loads_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        fs::write(&path, "external_access_enabled = true\n[apps.grocy]\n").unwrap();

        let settings = SettingsStore::load(&path).unwrap().snapshot();
        assert!(settings.external_access_enabled);
        assert_eq!(settings.desired_port("grocy"), None);
    }
}
