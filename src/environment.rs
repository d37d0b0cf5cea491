//! Per-application data directory preparation and environment computation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{AppError, Result};
use crate::validation::validate_data_dir;

/// Copy a file shipped with the release into the data directory, once.
#[derive(Debug, Clone, Copy)]
pub struct ConfigTemplate {
    /// Relative to the release directory.
    pub source: &'static str,
    /// Relative to the data directory.
    pub target: &'static str,
}

/// How an injected environment variable gets its value.
#[derive(Debug, Clone, Copy)]
pub enum EnvValue {
    /// Absolute data directory.
    DataDir,
    /// A file inside the data directory.
    DataFile(&'static str),
    /// The upstream application's API URL; omitted when there is no upstream.
    UpstreamUrl,
}

/// Everything an application needs on disk and in its environment before its server starts.
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentDefinition {
    pub config_template: Option<ConfigTemplate>,
    /// File inside the release directory that receives the absolute data path.
    pub data_path_marker: Option<&'static str>,
    pub variables: &'static [(&'static str, EnvValue)],
}

/// Result of a successful setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentConfig {
    pub data_dir: PathBuf,
    pub variables: BTreeMap<String, String>,
}

pub struct EnvironmentProvisioner {
    definition: EnvironmentDefinition,
    release_dir: PathBuf,
    data_dir: PathBuf,
}

impl EnvironmentProvisioner {
    pub fn new(definition: EnvironmentDefinition, release_dir: PathBuf, data_dir: PathBuf) -> Self {
        Self {
            definition,
            release_dir,
            data_dir,
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Prepare the data directory and compute the server environment.
    ///
    /// Safe to repeat: existing files in the data directory are never overwritten.
    pub fn setup(&self, upstream_url: Option<&str>) -> Result<EnvironmentConfig> {
        let data_dir = validate_data_dir(&self.data_dir)?;

        fs::create_dir_all(&data_dir).map_err(|e| {
            AppError::io(format!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        if let Some(template) = self.definition.config_template {
            self.copy_template(template, &data_dir)?;
        }

        if let Some(marker) = self.definition.data_path_marker {
            self.write_data_path_marker(marker, &data_dir)?;
        }

        let variables = self.render_variables(&data_dir, upstream_url);
        Ok(EnvironmentConfig {
            data_dir,
            variables,
        })
    }

    fn copy_template(&self, template: ConfigTemplate, data_dir: &Path) -> Result<()> {
        let target = data_dir.join(template.target);
        if target.exists() {
            return Ok(());
        }

        let source = self.release_dir.join(template.source);
        if !source.is_file() {
            log::warn!(
                "Config template {} is missing, {} not created",
                source.display(),
                target.display()
            );
            return Ok(());
        }

        fs::copy(&source, &target).map_err(|e| {
            AppError::io(format!(
                "Failed to copy {} to {}: {}",
                source.display(),
                target.display(),
                e
            ))
        })?;
        log::info!("Created {} from template", target.display());
        Ok(())
    }

    fn write_data_path_marker(&self, marker: &str, data_dir: &Path) -> Result<()> {
        let path = self.release_dir.join(marker);
        let content = data_dir.to_string_lossy();
        if fs::read_to_string(&path).is_ok_and(|existing| existing == content) {
            return Ok(());
        }

        fs::write(&path, content.as_bytes()).map_err(|e| {
            AppError::io(format!("Failed to write {}: {}", path.display(), e))
        })
    }

    fn render_variables(
        &self,
        data_dir: &Path,
        upstream_url: Option<&str>,
    ) -> BTreeMap<String, String> {
        self.definition
            .variables
            .iter()
            .filter_map(|(name, value)| {
                let rendered = match value {
                    EnvValue::DataDir => data_dir.to_string_lossy().into_owned(),
                    EnvValue::DataFile(file) => data_dir.join(file).to_string_lossy().into_owned(),
                    EnvValue::UpstreamUrl => upstream_url?.to_string(),
                };
                Some(((*name).to_string(), rendered))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const DEFINITION: EnvironmentDefinition = EnvironmentDefinition {
        config_template: Some(ConfigTemplate {
            source: "config-dist.php",
            target: "config.php",
        }),
        data_path_marker: Some("embedded.txt"),
        variables: &[
            ("APP_DATA", EnvValue::DataDir),
            ("APP_DB", EnvValue::DataFile("app.db")),
            ("APP_UPSTREAM", EnvValue::UpstreamUrl),
        ],
    };

    fn release(dir: &Path) -> PathBuf {
        let release = dir.join("release");
        fs::create_dir_all(&release).unwrap();
        fs::write(release.join("config-dist.php"), "<?php // defaults").unwrap();
        release
    }

    #[test]
    fn relative_path_is_rejected_without_creating_anything() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner =
            EnvironmentProvisioner::new(DEFINITION, release(dir.path()), PathBuf::from("not/rooted"));

        let err = provisioner.setup(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        assert!(!Path::new("not").exists());
    }

    #[test]
    fn nul_byte_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bad = PathBuf::from(format!("{}/da\0ta", dir.path().display()));
        let provisioner = EnvironmentProvisioner::new(DEFINITION, release(dir.path()), bad);

        let err = provisioner.setup(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidPath);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn setup_creates_layout_and_variables() {
        let dir = tempfile::tempdir().unwrap();
        let release = release(dir.path());
        let data = dir.path().join("data");
        let provisioner = EnvironmentProvisioner::new(DEFINITION, release.clone(), data.clone());

        let config = provisioner
            .setup(Some("http://127.0.0.1:8111/api/"))
            .unwrap();

        assert_eq!(config.data_dir, data);
        assert!(data.join("config.php").is_file());
        assert_eq!(
            fs::read_to_string(release.join("embedded.txt")).unwrap(),
            data.to_string_lossy()
        );
        assert_eq!(
            config.variables["APP_DB"],
            data.join("app.db").to_string_lossy()
        );
        assert_eq!(config.variables["APP_UPSTREAM"], "http://127.0.0.1:8111/api/");
    }

    #[test]
    fn missing_upstream_omits_variable() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = EnvironmentProvisioner::new(
            DEFINITION,
            release(dir.path()),
            dir.path().join("data"),
        );

        let config = provisioner.setup(None).unwrap();
        assert!(!config.variables.contains_key("APP_UPSTREAM"));
        assert_eq!(config.variables["APP_DATA"], config.data_dir.to_string_lossy());
    }

    #[test]
    fn repeated_setup_keeps_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("app.db"), b"precious rows").unwrap();
        fs::write(data.join("config.php"), "<?php // edited by user").unwrap();

        let provisioner =
            EnvironmentProvisioner::new(DEFINITION, release(dir.path()), data.clone());
        let first = provisioner.setup(None).unwrap();
        let second = provisioner.setup(None).unwrap();

        assert_eq!(first, second);
        assert_eq!(fs::read(data.join("app.db")).unwrap(), b"precious rows");
        assert_eq!(
            fs::read_to_string(data.join("config.php")).unwrap(),
            "<?php // edited by user"
        );
    }
}
