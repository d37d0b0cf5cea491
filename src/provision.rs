//! Staging of versioned runtime dependencies and bundled releases.

use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use futures_util::StreamExt as _;
use reqwest::Client;

use crate::archive::{extract_release, ArchiveKind};
use crate::error::{AppError, Result};
use crate::validation::validate_version_tag;

const PARTIAL_PREFIX: &str = ".partial-";
const OLD_PREFIX: &str = ".old-";
const DOWNLOAD_PREFIX: &str = ".download-";

/// Where a release archive comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
    File(PathBuf),
    Url(String),
}

impl ArchiveSource {
    /// Treat `http(s)://` input as a URL and anything else as a local path.
    pub fn parse(input: &str) -> Self {
        if input.starts_with("http://") || input.starts_with("https://") {
            Self::Url(input.to_string())
        } else {
            Self::File(PathBuf::from(input))
        }
    }

    fn kind(&self) -> ArchiveKind {
        let name = match self {
            Self::File(path) => path.to_string_lossy().into_owned(),
            Self::Url(url) => url.split(['?', '#']).next().unwrap_or_default().to_string(),
        };
        ArchiveKind::detect(&name).unwrap_or(ArchiveKind::Zip)
    }
}

/// A dependency staged at `<base>/<version>/<name>`.
#[derive(Debug, Clone)]
pub struct DependencyRelease {
    name: String,
    version: String,
    staged_dir: PathBuf,
    source: ArchiveSource,
}

impl DependencyRelease {
    pub fn new(
        base: &Path,
        version: &str,
        name: impl Into<String>,
        source: ArchiveSource,
    ) -> Result<Self> {
        validate_version_tag(version)?;
        let name = name.into();
        validate_version_tag(&name)?;
        Ok(Self {
            staged_dir: base.join(version).join(&name),
            name,
            version: version.to_string(),
            source,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn staged_dir(&self) -> &Path {
        &self.staged_dir
    }

    pub fn source(&self) -> &ArchiveSource {
        &self.source
    }

    /// Present means the staged directory exists and holds at least one entry.
    pub fn is_present(&self) -> bool {
        fs::read_dir(&self.staged_dir).is_ok_and(|mut entries| entries.next().is_some())
    }

    fn parent_dir(&self) -> Result<&Path> {
        self.staged_dir.parent().ok_or_else(|| {
            AppError::provision(&self.name, "staged directory has no parent")
        })
    }

    fn sibling(&self, prefix: &str) -> Result<PathBuf> {
        Ok(self.parent_dir()?.join(format!(
            "{prefix}{}-{}",
            self.name,
            uuid::Uuid::new_v4().simple()
        )))
    }
}

/// Extracts dependency archives into version-qualified directories.
///
/// Extraction always lands in a temporary sibling first and is renamed into
/// place afterwards, so the staged path is either absent or complete.
#[derive(Clone)]
pub struct DependencyProvisioner {
    client: Client,
}

impl DependencyProvisioner {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Stage `release` unless it is already present; returns the staged directory.
    pub async fn ensure_staged(&self, release: &DependencyRelease) -> Result<PathBuf> {
        if release.is_present() {
            log::debug!(
                "{} {} already staged at {}",
                release.name,
                release.version,
                release.staged_dir.display()
            );
            return Ok(release.staged_dir.clone());
        }

        log::info!("Staging {} {}", release.name, release.version);
        let staging = self.extract_to_staging(release, &release.source).await?;

        // An empty directory left behind counts as absent.
        if release.staged_dir.exists() {
            fs::remove_dir(&release.staged_dir).map_err(|e| {
                remove_quietly(&staging);
                AppError::provision(&release.name, format!("cannot replace empty directory: {e}"))
            })?;
        }
        fs::rename(&staging, &release.staged_dir).map_err(|e| {
            remove_quietly(&staging);
            AppError::provision(&release.name, format!("failed to move staged files: {e}"))
        })?;

        log::info!(
            "Staged {} {} at {}",
            release.name,
            release.version,
            release.staged_dir.display()
        );
        Ok(release.staged_dir.clone())
    }

    /// Replace the staged contents of `release` with `source`.
    ///
    /// Callers must stop every process using the old files first.
    pub async fn update_release(
        &self,
        release: &DependencyRelease,
        source: &ArchiveSource,
    ) -> Result<PathBuf> {
        log::info!("Updating {} {}", release.name, release.version);
        let staging = self.extract_to_staging(release, source).await?;

        let previous = if release.staged_dir.exists() {
            let old = release.sibling(OLD_PREFIX)?;
            fs::rename(&release.staged_dir, &old).map_err(|e| {
                remove_quietly(&staging);
                AppError::provision(&release.name, format!("cannot move old release aside: {e}"))
            })?;
            Some(old)
        } else {
            None
        };

        if let Err(e) = fs::rename(&staging, &release.staged_dir) {
            remove_quietly(&staging);
            if let Some(old) = &previous {
                if let Err(restore_err) = fs::rename(old, &release.staged_dir) {
                    log::error!(
                        "Failed to put back {} from {}: {}",
                        release.staged_dir.display(),
                        old.display(),
                        restore_err
                    );
                }
            }
            return Err(AppError::provision(
                &release.name,
                format!("failed to move new release into place: {e}"),
            ));
        }

        if let Some(old) = previous {
            remove_quietly(&old);
        }
        log::info!("Updated {} at {}", release.name, release.staged_dir.display());
        Ok(release.staged_dir.clone())
    }

    async fn extract_to_staging(
        &self,
        release: &DependencyRelease,
        source: &ArchiveSource,
    ) -> Result<PathBuf> {
        let parent = release.parent_dir()?.to_path_buf();
        fs::create_dir_all(&parent).map_err(|e| {
            AppError::provision(&release.name, format!("cannot create {}: {e}", parent.display()))
        })?;
        cleanup_leftovers(&parent, &release.name);

        let kind = source.kind();
        let (archive, downloaded) = match source {
            ArchiveSource::File(path) => {
                if !path.is_file() {
                    return Err(AppError::provision(
                        &release.name,
                        format!("archive {} not found", path.display()),
                    ));
                }
                (path.clone(), false)
            }
            ArchiveSource::Url(url) => {
                let dest = release
                    .sibling(DOWNLOAD_PREFIX)?
                    .with_extension(kind.extension());
                if let Err(e) = download_file(&self.client, url, &dest).await {
                    remove_quietly(&dest);
                    return Err(e);
                }
                (dest, true)
            }
        };

        let staging = release.sibling(PARTIAL_PREFIX)?;
        let dependency = release.name.clone();
        let (archive_for_task, staging_for_task) = (archive.clone(), staging.clone());
        let release_for_task = dependency.clone();
        let extracted = tokio::task::spawn_blocking(move || {
            extract_release(kind, &archive_for_task, &staging_for_task, &release_for_task)
        })
        .await
        .map_err(|e| AppError::provision(&dependency, format!("extraction task failed: {e}")))
        .and_then(|result| {
            result.map_err(|e| AppError::provision(&dependency, format!("extraction failed: {e}")))
        });

        if downloaded {
            remove_quietly(&archive);
        }
        if let Err(e) = extracted {
            remove_quietly(&staging);
            return Err(e);
        }
        Ok(staging)
    }
}

/// Stream `url` into `dest`.
pub async fn download_file(client: &Client, url: &str, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::io(e.to_string()))?;
    }

    log::info!("Downloading {}", url);
    let resp = client
        .get(url)
        .header("User-Agent", "grocy-desktop")
        .send()
        .await
        .map_err(|e| AppError::network_with_url(url, e.to_string()))?;

    if !resp.status().is_success() {
        return Err(AppError::network_with_url(url, resp.status().to_string()));
    }

    let mut file = fs::File::create(dest).map_err(|e| AppError::io(e.to_string()))?;
    let mut stream = resp.bytes_stream();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::network_with_url(url, e.to_string()))?;
        file.write_all(&chunk)
            .map_err(|e| AppError::io(e.to_string()))?;
    }

    Ok(())
}

/// Remove siblings left by an interrupted extraction, update or download.
fn cleanup_leftovers(parent: &Path, name: &str) {
    let Ok(entries) = fs::read_dir(parent) else {
        return;
    };
    for entry in entries.flatten() {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let is_leftover = [PARTIAL_PREFIX, OLD_PREFIX, DOWNLOAD_PREFIX]
            .iter()
            .any(|prefix| {
                file_name
                    .strip_prefix(prefix)
                    .and_then(|rest| rest.strip_prefix(name))
                    .is_some_and(|rest| rest.starts_with('-'))
            });
        if is_leftover {
            log::info!("Removing leftover {}", entry.path().display());
            remove_quietly(&entry.path());
        }
    }
}

fn remove_quietly(path: &Path) {
    let result = if path.is_dir() {
        fs::remove_dir_all(path)
    } else if path.exists() {
        fs::remove_file(path)
    } else {
        return;
    };
    if let Err(e) = result {
        log::warn!("Failed to remove {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use super::*;
    use crate::error::ErrorKind;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        for (name, content) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    fn provisioner() -> DependencyProvisioner {
        DependencyProvisioner::new(Client::new())
    }

    #[tokio::test]
    async fn second_call_does_not_extract_again() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("grocy.zip");
        write_zip(
            &archive,
            &[
                ("grocy-4.2.0/public/index.php", "<?php echo 'hi';"),
                ("grocy-4.2.0/config-dist.php", "<?php"),
            ],
        );
        let base = dir.path().join("runtime-dependencies");
        let release =
            DependencyRelease::new(&base, "1.0.0", "grocy", ArchiveSource::File(archive.clone()))
                .unwrap();

        let staged = provisioner().ensure_staged(&release).await.unwrap();
        assert_eq!(staged, base.join("1.0.0").join("grocy"));
        assert_eq!(
            fs::read_to_string(staged.join("public/index.php")).unwrap(),
            "<?php echo 'hi';"
        );

        // Without the archive a second extraction would fail.
        fs::remove_file(&archive).unwrap();
        let again = provisioner().ensure_staged(&release).await.unwrap();
        assert_eq!(again, staged);
        assert_eq!(
            fs::read_to_string(staged.join("public/index.php")).unwrap(),
            "<?php echo 'hi';"
        );
        assert_eq!(fs::read_dir(base.join("1.0.0")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn missing_archive_is_a_provision_failure() {
        let dir = tempfile::tempdir().unwrap();
        let release = DependencyRelease::new(
            dir.path(),
            "1.0.0",
            "php",
            ArchiveSource::File(dir.path().join("absent.zip")),
        )
        .unwrap();

        let err = provisioner().ensure_staged(&release).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provision);
        assert!(!release.staged_dir().exists());
    }

    #[tokio::test]
    async fn corrupt_archive_leaves_nothing_at_staged_path() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("php.zip");
        fs::write(&archive, b"not a zip").unwrap();
        let release =
            DependencyRelease::new(dir.path(), "1.0.0", "php", ArchiveSource::File(archive))
                .unwrap();

        let err = provisioner().ensure_staged(&release).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provision);
        assert!(!release.is_present());
        assert_eq!(fs::read_dir(dir.path().join("1.0.0")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn leftovers_from_a_crash_are_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("php.zip");
        write_zip(&archive, &[("php", "binary")]);
        let leftover = dir.path().join("1.0.0").join(".partial-php-deadbeef");
        fs::create_dir_all(&leftover).unwrap();
        fs::write(leftover.join("half"), b"written").unwrap();

        let release =
            DependencyRelease::new(dir.path(), "1.0.0", "php", ArchiveSource::File(archive))
                .unwrap();
        provisioner().ensure_staged(&release).await.unwrap();

        assert!(!leftover.exists());
        assert!(release.staged_dir().join("php").is_file());
    }

    #[tokio::test]
    async fn update_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let old_archive = dir.path().join("old.zip");
        let new_archive = dir.path().join("new.zip");
        write_zip(&old_archive, &[("index.php", "v1"), ("removed.php", "gone")]);
        write_zip(&new_archive, &[("index.php", "v2")]);

        let release = DependencyRelease::new(
            dir.path(),
            "1.0.0",
            "barcodebuddy",
            ArchiveSource::File(old_archive),
        )
        .unwrap();
        let staged = provisioner().ensure_staged(&release).await.unwrap();

        provisioner()
            .update_release(&release, &ArchiveSource::File(new_archive))
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(staged.join("index.php")).unwrap(), "v2");
        assert!(!staged.join("removed.php").exists());
        assert_eq!(fs::read_dir(dir.path().join("1.0.0")).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn failed_update_keeps_previous_release() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("grocy.zip");
        write_zip(&archive, &[("index.php", "v1")]);
        let release =
            DependencyRelease::new(dir.path(), "1.0.0", "grocy", ArchiveSource::File(archive))
                .unwrap();
        let staged = provisioner().ensure_staged(&release).await.unwrap();

        let err = provisioner()
            .update_release(
                &release,
                &ArchiveSource::File(dir.path().join("missing.zip")),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Provision);
        assert_eq!(fs::read_to_string(staged.join("index.php")).unwrap(), "v1");
    }

    #[test]
    fn sources_and_versions() {
        assert_eq!(
            ArchiveSource::parse("https://example.org/grocy.zip"),
            ArchiveSource::Url("https://example.org/grocy.zip".to_string())
        );
        assert_eq!(
            ArchiveSource::parse("/tmp/grocy.tar.gz").kind(),
            ArchiveKind::TarGz
        );
        assert!(DependencyRelease::new(
            Path::new("/deps"),
            "../escape",
            "php",
            ArchiveSource::File(PathBuf::from("/php.zip"))
        )
        .is_err());
    }
}
