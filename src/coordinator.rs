//! Stop, mutate and restart sequencing for destructive data directory operations.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;

use crate::archive::{extract_zip_exact, pack_dir_to_zip};
use crate::error::{AppError, Result};
use crate::process::wait_for_exit;
use crate::validation::{ensure_disjoint, validate_data_dir};

/// How long to wait for stopped processes to release the data directory.
pub const DEFAULT_RELEASE_TIMEOUT: Duration = Duration::from_secs(10);

/// Progress of the latest operation on one data directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Idle,
    ServerStopping,
    Mutating,
    Restarting,
    Done,
    Failed,
}

impl OperationState {
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            Self::ServerStopping | Self::Mutating | Self::Restarting
        )
    }
}

/// Why the whole application is being restarted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    Restored { app: String },
    Relocated { app: String },
    Wiped { app: String },
    SettingsChanged,
    UserRequested,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Restored { app } => write!(f, "{app} data restored"),
            Self::Relocated { app } => write!(f, "{app} data relocated"),
            Self::Wiped { app } => write!(f, "{app} database recreated"),
            Self::SettingsChanged => write!(f, "settings changed"),
            Self::UserRequested => write!(f, "restart requested"),
        }
    }
}

/// Receives requests to tear the application down and start it again.
pub trait RestartRequester: Send + Sync {
    fn request_restart(&self, reason: RestartReason);
}

/// Whatever runs processes that hold files open inside a data directory.
pub trait DataOwner: Send {
    /// Stop every such process and return the PIDs that were running.
    fn stop(&mut self) -> impl Future<Output = Result<Vec<u32>>> + Send;
}

/// Serializes backup, restore, relocate and wipe per data directory.
pub struct BackupRestoreCoordinator {
    states: Mutex<HashMap<PathBuf, OperationState>>,
    restart: Arc<dyn RestartRequester>,
    release_timeout: Duration,
}

impl BackupRestoreCoordinator {
    pub fn new(restart: Arc<dyn RestartRequester>) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            restart,
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }

    pub fn with_release_timeout(mut self, timeout: Duration) -> Self {
        self.release_timeout = timeout;
        self
    }

    pub fn restart_requester(&self) -> &Arc<dyn RestartRequester> {
        &self.restart
    }

    pub fn state(&self, data_dir: &Path) -> OperationState {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(data_dir)
            .copied()
            .unwrap_or(OperationState::Idle)
    }

    /// A destructive operation is in flight; servers must not start on this directory.
    pub fn is_busy(&self, data_dir: &Path) -> bool {
        self.state(data_dir).is_busy()
    }

    fn begin(&self, data_dir: &Path, initial: OperationState) -> Result<OperationGuard<'_>> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let current = states.entry(data_dir.to_path_buf()).or_insert(OperationState::Idle);
        if current.is_busy() {
            return Err(AppError::operation_in_progress(data_dir));
        }
        *current = initial;
        drop(states);

        log::info!("{}: {:?}", data_dir.display(), initial);
        Ok(OperationGuard {
            coordinator: self,
            data_dir: data_dir.to_path_buf(),
            finished: false,
        })
    }

    /// Archive `data_dir` into `archive`. The server keeps running.
    pub async fn backup(&self, data_dir: &Path, archive: &Path) -> Result<()> {
        if self.is_busy(data_dir) {
            return Err(AppError::operation_in_progress(data_dir));
        }
        if !data_dir.is_dir() {
            return Err(AppError::mutation(format!(
                "data directory {} does not exist",
                data_dir.display()
            )));
        }

        log::info!("Backing up {} to {}", data_dir.display(), archive.display());
        let partial = archive.with_extension(format!("partial-{}", uuid::Uuid::new_v4().simple()));
        let (source, target) = (data_dir.to_path_buf(), partial.clone());
        let packed = tokio::task::spawn_blocking(move || pack_dir_to_zip(&source, &target))
            .await
            .map_err(|e| AppError::mutation(format!("backup task failed: {e}")))
            .and_then(|result| result.map_err(|e| AppError::mutation(format!("backup failed: {e}"))));

        if let Err(e) = packed.and_then(|()| {
            fs::rename(&partial, archive)
                .map_err(|e| AppError::mutation(format!("failed to write {}: {e}", archive.display())))
        }) {
            remove_quietly(&partial);
            return Err(e);
        }
        log::info!("Backup written to {}", archive.display());
        Ok(())
    }

    /// Replace `data_dir` with the contents of `archive`, then request a restart.
    pub async fn restore<O>(
        &self,
        owner: &mut O,
        app: &str,
        data_dir: &Path,
        archive: &Path,
    ) -> Result<()>
    where
        O: DataOwner,
    {
        let data_dir = validate_data_dir(data_dir)?;
        if !archive.is_file() {
            return Err(AppError::mutation(format!(
                "backup archive {} not found",
                archive.display()
            )));
        }

        let mut guard = self.begin(&data_dir, OperationState::ServerStopping)?;
        self.release(owner).await?;

        guard.transition(OperationState::Mutating);
        let staging = sibling(&data_dir, "restore")?;
        let (source, target) = (archive.to_path_buf(), staging.clone());
        let extracted = tokio::task::spawn_blocking(move || extract_zip_exact(&source, &target))
            .await
            .map_err(|e| AppError::mutation(format!("restore task failed: {e}")))
            .and_then(|result| {
                result.map_err(|e| AppError::mutation(format!("extraction failed: {e}")))
            });
        if let Err(e) = extracted {
            remove_quietly(&staging);
            return Err(e);
        }
        swap_into_place(&staging, &data_dir)?;

        guard.transition(OperationState::Restarting);
        self.restart.request_restart(RestartReason::Restored {
            app: app.to_string(),
        });
        guard.finish();
        Ok(())
    }

    /// Copy `from` to `to`, let `commit` persist the new location, delete `from`,
    /// then request a restart.
    pub async fn relocate<O, C>(
        &self,
        owner: &mut O,
        app: &str,
        from: &Path,
        to: &Path,
        commit: C,
    ) -> Result<()>
    where
        O: DataOwner,
        C: FnOnce(&Path) -> Result<()> + Send,
    {
        let from = validate_data_dir(from)?;
        let to = validate_data_dir(to)?;
        ensure_disjoint(&from, &to)?;
        if fs::read_dir(&to).is_ok_and(|mut entries| entries.next().is_some()) {
            return Err(AppError::mutation(format!(
                "target {} is not empty",
                to.display()
            )));
        }

        let mut guard = self.begin(&from, OperationState::ServerStopping)?;
        self.release(owner).await?;

        guard.transition(OperationState::Mutating);
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AppError::mutation(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let staging = sibling(&to, "relocate")?;
        let (source, target) = (from.clone(), staging.clone());
        let copied = tokio::task::spawn_blocking(move || copy_tree(&source, &target))
            .await
            .map_err(|e| AppError::mutation(format!("copy task failed: {e}")))
            .and_then(|result| result.map_err(|e| AppError::mutation(format!("copy failed: {e}"))));
        if let Err(e) = copied {
            remove_quietly(&staging);
            return Err(e);
        }
        swap_into_place(&staging, &to)?;

        if let Err(e) = commit(&to) {
            remove_quietly(&to);
            return Err(AppError::mutation(format!("failed to save new location: {e}")));
        }
        if let Err(e) = fs::remove_dir_all(&from) {
            log::warn!("Failed to remove old data directory {}: {}", from.display(), e);
        }

        guard.transition(OperationState::Restarting);
        self.restart.request_restart(RestartReason::Relocated {
            app: app.to_string(),
        });
        guard.finish();
        Ok(())
    }

    /// Delete the database files in `data_dir`, then request a restart.
    pub async fn wipe<O>(
        &self,
        owner: &mut O,
        app: &str,
        data_dir: &Path,
        files: &[&str],
    ) -> Result<()>
    where
        O: DataOwner,
    {
        let data_dir = validate_data_dir(data_dir)?;
        let mut guard = self.begin(&data_dir, OperationState::ServerStopping)?;
        self.release(owner).await?;

        guard.transition(OperationState::Mutating);
        for file in files {
            let path = data_dir.join(file);
            match fs::remove_file(&path) {
                Ok(()) => log::info!("Deleted {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(AppError::mutation(format!(
                        "failed to delete {}: {e}",
                        path.display()
                    )))
                }
            }
        }

        guard.transition(OperationState::Restarting);
        self.restart.request_restart(RestartReason::Wiped {
            app: app.to_string(),
        });
        guard.finish();
        Ok(())
    }

    async fn release<O>(&self, owner: &mut O) -> Result<()>
    where
        O: DataOwner,
    {
        let pids = owner.stop().await?;
        wait_for_exit(&pids, self.release_timeout).await
    }
}

/// Marks the operation failed unless it is explicitly finished.
struct OperationGuard<'a> {
    coordinator: &'a BackupRestoreCoordinator,
    data_dir: PathBuf,
    finished: bool,
}

impl OperationGuard<'_> {
    fn transition(&mut self, state: OperationState) {
        log::info!("{}: {:?}", self.data_dir.display(), state);
        self.coordinator
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(self.data_dir.clone(), state);
    }

    fn finish(mut self) {
        self.transition(OperationState::Done);
        self.finished = true;
    }
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::error!("{}: {:?}", self.data_dir.display(), OperationState::Failed);
            self.coordinator
                .states
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(self.data_dir.clone(), OperationState::Failed);
        }
    }
}

fn sibling(path: &Path, purpose: &str) -> Result<PathBuf> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::invalid_path(path))?;
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(parent.join(format!(
        ".{name}.{purpose}-{}",
        uuid::Uuid::new_v4().simple()
    )))
}

/// Rename `staging` over `target`; the previous `target` survives until the rename succeeds.
fn swap_into_place(staging: &Path, target: &Path) -> Result<()> {
    let previous = if target.exists() {
        let aside = sibling(target, "previous")?;
        fs::rename(target, &aside).map_err(|e| {
            remove_quietly(staging);
            AppError::mutation(format!("cannot move {} aside: {e}", target.display()))
        })?;
        Some(aside)
    } else {
        None
    };

    if let Err(e) = fs::rename(staging, target) {
        remove_quietly(staging);
        if let Some(aside) = &previous {
            if let Err(back) = fs::rename(aside, target) {
                log::error!(
                    "Previous data kept at {} could not be moved back: {}",
                    aside.display(),
                    back
                );
            }
        }
        return Err(AppError::mutation(format!(
            "cannot move new data into {}: {e}",
            target.display()
        )));
    }

    if let Some(aside) = previous {
        remove_quietly(&aside);
    }
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in walkdir::WalkDir::new(from).min_depth(1) {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| AppError::io(e.to_string()))?;
        let dest = to.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest)?;
        } else if entry.file_type().is_file() {
            fs::copy(entry.path(), &dest).map_err(|e| {
                AppError::io(format!("failed to copy {}: {e}", entry.path().display()))
            })?;
        } else {
            log::warn!("Skipping {} while copying", entry.path().display());
        }
    }
    Ok(())
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
