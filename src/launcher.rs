//! Startup, shutdown and user operations over every hosted application.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::Serialize;

use crate::apps::{self, AppDefinition, PHP_RUNTIME};
use crate::config::SettingsStore;
use crate::coordinator::{
    BackupRestoreCoordinator, DataOwner, OperationState, RestartReason, RestartRequester,
    DEFAULT_RELEASE_TIMEOUT,
};
use crate::environment::{EnvironmentConfig, EnvironmentProvisioner};
use crate::error::{AppError, ErrorKind, Result};
use crate::paths::{runtime_executable, Layout};
use crate::process::{wait_for_exit, CommandSpec, OutputLine, ProcessSupervisor};
use crate::provision::{ArchiveSource, DependencyProvisioner, DependencyRelease};
use crate::server::{BindMode, PortRequest, ServerConfig, ServerManager, ServerUrls};
use crate::validation::is_valid_path;

/// How long a fresh server gets to accept connections.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Clone)]
pub struct LauncherOptions {
    /// Ports that must be used exactly, keyed by app name.
    pub required_ports: BTreeMap<String, u16>,
    pub readiness_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub release_timeout: Duration,
}

impl Default for LauncherOptions {
    fn default() -> Self {
        Self {
            required_ports: BTreeMap::new(),
            readiness_timeout: DEFAULT_READINESS_TIMEOUT,
            shutdown_timeout: Duration::from_secs(10),
            release_timeout: DEFAULT_RELEASE_TIMEOUT,
        }
    }
}

/// Live state of one hosted application.
pub struct AppRuntime {
    definition: &'static AppDefinition,
    data_dir: PathBuf,
    release_dir: PathBuf,
    server: Option<ServerManager>,
    aux: Vec<ProcessSupervisor>,
    environment: Option<EnvironmentConfig>,
    last_error: Option<String>,
}

impl AppRuntime {
    fn new(definition: &'static AppDefinition, data_dir: PathBuf, release_dir: PathBuf) -> Self {
        Self {
            definition,
            data_dir,
            release_dir,
            server: None,
            aux: Vec::new(),
            environment: None,
            last_error: None,
        }
    }

    pub fn definition(&self) -> &'static AppDefinition {
        self.definition
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn document_root(&self) -> PathBuf {
        if self.definition.document_root.is_empty() {
            self.release_dir.clone()
        } else {
            self.release_dir.join(self.definition.document_root)
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.server.as_mut().is_some_and(ServerManager::is_running)
    }

    fn local_url(&self) -> Option<String> {
        self.server
            .as_ref()
            .and_then(ServerManager::local_url)
            .map(str::to_string)
    }
}

impl DataOwner for AppRuntime {
    /// Auxiliary scripts first, then the server. Every process gets a stop
    /// attempt even when an earlier one fails.
    async fn stop(&mut self) -> Result<Vec<u32>> {
        let mut stopped = Vec::new();
        let mut first_error = None;

        for supervisor in self.aux.iter_mut().rev() {
            match supervisor.stop().await {
                Ok(pid) => stopped.extend(pid),
                Err(e) => {
                    log::error!("Failed to stop {}: {}", supervisor.label(), e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(server) = self.server.as_mut() {
            match server.stop_server().await {
                Ok(pid) => stopped.extend(pid),
                Err(e) => {
                    log::error!("Failed to stop {} server: {}", server.name(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(stopped),
        }
    }
}

/// Reachability and ownership of one hosted application.
#[derive(Debug, Clone, Serialize)]
pub struct AppStatus {
    pub name: String,
    pub display_name: String,
    pub enabled: bool,
    pub running: bool,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub urls: Option<ServerUrls>,
    pub data_dir: PathBuf,
    pub operation: OperationState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LauncherStatus {
    pub version: String,
    pub data_root: PathBuf,
    pub bind_mode: BindMode,
    pub integration_enabled: bool,
    pub apps: Vec<AppStatus>,
}

/// Orchestrates provisioning, servers and destructive operations.
pub struct Launcher {
    layout: Layout,
    settings: Arc<SettingsStore>,
    provisioner: DependencyProvisioner,
    coordinator: BackupRestoreCoordinator,
    options: LauncherOptions,
    runtime_dir: Option<PathBuf>,
    apps: Vec<AppRuntime>,
}

impl Launcher {
    pub fn new(
        layout: Layout,
        settings: Arc<SettingsStore>,
        restart: Arc<dyn RestartRequester>,
        client: Client,
        options: LauncherOptions,
    ) -> Self {
        let snapshot = settings.snapshot();
        let release_root = layout.runtime_dependencies_executing_path();
        let apps = apps::all()
            .iter()
            .map(|definition| {
                let default_dir = layout.default_app_data_dir(definition.name);
                let data_dir = match snapshot
                    .app(definition.name)
                    .and_then(|app| app.data_location.clone())
                {
                    Some(dir) if is_valid_path(&dir) => dir,
                    Some(dir) => {
                        log::warn!(
                            "Ignoring invalid {} data location {}, using {}",
                            definition.name,
                            dir.display(),
                            default_dir.display()
                        );
                        default_dir
                    }
                    None => default_dir,
                };
                AppRuntime::new(definition, data_dir, release_root.join(definition.release))
            })
            .collect();

        let coordinator =
            BackupRestoreCoordinator::new(restart).with_release_timeout(options.release_timeout);

        Self {
            layout,
            settings,
            provisioner: DependencyProvisioner::new(client),
            coordinator,
            options,
            runtime_dir: None,
            apps,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn settings(&self) -> &Arc<SettingsStore> {
        &self.settings
    }

    pub fn coordinator(&self) -> &BackupRestoreCoordinator {
        &self.coordinator
    }

    fn index_of(&self, name: &str) -> Result<usize> {
        self.apps
            .iter()
            .position(|app| app.definition.name == name)
            .ok_or_else(|| AppError::unknown_app(name))
    }

    fn is_enabled(&self, definition: &AppDefinition) -> bool {
        !definition.requires_integration || self.settings.snapshot().integration_enabled
    }

    fn release(&self, dependency: &str) -> Result<DependencyRelease> {
        DependencyRelease::new(
            &self.layout.runtime_dependencies_root(),
            self.layout.version(),
            dependency,
            ArchiveSource::File(self.layout.bundled_archive(dependency)),
        )
    }

    /// Stage dependencies, then start every enabled application in order.
    ///
    /// Only a missing runtime fails the whole start; a failing application is
    /// logged, recorded in its status and skipped.
    pub async fn start(&mut self) -> Result<()> {
        self.layout.ensure_data_root()?;

        let runtime = self.release(PHP_RUNTIME)?;
        self.runtime_dir = Some(self.provisioner.ensure_staged(&runtime).await?);

        for index in 0..self.apps.len() {
            let definition = self.apps[index].definition;
            if !self.is_enabled(definition) {
                log::info!("{} is disabled", definition.display_name);
                continue;
            }

            let staged = match self.release(definition.release) {
                Ok(release) => self.provisioner.ensure_staged(&release).await,
                Err(e) => Err(e),
            };
            let started = match staged {
                Ok(_) => self.start_app(index).await,
                Err(e) => Err(e),
            };
            if let Err(e) = started {
                log::error!("{} did not start: {}", definition.display_name, e);
                self.apps[index].last_error = Some(e.to_string());
            }
        }
        Ok(())
    }

    fn upstream_url_for(&self, definition: &AppDefinition) -> Result<Option<String>> {
        let Some(upstream) = definition.upstream else {
            return Ok(None);
        };
        let loopback = self
            .apps
            .iter()
            .find(|app| app.definition.name == upstream.app)
            .and_then(AppRuntime::local_url)
            .ok_or_else(|| {
                AppError::process(format!(
                    "{} needs {} to be running",
                    definition.name, upstream.app
                ))
            })?;
        Ok(definition.upstream_url(&loopback))
    }

    fn setup_environment(&mut self, index: usize) -> Result<EnvironmentConfig> {
        let definition = self.apps[index].definition;
        let upstream = self.upstream_url_for(definition)?;
        let app = &mut self.apps[index];
        let provisioner = EnvironmentProvisioner::new(
            definition.environment,
            app.release_dir.clone(),
            app.data_dir.clone(),
        );
        let environment = provisioner.setup(upstream.as_deref())?;
        app.environment = Some(environment.clone());
        Ok(environment)
    }

    async fn start_app(&mut self, index: usize) -> Result<()> {
        let runtime_dir = self
            .runtime_dir
            .clone()
            .ok_or_else(|| AppError::process("PHP runtime is not staged"))?;
        let runtime = runtime_executable(&runtime_dir);
        let definition = self.apps[index].definition;
        if self.coordinator.is_busy(&self.apps[index].data_dir) {
            return Err(AppError::operation_in_progress(&self.apps[index].data_dir));
        }

        let environment = self.setup_environment(index)?;
        let settings = self.settings.snapshot();
        let port = self
            .options
            .required_ports
            .get(definition.name)
            .map_or_else(
                || PortRequest::from_desired(settings.desired_port(definition.name)),
                |&port| PortRequest::Required(port),
            );
        let bind_mode = BindMode::from_external_access(settings.external_access_enabled);
        let readiness_timeout = self.options.readiness_timeout;
        let shutdown_timeout = self.options.shutdown_timeout;

        let app = &mut self.apps[index];
        app.last_error = None;
        let mut server = ServerManager::new(ServerConfig {
            name: definition.name.to_string(),
            runtime: runtime.clone(),
            document_root: app.document_root(),
            bind_mode,
            port,
        })
        .with_supervisor(
            ProcessSupervisor::new(definition.name).with_shutdown_timeout(shutdown_timeout),
        );
        server.set_environment_variables(environment.variables.clone());

        let urls = server.start_server()?.clone();
        if let Err(e) = server.wait_until_reachable(readiness_timeout).await {
            if let Err(stop_err) = server.stop_server().await {
                log::warn!("Failed to stop unreachable {}: {}", definition.name, stop_err);
            }
            return Err(e);
        }
        log::info!("{} is available at {}", definition.display_name, urls.loopback);
        for url in urls.hostname.iter().chain(urls.lan_ip.iter()) {
            log::info!("{} is available at {}", definition.display_name, url);
        }
        app.server = Some(server);

        app.aux.clear();
        for script in definition.aux_scripts {
            let label = format!("{} {}", definition.name, script);
            let mut supervisor =
                ProcessSupervisor::new(label).with_shutdown_timeout(shutdown_timeout);
            let spec = CommandSpec {
                executable: runtime.clone(),
                args: vec![app.release_dir.join(script).to_string_lossy().into_owned()],
                working_dir: app.release_dir.clone(),
                env: environment.variables.clone(),
            };
            if let Err(e) = supervisor.start(&spec) {
                log::error!("Failed to start {}: {}", supervisor.label(), e);
                app.last_error = Some(e.to_string());
            }
            app.aux.push(supervisor);
        }
        Ok(())
    }

    /// Stop every application, consumers before their upstreams, then save settings.
    pub async fn shutdown(&mut self) -> Result<()> {
        let mut first_error = None;
        for app in self.apps.iter_mut().rev() {
            if let Err(e) = app.stop().await {
                first_error.get_or_insert(e);
            }
        }
        if let Err(e) = self.settings.save() {
            log::error!("Failed to save settings: {}", e);
            first_error.get_or_insert(e);
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn snapshot(&mut self) -> LauncherStatus {
        let settings = self.settings.snapshot();
        let mut apps = Vec::with_capacity(self.apps.len());
        for index in 0..self.apps.len() {
            let enabled = self.is_enabled(self.apps[index].definition);
            let operation = self.coordinator.state(&self.apps[index].data_dir);
            let app = &mut self.apps[index];
            let pid = app.server.as_mut().and_then(ServerManager::pid);
            let (port, urls) = match (pid, app.server.as_ref()) {
                (Some(_), Some(server)) => (server.port(), server.urls().cloned()),
                _ => (None, None),
            };
            let crashed = app
                .server
                .as_ref()
                .and_then(ServerManager::last_exit)
                .map(|status| format!("server exited with {status}"));
            apps.push(AppStatus {
                name: app.definition.name.to_string(),
                display_name: app.definition.display_name.to_string(),
                enabled,
                running: pid.is_some(),
                pid,
                port,
                urls,
                data_dir: app.data_dir.clone(),
                operation,
                error: app.last_error.clone().or(crashed),
            });
        }

        LauncherStatus {
            version: self.layout.version().to_string(),
            data_root: self.layout.data_root().to_path_buf(),
            bind_mode: BindMode::from_external_access(settings.external_access_enabled),
            integration_enabled: settings.integration_enabled,
            apps,
        }
    }

    /// Captured console output of an application's server and auxiliary processes.
    pub fn output(&self, name: &str) -> Result<Vec<(String, Vec<OutputLine>)>> {
        let app = &self.apps[self.index_of(name)?];
        let mut outputs = Vec::new();
        if let Some(server) = app.server.as_ref() {
            outputs.push((server.name().to_string(), server.output().snapshot()));
        }
        for supervisor in &app.aux {
            outputs.push((supervisor.label().to_string(), supervisor.read_console_output()));
        }
        Ok(outputs)
    }

    pub fn data_dir(&self, name: &str) -> Result<&Path> {
        Ok(self.apps[self.index_of(name)?].data_dir())
    }

    pub async fn backup(&self, name: &str, archive: &Path) -> Result<()> {
        let data_dir = self.data_dir(name)?.to_path_buf();
        self.coordinator.backup(&data_dir, archive).await
    }

    pub async fn restore(&mut self, name: &str, archive: &Path) -> Result<()> {
        let index = self.index_of(name)?;
        let app = &mut self.apps[index];
        let data_dir = app.data_dir.clone();
        self.coordinator
            .restore(app, name, &data_dir, archive)
            .await
    }

    pub async fn relocate(&mut self, name: &str, to: &Path) -> Result<()> {
        let index = self.index_of(name)?;
        let settings = Arc::clone(&self.settings);
        let app = &mut self.apps[index];
        let from = app.data_dir.clone();
        let app_name = name.to_string();

        self.coordinator
            .relocate(app, name, &from, to, move |new_dir| {
                settings.update(|s| {
                    s.app_mut(&app_name).data_location = Some(new_dir.to_path_buf());
                    Ok(())
                })
            })
            .await?;
        self.apps[index].data_dir = to.to_path_buf();
        Ok(())
    }

    pub async fn wipe(&mut self, name: &str) -> Result<()> {
        let index = self.index_of(name)?;
        let app = &mut self.apps[index];
        let data_dir = app.data_dir.clone();
        let files = app.definition.database_files;
        self.coordinator.wipe(app, name, &data_dir, files).await
    }

    /// Running applications that read `name`'s URL from their environment.
    fn running_consumers_of(&mut self, name: &str) -> Vec<usize> {
        self.apps
            .iter_mut()
            .enumerate()
            .filter(|(_, app)| app.definition.upstream.is_some_and(|u| u.app == name))
            .filter_map(|(index, app)| app.is_running().then_some(index))
            .collect()
    }

    /// Replace an application's staged release and bring it back up if it was running.
    ///
    /// A restarted upstream may come back on another port, so its running
    /// consumers are stopped with it and started again afterwards.
    pub async fn update_release(&mut self, name: &str, source: &ArchiveSource) -> Result<()> {
        let index = self.index_of(name)?;
        let release = self.release(self.apps[index].definition.release)?;
        if self.coordinator.is_busy(&self.apps[index].data_dir) {
            return Err(AppError::operation_in_progress(&self.apps[index].data_dir));
        }

        let consumers = self.running_consumers_of(name);
        let was_running = self.apps[index].is_running();
        let mut pids = Vec::new();
        for &consumer in consumers.iter().rev() {
            pids.extend(self.apps[consumer].stop().await?);
        }
        pids.extend(self.apps[index].stop().await?);
        wait_for_exit(&pids, self.options.release_timeout).await?;

        let updated = self.provisioner.update_release(&release, source).await;
        if let Err(e) = &updated {
            log::error!("Update of {} failed, keeping the previous release: {}", name, e);
        }

        let restarted = if was_running {
            self.start_app(index).await
        } else if updated.is_err() {
            Ok(())
        } else {
            match self.setup_environment(index) {
                Ok(_) => Ok(()),
                // Without a running upstream the next start redoes setup anyway.
                Err(e) if e.kind() == ErrorKind::Process => {
                    log::info!("Skipping environment setup for {}: {}", name, e);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        };
        if let Err(e) = &restarted {
            self.apps[index].last_error = Some(e.to_string());
        }

        for consumer in consumers {
            if let Err(e) = self.start_app(consumer).await {
                let display_name = self.apps[consumer].definition.display_name;
                log::error!("{} did not start: {}", display_name, e);
                self.apps[consumer].last_error = Some(e.to_string());
            }
        }

        updated.and(restarted)
    }

    pub fn set_integration_enabled(&self, enabled: bool) -> Result<()> {
        self.settings.update(|s| {
            s.integration_enabled = enabled;
            Ok(())
        })?;
        self.request_restart(RestartReason::SettingsChanged);
        Ok(())
    }

    pub fn set_external_access_enabled(&self, enabled: bool) -> Result<()> {
        self.settings.update(|s| {
            s.external_access_enabled = enabled;
            Ok(())
        })?;
        self.request_restart(RestartReason::SettingsChanged);
        Ok(())
    }

    /// A port of 0 clears the preference.
    pub fn set_desired_port(&self, name: &str, port: u16) -> Result<()> {
        self.index_of(name)?;
        self.settings.update(|s| {
            s.app_mut(name).desired_port = port;
            Ok(())
        })?;
        self.request_restart(RestartReason::SettingsChanged);
        Ok(())
    }

    pub fn request_restart(&self, reason: RestartReason) {
        log::info!("Restart requested: {}", reason);
        self.coordinator.restart_requester().request_restart(reason);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingRestarts(Mutex<Vec<RestartReason>>);

    impl RestartRequester for RecordingRestarts {
        fn request_restart(&self, reason: RestartReason) {
            self.0.lock().unwrap().push(reason);
        }
    }

    fn launcher(root: &Path) -> (Launcher, Arc<RecordingRestarts>) {
        let layout = Layout::new(root.join("data"), root.join("exe"), "1.0.0");
        let settings = Arc::new(SettingsStore::load(layout.settings_path()).unwrap());
        let restarts = Arc::new(RecordingRestarts::default());
        let launcher = Launcher::new(
            layout,
            settings,
            Arc::clone(&restarts) as Arc<dyn RestartRequester>,
            Client::new(),
            LauncherOptions::default(),
        );
        (launcher, restarts)
    }

    #[test]
    fn default_data_dirs_follow_layout() {
        let root = tempfile::tempdir().unwrap();
        let (launcher, _) = launcher(root.path());
        assert_eq!(
            launcher.data_dir("grocy").unwrap(),
            root.path().join("data").join("grocy")
        );
        assert_eq!(
            launcher.data_dir("nope").unwrap_err().kind(),
            crate::error::ErrorKind::UnknownApp
        );
    }

    #[test]
    fn invalid_stored_location_falls_back_to_default() {
        let root = tempfile::tempdir().unwrap();
        let layout = Layout::new(root.path().join("data"), root.path().join("exe"), "1.0.0");
        let settings = SettingsStore::load(layout.settings_path()).unwrap();
        settings
            .update(|s| {
                s.app_mut("barcodebuddy").data_location = Some(PathBuf::from("relative/bb"));
                Ok(())
            })
            .unwrap();

        let launcher = Launcher::new(
            layout,
            Arc::new(settings),
            Arc::new(RecordingRestarts::default()),
            Client::new(),
            LauncherOptions::default(),
        );
        assert_eq!(
            launcher.data_dir("barcodebuddy").unwrap(),
            root.path().join("data").join("barcodebuddy")
        );
    }

    #[test]
    fn toggles_save_then_request_restart() {
        let root = tempfile::tempdir().unwrap();
        let (launcher, restarts) = launcher(root.path());

        launcher.set_integration_enabled(true).unwrap();
        launcher.set_desired_port("grocy", 8111).unwrap();
        assert!(launcher.set_desired_port("mealie", 1).is_err());

        let reloaded = SettingsStore::load(launcher.layout().settings_path())
            .unwrap()
            .snapshot();
        assert!(reloaded.integration_enabled);
        assert_eq!(reloaded.desired_port("grocy"), Some(8111));
        assert_eq!(restarts.0.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn snapshot_of_idle_launcher() {
        let root = tempfile::tempdir().unwrap();
        let (mut launcher, _) = launcher(root.path());

        let status = launcher.snapshot();
        assert_eq!(status.bind_mode, BindMode::Loopback);
        assert_eq!(status.apps.len(), 2);
        assert!(status.apps.iter().all(|app| !app.running && app.urls.is_none()));
        assert!(!status.apps[1].enabled);

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["apps"][0]["name"], "grocy");
        assert_eq!(json["apps"][0]["operation"], "idle");
    }

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        use std::io::Write as _;

        let mut writer = zip::ZipWriter::new(std::fs::File::create(path).unwrap());
        for (name, content) in entries {
            writer
                .start_file(*name, zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(content.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
    }

    #[tokio::test]
    async fn update_of_stopped_app_swaps_release_and_reruns_setup() {
        let root = tempfile::tempdir().unwrap();
        let (mut launcher, restarts) = launcher(root.path());
        let archive = root.path().join("grocy-4.3.0.zip");
        write_zip(
            &archive,
            &[
                ("grocy-4.3.0/public/index.html", "grocy v2"),
                ("grocy-4.3.0/config-dist.php", "<?php // v2"),
            ],
        );

        launcher
            .update_release("grocy", &ArchiveSource::File(archive))
            .await
            .unwrap();

        let release = root.path().join("data/runtime-dependencies/1.0.0/grocy");
        let data = root.path().join("data").join("grocy");
        assert_eq!(
            std::fs::read_to_string(release.join("public/index.html")).unwrap(),
            "grocy v2"
        );
        assert_eq!(
            std::fs::read_to_string(release.join("embedded.txt")).unwrap(),
            data.to_string_lossy()
        );
        assert!(data.join("config.php").is_file());
        assert!(!launcher.snapshot().apps[0].running);
        assert!(restarts.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_update_reports_provision_error() {
        let root = tempfile::tempdir().unwrap();
        let (mut launcher, _) = launcher(root.path());

        let err = launcher
            .update_release("grocy", &ArchiveSource::File(root.path().join("absent.zip")))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provision);
        assert!(!root.path().join("data/runtime-dependencies/1.0.0/grocy").exists());
    }

    #[tokio::test]
    async fn start_without_bundled_runtime_is_a_provision_failure() {
        let root = tempfile::tempdir().unwrap();
        let (mut launcher, _) = launcher(root.path());

        let err = launcher.start().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Provision);
        launcher.shutdown().await.unwrap();
    }
}
