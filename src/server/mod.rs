//! PHP development server supervision: port selection, bind policy and published URLs.

mod network;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{AppError, Result};
use crate::process::{
    find_available_port, is_port_available, CommandSpec, OutputBuffer, ProcessSupervisor,
};

pub use network::HostInfo;

/// Initial delay between readiness probes; doubles up to `MAX_PROBE_INTERVAL`.
const INITIAL_PROBE_INTERVAL: Duration = Duration::from_millis(100);
const MAX_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Which interfaces the server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMode {
    Loopback,
    AllInterfaces,
}

impl BindMode {
    /// All interfaces only when the user enabled external access.
    pub fn from_external_access(enabled: bool) -> Self {
        if enabled {
            Self::AllInterfaces
        } else {
            Self::Loopback
        }
    }

    pub fn host(self) -> Ipv4Addr {
        match self {
            Self::Loopback => Ipv4Addr::LOCALHOST,
            Self::AllInterfaces => Ipv4Addr::UNSPECIFIED,
        }
    }
}

/// How strongly a particular port is wanted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRequest {
    /// Any free port.
    Any,
    /// Use this port when free, otherwise fall back to any free port.
    Preferred(u16),
    /// Use exactly this port or fail.
    Required(u16),
}

impl PortRequest {
    /// A settings value of 0 means no preference.
    pub fn from_desired(port: Option<u16>) -> Self {
        match port {
            Some(port) if port > 0 => Self::Preferred(port),
            _ => Self::Any,
        }
    }
}

/// Resolve the port a server will bind to.
pub fn select_port(request: PortRequest, mode: BindMode) -> Result<u16> {
    let host = mode.host();
    match request {
        PortRequest::Any => find_available_port(host),
        PortRequest::Preferred(port) => {
            if is_port_available(host, port) {
                Ok(port)
            } else {
                log::info!("Port {} is taken, picking a free one", port);
                find_available_port(host)
            }
        }
        PortRequest::Required(port) => {
            if is_port_available(host, port) {
                Ok(port)
            } else {
                Err(AppError::port_unavailable(port))
            }
        }
    }
}

/// URLs under which a running server can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerUrls {
    pub loopback: String,
    pub hostname: Option<String>,
    pub lan_ip: Option<String>,
}

impl ServerUrls {
    /// Hostname and LAN URLs exist only when the server listens on all interfaces.
    pub fn derive(port: u16, mode: BindMode, host: &HostInfo) -> Self {
        let loopback = format!("http://127.0.0.1:{port}/");
        match mode {
            BindMode::Loopback => Self {
                loopback,
                hostname: None,
                lan_ip: None,
            },
            BindMode::AllInterfaces => Self {
                loopback,
                hostname: host
                    .hostname
                    .as_ref()
                    .map(|name| format!("http://{name}:{port}/")),
                lan_ip: host.lan_ip.map(|ip| match ip {
                    IpAddr::V4(v4) => format!("http://{v4}:{port}/"),
                    IpAddr::V6(v6) => format!("http://[{v6}]:{port}/"),
                }),
            },
        }
    }
}

/// Static description of one PHP development server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub name: String,
    pub runtime: PathBuf,
    pub document_root: PathBuf,
    pub bind_mode: BindMode,
    pub port: PortRequest,
}

/// Owns one PHP built-in web server process.
pub struct ServerManager {
    config: ServerConfig,
    env: BTreeMap<String, String>,
    supervisor: ProcessSupervisor,
    port: Option<u16>,
    urls: Option<ServerUrls>,
}

impl ServerManager {
    pub fn new(config: ServerConfig) -> Self {
        let supervisor = ProcessSupervisor::new(config.name.clone());
        Self {
            config,
            env: BTreeMap::new(),
            supervisor,
            port: None,
            urls: None,
        }
    }

    pub fn with_supervisor(mut self, supervisor: ProcessSupervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn bind_mode(&self) -> BindMode {
        self.config.bind_mode
    }

    /// Takes effect on the next `start_server`; a running process keeps its environment.
    pub fn set_environment_variables(&mut self, env: BTreeMap<String, String>) {
        self.env = env;
    }

    fn command_for(&self, port: u16) -> CommandSpec {
        CommandSpec {
            executable: self.config.runtime.clone(),
            args: vec![
                "-S".to_string(),
                SocketAddr::from((self.config.bind_mode.host(), port)).to_string(),
                "-t".to_string(),
                self.config.document_root.to_string_lossy().into_owned(),
            ],
            working_dir: self.config.document_root.clone(),
            env: self.env.clone(),
        }
    }

    /// Select a port, spawn the server and publish its URLs.
    pub fn start_server(&mut self) -> Result<&ServerUrls> {
        if let Some(pid) = self.supervisor.running_pid() {
            return Err(AppError::already_running(pid));
        }
        if !self.config.document_root.is_dir() {
            return Err(AppError::process_spawn(
                &self.config.runtime,
                format!(
                    "document root {} does not exist",
                    self.config.document_root.display()
                ),
            ));
        }

        let port = select_port(self.config.port, self.config.bind_mode)?;
        let spec = self.command_for(port);
        let pid = self.supervisor.start(&spec)?;

        log::info!(
            "{} server listening on {}:{} (pid: {})",
            self.config.name,
            self.config.bind_mode.host(),
            port,
            pid
        );
        self.port = Some(port);
        let host = match self.config.bind_mode {
            BindMode::Loopback => HostInfo::default(),
            BindMode::AllInterfaces => HostInfo::detect(),
        };
        Ok(self
            .urls
            .insert(ServerUrls::derive(port, self.config.bind_mode, &host)))
    }

    /// Poll until the loopback port accepts connections or the process dies.
    pub async fn wait_until_reachable(&mut self, timeout: Duration) -> Result<()> {
        let port = self
            .port
            .ok_or_else(|| AppError::process(format!("{} was never started", self.name())))?;
        let deadline = Instant::now() + timeout;
        let mut interval = INITIAL_PROBE_INTERVAL;

        loop {
            if self.supervisor.running_pid().is_none() {
                let tail = self
                    .supervisor
                    .read_console_output()
                    .into_iter()
                    .rev()
                    .take(5)
                    .map(|line| line.text)
                    .collect::<Vec<_>>();
                return Err(AppError::process_spawn(
                    &self.config.runtime,
                    format!("exited during startup: {}", tail.join(" | ")),
                ));
            }
            if tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port))
                .await
                .is_ok()
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(AppError::process_spawn(
                    &self.config.runtime,
                    format!("port {port} not reachable after {}s", timeout.as_secs()),
                ));
            }
            tokio::time::sleep(interval).await;
            interval = (interval * 2).min(MAX_PROBE_INTERVAL);
        }
    }

    /// Stop the server; a never-started or already-exited server is a no-op.
    pub async fn stop_server(&mut self) -> Result<Option<u32>> {
        let stopped = self.supervisor.stop().await?;
        self.urls = None;
        Ok(stopped)
    }

    pub fn is_running(&mut self) -> bool {
        self.supervisor.is_running()
    }

    pub fn pid(&mut self) -> Option<u32> {
        self.supervisor.running_pid()
    }

    /// Port of the last start; re-resolved on every fresh start.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn urls(&self) -> Option<&ServerUrls> {
        self.urls.as_ref()
    }

    pub fn local_url(&self) -> Option<&str> {
        self.urls.as_ref().map(|urls| urls.loopback.as_str())
    }

    pub fn output(&self) -> &OutputBuffer {
        self.supervisor.output()
    }

    /// Exit status when the server died without being stopped.
    pub fn last_exit(&self) -> Option<ExitStatus> {
        self.supervisor.last_exit()
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;

    fn host() -> HostInfo {
        HostInfo {
            hostname: Some("pantry".to_string()),
            lan_ip: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40))),
        }
    }

    #[test]
    fn loopback_publishes_only_loopback_url() {
        let urls = ServerUrls::derive(8111, BindMode::Loopback, &host());
        assert_eq!(urls.loopback, "http://127.0.0.1:8111/");
        assert_eq!(urls.hostname, None);
        assert_eq!(urls.lan_ip, None);
    }

    #[test]
    fn all_interfaces_publishes_three_urls_on_one_port() {
        let urls = ServerUrls::derive(8111, BindMode::AllInterfaces, &host());
        assert_eq!(urls.loopback, "http://127.0.0.1:8111/");
        assert_eq!(urls.hostname.as_deref(), Some("http://pantry:8111/"));
        assert_eq!(urls.lan_ip.as_deref(), Some("http://192.168.1.40:8111/"));
    }

    #[test]
    fn occupied_preferred_port_is_replaced() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();

        let port = select_port(PortRequest::Preferred(taken), BindMode::Loopback).unwrap();
        assert_ne!(port, taken);
        assert!(is_port_available(Ipv4Addr::LOCALHOST, port));
    }

    #[test]
    fn occupied_required_port_is_surfaced() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let taken = listener.local_addr().unwrap().port();

        let err = select_port(PortRequest::Required(taken), BindMode::Loopback).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PortUnavailable);
    }

    #[test]
    fn free_preferred_port_is_kept() {
        let free = find_available_port(Ipv4Addr::LOCALHOST).unwrap();
        assert_eq!(
            select_port(PortRequest::Preferred(free), BindMode::Loopback).unwrap(),
            free
        );
    }

    #[test]
    fn bind_mode_follows_external_access() {
        assert_eq!(BindMode::from_external_access(false), BindMode::Loopback);
        assert_eq!(
            BindMode::from_external_access(true).host(),
            Ipv4Addr::UNSPECIFIED
        );
        assert_eq!(PortRequest::from_desired(Some(0)), PortRequest::Any);
    }

    #[test]
    fn command_line_targets_document_root() {
        let manager = ServerManager::new(ServerConfig {
            name: "grocy".to_string(),
            runtime: PathBuf::from("/rt/php"),
            document_root: PathBuf::from("/rel/grocy/public"),
            bind_mode: BindMode::Loopback,
            port: PortRequest::Any,
        });
        let spec = manager.command_for(8111);
        assert_eq!(spec.args, ["-S", "127.0.0.1:8111", "-t", "/rel/grocy/public"]);
        assert_eq!(spec.working_dir, PathBuf::from("/rel/grocy/public"));
    }

    #[tokio::test]
    async fn stop_before_start_is_tolerated() {
        let mut manager = ServerManager::new(ServerConfig {
            name: "idle".to_string(),
            runtime: PathBuf::from("/rt/php"),
            document_root: PathBuf::from("/nowhere"),
            bind_mode: BindMode::Loopback,
            port: PortRequest::Any,
        });
        assert_eq!(manager.stop_server().await.unwrap(), None);
        assert!(manager.urls().is_none());
    }
}
