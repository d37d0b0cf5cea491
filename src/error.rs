//! Application error types.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;

/// Launcher error that can be serialized for a shell to render.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Path is unrooted or contains characters the filesystem rejects
    InvalidPath,
    /// Hosted application name is not defined
    UnknownApp,
    /// Runtime executable is missing or the OS refused to spawn it
    ProcessSpawn,
    /// A supervised process is already running
    AlreadyRunning,
    /// Process did not exit within the bounded wait
    ShutdownTimeout,
    /// Generic process control failure
    Process,
    /// Requested port is taken
    PortUnavailable,
    /// Dependency archive missing or corrupt
    Provision,
    /// Backup, restore, relocate or wipe failed partway
    Mutation,
    /// Another destructive operation holds the data directory
    OperationInProgress,
    /// Settings error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidPath => 1001,
            Self::UnknownApp => 1002,
            Self::ProcessSpawn => 2001,
            Self::AlreadyRunning => 2002,
            Self::ShutdownTimeout => 2003,
            Self::Process => 2004,
            Self::PortUnavailable => 2005,
            Self::Provision => 3001,
            Self::Mutation => 4001,
            Self::OperationInProgress => 4002,
            Self::Config => 5001,
            Self::Io => 5002,
            Self::Network => 5003,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn invalid_path(path: impl AsRef<Path>) -> Self {
        Self::new(
            ErrorKind::InvalidPath,
            HashMap::from([(
                "path".to_string(),
                path.as_ref().to_string_lossy().into_owned(),
            )]),
        )
    }

    pub fn unknown_app(name: &str) -> Self {
        Self::new(
            ErrorKind::UnknownApp,
            HashMap::from([("app".to_string(), name.to_string())]),
        )
    }

    pub fn process_spawn(executable: impl AsRef<Path>, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::ProcessSpawn,
            HashMap::from([
                (
                    "executable".to_string(),
                    executable.as_ref().display().to_string(),
                ),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn already_running(pid: u32) -> Self {
        Self::new(
            ErrorKind::AlreadyRunning,
            HashMap::from([("pid".to_string(), pid.to_string())]),
        )
    }

    pub fn shutdown_timeout(pid: u32) -> Self {
        Self::new(
            ErrorKind::ShutdownTimeout,
            HashMap::from([("pid".to_string(), pid.to_string())]),
        )
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn port_unavailable(port: u16) -> Self {
        Self::new(
            ErrorKind::PortUnavailable,
            HashMap::from([("port".to_string(), port.to_string())]),
        )
    }

    pub fn provision(dependency: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Provision,
            HashMap::from([
                ("dependency".to_string(), dependency.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn mutation(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Mutation, message)
    }

    pub fn operation_in_progress(data_dir: impl AsRef<Path>) -> Self {
        Self::new(
            ErrorKind::OperationInProgress,
            HashMap::from([(
                "data_dir".to_string(),
                data_dir.as_ref().display().to_string(),
            )]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn network_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Network,
            HashMap::from([
                ("url".to_string(), url.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn payload(&self) -> &HashMap<String, String> {
        &self.payload
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<zip::result::ZipError> for AppError {
    fn from(err: zip::result::ZipError) -> Self {
        Self::io(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;
