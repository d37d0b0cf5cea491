mod archive;
mod commands;
mod error;
mod lock;
mod validation;

pub mod apps;
pub mod config;
pub mod coordinator;
pub mod environment;
pub mod launcher;
pub mod paths;
pub mod process;
pub mod provision;
pub mod server;

use std::process::ExitCode;

use clap::Parser as _;

pub use commands::{Action, Cli, Command};
pub use config::{AppSettings, SettingsStore, UserSettings};
pub use coordinator::{
    BackupRestoreCoordinator, DataOwner, OperationState, RestartReason, RestartRequester,
};
pub use environment::{EnvironmentConfig, EnvironmentProvisioner};
pub use error::{AppError, ErrorKind, Result};
pub use launcher::{AppStatus, Launcher, LauncherOptions, LauncherStatus};
pub use paths::Layout;
pub use process::{CommandSpec, ProcessSupervisor};
pub use provision::{ArchiveSource, DependencyProvisioner, DependencyRelease};
pub use server::{BindMode, PortRequest, ServerConfig, ServerManager, ServerUrls};

pub fn run() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to start async runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(commands::dispatch(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
