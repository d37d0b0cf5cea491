//! Process management utilities.

mod control;
mod output;
mod supervisor;

#[cfg(target_os = "windows")]
pub(crate) mod win_api;

use std::time::Duration;

pub use control::{
    find_available_port, force_kill, is_port_available, is_process_alive, wait_for_exit,
};
pub use output::{OutputBuffer, OutputLine, Stream};
pub use supervisor::{CommandSpec, ProcessSupervisor};

/// Timeout for graceful shutdown before force killing.
const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// How long to wait for the OS to reap a force-killed process.
const FORCE_KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Lines of console output retained per process.
const DEFAULT_OUTPUT_CAPACITY: usize = 2000;
