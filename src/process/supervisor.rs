//! A single supervised child process with captured console output.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::{Child, Command};

use super::control::{force_kill, graceful_signal};
use super::output::{OutputBuffer, OutputLine, Stream};
use super::{DEFAULT_OUTPUT_CAPACITY, FORCE_KILL_TIMEOUT, GRACEFUL_SHUTDOWN_TIMEOUT};
use crate::error::{AppError, Result};

/// Everything needed to launch a process.
#[derive(Debug, Clone, Default)]
pub struct CommandSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
}

/// Owns at most one OS process at a time and drains its output in the background.
pub struct ProcessSupervisor {
    label: String,
    child: Option<Child>,
    last_exit: Option<ExitStatus>,
    output: OutputBuffer,
    shutdown_timeout: Duration,
}

impl ProcessSupervisor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            child: None,
            last_exit: None,
            output: OutputBuffer::new(DEFAULT_OUTPUT_CAPACITY),
            shutdown_timeout: GRACEFUL_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Spawn the process described by `spec`. Must be called inside a Tokio runtime.
    pub fn start(&mut self, spec: &CommandSpec) -> Result<u32> {
        if let Some(pid) = self.running_pid() {
            return Err(AppError::already_running(pid));
        }
        self.child = None;
        self.last_exit = None;

        if !spec.executable.is_file() {
            return Err(AppError::process_spawn(
                &spec.executable,
                "executable not found",
            ));
        }

        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(target_os = "windows")]
        {
            use windows::Win32::System::Threading::CREATE_NO_WINDOW;
            cmd.creation_flags(CREATE_NO_WINDOW.0);
        }

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| AppError::process_spawn(&spec.executable, e.to_string()))?;
        let pid = child
            .id()
            .ok_or_else(|| AppError::process("Failed to get process ID"))?;

        self.output.clear();
        if let Some(stdout) = child.stdout.take() {
            self.spawn_reader(Stream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_reader(Stream::Stderr, stderr);
        }

        log::info!("Started {} (pid: {})", self.label, pid);
        self.child = Some(child);
        Ok(pid)
    }

    fn spawn_reader<R>(&self, stream: Stream, pipe: R)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let label = self.label.clone();
        let output = self.output.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&buf)
                            .trim_end_matches(['\r', '\n'])
                            .to_string();
                        match stream {
                            Stream::Stdout => log::debug!("[{} stdout] {}", label, text),
                            Stream::Stderr => log::debug!("[{} stderr] {}", label, text),
                        }
                        output.push(stream, text);
                    }
                    Err(e) => {
                        log::warn!("Stopped reading {} output: {}", label, e);
                        break;
                    }
                }
            }
        });
    }

    /// PID of the live child, if one is running. An exited child is reaped and released.
    pub fn running_pid(&mut self) -> Option<u32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(None) => child.id(),
            Ok(Some(status)) => {
                log::info!("{} exited with {}", self.label, status);
                self.child = None;
                self.last_exit = Some(status);
                None
            }
            Err(e) => {
                log::warn!("Failed to query {} status: {}", self.label, e);
                None
            }
        }
    }

    pub fn is_running(&mut self) -> bool {
        self.running_pid().is_some()
    }

    /// Request graceful termination, force-kill after the bounded wait, and reap the child.
    ///
    /// Returns the PID that was stopped, or `None` when nothing was started.
    pub async fn stop(&mut self) -> Result<Option<u32>> {
        let Some(mut child) = self.child.take() else {
            return Ok(None);
        };
        let Some(pid) = child.id() else {
            return Ok(None);
        };
        if matches!(child.try_wait(), Ok(Some(_))) {
            return Ok(Some(pid));
        }

        if let Err(e) = graceful_signal(pid) {
            log::warn!("{}, will force kill immediately", e);
        } else if let Ok(status) = tokio::time::timeout(self.shutdown_timeout, child.wait()).await
        {
            log::info!("Stopped {} (pid: {}, {:?})", self.label, pid, status.ok());
            return Ok(Some(pid));
        } else {
            log::warn!(
                "{} (pid: {}) did not exit within {}s, force killing",
                self.label,
                pid,
                self.shutdown_timeout.as_secs_f32()
            );
        }

        if let Err(e) = force_kill(pid) {
            log::error!("Failed to force kill {} (pid: {}): {}", self.label, pid, e);
            let _ = child.start_kill();
        }
        match tokio::time::timeout(FORCE_KILL_TIMEOUT, child.wait()).await {
            Ok(_) => Ok(Some(pid)),
            Err(_) => Err(AppError::shutdown_timeout(pid)),
        }
    }

    /// Exit status of a child that ended on its own since the last start.
    pub fn last_exit(&self) -> Option<ExitStatus> {
        self.last_exit
    }

    pub fn output(&self) -> &OutputBuffer {
        &self.output
    }

    /// Captured output lines since the last start, oldest first.
    pub fn read_console_output(&self) -> Vec<OutputLine> {
        self.output.snapshot()
    }
}
