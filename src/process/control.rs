//! Platform-agnostic process control functions.

use std::net::{Ipv4Addr, TcpListener};
use std::time::{Duration, Instant};

use crate::error::{AppError, Result};

/// Interval between liveness polls while waiting for a process to go away.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Check if a process is alive by PID.
#[cfg(target_os = "windows")]
pub fn is_process_alive(pid: u32) -> bool {
    super::win_api::is_process_alive(pid)
}

/// Check if a process is alive by PID.
#[cfg(not(target_os = "windows"))]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Ask a process to terminate without forcing it.
#[cfg(target_os = "windows")]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T"])
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(AppError::process(format!(
            "taskkill refused to signal pid {}: {}",
            pid,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// Send SIGTERM to the process group led by `pid`, or to `pid` alone.
#[cfg(not(target_os = "windows"))]
pub(super) fn graceful_signal(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    let result = match getpgid(Some(target)) {
        Ok(pgid) if pgid == target => killpg(pgid, Signal::SIGTERM),
        _ => kill(target, Signal::SIGTERM),
    };
    result.map_err(|e| AppError::process(format!("Failed to send SIGTERM to PID {}: {}", pid, e)))
}

#[cfg(target_os = "windows")]
pub fn force_kill(pid: u32) -> Result<()> {
    let output = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .output()
        .map_err(|e| AppError::process(format!("Failed to run taskkill: {e}")))?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(AppError::process(format!(
            "taskkill failed for pid {}: {}",
            pid,
            stderr.trim()
        )))
    }
}

#[cfg(not(target_os = "windows"))]
pub fn force_kill(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, killpg, Signal};
    use nix::unistd::{getpgid, Pid};

    let target = Pid::from_raw(pid as i32);
    match getpgid(Some(target)) {
        Ok(pgid) if pgid == target => killpg(pgid, Signal::SIGKILL).map_err(|e| {
            AppError::process(format!("Failed to kill process group {}: {}", pgid.as_raw(), e))
        }),
        _ => kill(target, Signal::SIGKILL)
            .map_err(|e| AppError::process(format!("Failed to kill process {}: {}", pid, e))),
    }
}

/// Poll until none of `pids` is alive, failing once `timeout` elapses.
pub async fn wait_for_exit(pids: &[u32], timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        let Some(&alive) = pids.iter().find(|&&pid| is_process_alive(pid)) else {
            return Ok(());
        };
        if Instant::now() >= deadline {
            return Err(AppError::shutdown_timeout(alive));
        }
        tokio::time::sleep(EXIT_POLL_INTERVAL).await;
    }
}

/// Whether `port` can currently be bound on `host`.
pub fn is_port_available(host: Ipv4Addr, port: u16) -> bool {
    TcpListener::bind((host, port)).is_ok()
}

/// Ask the OS for an ephemeral port that is free on `host`.
pub fn find_available_port(host: Ipv4Addr) -> Result<u16> {
    if let Some(port) = portpicker::pick_unused_port() {
        if is_port_available(host, port) {
            return Ok(port);
        }
    }
    let listener = TcpListener::bind((host, 0))
        .map_err(|e| AppError::process(format!("No free port on {host}: {e}")))?;
    Ok(listener.local_addr()?.port())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn occupied_port_is_reported() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(Ipv4Addr::LOCALHOST, port));
        drop(listener);
    }

    #[test]
    fn found_port_is_bindable() {
        let port = find_available_port(Ipv4Addr::LOCALHOST).unwrap();
        assert!(port > 0);
        assert!(is_port_available(Ipv4Addr::LOCALHOST, port));
    }

    #[tokio::test]
    async fn waiting_on_dead_pid_returns_immediately() {
        let mut child = std::process::Command::new(if cfg!(windows) { "cmd" } else { "true" })
            .args(if cfg!(windows) { vec!["/C", "exit 0"] } else { vec![] })
            .spawn()
            .unwrap();
        let pid = child.id();
        child.wait().unwrap();
        wait_for_exit(&[pid], Duration::from_millis(200)).await.unwrap();
    }
}
