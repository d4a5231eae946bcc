//! Signal delivery and graceful-then-forceful termination.

use std::time::Duration;

use thiserror::Error;
use tokio::process::Child;

use crate::process_monitor;
use crate::supervisor::error::SupervisorError;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("process {pid} not found")]
    NotFound { pid: u32 },
    #[error("failed to signal process {pid}: {reason}")]
    SignalFailed { pid: u32, reason: String },
}

/// How long to wait for a polite exit before escalating.
#[derive(Debug, Clone, Copy)]
pub struct StopPolicy {
    pub poll_interval: Duration,
    pub attempts: u32,
}

impl Default for StopPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            attempts: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Gone before any signal was sent.
    AlreadyExited,
    /// Exited within the polling window after the polite signal.
    Exited,
    /// Needed the forceful kill.
    Killed,
}

/// Politely ask a process to exit (SIGTERM; TerminateProcess on Windows).
pub fn send_terminate(pid: u32) -> Result<(), ProcessError> {
    signal_pid(pid, false)
}

/// Force-kill a process by PID. Cross-platform helper.
pub fn force_kill_pid(pid: u32) -> Result<(), ProcessError> {
    signal_pid(pid, true)
}

#[cfg(not(target_os = "windows"))]
fn signal_pid(pid: u32, force: bool) -> Result<(), ProcessError> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    tracing::debug!("Sending {:?} to pid {}", signal, pid);
    match signal::kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        Err(nix::errno::Errno::ESRCH) => Err(ProcessError::NotFound { pid }),
        Err(e) => Err(ProcessError::SignalFailed {
            pid,
            reason: e.to_string(),
        }),
    }
}

#[cfg(target_os = "windows")]
fn signal_pid(pid: u32, force: bool) -> Result<(), ProcessError> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    // Windows has no polite signal for console-less children
    let exit_code = if force { 1 } else { 0 };
    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(ProcessError::NotFound { pid });
        }
        let result = TerminateProcess(handle, exit_code);
        CloseHandle(handle);
        if result == 0 {
            return Err(ProcessError::SignalFailed {
                pid,
                reason: "TerminateProcess failed".to_string(),
            });
        }
    }
    Ok(())
}

/// Liveness through the in-memory handle when there is one (this also reaps
/// the child), otherwise through the OS process table.
pub fn is_alive(pid: u32, child: Option<&mut Child>) -> bool {
    match child {
        Some(child) => match child.try_wait() {
            Ok(Some(_)) => false,
            Ok(None) => true,
            Err(_) => process_monitor::is_running(pid),
        },
        None => process_monitor::is_running(pid),
    }
}

/// Send the polite signal, poll for exit, then escalate to a forceful kill.
pub async fn terminate_gracefully(
    name: &str,
    pid: u32,
    mut child: Option<&mut Child>,
    policy: StopPolicy,
) -> Result<TerminationOutcome, ProcessError> {
    if !is_alive(pid, child.as_deref_mut()) {
        return Ok(TerminationOutcome::AlreadyExited);
    }

    tracing::info!("Stopping '{}' (pid {})", name, pid);
    match send_terminate(pid) {
        Ok(()) => {}
        Err(ProcessError::NotFound { .. }) => return Ok(TerminationOutcome::AlreadyExited),
        Err(e) => return Err(e),
    }

    for _ in 0..policy.attempts {
        tokio::time::sleep(policy.poll_interval).await;
        if !is_alive(pid, child.as_deref_mut()) {
            tracing::info!("'{}' (pid {}) exited", name, pid);
            return Ok(TerminationOutcome::Exited);
        }
    }

    let timeout = SupervisorError::GracefulStopTimeout {
        name: name.to_string(),
        pid,
        attempts: policy.attempts,
    };
    tracing::warn!("[{}] {}", timeout.error_code(), timeout);

    match force_kill_pid(pid) {
        Ok(()) | Err(ProcessError::NotFound { .. }) => {}
        Err(e) => return Err(e),
    }

    match child {
        Some(child) => {
            let _ = child.wait().await;
        }
        None => {
            for _ in 0..policy.attempts.max(1) {
                if !process_monitor::is_running(pid) {
                    break;
                }
                tokio::time::sleep(policy.poll_interval).await;
            }
        }
    }
    Ok(TerminationOutcome::Killed)
}
