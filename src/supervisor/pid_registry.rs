//! PID file registry.
//!
//! One file per managed process holds the pid of its most recent instance.
//! The first line is the pid; later lines are free-form metadata (the
//! inference engine keeps its model path there) and are ignored here.
//!
//! A precise stop only signals a recorded pid after confirming the process is
//! alive and that its command line still matches the service signature. A
//! live but unrelated process (pid reuse) is reported and left alone.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

use crate::port;
use crate::process_monitor::{self, RunningProcess};
use crate::supervisor::error::SupervisorError;
use crate::supervisor::managed_process::{CommandSignature, ManagedProcess};
use crate::supervisor::process::{self, StopPolicy, TerminationOutcome};

/// Result of validating a PID file against the process table.
#[derive(Debug)]
pub enum PidStatus {
    /// PID file doesn't exist
    NotFound,
    /// PID file was unreadable, empty or pointed at a dead process; removed
    StaleRemoved,
    /// Live process whose command line matches the signature
    Verified(RunningProcess),
    /// Live process that is not ours
    Mismatch { pid: u32, cmdline: String },
}

/// What a precise stop did for one managed process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NotRecorded,
    StaleRemoved,
    Stopped(TerminationOutcome),
    Mismatch { pid: u32 },
    Failed(String),
}

/// Write PID to a file, creating its directory and replacing prior content.
pub fn write_pid(pid_file: &Path, pid: u32) -> io::Result<()> {
    if let Some(parent) = pid_file.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(pid_file, format!("{}\n", pid))
}

/// Read the pid from the first line. `Ok(None)` when the file is missing,
/// empty or not a number.
pub fn read_pid(pid_file: &Path) -> io::Result<Option<u32>> {
    let content = match fs::read_to_string(pid_file) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    Ok(content
        .lines()
        .next()
        .and_then(|line| line.trim().parse::<u32>().ok())
        .filter(|pid| *pid > 0))
}

/// Remove a PID file. Absence is fine; other failures are logged.
pub fn remove_pid(pid_file: &Path) {
    match fs::remove_file(pid_file) {
        Ok(()) => tracing::debug!("Removed {}", pid_file.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Failed to remove {}: {}", pid_file.display(), e),
    }
}

/// Check a PID file against the live process table. Stale files are removed.
pub fn check_pid_file(pid_file: &Path, signature: &CommandSignature) -> PidStatus {
    if !pid_file.exists() {
        return PidStatus::NotFound;
    }

    let pid = match read_pid(pid_file) {
        Ok(Some(pid)) => pid,
        Ok(None) => {
            tracing::warn!("Invalid PID file {}, removing", pid_file.display());
            remove_pid(pid_file);
            return PidStatus::StaleRemoved;
        }
        Err(e) => {
            tracing::warn!("Unreadable PID file {}: {}, removing", pid_file.display(), e);
            remove_pid(pid_file);
            return PidStatus::StaleRemoved;
        }
    };

    if !process_monitor::is_running(pid) {
        tracing::info!("Stale PID {} in {}, removing", pid, pid_file.display());
        remove_pid(pid_file);
        return PidStatus::StaleRemoved;
    }

    match process_monitor::lookup(pid) {
        Some(proc) if signature.matches(&proc.cmdline()) => PidStatus::Verified(proc),
        Some(proc) => PidStatus::Mismatch {
            pid,
            cmdline: proc.cmdline(),
        },
        // exited between the two checks
        None => {
            remove_pid(pid_file);
            PidStatus::StaleRemoved
        }
    }
}

/// Precise and sweeping stops over recorded processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct PidRegistry {
    pub policy: StopPolicy,
}

impl PidRegistry {
    pub fn new(policy: StopPolicy) -> Self {
        Self { policy }
    }

    /// Stop one managed process. The in-memory handle wins over the PID file;
    /// without a handle the recorded pid must pass identity verification.
    /// Never fails: problems are logged and reported in the outcome.
    pub async fn deregister(&self, proc: &mut ManagedProcess) -> StopOutcome {
        if let Some(mut handle) = proc.handle.take() {
            let outcome =
                process::terminate_gracefully(&proc.name, handle.pid, Some(&mut handle.child), self.policy)
                    .await;
            return match outcome {
                Ok(outcome) => {
                    remove_pid(&proc.pid_file);
                    StopOutcome::Stopped(outcome)
                }
                Err(e) => {
                    tracing::error!("Failed to stop '{}' (pid {}): {}", proc.name, handle.pid, e);
                    proc.handle = Some(handle);
                    StopOutcome::Failed(e.to_string())
                }
            };
        }
        self.stop_recorded(&proc.name, &proc.pid_file, &proc.signature).await
    }

    /// Stop the process recorded in `pid_file` if it still is `name`.
    pub async fn stop_recorded(
        &self,
        name: &str,
        pid_file: &Path,
        signature: &CommandSignature,
    ) -> StopOutcome {
        match check_pid_file(pid_file, signature) {
            PidStatus::NotFound => StopOutcome::NotRecorded,
            PidStatus::StaleRemoved => StopOutcome::StaleRemoved,
            PidStatus::Mismatch { pid, cmdline } => {
                let err = SupervisorError::StopMismatch {
                    name: name.to_string(),
                    pid,
                    pid_file: pid_file.to_path_buf(),
                    expected: signature.to_string(),
                };
                tracing::warn!("[{}] {} (running: {})", err.error_code(), err, cmdline);
                StopOutcome::Mismatch { pid }
            }
            PidStatus::Verified(running) => {
                match process::terminate_gracefully(name, running.pid, None, self.policy).await {
                    Ok(outcome) => {
                        remove_pid(pid_file);
                        StopOutcome::Stopped(outcome)
                    }
                    Err(e) => {
                        tracing::error!("Failed to stop '{}' (pid {}): {}", name, running.pid, e);
                        StopOutcome::Failed(e.to_string())
                    }
                }
            }
        }
    }

    /// Broad best-effort sweep: every process whose command line matches one
    /// of `signatures`, plus every listener on `ports`. Returns the pids that
    /// were stopped.
    pub async fn sweep(&self, signatures: &[(String, CommandSignature)], ports: &[u16]) -> Vec<u32> {
        let own_pid = std::process::id();
        let mut targets: BTreeMap<u32, String> = BTreeMap::new();

        for (name, signature) in signatures {
            for proc in process_monitor::find_by_signature(signature) {
                targets.entry(proc.pid).or_insert_with(|| name.clone());
            }
        }
        for &port_number in ports {
            for pid in port::listening_pids(port_number) {
                targets
                    .entry(pid)
                    .or_insert_with(|| format!("listener on port {}", port_number));
            }
        }
        targets.remove(&own_pid);

        let mut stopped = Vec::new();
        for (pid, label) in targets {
            match process::terminate_gracefully(&label, pid, None, self.policy).await {
                Ok(TerminationOutcome::AlreadyExited) => {}
                Ok(_) => stopped.push(pid),
                Err(e) => tracing::warn!("Sweep could not stop {} (pid {}): {}", label, pid, e),
            }
        }
        tracing::info!("Sweep stopped {} process(es)", stopped.len());
        stopped
    }
}
