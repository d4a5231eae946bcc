//! Managed Process - identity of one supervised service and its launcher.
//!
//! A [`ManagedProcess`] is built from static configuration at startup. Launching
//! it:
//! - rotates its log and appends a start header
//! - spawns the command with stdout/stderr appended to that log
//! - records the pid in the PID file and in the in-memory handle
//! - waits a short grace window and fails if the process already exited

use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use regex::Regex;
use tokio::process::{Child, Command as TokioCommand};

use crate::config::ServiceConfig;
use crate::logrotate::{self, LogFile};
use crate::supervisor::error::{Result, SupervisorError};
use crate::supervisor::pid_registry;

// ─── Command Signature ───────────────────────────────────────

/// Identifies a managed process among all OS processes.
///
/// Plain text matches as a substring of the space-joined command line;
/// `re:<pattern>` is compiled as a regular expression.
#[derive(Debug, Clone)]
pub enum CommandSignature {
    Substring(String),
    Pattern(Regex),
}

impl CommandSignature {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix("re:") {
            Some(pattern) => match Regex::new(pattern) {
                Ok(re) => Self::Pattern(re),
                Err(e) => {
                    tracing::warn!("Invalid signature pattern '{}': {}, matching literally", pattern, e);
                    Self::Substring(raw.to_string())
                }
            },
            None => Self::Substring(raw.to_string()),
        }
    }

    pub fn matches(&self, cmdline: &str) -> bool {
        match self {
            Self::Substring(s) => !s.is_empty() && cmdline.contains(s.as_str()),
            Self::Pattern(re) => re.is_match(cmdline),
        }
    }
}

impl fmt::Display for CommandSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Substring(s) => f.write_str(s),
            Self::Pattern(re) => write!(f, "re:{}", re.as_str()),
        }
    }
}

// ─── Managed Process ─────────────────────────────────────────

/// Live handle of a process spawned in the current supervisor run.
#[derive(Debug)]
pub struct ProcessHandle {
    pub pid: u32,
    pub child: Child,
}

/// Everything needed to spawn a service.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn display_command(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Launch-time knobs shared by every service.
#[derive(Debug, Clone, Copy)]
pub struct LaunchOptions {
    pub grace: Duration,
    pub log_max_bytes: u64,
    pub log_backups: i64,
    pub tail_lines: usize,
}

#[derive(Debug)]
pub struct ManagedProcess {
    pub key: String,
    pub name: String,
    pub signature: CommandSignature,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    /// Present only while this run spawned and tracks the process. Takes
    /// precedence over the PID file.
    pub handle: Option<ProcessHandle>,
}

impl ManagedProcess {
    pub fn from_config(svc: &ServiceConfig) -> Self {
        Self {
            key: svc.key.clone(),
            name: svc.name.clone(),
            signature: CommandSignature::parse(&svc.signature),
            pid_file: svc.pid_file.clone(),
            log_file: svc.log_file.clone(),
            handle: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().map(|h| h.pid)
    }

    /// Rotate the log, spawn, record the pid and verify the process survives
    /// the grace window.
    pub async fn launch(&mut self, spec: &LaunchSpec, opts: LaunchOptions) -> Result<u32> {
        if let Some(parent) = self.log_file.parent() {
            std::fs::create_dir_all(parent)?;
        }

        LogFile::new(&self.log_file, opts.log_max_bytes, opts.log_backups).rotate();

        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)?;
        let started_at = current_timestamp();
        writeln!(log, "=== Starting {} at {} ===", self.name, started_at)?;
        writeln!(log, "Command: {}", spec.display_command())?;
        writeln!(log)?;
        log.flush()?;
        let stderr_log = log.try_clone()?;

        let mut cmd = TokioCommand::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr_log))
            .kill_on_drop(false);
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        crate::utils::apply_creation_flags(&mut cmd);

        tracing::info!("Launching '{}': {}", self.name, spec.display_command());
        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            name: self.name.clone(),
            source,
        })?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("Failed to get PID of spawned '{}'", self.name))?;

        self.handle = Some(ProcessHandle { pid, child });
        pid_registry::write_pid(&self.pid_file, pid)?;

        tokio::time::sleep(opts.grace).await;

        let exited = match self.handle.as_mut() {
            Some(handle) => handle.child.try_wait()?,
            None => None,
        };
        if let Some(status) = exited {
            self.handle = None;
            pid_registry::remove_pid(&self.pid_file);
            let log_tail = logrotate::tail_lines(&self.log_file, opts.tail_lines);
            return Err(SupervisorError::EarlyProcessExit {
                name: self.name.clone(),
                status: status.to_string(),
                log_path: self.log_file.clone(),
                log_tail,
            });
        }

        tracing::info!("'{}' started with PID {} (log: {})", self.name, pid, self.log_file.display());
        Ok(pid)
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

// ─── Tests ───────────────────────────────────────────────────
