//! Supervisor error taxonomy. Each variant maps to a stable code that is
//! printed next to the message.

use std::path::PathBuf;

/// Errors raised or logged by the supervisor.
///
/// Only some of these abort a run (see [`SupervisorError::is_fatal`]); the rest
/// are constructed so they can be logged with a consistent message and code.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("invalid value for {key}: '{value}', falling back to {default}")]
    ConfigInvalid {
        key: String,
        value: String,
        default: String,
    },

    #[error("no free port on {host} in range {first}..={last}")]
    PortExhaustion { host: String, first: u16, last: u16 },

    #[error("'{name}' exited during startup ({status}); see {}", .log_path.display())]
    EarlyProcessExit {
        name: String,
        status: String,
        log_path: PathBuf,
        log_tail: Vec<String>,
    },

    #[error("pid {pid} in {} does not belong to '{name}' (expected '{expected}'), skipping", .pid_file.display())]
    StopMismatch {
        name: String,
        pid: u32,
        pid_file: PathBuf,
        expected: String,
    },

    #[error("log rotation for {} failed: {reason}", .path.display())]
    RotationFailure { path: PathBuf, reason: String },

    #[error("'{name}' (pid {pid}) did not exit after {attempts} polls, sending kill")]
    GracefulStopTimeout { name: String, pid: u32, attempts: u32 },

    #[error("supervisor is already running with pid {0}")]
    AlreadyRunning(u32),

    #[error("failed to spawn '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl SupervisorError {
    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigInvalid { .. } => "CONFIG_INVALID",
            Self::PortExhaustion { .. } => "PORT_EXHAUSTION",
            Self::EarlyProcessExit { .. } => "EARLY_PROCESS_EXIT",
            Self::StopMismatch { .. } => "STOP_MISMATCH",
            Self::RotationFailure { .. } => "ROTATION_FAILURE",
            Self::GracefulStopTimeout { .. } => "GRACEFUL_STOP_TIMEOUT",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::Spawn { .. } => "SPAWN_FAILED",
            Self::Io(_) => "IO_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this error aborts a startup sequence. The non-fatal members are
    /// logged and the caller carries on.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::ConfigInvalid { .. }
                | Self::StopMismatch { .. }
                | Self::RotationFailure { .. }
                | Self::GracefulStopTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
