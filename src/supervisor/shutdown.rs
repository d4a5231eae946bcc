//! Shutdown Coordinator.
//!
//! Runs the stop sequence at most once per supervisor run, no matter how many
//! entry points fire (normal exit, SIGINT, SIGTERM, an explicit `stop`).
//! Every tracked process gets a stop attempt; failures are logged and never
//! returned.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::supervisor::managed_process::{CommandSignature, ManagedProcess};
use crate::supervisor::pid_registry::{self, PidRegistry, StopOutcome};
use crate::supervisor::state_machine::{State, StateMachine};

pub struct ShutdownCoordinator {
    state: Mutex<StateMachine>,
    registry: PidRegistry,
    supervisor_pid_file: PathBuf,
}

impl ShutdownCoordinator {
    pub fn new(registry: PidRegistry, supervisor_pid_file: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(StateMachine::new()),
            registry,
            supervisor_pid_file: supervisor_pid_file.into(),
        }
    }

    pub fn state(&self) -> State {
        match self.state.lock() {
            Ok(sm) => sm.state.clone(),
            Err(poisoned) => poisoned.into_inner().state.clone(),
        }
    }

    /// Claim the single `Idle → Stopping` transition.
    fn begin(&self) -> bool {
        let mut sm = match self.state.lock() {
            Ok(sm) => sm,
            Err(poisoned) => poisoned.into_inner(),
        };
        sm.transition(State::Stopping).is_ok()
    }

    fn finish(&self) {
        let mut sm = match self.state.lock() {
            Ok(sm) => sm,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = sm.transition(State::Stopped) {
            tracing::debug!("{}", e);
        }
    }

    /// Stop every process in `services` (already in stop order), then clear
    /// the supervisor record. Returns `false` when shutdown already ran or is
    /// running.
    pub async fn shutdown(&self, services: &mut [ManagedProcess]) -> bool {
        if !self.begin() {
            tracing::debug!("Shutdown already in progress or done, skipping");
            return false;
        }
        tracing::info!("Shutting down {} service(s)", services.len());

        for proc in services.iter_mut() {
            match self.registry.deregister(proc).await {
                StopOutcome::NotRecorded => {
                    tracing::debug!("'{}' has no PID file", proc.name)
                }
                StopOutcome::StaleRemoved => {
                    tracing::info!("'{}' was not running, stale PID file removed", proc.name)
                }
                StopOutcome::Stopped(outcome) => {
                    tracing::info!("'{}' stopped ({:?})", proc.name, outcome)
                }
                // already logged by the registry
                StopOutcome::Mismatch { .. } | StopOutcome::Failed(_) => {}
            }
        }

        self.release_supervisor_record().await;
        self.finish();
        tracing::info!("Shutdown complete");
        true
    }

    /// Own record → remove. Another live supervisor → ask it to stop (it runs
    /// its own coordinator), then remove. Unrelated live pid → leave.
    async fn release_supervisor_record(&self) {
        let path = self.supervisor_pid_file.as_path();
        match pid_registry::read_pid(path) {
            Ok(Some(pid)) if pid == std::process::id() => pid_registry::remove_pid(path),
            Ok(_) | Err(_) => {
                let signature = CommandSignature::parse(&crate::utils::current_exe_name());
                stop_other_supervisor(&self.registry, path, &signature).await;
            }
        }
    }
}

async fn stop_other_supervisor(registry: &PidRegistry, path: &Path, signature: &CommandSignature) {
    match registry.stop_recorded("supervisor", path, signature).await {
        StopOutcome::Stopped(outcome) => {
            tracing::info!("Foreground supervisor stopped ({:?})", outcome);
            // the other supervisor normally removes its own record on the way out
            pid_registry::remove_pid(path);
        }
        StopOutcome::NotRecorded | StopOutcome::StaleRemoved => {}
        StopOutcome::Mismatch { .. } | StopOutcome::Failed(_) => {}
    }
}
