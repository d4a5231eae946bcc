pub mod error;
pub mod managed_process;
pub mod pid_registry;
pub mod process;
pub mod shutdown;
pub mod state_machine;

use tokio_util::sync::CancellationToken;

use crate::config::{LauncherConfig, ServiceConfig};
use crate::port::{self, PortBinding};
use crate::process_monitor;
use crate::status::StatusReport;
use error::{Result, SupervisorError};
use managed_process::{CommandSignature, LaunchOptions, LaunchSpec, ManagedProcess};
use pid_registry::{PidRegistry, StopOutcome};
use process::StopPolicy;
use shutdown::ShutdownCoordinator;

/// Ports resolved by a successful `start`.
#[derive(Debug, Clone)]
pub struct Startup {
    pub api: PortBinding,
    pub llm: PortBinding,
}

/// Explicit supervisor context: the tracked processes, the registry and the
/// once-only shutdown guard for a single run.
pub struct Supervisor {
    pub config: LauncherConfig,
    /// Stop order: UI, backend, inference engine.
    pub services: Vec<ManagedProcess>,
    pub registry: PidRegistry,
    pub coordinator: ShutdownCoordinator,
    cancel: CancellationToken,
}

impl Supervisor {
    pub fn new(config: LauncherConfig) -> Self {
        let registry = PidRegistry::new(StopPolicy {
            poll_interval: config.stop_poll_interval,
            attempts: config.stop_poll_attempts,
        });
        let services = config
            .stop_order()
            .iter()
            .map(|svc| ManagedProcess::from_config(svc))
            .collect();
        let coordinator = ShutdownCoordinator::new(registry, config.supervisor_pid_file());
        Self {
            config,
            services,
            registry,
            coordinator,
            cancel: CancellationToken::new(),
        }
    }

    /// Token whose cancellation asks the foreground `run` to shut down.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn launch_options(&self) -> LaunchOptions {
        LaunchOptions {
            grace: self.config.launch_grace,
            log_max_bytes: self.config.log_max_bytes,
            log_backups: self.config.log_backups,
            tail_lines: self.config.log_tail_lines,
        }
    }

    // ─── start ───────────────────────────────────────────────

    /// Claim the supervisor record, clear leftovers, allocate ports and launch
    /// the backend then the UI. Any error aborts the remaining sequence.
    pub async fn start(&mut self) -> Result<Startup> {
        self.claim_supervisor_record()?;
        self.clean_stale().await;

        let api = port::allocate(
            &self.config.api_host,
            self.config.api_port,
            self.config.port_scan_attempts,
            &[],
        )?;
        let llm = port::allocate(
            &self.config.llm_host,
            self.config.llm_port,
            self.config.port_scan_attempts,
            &[api.resolved_port],
        )?;
        tracing::info!("Search API: {} | Model server: {}", api.url(), llm.url());

        let base_env = self.exported_env(&api, &llm);
        let mut ui_env = base_env.clone();
        ui_env.push(("SEARCH_API_URL".into(), api.url()));
        ui_env.push(("MODEL_SERVER_URL".into(), llm.url()));

        let backend = self.config.backend.clone();
        let ui = self.config.ui.clone();
        self.launch_service(&backend, base_env).await?;
        self.launch_service(&ui, ui_env).await?;

        Ok(Startup { api, llm })
    }

    fn exported_env(&self, api: &PortBinding, llm: &PortBinding) -> Vec<(String, String)> {
        vec![
            ("API_HOST".into(), api.host.clone()),
            ("API_PORT".into(), api.resolved_port.to_string()),
            ("LLM_HOST".into(), llm.host.clone()),
            ("LLM_PORT".into(), llm.resolved_port.to_string()),
            (
                "LLAMA_PID_FILE".into(),
                self.config.inference.pid_file.to_string_lossy().into_owned(),
            ),
            (
                "LLAMA_LOG_FILE".into(),
                self.config.llama_log_file.to_string_lossy().into_owned(),
            ),
        ]
    }

    async fn launch_service(&mut self, svc: &ServiceConfig, mut env: Vec<(String, String)>) -> Result<u32> {
        let Some(program) = svc.program.clone() else {
            return Err(anyhow::anyhow!("'{}' has no program configured", svc.name).into());
        };
        env.extend(svc.env.iter().cloned());
        let spec = LaunchSpec {
            program,
            args: svc.args.clone(),
            working_dir: svc.working_dir.clone(),
            env,
        };
        let opts = self.launch_options();
        let proc = self
            .services
            .iter_mut()
            .find(|p| p.key == svc.key)
            .ok_or_else(|| anyhow::anyhow!("unknown service '{}'", svc.key))?;
        proc.launch(&spec, opts).await
    }

    /// Fail if another verified supervisor is alive, then record our own pid.
    fn claim_supervisor_record(&self) -> Result<()> {
        let path = self.config.supervisor_pid_file();
        let own_pid = std::process::id();
        if let Some(pid) = pid_registry::read_pid(&path)? {
            if pid != own_pid && process_monitor::is_running(pid) {
                let signature = CommandSignature::parse(&crate::utils::current_exe_name());
                let ours = process_monitor::cmdline(pid)
                    .map(|cmd| signature.matches(&cmd))
                    .unwrap_or(false);
                if ours {
                    return Err(SupervisorError::AlreadyRunning(pid));
                }
                tracing::info!("Supervisor record names unrelated pid {}, replacing", pid);
            }
        }
        pid_registry::write_pid(&path, own_pid)?;
        Ok(())
    }

    /// Precise stop of anything a crashed previous run left behind, so its
    /// ports and PID files are released.
    async fn clean_stale(&mut self) {
        for proc in self.services.iter() {
            if proc.handle.is_some() {
                continue;
            }
            match self
                .registry
                .stop_recorded(&proc.name, &proc.pid_file, &proc.signature)
                .await
            {
                StopOutcome::Stopped(outcome) => {
                    tracing::info!("Stopped leftover '{}' ({:?})", proc.name, outcome)
                }
                StopOutcome::StaleRemoved => {
                    tracing::debug!("Removed stale PID file of '{}'", proc.name)
                }
                _ => {}
            }
        }
    }

    // ─── run / stop / status ─────────────────────────────────

    /// Foreground lifecycle: start, hold until cancelled, then shut down.
    /// Shutdown runs whether start succeeded or not.
    pub async fn run(&mut self) -> Result<Startup> {
        let cancel = self.cancel.clone();
        let started = tokio::select! {
            result = self.start() => Some(result),
            _ = cancel.cancelled() => None,
        };

        let result = match started {
            // another supervisor owns the PID files; leave everything alone
            Some(Err(e @ SupervisorError::AlreadyRunning(_))) => return Err(e),
            Some(Ok(startup)) => {
                tracing::info!("All services running, press Ctrl+C to stop");
                cancel.cancelled().await;
                Ok(startup)
            }
            Some(Err(e)) => {
                tracing::error!("[{}] Startup failed: {}", e.error_code(), e);
                Err(e)
            }
            None => {
                tracing::info!("Interrupted during startup");
                Err(anyhow::anyhow!("interrupted during startup").into())
            }
        };

        self.shutdown().await;
        result
    }

    /// Run the Shutdown Coordinator over every tracked service. Returns
    /// `false` when it already ran.
    pub async fn shutdown(&mut self) -> bool {
        self.coordinator.shutdown(&mut self.services).await
    }

    /// `stop` command: precise PID-file stop, then with `all` the broad sweep
    /// by command line and well-known ports. Returns the pids the sweep
    /// stopped.
    pub async fn stop(&mut self, all: bool) -> Vec<u32> {
        self.shutdown().await;
        if !all {
            return Vec::new();
        }
        let signatures: Vec<(String, CommandSignature)> = self
            .services
            .iter()
            .map(|p| (p.name.clone(), p.signature.clone()))
            .collect();
        self.registry
            .sweep(&signatures, &self.config.well_known_ports())
            .await
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::collect(&self.config)
    }
}

/// SIGINT/SIGTERM (Ctrl+C on Windows) cancel `token`. The shutdown itself
/// runs in the main flow; repeated signals are only logged.
pub fn install_signal_handlers(token: CancellationToken) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::spawn(async move {
            loop {
                let name = tokio::select! {
                    _ = sigint.recv() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                };
                if token.is_cancelled() {
                    tracing::info!("Received {} again, shutdown already in progress", name);
                } else {
                    tracing::info!("Received {}, shutting down gracefully...", name);
                    token.cancel();
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if token.is_cancelled() {
                    tracing::info!("Received Ctrl+C again, shutdown already in progress");
                } else {
                    tracing::info!("Received Ctrl+C, shutting down gracefully...");
                    token.cancel();
                }
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use tempfile::TempDir;

    fn config(root: &std::path::Path) -> LauncherConfig {
        let llama_pid = root.join("llama.pid").to_string_lossy().into_owned();
        LauncherConfig::from_sources(root.to_path_buf(), &FileConfig::default(), move |k| {
            match k {
                "LLAMA_PID_FILE" => Some(llama_pid.clone()),
                "PYTHON" => Some("/nonexistent/llmd-python".to_string()),
                _ => None,
            }
        })
    }

    #[test]
    fn services_are_kept_in_stop_order() {
        let dir = TempDir::new().unwrap();
        let sup = Supervisor::new(config(dir.path()));
        let keys: Vec<&str> = sup.services.iter().map(|p| p.key.as_str()).collect();
        assert_eq!(keys, ["ui", "search", "llama"]);
        assert_eq!(sup.registry.policy.attempts, 20);
    }

    #[test]
    fn supervisor_record_is_claimed() {
        let dir = TempDir::new().unwrap();
        let sup = Supervisor::new(config(dir.path()));
        sup.claim_supervisor_record().unwrap();
        let path = sup.config.supervisor_pid_file();
        assert_eq!(pid_registry::read_pid(&path).unwrap(), Some(std::process::id()));

        // re-claiming our own record is fine
        sup.claim_supervisor_record().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn unrelated_live_pid_in_record_is_replaced() {
        let dir = TempDir::new().unwrap();
        let sup = Supervisor::new(config(dir.path()));
        let mut bystander = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        pid_registry::write_pid(&sup.config.supervisor_pid_file(), bystander.id()).unwrap();

        sup.claim_supervisor_record().unwrap();
        assert_eq!(
            pid_registry::read_pid(&sup.config.supervisor_pid_file()).unwrap(),
            Some(std::process::id())
        );
        assert!(process_monitor::is_running(bystander.id()));
        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }

    #[tokio::test]
    async fn stop_without_records_is_quiet_and_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(dir.path()));
        assert!(sup.stop(false).await.is_empty());
        assert!(!sup.shutdown().await);
    }

    #[tokio::test]
    async fn cancellation_before_start_still_shuts_down() {
        let dir = TempDir::new().unwrap();
        let mut sup = Supervisor::new(config(dir.path()));
        sup.cancellation_token().cancel();
        // start may or may not win the race; shutdown must have run either way
        let _ = sup.run().await;
        assert_eq!(sup.coordinator.state(), state_machine::State::Stopped);
        assert!(!sup.config.supervisor_pid_file().exists());
    }
}
