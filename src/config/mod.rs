//! Launcher configuration.
//!
//! Values come from three layers, later layers winning:
//! built-in defaults → `<root>/config/launcher.toml` → environment variables.
//! Scalar settings use the same key in the TOML `[settings]` table as in the
//! environment, so `API_PORT=8001` and `[settings] API_PORT = 8001` are
//! equivalent. Bad values never abort; they fall back to the default with a
//! `ConfigInvalid` warning.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::supervisor::error::SupervisorError;

pub const CONFIG_FILE: &str = "config/launcher.toml";

pub const DEFAULT_API_HOST: &str = "127.0.0.1";
pub const DEFAULT_API_PORT: u16 = 8000;
pub const DEFAULT_LLM_HOST: &str = "127.0.0.1";
pub const DEFAULT_LLM_PORT: u16 = 8080;
pub const DEFAULT_PORT_SCAN_ATTEMPTS: u16 = 50;
pub const DEFAULT_LOG_MAX_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_LOG_BACKUPS: i64 = 3;
/// Upper bound on retained log generations; larger values are rejected.
pub const MAX_LOG_BACKUPS: i64 = 1000;
pub const DEFAULT_LAUNCH_GRACE_MS: u64 = 200;
pub const DEFAULT_STOP_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_STOP_POLL_ATTEMPTS: u32 = 20;
pub const DEFAULT_LOG_TAIL_LINES: usize = 120;
pub const DEFAULT_LLAMA_PID_FILE: &str = "/tmp/ernie_llama.pid";

// ─── File layer ──────────────────────────────────────────────

#[derive(Deserialize, Debug, Clone, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub settings: BTreeMap<String, toml::Value>,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceOverride>,
}

/// Per-service overrides from `[services.<key>]`.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct ServiceOverride {
    pub program: Option<String>,
    pub args: Option<Vec<String>>,
    pub working_dir: Option<PathBuf>,
    pub signature: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl FileConfig {
    /// Read `<root>/config/launcher.toml`. A missing file is the common case;
    /// an unparsable one is reported and ignored.
    pub fn load(root: &Path) -> Self {
        let path = root.join(CONFIG_FILE);
        let s = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(_) => return Self::default(),
        };
        match toml::from_str(&s) {
            Ok(cfg) => {
                tracing::debug!("Loaded {}", path.display());
                cfg
            }
            Err(e) => {
                tracing::warn!("Ignoring {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    fn setting(&self, key: &str) -> Option<String> {
        self.settings.get(key).map(|v| match v {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }
}

// ─── Resolved config ─────────────────────────────────────────

/// Static description of one supervised service.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Short key used for file names (`search` → `search.pid`, `search.log`).
    pub key: String,
    /// Human-readable label.
    pub name: String,
    /// Executable to launch; `None` for services the supervisor only tracks.
    pub program: Option<String>,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub signature: String,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub root: PathBuf,
    pub api_host: String,
    pub api_port: u16,
    pub llm_host: String,
    pub llm_port: u16,
    pub port_scan_attempts: u16,
    pub log_max_bytes: u64,
    pub log_backups: i64,
    pub launch_grace: Duration,
    pub stop_poll_interval: Duration,
    pub stop_poll_attempts: u32,
    pub log_tail_lines: usize,
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
    pub llama_log_file: PathBuf,
    pub python: Option<String>,
    pub skip_pip_install: bool,
    pub install_ui_deps: bool,
    pub backend: ServiceConfig,
    pub ui: ServiceConfig,
    pub inference: ServiceConfig,
}

/// Layered key lookup: environment first, then the TOML `[settings]` table.
struct Sources<'a, F: Fn(&str) -> Option<String>> {
    env: F,
    file: &'a FileConfig,
}

impl<F: Fn(&str) -> Option<String>> Sources<'_, F> {
    fn raw(&self, key: &str) -> Option<String> {
        (self.env)(key)
            .or_else(|| self.file.setting(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or_else(|| default.to_string())
    }

    fn number<T>(&self, key: &str, default: T, valid: impl Fn(&T) -> bool) -> T
    where
        T: FromStr + Display + Copy,
    {
        match self.raw(key) {
            None => default,
            Some(raw) => parse_setting(key, &raw, default, valid).unwrap_or_else(|e| {
                tracing::warn!("[{}] {}", e.error_code(), e);
                default
            }),
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.raw(key) {
            None => default,
            Some(raw) => parse_flag(key, &raw, default).unwrap_or_else(|e| {
                tracing::warn!("[{}] {}", e.error_code(), e);
                default
            }),
        }
    }
}

/// Parse a numeric setting, rejecting values `valid` refuses.
pub fn parse_setting<T>(
    key: &str,
    raw: &str,
    default: T,
    valid: impl Fn(&T) -> bool,
) -> Result<T, SupervisorError>
where
    T: FromStr + Display,
{
    match raw.trim().parse::<T>() {
        Ok(v) if valid(&v) => Ok(v),
        _ => Err(SupervisorError::ConfigInvalid {
            key: key.to_string(),
            value: raw.to_string(),
            default: default.to_string(),
        }),
    }
}

/// `1/true/yes/on` and `0/false/no/off`, case-insensitive.
pub fn parse_flag(key: &str, raw: &str, default: bool) -> Result<bool, SupervisorError> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(SupervisorError::ConfigInvalid {
            key: key.to_string(),
            value: raw.to_string(),
            default: default.to_string(),
        }),
    }
}

impl LauncherConfig {
    /// Resolve the project root, read the TOML file and apply the process
    /// environment on top.
    pub fn load(root: Option<PathBuf>) -> Self {
        let root = match root {
            Some(r) => r,
            None => crate::utils::find_project_root(),
        };
        let file = FileConfig::load(&root);
        Self::from_sources(root, &file, |key| std::env::var(key).ok())
    }

    pub fn from_sources(
        root: PathBuf,
        file: &FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let src = Sources { env, file };

        let api_host = src.string("API_HOST", DEFAULT_API_HOST);
        let api_port = src.number("API_PORT", DEFAULT_API_PORT, |p| *p > 0);
        let llm_host = src.string("LLM_HOST", DEFAULT_LLM_HOST);
        let llm_port = src.number("LLM_PORT", DEFAULT_LLM_PORT, |p| *p > 0);

        let run_dir = src
            .raw("LLM_DESKTOP_RUN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join(".run"));
        let log_dir = src
            .raw("LLM_DESKTOP_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| root.join("logs"));
        let llama_pid_file = PathBuf::from(src.string("LLAMA_PID_FILE", DEFAULT_LLAMA_PID_FILE));
        let llama_log_file = src
            .raw("LLAMA_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| log_dir.join("llama.log"));

        let python = src.raw("PYTHON");
        let interpreter = crate::python_env::resolve_interpreter(&root, python.as_deref());

        let backend = ServiceConfig {
            key: "search".into(),
            name: "search server".into(),
            program: Some(interpreter.clone()),
            args: vec!["search/search.py".into()],
            working_dir: root.clone(),
            signature: "search/search.py".into(),
            pid_file: run_dir.join("search.pid"),
            log_file: log_dir.join("search.log"),
            env: Vec::new(),
        };
        let ui = ServiceConfig {
            key: "ui".into(),
            name: "UI".into(),
            program: Some(interpreter),
            args: vec!["ui/app.py".into()],
            working_dir: root.clone(),
            signature: "ui/app.py".into(),
            pid_file: run_dir.join("ui.pid"),
            log_file: log_dir.join("ui.log"),
            env: Vec::new(),
        };
        let inference = ServiceConfig {
            key: "llama".into(),
            name: "llama-server".into(),
            program: None,
            args: Vec::new(),
            working_dir: root.clone(),
            signature: "llama-server".into(),
            pid_file: llama_pid_file,
            log_file: llama_log_file.clone(),
            env: Vec::new(),
        };

        Self {
            api_host,
            api_port,
            llm_host,
            llm_port,
            port_scan_attempts: src.number(
                "PORT_SCAN_ATTEMPTS",
                DEFAULT_PORT_SCAN_ATTEMPTS,
                |n| *n > 0,
            ),
            log_max_bytes: src.number("LOG_MAX_BYTES", DEFAULT_LOG_MAX_BYTES, |_| true),
            log_backups: src.number("LOG_BACKUPS", DEFAULT_LOG_BACKUPS, |n| *n <= MAX_LOG_BACKUPS),
            launch_grace: Duration::from_millis(src.number(
                "LAUNCH_GRACE_MS",
                DEFAULT_LAUNCH_GRACE_MS,
                |_| true,
            )),
            stop_poll_interval: Duration::from_millis(src.number(
                "STOP_POLL_INTERVAL_MS",
                DEFAULT_STOP_POLL_INTERVAL_MS,
                |ms| *ms > 0,
            )),
            stop_poll_attempts: src.number("STOP_POLL_ATTEMPTS", DEFAULT_STOP_POLL_ATTEMPTS, |_| true),
            log_tail_lines: src.number("LOG_TAIL_LINES", DEFAULT_LOG_TAIL_LINES, |_| true),
            skip_pip_install: src.flag("SKIP_PIP_INSTALL", false),
            install_ui_deps: src.flag("INSTALL_UI_DEPS", true),
            python,
            run_dir,
            log_dir,
            llama_log_file,
            backend: apply_override(backend, file.services.get("search")),
            ui: apply_override(ui, file.services.get("ui")),
            inference: apply_override(inference, file.services.get("llama")),
            root,
        }
    }

    /// Every tracked service, in stop order (reverse of start, inference last).
    pub fn stop_order(&self) -> [&ServiceConfig; 3] {
        [&self.ui, &self.backend, &self.inference]
    }

    /// The supervisor's own bookkeeping file.
    pub fn supervisor_pid_file(&self) -> PathBuf {
        self.run_dir.join("supervisor.pid")
    }

    /// Ports whose listeners the `--all` sweep and `status` look at.
    pub fn well_known_ports(&self) -> Vec<u16> {
        let mut ports = vec![self.api_port, self.llm_port];
        ports.dedup();
        ports
    }
}

fn apply_override(mut svc: ServiceConfig, ov: Option<&ServiceOverride>) -> ServiceConfig {
    let Some(ov) = ov else { return svc };
    if let Some(program) = &ov.program {
        svc.program = Some(program.clone());
    }
    if let Some(args) = &ov.args {
        svc.args = args.clone();
    }
    if let Some(dir) = &ov.working_dir {
        svc.working_dir = if dir.is_absolute() {
            dir.clone()
        } else {
            svc.working_dir.join(dir)
        };
    }
    if let Some(sig) = &ov.signature {
        svc.signature = sig.clone();
    }
    svc.env
        .extend(ov.env.iter().map(|(k, v)| (k.clone(), v.clone())));
    svc
}
