//! 상태 조회 모듈 (read-only)
//!
//! - 서비스별로 커맨드 시그니처와 일치하는 실행 중 프로세스를 나열합니다.
//! - 설정된 포트마다 리스닝 여부와 소유 프로세스를 보고합니다.
//!
//! PID 파일은 읽지도 쓰지도 않습니다.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::config::LauncherConfig;
use crate::port;
use crate::process_monitor::{self, RunningProcess};
use crate::supervisor::managed_process::CommandSignature;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(300);

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub name: String,
    pub signature: String,
    pub processes: Vec<RunningProcess>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortStatus {
    pub host: String,
    pub port: u16,
    pub listening: bool,
    /// 리스닝 소켓을 가진 프로세스 (확인 가능한 경우만)
    pub pids: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub services: Vec<ServiceStatus>,
    pub ports: Vec<PortStatus>,
}

impl StatusReport {
    pub fn collect(config: &LauncherConfig) -> Self {
        let services = config
            .stop_order()
            .iter()
            .rev()
            .map(|svc| {
                let signature = CommandSignature::parse(&svc.signature);
                ServiceStatus {
                    name: svc.name.clone(),
                    signature: signature.to_string(),
                    processes: process_monitor::find_by_signature(&signature),
                }
            })
            .collect();

        let mut endpoints = vec![
            (config.api_host.clone(), config.api_port),
            (config.llm_host.clone(), config.llm_port),
        ];
        endpoints.dedup();

        let ports = endpoints
            .into_iter()
            .map(|(host, port_number)| {
                let pids = port::listening_pids(port_number);
                let listening =
                    !pids.is_empty() || port::is_listening(&host, port_number, CONNECT_TIMEOUT);
                PortStatus {
                    host,
                    port: port_number,
                    listening,
                    pids,
                }
            })
            .collect();

        Self { services, ports }
    }

    pub fn any_running(&self) -> bool {
        self.services.iter().any(|s| !s.processes.is_empty())
    }
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Services:")?;
        for svc in &self.services {
            if svc.processes.is_empty() {
                writeln!(f, "  {:<16} not running   ({})", svc.name, svc.signature)?;
                continue;
            }
            for proc in &svc.processes {
                writeln!(f, "  {:<16} pid {:<8} {}", svc.name, proc.pid, proc.cmdline())?;
            }
        }

        writeln!(f, "Ports:")?;
        for p in &self.ports {
            let state = if p.listening { "listening" } else { "free" };
            let owners = if p.pids.is_empty() {
                String::new()
            } else {
                let list: Vec<String> = p.pids.iter().map(u32::to_string).collect();
                format!(" (pid {})", list.join(", "))
            };
            writeln!(f, "  {}:{:<6} {}{}", p.host, p.port, state, owners)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StatusReport {
        StatusReport {
            services: vec![
                ServiceStatus {
                    name: "search server".into(),
                    signature: "search/search.py".into(),
                    processes: vec![RunningProcess {
                        pid: 4321,
                        name: "python3".into(),
                        executable_path: None,
                        cmd: vec!["python3".into(), "search/search.py".into()],
                    }],
                },
                ServiceStatus {
                    name: "UI".into(),
                    signature: "ui/app.py".into(),
                    processes: vec![],
                },
            ],
            ports: vec![
                PortStatus {
                    host: "127.0.0.1".into(),
                    port: 8000,
                    listening: true,
                    pids: vec![4321],
                },
                PortStatus {
                    host: "127.0.0.1".into(),
                    port: 8080,
                    listening: false,
                    pids: vec![],
                },
            ],
        }
    }

    #[test]
    fn table_lists_processes_and_ports() {
        let text = sample().to_string();
        assert!(text.contains("pid 4321"));
        assert!(text.contains("python3 search/search.py"));
        assert!(text.contains("not running"));
        assert!(text.contains("127.0.0.1:8000   listening (pid 4321)"));
        assert!(text.contains("127.0.0.1:8080   free"));
    }

    #[test]
    fn json_shape() {
        let report = sample();
        assert!(report.any_running());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["services"][0]["processes"][0]["pid"], 4321);
        assert_eq!(json["ports"][1]["listening"], false);
    }

    #[test]
    fn collect_touches_no_pid_files() {
        let dir = tempfile::TempDir::new().unwrap();
        let cfg = LauncherConfig::from_sources(
            dir.path().to_path_buf(),
            &crate::config::FileConfig::default(),
            |_| None,
        );
        let report = StatusReport::collect(&cfg);
        assert_eq!(report.services.len(), 3);
        assert!(!cfg.run_dir.exists());
    }
}
