use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessStatus, System};

use crate::supervisor::managed_process::CommandSignature;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunningProcess {
    pub pid: u32,
    pub name: String,
    pub executable_path: Option<String>,
    /// 프로세스 커맨드라인 인수 (예: ["python3", "search/search.py"])
    #[serde(default)]
    pub cmd: Vec<String>,
}

impl RunningProcess {
    /// Joined argv. Processes whose argv is hidden fall back to the
    /// executable path, then the process name.
    pub fn cmdline(&self) -> String {
        if !self.cmd.is_empty() {
            return self.cmd.join(" ");
        }
        self.executable_path
            .clone()
            .unwrap_or_else(|| self.name.clone())
    }
}

fn snapshot(pid: u32, process: &sysinfo::Process) -> RunningProcess {
    RunningProcess {
        pid,
        name: process.name().to_string(),
        executable_path: process.exe().and_then(|p| p.to_str()).map(String::from),
        cmd: process.cmd().to_vec(),
    }
}

/// 크로스 플랫폼: 실행 중인 모든 프로세스 목록 가져오기 (좀비 제외)
pub fn get_running_processes() -> Vec<RunningProcess> {
    let mut sys = System::new();
    sys.refresh_processes();

    let processes: Vec<RunningProcess> = sys
        .processes()
        .iter()
        .filter(|(_, process)| process.status() != ProcessStatus::Zombie)
        .map(|(pid, process)| snapshot(pid.as_u32(), process))
        .collect();

    tracing::debug!("Found {} running processes", processes.len());
    processes
}

/// Live processes whose command line matches `signature`, excluding the
/// calling process itself.
pub fn find_by_signature(signature: &CommandSignature) -> Vec<RunningProcess> {
    let own_pid = std::process::id();
    get_running_processes()
        .into_iter()
        .filter(|p| p.pid != own_pid && !p.cmd.is_empty())
        .filter(|p| signature.matches(&p.cmdline()))
        .collect()
}

/// Snapshot of a single process, `None` when it is gone or a zombie.
pub fn lookup(pid: u32) -> Option<RunningProcess> {
    let mut sys = System::new();
    let sys_pid = Pid::from_u32(pid);
    if !sys.refresh_process(sys_pid) {
        return None;
    }
    sys.process(sys_pid)
        .filter(|p| p.status() != ProcessStatus::Zombie)
        .map(|p| snapshot(pid, p))
}

/// 특정 PID가 실행 중인지 확인. Unreaped zombies count as exited.
pub fn is_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        use nix::sys::signal;
        use nix::unistd::Pid as NixPid;

        // EPERM still means the pid exists, just not ours to signal.
        match signal::kill(NixPid::from_raw(pid as i32), None) {
            Ok(()) | Err(nix::errno::Errno::EPERM) => {}
            Err(_) => return false,
        }
    }
    lookup(pid).is_some()
}

/// Space-joined command line of `pid`, if it is alive.
pub fn cmdline(pid: u32) -> Option<String> {
    lookup(pid).map(|p| p.cmdline())
}
