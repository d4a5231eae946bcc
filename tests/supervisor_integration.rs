//! 통합 테스트: 실제 `sh` 프로세스로 start / stop / rotation 흐름을 검증
#![cfg(unix)]

use std::collections::{BTreeMap, HashMap};
use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use llm_desktop_core::config::{FileConfig, LauncherConfig, ServiceOverride};
use llm_desktop_core::process_monitor;
use llm_desktop_core::supervisor::error::SupervisorError;
use llm_desktop_core::supervisor::pid_registry;
use llm_desktop_core::supervisor::state_machine::State;
use llm_desktop_core::supervisor::{self, Supervisor};
use tempfile::TempDir;

const HOST: &str = "127.0.0.1";

/// Keeps a shell alive without `exec`, so its command line keeps the marker.
const IDLE: &str = "while :; do sleep 1; done";

struct Fixture {
    _dir: TempDir,
    config: LauncherConfig,
}

fn sh_service(script: &str, marker: &str) -> ServiceOverride {
    ServiceOverride {
        program: Some("sh".into()),
        args: Some(vec!["-c".into(), script.into(), marker.into()]),
        signature: Some(marker.into()),
        ..Default::default()
    }
}

fn fixture(tag: &str, backend_script: &str, ui_script: &str, api_port: u16, llm_port: u16) -> Fixture {
    let dir = TempDir::new().unwrap();

    let mut services = BTreeMap::new();
    services.insert(
        "search".to_string(),
        sh_service(backend_script, &format!("llmd-it-{tag}-search")),
    );
    services.insert(
        "ui".to_string(),
        sh_service(ui_script, &format!("llmd-it-{tag}-ui")),
    );
    services.insert(
        "llama".to_string(),
        ServiceOverride {
            signature: Some(format!("llmd-it-{tag}-llama")),
            ..Default::default()
        },
    );
    let file = FileConfig {
        settings: BTreeMap::new(),
        services,
    };

    let env: HashMap<String, String> = [
        ("API_HOST", HOST.to_string()),
        ("API_PORT", api_port.to_string()),
        ("LLM_HOST", HOST.to_string()),
        ("LLM_PORT", llm_port.to_string()),
        ("LLAMA_PID_FILE", dir.path().join("llama.pid").to_string_lossy().into_owned()),
        ("LAUNCH_GRACE_MS", "300".to_string()),
        ("STOP_POLL_INTERVAL_MS", "50".to_string()),
        ("STOP_POLL_ATTEMPTS", "40".to_string()),
        ("LOG_MAX_BYTES", "64".to_string()),
        ("LOG_BACKUPS", "3".to_string()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    let config = LauncherConfig::from_sources(dir.path().to_path_buf(), &file, move |k| env.get(k).cloned());
    Fixture { _dir: dir, config }
}

fn free_port() -> u16 {
    let listener = TcpListener::bind((HOST, 0)).unwrap();
    listener.local_addr().unwrap().port()
}

/// `count` consecutive ports bound by this test, plus one free port after them.
fn occupied_run(count: u16) -> (u16, Vec<TcpListener>) {
    'search: for _ in 0..50 {
        let first = TcpListener::bind((HOST, 0)).unwrap();
        let base = first.local_addr().unwrap().port();
        if base > 65000 {
            continue;
        }
        let mut held = vec![first];
        for offset in 1..count {
            match TcpListener::bind((HOST, base + offset)) {
                Ok(l) => held.push(l),
                Err(_) => continue 'search,
            }
        }
        // the port right after the run must be free for an exact assertion
        if TcpListener::bind((HOST, base + count)).is_err() {
            continue;
        }
        return (base, held);
    }
    panic!("no run of {count} free ports found");
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap_or_default()
}

/// 시나리오 A: preferred port free → used as-is, PID file and log populated
#[tokio::test]
async fn scenario_a_free_port_is_used_exactly() {
    let api_port = free_port();
    let fx = fixture(
        "a",
        &format!("echo \"backend listening on $API_PORT\"; {IDLE}"),
        &format!("echo ui up; {IDLE}"),
        api_port,
        free_port(),
    );
    let mut sup = Supervisor::new(fx.config.clone());

    let startup = sup.start().await.expect("start succeeds");
    assert_eq!(startup.api.resolved_port, api_port);
    assert!(!startup.api.moved());

    let backend = &fx.config.backend;
    let recorded = pid_registry::read_pid(&backend.pid_file).unwrap().expect("backend PID file");
    let tracked = sup.services.iter().find(|p| p.key == "search").and_then(|p| p.pid());
    assert_eq!(Some(recorded), tracked);
    assert!(process_monitor::is_running(recorded));

    let log = read(&backend.log_file);
    assert!(log.starts_with("=== Starting search server at "));
    assert!(log.contains(&format!("backend listening on {api_port}")));

    assert!(sup.shutdown().await);
    assert!(!backend.pid_file.exists());
    assert!(!fx.config.ui.pid_file.exists());
    assert!(!fx.config.supervisor_pid_file().exists());
    assert!(!process_monitor::is_running(recorded));
}

/// 시나리오 B: 10 occupied ports → resolved +10, URL exported to the UI
#[tokio::test]
async fn scenario_b_occupied_ports_shift_and_export_url() {
    let (base, _held) = occupied_run(10);
    let fx = fixture(
        "b",
        &format!("echo backend; {IDLE}"),
        &format!("echo \"SEARCH_API_URL=$SEARCH_API_URL\"; echo \"MODEL_SERVER_URL=$MODEL_SERVER_URL\"; {IDLE}"),
        base,
        free_port(),
    );
    let mut sup = Supervisor::new(fx.config.clone());

    let startup = sup.start().await.expect("start succeeds");
    assert_eq!(startup.api.preferred_port, base);
    assert_eq!(startup.api.resolved_port, base + 10);

    let ui_log = read(&fx.config.ui.log_file);
    assert!(
        ui_log.contains(&format!("SEARCH_API_URL=http://{HOST}:{}", base + 10)),
        "UI log was: {ui_log}"
    );
    assert!(ui_log.contains(&format!("MODEL_SERVER_URL={}", startup.llm.url())));

    sup.shutdown().await;
}

/// The model port never lands on the port the search API was just given.
#[tokio::test]
async fn api_and_model_ports_are_distinct() {
    // API_PORT occupied, LLM_PORT right above it: the API scan moves onto LLM_PORT
    let (base, _held) = occupied_run(1);
    let fx = fixture(
        "ports",
        &format!("echo backend; {IDLE}"),
        &format!("echo ui; {IDLE}"),
        base,
        base + 1,
    );
    let mut sup = Supervisor::new(fx.config.clone());
    let startup = sup.start().await.expect("start succeeds");
    assert_eq!(startup.api.resolved_port, base + 1);
    assert_ne!(startup.llm.resolved_port, startup.api.resolved_port);
    assert!(startup.llm.moved());
    sup.shutdown().await;

    // the same preferred port for both
    let shared = free_port();
    let fx = fixture(
        "sameport",
        &format!("echo backend; {IDLE}"),
        &format!("echo ui; {IDLE}"),
        shared,
        shared,
    );
    let mut sup = Supervisor::new(fx.config.clone());
    let startup = sup.start().await.expect("start succeeds");
    assert_eq!(startup.api.resolved_port, shared);
    assert_ne!(startup.llm.resolved_port, shared);
    sup.shutdown().await;
}

/// 시나리오 C: backend dies in the grace window → abort before the UI
#[tokio::test]
async fn scenario_c_early_exit_aborts_before_ui() {
    let fx = fixture(
        "c",
        "echo 'Traceback (most recent call last):'; echo 'ModuleNotFoundError: fastapi'; exit 1",
        &format!("echo ui; {IDLE}"),
        free_port(),
        free_port(),
    );
    let mut sup = Supervisor::new(fx.config.clone());

    let err = sup.start().await.unwrap_err();
    assert!(err.is_fatal());
    match &err {
        SupervisorError::EarlyProcessExit { name, log_tail, .. } => {
            assert_eq!(name, "search server");
            assert!(log_tail.iter().any(|l| l.contains("ModuleNotFoundError")));
        }
        other => panic!("unexpected error: {other}"),
    }

    assert!(!fx.config.ui.log_file.exists(), "UI must not be launched");
    assert!(!fx.config.ui.pid_file.exists());
    assert!(!fx.config.backend.pid_file.exists());

    sup.shutdown().await;
    assert!(!fx.config.supervisor_pid_file().exists());
}

/// 시나리오 D: log at threshold with backups 1 and 2 → 1,2,3 after launch
#[tokio::test]
async fn scenario_d_rotation_before_launch() {
    let fx = fixture(
        "d",
        &format!("echo fresh; {IDLE}"),
        &format!("echo ui; {IDLE}"),
        free_port(),
        free_port(),
    );
    let log = fx.config.backend.log_file.clone();
    std::fs::create_dir_all(log.parent().unwrap()).unwrap();
    std::fs::write(&log, "x".repeat(64)).unwrap();
    std::fs::write(format!("{}.1", log.display()), "gen1").unwrap();
    std::fs::write(format!("{}.2", log.display()), "gen2").unwrap();

    let mut sup = Supervisor::new(fx.config.clone());
    sup.start().await.expect("start succeeds");

    assert_eq!(read(Path::new(&format!("{}.1", log.display()))), "x".repeat(64));
    assert_eq!(read(Path::new(&format!("{}.2", log.display()))), "gen1");
    assert_eq!(read(Path::new(&format!("{}.3", log.display()))), "gen2");
    assert!(!Path::new(&format!("{}.4", log.display())).exists());
    let live = read(&log);
    assert!(live.starts_with("=== Starting search server"));
    assert!(!live.contains("xxxx"));

    sup.shutdown().await;
}

/// A separate `stop` invocation stops what `start` recorded; a second stop is a no-op.
#[tokio::test]
async fn stop_from_another_invocation_is_idempotent() {
    let fx = fixture(
        "stop",
        &format!("echo backend; {IDLE}"),
        &format!("echo ui; {IDLE}"),
        free_port(),
        free_port(),
    );
    let mut foreground = Supervisor::new(fx.config.clone());
    foreground.start().await.expect("start succeeds");
    let pids: Vec<u32> = foreground.services.iter().filter_map(|p| p.pid()).collect();
    assert_eq!(pids.len(), 2);

    let mut stopper = Supervisor::new(fx.config.clone());
    assert!(stopper.stop(false).await.is_empty());
    for pid in &pids {
        assert!(!process_monitor::is_running(*pid), "pid {pid} still alive");
    }
    assert!(!fx.config.backend.pid_file.exists());
    assert!(!fx.config.ui.pid_file.exists());

    let mut again = Supervisor::new(fx.config.clone());
    again.stop(false).await;
    assert!(!fx.config.backend.pid_file.exists());

    // the foreground run still shuts down cleanly over already-dead children
    assert!(foreground.shutdown().await);
}

/// PID file naming an unrelated live process: left alone, file untouched.
#[tokio::test]
async fn stop_skips_mismatched_pid_file() {
    let fx = fixture("mismatch", IDLE, IDLE, free_port(), free_port());
    let mut bystander = std::process::Command::new("sleep").arg("30").spawn().unwrap();
    pid_registry::write_pid(&fx.config.backend.pid_file, bystander.id()).unwrap();

    let mut stopper = Supervisor::new(fx.config.clone());
    stopper.stop(false).await;

    assert!(process_monitor::is_running(bystander.id()));
    assert_eq!(
        pid_registry::read_pid(&fx.config.backend.pid_file).unwrap(),
        Some(bystander.id())
    );

    bystander.kill().unwrap();
    bystander.wait().unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // no longer relevant once the pid is gone
    let mut later = Supervisor::new(fx.config.clone());
    later.stop(false).await;
    assert!(!fx.config.backend.pid_file.exists());
}

/// `--all` catches an unrecorded process by command line.
#[tokio::test]
async fn stop_all_sweeps_unrecorded_processes() {
    let fx = fixture("sweep", IDLE, IDLE, free_port(), free_port());
    let mut orphan = tokio::process::Command::new("sh")
        .args(["-c", IDLE, "llmd-it-sweep-search"])
        .spawn()
        .unwrap();
    let pid = orphan.id().unwrap();
    let reaper = tokio::spawn(async move { orphan.wait().await });

    let mut stopper = Supervisor::new(fx.config.clone());
    let swept = stopper.stop(true).await;
    assert!(swept.contains(&pid), "swept: {swept:?}");
    reaper.await.unwrap().unwrap();
}

/// `--all` stops an unrecorded listener on a configured port.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn stop_all_sweeps_port_listeners() {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    use std::os::fd::AsRawFd;
    use std::os::unix::process::CommandExt;

    let listener = TcpListener::bind((HOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    let fd = listener.as_raw_fd();

    // hand the listening socket to a child whose command line matches no service
    let mut cmd = std::process::Command::new("sleep");
    cmd.arg("30");
    unsafe {
        cmd.pre_exec(move || {
            fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))
                .map(drop)
                .map_err(std::io::Error::from)
        });
    }
    let mut holder = cmd.spawn().unwrap();
    drop(listener);

    let fx = fixture("portsweep", IDLE, IDLE, port, free_port());
    let mut stopper = Supervisor::new(fx.config.clone());
    let swept = stopper.stop(true).await;
    assert!(swept.contains(&holder.id()), "swept: {swept:?}");

    holder.wait().unwrap();
    assert!(!process_monitor::is_running(holder.id()));
}

/// SIGTERM cancels the foreground run, which shuts down exactly once; a
/// repeated signal changes nothing.
#[tokio::test]
async fn termination_signal_shuts_down_once() {
    use nix::sys::signal::{raise, Signal};

    let fx = fixture(
        "signal",
        &format!("echo backend; {IDLE}"),
        &format!("echo ui; {IDLE}"),
        free_port(),
        free_port(),
    );
    let mut sup = Supervisor::new(fx.config.clone());
    let token = sup.cancellation_token();
    supervisor::install_signal_handlers(token.clone()).unwrap();

    let backend_pid_file = fx.config.backend.pid_file.clone();
    let ui_pid_file = fx.config.ui.pid_file.clone();
    let settle = fx.config.launch_grace + Duration::from_millis(700);
    let signaller = tokio::spawn(async move {
        while !ui_pid_file.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(settle).await;
        let pids = vec![
            pid_registry::read_pid(&backend_pid_file).unwrap().unwrap(),
            pid_registry::read_pid(&ui_pid_file).unwrap().unwrap(),
        ];
        raise(Signal::SIGTERM).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        raise(Signal::SIGINT).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        pids
    });

    let startup = sup.run().await.expect("run ends cleanly after the signal");
    assert!(!startup.api.url().is_empty());
    assert!(token.is_cancelled());
    assert_eq!(sup.coordinator.state(), State::Stopped);

    let pids = signaller.await.unwrap();
    for pid in pids {
        assert!(!process_monitor::is_running(pid), "pid {pid} still alive");
    }
    assert!(!fx.config.backend.pid_file.exists());
    assert!(!fx.config.ui.pid_file.exists());
    assert!(!fx.config.supervisor_pid_file().exists());

    // the second signal did not trigger another pass
    assert!(!sup.shutdown().await);
}
