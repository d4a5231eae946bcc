//! Python 가상환경 부트스트랩
//!
//! 백엔드와 UI는 Python 스크립트이므로 `start`는 인터프리터 경로만 있으면 됩니다.
//! 환경 준비(venv 생성, 의존성 설치)는 `bootstrap` 명령에서만 수행하며,
//! `start`는 절대 설치를 시도하지 않습니다.
//!
//! ## 부트스트랩 흐름
//! 1. 기존 `<root>/.venv` 유효? → 그대로 사용
//! 2. 손상된 venv 제거 후 Python ≥ 3.10 탐색 (`PYTHON` → `python3` → `python`)
//! 3. `python -m venv <root>/.venv` → pip 업그레이드 → 검증
//! 4. `requirements.txt` 설치 (`SKIP_PIP_INSTALL=1`이면 생략),
//!    `ui/requirements.txt`는 `INSTALL_UI_DEPS`가 켜져 있을 때만
//!
//! ## 레이아웃
//! ```text
//! <root>/
//!   .venv/
//!     Scripts/python.exe  (Windows)
//!     bin/python          (Linux/macOS)
//!   requirements.txt
//!   ui/requirements.txt
//! ```

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::process::Command;

use crate::config::LauncherConfig;
use crate::utils::apply_creation_flags;

/// 시스템 Python 사용 시 최소 요구 버전
const MIN_PYTHON_VERSION: (u32, u32) = (3, 10);

pub const VENV_DIR_NAME: &str = ".venv";

#[cfg(target_os = "windows")]
const DEFAULT_INTERPRETER: &str = "python";
#[cfg(not(target_os = "windows"))]
const DEFAULT_INTERPRETER: &str = "python3";

/// Outcome of `bootstrap`, printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub interpreter: Option<PathBuf>,
    pub python_version: Option<String>,
    pub venv_dir: PathBuf,
    /// Requirement files installed during this run.
    pub installed: Vec<PathBuf>,
    pub error: Option<String>,
}

// ═══════════════════════════════════════════════════════════════
//  Public API
// ═══════════════════════════════════════════════════════════════

/// Interpreter used to launch services. Never provisions anything:
/// explicit override → project venv (if present) → platform default.
pub fn resolve_interpreter(root: &Path, override_python: Option<&str>) -> String {
    if let Some(python) = override_python.filter(|p| !p.trim().is_empty()) {
        return python.to_string();
    }
    let venv_python = venv_python_exe(&root.join(VENV_DIR_NAME));
    if venv_python.is_file() {
        return venv_python.to_string_lossy().into_owned();
    }
    DEFAULT_INTERPRETER.to_string()
}

/// 환경을 준비하고 준비 상태를 보고합니다. 실패도 `Readiness`로 반환합니다.
pub async fn bootstrap(config: &LauncherConfig) -> Readiness {
    let venv_dir = config.root.join(VENV_DIR_NAME);
    let mut readiness = Readiness {
        ready: false,
        interpreter: None,
        python_version: None,
        venv_dir: venv_dir.clone(),
        installed: Vec::new(),
        error: None,
    };

    let python_exe = match ensure_venv(&venv_dir, config.python.as_deref()).await {
        Ok(exe) => exe,
        Err(e) => {
            tracing::error!("Python 환경 준비 실패: {:#}", e);
            readiness.error = Some(format!("{:#}", e));
            return readiness;
        }
    };
    readiness.python_version = get_version(&python_exe).await.ok();
    readiness.interpreter = Some(python_exe.clone());

    for requirements in requirement_files(config) {
        if let Err(e) = pip_install_requirements(&python_exe, &requirements).await {
            tracing::error!("{:#}", e);
            readiness.error = Some(format!("{:#}", e));
            return readiness;
        }
        readiness.installed.push(requirements);
    }

    readiness.ready = true;
    tracing::info!("Python 환경 준비 완료: {}", python_exe.display());
    readiness
}

/// venv가 존재하고 유효한지 확인합니다. 없거나 손상되었으면 새로 만듭니다.
/// 반환값: venv 내부 Python 실행 파일의 절대 경로
pub async fn ensure_venv(venv_dir: &Path, override_python: Option<&str>) -> Result<PathBuf> {
    let python_exe = venv_python_exe(venv_dir);

    // ── Fast path: 기존 venv 유효 ──
    if python_exe.exists() && verify_python(&python_exe).await {
        tracing::debug!("Python venv 확인 완료: {}", python_exe.display());
        return Ok(python_exe);
    }

    // 손상된 venv 제거
    if venv_dir.exists() {
        tracing::warn!("기존 venv 손상, 재생성합니다: {}", venv_dir.display());
        std::fs::remove_dir_all(venv_dir)
            .with_context(|| format!("venv 제거 실패: {}", venv_dir.display()))?;
    }

    let base_python = detect_system_python(override_python).await?;
    tracing::info!(
        "Python venv 생성 중: {} (base: {})",
        venv_dir.display(),
        base_python
    );

    if let Some(parent) = venv_dir.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("디렉토리 생성 실패: {}", parent.display()))?;
    }

    let mut cmd = Command::new(&base_python);
    cmd.args(["-m", "venv"]).arg(venv_dir);
    apply_creation_flags(&mut cmd);

    let output = cmd
        .output()
        .await
        .with_context(|| format!("'{}' 실행 실패", base_python))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("venv 생성 실패: {}", stderr.trim()));
    }

    // pip 업그레이드 (실패해도 치명적이지 않음)
    if let Err(e) = run_pip(&python_exe, &["install", "--upgrade", "--quiet", "pip"]).await {
        tracing::warn!("pip 업그레이드 실패: {:#}", e);
    }

    if !verify_python(&python_exe).await {
        return Err(anyhow::anyhow!("venv 생성 후 검증 실패"));
    }
    Ok(python_exe)
}

/// requirements 파일로부터 의존성을 설치합니다.
pub async fn pip_install_requirements(python_exe: &Path, requirements_path: &Path) -> Result<()> {
    tracing::info!("requirements 설치: {}", requirements_path.display());
    run_pip(
        python_exe,
        &["install", "-r", &requirements_path.to_string_lossy()],
    )
    .await
    .with_context(|| format!("{} 설치 실패", requirements_path.display()))
}

/// Python ≥ 3.10 을 탐지합니다. `PYTHON`이 지정되면 그것만 검사합니다.
pub async fn detect_system_python(override_python: Option<&str>) -> Result<String> {
    let candidates: Vec<&str> = match override_python.filter(|p| !p.trim().is_empty()) {
        Some(p) => vec![p],
        None => vec!["python3", "python"],
    };
    for cmd_name in &candidates {
        let mut cmd = Command::new(cmd_name);
        cmd.arg("--version");
        apply_creation_flags(&mut cmd);

        let Ok(output) = cmd.output().await else {
            tracing::debug!("{} 실행 불가, 건너뜀", cmd_name);
            continue;
        };
        if !output.status.success() {
            continue;
        }
        // Python 2 prints its version on stderr
        let mut ver = String::from_utf8_lossy(&output.stdout).into_owned();
        if ver.trim().is_empty() {
            ver = String::from_utf8_lossy(&output.stderr).into_owned();
        }
        match parse_python_version(&ver) {
            Some(v) if v >= MIN_PYTHON_VERSION => {
                tracing::info!("Python 발견: {} → {}", cmd_name, ver.trim());
                return Ok(cmd_name.to_string());
            }
            Some((major, minor)) => tracing::debug!(
                "{} → {}.{} (최소 {}.{} 필요, 건너뜀)",
                cmd_name,
                major,
                minor,
                MIN_PYTHON_VERSION.0,
                MIN_PYTHON_VERSION.1
            ),
            None => tracing::debug!("{}: 버전 파싱 실패 '{}'", cmd_name, ver.trim()),
        }
    }
    Err(anyhow::anyhow!(
        "Python >= {}.{} 없음 (검사: {})",
        MIN_PYTHON_VERSION.0,
        MIN_PYTHON_VERSION.1,
        candidates.join(", ")
    ))
}

// ═══════════════════════════════════════════════════════════════
//  Internal
// ═══════════════════════════════════════════════════════════════

fn requirement_files(config: &LauncherConfig) -> Vec<PathBuf> {
    if config.skip_pip_install {
        tracing::info!("SKIP_PIP_INSTALL 설정됨, 의존성 설치 생략");
        return Vec::new();
    }
    let mut files = Vec::new();
    let main = config.root.join("requirements.txt");
    if main.is_file() {
        files.push(main);
    }
    let ui = config.root.join("ui").join("requirements.txt");
    if config.install_ui_deps && ui.is_file() {
        files.push(ui);
    }
    files
}

/// venv 내 Python 실행 파일 경로
fn venv_python_exe(venv_dir: &Path) -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        venv_dir.join("Scripts").join("python.exe")
    }
    #[cfg(not(target_os = "windows"))]
    {
        venv_dir.join("bin").join("python")
    }
}

/// Python 실행 파일이 정상 동작하는지 확인
async fn verify_python(exe: &Path) -> bool {
    let mut cmd = Command::new(exe);
    cmd.args(["-c", "import sys; sys.exit(0 if sys.version_info >= (3, 10) else 1)"]);
    apply_creation_flags(&mut cmd);
    matches!(cmd.output().await, Ok(o) if o.status.success())
}

/// Python --version 문자열 반환
async fn get_version(exe: &Path) -> Result<String> {
    let mut cmd = Command::new(exe);
    cmd.arg("--version");
    apply_creation_flags(&mut cmd);
    let output = cmd.output().await?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// pip 명령 실행
async fn run_pip(python_exe: &Path, args: &[&str]) -> Result<()> {
    let mut cmd = Command::new(python_exe);
    cmd.arg("-m").arg("pip");
    for arg in args {
        cmd.arg(arg);
    }
    apply_creation_flags(&mut cmd);

    let output = cmd.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(anyhow::anyhow!("pip 실행 실패: {}", stderr.trim()));
    }
    Ok(())
}

/// "Python 3.12.8" → (3, 12)
fn parse_python_version(s: &str) -> Option<(u32, u32)> {
    let s = s.trim();
    let ver_part = s
        .strip_prefix("Python ")
        .or_else(|| s.strip_prefix("python "))
        .unwrap_or(s);
    let mut parts = ver_part.split('.');
    let major = parts.next()?.trim().parse().ok()?;
    let minor = parts.next()?.trim().parse().ok()?;
    Some((major, minor))
}

// ═══════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════
