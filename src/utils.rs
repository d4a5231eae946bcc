//! Shared utility functions for the launcher.

use std::path::{Path, PathBuf};

use tokio::process::Command;

/// Files whose presence marks the LLM-Desktop project root.
const ROOT_MARKERS: [&str; 2] = ["search/search.py", "ui/app.py"];

/// Apply platform-specific flags to hide the console window on Windows.
/// On non-Windows platforms, this is a no-op.
#[cfg(target_os = "windows")]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

/// Put the child in its own process group so a terminal Ctrl+C reaches only
/// the supervisor, which then stops the children in order.
#[cfg(not(target_os = "windows"))]
pub fn apply_creation_flags(cmd: &mut Command) -> &mut Command {
    cmd.process_group(0)
}

/// 프로젝트 루트 찾기: `LLM_DESKTOP_ROOT` → 마커 파일이 있는 상위 디렉토리 → cwd
pub fn find_project_root() -> PathBuf {
    if let Ok(root) = std::env::var("LLM_DESKTOP_ROOT") {
        if !root.trim().is_empty() {
            return PathBuf::from(root);
        }
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_root_from(&cwd).unwrap_or(cwd)
}

/// Walk up from `start` (at most five levels) looking for a root marker.
pub fn find_root_from(start: &Path) -> Option<PathBuf> {
    let mut candidate = start.to_path_buf();
    for _ in 0..5 {
        if ROOT_MARKERS.iter().any(|m| candidate.join(m).is_file()) {
            return Some(candidate);
        }
        match candidate.parent() {
            Some(p) => candidate = p.to_path_buf(),
            None => break,
        }
    }
    None
}

/// Executable name of the running supervisor, used as its command signature.
pub fn current_exe_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "llm-desktop".to_string())
}
