//! Size-bounded log rotation with numbered backups.
//!
//! Layout on disk for a live log `search.log` with three generations:
//!
//! ```text
//! search.log      ← live, appended to by the managed process
//! search.log.1    ← newest backup
//! search.log.2
//! search.log.3    ← oldest backup, evicted on the next rotation
//! ```
//!
//! Rotation runs right before a process is launched and is best-effort: any
//! failure is logged as a `RotationFailure` and the launch still happens.

use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::supervisor::error::SupervisorError;

/// Rotation policy for one log path.
#[derive(Debug, Clone)]
pub struct LogFile {
    pub path: PathBuf,
    pub max_bytes: u64,
    /// Number of numbered backups to keep. Zero or negative deletes the live
    /// log instead of keeping any backup.
    pub retained_generations: i64,
}

/// What a rotation pass did. Mostly useful for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    /// The live log is missing or below the threshold; nothing changed.
    Skipped,
    /// The live log was removed without keeping a backup.
    Deleted,
    /// Backups were shifted and the live log became generation 1.
    Rotated,
}

impl LogFile {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, retained_generations: i64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            retained_generations,
        }
    }

    /// Path of backup generation `n` (`name.log.n`).
    pub fn backup_path(&self, n: i64) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    /// Current size of the live log, `None` when it does not exist.
    pub fn current_size(&self) -> Option<u64> {
        fs::metadata(&self.path).ok().map(|m| m.len())
    }

    /// Rotate the live log if it has reached `max_bytes`.
    pub fn rotate(&self) -> RotationOutcome {
        let size = match self.current_size() {
            Some(size) => size,
            None => return RotationOutcome::Skipped,
        };
        if size < self.max_bytes {
            return RotationOutcome::Skipped;
        }

        if self.retained_generations <= 0 {
            if let Err(e) = fs::remove_file(&self.path) {
                self.report(format!("removing live log: {}", e));
            }
            tracing::info!("Log {} reached {} bytes, removed", self.path.display(), size);
            return RotationOutcome::Deleted;
        }

        let oldest = self.backup_path(self.retained_generations);
        if oldest.exists() {
            if let Err(e) = fs::remove_file(&oldest) {
                self.report(format!("removing {}: {}", oldest.display(), e));
            }
        }

        for i in (1..self.retained_generations).rev() {
            let from = self.backup_path(i);
            if !from.exists() {
                continue;
            }
            let to = self.backup_path(i + 1);
            if let Err(e) = fs::rename(&from, &to) {
                self.report(format!("renaming {} -> {}: {}", from.display(), to.display(), e));
            }
        }

        let first = self.backup_path(1);
        if let Err(e) = fs::rename(&self.path, &first) {
            self.report(format!("renaming live log -> {}: {}", first.display(), e));
        }

        tracing::info!(
            "Rotated {} ({} bytes, keeping {} backups)",
            self.path.display(),
            size,
            self.retained_generations
        );
        RotationOutcome::Rotated
    }

    fn report(&self, reason: String) {
        let err = SupervisorError::RotationFailure {
            path: self.path.clone(),
            reason,
        };
        tracing::warn!("[{}] {}", err.error_code(), err);
    }
}

/// Last `count` lines of a file. Missing or unreadable files yield nothing.
pub fn tail_lines(path: &Path, count: usize) -> Vec<String> {
    let file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) => {
            tracing::debug!("Cannot open {} for tail: {}", path.display(), e);
            return Vec::new();
        }
    };

    let mut lines: VecDeque<String> = VecDeque::with_capacity(count.min(1024));
    for line in BufReader::new(file).split(b'\n').map_while(|l| l.ok()) {
        if count == 0 {
            break;
        }
        if lines.len() >= count {
            lines.pop_front();
        }
        lines.push_back(String::from_utf8_lossy(&line).trim_end_matches('\r').to_string());
    }
    lines.into_iter().collect()
}
