//! Session configuration
//!
//! Everything here has a sensible default so `SessionConfig::default()` is a
//! working setup; a YAML file can override any subset of fields.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fixed default sandbox root — validation paths are pinned here.
pub const SANDBOX_ROOT: &str = "/home/student";

/// Configuration for a shell session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell binary spawned inside the PTY.
    pub shell: String,
    /// Sandbox root; `HOME` for the shell and the anchor for validation.
    pub sandbox_root: PathBuf,
    pub user: String,
    pub hostname: String,
    pub rows: u16,
    pub cols: u16,
    /// Where the progress document lives.
    pub progress_path: PathBuf,
    /// Directory holding the lesson index and lesson files.
    pub lessons_dir: PathBuf,
    pub timing: TimingConfig,
}

/// Timing knobs, all in milliseconds.
///
/// The defaults are the tuned values; they only move in tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Idle flush for the byte coalescer.
    pub coalesce_idle_ms: u64,
    /// Safety flush for a buffered partial sentinel.
    pub partial_flush_ms: u64,
    /// Idle flush for queued system messages.
    pub message_flush_ms: u64,
    /// Drain after running a seed script.
    pub seed_drain_ms: u64,
    /// Drain after a seed script that invokes git.
    pub seed_drain_slow_ms: u64,
    /// Drain after validation before the display is restored.
    pub validation_drain_ms: u64,
    /// Upper bound on boot-to-ready; exceeding it is fatal.
    pub boot_timeout_ms: u64,
    /// Poll interval while waiting for a probe temp file.
    pub probe_poll_ms: u64,
    /// Give-up bound for a probe temp file.
    pub probe_timeout_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            coalesce_idle_ms: 4,
            partial_flush_ms: 50,
            message_flush_ms: 8,
            seed_drain_ms: 800,
            seed_drain_slow_ms: 3_000,
            validation_drain_ms: 600,
            boot_timeout_ms: 120_000,
            probe_poll_ms: 25,
            probe_timeout_ms: 2_000,
        }
    }
}

impl TimingConfig {
    pub fn coalesce_idle(&self) -> Duration {
        Duration::from_millis(self.coalesce_idle_ms)
    }

    pub fn partial_flush(&self) -> Duration {
        Duration::from_millis(self.partial_flush_ms)
    }

    pub fn message_flush(&self) -> Duration {
        Duration::from_millis(self.message_flush_ms)
    }

    pub fn validation_drain(&self) -> Duration {
        Duration::from_millis(self.validation_drain_ms)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_millis(self.boot_timeout_ms)
    }

    /// Seed drain, slower when any setup command reaches for git.
    pub fn seed_drain(&self, uses_git: bool) -> Duration {
        if uses_git {
            Duration::from_millis(self.seed_drain_slow_ms)
        } else {
            Duration::from_millis(self.seed_drain_ms)
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        Self {
            shell: "bash".to_string(),
            sandbox_root: PathBuf::from(SANDBOX_ROOT),
            user: "student".to_string(),
            hostname: "shellcoach".to_string(),
            rows: 24,
            cols: 80,
            progress_path: PathBuf::from(home.clone()).join(".shellcoach/progress.json"),
            lessons_dir: PathBuf::from(home).join(".shellcoach/lessons"),
            timing: TimingConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load from a YAML file; a missing file yields the defaults.
    pub fn load(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(raw) => serde_yaml::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "Bad config file, using defaults");
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn sandbox_root_str(&self) -> String {
        self.sandbox_root.to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let cfg = SessionConfig::default();
        assert_eq!(cfg.shell, "bash");
        assert_eq!(cfg.sandbox_root, PathBuf::from("/home/student"));
        assert_eq!(cfg.timing.coalesce_idle_ms, 4);
        assert_eq!(cfg.timing.validation_drain_ms, 600);
        assert_eq!(cfg.timing.boot_timeout_ms, 120_000);
    }

    #[test]
    fn test_partial_override() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "sandbox_root: /tmp/box\ntiming:\n  seed_drain_ms: 100\n").unwrap();

        let cfg = SessionConfig::load(&path);
        assert_eq!(cfg.sandbox_root, PathBuf::from("/tmp/box"));
        assert_eq!(cfg.timing.seed_drain_ms, 100);
        // Untouched fields keep defaults.
        assert_eq!(cfg.timing.validation_drain_ms, 600);
        assert_eq!(cfg.user, "student");
    }

    #[test]
    fn test_missing_file_is_default() {
        let cfg = SessionConfig::load(Path::new("/nonexistent/config.yaml"));
        assert_eq!(cfg.shell, "bash");
    }

    #[test]
    fn test_seed_drain_selects_git_window() {
        let t = TimingConfig::default();
        assert_eq!(t.seed_drain(false), Duration::from_millis(800));
        assert_eq!(t.seed_drain(true), Duration::from_millis(3_000));
    }
}
