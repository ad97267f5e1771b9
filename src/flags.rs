//! File-flag control plane.
//!
//! Four marker files let a supervising process (CLI, GUI, CI harness) steer
//! the crawl loop without IPC: presence is the only signal that matters.
//! Filesystem errors are treated as advisory — a check error reads as
//! "absent", a create/remove error is logged and ignored.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlagKind {
    Shutdown,
    Pause,
    StepGate,
    ContinueGate,
}

impl FlagKind {
    fn filename(self) -> &'static str {
        match self {
            FlagKind::Shutdown => "crawler_shutdown.flag",
            FlagKind::Pause => "crawler_pause.flag",
            FlagKind::StepGate => "crawler_step_by_step.flag",
            FlagKind::ContinueGate => "crawler_continue.flag",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "shutdown" => Some(FlagKind::Shutdown),
            "pause" => Some(FlagKind::Pause),
            "step-gate" | "step_by_step" => Some(FlagKind::StepGate),
            "continue-gate" | "continue" => Some(FlagKind::ContinueGate),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlagConfig {
    #[serde(default = "default_flag_dir")]
    pub dir: PathBuf,
}

impl Default for FlagConfig {
    fn default() -> Self {
        Self {
            dir: default_flag_dir(),
        }
    }
}

fn default_flag_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Watches/creates the four marker files.
#[derive(Debug, Clone)]
pub struct FlagController {
    dir: PathBuf,
}

impl FlagController {
    pub fn new(config: &FlagConfig) -> Self {
        Self {
            dir: config.dir.clone(),
        }
    }

    fn path(&self, kind: FlagKind) -> PathBuf {
        self.dir.join(kind.filename())
    }

    /// Filesystem errors on check read as "absent" — the signal is advisory.
    pub fn exists(&self, kind: FlagKind) -> bool {
        self.path(kind).is_file()
    }

    pub fn create(&self, kind: FlagKind) {
        let path = self.path(kind);
        if let Err(e) = std::fs::write(&path, b"") {
            warn!("failed to create flag {}: {}", path.display(), e);
        }
    }

    pub fn remove(&self, kind: FlagKind) {
        let path = self.path(kind);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!("failed to remove flag {}: {}", path.display(), e);
            }
        }
    }

    pub fn shutdown_requested(&self) -> bool {
        self.exists(FlagKind::Shutdown)
    }

    pub fn pause_requested(&self) -> bool {
        self.exists(FlagKind::Pause)
    }

    /// Blocks (async-sleeping) while `pause` is present, re-checking
    /// `shutdown` every cycle so a shutdown during a pause is still honored.
    pub async fn wait_while_paused(&self) {
        while self.pause_requested() {
            if self.shutdown_requested() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        }
    }

    /// If step-gating is enabled, blocks until `continue-gate` appears, then
    /// consumes it.
    pub async fn honor_step_gate(&self) {
        if !self.exists(FlagKind::StepGate) {
            return;
        }
        while !self.exists(FlagKind::ContinueGate) {
            if self.shutdown_requested() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
        self.remove(FlagKind::ContinueGate);
    }
}

pub fn flag_dir_default() -> PathBuf {
    default_flag_dir()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn exists_reads_absent_when_no_file() {
        let dir = tempdir().unwrap();
        let ctl = FlagController::new(&FlagConfig { dir: dir.path().to_path_buf() });
        assert!(!ctl.exists(FlagKind::Shutdown));
    }

    #[test]
    fn create_then_exists_then_remove() {
        let dir = tempdir().unwrap();
        let ctl = FlagController::new(&FlagConfig { dir: dir.path().to_path_buf() });
        ctl.create(FlagKind::Pause);
        assert!(ctl.exists(FlagKind::Pause));
        ctl.remove(FlagKind::Pause);
        assert!(!ctl.exists(FlagKind::Pause));
    }

    #[test]
    fn from_str_accepts_aliases() {
        assert_eq!(FlagKind::from_str("step_by_step"), Some(FlagKind::StepGate));
        assert_eq!(FlagKind::from_str("continue"), Some(FlagKind::ContinueGate));
        assert_eq!(FlagKind::from_str("bogus"), None);
    }

    #[tokio::test]
    async fn honor_step_gate_noop_when_not_gated() {
        let dir = tempdir().unwrap();
        let ctl = FlagController::new(&FlagConfig { dir: dir.path().to_path_buf() });
        ctl.honor_step_gate().await; // must return immediately
    }

    #[tokio::test]
    async fn honor_step_gate_consumes_continue_flag() {
        let dir = tempdir().unwrap();
        let ctl = FlagController::new(&FlagConfig { dir: dir.path().to_path_buf() });
        ctl.create(FlagKind::StepGate);
        ctl.create(FlagKind::ContinueGate);
        ctl.honor_step_gate().await;
        assert!(!ctl.exists(FlagKind::ContinueGate));
    }
}
