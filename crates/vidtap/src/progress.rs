// Session state and progress reporting.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Lifecycle of one recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Capturing,
    Assembling,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Capturing => "capturing",
            SessionState::Assembling => "assembling",
            SessionState::Completed => "completed",
            SessionState::Failed => "failed",
            SessionState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a session, cheap to clone out through the handle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub state: SessionState,
    pub bytes_written: u64,
    pub segments_ready: u64,
    pub segments_total: Option<u64>,
}

impl ProgressSnapshot {
    pub fn idle() -> Self {
        Self {
            state: SessionState::Idle,
            bytes_written: 0,
            segments_ready: 0,
            segments_total: None,
        }
    }

    /// Completion percentage when the total is known, None otherwise.
    pub fn percent(&self) -> Option<f64> {
        match self.segments_total {
            Some(total) if total > 0 => {
                Some((self.segments_ready as f64 / total as f64) * 100.0)
            }
            Some(_) => Some(100.0),
            None => None,
        }
    }
}

/// Progress shared between the session task and its handle.
#[derive(Debug, Clone)]
pub struct SharedProgress {
    inner: Arc<RwLock<ProgressSnapshot>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ProgressSnapshot::idle())),
        }
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.inner.read().clone()
    }

    pub(crate) fn update(&self, apply: impl FnOnce(&mut ProgressSnapshot)) {
        apply(&mut self.inner.write());
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_needs_a_total() {
        let mut snapshot = ProgressSnapshot::idle();
        assert_eq!(snapshot.percent(), None);
        snapshot.segments_total = Some(4);
        snapshot.segments_ready = 1;
        assert_eq!(snapshot.percent(), Some(25.0));
    }

    #[test]
    fn test_updates_visible_through_clones() {
        let progress = SharedProgress::new();
        let view = progress.clone();
        progress.update(|p| {
            p.state = SessionState::Capturing;
            p.bytes_written = 512;
        });
        let snapshot = view.snapshot();
        assert_eq!(snapshot.state, SessionState::Capturing);
        assert_eq!(snapshot.bytes_written, 512);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(!SessionState::Capturing.is_terminal());
    }
}
