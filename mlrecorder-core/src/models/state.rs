use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::CaptureError;
use super::recording_result::RecordingResult;

/// Recording session state machine.
///
/// ```text
/// idle → starting → active → stopping → finalized
///           ↓          ↓         ↓
///         failed ←─────┴─────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
    Finalized,
    Failed,
}

impl SessionState {
    /// States in which the session holds a registry slot.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Active | Self::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a session left the active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `toggle()`/`stop()` from the caller.
    User,
    /// `stop_all()`.
    StopAll,
    /// Controller teardown.
    Shutdown,
    /// The source vanished or the writer failed mid-recording.
    Interrupted,
}

/// Which transition produced a `Failed` session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Starting → Failed.
    StartFailed,
    /// Active → Failed after the source disappeared.
    Interrupted,
    /// Active → Failed after the writer could not persist a frame.
    WriteFailed,
    /// Stopping → Failed because finalize or close failed.
    StopFailed,
    /// Stopping → Failed because the stop did not complete within the grace period.
    Unresponsive,
}

/// Recorded cause of a failed session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionFailure {
    pub kind: FailureKind,
    pub cause: CaptureError,
    /// The best-effort finalized file, when one was kept.
    pub partial: Option<Box<RecordingResult>>,
}

impl SessionFailure {
    pub fn new(kind: FailureKind, cause: CaptureError) -> Self {
        Self {
            kind,
            cause,
            partial: None,
        }
    }

    pub fn with_partial(mut self, partial: RecordingResult) -> Self {
        self.partial = Some(Box::new(partial));
        self
    }

    pub fn partial_path(&self) -> Option<&PathBuf> {
        self.partial.as_ref().map(|r| &r.file_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_and_terminal_are_disjoint() {
        for state in [
            SessionState::Idle,
            SessionState::Starting,
            SessionState::Active,
            SessionState::Stopping,
            SessionState::Finalized,
            SessionState::Failed,
        ] {
            assert!(!(state.is_live() && state.is_terminal()), "{state}");
        }
        assert!(!SessionState::Idle.is_live());
        assert!(!SessionState::Idle.is_terminal());
    }
}
