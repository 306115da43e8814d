use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::audio_models::ProcessTarget;
use super::recording_type::{RecordingType, SourceKind};
use super::state::{SessionFailure, SessionState, StopReason};

/// Result returned when a session finalizes its output file.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingResult {
    pub recording_type: RecordingType,
    pub file_path: PathBuf,
    pub duration_secs: f64,
    pub checksum: String,
    pub metadata: RecordingMetadata,
}

/// Metadata describing a finished recording.
///
/// Serializable for the optional JSON sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingMetadata {
    pub id: String,
    pub recording_type: RecordingType,
    pub sources: Vec<SourceKind>,
    pub process: Option<ProcessTarget>,
    pub file_path: String,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub frames_written: u64,
    pub duration_secs: f64,
    pub checksum: String,
    pub created_at: String,
    pub dropped_frames: u64,
    pub drift_ticks: u64,
    pub stop_reason: StopReason,
}

impl RecordingMetadata {
    pub fn interrupted(&self) -> bool {
        self.stop_reason == StopReason::Interrupted
    }
}

/// What `toggle()` did.
#[derive(Debug, Clone, PartialEq)]
pub enum ToggleResult {
    Started {
        recording_type: RecordingType,
        output_path: PathBuf,
    },
    Stopped(Box<RecordingResult>),
}

/// Outcome of stopping one session.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Finalized(Box<RecordingResult>),
    Failed(SessionFailure),
    /// Nothing was live for the type. Stopping twice lands here.
    NotActive,
}

impl StopOutcome {
    pub fn is_finalized(&self) -> bool {
        matches!(self, Self::Finalized(_))
    }
}

/// Per-type entry of `stop_all()`.
#[derive(Debug, Clone, PartialEq)]
pub struct StopReport {
    pub recording_type: RecordingType,
    pub outcome: StopOutcome,
}

/// One line of `status()`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub recording_type: RecordingType,
    pub state: SessionState,
    /// Time spent recording: from the first written frame to now, or to the end of the session.
    pub elapsed: Duration,
    pub output_path: PathBuf,
    pub process: Option<ProcessTarget>,
    pub failure: Option<SessionFailure>,
    pub dropped_frames: u64,
    pub drift_ticks: u64,
}

impl SessionStatus {
    pub fn was_interrupted(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|f| f.kind == super::state::FailureKind::Interrupted)
    }
}
