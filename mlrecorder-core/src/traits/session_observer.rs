use crate::models::error::CaptureError;
use crate::models::recording_result::RecordingResult;
use crate::models::recording_type::RecordingType;
use crate::models::state::SessionState;

/// Event callbacks for session lifecycle notifications.
///
/// Called from session worker threads and from the thread driving the
/// controller. Implementations should hand off to their own thread if they
/// do anything slow (speech, UI).
pub trait SessionObserver: Send + Sync {
    fn on_state_changed(&self, recording_type: RecordingType, state: SessionState);

    /// A session failed; `error` is the recorded cause.
    fn on_error(&self, _recording_type: RecordingType, _error: &CaptureError) {}

    /// The output file was finalized.
    fn on_recording_finished(&self, _result: &RecordingResult) {}
}
