use std::time::Duration;

use crate::models::audio_models::{AudioFrame, EndpointInfo, InputDevice, ProcessTarget, SourceSpec};
use crate::models::error::CaptureError;

/// What `next_frame` produced.
#[derive(Debug, Clone, PartialEq)]
pub enum NextFrame {
    Frame(AudioFrame),
    /// Nothing arrived within the timeout; the source is still open.
    Timeout,
    /// The source was closed and every buffered frame has been delivered.
    EndOfStream,
}

/// One opened, live audio source.
///
/// Owned by exactly one session. Frames are delivered in capture order.
/// An `Err` from `next_frame` means the source vanished (device removed,
/// target process exited) and no further frames will arrive.
pub trait CaptureEndpoint: Send {
    fn info(&self) -> &EndpointInfo;

    /// Wait up to `timeout` for the next frame.
    fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame, CaptureError>;

    /// Stop capturing and release the device. Idempotent.
    ///
    /// Frames captured before the call stay readable until `EndOfStream`.
    fn close(&mut self) -> Result<(), CaptureError>;

    /// Frames discarded because the consumer fell behind.
    fn dropped_frames(&self) -> u64;

    /// Ticks in which a missing input was replaced with silence.
    fn drift_ticks(&self) -> u64 {
        0
    }
}

/// Interface for platform-specific capture backends.
///
/// Implemented by:
/// - `WasapiBackend` (Windows)
/// - `SyntheticBackend` (in-process generator, used by tests)
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before the first `open`.
    fn initialize(&self) -> Result<(), CaptureError> {
        Ok(())
    }

    /// Called once on recorder teardown, after every session has stopped.
    fn shutdown(&self) {}

    /// Open a source. The returned endpoint is already capturing.
    ///
    /// `ring_capacity` bounds the number of frames buffered between the
    /// capture thread and the consumer.
    fn open(
        &self,
        spec: &SourceSpec,
        ring_capacity: usize,
    ) -> Result<Box<dyn CaptureEndpoint>, CaptureError>;

    /// Input devices usable for microphone capture.
    fn input_devices(&self) -> Result<Vec<InputDevice>, CaptureError>;

    /// The process owning the focused window, if any.
    fn focused_process(&self) -> Option<ProcessTarget>;
}
