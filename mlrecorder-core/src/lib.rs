//! # mlrecorder-core
//!
//! Platform-agnostic core of a toggle-driven multi-source audio recorder.
//!
//! Captures the audio of the focused process, the system mix and/or a
//! microphone, optionally mixes two sources into one stream, and writes one
//! WAV or FLAC file per recording session. Platform backends (Windows WASAPI)
//! implement the `CaptureBackend` trait; `SyntheticBackend` generates
//! deterministic signals for tests and hosts without audio hardware.
//!
//! ## Architecture
//!
//! ```text
//! mlrecorder-core (this crate)
//! ├── traits/       ← CaptureBackend, CaptureEndpoint, SessionObserver
//! ├── models/       ← CaptureError, RecordingType, RecorderConfig, AudioFrame, etc.
//! ├── processing/   ← StreamMixer, LinearResampler, FrameRing, RingBuffer, WAV encoding
//! ├── capture/      ← ThreadedEndpoint, MixedEndpoint, SyntheticBackend
//! ├── storage/      ← WAV and FLAC writers, file naming, metadata sidecar
//! ├── session/      ← RecordingSession, SessionRegistry, ConflictTable
//! └── controller    ← Recorder (toggle / stop all / status / actions)
//! ```

pub mod capture;
pub mod controller;
pub mod models;
pub mod processing;
pub mod session;
pub mod storage;
pub mod traits;

// Re-export key types at crate root for convenience.
pub use capture::mixed::{MixSettings, MixedEndpoint};
pub use capture::synthetic::{SyntheticBackend, SyntheticSource, Waveform};
pub use capture::threaded::{FrameSink, Handshake, ThreadedEndpoint};
pub use controller::{ActionOutcome, Recorder, RecorderAction};
pub use models::audio_models::{AudioFormat, AudioFrame, EndpointInfo, InputDevice, ProcessTarget, SourceSpec};
pub use models::config::{ConflictPolicy, OutputFormat, RecorderConfig};
pub use models::error::CaptureError;
pub use models::recording_result::{
    RecordingMetadata, RecordingResult, SessionStatus, StopOutcome, StopReport, ToggleResult,
};
pub use models::recording_type::{RecordingType, SourceKind};
pub use models::state::{FailureKind, SessionFailure, SessionState, StopReason};
pub use processing::frame_ring::FrameRing;
pub use processing::ring_buffer::RingBuffer;
pub use processing::stream_mixer::{LinearResampler, SharedGain, StreamMixer};
pub use processing::wav_format::SampleEncoding;
pub use session::conflict::ConflictTable;
pub use session::recording_session::RecordingSession;
pub use session::registry::SessionRegistry;
pub use storage::flac_writer::FlacWriter;
pub use storage::output_writer::OutputWriter;
pub use storage::wav_writer::WavWriter;
pub use traits::capture_backend::{CaptureBackend, CaptureEndpoint, NextFrame};
pub use traits::session_observer::SessionObserver;
