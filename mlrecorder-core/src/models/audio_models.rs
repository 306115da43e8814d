use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::recording_type::SourceKind;

/// Sample rate and channel layout of an interleaved f32 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self { sample_rate, channels }
    }

    /// Number of whole frames needed to cover `duration`.
    pub fn frames_for(&self, duration: Duration) -> usize {
        (self.sample_rate as f64 * duration.as_secs_f64()).round() as usize
    }

    pub fn duration_of(&self, frames: u64) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }
}

/// Description of an opened capture endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    pub kind: SourceKind,
    pub format: AudioFormat,
    /// Bit depth the device delivers natively (samples are always handed over as f32).
    pub bit_depth: u16,
    pub name: String,
}

/// One immutable block of interleaved f32 samples in `[-1.0, 1.0]`.
///
/// `timestamp` is measured on the producing endpoint's capture clock, from
/// the moment it was opened. `index` increases by one per delivered frame.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    format: AudioFormat,
    timestamp: Duration,
    index: u64,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, format: AudioFormat, timestamp: Duration, index: u64) -> Self {
        Self {
            samples,
            format,
            timestamp,
            index,
        }
    }

    /// A block of digital silence lasting `frames` frames.
    pub fn silence(format: AudioFormat, frames: usize, timestamp: Duration, index: u64) -> Self {
        Self::new(
            vec![0.0; frames * format.channels as usize],
            format,
            timestamp,
            index,
        )
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn frame_count(&self) -> usize {
        match self.format.channels {
            0 => 0,
            ch => self.samples.len() / ch as usize,
        }
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.frame_count() as u64)
    }

    /// Same samples, re-stamped with a new index.
    pub fn with_index(mut self, index: u64) -> Self {
        self.index = index;
        self
    }
}

/// A process targeted by process-loopback capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTarget {
    pub pid: u32,
    pub name: String,
}

impl ProcessTarget {
    pub fn new(pid: u32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: display_name(&name.into()),
        }
    }
}

/// Strip whitespace and a trailing `.exe` for display.
fn display_name(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    match lower.strip_suffix(".exe") {
        Some(stem) => trimmed[..stem.len()].trim().to_string(),
        None => trimmed.to_string(),
    }
}

/// What a backend is asked to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSpec {
    /// The target process together with its child processes.
    Process { target: ProcessTarget },
    System,
    Microphone { device_id: Option<String> },
}

impl SourceSpec {
    pub fn kind(&self) -> SourceKind {
        match self {
            Self::Process { .. } => SourceKind::Process,
            Self::System => SourceKind::System,
            Self::Microphone { .. } => SourceKind::Microphone,
        }
    }
}

/// An input device available for microphone capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDevice {
    pub id: String,
    pub name: String,
    pub is_default: bool,
}
