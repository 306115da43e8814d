use std::path::Path;

use crate::models::config::OutputFormat;
use crate::models::error::CaptureError;

use super::flac_writer::FlacWriter;
use super::wav_writer::{FinalizedFile, WavSettings, WavWriter};

/// The writer behind a session, chosen by [`OutputFormat`].
pub enum OutputWriter {
    Wav(WavWriter),
    Flac(FlacWriter),
}

impl OutputWriter {
    pub fn create(path: &Path, format: OutputFormat, settings: WavSettings) -> Result<Self, CaptureError> {
        match format {
            OutputFormat::Wav => WavWriter::create(path, settings).map(Self::Wav),
            OutputFormat::Flac => FlacWriter::create(path, settings).map(Self::Flac),
        }
    }

    pub fn write_samples(&mut self, samples: &[f32]) -> Result<(), CaptureError> {
        match self {
            Self::Wav(writer) => writer.write_samples(samples),
            Self::Flac(writer) => writer.write_samples(samples),
        }
    }

    pub fn finalize(&mut self) -> Result<FinalizedFile, CaptureError> {
        match self {
            Self::Wav(writer) => writer.finalize(),
            Self::Flac(writer) => writer.finalize(),
        }
    }

    pub fn discard(&mut self) {
        match self {
            Self::Wav(writer) => writer.discard(),
            Self::Flac(writer) => writer.discard(),
        }
    }

    pub fn frames_written(&self) -> u64 {
        match self {
            Self::Wav(writer) => writer.frames_written(),
            Self::Flac(writer) => writer.frames_written(),
        }
    }
}
