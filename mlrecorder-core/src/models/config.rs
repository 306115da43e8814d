use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::{ProjectDirs, UserDirs};
use serde::{Deserialize, Serialize};

use super::error::CaptureError;
use super::recording_type::SourceKind;

/// Folder created under the user's documents directory for recordings.
pub const DEFAULT_OUTPUT_FOLDER: &str = "MLRecorder";

/// Container/codec of the output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Wav,
    /// Lossless; 16- or 24-bit only.
    Flac,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Flac => "flac",
        }
    }
}

/// Whether a mixed type may run next to a plain type that shares one of its sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Types sharing a source with a mixed type are mutually exclusive.
    #[default]
    Exclusive,
    /// The platform allows several taps on one device; nothing conflicts.
    SharedTaps,
}

/// Recorder configuration.
///
/// Every field has a default, so a partial TOML file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Overrides `Documents/MLRecorder`.
    pub output_directory: Option<PathBuf>,

    pub output_format: OutputFormat,

    /// Output sample rate in Hz. `None` keeps the native rate (higher of the two for mixes).
    pub sample_rate: Option<u32>,

    /// Bit depth of the output file: 16, 24 (PCM) or 32 (IEEE float).
    pub bit_depth: u16,

    /// Bounded wait before a missing frame is replaced with silence.
    pub silence_timeout_ms: u64,

    /// Length of one mixer tick.
    pub mix_tick_ms: u64,

    /// Frames buffered between a capture thread and its consumer.
    pub ring_capacity: usize,

    /// Upper bound for a session to reach the active state.
    pub start_timeout_ms: u64,

    /// Upper bound for a stop request to complete.
    pub stop_grace_ms: u64,

    /// Do not write frames whose peak is below `silence_threshold`.
    pub skip_silence: bool,

    pub silence_threshold: f32,

    /// Capture volume in percent (0–200) per source kind.
    pub process_volume: u16,
    pub system_volume: u16,
    pub microphone_volume: u16,

    /// Input device id; `None` uses the default input device.
    pub microphone_device_id: Option<String>,

    pub conflict_policy: ConflictPolicy,

    /// Write `<file>.metadata.json` next to each finalized recording.
    pub write_metadata: bool,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            output_directory: None,
            output_format: OutputFormat::Wav,
            sample_rate: None,
            bit_depth: 16,
            silence_timeout_ms: 40,
            mix_tick_ms: 20,
            ring_capacity: 64,
            start_timeout_ms: 3000,
            stop_grace_ms: 3000,
            skip_silence: false,
            silence_threshold: 0.001,
            process_volume: 100,
            system_volume: 100,
            microphone_volume: 100,
            microphone_device_id: None,
            conflict_policy: ConflictPolicy::Exclusive,
            write_metadata: false,
        }
    }
}

impl RecorderConfig {
    pub fn validate(&self) -> Result<(), CaptureError> {
        if let Some(rate) = self.sample_rate {
            if !(8_000..=384_000).contains(&rate) {
                return Err(CaptureError::ConfigurationFailed(format!(
                    "unsupported sample rate: {rate}"
                )));
            }
        }
        if ![16, 24, 32].contains(&self.bit_depth) {
            return Err(CaptureError::ConfigurationFailed(format!(
                "unsupported bit depth: {}",
                self.bit_depth
            )));
        }
        if self.output_format == OutputFormat::Flac && self.bit_depth == 32 {
            return Err(CaptureError::ConfigurationFailed(
                "FLAC output needs a bit depth of 16 or 24".into(),
            ));
        }
        if self.silence_timeout_ms == 0 || self.mix_tick_ms == 0 {
            return Err(CaptureError::ConfigurationFailed(
                "silence timeout and mix tick must be positive".into(),
            ));
        }
        if self.ring_capacity == 0 {
            return Err(CaptureError::ConfigurationFailed(
                "ring capacity must be at least one frame".into(),
            ));
        }
        if self.stop_grace_ms == 0 || self.start_timeout_ms == 0 {
            return Err(CaptureError::ConfigurationFailed(
                "start timeout and stop grace period must be positive".into(),
            ));
        }
        for (name, volume) in [
            ("process", self.process_volume),
            ("system", self.system_volume),
            ("microphone", self.microphone_volume),
        ] {
            if volume > 200 {
                return Err(CaptureError::ConfigurationFailed(format!(
                    "{name} volume must be within 0-200%, got {volume}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.silence_threshold) {
            return Err(CaptureError::ConfigurationFailed(format!(
                "silence threshold must be within [0, 1), got {}",
                self.silence_threshold
            )));
        }
        Ok(())
    }

    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn mix_tick(&self) -> Duration {
        Duration::from_millis(self.mix_tick_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Linear gain applied to a source kind.
    pub fn gain_for(&self, kind: SourceKind) -> f32 {
        let percent = match kind {
            SourceKind::Process => self.process_volume,
            SourceKind::System => self.system_volume,
            SourceKind::Microphone => self.microphone_volume,
        };
        percent as f32 / 100.0
    }

    /// Directory recordings are written to.
    pub fn resolve_output_directory(&self) -> Result<PathBuf, CaptureError> {
        if let Some(dir) = &self.output_directory {
            return Ok(dir.clone());
        }
        let user_dirs = UserDirs::new().ok_or_else(|| {
            CaptureError::PathUnwritable("cannot locate the user's home directory".into())
        })?;
        let base = user_dirs
            .document_dir()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| user_dirs.home_dir().to_path_buf());
        Ok(base.join(DEFAULT_OUTPUT_FOLDER))
    }

    /// Default location of `config.toml`.
    pub fn default_path() -> Result<PathBuf, CaptureError> {
        let dirs = ProjectDirs::from("org", "mlrecorder", "MLRecorder").ok_or_else(|| {
            CaptureError::ConfigurationFailed("cannot locate the config directory".into())
        })?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load from `path`, falling back to defaults when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self, CaptureError> {
        if !path.exists() {
            log::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|e| {
            CaptureError::ConfigurationFailed(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config: Self = toml::from_str(&contents).map_err(|e| {
            CaptureError::ConfigurationFailed(format!("failed to parse {}: {}", path.display(), e))
        })?;
        config.validate()?;
        log::info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Save to `path` by writing a temp file and renaming it over the target.
    pub fn save_to(&self, path: &Path) -> Result<(), CaptureError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| CaptureError::ConfigurationFailed(format!("failed to serialize config: {e}")))?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| CaptureError::from_create(&e, "config directory"))?;
        }

        let temp_path = path.with_extension("toml.tmp");
        let mut temp = fs::File::create(&temp_path)
            .map_err(|e| CaptureError::from_create(&e, "temp config file"))?;
        temp.write_all(contents.as_bytes())
            .map_err(|e| CaptureError::from_io(&e, "temp config file"))?;
        temp.sync_all()
            .map_err(|e| CaptureError::from_io(&e, "temp config file"))?;
        fs::rename(&temp_path, path).map_err(|e| CaptureError::from_io(&e, "config rename"))?;

        log::info!("Configuration saved to {}", path.display());
        Ok(())
    }
}
