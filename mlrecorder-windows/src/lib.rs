//! # mlrecorder-windows
//!
//! Windows WASAPI backend for mlrecorder.
//!
//! Provides:
//! - `WasapiBackend`: the `CaptureBackend` handed to `Recorder`
//! - `wasapi_mic`: microphone capture on a shared-mode capture endpoint
//! - `wasapi_loopback`: system audio via loopback on the default render endpoint
//! - `wasapi_process_loopback`: one process and its children via the
//!   process-loopback virtual device
//! - `DeviceEnumerator`: input device listing via the MMDevice API
//! - `permissions`: Windows microphone privacy check
//! - `foreground`: the process owning the focused window
//!
//! ## Platform Requirements
//! - Windows 10 2004+ (build 19041) for process loopback
//! - Visual Studio Build Tools 2022 + Windows SDK for linking
//!
//! ## Usage
//! ```ignore
//! use std::sync::Arc;
//! use mlrecorder_core::{Recorder, RecorderConfig, RecordingType};
//! use mlrecorder_windows::WasapiBackend;
//!
//! let recorder = Recorder::new(RecorderConfig::default(), Arc::new(WasapiBackend::new()))?;
//! recorder.toggle(RecordingType::MixSystemMic)?;
//! ```

pub mod sample_format;

#[cfg(target_os = "windows")]
pub mod backend;
#[cfg(target_os = "windows")]
pub mod com;
#[cfg(target_os = "windows")]
pub mod device_enumerator;
#[cfg(target_os = "windows")]
pub mod foreground;
#[cfg(target_os = "windows")]
pub mod permissions;
#[cfg(target_os = "windows")]
pub mod stream;
#[cfg(target_os = "windows")]
pub mod wasapi_loopback;
#[cfg(target_os = "windows")]
pub mod wasapi_mic;
#[cfg(target_os = "windows")]
pub mod wasapi_process_loopback;

#[cfg(target_os = "windows")]
pub use backend::WasapiBackend;
#[cfg(target_os = "windows")]
pub use device_enumerator::DeviceEnumerator;
