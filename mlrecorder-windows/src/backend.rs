use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use mlrecorder_core::capture::threaded::DEFAULT_OPEN_TIMEOUT;
use mlrecorder_core::models::audio_models::{InputDevice, ProcessTarget, SourceSpec};
use mlrecorder_core::models::error::CaptureError;
use mlrecorder_core::traits::capture_backend::{CaptureBackend, CaptureEndpoint};

use crate::com::ComApartment;
use crate::device_enumerator::DeviceEnumerator;
use crate::permissions::{check_microphone_permission, MicrophoneAccess};
use crate::{foreground, wasapi_loopback, wasapi_mic, wasapi_process_loopback};

/// [`CaptureBackend`] over WASAPI.
///
/// Every opened source runs on its own capture thread with its own COM
/// apartment; the backend itself holds no COM objects and is freely shared.
pub struct WasapiBackend {
    open_timeout: Duration,
    microphone_denied: AtomicBool,
}

impl WasapiBackend {
    pub fn new() -> Self {
        Self::with_open_timeout(DEFAULT_OPEN_TIMEOUT)
    }

    /// Bound how long `open` waits for a capture thread to report its device.
    pub fn with_open_timeout(open_timeout: Duration) -> Self {
        Self {
            open_timeout,
            microphone_denied: AtomicBool::new(false),
        }
    }
}

impl Default for WasapiBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureBackend for WasapiBackend {
    fn name(&self) -> &str {
        "wasapi"
    }

    fn initialize(&self) -> Result<(), CaptureError> {
        match check_microphone_permission()? {
            MicrophoneAccess::Granted => log::debug!("Microphone access granted"),
            MicrophoneAccess::Denied => {
                log::warn!("Microphone access is disabled in Windows privacy settings");
                self.microphone_denied.store(true, Ordering::Release);
            }
            MicrophoneAccess::InUse => log::warn!("Default microphone is held exclusively by another application"),
            MicrophoneAccess::NoDevice => log::info!("No microphone present"),
        }
        Ok(())
    }

    fn open(&self, spec: &SourceSpec, ring_capacity: usize) -> Result<Box<dyn CaptureEndpoint>, CaptureError> {
        let endpoint = match spec {
            SourceSpec::Process { target } => {
                wasapi_process_loopback::open(target.clone(), ring_capacity, self.open_timeout)?
            }
            SourceSpec::System => wasapi_loopback::open(ring_capacity, self.open_timeout)?,
            SourceSpec::Microphone { device_id } => {
                match wasapi_mic::open(device_id.clone(), ring_capacity, self.open_timeout) {
                    Ok(endpoint) => endpoint,
                    // A generic activation failure after a denied permission check is the privacy toggle.
                    Err(CaptureError::DeviceUnavailable(msg)) if self.microphone_denied.load(Ordering::Acquire) => {
                        return Err(CaptureError::PermissionDenied(msg))
                    }
                    Err(e) => return Err(e),
                }
            }
        };
        Ok(Box::new(endpoint))
    }

    fn input_devices(&self) -> Result<Vec<InputDevice>, CaptureError> {
        let _com = ComApartment::enter()?;
        DeviceEnumerator::new()?.list_capture_devices()
    }

    fn focused_process(&self) -> Option<ProcessTarget> {
        foreground::focused_process()
    }
}
