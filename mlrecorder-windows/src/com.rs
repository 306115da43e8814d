//! COM apartment handling and HRESULT translation.

use windows::core::Error as WinError;
use windows::Win32::Foundation::{E_ACCESSDENIED, RPC_E_CHANGED_MODE};
use windows::Win32::Media::Audio::{AUDCLNT_E_DEVICE_INVALIDATED, AUDCLNT_E_UNSUPPORTED_FORMAT};
use windows::Win32::System::Com::{CoInitializeEx, CoUninitialize, COINIT_MULTITHREADED};

use mlrecorder_core::models::error::CaptureError;

/// Joins the calling thread to the multithreaded apartment for its lifetime.
///
/// If the thread already lives in a single-threaded apartment the guard
/// borrows it and does not uninitialize on drop.
pub struct ComApartment {
    owned: bool,
}

impl ComApartment {
    pub fn enter() -> Result<Self, CaptureError> {
        let hr = unsafe { CoInitializeEx(None, COINIT_MULTITHREADED) };
        if hr == RPC_E_CHANGED_MODE {
            log::debug!("COM already initialized as STA on this thread");
            return Ok(Self { owned: false });
        }
        hr.ok()
            .map_err(|e| CaptureError::ConfigurationFailed(format!("CoInitializeEx failed: {}", e)))?;
        Ok(Self { owned: true })
    }
}

impl Drop for ComApartment {
    fn drop(&mut self) {
        if self.owned {
            unsafe { CoUninitialize() };
        }
    }
}

/// Map a failed WASAPI call onto the recorder's error kinds.
pub fn capture_error(context: &str, err: &WinError) -> CaptureError {
    let message = format!("{}: {}", context, err);
    match err.code() {
        code if code == E_ACCESSDENIED => CaptureError::PermissionDenied(message),
        code if code == AUDCLNT_E_DEVICE_INVALIDATED => CaptureError::Interrupted(message),
        code if code == AUDCLNT_E_UNSUPPORTED_FORMAT => CaptureError::FormatNegotiationFailed(message),
        // AUDCLNT_E_DEVICE_IN_USE, E_NOTFOUND and anything unexpected.
        _ => CaptureError::DeviceUnavailable(message),
    }
}

/// Closure form of [`capture_error`] for `map_err`.
pub fn wasapi(context: &'static str) -> impl Fn(WinError) -> CaptureError {
    move |err| capture_error(context, &err)
}
