//! Windows microphone privacy check.
//!
//! Desktop apps have no per-app consent prompt; access is governed by the
//! global toggle under Settings > Privacy > Microphone. A denied toggle
//! surfaces as `E_ACCESSDENIED` when the endpoint is activated.

use windows::Win32::Foundation::E_ACCESSDENIED;
use windows::Win32::Media::Audio::{IAudioClient, AUDCLNT_E_DEVICE_IN_USE};
use windows::Win32::System::Com::CLSCTX_ALL;

use mlrecorder_core::models::error::CaptureError;

use crate::com::ComApartment;
use crate::device_enumerator::DeviceEnumerator;

/// Result of probing the default capture endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MicrophoneAccess {
    Granted,
    Denied,
    /// Another application holds the device exclusively.
    InUse,
    NoDevice,
}

/// Probe microphone access by activating the default capture endpoint.
pub fn check_microphone_permission() -> Result<MicrophoneAccess, CaptureError> {
    let _com = ComApartment::enter()?;
    let enumerator = DeviceEnumerator::new()?;

    let device = match enumerator.capture_device(None) {
        Ok(device) => device,
        Err(_) => return Ok(MicrophoneAccess::NoDevice),
    };

    match unsafe { device.Activate::<IAudioClient>(CLSCTX_ALL, None) } {
        Ok(_) => Ok(MicrophoneAccess::Granted),
        Err(e) if e.code() == E_ACCESSDENIED => Ok(MicrophoneAccess::Denied),
        Err(e) if e.code() == AUDCLNT_E_DEVICE_IN_USE => Ok(MicrophoneAccess::InUse),
        Err(e) => {
            log::warn!("Unexpected error checking microphone permission: {}", e);
            Ok(MicrophoneAccess::Granted)
        }
    }
}
