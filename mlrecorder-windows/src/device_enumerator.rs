//! Audio endpoint lookup via the MMDevice API.

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Devices::FunctionDiscovery::PKEY_Device_FriendlyName;
use windows::Win32::Media::Audio::{
    eCapture, eConsole, eRender, EDataFlow, IMMDevice, IMMDeviceEnumerator, MMDeviceEnumerator,
    DEVICE_STATE_ACTIVE,
};
use windows::Win32::System::Com::{CoCreateInstance, CoTaskMemFree, CLSCTX_ALL, STGM_READ};

use mlrecorder_core::models::audio_models::InputDevice;
use mlrecorder_core::models::error::CaptureError;

use crate::com::wasapi;

/// Wraps `IMMDeviceEnumerator`.
///
/// Requires COM to be initialized on the calling thread; the enumerator
/// must not leave it.
pub struct DeviceEnumerator {
    enumerator: IMMDeviceEnumerator,
}

impl DeviceEnumerator {
    pub fn new() -> Result<Self, CaptureError> {
        let enumerator: IMMDeviceEnumerator =
            unsafe { CoCreateInstance(&MMDeviceEnumerator, None, CLSCTX_ALL) }
                .map_err(wasapi("failed to create device enumerator"))?;
        Ok(Self { enumerator })
    }

    /// Active capture endpoints, default first flagged.
    pub fn list_capture_devices(&self) -> Result<Vec<InputDevice>, CaptureError> {
        let collection = unsafe { self.enumerator.EnumAudioEndpoints(eCapture, DEVICE_STATE_ACTIVE) }
            .map_err(wasapi("EnumAudioEndpoints"))?;
        let count = unsafe { collection.GetCount() }.map_err(wasapi("GetCount"))?;
        let default_id = self.default_id(eCapture);

        let mut devices = Vec::with_capacity(count as usize);
        for i in 0..count {
            let Ok(device) = (unsafe { collection.Item(i) }) else {
                continue;
            };
            let Some(id) = device_id(&device) else {
                continue;
            };
            let name = friendly_name(&device).unwrap_or_else(|| format!("Input {}", i + 1));
            devices.push(InputDevice {
                is_default: default_id.as_deref() == Some(id.as_str()),
                id,
                name,
            });
        }
        Ok(devices)
    }

    /// The capture endpoint with `id`, or the default one.
    pub fn capture_device(&self, id: Option<&str>) -> Result<IMMDevice, CaptureError> {
        match id {
            Some(id) => {
                let wide: Vec<u16> = id.encode_utf16().chain(std::iter::once(0)).collect();
                unsafe { self.enumerator.GetDevice(PCWSTR(wide.as_ptr())) }.map_err(|e| {
                    CaptureError::DeviceUnavailable(format!("microphone {} not found: {}", id, e))
                })
            }
            None => unsafe { self.enumerator.GetDefaultAudioEndpoint(eCapture, eConsole) }
                .map_err(|_| CaptureError::DeviceUnavailable("no default microphone".into())),
        }
    }

    /// The default render endpoint, tapped for system loopback.
    pub fn default_render_device(&self) -> Result<IMMDevice, CaptureError> {
        unsafe { self.enumerator.GetDefaultAudioEndpoint(eRender, eConsole) }
            .map_err(|_| CaptureError::DeviceUnavailable("no default output device".into()))
    }

    fn default_id(&self, flow: EDataFlow) -> Option<String> {
        let device = unsafe { self.enumerator.GetDefaultAudioEndpoint(flow, eConsole) }.ok()?;
        device_id(&device)
    }
}

/// Endpoint id string, freeing the COM allocation.
pub fn device_id(device: &IMMDevice) -> Option<String> {
    let raw: PWSTR = unsafe { device.GetId() }.ok()?;
    let id = unsafe { raw.to_string() }.ok();
    unsafe { CoTaskMemFree(Some(raw.0 as *const _)) };
    id
}

/// `PKEY_Device_FriendlyName` of `device`.
pub fn friendly_name(device: &IMMDevice) -> Option<String> {
    let store = unsafe { device.OpenPropertyStore(STGM_READ) }.ok()?;
    let value = unsafe { store.GetValue(&PKEY_Device_FriendlyName) }.ok()?;
    let name = value.to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
