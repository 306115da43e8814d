//! WASAPI microphone capture.
//!
//! Opens a capture endpoint in shared mode on a dedicated thread registered
//! with MMCSS and feeds its packets into a [`ThreadedEndpoint`].

use std::time::Duration;

use windows::Win32::Media::Audio::{IAudioClient, AUDCLNT_STREAMFLAGS_NOPERSIST};
use windows::Win32::System::Com::CLSCTX_ALL;

use mlrecorder_core::capture::threaded::{Handshake, ThreadedEndpoint};
use mlrecorder_core::models::error::CaptureError;
use mlrecorder_core::models::recording_type::SourceKind;

use crate::com::{wasapi, ComApartment};
use crate::device_enumerator::{friendly_name, DeviceEnumerator};
use crate::stream::{CaptureStream, MixFormat, Wakeup};

/// Open the microphone with `device_id`, or the default one.
pub fn open(
    device_id: Option<String>,
    ring_capacity: usize,
    open_timeout: Duration,
) -> Result<ThreadedEndpoint, CaptureError> {
    ThreadedEndpoint::spawn("wasapi-mic".into(), ring_capacity, open_timeout, move |handshake| {
        capture(device_id.as_deref(), handshake)
    })
}

/// Capture thread body.
///
/// Sequence:
/// 1. Join the MTA
/// 2. Resolve the device (by id or default)
/// 3. Activate `IAudioClient` and initialize it with the mix format
/// 4. Start, report the format, pump packets until the endpoint closes
fn capture(device_id: Option<&str>, handshake: Handshake) -> Result<(), CaptureError> {
    let _com = ComApartment::enter()?;
    let enumerator = DeviceEnumerator::new()?;
    let device = enumerator.capture_device(device_id)?;
    let name = friendly_name(&device).unwrap_or_else(|| "Microphone".into());

    let audio_client: IAudioClient =
        unsafe { device.Activate(CLSCTX_ALL, None) }.map_err(wasapi("microphone activation failed"))?;

    let mut stream = {
        let mix = MixFormat::query(&audio_client)?;
        let format = mix.parse()?;
        CaptureStream::initialize(audio_client, mix.as_ptr(), format, AUDCLNT_STREAMFLAGS_NOPERSIST, Wakeup::Poll)?
    };
    stream.start()?;

    let mut sink = handshake.open(stream.endpoint_info(SourceKind::Microphone, name));
    stream.run(&mut sink, || Ok(()))
}
