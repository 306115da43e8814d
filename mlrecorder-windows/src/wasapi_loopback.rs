//! System audio capture via WASAPI loopback on the default render endpoint.
//!
//! Loopback needs no permission and delivers whatever the engine mixes for
//! the output device, silence included.

use std::time::Duration;

use windows::Win32::Media::Audio::{IAudioClient, AUDCLNT_STREAMFLAGS_LOOPBACK};
use windows::Win32::System::Com::CLSCTX_ALL;

use mlrecorder_core::capture::threaded::{Handshake, ThreadedEndpoint};
use mlrecorder_core::models::error::CaptureError;
use mlrecorder_core::models::recording_type::SourceKind;

use crate::com::{wasapi, ComApartment};
use crate::device_enumerator::{friendly_name, DeviceEnumerator};
use crate::stream::{CaptureStream, MixFormat, Wakeup};

pub fn open(ring_capacity: usize, open_timeout: Duration) -> Result<ThreadedEndpoint, CaptureError> {
    ThreadedEndpoint::spawn("wasapi-loopback".into(), ring_capacity, open_timeout, capture)
}

fn capture(handshake: Handshake) -> Result<(), CaptureError> {
    let _com = ComApartment::enter()?;
    let device = DeviceEnumerator::new()?.default_render_device()?;
    let name = match friendly_name(&device) {
        Some(output) => format!("System audio ({})", output),
        None => "System audio".into(),
    };

    let audio_client: IAudioClient =
        unsafe { device.Activate(CLSCTX_ALL, None) }.map_err(wasapi("loopback activation failed"))?;

    let mut stream = {
        let mix = MixFormat::query(&audio_client)?;
        let format = mix.parse()?;
        CaptureStream::initialize(audio_client, mix.as_ptr(), format, AUDCLNT_STREAMFLAGS_LOOPBACK, Wakeup::Poll)?
    };
    stream.start()?;

    let mut sink = handshake.open(stream.endpoint_info(SourceKind::System, name));
    stream.run(&mut sink, || Ok(()))
}
