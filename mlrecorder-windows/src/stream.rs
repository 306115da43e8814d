//! Shared-mode capture stream shared by every WASAPI producer.
//!
//! Owns the `IAudioClient` / `IAudioCaptureClient` pair and moves packets
//! from the engine into a [`FrameSink`] until the endpoint closes.

use std::thread;
use std::time::Duration;

use windows::core::{w, GUID};
use windows::Win32::Foundation::{CloseHandle, HANDLE};
use windows::Win32::Media::Audio::{
    IAudioCaptureClient, IAudioClient, AUDCLNT_BUFFERFLAGS_DATA_DISCONTINUITY, AUDCLNT_BUFFERFLAGS_SILENT,
    AUDCLNT_SHAREMODE_SHARED, AUDCLNT_STREAMFLAGS_EVENTCALLBACK, WAVEFORMATEX, WAVEFORMATEXTENSIBLE,
};
use windows::Win32::System::Com::CoTaskMemFree;
use windows::Win32::System::Threading::{
    AvRevertMmThreadCharacteristics, AvSetMmThreadCharacteristicsW, CreateEventW, WaitForSingleObject,
};

use mlrecorder_core::capture::threaded::FrameSink;
use mlrecorder_core::models::audio_models::{AudioFormat, EndpointInfo};
use mlrecorder_core::models::error::CaptureError;
use mlrecorder_core::models::recording_type::SourceKind;

use crate::com::wasapi;
use crate::sample_format::{decode_packet, PacketEncoding, PacketFormat};

pub(crate) const WAVE_FORMAT_PCM: u16 = 0x0001;
pub(crate) const WAVE_FORMAT_IEEE_FLOAT: u16 = 0x0003;
const WAVE_FORMAT_EXTENSIBLE: u16 = 0xFFFE;
const KSDATAFORMAT_SUBTYPE_IEEE_FLOAT: GUID = GUID::from_u128(0x00000003_0000_0010_8000_00aa00389b71);

/// Poll interval of the capture loop, and the event wait bound.
const POLL_INTERVAL_MS: u32 = 10;

/// Engine buffer requested at initialization: 100 ms in 100 ns units.
const BUFFER_DURATION_HNS: i64 = 1_000_000;

/// Mix format allocated by `GetMixFormat`, freed on drop.
pub struct MixFormat {
    ptr: *mut WAVEFORMATEX,
}

impl MixFormat {
    pub fn query(client: &IAudioClient) -> Result<Self, CaptureError> {
        let ptr = unsafe { client.GetMixFormat() }.map_err(wasapi("GetMixFormat"))?;
        if ptr.is_null() {
            return Err(CaptureError::FormatNegotiationFailed("engine returned no mix format".into()));
        }
        Ok(Self { ptr })
    }

    pub fn as_ptr(&self) -> *const WAVEFORMATEX {
        self.ptr
    }

    pub fn parse(&self) -> Result<PacketFormat, CaptureError> {
        // SAFETY: `ptr` is non-null and owned by this wrapper until drop.
        unsafe { parse_wave_format(&*self.ptr) }
    }
}

impl Drop for MixFormat {
    fn drop(&mut self) {
        unsafe { CoTaskMemFree(Some(self.ptr as *const _)) };
    }
}

/// Read the sample layout out of a `WAVEFORMATEX`, following the
/// extensible header when present.
///
/// # Safety
/// If `format.wFormatTag` is `WAVE_FORMAT_EXTENSIBLE`, `format` must be the
/// head of a full `WAVEFORMATEXTENSIBLE`.
pub unsafe fn parse_wave_format(format: &WAVEFORMATEX) -> Result<PacketFormat, CaptureError> {
    let tag = format.wFormatTag;
    let container_bits = format.wBitsPerSample;

    let (is_float, valid_bits) = if tag == WAVE_FORMAT_EXTENSIBLE {
        let ext = format as *const WAVEFORMATEX as *const WAVEFORMATEXTENSIBLE;
        let sub_format = std::ptr::read_unaligned(std::ptr::addr_of!((*ext).SubFormat));
        let valid = std::ptr::read_unaligned(std::ptr::addr_of!((*ext).Samples.wValidBitsPerSample));
        (sub_format == KSDATAFORMAT_SUBTYPE_IEEE_FLOAT, valid)
    } else if tag == WAVE_FORMAT_IEEE_FLOAT {
        (true, container_bits)
    } else if tag == WAVE_FORMAT_PCM {
        (false, container_bits)
    } else {
        return Err(CaptureError::FormatNegotiationFailed(format!(
            "unsupported format tag {:#06x}",
            tag
        )));
    };

    Ok(PacketFormat {
        sample_rate: format.nSamplesPerSec,
        channels: format.nChannels,
        encoding: PacketEncoding::from_container(is_float, container_bits, valid_bits)?,
    })
}

/// Auto-reset event the engine signals when a packet is ready.
struct PacketEvent(HANDLE);

impl PacketEvent {
    fn create() -> Result<Self, CaptureError> {
        let handle = unsafe { CreateEventW(None, false, false, None) }.map_err(wasapi("CreateEventW"))?;
        Ok(Self(handle))
    }
}

impl Drop for PacketEvent {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.0) };
    }
}

/// Real-time scheduling for the capture thread through MMCSS.
struct MmcssRegistration(Option<HANDLE>);

impl MmcssRegistration {
    fn register() -> Self {
        let mut task_index = 0u32;
        match unsafe { AvSetMmThreadCharacteristicsW(w!("Pro Audio"), &mut task_index) } {
            Ok(handle) => Self(Some(handle)),
            Err(e) => {
                log::warn!("MMCSS registration failed, capturing at normal priority: {}", e);
                Self(None)
            }
        }
    }
}

impl Drop for MmcssRegistration {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            let _ = unsafe { AvRevertMmThreadCharacteristics(handle) };
        }
    }
}

/// How the loop learns that packets are ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// Sleep a fixed interval between drains.
    Poll,
    /// Wait on an engine-signalled event (required by process loopback).
    Event,
}

/// An initialized, not yet started shared-mode capture stream.
pub struct CaptureStream {
    audio_client: IAudioClient,
    capture_client: IAudioCaptureClient,
    format: PacketFormat,
    event: Option<PacketEvent>,
}

impl CaptureStream {
    /// Initialize `audio_client` in shared mode with `format`.
    ///
    /// `stream_flags` carries the source-specific flags (loopback,
    /// auto-convert); the event flag is added when `wakeup` asks for it.
    pub fn initialize(
        audio_client: IAudioClient,
        format: *const WAVEFORMATEX,
        parsed: PacketFormat,
        stream_flags: u32,
        wakeup: Wakeup,
    ) -> Result<Self, CaptureError> {
        let flags = match wakeup {
            Wakeup::Poll => stream_flags,
            Wakeup::Event => stream_flags | AUDCLNT_STREAMFLAGS_EVENTCALLBACK,
        };

        unsafe {
            audio_client
                .Initialize(AUDCLNT_SHAREMODE_SHARED, flags, BUFFER_DURATION_HNS, 0, format, None)
                .map_err(wasapi("IAudioClient::Initialize"))?;
        }

        let event = match wakeup {
            Wakeup::Poll => None,
            Wakeup::Event => {
                let event = PacketEvent::create()?;
                unsafe { audio_client.SetEventHandle(event.0) }.map_err(wasapi("SetEventHandle"))?;
                Some(event)
            }
        };

        let capture_client: IAudioCaptureClient =
            unsafe { audio_client.GetService() }.map_err(wasapi("GetService(IAudioCaptureClient)"))?;

        Ok(Self {
            audio_client,
            capture_client,
            format: parsed,
            event,
        })
    }

    pub fn format(&self) -> PacketFormat {
        self.format
    }

    /// What the opened endpoint reports to its session.
    pub fn endpoint_info(&self, kind: SourceKind, name: String) -> EndpointInfo {
        EndpointInfo {
            kind,
            format: AudioFormat::new(self.format.sample_rate, self.format.channels),
            bit_depth: self.format.encoding.bit_depth(),
            name,
        }
    }

    /// Start the engine. Packets queue up until [`run`](Self::run) drains them.
    pub fn start(&self) -> Result<(), CaptureError> {
        unsafe { self.audio_client.Start() }.map_err(wasapi("IAudioClient::Start"))
    }

    /// Move packets into `sink` until it closes, then stop the engine.
    ///
    /// `watchdog` runs once per wakeup; an error from it ends the stream
    /// with that error (used to detect a target process exiting).
    pub fn run<W>(&mut self, sink: &mut FrameSink, mut watchdog: W) -> Result<(), CaptureError>
    where
        W: FnMut() -> Result<(), CaptureError>,
    {
        let _mmcss = MmcssRegistration::register();
        let result = self.pump(sink, &mut watchdog);
        let _ = unsafe { self.audio_client.Stop() };
        result
    }

    fn pump<W>(&mut self, sink: &mut FrameSink, watchdog: &mut W) -> Result<(), CaptureError>
    where
        W: FnMut() -> Result<(), CaptureError>,
    {
        while sink.is_running() {
            self.wait();
            watchdog()?;
            if !self.drain(sink)? {
                break;
            }
        }
        Ok(())
    }

    fn wait(&self) {
        match &self.event {
            Some(event) => {
                // Timeouts fall through to the watchdog and an empty drain.
                let _ = unsafe { WaitForSingleObject(event.0, POLL_INTERVAL_MS) };
            }
            None => thread::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64)),
        }
    }

    /// Hand every queued packet to `sink`. `false` once the sink is closed.
    fn drain(&mut self, sink: &mut FrameSink) -> Result<bool, CaptureError> {
        let channels = self.format.channels as usize;
        let block_align = self.format.block_align();

        loop {
            let pending = unsafe { self.capture_client.GetNextPacketSize() }.map_err(wasapi("GetNextPacketSize"))?;
            if pending == 0 {
                return Ok(true);
            }

            let mut data: *mut u8 = std::ptr::null_mut();
            let mut frames = 0u32;
            let mut flags = 0u32;
            unsafe {
                self.capture_client
                    .GetBuffer(&mut data, &mut frames, &mut flags, None, None)
                    .map_err(wasapi("GetBuffer"))?;
            }

            let frame_count = frames as usize;
            let samples = if flags & (AUDCLNT_BUFFERFLAGS_SILENT.0 as u32) != 0 || data.is_null() {
                vec![0.0f32; frame_count * channels]
            } else {
                // SAFETY: the engine guarantees `frames * nBlockAlign` readable
                // bytes at `data` until ReleaseBuffer.
                let bytes = unsafe { std::slice::from_raw_parts(data, frame_count * block_align) };
                decode_packet(bytes, self.format.encoding)
            };
            if flags & (AUDCLNT_BUFFERFLAGS_DATA_DISCONTINUITY.0 as u32) != 0 {
                log::debug!("capture discontinuity before a {}-frame packet", frame_count);
            }

            unsafe { self.capture_client.ReleaseBuffer(frames) }.map_err(wasapi("ReleaseBuffer"))?;

            if !sink.push(samples) {
                return Ok(false);
            }
        }
    }
}
