//! Per-process loopback capture (Windows 10 2004+, build 19041).
//!
//! Activates the virtual process-loopback device for one process id and its
//! child processes, and ends the stream with `Interrupted` once the target
//! exits.

use std::mem::{size_of, ManuallyDrop};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use windows::core::{IUnknown, Interface, HRESULT};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Media::Audio::{
    ActivateAudioInterfaceAsync, IActivateAudioInterfaceAsyncOperation, IActivateAudioInterfaceCompletionHandler,
    IActivateAudioInterfaceCompletionHandler_Impl, IAudioClient, AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM,
    AUDCLNT_STREAMFLAGS_LOOPBACK, AUDIOCLIENT_ACTIVATION_PARAMS, AUDIOCLIENT_ACTIVATION_PARAMS_0,
    AUDIOCLIENT_ACTIVATION_TYPE_PROCESS_LOOPBACK, AUDIOCLIENT_PROCESS_LOOPBACK_PARAMS,
    PROCESS_LOOPBACK_MODE_INCLUDE_TARGET_PROCESS_TREE,
    VIRTUAL_AUDIO_DEVICE_PROCESS_LOOPBACK, WAVEFORMATEX,
};
use windows::Win32::System::Com::StructuredStorage::{PROPVARIANT, PROPVARIANT_0, PROPVARIANT_0_0, PROPVARIANT_0_0_0};
use windows::Win32::System::Com::BLOB;
use windows::Win32::System::Threading::{OpenProcess, WaitForSingleObject, PROCESS_SYNCHRONIZE};
use windows::Win32::System::Variant::VT_BLOB;
use windows_core::{implement, Ref};

use mlrecorder_core::capture::threaded::{Handshake, ThreadedEndpoint};
use mlrecorder_core::models::audio_models::ProcessTarget;
use mlrecorder_core::models::error::CaptureError;
use mlrecorder_core::models::recording_type::SourceKind;

use crate::com::{capture_error, wasapi, ComApartment};
use crate::sample_format::{PacketEncoding, PacketFormat};
use crate::stream::{CaptureStream, Wakeup, WAVE_FORMAT_IEEE_FLOAT};

/// The virtual device has no mix format; the engine converts into this.
const CAPTURE_RATE: u32 = 48_000;
const CAPTURE_CHANNELS: u16 = 2;

/// Upper bound for the asynchronous activation to complete.
const ACTIVATION_TIMEOUT: Duration = Duration::from_secs(3);

pub fn open(
    target: ProcessTarget,
    ring_capacity: usize,
    open_timeout: Duration,
) -> Result<ThreadedEndpoint, CaptureError> {
    let thread_name = format!("wasapi-process-{}", target.pid);
    ThreadedEndpoint::spawn(thread_name, ring_capacity, open_timeout, move |handshake| {
        capture(&target, handshake)
    })
}

fn capture(target: &ProcessTarget, handshake: Handshake) -> Result<(), CaptureError> {
    let _com = ComApartment::enter()?;
    let process = ProcessWatch::open(target)?;
    let audio_client = activate(target.pid)?;

    let wave_format = float_stereo_format();
    let format = PacketFormat {
        sample_rate: CAPTURE_RATE,
        channels: CAPTURE_CHANNELS,
        encoding: PacketEncoding::Float32,
    };
    let mut stream = CaptureStream::initialize(
        audio_client,
        &wave_format,
        format,
        AUDCLNT_STREAMFLAGS_LOOPBACK | AUDCLNT_STREAMFLAGS_AUTOCONVERTPCM,
        Wakeup::Event,
    )?;
    stream.start()?;

    let name = format!("{} (pid {})", target.name, target.pid);
    let mut sink = handshake.open(stream.endpoint_info(SourceKind::Process, name));
    log::info!("Capturing process {} ({}) and its children", target.pid, target.name);

    stream.run(&mut sink, || {
        if process.has_exited() {
            Err(CaptureError::Interrupted(format!("process {} exited", target.pid)))
        } else {
            Ok(())
        }
    })
}

fn float_stereo_format() -> WAVEFORMATEX {
    let block_align = CAPTURE_CHANNELS * 4;
    WAVEFORMATEX {
        wFormatTag: WAVE_FORMAT_IEEE_FLOAT,
        nChannels: CAPTURE_CHANNELS,
        nSamplesPerSec: CAPTURE_RATE,
        nAvgBytesPerSec: CAPTURE_RATE * block_align as u32,
        nBlockAlign: block_align,
        wBitsPerSample: 32,
        cbSize: 0,
    }
}

/// Signalled by the audio service when activation finishes.
#[implement(IActivateAudioInterfaceCompletionHandler)]
struct ActivationHandler {
    done: Arc<(Mutex<bool>, Condvar)>,
}

impl IActivateAudioInterfaceCompletionHandler_Impl for ActivationHandler_Impl {
    fn ActivateCompleted(&self, _operation: Ref<'_, IActivateAudioInterfaceAsyncOperation>) -> windows_core::Result<()> {
        let (finished, cvar) = &*self.done;
        *finished.lock() = true;
        cvar.notify_all();
        Ok(())
    }
}

/// Loopback of `pid` and its descendants.
///
/// The exclude-tree mode would capture every process except the target.
fn activation_params(pid: u32) -> AUDIOCLIENT_ACTIVATION_PARAMS {
    AUDIOCLIENT_ACTIVATION_PARAMS {
        ActivationType: AUDIOCLIENT_ACTIVATION_TYPE_PROCESS_LOOPBACK,
        Anonymous: AUDIOCLIENT_ACTIVATION_PARAMS_0 {
            ProcessLoopbackParams: AUDIOCLIENT_PROCESS_LOOPBACK_PARAMS {
                TargetProcessId: pid,
                ProcessLoopbackMode: PROCESS_LOOPBACK_MODE_INCLUDE_TARGET_PROCESS_TREE,
            },
        },
    }
}

/// Activate an `IAudioClient` on the process-loopback virtual device.
fn activate(pid: u32) -> Result<IAudioClient, CaptureError> {
    let mut params = activation_params(pid);
    // The blob only borrows `params`; nothing in it needs dropping.
    let blob = ManuallyDrop::new(PROPVARIANT {
        Anonymous: PROPVARIANT_0 {
            Anonymous: ManuallyDrop::new(PROPVARIANT_0_0 {
                vt: VT_BLOB,
                wReserved1: 0,
                wReserved2: 0,
                wReserved3: 0,
                Anonymous: PROPVARIANT_0_0_0 {
                    blob: BLOB {
                        cbSize: size_of::<AUDIOCLIENT_ACTIVATION_PARAMS>() as u32,
                        pBlobData: &mut params as *mut AUDIOCLIENT_ACTIVATION_PARAMS as *mut u8,
                    },
                },
            }),
        },
    });

    let done = Arc::new((Mutex::new(false), Condvar::new()));
    let handler: IActivateAudioInterfaceCompletionHandler = ActivationHandler { done: Arc::clone(&done) }.into();

    let operation = unsafe {
        ActivateAudioInterfaceAsync(
            VIRTUAL_AUDIO_DEVICE_PROCESS_LOOPBACK,
            &IAudioClient::IID,
            Some(&*blob as *const PROPVARIANT as *const _),
            &handler,
        )
    }
    .map_err(wasapi("ActivateAudioInterfaceAsync"))?;

    let (finished, cvar) = &*done;
    let deadline = Instant::now() + ACTIVATION_TIMEOUT;
    let mut guard = finished.lock();
    while !*guard {
        if cvar.wait_until(&mut guard, deadline).timed_out() {
            return Err(CaptureError::DeviceUnavailable(format!(
                "process loopback activation for pid {} timed out",
                pid
            )));
        }
    }
    drop(guard);

    let mut result = HRESULT(0);
    let mut activated: Option<IUnknown> = None;
    unsafe { operation.GetActivateResult(&mut result, &mut activated) }.map_err(wasapi("GetActivateResult"))?;
    if let Err(e) = result.ok() {
        return Err(capture_error("process loopback activation failed", &e));
    }
    activated
        .ok_or_else(|| CaptureError::DeviceUnavailable("process loopback returned no client".into()))?
        .cast::<IAudioClient>()
        .map_err(wasapi("IAudioClient cast"))
}

/// Synchronization handle on the target process.
struct ProcessWatch(HANDLE);

impl ProcessWatch {
    fn open(target: &ProcessTarget) -> Result<Self, CaptureError> {
        let handle = unsafe { OpenProcess(PROCESS_SYNCHRONIZE, false, target.pid) }.map_err(|e| {
            CaptureError::DeviceUnavailable(format!("process {} ({}) is not running: {}", target.pid, target.name, e))
        })?;
        Ok(Self(handle))
    }

    fn has_exited(&self) -> bool {
        unsafe { WaitForSingleObject(self.0, 0) } == WAIT_OBJECT_0
    }
}

impl Drop for ProcessWatch {
    fn drop(&mut self) {
        let _ = unsafe { CloseHandle(self.0) };
    }
}
