use std::collections::{HashMap, HashSet};
use std::f64::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::models::audio_models::{AudioFormat, EndpointInfo, InputDevice, ProcessTarget, SourceSpec};
use crate::models::error::CaptureError;
use crate::models::recording_type::SourceKind;
use crate::traits::capture_backend::{CaptureBackend, CaptureEndpoint};

use super::threaded::{FrameSink, Handshake, ThreadedEndpoint, DEFAULT_OPEN_TIMEOUT};

/// Signal produced by a synthetic source.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    Sine { frequency: f32, amplitude: f32 },
    Constant(f32),
    Silence,
}

impl Waveform {
    fn sample_at(&self, frame: u64, sample_rate: u32) -> f32 {
        match *self {
            Self::Sine { frequency, amplitude } => {
                let t = frame as f64 / sample_rate.max(1) as f64;
                amplitude * (TAU * frequency as f64 * t).sin() as f32
            }
            Self::Constant(level) => level,
            Self::Silence => 0.0,
        }
    }
}

/// Description of one synthetic source kind.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSource {
    pub format: AudioFormat,
    pub waveform: Waveform,
    /// Frames per delivered packet.
    pub packet_frames: usize,
    /// End the stream after this many frames; `None` runs until closed.
    pub total_frames: Option<u64>,
    /// Deliver packets at the real-time rate of `format` instead of as fast as possible.
    pub paced: bool,
}

impl SyntheticSource {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            waveform: Waveform::Sine {
                frequency: 440.0,
                amplitude: 0.5,
            },
            packet_frames: (format.sample_rate / 100).max(1) as usize,
            total_frames: None,
            paced: true,
        }
    }

    pub fn with_waveform(mut self, waveform: Waveform) -> Self {
        self.waveform = waveform;
        self
    }

    pub fn with_packet_frames(mut self, frames: usize) -> Self {
        self.packet_frames = frames.max(1);
        self
    }

    pub fn with_total_frames(mut self, frames: u64) -> Self {
        self.total_frames = Some(frames);
        self
    }

    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    fn default_for(kind: SourceKind) -> Self {
        match kind {
            SourceKind::Process | SourceKind::System => Self::new(AudioFormat::new(48000, 2)),
            SourceKind::Microphone => Self::new(AudioFormat::new(48000, 1)),
        }
    }
}

#[derive(Default)]
struct Faults {
    open_failures: HashMap<SourceKind, CaptureError>,
    exited: HashSet<u32>,
    removed: HashSet<SourceKind>,
    stalled: HashSet<SourceKind>,
    hang_on_close: HashSet<SourceKind>,
    hang_released: bool,
}

struct Shared {
    sources: Mutex<HashMap<SourceKind, SyntheticSource>>,
    faults: Mutex<Faults>,
    hang_gate: Condvar,
    focused: Mutex<Option<ProcessTarget>>,
    devices: Mutex<Vec<InputDevice>>,
    opens: AtomicUsize,
    active: AtomicUsize,
    initializations: AtomicUsize,
    shutdowns: AtomicUsize,
}

/// In-process capture backend generating deterministic signals.
///
/// Each source kind has its own [`SyntheticSource`]; faults can be injected
/// at any time to exercise open failures, process exit, device removal and
/// endpoints that never finish closing.
#[derive(Clone)]
pub struct SyntheticBackend {
    shared: Arc<Shared>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                sources: Mutex::new(HashMap::new()),
                faults: Mutex::new(Faults::default()),
                hang_gate: Condvar::new(),
                focused: Mutex::new(Some(ProcessTarget::new(4242, "player.exe"))),
                devices: Mutex::new(vec![InputDevice {
                    id: "synthetic-mic".into(),
                    name: "Synthetic Microphone".into(),
                    is_default: true,
                }]),
                opens: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                initializations: AtomicUsize::new(0),
                shutdowns: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_source(&self, kind: SourceKind, source: SyntheticSource) {
        self.shared.sources.lock().insert(kind, source);
    }

    pub fn set_focused_process(&self, target: Option<ProcessTarget>) {
        *self.shared.focused.lock() = target;
    }

    pub fn set_input_devices(&self, devices: Vec<InputDevice>) {
        *self.shared.devices.lock() = devices;
    }

    /// Every following `open` of `kind` fails with `error`.
    pub fn fail_open(&self, kind: SourceKind, error: CaptureError) {
        self.shared.faults.lock().open_failures.insert(kind, error);
    }

    pub fn clear_open_failure(&self, kind: SourceKind) {
        self.shared.faults.lock().open_failures.remove(&kind);
    }

    /// The process exits: live process-loopback captures of `pid` are interrupted.
    pub fn terminate_process(&self, pid: u32) {
        self.shared.faults.lock().exited.insert(pid);
    }

    /// The device behind `kind` disappears: live captures of it are interrupted.
    pub fn remove_device(&self, kind: SourceKind) {
        self.shared.faults.lock().removed.insert(kind);
    }

    /// Captures of `kind` stay open but stop delivering frames.
    pub fn stall(&self, kind: SourceKind) {
        self.shared.faults.lock().stalled.insert(kind);
    }

    pub fn resume(&self, kind: SourceKind) {
        self.shared.faults.lock().stalled.remove(&kind);
    }

    /// Captures of `kind` block in `close` until [`release_hung`](Self::release_hung).
    pub fn hang_on_close(&self, kind: SourceKind) {
        let mut faults = self.shared.faults.lock();
        faults.hang_on_close.insert(kind);
        faults.hang_released = false;
    }

    pub fn release_hung(&self) {
        let mut faults = self.shared.faults.lock();
        faults.hang_on_close.clear();
        faults.hang_released = true;
        drop(faults);
        self.shared.hang_gate.notify_all();
    }

    /// Number of `open` calls so far, failed ones included.
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Capture threads currently running.
    pub fn active_captures(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn initialize_count(&self) -> usize {
        self.shared.initializations.load(Ordering::SeqCst)
    }

    pub fn shutdown_count(&self) -> usize {
        self.shared.shutdowns.load(Ordering::SeqCst)
    }

    fn source_for(&self, kind: SourceKind) -> SyntheticSource {
        self.shared
            .sources
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| SyntheticSource::default_for(kind))
    }
}

impl CaptureBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn initialize(&self) -> Result<(), CaptureError> {
        self.shared.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) {
        self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.release_hung();
    }

    fn open(&self, spec: &SourceSpec, ring_capacity: usize) -> Result<Box<dyn CaptureEndpoint>, CaptureError> {
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        let kind = spec.kind();

        {
            let faults = self.shared.faults.lock();
            if let Some(err) = faults.open_failures.get(&kind) {
                return Err(err.clone());
            }
            if faults.removed.contains(&kind) {
                return Err(CaptureError::DeviceUnavailable(format!("no {} device", kind.label())));
            }
            if let SourceSpec::Process { target, .. } = spec {
                if faults.exited.contains(&target.pid) {
                    return Err(CaptureError::DeviceUnavailable(format!(
                        "process {} ({}) is not running",
                        target.name, target.pid
                    )));
                }
            }
        }

        let name = match spec {
            SourceSpec::Process { target, .. } => format!("synthetic process loopback ({})", target.name),
            SourceSpec::System => "synthetic system loopback".to_string(),
            SourceSpec::Microphone { device_id } => {
                let devices = self.shared.devices.lock();
                let device = match device_id {
                    Some(id) => devices.iter().find(|d| &d.id == id),
                    None => devices.iter().find(|d| d.is_default),
                };
                match device {
                    Some(device) => device.name.clone(),
                    None => {
                        return Err(CaptureError::DeviceUnavailable(match device_id {
                            Some(id) => format!("input device {id} not found"),
                            None => "no default input device".to_string(),
                        }))
                    }
                }
            }
        };

        let source = self.source_for(kind);
        let info = EndpointInfo {
            kind,
            format: source.format,
            bit_depth: 32,
            name,
        };
        let shared = Arc::clone(&self.shared);
        let pid = match spec {
            SourceSpec::Process { target, .. } => Some(target.pid),
            _ => None,
        };

        let endpoint = ThreadedEndpoint::spawn(
            format!("synthetic-{}", kind.label()),
            ring_capacity,
            DEFAULT_OPEN_TIMEOUT,
            move |handshake| run_generator(handshake, info, source, shared, pid),
        )?;
        Ok(Box::new(endpoint))
    }

    fn input_devices(&self) -> Result<Vec<InputDevice>, CaptureError> {
        Ok(self.shared.devices.lock().clone())
    }

    fn focused_process(&self) -> Option<ProcessTarget> {
        self.shared.focused.lock().clone()
    }
}

struct ActiveGuard(Arc<Shared>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

fn run_generator(
    handshake: Handshake,
    info: EndpointInfo,
    source: SyntheticSource,
    shared: Arc<Shared>,
    pid: Option<u32>,
) -> Result<(), CaptureError> {
    let kind = info.kind;
    shared.active.fetch_add(1, Ordering::SeqCst);
    let _active = ActiveGuard(Arc::clone(&shared));
    let mut sink = handshake.open(info);

    let started = Instant::now();
    while sink.is_running() {
        check_faults(&shared, kind, pid)?;
        if shared.faults.lock().stalled.contains(&kind) {
            thread::sleep(Duration::from_millis(5));
            continue;
        }

        let produced = sink.delivered_frames();
        let remaining = source.total_frames.map(|total| total.saturating_sub(produced));
        if remaining == Some(0) {
            log::debug!("Synthetic {} source finished after {} frames", kind.label(), produced);
            return Ok(());
        }
        let frames = remaining.map_or(source.packet_frames, |r| (r as usize).min(source.packet_frames));
        push_packet(&mut sink, &source, produced, frames);

        if source.paced {
            let due = started + source.format.duration_of(produced + frames as u64);
            let now = Instant::now();
            if due > now {
                thread::sleep(due - now);
            }
        }
    }

    wait_if_hung(&shared, kind);
    Ok(())
}

fn push_packet(sink: &mut FrameSink, source: &SyntheticSource, first_frame: u64, frames: usize) {
    let channels = source.format.channels.max(1) as usize;
    let mut samples = Vec::with_capacity(frames * channels);
    for i in 0..frames {
        let value = source
            .waveform
            .sample_at(first_frame + i as u64, source.format.sample_rate);
        samples.extend(std::iter::repeat(value).take(channels));
    }
    sink.push(samples);
}

fn check_faults(shared: &Shared, kind: SourceKind, pid: Option<u32>) -> Result<(), CaptureError> {
    let faults = shared.faults.lock();
    if faults.removed.contains(&kind) {
        return Err(CaptureError::Interrupted(format!("{} device removed", kind.label())));
    }
    if let Some(pid) = pid.filter(|pid| faults.exited.contains(pid)) {
        return Err(CaptureError::Interrupted(format!("process {pid} exited")));
    }
    Ok(())
}

fn wait_if_hung(shared: &Shared, kind: SourceKind) {
    let mut faults = shared.faults.lock();
    if !faults.hang_on_close.contains(&kind) {
        return;
    }
    log::debug!("Synthetic {} capture hanging in close", kind.label());
    while !faults.hang_released {
        shared.hang_gate.wait(&mut faults);
    }
}
