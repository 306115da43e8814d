use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::capture::mixed::{MixSettings, MixedEndpoint};
use crate::models::audio_models::{AudioFormat, AudioFrame, ProcessTarget, SourceSpec};
use crate::models::config::{OutputFormat, RecorderConfig};
use crate::models::error::CaptureError;
use crate::models::recording_result::{RecordingMetadata, RecordingResult, SessionStatus, StopOutcome};
use crate::models::recording_type::{RecordingType, SourceKind};
use crate::models::state::{FailureKind, SessionFailure, SessionState, StopReason};
use crate::processing::stream_mixer::{
    apply_gain, common_format, peak_level, remap_channels, LinearResampler, SharedGain, MAX_VOLUME_PERCENT,
};
use crate::processing::wav_format::SampleEncoding;
use crate::storage::metadata;
use crate::storage::output_writer::OutputWriter;
use crate::storage::wav_writer::{FinalizedFile, WavSettings};
use crate::traits::capture_backend::{CaptureBackend, CaptureEndpoint, NextFrame};
use crate::traits::session_observer::SessionObserver;

/// Upper bound on reading out frames still buffered when a session stops.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Called on the worker thread once the session reached a terminal state.
pub type ExitHook = Box<dyn FnOnce(Uuid) + Send + 'static>;

/// Tunables a session copies from the recorder configuration at start.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub output_format: OutputFormat,
    /// Output rate; `None` keeps the source rate (the higher one for mixes).
    pub sample_rate: Option<u32>,
    pub encoding: SampleEncoding,
    pub silence_timeout: Duration,
    pub mix_tick: Duration,
    pub ring_capacity: usize,
    pub start_timeout: Duration,
    pub skip_silence: bool,
    pub silence_threshold: f32,
    /// Initial linear gain per source, in the order of the plan's sources.
    pub gains: Vec<f32>,
    pub write_metadata: bool,
}

impl SessionSettings {
    pub fn from_config(config: &RecorderConfig, recording_type: RecordingType) -> Result<Self, CaptureError> {
        Ok(Self {
            output_format: config.output_format,
            sample_rate: config.sample_rate,
            encoding: SampleEncoding::from_bit_depth(config.bit_depth)?,
            silence_timeout: config.silence_timeout(),
            mix_tick: config.mix_tick(),
            ring_capacity: config.ring_capacity,
            start_timeout: config.start_timeout(),
            skip_silence: config.skip_silence,
            silence_threshold: config.silence_threshold,
            gains: recording_type
                .sources()
                .iter()
                .map(|&kind| config.gain_for(kind))
                .collect(),
            write_metadata: config.write_metadata,
        })
    }

    fn gain(&self, index: usize) -> f32 {
        self.gains.get(index).copied().unwrap_or(1.0)
    }
}

/// Everything needed to start one session.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub recording_type: RecordingType,
    /// Sources to open, primary first.
    pub sources: Vec<SourceSpec>,
    pub process: Option<ProcessTarget>,
    pub output_path: PathBuf,
    pub started_at: DateTime<Local>,
    pub settings: SessionSettings,
}

/// The endpoint and writer of one session, acquired and released together.
struct SessionResources {
    source: Box<dyn CaptureEndpoint>,
    writer: OutputWriter,
    source_format: AudioFormat,
    target: AudioFormat,
    resampler: LinearResampler,
    gain: SharedGain,
    released: bool,
}

impl SessionResources {
    /// Open every source, then the output file.
    ///
    /// Anything opened before a failure is closed again, so an `Err` leaves
    /// neither a running capture nor a file behind.
    fn acquire(backend: &dyn CaptureBackend, plan: &SessionPlan, gains: &[SharedGain]) -> Result<Self, CaptureError> {
        let settings = &plan.settings;
        let gain_of = |index: usize| gains.get(index).cloned().unwrap_or_default();
        let (source, target, gain) = match plan.sources.as_slice() {
            [single] => {
                let endpoint = backend.open(single, settings.ring_capacity)?;
                let native = endpoint.info().format;
                let target = AudioFormat::new(settings.sample_rate.unwrap_or(native.sample_rate), native.channels);
                (endpoint, target, gain_of(0))
            }
            [primary, secondary] => {
                let a = backend.open(primary, settings.ring_capacity)?;
                let b = match backend.open(secondary, settings.ring_capacity) {
                    Ok(b) => b,
                    Err(e) => {
                        release_endpoint(a);
                        return Err(e);
                    }
                };
                let common = common_format(a.info().format, b.info().format);
                let target = AudioFormat::new(settings.sample_rate.unwrap_or(common.sample_rate), common.channels);
                let mixed = MixedEndpoint::spawn(
                    a,
                    b,
                    MixSettings {
                        target,
                        tick: settings.mix_tick,
                        silence_timeout: settings.silence_timeout,
                        primary_gain: gain_of(0),
                        secondary_gain: gain_of(1),
                        ring_capacity: settings.ring_capacity,
                    },
                )?;
                // Gains are applied per side by the mixer.
                (Box::new(mixed) as Box<dyn CaptureEndpoint>, target, SharedGain::default())
            }
            other => {
                return Err(CaptureError::ConfigurationFailed(format!(
                    "{} needs one or two sources, got {}",
                    plan.recording_type,
                    other.len()
                )))
            }
        };

        let created = OutputWriter::create(
            &plan.output_path,
            settings.output_format,
            WavSettings {
                format: target,
                encoding: settings.encoding,
            },
        );
        let writer = match created {
            Ok(writer) => writer,
            Err(e) => {
                release_endpoint(source);
                return Err(e);
            }
        };

        let source_format = source.info().format;
        log::debug!(
            "{}: {:?} -> {:?}, {}-bit",
            source.info().name,
            source_format,
            target,
            settings.encoding.bit_depth()
        );
        Ok(Self {
            resampler: LinearResampler::new(source_format.sample_rate, target.sample_rate, target.channels),
            source,
            writer,
            source_format,
            target,
            gain,
            released: false,
        })
    }

    /// Convert a captured frame to the output format and write it.
    ///
    /// Returns `false` if the frame was skipped as silence.
    fn write_frame(&mut self, frame: &AudioFrame, settings: &SessionSettings) -> Result<bool, CaptureError> {
        if frame.format() != self.source_format {
            log::warn!(
                "{} changed format from {:?} to {:?}",
                self.source.info().name,
                self.source_format,
                frame.format()
            );
            self.flush_resampler()?;
            self.source_format = frame.format();
            self.resampler =
                LinearResampler::new(self.source_format.sample_rate, self.target.sample_rate, self.target.channels);
        }

        let remapped = remap_channels(frame.samples(), self.source_format.channels, self.target.channels);
        let mut samples = self.resampler.process(&remapped);
        apply_gain(&mut samples, self.gain.get());

        if settings.skip_silence && peak_level(&samples) < settings.silence_threshold {
            return Ok(false);
        }
        self.writer.write_samples(&samples)?;
        Ok(true)
    }

    fn write_silence(&mut self, duration: Duration) -> Result<(), CaptureError> {
        let frames = self.target.frames_for(duration);
        self.writer
            .write_samples(&vec![0.0; frames * self.target.channels as usize])
    }

    fn flush_resampler(&mut self) -> Result<(), CaptureError> {
        let mut tail = self.resampler.flush();
        if tail.is_empty() {
            return Ok(());
        }
        apply_gain(&mut tail, self.gain.get());
        self.writer.write_samples(&tail)
    }

    /// Close the capture side. Idempotent.
    fn release(&mut self) -> Result<(), CaptureError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.source.close()
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("Releasing {} failed: {}", self.source.info().name, e);
        }
    }
}

fn release_endpoint(mut endpoint: Box<dyn CaptureEndpoint>) {
    if let Err(e) = endpoint.close() {
        log::warn!("Closing {} failed: {}", endpoint.info().name, e);
    }
}

/// Why the recording loop ended.
enum LoopExit {
    Stopped,
    SourceFailed(CaptureError),
    WriteFailed(CaptureError),
}

struct CoreStatus {
    state: SessionState,
    reached_active: bool,
    active_since: Option<Instant>,
    ended_at: Option<Instant>,
    stop_reason: Option<StopReason>,
    stop_requested_at: Option<Instant>,
    /// Set when `start` gave up waiting; the worker must not go active.
    start_aborted: Option<CaptureError>,
    /// The endpoints are closed; only finalizing the file remains.
    capture_closed: bool,
    result: Option<RecordingResult>,
    failure: Option<SessionFailure>,
}

/// State shared between a session handle and its worker thread.
struct SessionCore {
    id: Uuid,
    plan: SessionPlan,
    observer: Option<Arc<dyn SessionObserver>>,
    /// Live gain per source, in the order of the plan's sources.
    gains: Vec<SharedGain>,
    status: Mutex<CoreStatus>,
    changed: Condvar,
    stop_requested: AtomicBool,
    dropped_frames: AtomicU64,
    drift_ticks: AtomicU64,
}

/// One recording: its endpoint(s), its writer and its lifecycle.
///
/// ```text
/// idle → starting → active → stopping → finalized
///           ↓          ↓         ↓
///         failed ←─────┴─────────┘
/// ```
///
/// A worker thread owns the resources from `start` until the session is
/// terminal. Every exit path closes the endpoints and either finalizes or
/// removes the output file.
pub struct RecordingSession {
    core: Arc<SessionCore>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RecordingSession {
    pub fn new(plan: SessionPlan, observer: Option<Arc<dyn SessionObserver>>) -> Self {
        let gains = (0..plan.sources.len())
            .map(|index| SharedGain::new(plan.settings.gain(index)))
            .collect();
        Self {
            core: Arc::new(SessionCore {
                id: Uuid::new_v4(),
                plan,
                observer,
                gains,
                status: Mutex::new(CoreStatus {
                    state: SessionState::Idle,
                    reached_active: false,
                    active_since: None,
                    ended_at: None,
                    stop_reason: None,
                    stop_requested_at: None,
                    start_aborted: None,
                    capture_closed: false,
                    result: None,
                    failure: None,
                }),
                changed: Condvar::new(),
                stop_requested: AtomicBool::new(false),
                dropped_frames: AtomicU64::new(0),
                drift_ticks: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.core.id
    }

    pub fn recording_type(&self) -> RecordingType {
        self.core.plan.recording_type
    }

    pub fn output_path(&self) -> &Path {
        &self.core.plan.output_path
    }

    pub fn state(&self) -> SessionState {
        self.core.status.lock().state
    }

    /// Open the sources and the writer, then wait for the first written frame.
    ///
    /// Idle → Starting → Active. On failure the session ends Failed, no file
    /// is left behind and the cause is returned. `on_exit` runs on the worker
    /// thread once the session is terminal; it is dropped without running if
    /// the worker was never spawned.
    pub fn start(&self, backend: &dyn CaptureBackend, on_exit: ExitHook) -> Result<(), CaptureError> {
        {
            let mut status = self.core.status.lock();
            if status.state != SessionState::Idle {
                return Err(CaptureError::ConfigurationFailed(format!(
                    "{} session can only start from idle, is {}",
                    self.recording_type(),
                    status.state
                )));
            }
            status.state = SessionState::Starting;
        }
        self.core.notify(SessionState::Starting);
        log::info!(
            "Starting {} recording to {}",
            self.recording_type(),
            self.output_path().display()
        );

        let resources = match SessionResources::acquire(backend, &self.core.plan, &self.core.gains) {
            Ok(resources) => resources,
            Err(e) => {
                self.core
                    .conclude(Err(SessionFailure::new(FailureKind::StartFailed, e.clone())));
                return Err(e);
            }
        };

        // Handed over through a slot so a failed spawn gets them back.
        let handoff = Arc::new(Mutex::new(Some(resources)));
        let core = Arc::clone(&self.core);
        let slot = Arc::clone(&handoff);
        let spawned = thread::Builder::new()
            .name(format!("session-{}", self.recording_type().label()))
            .spawn(move || {
                if let Some(resources) = slot.lock().take() {
                    core.run(resources);
                }
                on_exit(core.id);
            });
        match spawned {
            Ok(handle) => *self.worker.lock() = Some(handle),
            Err(e) => {
                if let Some(mut resources) = handoff.lock().take() {
                    resources.writer.discard();
                }
                let err = CaptureError::DeviceUnavailable(format!("failed to spawn session thread: {}", e));
                self.core
                    .conclude(Err(SessionFailure::new(FailureKind::StartFailed, err.clone())));
                return Err(err);
            }
        }

        self.await_active()
    }

    fn await_active(&self) -> Result<(), CaptureError> {
        let timeout = self.core.plan.settings.start_timeout;
        let deadline = Instant::now() + timeout;
        let mut status = self.core.status.lock();
        while status.state == SessionState::Starting {
            if self.core.changed.wait_until(&mut status, deadline).timed_out() {
                break;
            }
        }

        match status.state {
            SessionState::Starting => {
                let cause = CaptureError::DeviceUnavailable(format!("no audio within {} ms", timeout.as_millis()));
                status.start_aborted = Some(cause.clone());
                drop(status);
                self.core.stop_requested.store(true, Ordering::Release);
                if self.wait_terminal(Instant::now() + timeout).is_none() {
                    self.core
                        .conclude(Err(SessionFailure::new(FailureKind::StartFailed, cause.clone())));
                    self.worker.lock().take();
                }
                Err(cause)
            }
            SessionState::Failed => Err(status
                .failure
                .as_ref()
                .map(|f| f.cause.clone())
                .unwrap_or_else(|| CaptureError::DeviceUnavailable("session failed to start".into()))),
            _ => Ok(()),
        }
    }

    /// Ask the worker to stop. Returns immediately; the first reason sticks.
    pub fn request_stop(&self, reason: StopReason) {
        {
            let mut status = self.core.status.lock();
            status.stop_reason.get_or_insert(reason);
            status.stop_requested_at.get_or_insert_with(Instant::now);
        }
        self.core.stop_requested.store(true, Ordering::Release);
    }

    /// Request a stop and wait up to `grace` for the session to finish.
    pub fn stop(&self, reason: StopReason, grace: Duration) -> StopOutcome {
        self.request_stop(reason);
        self.wait_stopped(Instant::now() + grace)
    }

    /// Wait for the session to become terminal.
    ///
    /// `deadline` bounds closing the endpoints only. Once they are closed the
    /// wait continues until the file is finalized, however long that takes.
    /// If an endpoint is still closing at `deadline`, the session is marked
    /// Failed as unresponsive and the worker is detached. Should it finish
    /// later, the file it produced is attached to the failure as the partial
    /// result.
    pub fn wait_stopped(&self, deadline: Instant) -> StopOutcome {
        if let Some(outcome) = self.wait_terminal(deadline) {
            return outcome;
        }

        let waited_ms = self
            .core
            .status
            .lock()
            .stop_requested_at
            .map_or(0, |at| at.elapsed().as_millis() as u64);
        log::error!(
            "{} recording did not stop within {} ms, abandoning its worker",
            self.recording_type(),
            waited_ms
        );
        self.core.conclude(Err(SessionFailure::new(
            FailureKind::Unresponsive,
            CaptureError::UnresponsiveDevice(waited_ms),
        )));
        self.worker.lock().take();
        self.core.outcome()
    }

    /// Wait for a terminal state and join the worker. `None` on timeout.
    fn wait_terminal(&self, deadline: Instant) -> Option<StopOutcome> {
        {
            let mut status = self.core.status.lock();
            while !status.state.is_terminal() {
                if status.capture_closed {
                    self.core.changed.wait(&mut status);
                } else if self.core.changed.wait_until(&mut status, deadline).timed_out() && !status.capture_closed {
                    return None;
                }
            }
        }

        // The worker only runs the exit hook after concluding.
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                log::error!("{} session worker panicked", self.recording_type());
            }
        }
        Some(self.core.outcome())
    }

    pub fn status(&self) -> SessionStatus {
        let status = self.core.status.lock();
        let elapsed = match (status.active_since, status.ended_at) {
            (Some(start), Some(end)) => end.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        };
        SessionStatus {
            recording_type: self.recording_type(),
            state: status.state,
            elapsed,
            output_path: self.core.plan.output_path.clone(),
            process: self.core.plan.process.clone(),
            failure: status.failure.clone(),
            dropped_frames: self.core.dropped_frames.load(Ordering::Relaxed),
            drift_ticks: self.core.drift_ticks.load(Ordering::Relaxed),
        }
    }

    /// Change the volume of one source while recording, in percent.
    ///
    /// Values above 200 % are clamped. A single source picks the change up
    /// with its next frame, a mix with its next tick.
    pub fn set_volume(&self, kind: SourceKind, percent: u16) -> Result<(), CaptureError> {
        let gain = self.source_gain(kind)?;
        if percent > MAX_VOLUME_PERCENT {
            log::warn!(
                "{} volume {}% clamped to {}%",
                kind.label(),
                percent,
                MAX_VOLUME_PERCENT
            );
        }
        gain.set_percent(percent);
        log::info!(
            "{} recording: {} volume set to {}%",
            self.recording_type(),
            kind.label(),
            percent.min(MAX_VOLUME_PERCENT)
        );
        Ok(())
    }

    /// Current volume of one source, in percent.
    pub fn volume(&self, kind: SourceKind) -> Result<u16, CaptureError> {
        Ok((self.source_gain(kind)?.get() * 100.0).round() as u16)
    }

    fn source_gain(&self, kind: SourceKind) -> Result<&SharedGain, CaptureError> {
        self.core
            .plan
            .sources
            .iter()
            .position(|source| source.kind() == kind)
            .and_then(|index| self.core.gains.get(index))
            .ok_or_else(|| {
                CaptureError::ConfigurationFailed(format!(
                    "{} recording has no {} source",
                    self.recording_type(),
                    kind.label()
                ))
            })
    }

    /// Terminal outcome, if the session has one.
    pub fn outcome(&self) -> Option<StopOutcome> {
        if self.state().is_terminal() {
            Some(self.core.outcome())
        } else {
            None
        }
    }
}

impl fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingSession")
            .field("id", &self.core.id)
            .field("recording_type", &self.recording_type())
            .field("state", &self.state())
            .field("output_path", &self.core.plan.output_path)
            .finish_non_exhaustive()
    }
}

impl SessionCore {
    fn recording_type(&self) -> RecordingType {
        self.plan.recording_type
    }

    fn notify(&self, state: SessionState) {
        self.changed.notify_all();
        if let Some(observer) = &self.observer {
            observer.on_state_changed(self.recording_type(), state);
        }
    }

    fn run(&self, mut resources: SessionResources) {
        let exit = self.record(&mut resources);
        self.finish(&mut resources, exit);
    }

    fn record(&self, resources: &mut SessionResources) -> LoopExit {
        let settings = &self.plan.settings;
        let mut active = false;
        let mut silence_ticks = 0u64;

        loop {
            if self.stop_requested.load(Ordering::Acquire) {
                return LoopExit::Stopped;
            }

            // Ok(true) once something reached the file.
            let step = match resources.source.next_frame(settings.silence_timeout) {
                Ok(NextFrame::Frame(frame)) => resources
                    .write_frame(&frame, settings)
                    .map_err(LoopExit::WriteFailed),
                Ok(NextFrame::Timeout) => {
                    silence_ticks += 1;
                    if silence_ticks.is_power_of_two() {
                        log::debug!(
                            "{}: no audio within {} ms, {} silence ticks so far",
                            self.recording_type(),
                            settings.silence_timeout.as_millis(),
                            silence_ticks
                        );
                    }
                    if settings.skip_silence {
                        Ok(false)
                    } else {
                        resources
                            .write_silence(settings.silence_timeout)
                            .map(|()| true)
                            .map_err(LoopExit::WriteFailed)
                    }
                }
                Ok(NextFrame::EndOfStream) => Err(LoopExit::SourceFailed(CaptureError::Interrupted(format!(
                    "{} stopped delivering audio",
                    resources.source.info().name
                )))),
                Err(e) => Err(LoopExit::SourceFailed(e)),
            };

            self.dropped_frames
                .store(resources.source.dropped_frames(), Ordering::Relaxed);
            self.drift_ticks
                .store(resources.source.drift_ticks() + silence_ticks, Ordering::Relaxed);

            match step {
                Err(exit) => return exit,
                Ok(true) if !active => active = self.mark_active(),
                Ok(_) => {}
            }
        }
    }

    /// Starting → Active, unless `start` already gave up on this session.
    fn mark_active(&self) -> bool {
        {
            let mut status = self.status.lock();
            if status.state != SessionState::Starting || status.start_aborted.is_some() {
                return false;
            }
            status.state = SessionState::Active;
            status.reached_active = true;
            status.active_since = Some(Instant::now());
        }
        log::info!(
            "{} recording active, writing {}",
            self.recording_type(),
            self.plan.output_path.display()
        );
        self.notify(SessionState::Active);
        true
    }

    fn finish(&self, resources: &mut SessionResources, exit: LoopExit) {
        let (reached_active, stopping) = {
            let mut status = self.status.lock();
            let stopping = status.state == SessionState::Active;
            if stopping {
                status.state = SessionState::Stopping;
            }
            (status.reached_active, stopping)
        };
        if stopping {
            log::info!("Stopping {} recording", self.recording_type());
            self.notify(SessionState::Stopping);
        }

        let closed = resources.release();
        if let Err(e) = &closed {
            log::error!("Closing {} failed: {}", resources.source.info().name, e);
        }
        self.status.lock().capture_closed = true;
        self.changed.notify_all();

        if !reached_active {
            resources.writer.discard();
            let aborted = self.status.lock().start_aborted.clone();
            let cause = aborted
                .or(match exit {
                    LoopExit::Stopped => None,
                    LoopExit::SourceFailed(e) | LoopExit::WriteFailed(e) => Some(e),
                })
                .or_else(|| closed.err())
                .unwrap_or_else(|| CaptureError::DeviceUnavailable("stopped before any audio arrived".into()));
            self.conclude(Err(SessionFailure::new(FailureKind::StartFailed, cause)));
            return;
        }

        let mut exit = exit;
        if matches!(exit, LoopExit::Stopped) {
            if let Err(e) = self.drain(resources) {
                exit = LoopExit::WriteFailed(e);
            }
        }

        let stop_reason = match exit {
            LoopExit::Stopped => self.status.lock().stop_reason.unwrap_or(StopReason::User),
            _ => StopReason::Interrupted,
        };

        let end = match resources.writer.finalize() {
            Ok(file) => {
                let result = self.build_result(&file, resources, stop_reason);
                if self.plan.settings.write_metadata {
                    if let Err(e) = metadata::write_metadata(&result.metadata, &result.file_path) {
                        log::warn!("Failed to write metadata for {}: {}", result.file_path.display(), e);
                    }
                }
                match (exit, closed) {
                    (LoopExit::Stopped, Ok(())) => Ok(result),
                    (LoopExit::Stopped, Err(e)) => {
                        Err(SessionFailure::new(FailureKind::StopFailed, e).with_partial(result))
                    }
                    (LoopExit::SourceFailed(e), _) => {
                        Err(SessionFailure::new(FailureKind::Interrupted, e).with_partial(result))
                    }
                    (LoopExit::WriteFailed(e), _) => {
                        Err(SessionFailure::new(FailureKind::WriteFailed, e).with_partial(result))
                    }
                }
            }
            Err(e) => {
                resources.writer.discard();
                let kind = match exit {
                    LoopExit::SourceFailed(_) => FailureKind::Interrupted,
                    LoopExit::WriteFailed(_) => FailureKind::WriteFailed,
                    LoopExit::Stopped => FailureKind::StopFailed,
                };
                Err(SessionFailure::new(kind, e))
            }
        };
        self.conclude(end);
    }

    /// Write what the source still had buffered when it was closed.
    fn drain(&self, resources: &mut SessionResources) -> Result<(), CaptureError> {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        let mut drained = 0usize;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!(
                    "{}: gave up draining after {} frames",
                    self.recording_type(),
                    drained
                );
                break;
            }
            match resources.source.next_frame(remaining) {
                Ok(NextFrame::Frame(frame)) => {
                    resources.write_frame(&frame, &self.plan.settings)?;
                    drained += 1;
                }
                Ok(NextFrame::Timeout) | Ok(NextFrame::EndOfStream) => break,
                Err(e) => {
                    log::debug!("{}: source ended with {} while draining", self.recording_type(), e);
                    break;
                }
            }
        }
        log::trace!("{}: drained {} frames", self.recording_type(), drained);
        resources.flush_resampler()
    }

    fn build_result(
        &self,
        file: &FinalizedFile,
        resources: &SessionResources,
        stop_reason: StopReason,
    ) -> RecordingResult {
        let target = resources.target;
        let duration_secs = target.duration_of(file.frames).as_secs_f64();
        let metadata = RecordingMetadata {
            id: self.id.to_string(),
            recording_type: self.recording_type(),
            sources: self.plan.sources.iter().map(SourceSpec::kind).collect(),
            process: self.plan.process.clone(),
            file_path: file.path.display().to_string(),
            sample_rate: target.sample_rate,
            channels: target.channels,
            bit_depth: self.plan.settings.encoding.bit_depth(),
            frames_written: file.frames,
            duration_secs,
            checksum: file.checksum.clone(),
            created_at: self.plan.started_at.to_rfc3339(),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            drift_ticks: self.drift_ticks.load(Ordering::Relaxed),
            stop_reason,
        };
        RecordingResult {
            recording_type: self.recording_type(),
            file_path: file.path.clone(),
            duration_secs,
            checksum: file.checksum.clone(),
            metadata,
        }
    }

    /// Move to Finalized or Failed and tell the observer.
    ///
    /// A session that is already terminal (given up on as unresponsive)
    /// only picks up the file its late worker produced.
    fn conclude(&self, end: Result<RecordingResult, SessionFailure>) {
        let mut status = self.status.lock();
        if status.state.is_terminal() {
            let late = match end {
                Ok(result) => Some(result),
                Err(failure) => failure.partial.map(|partial| *partial),
            };
            if let (Some(failure), Some(late)) = (status.failure.as_mut(), late) {
                log::info!(
                    "{} recording finished late, kept {}",
                    self.recording_type(),
                    late.file_path.display()
                );
                failure.partial = Some(Box::new(late));
            }
            return;
        }

        status.ended_at = Some(Instant::now());
        match end {
            Ok(result) => {
                status.state = SessionState::Finalized;
                status.result = Some(result.clone());
                drop(status);
                log::info!(
                    "{} recording finalized: {} ({:.1} s)",
                    self.recording_type(),
                    result.file_path.display(),
                    result.duration_secs
                );
                self.notify(SessionState::Finalized);
                if let Some(observer) = &self.observer {
                    observer.on_recording_finished(&result);
                }
            }
            Err(failure) => {
                let cause = failure.cause.clone();
                log::error!(
                    "{} recording failed ({:?}): {}",
                    self.recording_type(),
                    failure.kind,
                    cause
                );
                status.state = SessionState::Failed;
                status.failure = Some(failure);
                drop(status);
                self.notify(SessionState::Failed);
                if let Some(observer) = &self.observer {
                    observer.on_error(self.recording_type(), &cause);
                }
            }
        }
    }

    fn outcome(&self) -> StopOutcome {
        let status = self.status.lock();
        match (&status.result, &status.failure) {
            (_, Some(failure)) => StopOutcome::Failed(failure.clone()),
            (Some(result), None) => StopOutcome::Finalized(Box::new(result.clone())),
            (None, None) => StopOutcome::NotActive,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{SyntheticBackend, SyntheticSource, Waveform};
    use crate::storage::wav_writer::sha256_file;

    #[derive(Default)]
    struct RecordingObserver {
        states: Mutex<Vec<SessionState>>,
        errors: Mutex<Vec<CaptureError>>,
        finished: Mutex<Vec<PathBuf>>,
    }

    impl SessionObserver for RecordingObserver {
        fn on_state_changed(&self, _recording_type: RecordingType, state: SessionState) {
            self.states.lock().push(state);
        }

        fn on_error(&self, _recording_type: RecordingType, error: &CaptureError) {
            self.errors.lock().push(error.clone());
        }

        fn on_recording_finished(&self, result: &RecordingResult) {
            self.finished.lock().push(result.file_path.clone());
        }
    }

    fn plan(dir: &Path, recording_type: RecordingType, config: &RecorderConfig) -> SessionPlan {
        let sources = recording_type
            .sources()
            .iter()
            .map(|kind| match kind {
                SourceKind::Process => SourceSpec::Process {
                    target: ProcessTarget::new(4242, "player"),
                },
                SourceKind::System => SourceSpec::System,
                SourceKind::Microphone => SourceSpec::Microphone { device_id: None },
            })
            .collect();
        SessionPlan {
            recording_type,
            sources,
            process: recording_type
                .needs_focused_process()
                .then(|| ProcessTarget::new(4242, "player")),
            output_path: dir.join(format!("{}.{}", recording_type.label(), config.output_format.extension())),
            started_at: Local::now(),
            settings: SessionSettings::from_config(config, recording_type).unwrap(),
        }
    }

    fn no_hook() -> ExitHook {
        Box::new(|_: Uuid| {})
    }

    fn wait_for_state(session: &RecordingSession, state: SessionState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while session.state() != state {
            assert!(Instant::now() < deadline, "still {}", session.state());
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn start_stop_finalizes_a_playable_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let observer = Arc::new(RecordingObserver::default());
        let session = RecordingSession::new(
            plan(dir.path(), RecordingType::System, &RecorderConfig::default()),
            Some(observer.clone() as Arc<dyn SessionObserver>),
        );

        session.start(&backend, no_hook()).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        thread::sleep(Duration::from_millis(200));

        let result = match session.stop(StopReason::User, Duration::from_secs(3)) {
            StopOutcome::Finalized(result) => result,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(session.state(), SessionState::Finalized);
        assert!(result.duration_secs > 0.1, "{}", result.duration_secs);
        assert_eq!(result.checksum, sha256_file(&result.file_path).unwrap());
        assert_eq!(result.metadata.stop_reason, StopReason::User);
        assert_eq!(result.metadata.sources, vec![SourceKind::System]);

        let reader = hound::WavReader::open(&result.file_path).unwrap();
        assert_eq!(reader.spec().sample_rate, 48000);
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().bits_per_sample, 16);
        assert_eq!(reader.duration() as u64, result.metadata.frames_written);

        assert_eq!(
            *observer.states.lock(),
            vec![
                SessionState::Starting,
                SessionState::Active,
                SessionState::Stopping,
                SessionState::Finalized
            ]
        );
        assert_eq!(*observer.finished.lock(), vec![result.file_path.clone()]);
        assert!(observer.errors.lock().is_empty());
        assert_eq!(backend.active_captures(), 0);
    }

    #[test]
    fn open_failure_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        backend.fail_open(SourceKind::Microphone, CaptureError::PermissionDenied("microphone".into()));
        let observer = Arc::new(RecordingObserver::default());
        let session = RecordingSession::new(
            plan(dir.path(), RecordingType::MixSystemMic, &RecorderConfig::default()),
            Some(observer.clone() as Arc<dyn SessionObserver>),
        );

        let err = session.start(&backend, no_hook()).unwrap_err();
        assert!(matches!(err, CaptureError::PermissionDenied(_)));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!session.output_path().exists());
        // The system side was opened first and must have been released.
        assert_eq!(backend.active_captures(), 0);
        match session.outcome() {
            Some(StopOutcome::Failed(failure)) => assert_eq!(failure.kind, FailureKind::StartFailed),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(*observer.errors.lock(), vec![err]);
    }

    #[test]
    fn unwritable_output_fails_start_and_releases_capture() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();
        let backend = SyntheticBackend::new();
        let session = RecordingSession::new(
            plan(&blocker, RecordingType::Microphone, &RecorderConfig::default()),
            None,
        );

        let err = session.start(&backend, no_hook()).unwrap_err();
        assert!(matches!(err, CaptureError::PathUnwritable(_)), "{err:?}");
        assert_eq!(backend.active_captures(), 0);
    }

    #[test]
    fn process_exit_interrupts_and_keeps_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let exited = Arc::new(Mutex::new(None));
        let hook_slot = Arc::clone(&exited);
        let session = RecordingSession::new(
            plan(dir.path(), RecordingType::FocusedProcess, &RecorderConfig::default()),
            None,
        );

        session
            .start(&backend, Box::new(move |id: Uuid| *hook_slot.lock() = Some(id)))
            .unwrap();
        thread::sleep(Duration::from_millis(100));
        backend.terminate_process(4242);
        wait_for_state(&session, SessionState::Failed);

        let status = session.status();
        assert!(status.was_interrupted());
        let partial = status.failure.and_then(|f| f.partial).expect("partial recording");
        assert!(partial.file_path.exists());
        assert!(partial.metadata.interrupted());
        assert!(partial.duration_secs > 0.0);

        let deadline = Instant::now() + Duration::from_secs(2);
        while exited.lock().is_none() {
            assert!(Instant::now() < deadline, "exit hook never ran");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*exited.lock(), Some(session.id()));
    }

    #[test]
    fn hanging_close_turns_unresponsive_within_grace() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        backend.hang_on_close(SourceKind::System);
        let session = RecordingSession::new(
            plan(dir.path(), RecordingType::System, &RecorderConfig::default()),
            None,
        );
        session.start(&backend, no_hook()).unwrap();
        thread::sleep(Duration::from_millis(50));

        let begun = Instant::now();
        let outcome = session.stop(StopReason::User, Duration::from_millis(300));
        assert!(begun.elapsed() < Duration::from_secs(2));
        match outcome {
            StopOutcome::Failed(failure) => {
                assert_eq!(failure.kind, FailureKind::Unresponsive);
                assert!(matches!(failure.cause, CaptureError::UnresponsiveDevice(_)));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Failed);

        // Once the device lets go, the late worker attaches its file.
        backend.release_hung();
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(partial) = session.status().failure.and_then(|f| f.partial) {
                assert!(partial.file_path.exists());
                break;
            }
            assert!(Instant::now() < deadline, "late worker never finished");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn skipped_silence_never_makes_the_session_active() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        backend.set_source(
            SourceKind::Microphone,
            SyntheticSource::new(AudioFormat::new(16000, 1)).with_waveform(Waveform::Silence),
        );
        let config = RecorderConfig {
            skip_silence: true,
            start_timeout_ms: 200,
            ..RecorderConfig::default()
        };
        let observer = Arc::new(RecordingObserver::default());
        let session = RecordingSession::new(
            plan(dir.path(), RecordingType::Microphone, &config),
            Some(observer.clone() as Arc<dyn SessionObserver>),
        );

        let err = session.start(&backend, no_hook()).unwrap_err();
        assert!(matches!(err, CaptureError::DeviceUnavailable(_)), "{err:?}");
        assert_eq!(session.state(), SessionState::Failed);
        assert!(!observer.states.lock().contains(&SessionState::Active));
        assert!(!session.output_path().exists());
        assert_eq!(backend.active_captures(), 0);
    }

    #[test]
    fn skip_silence_becomes_active_on_the_first_audible_frame() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let config = RecorderConfig {
            skip_silence: true,
            ..RecorderConfig::default()
        };
        let session = RecordingSession::new(plan(dir.path(), RecordingType::Microphone, &config), None);
        session.start(&backend, no_hook()).unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert!(session.stop(StopReason::User, Duration::from_secs(3)).is_finalized());
    }

    #[test]
    fn grace_period_does_not_cover_finalization() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let session = RecordingSession::new(
            plan(dir.path(), RecordingType::System, &RecorderConfig::default()),
            None,
        );
        session.start(&backend, no_hook()).unwrap();
        thread::sleep(Duration::from_millis(100));

        session.request_stop(StopReason::User);
        let deadline = Instant::now() + Duration::from_secs(5);
        while !session.core.status.lock().capture_closed {
            assert!(Instant::now() < deadline, "capture never closed");
            thread::sleep(Duration::from_millis(1));
        }

        // The grace period is already over, but the endpoints closed in time.
        match session.wait_stopped(Instant::now()) {
            StopOutcome::Finalized(result) => assert!(result.file_path.exists()),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn volume_change_scales_later_frames() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        backend.set_source(
            SourceKind::Microphone,
            SyntheticSource::new(AudioFormat::new(16000, 1)).with_waveform(Waveform::Constant(0.5)),
        );
        let session = RecordingSession::new(
            plan(dir.path(), RecordingType::Microphone, &RecorderConfig::default()),
            None,
        );
        session.start(&backend, no_hook()).unwrap();
        assert_eq!(session.volume(SourceKind::Microphone), Ok(100));
        thread::sleep(Duration::from_millis(150));

        session.set_volume(SourceKind::Microphone, 50).unwrap();
        assert_eq!(session.volume(SourceKind::Microphone), Ok(50));
        thread::sleep(Duration::from_millis(150));

        let result = match session.stop(StopReason::User, Duration::from_secs(3)) {
            StopOutcome::Finalized(result) => result,
            other => panic!("unexpected outcome {:?}", other),
        };
        let mut reader = hound::WavReader::open(&result.file_path).unwrap();
        let samples: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        let full = (0.5 * i16::MAX as f32) as i16;
        let half = (0.25 * i16::MAX as f32) as i16;
        // Gaps longer than the silence timeout are filled with zeros.
        let audible: Vec<i16> = samples.into_iter().filter(|&s| s != 0).collect();
        assert_eq!(audible.first(), Some(&full));
        assert_eq!(audible.last(), Some(&half));
        assert!(audible.iter().all(|&s| s == full || s == half));
    }

    #[test]
    fn volume_is_clamped_and_limited_to_own_sources() {
        let dir = tempfile::tempdir().unwrap();
        let session = RecordingSession::new(
            plan(dir.path(), RecordingType::MixSystemMic, &RecorderConfig::default()),
            None,
        );
        session.set_volume(SourceKind::Microphone, 900).unwrap();
        assert_eq!(session.volume(SourceKind::Microphone), Ok(200));
        assert_eq!(session.volume(SourceKind::System), Ok(100));
        assert!(matches!(
            session.set_volume(SourceKind::Process, 50),
            Err(CaptureError::ConfigurationFailed(_))
        ));
    }

    #[test]
    fn flac_session_writes_a_decodable_file() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let config = RecorderConfig {
            output_format: OutputFormat::Flac,
            bit_depth: 24,
            write_metadata: true,
            ..RecorderConfig::default()
        };
        let session = RecordingSession::new(plan(dir.path(), RecordingType::Microphone, &config), None);
        session.start(&backend, no_hook()).unwrap();
        thread::sleep(Duration::from_millis(150));

        let result = match session.stop(StopReason::User, Duration::from_secs(3)) {
            StopOutcome::Finalized(result) => result,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(result.file_path.extension().and_then(|e| e.to_str()), Some("flac"));
        assert_eq!(result.checksum, sha256_file(&result.file_path).unwrap());

        let mut reader = claxon::FlacReader::open(&result.file_path).unwrap();
        assert_eq!(reader.streaminfo().bits_per_sample, 24);
        assert_eq!(reader.streaminfo().sample_rate, 48000);
        let decoded = reader.samples().count() as u64;
        assert_eq!(decoded, result.metadata.frames_written);
        assert!(decoded > 0);
        assert_eq!(metadata::read_metadata(&result.file_path).unwrap().bit_depth, 24);
    }

    #[test]
    fn debug_names_type_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let session = RecordingSession::new(
            plan(dir.path(), RecordingType::MixSystemMic, &RecorderConfig::default()),
            None,
        );
        let text = format!("{:?}", session);
        assert!(text.contains("MixSystemMic"), "{text}");
        assert!(text.contains("Idle"), "{text}");
    }

    #[test]
    fn mixed_session_writes_common_format_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        backend.set_source(
            SourceKind::Microphone,
            SyntheticSource::new(AudioFormat::new(16000, 1)).with_waveform(Waveform::Constant(0.1)),
        );
        let config = RecorderConfig {
            bit_depth: 32,
            write_metadata: true,
            ..RecorderConfig::default()
        };
        let session = RecordingSession::new(plan(dir.path(), RecordingType::MixSystemMic, &config), None);
        session.start(&backend, no_hook()).unwrap();
        thread::sleep(Duration::from_millis(200));

        let result = match session.stop(StopReason::StopAll, Duration::from_secs(3)) {
            StopOutcome::Finalized(result) => result,
            other => panic!("unexpected outcome {:?}", other),
        };
        let reader = hound::WavReader::open(&result.file_path).unwrap();
        assert_eq!(reader.spec().sample_rate, 48000);
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_format, hound::SampleFormat::Float);

        let sidecar = metadata::read_metadata(&result.file_path).unwrap();
        assert_eq!(sidecar.id, session.id().to_string());
        assert_eq!(sidecar.sources, vec![SourceKind::System, SourceKind::Microphone]);
        assert_eq!(sidecar.stop_reason, StopReason::StopAll);
        assert_eq!(sidecar.checksum, result.checksum);
    }

    #[test]
    fn start_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SyntheticBackend::new();
        let session = RecordingSession::new(
            plan(dir.path(), RecordingType::Microphone, &RecorderConfig::default()),
            None,
        );
        session.start(&backend, no_hook()).unwrap();
        assert!(matches!(
            session.start(&backend, no_hook()),
            Err(CaptureError::ConfigurationFailed(_))
        ));
        assert!(session.stop(StopReason::User, Duration::from_secs(3)).is_finalized());
    }
}
