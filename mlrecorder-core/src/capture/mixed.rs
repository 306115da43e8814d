use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::models::audio_models::{AudioFormat, EndpointInfo};
use crate::models::error::CaptureError;
use crate::processing::frame_ring::FrameRing;
use crate::processing::ring_buffer::RingBuffer;
use crate::processing::stream_mixer::{remap_channels, LinearResampler, SharedGain, StreamMixer};
use crate::traits::capture_backend::{CaptureEndpoint, NextFrame};

/// Longest single wait on one side while filling a tick.
const POLL_SLICE: Duration = Duration::from_millis(5);

/// Bound on draining the inner endpoints after close.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Parameters of a [`MixedEndpoint`].
#[derive(Debug, Clone)]
pub struct MixSettings {
    /// Format of the mixed stream.
    pub target: AudioFormat,
    /// Length of one mixed block.
    pub tick: Duration,
    /// How long to wait for a side before substituting silence for it.
    pub silence_timeout: Duration,
    /// Read every tick; changing it adjusts the mix while it runs.
    pub primary_gain: SharedGain,
    pub secondary_gain: SharedGain,
    /// Capacity of the mixed frame ring.
    pub ring_capacity: usize,
}

#[derive(Debug, Default)]
struct MixStats {
    drift_ticks: AtomicU64,
    dropped: AtomicU64,
}

/// Two endpoints mixed into one stream by a dedicated mixer thread.
///
/// Each input is converted to the target format as it arrives and queued in
/// its own alignment buffer. Every tick takes one block from each side; a
/// side that stays short for `silence_timeout` contributes silence for that
/// tick and the tick is counted as drift. A side that ended is padded without
/// counting drift, so the mix lasts as long as the longer input.
pub struct MixedEndpoint {
    info: EndpointInfo,
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
    stats: Arc<MixStats>,
    thread: Option<JoinHandle<()>>,
}

impl MixedEndpoint {
    pub fn spawn(
        primary: Box<dyn CaptureEndpoint>,
        secondary: Box<dyn CaptureEndpoint>,
        settings: MixSettings,
    ) -> Result<Self, CaptureError> {
        let info = EndpointInfo {
            kind: primary.info().kind,
            format: settings.target,
            bit_depth: primary.info().bit_depth.max(secondary.info().bit_depth),
            name: format!("{} + {}", primary.info().name, secondary.info().name),
        };
        let ring = Arc::new(FrameRing::new(settings.ring_capacity));
        let running = Arc::new(AtomicBool::new(true));
        let stats = Arc::new(MixStats::default());
        let chunk = settings.target.frames_for(settings.tick).max(1);

        let mut mixer_loop = MixerLoop {
            a: Side::new(primary, settings.target),
            b: Side::new(secondary, settings.target),
            mixer: StreamMixer::with_gains(settings.primary_gain.clone(), settings.secondary_gain.clone()),
            settings,
            chunk,
            ring: Arc::clone(&ring),
            running: Arc::clone(&running),
            stats: Arc::clone(&stats),
            index: 0,
        };

        let thread = thread::Builder::new()
            .name("stream-mixer".into())
            .spawn(move || mixer_loop.run())
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to spawn mixer thread: {}", e)))?;

        log::debug!(
            "Mixing {} at {} Hz, {} ch",
            info.name,
            info.format.sample_rate,
            info.format.channels
        );

        Ok(Self {
            info,
            ring,
            running,
            stats,
            thread: Some(thread),
        })
    }
}

impl CaptureEndpoint for MixedEndpoint {
    fn info(&self) -> &EndpointInfo {
        &self.info
    }

    fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame, CaptureError> {
        self.ring.pop(timeout)
    }

    fn close(&mut self) -> Result<(), CaptureError> {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Mixer thread for {} panicked", self.info.name);
                self.ring
                    .fail(CaptureError::Interrupted("mixer thread panicked".into()));
            }
        }
        self.ring.close();
        Ok(())
    }

    fn dropped_frames(&self) -> u64 {
        self.ring.dropped() + self.stats.dropped.load(Ordering::Relaxed)
    }

    fn drift_ticks(&self) -> u64 {
        self.stats.drift_ticks.load(Ordering::Relaxed)
    }
}

impl Drop for MixedEndpoint {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// One input of the mix.
struct Side {
    endpoint: Box<dyn CaptureEndpoint>,
    source: AudioFormat,
    target: AudioFormat,
    resampler: LinearResampler,
    buffer: RingBuffer,
    ended: bool,
    /// Frames of real input consumed, in target frames.
    consumed: u64,
}

impl Side {
    fn new(endpoint: Box<dyn CaptureEndpoint>, target: AudioFormat) -> Self {
        let source = endpoint.info().format;
        // Two seconds of headroom before the alignment buffer starts dropping.
        let capacity = target.sample_rate as usize * 2;
        Self {
            endpoint,
            source,
            target,
            resampler: LinearResampler::new(source.sample_rate, target.sample_rate, target.channels),
            buffer: RingBuffer::new(capacity, target.channels),
            ended: false,
            consumed: 0,
        }
    }

    fn needs(&self, frames: usize) -> bool {
        !self.ended && self.buffer.frames() < frames
    }

    fn finished(&self) -> bool {
        self.ended && self.buffer.is_empty()
    }

    /// Queue what the endpoint already has, without waiting, up to half the buffer.
    fn absorb(&mut self) -> Result<(), CaptureError> {
        let limit = self.buffer.capacity_frames() / 2;
        while self.buffer.frames() < limit && self.pull(Duration::ZERO)? {}
        Ok(())
    }

    /// Wait up to `timeout` for one frame and queue it converted.
    ///
    /// Returns `false` if nothing arrived.
    fn pull(&mut self, timeout: Duration) -> Result<bool, CaptureError> {
        if self.ended {
            return Ok(false);
        }
        match self.endpoint.next_frame(timeout)? {
            NextFrame::Frame(frame) => {
                if frame.format() != self.source {
                    log::warn!(
                        "{} changed format to {:?}",
                        self.endpoint.info().name,
                        frame.format()
                    );
                    self.flush_resampler();
                    self.source = frame.format();
                    self.resampler =
                        LinearResampler::new(self.source.sample_rate, self.target.sample_rate, self.target.channels);
                }
                let remapped = remap_channels(frame.samples(), self.source.channels, self.target.channels);
                let converted = self.resampler.process(&remapped);
                self.buffer.write(&converted);
                Ok(true)
            }
            NextFrame::Timeout => Ok(false),
            NextFrame::EndOfStream => {
                self.ended = true;
                self.flush_resampler();
                log::debug!("{} ended", self.endpoint.info().name);
                Ok(true)
            }
        }
    }

    fn flush_resampler(&mut self) {
        let tail = self.resampler.flush();
        self.buffer.write(&tail);
    }

    /// Take `frames` frames, padding with silence. Returns the padded count.
    fn take(&mut self, frames: usize) -> (Vec<f32>, usize) {
        let (samples, missing) = self.buffer.read_frames_padded(frames);
        self.consumed += (frames - missing) as u64;
        (samples, missing)
    }

    fn clock(&self) -> Duration {
        self.target.duration_of(self.consumed)
    }

    fn dropped(&self) -> u64 {
        self.endpoint.dropped_frames() + self.buffer.dropped_frames()
    }
}

struct MixerLoop {
    a: Side,
    b: Side,
    mixer: StreamMixer,
    settings: MixSettings,
    chunk: usize,
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
    stats: Arc<MixStats>,
    index: u64,
}

impl MixerLoop {
    fn run(&mut self) {
        let result = self.mix_until_stopped();
        self.close_inputs();

        match result {
            Ok(()) => {
                self.drain_inputs();
                self.ring.close();
            }
            Err(e) => {
                log::error!("Mixer input failed: {}", e);
                self.ring.fail(e);
            }
        }
        self.publish_dropped();
        log::debug!(
            "Mixer stopped after {} blocks ({} drift ticks)",
            self.index,
            self.stats.drift_ticks.load(Ordering::Relaxed)
        );
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn mix_until_stopped(&mut self) -> Result<(), CaptureError> {
        while self.is_running() {
            self.fill(self.settings.silence_timeout)?;

            if self.a.finished() && self.b.finished() {
                return Ok(());
            }
            if !self.is_running() {
                break;
            }

            if self.a.needs(self.chunk) || self.b.needs(self.chunk) {
                // One side stayed short for the whole wait: it contributes
                // silence for everything the other side delivered meanwhile.
                let lead = self.a.buffer.frames().max(self.b.buffer.frames());
                let mut left = if lead == 0 {
                    self.settings.target.frames_for(self.settings.silence_timeout).max(1)
                } else {
                    lead
                };
                while left > 0 {
                    let frames = left.min(self.chunk);
                    self.emit(frames, true);
                    left -= frames;
                }
            } else {
                while self.block_ready() {
                    let frames = self.a.buffer.frames().max(self.b.buffer.frames()).min(self.chunk);
                    self.emit(frames, true);
                }
            }
            self.publish_dropped();
        }
        Ok(())
    }

    fn block_ready(&self) -> bool {
        !self.a.needs(self.chunk)
            && !self.b.needs(self.chunk)
            && !(self.a.buffer.is_empty() && self.b.buffer.is_empty())
    }

    /// Pull from both sides until each holds a block, has ended, or the wait runs out.
    fn fill(&mut self, wait: Duration) -> Result<(), CaptureError> {
        let deadline = Instant::now() + wait;
        loop {
            self.a.absorb()?;
            self.b.absorb()?;
            let need_a = self.a.needs(self.chunk);
            let need_b = self.b.needs(self.chunk);
            if !need_a && !need_b {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline || !self.is_running() {
                return Ok(());
            }
            let slice = (deadline - now).min(POLL_SLICE);
            if need_a && need_b {
                self.a.pull(slice / 2)?;
                self.b.pull(slice / 2)?;
            } else if need_a {
                self.a.pull(slice)?;
            } else {
                self.b.pull(slice)?;
            }
        }
    }

    /// Mix `frames` frames from both sides into one output block.
    fn emit(&mut self, frames: usize, count_drift: bool) {
        let timestamp = self.a.clock().max(self.b.clock());
        let (a, missing_a) = self.a.take(frames);
        let (b, missing_b) = self.b.take(frames);

        let starved = (missing_a > 0 && !self.a.ended) || (missing_b > 0 && !self.b.ended);
        if count_drift && starved {
            let ticks = self.stats.drift_ticks.fetch_add(1, Ordering::Relaxed) + 1;
            log::debug!(
                "Mixer substituted silence ({} + {} missing frames, {} drift ticks)",
                missing_a,
                missing_b,
                ticks
            );
        }

        let block = self
            .mixer
            .mix_aligned(&a, &b, self.settings.target, timestamp, self.index);
        self.index += 1;
        self.ring.push(block);
    }

    fn close_inputs(&mut self) {
        for side in [&mut self.a, &mut self.b] {
            if let Err(e) = side.endpoint.close() {
                log::warn!("Closing {} failed: {}", side.endpoint.info().name, e);
            }
        }
    }

    /// After close: mix whatever the inputs still had buffered.
    fn drain_inputs(&mut self) {
        let deadline = Instant::now() + DRAIN_TIMEOUT;
        for side in [&mut self.a, &mut self.b] {
            while !side.ended && Instant::now() < deadline {
                if let Err(e) = side.pull(POLL_SLICE) {
                    log::debug!("{} failed while draining: {}", side.endpoint.info().name, e);
                    side.ended = true;
                }
            }
            if !side.ended {
                side.ended = true;
                side.flush_resampler();
            }
        }
        while !self.a.buffer.is_empty() || !self.b.buffer.is_empty() {
            let frames = self.a.buffer.frames().max(self.b.buffer.frames()).min(self.chunk);
            self.emit(frames, false);
        }
    }

    fn publish_dropped(&self) {
        self.stats
            .dropped
            .store(self.a.dropped() + self.b.dropped(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::synthetic::{SyntheticBackend, SyntheticSource, Waveform};
    use crate::models::audio_models::SourceSpec;
    use crate::models::recording_type::SourceKind;
    use crate::traits::capture_backend::CaptureBackend;
    use approx::assert_abs_diff_eq;

    fn settings(target: AudioFormat, silence_timeout: Duration) -> MixSettings {
        MixSettings {
            target,
            tick: Duration::from_millis(20),
            silence_timeout,
            primary_gain: SharedGain::default(),
            secondary_gain: SharedGain::default(),
            ring_capacity: 512,
        }
    }

    fn read_all(endpoint: &mut MixedEndpoint) -> (Vec<f32>, Option<CaptureError>) {
        let mut samples = Vec::new();
        loop {
            match endpoint.next_frame(Duration::from_secs(10)) {
                Ok(NextFrame::Frame(frame)) => samples.extend_from_slice(frame.samples()),
                Ok(NextFrame::Timeout) => continue,
                Ok(NextFrame::EndOfStream) => return (samples, None),
                Err(e) => return (samples, Some(e)),
            }
        }
    }

    #[test]
    fn mixes_known_amplitudes_and_pads_shorter_input() {
        let backend = SyntheticBackend::new();
        let format = AudioFormat::new(48000, 1);
        backend.set_source(
            SourceKind::System,
            SyntheticSource::new(format)
                .with_waveform(Waveform::Constant(0.25))
                .with_total_frames(48000)
                .unpaced(),
        );
        backend.set_source(
            SourceKind::Microphone,
            SyntheticSource::new(format)
                .with_waveform(Waveform::Constant(0.5))
                .with_total_frames(24000)
                .unpaced(),
        );

        let system = backend.open(&SourceSpec::System, 512).unwrap();
        let mic = backend.open(&SourceSpec::Microphone { device_id: None }, 512).unwrap();
        let mut mixed = MixedEndpoint::spawn(system, mic, settings(format, Duration::from_secs(2))).unwrap();

        let (samples, error) = read_all(&mut mixed);
        assert_eq!(error, None);
        assert_eq!(samples.len(), 48000);
        for &s in &samples[..24000] {
            assert_abs_diff_eq!(s, 0.75, epsilon = 1e-6);
        }
        for &s in &samples[24000..] {
            assert_abs_diff_eq!(s, 0.25, epsilon = 1e-6);
        }
        assert_eq!(mixed.drift_ticks(), 0);
        assert_eq!(mixed.dropped_frames(), 0);
    }

    #[test]
    fn aligns_rates_and_channels() {
        let backend = SyntheticBackend::new();
        backend.set_source(
            SourceKind::System,
            SyntheticSource::new(AudioFormat::new(48000, 2))
                .with_waveform(Waveform::Constant(0.1))
                .with_total_frames(4800)
                .unpaced(),
        );
        backend.set_source(
            SourceKind::Microphone,
            SyntheticSource::new(AudioFormat::new(16000, 1))
                .with_waveform(Waveform::Constant(0.2))
                .with_total_frames(1600)
                .unpaced(),
        );

        let target = AudioFormat::new(48000, 2);
        let system = backend.open(&SourceSpec::System, 512).unwrap();
        let mic = backend.open(&SourceSpec::Microphone { device_id: None }, 512).unwrap();
        let mut mixed = MixedEndpoint::spawn(system, mic, settings(target, Duration::from_secs(2))).unwrap();

        assert_eq!(mixed.info().format, target);
        let (samples, error) = read_all(&mut mixed);
        assert_eq!(error, None);
        assert_eq!(samples.len(), 4800 * 2);
        for &s in &samples {
            assert_abs_diff_eq!(s, 0.3, epsilon = 1e-5);
        }
    }

    #[test]
    fn silent_side_is_substituted_and_counted() {
        let backend = SyntheticBackend::new();
        let format = AudioFormat::new(48000, 1);
        backend.set_source(
            SourceKind::System,
            SyntheticSource::new(format).with_waveform(Waveform::Constant(0.25)),
        );
        backend.stall(SourceKind::Microphone);

        let system = backend.open(&SourceSpec::System, 64).unwrap();
        let mic = backend.open(&SourceSpec::Microphone { device_id: None }, 64).unwrap();
        let mut mixed = MixedEndpoint::spawn(system, mic, settings(format, Duration::from_millis(30))).unwrap();

        let started = Instant::now();
        let mut blocks = 0;
        while started.elapsed() < Duration::from_millis(300) {
            if let Ok(NextFrame::Frame(frame)) = mixed.next_frame(Duration::from_millis(100)) {
                assert!(frame.samples().iter().all(|&s| (0.0..=0.26).contains(&s)));
                blocks += 1;
            }
        }
        assert!(blocks > 0, "the mix must keep flowing");
        assert!(mixed.drift_ticks() > 0);
        mixed.close().unwrap();
        assert_eq!(backend.active_captures(), 0);
    }

    #[test]
    fn interruption_of_one_side_fails_the_mix() {
        let backend = SyntheticBackend::new();
        let system = backend.open(&SourceSpec::System, 64).unwrap();
        let mic = backend.open(&SourceSpec::Microphone { device_id: None }, 64).unwrap();
        let mut mixed =
            MixedEndpoint::spawn(system, mic, settings(AudioFormat::new(48000, 2), Duration::from_millis(40)))
                .unwrap();

        backend.remove_device(SourceKind::Microphone);
        let (_, error) = read_all(&mut mixed);
        assert!(matches!(error, Some(CaptureError::Interrupted(_))));

        mixed.close().unwrap();
        assert_eq!(backend.active_captures(), 0);
    }

    #[test]
    fn close_ends_stream_and_releases_inputs() {
        let backend = SyntheticBackend::new();
        let system = backend.open(&SourceSpec::System, 64).unwrap();
        let mic = backend.open(&SourceSpec::Microphone { device_id: None }, 64).unwrap();
        let mut mixed =
            MixedEndpoint::spawn(system, mic, settings(AudioFormat::new(48000, 2), Duration::from_millis(40)))
                .unwrap();

        assert!(matches!(
            mixed.next_frame(Duration::from_secs(5)),
            Ok(NextFrame::Frame(_))
        ));
        mixed.close().unwrap();
        mixed.close().unwrap();
        assert_eq!(backend.active_captures(), 0);

        let (_, error) = read_all(&mut mixed);
        assert_eq!(error, None);
    }
}
