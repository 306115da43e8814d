use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::models::audio_models::{AudioFormat, AudioFrame, EndpointInfo};
use crate::models::error::CaptureError;
use crate::processing::frame_ring::FrameRing;
use crate::traits::capture_backend::{CaptureEndpoint, NextFrame};

type OpenReply = Result<EndpointInfo, CaptureError>;
type ReplySlot = Arc<Mutex<Option<SyncSender<OpenReply>>>>;

/// Upper bound for a capture thread to report that its device is open.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handed to a producer when its thread starts.
///
/// The producer opens its device on its own thread (COM apartments and
/// similar thread-affine handles stay on that thread), then calls [`open`]
/// to report the negotiated format and receive a [`FrameSink`]. Returning
/// an error before `open` fails the opener's `spawn` call with that error.
///
/// [`open`]: Handshake::open
pub struct Handshake {
    reply: ReplySlot,
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
}

impl Handshake {
    /// Report the device as open. Frames pushed into the sink become readable.
    pub fn open(self, info: EndpointInfo) -> FrameSink {
        let format = info.format;
        if let Some(reply) = self.reply.lock().take() {
            let _ = reply.send(Ok(info));
        }
        FrameSink {
            ring: self.ring,
            running: self.running,
            format,
            next_index: 0,
            delivered: 0,
        }
    }

    /// `false` once the opener gave up waiting.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Producer side of a [`ThreadedEndpoint`].
pub struct FrameSink {
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
    format: AudioFormat,
    next_index: u64,
    delivered: u64,
}

impl FrameSink {
    /// `false` once the endpoint is closing. Producers poll this and return.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Queue interleaved samples as one frame.
    ///
    /// The frame is stamped with the capture clock derived from the number of
    /// frames delivered so far. Returns `false` if the ring is closed.
    pub fn push(&mut self, samples: Vec<f32>) -> bool {
        let channels = self.format.channels.max(1) as u64;
        let frames = samples.len() as u64 / channels;
        if frames == 0 {
            return true;
        }
        let timestamp = self.format.duration_of(self.delivered);
        let frame = AudioFrame::new(samples, self.format, timestamp, self.next_index);
        self.next_index += 1;
        self.delivered += frames;
        self.ring.push(frame)
    }

    /// Queue `frames` frames of digital silence.
    pub fn push_silence(&mut self, frames: usize) -> bool {
        self.push(vec![0.0; frames * self.format.channels as usize])
    }

    /// Frames delivered since the device opened.
    pub fn delivered_frames(&self) -> u64 {
        self.delivered
    }
}

/// A [`CaptureEndpoint`] fed by a dedicated capture thread through a bounded ring.
///
/// Shared by every thread-driven backend (WASAPI loops, synthetic generators).
pub struct ThreadedEndpoint {
    info: EndpointInfo,
    ring: Arc<FrameRing>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ThreadedEndpoint {
    /// Start `producer` on a named thread and wait for it to open its device.
    pub fn spawn<F>(
        thread_name: String,
        ring_capacity: usize,
        open_timeout: Duration,
        producer: F,
    ) -> Result<Self, CaptureError>
    where
        F: FnOnce(Handshake) -> Result<(), CaptureError> + Send + 'static,
    {
        let ring = Arc::new(FrameRing::new(ring_capacity));
        let running = Arc::new(AtomicBool::new(true));
        let (reply_tx, reply_rx) = mpsc::sync_channel::<OpenReply>(1);
        let reply: ReplySlot = Arc::new(Mutex::new(Some(reply_tx)));

        let handshake = Handshake {
            reply: Arc::clone(&reply),
            ring: Arc::clone(&ring),
            running: Arc::clone(&running),
        };
        let thread_ring = Arc::clone(&ring);
        let name = thread_name.clone();

        let thread = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let result = producer(handshake);
                let pending = reply.lock().take();
                match (result, pending) {
                    (Err(e), Some(reply)) => {
                        let _ = reply.send(Err(e));
                    }
                    (Err(e), None) => {
                        log::error!("[{}] capture failed: {}", name, e);
                        thread_ring.fail(e);
                    }
                    (Ok(()), Some(reply)) => {
                        let _ = reply.send(Err(CaptureError::DeviceUnavailable(format!(
                            "{name} stopped before opening"
                        ))));
                    }
                    (Ok(()), None) => thread_ring.close(),
                }
            })
            .map_err(|e| CaptureError::DeviceUnavailable(format!("failed to spawn capture thread: {}", e)))?;

        match reply_rx.recv_timeout(open_timeout) {
            Ok(Ok(info)) => {
                log::debug!(
                    "Opened {} ({} Hz, {} ch)",
                    info.name,
                    info.format.sample_rate,
                    info.format.channels
                );
                Ok(Self {
                    info,
                    ring,
                    running,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                // The thread is left to notice `running` and exit on its own.
                running.store(false, Ordering::Release);
                Err(CaptureError::DeviceUnavailable(format!(
                    "device did not open within {} ms",
                    open_timeout.as_millis()
                )))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                Err(CaptureError::DeviceUnavailable("capture thread exited while opening".into()))
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

impl CaptureEndpoint for ThreadedEndpoint {
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
                log::error!("{} capture thread panicked", self.info.name);
                self.ring.fail(CaptureError::Interrupted(format!(
                    "{} capture thread panicked",
                    self.info.name
                )));
            }
            log::debug!("Closed {}", self.info.name);
        }
        self.ring.close();
        Ok(())
    }

    fn dropped_frames(&self) -> u64 {
        self.ring.dropped()
    }
}

impl Drop for ThreadedEndpoint {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
