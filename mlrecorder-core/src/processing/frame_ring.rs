use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::models::audio_models::AudioFrame;
use crate::models::error::CaptureError;
use crate::traits::capture_backend::NextFrame;

/// Bounded frame queue between a capture thread and its consumer.
///
/// The producer never blocks: pushing into a full ring drops the oldest
/// frame and counts it. The consumer waits with a timeout.
#[derive(Debug)]
pub struct FrameRing {
    state: Mutex<RingState>,
    ready: Condvar,
    capacity: usize,
}

#[derive(Debug)]
struct RingState {
    frames: VecDeque<AudioFrame>,
    dropped: u64,
    closed: bool,
    error: Option<CaptureError>,
}

impl FrameRing {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(RingState {
                frames: VecDeque::with_capacity(capacity),
                dropped: 0,
                closed: false,
                error: None,
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Queue a frame. Returns `false` if the ring was already closed.
    pub fn push(&self, frame: AudioFrame) -> bool {
        let mut state = self.state.lock();
        if state.closed {
            return false;
        }
        if state.frames.len() >= self.capacity {
            state.frames.pop_front();
            state.dropped += 1;
            if state.dropped.is_power_of_two() {
                log::warn!("Frame ring overflow, {} frames dropped so far", state.dropped);
            } else {
                log::debug!("Frame ring overflow, {} frames dropped so far", state.dropped);
            }
        }
        state.frames.push_back(frame);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Wait up to `timeout` for the next frame.
    ///
    /// Once the ring is closed, buffered frames are still delivered; after
    /// the last one the consumer sees either the recorded failure or
    /// `EndOfStream`.
    pub fn pop(&self, timeout: Duration) -> Result<NextFrame, CaptureError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Ok(NextFrame::Frame(frame));
            }
            if state.closed {
                return match &state.error {
                    Some(err) => Err(err.clone()),
                    None => Ok(NextFrame::EndOfStream),
                };
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return match state.frames.pop_front() {
                    Some(frame) => Ok(NextFrame::Frame(frame)),
                    None => Ok(NextFrame::Timeout),
                };
            }
        }
    }

    /// No more frames will be pushed.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    /// Close and record why. The first recorded error wins.
    pub fn fail(&self, error: CaptureError) {
        let mut state = self.state.lock();
        if state.error.is_none() && !state.closed {
            state.error = Some(error);
        }
        state.closed = true;
        drop(state);
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
