/// Circular buffer of interleaved samples, addressed in whole frames.
///
/// Used as the mixer's alignment buffer: each side of a mix accumulates
/// normalized samples here until a tick's worth is available.
///
/// Overflow behavior: drops the oldest frames and counts them.
#[derive(Debug)]
pub struct RingBuffer {
    buffer: Vec<f32>,
    write_index: usize,
    read_index: usize,
    available: usize,
    capacity: usize,
    channels: usize,
    dropped_frames: u64,
}

impl RingBuffer {
    /// `capacity_frames` frames of `channels` interleaved samples each.
    pub fn new(capacity_frames: usize, channels: u16) -> Self {
        let channels = channels.max(1) as usize;
        let capacity = capacity_frames.max(1) * channels;
        Self {
            buffer: vec![0.0; capacity],
            write_index: 0,
            read_index: 0,
            available: 0,
            capacity,
            channels,
            dropped_frames: 0,
        }
    }

    /// Write interleaved samples. A trailing partial frame is ignored.
    ///
    /// If the buffer overflows, the oldest frames are dropped.
    pub fn write(&mut self, samples: &[f32]) {
        let usable = samples.len() - samples.len() % self.channels;
        if usable == 0 {
            return;
        }

        // If more data than capacity, only keep the tail
        let samples = if usable > self.capacity {
            self.dropped_frames += ((usable - self.capacity) / self.channels) as u64;
            &samples[usable - self.capacity..usable]
        } else {
            &samples[..usable]
        };

        let overflow = (self.available + samples.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            self.read_index = (self.read_index + overflow) % self.capacity;
            self.available -= overflow;
            self.dropped_frames += (overflow / self.channels) as u64;
        }

        for &sample in samples {
            self.buffer[self.write_index] = sample;
            self.write_index = (self.write_index + 1) % self.capacity;
        }
        self.available += samples.len();
    }

    /// Read and remove up to `frames` frames.
    pub fn read_frames(&mut self, frames: usize) -> Vec<f32> {
        let to_read = (frames * self.channels).min(self.available);
        if to_read == 0 {
            return Vec::new();
        }

        let mut result = Vec::with_capacity(to_read);
        for i in 0..to_read {
            result.push(self.buffer[(self.read_index + i) % self.capacity]);
        }
        self.read_index = (self.read_index + to_read) % self.capacity;
        self.available -= to_read;
        result
    }

    /// Read exactly `frames` frames, padding with silence.
    ///
    /// Returns the samples and the number of frames that had to be padded.
    pub fn read_frames_padded(&mut self, frames: usize) -> (Vec<f32>, usize) {
        let mut samples = self.read_frames(frames);
        let missing = frames - samples.len() / self.channels;
        samples.resize(frames * self.channels, 0.0);
        (samples, missing)
    }

    /// Whole frames available for reading.
    pub fn frames(&self) -> usize {
        self.available / self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.available == 0
    }

    pub fn channels(&self) -> u16 {
        self.channels as u16
    }

    /// Capacity in frames.
    pub fn capacity_frames(&self) -> usize {
        self.capacity / self.channels
    }

    /// Frames lost to overflow since creation.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    pub fn reset(&mut self) {
        self.write_index = 0;
        self.read_index = 0;
        self.available = 0;
    }
}
