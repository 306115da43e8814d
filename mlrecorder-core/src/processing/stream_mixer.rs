use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::models::audio_models::{AudioFormat, AudioFrame};

use super::wav_format::downmix_to_mono;

/// Highest capture volume, in percent.
pub const MAX_VOLUME_PERCENT: u16 = 200;

/// Linear gain that can be changed while another thread applies it.
///
/// Clones share the same value. The gain is stored as `f32` bits, so
/// readers see either the old or the new value, never a mix.
#[derive(Debug, Clone)]
pub struct SharedGain(Arc<AtomicU32>);

impl SharedGain {
    pub fn new(gain: f32) -> Self {
        Self(Arc::new(AtomicU32::new(gain.to_bits())))
    }

    pub fn from_percent(percent: u16) -> Self {
        Self::new(percent_to_gain(percent))
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, gain: f32) {
        self.0.store(gain.to_bits(), Ordering::Relaxed);
    }

    /// Set from a volume percentage, clamped to [`MAX_VOLUME_PERCENT`].
    pub fn set_percent(&self, percent: u16) {
        self.set(percent_to_gain(percent));
    }
}

impl Default for SharedGain {
    fn default() -> Self {
        Self::new(1.0)
    }
}

fn percent_to_gain(percent: u16) -> f32 {
    percent.min(MAX_VOLUME_PERCENT) as f32 / 100.0
}

/// Pure-math two-stream mixer.
///
/// Both inputs are normalized to a common format (the higher sample rate and
/// the larger channel count of the two), scaled by their own gain and summed.
/// If the sum exceeds full scale the whole block is scaled down instead of
/// hard-clipping. Gains are read once per block, so a volume change takes
/// effect from the next block on.
#[derive(Debug, Clone)]
pub struct StreamMixer {
    gain_a: SharedGain,
    gain_b: SharedGain,
    scaled_blocks: u64,
}

impl StreamMixer {
    pub fn new(gain_a: f32, gain_b: f32) -> Self {
        Self::with_gains(SharedGain::new(gain_a), SharedGain::new(gain_b))
    }

    pub fn with_gains(gain_a: SharedGain, gain_b: SharedGain) -> Self {
        Self {
            gain_a,
            gain_b,
            scaled_blocks: 0,
        }
    }

    /// Mix two frames into one in their common format.
    ///
    /// The shorter input is padded with silence, so the output lasts as long
    /// as the longer one. The output carries the later of the two timestamps
    /// and the higher of the two indices.
    pub fn mix(&mut self, a: &AudioFrame, b: &AudioFrame) -> AudioFrame {
        let target = common_format(a.format(), b.format());
        let left = normalize(a, target);
        let right = normalize(b, target);
        let timestamp = a.timestamp().max(b.timestamp());
        self.mix_aligned(&left, &right, target, timestamp, a.index().max(b.index()))
    }

    /// Mix two blocks that are already in `format`.
    pub fn mix_aligned(
        &mut self,
        a: &[f32],
        b: &[f32],
        format: AudioFormat,
        timestamp: Duration,
        index: u64,
    ) -> AudioFrame {
        let (gain_a, gain_b) = (self.gain_a.get(), self.gain_b.get());
        let len = a.len().max(b.len());
        let mut mixed = vec![0.0f32; len];
        for (i, out) in mixed.iter_mut().enumerate() {
            let sa = a.get(i).copied().unwrap_or(0.0);
            let sb = b.get(i).copied().unwrap_or(0.0);
            *out = sa * gain_a + sb * gain_b;
        }

        let peak = peak_level(&mixed);
        if peak > 1.0 {
            apply_gain(&mut mixed, 1.0 / peak);
            self.scaled_blocks += 1;
            log::debug!(
                "Mix peak {:.3} scaled to full scale ({} blocks so far)",
                peak,
                self.scaled_blocks
            );
        }

        AudioFrame::new(mixed, format, timestamp, index)
    }

    /// Blocks that needed the clipping guard.
    pub fn scaled_blocks(&self) -> u64 {
        self.scaled_blocks
    }
}

/// The format both sides of a mix are converted to.
pub fn common_format(a: AudioFormat, b: AudioFormat) -> AudioFormat {
    AudioFormat::new(a.sample_rate.max(b.sample_rate), a.channels.max(b.channels))
}

/// Convert one frame to `target` without carrying state between frames.
pub fn normalize(frame: &AudioFrame, target: AudioFormat) -> Vec<f32> {
    let source = frame.format();
    let remapped = remap_channels(frame.samples(), source.channels, target.channels);
    resample_interleaved(&remapped, target.channels, source.sample_rate, target.sample_rate)
}

/// Change the channel count of interleaved samples.
///
/// Fewer output channels: output channel `c` averages every input channel
/// `j` with `j % to == c` (mono is the plain average). More output channels:
/// output channel `c` copies input channel `c % from`, so mono is duplicated.
pub fn remap_channels(samples: &[f32], from: u16, to: u16) -> Vec<f32> {
    let (from, to) = (from.max(1) as usize, to.max(1) as usize);
    if from == to {
        return samples.to_vec();
    }
    if to == 1 {
        return downmix_to_mono(samples, from);
    }

    let frame_count = samples.len() / from;
    let mut out = vec![0.0f32; frame_count * to];
    for frame in 0..frame_count {
        let input = &samples[frame * from..(frame + 1) * from];
        let output = &mut out[frame * to..(frame + 1) * to];
        if to > from {
            for (c, sample) in output.iter_mut().enumerate() {
                *sample = input[c % from];
            }
        } else {
            for (c, sample) in output.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                let mut count = 0usize;
                let mut j = c;
                while j < from {
                    sum += input[j];
                    count += 1;
                    j += to;
                }
                *sample = sum / count as f32;
            }
        }
    }
    out
}

/// Linear interpolation resampling of an interleaved block.
///
/// Returns input unchanged if rates match.
pub fn resample_interleaved(samples: &[f32], channels: u16, from_rate: u32, to_rate: u32) -> Vec<f32> {
    let channels = channels.max(1) as usize;
    if from_rate == to_rate || from_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let frame_count = samples.len() / channels;
    let ratio = to_rate as f64 / from_rate as f64;
    let output_frames = (frame_count as f64 * ratio) as usize;
    if output_frames == 0 {
        return Vec::new();
    }

    let mut output = vec![0.0f32; output_frames * channels];
    for i in 0..output_frames {
        let source_index = i as f64 / ratio;
        let index = source_index as usize;
        let fraction = (source_index - index as f64) as f32;

        for ch in 0..channels {
            if index + 1 < frame_count {
                output[i * channels + ch] = samples[index * channels + ch] * (1.0 - fraction)
                    + samples[(index + 1) * channels + ch] * fraction;
            } else if index < frame_count {
                output[i * channels + ch] = samples[index * channels + ch];
            }
        }
    }
    output
}

/// Streaming linear-interpolation resampler.
///
/// Unlike [`resample_interleaved`] it keeps the last input frame and the
/// read position between calls, so consecutive blocks join without clicks
/// and the total output length tracks the rate ratio exactly.
#[derive(Debug, Clone)]
pub struct LinearResampler {
    from_rate: u64,
    to_rate: u64,
    channels: usize,
    /// Read position relative to `last`, in units of `1 / to_rate` input frames.
    position: u64,
    last: Option<Vec<f32>>,
}

impl LinearResampler {
    pub fn new(from_rate: u32, to_rate: u32, channels: u16) -> Self {
        Self {
            from_rate: from_rate as u64,
            to_rate: to_rate as u64,
            channels: channels.max(1) as usize,
            position: 0,
            last: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate || self.from_rate == 0 || self.to_rate == 0
    }

    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.is_passthrough() {
            return input.to_vec();
        }
        let ch = self.channels;
        let usable = input.len() - input.len() % ch;
        if usable == 0 {
            return Vec::new();
        }

        let mut joined = Vec::with_capacity(usable + ch);
        if let Some(last) = &self.last {
            joined.extend_from_slice(last);
        }
        joined.extend_from_slice(&input[..usable]);

        let frames = (joined.len() / ch) as u64;
        let to = self.to_rate;
        let expected = (frames * to / self.from_rate) as usize + 1;
        let mut out = Vec::with_capacity(expected * ch);

        let mut pos = self.position;
        while pos + to < frames * to {
            let index = (pos / to) as usize;
            let fraction = (pos % to) as f32 / to as f32;
            for c in 0..ch {
                let a = joined[index * ch + c];
                let b = joined[(index + 1) * ch + c];
                out.push(a + (b - a) * fraction);
            }
            pos += self.from_rate;
        }

        self.position = pos - (frames - 1) * to;
        self.last = Some(joined[(frames as usize - 1) * ch..].to_vec());
        out
    }

    /// Emit whatever the held last frame still covers. Call once at end of stream.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.is_passthrough() {
            return Vec::new();
        }
        let Some(last) = self.last.take() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while self.position < self.to_rate {
            out.extend_from_slice(&last);
            self.position += self.from_rate;
        }
        self.position = 0;
        out
    }
}

/// Multiply every sample by `gain`.
pub fn apply_gain(samples: &mut [f32], gain: f32) {
    if (gain - 1.0).abs() < f32::EPSILON {
        return;
    }
    for sample in samples.iter_mut() {
        *sample *= gain;
    }
}

/// Compute peak absolute level of samples.
pub fn peak_level(samples: &[f32]) -> f32 {
    samples.iter().map(|s| s.abs()).fold(0.0f32, f32::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn frame(samples: Vec<f32>, rate: u32, channels: u16, ms: u64) -> AudioFrame {
        AudioFrame::new(samples, AudioFormat::new(rate, channels), Duration::from_millis(ms), 0)
    }

    #[test]
    fn mix_sums_known_amplitudes() {
        let mut mixer = StreamMixer::new(1.0, 1.0);
        let a = frame(vec![0.25; 8], 48000, 2, 10);
        let b = frame(vec![0.5; 8], 48000, 2, 12);

        let mixed = mixer.mix(&a, &b);

        assert_eq!(mixed.frame_count(), 4);
        assert_eq!(mixed.timestamp(), Duration::from_millis(12));
        for &s in mixed.samples() {
            assert_abs_diff_eq!(s, 0.75, epsilon = 1e-6);
        }
    }

    #[test]
    fn mix_pads_shorter_side_with_silence() {
        let mut mixer = StreamMixer::new(1.0, 1.0);
        let a = frame(vec![0.25; 4], 48000, 1, 0);
        let b = frame(vec![0.5; 2], 48000, 1, 0);

        let mixed = mixer.mix(&a, &b);

        assert_eq!(mixed.samples().len(), 4);
        assert_abs_diff_eq!(mixed.samples()[1], 0.75, epsilon = 1e-6);
        assert_abs_diff_eq!(mixed.samples()[3], 0.25, epsilon = 1e-6);
    }

    #[test]
    fn mix_upmixes_mono_into_stereo() {
        let mut mixer = StreamMixer::new(1.0, 1.0);
        let mic = frame(vec![0.5, 0.3], 48000, 1, 0);
        let system = frame(vec![0.1, 0.2, 0.3, 0.4], 48000, 2, 0);

        let mixed = mixer.mix(&mic, &system);

        assert_eq!(mixed.format(), AudioFormat::new(48000, 2));
        let expected = [0.6, 0.7, 0.6, 0.7];
        for (s, e) in mixed.samples().iter().zip(expected) {
            assert_abs_diff_eq!(*s, e, epsilon = 1e-6);
        }
    }

    #[test]
    fn mix_uses_higher_sample_rate() {
        let mut mixer = StreamMixer::new(1.0, 1.0);
        let slow = frame(vec![0.2; 240], 24000, 1, 0);
        let fast = frame(vec![0.1; 480], 48000, 1, 0);

        let mixed = mixer.mix(&slow, &fast);

        assert_eq!(mixed.format().sample_rate, 48000);
        assert_eq!(mixed.frame_count(), 480);
        assert_abs_diff_eq!(mixed.samples()[100], 0.3, epsilon = 1e-6);
    }

    #[test]
    fn clipping_guard_scales_instead_of_clipping() {
        let mut mixer = StreamMixer::new(1.0, 1.0);
        let a = frame(vec![0.8, 0.4], 48000, 1, 0);
        let b = frame(vec![0.8, 0.4], 48000, 1, 0);

        let mixed = mixer.mix(&a, &b);

        // 1.6 peak scaled to 1.0; the quieter sample keeps its ratio
        assert_abs_diff_eq!(mixed.samples()[0], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(mixed.samples()[1], 0.5, epsilon = 1e-6);
        assert_eq!(mixer.scaled_blocks(), 1);
    }

    #[test]
    fn gains_are_independent() {
        let mut mixer = StreamMixer::new(0.5, 2.0);
        let mixed = mixer.mix_aligned(&[0.4], &[0.1], AudioFormat::new(48000, 1), Duration::ZERO, 0);
        assert_abs_diff_eq!(mixed.samples()[0], 0.4, epsilon = 1e-6);
    }

    #[test]
    fn gain_change_applies_from_the_next_block() {
        let voice = SharedGain::new(1.0);
        let mut mixer = StreamMixer::with_gains(SharedGain::new(0.0), voice.clone());
        let format = AudioFormat::new(48000, 1);

        let before = mixer.mix_aligned(&[0.9], &[0.4], format, Duration::ZERO, 0);
        voice.set_percent(50);
        let after = mixer.mix_aligned(&[0.9], &[0.4], format, Duration::from_millis(20), 1);

        assert_abs_diff_eq!(before.samples()[0], 0.4, epsilon = 1e-6);
        assert_abs_diff_eq!(after.samples()[0], 0.2, epsilon = 1e-6);
    }

    #[test]
    fn volume_percent_is_clamped() {
        let gain = SharedGain::from_percent(150);
        assert_abs_diff_eq!(gain.get(), 1.5, epsilon = 1e-6);
        gain.set_percent(500);
        assert_abs_diff_eq!(gain.get(), 2.0, epsilon = 1e-6);
        gain.set_percent(0);
        assert_eq!(gain.get(), 0.0);
    }

    #[test]
    fn remap_stereo_to_mono_averages() {
        assert_eq!(remap_channels(&[0.2, 0.8, 0.4, 0.6], 2, 1).len(), 2);
        let mono = remap_channels(&[0.2, 0.8], 2, 1);
        assert_abs_diff_eq!(mono[0], 0.5, epsilon = 1e-6);
    }

    #[test]
    fn remap_quad_to_stereo_folds_channels() {
        let stereo = remap_channels(&[0.1, 0.2, 0.3, 0.4], 4, 2);
        assert_abs_diff_eq!(stereo[0], 0.2, epsilon = 1e-6); // (0.1 + 0.3) / 2
        assert_abs_diff_eq!(stereo[1], 0.3, epsilon = 1e-6); // (0.2 + 0.4) / 2
    }

    #[test]
    fn resample_same_rate_is_passthrough() {
        let samples = vec![1.0, 2.0, 3.0];
        assert_eq!(resample_interleaved(&samples, 1, 48000, 48000), samples);
    }

    #[test]
    fn resample_upsample_2x() {
        let result = resample_interleaved(&[0.0, 1.0], 1, 24000, 48000);
        assert_eq!(result.len(), 4);
        assert_abs_diff_eq!(result[0], 0.0, epsilon = 0.01);
        assert_abs_diff_eq!(result[1], 0.5, epsilon = 0.01);
    }

    #[test]
    fn resample_stereo_downsample() {
        let samples: Vec<f32> = (0..200).map(|i| i as f32 / 200.0).collect();
        assert_eq!(resample_interleaved(&samples, 2, 48000, 24000).len(), 100);
    }

    #[test]
    fn streaming_resampler_tracks_ratio_across_blocks() {
        let mut resampler = LinearResampler::new(16000, 48000, 1);
        let mut total = 0;
        for _ in 0..10 {
            total += resampler.process(&[0.5; 160]).len();
        }
        total += resampler.flush().len();
        assert_eq!(total, 4800);
    }

    #[test]
    fn streaming_resampler_joins_blocks_smoothly() {
        let mut resampler = LinearResampler::new(24000, 48000, 1);
        let ramp: Vec<f32> = (0..8).map(|i| i as f32).collect();
        let mut out = resampler.process(&ramp[..4]);
        out.extend(resampler.process(&ramp[4..]));

        // A linear ramp resampled 2x is a ramp with half the slope
        for (i, s) in out.iter().enumerate() {
            assert_abs_diff_eq!(*s, i as f32 * 0.5, epsilon = 1e-5);
        }
    }

    #[test]
    fn peak_is_the_largest_magnitude() {
        assert_eq!(peak_level(&[]), 0.0);
        assert_abs_diff_eq!(peak_level(&[0.1, -0.5, 0.3]), 0.5, epsilon = 1e-6);
    }
}
