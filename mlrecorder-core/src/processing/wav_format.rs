/// WAV file format utilities.
///
/// Generates standard 44-byte RIFF WAV headers, patches their size fields
/// while a recording grows, and encodes f32 samples into the data chunk.
use crate::models::error::CaptureError;

/// Size of the standard WAV RIFF header in bytes.
pub const WAV_HEADER_SIZE: usize = 44;

/// `WAVE_FORMAT_PCM`.
pub const FORMAT_PCM: u16 = 1;
/// `WAVE_FORMAT_IEEE_FLOAT`.
pub const FORMAT_IEEE_FLOAT: u16 = 3;

/// On-disk sample encoding of the data chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleEncoding {
    Pcm16,
    Pcm24,
    Float32,
}

impl SampleEncoding {
    pub fn from_bit_depth(bit_depth: u16) -> Result<Self, CaptureError> {
        match bit_depth {
            16 => Ok(Self::Pcm16),
            24 => Ok(Self::Pcm24),
            32 => Ok(Self::Float32),
            other => Err(CaptureError::ConfigurationFailed(format!(
                "unsupported bit depth: {other}"
            ))),
        }
    }

    pub fn bit_depth(self) -> u16 {
        match self {
            Self::Pcm16 => 16,
            Self::Pcm24 => 24,
            Self::Float32 => 32,
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        self.bit_depth() as usize / 8
    }

    pub fn format_tag(self) -> u16 {
        match self {
            Self::Float32 => FORMAT_IEEE_FLOAT,
            Self::Pcm16 | Self::Pcm24 => FORMAT_PCM,
        }
    }

    /// Append `samples` to `out` in this encoding. Integer encodings clamp to `[-1.0, 1.0]`.
    pub fn encode_into(self, samples: &[f32], out: &mut Vec<u8>) {
        out.reserve(samples.len() * self.bytes_per_sample());
        match self {
            Self::Pcm16 => {
                for &sample in samples {
                    let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                    out.extend_from_slice(&value.to_le_bytes());
                }
            }
            Self::Pcm24 => {
                const MAX_24: f32 = 8_388_607.0;
                for &sample in samples {
                    let value = (sample.clamp(-1.0, 1.0) * MAX_24) as i32;
                    out.extend_from_slice(&value.to_le_bytes()[..3]);
                }
            }
            Self::Float32 => {
                for &sample in samples {
                    out.extend_from_slice(&sample.to_le_bytes());
                }
            }
        }
    }

    pub fn encode(self, samples: &[f32]) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(samples, &mut out);
        out
    }
}

/// Generate a 44-byte WAV RIFF header.
///
/// Layout:
/// ```text
/// [0-3]    "RIFF"
/// [4-7]    file size - 8 (36 + data_size)
/// [8-11]   "WAVE"
/// [12-15]  "fmt "
/// [16-19]  16 (format chunk size)
/// [20-21]  format tag (1 = PCM, 3 = IEEE float)
/// [22-23]  channels
/// [24-27]  sample_rate
/// [28-31]  byte_rate = sample_rate * channels * bit_depth / 8
/// [32-33]  block_align = channels * bit_depth / 8
/// [34-35]  bit_depth
/// [36-39]  "data"
/// [40-43]  data_size
/// ```
pub fn generate_wav_header(
    encoding: SampleEncoding,
    sample_rate: u32,
    channels: u16,
    data_size: u32,
) -> [u8; WAV_HEADER_SIZE] {
    let bit_depth = encoding.bit_depth();
    let byte_rate = sample_rate * channels as u32 * bit_depth as u32 / 8;
    let block_align = channels * bit_depth / 8;
    let chunk_size = 36u32.saturating_add(data_size);

    let mut header = [0u8; WAV_HEADER_SIZE];

    // RIFF chunk descriptor
    header[0..4].copy_from_slice(b"RIFF");
    header[4..8].copy_from_slice(&chunk_size.to_le_bytes());
    header[8..12].copy_from_slice(b"WAVE");

    // fmt sub-chunk
    header[12..16].copy_from_slice(b"fmt ");
    header[16..20].copy_from_slice(&16u32.to_le_bytes());
    header[20..22].copy_from_slice(&encoding.format_tag().to_le_bytes());
    header[22..24].copy_from_slice(&channels.to_le_bytes());
    header[24..28].copy_from_slice(&sample_rate.to_le_bytes());
    header[28..32].copy_from_slice(&byte_rate.to_le_bytes());
    header[32..34].copy_from_slice(&block_align.to_le_bytes());
    header[34..36].copy_from_slice(&bit_depth.to_le_bytes());

    // data sub-chunk
    header[36..40].copy_from_slice(b"data");
    header[40..44].copy_from_slice(&data_size.to_le_bytes());

    header
}

/// Patch both size fields for a data chunk of `data_size` bytes.
///
/// Sizes beyond the 4 GiB RIFF limit saturate.
pub fn patch_sizes(header: &mut [u8], data_size: u64) {
    let data_size_u32 = u32::try_from(data_size).unwrap_or(u32::MAX);
    let chunk_size = data_size_u32.saturating_add(36);
    header[4..8].copy_from_slice(&chunk_size.to_le_bytes());
    header[40..44].copy_from_slice(&data_size_u32.to_le_bytes());
}

/// Downmix interleaved multi-channel audio to mono by averaging channels per frame.
pub fn downmix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let frame_count = samples.len() / channels;
    let scale = 1.0 / channels as f32;
    let mut mono = Vec::with_capacity(frame_count);
    for frame in 0..frame_count {
        let mut sum = 0.0f32;
        for ch in 0..channels {
            sum += samples[frame * channels + ch];
        }
        mono.push(sum * scale);
    }
    mono
}

#[cfg(test)]
mod tests {
    use super::*;

    fn u16_at(header: &[u8], at: usize) -> u16 {
        u16::from_le_bytes([header[at], header[at + 1]])
    }

    fn u32_at(header: &[u8], at: usize) -> u32 {
        u32::from_le_bytes([header[at], header[at + 1], header[at + 2], header[at + 3]])
    }

    #[test]
    fn header_riff_magic() {
        let header = generate_wav_header(SampleEncoding::Pcm16, 48000, 2, 0);
        assert_eq!(&header[0..4], b"RIFF");
        assert_eq!(&header[8..12], b"WAVE");
        assert_eq!(&header[12..16], b"fmt ");
        assert_eq!(&header[36..40], b"data");
        assert_eq!(u32_at(&header, 16), 16);
    }

    #[test]
    fn header_48khz_stereo_16bit() {
        let header = generate_wav_header(SampleEncoding::Pcm16, 48000, 2, 9600);

        assert_eq!(u16_at(&header, 20), FORMAT_PCM);
        assert_eq!(u16_at(&header, 22), 2);
        assert_eq!(u32_at(&header, 24), 48000);
        assert_eq!(u32_at(&header, 28), 192000); // 48000 * 2 * 16/8
        assert_eq!(u16_at(&header, 32), 4);
        assert_eq!(u16_at(&header, 34), 16);
        assert_eq!(u32_at(&header, 40), 9600);
        assert_eq!(u32_at(&header, 4), 36 + 9600);
    }

    #[test]
    fn header_float_uses_ieee_tag() {
        let header = generate_wav_header(SampleEncoding::Float32, 44100, 1, 0);
        assert_eq!(u16_at(&header, 20), FORMAT_IEEE_FLOAT);
        assert_eq!(u16_at(&header, 34), 32);
        assert_eq!(u16_at(&header, 32), 4);
    }

    #[test]
    fn patch_sizes_updates_both_fields() {
        let mut header = generate_wav_header(SampleEncoding::Pcm24, 48000, 2, 0);
        patch_sizes(&mut header, 19200);
        assert_eq!(u32_at(&header, 40), 19200);
        assert_eq!(u32_at(&header, 4), 19200 + 36);
    }

    #[test]
    fn patch_sizes_saturates() {
        let mut header = generate_wav_header(SampleEncoding::Pcm16, 48000, 2, 0);
        patch_sizes(&mut header, u64::from(u32::MAX) + 10);
        assert_eq!(u32_at(&header, 40), u32::MAX);
        assert_eq!(u32_at(&header, 4), u32::MAX);
    }

    #[test]
    fn pcm16_encoding_clamps() {
        let pcm = SampleEncoding::Pcm16.encode(&[0.0, 1.0, -1.0, 2.0]);
        assert_eq!(pcm.len(), 8);
        assert_eq!(i16::from_le_bytes([pcm[0], pcm[1]]), 0);
        assert_eq!(i16::from_le_bytes([pcm[2], pcm[3]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([pcm[4], pcm[5]]), -i16::MAX);
        assert_eq!(i16::from_le_bytes([pcm[6], pcm[7]]), i16::MAX);
    }

    #[test]
    fn pcm24_encoding_is_three_bytes_per_sample() {
        let pcm = SampleEncoding::Pcm24.encode(&[1.0, -0.5]);
        assert_eq!(pcm.len(), 6);
        assert_eq!(&pcm[0..3], &[0xFF, 0xFF, 0x7F]);
        // -0.5 * 8388607 = -4194303 (truncated) = 0xC00001 in 24-bit two's complement
        assert_eq!(&pcm[3..6], &[0x01, 0x00, 0xC0]);
    }

    #[test]
    fn float_encoding_is_lossless() {
        let bytes = SampleEncoding::Float32.encode(&[0.25, -0.75]);
        assert_eq!(f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), 0.25);
        assert_eq!(f32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), -0.75);
    }

    #[test]
    fn rejects_unknown_bit_depth() {
        assert!(SampleEncoding::from_bit_depth(8).is_err());
        assert_eq!(SampleEncoding::from_bit_depth(24).unwrap(), SampleEncoding::Pcm24);
    }

    #[test]
    fn downmix_stereo_to_mono() {
        let mono = downmix_to_mono(&[0.2, 0.8, 0.4, 0.6], 2);
        assert_eq!(mono.len(), 2);
        assert!((mono[0] - 0.5).abs() < 1e-6);
        assert!((mono[1] - 0.5).abs() < 1e-6);
    }
}
