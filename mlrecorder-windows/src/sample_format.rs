//! Decoding of shared-mode WASAPI packets into interleaved f32.
//!
//! Shared-mode engines almost always hand out 32-bit float, but some
//! drivers expose integer mix formats through WAVE_FORMAT_EXTENSIBLE.

use mlrecorder_core::models::error::CaptureError;

/// Sample layout of a capture packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketEncoding {
    Float32,
    Int16,
    /// Packed 3-byte little-endian.
    Int24,
    /// 32-bit container; `valid_bits` of them carry signal.
    Int32 { valid_bits: u16 },
}

impl PacketEncoding {
    /// Pick the decoder for a format tag's container width.
    pub fn from_container(is_float: bool, container_bits: u16, valid_bits: u16) -> Result<Self, CaptureError> {
        match (is_float, container_bits) {
            (true, 32) => Ok(Self::Float32),
            (false, 16) => Ok(Self::Int16),
            (false, 24) => Ok(Self::Int24),
            (false, 32) => Ok(Self::Int32 {
                valid_bits: if valid_bits == 0 { 32 } else { valid_bits },
            }),
            _ => Err(CaptureError::FormatNegotiationFailed(format!(
                "unsupported mix format: float={} bits={}",
                is_float, container_bits
            ))),
        }
    }

    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Float32 | Self::Int32 { .. } => 4,
            Self::Int16 => 2,
            Self::Int24 => 3,
        }
    }

    /// Bit depth reported to the session as the device's native depth.
    pub fn bit_depth(self) -> u16 {
        match self {
            Self::Float32 => 32,
            Self::Int16 => 16,
            Self::Int24 => 24,
            Self::Int32 { valid_bits } => valid_bits,
        }
    }
}

/// Negotiated mix format of an opened client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub encoding: PacketEncoding,
}

impl PacketFormat {
    pub fn block_align(&self) -> usize {
        self.encoding.bytes_per_sample() * self.channels as usize
    }
}

/// Decode interleaved `encoding` samples into f32.
///
/// Trailing bytes that do not fill a whole sample are ignored.
pub fn decode_packet(bytes: &[u8], encoding: PacketEncoding) -> Vec<f32> {
    match encoding {
        PacketEncoding::Float32 => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        PacketEncoding::Int16 => bytes
            .chunks_exact(2)
            .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
            .collect(),
        PacketEncoding::Int24 => bytes
            .chunks_exact(3)
            .map(|b| {
                let value = i32::from_le_bytes([0, b[0], b[1], b[2]]) >> 8;
                value as f32 / 8_388_608.0
            })
            .collect(),
        // Valid bits sit in the high end of the container, so full-scale
        // division works regardless of how many are set.
        PacketEncoding::Int32 { .. } => bytes
            .chunks_exact(4)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32 / 2_147_483_648.0)
            .collect(),
    }
}
