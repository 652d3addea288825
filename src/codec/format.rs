//! PCM container format description
//!
//! Parsed once from the `"fmt "` sub-chunk of a RIFF/WAVE stream and
//! immutable for the rest of the session.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ContainerError;

/// Format tag for uncompressed linear PCM
pub const WAVE_FORMAT_PCM: u16 = 1;

/// Minimum size of the `"fmt "` sub-chunk body
pub const FMT_CHUNK_MIN_LEN: usize = 16;

/// Size of the canonical 44-byte header (RIFF + fmt + data headers)
pub const CANONICAL_HEADER_LEN: usize = 44;

/// Audio format carried by a RIFF/WAVE container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerFormat {
    pub format_tag: u16,
    pub channel_count: u16,
    pub sample_rate_hz: u32,
    pub byte_rate: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
}

impl ContainerFormat {
    /// Build a PCM format with consistent derived fields
    pub fn pcm(channel_count: u16, sample_rate_hz: u32, bits_per_sample: u16) -> Self {
        let block_align = channel_count * (bits_per_sample / 8);
        Self {
            format_tag: WAVE_FORMAT_PCM,
            channel_count,
            sample_rate_hz,
            byte_rate: sample_rate_hz * u32::from(block_align),
            block_align,
            bits_per_sample,
        }
    }

    /// Decode and validate a `"fmt "` sub-chunk body.
    ///
    /// `offset` is the stream position of the body, used for error reporting.
    pub fn parse(body: &[u8], offset: u64) -> Result<Self, ContainerError> {
        if body.len() < FMT_CHUNK_MIN_LEN {
            return Err(ContainerError::Malformed {
                offset,
                reason: "format chunk shorter than 16 bytes",
            });
        }

        let u16_at = |i: usize| u16::from_le_bytes([body[i], body[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([body[i], body[i + 1], body[i + 2], body[i + 3]]);

        let format = Self {
            format_tag: u16_at(0),
            channel_count: u16_at(2),
            sample_rate_hz: u32_at(4),
            byte_rate: u32_at(8),
            block_align: u16_at(12),
            bits_per_sample: u16_at(14),
        };
        format.validate(offset)?;
        Ok(format)
    }

    /// Reject anything that is not 8/16-bit mono/stereo PCM
    pub fn validate(&self, offset: u64) -> Result<(), ContainerError> {
        if self.format_tag != WAVE_FORMAT_PCM {
            return Err(ContainerError::UnsupportedFormat {
                offset,
                detail: format!("format tag {} is not PCM", self.format_tag),
            });
        }
        if !(1..=2).contains(&self.channel_count) {
            return Err(ContainerError::UnsupportedFormat {
                offset,
                detail: format!("{} channels", self.channel_count),
            });
        }
        if self.bits_per_sample != 8 && self.bits_per_sample != 16 {
            return Err(ContainerError::UnsupportedFormat {
                offset,
                detail: format!("{} bits per sample", self.bits_per_sample),
            });
        }
        if self.sample_rate_hz == 0 {
            return Err(ContainerError::UnsupportedFormat {
                offset,
                detail: "zero sample rate".to_string(),
            });
        }
        Ok(())
    }

    /// Bytes per interleaved frame
    pub fn frame_size(&self) -> usize {
        usize::from(self.channel_count) * usize::from(self.bits_per_sample / 8)
    }

    /// Whole frames contained in `bytes` payload bytes
    pub fn frames_in(&self, bytes: u64) -> u64 {
        bytes / self.frame_size() as u64
    }

    /// Playback duration of `bytes` payload bytes
    pub fn duration_of(&self, bytes: u64) -> Duration {
        let frames = self.frames_in(bytes);
        let micros = frames * 1_000_000 / u64::from(self.sample_rate_hz);
        Duration::from_micros(micros)
    }

    /// Serialize a canonical 44-byte header announcing `payload_len` bytes
    pub fn canonical_header(&self, payload_len: u32) -> [u8; CANONICAL_HEADER_LEN] {
        let mut header = [0u8; CANONICAL_HEADER_LEN];
        header[0..4].copy_from_slice(b"RIFF");
        header[4..8].copy_from_slice(&(36 + payload_len).to_le_bytes());
        header[8..12].copy_from_slice(b"WAVE");
        header[12..16].copy_from_slice(b"fmt ");
        header[16..20].copy_from_slice(&16u32.to_le_bytes());
        header[20..22].copy_from_slice(&self.format_tag.to_le_bytes());
        header[22..24].copy_from_slice(&self.channel_count.to_le_bytes());
        header[24..28].copy_from_slice(&self.sample_rate_hz.to_le_bytes());
        header[28..32].copy_from_slice(&self.byte_rate.to_le_bytes());
        header[32..34].copy_from_slice(&self.block_align.to_le_bytes());
        header[34..36].copy_from_slice(&self.bits_per_sample.to_le_bytes());
        header[36..40].copy_from_slice(b"data");
        header[40..44].copy_from_slice(&payload_len.to_le_bytes());
        header
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_fmt() {
        let format = ContainerFormat::pcm(1, 44100, 16);
        let header = format.canonical_header(8);

        let parsed = ContainerFormat::parse(&header[20..36], 20).unwrap();
        assert_eq!(parsed, format);
        assert_eq!(parsed.frame_size(), 2);
        assert_eq!(parsed.byte_rate, 88200);
    }

    #[test]
    fn test_rejects_non_pcm() {
        let mut format = ContainerFormat::pcm(2, 48000, 16);
        format.format_tag = 2;
        let err = format.validate(20).unwrap_err();
        assert!(matches!(err, ContainerError::UnsupportedFormat { offset: 20, .. }));
    }

    #[test]
    fn test_rejects_bad_channels_and_bits() {
        let format = ContainerFormat::pcm(3, 48000, 16);
        assert!(format.validate(0).is_err());

        let format = ContainerFormat::pcm(2, 48000, 24);
        assert!(format.validate(0).is_err());
    }

    #[test]
    fn test_short_fmt_is_malformed() {
        let err = ContainerFormat::parse(&[1, 0, 1, 0], 20).unwrap_err();
        assert!(matches!(err, ContainerError::Malformed { offset: 20, .. }));
    }

    #[test]
    fn test_duration() {
        let format = ContainerFormat::pcm(2, 44100, 16);
        assert_eq!(format.frames_in(44100 * 4), 44100);
        assert_eq!(format.duration_of(44100 * 4), Duration::from_secs(1));
        // Partial frames are not counted
        assert_eq!(format.frames_in(3), 0);
    }
}
