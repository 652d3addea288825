//! Incremental RIFF/WAVE extractor
//!
//! Accepts byte fragments of any size and separates the container header
//! from the raw PCM payload. The header may arrive a byte at a time; the
//! extractor keeps just enough of it buffered to decode one sub-chunk
//! header or the format chunk body. Payload is never copied: each call
//! returns the range of the input fragment that is sample data.

use serde::Serialize;
use std::ops::Range;
use std::time::Duration;

use super::format::{ContainerFormat, FMT_CHUNK_MIN_LEN};
use crate::error::ContainerError;

const RIFF_MAGIC: &[u8; 4] = b"RIFF";
const WAVE_MAGIC: &[u8; 4] = b"WAVE";
const OUTER_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;

/// Largest format chunk we are willing to buffer
const FMT_CHUNK_MAX_LEN: u32 = 1024;

/// Extractor state; transitions only move forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractorState {
    AwaitingContainerStart,
    AwaitingFormatChunk,
    AwaitingDataChunk,
    StreamingPayload,
    Error(ContainerError),
}

#[derive(Clone, Copy)]
struct ChunkHeader {
    id: [u8; 4],
    size: u32,
    /// Stream offset of the chunk body
    body_offset: u64,
}

/// Result of pushing one fragment
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Extracted {
    /// Set on the push that completed the format chunk
    pub format: Option<ContainerFormat>,
    /// Payload bytes within the pushed fragment
    pub payload: Range<usize>,
}

/// End-of-input report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtractionSummary {
    pub format: ContainerFormat,
    pub payload_offset: u64,
    pub payload_size: u64,
    pub payload_delivered: u64,
    /// Bytes that arrived after the declared payload end
    pub trailing_bytes: u64,
    pub truncated: bool,
}

/// Incremental container parser for one session
pub struct ContainerExtractor {
    state: ExtractorState,
    /// Outer header, chunk header or format body being assembled
    pending: Vec<u8>,
    chunk: Option<ChunkHeader>,
    /// Chunk body (plus pad byte) still to be skipped
    skip: u64,
    /// Stream bytes consumed so far
    position: u64,
    riff_size: u32,
    format: Option<ContainerFormat>,
    payload_offset: u64,
    payload_size: u64,
    payload_delivered: u64,
    trailing_bytes: u64,
}

impl ContainerExtractor {
    pub fn new() -> Self {
        Self {
            state: ExtractorState::AwaitingContainerStart,
            pending: Vec::with_capacity(OUTER_HEADER_LEN),
            chunk: None,
            skip: 0,
            position: 0,
            riff_size: 0,
            format: None,
            payload_offset: 0,
            payload_size: 0,
            payload_delivered: 0,
            trailing_bytes: 0,
        }
    }

    /// Start over for a new session
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn state(&self) -> &ExtractorState {
        &self.state
    }

    pub fn format(&self) -> Option<&ContainerFormat> {
        self.format.as_ref()
    }

    /// Stream bytes consumed, header included
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Stream offset of the first payload byte
    pub fn payload_offset(&self) -> Option<u64> {
        self.is_streaming().then_some(self.payload_offset)
    }

    /// Declared payload size
    pub fn payload_size(&self) -> Option<u64> {
        self.is_streaming().then_some(self.payload_size)
    }

    /// Payload bytes forwarded so far
    pub fn payload_delivered(&self) -> u64 {
        self.payload_delivered
    }

    /// Playback time of the payload forwarded so far
    pub fn duration(&self) -> Duration {
        self.format
            .map(|f| f.duration_of(self.payload_delivered))
            .unwrap_or_default()
    }

    /// Declared RIFF size field, once seen
    pub fn riff_size(&self) -> u32 {
        self.riff_size
    }

    /// The whole declared payload has been forwarded
    pub fn is_finished(&self) -> bool {
        self.is_streaming() && self.payload_delivered == self.payload_size
    }

    fn is_streaming(&self) -> bool {
        self.state == ExtractorState::StreamingPayload
    }

    /// Feed the next fragment of the stream
    pub fn push(&mut self, fragment: &[u8]) -> Result<Extracted, ContainerError> {
        let mut cursor = 0;
        let mut new_format = None;

        loop {
            match self.state {
                ExtractorState::Error(ref e) => return Err(e.clone()),

                ExtractorState::AwaitingContainerStart => {
                    cursor += self.fill_pending(&fragment[cursor..], OUTER_HEADER_LEN);
                    if let Err(e) = self.check_outer_magic() {
                        return Err(self.fail(e));
                    }
                    if self.pending.len() < OUTER_HEADER_LEN {
                        return Ok(Extracted::default());
                    }

                    self.riff_size = u32::from_le_bytes([
                        self.pending[4],
                        self.pending[5],
                        self.pending[6],
                        self.pending[7],
                    ]);
                    self.pending.clear();
                    self.state = ExtractorState::AwaitingFormatChunk;
                    tracing::debug!(riff_size = self.riff_size, "RIFF/WAVE header recognized");
                }

                ExtractorState::AwaitingFormatChunk | ExtractorState::AwaitingDataChunk => {
                    if self.skip > 0 {
                        let available = (fragment.len() - cursor) as u64;
                        let step = self.skip.min(available);
                        self.skip -= step;
                        self.position += step;
                        cursor += step as usize;
                        if self.skip > 0 {
                            return Ok(Extracted {
                                format: new_format,
                                payload: 0..0,
                            });
                        }
                        continue;
                    }

                    match self.chunk {
                        None => {
                            cursor += self.fill_pending(&fragment[cursor..], CHUNK_HEADER_LEN);
                            if self.pending.len() < CHUNK_HEADER_LEN {
                                return Ok(Extracted {
                                    format: new_format,
                                    payload: 0..0,
                                });
                            }
                            if let Err(e) = self.begin_chunk() {
                                return Err(self.fail(e));
                            }
                        }
                        Some(header) => {
                            // Only the format chunk body is ever buffered
                            let want = header.size as usize;
                            cursor += self.fill_pending(&fragment[cursor..], want);
                            if self.pending.len() < want {
                                return Ok(Extracted {
                                    format: new_format,
                                    payload: 0..0,
                                });
                            }

                            let format = match ContainerFormat::parse(&self.pending, header.body_offset) {
                                Ok(format) => format,
                                Err(e) => return Err(self.fail(e)),
                            };
                            tracing::info!(
                                channels = format.channel_count,
                                sample_rate = format.sample_rate_hz,
                                bits = format.bits_per_sample,
                                "Container format parsed"
                            );

                            self.format = Some(format);
                            new_format = Some(format);
                            self.pending.clear();
                            self.chunk = None;
                            self.skip = u64::from(header.size & 1);
                            self.state = ExtractorState::AwaitingDataChunk;
                        }
                    }
                }

                ExtractorState::StreamingPayload => {
                    let remaining = self.payload_size - self.payload_delivered;
                    let available = (fragment.len() - cursor) as u64;
                    let take = remaining.min(available) as usize;

                    self.payload_delivered += take as u64;
                    self.position += take as u64;

                    let extra = available - take as u64;
                    if extra > 0 {
                        if self.trailing_bytes == 0 {
                            tracing::debug!(
                                offset = self.position,
                                "Bytes past the declared payload end are ignored"
                            );
                        }
                        self.trailing_bytes += extra;
                    }

                    return Ok(Extracted {
                        format: new_format,
                        payload: cursor..cursor + take,
                    });
                }
            }
        }
    }

    /// Input has ended.
    ///
    /// Fails with `Incomplete` if no data chunk was reached. A payload shorter
    /// than declared is reported as truncated but is not an error.
    pub fn finish(&mut self) -> Result<ExtractionSummary, ContainerError> {
        if let ExtractorState::Error(e) = &self.state {
            return Err(e.clone());
        }

        let format = match self.format {
            Some(format) if self.is_streaming() => format,
            _ => {
                let e = ContainerError::Incomplete {
                    received: self.position,
                };
                return Err(self.fail(e));
            }
        };

        let truncated = self.payload_delivered < self.payload_size;
        if truncated {
            tracing::warn!(
                declared = self.payload_size,
                delivered = self.payload_delivered,
                "Payload truncated before its declared size"
            );
        }

        Ok(ExtractionSummary {
            format,
            payload_offset: self.payload_offset,
            payload_size: self.payload_size,
            payload_delivered: self.payload_delivered,
            trailing_bytes: self.trailing_bytes,
            truncated,
        })
    }

    /// Move up to `target - pending.len()` bytes from `input` into `pending`
    fn fill_pending(&mut self, input: &[u8], target: usize) -> usize {
        let take = target.saturating_sub(self.pending.len()).min(input.len());
        self.pending.extend_from_slice(&input[..take]);
        self.position += take as u64;
        take
    }

    /// Compare whatever part of the outer header has arrived
    fn check_outer_magic(&self) -> Result<(), ContainerError> {
        let seen = &self.pending;
        let riff = &seen[..seen.len().min(4)];
        if riff != &RIFF_MAGIC[..riff.len()] {
            return Err(ContainerError::Malformed {
                offset: 0,
                reason: "missing RIFF tag",
            });
        }
        if seen.len() > 8 {
            let wave = &seen[8..];
            if wave != &WAVE_MAGIC[..wave.len()] {
                return Err(ContainerError::Malformed {
                    offset: 8,
                    reason: "missing WAVE tag",
                });
            }
        }
        Ok(())
    }

    /// Decode a complete sub-chunk header from `pending`
    fn begin_chunk(&mut self) -> Result<(), ContainerError> {
        let mut id = [0u8; 4];
        id.copy_from_slice(&self.pending[..4]);
        let size = u32::from_le_bytes([
            self.pending[4],
            self.pending[5],
            self.pending[6],
            self.pending[7],
        ]);
        let header_offset = self.position - CHUNK_HEADER_LEN as u64;
        self.pending.clear();

        tracing::trace!(
            id = %String::from_utf8_lossy(&id),
            size,
            offset = header_offset,
            "Sub-chunk"
        );

        let awaiting_format = self.state == ExtractorState::AwaitingFormatChunk;
        match &id {
            b"fmt " if awaiting_format => {
                if (size as usize) < FMT_CHUNK_MIN_LEN {
                    return Err(ContainerError::Malformed {
                        offset: header_offset,
                        reason: "format chunk shorter than 16 bytes",
                    });
                }
                if size > FMT_CHUNK_MAX_LEN {
                    return Err(ContainerError::Malformed {
                        offset: header_offset,
                        reason: "format chunk too large",
                    });
                }
                self.chunk = Some(ChunkHeader {
                    id,
                    size,
                    body_offset: self.position,
                });
            }
            b"data" if awaiting_format => {
                return Err(ContainerError::Malformed {
                    offset: header_offset,
                    reason: "data chunk before format chunk",
                });
            }
            b"data" => {
                self.payload_offset = self.position;
                self.payload_size = u64::from(size);
                self.state = ExtractorState::StreamingPayload;
                tracing::debug!(
                    offset = self.payload_offset,
                    size,
                    "Streaming payload"
                );
            }
            _ => {
                // Unknown or repeated chunk, skip body and pad byte
                self.skip = u64::from(size) + u64::from(size & 1);
            }
        }
        Ok(())
    }

    fn fail(&mut self, error: ContainerError) -> ContainerError {
        tracing::warn!(%error, "Container rejected");
        self.state = ExtractorState::Error(error.clone());
        error
    }
}

impl Default for ContainerExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChunkHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({} bytes @{})",
            String::from_utf8_lossy(&self.id),
            self.size,
            self.body_offset
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wav(format: ContainerFormat, payload: &[u8]) -> Vec<u8> {
        let mut bytes = format.canonical_header(payload.len() as u32).to_vec();
        bytes.extend_from_slice(payload);
        bytes
    }

    /// Push all fragments, returning the format and concatenated payload
    fn run(extractor: &mut ContainerExtractor, fragments: &[&[u8]]) -> (Vec<ContainerFormat>, Vec<u8>) {
        let mut formats = Vec::new();
        let mut payload = Vec::new();
        for fragment in fragments {
            let out = extractor.push(fragment).unwrap();
            formats.extend(out.format);
            payload.extend_from_slice(&fragment[out.payload]);
        }
        (formats, payload)
    }

    #[test]
    fn test_single_fragment() {
        let format = ContainerFormat::pcm(1, 44100, 16);
        let bytes = wav(format, &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut extractor = ContainerExtractor::new();
        let (formats, payload) = run(&mut extractor, &[&bytes]);

        assert_eq!(formats, vec![format]);
        assert_eq!(payload, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(extractor.payload_offset(), Some(44));
        assert!(extractor.is_finished());

        let summary = extractor.finish().unwrap();
        assert!(!summary.truncated);
        assert_eq!(summary.payload_delivered, 8);
    }

    #[test]
    fn test_every_split_point() {
        let format = ContainerFormat::pcm(2, 48000, 16);
        let payload: Vec<u8> = (0..64).collect();
        let bytes = wav(format, &payload);

        for split in 1..bytes.len() {
            let mut extractor = ContainerExtractor::new();
            let (head, tail) = bytes.split_at(split);
            let (formats, out) = run(&mut extractor, &[head, tail]);
            assert_eq!(formats, vec![format], "split at {}", split);
            assert_eq!(out, payload, "split at {}", split);
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let format = ContainerFormat::pcm(1, 8000, 8);
        let payload: Vec<u8> = (0..17).collect();
        let bytes = wav(format, &payload);

        let mut extractor = ContainerExtractor::new();
        let fragments: Vec<&[u8]> = bytes.chunks(1).collect();
        let (formats, out) = run(&mut extractor, &fragments);

        assert_eq!(formats, vec![format]);
        assert_eq!(out, payload);
    }

    #[test]
    fn test_skips_unknown_chunk_with_pad() {
        let format = ContainerFormat::pcm(1, 22050, 16);
        let header = format.canonical_header(4);

        let mut bytes = header[..36].to_vec();
        // Odd-sized LIST chunk followed by its pad byte
        bytes.extend_from_slice(b"LIST");
        bytes.extend_from_slice(&3u32.to_le_bytes());
        bytes.extend_from_slice(b"abc\0");
        bytes.extend_from_slice(&header[36..]);
        bytes.extend_from_slice(&[9, 8, 7, 6]);

        for size in [1, 2, 3, 5, 7, 64] {
            let mut extractor = ContainerExtractor::new();
            let fragments: Vec<&[u8]> = bytes.chunks(size).collect();
            let (_, out) = run(&mut extractor, &fragments);
            assert_eq!(out, vec![9, 8, 7, 6], "fragment size {}", size);
        }
    }

    #[test]
    fn test_trailing_bytes_are_truncated() {
        let format = ContainerFormat::pcm(1, 44100, 16);
        let mut bytes = wav(format, &[1, 2, 3, 4]);
        bytes.extend_from_slice(b"junk");

        let mut extractor = ContainerExtractor::new();
        let (_, out) = run(&mut extractor, &[&bytes]);
        assert_eq!(out, vec![1, 2, 3, 4]);

        let summary = extractor.finish().unwrap();
        assert_eq!(summary.trailing_bytes, 4);
    }

    #[test]
    fn test_bad_magic_detected_early() {
        let mut extractor = ContainerExtractor::new();
        let err = extractor.push(b"RIFX").unwrap_err();
        assert!(matches!(err, ContainerError::Malformed { offset: 0, .. }));

        // Errors are sticky
        assert!(extractor.push(b"anything").is_err());

        let mut extractor = ContainerExtractor::new();
        extractor.push(b"RIFF\x10\0\0\0").unwrap();
        let err = extractor.push(b"WAV!").unwrap_err();
        assert!(matches!(err, ContainerError::Malformed { offset: 8, .. }));
    }

    #[test]
    fn test_non_pcm_rejected() {
        let mut format = ContainerFormat::pcm(1, 44100, 16);
        format.format_tag = 2;
        let bytes = wav(format, &[0; 4]);

        let mut extractor = ContainerExtractor::new();
        let err = extractor.push(&bytes).unwrap_err();
        assert!(matches!(err, ContainerError::UnsupportedFormat { offset: 20, .. }));
        assert!(matches!(extractor.state(), ExtractorState::Error(_)));
    }

    #[test]
    fn test_incomplete_without_data_chunk() {
        let format = ContainerFormat::pcm(1, 44100, 16);
        let bytes = wav(format, &[]);

        let mut extractor = ContainerExtractor::new();
        extractor.push(&bytes[..36]).unwrap();
        let err = extractor.finish().unwrap_err();
        assert_eq!(err, ContainerError::Incomplete { received: 36 });
    }

    #[test]
    fn test_data_before_fmt_is_malformed() {
        let mut bytes = b"RIFF\x0c\0\0\0WAVE".to_vec();
        bytes.extend_from_slice(b"data\x04\0\0\0");

        let mut extractor = ContainerExtractor::new();
        let err = extractor.push(&bytes).unwrap_err();
        assert!(matches!(err, ContainerError::Malformed { offset: 12, .. }));
    }

    #[test]
    fn test_truncated_payload_is_not_an_error() {
        let format = ContainerFormat::pcm(1, 44100, 16);
        let bytes = wav(format, &[1, 2, 3, 4, 5, 6]);

        let mut extractor = ContainerExtractor::new();
        run(&mut extractor, &[&bytes[..48]]);
        let summary = extractor.finish().unwrap();
        assert!(summary.truncated);
        assert_eq!(summary.payload_delivered, 4);
        assert_eq!(extractor.duration(), format.duration_of(4));
    }

    #[test]
    fn test_reset() {
        let format = ContainerFormat::pcm(1, 44100, 16);
        let bytes = wav(format, &[1, 2]);

        let mut extractor = ContainerExtractor::new();
        run(&mut extractor, &[&bytes]);
        extractor.reset();
        assert_eq!(extractor.state(), &ExtractorState::AwaitingContainerStart);
        assert_eq!(extractor.position(), 0);

        let (_, out) = run(&mut extractor, &[&bytes]);
        assert_eq!(out, vec![1, 2]);
    }
}
