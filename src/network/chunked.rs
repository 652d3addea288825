//! Chunked transfer-encoding decoder
//!
//! Strips chunk-size lines, chunk CRLFs and trailers from a body that may
//! arrive in fragments of any size. Decoded data is handed to a callback as
//! borrowed slices of the input, so no payload byte is copied here.

use crate::error::ChunkedError;

/// Longest size or trailer line accepted
const MAX_LINE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Reading a hex size line (extensions after ';' are ignored)
    Size,
    Data { remaining: u64 },
    DataCr,
    DataLf,
    /// Reading trailer lines after the last chunk
    Trailer,
    Done,
}

/// Incremental chunked body decoder
pub struct ChunkedDecoder {
    state: ChunkState,
    line: Vec<u8>,
    /// Raw body bytes consumed
    offset: u64,
    /// Decoded bytes emitted
    decoded: u64,
    chunks: u64,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        Self {
            state: ChunkState::Size,
            line: Vec::with_capacity(16),
            offset: 0,
            decoded: 0,
            chunks: 0,
        }
    }

    /// The terminating zero-size chunk and trailers have been read
    pub fn is_done(&self) -> bool {
        self.state == ChunkState::Done
    }

    /// Decoded body bytes emitted so far
    pub fn decoded(&self) -> u64 {
        self.decoded
    }

    /// Data chunks seen so far
    pub fn chunks(&self) -> u64 {
        self.chunks
    }

    /// Decode `input`, passing every run of chunk data to `emit`.
    ///
    /// Returns the number of input bytes consumed, which is less than
    /// `input.len()` only when the body ended inside this fragment.
    pub fn feed<E, F>(&mut self, input: &[u8], mut emit: F) -> Result<usize, E>
    where
        E: From<ChunkedError>,
        F: FnMut(&[u8]) -> Result<(), E>,
    {
        let mut pos = 0;

        while pos < input.len() {
            match self.state {
                ChunkState::Size | ChunkState::Trailer => {
                    let Some(line_len) = self.take_line(&input[pos..])? else {
                        pos = input.len();
                        break;
                    };
                    pos += line_len;

                    if self.state == ChunkState::Size {
                        let size = self.parse_size()?;
                        self.line.clear();
                        if size == 0 {
                            tracing::trace!(chunks = self.chunks, "Last chunk");
                            self.state = ChunkState::Trailer;
                        } else {
                            self.chunks += 1;
                            self.state = ChunkState::Data { remaining: size };
                        }
                    } else {
                        let blank = self.line.is_empty();
                        self.line.clear();
                        if blank {
                            self.state = ChunkState::Done;
                            tracing::debug!(decoded = self.decoded, chunks = self.chunks, "Chunked body complete");
                            return Ok(pos);
                        }
                    }
                }

                ChunkState::Data { remaining } => {
                    let take = remaining.min((input.len() - pos) as u64) as usize;
                    emit(&input[pos..pos + take])?;
                    pos += take;
                    self.offset += take as u64;
                    self.decoded += take as u64;

                    let remaining = remaining - take as u64;
                    self.state = if remaining == 0 {
                        ChunkState::DataCr
                    } else {
                        ChunkState::Data { remaining }
                    };
                }

                ChunkState::DataCr => {
                    self.state = match input[pos] {
                        b'\r' => ChunkState::DataLf,
                        // Tolerate a bare LF
                        b'\n' => ChunkState::Size,
                        _ => return Err(ChunkedError::MissingCrlf { offset: self.offset }.into()),
                    };
                    pos += 1;
                    self.offset += 1;
                }

                ChunkState::DataLf => {
                    if input[pos] != b'\n' {
                        return Err(ChunkedError::MissingCrlf { offset: self.offset }.into());
                    }
                    self.state = ChunkState::Size;
                    pos += 1;
                    self.offset += 1;
                }

                ChunkState::Done => return Ok(pos),
            }
        }

        Ok(pos)
    }

    /// Accumulate a line. Returns the input bytes consumed once the line
    /// (without its terminator) sits complete in `self.line`.
    fn take_line(&mut self, input: &[u8]) -> Result<Option<usize>, ChunkedError> {
        let newline = input.iter().position(|&b| b == b'\n');
        let end = newline.unwrap_or(input.len());

        if self.line.len() + end > MAX_LINE_LEN {
            return Err(ChunkedError::LineTooLong { offset: self.offset });
        }
        self.line.extend_from_slice(&input[..end]);

        match newline {
            Some(n) => {
                if self.line.last() == Some(&b'\r') {
                    self.line.pop();
                }
                self.offset += (n + 1) as u64;
                Ok(Some(n + 1))
            }
            None => {
                self.offset += end as u64;
                Ok(None)
            }
        }
    }

    fn parse_size(&self) -> Result<u64, ChunkedError> {
        let invalid = ChunkedError::InvalidSize { offset: self.offset };

        let digits = match self.line.iter().position(|&b| b == b';') {
            Some(ext) => &self.line[..ext],
            None => &self.line[..],
        };
        let digits = std::str::from_utf8(digits).map_err(|_| invalid.clone())?.trim();
        if digits.is_empty() {
            return Err(invalid);
        }
        u64::from_str_radix(digits, 16).map_err(|_| invalid)
    }
}

impl Default for ChunkedDecoder {
    fn default() -> Self {
        Self::new()
    }
}
