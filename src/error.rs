//! Error types for the audio relay
//!
//! Every pipeline component reports its own tagged error so that callers can
//! tell a transient condition (timeout, rate limit, overflow) from a protocol
//! rejection or a link failure. [`SessionError`] adds the stage and byte
//! offset at which a whole session gave up.

use std::fmt;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::audio::pool::Block;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Container error: {0}")]
    Container(#[from] ContainerError),

    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    #[error("Chunked framing error: {0}")]
    Chunked(#[from] ChunkedError),

    #[error("Ingestion failed: {0}")]
    Ingest(#[from] IngestFailure),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Control error: {0}")]
    Control(#[from] ControlError),

    #[error("Record encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Task error: {0}")]
    Task(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Ring transport wait failures
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// Deadline elapsed before any byte (or any free slot) became available
    #[error("timed out waiting on transport")]
    Timeout,

    /// The transport was cleared while the caller was waiting
    #[error("transport cleared while waiting")]
    Cleared,
}

/// Block pool errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("no free block after {waited:?}")]
    Timeout { waited: Duration },

    /// The block does not belong to this pool, or is already free.
    /// The block is handed back so the caller can return it to its owner.
    #[error("invalid block (pool {}, slot {})", .block.pool_id(), .block.slot())]
    InvalidBlock { block: Box<Block> },
}

/// Container (RIFF/WAVE) parsing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContainerError {
    #[error("malformed container at byte {offset}: {reason}")]
    Malformed { offset: u64, reason: &'static str },

    #[error("unsupported format at byte {offset}: {detail}")]
    UnsupportedFormat { offset: u64, detail: String },

    #[error("input ended after {received} bytes without a data chunk")]
    Incomplete { received: u64 },
}

impl ContainerError {
    /// Stream offset the error refers to
    pub fn offset(&self) -> u64 {
        match self {
            Self::Malformed { offset, .. } | Self::UnsupportedFormat { offset, .. } => *offset,
            Self::Incomplete { received } => *received,
        }
    }
}

/// HTTP response head errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("malformed status line: {line:?}")]
    MalformedStatusLine { line: String },

    #[error("server returned status {code}")]
    Status { code: u16 },

    #[error("response head exceeds {limit} bytes")]
    HeadersTooLarge { limit: usize },

    #[error("malformed header line: {line:?}")]
    MalformedHeader { line: String },

    #[error("connection closed after {received} bytes, before the end of the response head")]
    IncompleteHead { received: u64 },
}

/// Chunked transfer framing errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkedError {
    #[error("invalid chunk size line at body byte {offset}")]
    InvalidSize { offset: u64 },

    #[error("missing CRLF at body byte {offset}")]
    MissingCrlf { offset: u64 },

    #[error("chunk framing line too long at body byte {offset}")]
    LineTooLong { offset: u64 },
}

/// Why an ingestion session ended in `Failed`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestFailure {
    #[error("no bytes for {waited:?} (after {received} bytes)")]
    Timeout { waited: Duration, received: u64 },

    #[error("connection reset after {received} bytes")]
    ConnectionReset { received: u64 },

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed after {received} bytes: {reason}")]
    Receive { received: u64, reason: String },

    #[error(transparent)]
    Http(#[from] HttpError),

    #[error(transparent)]
    Chunked(#[from] ChunkedError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("payload consumer went away after {received} bytes")]
    SinkClosed { received: u64 },

    #[error("cancelled after {received} bytes")]
    Cancelled { received: u64 },
}

/// Errors raised by a body/payload consumer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("stream cancelled")]
    Cancelled,

    #[error("consumer closed")]
    Closed,
}

impl SinkError {
    /// Convert into an ingestion failure, tagging the socket byte count
    pub fn into_failure(self, received: u64) -> IngestFailure {
        match self {
            Self::Container(e) => IngestFailure::Container(e),
            Self::Cancelled => IngestFailure::Cancelled { received },
            Self::Closed => IngestFailure::SinkClosed { received },
        }
    }
}

/// Radio link errors reported by the host stack
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// Link transmit buffers are full
    #[error("link buffer overflow")]
    Overflow,

    /// Peer is connected but nobody listens on the characteristic
    #[error("peer not subscribed")]
    NotConnected,

    #[error("peer disconnected")]
    Disconnected,

    #[error("host stack error {0}")]
    Stack(i32),
}

/// Control channel errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("invalid control record length: {len}")]
    InvalidLength { len: usize },

    #[error("unknown control command: {0:#04x}")]
    UnknownCommand(u8),

    #[error("volume out of range: {0}")]
    VolumeOutOfRange(u8),

    #[error("control queue full")]
    QueueFull,

    #[error("control queue closed")]
    Closed,
}

/// Pipeline stage a session failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Ingestion,
    Extraction,
    Delivery,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Ingestion => "ingestion",
            Stage::Extraction => "extraction",
            Stage::Delivery => "delivery",
        };
        f.write_str(name)
    }
}

/// A failed session, with enough context to tell a producer stall from a
/// parser rejection from a link failure
#[derive(Error, Debug)]
#[error("{stage} failed at byte {offset}: {source}")]
pub struct SessionError {
    pub stage: Stage,
    pub offset: u64,
    #[source]
    pub source: Error,
}

impl SessionError {
    pub fn new(stage: Stage, offset: u64, source: impl Into<Error>) -> Self {
        Self {
            stage,
            offset,
            source: source.into(),
        }
    }

    /// Attribute an ingestion failure to the stage that caused it
    pub fn from_ingest(failure: IngestFailure, received: u64) -> Self {
        match &failure {
            IngestFailure::Container(e) => Self::new(Stage::Extraction, e.offset(), failure),
            _ => Self::new(Stage::Ingestion, received, failure),
        }
    }
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_error_context() {
        let err = SessionError::from_ingest(
            IngestFailure::Container(ContainerError::Malformed {
                offset: 8,
                reason: "missing WAVE tag",
            }),
            120,
        );
        assert_eq!(err.stage, Stage::Extraction);
        assert_eq!(err.offset, 8);
        assert!(err.to_string().starts_with("extraction failed at byte 8"));

        let err = SessionError::from_ingest(IngestFailure::ConnectionReset { received: 0 }, 0);
        assert_eq!(err.stage, Stage::Ingestion);
    }

    #[test]
    fn test_sink_error_into_failure() {
        assert_eq!(
            SinkError::Cancelled.into_failure(42),
            IngestFailure::Cancelled { received: 42 }
        );
        assert_eq!(
            SinkError::Closed.into_failure(7),
            IngestFailure::SinkClosed { received: 7 }
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            HttpError::Status { code: 404 }.to_string(),
            "server returned status 404"
        );
        assert_eq!(
            ControlError::UnknownCommand(0x7f).to_string(),
            "unknown control command: 0x7f"
        );
    }
}
