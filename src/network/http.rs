//! Minimal HTTP/1.1 client framing
//!
//! Builds the request text and parses a response head incrementally. The
//! parser buffers only the head; the first body byte is reported as an
//! offset into the fragment that completed the head.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;

use crate::error::HttpError;

/// Default limit for status line plus headers
pub const DEFAULT_HEAD_LIMIT: usize = 8 * 1024;

/// Parser phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadPhase {
    StatusLine,
    Headers,
    Done,
}

/// Parsed status line and headers
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    /// `Transfer-Encoding: chunked` was present
    pub chunked: bool,
    pub content_length: Option<u64>,
}

impl ResponseHead {
    /// First header with the given name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Incremental response head parser
pub struct ResponseParser {
    buffer: BytesMut,
    phase: HeadPhase,
    limit: usize,
    /// Head bytes already split off as complete lines
    consumed: usize,
    head: ResponseHead,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_HEAD_LIMIT)
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(512),
            phase: HeadPhase::StatusLine,
            limit,
            consumed: 0,
            head: ResponseHead::default(),
        }
    }

    pub fn phase(&self) -> HeadPhase {
        self.phase
    }

    /// Bytes of head seen so far
    pub fn head_bytes(&self) -> usize {
        self.consumed + self.buffer.len()
    }

    /// Feed the next fragment.
    ///
    /// Returns the head and the offset in `input` where the body begins
    /// once the blank line terminating the headers has arrived.
    pub fn feed(&mut self, input: &[u8]) -> Result<Option<(ResponseHead, usize)>, HttpError> {
        if self.phase == HeadPhase::Done {
            return Ok(None);
        }

        self.buffer.extend_from_slice(input);

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let line = self.buffer.split_to(newline + 1);
            self.consumed += line.len();
            if self.consumed > self.limit {
                return Err(HttpError::HeadersTooLarge { limit: self.limit });
            }

            let text = String::from_utf8_lossy(trim_line_end(&line)).into_owned();
            match self.phase {
                HeadPhase::StatusLine => {
                    self.parse_status_line(&text)?;
                    self.phase = HeadPhase::Headers;
                }
                _ if text.is_empty() => {
                    self.phase = HeadPhase::Done;
                    // The terminator is in this fragment, so the rest is too
                    let body_start = input.len() - self.buffer.len();
                    self.buffer.clear();

                    let head = std::mem::take(&mut self.head);
                    tracing::debug!(
                        status = head.status,
                        chunked = head.chunked,
                        content_length = ?head.content_length,
                        "Response head complete"
                    );
                    return Ok(Some((head, body_start)));
                }
                _ => self.parse_header(&text)?,
            }
        }

        if self.head_bytes() > self.limit {
            return Err(HttpError::HeadersTooLarge { limit: self.limit });
        }
        Ok(None)
    }

    fn parse_status_line(&mut self, line: &str) -> Result<(), HttpError> {
        let malformed = || HttpError::MalformedStatusLine {
            line: line.to_string(),
        };

        let mut parts = line.splitn(3, ' ');
        let version = parts.next().filter(|v| v.starts_with("HTTP/")).ok_or_else(malformed)?;
        let code = parts
            .next()
            .filter(|c| c.len() == 3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(malformed)?;
        let reason = parts.next().unwrap_or("").trim();

        if !(200..300).contains(&code) {
            tracing::warn!(code, reason, "Server rejected request");
            return Err(HttpError::Status { code });
        }

        self.head.version = version.to_string();
        self.head.status = code;
        self.head.reason = reason.to_string();
        Ok(())
    }

    fn parse_header(&mut self, line: &str) -> Result<(), HttpError> {
        let malformed = || HttpError::MalformedHeader {
            line: line.to_string(),
        };

        let (name, value) = line.split_once(':').ok_or_else(malformed)?;
        let name = name.trim();
        let value = value.trim();
        if name.is_empty() {
            return Err(malformed());
        }

        if name.eq_ignore_ascii_case("transfer-encoding") {
            self.head.chunked = value
                .split(',')
                .any(|coding| coding.trim().eq_ignore_ascii_case("chunked"));
        } else if name.eq_ignore_ascii_case("content-length") {
            self.head.content_length = Some(value.parse().map_err(|_| malformed())?);
        }

        self.head.headers.push((name.to_string(), value.to_string()));
        Ok(())
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// An outgoing request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: &'static str,
    path: String,
    host: String,
    port: u16,
    body: Option<String>,
}

impl Request {
    pub fn get(host: &str, port: u16, path: impl Into<String>) -> Self {
        Self {
            method: "GET",
            path: path.into(),
            host: host.to_string(),
            port,
            body: None,
        }
    }

    pub fn post(host: &str, port: u16, path: impl Into<String>) -> Self {
        Self {
            method: "POST",
            ..Self::get(host, port, path)
        }
    }

    /// Audio stream request for the given notification chunk size
    pub fn stream(host: &str, port: u16, chunk_size: usize, track: Option<&str>) -> Self {
        let mut path = String::from("/audio/stream?");
        if let Some(track) = track {
            let _ = write!(path, "track={}&", track);
        }
        let _ = write!(path, "chunk_size={}", chunk_size);
        Self::get(host, port, path)
    }

    /// Attach a JSON body
    pub fn with_json(mut self, body: &serde_json::Value) -> Self {
        self.body = Some(body.to_string());
        self
    }

    pub fn method(&self) -> &str {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Serialize to wire bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(128 + self.body.as_ref().map_or(0, String::len));
        out.put_slice(format!("{} {} HTTP/1.1\r\n", self.method, self.path).as_bytes());
        out.put_slice(format!("Host: {}:{}\r\n", self.host, self.port).as_bytes());
        if let Some(body) = &self.body {
            out.put_slice(b"Content-Type: application/json\r\n");
            out.put_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
        }
        out.put_slice(b"Connection: close\r\n\r\n");
        if let Some(body) = &self.body {
            out.put_slice(body.as_bytes());
        }
        out.freeze()
    }
}
