//! Ingestion state machine
//!
//! Drives one HTTP request/response exchange per [`IngestionSession::run`]:
//! connect, send, parse the response head, then hand every body byte (with
//! chunk framing stripped) to a [`BodySink`] in order.

use serde::Serialize;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::chunked::ChunkedDecoder;
use super::http::{HeadPhase, Request, ResponseHead, ResponseParser, DEFAULT_HEAD_LIMIT};
use crate::config::NetworkConfig;
use crate::error::{IngestFailure, SinkError};

/// Opens the byte stream a request is sent over
pub trait Connector {
    type Stream: Read + Write;

    fn connect(&mut self) -> io::Result<Self::Stream>;

    /// Printable peer description for logs
    fn peer(&self) -> String;
}

/// TCP connector configured through socket2
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
    port: u16,
    connect_timeout: Duration,
    read_timeout: Duration,
    write_timeout: Duration,
    recv_buffer_size: usize,
}

impl TcpConnector {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            connect_timeout: config.connect_timeout(),
            read_timeout: config.poll_interval(),
            write_timeout: config.send_timeout(),
            recv_buffer_size: config.recv_buffer_size,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&mut self) -> io::Result<TcpStream> {
        let addr = (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("cannot resolve {}", self.host)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_recv_buffer_size(self.recv_buffer_size)?;
        socket.set_nodelay(true)?;
        socket.connect_timeout(&SockAddr::from(addr), self.connect_timeout)?;
        socket.set_read_timeout(Some(self.read_timeout))?;
        socket.set_write_timeout(Some(self.write_timeout))?;

        tracing::debug!("Connected to {}", addr);
        Ok(socket.into())
    }

    fn peer(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Consumer of decoded body bytes
pub trait BodySink {
    /// Accept the next run of body bytes, in order
    fn accept(&mut self, body: &[u8]) -> Result<(), SinkError>;

    /// The body ended cleanly
    fn finish(&mut self) -> Result<(), SinkError>;

    /// The exchange failed; drop anything partial
    fn abort(&mut self) {}
}

impl BodySink for Vec<u8> {
    fn accept(&mut self, body: &[u8]) -> Result<(), SinkError> {
        self.extend_from_slice(body);
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Ingestion state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestionState {
    Connecting,
    AwaitingStatusLine,
    AwaitingHeaders,
    StreamingBody { chunked: bool },
    Complete,
    Failed(IngestFailure),
}

/// Ingestion limits
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub idle_timeout: Duration,
    pub head_limit: usize,
    pub read_buffer_size: usize,
    /// Full request attempts when connect or send fails
    pub attempts: u32,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(5),
            head_limit: DEFAULT_HEAD_LIMIT,
            read_buffer_size: 2048,
            attempts: 2,
        }
    }
}

impl From<&NetworkConfig> for IngestOptions {
    fn from(config: &NetworkConfig) -> Self {
        Self {
            idle_timeout: config.idle_timeout(),
            head_limit: config.head_limit,
            read_buffer_size: config.recv_buffer_size,
            ..Self::default()
        }
    }
}

/// Outcome of a completed exchange
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub session: Uuid,
    pub status: u16,
    pub chunked: bool,
    /// Raw socket bytes
    pub bytes_received: u64,
    /// Body bytes after dechunking
    pub body_bytes: u64,
    pub attempts: u32,
    /// Body ended before its declared length or last chunk
    pub truncated: bool,
    pub elapsed: Duration,
}

/// Per-exchange progress
struct Exchange {
    parser: ResponseParser,
    head: Option<ResponseHead>,
    decoder: Option<ChunkedDecoder>,
    received: u64,
    body_bytes: u64,
}

/// One logical stream's ingestion; owns its connector and socket
pub struct IngestionSession<C: Connector> {
    id: Uuid,
    connector: C,
    request: Request,
    options: IngestOptions,
    cancel: Option<Arc<AtomicBool>>,
    state: IngestionState,
    /// Socket bytes of the last exchange
    received: u64,
}

impl<C: Connector> IngestionSession<C> {
    pub fn new(connector: C, request: Request, options: IngestOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            connector,
            request,
            options,
            cancel: None,
            state: IngestionState::Connecting,
            received: 0,
        }
    }

    /// Poll `flag` between socket reads and stop when it is set
    pub fn with_cancel(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> &IngestionState {
        &self.state
    }

    /// Socket bytes received by the last exchange
    pub fn bytes_received(&self) -> u64 {
        self.received
    }

    /// Perform one request/response exchange, streaming the body into `sink`
    pub fn run(&mut self, sink: &mut dyn BodySink) -> Result<IngestionReport, IngestFailure> {
        let started = Instant::now();
        let span = tracing::info_span!("ingest", session = %self.id);
        let _enter = span.enter();

        let mut exchange = Exchange {
            parser: ResponseParser::with_limit(self.options.head_limit),
            head: None,
            decoder: None,
            received: 0,
            body_bytes: 0,
        };

        let result = self
            .open_with_retry()
            .and_then(|(stream, attempts)| {
                self.transition(IngestionState::AwaitingStatusLine);
                self.receive(stream, sink, &mut exchange).map(|truncated| (attempts, truncated))
            });
        self.received = exchange.received;

        match result {
            Ok((attempts, truncated)) => {
                self.transition(IngestionState::Complete);
                let head = exchange.head.unwrap_or_default();
                let report = IngestionReport {
                    session: self.id,
                    status: head.status,
                    chunked: head.chunked,
                    bytes_received: exchange.received,
                    body_bytes: exchange.body_bytes,
                    attempts,
                    truncated,
                    elapsed: started.elapsed(),
                };
                tracing::info!(
                    body_bytes = report.body_bytes,
                    truncated,
                    "Ingestion complete in {:?}",
                    report.elapsed
                );
                Ok(report)
            }
            Err(failure) => {
                sink.abort();
                tracing::warn!(received = exchange.received, "Ingestion failed: {}", failure);
                self.transition(IngestionState::Failed(failure.clone()));
                Err(failure)
            }
        }
    }

    /// Connect and send the request, retrying the whole request once
    fn open_with_retry(&mut self) -> Result<(C::Stream, u32), IngestFailure> {
        let request = self.request.to_bytes();
        let attempts = self.options.attempts.max(1);
        let mut last_failure = IngestFailure::Connect("no attempt made".to_string());

        for attempt in 1..=attempts {
            self.transition(IngestionState::Connecting);
            tracing::debug!(attempt, "{} {} to {}", self.request.method(), self.request.path(), self.connector.peer());

            let mut stream = match self.connector.connect() {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(attempt, "Connect to {} failed: {}", self.connector.peer(), e);
                    last_failure = IngestFailure::Connect(e.to_string());
                    continue;
                }
            };

            match stream.write_all(&request).and_then(|_| stream.flush()) {
                Ok(()) => return Ok((stream, attempt)),
                Err(e) => {
                    tracing::warn!(attempt, "Sending request failed: {}", e);
                    last_failure = IngestFailure::Send(e.to_string());
                }
            }
        }

        Err(last_failure)
    }

    /// Read until the body ends. Returns whether the body was truncated.
    fn receive(
        &mut self,
        mut stream: C::Stream,
        sink: &mut dyn BodySink,
        exchange: &mut Exchange,
    ) -> Result<bool, IngestFailure> {
        let mut buf = vec![0u8; self.options.read_buffer_size.max(1)];
        let mut last_data = Instant::now();

        loop {
            if self.is_cancelled() {
                return Err(IngestFailure::Cancelled {
                    received: exchange.received,
                });
            }

            let n = match stream.read(&mut buf) {
                Ok(0) => return self.on_close(sink, exchange),
                Ok(n) => n,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    let waited = last_data.elapsed();
                    if waited >= self.options.idle_timeout {
                        return Err(IngestFailure::Timeout {
                            waited,
                            received: exchange.received,
                        });
                    }
                    continue;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        ErrorKind::ConnectionReset
                            | ErrorKind::ConnectionAborted
                            | ErrorKind::BrokenPipe
                            | ErrorKind::UnexpectedEof
                    ) =>
                {
                    return Err(IngestFailure::ConnectionReset {
                        received: exchange.received,
                    });
                }
                Err(e) => {
                    return Err(IngestFailure::Receive {
                        received: exchange.received,
                        reason: e.to_string(),
                    });
                }
            };

            last_data = Instant::now();
            exchange.received += n as u64;

            if self.on_bytes(&buf[..n], sink, exchange)? {
                // Body fully framed; do not wait for the close
                sink.finish().map_err(|e| e.into_failure(exchange.received))?;
                return Ok(false);
            }
        }
    }

    /// Returns true once the body is known to be complete
    fn on_bytes(
        &mut self,
        input: &[u8],
        sink: &mut dyn BodySink,
        exchange: &mut Exchange,
    ) -> Result<bool, IngestFailure> {
        let body = if exchange.head.is_some() {
            input
        } else {
            match exchange.parser.feed(input)? {
                Some((head, body_start)) => {
                    if head.chunked {
                        exchange.decoder = Some(ChunkedDecoder::new());
                    }
                    self.transition(IngestionState::StreamingBody { chunked: head.chunked });
                    exchange.head = Some(head);
                    &input[body_start..]
                }
                None => {
                    if exchange.parser.phase() == HeadPhase::Headers
                        && self.state == IngestionState::AwaitingStatusLine
                    {
                        self.transition(IngestionState::AwaitingHeaders);
                    }
                    return Ok(false);
                }
            }
        };

        if body.is_empty() {
            return Ok(false);
        }

        let received = exchange.received;
        match exchange.decoder.as_mut() {
            Some(decoder) => {
                let mut decoded = 0u64;
                decoder.feed(body, |data: &[u8]| -> Result<(), IngestFailure> {
                    decoded += data.len() as u64;
                    sink.accept(data).map_err(|e| e.into_failure(received))
                })?;
                exchange.body_bytes += decoded;
                Ok(decoder.is_done())
            }
            None => {
                let content_length = exchange.head.as_ref().and_then(|h| h.content_length);
                let body = match content_length {
                    Some(len) => {
                        let left = len.saturating_sub(exchange.body_bytes);
                        &body[..body.len().min(left as usize)]
                    }
                    None => body,
                };
                sink.accept(body).map_err(|e| e.into_failure(received))?;
                exchange.body_bytes += body.len() as u64;
                Ok(content_length.map_or(false, |len| exchange.body_bytes >= len))
            }
        }
    }

    /// Peer closed the connection cleanly
    fn on_close(&mut self, sink: &mut dyn BodySink, exchange: &mut Exchange) -> Result<bool, IngestFailure> {
        let Some(head) = exchange.head.as_ref() else {
            return Err(if exchange.received == 0 {
                IngestFailure::ConnectionReset { received: 0 }
            } else {
                crate::error::HttpError::IncompleteHead {
                    received: exchange.received,
                }
                .into()
            });
        };

        let truncated = match (&exchange.decoder, head.content_length) {
            (Some(decoder), _) => !decoder.is_done(),
            (None, Some(len)) => exchange.body_bytes < len,
            (None, None) => false,
        };
        if truncated {
            tracing::warn!(body_bytes = exchange.body_bytes, "Connection closed before the end of the body");
        }

        sink.finish().map_err(|e| e.into_failure(exchange.received))?;
        Ok(truncated)
    }

    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .map_or(false, |flag| flag.load(Ordering::Acquire))
    }

    fn transition(&mut self, next: IngestionState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "Ingestion state");
            self.state = next;
        }
    }
}
