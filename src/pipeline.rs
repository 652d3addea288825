//! Session wiring
//!
//! One [`StreamSession`] owns one ring transport and two threads:
//!
//! ```text
//! socket ─▶ IngestionSession ─▶ ContainerRouter ─▶ RingSink ─▶ RingTransport
//!                                      │                              │
//!                              AudioService (format)          DeliveryScheduler ─▶ RadioLink
//! ```
//!
//! With [`HandOff::Blocks`] the router feeds a [`BlockSink`] instead, and a
//! third thread runs [`forward_blocks`] to move pool blocks into the ring.
//!
//! The threads share nothing but the ring and a pair of [`StreamSignals`]
//! flags. Whichever side fails first cancels the other.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::audio::buffer::{create_shared_transport, SharedTransport, TransportStats};
use crate::audio::pool::{Block, BlockFlags, BlockPool, PoolStats};
use crate::codec::{ContainerExtractor, ContainerFormat, ExtractionSummary};
use crate::config::{AppConfig, HandOff};
use crate::constants::STREAM_CHUNK_SIZE;
use crate::error::{Error, IngestFailure, PoolError, SessionError, SinkError, Stage, TransportError};
use crate::gatt::{AudioService, Clock, DeliveryPolicy, DeliveryReport, DeliveryScheduler, RadioLink, ServiceEndpoint};
use crate::network::{BodySink, Connector, IngestOptions, IngestionReport, IngestionSession, Request};

/// Flags shared by the two tasks of a session
#[derive(Debug, Clone, Default)]
pub struct StreamSignals {
    cancel: Arc<AtomicBool>,
    producer_done: Arc<AtomicBool>,
}

impl StreamSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// The flag the ingestion task polls between socket reads
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// No more payload will be written
    pub fn mark_producer_done(&self) {
        self.producer_done.store(true, Ordering::SeqCst);
    }

    pub fn producer_done(&self) -> bool {
        self.producer_done.load(Ordering::SeqCst)
    }
}

/// Consumer of classified payload bytes
pub trait PayloadSink {
    /// Take all of `payload`, waiting for room as needed
    fn write_payload(&mut self, payload: &[u8]) -> Result<(), SinkError>;

    /// The payload is complete
    fn end_of_stream(&mut self) -> Result<(), SinkError>;

    /// The stream failed; release anything held
    fn abort(&mut self) {}
}

/// Writes payload into the ring transport
pub struct RingSink {
    ring: SharedTransport,
    signals: StreamSignals,
    write_deadline: Duration,
    written: u64,
    stalls: u64,
}

impl RingSink {
    pub fn new(ring: SharedTransport, signals: StreamSignals, write_deadline: Duration) -> Self {
        Self {
            ring,
            signals,
            write_deadline,
            written: 0,
            stalls: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Write deadlines that passed with the ring still full
    pub fn stalls(&self) -> u64 {
        self.stalls
    }
}

impl PayloadSink for RingSink {
    fn write_payload(&mut self, payload: &[u8]) -> Result<(), SinkError> {
        let mut rest = payload;
        while !rest.is_empty() {
            if self.signals.is_cancelled() {
                return Err(SinkError::Cancelled);
            }

            match self.ring.write_blocking(rest, Instant::now() + self.write_deadline) {
                Ok(n) => {
                    rest = &rest[n..];
                    self.written += n as u64;
                }
                Err(TransportError::Timeout) => {
                    // Consumer may catch up; only cancellation ends the wait
                    self.stalls += 1;
                    tracing::debug!(pending = rest.len(), "Ring full past deadline");
                }
                Err(TransportError::Cleared) => return Err(SinkError::Cancelled),
            }
        }
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<(), SinkError> {
        tracing::debug!(written = self.written, "Payload complete");
        self.signals.mark_producer_done();
        Ok(())
    }

    fn abort(&mut self) {
        self.signals.mark_producer_done();
    }
}

/// Packs payload into pool blocks and hands full blocks to a consumer.
/// The consumer returns every block it receives to the pool and marks the
/// producer done once it has seen the END_OF_STREAM block.
pub struct BlockSink {
    pool: Arc<BlockPool>,
    tx: Sender<Block>,
    signals: StreamSignals,
    acquire_timeout: Duration,
    current: Option<Block>,
    blocks_sent: u64,
}

impl BlockSink {
    pub fn new(pool: Arc<BlockPool>, tx: Sender<Block>, signals: StreamSignals, acquire_timeout: Duration) -> Self {
        Self {
            pool,
            tx,
            signals,
            acquire_timeout,
            current: None,
            blocks_sent: 0,
        }
    }

    pub fn blocks_sent(&self) -> u64 {
        self.blocks_sent
    }

    fn next_block(&mut self) -> Result<Block, SinkError> {
        if let Some(block) = self.current.take() {
            return Ok(block);
        }
        loop {
            if self.signals.is_cancelled() {
                return Err(SinkError::Cancelled);
            }
            match self.pool.acquire(Instant::now() + self.acquire_timeout) {
                Ok(block) => return Ok(block),
                Err(PoolError::Timeout { waited }) => {
                    tracing::debug!(?waited, "No free block yet");
                }
                Err(e) => {
                    tracing::error!("Block acquire failed: {}", e);
                    return Err(SinkError::Closed);
                }
            }
        }
    }

    fn send(&mut self, block: Block) -> Result<(), SinkError> {
        match self.tx.send(block) {
            Ok(()) => {
                self.blocks_sent += 1;
                Ok(())
            }
            Err(err) => {
                self.give_back(err.into_inner());
                if self.signals.is_cancelled() {
                    Err(SinkError::Cancelled)
                } else {
                    Err(SinkError::Closed)
                }
            }
        }
    }

    fn give_back(&self, block: Block) {
        if let Err(e) = self.pool.release(block) {
            tracing::error!("Failed to return block: {}", e);
        }
    }
}

impl PayloadSink for BlockSink {
    fn write_payload(&mut self, payload: &[u8]) -> Result<(), SinkError> {
        let mut rest = payload;
        while !rest.is_empty() {
            let mut block = self.next_block()?;
            let n = block.write(rest);
            rest = &rest[n..];
            if block.is_full() {
                self.send(block)?;
            } else {
                self.current = Some(block);
            }
        }
        Ok(())
    }

    fn end_of_stream(&mut self) -> Result<(), SinkError> {
        let mut block = self.next_block()?;
        block.insert_flags(BlockFlags::END_OF_STREAM);
        self.send(block)?;
        tracing::debug!(blocks = self.blocks_sent, "Payload complete");
        Ok(())
    }

    fn abort(&mut self) {
        if let Some(block) = self.current.take() {
            self.give_back(block);
        }
    }
}

impl Drop for BlockSink {
    fn drop(&mut self) {
        if let Some(block) = self.current.take() {
            self.give_back(block);
        }
    }
}

/// Drain blocks from a [`BlockSink`] into the ring until END_OF_STREAM,
/// cancellation, or the sender going away. Every block received goes back
/// to `pool`, including the ones still queued when the loop stops.
/// Returns the number of blocks forwarded.
pub fn forward_blocks(
    rx: Receiver<Block>,
    pool: &BlockPool,
    ring: SharedTransport,
    signals: StreamSignals,
    write_deadline: Duration,
) -> Result<u64, SinkError> {
    let mut sink = RingSink::new(ring, signals.clone(), write_deadline);
    let mut forwarded = 0u64;

    let result = loop {
        if signals.is_cancelled() {
            break Err(SinkError::Cancelled);
        }
        let block = match rx.recv_timeout(write_deadline) {
            Ok(block) => block,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::debug!(forwarded, "Block producer went away");
                break Err(SinkError::Closed);
            }
        };

        let last = block.flags().contains(BlockFlags::END_OF_STREAM);
        let written = sink.write_payload(block.as_slice());
        if let Err(e) = pool.release(block) {
            tracing::error!("Failed to return block: {}", e);
        }
        if let Err(e) = written {
            break Err(e);
        }
        forwarded += 1;

        if last {
            break sink.end_of_stream().map(|()| forwarded);
        }
    };

    if result.is_err() {
        sink.abort();
        for block in rx.try_iter() {
            if let Err(e) = pool.release(block) {
                tracing::error!("Failed to return block: {}", e);
            }
        }
    }
    result
}

/// Body sink that runs the container extractor and forwards payload
pub struct ContainerRouter<S: PayloadSink> {
    extractor: ContainerExtractor,
    sink: S,
    service: Option<AudioService>,
    summary: Option<ExtractionSummary>,
}

impl<S: PayloadSink> ContainerRouter<S> {
    pub fn new(sink: S) -> Self {
        Self {
            extractor: ContainerExtractor::new(),
            sink,
            service: None,
            summary: None,
        }
    }

    /// Publish the parsed format on the service info channel
    pub fn with_service(mut self, service: AudioService) -> Self {
        self.service = Some(service);
        self
    }

    pub fn format(&self) -> Option<&ContainerFormat> {
        self.extractor.format()
    }

    pub fn extractor(&self) -> &ContainerExtractor {
        &self.extractor
    }

    /// Set once the body ended cleanly
    pub fn summary(&self) -> Option<&ExtractionSummary> {
        self.summary.as_ref()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}

impl<S: PayloadSink> BodySink for ContainerRouter<S> {
    fn accept(&mut self, body: &[u8]) -> Result<(), SinkError> {
        let extracted = self.extractor.push(body)?;

        if let Some(format) = extracted.format {
            if let Some(service) = &self.service {
                service.set_format(format);
            }
        }
        if !extracted.payload.is_empty() {
            self.sink.write_payload(&body[extracted.payload])?;
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        let summary = self.extractor.finish()?;
        self.sink.end_of_stream()?;
        self.summary = Some(summary);
        Ok(())
    }

    fn abort(&mut self) {
        self.sink.abort();
    }
}

/// Statistics of a finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub session: Uuid,
    /// Absent when the session was cancelled before the body ended
    pub ingestion: Option<IngestionReport>,
    pub extraction: Option<ExtractionSummary>,
    pub delivery: Option<DeliveryReport>,
    pub transport: TransportStats,
    /// Set in block hand-off mode
    pub pool: Option<PoolStats>,
}

struct IngestOutcome {
    report: IngestionReport,
    extraction: Option<ExtractionSummary>,
}

type IngestResult = Result<IngestOutcome, SessionError>;
type DeliveryResult = Result<DeliveryReport, SessionError>;

/// Pool and forwarding thread of a block hand-off session
struct BlockStage {
    pool: Arc<BlockPool>,
    forward: JoinHandle<Result<u64, SinkError>>,
}

/// Cancels the session when the thread holding it unwinds
struct PanicTeardown {
    ring: SharedTransport,
    signals: StreamSignals,
}

impl Drop for PanicTeardown {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("{} panicked, cancelling session", thread::current().name().unwrap_or("session thread"));
            self.signals.cancel();
            self.ring.clear();
        }
    }
}

/// A running stream: ingestion and delivery threads over one ring
pub struct StreamSession {
    id: Uuid,
    ring: SharedTransport,
    signals: StreamSignals,
    ingest: JoinHandle<IngestResult>,
    blocks: Option<BlockStage>,
    deliver: JoinHandle<DeliveryResult>,
}

impl StreamSession {
    /// Start the session threads. `service`/`endpoint` are the two halves of the
    /// audio service the link stack reports into.
    pub fn start<C, L, K>(
        config: &AppConfig,
        connector: C,
        link: L,
        clock: K,
        service: AudioService,
        endpoint: ServiceEndpoint,
    ) -> crate::Result<Self>
    where
        C: Connector + Send + 'static,
        L: RadioLink + Send + 'static,
        K: Clock + Send + 'static,
    {
        config.validate()?;

        let id = Uuid::new_v4();
        let ring = create_shared_transport(config.transport.ring_capacity);
        let signals = StreamSignals::new();

        let request = Request::stream(
            &config.network.host,
            config.network.port,
            STREAM_CHUNK_SIZE,
            config.network.track.as_deref(),
        );
        let options = IngestOptions::from(&config.network);
        let write_deadline = config.transport.write_deadline();
        let policy = DeliveryPolicy::from(&config.delivery);

        tracing::info!(session = %id, peer = %connector.peer(), hand_off = ?config.transport.hand_off, "Starting stream session");

        let teardown = || PanicTeardown {
            ring: ring.clone(),
            signals: signals.clone(),
        };

        let (ingest, blocks) = match config.transport.hand_off {
            HandOff::Ring => {
                let ingest_ring = ring.clone();
                let ingest_signals = signals.clone();
                let guard = teardown();
                let ingest = thread::Builder::new()
                    .name("relay-ingest".to_string())
                    .spawn(move || {
                        let _guard = guard;
                        let sink = RingSink::new(ingest_ring.clone(), ingest_signals.clone(), write_deadline);
                        let router = ContainerRouter::new(sink).with_service(service);
                        ingest_task(connector, request, options, router, &ingest_ring, &ingest_signals)
                    })?;
                (ingest, None)
            }
            HandOff::Blocks => {
                let pool = Arc::new(BlockPool::new(config.transport.block_count, config.transport.block_size));
                let (tx, rx) = bounded(config.transport.block_count);

                let forward_pool = pool.clone();
                let forward_ring = ring.clone();
                let forward_signals = signals.clone();
                let guard = teardown();
                let forward = thread::Builder::new()
                    .name("relay-blocks".to_string())
                    .spawn(move || {
                        let _guard = guard;
                        forward_blocks(rx, &forward_pool, forward_ring, forward_signals, write_deadline)
                    })?;

                let ingest_ring = ring.clone();
                let ingest_signals = signals.clone();
                let ingest_pool = pool.clone();
                let guard = teardown();
                let spawned = thread::Builder::new()
                    .name("relay-ingest".to_string())
                    .spawn(move || {
                        let _guard = guard;
                        let sink = BlockSink::new(ingest_pool, tx, ingest_signals.clone(), write_deadline);
                        let router = ContainerRouter::new(sink).with_service(service);
                        ingest_task(connector, request, options, router, &ingest_ring, &ingest_signals)
                    });
                let ingest = match spawned {
                    Ok(handle) => handle,
                    Err(e) => {
                        signals.cancel();
                        ring.clear();
                        return Err(e.into());
                    }
                };
                (ingest, Some(BlockStage { pool, forward }))
            }
        };

        let delivery_ring = ring.clone();
        let delivery_signals = signals.clone();
        let guard = teardown();
        let spawned = thread::Builder::new()
            .name("relay-deliver".to_string())
            .spawn(move || {
                let _guard = guard;
                let mut scheduler = DeliveryScheduler::new(link, clock, policy);
                let result = scheduler.run(&delivery_ring, &endpoint, &delivery_signals);
                // Ingestion has nobody left to write for
                delivery_signals.cancel();
                result
            });
        let deliver = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                signals.cancel();
                ring.clear();
                return Err(e.into());
            }
        };

        Ok(Self {
            id,
            ring,
            signals,
            ingest,
            blocks,
            deliver,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn signals(&self) -> &StreamSignals {
        &self.signals
    }

    pub fn ring(&self) -> &SharedTransport {
        &self.ring
    }

    /// Stop every thread; blocked waits on the ring return at once
    pub fn cancel(&self) {
        self.cancel_handle().cancel();
    }

    /// Handle that can cancel the session after it moved into `join`
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            session: self.id,
            ring: self.ring.clone(),
            signals: self.signals.clone(),
        }
    }

    pub fn is_finished(&self) -> bool {
        let forwarded = self.blocks.as_ref().map_or(true, |b| b.forward.is_finished());
        self.ingest.is_finished() && forwarded && self.deliver.is_finished()
    }

    /// Block pool counters, in block hand-off mode
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.blocks.as_ref().map(|b| b.pool.stats())
    }

    /// Wait for every thread. A delivery failure takes precedence over the
    /// cancellation it causes on the ingestion side.
    pub fn join(self) -> Result<SessionReport, SessionError> {
        let Self {
            id,
            ring,
            signals,
            ingest,
            blocks,
            deliver,
        } = self;
        let tear_down = || {
            signals.cancel();
            ring.clear();
        };

        let ingest = ingest.join().unwrap_or_else(|_| {
            tear_down();
            Err(SessionError::new(Stage::Ingestion, 0, Error::Task("ingestion thread panicked".into())))
        });

        let mut forwarding = Ok(());
        let pool = match blocks {
            Some(BlockStage { pool, forward }) => {
                match forward.join() {
                    Ok(Ok(blocks)) => tracing::debug!(session = %id, blocks, "Block forwarding finished"),
                    Ok(Err(e)) => tracing::debug!(session = %id, "Block forwarding stopped: {}", e),
                    Err(_) => {
                        tear_down();
                        forwarding = Err(SessionError::new(
                            Stage::Delivery,
                            0,
                            Error::Task("block forwarding thread panicked".into()),
                        ));
                    }
                }
                Some(pool.stats())
            }
            None => None,
        };

        let deliver = deliver.join().unwrap_or_else(|_| {
            tear_down();
            Err(SessionError::new(Stage::Delivery, 0, Error::Task("delivery thread panicked".into())))
        });

        let delivery = deliver?;
        forwarding?;
        let (ingestion, extraction) = match ingest {
            Ok(outcome) => (Some(outcome.report), outcome.extraction),
            Err(e) if is_cancellation(&e) => {
                tracing::info!(session = %id, "Ingestion stopped by cancellation");
                (None, None)
            }
            Err(e) => return Err(e),
        };

        let report = SessionReport {
            session: id,
            ingestion,
            extraction,
            delivery: Some(delivery),
            transport: ring.stats(),
            pool,
        };
        tracing::info!(session = %id, end = ?report.delivery.as_ref().map(|d| d.end), "Stream session finished");
        Ok(report)
    }
}

/// Cancels a running [`StreamSession`] from another thread
#[derive(Clone)]
pub struct CancelHandle {
    session: Uuid,
    ring: SharedTransport,
    signals: StreamSignals,
}

impl CancelHandle {
    pub fn cancel(&self) {
        tracing::info!(session = %self.session, "Cancelling stream session");
        self.signals.cancel();
        self.ring.clear();
    }
}

fn ingest_task<C, S>(
    connector: C,
    request: Request,
    options: IngestOptions,
    mut router: ContainerRouter<S>,
    ring: &SharedTransport,
    signals: &StreamSignals,
) -> IngestResult
where
    C: Connector,
    S: PayloadSink,
{
    let mut session = IngestionSession::new(connector, request, options).with_cancel(signals.cancel_flag());

    match session.run(&mut router) {
        Ok(report) => Ok(IngestOutcome {
            report,
            extraction: router.summary().cloned(),
        }),
        Err(failure) => {
            signals.mark_producer_done();
            let cancelled = matches!(failure, IngestFailure::Cancelled { .. });
            if !cancelled {
                tracing::error!("Ingestion failed: {}", failure);
                // Tear the session down before reporting
                signals.cancel();
                ring.clear();
            }
            Err(SessionError::from_ingest(failure, session.bytes_received()))
        }
    }
}

fn is_cancellation(error: &SessionError) -> bool {
    matches!(error.source, Error::Ingest(IngestFailure::Cancelled { .. }))
}
