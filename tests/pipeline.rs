//! End-to-end pipeline scenarios over a scripted server and a simulated link

use parking_lot::Mutex;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ble_audio_relay::audio::create_shared_transport;
use ble_audio_relay::codec::ContainerFormat;
use ble_audio_relay::config::{AppConfig, HandOff};
use ble_audio_relay::error::{Error, LinkError, Stage};
use ble_audio_relay::gatt::service::CCC_NOTIFY;
use ble_audio_relay::gatt::{AudioService, DeliveryEnd, ManualClock, RadioLink, SimulatedLink, SystemClock};
use ble_audio_relay::network::{Connector, IngestOptions, IngestionSession, Request};
use ble_audio_relay::pipeline::{ContainerRouter, RingSink, StreamSession, StreamSignals};

/// Serves a canned response in fixed-size reads, then closes cleanly
struct CannedServer {
    response: Vec<u8>,
    fragment: usize,
}

struct CannedStream {
    response: Vec<u8>,
    pos: usize,
    fragment: usize,
}

impl Connector for CannedServer {
    type Stream = CannedStream;

    fn connect(&mut self) -> io::Result<CannedStream> {
        Ok(CannedStream {
            response: self.response.clone(),
            pos: 0,
            fragment: self.fragment,
        })
    }

    fn peer(&self) -> String {
        "canned".to_string()
    }
}

impl Read for CannedStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.fragment.min(buf.len()).min(self.response.len() - self.pos);
        buf[..n].copy_from_slice(&self.response[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl Write for CannedStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Link whose host stack blows up on the first notification
struct CrashingLink;

impl RadioLink for CrashingLink {
    fn notify(&mut self, _payload: &[u8]) -> Result<(), LinkError> {
        panic!("host stack crashed");
    }
}

/// Notification sink readable after the link moved into the delivery thread
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn wav(payload: &[u8]) -> Vec<u8> {
    let format = ContainerFormat::pcm(1, 44100, 16);
    let mut bytes = format.canonical_header(payload.len() as u32).to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

fn chunked_response(body: &[u8], chunk: usize) -> Vec<u8> {
    let mut out = b"HTTP/1.1 200 OK\r\nContent-Type: audio/wav\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
    for piece in body.chunks(chunk) {
        out.extend_from_slice(format!("{:x}\r\n", piece.len()).as_bytes());
        out.extend_from_slice(piece);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.delivery.min_interval_ms = 1;
    config.delivery.idle_wait_min_ms = 1;
    config.delivery.idle_wait_max_ms = 5;
    config.delivery.read_deadline_ms = 5;
    config.transport.ring_capacity = 256;
    config.transport.write_deadline_ms = 10;
    config
}

#[test]
fn test_chunked_wav_in_five_byte_fragments() {
    let payload = [1u8, 2, 3, 4, 5, 6, 7, 8];
    let server = CannedServer {
        response: chunked_response(&wav(&payload), 16),
        fragment: 5,
    };

    let ring = create_shared_transport(64);
    let signals = StreamSignals::new();
    let (service, _endpoint) = AudioService::new(&Default::default());
    let sink = RingSink::new(ring.clone(), signals.clone(), Duration::from_millis(10));
    let mut router = ContainerRouter::new(sink).with_service(service.clone());

    let request = Request::stream("127.0.0.1", 8000, 128, None);
    let mut session = IngestionSession::new(server, request, IngestOptions::default());
    let report = session.run(&mut router).unwrap();

    assert!(report.chunked);
    assert_eq!(report.body_bytes, 52);

    let format = service.format().unwrap();
    assert_eq!(format.channel_count, 1);
    assert_eq!(format.sample_rate_hz, 44100);
    assert_eq!(format.bits_per_sample, 16);

    let mut out = [0u8; 64];
    let n = ring.read(&mut out);
    assert_eq!(&out[..n], &payload);
    assert!(signals.producer_done());
}

#[test]
fn test_session_delivers_whole_payload() {
    let payload: Vec<u8> = (0..600u32).map(|i| (i % 251) as u8).collect();
    let server = CannedServer {
        response: chunked_response(&wav(&payload), 100),
        fragment: 37,
    };

    let config = fast_config();
    let (service, endpoint) = AudioService::new(&config.control);
    service.on_connected(Some(247));
    service.on_subscription_changed(CCC_NOTIFY);

    let captured = Captured::default();
    let link = SimulatedLink::new(captured.clone());
    let session = StreamSession::start(&config, server, link, SystemClock, service.clone(), endpoint).unwrap();
    let report = session.join().unwrap();

    let delivery = report.delivery.unwrap();
    assert_eq!(delivery.end, DeliveryEnd::Drained);
    assert_eq!(delivery.stats.bytes_sent, 600);
    assert!(delivery.stats.notifications >= 3);
    assert_eq!(*captured.0.lock(), payload);

    let extraction = report.extraction.unwrap();
    assert_eq!(extraction.payload_delivered, 600);
    assert_eq!(report.ingestion.unwrap().status, 200);
    assert_eq!(service.format().map(|f| f.channel_count), Some(1));
}

#[test]
fn test_session_reports_container_rejection() {
    let mut body = wav(&[0u8; 8]);
    body[8..12].copy_from_slice(b"WAVX");
    let server = CannedServer {
        response: chunked_response(&body, 16),
        fragment: 5,
    };

    let config = fast_config();
    let (service, endpoint) = AudioService::new(&config.control);
    service.on_connected(None);
    service.on_subscription_changed(CCC_NOTIFY);

    let link = SimulatedLink::new(io::sink());
    let session = StreamSession::start(&config, server, link, SystemClock, service, endpoint).unwrap();
    let err = session.join().unwrap_err();

    assert_eq!(err.stage, Stage::Extraction);
    assert_eq!(err.offset, 8);
}

#[test]
fn test_session_reports_link_failure() {
    let payload = vec![7u8; 200];
    let server = CannedServer {
        response: chunked_response(&wav(&payload), 64),
        fragment: 64,
    };

    let config = fast_config();
    let (service, endpoint) = AudioService::new(&config.control);
    service.on_connected(Some(247));
    service.on_subscription_changed(CCC_NOTIFY);

    let mut link = SimulatedLink::new(io::sink());
    link.inject([LinkError::Disconnected]);
    let session = StreamSession::start(&config, server, link, SystemClock, service, endpoint).unwrap();
    let err = session.join().unwrap_err();

    assert_eq!(err.stage, Stage::Delivery);
    assert_eq!(err.offset, 0);
}

#[test]
fn test_session_cancel_while_waiting_for_peer() {
    let server = CannedServer {
        response: chunked_response(&wav(&[3u8; 32]), 16),
        fragment: 16,
    };

    let config = fast_config();
    let (service, endpoint) = AudioService::new(&config.control);

    let link = SimulatedLink::new(io::sink());
    let session = StreamSession::start(&config, server, link, SystemClock, service, endpoint).unwrap();
    std::thread::sleep(Duration::from_millis(30));
    session.cancel();

    let report = session.join().unwrap();
    assert_eq!(report.delivery.map(|d| d.end), Some(DeliveryEnd::Cancelled));
    assert_eq!(report.transport.clears, 1);
}

#[test]
fn test_block_hand_off_delivers_whole_payload() {
    let payload: Vec<u8> = (0..600u32).map(|i| (i % 241) as u8).collect();
    let server = CannedServer {
        response: chunked_response(&wav(&payload), 100),
        fragment: 37,
    };

    let mut config = fast_config();
    config.transport.hand_off = HandOff::Blocks;
    config.transport.block_count = 3;
    config.transport.block_size = 64;
    let (service, endpoint) = AudioService::new(&config.control);
    service.on_connected(Some(247));
    service.on_subscription_changed(CCC_NOTIFY);

    let captured = Captured::default();
    let link = SimulatedLink::new(captured.clone());
    let session = StreamSession::start(&config, server, link, SystemClock, service, endpoint).unwrap();
    let report = session.join().unwrap();

    let delivery = report.delivery.unwrap();
    assert_eq!(delivery.end, DeliveryEnd::Drained);
    assert_eq!(delivery.stats.bytes_sent, 600);
    assert_eq!(*captured.0.lock(), payload);

    // Nine full blocks plus the short one carrying END_OF_STREAM
    let pool = report.pool.unwrap();
    assert_eq!(pool.total, 3);
    assert_eq!(pool.in_use, 0);
    assert_eq!(pool.allocated_total, 10);
    assert_eq!(pool.freed_total, 10);
}

#[test]
fn test_ring_hand_off_reports_no_pool() {
    let server = CannedServer {
        response: chunked_response(&wav(&[9u8; 40]), 16),
        fragment: 16,
    };

    let config = fast_config();
    let (service, endpoint) = AudioService::new(&config.control);
    service.on_connected(None);
    service.on_subscription_changed(CCC_NOTIFY);

    let link = SimulatedLink::new(io::sink());
    let session = StreamSession::start(&config, server, link, SystemClock, service, endpoint).unwrap();
    assert!(session.pool_stats().is_none());
    let report = session.join().unwrap();
    assert!(report.pool.is_none());
}

#[test]
fn test_crashed_delivery_thread_releases_ingestion() {
    let payload = vec![5u8; 2000];
    let server = CannedServer {
        response: chunked_response(&wav(&payload), 128),
        fragment: 128,
    };

    let mut config = fast_config();
    config.network.idle_timeout_ms = 30_000;
    let (service, endpoint) = AudioService::new(&config.control);
    service.on_connected(Some(247));
    service.on_subscription_changed(CCC_NOTIFY);

    let started = Instant::now();
    let session = StreamSession::start(&config, server, CrashingLink, ManualClock::new(), service, endpoint).unwrap();
    let ring = session.ring().clone();
    let err = session.join().unwrap_err();

    assert_eq!(err.stage, Stage::Delivery);
    assert!(matches!(err.source, Error::Task(_)));
    assert!(ring.stats().clears >= 1);
    assert!(started.elapsed() < Duration::from_secs(10));
}
