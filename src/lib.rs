//! # BLE Audio Relay
//!
//! Streams a WAV file from an HTTP server to a Bluetooth LE peer as GATT
//! notifications, in bounded memory.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         INGESTION THREAD                             │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────────────────┐  │
//! │  │ TcpConnector │──▶│ Ingestion    │──▶│ ContainerRouter          │  │
//! │  │  (socket2)   │   │ Session      │   │  ContainerExtractor      │  │
//! │  └──────────────┘   │ head parser  │   │  RIFF ─▶ fmt ─▶ data     │  │
//! │                     │ dechunking   │   └────────────┬─────────────┘  │
//! │                     └──────────────┘                │ payload only   │
//! └─────────────────────────────────────────────────────┼────────────────┘
//!                                                       ▼
//!                           ┌──────────────────────────────────────────┐
//!                           │  RingTransport (bounded, FIFO, SPSC)     │
//!                           └──────────────────────┬───────────────────┘
//!                                                  ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          DELIVERY THREAD                             │
//! │  ┌──────────────────────────┐        ┌────────────────────────────┐  │
//! │  │ DeliveryScheduler        │───────▶│ RadioLink (notifications)  │  │
//! │  │  pacing, backoff, MTU    │        └────────────────────────────┘  │
//! │  └────────────▲─────────────┘                                        │
//! │               │ link events, control commands (bounded channels)     │
//! │  ┌────────────┴─────────────┐                                        │
//! │  │ AudioService             │◀── host stack callbacks                │
//! │  └──────────────────────────┘                                        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod gatt;
pub mod network;
pub mod pipeline;
pub mod protocol;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Chunk size requested from the audio server
    pub const STREAM_CHUNK_SIZE: usize = 128;

    /// Default audio server port
    pub const DEFAULT_SERVER_PORT: u16 = 8000;
}
