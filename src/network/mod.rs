//! Network ingestion
//!
//! HTTP framing, chunked decoding and the ingestion state machine that
//! feeds the audio body into the pipeline.

pub mod chunked;
pub mod client;
pub mod command;
pub mod http;

pub use chunked::ChunkedDecoder;
pub use client::{BodySink, Connector, IngestOptions, IngestionReport, IngestionSession, IngestionState, TcpConnector};
pub use command::{send_command, CommandResponse, ServerCommand};
pub use http::{Request, ResponseHead, ResponseParser};
