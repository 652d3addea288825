//! Bounded audio memory
//!
//! The byte ring that couples the ingestion and delivery tasks, and the
//! fixed block pool used for discrete, tagged hand-off.

pub mod buffer;
pub mod pool;

pub use buffer::{create_shared_transport, RingTransport, SharedTransport, TransportStats};
pub use pool::{Block, BlockFlags, BlockPool, PoolStats};
