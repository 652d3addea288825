//! Bounded byte ring between the ingestion and delivery tasks
//!
//! Single-producer single-consumer byte queue with non-blocking and
//! deadline-bounded blocking access. Short writes and short reads are not
//! errors: the returned byte count is the contract.
//!
//! Waiting is done on a `parking_lot` condvar pair. [`RingTransport::clear`]
//! advances an epoch so that every waiter that went to sleep before the clear
//! wakes up with [`TransportError::Cleared`] instead of picking up bytes from
//! the next stream.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::error::TransportError;

/// Cursor state, guarded by the transport mutex
struct RingState {
    storage: Box<[u8]>,
    write_cursor: usize,
    read_cursor: usize,
    occupied: usize,
    /// Bumped by every clear
    epoch: u64,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.storage.len()
    }

    fn space(&self) -> usize {
        self.capacity() - self.occupied
    }

    /// Copy as much of `data` as fits, splitting the copy at the end of storage
    fn push(&mut self, data: &[u8]) -> usize {
        let capacity = self.capacity();
        let count = data.len().min(self.space());
        if count == 0 {
            return 0;
        }

        let first = count.min(capacity - self.write_cursor);
        self.storage[self.write_cursor..self.write_cursor + first]
            .copy_from_slice(&data[..first]);
        if count > first {
            self.storage[..count - first].copy_from_slice(&data[first..count]);
        }

        self.write_cursor = (self.write_cursor + count) % capacity;
        self.occupied += count;
        count
    }

    fn pop(&mut self, out: &mut [u8]) -> usize {
        let capacity = self.capacity();
        let count = out.len().min(self.occupied);
        if count == 0 {
            return 0;
        }

        let first = count.min(capacity - self.read_cursor);
        out[..first].copy_from_slice(&self.storage[self.read_cursor..self.read_cursor + first]);
        if count > first {
            out[first..count].copy_from_slice(&self.storage[..count - first]);
        }

        self.read_cursor = (self.read_cursor + count) % capacity;
        self.occupied -= count;
        count
    }
}

/// Bounded byte transport
pub struct RingTransport {
    state: Mutex<RingState>,
    not_empty: Condvar,
    not_full: Condvar,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    /// Writes that could not place every byte
    short_write_count: AtomicU64,
    /// Reads that found nothing
    underrun_count: AtomicU64,
    clear_count: AtomicU64,
}

impl RingTransport {
    /// Create a new transport holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Capacity must be non-zero");

        Self {
            state: Mutex::new(RingState {
                storage: vec![0u8; capacity].into_boxed_slice(),
                write_cursor: 0,
                read_cursor: 0,
                occupied: 0,
                epoch: 0,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            short_write_count: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            clear_count: AtomicU64::new(0),
        }
    }

    /// Write without blocking. Returns the number of bytes accepted; the rest
    /// of `data` is dropped.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }

        let written = self.state.lock().push(data);
        self.after_write(data.len(), written);
        written
    }

    /// Wait until at least one byte fits (or `deadline` passes), then write
    /// like [`write`](Self::write).
    pub fn write_blocking(&self, data: &[u8], deadline: Instant) -> Result<usize, TransportError> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock();
        let epoch = state.epoch;

        while state.space() == 0 {
            let timed_out = self.not_full.wait_until(&mut state, deadline).timed_out();
            if state.epoch != epoch {
                return Err(TransportError::Cleared);
            }
            if timed_out && state.space() == 0 {
                return Err(TransportError::Timeout);
            }
        }

        let written = state.push(data);
        drop(state);

        self.after_write(data.len(), written);
        Ok(written)
    }

    /// Read without blocking into `out`. Returns the number of bytes copied.
    pub fn read(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }

        let read = self.state.lock().pop(out);
        self.after_read(read);
        read
    }

    /// Wait until at least one byte is queued (or `deadline` passes), then
    /// read like [`read`](Self::read).
    pub fn read_blocking(&self, out: &mut [u8], deadline: Instant) -> Result<usize, TransportError> {
        if out.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.lock();
        let epoch = state.epoch;

        while state.occupied == 0 {
            let timed_out = self.not_empty.wait_until(&mut state, deadline).timed_out();
            if state.epoch != epoch {
                return Err(TransportError::Cleared);
            }
            if timed_out && state.occupied == 0 {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                return Err(TransportError::Timeout);
            }
        }

        let read = state.pop(out);
        drop(state);

        self.after_read(read);
        Ok(read)
    }

    fn after_write(&self, requested: usize, written: usize) {
        if written > 0 {
            self.bytes_written.fetch_add(written as u64, Ordering::Relaxed);
            self.not_empty.notify_one();
        }
        if written < requested {
            self.short_write_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn after_read(&self, read: usize) {
        if read > 0 {
            self.bytes_read.fetch_add(read as u64, Ordering::Relaxed);
            self.not_full.notify_one();
        } else {
            self.underrun_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Discard everything queued and wake all waiters with `Cleared`
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let discarded = state.occupied;
        state.write_cursor = 0;
        state.read_cursor = 0;
        state.occupied = 0;
        state.epoch = state.epoch.wrapping_add(1);
        drop(state);

        self.not_empty.notify_all();
        self.not_full.notify_all();
        self.clear_count.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(discarded, "Ring transport cleared");
    }

    /// Free bytes
    pub fn space_available(&self) -> usize {
        self.state.lock().space()
    }

    /// Queued bytes
    pub fn occupied(&self) -> usize {
        self.state.lock().occupied
    }

    pub fn is_empty(&self) -> bool {
        self.occupied() == 0
    }

    pub fn is_full(&self) -> bool {
        self.space_available() == 0
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity()
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        let state = self.state.lock();
        state.occupied as f32 / state.capacity() as f32
    }

    /// Get statistics
    pub fn stats(&self) -> TransportStats {
        let (capacity, occupied) = {
            let state = self.state.lock();
            (state.capacity(), state.occupied)
        };

        TransportStats {
            capacity,
            occupied,
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            short_writes: self.short_write_count.load(Ordering::Relaxed),
            underruns: self.underrun_count.load(Ordering::Relaxed),
            clears: self.clear_count.load(Ordering::Relaxed),
        }
    }

    /// Reset statistics
    pub fn reset_stats(&self) {
        self.bytes_written.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.short_write_count.store(0, Ordering::Relaxed);
        self.underrun_count.store(0, Ordering::Relaxed);
        self.clear_count.store(0, Ordering::Relaxed);
    }
}

/// Ring transport statistics
#[derive(Debug, Clone, Serialize)]
pub struct TransportStats {
    pub capacity: usize,
    pub occupied: usize,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub short_writes: u64,
    pub underruns: u64,
    pub clears: u64,
}

/// Thread-safe handle to a ring transport
pub type SharedTransport = Arc<RingTransport>;

/// Create a new shared ring transport
pub fn create_shared_transport(capacity: usize) -> SharedTransport {
    Arc::new(RingTransport::new(capacity))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_ring_transport_basic() {
        let ring = RingTransport::new(8);

        assert_eq!(ring.write(b"abc"), 3);
        assert_eq!(ring.occupied(), 3);
        assert_eq!(ring.space_available(), 5);

        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(&out[..3], b"abc");
        assert!(ring.is_empty());
    }

    #[test]
    fn test_partial_write_drops_remainder() {
        let ring = RingTransport::new(4);

        assert_eq!(ring.write(b"abcdef"), 4);
        assert!(ring.is_full());
        assert_eq!(ring.write(b"g"), 0);
        assert_eq!(ring.stats().short_writes, 2);

        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out[..4], b"abcd");
    }

    #[test]
    fn test_wrap_around_preserves_order() {
        let ring = RingTransport::new(5);
        let mut out = [0u8; 5];

        assert_eq!(ring.write(b"1234"), 4);
        assert_eq!(ring.read(&mut out[..3]), 3);
        assert_eq!(&out[..3], b"123");

        // Cursor now at 4, this write wraps
        assert_eq!(ring.write(b"5678"), 4);
        assert!(ring.is_full());

        assert_eq!(ring.read(&mut out), 5);
        assert_eq!(&out, b"45678");
    }

    #[test]
    fn test_read_blocking_times_out() {
        let ring = RingTransport::new(4);
        let mut out = [0u8; 4];

        let start = Instant::now();
        let result = ring.read_blocking(&mut out, start + Duration::from_millis(20));
        assert_eq!(result, Err(TransportError::Timeout));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_write_blocking_times_out_when_full() {
        let ring = RingTransport::new(2);
        ring.write(b"xy");

        let result = ring.write_blocking(b"z", Instant::now() + Duration::from_millis(10));
        assert_eq!(result, Err(TransportError::Timeout));
    }

    #[test]
    fn test_read_blocking_wakes_on_write() {
        let ring = create_shared_transport(16);
        let writer = ring.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            writer.write(b"hello")
        });

        let mut out = [0u8; 16];
        let read = ring
            .read_blocking(&mut out, Instant::now() + Duration::from_secs(5))
            .unwrap();
        assert!(read > 0);
        handle.join().unwrap();
    }

    #[test]
    fn test_write_blocking_wakes_on_read() {
        let ring = create_shared_transport(3);
        ring.write(b"abc");
        let reader = ring.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            let mut out = [0u8; 2];
            reader.read(&mut out)
        });

        let written = ring
            .write_blocking(b"de", Instant::now() + Duration::from_secs(5))
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(handle.join().unwrap(), 2);
    }

    #[test]
    fn test_clear_wakes_blocked_reader() {
        let ring = create_shared_transport(8);
        let reader = ring.clone();

        let handle = thread::spawn(move || {
            let mut out = [0u8; 8];
            reader.read_blocking(&mut out, Instant::now() + Duration::from_secs(10))
        });

        thread::sleep(Duration::from_millis(50));
        ring.clear();

        assert_eq!(handle.join().unwrap(), Err(TransportError::Cleared));
    }

    #[test]
    fn test_clear_wakes_blocked_writer() {
        let ring = create_shared_transport(2);
        ring.write(b"ab");
        let writer = ring.clone();

        let handle = thread::spawn(move || {
            writer.write_blocking(b"c", Instant::now() + Duration::from_secs(10))
        });

        thread::sleep(Duration::from_millis(50));
        ring.clear();

        assert_eq!(handle.join().unwrap(), Err(TransportError::Cleared));
        assert!(ring.is_empty());
    }

    #[test]
    fn test_clear_resets_cursors() {
        let ring = RingTransport::new(4);
        ring.write(b"abc");
        let mut out = [0u8; 1];
        ring.read(&mut out);
        ring.clear();

        assert!(ring.is_empty());
        assert_eq!(ring.space_available(), 4);
        assert_eq!(ring.write(b"wxyz"), 4);

        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(&out, b"wxyz");
        assert_eq!(ring.stats().clears, 1);
    }

    #[test]
    fn test_spsc_threads_keep_fifo_order() {
        let ring = create_shared_transport(7);
        let producer = ring.clone();
        let total: usize = 10_000;

        let handle = thread::spawn(move || {
            let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + 13).min(data.len());
                let deadline = Instant::now() + Duration::from_secs(5);
                offset += producer.write_blocking(&data[offset..end], deadline).unwrap();
            }
        });

        let mut received = Vec::with_capacity(total);
        let mut out = [0u8; 5];
        while received.len() < total {
            let deadline = Instant::now() + Duration::from_secs(5);
            let n = ring.read_blocking(&mut out, deadline).unwrap();
            received.extend_from_slice(&out[..n]);
        }
        handle.join().unwrap();

        for (i, byte) in received.iter().enumerate() {
            assert_eq!(*byte, (i % 251) as u8, "mismatch at byte {}", i);
        }
    }
}
