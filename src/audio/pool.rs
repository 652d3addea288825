//! Fixed-count, fixed-size block allocator
//!
//! Hands out owned [`Block`]s for callers that need a discrete, taggable unit
//! of audio (sequence number, timestamp, flags) instead of a byte stream.
//! Allocation waits on a condvar up to a caller deadline. All counters live
//! under the pool lock so a [`PoolStats`] snapshot is always consistent.
//!
//! [`BlockPool::release`] is the checked way back. A block dropped anywhere
//! else still finds its way home through its `Drop` impl.

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::fmt;
use std::mem;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::error::PoolError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Block flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct BlockFlags(u8);

impl BlockFlags {
    pub const NONE: BlockFlags = BlockFlags(0);
    pub const END_OF_STREAM: BlockFlags = BlockFlags(1 << 0);
    pub const DISCONTINUITY: BlockFlags = BlockFlags(1 << 1);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: BlockFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: BlockFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: BlockFlags) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for BlockFlags {
    type Output = BlockFlags;

    fn bitor(self, rhs: BlockFlags) -> BlockFlags {
        BlockFlags(self.0 | rhs.0)
    }
}

/// An owned block of audio bytes plus metadata
pub struct Block {
    pool_id: u64,
    slot: usize,
    data: Box<[u8]>,
    used: usize,
    sequence: u32,
    timestamp: Duration,
    flags: BlockFlags,
    /// Set while the slot is checked out of its pool
    home: Option<Weak<PoolShared>>,
}

impl Block {
    /// Id of the pool this block was allocated from
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Used length in bytes
    pub fn len(&self) -> usize {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.data.len()
    }

    pub fn free_space(&self) -> usize {
        self.data.len() - self.used
    }

    /// Sequence number assigned at allocation
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Allocation time, relative to pool creation
    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    pub fn flags(&self) -> BlockFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: BlockFlags) {
        self.flags = flags;
    }

    pub fn insert_flags(&mut self, flags: BlockFlags) {
        self.flags.insert(flags);
    }

    /// Used bytes
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.used]
    }

    /// Append as much of `data` as fits, returning the count
    pub fn write(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.free_space());
        self.data[self.used..self.used + count].copy_from_slice(&data[..count]);
        self.used += count;
        count
    }

    /// Consume up to `out.len()` bytes from the front
    pub fn read(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.used);
        out[..count].copy_from_slice(&self.data[..count]);
        self.data.copy_within(count..self.used, 0);
        self.used -= count;
        count
    }

    /// Drop the contents but keep sequence and timestamp
    pub fn clear(&mut self) {
        self.used = 0;
        self.flags = BlockFlags::NONE;
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("pool_id", &self.pool_id)
            .field("slot", &self.slot)
            .field("used", &self.used)
            .field("capacity", &self.data.len())
            .field("sequence", &self.sequence)
            .field("timestamp", &self.timestamp)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Drop for Block {
    fn drop(&mut self) {
        let Some(home) = self.home.take().and_then(|weak| weak.upgrade()) else {
            return;
        };
        if home.reclaim(self.slot, mem::take(&mut self.data)).is_ok() {
            tracing::debug!(pool = self.pool_id, slot = self.slot, "Dropped block returned to pool");
        }
    }
}

struct PoolState {
    /// Free storage, keyed by slot
    free: Vec<(usize, Box<[u8]>)>,
    /// `true` while the slot is handed out
    checked_out: Vec<bool>,
    allocated_total: u64,
    freed_total: u64,
    allocation_failures: u64,
    next_sequence: u32,
}

/// The part of a pool its blocks point back to
struct PoolShared {
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolShared {
    /// Zero and free `slot`. The storage comes back if the slot was not
    /// checked out.
    fn reclaim(&self, slot: usize, mut data: Box<[u8]>) -> Result<(), Box<[u8]>> {
        data.fill(0);

        let mut state = self.state.lock();
        if !state.checked_out.get(slot).copied().unwrap_or(false) {
            return Err(data);
        }
        state.checked_out[slot] = false;
        state.free.push((slot, data));
        state.freed_total += 1;
        drop(state);

        self.available.notify_one();
        Ok(())
    }
}

/// Fixed-size slab of audio blocks
pub struct BlockPool {
    id: u64,
    block_size: usize,
    block_count: usize,
    shared: Arc<PoolShared>,
    created: Instant,
}

impl BlockPool {
    /// Create a pool of `block_count` zeroed blocks of `block_size` bytes
    pub fn new(block_count: usize, block_size: usize) -> Self {
        assert!(block_count > 0, "Pool needs at least one block");
        assert!(block_size > 0, "Block size must be non-zero");

        let free = (0..block_count)
            .rev()
            .map(|slot| (slot, vec![0u8; block_size].into_boxed_slice()))
            .collect();

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            pool = id,
            "Block pool initialized: {} blocks x {} bytes",
            block_count,
            block_size
        );

        Self {
            id,
            block_size,
            block_count,
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    free,
                    checked_out: vec![false; block_count],
                    allocated_total: 0,
                    freed_total: 0,
                    allocation_failures: 0,
                    next_sequence: 0,
                }),
                available: Condvar::new(),
            }),
            created: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Allocate a block, waiting until `deadline` if every block is in use
    pub fn acquire(&self, deadline: Instant) -> Result<Block, PoolError> {
        let start = Instant::now();
        let mut state = self.shared.state.lock();

        let (slot, data) = loop {
            if let Some(entry) = state.free.pop() {
                break entry;
            }
            if self.shared.available.wait_until(&mut state, deadline).timed_out() && state.free.is_empty() {
                state.allocation_failures += 1;
                let waited = start.elapsed();
                drop(state);

                tracing::warn!(pool = self.id, ?waited, "Block allocation timed out");
                return Err(PoolError::Timeout { waited });
            }
        };

        state.checked_out[slot] = true;
        state.allocated_total += 1;
        let sequence = state.next_sequence;
        state.next_sequence = state.next_sequence.wrapping_add(1);
        drop(state);

        tracing::trace!(pool = self.id, slot, sequence, "Block allocated");

        Ok(Block {
            pool_id: self.id,
            slot,
            data,
            used: 0,
            sequence,
            timestamp: self.created.elapsed(),
            flags: BlockFlags::NONE,
            home: Some(Arc::downgrade(&self.shared)),
        })
    }

    /// Allocate without waiting
    pub fn try_acquire(&self) -> Result<Block, PoolError> {
        self.acquire(Instant::now())
    }

    /// Return a block. Its payload is zeroed before anyone else can get it.
    /// A rejected block comes back inside the error, still owned by its
    /// own pool.
    pub fn release(&self, mut block: Block) -> Result<(), PoolError> {
        if block.pool_id != self.id || block.slot >= self.block_count {
            tracing::error!(pool = self.id, ?block, "Attempt to release foreign block");
            return Err(PoolError::InvalidBlock {
                block: Box::new(block),
            });
        }

        let slot = block.slot;
        block.home = None;
        if let Err(data) = self.shared.reclaim(slot, mem::take(&mut block.data)) {
            block.data = data;
            tracing::error!(pool = self.id, slot, "Attempt to release a free slot");
            return Err(PoolError::InvalidBlock {
                block: Box::new(block),
            });
        }

        tracing::trace!(pool = self.id, slot, "Block released");
        Ok(())
    }

    /// Consistent snapshot of the pool counters
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        let in_use = state.allocated_total - state.freed_total;

        PoolStats {
            total: self.block_count,
            free: state.free.len(),
            in_use,
            allocated_total: state.allocated_total,
            freed_total: state.freed_total,
            allocation_failures: state.allocation_failures,
        }
    }

    /// Operator reset of the monotonic counters. Blocks still out stay
    /// accounted for in `allocated_total`.
    pub fn reset_counters(&self) {
        let mut state = self.shared.state.lock();
        let in_use = state.allocated_total - state.freed_total;
        state.allocated_total = in_use;
        state.freed_total = 0;
        state.allocation_failures = 0;
        drop(state);

        tracing::info!(pool = self.id, in_use, "Block pool counters reset");
    }
}

/// Block pool statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub free: usize,
    pub in_use: u64,
    pub allocated_total: u64,
    pub freed_total: u64,
    pub allocation_failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn soon() -> Instant {
        Instant::now() + Duration::from_millis(10)
    }

    #[test]
    fn test_acquire_and_release() {
        let pool = BlockPool::new(2, 16);

        let mut block = pool.acquire(soon()).unwrap();
        assert_eq!(block.capacity(), 16);
        assert!(block.is_empty());
        assert_eq!(block.flags(), BlockFlags::NONE);

        assert_eq!(block.write(b"pcm"), 3);
        assert_eq!(block.as_slice(), b"pcm");

        let stats = pool.stats();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.free, 1);

        pool.release(block).unwrap();
        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.allocated_total, 1);
        assert_eq!(stats.freed_total, 1);
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let pool = BlockPool::new(1, 8);
        let held = pool.acquire(soon()).unwrap();

        let result = pool.acquire(soon());
        assert!(matches!(result, Err(PoolError::Timeout { .. })));
        assert_eq!(pool.stats().allocation_failures, 1);

        pool.release(held).unwrap();
        assert!(pool.try_acquire().is_ok());
    }

    #[test]
    fn test_acquire_waits_for_release() {
        let pool = Arc::new(BlockPool::new(1, 8));
        let held = pool.acquire(soon()).unwrap();

        let releaser = pool.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            releaser.release(held).unwrap();
        });

        let block = pool.acquire(Instant::now() + Duration::from_secs(5));
        assert!(block.is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_released_payload_is_zeroed() {
        let pool = BlockPool::new(1, 4);

        let mut block = pool.acquire(soon()).unwrap();
        block.write(&[0xAA; 4]);
        block.insert_flags(BlockFlags::END_OF_STREAM);
        pool.release(block).unwrap();

        let mut block = pool.acquire(soon()).unwrap();
        assert!(block.is_empty());
        assert_eq!(block.flags(), BlockFlags::NONE);

        // Expose the raw storage by widening the used length
        let mut raw = [0xFFu8; 4];
        block.used = 4;
        block.read(&mut raw);
        assert_eq!(raw, [0u8; 4]);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let pool = BlockPool::new(2, 4);
        let a = pool.acquire(soon()).unwrap();
        let b = pool.acquire(soon()).unwrap();
        assert_eq!(b.sequence(), a.sequence() + 1);

        pool.release(a).unwrap();
        let c = pool.acquire(soon()).unwrap();
        assert_eq!(c.sequence(), b.sequence() + 1);
    }

    #[test]
    fn test_foreign_block_rejected() {
        let pool = BlockPool::new(1, 4);
        let other = BlockPool::new(1, 4);

        let block = other.acquire(soon()).unwrap();
        let err = pool.release(block).unwrap_err();
        let PoolError::InvalidBlock { block } = err else {
            panic!("expected InvalidBlock");
        };

        // The block comes back and can still go home
        other.release(*block).unwrap();
        assert_eq!(other.stats().in_use, 0);
        assert_eq!(pool.stats().freed_total, 0);
    }

    #[test]
    fn test_dropped_block_goes_home() {
        let pool = BlockPool::new(1, 8);

        let mut block = pool.acquire(soon()).unwrap();
        block.write(b"stale");
        drop(block);

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.free, 1);
        assert_eq!(stats.freed_total, 1);

        let mut block = pool.try_acquire().unwrap();
        let mut raw = [0xFFu8; 8];
        block.used = 8;
        block.read(&mut raw);
        assert_eq!(raw, [0u8; 8]);
    }

    #[test]
    fn test_drop_wakes_waiting_acquire() {
        let pool = Arc::new(BlockPool::new(1, 4));
        let held = pool.acquire(soon()).unwrap();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            drop(held);
        });

        assert!(pool.acquire(Instant::now() + Duration::from_secs(5)).is_ok());
        handle.join().unwrap();
    }

    #[test]
    fn test_released_block_is_not_freed_twice() {
        let pool = BlockPool::new(2, 4);
        let block = pool.acquire(soon()).unwrap();
        pool.release(block).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.freed_total, 1);
        assert_eq!(stats.free, 2);
    }

    #[test]
    fn test_rejected_block_drops_into_own_pool() {
        let pool = BlockPool::new(1, 4);
        let other = BlockPool::new(1, 4);

        let block = other.acquire(soon()).unwrap();
        let err = pool.release(block).unwrap_err();
        drop(err);

        assert_eq!(other.stats().in_use, 0);
        assert_eq!(pool.stats().freed_total, 0);
        assert!(other.try_acquire().is_ok());
    }

    #[test]
    fn test_block_outliving_pool() {
        let pool = BlockPool::new(1, 4);
        let block = pool.acquire(soon()).unwrap();
        drop(pool);
        assert_eq!(block.capacity(), 4);
        drop(block);
    }

    #[test]
    fn test_block_read_consumes_front() {
        let pool = BlockPool::new(1, 8);
        let mut block = pool.acquire(soon()).unwrap();
        block.write(b"abcdef");

        let mut out = [0u8; 4];
        assert_eq!(block.read(&mut out), 4);
        assert_eq!(&out, b"abcd");
        assert_eq!(block.as_slice(), b"ef");
        assert_eq!(block.free_space(), 6);
    }

    #[test]
    fn test_reset_counters_keeps_in_use() {
        let pool = BlockPool::new(2, 4);
        let held = pool.acquire(soon()).unwrap();
        let other = pool.acquire(soon()).unwrap();
        pool.release(other).unwrap();

        pool.reset_counters();
        let stats = pool.stats();
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.allocated_total, 1);
        assert_eq!(stats.freed_total, 0);

        pool.release(held).unwrap();
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_flags() {
        let mut flags = BlockFlags::END_OF_STREAM | BlockFlags::DISCONTINUITY;
        assert!(flags.contains(BlockFlags::END_OF_STREAM));
        flags.remove(BlockFlags::END_OF_STREAM);
        assert!(!flags.contains(BlockFlags::END_OF_STREAM));
        assert_eq!(flags.bits(), 2);
    }
}
