//! Segregated fixed-block memory pools.
//!
//! A [`PoolSet`] holds an ordered list of pools with ascending block
//! sizes. Allocation takes the smallest free block that fits; blocks are
//! preallocated up front so steady-state allocation never touches the
//! heap. Freed blocks go back on their pool's free list when the handle
//! drops.
//!
//! Two handle types are produced:
//!
//! - [`PoolBuf`]: a uniquely owned block, mutable through `DerefMut`.
//! - [`SharedPoolBuf`]: a reference-counted block for payloads that fan
//!   out to several consumers (message deliveries hold one clone each).
//!   Cloning is the inc-ref; dropping the last clone releases the block.
//!
//! Optional per-pool request statistics and a set-wide request histogram
//! can be enabled; they never change allocation behaviour.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::util::stats::{Histogram, RunningStats};

/// One fixed-block pool.
struct Pool {
    id: u32,
    block_size: usize,
    free: Vec<Box<[u8]>>,
    total: usize,
    min_free: usize,
    disabled: bool,
    req_stats: RunningStats,
}

struct PoolSetInner {
    pools: Mutex<Vec<Pool>>,
    hist: Mutex<Option<Histogram>>,
}

/// Snapshot of one pool's state for reporting.
#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub block_size: usize,
    pub total_blocks: usize,
    pub free_blocks: usize,
    pub min_free_blocks: usize,
    pub disabled: bool,
    pub request_count: u64,
    pub request_mean: f64,
    pub request_std_dev: f64,
}

/// Shared handle to an ordered set of pools.
#[derive(Clone)]
pub struct PoolSet {
    inner: Arc<PoolSetInner>,
}

impl Default for PoolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolSet {
    /// An empty pool set. Allocations fail until pools are added.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolSetInner {
                pools: Mutex::new(Vec::new()),
                hist: Mutex::new(None),
            }),
        }
    }

    /// Add a pool of `blocks` blocks of `block_size` bytes each. Pools
    /// are kept sorted by ascending block size. Returns the pool id.
    pub fn add_pool(&self, blocks: usize, block_size: usize) -> u32 {
        let mut pools = self.inner.pools.lock();
        let id = pools.iter().map(|p| p.id).max().map_or(0, |m| m + 1);

        let free: Vec<Box<[u8]>> = (0..blocks)
            .map(|_| vec![0u8; block_size].into_boxed_slice())
            .collect();

        let pool = Pool {
            id,
            block_size,
            free,
            total: blocks,
            min_free: blocks,
            disabled: false,
            req_stats: RunningStats::new(),
        };

        let pos = pools
            .iter()
            .position(|p| p.block_size > block_size)
            .unwrap_or(pools.len());
        pools.insert(pos, pool);

        if let Some(hist) = self.inner.hist.lock().as_mut() {
            if block_size as i64 > hist.high_bound() {
                hist.set_bounds(0, block_size as i64);
            }
        }

        id
    }

    /// Attach a request-size histogram to the set.
    pub fn attach_histogram(&self, hist: Histogram) {
        *self.inner.hist.lock() = Some(hist);
    }

    /// Enable or disable a pool for allocation. Disabled pools still
    /// accept frees.
    pub fn set_pool_enabled(&self, pool_id: u32, enabled: bool) {
        let mut pools = self.inner.pools.lock();
        if let Some(pool) = pools.iter_mut().find(|p| p.id == pool_id) {
            pool.disabled = !enabled;
        }
    }

    fn record_request(&self, size: usize) {
        if let Some(hist) = self.inner.hist.lock().as_mut() {
            hist.add_sample(size as i64);
        }
    }

    fn take_block(pool: &mut Pool, req_size: usize) -> Box<[u8]> {
        let block = pool.free.pop().unwrap_or_default();
        if pool.free.len() < pool.min_free {
            pool.min_free = pool.free.len();
        }
        pool.req_stats.add_sample(req_size as f64);
        block
    }

    /// Allocate the smallest free block that holds `size` bytes.
    #[must_use]
    pub fn alloc(&self, size: usize) -> Option<PoolBuf> {
        self.record_request(size);

        let mut pools = self.inner.pools.lock();
        let pool = pools
            .iter_mut()
            .find(|p| !p.disabled && p.block_size >= size && !p.free.is_empty())?;
        let (id, block) = (pool.id, Self::take_block(pool, size));
        drop(pools);

        Some(PoolBuf {
            buf: Some(block),
            len: size,
            pool_id: id,
            set: Arc::clone(&self.inner),
        })
    }

    /// Allocate any available block, possibly smaller than requested.
    /// The handle length reports the usable size actually granted.
    #[must_use]
    pub fn alloc_best_effort(&self, size: usize) -> Option<PoolBuf> {
        self.record_request(size);

        let mut pools = self.inner.pools.lock();
        let mut candidate: Option<usize> = None;
        for (ix, pool) in pools.iter().enumerate() {
            if pool.disabled || pool.free.is_empty() {
                continue;
            }
            candidate = Some(ix);
            if pool.block_size >= size {
                break;
            }
        }
        let ix = candidate?;
        let pool = &mut pools[ix];
        let granted = size.min(pool.block_size);
        let (id, block) = (pool.id, Self::take_block(pool, granted));
        drop(pools);

        Some(PoolBuf {
            buf: Some(block),
            len: granted,
            pool_id: id,
            set: Arc::clone(&self.inner),
        })
    }

    /// Allocate a block whose next free block already satisfies `align`
    /// (power of two). Pools whose head-of-freelist block is misaligned
    /// are skipped.
    #[must_use]
    pub fn alloc_aligned(&self, size: usize, align: usize) -> Option<PoolBuf> {
        self.record_request(size);
        if !align.is_power_of_two() {
            return None;
        }

        let mut pools = self.inner.pools.lock();
        let pool = pools.iter_mut().find(|p| {
            !p.disabled
                && p.block_size >= size
                && p.free
                    .last()
                    .is_some_and(|b| (b.as_ptr() as usize) % align == 0)
        })?;
        let (id, block) = (pool.id, Self::take_block(pool, size));
        drop(pools);

        Some(PoolBuf {
            buf: Some(block),
            len: size,
            pool_id: id,
            set: Arc::clone(&self.inner),
        })
    }

    /// Allocate a reference-counted block with an initial count of one.
    #[must_use]
    pub fn alloc_with_ref(&self, size: usize) -> Option<SharedPoolBuf> {
        self.alloc(size).map(PoolBuf::into_shared)
    }

    /// Allocate a block and copy `data` into it.
    #[must_use]
    pub fn alloc_from(&self, data: &[u8]) -> Option<PoolBuf> {
        let mut buf = self.alloc(data.len())?;
        buf.copy_from(data);
        Some(buf)
    }

    /// Allocate a reference-counted block holding a copy of `data`.
    #[must_use]
    pub fn alloc_shared_from(&self, data: &[u8]) -> Option<SharedPoolBuf> {
        self.alloc_from(data).map(PoolBuf::into_shared)
    }

    /// Number of free blocks in the pool whose block size is exactly
    /// `block_size`, or 0 when no such pool exists.
    #[must_use]
    pub fn free_blocks(&self, block_size: usize) -> usize {
        self.inner
            .pools
            .lock()
            .iter()
            .find(|p| p.block_size == block_size)
            .map_or(0, |p| p.free.len())
    }

    /// Per-pool state snapshots, smallest block size first.
    #[must_use]
    pub fn summary(&self) -> Vec<PoolInfo> {
        self.inner
            .pools
            .lock()
            .iter()
            .map(|p| PoolInfo {
                block_size: p.block_size,
                total_blocks: p.total,
                free_blocks: p.free.len(),
                min_free_blocks: p.min_free,
                disabled: p.disabled,
                request_count: p.req_stats.count(),
                request_mean: p.req_stats.mean(),
                request_std_dev: p.req_stats.std_dev(),
            })
            .collect()
    }
}

/// A uniquely owned pool block. Returned to its pool on drop.
pub struct PoolBuf {
    buf: Option<Box<[u8]>>,
    len: usize,
    pool_id: u32,
    set: Arc<PoolSetInner>,
}

impl PoolBuf {
    /// Usable length. May be less than the underlying block size.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Underlying block capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map_or(0, |b| b.len())
    }

    /// Shrink the usable length.
    pub fn truncate(&mut self, len: usize) {
        if len < self.len {
            self.len = len;
        }
    }

    /// Copy `data` into the block and set the usable length to match.
    /// Data beyond the block capacity is dropped.
    pub fn copy_from(&mut self, data: &[u8]) {
        if let Some(buf) = self.buf.as_mut() {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            self.len = n;
        }
    }

    /// Convert into a reference-counted block.
    #[must_use]
    pub fn into_shared(self) -> SharedPoolBuf {
        SharedPoolBuf {
            inner: Arc::new(self),
        }
    }
}

impl Deref for PoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(b) => &b[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PoolBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        match &mut self.buf {
            Some(b) => &mut b[..len],
            None => &mut [],
        }
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        if let Some(block) = self.buf.take() {
            let mut pools = self.set.pools.lock();
            if let Some(pool) = pools.iter_mut().find(|p| p.id == self.pool_id) {
                pool.free.push(block);
            }
            // A pool removed while blocks are outstanding lets the block
            // fall back to the heap.
        }
    }
}

impl core::fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "PoolBuf(pool={}, len={})", self.pool_id, self.len)
    }
}

/// A reference-counted pool block. `clone` increments the reference
/// count; dropping the last handle returns the block to its pool.
#[derive(Clone, Debug)]
pub struct SharedPoolBuf {
    inner: Arc<PoolBuf>,
}

impl SharedPoolBuf {
    /// Current reference count.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// View the payload as UTF-8 if it is.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        core::str::from_utf8(self).ok()
    }
}

impl Deref for SharedPoolBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner
    }
}

impl PartialEq for SharedPoolBuf {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for SharedPoolBuf {}
