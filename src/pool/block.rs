//! The size-classed block pool.
//!
//! Blocks are carved from large page-aligned regions registered with the
//! RDMA device once, at extend time, so a block's registration key is a
//! table lookup instead of a per-send `ibv_reg_mr`. Four size classes
//! cover the transport's buffer chain; each class's free list is sharded
//! into buckets to keep allocating threads off each other's locks.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Mutex;

use crate::config::RdmaConfig;
use crate::error::{LogThrottle, RdmaError, Result};
use crate::lock;
use crate::pool::node::{IdleList, NodePool};
use crate::pool::region::{Region, RegionTable, MAX_REGIONS};

/// Base block size of the upper transport's buffer chain (8 KiB).
pub const BLOCK_BASE_SIZE: usize = 8192;

/// Number of size classes: {B, 2B, 4B, 8B}.
pub const BLOCK_CLASS_COUNT: usize = 4;

pub(crate) const BLOCK_SIZES: [usize; BLOCK_CLASS_COUNT] = [
    BLOCK_BASE_SIZE,
    BLOCK_BASE_SIZE * 2,
    BLOCK_BASE_SIZE * 4,
    BLOCK_BASE_SIZE * 8,
];

const BYTES_IN_MB: usize = 1 << 20;
const REGION_ALIGN: usize = 4096;

/// Registers `[base, base + len)` with the device; returns the non-zero
/// region id (lkey), or 0 when registration failed. Must be thread-safe.
pub type RegisterCallback = Box<dyn Fn(*mut u8, usize) -> u32 + Send + Sync>;

/// Block-pool sizing knobs. Out-of-range values are clamped at pool
/// construction rather than rejected.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Size of the first region, in MiB. Clamped to >= 64.
    pub initial_size_mb: usize,
    /// Size of every subsequent region, in MiB. Clamped to >= 64.
    pub increase_size_mb: usize,
    /// Region cap. Clamped to 1..=[`MAX_REGIONS`].
    pub max_regions: usize,
    /// Free-list shards per class. Clamped to >= 1.
    pub buckets: usize,
    /// Cap on live free-range descriptors. When the descriptor pool is
    /// exhausted, extension fails cleanly and deallocation leaks the
    /// block instead of failing.
    pub node_cap: usize,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            initial_size_mb: 1024,
            increase_size_mb: 1024,
            max_regions: 1,
            buckets: 4,
            node_cap: 1 << 20,
        }
    }
}

impl From<&RdmaConfig> for PoolOptions {
    fn from(cfg: &RdmaConfig) -> Self {
        Self {
            initial_size_mb: cfg.pool_initial_size_mb,
            increase_size_mb: cfg.pool_increase_size_mb,
            max_regions: cfg.pool_max_regions,
            buckets: cfg.pool_buckets,
            ..Self::default()
        }
    }
}

impl PoolOptions {
    fn normalized(mut self) -> Self {
        self.initial_size_mb = self.initial_size_mb.max(64);
        self.increase_size_mb = self.increase_size_mb.max(64);
        self.max_regions = self.max_regions.clamp(1, MAX_REGIONS);
        self.buckets = self.buckets.max(1);
        self.node_cap = self.node_cap.max(self.buckets);
        self
    }
}

/// Per-class stacks of ranges produced by a freshly extended region,
/// awaiting first-touch distribution into buckets. Guarded by the extend
/// lock.
#[derive(Default)]
struct ReadyLists {
    per_class: [IdleList; BLOCK_CLASS_COUNT],
}

/// A size-classed, bucketed allocator over registered regions.
///
/// All methods may be called from any thread. Lock order is strict:
/// a bucket lock first, then the extend lock; never two bucket locks.
pub struct BlockPool {
    opts: PoolOptions,
    register: RegisterCallback,
    regions: RegionTable,
    nodes: NodePool,
    /// One locked LIFO stack per (class, bucket).
    idle: [Vec<Mutex<IdleList>>; BLOCK_CLASS_COUNT],
    /// Serialises region extension and guards the ready lists.
    extend: Mutex<ReadyLists>,
    extend_warn: LogThrottle,
    node_warn: LogThrottle,
}

impl BlockPool {
    /// Build a pool and extend it with the initial region (class 0).
    pub fn new(register: RegisterCallback, opts: PoolOptions) -> Result<Self> {
        let opts = opts.normalized();
        let pool = Self {
            idle: std::array::from_fn(|_| {
                (0..opts.buckets).map(|_| Mutex::new(IdleList::default())).collect()
            }),
            nodes: NodePool::new(opts.node_cap),
            regions: RegionTable::new(),
            extend: Mutex::new(ReadyLists::default()),
            extend_warn: LogThrottle::new(),
            node_warn: LogThrottle::new(),
            register,
            opts,
        };
        {
            let mut ready = lock(&pool.extend);
            pool.extend_locked(&mut ready, pool.opts.initial_size_mb, 0)?;
        }
        Ok(pool)
    }

    /// Base address of the initial region.
    pub fn initial_base(&self) -> Option<NonNull<u8>> {
        self.regions
            .get(0)
            .and_then(|r| NonNull::new(r.start as *mut u8))
    }

    /// The region containing `addr`, if any.
    pub fn region_of(&self, addr: usize) -> Option<&Region> {
        self.regions.region_of(addr)
    }

    /// Registration key for `addr`; 0 when the address is foreign.
    pub fn region_id(&self, addr: usize) -> u32 {
        self.regions.region_id(addr)
    }

    /// Allocate one block from the smallest class that fits `size`.
    pub fn alloc(&self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(RdmaError::InvalidArgument("zero-sized block"));
        }
        let Some(class) = BLOCK_SIZES.iter().position(|&s| size <= s) else {
            return Err(RdmaError::InvalidArgument("block size above largest class"));
        };
        self.alloc_from(class)
    }

    fn alloc_from(&self, class: usize) -> Result<NonNull<u8>> {
        let bucket = rand::random::<u64>() as usize % self.opts.buckets;
        let mut list = lock(&self.idle[class][bucket]);
        if list.is_empty() {
            // The one nested acquisition in the pool: bucket first, then
            // extend, always in this order.
            let mut ready = lock(&self.extend);
            self.pick_ready(&mut ready, class, bucket, &mut list);
            if list.is_empty() {
                if let Err(e) = self.extend_locked(&mut ready, self.opts.increase_size_mb, class) {
                    if self.extend_warn.should_log() {
                        tracing::error!(
                            "failed to extend block pool: {e}; consider raising \
                             HELIX_RDMA_MEMORY_POOL_INITIAL_SIZE_MB, \
                             HELIX_RDMA_MEMORY_POOL_INCREASE_SIZE_MB or \
                             HELIX_RDMA_MEMORY_POOL_MAX_REGIONS"
                        );
                    }
                    return Err(e);
                }
                self.pick_ready(&mut ready, class, bucket, &mut list);
            }
        }

        let block_size = BLOCK_SIZES[class];
        let Some(node) = list.peek_mut() else {
            return Err(RdmaError::OutOfMemory("no idle blocks after extension"));
        };
        let addr = node.start;
        if node.len > block_size {
            node.start += block_size;
            node.len -= block_size;
        } else {
            debug_assert_eq!(node.len, block_size);
            if let Some(node) = list.pop() {
                self.nodes.release(node);
            }
        }
        NonNull::new(addr as *mut u8).ok_or(RdmaError::OutOfMemory("carved a null block"))
    }

    /// Move one ready node whose sub-range maps to `bucket` onto that
    /// bucket's idle list. Each region contributes exactly one ready node
    /// per bucket, so the first match is the only candidate from its
    /// region; further matches belong to other regions and stay for later
    /// drains.
    fn pick_ready(&self, ready: &mut ReadyLists, class: usize, bucket: usize, dst: &mut IdleList) {
        let buckets = self.opts.buckets;
        let node = ready.per_class[class].remove_first(|n| {
            match self.regions.region_of(n.start) {
                Some(r) => (n.start - r.start) * buckets / r.size == bucket,
                None => false,
            }
        });
        if let Some(node) = node {
            dst.push(node);
        }
    }

    /// Extend the pool with a fresh region for `class`. Caller holds the
    /// extend lock. Every early return releases whatever was acquired.
    fn extend_locked(&self, ready: &mut ReadyLists, mb: usize, class: usize) -> Result<()> {
        if self.regions.len() >= self.opts.max_regions {
            return Err(RdmaError::OutOfMemory("region limit reached"));
        }

        // Round down to a whole number of per-bucket block runs.
        let chunk = BLOCK_SIZES[class] * self.opts.buckets;
        let region_size = mb.saturating_mul(BYTES_IN_MB) / chunk * chunk;
        if region_size < 64 {
            return Err(RdmaError::InvalidArgument("region size too small"));
        }

        let layout = Layout::from_size_align(region_size, REGION_ALIGN)
            .map_err(|_| RdmaError::InvalidArgument("bad region layout"))?;
        // Safety: layout has non-zero size.
        let base = unsafe { alloc::alloc(layout) };
        if base.is_null() {
            return Err(RdmaError::OutOfMemory("aligned region allocation failed"));
        }

        let id = (self.register)(base, region_size);
        if id == 0 {
            // Safety: `base` came from `alloc` with this exact layout.
            unsafe { alloc::dealloc(base, layout) };
            return Err(RdmaError::device("memory region registration failed"));
        }

        // One node per bucket, each covering a contiguous sub-range.
        let sub = region_size / self.opts.buckets;
        let mut acquired = Vec::with_capacity(self.opts.buckets);
        for i in 0..self.opts.buckets {
            match self.nodes.acquire(base as usize + i * sub, sub) {
                Some(node) => acquired.push(node),
                None => {
                    for node in acquired {
                        self.nodes.release(node);
                    }
                    // Safety: as above.
                    unsafe { alloc::dealloc(base, layout) };
                    return Err(RdmaError::OutOfMemory("free-range descriptor pool exhausted"));
                }
            }
        }

        // Publish before the ready push: pick_ready resolves nodes
        // through the table.
        if let Err(e) = self.regions.publish(Region {
            start: base as usize,
            size: region_size,
            block_class: class,
            id,
        }) {
            for node in acquired {
                self.nodes.release(node);
            }
            // Safety: as above.
            unsafe { alloc::dealloc(base, layout) };
            return Err(e);
        }
        for node in acquired {
            ready.per_class[class].push(node);
        }
        Ok(())
    }

    /// Return a block to its bucket's free list.
    ///
    /// On descriptor shortage the block is leaked, with a throttled
    /// warning, and the call still succeeds: failing a dealloc would
    /// corrupt caller accounting, while a leaked block stays inside its
    /// registered region.
    pub fn dealloc(&self, ptr: NonNull<u8>) -> Result<()> {
        let addr = ptr.as_ptr() as usize;
        let Some(region) = self.regions.region_of(addr) else {
            return Err(RdmaError::NotFound);
        };
        let class = region.block_class;
        let bucket = (addr - region.start) * self.opts.buckets / region.size;
        let Some(node) = self.nodes.acquire(addr, BLOCK_SIZES[class]) else {
            if self.node_warn.should_log() {
                tracing::warn!(
                    "free-range descriptor pool exhausted; leaking one {}-byte block",
                    BLOCK_SIZES[class]
                );
            }
            return Ok(());
        };
        lock(&self.idle[class][bucket]).push(node);
        Ok(())
    }

    /// Number of published regions. Non-decreasing for the pool's
    /// lifetime.
    #[cfg(any(test, feature = "testing"))]
    pub fn region_count(&self) -> usize {
        self.regions.len()
    }

    /// Size class of the block containing `ptr`.
    #[cfg(any(test, feature = "testing"))]
    pub fn block_class_of(&self, addr: usize) -> Option<usize> {
        self.regions.region_of(addr).map(|r| r.block_class)
    }

    /// Block size of a class.
    #[cfg(any(test, feature = "testing"))]
    pub fn block_size(class: usize) -> usize {
        BLOCK_SIZES.get(class).copied().unwrap_or(0)
    }

    /// Total free bytes on a class's idle lists (ready lists excluded).
    #[cfg(any(test, feature = "testing"))]
    pub fn global_free_len(&self, class: usize) -> usize {
        self.idle[class]
            .iter()
            .map(|list| lock(list).total_len())
            .sum()
    }

    /// Total bytes on a class's ready list.
    #[cfg(any(test, feature = "testing"))]
    pub fn ready_len(&self, class: usize) -> usize {
        lock(&self.extend).per_class[class].total_len()
    }
}

impl Drop for BlockPool {
    fn drop(&mut self) {
        // Outstanding blocks dangle after this; dropping a live pool is a
        // test-only affair, mirrored by the `destroy_pool` facade.
        for i in 0..self.regions.len() {
            if let Some(r) = self.regions.get(i) {
                // Safety: every region was allocated by `extend_locked`
                // with this size and alignment.
                unsafe {
                    alloc::dealloc(
                        r.start as *mut u8,
                        Layout::from_size_align_unchecked(r.size, REGION_ALIGN),
                    );
                }
            }
        }
    }
}
