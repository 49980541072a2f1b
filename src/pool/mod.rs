//! Process-wide registered block pool.
//!
//! The pool is initialised once with a registration callback and owns
//! every region it registers until [`destroy_pool`] (test-only) tears it
//! down. [`BlockPool`] is the reusable instance type; the free functions
//! below are the one-per-process facade the transport links against.

mod block;
mod node;
pub mod region;

pub use block::{BlockPool, PoolOptions, RegisterCallback, BLOCK_BASE_SIZE, BLOCK_CLASS_COUNT};
pub use region::{Region, MAX_REGIONS};

use crate::error::{RdmaError, Result};
use std::ptr::NonNull;
use std::sync::{Arc, PoisonError, RwLock};

static GLOBAL: RwLock<Option<Arc<BlockPool>>> = RwLock::new(None);

fn global() -> Option<Arc<BlockPool>> {
    GLOBAL
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

/// Initialise the process-wide pool and return the initial region's base
/// address. One-shot: repeated initialisation warns and fails.
pub fn init_pool(register: RegisterCallback, opts: PoolOptions) -> Result<NonNull<u8>> {
    let mut slot = GLOBAL.write().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        tracing::warn!("block pool is already initialised; ignoring repeated init");
        return Err(RdmaError::InvalidArgument("block pool already initialised"));
    }
    let pool = BlockPool::new(register, opts)?;
    let base = pool
        .initial_base()
        .ok_or(RdmaError::OutOfMemory("pool has no initial region"))?;
    *slot = Some(Arc::new(pool));
    Ok(base)
}

/// Allocate a registered block of at least `size` bytes.
pub fn alloc_block(size: usize) -> Result<NonNull<u8>> {
    let Some(pool) = global() else {
        return Err(RdmaError::InvalidArgument("block pool not initialised"));
    };
    pool.alloc(size)
}

/// Return a block obtained from [`alloc_block`].
///
/// A null pointer is rejected; a pointer outside every region fails with
/// [`RdmaError::NotFound`]. Descriptor-pool exhaustion leaks the block
/// and still succeeds (see [`BlockPool::dealloc`]).
pub fn dealloc_block(ptr: *mut u8) -> Result<()> {
    let Some(ptr) = NonNull::new(ptr) else {
        return Err(RdmaError::InvalidArgument("null block pointer"));
    };
    let Some(pool) = global() else {
        return Err(RdmaError::InvalidArgument("block pool not initialised"));
    };
    pool.dealloc(ptr)
}

/// Registration key for the region containing `ptr`; 0 when the pool is
/// uninitialised or the address is foreign.
pub fn region_id(ptr: *const u8) -> u32 {
    global().map_or(0, |pool| pool.region_id(ptr as usize))
}

/// Tear the pool down and reset the facade. Outstanding blocks dangle;
/// strictly for tests.
#[cfg(any(test, feature = "testing"))]
pub fn destroy_pool() {
    GLOBAL
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
}

/// Size class of the block containing `ptr`.
#[cfg(any(test, feature = "testing"))]
pub fn block_type(ptr: *const u8) -> Option<usize> {
    global().and_then(|pool| pool.block_class_of(ptr as usize))
}

/// Block size of a class.
#[cfg(any(test, feature = "testing"))]
pub fn block_size(class: usize) -> usize {
    BlockPool::block_size(class)
}

/// Free bytes on the class's idle lists.
#[cfg(any(test, feature = "testing"))]
pub fn global_free_len(class: usize) -> usize {
    global().map_or(0, |pool| pool.global_free_len(class))
}

/// Number of published regions.
#[cfg(any(test, feature = "testing"))]
pub fn region_count() -> usize {
    global().map_or(0, |pool| pool.region_count())
}

#[cfg(test)]
mod tests {
    use super::*;

    // The facade is process-global, so its whole lifecycle lives in one
    // test; the scenario coverage runs against `BlockPool` instances.
    #[test]
    fn facade_lifecycle() {
        destroy_pool();

        assert!(matches!(
            alloc_block(8192),
            Err(RdmaError::InvalidArgument(_))
        ));
        assert_eq!(region_id(0x1000 as *const u8), 0);

        let opts = PoolOptions {
            initial_size_mb: 64,
            increase_size_mb: 64,
            max_regions: 4,
            buckets: 2,
            ..PoolOptions::default()
        };
        let base = init_pool(Box::new(|_, _| 1), opts.clone()).unwrap();
        assert_eq!(base.as_ptr() as usize % 4096, 0);
        assert_eq!(region_count(), 1);

        // Second init warns and fails without disturbing the pool.
        assert!(matches!(
            init_pool(Box::new(|_, _| 1), opts),
            Err(RdmaError::InvalidArgument(_))
        ));
        assert_eq!(region_count(), 1);

        let p = alloc_block(8192).unwrap();
        assert_eq!(block_type(p.as_ptr()), Some(0));
        assert_ne!(region_id(p.as_ptr()), 0);
        assert_eq!(block_size(0), BLOCK_BASE_SIZE);

        assert!(matches!(
            dealloc_block(std::ptr::null_mut()),
            Err(RdmaError::InvalidArgument(_))
        ));
        let on_stack = 0u8;
        assert!(matches!(
            dealloc_block(&on_stack as *const u8 as *mut u8),
            Err(RdmaError::NotFound)
        ));
        dealloc_block(p.as_ptr()).unwrap();

        destroy_pool();
        assert_eq!(region_count(), 0);
    }
}
