//! Integration tests for the process-wide block pool facade.
//!
//! The facade is one-per-process, so the whole journey lives in a
//! single test: init, allocate across classes, misuse, dealloc.

use helix_rdma::{alloc_block, dealloc_block, init_pool, region_id, PoolOptions, RdmaError};
use std::sync::atomic::{AtomicU32, Ordering};

#[test]
fn pool_facade_journey() {
    // Alloc before init fails cleanly.
    assert!(matches!(
        alloc_block(4096),
        Err(RdmaError::InvalidArgument(_))
    ));

    static NEXT_KEY: AtomicU32 = AtomicU32::new(0);
    let opts = PoolOptions {
        initial_size_mb: 64,
        increase_size_mb: 64,
        max_regions: 8,
        buckets: 2,
        ..PoolOptions::default()
    };
    let base = init_pool(
        Box::new(|_, _| NEXT_KEY.fetch_add(1, Ordering::SeqCst) + 1),
        opts.clone(),
    )
    .unwrap();
    assert_eq!(base.as_ptr() as usize % 4096, 0);
    assert_ne!(region_id(base.as_ptr()), 0);

    // Repeated init is refused.
    assert!(matches!(
        init_pool(Box::new(|_, _| 1), opts),
        Err(RdmaError::InvalidArgument(_))
    ));

    // One block per class; each lands in a registered region.
    let mut blocks = Vec::new();
    for size in [1usize, 8192, 16384, 32768, 65536] {
        let p = alloc_block(size).unwrap();
        assert_ne!(region_id(p.as_ptr()), 0, "size {size}");
        blocks.push(p);
    }

    // Out-of-range sizes are invalid.
    assert!(matches!(
        alloc_block(0),
        Err(RdmaError::InvalidArgument(_))
    ));
    assert!(matches!(
        alloc_block(65537),
        Err(RdmaError::InvalidArgument(_))
    ));

    // Misuse of dealloc.
    assert!(matches!(
        dealloc_block(std::ptr::null_mut()),
        Err(RdmaError::InvalidArgument(_))
    ));
    let on_stack = 0u8;
    assert!(matches!(
        dealloc_block(&on_stack as *const u8 as *mut u8),
        Err(RdmaError::NotFound)
    ));
    assert_eq!(region_id(&on_stack as *const u8), 0);

    for p in blocks.into_iter().rev() {
        dealloc_block(p.as_ptr()).unwrap();
    }
}
