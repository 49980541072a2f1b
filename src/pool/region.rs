//! Registered memory regions indexed by address range.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use crate::error::{RdmaError, Result};

/// Hard cap on registered regions per pool. Registration pins memory and
/// regions are hundreds of MiB each, so the table never grows past a
/// handful of entries.
pub const MAX_REGIONS: usize = 16;

/// A contiguous, page-aligned range registered with the RDMA device.
/// Immutable once published, until the pool is destroyed.
#[derive(Debug, Clone, Copy)]
pub struct Region {
    pub start: usize,
    pub size: usize,
    /// Size class every block carved from this region belongs to.
    pub block_class: usize,
    /// Registration key (lkey). Zero is reserved for "not registered".
    pub id: u32,
}

impl Region {
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.start + self.size
    }
}

/// Append-only table of registered regions with lock-free reads.
///
/// Slots fill densely from index 0. Writers publish under the pool's
/// extend lock: the slot is written first, then `count` is bumped with
/// Release ordering, so a reader that observes the new count also
/// observes the slot contents. The linear scan is intentional; the table
/// holds at most [`MAX_REGIONS`] entries.
pub struct RegionTable {
    slots: [OnceLock<Region>; MAX_REGIONS],
    count: AtomicUsize,
}

impl RegionTable {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| OnceLock::new()),
            count: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Publish a region into the first empty slot. Caller must hold the
    /// extend lock; concurrent publishes are not supported.
    pub fn publish(&self, region: Region) -> Result<()> {
        let idx = self.count.load(Ordering::Relaxed);
        if idx >= MAX_REGIONS {
            return Err(RdmaError::OutOfMemory("region table is full"));
        }
        if self.slots[idx].set(region).is_err() {
            return Err(RdmaError::OutOfMemory("region slot already occupied"));
        }
        self.count.store(idx + 1, Ordering::Release);
        Ok(())
    }

    pub fn get(&self, idx: usize) -> Option<&Region> {
        if idx >= self.len() {
            return None;
        }
        self.slots[idx].get()
    }

    /// The unique region containing `addr`, if any. The table fills
    /// densely, so the scan stops at the first empty slot.
    pub fn region_of(&self, addr: usize) -> Option<&Region> {
        for slot in self.slots.iter().take(self.len()) {
            match slot.get() {
                Some(r) if r.contains(addr) => return Some(r),
                Some(_) => continue,
                None => break,
            }
        }
        None
    }

    /// Registration key of the region containing `addr`; 0 when unknown.
    pub fn region_id(&self, addr: usize) -> u32 {
        self.region_of(addr).map_or(0, |r| r.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: usize, size: usize, id: u32) -> Region {
        Region {
            start,
            size,
            block_class: 0,
            id,
        }
    }

    #[test]
    fn resolves_addresses_to_their_region() {
        let table = RegionTable::new();
        table.publish(region(0x10000, 0x1000, 7)).unwrap();
        table.publish(region(0x20000, 0x2000, 9)).unwrap();

        assert_eq!(table.region_id(0x10000), 7);
        assert_eq!(table.region_id(0x10fff), 7);
        assert_eq!(table.region_id(0x11000), 0);
        assert_eq!(table.region_id(0x21fff), 9);
        assert_eq!(table.region_id(0x5000), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn rejects_publish_past_capacity() {
        let table = RegionTable::new();
        for i in 0..MAX_REGIONS {
            table.publish(region(0x1000 * (i + 1), 0x100, 1)).unwrap();
        }
        assert!(table.publish(region(0x100000, 0x100, 1)).is_err());
        assert_eq!(table.len(), MAX_REGIONS);
    }
}
