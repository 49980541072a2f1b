//! Free-range descriptors and the object pool they are drawn from.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// How many recycled nodes the object pool caches before dropping
/// returns on the floor.
const NODE_CACHE: usize = 1024;

/// A free range inside one region: a single unused block, or a contiguous
/// run of unused blocks carved out at region-extend time. `len` is always
/// a positive multiple of the owning region's block size.
///
/// Nodes form singly-linked LIFO stacks; ownership of a node is exactly
/// its list membership.
pub(crate) struct IdleNode {
    pub start: usize,
    pub len: usize,
    pub next: Option<Box<IdleNode>>,
}

/// LIFO stack of idle nodes.
#[derive(Default)]
pub(crate) struct IdleList {
    head: Option<Box<IdleNode>>,
}

impl IdleList {
    pub fn push(&mut self, mut node: Box<IdleNode>) {
        node.next = self.head.take();
        self.head = Some(node);
    }

    pub fn pop(&mut self) -> Option<Box<IdleNode>> {
        self.head.take().map(|mut node| {
            self.head = node.next.take();
            node
        })
    }

    pub fn peek_mut(&mut self) -> Option<&mut IdleNode> {
        self.head.as_deref_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Total bytes described by the stack.
    pub fn total_len(&self) -> usize {
        let mut sum = 0;
        let mut cur = self.head.as_deref();
        while let Some(node) = cur {
            sum += node.len;
            cur = node.next.as_deref();
        }
        sum
    }

    /// Detach the first node matching `pred`; the rest keep their place.
    pub fn remove_first(&mut self, pred: impl Fn(&IdleNode) -> bool) -> Option<Box<IdleNode>> {
        let mut skipped = IdleList::default();
        let mut found = None;
        while let Some(node) = self.pop() {
            if pred(&node) {
                found = Some(node);
                break;
            }
            skipped.push(node);
        }
        while let Some(node) = skipped.pop() {
            self.push(node);
        }
        found
    }
}

/// Thread-safe object pool for idle nodes, with a hard cap on how many
/// may exist at once.
///
/// `acquire` can refuse; every caller has a documented fallback (extend
/// backs out, dealloc leaks the block). Recycled nodes are cached up to
/// [`NODE_CACHE`]; past that a returned node is simply dropped.
pub(crate) struct NodePool {
    cache: ArrayQueue<Box<IdleNode>>,
    live: AtomicUsize,
    cap: usize,
}

impl NodePool {
    pub fn new(cap: usize) -> Self {
        Self {
            cache: ArrayQueue::new(NODE_CACHE),
            live: AtomicUsize::new(0),
            cap,
        }
    }

    /// A node describing `[start, start + len)`, recycled when possible.
    /// `None` once `cap` nodes are outstanding.
    pub fn acquire(&self, start: usize, len: usize) -> Option<Box<IdleNode>> {
        if let Some(mut node) = self.cache.pop() {
            node.start = start;
            node.len = len;
            debug_assert!(node.next.is_none());
            return Some(node);
        }
        let mut live = self.live.load(Ordering::Relaxed);
        loop {
            if live >= self.cap {
                return None;
            }
            match self
                .live
                .compare_exchange_weak(live, live + 1, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(cur) => live = cur,
            }
        }
        Some(Box::new(IdleNode {
            start,
            len,
            next: None,
        }))
    }

    /// Return a node. If the cache is full the node is dropped and its
    /// slot in the live count frees up.
    pub fn release(&self, mut node: Box<IdleNode>) {
        node.next = None;
        if self.cache.push(node).is_err() {
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_lifo() {
        let pool = NodePool::new(16);
        let mut list = IdleList::default();
        list.push(pool.acquire(0x1000, 64).unwrap());
        list.push(pool.acquire(0x2000, 64).unwrap());
        assert_eq!(list.total_len(), 128);
        assert_eq!(list.pop().unwrap().start, 0x2000);
        assert_eq!(list.pop().unwrap().start, 0x1000);
        assert!(list.pop().is_none());
    }

    #[test]
    fn remove_first_keeps_non_matching_nodes() {
        let pool = NodePool::new(16);
        let mut list = IdleList::default();
        for start in [0x1000, 0x2000, 0x3000] {
            list.push(pool.acquire(start, 64).unwrap());
        }
        let node = list.remove_first(|n| n.start == 0x2000).unwrap();
        assert_eq!(node.start, 0x2000);
        assert!(list.remove_first(|n| n.start == 0x2000).is_none());
        assert_eq!(list.total_len(), 128);
    }

    #[test]
    fn pool_refuses_past_cap_and_recovers_on_release() {
        let pool = NodePool::new(2);
        let a = pool.acquire(0x1000, 64).unwrap();
        let b = pool.acquire(0x2000, 64).unwrap();
        assert!(pool.acquire(0x3000, 64).is_none());
        pool.release(a);
        // The released node is recycled from the cache.
        let c = pool.acquire(0x4000, 64).unwrap();
        assert_eq!(c.start, 0x4000);
        pool.release(b);
        pool.release(c);
    }
}
