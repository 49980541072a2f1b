//! In-process loopback CM backend.
//!
//! A [`FakeFabric`] plays the role of the device: identifiers created
//! from it talk to each other through per-identifier event inboxes, and
//! each inbox mirrors its occupancy into a pipe so [`CmId::fd`] is a
//! real pollable descriptor. Registration keys are handed out
//! sequentially, so the fabric also serves as the pool's
//! [`VerbsGateway`]. Everything observable about an identifier
//! (acknowledge counts, pending state, the resolved source address, the
//! attached QP's attributes) is recorded for assertions.

use crate::cm::driver::{sealed, CmId, CmProvider, QpConfig};
use crate::cm::event::RawCmEvent;
use crate::error::{RdmaError, Result};
use crate::lock;
use crate::verbs::{PdHandle, QpHandle, VerbsGateway};
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::raw::c_void;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Event inbox shared between an identifier and its peer: a FIFO of raw
/// events plus a pipe mirroring queue occupancy.
struct Inbox {
    events: Mutex<VecDeque<(RawCmEvent, Vec<u8>)>>,
    read_fd: RawFd,
    write_fd: RawFd,
}

impl Inbox {
    fn new() -> Result<Arc<Self>> {
        let mut fds = [0i32; 2];
        // Safety: `fds` is a valid two-element buffer.
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(RdmaError::device_with_source(
                "pipe2 failed",
                std::io::Error::last_os_error(),
            ));
        }
        Ok(Arc::new(Self {
            events: Mutex::new(VecDeque::new()),
            read_fd: fds[0],
            write_fd: fds[1],
        }))
    }

    fn push(&self, ev: RawCmEvent, data: Vec<u8>) {
        lock(&self.events).push_back((ev, data));
        let byte = [1u8];
        // Safety: write_fd stays open for the inbox's lifetime; a full
        // pipe just leaves the fd readable already.
        unsafe { libc::write(self.write_fd, byte.as_ptr() as *const c_void, 1) };
    }

    fn pop(&self) -> Option<(RawCmEvent, Vec<u8>)> {
        let item = lock(&self.events).pop_front();
        if item.is_some() {
            let mut byte = [0u8];
            // Safety: read_fd stays open for the inbox's lifetime.
            unsafe { libc::read(self.read_fd, byte.as_mut_ptr() as *mut c_void, 1) };
        }
        item
    }
}

impl Drop for Inbox {
    fn drop(&mut self) {
        // Safety: the fds were created by pipe2 and are closed exactly
        // once.
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// The reliable-connected QP attributes a fake identifier records at
/// attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeQpRecord {
    pub sq_size: u32,
    pub rq_size: u32,
    pub ctx_id: u64,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
    pub sig_all: bool,
}

/// Observable state of one fake identifier.
#[derive(Default)]
pub struct FakeIdState {
    acks: AtomicUsize,
    pending: AtomicBool,
    fail_fetch: AtomicBool,
    resolved_src: Mutex<Option<Ipv4Addr>>,
    qp: Mutex<Option<FakeQpRecord>>,
}

impl FakeIdState {
    /// How many events were acknowledged on this identifier.
    pub fn ack_count(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    /// Whether an unacknowledged event is retained right now.
    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Make the next event fetch fail, as a dead device would.
    pub fn fail_next_fetch(&self) {
        self.fail_fetch.store(true, Ordering::SeqCst);
    }

    /// The source address the identifier resolved with, if pinned.
    pub fn resolved_src(&self) -> Option<Ipv4Addr> {
        *lock(&self.resolved_src)
    }

    /// Attributes of the attached QP, if one was created.
    pub fn qp_record(&self) -> Option<FakeQpRecord> {
        *lock(&self.qp)
    }
}

#[derive(Clone)]
struct ListenerEntry {
    requests: Arc<Mutex<VecDeque<FakeId>>>,
    inbox: Arc<Inbox>,
}

/// An in-process stand-in for the RDMA device and its CM.
pub struct FakeFabric {
    nic_ip: Ipv4Addr,
    listeners: Mutex<HashMap<SocketAddrV4, ListenerEntry>>,
    states: Mutex<Vec<Arc<FakeIdState>>>,
    live_qps: AtomicUsize,
    next_key: AtomicU32,
    next_port: AtomicU16,
}

impl FakeFabric {
    pub fn new(nic_ip: Ipv4Addr) -> Arc<Self> {
        Arc::new(Self {
            nic_ip,
            listeners: Mutex::new(HashMap::new()),
            states: Mutex::new(Vec::new()),
            live_qps: AtomicUsize::new(0),
            next_key: AtomicU32::new(0),
            next_port: AtomicU16::new(40000),
        })
    }

    /// Observable states of every identifier created so far, in creation
    /// order (each accepted request creates one more on the server
    /// side).
    pub fn id_states(&self) -> Vec<Arc<FakeIdState>> {
        lock(&self.states).clone()
    }

    /// QPs currently attached across the fabric.
    pub fn live_qps(&self) -> usize {
        self.live_qps.load(Ordering::SeqCst)
    }

    fn new_state(&self) -> Arc<FakeIdState> {
        let state = Arc::new(FakeIdState::default());
        lock(&self.states).push(state.clone());
        state
    }
}

impl sealed::Sealed for FakeFabric {}
impl sealed::Sealed for Arc<FakeFabric> {}

impl VerbsGateway for FakeFabric {
    fn register_region(&self, _base: *mut u8, _len: usize) -> u32 {
        self.next_key.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn protection_domain(&self) -> PdHandle {
        PdHandle::from_raw(std::ptr::null_mut())
    }

    fn max_sge(&self) -> u32 {
        4
    }

    fn destroy_qp(&self, _qp: QpHandle) {}
}

impl CmProvider for Arc<FakeFabric> {
    fn create_id(&self) -> Result<Box<dyn CmId>> {
        Ok(Box::new(FakeId {
            inbox: Inbox::new()?,
            state: self.new_state(),
            fabric: Arc::clone(self),
            peer: None,
            requests: None,
            bound: None,
            resolved_dst: None,
            pending: None,
            conn_data: Vec::new(),
            qp: None,
        }))
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        Some(self.nic_ip)
    }
}

pub(crate) struct FakeId {
    fabric: Arc<FakeFabric>,
    inbox: Arc<Inbox>,
    state: Arc<FakeIdState>,
    peer: Option<Arc<Inbox>>,
    requests: Option<Arc<Mutex<VecDeque<FakeId>>>>,
    bound: Option<SocketAddrV4>,
    resolved_dst: Option<SocketAddrV4>,
    pending: Option<RawCmEvent>,
    conn_data: Vec<u8>,
    qp: Option<Box<FakeQpRecord>>,
}

impl sealed::Sealed for FakeId {}

impl CmId for FakeId {
    fn bind_listen(&mut self, local: SocketAddrV4, _backlog: i32) -> Result<()> {
        let mut addr = local;
        if addr.port() == 0 {
            addr.set_port(self.fabric.next_port.fetch_add(1, Ordering::SeqCst));
        }
        let mut listeners = lock(&self.fabric.listeners);
        if listeners.contains_key(&addr) {
            return Err(RdmaError::device("address already in use"));
        }
        let requests = Arc::new(Mutex::new(VecDeque::new()));
        listeners.insert(
            addr,
            ListenerEntry {
                requests: Arc::clone(&requests),
                inbox: Arc::clone(&self.inbox),
            },
        );
        self.requests = Some(requests);
        self.bound = Some(addr);
        Ok(())
    }

    fn take_request(&mut self) -> Result<Option<Box<dyn CmId>>> {
        let Some(requests) = &self.requests else {
            return Err(RdmaError::InvalidArgument("identifier is not listening"));
        };
        // Consuming the request event also drains its readiness byte.
        if self.inbox.pop().is_none() {
            return Ok(None);
        }
        match lock(requests).pop_front() {
            Some(child) => Ok(Some(Box::new(child))),
            None => Ok(None),
        }
    }

    fn accept(&mut self, private_data: &[u8]) -> Result<()> {
        let Some(peer) = &self.peer else {
            return Err(RdmaError::InvalidArgument("no connection to accept"));
        };
        // The acceptor's private data rides on the peer's ESTABLISHED
        // event, the way rdmacm delivers it.
        peer.push(RawCmEvent::Established, private_data.to_vec());
        self.inbox.push(RawCmEvent::Established, Vec::new());
        Ok(())
    }

    fn connect(&mut self, private_data: &[u8]) -> Result<()> {
        let Some(dst) = self.resolved_dst else {
            return Err(RdmaError::InvalidArgument("destination not resolved"));
        };
        let entry = {
            let listeners = lock(&self.fabric.listeners);
            match listeners.get(&dst) {
                Some(entry) => entry.clone(),
                None => return Err(RdmaError::device("connection refused")),
            }
        };

        let child_inbox = Inbox::new()?;
        let child_state = self.fabric.new_state();
        child_state.pending.store(true, Ordering::SeqCst);
        let child = FakeId {
            fabric: Arc::clone(&self.fabric),
            inbox: Arc::clone(&child_inbox),
            state: child_state,
            peer: Some(Arc::clone(&self.inbox)),
            requests: None,
            bound: None,
            resolved_dst: None,
            // The migrated connection request is the child's pending
            // event; its private data is readable until the pump
            // advances.
            pending: Some(RawCmEvent::ConnectRequest),
            conn_data: private_data.to_vec(),
            qp: None,
        };
        self.peer = Some(child_inbox);
        lock(&entry.requests).push_back(child);
        entry.inbox.push(RawCmEvent::ConnectRequest, Vec::new());
        Ok(())
    }

    fn resolve_addr(
        &mut self,
        src: Option<Ipv4Addr>,
        dst: SocketAddrV4,
        _timeout_ms: i32,
    ) -> Result<()> {
        *lock(&self.state.resolved_src) = src;
        self.resolved_dst = Some(dst);
        self.inbox.push(RawCmEvent::AddrResolved, Vec::new());
        Ok(())
    }

    fn resolve_route(&mut self, _timeout_ms: i32) -> Result<()> {
        if self.resolved_dst.is_none() {
            return Err(RdmaError::InvalidArgument("destination not resolved"));
        }
        self.inbox.push(RawCmEvent::RouteResolved, Vec::new());
        Ok(())
    }

    fn has_pending_event(&self) -> bool {
        self.pending.is_some()
    }

    fn ack_event(&mut self) -> Result<()> {
        if self.pending.take().is_some() {
            self.conn_data.clear();
            self.state.acks.fetch_add(1, Ordering::SeqCst);
            self.state.pending.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn fetch_event(&mut self) -> Result<Option<RawCmEvent>> {
        if self.state.fail_fetch.swap(false, Ordering::SeqCst) {
            return Err(RdmaError::device("event channel broken"));
        }
        match self.inbox.pop() {
            Some((ev, data)) => {
                self.pending = Some(ev);
                self.conn_data = data;
                self.state.pending.store(true, Ordering::SeqCst);
                Ok(Some(ev))
            }
            None => Ok(None),
        }
    }

    fn conn_data(&self) -> &[u8] {
        &self.conn_data
    }

    fn create_qp(&mut self, cfg: &QpConfig) -> Result<QpHandle> {
        if self.qp.is_some() {
            return Err(RdmaError::device("identifier already has a QP"));
        }
        let record = FakeQpRecord {
            sq_size: cfg.sq_size,
            rq_size: cfg.rq_size,
            ctx_id: cfg.ctx_id,
            max_send_sge: self.fabric.max_sge(),
            max_recv_sge: 1,
            max_inline_data: 64,
            sig_all: false,
        };
        *lock(&self.state.qp) = Some(record);
        let qp = Box::new(record);
        let handle = QpHandle::from_raw(&*qp as *const FakeQpRecord as *mut c_void);
        self.qp = Some(qp);
        self.fabric.live_qps.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    fn release_qp(&mut self) {
        if self.qp.take().is_some() {
            self.fabric.live_qps.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn fd(&self) -> RawFd {
        self.inbox.read_fd
    }
}

impl Drop for FakeId {
    fn drop(&mut self) {
        // QP first, then the identifier's remaining resources.
        self.release_qp();
        if let Some(addr) = self.bound.take() {
            lock(&self.fabric.listeners).remove(&addr);
        }
        if let Some(peer) = self.peer.take() {
            peer.push(RawCmEvent::Disconnected, Vec::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BlockPool, PoolOptions};

    #[test]
    fn fake_verbs_hands_out_distinct_nonzero_keys() {
        let fabric = FakeFabric::new(Ipv4Addr::new(192, 168, 100, 7));
        let cb_fabric = Arc::clone(&fabric);
        let pool = BlockPool::new(
            Box::new(move |base, len| cb_fabric.register_region(base, len)),
            PoolOptions {
                initial_size_mb: 64,
                increase_size_mb: 64,
                max_regions: 4,
                buckets: 1,
                ..PoolOptions::default()
            },
        )
        .unwrap();

        let small = pool.alloc(8192).unwrap();
        let large = pool.alloc(65536).unwrap();
        let small_id = pool.region_id(small.as_ptr() as usize);
        let large_id = pool.region_id(large.as_ptr() as usize);
        assert_ne!(small_id, 0);
        assert_ne!(large_id, 0);
        assert_ne!(small_id, large_id);
        pool.dealloc(small).unwrap();
        pool.dealloc(large).unwrap();
    }

    #[test]
    fn listener_rejects_duplicate_bind() {
        let fabric = FakeFabric::new(Ipv4Addr::new(192, 168, 100, 7));
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7001);
        let mut a = fabric.create_id().unwrap();
        let mut b = fabric.create_id().unwrap();
        a.bind_listen(addr, 1024).unwrap();
        assert!(b.bind_listen(addr, 1024).is_err());
        drop(a);
        // The address frees up once the listener is gone.
        let mut c = fabric.create_id().unwrap();
        c.bind_listen(addr, 1024).unwrap();
    }

    #[test]
    fn wildcard_port_gets_assigned() {
        let fabric = FakeFabric::new(Ipv4Addr::new(192, 168, 100, 7));
        let mut a = fabric.create_id().unwrap();
        a.bind_listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 1024)
            .unwrap();
        let mut b = fabric.create_id().unwrap();
        b.bind_listen(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), 1024)
            .unwrap();
    }
}
