//! The seam between the CM endpoint state machine and a device backend.
//!
//! Backends are sealed: the crate ships the rdmacm one (feature `rdma`)
//! and an in-process loopback one for tests. A build without either has
//! no way to construct an endpoint, which is exactly the zero-capability
//! surface wanted on machines without RDMA.

use crate::cm::event::RawCmEvent;
use crate::error::Result;
use crate::verbs::{CqHandle, QpHandle};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

pub(crate) mod sealed {
    pub trait Sealed {}
}

/// Capacity and identity of a queue pair to attach to a CM identifier.
#[derive(Debug, Clone, Copy)]
pub struct QpConfig {
    /// Send queue depth.
    pub sq_size: u32,
    /// Receive queue depth.
    pub rq_size: u32,
    /// Completion queue for both send and receive work, owned by the
    /// caller.
    pub cq: CqHandle,
    /// Opaque upper-layer connection handle, stored as the QP context.
    pub ctx_id: u64,
}

/// One connection-management identifier.
///
/// Owns an event channel fd (non-blocking, close-on-exec), optionally a
/// bound local address, optionally an attached QP, and at most one
/// pending (unacknowledged) event at any instant.
pub trait CmId: sealed::Sealed + Send {
    /// Bind to `local` and start listening.
    fn bind_listen(&mut self, local: SocketAddrV4, backlog: i32) -> Result<()>;

    /// Pop the next queued connection request as a fresh identifier whose
    /// pending event carries the peer's private data. `Ok(None)` when the
    /// queue is empty.
    fn take_request(&mut self) -> Result<Option<Box<dyn CmId>>>;

    /// Complete the server side of the handshake.
    fn accept(&mut self, private_data: &[u8]) -> Result<()>;

    /// Start the client side of the handshake.
    fn connect(&mut self, private_data: &[u8]) -> Result<()>;

    /// Resolve the destination. `src` pins the source NIC when set.
    fn resolve_addr(
        &mut self,
        src: Option<Ipv4Addr>,
        dst: SocketAddrV4,
        timeout_ms: i32,
    ) -> Result<()>;

    /// Resolve a route to the resolved destination.
    fn resolve_route(&mut self, timeout_ms: i32) -> Result<()>;

    /// Whether an event is awaiting acknowledgement.
    fn has_pending_event(&self) -> bool;

    /// Acknowledge and release the pending event.
    fn ack_event(&mut self) -> Result<()>;

    /// Fetch the next event; it becomes the pending event. `Ok(None)`
    /// when the non-blocking channel has nothing queued.
    fn fetch_event(&mut self) -> Result<Option<RawCmEvent>>;

    /// Private data carried by the pending event; empty otherwise.
    fn conn_data(&self) -> &[u8];

    /// Create a reliable-connected QP bound to this identifier.
    fn create_qp(&mut self, cfg: &QpConfig) -> Result<QpHandle>;

    /// Destroy the attached QP, leaving its completion queue untouched.
    /// Idempotent.
    fn release_qp(&mut self);

    /// The event channel's file descriptor, for the caller's poller.
    fn fd(&self) -> RawFd;
}

/// Factory for CM identifiers plus the device identity they share.
pub trait CmProvider: sealed::Sealed + Send + Sync {
    fn create_id(&self) -> Result<Box<dyn CmId>>;

    /// Address of the RDMA-capable NIC this provider is bound to, used
    /// as the source for connections to local destinations.
    fn local_ip(&self) -> Option<Ipv4Addr>;
}
