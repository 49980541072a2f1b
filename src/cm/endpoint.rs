//! The connection-manager endpoint.
//!
//! A thin, non-blocking facade over one CM identifier. The caller drives
//! a handshake state machine from the events [`CmEndpoint::poll_event`]
//! returns; the expected client sequence is
//!
//! 1. [`CmEndpoint::create`]
//! 2. [`CmEndpoint::resolve_addr`] → `AddrResolved`
//! 3. [`CmEndpoint::resolve_route`] → `RouteResolved`
//! 4. [`CmEndpoint::create_qp`]
//! 5. [`CmEndpoint::connect`] → `Established`
//!
//! and the server side is [`CmEndpoint::listen`] →
//! [`CmEndpoint::get_request`] → [`CmEndpoint::accept`] → `Established`.
//!
//! Nothing here blocks on I/O: the caller parks on [`CmEndpoint::fd`]
//! with its own poller and pumps events when the fd turns readable. All
//! operations on one endpoint must be serialised by the caller;
//! different endpoints are independent.

use crate::cm::driver::{CmId, CmProvider, QpConfig};
use crate::cm::event::{self, CmEvent};
use crate::config::RdmaConfig;
use crate::error::Result;
use crate::net;
use crate::verbs::{CqHandle, QpHandle};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::unix::io::RawFd;

pub struct CmEndpoint {
    id: Box<dyn CmId>,
    conn_timeout_ms: i32,
    local_ip: Option<Ipv4Addr>,
}

impl CmEndpoint {
    /// A fresh identifier with TCP port-space semantics. Its event fd is
    /// non-blocking and close-on-exec.
    pub fn create(provider: &dyn CmProvider, cfg: &RdmaConfig) -> Result<Self> {
        Ok(Self {
            id: provider.create_id()?,
            conn_timeout_ms: cfg.conn_timeout_ms,
            local_ip: provider.local_ip(),
        })
    }

    /// A listening endpoint bound to `local`.
    pub fn listen(
        provider: &dyn CmProvider,
        local: SocketAddrV4,
        cfg: &RdmaConfig,
    ) -> Result<Self> {
        let mut ep = Self::create(provider, cfg)?;
        ep.id.bind_listen(local, cfg.backlog)?;
        Ok(ep)
    }

    /// The next incoming connection request as a new endpoint, or `None`
    /// when nothing is queued (an empty queue is not an error; other
    /// failures are logged and also return `None`).
    ///
    /// The peer's private data is readable through the returned
    /// endpoint's [`CmEndpoint::conn_data`] until its event pump
    /// advances. Call [`CmEndpoint::accept`] on it to complete the
    /// handshake.
    pub fn get_request(&mut self) -> Option<CmEndpoint> {
        match self.id.take_request() {
            Ok(Some(id)) => Some(CmEndpoint {
                id,
                conn_timeout_ms: self.conn_timeout_ms,
                local_ip: self.local_ip,
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("failed to take connection request: {e}");
                None
            }
        }
    }

    /// Complete the server side of the handshake, sending `private_data`
    /// to the peer.
    pub fn accept(&mut self, private_data: &[u8]) -> Result<()> {
        self.id.accept(private_data)
    }

    /// Start the client side of the handshake, sending `private_data` to
    /// the peer.
    pub fn connect(&mut self, private_data: &[u8]) -> Result<()> {
        self.id.connect(private_data)
    }

    /// Begin resolving `remote`. A destination on this host is reached
    /// through the RDMA NIC's own address: device resources are bound to
    /// one NIC, so loopback and wildcard sources cannot be used. For a
    /// remote destination the kernel picks the source.
    pub fn resolve_addr(&mut self, remote: SocketAddrV4) -> Result<()> {
        let src = if net::is_local_ip(*remote.ip()) {
            self.local_ip
        } else {
            None
        };
        self.id.resolve_addr(src, remote, self.conn_timeout_ms / 2)
    }

    /// Begin resolving a route to the resolved destination.
    pub fn resolve_route(&mut self) -> Result<()> {
        self.id.resolve_route(self.conn_timeout_ms / 2)
    }

    /// Advance the event pump: acknowledge the previous event, fetch the
    /// next, decode it.
    ///
    /// Non-blocking; returns [`CmEvent::None`] when the channel is
    /// empty. Failures collapse to [`CmEvent::Error`] because the
    /// caller's recovery is the same either way: tear the endpoint down.
    pub fn poll_event(&mut self) -> CmEvent {
        if self.id.has_pending_event() {
            if let Err(e) = self.id.ack_event() {
                tracing::warn!("failed to acknowledge CM event: {e}");
                return CmEvent::Error;
            }
        }
        match self.id.fetch_event() {
            Ok(Some(raw)) => event::decode(raw),
            Ok(None) => CmEvent::None,
            Err(e) => {
                tracing::warn!("failed to fetch CM event: {e}");
                CmEvent::Error
            }
        }
    }

    /// Create a reliable-connected QP on this identifier with send and
    /// receive work posted to `cq`. Completions are selectively
    /// signalled; the transport decides which work requests report.
    /// `ctx_id` is an opaque upper-layer connection handle stored as the
    /// QP context.
    pub fn create_qp(
        &mut self,
        sq_size: u32,
        rq_size: u32,
        cq: CqHandle,
        ctx_id: u64,
    ) -> Result<QpHandle> {
        self.id.create_qp(&QpConfig {
            sq_size,
            rq_size,
            cq,
            ctx_id,
        })
    }

    /// Destroy the attached QP without touching its completion queue.
    /// Idempotent; also runs on endpoint drop, before the identifier is
    /// released.
    pub fn release_qp(&mut self) {
        self.id.release_qp();
    }

    /// The event channel's fd, for the caller's poller.
    pub fn fd(&self) -> RawFd {
        self.id.fd()
    }

    /// Private data carried by the most recent event, valid until the
    /// next [`CmEndpoint::poll_event`]. Copy out anything needed across
    /// the pump.
    pub fn conn_data(&self) -> &[u8] {
        self.id.conn_data()
    }
}
