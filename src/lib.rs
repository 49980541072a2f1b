//! RDMA substrate for the Helix RPC framework.
//!
//! Two subsystems sit at the boundary between the RPC transport and the
//! RDMA device:
//!
//! - [`cm`] — a thin, non-blocking facade over a connection-manager
//!   identifier: listen/accept/connect handshakes, address and route
//!   resolution, queue-pair lifecycle, and event demultiplexing. The
//!   caller parks on [`cm::CmEndpoint::fd`] with its own poller and
//!   pumps events when the fd turns readable.
//! - [`pool`] — a process-wide, size-classed block pool whose blocks
//!   are carved from pre-registered memory regions, so every buffer
//!   already carries the registration key a work request needs.
//!
//! The device surface is abstracted behind [`verbs::VerbsGateway`]; the
//! real rdmacm/verbs backend is compiled in with the `rdma` feature,
//! and without it the build has no way to reach a device at all.

pub mod cm;
pub mod config;
pub mod error;
mod net;
pub mod pool;
pub mod verbs;

pub use cm::{CmEndpoint, CmEvent};
pub use config::RdmaConfig;
pub use error::{RdmaError, Result};
pub use pool::{
    alloc_block, dealloc_block, init_pool, region_id, BlockPool, PoolOptions, RegisterCallback,
};
pub use verbs::{CqHandle, PdHandle, QpHandle, VerbsGateway};

/// Lock a mutex, riding through poisoning: every critical section in
/// the pool and the fake fabric leaves the data consistent between
/// statements, and propagating the poison would only turn one failed
/// thread into many.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
