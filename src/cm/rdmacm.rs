//! rdmacm-backed CM identifiers.
//!
//! Raw `rdma-sys` FFI, no safe wrapper. Each identifier is created with a
//! null event channel so rdmacm allocates it a dedicated one, whose fd is
//! switched to non-blocking and close-on-exec before the identifier is
//! handed out. `release_qp` calls `ibv_destroy_qp` directly:
//! `rdma_destroy_qp` would tear down the completion queue the upper
//! transport still owns.

use crate::cm::driver::{sealed, CmId, CmProvider, QpConfig};
use crate::cm::event::RawCmEvent;
use crate::config::RdmaConfig;
use crate::error::{RdmaError, Result};
use crate::net;
use crate::verbs::{PdHandle, QpHandle, VerbsGateway};
use rdma_sys::*;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::raw::{c_int, c_void};
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::Arc;

const FLOW_CONTROL: u8 = 1;
const RETRY_COUNT: u8 = 1;
const RNR_RETRY_COUNT: u8 = 0;

/// Process-level verbs resources shared by every CM identifier: the
/// opened device, its protection domain, and the device's SGE limit.
pub struct VerbsCtx {
    ctx: *mut ibv_context,
    pd: *mut ibv_pd,
    max_sge: u32,
}

// Safety: the verbs context and PD are thread-safe device handles.
unsafe impl Send for VerbsCtx {}
unsafe impl Sync for VerbsCtx {}

impl VerbsCtx {
    /// Open an RDMA device and allocate the shared protection domain.
    ///
    /// `device_index` selects which device to use (default: first).
    pub fn open(device_index: Option<usize>) -> Result<Self> {
        unsafe {
            let mut num_devices: c_int = 0;
            let dev_list = ibv_get_device_list(&mut num_devices);
            if dev_list.is_null() || num_devices == 0 {
                return Err(RdmaError::device("no RDMA devices found"));
            }

            let idx = device_index.unwrap_or(0);
            if idx >= num_devices as usize {
                ibv_free_device_list(dev_list);
                return Err(RdmaError::device(format!(
                    "RDMA device index {idx} out of range (have {num_devices})"
                )));
            }

            let dev = *dev_list.add(idx);
            let ctx = ibv_open_device(dev);
            ibv_free_device_list(dev_list);
            if ctx.is_null() {
                return Err(RdmaError::device("ibv_open_device failed"));
            }

            let pd = ibv_alloc_pd(ctx);
            if pd.is_null() {
                ibv_close_device(ctx);
                return Err(RdmaError::device("ibv_alloc_pd failed"));
            }

            let mut attr: ibv_device_attr = std::mem::zeroed();
            let rc = ibv_query_device(ctx, &mut attr);
            if rc != 0 {
                ibv_dealloc_pd(pd);
                ibv_close_device(ctx);
                return Err(RdmaError::device(format!(
                    "ibv_query_device failed (rc={rc})"
                )));
            }

            Ok(Self {
                ctx,
                pd,
                max_sge: attr.max_sge as u32,
            })
        }
    }
}

impl VerbsGateway for VerbsCtx {
    fn register_region(&self, base: *mut u8, len: usize) -> u32 {
        unsafe {
            let access =
                ibv_access_flags::IBV_ACCESS_LOCAL_WRITE | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
            let mr = ibv_reg_mr(self.pd, base as *mut c_void, len, access.0 as c_int);
            if mr.is_null() {
                0
            } else {
                (*mr).lkey
            }
        }
    }

    fn protection_domain(&self) -> PdHandle {
        PdHandle::from_raw(self.pd as *mut c_void)
    }

    fn max_sge(&self) -> u32 {
        self.max_sge
    }

    fn destroy_qp(&self, qp: QpHandle) {
        let raw = qp.as_raw() as *mut ibv_qp;
        if !raw.is_null() {
            // The CQ the QP references belongs to the upper transport.
            unsafe { ibv_destroy_qp(raw) };
        }
    }
}

impl Drop for VerbsCtx {
    fn drop(&mut self) {
        unsafe {
            if !self.pd.is_null() {
                ibv_dealloc_pd(self.pd);
            }
            if !self.ctx.is_null() {
                ibv_close_device(self.ctx);
            }
        }
    }
}

/// rdmacm-backed provider: opens the device once and stamps out
/// identifiers sharing its protection domain.
pub struct RdmaCmProvider {
    verbs: Arc<VerbsCtx>,
    local_ip: Option<Ipv4Addr>,
}

impl RdmaCmProvider {
    pub fn new(cfg: &RdmaConfig) -> Result<Self> {
        Ok(Self {
            verbs: Arc::new(VerbsCtx::open(None)?),
            local_ip: net::rdma_local_ip(cfg),
        })
    }

    pub fn verbs(&self) -> &Arc<VerbsCtx> {
        &self.verbs
    }

    /// A registration callback for [`crate::pool::init_pool`] bound to
    /// this provider's device.
    pub fn register_callback(&self) -> crate::pool::RegisterCallback {
        let verbs = Arc::clone(&self.verbs);
        Box::new(move |base, len| verbs.register_region(base, len))
    }
}

impl sealed::Sealed for RdmaCmProvider {}

impl CmProvider for RdmaCmProvider {
    fn create_id(&self) -> Result<Box<dyn CmId>> {
        RdmaCmId::create(Arc::clone(&self.verbs)).map(|id| Box::new(id) as Box<dyn CmId>)
    }

    fn local_ip(&self) -> Option<Ipv4Addr> {
        self.local_ip
    }
}

pub(crate) struct RdmaCmId {
    id: *mut rdma_cm_id,
    /// The pending (unacknowledged) event, if any.
    event: *mut rdma_cm_event,
    conn_data: Vec<u8>,
    verbs: Arc<VerbsCtx>,
}

// Safety: rdmacm identifiers may be driven from any single thread at a
// time; the endpoint serialises access.
unsafe impl Send for RdmaCmId {}

impl sealed::Sealed for RdmaCmId {}

fn set_nonblocking_cloexec(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(RdmaError::device_with_source(
                "fcntl F_GETFL failed",
                io::Error::last_os_error(),
            ));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(RdmaError::device_with_source(
                "fcntl F_SETFL O_NONBLOCK failed",
                io::Error::last_os_error(),
            ));
        }
        let fd_flags = libc::fcntl(fd, libc::F_GETFD);
        if fd_flags < 0 {
            return Err(RdmaError::device_with_source(
                "fcntl F_GETFD failed",
                io::Error::last_os_error(),
            ));
        }
        if libc::fcntl(fd, libc::F_SETFD, fd_flags | libc::FD_CLOEXEC) < 0 {
            return Err(RdmaError::device_with_source(
                "fcntl F_SETFD FD_CLOEXEC failed",
                io::Error::last_os_error(),
            ));
        }
    }
    Ok(())
}

fn sockaddr_from(addr: SocketAddrV4) -> libc::sockaddr_in {
    // Safety: sockaddr_in is plain data.
    let mut sin: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sin.sin_family = libc::AF_INET as libc::sa_family_t;
    sin.sin_port = addr.port().to_be();
    sin.sin_addr.s_addr = u32::from(*addr.ip()).to_be();
    sin
}

fn conn_param(data: &[u8]) -> rdma_conn_param {
    // Safety: rdma_conn_param is plain data.
    let mut param: rdma_conn_param = unsafe { std::mem::zeroed() };
    if !data.is_empty() {
        param.private_data = data.as_ptr() as *const c_void;
        param.private_data_len = data.len() as u8;
    }
    param.flow_control = FLOW_CONTROL;
    param.retry_count = RETRY_COUNT;
    param.rnr_retry_count = RNR_RETRY_COUNT;
    param
}

fn map_event(ev: u32) -> RawCmEvent {
    match ev {
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => RawCmEvent::AddrResolved,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR => RawCmEvent::AddrError,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => RawCmEvent::RouteResolved,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR => RawCmEvent::RouteError,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => RawCmEvent::ConnectRequest,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_RESPONSE => RawCmEvent::ConnectResponse,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR => RawCmEvent::ConnectError,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE => RawCmEvent::Unreachable,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => RawCmEvent::Rejected,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => RawCmEvent::Established,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => RawCmEvent::Disconnected,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => RawCmEvent::DeviceRemoval,
        x if x == rdma_cm_event_type::RDMA_CM_EVENT_TIMEWAIT_EXIT => RawCmEvent::TimewaitExit,
        _ => RawCmEvent::Other,
    }
}

/// Whether an event kind carries connection parameters (and therefore
/// private data worth copying out).
fn carries_conn_param(ev: RawCmEvent) -> bool {
    matches!(
        ev,
        RawCmEvent::ConnectRequest
            | RawCmEvent::ConnectResponse
            | RawCmEvent::Established
            | RawCmEvent::Rejected
    )
}

impl RdmaCmId {
    fn create(verbs: Arc<VerbsCtx>) -> Result<Self> {
        unsafe {
            let mut id: *mut rdma_cm_id = ptr::null_mut();
            let rc = rdma_create_id(
                ptr::null_mut(),
                &mut id,
                ptr::null_mut(),
                rdma_port_space::RDMA_PS_TCP,
            );
            if rc != 0 {
                return Err(RdmaError::device_with_source(
                    "rdma_create_id failed",
                    io::Error::last_os_error(),
                ));
            }
            let fd = (*(*id).channel).fd;
            if let Err(e) = set_nonblocking_cloexec(fd) {
                rdma_destroy_id(id);
                return Err(e);
            }
            Ok(Self {
                id,
                event: ptr::null_mut(),
                conn_data: Vec::new(),
                verbs,
            })
        }
    }

    /// Copy out the private data of the current event, when it has any.
    unsafe fn copy_conn_data(&mut self, kind: RawCmEvent) {
        self.conn_data.clear();
        if !carries_conn_param(kind) || self.event.is_null() {
            return;
        }
        let conn = &(*self.event).param.conn;
        if !conn.private_data.is_null() && conn.private_data_len > 0 {
            self.conn_data.extend_from_slice(std::slice::from_raw_parts(
                conn.private_data as *const u8,
                conn.private_data_len as usize,
            ));
        }
    }
}

impl CmId for RdmaCmId {
    fn bind_listen(&mut self, local: SocketAddrV4, backlog: i32) -> Result<()> {
        unsafe {
            let mut sin = sockaddr_from(local);
            if rdma_bind_addr(self.id, &mut sin as *mut libc::sockaddr_in as *mut _) != 0 {
                return Err(RdmaError::device_with_source(
                    "rdma_bind_addr failed",
                    io::Error::last_os_error(),
                ));
            }
            if rdma_listen(self.id, backlog) != 0 {
                return Err(RdmaError::device_with_source(
                    "rdma_listen failed",
                    io::Error::last_os_error(),
                ));
            }
        }
        Ok(())
    }

    fn take_request(&mut self) -> Result<Option<Box<dyn CmId>>> {
        unsafe {
            let mut new_id: *mut rdma_cm_id = ptr::null_mut();
            if rdma_get_request(self.id, &mut new_id) != 0 || new_id.is_null() {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    return Ok(None);
                }
                return Err(RdmaError::device_with_source(
                    "rdma_get_request failed",
                    err,
                ));
            }

            let fd = (*(*new_id).channel).fd;
            if let Err(e) = set_nonblocking_cloexec(fd) {
                rdma_destroy_id(new_id);
                return Err(e);
            }

            // The connection-request event migrates to the new
            // identifier; it stays pending there until its pump advances.
            let mut child = RdmaCmId {
                id: new_id,
                event: (*new_id).event,
                conn_data: Vec::new(),
                verbs: Arc::clone(&self.verbs),
            };
            child.copy_conn_data(RawCmEvent::ConnectRequest);
            Ok(Some(Box::new(child)))
        }
    }

    fn accept(&mut self, private_data: &[u8]) -> Result<()> {
        if private_data.len() > u8::MAX as usize {
            return Err(RdmaError::InvalidArgument("private data above 255 bytes"));
        }
        let mut param = conn_param(private_data);
        // Safety: `param` borrows `private_data` only for this call.
        let rc = unsafe { rdma_accept(self.id, &mut param) };
        if rc != 0 {
            return Err(RdmaError::device_with_source(
                "rdma_accept failed",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn connect(&mut self, private_data: &[u8]) -> Result<()> {
        if private_data.len() > u8::MAX as usize {
            return Err(RdmaError::InvalidArgument("private data above 255 bytes"));
        }
        let mut param = conn_param(private_data);
        // Safety: as in `accept`.
        let rc = unsafe { rdma_connect(self.id, &mut param) };
        if rc != 0 {
            return Err(RdmaError::device_with_source(
                "rdma_connect failed",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn resolve_addr(
        &mut self,
        src: Option<Ipv4Addr>,
        dst: SocketAddrV4,
        timeout_ms: i32,
    ) -> Result<()> {
        unsafe {
            let mut dst_sin = sockaddr_from(dst);
            let mut src_sin;
            let src_ptr = match src {
                Some(ip) => {
                    src_sin = sockaddr_from(SocketAddrV4::new(ip, 0));
                    &mut src_sin as *mut libc::sockaddr_in as *mut _
                }
                None => ptr::null_mut(),
            };
            let rc = rdma_resolve_addr(
                self.id,
                src_ptr,
                &mut dst_sin as *mut libc::sockaddr_in as *mut _,
                timeout_ms,
            );
            if rc != 0 {
                return Err(RdmaError::device_with_source(
                    "rdma_resolve_addr failed",
                    io::Error::last_os_error(),
                ));
            }
        }
        Ok(())
    }

    fn resolve_route(&mut self, timeout_ms: i32) -> Result<()> {
        let rc = unsafe { rdma_resolve_route(self.id, timeout_ms) };
        if rc != 0 {
            return Err(RdmaError::device_with_source(
                "rdma_resolve_route failed",
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }

    fn has_pending_event(&self) -> bool {
        !self.event.is_null()
    }

    fn ack_event(&mut self) -> Result<()> {
        if self.event.is_null() {
            return Ok(());
        }
        let rc = unsafe { rdma_ack_cm_event(self.event) };
        if rc != 0 {
            return Err(RdmaError::device_with_source(
                "rdma_ack_cm_event failed",
                io::Error::last_os_error(),
            ));
        }
        self.event = ptr::null_mut();
        self.conn_data.clear();
        Ok(())
    }

    fn fetch_event(&mut self) -> Result<Option<RawCmEvent>> {
        unsafe {
            let mut ev: *mut rdma_cm_event = ptr::null_mut();
            if rdma_get_cm_event((*self.id).channel, &mut ev) != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EAGAIN) {
                    return Ok(None);
                }
                return Err(RdmaError::device_with_source(
                    "rdma_get_cm_event failed",
                    err,
                ));
            }
            self.event = ev;
            let kind = map_event((*ev).event);
            self.copy_conn_data(kind);
            Ok(Some(kind))
        }
    }

    fn conn_data(&self) -> &[u8] {
        &self.conn_data
    }

    fn create_qp(&mut self, cfg: &QpConfig) -> Result<QpHandle> {
        unsafe {
            // Safety: ibv_qp_init_attr is plain data.
            let mut attr: ibv_qp_init_attr = std::mem::zeroed();
            attr.qp_context = cfg.ctx_id as usize as *mut c_void;
            attr.send_cq = cfg.cq.as_raw() as *mut ibv_cq;
            attr.recv_cq = cfg.cq.as_raw() as *mut ibv_cq;
            attr.qp_type = ibv_qp_type::IBV_QPT_RC;
            // Selective signalling: the transport picks which work
            // requests report completions.
            attr.sq_sig_all = 0;
            attr.cap.max_send_wr = cfg.sq_size;
            attr.cap.max_recv_wr = cfg.rq_size;
            attr.cap.max_send_sge = self.verbs.max_sge();
            attr.cap.max_recv_sge = 1;
            attr.cap.max_inline_data = 64;

            if rdma_create_qp(self.id, self.verbs.pd, &mut attr) != 0 {
                return Err(RdmaError::device_with_source(
                    "rdma_create_qp failed",
                    io::Error::last_os_error(),
                ));
            }
            Ok(QpHandle::from_raw((*self.id).qp as *mut c_void))
        }
    }

    fn release_qp(&mut self) {
        unsafe {
            if !self.id.is_null() && !(*self.id).qp.is_null() {
                // Not rdma_destroy_qp: that would release the CQ too.
                ibv_destroy_qp((*self.id).qp);
                (*self.id).qp = ptr::null_mut();
            }
        }
    }

    fn fd(&self) -> RawFd {
        unsafe { (*(*self.id).channel).fd }
    }
}

impl Drop for RdmaCmId {
    fn drop(&mut self) {
        self.release_qp();
        unsafe {
            if !self.event.is_null() {
                rdma_ack_cm_event(self.event);
                self.event = ptr::null_mut();
            }
            if !self.id.is_null() {
                rdma_destroy_id(self.id);
            }
        }
    }
}
