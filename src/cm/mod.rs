//! Connection management: the non-blocking control plane that takes a
//! pair of endpoints from address resolution to an established
//! reliable-connected QP.

pub mod driver;
pub mod endpoint;
pub mod event;
#[cfg(any(test, feature = "testing"))]
pub mod fake;
#[cfg(feature = "rdma")]
pub mod rdmacm;

pub use driver::{CmId, CmProvider, QpConfig};
pub use endpoint::CmEndpoint;
pub use event::CmEvent;

#[cfg(test)]
mod tests {
    use super::fake::FakeFabric;
    use super::{CmEndpoint, CmEvent};
    use crate::config::RdmaConfig;
    use crate::verbs::CqHandle;
    use std::net::{Ipv4Addr, SocketAddrV4};

    const NIC: Ipv4Addr = Ipv4Addr::new(192, 168, 100, 7);

    fn cq() -> CqHandle {
        CqHandle::from_raw(std::ptr::null_mut())
    }

    #[test]
    fn full_handshake_with_private_data() {
        let fabric = FakeFabric::new(NIC);
        let cfg = RdmaConfig::default();
        let server_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7471);

        let mut server = CmEndpoint::listen(&fabric, server_addr, &cfg).unwrap();
        assert!(server.get_request().is_none());

        let mut client = CmEndpoint::create(&fabric, &cfg).unwrap();
        assert!(client.fd() >= 0);

        client.resolve_addr(server_addr).unwrap();
        assert_eq!(client.poll_event(), CmEvent::AddrResolved);
        client.resolve_route().unwrap();
        assert_eq!(client.poll_event(), CmEvent::RouteResolved);

        let qp = client.create_qp(32, 32, cq(), 42).unwrap();
        assert!(!qp.as_raw().is_null());
        client.connect(b"hello").unwrap();

        let mut accepted = server.get_request().unwrap();
        assert_eq!(accepted.conn_data(), b"hello");
        accepted.create_qp(32, 32, cq(), 43).unwrap();
        accepted.accept(b"world").unwrap();
        assert_eq!(accepted.poll_event(), CmEvent::Established);

        assert_eq!(client.poll_event(), CmEvent::Established);
        assert_eq!(client.conn_data(), b"world");

        // The destination is local, so the source was pinned to the
        // RDMA NIC rather than loopback.
        let pinned: Vec<_> = fabric
            .id_states()
            .iter()
            .filter_map(|s| s.resolved_src())
            .collect();
        assert_eq!(pinned, vec![NIC]);

        // The QP carries the fixed RC attributes.
        let record = fabric
            .id_states()
            .iter()
            .find_map(|s| s.qp_record())
            .unwrap();
        assert_eq!(record.sq_size, 32);
        assert_eq!(record.rq_size, 32);
        assert_eq!(record.ctx_id, 42);
        assert_eq!(record.max_send_sge, 4);
        assert_eq!(record.max_recv_sge, 1);
        assert_eq!(record.max_inline_data, 64);
        assert!(!record.sig_all);

        client.release_qp();
        accepted.release_qp();
        assert_eq!(fabric.live_qps(), 0);
        drop(client);
        drop(accepted);
        drop(server);
    }

    #[test]
    fn pump_acknowledges_each_event_exactly_once() {
        let fabric = FakeFabric::new(NIC);
        let cfg = RdmaConfig::default();
        let server_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7472);

        let _server = CmEndpoint::listen(&fabric, server_addr, &cfg).unwrap();
        let mut client = CmEndpoint::create(&fabric, &cfg).unwrap();
        client.resolve_addr(server_addr).unwrap();
        client.resolve_route().unwrap();

        let state = fabric
            .id_states()
            .into_iter()
            .find(|s| s.resolved_src().is_some())
            .unwrap();

        // Two events are queued. Pump well past them without any upper
        // layer draining anything.
        assert_eq!(client.poll_event(), CmEvent::AddrResolved);
        assert!(state.has_pending());
        assert_eq!(state.ack_count(), 0);

        assert_eq!(client.poll_event(), CmEvent::RouteResolved);
        assert!(state.has_pending());
        assert_eq!(state.ack_count(), 1);

        assert_eq!(client.poll_event(), CmEvent::None);
        assert!(!state.has_pending());
        assert_eq!(state.ack_count(), 2);

        // Idle pumping neither retains nor re-acknowledges anything.
        for _ in 0..4 {
            assert_eq!(client.poll_event(), CmEvent::None);
        }
        assert_eq!(state.ack_count(), 2);
    }

    #[test]
    fn fetch_failure_collapses_to_error() {
        let fabric = FakeFabric::new(NIC);
        let cfg = RdmaConfig::default();
        let mut client = CmEndpoint::create(&fabric, &cfg).unwrap();
        let state = fabric.id_states().pop().unwrap();
        state.fail_next_fetch();
        assert_eq!(client.poll_event(), CmEvent::Error);
        // The channel itself recovers; the caller is expected to tear
        // the endpoint down regardless.
        assert_eq!(client.poll_event(), CmEvent::None);
    }

    #[test]
    fn disconnect_is_delivered_to_the_peer() {
        let fabric = FakeFabric::new(NIC);
        let cfg = RdmaConfig::default();
        let server_addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7473);

        let mut server = CmEndpoint::listen(&fabric, server_addr, &cfg).unwrap();
        let mut client = CmEndpoint::create(&fabric, &cfg).unwrap();
        client.resolve_addr(server_addr).unwrap();
        assert_eq!(client.poll_event(), CmEvent::AddrResolved);
        client.resolve_route().unwrap();
        assert_eq!(client.poll_event(), CmEvent::RouteResolved);
        client.connect(&[]).unwrap();

        let mut accepted = server.get_request().unwrap();
        assert_eq!(accepted.conn_data(), b"");
        accepted.accept(&[]).unwrap();
        assert_eq!(accepted.poll_event(), CmEvent::Established);
        assert_eq!(client.poll_event(), CmEvent::Established);

        drop(client);
        assert_eq!(accepted.poll_event(), CmEvent::Disconnect);
    }

    #[test]
    fn connect_without_listener_is_refused() {
        let fabric = FakeFabric::new(NIC);
        let cfg = RdmaConfig::default();
        let mut client = CmEndpoint::create(&fabric, &cfg).unwrap();
        client
            .resolve_addr(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7999))
            .unwrap();
        assert_eq!(client.poll_event(), CmEvent::AddrResolved);
        client.resolve_route().unwrap();
        assert_eq!(client.poll_event(), CmEvent::RouteResolved);
        assert!(client.connect(b"x").is_err());
    }

    #[test]
    fn remote_destination_leaves_source_unpinned() {
        let fabric = FakeFabric::new(NIC);
        let cfg = RdmaConfig::default();
        let mut client = CmEndpoint::create(&fabric, &cfg).unwrap();
        // 203.0.113.0/24 is TEST-NET-3; never local.
        client
            .resolve_addr(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 9), 7474))
            .unwrap();
        let state = fabric.id_states().pop().unwrap();
        assert_eq!(state.resolved_src(), None);
        assert_eq!(client.poll_event(), CmEvent::AddrResolved);
    }

    #[test]
    fn release_qp_is_idempotent_and_runs_on_drop() {
        let fabric = FakeFabric::new(NIC);
        let cfg = RdmaConfig::default();
        let mut client = CmEndpoint::create(&fabric, &cfg).unwrap();
        client.create_qp(8, 8, cq(), 1).unwrap();
        assert_eq!(fabric.live_qps(), 1);
        client.release_qp();
        client.release_qp();
        assert_eq!(fabric.live_qps(), 0);

        let mut other = CmEndpoint::create(&fabric, &cfg).unwrap();
        other.create_qp(8, 8, cq(), 2).unwrap();
        assert_eq!(fabric.live_qps(), 1);
        drop(other);
        assert_eq!(fabric.live_qps(), 0);
    }
}
