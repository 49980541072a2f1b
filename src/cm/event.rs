//! Connection-manager event decoding.
//!
//! The device can deliver a dozen event kinds; the transport's state
//! machine only distinguishes the four milestones of a handshake plus
//! disconnect. Everything else collapses to `Other`, which still gets
//! acknowledged so the event channel never wedges. The mapping is kept
//! pure so the upper layers can unit-test their state machines against
//! synthetic event sequences.

/// Raw event kinds a backend can deliver, mirroring rdmacm's event set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawCmEvent {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectResponse,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    DeviceRemoval,
    TimewaitExit,
    Other,
}

/// Decoded events consumed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEvent {
    AddrResolved,
    RouteResolved,
    Established,
    Disconnect,
    /// An event outside the closed set. Acknowledged like the rest.
    Other,
    /// Nothing queued; the channel fd was not readable.
    None,
    /// Fetch or acknowledge failed. Recovery is uniform: tear the
    /// endpoint down.
    Error,
}

pub(crate) fn decode(raw: RawCmEvent) -> CmEvent {
    match raw {
        RawCmEvent::AddrResolved => CmEvent::AddrResolved,
        RawCmEvent::RouteResolved => CmEvent::RouteResolved,
        RawCmEvent::Established => CmEvent::Established,
        RawCmEvent::Disconnected => CmEvent::Disconnect,
        _ => CmEvent::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn milestones_map_to_themselves() {
        assert_eq!(decode(RawCmEvent::AddrResolved), CmEvent::AddrResolved);
        assert_eq!(decode(RawCmEvent::RouteResolved), CmEvent::RouteResolved);
        assert_eq!(decode(RawCmEvent::Established), CmEvent::Established);
        assert_eq!(decode(RawCmEvent::Disconnected), CmEvent::Disconnect);
    }

    #[test]
    fn everything_else_is_other() {
        for raw in [
            RawCmEvent::AddrError,
            RawCmEvent::RouteError,
            RawCmEvent::ConnectRequest,
            RawCmEvent::ConnectResponse,
            RawCmEvent::ConnectError,
            RawCmEvent::Unreachable,
            RawCmEvent::Rejected,
            RawCmEvent::DeviceRemoval,
            RawCmEvent::TimewaitExit,
            RawCmEvent::Other,
        ] {
            assert_eq!(decode(raw), CmEvent::Other, "{raw:?}");
        }
    }
}
