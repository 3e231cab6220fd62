use bytes::Bytes;
use tracing::{debug, error};

use super::PeerWorker;
use crate::bgp::engine::{EngineFactory, ProtocolEngine};
use crate::bgp::message::{KeepaliveMessage, MessageType, UpdateMessage, BGP_HEADER_LEN};
use crate::bgp::route::RouteEvent;
use crate::bus::RouteBus;
use crate::metrics;

fn message_type_label(data: &[u8]) -> &'static str {
    match data.get(BGP_HEADER_LEN - 1).map(|t| MessageType::try_from(*t)) {
        Some(Ok(MessageType::Open)) => "OPEN",
        Some(Ok(MessageType::Update)) => "UPDATE",
        Some(Ok(MessageType::Notification)) => "NOTIFICATION",
        Some(Ok(MessageType::Keepalive)) => "KEEPALIVE",
        Some(Ok(MessageType::RouteRefresh)) => "ROUTE_REFRESH",
        _ => "UNKNOWN",
    }
}

impl<F: EngineFactory, B: RouteBus> PeerWorker<F, B> {
    /// Encode a bus route event as a single-NLRI UPDATE for the peer.
    ///
    /// Returns empty bytes when the route cannot be encoded; one bad route
    /// must not take the session down.
    pub fn update_for_route_event(&self, event: &RouteEvent) -> Bytes {
        let mut nlri = event.entry.nlri.clone();
        nlri.action = event.kind.into();
        let update = UpdateMessage::new(vec![nlri], event.entry.attributes.clone());

        let Some(engine) = &self.engine else {
            error!(parent: &self.log, route = %event.entry, "Cannot encode route without a connection");
            metrics::record_send_failure(&self.id, "encode");
            return Bytes::new();
        };

        match engine.encode_update(&update) {
            Ok(data) => data,
            Err(e) => {
                error!(parent: &self.log, route = %event.entry, kind = event.kind.as_str(),
                    error = %e, "Failed to encode route: {}", e);
                metrics::record_send_failure(&self.id, "encode");
                Bytes::new()
            }
        }
    }

    /// The KEEPALIVE message, identical for every session.
    pub fn keepalive_message_data() -> Bytes {
        KeepaliveMessage::to_bytes()
    }

    /// Write a message to the peer. Failures are logged, not returned.
    pub async fn send(&mut self, data: &[u8]) {
        let msg_type = message_type_label(data);
        let Some(engine) = self.engine.as_mut() else {
            error!(parent: &self.log, msg_type, "Cannot send without a connection");
            metrics::record_send_failure(&self.id, "write");
            return;
        };

        match engine.write(data).await {
            Ok(()) => {
                debug!(parent: &self.log, msg_type, len = data.len(), "Sent {} message", msg_type);
                metrics::record_message_sent(&self.id, msg_type);
            }
            Err(e) => {
                error!(parent: &self.log, msg_type, error = %e, "Failed to send {}: {}", msg_type, e);
                metrics::record_send_failure(&self.id, "write");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::bgp::family::AddressFamily;
    use crate::bgp::message::KEEPALIVE;
    use crate::bgp::route::{Attributes, Nlri, NlriAction, RouteEntry};

    const MPLS: AddressFamily = AddressFamily::IPV4_MPLS_VPN;

    fn event(kind_withdraw: bool) -> RouteEvent {
        // the stored NLRI action is irrelevant, the event kind decides
        let entry = RouteEntry::new(
            Nlri::new(MPLS, NlriAction::Announced, vec![0xaa]),
            Attributes::new(),
        );
        if kind_withdraw {
            RouteEvent::withdraw(entry, "peer-192.0.2.9")
        } else {
            RouteEvent::advertise(entry, "peer-192.0.2.9")
        }
    }

    #[test]
    fn test_keepalive_is_fixed() {
        let data = PeerWorker::<crate::bgp::engine::mock::MockEngine, RecordingBus>::keepalive_message_data();
        assert_eq!(data.len(), 19);
        assert_eq!(&data[..], &KEEPALIVE[..]);
        assert!(data[..16].iter().all(|b| *b == 0xFF));
        assert_eq!(&data[16..], &[0x00, 0x13, 0x04]);
        assert_eq!(message_type_label(&data), "KEEPALIVE");
    }

    #[tokio::test]
    async fn test_update_action_follows_event_kind() {
        let f = established(false, &[MPLS]).await;

        let advertise = f.worker.update_for_route_event(&event(false));
        let withdraw = f.worker.update_for_route_event(&event(true));

        // mock body: afi(2) safi(1) action(1) len(1) prefix
        assert_eq!(advertise[18], MessageType::Update as u8);
        assert_eq!(&advertise[19..], &[0x00, 0x01, 128, 1, 1, 0xaa]);
        assert_eq!(&withdraw[19..], &[0x00, 0x01, 128, 2, 1, 0xaa]);
    }

    #[tokio::test]
    async fn test_encode_failure_returns_empty_bytes() {
        let f = established(false, &[MPLS]).await;
        f.engine.fail_encoding(true);

        assert!(f.worker.update_for_route_event(&event(false)).is_empty());
    }

    #[tokio::test]
    async fn test_encode_without_engine_returns_empty_bytes() {
        let f = fixture(config(false));
        assert!(f.worker.update_for_route_event(&event(false)).is_empty());
    }

    #[tokio::test]
    async fn test_send_writes_to_engine() {
        let mut f = established(false, &[MPLS]).await;
        let data = f.worker.update_for_route_event(&event(false));

        f.worker.send(&data).await;

        assert_eq!(f.engine.written(), vec![data.to_vec()]);
    }

    #[tokio::test]
    async fn test_send_failures_are_swallowed() {
        let mut f = established(false, &[MPLS]).await;
        f.engine.fail_writes(true);
        f.worker.send(&KEEPALIVE).await;
        assert!(f.engine.written().is_empty());

        // no connection at all
        let mut f = fixture(config(false));
        f.worker.send(&KEEPALIVE).await;
        assert!(f.bus.calls().is_empty());
    }
}
