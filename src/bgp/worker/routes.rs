use tracing::{debug, info};

use super::PeerWorker;
use crate::bgp::engine::EngineFactory;
use crate::bgp::route::{Attributes, Nlri, RouteEntry, RouteEventKind, RouteTarget};
use crate::bus::RouteBus;
use crate::metrics;

impl<F: EngineFactory, B: RouteBus> PeerWorker<F, B> {
    /// Publish a route received from the peer on the bus.
    ///
    /// RTC routes are also the peer telling us which route targets it wants:
    /// they are applied as subscriptions to every other active family.
    pub async fn process_received_route(
        &self,
        kind: RouteEventKind,
        nlri: Nlri,
        attributes: Attributes,
    ) {
        let entry = RouteEntry::new(nlri, attributes);
        let family = entry.family();
        debug!(parent: &self.log, kind = kind.as_str(), route = %entry, "Route from peer");
        metrics::record_route_received(&self.id, &family.to_string(), kind.as_str());

        let rtc_target = family.is_rtc().then_some(entry.nlri.route_target);

        match kind {
            RouteEventKind::Advertise => self.bus.advertise(&self.id, entry).await,
            RouteEventKind::Withdraw => self.bus.withdraw(&self.id, entry).await,
        }

        if let Some(route_target) = rtc_target {
            self.apply_rtc_route(kind, route_target).await;
        }
    }

    async fn apply_rtc_route(&self, kind: RouteEventKind, route_target: Option<RouteTarget>) {
        match route_target {
            Some(rt) => info!(parent: &self.log, kind = kind.as_str(), route_target = %rt, "RTC route"),
            None => info!(parent: &self.log, kind = kind.as_str(), "RTC route with wildcard route target"),
        }

        let subscriber = self.subscriber();
        for family in self.active_families.iter().filter(|f| !f.is_rtc()) {
            match kind {
                RouteEventKind::Advertise => {
                    self.bus.subscribe(subscriber.clone(), *family, route_target).await
                }
                RouteEventKind::Withdraw => {
                    self.bus.unsubscribe(&self.id, *family, route_target).await
                }
            }
            metrics::record_rtc_subscription(&self.id, &family.to_string(), kind.as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::bgp::family::AddressFamily;
    use crate::bgp::message::{Message, UpdateMessage};
    use crate::bgp::route::NlriAction;
    use crate::bgp::worker::ReceiveOutcome;

    const MPLS: AddressFamily = AddressFamily::IPV4_MPLS_VPN;
    const EVPN: AddressFamily = AddressFamily::L2VPN_EVPN;
    const RTC: AddressFamily = AddressFamily::IPV4_RTC;

    fn rtc_update(action: NlriAction, rt: Option<RouteTarget>) -> Message {
        Message::Update(UpdateMessage::new(
            vec![Nlri::rtc(action, 65000, rt)],
            Attributes::new(),
        ))
    }

    #[tokio::test]
    async fn test_rtc_route_fans_out_to_other_families() {
        let mut f = established(true, &[MPLS, EVPN, RTC]).await;
        assert_eq!(f.worker.active_families(), &[MPLS, EVPN, RTC]);
        let rt: RouteTarget = "65000:100".parse().unwrap();
        f.engine.queue_receive(rtc_update(NlriAction::Announced, Some(rt)));

        assert_eq!(f.worker.receive_once().await.unwrap(), ReceiveOutcome::Continue);

        let calls = f.bus.calls();
        assert!(matches!(calls[0], BusCall::Advertise(ref e) if e.family() == RTC));
        assert_eq!(
            calls[1..],
            [
                BusCall::Subscribe(MPLS, Some(rt)),
                BusCall::Subscribe(EVPN, Some(rt)),
            ]
        );
    }

    #[tokio::test]
    async fn test_wildcard_rtc_route_subscribes_wildcard() {
        let mut f = established(true, &[MPLS, EVPN, RTC]).await;
        f.engine.queue_receive(rtc_update(NlriAction::Announced, None));

        f.worker.receive_once().await.unwrap();

        let subscriptions: Vec<_> = f
            .bus
            .calls()
            .into_iter()
            .filter(|c| matches!(c, BusCall::Subscribe(..) | BusCall::Unsubscribe(..)))
            .collect();
        assert_eq!(
            subscriptions,
            vec![BusCall::Subscribe(MPLS, None), BusCall::Subscribe(EVPN, None)]
        );
    }

    #[tokio::test]
    async fn test_rtc_withdraw_unsubscribes() {
        let mut f = established(true, &[EVPN, RTC]).await;
        let rt: RouteTarget = "65000:7".parse().unwrap();
        f.engine.queue_receive(rtc_update(NlriAction::Withdrawn, Some(rt)));

        f.worker.receive_once().await.unwrap();

        let calls = f.bus.calls();
        assert!(matches!(calls[0], BusCall::Withdraw(_)));
        assert_eq!(calls[1..], [BusCall::Unsubscribe(EVPN, Some(rt))]);
    }

    #[tokio::test]
    async fn test_non_rtc_route_does_not_subscribe() {
        let f = established(true, &[MPLS, RTC]).await;
        let rt: RouteTarget = "65000:7".parse().unwrap();

        f.worker
            .process_received_route(
                RouteEventKind::Advertise,
                Nlri::new(MPLS, NlriAction::Announced, vec![1]),
                Attributes::new().with_route_targets(&[rt]),
            )
            .await;

        let calls = f.bus.calls();
        assert_eq!(calls.len(), 1);
        assert!(matches!(calls[0], BusCall::Advertise(_)));
    }

    #[tokio::test]
    async fn test_rtc_route_without_other_families() {
        let f = established(true, &[RTC]).await;

        f.worker
            .process_received_route(
                RouteEventKind::Advertise,
                Nlri::rtc(NlriAction::Announced, 65000, None),
                Attributes::new(),
            )
            .await;

        assert_eq!(f.bus.calls().len(), 1);
    }
}
