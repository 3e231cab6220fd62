//! In-process route bus shared by all peer sessions.
//!
//! Sessions publish the routes they receive and subscribe to the
//! (family, route target) pairs their peer is interested in. The bus keeps
//! the current route table so that a new subscription is replayed the routes
//! it now matches, and routes a session advertised are withdrawn when it
//! goes away.

use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::bgp::family::AddressFamily;
use crate::bgp::route::{NlriKey, RouteEntry, RouteEvent, RouteTarget};
use crate::bgp::worker::WorkerEvent;

/// Capacity of the command channel created by [`channel`].
pub const DEFAULT_CAPACITY: usize = 1024;

/// Publish/subscribe primitives used by peer sessions.
#[allow(async_fn_in_trait)]
pub trait RouteBus: Send {
    /// Publish a route on behalf of `source`.
    async fn advertise(&self, source: &str, entry: RouteEntry);

    /// Retract a route previously published by `source`.
    async fn withdraw(&self, source: &str, entry: RouteEntry);

    /// Start delivering routes of `family` carrying `route_target` (any
    /// route target when `None`) to the subscriber's inbox.
    async fn subscribe(
        &self,
        subscriber: Subscriber,
        family: AddressFamily,
        route_target: Option<RouteTarget>,
    );

    async fn unsubscribe(
        &self,
        worker_id: &str,
        family: AddressFamily,
        route_target: Option<RouteTarget>,
    );

    /// Forget everything about a worker: its subscriptions and its routes.
    async fn cleanup(&self, worker_id: &str);
}

/// Where to deliver routes for one worker.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub id: String,
    pub inbox: mpsc::UnboundedSender<WorkerEvent>,
}

/// One (family, route target) interest. `None` matches any route target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub family: AddressFamily,
    pub route_target: Option<RouteTarget>,
}

impl Subscription {
    pub fn matches(&self, entry: &RouteEntry) -> bool {
        if self.family != entry.family() {
            return false;
        }
        match self.route_target {
            None => true,
            Some(rt) => entry.route_targets().contains(&rt),
        }
    }
}

/// A route in the bus table together with the worker that published it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRoute {
    pub source: String,
    pub entry: RouteEntry,
}

/// Commands sent to the BusActor.
pub enum BusCommand {
    Advertise {
        source: String,
        entry: RouteEntry,
    },
    Withdraw {
        source: String,
        entry: RouteEntry,
    },
    Subscribe {
        subscriber: Subscriber,
        subscription: Subscription,
    },
    Unsubscribe {
        worker_id: String,
        subscription: Subscription,
    },
    Cleanup {
        worker_id: String,
    },
    /// Snapshot of the route table.
    GetRoutes {
        response: oneshot::Sender<Vec<StoredRoute>>,
    },
}

struct SubscriberState {
    inbox: mpsc::UnboundedSender<WorkerEvent>,
    subscriptions: HashSet<Subscription>,
}

impl SubscriberState {
    fn matches(&self, entry: &RouteEntry) -> bool {
        self.subscriptions.iter().any(|s| s.matches(entry))
    }

    fn deliver(&self, event: RouteEvent) {
        // a closed inbox means the worker is gone; cleanup follows
        let _ = self.inbox.send(WorkerEvent::Route(event));
    }
}

/// Actor that owns the route table and the subscriptions.
///
/// Runs in its own task and processes commands in order, so sessions
/// running concurrently never observe a half-applied change.
pub struct BusActor {
    routes: HashMap<NlriKey, StoredRoute>,
    subscribers: HashMap<String, SubscriberState>,
    command_rx: mpsc::Receiver<BusCommand>,
}

impl BusActor {
    pub fn new(command_rx: mpsc::Receiver<BusCommand>) -> Self {
        Self {
            routes: HashMap::new(),
            subscribers: HashMap::new(),
            command_rx,
        }
    }

    /// Run the actor until every handle has been dropped.
    pub async fn run(mut self) {
        while let Some(cmd) = self.command_rx.recv().await {
            match cmd {
                BusCommand::Advertise { source, entry } => self.advertise(source, entry),
                BusCommand::Withdraw { source, entry } => self.withdraw(&source, &entry),
                BusCommand::Subscribe {
                    subscriber,
                    subscription,
                } => self.subscribe(subscriber, subscription),
                BusCommand::Unsubscribe {
                    worker_id,
                    subscription,
                } => self.unsubscribe(&worker_id, subscription),
                BusCommand::Cleanup { worker_id } => self.cleanup(&worker_id),
                BusCommand::GetRoutes { response } => {
                    let _ = response.send(self.routes.values().cloned().collect());
                }
            }
        }
        debug!("Route bus stopped");
    }

    fn advertise(&mut self, source: String, entry: RouteEntry) {
        trace!(source = %source, route = %entry, "Advertise");
        let previous = self.routes.insert(
            entry.nlri.key(),
            StoredRoute {
                source: source.clone(),
                entry: entry.clone(),
            },
        );

        for (id, sub) in &self.subscribers {
            if *id == source {
                continue;
            }
            if sub.matches(&entry) {
                sub.deliver(RouteEvent::advertise(entry.clone(), source.clone()));
            } else if let Some(prev) = &previous {
                // the replacement lost a route target this subscriber wanted
                if sub.matches(&prev.entry) {
                    sub.deliver(RouteEvent::withdraw(prev.entry.clone(), prev.source.clone()));
                }
            }
        }
    }

    fn withdraw(&mut self, source: &str, entry: &RouteEntry) {
        let key = entry.nlri.key();
        match self.routes.get(&key) {
            Some(stored) if stored.source == source => {}
            Some(stored) => {
                debug!(source = %source, owner = %stored.source, route = %entry,
                    "Ignoring withdraw of a route owned by another worker");
                return;
            }
            None => {
                trace!(source = %source, route = %entry, "Withdraw of unknown route");
                return;
            }
        }
        let Some(stored) = self.routes.remove(&key) else {
            return;
        };
        trace!(source = %source, route = %stored.entry, "Withdraw");
        self.notify_withdrawn(&stored);
    }

    fn subscribe(&mut self, subscriber: Subscriber, subscription: Subscription) {
        debug!(worker = %subscriber.id, family = %subscription.family,
            route_target = ?subscription.route_target, "Subscribe");
        let state = self
            .subscribers
            .entry(subscriber.id.clone())
            .or_insert_with(|| SubscriberState {
                inbox: subscriber.inbox.clone(),
                subscriptions: HashSet::new(),
            });
        // a reconnected worker comes back with a fresh inbox
        state.inbox = subscriber.inbox;

        let before: HashSet<NlriKey> = matched_keys(&self.routes, state, &subscriber.id);
        if !state.subscriptions.insert(subscription) {
            return;
        }
        for (key, stored) in &self.routes {
            if stored.source != subscriber.id
                && !before.contains(key)
                && subscription.matches(&stored.entry)
            {
                state.deliver(RouteEvent::advertise(
                    stored.entry.clone(),
                    stored.source.clone(),
                ));
            }
        }
    }

    fn unsubscribe(&mut self, worker_id: &str, subscription: Subscription) {
        debug!(worker = %worker_id, family = %subscription.family,
            route_target = ?subscription.route_target, "Unsubscribe");
        let Some(state) = self.subscribers.get_mut(worker_id) else {
            return;
        };
        if !state.subscriptions.remove(&subscription) {
            return;
        }
        for stored in self.routes.values() {
            if stored.source != worker_id
                && subscription.matches(&stored.entry)
                && !state.matches(&stored.entry)
            {
                state.deliver(RouteEvent::withdraw(
                    stored.entry.clone(),
                    stored.source.clone(),
                ));
            }
        }
        if state.subscriptions.is_empty() {
            self.subscribers.remove(worker_id);
        }
    }

    fn cleanup(&mut self, worker_id: &str) {
        self.subscribers.remove(worker_id);

        let keys: Vec<NlriKey> = self
            .routes
            .iter()
            .filter(|(_, stored)| stored.source == worker_id)
            .map(|(key, _)| key.clone())
            .collect();
        if !keys.is_empty() {
            debug!(worker = %worker_id, routes = keys.len(), "Withdrawing routes of departed worker");
        }
        for key in keys {
            if let Some(stored) = self.routes.remove(&key) {
                self.notify_withdrawn(&stored);
            }
        }
    }

    fn notify_withdrawn(&self, stored: &StoredRoute) {
        for (id, sub) in &self.subscribers {
            if *id != stored.source && sub.matches(&stored.entry) {
                sub.deliver(RouteEvent::withdraw(
                    stored.entry.clone(),
                    stored.source.clone(),
                ));
            }
        }
    }
}

fn matched_keys(
    routes: &HashMap<NlriKey, StoredRoute>,
    state: &SubscriberState,
    worker_id: &str,
) -> HashSet<NlriKey> {
    routes
        .iter()
        .filter(|(_, stored)| stored.source != worker_id && state.matches(&stored.entry))
        .map(|(key, _)| key.clone())
        .collect()
}

/// Handle for sending commands to the BusActor.
///
/// Cheap to clone; one per session.
#[derive(Clone)]
pub struct BusHandle {
    sender: mpsc::Sender<BusCommand>,
}

impl BusHandle {
    pub fn new(sender: mpsc::Sender<BusCommand>) -> Self {
        Self { sender }
    }

    async fn send(&self, cmd: BusCommand) {
        // fire-and-forget: a stopped bus has nobody left to deliver to
        let _ = self.sender.send(cmd).await;
    }

    /// Snapshot of the route table.
    pub async fn routes(&self) -> Vec<StoredRoute> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(BusCommand::GetRoutes { response: tx })
            .await
            .is_ok()
        {
            rx.await.unwrap_or_default()
        } else {
            Vec::new()
        }
    }
}

impl RouteBus for BusHandle {
    async fn advertise(&self, source: &str, entry: RouteEntry) {
        self.send(BusCommand::Advertise {
            source: source.to_string(),
            entry,
        })
        .await;
    }

    async fn withdraw(&self, source: &str, entry: RouteEntry) {
        self.send(BusCommand::Withdraw {
            source: source.to_string(),
            entry,
        })
        .await;
    }

    async fn subscribe(
        &self,
        subscriber: Subscriber,
        family: AddressFamily,
        route_target: Option<RouteTarget>,
    ) {
        self.send(BusCommand::Subscribe {
            subscriber,
            subscription: Subscription {
                family,
                route_target,
            },
        })
        .await;
    }

    async fn unsubscribe(
        &self,
        worker_id: &str,
        family: AddressFamily,
        route_target: Option<RouteTarget>,
    ) {
        self.send(BusCommand::Unsubscribe {
            worker_id: worker_id.to_string(),
            subscription: Subscription {
                family,
                route_target,
            },
        })
        .await;
    }

    async fn cleanup(&self, worker_id: &str) {
        self.send(BusCommand::Cleanup {
            worker_id: worker_id.to_string(),
        })
        .await;
    }
}

/// Create a bus actor and a handle connected to it. The caller spawns
/// [`BusActor::run`].
pub fn channel(capacity: usize) -> (BusActor, BusHandle) {
    let (tx, rx) = mpsc::channel(capacity);
    (BusActor::new(rx), BusHandle::new(tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bgp::route::{Attributes, Nlri, NlriAction, RouteEventKind};

    fn rt(s: &str) -> RouteTarget {
        s.parse().unwrap()
    }

    fn vpn_route(prefix: u8, rts: &[RouteTarget]) -> RouteEntry {
        RouteEntry::new(
            Nlri::new(AddressFamily::IPV4_MPLS_VPN, NlriAction::Announced, vec![prefix]),
            Attributes::new().with_route_targets(rts),
        )
    }

    fn subscriber(id: &str) -> (Subscriber, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Subscriber {
                id: id.to_string(),
                inbox: tx,
            },
            rx,
        )
    }

    fn start() -> BusHandle {
        let (actor, handle) = channel(32);
        tokio::spawn(actor.run());
        handle
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<RouteEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::Route(e) = event {
                events.push(e);
            }
        }
        events
    }

    #[test]
    fn test_subscription_matching() {
        let entry = vpn_route(1, &[rt("65000:1")]);

        let wildcard = Subscription {
            family: AddressFamily::IPV4_MPLS_VPN,
            route_target: None,
        };
        let same_rt = Subscription {
            family: AddressFamily::IPV4_MPLS_VPN,
            route_target: Some(rt("65000:1")),
        };
        let other_rt = Subscription {
            family: AddressFamily::IPV4_MPLS_VPN,
            route_target: Some(rt("65000:2")),
        };
        let other_family = Subscription {
            family: AddressFamily::L2VPN_EVPN,
            route_target: None,
        };

        assert!(wildcard.matches(&entry));
        assert!(same_rt.matches(&entry));
        assert!(!other_rt.matches(&entry));
        assert!(!other_family.matches(&entry));
    }

    #[tokio::test]
    async fn test_advertise_reaches_matching_subscribers_only() {
        let bus = start();
        let (a, mut a_rx) = subscriber("a");
        let (b, mut b_rx) = subscriber("b");

        bus.subscribe(a, AddressFamily::IPV4_MPLS_VPN, Some(rt("65000:1"))).await;
        bus.subscribe(b, AddressFamily::IPV4_MPLS_VPN, Some(rt("65000:2"))).await;
        bus.advertise("peer", vpn_route(1, &[rt("65000:1")])).await;
        bus.routes().await; // barrier

        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RouteEventKind::Advertise);
        assert_eq!(events[0].source, "peer");
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_source_does_not_receive_its_own_routes() {
        let bus = start();
        let (a, mut a_rx) = subscriber("a");

        bus.subscribe(a, AddressFamily::IPV4_MPLS_VPN, None).await;
        bus.advertise("a", vpn_route(1, &[])).await;
        bus.routes().await;

        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_replays_existing_routes() {
        let bus = start();
        bus.advertise("peer", vpn_route(1, &[rt("65000:1")])).await;
        bus.advertise("peer", vpn_route(2, &[rt("65000:2")])).await;

        let (a, mut a_rx) = subscriber("a");
        bus.subscribe(a.clone(), AddressFamily::IPV4_MPLS_VPN, Some(rt("65000:1"))).await;
        bus.routes().await;
        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(&events[0].entry.nlri.prefix[..], &[1]);

        // widening to a wildcard only replays what was not matched yet
        bus.subscribe(a, AddressFamily::IPV4_MPLS_VPN, None).await;
        bus.routes().await;
        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(&events[0].entry.nlri.prefix[..], &[2]);
    }

    #[tokio::test]
    async fn test_unsubscribe_withdraws_no_longer_matched_routes() {
        let bus = start();
        let (a, mut a_rx) = subscriber("a");
        bus.advertise("peer", vpn_route(1, &[rt("65000:1")])).await;
        bus.subscribe(a, AddressFamily::IPV4_MPLS_VPN, Some(rt("65000:1"))).await;
        bus.routes().await;
        drain(&mut a_rx);

        bus.unsubscribe("a", AddressFamily::IPV4_MPLS_VPN, Some(rt("65000:1"))).await;
        bus.routes().await;

        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RouteEventKind::Withdraw);

        // no longer subscribed
        bus.advertise("peer", vpn_route(3, &[rt("65000:1")])).await;
        bus.routes().await;
        assert!(drain(&mut a_rx).is_empty());
    }

    #[tokio::test]
    async fn test_withdraw_removes_route_and_notifies() {
        let bus = start();
        let (a, mut a_rx) = subscriber("a");
        bus.subscribe(a, AddressFamily::IPV4_MPLS_VPN, None).await;
        bus.advertise("peer", vpn_route(1, &[])).await;

        // another worker cannot withdraw it
        bus.withdraw("intruder", vpn_route(1, &[])).await;
        assert_eq!(bus.routes().await.len(), 1);

        bus.withdraw("peer", vpn_route(1, &[])).await;
        assert!(bus.routes().await.is_empty());

        let kinds: Vec<_> = drain(&mut a_rx).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![RouteEventKind::Advertise, RouteEventKind::Withdraw]);
    }

    #[tokio::test]
    async fn test_replacement_that_loses_route_target_is_withdrawn() {
        let bus = start();
        let (a, mut a_rx) = subscriber("a");
        bus.subscribe(a, AddressFamily::IPV4_MPLS_VPN, Some(rt("65000:1"))).await;

        bus.advertise("peer", vpn_route(1, &[rt("65000:1")])).await;
        bus.advertise("peer", vpn_route(1, &[rt("65000:2")])).await;
        bus.routes().await;

        let kinds: Vec<_> = drain(&mut a_rx).into_iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![RouteEventKind::Advertise, RouteEventKind::Withdraw]);
        assert_eq!(bus.routes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_withdraws_worker_routes() {
        let bus = start();
        let (a, mut a_rx) = subscriber("a");
        let (peer, mut peer_rx) = subscriber("peer");

        bus.subscribe(a, AddressFamily::IPV4_MPLS_VPN, None).await;
        bus.subscribe(peer, AddressFamily::IPV4_MPLS_VPN, None).await;
        bus.advertise("peer", vpn_route(1, &[])).await;
        bus.advertise("a", vpn_route(2, &[])).await;
        bus.routes().await;
        drain(&mut a_rx);
        drain(&mut peer_rx);

        bus.cleanup("peer").await;
        let routes = bus.routes().await;
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].source, "a");

        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, RouteEventKind::Withdraw);

        // subscriptions are gone too
        bus.advertise("a", vpn_route(3, &[])).await;
        bus.routes().await;
        assert!(drain(&mut peer_rx).is_empty());

        // idempotent
        bus.cleanup("peer").await;
        assert_eq!(bus.routes().await.len(), 2);
    }

    #[tokio::test]
    async fn test_rtc_routes_match_on_nlri_route_target() {
        let bus = start();
        let (a, mut a_rx) = subscriber("a");
        bus.subscribe(a, AddressFamily::IPV4_RTC, Some(rt("65000:100"))).await;

        let rtc = |target| {
            RouteEntry::new(Nlri::rtc(NlriAction::Announced, 65000, Some(target)), Attributes::new())
        };
        bus.advertise("peer", rtc(rt("65000:100"))).await;
        bus.advertise("peer", rtc(rt("65000:200"))).await;
        bus.routes().await;

        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].entry.nlri.route_target, Some(rt("65000:100")));
    }

    #[tokio::test]
    async fn test_handle_survives_stopped_actor() {
        let (actor, handle) = channel(4);
        drop(actor);

        handle.advertise("peer", vpn_route(1, &[])).await;
        assert!(handle.routes().await.is_empty());
    }
}
