//! Per-peer session worker.
//!
//! A `PeerWorker` owns one BGP session with one peer. It drives the
//! protocol engine through connection establishment, classifies what the
//! engine reads, turns received routes into route bus events and encodes
//! bus events back onto the wire. [`PeerWorker::run`] strings these
//! together into a reconnecting session loop; the individual operations are
//! public so a different scheduler can drive them.

mod establish;
mod outbound;
mod receive;
mod routes;
mod run;

pub use receive::ReceiveOutcome;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info_span, Span};

use crate::bgp::engine::{EngineFactory, ProtocolEngine};
use crate::bgp::family::AddressFamily;
use crate::bgp::route::RouteEvent;
use crate::bgp::SessionState;
use crate::bus::{RouteBus, Subscriber};
use crate::config::BgpConfig;
use crate::metrics;

/// Events queued to a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The peer sent a KEEPALIVE.
    KeepAliveReceived,
    /// The peer sent an UPDATE. Like a KEEPALIVE, it restarts the hold timer.
    UpdateReceived,
    /// A bus route to send to the peer.
    Route(RouteEvent),
}

/// Span for a worker's logs.
pub fn peer_span(peer_address: IpAddr) -> Span {
    info_span!("peer", peer = %peer_address)
}

pub struct PeerWorker<F: EngineFactory, B: RouteBus> {
    config: Arc<BgpConfig>,
    peer_address: IpAddr,
    id: String,
    factory: F,
    engine: Option<F::Engine>,
    bus: B,
    state: SessionState,
    /// Negotiated hold time in seconds.
    hold_time: u16,
    active_families: Vec<AddressFamily>,
    rtc_active: bool,
    inbox_tx: mpsc::UnboundedSender<WorkerEvent>,
    inbox_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    stop: watch::Receiver<bool>,
    log: Span,
}

impl<F: EngineFactory, B: RouteBus> PeerWorker<F, B> {
    /// `stop` is the cooperative cancellation flag; `log` is the span every
    /// log line of this worker, and of the engines it creates, goes to.
    pub fn new(
        config: Arc<BgpConfig>,
        peer_address: IpAddr,
        factory: F,
        bus: B,
        stop: watch::Receiver<bool>,
        log: Span,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let hold_time = config.hold_time;
        Self {
            config,
            peer_address,
            id: format!("peer-{}", peer_address),
            factory,
            engine: None,
            bus,
            state: SessionState::Idle,
            hold_time,
            active_families: Vec::new(),
            rtc_active: false,
            inbox_tx,
            inbox_rx,
            stop,
            log,
        }
    }

    /// Identifies this worker on the route bus.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer_address(&self) -> IpAddr {
        self.peer_address
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated hold time in seconds; the configured one before the
    /// first session is established.
    pub fn hold_time(&self) -> u16 {
        self.hold_time
    }

    pub fn active_families(&self) -> &[AddressFamily] {
        &self.active_families
    }

    pub fn rtc_active(&self) -> bool {
        self.rtc_active
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn should_stop(&self) -> bool {
        *self.stop.borrow()
    }

    /// Queue an event for the session loop.
    pub fn enqueue(&self, event: WorkerEvent) {
        // the receiver lives in self, so this cannot fail
        let _ = self.inbox_tx.send(event);
    }

    /// Take the next queued event, if any.
    pub fn next_event(&mut self) -> Option<WorkerEvent> {
        self.inbox_rx.try_recv().ok()
    }

    fn subscriber(&self) -> Subscriber {
        Subscriber {
            id: self.id.clone(),
            inbox: self.inbox_tx.clone(),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!(parent: &self.log, from = %self.state, to = %state, "Session state change");
            self.state = state;
        }
        metrics::record_session_state(&self.id, state);
    }

    /// Sleep for `duration`, waking early if a stop is requested.
    async fn pause(&self, duration: Duration) {
        let mut stop = self.stop.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            Ok(_) = stop.wait_for(|stopped| *stopped) => {}
        }
    }

    /// Tear the session down. Safe to call any number of times.
    pub async fn stop_and_clean(&mut self) {
        self.active_families.clear();
        self.rtc_active = false;
        self.set_state(SessionState::Idle);

        if let Some(mut engine) = self.engine.take() {
            debug!(parent: &self.log, "Closing connection");
            engine.close().await;
        }

        self.bus.cleanup(&self.id).await;
        // events queued for the old session have nowhere to go
        (self.inbox_tx, self.inbox_rx) = mpsc::unbounded_channel();
    }

    /// Read-only view for introspection tooling.
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            state: self.state.as_str(),
            peering_addresses: PeeringAddresses {
                peer_address: self.peer_address,
                local_address: IpAddr::V4(self.config.local_address),
                peer_port: self.config.bgp_port,
            },
            as_info: AsInfo {
                local: self.config.my_as,
                peer: self.config.my_as,
            },
            hold_time: self.hold_time,
            rtc: RtcInfo {
                active: self.rtc_active,
                enabled: self.config.enable_rtc,
            },
            active_families: self.active_families.iter().map(|f| f.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub state: &'static str,
    pub peering_addresses: PeeringAddresses,
    pub as_info: AsInfo,
    pub hold_time: u16,
    pub rtc: RtcInfo,
    pub active_families: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeeringAddresses {
    pub peer_address: IpAddr,
    pub local_address: IpAddr,
    pub peer_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AsInfo {
    pub local: u32,
    pub peer: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RtcInfo {
    pub active: bool,
    pub enabled: bool,
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for the worker tests.

    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    use tokio::sync::watch;
    use tracing::Span;

    use super::PeerWorker;
    use crate::bgp::engine::mock::MockEngine;
    use crate::bgp::family::AddressFamily;
    use crate::bgp::route::{RouteEntry, RouteTarget};
    use crate::bus::{RouteBus, Subscriber};
    use crate::config::BgpConfig;

    /// A bus call as seen by [`RecordingBus`].
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum BusCall {
        Advertise(RouteEntry),
        Withdraw(RouteEntry),
        Subscribe(AddressFamily, Option<RouteTarget>),
        Unsubscribe(AddressFamily, Option<RouteTarget>),
        Cleanup,
    }

    /// Route bus that only records what it is asked to do.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingBus {
        calls: Arc<Mutex<Vec<BusCall>>>,
    }

    impl RecordingBus {
        pub fn calls(&self) -> Vec<BusCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn clear(&self) {
            self.calls.lock().unwrap().clear();
        }

        fn record(&self, call: BusCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl RouteBus for RecordingBus {
        async fn advertise(&self, _source: &str, entry: RouteEntry) {
            self.record(BusCall::Advertise(entry));
        }

        async fn withdraw(&self, _source: &str, entry: RouteEntry) {
            self.record(BusCall::Withdraw(entry));
        }

        async fn subscribe(
            &self,
            _subscriber: Subscriber,
            family: AddressFamily,
            route_target: Option<RouteTarget>,
        ) {
            self.record(BusCall::Subscribe(family, route_target));
        }

        async fn unsubscribe(
            &self,
            _worker_id: &str,
            family: AddressFamily,
            route_target: Option<RouteTarget>,
        ) {
            self.record(BusCall::Unsubscribe(family, route_target));
        }

        async fn cleanup(&self, _worker_id: &str) {
            self.record(BusCall::Cleanup);
        }
    }

    pub fn config(enable_rtc: bool) -> BgpConfig {
        let mut config = BgpConfig::new(Ipv4Addr::new(192, 0, 2, 1), 64512);
        config.enable_rtc = enable_rtc;
        config
    }

    pub struct Fixture {
        pub worker: PeerWorker<MockEngine, RecordingBus>,
        pub engine: MockEngine,
        pub bus: RecordingBus,
        pub stop: watch::Sender<bool>,
    }

    pub fn fixture(config: BgpConfig) -> Fixture {
        let engine = MockEngine::new();
        let bus = RecordingBus::default();
        let (stop, stop_rx) = watch::channel(false);
        let worker = PeerWorker::new(
            Arc::new(config),
            "192.0.2.2".parse().unwrap(),
            engine.clone(),
            bus.clone(),
            stop_rx,
            Span::none(),
        );
        Fixture {
            worker,
            engine,
            bus,
            stop,
        }
    }

    /// A worker with an established session over `peer_families`.
    pub async fn established(enable_rtc: bool, peer_families: &[AddressFamily]) -> Fixture {
        let mut f = fixture(config(enable_rtc));
        f.engine.negotiate(peer_families, 90);
        f.worker.initiate_connection().await.unwrap();
        f.worker.to_established().await;
        f.bus.clear();
        f
    }
}
