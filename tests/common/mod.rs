use std::net::IpAddr;
use std::sync::Arc;

use bgpvpn::bgp::engine::mock::MockEngine;
use bgpvpn::bgp::worker::peer_span;
use bgpvpn::bus::BusHandle;
use bgpvpn::{BgpConfig, PeerWorker};
use tokio::sync::watch;

/// A worker talking to a scripted peer over the real route bus.
pub struct Peer {
    pub worker: PeerWorker<MockEngine, BusHandle>,
    pub engine: MockEngine,
    pub stop: watch::Sender<bool>,
}

impl Peer {
    pub fn new(config: Arc<BgpConfig>, address: IpAddr, bus: BusHandle) -> Self {
        let engine = MockEngine::new();
        let (stop, stop_rx) = watch::channel(false);
        let worker = PeerWorker::new(
            config,
            address,
            engine.clone(),
            bus,
            stop_rx,
            peer_span(address),
        );
        Self {
            worker,
            engine,
            stop,
        }
    }
}

/// Split an UPDATE written by the mock engine into (action, prefix) pairs.
pub fn mock_update_nlris(data: &[u8]) -> Vec<(u8, Vec<u8>)> {
    assert_eq!(data[18], 2, "not an UPDATE");
    let mut body = &data[19..];
    let mut nlris = Vec::new();
    while !body.is_empty() {
        let action = body[3];
        let len = body[4] as usize;
        nlris.push((action, body[5..5 + len].to_vec()));
        body = &body[5 + len..];
    }
    nlris
}
