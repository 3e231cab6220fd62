use std::net::IpAddr;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::PeerWorker;
use crate::bgp::engine::{
    EngineError, EngineFactory, EstablishAction, Neighbor, ProtocolEngine,
};
use crate::bgp::family::AddressFamily;
use crate::bgp::SessionState;
use crate::bus::RouteBus;
use crate::error::WorkerError;

/// Backoff after the engine asks to be polled later.
pub(super) const ESTABLISH_LATER_DELAY: Duration = Duration::from_secs(2);

/// Backoff after the engine reports more immediate work.
pub(super) const ESTABLISH_NOW_DELAY: Duration = Duration::from_millis(100);

/// NOTIFICATION code/subcode the engine raises when the peer's OPEN did not
/// arrive before the hold timer ran out.
const OPEN_WAIT_TIMEOUT_CODES: (u8, u8) = (1, 1);

impl<F: EngineFactory, B: RouteBus> PeerWorker<F, B> {
    /// Families offered to the peer: the enabled ones, then RTC if enabled.
    pub fn configured_families(&self) -> Vec<AddressFamily> {
        let mut families = self.config.enabled_families.clone();
        if self.config.enable_rtc {
            families.push(AddressFamily::IPV4_RTC);
        }
        families
    }

    fn neighbor(&self) -> Neighbor {
        Neighbor {
            router_id: self.config.local_address,
            local_as: self.config.my_as,
            // no inter-AS sessions
            peer_as: self.config.my_as,
            local_address: IpAddr::V4(self.config.local_address),
            peer_address: self.peer_address,
            port: self.config.bgp_port,
            hold_time: self.config.hold_time,
            families: self.configured_families(),
        }
    }

    /// Open a session with the peer and negotiate the active families.
    ///
    /// The engine created for the attempt is kept even when establishment
    /// fails, so that [`stop_and_clean`](Self::stop_and_clean) closes it.
    /// An engine left over from a previous attempt is closed first.
    pub async fn initiate_connection(&mut self) -> Result<(), WorkerError> {
        self.rtc_active = false;
        self.active_families.clear();

        if let Some(mut previous) = self.engine.take() {
            debug!(parent: &self.log, "Closing previous connection");
            previous.close().await;
        }

        let neighbor = self.neighbor();
        debug!(parent: &self.log, port = neighbor.port, local_as = neighbor.local_as,
            families = ?neighbor.families, "Initiating connection");
        let mut engine = self.factory.create(neighbor, self.log.clone());

        let result = self.drive_establishment(&mut engine).await;
        let negotiated = engine.negotiated();
        self.engine = Some(engine);
        result?;

        let negotiated = negotiated.ok_or_else(|| {
            WorkerError::Engine(EngineError::Protocol(
                "established without a negotiated context".into(),
            ))
        })?;
        self.hold_time = negotiated.hold_time;
        self.negotiate_families(&negotiated.peer_families());
        Ok(())
    }

    async fn drive_establishment(&mut self, engine: &mut F::Engine) -> Result<(), WorkerError> {
        loop {
            let step = match engine.establish_step().await {
                Ok(Some(step)) => step,
                Ok(None) => return Ok(()),
                Err(e) => return Err(self.establish_error(e)),
            };
            self.set_state(SessionState::from(step.state));

            match step.action {
                EstablishAction::Later => tokio::time::sleep(ESTABLISH_LATER_DELAY).await,
                EstablishAction::Now => tokio::time::sleep(ESTABLISH_NOW_DELAY).await,
                EstablishAction::Close => {}
            }

            if self.should_stop() {
                return Err(WorkerError::Stopped);
            }
            if step.action == EstablishAction::Close {
                return Err(WorkerError::InitiateConnection("socket closed".into()));
            }
        }
    }

    fn establish_error(&self, error: EngineError) -> WorkerError {
        match error {
            EngineError::Interrupted => {
                WorkerError::InitiateConnection("connect was interrupted".into())
            }
            EngineError::Notification(n) if n.codes() == OPEN_WAIT_TIMEOUT_CODES => {
                WorkerError::OpenWaitTimeout(n)
            }
            EngineError::Notification(n) => {
                error!(parent: &self.log, notification = %n, "Notification during connection setup");
                WorkerError::Notify(n)
            }
            EngineError::LostConnection(reason) => WorkerError::LostConnection(reason),
            other => WorkerError::Engine(other),
        }
    }

    /// Keep the offered families the peer also advertised.
    fn negotiate_families(&mut self, peer_families: &[AddressFamily]) {
        let mut active = Vec::new();
        for family in self.configured_families() {
            if peer_families.contains(&family) {
                active.push(family);
            } else {
                warn!(parent: &self.log, family = %family, "Peer does not support family {}", family);
            }
        }

        if active.is_empty() {
            error!(parent: &self.log, "No address family negotiated with peer");
        }

        self.rtc_active = self.config.enable_rtc && active.contains(&AddressFamily::IPV4_RTC);
        self.active_families = active;
        info!(parent: &self.log, hold_time = self.hold_time, rtc_active = self.rtc_active,
            families = ?self.active_families.iter().map(|f| f.to_string()).collect::<Vec<_>>(),
            "Negotiated address families");
    }

    /// Enter Established and subscribe to what the peer should receive.
    ///
    /// With RTC active only RTC routes are subscribed to; the peer's own RTC
    /// routes then drive the subscriptions for the other families.
    pub async fn to_established(&mut self) {
        self.set_state(SessionState::Established);

        let subscriber = self.subscriber();
        if self.rtc_active {
            self.bus.subscribe(subscriber, AddressFamily::IPV4_RTC, None).await;
        } else {
            for family in &self.active_families {
                self.bus.subscribe(subscriber.clone(), *family, None).await;
            }
        }
    }
}
