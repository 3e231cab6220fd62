use std::time::Duration;

use tracing::{error, trace, warn};

use super::{PeerWorker, WorkerEvent};
use crate::bgp::engine::{EngineError, EngineFactory, ProtocolEngine};
use crate::bgp::message::{Message, UpdateMessage};
use crate::bgp::route::{NlriAction, RouteEventKind};
use crate::bgp::SessionState;
use crate::bus::RouteBus;
use crate::error::WorkerError;
use crate::metrics;

/// How long one receive waits for the connection to become readable.
pub(super) const READ_POLL_TIMEOUT: Duration = Duration::from_secs(2);

/// What the caller should do after [`PeerWorker::receive_once`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Poll again.
    Continue,
    /// The session is unusable; tear it down and reconnect.
    Retry,
}

impl<F: EngineFactory, B: RouteBus> PeerWorker<F, B> {
    /// Read and handle at most one message from the peer.
    ///
    /// Without an engine this fails at once with a non-fatal
    /// `LostConnection`, before any readiness wait, so the runner reconnects.
    pub async fn receive_once(&mut self) -> Result<ReceiveOutcome, WorkerError> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(WorkerError::LostConnection("no connection".into()));
        };
        engine.wait_readable(READ_POLL_TIMEOUT).await;
        if !engine.is_connected() {
            return Err(WorkerError::LostConnection("connection closed".into()));
        }

        let message = match engine.read_message().await {
            Ok(message) => message,
            Err(EngineError::Notification(n)) => {
                error!(parent: &self.log, notification = %n, "Received NOTIFICATION from peer");
                return Ok(ReceiveOutcome::Retry);
            }
            Err(EngineError::LostConnection(reason)) => {
                warn!(parent: &self.log, reason = %reason, "Lost connection to peer");
                return Ok(ReceiveOutcome::Retry);
            }
            Err(EngineError::Decode(reason)) => {
                error!(parent: &self.log, reason = %reason, "Failed to decode message from peer");
                return Ok(ReceiveOutcome::Retry);
            }
            Err(e) => {
                error!(parent: &self.log, error = %e, "Error reading from peer");
                return Err(WorkerError::Engine(e));
            }
        };

        if message != Message::Nop {
            metrics::record_message_received(&self.id, message.name());
        }

        match message {
            Message::Nop => Ok(ReceiveOutcome::Continue),
            Message::Keepalive => {
                trace!(parent: &self.log, msg_type = "KEEPALIVE", "Received KEEPALIVE from peer");
                self.enqueue(WorkerEvent::KeepAliveReceived);
                Ok(ReceiveOutcome::Continue)
            }
            Message::Update(update) => {
                if self.state != SessionState::Established {
                    return Err(WorkerError::UpdateNotEstablished(self.state));
                }
                self.process_update(update).await?;
                self.enqueue(WorkerEvent::UpdateReceived);
                Ok(ReceiveOutcome::Continue)
            }
            other => {
                warn!(parent: &self.log, msg_type = other.name(), "Unexpected {} message from peer", other.name());
                Ok(ReceiveOutcome::Continue)
            }
        }
    }

    /// Publish every NLRI of an UPDATE. Nothing is published unless every
    /// NLRI carries a valid action.
    async fn process_update(&mut self, update: UpdateMessage) -> Result<(), WorkerError> {
        let UpdateMessage { nlris, attributes } = update;

        let mut routes = Vec::with_capacity(nlris.len());
        for nlri in nlris {
            let kind = match nlri.action {
                NlriAction::Announced => RouteEventKind::Advertise,
                NlriAction::Withdrawn => RouteEventKind::Withdraw,
                NlriAction::Unset => return Err(WorkerError::UnexpectedNlriAction(nlri.action)),
            };
            routes.push((kind, nlri));
        }

        for (kind, nlri) in routes {
            self.process_received_route(kind, nlri, attributes.clone()).await;
        }
        Ok(())
    }
}
