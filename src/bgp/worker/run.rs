use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn, Instrument};

use super::{PeerWorker, ReceiveOutcome, WorkerEvent};
use crate::bgp::engine::EngineFactory;
use crate::bus::RouteBus;
use crate::error::WorkerError;

/// How an established session ended without an error.
enum SessionEnd {
    Stopped,
    Reconnect,
}

impl<F: EngineFactory, B: RouteBus> PeerWorker<F, B> {
    /// Run sessions with the peer until stopped.
    ///
    /// Connection failures and recoverable session errors are retried after
    /// the connect-retry delay. Fatal errors are returned to the caller,
    /// which decides whether to restart the worker.
    pub async fn run(&mut self) -> Result<(), WorkerError> {
        let span = self.log.clone();
        self.run_sessions().instrument(span).await
    }

    async fn run_sessions(&mut self) -> Result<(), WorkerError> {
        info!(peer = %self.peer_address, "Starting peer worker");
        loop {
            if self.should_stop() {
                break;
            }

            let result = match self.initiate_connection().await {
                Ok(()) => {
                    self.to_established().await;
                    info!(peer = %self.peer_address, "Session established");
                    self.run_established().await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(SessionEnd::Stopped) | Err(WorkerError::Stopped) => break,
                Ok(SessionEnd::Reconnect) => {
                    self.stop_and_clean().await;
                }
                Err(e) if e.is_fatal() => {
                    error!(peer = %self.peer_address, error = %e, "Session failed: {}", e);
                    self.stop_and_clean().await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(peer = %self.peer_address, error = %e, "Session failed, retrying: {}", e);
                    self.stop_and_clean().await;
                }
            }
            self.pause(self.config.connect_retry()).await;
        }

        self.stop_and_clean().await;
        info!(peer = %self.peer_address, "Peer worker stopped");
        Ok(())
    }

    async fn run_established(&mut self) -> Result<SessionEnd, WorkerError> {
        let hold_time = Duration::from_secs(u64::from(self.hold_time));
        let keepalive_interval = hold_time / 3;
        let timers_enabled = self.hold_time > 0;
        let mut hold_deadline = Instant::now() + hold_time;
        let mut keepalive_deadline = Instant::now() + keepalive_interval;

        loop {
            if self.should_stop() {
                return Ok(SessionEnd::Stopped);
            }

            if self.receive_once().await? == ReceiveOutcome::Retry {
                return Ok(SessionEnd::Reconnect);
            }

            while let Some(event) = self.next_event() {
                match event {
                    WorkerEvent::KeepAliveReceived | WorkerEvent::UpdateReceived => {
                        hold_deadline = Instant::now() + hold_time;
                    }
                    WorkerEvent::Route(route_event) => {
                        let data = self.update_for_route_event(&route_event);
                        if !data.is_empty() {
                            self.send(&data).await;
                        }
                    }
                }
            }

            if timers_enabled {
                let now = Instant::now();
                if now >= hold_deadline {
                    warn!(peer = %self.peer_address, "Hold timer expired");
                    return Ok(SessionEnd::Reconnect);
                }
                if now >= keepalive_deadline {
                    self.send(&Self::keepalive_message_data()).await;
                    keepalive_deadline = now + keepalive_interval;
                }
            }
        }
    }
}
