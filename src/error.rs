//! Error types for the peer session layer.
//!
//! Engine-level failures ([`EngineError`]) are classified by the worker into
//! the [`WorkerError`] variants below, which tell the session runner (or an
//! external supervisor) whether the session may simply be retried.

use std::io;

use thiserror::Error;

use crate::bgp::engine::EngineError;
use crate::bgp::message::Notification;
use crate::bgp::route::NlriAction;
use crate::bgp::SessionState;

/// Errors raised by a peer worker.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The worker was asked to stop.
    #[error("worker stopped")]
    Stopped,

    /// The connection could not be initiated.
    #[error("connection initiation failed: {0}")]
    InitiateConnection(String),

    /// The peer's OPEN did not arrive in time.
    #[error("timed out waiting for OPEN: {0}")]
    OpenWaitTimeout(Notification),

    /// The connection to the peer was lost.
    #[error("lost connection: {0}")]
    LostConnection(String),

    /// A NOTIFICATION ended connection establishment.
    #[error("notification received: {0}")]
    Notify(Notification),

    /// An UPDATE arrived before the session was established.
    #[error("UPDATE received in state {0}, not Established")]
    UpdateNotEstablished(SessionState),

    /// A received NLRI carried an action other than announce or withdraw.
    #[error("unexpected NLRI action {0:?}")]
    UnexpectedNlriAction(NlriAction),

    /// Unclassified engine failure.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

impl WorkerError {
    /// Whether the session must be handed to the supervisor rather than
    /// retried in place.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorkerError::Notify(_)
                | WorkerError::UpdateNotEstablished(_)
                | WorkerError::UnexpectedNlriAction(_)
                | WorkerError::Engine(_)
        )
    }
}

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),

    /// The TOML could not be parsed.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The values are inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(!WorkerError::Stopped.is_fatal());
        assert!(!WorkerError::InitiateConnection("socket closed".into()).is_fatal());
        assert!(!WorkerError::OpenWaitTimeout(Notification::new(1, 1, vec![])).is_fatal());
        assert!(!WorkerError::LostConnection("reset".into()).is_fatal());

        assert!(WorkerError::Notify(Notification::new(2, 2, vec![])).is_fatal());
        assert!(WorkerError::UpdateNotEstablished(SessionState::Connect).is_fatal());
        assert!(WorkerError::UnexpectedNlriAction(NlriAction::Unset).is_fatal());
        assert!(WorkerError::Engine(EngineError::Protocol("boom".into())).is_fatal());
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            WorkerError::UpdateNotEstablished(SessionState::Connect).to_string(),
            "UPDATE received in state Connect, not Established"
        );
        assert_eq!(
            WorkerError::InitiateConnection("socket closed".into()).to_string(),
            "connection initiation failed: socket closed"
        );
    }
}
