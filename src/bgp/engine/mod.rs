//! Protocol engine abstraction.
//!
//! The protocol engine owns everything wire-level: sockets, message
//! encoding and decoding, and BGP FSM enforcement. A peer worker drives it
//! through the traits in this module, which also lets the worker be tested
//! against the scriptable [`mock::MockEngine`].

pub mod mock;

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use bytes::Bytes;
use tracing::Span;

use crate::bgp::family::AddressFamily;
use crate::bgp::message::{Message, Notification, OpenMessage, UpdateMessage};

/// Session states as reported by the engine's FSM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Idle,
    Active,
    Connect,
    OpenSent,
    OpenConfirm,
    Established,
}

impl EngineState {
    pub const ALL: [EngineState; 6] = [
        EngineState::Idle,
        EngineState::Active,
        EngineState::Connect,
        EngineState::OpenSent,
        EngineState::OpenConfirm,
        EngineState::Established,
    ];
}

/// What the engine asks the caller to do before polling the next step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstablishAction {
    /// Nothing to do right now, come back later.
    Later,
    /// More work is immediately pending.
    Now,
    /// The socket was closed.
    Close,
}

/// One step of connection establishment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EstablishStep {
    pub state: EngineState,
    pub action: EstablishAction,
}

impl EstablishStep {
    pub fn new(state: EngineState, action: EstablishAction) -> Self {
        Self { state, action }
    }
}

/// Error type for engine operations.
#[derive(Debug)]
pub enum EngineError {
    /// Connection setup was interrupted before completing.
    Interrupted,
    /// A NOTIFICATION was raised, either received from the peer or
    /// generated locally while checking the peer's messages.
    Notification(Notification),
    /// The TCP connection was lost.
    LostConnection(String),
    /// A received message could not be decoded.
    Decode(String),
    /// An outbound message could not be encoded.
    Encode(String),
    /// Any other protocol-level failure.
    Protocol(String),
    /// Other I/O error.
    Io(io::Error),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Interrupted => write!(f, "connect was interrupted"),
            EngineError::Notification(n) => write!(f, "notification: {}", n),
            EngineError::LostConnection(msg) => write!(f, "lost connection: {}", msg),
            EngineError::Decode(msg) => write!(f, "decode error: {}", msg),
            EngineError::Encode(msg) => write!(f, "encode error: {}", msg),
            EngineError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            EngineError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for EngineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            EngineError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for EngineError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => EngineError::LostConnection(e.to_string()),
            io::ErrorKind::Interrupted => EngineError::Interrupted,
            _ => EngineError::Io(e),
        }
    }
}

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// What a new engine should negotiate with its peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Neighbor {
    pub router_id: Ipv4Addr,
    pub local_as: u32,
    pub peer_as: u32,
    pub local_address: IpAddr,
    pub peer_address: IpAddr,
    pub port: u16,
    pub hold_time: u16,
    pub families: Vec<AddressFamily>,
}

/// Negotiated session context, available once establishment completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Hold time in seconds.
    pub hold_time: u16,
    /// The OPEN the peer sent and we accepted.
    pub received_open: OpenMessage,
}

impl Negotiated {
    /// Families the peer advertised through multiprotocol capabilities.
    pub fn peer_families(&self) -> Vec<AddressFamily> {
        self.received_open.families.clone()
    }
}

/// A connected (or connecting) BGP speaker for one peer.
#[allow(async_fn_in_trait)]
pub trait ProtocolEngine: Send {
    /// Advance connection establishment by one step. `Ok(None)` means the
    /// session is established.
    async fn establish_step(&mut self) -> EngineResult<Option<EstablishStep>>;

    /// Wait until data can be read or `timeout` elapses.
    async fn wait_readable(&mut self, timeout: Duration);

    /// Whether the underlying connection is still present.
    fn is_connected(&self) -> bool;

    /// Read one message, or [`Message::Nop`] when none is complete yet.
    async fn read_message(&mut self) -> EngineResult<Message>;

    /// Write raw bytes to the peer, to completion.
    async fn write(&mut self, data: &[u8]) -> EngineResult<()>;

    /// The negotiated context, once established.
    fn negotiated(&self) -> Option<Negotiated>;

    /// Encode an UPDATE with the negotiated context.
    fn encode_update(&self, update: &UpdateMessage) -> EngineResult<Bytes>;

    /// Close the connection and stop the engine.
    async fn close(&mut self);
}

/// Creates one engine per connection attempt.
pub trait EngineFactory: Send {
    type Engine: ProtocolEngine;

    /// `log` is the span of the owning worker; the engine logs inside it.
    fn create(&mut self, neighbor: Neighbor, log: Span) -> Self::Engine;
}
