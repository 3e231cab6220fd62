pub mod engine;
pub mod family;
pub mod message;
pub mod route;
pub mod session;
pub mod worker;

pub use engine::{EngineError, EngineFactory, EngineState, EstablishAction, ProtocolEngine};
pub use family::AddressFamily;
pub use message::{Message, Notification, OpenMessage, UpdateMessage};
pub use route::{Attributes, Nlri, NlriAction, RouteEntry, RouteEvent, RouteEventKind, RouteTarget};
pub use session::SessionState;
pub use worker::{PeerSnapshot, PeerWorker, ReceiveOutcome, WorkerEvent};
