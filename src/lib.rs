pub mod bgp;
pub mod bus;
pub mod config;
pub mod error;
pub mod metrics;

pub use bgp::{PeerWorker, SessionState, WorkerEvent};
pub use bus::{BusActor, BusHandle, RouteBus};
pub use config::{BgpConfig, Config};
pub use error::{ConfigError, WorkerError};
