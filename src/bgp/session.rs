//! BGP session state types.

use std::fmt;

use super::engine::EngineState;

/// Internal session state of a peer worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Active,
    Connect,
    OpenSent,
    OpenConfirm,
    Established,
}

impl SessionState {
    pub const ALL: [SessionState; 6] = [
        SessionState::Idle,
        SessionState::Active,
        SessionState::Connect,
        SessionState::OpenSent,
        SessionState::OpenConfirm,
        SessionState::Established,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Active => "Active",
            SessionState::Connect => "Connect",
            SessionState::OpenSent => "OpenSent",
            SessionState::OpenConfirm => "OpenConfirm",
            SessionState::Established => "Established",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<EngineState> for SessionState {
    fn from(state: EngineState) -> Self {
        match state {
            EngineState::Idle => SessionState::Idle,
            EngineState::Active => SessionState::Active,
            EngineState::Connect => SessionState::Connect,
            EngineState::OpenSent => SessionState::OpenSent,
            EngineState::OpenConfirm => SessionState::OpenConfirm,
            EngineState::Established => SessionState::Established,
        }
    }
}
