//! Controller-link lifecycle state.

use std::fmt;

/// Connection lifecycle as observed by the rest of the agent. Owned and
/// mutated exclusively by the reverse-link supervisor; everyone else reads a
/// watch channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Controller rejected our credentials. No automatic retry.
    Unauthorized,
    /// Controller refused the device (device limit / bad request). No
    /// automatic retry.
    LimitExceeded,
    Error,
}

impl ConnectionState {
    /// Terminal states require explicit user action before another connect.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Unauthorized | ConnectionState::LimitExceeded
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Unauthorized => "unauthorized",
            ConnectionState::LimitExceeded => "limit_exceeded",
            ConnectionState::Error => "error",
        };
        f.write_str(name)
    }
}
