//! Failure taxonomy surfaced to callers.
//!
//! Every variant carries the human-readable message that lands in an Error
//! envelope; the variant itself records which class of failure produced it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Malformed message or unknown method.
    #[error("{0}")]
    Protocol(String),
    /// Origin not allowed, or a platform permission is missing.
    #[error("{0}")]
    Permission(String),
    /// Size cap exceeded or insufficient storage.
    #[error("{0}")]
    Resource(String),
    /// Connect/read failure or a non-2xx download status.
    #[error("{0}")]
    Network(String),
    /// The platform reported a failure status.
    #[error("{0}")]
    Platform(String),
    /// A bounded wait elapsed.
    #[error("{0}")]
    Timeout(String),
}

impl AgentError {
    pub fn protocol(msg: impl Into<String>) -> Self {
        AgentError::Protocol(msg.into())
    }

    pub fn permission(msg: impl Into<String>) -> Self {
        AgentError::Permission(msg.into())
    }

    pub fn resource(msg: impl Into<String>) -> Self {
        AgentError::Resource(msg.into())
    }

    pub fn network(msg: impl Into<String>) -> Self {
        AgentError::Network(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        AgentError::Platform(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        AgentError::Timeout(msg.into())
    }
}
