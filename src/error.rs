use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in livesync
#[derive(Error, Debug)]
pub enum Error {
    /// No descriptor is currently marked active
    #[error("no active server")]
    NoActiveServer,

    /// A liveness probe against one server failed
    #[error("probe failed for server {server_id}: {message}")]
    Probe {
        server_id: String,
        message: String,
    },

    /// The backend declined a mutation while reachable
    #[error("mutation rejected for table {table}: {message}")]
    MutationRejected {
        table: String,
        message: String,
    },

    /// The backend rejected a subscription request
    #[error("subscribe rejected for topic {topic}: {message}")]
    SubscribeRejected {
        topic: String,
        message: String,
    },

    /// The wire transport failed (unreachable host, dropped connection, ...)
    #[error("transport error: {0}")]
    Transport(String),

    /// An explicit operation timeout elapsed
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Engine is already running
    #[error("engine is already running")]
    AlreadyRunning,

    /// Internal channel send error
    #[error("channel send error: {0}")]
    ChannelSend(String),
}

impl Error {
    /// Whether this failure is attributable to connectivity rather than a
    /// backend decision.
    ///
    /// Connectivity-class failures route a mutation into the offline queue
    /// instead of reverting it, and stop a replay pass without consuming the
    /// retry budget. Rejections (`MutationRejected`, `SubscribeRejected`)
    /// prove the server was reachable and are never classified here.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            Error::NoActiveServer
                | Error::Probe { .. }
                | Error::Transport(_)
                | Error::Timeout { .. }
                | Error::WebSocket(_)
                | Error::ChannelSend(_)
        )
    }
}
