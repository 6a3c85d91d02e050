use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::events::ChangeKind;

/// Which transport serves a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// WebSocket gateway transport
    Gateway,
    /// In-process transport for tests and demos
    Memory,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Gateway => write!(f, "gateway"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

/// A change notification as delivered by a backend, before normalization
#[derive(Debug, Clone)]
pub struct RawChange {
    /// Topic the change arrived on (usually a table name)
    pub topic: String,
    /// What happened to the record
    pub kind: ChangeKind,
    /// The record payload as the server sent it
    pub record: Value,
}

/// A mutation to deliver to the active server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// What to do with the record
    pub kind: ChangeKind,
    /// Target table
    pub table: String,
    /// Record identifier, when the operation targets an existing record
    pub record_id: Option<String>,
    /// Field values for the operation
    pub payload: Value,
}

/// Transport abstraction over one sync server.
///
/// The engine holds one backend per configured descriptor for the lifetime
/// of the process and multiplexes all work for that server through it.
/// Implementations must be safe to call from concurrent tasks.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Which transport this backend speaks
    fn kind(&self) -> BackendKind;

    /// Check liveness of the server, returning the observed round-trip time.
    ///
    /// A probe must be cheap and must not disturb subscriptions or in-flight
    /// mutations.
    async fn probe(&self) -> Result<Duration>;

    /// Register a subscription and route matching changes into `sink`.
    ///
    /// Resolves once the server has acknowledged the subscription. Changes
    /// may begin arriving on `sink` immediately after.
    async fn subscribe(
        &self,
        topic: &str,
        filter: Option<&str>,
        sink: mpsc::Sender<RawChange>,
    ) -> Result<()>;

    /// Remove a subscription previously registered with [`Backend::subscribe`]
    async fn unsubscribe(&self, topic: &str, filter: Option<&str>) -> Result<()>;

    /// Deliver a mutation, resolving once the server confirms or rejects it
    async fn mutate(&self, request: &MutationRequest) -> Result<()>;
}
