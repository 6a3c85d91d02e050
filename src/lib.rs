//! # livesync
//!
//! A realtime synchronization engine with prioritized server failover, live
//! subscriptions, and offline-tolerant optimistic mutations.
//!
//! ## Features
//!
//! - **Prioritized failover** - traffic moves to the best healthy backup
//! - **Health monitoring** via parallel probe rounds with latency tracking
//! - **Live subscriptions** that are recreated on the new server after a switch
//! - **Optimistic mutations** resolving to confirmed, reverted, or queued
//! - **Offline queue** with bounded-retry replay on reconnect
//! - **Connectivity awareness** blending platform hints with probe evidence
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use livesync::{EngineConfig, ServerConfig, SyncEngine};
//!
//! let config = EngineConfig::builder()
//!     .server(ServerConfig::new("primary", "wss://sync.example.com/socket", 1))
//!     .server(ServerConfig::new("backup", "wss://backup.example.com/socket", 2))
//!     .build()?;
//!
//! let engine = SyncEngine::connect(config)?;
//! engine.start().await?;
//! engine.subscribe("orders", None).await?;
//!
//! let mut events = engine.events();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```

mod backend;
mod config;
mod connectivity;
mod engine;
mod error;
mod events;
mod failover;
mod memory;
mod metrics;
mod mutations;
mod pool;
mod queue;
mod registry;
mod subscriptions;
mod ws;

pub use backend::{Backend, BackendKind, MutationRequest, RawChange};
pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, EngineConfig, EngineConfigBuilder, HealthConfig,
    ReplayConfig, ServerConfig,
};
pub use engine::{ServerStatus, SyncEngine};
pub use error::Error;
pub use events::{ChangeKind, EngineEvent, SyncEvent};
pub use memory::MemoryBackend;
pub use metrics::{Metrics, MetricsSnapshot};
pub use mutations::MutationOutcome;
pub use registry::ServerHealth;
pub use subscriptions::{SubscriptionState, SubscriptionStatus};
pub use ws::WsBackend;

/// Result type for livesync operations
pub type Result<T> = std::result::Result<T, Error>;
