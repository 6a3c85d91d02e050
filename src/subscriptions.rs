use crate::backend::RawChange;
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use crate::registry::ServerRegistry;
use crate::Result;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle state of one subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    /// Not registered with any server
    Unsubscribed,
    /// Registration sent, awaiting the server's acknowledgement
    Pending,
    /// Acknowledged and receiving changes
    Subscribed,
    /// Registration failed; the next subscribe call retries it
    Error,
}

/// Point-in-time view of one subscription
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStatus {
    /// Canonical `topic:filter` key
    pub key: String,
    /// Topic (usually a table name)
    pub topic: String,
    /// Optional server-side filter expression
    pub filter: Option<String>,
    /// Current lifecycle state
    pub state: SubscriptionState,
    /// Server this subscription is bound to
    pub server_id: String,
}

struct SubscriptionEntry {
    topic: String,
    filter: Option<String>,
    state: SubscriptionState,
    server_id: String,
}

/// Canonical subscription key. An absent filter keys as an empty filter,
/// so `orders` with no filter is `orders:`.
pub(crate) fn subscription_key(topic: &str, filter: Option<&str>) -> String {
    format!("{}:{}", topic, filter.unwrap_or(""))
}

/// Tracks every subscription the engine holds and keeps them bound to the
/// active server.
///
/// Subscriptions are keyed by `topic:filter`. Registering the same key twice
/// is a no-op. A failed registration parks the key in `Error`; the next
/// subscribe call for that key retries it. On failover, live subscriptions
/// are re-registered on the new server in one concurrent batch.
pub(crate) struct SubscriptionManager {
    entries: RwLock<HashMap<String, SubscriptionEntry>>,
    pool: Arc<ConnectionPool>,
    registry: Arc<ServerRegistry>,
    ingest_tx: mpsc::Sender<RawChange>,
    metrics: Arc<Metrics>,
}

impl SubscriptionManager {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        registry: Arc<ServerRegistry>,
        ingest_tx: mpsc::Sender<RawChange>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            pool,
            registry,
            ingest_tx,
            metrics,
        }
    }

    /// Register a subscription on the active server.
    ///
    /// Returns once the server acknowledges. A key that is already pending
    /// or subscribed returns its existing status without registering again.
    pub(crate) async fn subscribe(
        &self,
        topic: &str,
        filter: Option<&str>,
    ) -> Result<SubscriptionStatus> {
        let key = subscription_key(topic, filter);
        let server_id = self.registry.active_id();

        // One lock pass decides whether remote work is needed; Error
        // entries get a fresh attempt.
        {
            let mut entries = self.entries.write();
            match entries.get_mut(&key) {
                Some(entry)
                    if matches!(
                        entry.state,
                        SubscriptionState::Pending | SubscriptionState::Subscribed
                    ) =>
                {
                    return Ok(SubscriptionStatus {
                        key: key.clone(),
                        topic: entry.topic.clone(),
                        filter: entry.filter.clone(),
                        state: entry.state,
                        server_id: entry.server_id.clone(),
                    });
                }
                Some(entry) => {
                    entry.state = SubscriptionState::Pending;
                    entry.server_id = server_id.clone();
                }
                None => {
                    entries.insert(
                        key.clone(),
                        SubscriptionEntry {
                            topic: topic.to_string(),
                            filter: filter.map(str::to_string),
                            state: SubscriptionState::Pending,
                            server_id: server_id.clone(),
                        },
                    );
                }
            }
        }

        let client = match self.pool.active_client() {
            Ok(client) => client,
            Err(err) => {
                self.mark(&key, SubscriptionState::Error);
                return Err(err);
            }
        };

        match client.subscribe(topic, filter, self.ingest_tx.clone()).await {
            Ok(()) => {
                self.mark(&key, SubscriptionState::Subscribed);
                self.metrics.record_subscription_created();
                info!("[SUB] {} subscribed on {}", key, server_id);
                Ok(SubscriptionStatus {
                    key,
                    topic: topic.to_string(),
                    filter: filter.map(str::to_string),
                    state: SubscriptionState::Subscribed,
                    server_id,
                })
            }
            Err(err) => {
                self.mark(&key, SubscriptionState::Error);
                warn!("[SUB] {} failed on {}: {}", key, server_id, err);
                Err(err)
            }
        }
    }

    /// Remove a subscription. Unknown keys are a no-op.
    pub(crate) async fn unsubscribe(&self, topic: &str, filter: Option<&str>) -> Result<()> {
        let key = subscription_key(topic, filter);
        let Some(entry) = self.entries.write().remove(&key) else {
            return Ok(());
        };

        // Local removal already happened; the remote side is best effort
        if entry.state == SubscriptionState::Subscribed {
            if let Ok(client) = self.pool.active_client() {
                if let Err(err) = client.unsubscribe(topic, filter).await {
                    debug!("[SUB] remote unsubscribe for {} failed: {}", key, err);
                }
            }
        }
        info!("[SUB] {} removed", key);
        Ok(())
    }

    /// Re-register every live subscription on `to_server`.
    ///
    /// The old server is not contacted: failover only runs when it is
    /// presumed dead, and its connection teardown clears server-side state.
    /// Error entries stay behind for their owners to retry. Returns how
    /// many subscriptions came up on the new server.
    pub(crate) async fn migrate_all(&self, to_server: &str) -> usize {
        let targets: Vec<(String, String, Option<String>)> = {
            let mut entries = self.entries.write();
            entries
                .iter_mut()
                .filter(|(_, entry)| {
                    matches!(
                        entry.state,
                        SubscriptionState::Pending | SubscriptionState::Subscribed
                    )
                })
                .map(|(key, entry)| {
                    entry.state = SubscriptionState::Pending;
                    entry.server_id = to_server.to_string();
                    (key.clone(), entry.topic.clone(), entry.filter.clone())
                })
                .collect()
        };

        if targets.is_empty() {
            return 0;
        }

        let Some(client) = self.pool.client_for(to_server) else {
            for (key, _, _) in &targets {
                self.mark(key, SubscriptionState::Error);
            }
            return 0;
        };

        let results = join_all(targets.iter().map(|(key, topic, filter)| {
            let client = client.clone();
            let sink = self.ingest_tx.clone();
            async move {
                let result = client.subscribe(topic, filter.as_deref(), sink).await;
                (key.as_str(), result)
            }
        }))
        .await;

        let mut migrated = 0;
        for (key, result) in results {
            match result {
                Ok(()) => {
                    self.mark(key, SubscriptionState::Subscribed);
                    self.metrics.record_subscription_migrated();
                    migrated += 1;
                }
                Err(err) => {
                    self.mark(key, SubscriptionState::Error);
                    warn!("[SUB] migration of {} to {} failed: {}", key, to_server, err);
                }
            }
        }

        info!(
            "[SUB] migrated {}/{} subscriptions to {}",
            migrated,
            targets.len(),
            to_server
        );
        migrated
    }

    /// Current state of one key
    pub(crate) fn state_of(&self, topic: &str, filter: Option<&str>) -> SubscriptionState {
        let key = subscription_key(topic, filter);
        self.entries
            .read()
            .get(&key)
            .map(|entry| entry.state)
            .unwrap_or(SubscriptionState::Unsubscribed)
    }

    /// All tracked subscriptions, ordered by key
    pub(crate) fn statuses(&self) -> Vec<SubscriptionStatus> {
        let mut statuses: Vec<SubscriptionStatus> = self
            .entries
            .read()
            .iter()
            .map(|(key, entry)| SubscriptionStatus {
                key: key.clone(),
                topic: entry.topic.clone(),
                filter: entry.filter.clone(),
                state: entry.state,
                server_id: entry.server_id.clone(),
            })
            .collect();
        statuses.sort_by(|a, b| a.key.cmp(&b.key));
        statuses
    }

    fn mark(&self, key: &str, state: SubscriptionState) {
        if let Some(entry) = self.entries.write().get_mut(key) {
            entry.state = state;
        }
    }
}
