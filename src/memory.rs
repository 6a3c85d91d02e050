use crate::backend::{Backend, BackendKind, MutationRequest, RawChange};
use crate::error::Error;
use crate::events::ChangeKind;
use crate::subscriptions::subscription_key;
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// In-process backend for tests and demos.
///
/// Behaves like a cooperative sync server: subscriptions are acknowledged
/// instantly, mutations succeed, and probes answer with a fixed latency.
/// Knobs turn the server unreachable, make it reject mutations or
/// subscriptions, or slow its mutation handling down, which is enough to
/// script failover, offline, and replay scenarios without a network.
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

struct Inner {
    online: bool,
    probe_latency: Duration,
    mutation_rejection: Option<String>,
    subscription_rejection: Option<String>,
    mutation_delay: Duration,
    mutations: Vec<MutationRequest>,
    mutation_attempts: usize,
    probes: usize,
    subs: HashMap<(String, Option<String>), mpsc::Sender<RawChange>>,
}

impl MemoryBackend {
    /// Create a reachable backend that accepts everything
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                online: true,
                probe_latency: Duration::from_millis(1),
                mutation_rejection: None,
                subscription_rejection: None,
                mutation_delay: Duration::ZERO,
                mutations: Vec::new(),
                mutation_attempts: 0,
                probes: 0,
                subs: HashMap::new(),
            }),
        }
    }

    /// Make the server reachable or unreachable
    pub fn set_online(&self, online: bool) {
        self.inner.lock().online = online;
    }

    /// Set the round-trip time probes report
    pub fn set_probe_latency(&self, latency: Duration) {
        self.inner.lock().probe_latency = latency;
    }

    /// Reject every mutation with this message, or accept again with `None`
    pub fn set_mutation_rejection(&self, message: Option<String>) {
        self.inner.lock().mutation_rejection = message;
    }

    /// Reject every subscription with this message, or accept again with `None`
    pub fn set_subscription_rejection(&self, message: Option<String>) {
        self.inner.lock().subscription_rejection = message;
    }

    /// Delay mutation handling, e.g. to trip the mutation timeout
    pub fn set_mutation_delay(&self, delay: Duration) {
        self.inner.lock().mutation_delay = delay;
    }

    /// Mutations the server accepted, in arrival order
    pub fn mutations(&self) -> Vec<MutationRequest> {
        self.inner.lock().mutations.clone()
    }

    /// How many mutation deliveries were attempted, including failed ones
    pub fn mutation_attempts(&self) -> usize {
        self.inner.lock().mutation_attempts
    }

    /// How many probes this server has answered or refused
    pub fn probes(&self) -> usize {
        self.inner.lock().probes
    }

    /// Keys of currently registered subscriptions, sorted
    pub fn subscription_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .inner
            .lock()
            .subs
            .keys()
            .map(|(topic, filter)| subscription_key(topic, filter.as_deref()))
            .collect();
        keys.sort();
        keys
    }

    /// Emit a change to every subscription on `topic`.
    ///
    /// Returns whether at least one subscriber received it.
    pub async fn push_change(&self, topic: &str, kind: ChangeKind, record: Value) -> bool {
        let sinks: Vec<mpsc::Sender<RawChange>> = {
            let inner = self.inner.lock();
            inner
                .subs
                .iter()
                .filter(|((sub_topic, _), _)| sub_topic == topic)
                .map(|(_, sink)| sink.clone())
                .collect()
        };

        let mut delivered = false;
        for sink in sinks {
            let change = RawChange {
                topic: topic.to_string(),
                kind,
                record: record.clone(),
            };
            if sink.send(change).await.is_ok() {
                delivered = true;
            }
        }
        delivered
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn probe(&self) -> Result<Duration> {
        let mut inner = self.inner.lock();
        inner.probes += 1;
        if inner.online {
            Ok(inner.probe_latency)
        } else {
            Err(Error::Transport("server unreachable".to_string()))
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        filter: Option<&str>,
        sink: mpsc::Sender<RawChange>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(Error::Transport("server unreachable".to_string()));
        }
        if let Some(message) = &inner.subscription_rejection {
            return Err(Error::SubscribeRejected {
                topic: topic.to_string(),
                message: message.clone(),
            });
        }
        inner
            .subs
            .insert((topic.to_string(), filter.map(str::to_string)), sink);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, filter: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(Error::Transport("server unreachable".to_string()));
        }
        inner
            .subs
            .remove(&(topic.to_string(), filter.map(str::to_string)));
        Ok(())
    }

    async fn mutate(&self, request: &MutationRequest) -> Result<()> {
        let delay = {
            let mut inner = self.inner.lock();
            inner.mutation_attempts += 1;
            inner.mutation_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.lock();
        if !inner.online {
            return Err(Error::Transport("server unreachable".to_string()));
        }
        if let Some(message) = &inner.mutation_rejection {
            return Err(Error::MutationRejected {
                table: request.table.clone(),
                message: message.clone(),
            });
        }
        inner.mutations.push(request.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_probe_reflects_reachability() {
        let backend = MemoryBackend::new();
        backend.set_probe_latency(Duration::from_millis(7));

        assert_eq!(backend.probe().await.expect("probe"), Duration::from_millis(7));

        backend.set_online(false);
        assert!(backend.probe().await.is_err());
        assert_eq!(backend.probes(), 2);
    }

    #[tokio::test]
    async fn test_push_change_requires_subscription() {
        let backend = MemoryBackend::new();

        assert!(
            !backend
                .push_change("orders", ChangeKind::Insert, json!({"id": "1"}))
                .await
        );

        let (tx, mut rx) = mpsc::channel(8);
        backend
            .subscribe("orders", None, tx)
            .await
            .expect("subscribe");
        assert!(
            backend
                .push_change("orders", ChangeKind::Insert, json!({"id": "1"}))
                .await
        );
        assert_eq!(rx.recv().await.expect("change").record["id"], "1");
    }

    #[tokio::test]
    async fn test_rejection_reports_table() {
        let backend = MemoryBackend::new();
        backend.set_mutation_rejection(Some("stale row".to_string()));

        let request = MutationRequest {
            kind: ChangeKind::Update,
            table: "orders".to_string(),
            record_id: Some("42".to_string()),
            payload: json!({"status": "served"}),
        };
        let err = backend.mutate(&request).await.expect_err("rejection");

        assert!(err.to_string().contains("orders"));
        assert!(!err.is_connectivity());
        assert!(backend.mutations().is_empty());
        assert_eq!(backend.mutation_attempts(), 1);
    }
}
