use crate::backend::MutationRequest;
use crate::connectivity::ConnectivityObserver;
use crate::error::Error;
use crate::events::{ChangeKind, EngineEvent, EventBus};
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use crate::queue::OfflineQueue;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};
use uuid::Uuid;

/// Terminal outcome of one optimistic mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOutcome {
    /// The active server accepted the mutation
    Confirmed,
    /// The server rejected it; consumers should undo the local change
    Reverted {
        /// Why the server refused
        reason: String,
    },
    /// No server was reachable; the mutation waits in the offline queue
    Queued {
        /// Queue entry id
        operation_id: Uuid,
    },
}

/// Runs the optimistic mutation protocol.
///
/// Every submission announces optimistic-applied before any server contact,
/// so the UI can render the change immediately. It then resolves to exactly
/// one terminal outcome: confirmed, reverted, or queued. A rejection from a
/// reachable server reverts; connectivity trouble of any shape defers to the
/// offline queue instead of failing the mutation.
pub(crate) struct MutationCoordinator {
    pool: Arc<ConnectionPool>,
    queue: Arc<OfflineQueue>,
    connectivity: Arc<ConnectivityObserver>,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    mutation_timeout: Duration,
}

impl MutationCoordinator {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        queue: Arc<OfflineQueue>,
        connectivity: Arc<ConnectivityObserver>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        mutation_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            queue,
            connectivity,
            bus,
            metrics,
            mutation_timeout,
        }
    }

    /// Apply a mutation optimistically and resolve its terminal outcome
    pub(crate) async fn submit(
        &self,
        kind: ChangeKind,
        table: &str,
        record_id: Option<String>,
        payload: Value,
    ) -> MutationOutcome {
        // Local-first: announce before any network work
        self.bus.publish(EngineEvent::OptimisticApplied {
            table: table.to_string(),
            kind,
            record_id: record_id.clone(),
            payload: payload.clone(),
        });

        if !self.connectivity.is_online() {
            let operation_id = self
                .queue
                .enqueue(kind, table.to_string(), record_id, payload);
            return MutationOutcome::Queued { operation_id };
        }

        let request = MutationRequest {
            kind,
            table: table.to_string(),
            record_id: record_id.clone(),
            payload: payload.clone(),
        };

        let result = match self.pool.active_client() {
            Ok(client) => match timeout(self.mutation_timeout, client.mutate(&request)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Timeout {
                    operation: "mutation",
                    timeout: self.mutation_timeout,
                }),
            },
            Err(err) => Err(err),
        };

        match result {
            Ok(()) => {
                self.connectivity.record_success();
                self.metrics.record_mutation_confirmed();
                info!("[MUTATE] confirmed {} on {}", kind, table);
                self.bus.publish(EngineEvent::Confirmed {
                    table: table.to_string(),
                    kind,
                    record_id,
                });
                MutationOutcome::Confirmed
            }
            Err(err) if err.is_connectivity() => {
                warn!("[MUTATE] deferring {} on {}: {}", kind, table, err);
                self.connectivity.record_failure();
                let operation_id = self
                    .queue
                    .enqueue(kind, table.to_string(), record_id, payload);
                MutationOutcome::Queued { operation_id }
            }
            Err(err) => {
                // The server answered; the mutation itself was refused
                self.connectivity.record_success();
                self.metrics.record_mutation_reverted();
                let reason = err.to_string();
                warn!("[MUTATE] reverting {} on {}: {}", kind, table, reason);
                self.bus.publish(EngineEvent::OptimisticRevert {
                    table: table.to_string(),
                    kind,
                    record_id,
                    reason: reason.clone(),
                });
                MutationOutcome::Reverted { reason }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Backend;
    use crate::config::{BackoffConfig, ReplayConfig, ServerConfig};
    use crate::memory::MemoryBackend;
    use crate::registry::ServerRegistry;
    use serde_json::json;
    use tokio::sync::broadcast;

    struct Fixture {
        coordinator: MutationCoordinator,
        queue: Arc<OfflineQueue>,
        backend: Arc<MemoryBackend>,
        bus: Arc<EventBus>,
        connectivity: Arc<ConnectivityObserver>,
    }

    fn fixture() -> Fixture {
        let servers = vec![ServerConfig::new("primary", "mem://primary", 1)];
        let registry = Arc::new(ServerRegistry::new(&servers));
        let backend = Arc::new(MemoryBackend::new());
        let clients: Vec<Arc<dyn Backend>> = vec![backend.clone()];
        let pool = Arc::new(ConnectionPool::new(registry, clients));
        let bus = Arc::new(EventBus::new(32));
        let metrics = Arc::new(Metrics::new());
        let connectivity = Arc::new(ConnectivityObserver::new(
            bus.clone(),
            metrics.clone(),
            2,
            false,
        ));
        let mutation_timeout = Duration::from_millis(100);
        let queue = Arc::new(OfflineQueue::new(
            pool.clone(),
            connectivity.clone(),
            bus.clone(),
            metrics.clone(),
            ReplayConfig {
                max_attempts: 3,
                backoff: BackoffConfig {
                    initial_delay: Duration::from_millis(5),
                    max_delay: Duration::from_millis(20),
                    multiplier: 2.0,
                    jitter: false,
                },
            },
            mutation_timeout,
        ));
        let coordinator = MutationCoordinator::new(
            pool,
            queue.clone(),
            connectivity.clone(),
            bus.clone(),
            metrics,
            mutation_timeout,
        );
        Fixture {
            coordinator,
            queue,
            backend,
            bus,
            connectivity,
        }
    }

    /// Drain the receiver and count terminal announcements for one mutation
    fn terminal_events(events: &mut broadcast::Receiver<EngineEvent>) -> (usize, usize, usize) {
        let (mut confirmed, mut reverted, mut queued) = (0, 0, 0);
        while let Ok(event) = events.try_recv() {
            match event {
                EngineEvent::Confirmed { .. } => confirmed += 1,
                EngineEvent::OptimisticRevert { .. } => reverted += 1,
                EngineEvent::QueuedOffline { .. } => queued += 1,
                _ => {}
            }
        }
        (confirmed, reverted, queued)
    }

    #[tokio::test]
    async fn test_confirmed_mutation() {
        let f = fixture();
        let mut events = f.bus.subscribe();

        let outcome = f
            .coordinator
            .submit(
                ChangeKind::Update,
                "orders",
                Some("42".to_string()),
                json!({"status": "served"}),
            )
            .await;

        assert_eq!(outcome, MutationOutcome::Confirmed);
        assert_eq!(f.backend.mutations().len(), 1);

        // Applied comes first, then exactly one terminal event
        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::OptimisticApplied { table, .. }) if table == "orders"
        ));
        assert_eq!(terminal_events(&mut events), (1, 0, 0));
    }

    #[tokio::test]
    async fn test_rejected_mutation_reverts() {
        let f = fixture();
        f.backend
            .set_mutation_rejection(Some("stale row".to_string()));
        let mut events = f.bus.subscribe();

        let outcome = f
            .coordinator
            .submit(
                ChangeKind::Update,
                "orders",
                Some("42".to_string()),
                json!({"status": "served"}),
            )
            .await;

        match outcome {
            MutationOutcome::Reverted { reason } => assert!(reason.contains("stale row")),
            other => panic!("expected revert, got {:?}", other),
        }
        assert_eq!(f.queue.len(), 0);
        // A rejection proves reachability, so we stay online
        assert!(f.connectivity.is_online());

        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::OptimisticApplied { .. })
        ));
        assert_eq!(terminal_events(&mut events), (0, 1, 0));
    }

    #[tokio::test]
    async fn test_offline_mutation_queues_without_server_contact() {
        let f = fixture();
        f.connectivity.set_hint(false);
        let mut events = f.bus.subscribe();

        let outcome = f
            .coordinator
            .submit(
                ChangeKind::Update,
                "orders",
                Some("42".to_string()),
                json!({"status": "served"}),
            )
            .await;

        assert!(matches!(outcome, MutationOutcome::Queued { .. }));
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.backend.mutation_attempts(), 0);

        assert!(matches!(
            events.try_recv(),
            Ok(EngineEvent::OptimisticApplied { .. })
        ));
        assert_eq!(terminal_events(&mut events), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_unreachable_server_queues() {
        let f = fixture();
        f.backend.set_online(false);
        let mut events = f.bus.subscribe();

        let outcome = f
            .coordinator
            .submit(ChangeKind::Insert, "orders", None, json!({"id": "7"}))
            .await;

        // The engine thought it was online, found out otherwise, and
        // queued instead of failing
        assert!(matches!(outcome, MutationOutcome::Queued { .. }));
        assert_eq!(f.backend.mutation_attempts(), 1);
        assert_eq!(f.queue.len(), 1);
        assert_eq!(terminal_events(&mut events), (0, 0, 1));
    }

    #[tokio::test]
    async fn test_slow_server_queues_after_timeout() {
        let f = fixture();
        f.backend.set_mutation_delay(Duration::from_millis(300));

        let outcome = f
            .coordinator
            .submit(ChangeKind::Insert, "orders", None, json!({"id": "7"}))
            .await;

        assert!(matches!(outcome, MutationOutcome::Queued { .. }));
        assert_eq!(f.queue.len(), 1);
    }
}
