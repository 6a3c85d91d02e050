use crate::backend::{Backend, BackendKind, RawChange};
use crate::config::{ConfigError, EngineConfig};
use crate::connectivity::ConnectivityObserver;
use crate::error::Error;
use crate::events::{normalize, ChangeKind, EngineEvent, EventBus, SyncEvent};
use crate::failover::FailoverController;
use crate::memory::MemoryBackend;
use crate::metrics::Metrics;
use crate::mutations::{MutationCoordinator, MutationOutcome};
use crate::pool::ConnectionPool;
use crate::queue::OfflineQueue;
use crate::registry::{HealthMonitor, ServerHealth, ServerRegistry};
use crate::subscriptions::{SubscriptionManager, SubscriptionStatus};
use crate::ws::WsBackend;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, trace, warn};

/// Point-in-time view of the engine for status screens and debugging
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Id of the server currently receiving traffic
    pub active_server_id: String,
    /// Whether the engine considers itself online
    pub online: bool,
    /// Health of every registered server
    pub servers: Vec<ServerHealth>,
    /// Mutations waiting for replay
    pub queued_operations: usize,
}

/// Realtime sync engine over a prioritized set of servers.
///
/// Owns one persistent backend per configured server, probes them on a
/// fixed interval, fails over to the best healthy backup when the active
/// server stops responding, and keeps subscriptions alive across the
/// switch. Mutations apply locally first and are queued for replay while
/// offline.
///
/// [`start`](Self::start) spawns the background tasks; [`stop`](Self::stop)
/// aborts them. Dropping the engine also aborts them.
pub struct SyncEngine {
    config: EngineConfig,
    registry: Arc<ServerRegistry>,
    pool: Arc<ConnectionPool>,
    bus: Arc<EventBus>,
    connectivity: Arc<ConnectivityObserver>,
    queue: Arc<OfflineQueue>,
    subscriptions: Arc<SubscriptionManager>,
    coordinator: MutationCoordinator,
    failover: Arc<FailoverController>,
    monitor: Arc<HealthMonitor>,
    metrics: Arc<Metrics>,
    /// Receiver half of the change ingest channel, held by the normalizer
    /// task while the engine runs
    ingest_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<RawChange>>>,
    /// Wakes the health monitor out of its interval wait
    probe_kick: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
    lifecycle_lock: tokio::sync::Mutex<()>,
}

impl SyncEngine {
    /// Create an engine over explicit backends, one per configured server,
    /// in the same order as `config.servers`.
    pub fn new(config: EngineConfig, backends: Vec<Arc<dyn Backend>>) -> Result<Self, ConfigError> {
        if backends.len() != config.servers.len() {
            return Err(ConfigError::BackendMismatch {
                expected: config.servers.len(),
                provided: backends.len(),
            });
        }

        let metrics = Arc::new(Metrics::new());
        let bus = Arc::new(EventBus::new(config.event_buffer));
        let registry = Arc::new(ServerRegistry::new(&config.servers));
        let pool = Arc::new(ConnectionPool::new(registry.clone(), backends));

        // With a single server there is no probe loop, so platform hints
        // are taken at face value instead of waiting for corroboration
        let probing = config.servers.len() > 1;
        let connectivity = Arc::new(ConnectivityObserver::new(
            bus.clone(),
            metrics.clone(),
            config.health.offline_after_rounds,
            probing,
        ));

        let queue = Arc::new(OfflineQueue::new(
            pool.clone(),
            connectivity.clone(),
            bus.clone(),
            metrics.clone(),
            config.replay.clone(),
            config.mutation_timeout,
        ));

        let (ingest_tx, ingest_rx) = mpsc::channel(config.event_buffer);
        let subscriptions = Arc::new(SubscriptionManager::new(
            pool.clone(),
            registry.clone(),
            ingest_tx,
            metrics.clone(),
        ));

        let coordinator = MutationCoordinator::new(
            pool.clone(),
            queue.clone(),
            connectivity.clone(),
            bus.clone(),
            metrics.clone(),
            config.mutation_timeout,
        );

        let failover = Arc::new(FailoverController::new(
            registry.clone(),
            subscriptions.clone(),
            bus.clone(),
            metrics.clone(),
        ));

        let monitor = Arc::new(HealthMonitor::new(
            registry.clone(),
            pool.clone(),
            metrics.clone(),
            config.health.clone(),
        ));

        Ok(Self {
            config,
            registry,
            pool,
            bus,
            connectivity,
            queue,
            subscriptions,
            coordinator,
            failover,
            monitor,
            metrics,
            ingest_rx: Arc::new(tokio::sync::Mutex::new(ingest_rx)),
            probe_kick: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            lifecycle_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Create an engine whose backends are built from the server
    /// descriptors: a WebSocket connection per gateway server, an
    /// in-process backend per memory server.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(config: EngineConfig) -> Result<Self, ConfigError> {
        let backends: Vec<Arc<dyn Backend>> = config
            .servers
            .iter()
            .map(|server| match server.kind {
                BackendKind::Gateway => {
                    Arc::new(WsBackend::new(server, &config.connection)) as Arc<dyn Backend>
                }
                BackendKind::Memory => Arc::new(MemoryBackend::new()) as Arc<dyn Backend>,
            })
            .collect();
        Self::new(config, backends)
    }

    /// Spawn the background tasks: change normalization, health probing
    /// (skipped for a single server), and offline replay on recovery.
    pub async fn start(&self) -> Result<(), Error> {
        let _lifecycle = self.lifecycle_lock.lock().await;

        if self.running.load(Ordering::Acquire) {
            return Err(Error::AlreadyRunning);
        }

        info!(
            "[ENGINE] starting with {} servers, active {}",
            self.registry.len(),
            self.registry.active_id()
        );

        let mut tasks = Vec::new();

        // Normalizer: raw changes in, SyncEvents out
        {
            let ingest = self.ingest_rx.clone();
            let bus = self.bus.clone();
            let metrics = self.metrics.clone();
            tasks.push(tokio::spawn(async move {
                let mut rx = ingest.lock().await;
                while let Some(change) = rx.recv().await {
                    let event = normalize(change);
                    metrics.record_event_normalized();
                    trace!("[ENGINE] {} {} event {}", event.table, event.kind, event.id);
                    bus.publish_sync(event);
                }
            }));
        }

        // Health monitor, only meaningful with an alternative to fail
        // over to
        if self.registry.len() > 1 {
            let monitor = self.monitor.clone();
            let bus = self.bus.clone();
            let connectivity = self.connectivity.clone();
            let failover = self.failover.clone();
            let probe_kick = self.probe_kick.clone();
            let interval = self.config.health.interval;
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = probe_kick.notified() => {}
                    }

                    let outcome = monitor.run_round().await;
                    bus.publish(EngineEvent::HealthCheckComplete {
                        servers: outcome.snapshot,
                    });

                    if outcome.any_success {
                        connectivity.record_success();
                    } else {
                        connectivity.record_failure();
                    }

                    if outcome.active_unhealthy {
                        failover.on_active_unhealthy().await;
                    }
                }
            }));
        }

        // Replay trigger: drain the offline queue whenever connectivity
        // comes back
        {
            let mut events = self.bus.subscribe();
            let queue = self.queue.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(EngineEvent::Online) => {
                            queue.replay().await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("[ENGINE] replay trigger lagged by {} events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }));
        }

        *self.tasks.lock() = tasks;
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    /// Abort the background tasks and wait for them to finish. Idempotent;
    /// the engine can be started again afterwards.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle_lock.lock().await;

        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }

        info!("[ENGINE] stopping");
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Whether the background tasks are running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Subscribe to a topic, optionally narrowed by a filter expression.
    /// Repeat calls for the same topic and filter return the existing
    /// subscription instead of creating another.
    pub async fn subscribe(
        &self,
        topic: &str,
        filter: Option<&str>,
    ) -> Result<SubscriptionStatus, Error> {
        self.subscriptions.subscribe(topic, filter).await
    }

    /// Tear down a subscription. Unknown subscriptions are ignored.
    pub async fn unsubscribe(&self, topic: &str, filter: Option<&str>) -> Result<(), Error> {
        self.subscriptions.unsubscribe(topic, filter).await
    }

    /// Update a record optimistically. The local change event fires
    /// before the server round-trip; the returned outcome says whether
    /// the change was confirmed, reverted, or queued for replay.
    pub async fn optimistic_update(
        &self,
        table: &str,
        record_id: &str,
        patch: Value,
    ) -> MutationOutcome {
        self.coordinator
            .submit(ChangeKind::Update, table, Some(record_id.to_string()), patch)
            .await
    }

    /// Insert a record optimistically
    pub async fn optimistic_insert(&self, table: &str, record: Value) -> MutationOutcome {
        self.coordinator
            .submit(ChangeKind::Insert, table, None, record)
            .await
    }

    /// Delete a record optimistically
    pub async fn optimistic_delete(&self, table: &str, record_id: &str) -> MutationOutcome {
        self.coordinator
            .submit(
                ChangeKind::Delete,
                table,
                Some(record_id.to_string()),
                Value::Null,
            )
            .await
    }

    /// Feed a platform connectivity hint (airplane mode, interface
    /// changes). An online hint also triggers an immediate probe round.
    pub fn set_network_hint(&self, online: bool) {
        self.connectivity.set_hint(online);
        if online && self.registry.len() > 1 {
            self.probe_kick.notify_one();
        }
    }

    /// Force a replay pass over the offline queue. Returns the number of
    /// operations delivered. Replay also runs automatically whenever the
    /// engine comes back online.
    pub async fn replay_offline_queue(&self) -> usize {
        self.queue.replay().await
    }

    /// Snapshot of active server, connectivity, and per-server health
    pub fn server_status(&self) -> ServerStatus {
        ServerStatus {
            active_server_id: self.registry.active_id(),
            online: self.connectivity.is_online(),
            servers: self.registry.health_snapshot(),
            queued_operations: self.queue.len(),
        }
    }

    /// Stream of all engine events
    pub fn events(&self) -> broadcast::Receiver<EngineEvent> {
        self.bus.subscribe()
    }

    /// Stream of change events for one table and change kind
    pub fn table_events(&self, table: &str, kind: ChangeKind) -> broadcast::Receiver<SyncEvent> {
        self.bus.subscribe_table(table, kind)
    }

    /// State of every registered subscription
    pub fn subscription_statuses(&self) -> Vec<SubscriptionStatus> {
        self.subscriptions.statuses()
    }

    /// Engine metrics
    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// The configuration the engine was built with
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of pooled backends
    pub fn server_count(&self) -> usize {
        self.pool.len()
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        for task in self.tasks.lock().iter() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackoffConfig, HealthConfig, ReplayConfig, ServerConfig};
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn fast_health() -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(40),
            probe_timeout: Duration::from_millis(20),
            offline_after_rounds: 2,
        }
    }

    fn fast_replay() -> ReplayConfig {
        ReplayConfig {
            max_attempts: 3,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                jitter: false,
            },
        }
    }

    fn memory_server(id: &str, priority: u32) -> ServerConfig {
        ServerConfig::new(id, format!("mem://{}", id), priority).with_kind(BackendKind::Memory)
    }

    fn engine_config(servers: Vec<ServerConfig>) -> EngineConfig {
        EngineConfig::builder()
            .servers(servers)
            .health(fast_health())
            .replay(fast_replay())
            .mutation_timeout(Duration::from_millis(200))
            .build()
            .expect("valid config")
    }

    async fn wait_for<F>(events: &mut broadcast::Receiver<EngineEvent>, mut predicate: F) -> EngineEvent
    where
        F: FnMut(&EngineEvent) -> bool,
    {
        timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.expect("event stream open");
                if predicate(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("expected event did not arrive")
    }

    #[test]
    fn test_engine_rejects_backend_count_mismatch() {
        let config = engine_config(vec![
            memory_server("primary", 1),
            memory_server("backup-a", 2),
        ]);
        let backends: Vec<Arc<dyn Backend>> = vec![Arc::new(MemoryBackend::new())];

        let err = SyncEngine::new(config, backends).err().expect("mismatch");
        assert!(matches!(
            err,
            ConfigError::BackendMismatch {
                expected: 2,
                provided: 1
            }
        ));
    }

    #[tokio::test]
    async fn test_start_stop_lifecycle() {
        let backend = Arc::new(MemoryBackend::new());
        let config = engine_config(vec![memory_server("primary", 1)]);
        let engine = SyncEngine::new(config, vec![backend]).expect("engine");

        assert!(!engine.is_running());
        engine.start().await.expect("first start");
        assert!(engine.is_running());

        let err = engine.start().await.expect_err("second start");
        assert!(matches!(err, Error::AlreadyRunning));

        engine.stop().await;
        assert!(!engine.is_running());
        engine.stop().await;

        engine.start().await.expect("restart");
        assert!(engine.is_running());
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_single_server_skips_probe_rounds() {
        let backend = Arc::new(MemoryBackend::new());
        let config = engine_config(vec![memory_server("primary", 1)]);
        let engine = SyncEngine::new(config, vec![backend.clone()]).expect("engine");

        engine.start().await.expect("start");
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(backend.probes(), 0);
        assert_eq!(engine.metrics().health_rounds(), 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_health_rounds_publish_snapshots() {
        let primary = Arc::new(MemoryBackend::new());
        let backup = Arc::new(MemoryBackend::new());
        let config = engine_config(vec![
            memory_server("primary", 1),
            memory_server("backup-a", 2),
        ]);
        let backends: Vec<Arc<dyn Backend>> = vec![primary.clone(), backup.clone()];
        let engine = SyncEngine::new(config, backends).expect("engine");

        let mut events = engine.events();
        engine.start().await.expect("start");

        let event = wait_for(&mut events, |event| {
            matches!(event, EngineEvent::HealthCheckComplete { .. })
        })
        .await;
        let EngineEvent::HealthCheckComplete { servers } = event else {
            panic!("expected health snapshot");
        };
        assert_eq!(servers.len(), 2);
        assert!(servers.iter().all(|server| server.healthy));

        assert!(primary.probes() >= 1);
        assert!(backup.probes() >= 1);
        assert!(engine.metrics().health_rounds() >= 1);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_failover_moves_subscriptions_to_backup() {
        let primary = Arc::new(MemoryBackend::new());
        let backup_a = Arc::new(MemoryBackend::new());
        let backup_b = Arc::new(MemoryBackend::new());
        let config = engine_config(vec![
            memory_server("primary", 1),
            memory_server("backup-a", 2),
            memory_server("backup-b", 3),
        ]);
        let backends: Vec<Arc<dyn Backend>> = vec![
            primary.clone(),
            backup_a.clone(),
            backup_b.clone(),
        ];
        let engine = SyncEngine::new(config, backends).expect("engine");

        let mut events = engine.events();
        engine.start().await.expect("start");
        engine.subscribe("orders", None).await.expect("subscribe");

        primary.set_online(false);

        let event = wait_for(&mut events, |event| {
            matches!(event, EngineEvent::FailoverComplete { .. })
        })
        .await;
        assert!(matches!(
            event,
            EngineEvent::FailoverComplete { from, to } if from == "primary" && to == "backup-a"
        ));
        assert_eq!(engine.server_status().active_server_id, "backup-a");

        // The subscription survived the switch and delivers from the
        // new server
        assert_eq!(backup_a.subscription_keys(), vec!["orders:".to_string()]);
        let mut orders = engine.table_events("orders", ChangeKind::Insert);
        assert!(
            backup_a
                .push_change("orders", ChangeKind::Insert, json!({"id": "7"}))
                .await
        );
        let sync = timeout(Duration::from_secs(2), orders.recv())
            .await
            .expect("change arrived")
            .expect("stream open");
        assert_eq!(sync.table, "orders");
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_all_servers_down_then_recovery() {
        let primary = Arc::new(MemoryBackend::new());
        let backup = Arc::new(MemoryBackend::new());
        let config = engine_config(vec![
            memory_server("primary", 1),
            memory_server("backup-a", 2),
        ]);
        let backends: Vec<Arc<dyn Backend>> = vec![primary.clone(), backup.clone()];
        let engine = SyncEngine::new(config, backends).expect("engine");

        let mut events = engine.events();
        primary.set_online(false);
        backup.set_online(false);
        engine.start().await.expect("start");

        let event = wait_for(&mut events, |event| {
            matches!(event, EngineEvent::NoBackupServers { .. })
        })
        .await;
        assert!(matches!(
            event,
            EngineEvent::NoBackupServers { active } if active == "primary"
        ));
        assert_eq!(engine.server_status().active_server_id, "primary");

        // Two all-failed rounds flip the engine offline
        wait_for(&mut events, |event| matches!(event, EngineEvent::Offline)).await;
        assert!(!engine.server_status().online);

        primary.set_online(true);
        backup.set_online(true);
        wait_for(&mut events, |event| matches!(event, EngineEvent::Online)).await;
        assert!(engine.server_status().online);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_offline_mutation_queues_then_replays_once() {
        let backend = Arc::new(MemoryBackend::new());
        let config = engine_config(vec![memory_server("primary", 1)]);
        let engine = SyncEngine::new(config, vec![backend.clone()]).expect("engine");

        let mut events = engine.events();
        engine.start().await.expect("start");

        backend.set_online(false);
        engine.set_network_hint(false);
        assert!(!engine.server_status().online);

        let outcome = engine
            .optimistic_update("orders", "42", json!({"status": "served"}))
            .await;
        assert!(matches!(outcome, MutationOutcome::Queued { .. }));
        assert_eq!(engine.server_status().queued_operations, 1);
        assert!(backend.mutations().is_empty());

        backend.set_online(true);
        engine.set_network_hint(true);

        wait_for(&mut events, |event| {
            matches!(event, EngineEvent::ReplaySuccess { .. })
        })
        .await;

        let mutations = backend.mutations();
        assert_eq!(mutations.len(), 1);
        assert_eq!(mutations[0].kind, ChangeKind::Update);
        assert_eq!(mutations[0].table, "orders");
        assert_eq!(mutations[0].record_id.as_deref(), Some("42"));
        assert_eq!(mutations[0].payload, json!({"status": "served"}));
        assert_eq!(engine.server_status().queued_operations, 0);
        engine.stop().await;
    }

    #[tokio::test]
    async fn test_change_events_reach_both_streams() {
        let backend = Arc::new(MemoryBackend::new());
        let config = engine_config(vec![memory_server("primary", 1)]);
        let engine = SyncEngine::new(config, vec![backend.clone()]).expect("engine");

        engine.start().await.expect("start");
        engine
            .subscribe("orders", Some("table=eq.42"))
            .await
            .expect("subscribe");

        let mut generic = engine.events();
        let mut targeted = engine.table_events("orders", ChangeKind::Update);

        assert!(
            backend
                .push_change(
                    "orders",
                    ChangeKind::Update,
                    json!({"id": "42", "status": "served", "updated_by": "staff-3"}),
                )
                .await
        );

        let sync = timeout(Duration::from_secs(2), targeted.recv())
            .await
            .expect("targeted event arrived")
            .expect("stream open");
        assert_eq!(sync.table, "orders");
        assert_eq!(sync.kind, ChangeKind::Update);
        assert_eq!(sync.user_id.as_deref(), Some("staff-3"));

        let event = wait_for(&mut generic, |event| {
            matches!(event, EngineEvent::Sync(_))
        })
        .await;
        let EngineEvent::Sync(sync) = event else {
            panic!("expected sync event");
        };
        assert_eq!(sync.record["status"], "served");
        assert_eq!(engine.metrics().events_normalized(), 1);
        engine.stop().await;
    }
}
