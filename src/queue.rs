use crate::backend::MutationRequest;
use crate::config::ReplayConfig;
use crate::connectivity::ConnectivityObserver;
use crate::events::{ChangeKind, EngineEvent, EventBus};
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A mutation deferred while offline
#[derive(Debug, Clone)]
pub(crate) struct OfflineOperation {
    /// Queue entry id
    pub id: Uuid,
    /// What the mutation does
    pub kind: ChangeKind,
    /// Target table
    pub table: String,
    /// Record identifier, when the mutation targets an existing record
    pub record_id: Option<String>,
    /// Field values of the mutation
    pub payload: Value,
    /// When the mutation was deferred
    pub created_at: SystemTime,
    /// Delivery attempts consumed so far
    pub attempts: u32,
}

impl OfflineOperation {
    fn to_request(&self) -> MutationRequest {
        MutationRequest {
            kind: self.kind,
            table: self.table.clone(),
            record_id: self.record_id.clone(),
            payload: self.payload.clone(),
        }
    }
}

/// FIFO queue of mutations deferred while offline.
///
/// Replay is single-flight and strictly ordered: one operation at a time,
/// oldest first, each delivery bounded by the mutation timeout. Every
/// operation carries a delivery budget. A rejection consumes one attempt
/// and is retried with exponential backoff until the budget is spent, after
/// which the operation is dropped and announced as a replay failure. The
/// budget is cumulative across replay passes. Connectivity failures and
/// timeouts never consume budget; they end the pass and leave the queue
/// intact for the next online transition.
pub(crate) struct OfflineQueue {
    entries: Mutex<VecDeque<OfflineOperation>>,
    replay_in_flight: AtomicBool,
    pool: Arc<ConnectionPool>,
    connectivity: Arc<ConnectivityObserver>,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
    replay: ReplayConfig,
    mutation_timeout: Duration,
}

/// Resets the single-flight flag when a replay pass ends, on every exit path
struct ReplayGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

impl OfflineQueue {
    pub(crate) fn new(
        pool: Arc<ConnectionPool>,
        connectivity: Arc<ConnectivityObserver>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        replay: ReplayConfig,
        mutation_timeout: Duration,
    ) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            replay_in_flight: AtomicBool::new(false),
            pool,
            connectivity,
            bus,
            metrics,
            replay,
            mutation_timeout,
        }
    }

    /// Number of queued operations
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Defer a mutation for later replay. Returns the queue entry id.
    pub(crate) fn enqueue(
        &self,
        kind: ChangeKind,
        table: String,
        record_id: Option<String>,
        payload: Value,
    ) -> Uuid {
        let operation = OfflineOperation {
            id: Uuid::new_v4(),
            kind,
            table: table.clone(),
            record_id,
            payload,
            created_at: SystemTime::now(),
            attempts: 0,
        };
        let id = operation.id;

        let queued = {
            let mut entries = self.entries.lock();
            entries.push_back(operation);
            entries.len()
        };

        info!("[QUEUE] deferred {} on {} ({} queued)", kind, table, queued);
        self.metrics.record_mutation_queued();
        self.bus.publish(EngineEvent::QueuedOffline {
            operation_id: id,
            table,
        });
        id
    }

    /// Replay queued operations against the active server, oldest first.
    ///
    /// Returns how many operations were delivered. Only one replay pass runs
    /// at a time; concurrent calls return immediately.
    pub(crate) async fn replay(&self) -> usize {
        if self
            .replay_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("[QUEUE] replay already in flight");
            return 0;
        }
        let _guard = ReplayGuard {
            flag: &self.replay_in_flight,
        };

        let mut delivered = 0;
        loop {
            if !self.connectivity.is_online() {
                debug!("[QUEUE] offline, ending replay pass");
                break;
            }

            // The front is stable during a pass: enqueue only appends and
            // this is the only consumer.
            let Some(operation) = self.entries.lock().front().cloned() else {
                break;
            };
            let client = match self.pool.active_client() {
                Ok(client) => client,
                Err(err) => {
                    warn!("[QUEUE] replay interrupted: {}", err);
                    self.connectivity.record_failure();
                    break;
                }
            };

            let request = operation.to_request();
            match timeout(self.mutation_timeout, client.mutate(&request)).await {
                Ok(Ok(())) => {
                    self.entries.lock().pop_front();
                    delivered += 1;
                    self.connectivity.record_success();
                    self.metrics.record_replay_success();
                    info!("[QUEUE] replayed {} on {}", operation.kind, operation.table);
                    self.bus.publish(EngineEvent::ReplaySuccess {
                        operation_id: operation.id,
                        table: operation.table.clone(),
                    });
                }
                Ok(Err(err)) if err.is_connectivity() => {
                    warn!(
                        "[QUEUE] replay interrupted: {} ({} entries kept)",
                        err,
                        self.len()
                    );
                    self.connectivity.record_failure();
                    break;
                }
                Ok(Err(err)) => {
                    // The server answered, so the network is fine; the
                    // operation itself is the problem.
                    self.connectivity.record_success();
                    let attempts = operation.attempts + 1;
                    let exhausted = attempts >= self.replay.max_attempts;
                    {
                        let mut entries = self.entries.lock();
                        if exhausted {
                            entries.pop_front();
                        } else if let Some(front) = entries.front_mut() {
                            front.attempts = attempts;
                        }
                    }

                    if exhausted {
                        warn!(
                            "[QUEUE] dropping {} on {} after {} attempts: {}",
                            operation.kind, operation.table, attempts, err
                        );
                        self.metrics.record_replay_failure();
                        self.bus.publish(EngineEvent::ReplayFailure {
                            operation_id: operation.id,
                            table: operation.table.clone(),
                            reason: err.to_string(),
                        });
                    } else {
                        let delay = self
                            .replay
                            .backoff
                            .delay_for_attempt(attempts.saturating_sub(1));
                        debug!(
                            "[QUEUE] retrying {} on {} in {:?} (attempt {}/{})",
                            operation.kind,
                            operation.table,
                            delay,
                            attempts,
                            self.replay.max_attempts
                        );
                        sleep(delay).await;
                    }
                }
                Err(_) => {
                    warn!(
                        "[QUEUE] replay timed out after {:?} ({} entries kept)",
                        self.mutation_timeout,
                        self.len()
                    );
                    self.connectivity.record_failure();
                    break;
                }
            }
        }

        delivered
    }
}
