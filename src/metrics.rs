use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Metrics for observability
///
/// This struct provides counters for monitoring engine health. Use
/// `snapshot()` to get a point-in-time view of all metrics, or use
/// individual getter methods for specific values.
///
/// # Example
/// ```ignore
/// let metrics = engine.metrics();
///
/// // Get individual values
/// println!("Probes: {}", metrics.probes());
/// println!("Failovers: {}", metrics.failovers());
///
/// // Get full snapshot for export
/// let snapshot = metrics.snapshot();
/// ```
#[derive(Debug, Default)]
pub struct Metrics {
    // Counter fields - private, exposed via getters
    probes_total: AtomicU64,
    probe_failures_total: AtomicU64,
    health_rounds_total: AtomicU64,
    failovers_total: AtomicU64,
    failovers_without_backup_total: AtomicU64,
    events_normalized_total: AtomicU64,
    mutations_confirmed_total: AtomicU64,
    mutations_reverted_total: AtomicU64,
    mutations_queued_total: AtomicU64,
    replay_successes_total: AtomicU64,
    replay_failures_total: AtomicU64,
    subscriptions_created_total: AtomicU64,
    subscriptions_migrated_total: AtomicU64,
    online_transitions_total: AtomicU64,
    offline_transitions_total: AtomicU64,
}

impl Metrics {
    /// Create a new Metrics instance
    pub fn new() -> Self {
        Self::default()
    }

    // ========== Getters ==========

    /// Get total probes attempted
    pub fn probes(&self) -> u64 {
        self.probes_total.load(Ordering::Relaxed)
    }

    /// Get total probes that failed or timed out
    pub fn probe_failures(&self) -> u64 {
        self.probe_failures_total.load(Ordering::Relaxed)
    }

    /// Get total completed health check rounds
    pub fn health_rounds(&self) -> u64 {
        self.health_rounds_total.load(Ordering::Relaxed)
    }

    /// Get total completed failovers
    pub fn failovers(&self) -> u64 {
        self.failovers_total.load(Ordering::Relaxed)
    }

    /// Get total failover attempts that found no healthy backup
    pub fn failovers_without_backup(&self) -> u64 {
        self.failovers_without_backup_total.load(Ordering::Relaxed)
    }

    /// Get total changes normalized into sync events
    pub fn events_normalized(&self) -> u64 {
        self.events_normalized_total.load(Ordering::Relaxed)
    }

    /// Get total mutations confirmed by a server
    pub fn mutations_confirmed(&self) -> u64 {
        self.mutations_confirmed_total.load(Ordering::Relaxed)
    }

    /// Get total mutations rejected and reverted
    pub fn mutations_reverted(&self) -> u64 {
        self.mutations_reverted_total.load(Ordering::Relaxed)
    }

    /// Get total mutations deferred to the offline queue
    pub fn mutations_queued(&self) -> u64 {
        self.mutations_queued_total.load(Ordering::Relaxed)
    }

    /// Get total queued operations delivered during replay
    pub fn replay_successes(&self) -> u64 {
        self.replay_successes_total.load(Ordering::Relaxed)
    }

    /// Get total queued operations dropped after exhausting attempts
    pub fn replay_failures(&self) -> u64 {
        self.replay_failures_total.load(Ordering::Relaxed)
    }

    /// Get total subscriptions acknowledged by a server
    pub fn subscriptions_created(&self) -> u64 {
        self.subscriptions_created_total.load(Ordering::Relaxed)
    }

    /// Get total subscriptions re-established during failover
    pub fn subscriptions_migrated(&self) -> u64 {
        self.subscriptions_migrated_total.load(Ordering::Relaxed)
    }

    /// Get total offline-to-online transitions
    pub fn online_transitions(&self) -> u64 {
        self.online_transitions_total.load(Ordering::Relaxed)
    }

    /// Get total online-to-offline transitions
    pub fn offline_transitions(&self) -> u64 {
        self.offline_transitions_total.load(Ordering::Relaxed)
    }

    // ========== Recording methods (called internally) ==========

    /// Increment probe counter
    pub(crate) fn record_probe(&self) {
        self.probes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment probe failure counter
    pub(crate) fn record_probe_failure(&self) {
        self.probe_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment health round counter
    pub(crate) fn record_health_round(&self) {
        self.health_rounds_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment failover counter
    pub(crate) fn record_failover(&self) {
        self.failovers_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment no-backup failover counter
    pub(crate) fn record_failover_without_backup(&self) {
        self.failovers_without_backup_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Increment normalized event counter
    pub(crate) fn record_event_normalized(&self) {
        self.events_normalized_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment confirmed mutation counter
    pub(crate) fn record_mutation_confirmed(&self) {
        self.mutations_confirmed_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment reverted mutation counter
    pub(crate) fn record_mutation_reverted(&self) {
        self.mutations_reverted_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment queued mutation counter
    pub(crate) fn record_mutation_queued(&self) {
        self.mutations_queued_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment replay success counter
    pub(crate) fn record_replay_success(&self) {
        self.replay_successes_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment replay failure counter
    pub(crate) fn record_replay_failure(&self) {
        self.replay_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment subscription counter
    pub(crate) fn record_subscription_created(&self) {
        self.subscriptions_created_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Increment migrated subscription counter
    pub(crate) fn record_subscription_migrated(&self) {
        self.subscriptions_migrated_total
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Increment online transition counter
    pub(crate) fn record_online_transition(&self) {
        self.online_transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment offline transition counter
    pub(crate) fn record_offline_transition(&self) {
        self.offline_transitions_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Get a point-in-time snapshot of all metrics for export
    ///
    /// This is the recommended way to get metrics for monitoring systems.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            probes_total: self.probes_total.load(Ordering::Acquire),
            probe_failures_total: self.probe_failures_total.load(Ordering::Acquire),
            health_rounds_total: self.health_rounds_total.load(Ordering::Acquire),
            failovers_total: self.failovers_total.load(Ordering::Acquire),
            failovers_without_backup_total: self
                .failovers_without_backup_total
                .load(Ordering::Acquire),
            events_normalized_total: self.events_normalized_total.load(Ordering::Acquire),
            mutations_confirmed_total: self.mutations_confirmed_total.load(Ordering::Acquire),
            mutations_reverted_total: self.mutations_reverted_total.load(Ordering::Acquire),
            mutations_queued_total: self.mutations_queued_total.load(Ordering::Acquire),
            replay_successes_total: self.replay_successes_total.load(Ordering::Acquire),
            replay_failures_total: self.replay_failures_total.load(Ordering::Acquire),
            subscriptions_created_total: self.subscriptions_created_total.load(Ordering::Acquire),
            subscriptions_migrated_total: self.subscriptions_migrated_total.load(Ordering::Acquire),
            online_transitions_total: self.online_transitions_total.load(Ordering::Acquire),
            offline_transitions_total: self.offline_transitions_total.load(Ordering::Acquire),
        }
    }
}

/// A point-in-time snapshot of all metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    /// Total probes attempted.
    pub probes_total: u64,
    /// Total probes that failed or timed out.
    pub probe_failures_total: u64,
    /// Total completed health check rounds.
    pub health_rounds_total: u64,
    /// Total completed failovers.
    pub failovers_total: u64,
    /// Total failover attempts that found no healthy backup.
    pub failovers_without_backup_total: u64,
    /// Total changes normalized into sync events.
    pub events_normalized_total: u64,
    /// Total mutations confirmed by a server.
    pub mutations_confirmed_total: u64,
    /// Total mutations rejected and reverted.
    pub mutations_reverted_total: u64,
    /// Total mutations deferred to the offline queue.
    pub mutations_queued_total: u64,
    /// Total queued operations delivered during replay.
    pub replay_successes_total: u64,
    /// Total queued operations dropped after exhausting attempts.
    pub replay_failures_total: u64,
    /// Total subscriptions acknowledged by a server.
    pub subscriptions_created_total: u64,
    /// Total subscriptions re-established during failover.
    pub subscriptions_migrated_total: u64,
    /// Total offline-to-online transitions.
    pub online_transitions_total: u64,
    /// Total online-to-offline transitions.
    pub offline_transitions_total: u64,
}
