use crate::backend::BackendKind;
use crate::config::{HealthConfig, ServerConfig};
use crate::error::Error;
use crate::metrics::Metrics;
use crate::pool::ConnectionPool;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Live bookkeeping for one configured server
#[derive(Debug, Clone)]
pub struct ServerDescriptor {
    /// Server identifier
    pub id: String,
    /// Failover priority (lower value = preferred)
    pub priority: u32,
    /// Which transport serves this descriptor
    pub kind: BackendKind,
    /// Outcome of the most recent probe. Servers start healthy and stay so
    /// until a probe says otherwise.
    pub healthy: bool,
    /// Round-trip time of the last successful probe
    pub latency: Option<Duration>,
    /// When this server was last probed
    pub last_health_check: Option<Instant>,
}

/// Point-in-time health of one server, as carried by status snapshots and
/// health-check-complete events
#[derive(Debug, Clone, Serialize)]
pub struct ServerHealth {
    /// Server identifier
    pub id: String,
    /// Failover priority (lower value = preferred)
    pub priority: u32,
    /// Which transport serves this descriptor
    pub kind: BackendKind,
    /// Outcome of the most recent probe
    pub healthy: bool,
    /// Round-trip time of the last successful probe
    pub latency: Option<Duration>,
    /// Time since this server was last probed
    pub since_last_check: Option<Duration>,
}

/// Ordered server descriptors plus the active-server pointer.
///
/// Descriptor order matches configuration order and never changes after
/// construction; the active pointer is an index into it. Exactly one server
/// is active at all times, even when every server is unhealthy.
pub struct ServerRegistry {
    descriptors: RwLock<Vec<ServerDescriptor>>,
    active: AtomicUsize,
}

impl ServerRegistry {
    /// Build the registry from configuration. The first descriptor starts
    /// active.
    pub fn new(servers: &[ServerConfig]) -> Self {
        let descriptors = servers
            .iter()
            .map(|server| ServerDescriptor {
                id: server.id.clone(),
                priority: server.priority,
                kind: server.kind,
                healthy: true,
                latency: None,
                last_health_check: None,
            })
            .collect();

        Self {
            descriptors: RwLock::new(descriptors),
            active: AtomicUsize::new(0),
        }
    }

    /// Number of configured servers
    pub fn len(&self) -> usize {
        self.descriptors.read().len()
    }

    /// Index of the currently active server
    pub fn active_index(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Id of the currently active server
    pub fn active_id(&self) -> String {
        let index = self.active_index();
        self.descriptors.read()[index].id.clone()
    }

    /// Point the active pointer at another descriptor
    pub(crate) fn set_active(&self, index: usize) {
        debug_assert!(index < self.len());
        self.active.store(index, Ordering::Release);
        debug!("[REGISTRY] active server is now index {}", index);
    }

    /// Look up a descriptor index by server id
    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.descriptors.read().iter().position(|d| d.id == id)
    }

    /// All server ids, in descriptor order
    pub fn ids(&self) -> Vec<String> {
        self.descriptors.read().iter().map(|d| d.id.clone()).collect()
    }

    /// Whether the active server passed its most recent probe
    pub fn is_active_healthy(&self) -> bool {
        let index = self.active_index();
        self.descriptors.read()[index].healthy
    }

    /// Record a successful probe of one server
    pub(crate) fn record_probe_success(&self, index: usize, latency: Duration) {
        let mut descriptors = self.descriptors.write();
        let descriptor = &mut descriptors[index];
        descriptor.healthy = true;
        descriptor.latency = Some(latency);
        descriptor.last_health_check = Some(Instant::now());
    }

    /// Record a failed or timed-out probe of one server
    pub(crate) fn record_probe_failure(&self, index: usize) {
        let mut descriptors = self.descriptors.write();
        let descriptor = &mut descriptors[index];
        descriptor.healthy = false;
        descriptor.latency = None;
        descriptor.last_health_check = Some(Instant::now());
    }

    /// Health of every server, in descriptor order
    pub fn health_snapshot(&self) -> Vec<ServerHealth> {
        self.descriptors
            .read()
            .iter()
            .map(|d| ServerHealth {
                id: d.id.clone(),
                priority: d.priority,
                kind: d.kind,
                healthy: d.healthy,
                latency: d.latency,
                since_last_check: d.last_health_check.map(|t| t.elapsed()),
            })
            .collect()
    }

    /// Find the server to fail over to, if any healthy backup exists.
    ///
    /// Returns the candidate's index and id.
    pub fn failover_candidate(&self) -> Option<(usize, String)> {
        let descriptors = self.descriptors.read();
        select_failover_candidate(&descriptors, self.active_index())
            .map(|index| (index, descriptors[index].id.clone()))
    }
}

/// Selects the failover target among healthy descriptors, excluding the
/// current active index.
///
/// Lowest priority value wins; ties break on lexical id order so the choice
/// is deterministic.
pub fn select_failover_candidate(
    descriptors: &[ServerDescriptor],
    excluded: usize,
) -> Option<usize> {
    descriptors
        .iter()
        .enumerate()
        .filter(|(index, d)| *index != excluded && d.healthy)
        .min_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)))
        .map(|(index, _)| index)
}

/// Runs probe rounds against every configured server.
///
/// One round probes all servers in parallel, each bounded by the configured
/// probe timeout, so a round never takes longer than one timeout regardless
/// of server count. Results are written back to the registry.
pub struct HealthMonitor {
    registry: Arc<ServerRegistry>,
    pool: Arc<ConnectionPool>,
    metrics: Arc<Metrics>,
    config: HealthConfig,
}

/// Result of one probe round
#[derive(Debug)]
pub struct RoundOutcome {
    /// Health of every server after the round
    pub snapshot: Vec<ServerHealth>,
    /// Whether at least one probe succeeded
    pub any_success: bool,
    /// Whether the active server failed its probe
    pub active_unhealthy: bool,
}

impl HealthMonitor {
    /// Create a monitor over the given registry and pool
    pub fn new(
        registry: Arc<ServerRegistry>,
        pool: Arc<ConnectionPool>,
        metrics: Arc<Metrics>,
        config: HealthConfig,
    ) -> Self {
        Self {
            registry,
            pool,
            metrics,
            config,
        }
    }

    /// Probe every server once and record the results
    pub async fn run_round(&self) -> RoundOutcome {
        let ids = self.registry.ids();
        let probe_timeout = self.config.probe_timeout;

        let probes = (0..ids.len()).map(|index| {
            let client = self.pool.client(index);
            let id = ids[index].clone();
            async move {
                let result = match tokio::time::timeout(probe_timeout, client.probe()).await {
                    Ok(Ok(latency)) => Ok(latency),
                    Ok(Err(err)) => Err(Error::Probe {
                        server_id: id,
                        message: err.to_string(),
                    }),
                    Err(_) => Err(Error::Probe {
                        server_id: id,
                        message: format!("no answer within {:?}", probe_timeout),
                    }),
                };
                (index, result)
            }
        });

        let mut any_success = false;
        for (index, result) in join_all(probes).await {
            self.metrics.record_probe();
            match result {
                Ok(latency) => {
                    any_success = true;
                    self.registry.record_probe_success(index, latency);
                }
                Err(err) => {
                    debug!("[HEALTH] {}", err);
                    self.metrics.record_probe_failure();
                    self.registry.record_probe_failure(index);
                }
            }
        }
        self.metrics.record_health_round();

        RoundOutcome {
            snapshot: self.registry.health_snapshot(),
            any_success,
            active_unhealthy: !self.registry.is_active_healthy(),
        }
    }
}
