use crate::events::{EngineEvent, EventBus};
use crate::metrics::Metrics;
use crate::registry::ServerRegistry;
use crate::subscriptions::SubscriptionManager;
use std::sync::Arc;
use tracing::{info, warn};

/// Moves the active pointer when the active server goes unhealthy.
///
/// The target is the healthy backup with the lowest priority value, ties
/// broken by lexical id. When no healthy backup exists the unhealthy server
/// keeps its role, so there is always exactly one active server.
pub(crate) struct FailoverController {
    registry: Arc<ServerRegistry>,
    subscriptions: Arc<SubscriptionManager>,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
}

impl FailoverController {
    pub(crate) fn new(
        registry: Arc<ServerRegistry>,
        subscriptions: Arc<SubscriptionManager>,
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            registry,
            subscriptions,
            bus,
            metrics,
        }
    }

    /// React to an unhealthy active server.
    ///
    /// The completion event is published only after subscriptions are live
    /// on the new server, so observers can trust that the switch finished.
    pub(crate) async fn on_active_unhealthy(&self) {
        let from = self.registry.active_id();

        match self.registry.failover_candidate() {
            Some((index, to)) => {
                self.registry.set_active(index);
                self.metrics.record_failover();
                info!("[FAILOVER] {} -> {}", from, to);

                let migrated = self.subscriptions.migrate_all(&to).await;
                info!("[FAILOVER] {} subscriptions live on {}", migrated, to);
                self.bus
                    .publish(EngineEvent::FailoverComplete { from, to });
            }
            None => {
                self.metrics.record_failover_without_backup();
                warn!(
                    "[FAILOVER] {} unhealthy and no healthy backup available",
                    from
                );
                self.bus.publish(EngineEvent::NoBackupServers { active: from });
            }
        }
    }
}
