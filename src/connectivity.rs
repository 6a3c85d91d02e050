use crate::events::{EngineEvent, EventBus};
use crate::metrics::Metrics;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// Tracks whether the engine considers itself online.
///
/// Two signals feed in: the platform's network hint (airplane mode, captive
/// portal detection, ...) and actual probe or request evidence. The hint
/// alone never flips the state while probe evidence is available; it only
/// lowers the amount of corroborating evidence required. This debounces
/// flapping hints and ignores hints that contradict a working connection.
///
/// With a single configured server there are no probe rounds, so the hint
/// is followed directly.
pub(crate) struct ConnectivityObserver {
    state: Mutex<ConnectivityState>,
    /// Consecutive failures required to go offline while the hint says online
    offline_after: u32,
    /// Whether probe rounds run (false for single-server deployments)
    probing: bool,
    bus: Arc<EventBus>,
    metrics: Arc<Metrics>,
}

#[derive(Debug)]
struct ConnectivityState {
    online: bool,
    hint_online: bool,
    failure_streak: u32,
}

impl ConnectivityObserver {
    pub(crate) fn new(
        bus: Arc<EventBus>,
        metrics: Arc<Metrics>,
        offline_after: u32,
        probing: bool,
    ) -> Self {
        Self {
            state: Mutex::new(ConnectivityState {
                online: true,
                hint_online: true,
                failure_streak: 0,
            }),
            offline_after,
            probing,
            bus,
            metrics,
        }
    }

    /// Whether the engine currently considers itself online
    pub(crate) fn is_online(&self) -> bool {
        self.state.lock().online
    }

    /// Record evidence that a server was reachable.
    ///
    /// Any successful round-trip counts, including a rejection: a server
    /// that answers with an error is still a server that answered.
    pub(crate) fn record_success(&self) {
        let mut state = self.state.lock();
        state.failure_streak = 0;
        if !state.online {
            state.online = true;
            drop(state);
            info!("[NET] connectivity regained");
            self.metrics.record_online_transition();
            self.bus.publish(EngineEvent::Online);
        }
    }

    /// Record evidence that no server was reachable
    pub(crate) fn record_failure(&self) {
        let mut state = self.state.lock();
        state.failure_streak = state.failure_streak.saturating_add(1);

        let threshold = if state.hint_online {
            self.offline_after
        } else {
            1
        };

        if state.online && state.failure_streak >= threshold {
            state.online = false;
            let streak = state.failure_streak;
            drop(state);
            warn!("[NET] connectivity lost after {} consecutive failures", streak);
            self.metrics.record_offline_transition();
            self.bus.publish(EngineEvent::Offline);
        }
    }

    /// Apply a platform network hint.
    ///
    /// An offline hint flips the state once any failure evidence exists;
    /// an online hint waits for probe evidence before flipping back. Without
    /// probing, the hint is authoritative in both directions.
    pub(crate) fn set_hint(&self, online: bool) {
        let mut state = self.state.lock();
        state.hint_online = online;

        if online {
            if !self.probing && !state.online {
                state.online = true;
                state.failure_streak = 0;
                drop(state);
                info!("[NET] online per platform hint");
                self.metrics.record_online_transition();
                self.bus.publish(EngineEvent::Online);
            }
        } else {
            let corroborated = !self.probing || state.failure_streak >= 1;
            if state.online && corroborated {
                state.online = false;
                drop(state);
                warn!("[NET] offline per platform hint");
                self.metrics.record_offline_transition();
                self.bus.publish(EngineEvent::Offline);
            }
        }
    }
}
