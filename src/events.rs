use crate::backend::RawChange;
use crate::registry::ServerHealth;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::SystemTime;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Record fields checked for best-effort attribution, in precedence order
const USER_ID_FIELDS: [&str; 3] = ["user_id", "updated_by", "created_by"];

/// What happened to a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A record was created
    Insert,
    /// A record was modified
    Update,
    /// A record was removed
    Delete,
}

impl ChangeKind {
    /// Lowercase wire name for this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification in the uniform shape consumers see.
///
/// Every change, regardless of which server or transport delivered it,
/// is normalized into this shape before publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    /// Engine-assigned event id
    pub id: Uuid,
    /// What happened to the record
    pub kind: ChangeKind,
    /// Table the record belongs to
    pub table: String,
    /// The record payload as the server sent it
    pub record: Value,
    /// When the engine normalized the change
    pub timestamp: SystemTime,
    /// Who made the change, when the record carries attribution
    pub user_id: Option<String>,
}

/// Everything the engine announces to consumers
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A normalized change arrived from the active server
    Sync(SyncEvent),
    /// A local mutation was applied optimistically, before any server contact
    OptimisticApplied {
        /// Target table
        table: String,
        /// What the mutation does
        kind: ChangeKind,
        /// Record identifier, when the mutation targets an existing record
        record_id: Option<String>,
        /// Field values of the mutation
        payload: Value,
    },
    /// An optimistic mutation was rejected and consumers should undo it
    OptimisticRevert {
        /// Target table
        table: String,
        /// What the mutation did
        kind: ChangeKind,
        /// Record identifier, when the mutation targeted an existing record
        record_id: Option<String>,
        /// Why the server rejected it
        reason: String,
    },
    /// The active server confirmed a mutation
    Confirmed {
        /// Target table
        table: String,
        /// What the mutation did
        kind: ChangeKind,
        /// Record identifier, when the mutation targeted an existing record
        record_id: Option<String>,
    },
    /// A probe round finished; carries the health of every server
    HealthCheckComplete {
        /// Snapshot of all descriptors after the round
        servers: Vec<ServerHealth>,
    },
    /// The active server changed
    FailoverComplete {
        /// Previously active server
        from: String,
        /// Newly active server
        to: String,
    },
    /// The active server is unhealthy and no healthy backup exists
    NoBackupServers {
        /// The server that stays active despite being unhealthy
        active: String,
    },
    /// Connectivity was regained
    Online,
    /// Connectivity was lost
    Offline,
    /// A mutation was deferred to the offline queue
    QueuedOffline {
        /// Queue entry id
        operation_id: Uuid,
        /// Target table
        table: String,
    },
    /// A queued operation was delivered during replay
    ReplaySuccess {
        /// Queue entry id
        operation_id: Uuid,
        /// Target table
        table: String,
    },
    /// A queued operation exhausted its delivery attempts and was dropped
    ReplayFailure {
        /// Queue entry id
        operation_id: Uuid,
        /// Target table
        table: String,
        /// Why delivery failed
        reason: String,
    },
}

/// Fan-out hub for engine events.
///
/// One broadcast channel carries every [`EngineEvent`]; additional channels
/// are created lazily per `(table, kind)` pair for consumers that only care
/// about one kind of change on one table. Ordering is guaranteed per channel,
/// never across channels.
pub(crate) struct EventBus {
    generic: broadcast::Sender<EngineEvent>,
    targeted: RwLock<HashMap<(String, ChangeKind), broadcast::Sender<SyncEvent>>>,
    capacity: usize,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (generic, _) = broadcast::channel(capacity);
        Self {
            generic,
            targeted: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    /// Subscribe to the full engine event stream
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.generic.subscribe()
    }

    /// Subscribe to one kind of change on one table
    pub(crate) fn subscribe_table(
        &self,
        table: &str,
        kind: ChangeKind,
    ) -> broadcast::Receiver<SyncEvent> {
        let mut targeted = self.targeted.write();
        targeted
            .entry((table.to_string(), kind))
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publish to the generic stream. Lagging or absent receivers are not
    /// an error.
    pub(crate) fn publish(&self, event: EngineEvent) {
        let _ = self.generic.send(event);
    }

    /// Publish a normalized change to the generic stream and to the
    /// matching targeted stream, if one exists
    pub(crate) fn publish_sync(&self, event: SyncEvent) {
        if let Some(sender) = self.targeted.read().get(&(event.table.clone(), event.kind)) {
            let _ = sender.send(event.clone());
        }
        let _ = self.generic.send(EngineEvent::Sync(event));
    }
}

/// Convert a raw backend change into the uniform event shape
pub(crate) fn normalize(change: RawChange) -> SyncEvent {
    let user_id = extract_user_id(&change.record);
    SyncEvent {
        id: Uuid::new_v4(),
        kind: change.kind,
        table: change.topic,
        record: change.record,
        timestamp: SystemTime::now(),
        user_id,
    }
}

/// Best-effort attribution: the first recognized field holding a string wins
fn extract_user_id(record: &Value) -> Option<String> {
    let fields = record.as_object()?;
    USER_ID_FIELDS
        .iter()
        .find_map(|name| fields.get(*name).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(topic: &str, kind: ChangeKind, record: Value) -> RawChange {
        RawChange {
            topic: topic.to_string(),
            kind,
            record,
        }
    }

    #[test]
    fn test_normalize_extracts_user_id() {
        let event = normalize(change(
            "orders",
            ChangeKind::Update,
            json!({"id": "42", "status": "served", "user_id": "waiter-7"}),
        ));

        assert_eq!(event.table, "orders");
        assert_eq!(event.kind, ChangeKind::Update);
        assert_eq!(event.user_id.as_deref(), Some("waiter-7"));
        assert_eq!(event.record["status"], "served");
    }

    #[test]
    fn test_normalize_attribution_precedence() {
        // updated_by outranks created_by
        let event = normalize(change(
            "orders",
            ChangeKind::Update,
            json!({"updated_by": "waiter-7", "created_by": "waiter-3"}),
        ));
        assert_eq!(event.user_id.as_deref(), Some("waiter-7"));

        // Non-string user_id is skipped, fallback fields still apply
        let event = normalize(change(
            "orders",
            ChangeKind::Update,
            json!({"user_id": 7, "updated_by": "waiter-7"}),
        ));
        assert_eq!(event.user_id.as_deref(), Some("waiter-7"));
    }

    #[test]
    fn test_normalize_without_attribution() {
        let event = normalize(change(
            "orders",
            ChangeKind::Insert,
            json!({"id": "42"}),
        ));
        assert_eq!(event.user_id, None);

        // Non-object records normalize without attribution
        let event = normalize(change("orders", ChangeKind::Delete, json!("42")));
        assert_eq!(event.user_id, None);
    }

    #[tokio::test]
    async fn test_targeted_delivery() {
        let bus = EventBus::new(16);
        let mut generic = bus.subscribe();
        let mut updates = bus.subscribe_table("orders", ChangeKind::Update);

        bus.publish_sync(normalize(change(
            "orders",
            ChangeKind::Update,
            json!({"id": "42"}),
        )));
        bus.publish_sync(normalize(change(
            "orders",
            ChangeKind::Insert,
            json!({"id": "43"}),
        )));

        // The targeted stream only sees the matching kind
        let event = updates.recv().await.expect("targeted event");
        assert_eq!(event.record["id"], "42");
        assert!(matches!(
            updates.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));

        // The generic stream sees both
        assert!(matches!(
            generic.recv().await,
            Ok(EngineEvent::Sync(event)) if event.kind == ChangeKind::Update
        ));
        assert!(matches!(
            generic.recv().await,
            Ok(EngineEvent::Sync(event)) if event.kind == ChangeKind::Insert
        ));
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(16);
        // No receiver anywhere; must not panic or error
        bus.publish(EngineEvent::Online);
        bus.publish_sync(normalize(change(
            "orders",
            ChangeKind::Update,
            json!({"id": "42"}),
        )));
    }
}
