use crate::backend::Backend;
use crate::error::Error;
use crate::registry::ServerRegistry;
use crate::Result;
use std::sync::Arc;

/// One persistent backend client per configured server.
///
/// Clients are index-parallel to the registry's descriptors and live for the
/// lifetime of the engine. Failover only moves the registry's active pointer;
/// it never tears a client down, so switching back to a recovered server is
/// instant.
pub struct ConnectionPool {
    registry: Arc<ServerRegistry>,
    clients: Vec<Arc<dyn Backend>>,
}

impl ConnectionPool {
    /// Build the pool. `clients` must be index-parallel to the registry's
    /// descriptors.
    pub fn new(registry: Arc<ServerRegistry>, clients: Vec<Arc<dyn Backend>>) -> Self {
        debug_assert_eq!(registry.len(), clients.len());
        Self { registry, clients }
    }

    /// Number of pooled clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether the pool holds no clients
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// The client for the currently active server
    pub fn active_client(&self) -> Result<Arc<dyn Backend>> {
        self.clients
            .get(self.registry.active_index())
            .cloned()
            .ok_or(Error::NoActiveServer)
    }

    /// The client at a descriptor index
    pub fn client(&self, index: usize) -> Arc<dyn Backend> {
        self.clients[index].clone()
    }

    /// The client for a server id, if the id is configured
    pub fn client_for(&self, id: &str) -> Option<Arc<dyn Backend>> {
        self.registry
            .index_of(id)
            .map(|index| self.clients[index].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MutationRequest;
    use crate::config::ServerConfig;
    use crate::events::ChangeKind;
    use crate::memory::MemoryBackend;
    use serde_json::json;

    fn pool_with_two_backends() -> (Arc<ServerRegistry>, ConnectionPool, Arc<MemoryBackend>, Arc<MemoryBackend>) {
        let servers = vec![
            ServerConfig::new("primary", "mem://primary", 1),
            ServerConfig::new("backup-a", "mem://backup-a", 2),
        ];
        let registry = Arc::new(ServerRegistry::new(&servers));
        let primary = Arc::new(MemoryBackend::new());
        let backup = Arc::new(MemoryBackend::new());
        let clients: Vec<Arc<dyn Backend>> = vec![primary.clone(), backup.clone()];
        let pool = ConnectionPool::new(registry.clone(), clients);
        (registry, pool, primary, backup)
    }

    #[tokio::test]
    async fn test_active_client_follows_pointer() {
        let (registry, pool, primary, backup) = pool_with_two_backends();
        let request = MutationRequest {
            kind: ChangeKind::Insert,
            table: "orders".to_string(),
            record_id: None,
            payload: json!({"id": "1"}),
        };

        let client = pool.active_client().expect("active client");
        client.mutate(&request).await.expect("mutate");
        assert_eq!(primary.mutations().len(), 1);
        assert_eq!(backup.mutations().len(), 0);

        registry.set_active(1);
        let client = pool.active_client().expect("active client");
        client.mutate(&request).await.expect("mutate");
        assert_eq!(backup.mutations().len(), 1);
    }

    #[test]
    fn test_client_lookup_by_id() {
        let (_registry, pool, _primary, _backup) = pool_with_two_backends();

        assert!(pool.client_for("backup-a").is_some());
        assert!(pool.client_for("unknown").is_none());
        assert_eq!(pool.len(), 2);
    }
}
