//! Example: prioritized failover and offline replay.
//!
//! Runs the engine over three in-process servers, takes the primary down to
//! force a failover, then cuts all connectivity to show a mutation being
//! queued and replayed once the servers come back.
//!
//! Run with: cargo run --example failover

use livesync::{
    Backend, BackendKind, ChangeKind, EngineConfig, EngineEvent, HealthConfig, MemoryBackend,
    ServerConfig, SyncEngine,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    // Three in-process servers, lowest priority value preferred
    let primary = Arc::new(MemoryBackend::new());
    let backup_a = Arc::new(MemoryBackend::new());
    let backup_b = Arc::new(MemoryBackend::new());

    let config = EngineConfig::builder()
        .server(ServerConfig::new("primary", "mem://primary", 1).with_kind(BackendKind::Memory))
        .server(ServerConfig::new("backup-a", "mem://backup-a", 2).with_kind(BackendKind::Memory))
        .server(ServerConfig::new("backup-b", "mem://backup-b", 3).with_kind(BackendKind::Memory))
        .health(HealthConfig {
            interval: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(250),
            offline_after_rounds: 2,
        })
        .build()?;

    let backends: Vec<Arc<dyn Backend>> =
        vec![primary.clone(), backup_a.clone(), backup_b.clone()];
    let engine = Arc::new(SyncEngine::new(config, backends)?);

    // Log everything the engine reports
    let mut events = engine.events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::Sync(sync) => {
                    info!("change: {} {} {}", sync.table, sync.kind, sync.record)
                }
                EngineEvent::HealthCheckComplete { .. } => {}
                other => info!("event: {:?}", other),
            }
        }
    });

    engine.start().await?;
    engine.subscribe("orders", None).await?;
    info!(
        "engine started, active server: {}",
        engine.server_status().active_server_id
    );

    // A change arrives on the primary
    primary
        .push_change("orders", ChangeKind::Insert, json!({"id": "41"}))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Primary dies; the engine should move to backup-a and carry the
    // subscription over
    info!("--- taking primary offline ---");
    primary.set_online(false);
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!(
        "active server is now: {}",
        engine.server_status().active_server_id
    );

    backup_a
        .push_change("orders", ChangeKind::Insert, json!({"id": "42"}))
        .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Full outage: the optimistic update must queue instead of failing
    info!("--- taking every server offline ---");
    backup_a.set_online(false);
    backup_b.set_online(false);
    engine.set_network_hint(false);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = engine
        .optimistic_update("orders", "42", json!({"status": "served"}))
        .await;
    info!("mutation while offline: {:?}", outcome);
    info!(
        "queued operations: {}",
        engine.server_status().queued_operations
    );

    // Connectivity returns; the queue replays on its own
    info!("--- restoring connectivity ---");
    primary.set_online(true);
    backup_a.set_online(true);
    backup_b.set_online(true);
    engine.set_network_hint(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    info!(
        "queued operations after replay: {}",
        engine.server_status().queued_operations
    );

    let snapshot = engine.metrics().snapshot();
    info!("probes: {}", snapshot.probes_total);
    info!("failovers: {}", snapshot.failovers_total);
    info!("events normalized: {}", snapshot.events_normalized_total);
    info!("mutations queued: {}", snapshot.mutations_queued_total);
    info!("replay successes: {}", snapshot.replay_successes_total);

    engine.stop().await;
    info!("engine stopped");

    Ok(())
}
