mod common;

use std::time::Duration;

use chrono::Utc;
use common::Harness;
use tokio::sync::{mpsc, watch};
use warden_control_plane::workers::{MaintenanceConfig, MaintenanceWorker, SignalOutcome, SignalWorker};
use warden_control_plane::CoreError;
use warden_events::{LifecycleEvent, ServerState, Signal, SignalEnvelope};
use warden_id::NodeId;

#[tokio::test]
async fn test_out_of_order_health_is_ignored() {
    let h = Harness::new().await;
    let node = h.node("fra-1", None).await;
    let worker = SignalWorker::new(h.plane.clone());

    let now = Utc::now();
    let outcome = worker
        .handle(Signal::NodeHealth {
            node_id: node.id,
            online: false,
            checked_at: now + chrono::Duration::seconds(10),
        })
        .await
        .unwrap();
    assert_eq!(outcome, SignalOutcome::Applied);

    // Older than what is stored: must not flip the node back online.
    let outcome = worker
        .handle(Signal::NodeHealth {
            node_id: node.id,
            online: true,
            checked_at: now,
        })
        .await
        .unwrap();
    assert_eq!(outcome, SignalOutcome::Ignored);
    assert!(!h.plane.nodes().get(node.id).await.unwrap().is_online);

    let err = worker
        .handle(Signal::NodeHealth {
            node_id: NodeId::new(),
            online: true,
            checked_at: now,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { entity: "node", .. }));
}

#[tokio::test]
async fn test_deployment_signals_drive_lifecycle() {
    let h = Harness::new().await;
    let owner = h.user("alex").await;
    let unit = h.unit("paper").await;
    let node = h.node("fra-1", None).await;
    h.ports(node.id, "25565").await;
    let server_id = h.create_on_node(owner.id, unit.id, node.id).await.unwrap().server.id;

    let worker = SignalWorker::new(h.plane.clone());
    for event in [LifecycleEvent::InstallStarted, LifecycleEvent::InstallSucceeded] {
        let outcome = worker
            .handle(Signal::Deployment { server_id, event })
            .await
            .unwrap();
        assert_eq!(outcome, SignalOutcome::Applied);
    }

    // Redelivery is absorbed rather than surfaced.
    let outcome = worker
        .handle(Signal::Deployment {
            server_id,
            event: LifecycleEvent::InstallSucceeded,
        })
        .await
        .unwrap();
    assert_eq!(outcome, SignalOutcome::Ignored);

    let server = h.plane.servers().get(server_id).await.unwrap();
    assert_eq!(server.state, ServerState::Running);
}

#[tokio::test]
async fn test_worker_consumes_channel_until_shutdown() {
    let h = Harness::new().await;
    let node = h.node("fra-1", None).await;
    let (tx, rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let worker = SignalWorker::new(h.plane.clone());
    let handle = tokio::spawn(async move { worker.run(rx, shutdown_rx).await });

    let raw = SignalEnvelope::new(Signal::NodeHealth {
        node_id: node.id,
        online: false,
        checked_at: Utc::now() + chrono::Duration::seconds(5),
    })
    .encode()
    .unwrap();
    tx.send(SignalEnvelope::decode(&raw).unwrap()).await.unwrap();

    let mut offline = false;
    for _ in 0..50 {
        if !h.plane.nodes().get(node.id).await.unwrap().is_online {
            offline = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(offline);

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_maintenance_marks_silent_nodes_offline() {
    let h = Harness::new().await;
    let quiet = h.node("fra-1", None).await;
    let chatty = h.node("fra-2", None).await;

    sqlx::query("UPDATE nodes SET last_checked = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::minutes(10))
        .bind(quiet.id)
        .execute(h.plane.db().pool())
        .await
        .unwrap();

    let worker = MaintenanceWorker::new(h.plane.clone(), MaintenanceConfig::default());
    assert_eq!(worker.mark_stale_nodes().await.unwrap(), 1);

    assert!(!h.plane.nodes().get(quiet.id).await.unwrap().is_online);
    assert!(h.plane.nodes().get(chatty.id).await.unwrap().is_online);
}

#[tokio::test]
async fn test_maintenance_releases_only_old_reservations() {
    let h = Harness::new().await;
    let node = h.node("fra-1", None).await;
    h.ports(node.id, "25565-25566").await;

    let old = h.plane.allocations().reserve(node.id, None).await.unwrap();
    let fresh = h.plane.allocations().reserve(node.id, None).await.unwrap();
    sqlx::query("UPDATE allocations SET reserved_at = ? WHERE id = ?")
        .bind(Utc::now() - chrono::Duration::hours(1))
        .bind(old.id)
        .execute(h.plane.db().pool())
        .await
        .unwrap();

    let worker = MaintenanceWorker::new(h.plane.clone(), MaintenanceConfig::default());
    assert_eq!(worker.release_stale_reservations().await.unwrap(), 1);

    assert!(h.plane.allocations().get(old.id).await.unwrap().is_free());
    assert!(!h.plane.allocations().get(fresh.id).await.unwrap().is_free());
}
