mod common;

use std::time::Duration;

use common::{limits, Harness};
use warden_control_plane::db::DbConfig;
use warden_control_plane::provisioning::{NewServer, PlacementTarget};
use warden_control_plane::ErrorKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_creates_across_nodes_on_file_database() {
    let dir = tempfile::tempdir().unwrap();
    let h = Harness::with_config(DbConfig {
        database_url: format!("sqlite://{}", dir.path().join("fleet.db").display()),
        max_connections: 8,
        ..DbConfig::default()
    })
    .await;
    let owner_id = h.user("alex").await.id;
    let unit_id = h.unit("paper").await.id;

    let mut nodes = Vec::new();
    for i in 0..8 {
        let node = h.node(&format!("fra-{i}"), None).await;
        h.ports(node.id, "25565-25570").await;
        nodes.push(node.id);
    }

    let mut handles = Vec::new();
    for i in 0..24 {
        let plane = h.plane.clone();
        let node_id = nodes[i % nodes.len()];
        handles.push(tokio::spawn(async move {
            plane
                .create_server(NewServer::new(
                    format!("survival-{i}"),
                    owner_id,
                    unit_id,
                    PlacementTarget::Node(node_id),
                    limits(),
                ))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(h.plane.servers().list().await.unwrap().len(), 24);
    for node_id in nodes {
        assert_eq!(h.plane.allocations().list_free(node_id).await.unwrap().len(), 3);
    }
    // Every create shared one lazily created default project.
    assert_eq!(h.plane.projects().list_for_owner(owner_id).await.unwrap().len(), 1);
    h.assert_symmetric().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_create_finishes_after_caller_is_dropped() {
    let h = Harness::new().await;
    let owner_id = h.user("alex").await.id;
    let unit_id = h.unit("paper").await.id;
    let node_id = h.node("fra-1", None).await.id;
    h.ports(node_id, "25565").await;

    // Park the unit of work on the node lock so the caller can go away first.
    let guard = h.plane.allocations().locks().lock(node_id).await;
    let plane = h.plane.clone();
    let caller = tokio::spawn(async move {
        plane
            .create_server(NewServer::new(
                "survival",
                owner_id,
                unit_id,
                PlacementTarget::Node(node_id),
                limits(),
            ))
            .await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());
    assert!(h.plane.servers().list().await.unwrap().is_empty());

    drop(guard);
    let mut created = false;
    for _ in 0..100 {
        if h.plane.servers().list().await.unwrap().len() == 1 {
            created = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(created, "detached create never committed");
    assert!(h.plane.allocations().list_free(node_id).await.unwrap().is_empty());
    h.assert_symmetric().await;
}

#[tokio::test]
async fn test_store_timeout_surfaces_as_retryable() {
    let h = Harness::with_config(DbConfig {
        store_timeout: Duration::from_millis(250),
        ..DbConfig::in_memory()
    })
    .await;
    let owner_id = h.user("alex").await.id;
    let unit_id = h.unit("paper").await.id;
    let node = h.node("fra-1", None).await;
    h.ports(node.id, "25565").await;

    // Another task owns the only connection.
    let held = h.plane.db().acquire().await.unwrap();

    let err = h.plane.allocations().reserve(node.id, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert!(err.is_retryable());

    let err = h.create_on_node(owner_id, unit_id, node.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert!(err.is_retryable());

    drop(held);
    let created = h.create_on_node(owner_id, unit_id, node.id).await.unwrap();
    assert_eq!(created.allocation.port, 25565);
    h.assert_symmetric().await;
}
