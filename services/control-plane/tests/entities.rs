mod common;

use chrono::Utc;
use common::Harness;
use warden_control_plane::repos::{NewApiKey, NewCargoItem, NewProject, NodeUpdate, UserUpdate};
use warden_control_plane::{Conflict, CoreError};

#[tokio::test]
async fn test_api_key_authenticates_until_revoked() {
    let h = Harness::new().await;
    let user = h.user("alex").await;

    let issued = h
        .plane
        .api_keys()
        .issue(
            user.id,
            NewApiKey {
                memo: Some("deploy bot".to_string()),
                allowed_ips: vec!["10.0.0.0".to_string()],
                expires_at: None,
            },
        )
        .await
        .unwrap();
    assert!(issued.token.starts_with(&issued.key.identifier));
    assert_ne!(issued.key.token_hash, issued.token);

    let key = h
        .plane
        .api_keys()
        .authenticate(&issued.token)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(key.id, issued.key.id);
    assert!(key.last_used_at.is_some());

    // Right identifier, wrong secret.
    let forged = format!("{}.not-the-secret", issued.key.identifier);
    assert!(h.plane.api_keys().authenticate(&forged).await.unwrap().is_none());
    assert!(h.plane.api_keys().authenticate("garbage").await.unwrap().is_none());

    h.plane.api_keys().revoke(issued.key.id).await.unwrap();
    assert!(h.plane.api_keys().authenticate(&issued.token).await.unwrap().is_none());
}

#[tokio::test]
async fn test_expired_api_key_is_rejected() {
    let h = Harness::new().await;
    let user = h.user("alex").await;

    let issued = h
        .plane
        .api_keys()
        .issue(
            user.id,
            NewApiKey {
                expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(h.plane.api_keys().authenticate(&issued.token).await.unwrap().is_none());

    let err = h
        .plane
        .api_keys()
        .issue(
            user.id,
            NewApiKey {
                allowed_ips: vec!["not-an-ip".to_string()],
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Invalid { field: "allowed_ips", .. }));
}

#[tokio::test]
async fn test_cargo_names_are_unique_per_owner() {
    let h = Harness::new().await;
    let alex = h.user("alex").await;
    let sam = h.user("sam").await;
    let item = |owner_id| NewCargoItem {
        owner_id,
        name: "world.zip".to_string(),
        size_bytes: 4096,
        sha256: "A".repeat(64),
        mime_type: Some("application/zip".to_string()),
    };

    let created = h.plane.cargo().create(item(alex.id)).await.unwrap();
    assert_eq!(created.sha256, "a".repeat(64));

    let err = h.plane.cargo().create(item(alex.id)).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(Conflict::AlreadyExists { entity: "cargo item", .. })
    ));
    h.plane.cargo().create(item(sam.id)).await.unwrap();

    let err = h
        .plane
        .cargo()
        .create(NewCargoItem {
            name: "../etc/passwd".to_string(),
            ..item(alex.id)
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Invalid { field: "name", .. }));

    h.plane.cargo().delete(created.id).await.unwrap();
    assert!(h.plane.cargo().list_for_owner(alex.id).await.unwrap().is_empty());
    assert_eq!(h.plane.cargo().list_for_owner(sam.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_user_delete_takes_owned_records() {
    let h = Harness::new().await;
    let user = h.user("alex").await;
    h.plane
        .api_keys()
        .issue(user.id, NewApiKey::default())
        .await
        .unwrap();
    h.plane.projects().ensure_default(user.id).await.unwrap();

    h.plane.users().delete(user.id).await.unwrap();
    assert!(h.plane.api_keys().list_for_user(user.id).await.unwrap().is_empty());
    assert!(h.plane.projects().list_for_owner(user.id).await.unwrap().is_empty());

    let err = h.plane.users().delete(user.id).await.unwrap_err();
    assert!(matches!(err, CoreError::NotFound { entity: "user", .. }));
}

#[tokio::test]
async fn test_user_update_keeps_usernames_unique() {
    let h = Harness::new().await;
    let alex = h.user("alex").await;
    h.user("sam").await;

    let err = h
        .plane
        .users()
        .update(
            alex.id,
            UserUpdate {
                username: Some("sam".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(Conflict::AlreadyExists { entity: "user", .. })
    ));

    let updated = h
        .plane
        .users()
        .update(
            alex.id,
            UserUpdate {
                email: Some("alex@warden.example".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.username, "alex");
    assert_eq!(updated.email, "alex@warden.example");
}

#[tokio::test]
async fn test_node_update_keeps_connection_key() {
    let h = Harness::new().await;
    let node = h.node("fra-1", None).await;

    let updated = h
        .plane
        .nodes()
        .update(
            node.id,
            NodeUpdate {
                fqdn: Some("fra-1.example.net".to_string()),
                daemon_port: Some(8443),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.fqdn, "fra-1.example.net");
    assert_eq!(updated.daemon_port, 8443);
    assert_eq!(updated.connection_key, node.connection_key);
}

#[tokio::test]
async fn test_node_delete_refused_while_allocations_assigned() {
    let h = Harness::new().await;
    let node = h.node("fra-1", None).await;
    h.ports(node.id, "25565-25566").await;
    let reserved = h.plane.allocations().reserve(node.id, None).await.unwrap();

    let err = h.plane.nodes().delete(node.id).await.unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(Conflict::NodeInUse { assigned: 1, .. })
    ));

    h.plane.allocations().release(reserved.id).await.unwrap();
    h.plane.nodes().delete(node.id).await.unwrap();
    assert!(h.plane.allocations().find(reserved.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_server_rename_and_project_move() {
    let h = Harness::new().await;
    let owner = h.user("alex").await;
    let stranger = h.user("sam").await;
    let unit = h.unit("paper").await;
    let node = h.node("fra-1", None).await;
    h.ports(node.id, "25565").await;
    let server = h.create_on_node(owner.id, unit.id, node.id).await.unwrap().server;

    let events = h
        .plane
        .projects()
        .create(NewProject {
            owner_id: owner.id,
            name: "Events".to_string(),
            description: None,
        })
        .await
        .unwrap();
    let moved = h
        .plane
        .servers()
        .update_details(server.id, Some("creative".to_string()), Some(events.id))
        .await
        .unwrap();
    assert_eq!(moved.name, "creative");
    assert_eq!(moved.project_id, Some(events.id));
    assert_eq!(moved.allocation_id, server.allocation_id);

    let theirs = h.plane.projects().ensure_default(stranger.id).await.unwrap();
    let err = h
        .plane
        .servers()
        .update_details(server.id, None, Some(theirs.id))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Invalid { field: "project_id", .. }));

    let err = h
        .plane
        .servers()
        .update_details(server.id, Some(String::new()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Invalid { field: "name", .. }));
}
