mod common;

use std::collections::HashSet;

use chrono::Utc;
use common::Harness;
use warden_control_plane::repos::{NodeUpdate, RegionUpdate};
use warden_control_plane::{Conflict, CoreError};

#[tokio::test]
async fn test_falls_back_when_primary_has_no_capacity() {
    let h = Harness::new().await;
    let r2 = h.region("eu-west", None, None).await;
    let r1 = h.region("eu-central", Some(r2.id), None).await;
    let _empty = h.node("fra-1", Some(r1.id)).await;
    let ams = h.node("ams-1", Some(r2.id)).await;
    h.ports(ams.id, "25565").await;

    let placement = h
        .plane
        .resolver()
        .resolve_placement(r1.id, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(placement.node.id, ams.id);
    assert_eq!(placement.region_id, r2.id);
    assert_eq!(placement.hops, 1);
}

#[tokio::test]
async fn test_prefers_node_with_most_free_allocations() {
    let h = Harness::new().await;
    let region = h.region("eu", None, None).await;
    let small = h.node("fra-1", Some(region.id)).await;
    let large = h.node("fra-2", Some(region.id)).await;
    h.ports(small.id, "25565").await;
    h.ports(large.id, "25565-25567").await;

    let placement = h
        .plane
        .resolver()
        .resolve_placement(region.id, &HashSet::new())
        .await
        .unwrap();
    assert_eq!(placement.node.id, large.id);
    assert_eq!(placement.hops, 0);
}

#[tokio::test]
async fn test_skips_offline_and_maintenance_nodes() {
    let h = Harness::new().await;
    let region = h.region("eu", None, None).await;
    let offline = h.node("fra-1", Some(region.id)).await;
    let drained = h.node("fra-2", Some(region.id)).await;
    h.ports(offline.id, "25565").await;
    h.ports(drained.id, "25565").await;

    h.plane
        .nodes()
        .record_health(offline.id, false, Utc::now())
        .await
        .unwrap();
    h.plane
        .nodes()
        .update(
            drained.id,
            NodeUpdate {
                maintenance: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let err = h
        .plane
        .resolver()
        .resolve_placement(region.id, &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NoAvailableRegion { region_id } if region_id == region.id));
}

#[tokio::test]
async fn test_server_limit_redirects_to_fallback() {
    let h = Harness::new().await;
    let owner = h.user("alex").await;
    let unit = h.unit("paper").await;
    let overflow = h.region("eu-west", None, None).await;
    let primary = h.region("eu-central", Some(overflow.id), Some(1)).await;
    let fra = h.node("fra-1", Some(primary.id)).await;
    let ams = h.node("ams-1", Some(overflow.id)).await;
    h.ports(fra.id, "25565-25566").await;
    h.ports(ams.id, "25565").await;

    let first = h.create_in_region(owner.id, unit.id, primary.id).await.unwrap();
    assert_eq!(first.server.node_id, fra.id);

    // The primary still has a free port but is at its server limit.
    let second = h.create_in_region(owner.id, unit.id, primary.id).await.unwrap();
    assert_eq!(second.server.node_id, ams.id);

    let err = h.create_in_region(owner.id, unit.id, primary.id).await.unwrap_err();
    assert!(matches!(err, CoreError::NoAvailableRegion { .. }));
    h.assert_symmetric().await;
}

#[tokio::test]
async fn test_region_create_spreads_over_nodes() {
    let h = Harness::new().await;
    let owner = h.user("alex").await;
    let unit = h.unit("paper").await;
    let region = h.region("eu", None, None).await;
    let a = h.node("fra-1", Some(region.id)).await;
    let b = h.node("fra-2", Some(region.id)).await;
    h.ports(a.id, "25565").await;
    h.ports(b.id, "25565").await;

    let mut nodes = HashSet::new();
    for _ in 0..2 {
        let provisioned = h.create_in_region(owner.id, unit.id, region.id).await.unwrap();
        nodes.insert(provisioned.server.node_id);
    }
    assert_eq!(nodes, HashSet::from([a.id, b.id]));

    let err = h.create_in_region(owner.id, unit.id, region.id).await.unwrap_err();
    assert!(matches!(err, CoreError::NoAvailableRegion { .. }));
}

#[tokio::test]
async fn test_fallback_cycle_is_rejected_on_write() {
    let h = Harness::new().await;
    let a = h.region("a", None, None).await;
    let b = h.region("b", Some(a.id), None).await;
    let c = h.region("c", Some(b.id), None).await;

    let err = h
        .plane
        .regions()
        .update(
            a.id,
            RegionUpdate {
                fallback_region_id: Some(Some(c.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(Conflict::FallbackCycle { .. })
    ));

    let err = h
        .plane
        .regions()
        .update(
            a.id,
            RegionUpdate {
                fallback_region_id: Some(Some(a.id)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::Conflict(Conflict::FallbackCycle { .. })
    ));
}

#[tokio::test]
async fn test_resolver_survives_stored_cycle() {
    let h = Harness::new().await;
    let a = h.region("a", None, None).await;
    let b = h.region("b", Some(a.id), None).await;

    // A cycle written around the repository.
    sqlx::query("UPDATE regions SET fallback_region_id = ? WHERE id = ?")
        .bind(b.id)
        .bind(a.id)
        .execute(h.plane.db().pool())
        .await
        .unwrap();

    let err = h
        .plane
        .resolver()
        .resolve_placement(a.id, &HashSet::new())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NoAvailableRegion { region_id } if region_id == a.id));

    let chain = h.plane.resolver().fallback_chain(a.id).await.unwrap();
    assert_eq!(chain.iter().map(|r| r.id).collect::<Vec<_>>(), vec![a.id, b.id]);
}

#[tokio::test]
async fn test_attempted_regions_are_not_revisited() {
    let h = Harness::new().await;
    let r2 = h.region("r2", None, None).await;
    let r1 = h.region("r1", Some(r2.id), None).await;
    let node = h.node("fra-1", Some(r1.id)).await;
    h.ports(node.id, "25565").await;

    let err = h
        .plane
        .resolver()
        .resolve_placement(r1.id, &HashSet::from([r1.id]))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NoAvailableRegion { .. }));
}

#[tokio::test]
async fn test_deleting_fallback_clears_reference() {
    let h = Harness::new().await;
    let r2 = h.region("r2", None, None).await;
    let r1 = h.region("r1", Some(r2.id), None).await;

    h.plane.regions().delete(r2.id).await.unwrap();
    let r1 = h.plane.regions().get(r1.id).await.unwrap();
    assert_eq!(r1.fallback_region_id, None);
}
