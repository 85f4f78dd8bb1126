//! Shared harness: a fresh in-memory control plane per test.

#![allow(dead_code)]

use chrono::Utc;
use warden_control_plane::db::{Database, DbConfig};
use warden_control_plane::provisioning::{NewServer, PlacementTarget, ProvisionedServer};
use warden_control_plane::repos::{
    Allocation, NewNode, NewRegion, NewUser, Node, Region, ResourceLimits, Unit, UnitSpec, User,
};
use warden_control_plane::ControlPlane;
use warden_id::{NodeId, RegionId, UnitId, UserId};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("warden_control_plane=debug")
        .try_init();
}

pub async fn database() -> Database {
    Database::connect(&DbConfig::in_memory()).await.unwrap()
}

pub struct Harness {
    pub plane: ControlPlane,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(DbConfig::in_memory()).await
    }

    pub async fn with_config(config: DbConfig) -> Self {
        init_tracing();
        let plane = ControlPlane::open(&config).await.unwrap();
        Self { plane }
    }

    pub async fn user(&self, username: &str) -> User {
        self.plane
            .users()
            .create(NewUser {
                username: username.to_string(),
                email: format!("{username}@example.com"),
                password_hash: "$argon2id$v=19$stub".to_string(),
                is_admin: false,
            })
            .await
            .unwrap()
    }

    pub async fn region(&self, identifier: &str, fallback: Option<RegionId>, limit: Option<i64>) -> Region {
        self.plane
            .regions()
            .create(NewRegion {
                name: identifier.to_uppercase(),
                identifier: identifier.to_string(),
                country_code: None,
                fallback_region_id: fallback,
                server_limit: limit,
            })
            .await
            .unwrap()
    }

    /// An online node.
    pub async fn node(&self, name: &str, region_id: Option<RegionId>) -> Node {
        let node = self
            .plane
            .nodes()
            .create(NewNode {
                name: name.to_string(),
                fqdn: format!("{name}.nodes.example.com"),
                daemon_port: 8080,
                region_id,
                maintenance: false,
            })
            .await
            .unwrap();
        self.plane
            .nodes()
            .record_health(node.id, true, Utc::now())
            .await
            .unwrap();
        self.plane.nodes().get(node.id).await.unwrap()
    }

    pub async fn ports(&self, node_id: NodeId, ports: &str) -> Vec<Allocation> {
        self.plane
            .allocations()
            .create_allocations(node_id, "10.0.0.1", ports)
            .await
            .unwrap()
    }

    pub async fn unit(&self, short_name: &str) -> Unit {
        self.plane
            .upsert_unit(UnitSpec::new(
                "Paper",
                short_name,
                "ghcr.io/warden/yolks:java_21",
                "java -jar server.jar",
            ))
            .await
            .unwrap()
    }

    pub async fn create_on_node(
        &self,
        owner_id: UserId,
        unit_id: UnitId,
        node_id: NodeId,
    ) -> warden_control_plane::CoreResult<ProvisionedServer> {
        self.plane
            .create_server(NewServer::new(
                "survival",
                owner_id,
                unit_id,
                PlacementTarget::Node(node_id),
                limits(),
            ))
            .await
    }

    pub async fn create_in_region(
        &self,
        owner_id: UserId,
        unit_id: UnitId,
        region_id: RegionId,
    ) -> warden_control_plane::CoreResult<ProvisionedServer> {
        self.plane
            .create_server(NewServer::new(
                "survival",
                owner_id,
                unit_id,
                PlacementTarget::Region(region_id),
                limits(),
            ))
            .await
    }

    /// Every bound allocation names a server whose allocation names it back.
    pub async fn assert_symmetric(&self) {
        let mismatches = self.plane.allocations().audit_bindings().await.unwrap();
        assert!(mismatches.is_empty(), "binding mismatches: {mismatches:?}");

        for server in self.plane.servers().list().await.unwrap() {
            let allocation = self.plane.allocations().get(server.allocation_id).await.unwrap();
            assert_eq!(allocation.server_id, Some(server.id));
            assert!(allocation.assigned);
        }
    }
}

pub fn limits() -> ResourceLimits {
    ResourceLimits {
        memory_mb: 2048,
        disk_mb: 10240,
        cpu_percent: 200,
    }
}
