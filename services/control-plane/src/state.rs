//! The control-plane core, wired together.

use std::sync::Arc;

use tracing::info;
use warden_events::LifecycleEvent;
use warden_id::{NodeId, ServerId};

use crate::allocation::{AllocationManager, NewAllocation, NodeLocks};
use crate::db::{Database, DbConfig};
use crate::error::CoreResult;
use crate::evolution::SchemaEvolution;
use crate::provisioning::{NewServer, ProvisionedServer, Provisioner};
use crate::repos::{
    Allocation, ApiKeyRepo, CargoRepo, NodeRepo, ProjectRepo, RegionRepo, Server, ServerRepo,
    Unit, UnitRepo, UnitSpec, UserRepo,
};
use crate::topology::RegionResolver;

/// Shared handle to every component. Cheap to clone.
#[derive(Clone)]
pub struct ControlPlane {
    inner: Arc<ControlPlaneInner>,
}

struct ControlPlaneInner {
    db: Database,
    evolution: Arc<SchemaEvolution>,
    users: UserRepo,
    api_keys: ApiKeyRepo,
    regions: RegionRepo,
    nodes: NodeRepo,
    units: UnitRepo,
    projects: ProjectRepo,
    servers: ServerRepo,
    cargo: CargoRepo,
    allocations: AllocationManager,
    resolver: RegionResolver,
    provisioner: Provisioner,
}

impl ControlPlane {
    pub fn new(db: Database) -> Self {
        let evolution = Arc::new(SchemaEvolution::new(db.clone()));
        Self::with_evolution(db, evolution)
    }

    /// Build around a caller-supplied evolution manager.
    pub fn with_evolution(db: Database, evolution: Arc<SchemaEvolution>) -> Self {
        let locks = NodeLocks::new();
        let units = UnitRepo::new(db.clone(), evolution.clone());
        let inner = ControlPlaneInner {
            users: UserRepo::new(db.clone()),
            api_keys: ApiKeyRepo::new(db.clone()),
            regions: RegionRepo::new(db.clone()),
            nodes: NodeRepo::new(db.clone()),
            projects: ProjectRepo::new(db.clone()),
            servers: ServerRepo::new(db.clone()),
            cargo: CargoRepo::new(db.clone()),
            allocations: AllocationManager::new(db.clone(), locks.clone()),
            resolver: RegionResolver::new(db.clone()),
            provisioner: Provisioner::new(db.clone(), locks, units.clone()),
            units,
            evolution,
            db,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Connect, create the schema and run pending table upgrades.
    pub async fn open(config: &DbConfig) -> CoreResult<Self> {
        let db = Database::connect(config).await?;
        db.apply_schema().await?;
        let plane = Self::new(db);
        let reports = plane.evolution().ensure_all().await?;
        for report in reports.iter().filter(|r| !r.added_columns.is_empty() || r.backfilled_rows > 0) {
            info!(table = report.table, backfilled = report.backfilled_rows, "Table upgraded on open");
        }
        Ok(plane)
    }

    pub fn db(&self) -> &Database {
        &self.inner.db
    }

    pub fn evolution(&self) -> &SchemaEvolution {
        &self.inner.evolution
    }

    pub fn users(&self) -> &UserRepo {
        &self.inner.users
    }

    pub fn api_keys(&self) -> &ApiKeyRepo {
        &self.inner.api_keys
    }

    pub fn regions(&self) -> &RegionRepo {
        &self.inner.regions
    }

    pub fn nodes(&self) -> &NodeRepo {
        &self.inner.nodes
    }

    pub fn units(&self) -> &UnitRepo {
        &self.inner.units
    }

    pub fn projects(&self) -> &ProjectRepo {
        &self.inner.projects
    }

    pub fn servers(&self) -> &ServerRepo {
        &self.inner.servers
    }

    pub fn cargo(&self) -> &CargoRepo {
        &self.inner.cargo
    }

    pub fn allocations(&self) -> &AllocationManager {
        &self.inner.allocations
    }

    pub fn resolver(&self) -> &RegionResolver {
        &self.inner.resolver
    }

    pub fn provisioner(&self) -> &Provisioner {
        &self.inner.provisioner
    }

    // -------------------------------------------------------------------------
    // Core operations
    // -------------------------------------------------------------------------

    pub async fn create_server(&self, new: NewServer) -> CoreResult<ProvisionedServer> {
        self.inner.provisioner.create_server(new).await
    }

    pub async fn delete_server(&self, id: ServerId) -> CoreResult<()> {
        self.inner.provisioner.delete_server(id).await
    }

    pub async fn transition_server(&self, id: ServerId, event: LifecycleEvent) -> CoreResult<Server> {
        self.inner.provisioner.transition_server(id, event).await
    }

    pub async fn list_allocations(
        &self,
        node_id: NodeId,
        free: Option<bool>,
    ) -> CoreResult<Vec<Allocation>> {
        self.inner.allocations.list_allocations(node_id, free).await
    }

    pub async fn create_allocation(
        &self,
        node_id: NodeId,
        new: NewAllocation,
    ) -> CoreResult<Allocation> {
        self.inner.allocations.create_allocation(node_id, new).await
    }

    pub async fn upsert_unit(&self, spec: UnitSpec) -> CoreResult<Unit> {
        self.inner.units.upsert(spec).await
    }
}
