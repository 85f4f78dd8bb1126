//! Server provisioning: the all-or-nothing create and the two-phase delete.
//!
//! ## Create
//!
//! ```text
//! resolve unit ─► pick node ─► lock node ─► BEGIN
//!   ─► region limit ─► project ─► reserve ─► insert (pending) ─► bind ─► COMMIT
//! ```
//!
//! Everything after `BEGIN` is one transaction; any failure rolls back the
//! reservation, the server row and a freshly created default project
//! together. Region placements retry on a full node (excluding it) and on a
//! full region (skipping to its fallback).
//!
//! ## Delete
//!
//! Phase one moves the server to `removing` and frees its allocation in one
//! transaction. Phase two deletes the row. A failure between them leaves a
//! `removing` server whose allocation is already free; calling
//! [`Provisioner::delete_server`] again finishes the job.
//!
//! Both run on their own task so a dropped caller cannot interrupt a unit of
//! work halfway.

use std::future::Future;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use warden_events::{LifecycleEvent, ServerState};
use warden_id::{AllocationId, NodeId, ProjectId, RegionId, ServerId, UnitId, UserId};

use crate::allocation::{AllocationManager, NodeLocks};
use crate::db::Database;
use crate::error::{Conflict, CoreError, CoreResult};
use crate::repos::servers::{self, ServerRecord};
use crate::repos::{allocations, nodes, projects, require_text, users};
use crate::repos::{Allocation, ResourceLimits, Server, UnitRepo};
use crate::tokens::{generate_validation_token, hash_token, verify_token};
use crate::topology::{Exclusions, RegionResolver};

/// Upper bound on placement attempts for one region create.
const MAX_PLACEMENT_ATTEMPTS: usize = 32;

/// Where a new server should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlacementTarget {
    /// Exactly this node.
    Node(NodeId),
    /// Any suitable node in the region or its fallbacks.
    Region(RegionId),
}

#[derive(Debug, Clone)]
pub struct NewServer {
    pub name: String,
    pub owner_id: UserId,
    pub unit_id: UnitId,
    pub target: PlacementTarget,
    pub limits: ResourceLimits,
    /// Defaults to the owner's default project.
    pub project_id: Option<ProjectId>,
    /// A specific allocation; only valid with a node target.
    pub allocation_id: Option<AllocationId>,
    /// One of the unit's images; defaults to the unit's default image.
    pub docker_image: Option<String>,
}

impl NewServer {
    pub fn new(
        name: impl Into<String>,
        owner_id: UserId,
        unit_id: UnitId,
        target: PlacementTarget,
        limits: ResourceLimits,
    ) -> Self {
        Self {
            name: name.into(),
            owner_id,
            unit_id,
            target,
            limits,
            project_id: None,
            allocation_id: None,
            docker_image: None,
        }
    }

    fn validate(&self) -> CoreResult<()> {
        require_text("name", &self.name, 191)?;
        self.limits.validate()?;
        if self.allocation_id.is_some() && matches!(self.target, PlacementTarget::Region(_)) {
            return Err(CoreError::invalid(
                "allocation_id",
                "a specific allocation requires a node target",
            ));
        }
        Ok(())
    }
}

/// A created server. `validation_token` is returned once and stored only as
/// a digest.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisionedServer {
    pub server: Server,
    pub allocation: Allocation,
    pub validation_token: String,
}

enum Attempt {
    Provisioned(ProvisionedServer),
    RegionFull,
}

#[derive(Clone)]
pub struct Provisioner {
    db: Database,
    locks: NodeLocks,
    units: UnitRepo,
}

impl Provisioner {
    pub fn new(db: Database, locks: NodeLocks, units: UnitRepo) -> Self {
        Self { db, locks, units }
    }

    /// Create a server and bind it to an allocation.
    #[instrument(skip(self, new), fields(owner_id = %new.owner_id, unit_id = %new.unit_id))]
    pub async fn create_server(&self, new: NewServer) -> CoreResult<ProvisionedServer> {
        new.validate()?;

        let unit = self.units.get(new.unit_id).await?;
        let image = match &new.docker_image {
            Some(image) if unit.offers_image(image) => image.clone(),
            Some(image) => {
                return Err(CoreError::invalid(
                    "docker_image",
                    format!("{image} is not offered by unit {}", unit.short_name),
                ))
            }
            None => unit.default_docker_image.clone(),
        };

        let this = self.clone();
        run_detached(async move { this.db.timed(this.provision(&new, &image)).await }).await
    }

    async fn provision(&self, new: &NewServer, image: &str) -> CoreResult<ProvisionedServer> {
        let region_id = match new.target {
            PlacementTarget::Node(node_id) => {
                return match self.attempt(new, image, node_id, None).await? {
                    Attempt::Provisioned(provisioned) => Ok(provisioned),
                    Attempt::RegionFull => Err(CoreError::Internal(
                        "region limit checked for a node placement".into(),
                    )),
                };
            }
            PlacementTarget::Region(region_id) => region_id,
        };

        let mut exclusions = Exclusions::default();
        for _ in 0..MAX_PLACEMENT_ATTEMPTS {
            let placement = {
                let mut conn = self.db.acquire().await?;
                RegionResolver::resolve_in(&mut conn, region_id, &Default::default(), &exclusions)
                    .await?
            };

            match self
                .attempt(new, image, placement.node.id, Some(placement.region_id))
                .await
            {
                Ok(Attempt::Provisioned(provisioned)) => return Ok(provisioned),
                Ok(Attempt::RegionFull) => {
                    debug!(region_id = %placement.region_id, "Region filled up, skipping");
                    exclusions.regions.insert(placement.region_id);
                }
                Err(CoreError::NoCapacity { node_id }) => {
                    debug!(node_id = %node_id, "Node filled up, excluding");
                    exclusions.nodes.insert(node_id);
                }
                Err(err) => return Err(err),
            }
        }

        warn!(region_id = %region_id, "Placement attempts exhausted");
        Err(CoreError::NoAvailableRegion { region_id })
    }

    /// One placement attempt on one node, in one transaction.
    async fn attempt(
        &self,
        new: &NewServer,
        image: &str,
        node_id: NodeId,
        region_id: Option<RegionId>,
    ) -> CoreResult<Attempt> {
        let _guard = self.locks.lock(node_id).await;
        let mut tx = self.db.begin().await?;

        let node = nodes::find_in(&mut tx, node_id)
            .await?
            .ok_or_else(|| CoreError::not_found("node", node_id))?;
        if let Some(region_id) = region_id {
            if !RegionResolver::has_room_in(&mut tx, region_id).await? {
                return Ok(Attempt::RegionFull);
            }
        }

        if users::find_in(&mut tx, new.owner_id).await?.is_none() {
            return Err(CoreError::not_found("user", new.owner_id));
        }
        let project_id = match new.project_id {
            Some(project_id) => {
                let project = projects::find_in(&mut tx, project_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("project", project_id))?;
                if project.owner_id != new.owner_id {
                    return Err(CoreError::invalid(
                        "project_id",
                        "project belongs to another user",
                    ));
                }
                project.id
            }
            None => projects::ensure_default_in(&mut tx, new.owner_id).await?.id,
        };

        let reserved = AllocationManager::reserve_in(&mut tx, node_id, new.allocation_id).await?;

        let validation_token = generate_validation_token();
        let token_hash = hash_token(&validation_token);
        let server = servers::insert_in(
            &mut tx,
            &ServerRecord {
                id: ServerId::new(),
                name: &new.name,
                owner_id: new.owner_id,
                node_id,
                unit_id: new.unit_id,
                allocation_id: reserved.id,
                project_id,
                docker_image: image,
                limits: new.limits,
                validation_token_hash: &token_hash,
            },
        )
        .await?;
        let allocation = AllocationManager::bind_in(&mut tx, reserved.id, server.id).await?;

        tx.commit().await?;

        info!(
            server_id = %server.id,
            node = %node.name,
            endpoint = %allocation.endpoint(),
            "Server provisioned"
        );
        Ok(Attempt::Provisioned(ProvisionedServer {
            server,
            allocation,
            validation_token,
        }))
    }

    /// Remove a server and return its allocation to the pool.
    #[instrument(skip(self))]
    pub async fn delete_server(&self, id: ServerId) -> CoreResult<()> {
        let this = self.clone();
        run_detached(async move { this.db.timed(this.decommission(id)).await }).await
    }

    async fn decommission(&self, id: ServerId) -> CoreResult<()> {
        let node_id = {
            let mut conn = self.db.acquire().await?;
            servers::find_in(&mut conn, id)
                .await?
                .ok_or_else(|| CoreError::not_found("server", id))?
                .node_id
        };
        let _guard = self.locks.lock(node_id).await;

        let mut tx = self.db.begin().await?;
        let server = servers::find_in(&mut tx, id)
            .await?
            .ok_or_else(|| CoreError::not_found("server", id))?;
        let next = server.state.begin_removal()?;
        if server.state != next
            && servers::set_state_in(&mut tx, id, server.state, next, None).await? == 0
        {
            return Err(Conflict::StaleState { server_id: id }.into());
        }

        match allocations::find_in(&mut tx, server.allocation_id).await? {
            Some(allocation) if allocation.server_id == Some(id) => {
                AllocationManager::release_in(&mut tx, allocation.id).await?;
            }
            _ => debug!(server_id = %id, "Allocation already released"),
        }
        tx.commit().await?;

        let mut conn = self.db.acquire().await?;
        if servers::delete_removing_in(&mut conn, id).await? == 0 {
            if servers::find_in(&mut conn, id).await?.is_some() {
                return Err(Conflict::StaleState { server_id: id }.into());
            }
            debug!(server_id = %id, "Server row already gone");
        }

        let finished = next.finish_removal()?;
        info!(server_id = %id, state = %finished, "Server deleted");
        Ok(())
    }

    /// Apply a deployment event to a server.
    #[instrument(skip(self), fields(event = event.event_type()))]
    pub async fn transition_server(&self, id: ServerId, event: LifecycleEvent) -> CoreResult<Server> {
        self.db
            .timed(async {
                let mut tx = self.db.begin().await?;
                let server = servers::find_in(&mut tx, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("server", id))?;
                let next = server.state.apply(&event)?;

                if servers::set_state_in(&mut tx, id, server.state, next, event.reason()).await? == 0 {
                    return Err(Conflict::StaleState { server_id: id }.into());
                }
                let updated = servers::find_in(&mut tx, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("server", id))?;
                tx.commit().await?;

                if next == ServerState::Error {
                    warn!(server_id = %id, from = %server.state, reason = ?event.reason(), "Server entered error");
                } else {
                    info!(server_id = %id, from = %server.state, to = %next, "Server transitioned");
                }
                Ok(updated)
            })
            .await
    }

    /// Check and burn a server's one-time validation token.
    pub async fn consume_validation_token(&self, id: ServerId, token: &str) -> CoreResult<Server> {
        self.db
            .timed(async {
                let mut tx = self.db.begin().await?;
                let server = servers::find_in(&mut tx, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("server", id))?;

                let stored = server
                    .validation_token_hash
                    .as_deref()
                    .ok_or_else(|| CoreError::invalid("validation_token", "already consumed"))?;
                if !verify_token(token, stored) {
                    return Err(CoreError::invalid("validation_token", "does not match"));
                }
                if servers::clear_validation_token_in(&mut tx, id, stored).await? == 0 {
                    return Err(CoreError::invalid("validation_token", "already consumed"));
                }

                let updated = servers::find_in(&mut tx, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("server", id))?;
                tx.commit().await?;
                info!(server_id = %id, "Validation token consumed");
                Ok(updated)
            })
            .await
    }
}

/// Run a unit of work on its own task so it reaches commit or rollback even
/// if the caller goes away.
async fn run_detached<T, F>(work: F) -> CoreResult<T>
where
    T: Send + 'static,
    F: Future<Output = CoreResult<T>> + Send + 'static,
{
    tokio::spawn(work)
        .await
        .map_err(|e| CoreError::Internal(format!("provisioning task failed: {e}")))?
}
