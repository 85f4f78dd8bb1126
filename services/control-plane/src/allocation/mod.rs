//! Allocation management: the pool of `(bind address, port)` pairs on each
//! node and the reserve → bind → release cycle servers go through.
//!
//! Invariants held here:
//! - a `(node, bind address, port)` triple exists at most once
//! - an allocation is bound to at most one server and a server holds at most
//!   one allocation
//! - a bound allocation is always marked assigned
//!
//! Changes to a node's allocations are serialized through [`NodeLocks`] and
//! each one is also a conditional statement, so correctness does not rest on
//! the lock alone.

mod locks;

pub use locks::NodeLocks;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info, instrument, warn};
use warden_id::{AllocationId, NodeId, ServerId};
use warden_networking::{validate_port, BindAddress, PortSpec};

use crate::db::{Database, UpdateBuilder};
use crate::error::{on_unique, Conflict, CoreError, CoreResult};
use crate::repos::allocations::{self as rows, Allocation, AllocationUpdate};
use crate::repos::{nodes, require_text};

/// A mismatch between a server's allocation and the allocation's server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BindingMismatch {
    /// The allocation names a server that does not exist.
    OrphanedAllocation {
        allocation_id: AllocationId,
        server_id: ServerId,
    },
    /// The server's allocation is bound elsewhere or not at all.
    UnboundServer {
        server_id: ServerId,
        allocation_id: AllocationId,
    },
}

/// A single allocation to create.
#[derive(Debug, Clone)]
pub struct NewAllocation {
    pub bind_address: String,
    pub port: u16,
    pub alias: Option<String>,
    pub notes: Option<String>,
}

#[derive(Clone)]
pub struct AllocationManager {
    db: Database,
    locks: NodeLocks,
}

impl AllocationManager {
    pub fn new(db: Database, locks: NodeLocks) -> Self {
        Self { db, locks }
    }

    pub fn locks(&self) -> &NodeLocks {
        &self.locks
    }

    // -------------------------------------------------------------------------
    // Pool management
    // -------------------------------------------------------------------------

    pub async fn create_allocation(
        &self,
        node_id: NodeId,
        new: NewAllocation,
    ) -> CoreResult<Allocation> {
        let address = BindAddress::parse(&new.bind_address)?;
        let port = validate_port(u32::from(new.port))?;
        validate_labels(new.alias.as_deref(), new.notes.as_deref())?;

        let mut created = self
            .insert_ports(node_id, address, &[port], new.alias.as_deref(), new.notes.as_deref())
            .await?;
        created
            .pop()
            .ok_or_else(|| CoreError::Internal("allocation insert returned nothing".into()))
    }

    /// Create one allocation per port in `ports` (`"25565"`, `"27015-27020"`,
    /// `"25565,25570-25575"`). All or nothing: a single duplicate fails the
    /// whole batch with [`Conflict::DuplicatePort`].
    pub async fn create_allocations(
        &self,
        node_id: NodeId,
        bind_address: &str,
        ports: &str,
    ) -> CoreResult<Vec<Allocation>> {
        let address = BindAddress::parse(bind_address)?;
        let spec = PortSpec::parse(ports)?;
        let ports: Vec<u16> = spec.iter().collect();
        self.insert_ports(node_id, address, &ports, None, None).await
    }

    async fn insert_ports(
        &self,
        node_id: NodeId,
        address: BindAddress,
        ports: &[u16],
        alias: Option<&str>,
        notes: Option<&str>,
    ) -> CoreResult<Vec<Allocation>> {
        let bind_address = address.to_string();
        self.db
            .timed(async {
                let mut tx = self.db.begin().await?;
                if nodes::find_in(&mut tx, node_id).await?.is_none() {
                    return Err(CoreError::not_found("node", node_id));
                }

                let mut created = Vec::with_capacity(ports.len());
                for &port in ports {
                    let allocation = rows::insert_in(&mut tx, node_id, &bind_address, port, alias, notes)
                        .await
                        .map_err(|e| {
                            on_unique(e, || Conflict::DuplicatePort {
                                node_id,
                                bind_address: bind_address.clone(),
                                port,
                            })
                        })?;
                    created.push(allocation);
                }

                tx.commit().await?;
                info!(
                    node_id = %node_id,
                    bind_address = %bind_address,
                    count = created.len(),
                    "Allocations created"
                );
                Ok(created)
            })
            .await
    }

    /// All allocations of a node; `free` narrows to free or assigned ones.
    pub async fn list_allocations(
        &self,
        node_id: NodeId,
        free: Option<bool>,
    ) -> CoreResult<Vec<Allocation>> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                let allocations = rows::list_in(&mut conn, node_id, free).await?;
                if allocations.is_empty() && nodes::find_in(&mut conn, node_id).await?.is_none() {
                    return Err(CoreError::not_found("node", node_id));
                }
                Ok(allocations)
            })
            .await
    }

    pub async fn list_free(&self, node_id: NodeId) -> CoreResult<Vec<Allocation>> {
        self.list_allocations(node_id, Some(true)).await
    }

    pub async fn find(&self, id: AllocationId) -> CoreResult<Option<Allocation>> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                Ok(rows::find_in(&mut conn, id).await?)
            })
            .await
    }

    pub async fn get(&self, id: AllocationId) -> CoreResult<Allocation> {
        self.find(id)
            .await?
            .ok_or_else(|| CoreError::not_found("allocation", id))
    }

    pub async fn find_by_server(&self, server_id: ServerId) -> CoreResult<Option<Allocation>> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                Ok(rows::find_by_server_in(&mut conn, server_id).await?)
            })
            .await
    }

    /// Change an allocation's alias or notes. Binding state is untouched.
    pub async fn update_allocation(
        &self,
        id: AllocationId,
        update: AllocationUpdate,
    ) -> CoreResult<Allocation> {
        validate_labels(
            update.alias.as_ref().and_then(Option::as_deref),
            update.notes.as_ref().and_then(Option::as_deref),
        )?;
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                let mut builder = UpdateBuilder::new("allocations");
                builder
                    .set_opt("alias", update.alias.clone())
                    .set_opt("notes", update.notes.clone());
                if !builder.is_empty() {
                    builder.execute(id, &mut conn).await?;
                }
                rows::find_in(&mut conn, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("allocation", id))
            })
            .await
    }

    /// Delete a free allocation.
    pub async fn delete_allocation(&self, id: AllocationId) -> CoreResult<()> {
        let allocation = self.get(id).await?;
        self.db
            .timed(async {
                let _guard = self.locks.lock(allocation.node_id).await;
                let mut conn = self.db.acquire().await?;
                if rows::delete_free_in(&mut conn, id).await? == 0 {
                    return match rows::find_in(&mut conn, id).await? {
                        None => Err(CoreError::not_found("allocation", id)),
                        Some(_) => Err(Conflict::AllocationConflict {
                            allocation_id: id,
                            reason: "allocation is assigned",
                        }
                        .into()),
                    };
                }
                info!(allocation_id = %id, node_id = %allocation.node_id, "Allocation deleted");
                Ok(())
            })
            .await
    }

    // -------------------------------------------------------------------------
    // Reserve / bind / release
    // -------------------------------------------------------------------------

    /// Reserve a free allocation on `node_id`, the preferred one if given,
    /// else the one with the lowest port.
    #[instrument(skip(self))]
    pub async fn reserve(
        &self,
        node_id: NodeId,
        preferred: Option<AllocationId>,
    ) -> CoreResult<Allocation> {
        self.db
            .timed(async {
                let _guard = self.locks.lock(node_id).await;
                let mut tx = self.db.begin().await?;
                if nodes::find_in(&mut tx, node_id).await?.is_none() {
                    return Err(CoreError::not_found("node", node_id));
                }
                let allocation = Self::reserve_in(&mut tx, node_id, preferred).await?;
                tx.commit().await?;
                debug!(allocation_id = %allocation.id, port = allocation.port, "Allocation reserved");
                Ok(allocation)
            })
            .await
    }

    /// Bind an allocation to a server.
    #[instrument(skip(self))]
    pub async fn bind(&self, id: AllocationId, server_id: ServerId) -> CoreResult<Allocation> {
        let allocation = self.get(id).await?;
        self.db
            .timed(async {
                let _guard = self.locks.lock(allocation.node_id).await;
                let mut tx = self.db.begin().await?;
                let bound = Self::bind_in(&mut tx, id, server_id).await?;
                tx.commit().await?;
                Ok(bound)
            })
            .await
    }

    /// Return an allocation to the free pool. Releasing a free allocation is
    /// a no-op and returns `false`.
    #[instrument(skip(self))]
    pub async fn release(&self, id: AllocationId) -> CoreResult<bool> {
        let allocation = self.get(id).await?;
        self.db
            .timed(async {
                let _guard = self.locks.lock(allocation.node_id).await;
                let mut conn = self.db.acquire().await?;
                Self::release_in(&mut conn, id).await
            })
            .await
    }

    /// Free reservations older than `before` that no server ever bound.
    pub async fn release_stale_reservations(&self, before: DateTime<Utc>) -> CoreResult<u64> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                let released = rows::release_unbound_before_in(&mut conn, before).await?;
                if released > 0 {
                    warn!(released, "Released reservations that were never bound");
                }
                Ok(released)
            })
            .await
    }

    /// Cross-check allocation bindings against servers.
    pub async fn audit_bindings(&self) -> CoreResult<Vec<BindingMismatch>> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                let mut mismatches = Vec::new();

                for allocation in rows::list_bound_in(&mut conn).await? {
                    let Some(server_id) = allocation.server_id else {
                        continue;
                    };
                    let exists: bool =
                        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM servers WHERE id = ?)")
                            .bind(server_id)
                            .fetch_one(&mut *conn)
                            .await?;
                    if !exists {
                        mismatches.push(BindingMismatch::OrphanedAllocation {
                            allocation_id: allocation.id,
                            server_id,
                        });
                    }
                }

                let unbound: Vec<(ServerId, AllocationId)> = sqlx::query_as(
                    "SELECT s.id, s.allocation_id FROM servers s
                     LEFT JOIN allocations a ON a.id = s.allocation_id AND a.server_id = s.id
                     WHERE a.id IS NULL AND s.state != 'removing'
                     ORDER BY s.id",
                )
                .fetch_all(&mut *conn)
                .await?;
                mismatches.extend(unbound.into_iter().map(|(server_id, allocation_id)| {
                    BindingMismatch::UnboundServer {
                        server_id,
                        allocation_id,
                    }
                }));

                Ok(mismatches)
            })
            .await
    }

    // -------------------------------------------------------------------------
    // Transaction building blocks. Callers hold the node lock.
    // -------------------------------------------------------------------------

    pub(crate) async fn reserve_in(
        conn: &mut SqliteConnection,
        node_id: NodeId,
        preferred: Option<AllocationId>,
    ) -> CoreResult<Allocation> {
        let now = Utc::now();
        match preferred {
            Some(id) => {
                let current = rows::find_in(conn, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("allocation", id))?;
                if current.node_id != node_id {
                    return Err(Conflict::AllocationConflict {
                        allocation_id: id,
                        reason: "allocation belongs to another node",
                    }
                    .into());
                }
                rows::reserve_exact_in(conn, id, now).await?.ok_or_else(|| {
                    Conflict::AllocationConflict {
                        allocation_id: id,
                        reason: "allocation is already assigned",
                    }
                    .into()
                })
            }
            None => rows::reserve_lowest_in(conn, node_id, now)
                .await?
                .ok_or(CoreError::NoCapacity { node_id }),
        }
    }

    pub(crate) async fn bind_in(
        conn: &mut SqliteConnection,
        id: AllocationId,
        server_id: ServerId,
    ) -> CoreResult<Allocation> {
        let bound = rows::bind_in(conn, id, server_id, Utc::now())
            .await
            .map_err(|e| {
                on_unique(e, || Conflict::AlreadyExists {
                    entity: "allocation binding",
                    detail: format!("server {server_id} already holds an allocation"),
                })
            })?;
        if let Some(allocation) = bound {
            return Ok(allocation);
        }

        match rows::find_in(conn, id).await? {
            None => Err(CoreError::not_found("allocation", id)),
            Some(Allocation {
                server_id: Some(bound_to),
                ..
            }) => Err(Conflict::AlreadyBound {
                allocation_id: id,
                bound_to,
            }
            .into()),
            Some(_) => Err(CoreError::Internal(format!(
                "allocation {id} neither bound nor bindable"
            ))),
        }
    }

    pub(crate) async fn release_in(conn: &mut SqliteConnection, id: AllocationId) -> CoreResult<bool> {
        if rows::release_in(conn, id, Utc::now()).await? > 0 {
            debug!(allocation_id = %id, "Allocation released");
            return Ok(true);
        }
        match rows::find_in(conn, id).await? {
            Some(_) => Ok(false),
            None => Err(CoreError::not_found("allocation", id)),
        }
    }
}

fn validate_labels(alias: Option<&str>, notes: Option<&str>) -> CoreResult<()> {
    if let Some(alias) = alias {
        require_text("alias", alias, 255)?;
    }
    if let Some(notes) = notes {
        if notes.chars().count() > 256 {
            return Err(CoreError::invalid("notes", "longer than 256 characters"));
        }
    }
    Ok(())
}
