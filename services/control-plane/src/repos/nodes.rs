//! Nodes: hosts running the node daemon.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::{debug, info};
use warden_id::{NodeId, RegionId};

use super::{decode_u16, require_text};
use crate::db::{Database, DbError, UpdateBuilder};
use crate::error::{Conflict, CoreError, CoreResult};
use crate::tokens;

pub(crate) const NODE_COLUMNS: &str = "id, name, fqdn, daemon_port, connection_key, is_online, \
     last_checked, maintenance, region_id, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub fqdn: String,
    pub daemon_port: u16,
    /// Issued once at creation and never regenerated.
    #[serde(skip_serializing)]
    pub connection_key: String,
    pub is_online: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub maintenance: bool,
    pub region_id: Option<RegionId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for Node {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            fqdn: row.try_get("fqdn")?,
            daemon_port: decode_u16("daemon_port", row.try_get("daemon_port")?)?,
            connection_key: row.try_get("connection_key")?,
            is_online: row.try_get("is_online")?,
            last_checked: row.try_get("last_checked")?,
            maintenance: row.try_get("maintenance")?,
            region_id: row.try_get("region_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub fqdn: String,
    pub daemon_port: u16,
    pub region_id: Option<RegionId>,
    pub maintenance: bool,
}

#[derive(Debug, Clone, Default)]
pub struct NodeUpdate {
    pub name: Option<String>,
    pub fqdn: Option<String>,
    pub daemon_port: Option<u16>,
    pub region_id: Option<Option<RegionId>>,
    pub maintenance: Option<bool>,
}

fn validate_fqdn(fqdn: &str) -> CoreResult<()> {
    require_text("fqdn", fqdn, 253)?;
    let valid = fqdn.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-')
    });
    if valid {
        Ok(())
    } else {
        Err(CoreError::invalid("fqdn", "not a valid host name"))
    }
}

/// Map a node write failure: a dangling region reference or a taken name.
fn write_error(err: sqlx::Error, name: &str) -> CoreError {
    let err = DbError::Query(err);
    if err.is_foreign_key_violation() {
        return CoreError::invalid("region_id", "region does not exist");
    }
    if err.is_unique_violation() {
        return Conflict::AlreadyExists {
            entity: "node",
            detail: format!("name {name}"),
        }
        .into();
    }
    err.into()
}

fn validate_daemon_port(port: u16) -> CoreResult<()> {
    if port == 0 {
        return Err(CoreError::invalid("daemon_port", "must not be 0"));
    }
    Ok(())
}

#[derive(Clone)]
pub struct NodeRepo {
    db: Database,
}

impl NodeRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Register a node. It starts offline until its first health signal.
    pub async fn create(&self, new: NewNode) -> CoreResult<Node> {
        require_text("name", &new.name, 100)?;
        validate_fqdn(&new.fqdn)?;
        validate_daemon_port(new.daemon_port)?;

        self.db
            .timed(async {
                let now = Utc::now();
                let node = sqlx::query_as::<_, Node>(&format!(
                    "INSERT INTO nodes (id, name, fqdn, daemon_port, connection_key, is_online, maintenance, region_id, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)
                     RETURNING {NODE_COLUMNS}"
                ))
                .bind(NodeId::new())
                .bind(&new.name)
                .bind(&new.fqdn)
                .bind(i64::from(new.daemon_port))
                .bind(tokens::generate_connection_key())
                .bind(new.maintenance)
                .bind(new.region_id)
                .bind(now)
                .bind(now)
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| write_error(e, &new.name))?;

                info!(node_id = %node.id, name = %node.name, fqdn = %node.fqdn, "Node registered");
                Ok(node)
            })
            .await
    }

    pub async fn find(&self, id: NodeId) -> CoreResult<Option<Node>> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                find_in(&mut conn, id).await
            })
            .await
    }

    pub async fn get(&self, id: NodeId) -> CoreResult<Node> {
        self.find(id)
            .await?
            .ok_or_else(|| CoreError::not_found("node", id))
    }

    pub async fn list(&self) -> CoreResult<Vec<Node>> {
        self.db
            .timed(async {
                Ok(sqlx::query_as::<_, Node>(&format!(
                    "SELECT {NODE_COLUMNS} FROM nodes ORDER BY name"
                ))
                .fetch_all(self.db.pool())
                .await?)
            })
            .await
    }

    /// Update a node's descriptive fields, region or maintenance flag.
    /// The connection key is not updatable.
    pub async fn update(&self, id: NodeId, update: NodeUpdate) -> CoreResult<Node> {
        if let Some(name) = &update.name {
            require_text("name", name, 100)?;
        }
        if let Some(fqdn) = &update.fqdn {
            validate_fqdn(fqdn)?;
        }
        if let Some(port) = update.daemon_port {
            validate_daemon_port(port)?;
        }

        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                let mut builder = UpdateBuilder::new("nodes");
                builder
                    .set_opt("name", update.name.clone())
                    .set_opt("fqdn", update.fqdn.clone())
                    .set_opt("daemon_port", update.daemon_port.map(i64::from))
                    .set_opt("region_id", update.region_id)
                    .set_opt("maintenance", update.maintenance);
                if !builder.is_empty() {
                    let name = update.name.as_deref().unwrap_or_default();
                    builder
                        .execute(id, &mut conn)
                        .await
                        .map_err(|e| write_error(e, name))?;
                }
                let node = find_in(&mut conn, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("node", id))?;
                info!(node_id = %id, maintenance = node.maintenance, "Node updated");
                Ok(node)
            })
            .await
    }

    /// Record a health observation.
    ///
    /// Observations older than the one already stored are ignored so a
    /// delayed signal cannot flip a node back. Returns whether it applied.
    pub async fn record_health(
        &self,
        id: NodeId,
        online: bool,
        checked_at: DateTime<Utc>,
    ) -> CoreResult<bool> {
        self.db
            .timed(async {
                let applied = sqlx::query(
                    "UPDATE nodes SET is_online = ?, last_checked = ?, updated_at = ?
                     WHERE id = ? AND (last_checked IS NULL OR last_checked <= ?)",
                )
                .bind(online)
                .bind(checked_at)
                .bind(Utc::now())
                .bind(id)
                .bind(checked_at)
                .execute(self.db.pool())
                .await?
                .rows_affected()
                    == 1;

                if !applied {
                    let exists: bool =
                        sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM nodes WHERE id = ?)")
                            .bind(id)
                            .fetch_one(self.db.pool())
                            .await?;
                    if !exists {
                        return Err(CoreError::not_found("node", id));
                    }
                    debug!(node_id = %id, %checked_at, "Ignoring out-of-order health signal");
                }
                Ok(applied)
            })
            .await
    }

    /// Mark online nodes whose last health check predates `threshold` as
    /// offline. Returns the number of nodes changed.
    pub async fn mark_stale_offline(&self, threshold: DateTime<Utc>) -> CoreResult<u64> {
        self.db
            .timed(async {
                Ok(sqlx::query(
                    "UPDATE nodes SET is_online = 0, updated_at = ?
                     WHERE is_online = 1 AND (last_checked IS NULL OR last_checked < ?)",
                )
                .bind(Utc::now())
                .bind(threshold)
                .execute(self.db.pool())
                .await?
                .rows_affected())
            })
            .await
    }

    /// Delete a node and its free allocations.
    ///
    /// Refused with [`Conflict::NodeInUse`] while any allocation on the node
    /// is assigned, reserved or bound.
    pub async fn delete(&self, id: NodeId) -> CoreResult<()> {
        self.db
            .timed(async {
                let mut tx = self.db.begin().await?;

                let assigned: i64 = sqlx::query_scalar(
                    "SELECT COUNT(*) FROM allocations
                     WHERE node_id = ? AND (assigned = 1 OR server_id IS NOT NULL)",
                )
                .bind(id)
                .fetch_one(&mut *tx)
                .await?;
                if assigned > 0 {
                    return Err(Conflict::NodeInUse {
                        node_id: id,
                        assigned,
                    }
                    .into());
                }

                let deleted = sqlx::query("DELETE FROM nodes WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if deleted == 0 {
                    return Err(CoreError::not_found("node", id));
                }

                tx.commit().await?;
                info!(node_id = %id, "Node deleted");
                Ok(())
            })
            .await
    }
}

pub(crate) async fn find_in(conn: &mut SqliteConnection, id: NodeId) -> CoreResult<Option<Node>> {
    Ok(sqlx::query_as::<_, Node>(&format!(
        "SELECT {NODE_COLUMNS} FROM nodes WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?)
}
