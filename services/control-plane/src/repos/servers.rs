//! Servers: provisioned instances of a unit bound to one allocation.
//!
//! Creation, deletion and state changes go through
//! [`crate::provisioning::Provisioner`]; this module holds the rows and the
//! statements it composes, plus read access.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::info;
use warden_events::ServerState;
use warden_id::{AllocationId, NodeId, ProjectId, RegionId, ServerId, UnitId, UserId};

use super::{decode_error, require_text};
use crate::db::{Database, UpdateBuilder};
use crate::error::{CoreError, CoreResult};

pub(crate) const SERVER_COLUMNS: &str = "id, name, owner_id, node_id, unit_id, allocation_id, \
     project_id, docker_image, memory_mb, disk_mb, cpu_percent, state, validation_token_hash, \
     last_error, installed_at, created_at, updated_at";

/// Largest CPU share a server may ask for, in percent of one core.
pub const MAX_CPU_PERCENT: u32 = 6400;

/// Resource limits applied by the node daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    pub memory_mb: u32,
    pub disk_mb: u32,
    /// `0` is unlimited.
    pub cpu_percent: u32,
}

impl ResourceLimits {
    pub fn validate(&self) -> CoreResult<()> {
        if self.memory_mb == 0 {
            return Err(CoreError::invalid("memory_mb", "must be positive"));
        }
        if self.disk_mb == 0 {
            return Err(CoreError::invalid("disk_mb", "must be positive"));
        }
        if self.cpu_percent > MAX_CPU_PERCENT {
            return Err(CoreError::invalid(
                "cpu_percent",
                format!("must not exceed {MAX_CPU_PERCENT}"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Server {
    pub id: ServerId,
    pub name: String,
    pub owner_id: UserId,
    pub node_id: NodeId,
    pub unit_id: UnitId,
    pub allocation_id: AllocationId,
    pub project_id: Option<ProjectId>,
    pub docker_image: String,
    pub limits: ResourceLimits,
    pub state: ServerState,
    #[serde(skip_serializing)]
    pub validation_token_hash: Option<String>,
    pub last_error: Option<String>,
    pub installed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn decode_u32(column: &str, value: i64) -> Result<u32, sqlx::Error> {
    u32::try_from(value).map_err(|_| decode_error(format!("{column} out of range: {value}")))
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for Server {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let state: String = row.try_get("state")?;
        let state = ServerState::parse(&state)
            .ok_or_else(|| decode_error(format!("unknown server state {state}")))?;
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            owner_id: row.try_get("owner_id")?,
            node_id: row.try_get("node_id")?,
            unit_id: row.try_get("unit_id")?,
            allocation_id: row.try_get("allocation_id")?,
            project_id: row.try_get("project_id")?,
            docker_image: row.try_get("docker_image")?,
            limits: ResourceLimits {
                memory_mb: decode_u32("memory_mb", row.try_get("memory_mb")?)?,
                disk_mb: decode_u32("disk_mb", row.try_get("disk_mb")?)?,
                cpu_percent: decode_u32("cpu_percent", row.try_get("cpu_percent")?)?,
            },
            state,
            validation_token_hash: row.try_get("validation_token_hash")?,
            last_error: row.try_get("last_error")?,
            installed_at: row.try_get("installed_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Everything needed to insert a server row.
#[derive(Debug, Clone)]
pub(crate) struct ServerRecord<'a> {
    pub id: ServerId,
    pub name: &'a str,
    pub owner_id: UserId,
    pub node_id: NodeId,
    pub unit_id: UnitId,
    pub allocation_id: AllocationId,
    pub project_id: ProjectId,
    pub docker_image: &'a str,
    pub limits: ResourceLimits,
    pub validation_token_hash: &'a str,
}

#[derive(Clone)]
pub struct ServerRepo {
    db: Database,
}

impl ServerRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn find(&self, id: ServerId) -> CoreResult<Option<Server>> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                find_in(&mut conn, id).await
            })
            .await
    }

    pub async fn get(&self, id: ServerId) -> CoreResult<Server> {
        self.find(id)
            .await?
            .ok_or_else(|| CoreError::not_found("server", id))
    }

    pub async fn list(&self) -> CoreResult<Vec<Server>> {
        self.db
            .timed(async {
                Ok(sqlx::query_as::<_, Server>(&format!(
                    "SELECT {SERVER_COLUMNS} FROM servers ORDER BY id"
                ))
                .fetch_all(self.db.pool())
                .await?)
            })
            .await
    }

    pub async fn list_for_node(&self, node_id: NodeId) -> CoreResult<Vec<Server>> {
        self.db
            .timed(async {
                Ok(sqlx::query_as::<_, Server>(&format!(
                    "SELECT {SERVER_COLUMNS} FROM servers WHERE node_id = ? ORDER BY id"
                ))
                .bind(node_id)
                .fetch_all(self.db.pool())
                .await?)
            })
            .await
    }

    pub async fn list_for_owner(&self, owner_id: UserId) -> CoreResult<Vec<Server>> {
        self.db
            .timed(async {
                Ok(sqlx::query_as::<_, Server>(&format!(
                    "SELECT {SERVER_COLUMNS} FROM servers WHERE owner_id = ? ORDER BY id"
                ))
                .bind(owner_id)
                .fetch_all(self.db.pool())
                .await?)
            })
            .await
    }

    /// Rename a server or move it between its owner's projects.
    pub async fn update_details(
        &self,
        id: ServerId,
        name: Option<String>,
        project_id: Option<ProjectId>,
    ) -> CoreResult<Server> {
        if let Some(name) = &name {
            require_text("name", name, 191)?;
        }
        self.db
            .timed(async {
                let mut tx = self.db.begin().await?;
                let server = find_in(&mut tx, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("server", id))?;

                if let Some(project_id) = project_id {
                    let project = super::projects::find_in(&mut tx, project_id)
                        .await?
                        .ok_or_else(|| CoreError::not_found("project", project_id))?;
                    if project.owner_id != server.owner_id {
                        return Err(CoreError::invalid(
                            "project_id",
                            "project belongs to another user",
                        ));
                    }
                }

                let mut builder = UpdateBuilder::new("servers");
                builder
                    .set_opt("name", name.clone())
                    .set_opt("project_id", project_id);
                if !builder.is_empty() {
                    builder.execute(id, &mut tx).await?;
                }
                let server = find_in(&mut tx, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("server", id))?;
                tx.commit().await?;
                info!(server_id = %id, "Server details updated");
                Ok(server)
            })
            .await
    }
}

pub(crate) async fn find_in(
    conn: &mut SqliteConnection,
    id: ServerId,
) -> CoreResult<Option<Server>> {
    Ok(sqlx::query_as::<_, Server>(&format!(
        "SELECT {SERVER_COLUMNS} FROM servers WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?)
}

/// Insert a new server in `pending`.
pub(crate) async fn insert_in(
    conn: &mut SqliteConnection,
    record: &ServerRecord<'_>,
) -> CoreResult<Server> {
    let now = Utc::now();
    Ok(sqlx::query_as::<_, Server>(&format!(
        "INSERT INTO servers (id, name, owner_id, node_id, unit_id, allocation_id, project_id,
             docker_image, memory_mb, disk_mb, cpu_percent, state, validation_token_hash,
             created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         RETURNING {SERVER_COLUMNS}"
    ))
    .bind(record.id)
    .bind(record.name)
    .bind(record.owner_id)
    .bind(record.node_id)
    .bind(record.unit_id)
    .bind(record.allocation_id)
    .bind(record.project_id)
    .bind(record.docker_image)
    .bind(i64::from(record.limits.memory_mb))
    .bind(i64::from(record.limits.disk_mb))
    .bind(i64::from(record.limits.cpu_percent))
    .bind(ServerState::Pending.as_str())
    .bind(record.validation_token_hash)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?)
}

/// Move a server from `from` to `to`. Zero rows means the state changed
/// underneath the caller.
pub(crate) async fn set_state_in(
    conn: &mut SqliteConnection,
    id: ServerId,
    from: ServerState,
    to: ServerState,
    last_error: Option<&str>,
) -> Result<u64, sqlx::Error> {
    let now = Utc::now();
    let installed_at = (from == ServerState::Installing && to == ServerState::Running).then_some(now);
    Ok(sqlx::query(
        "UPDATE servers
         SET state = ?, last_error = COALESCE(?, last_error),
             installed_at = COALESCE(?, installed_at), updated_at = ?
         WHERE id = ? AND state = ?",
    )
    .bind(to.as_str())
    .bind(last_error)
    .bind(installed_at)
    .bind(now)
    .bind(id)
    .bind(from.as_str())
    .execute(conn)
    .await?
    .rows_affected())
}

/// Clear a validation token hash if it is still the one the caller checked.
pub(crate) async fn clear_validation_token_in(
    conn: &mut SqliteConnection,
    id: ServerId,
    expected_hash: &str,
) -> Result<u64, sqlx::Error> {
    Ok(sqlx::query(
        "UPDATE servers SET validation_token_hash = NULL, updated_at = ?
         WHERE id = ? AND validation_token_hash = ?",
    )
    .bind(Utc::now())
    .bind(id)
    .bind(expected_hash)
    .execute(conn)
    .await?
    .rows_affected())
}

/// Delete a server that has already entered `removing`.
pub(crate) async fn delete_removing_in(
    conn: &mut SqliteConnection,
    id: ServerId,
) -> Result<u64, sqlx::Error> {
    Ok(sqlx::query("DELETE FROM servers WHERE id = ? AND state = ?")
        .bind(id)
        .bind(ServerState::Removing.as_str())
        .execute(conn)
        .await?
        .rows_affected())
}

/// Servers whose node belongs to `region_id`.
pub(crate) async fn count_in_region_in(
    conn: &mut SqliteConnection,
    region_id: RegionId,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM servers s JOIN nodes n ON n.id = s.node_id WHERE n.region_id = ?",
    )
    .bind(region_id)
    .fetch_one(conn)
    .await
}
