//! Projects: user-owned groupings of servers. Each user has at most one
//! default project, created on demand.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::info;
use warden_id::{ProjectId, UserId};

use super::require_text;
use crate::db::Database;
use crate::error::{on_foreign_key, CoreError, CoreResult};

const PROJECT_COLUMNS: &str = "id, owner_id, name, description, is_default, created_at, updated_at";

pub const DEFAULT_PROJECT_NAME: &str = "Default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Project {
    pub id: ProjectId,
    pub owner_id: UserId,
    pub name: String,
    pub description: Option<String>,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for Project {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            is_default: row.try_get("is_default")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewProject {
    pub owner_id: UserId,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Clone)]
pub struct ProjectRepo {
    db: Database,
}

impl ProjectRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewProject) -> CoreResult<Project> {
        require_text("name", &new.name, 100)?;
        self.db
            .timed(async {
                let now = Utc::now();
                let project = sqlx::query_as::<_, Project>(&format!(
                    "INSERT INTO projects (id, owner_id, name, description, is_default, created_at, updated_at)
                     VALUES (?, ?, ?, ?, 0, ?, ?)
                     RETURNING {PROJECT_COLUMNS}"
                ))
                .bind(ProjectId::new())
                .bind(new.owner_id)
                .bind(&new.name)
                .bind(&new.description)
                .bind(now)
                .bind(now)
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| on_foreign_key(e, || CoreError::not_found("user", new.owner_id)))?;

                info!(project_id = %project.id, owner_id = %project.owner_id, "Project created");
                Ok(project)
            })
            .await
    }

    /// The owner's default project, created if missing. Idempotent under
    /// concurrent callers.
    pub async fn ensure_default(&self, owner_id: UserId) -> CoreResult<Project> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                ensure_default_in(&mut conn, owner_id).await
            })
            .await
    }

    pub async fn find(&self, id: ProjectId) -> CoreResult<Option<Project>> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                find_in(&mut conn, id).await
            })
            .await
    }

    pub async fn list_for_owner(&self, owner_id: UserId) -> CoreResult<Vec<Project>> {
        self.db
            .timed(async {
                Ok(sqlx::query_as::<_, Project>(&format!(
                    "SELECT {PROJECT_COLUMNS} FROM projects WHERE owner_id = ?
                     ORDER BY is_default DESC, name"
                ))
                .bind(owner_id)
                .fetch_all(self.db.pool())
                .await?)
            })
            .await
    }

    /// Delete a non-default project. Its servers stay, without a project.
    pub async fn delete(&self, id: ProjectId) -> CoreResult<()> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                let project = find_in(&mut conn, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("project", id))?;
                if project.is_default {
                    return Err(CoreError::invalid(
                        "project",
                        "the default project cannot be deleted",
                    ));
                }
                sqlx::query("DELETE FROM projects WHERE id = ?")
                    .bind(id)
                    .execute(&mut *conn)
                    .await?;
                info!(project_id = %id, "Project deleted");
                Ok(())
            })
            .await
    }
}

pub(crate) async fn find_in(
    conn: &mut SqliteConnection,
    id: ProjectId,
) -> CoreResult<Option<Project>> {
    Ok(sqlx::query_as::<_, Project>(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?)
}

pub(crate) async fn ensure_default_in(
    conn: &mut SqliteConnection,
    owner_id: UserId,
) -> CoreResult<Project> {
    let now = Utc::now();
    let inserted = sqlx::query(
        "INSERT INTO projects (id, owner_id, name, description, is_default, created_at, updated_at)
         VALUES (?, ?, ?, NULL, 1, ?, ?)
         ON CONFLICT (owner_id) WHERE is_default = 1 DO NOTHING",
    )
    .bind(ProjectId::new())
    .bind(owner_id)
    .bind(DEFAULT_PROJECT_NAME)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| on_foreign_key(e, || CoreError::not_found("user", owner_id)))?
    .rows_affected();

    if inserted > 0 {
        info!(owner_id = %owner_id, "Default project created");
    }

    sqlx::query_as::<_, Project>(&format!(
        "SELECT {PROJECT_COLUMNS} FROM projects WHERE owner_id = ? AND is_default = 1"
    ))
    .bind(owner_id)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| CoreError::Internal(format!("default project for {owner_id} vanished")))
}
