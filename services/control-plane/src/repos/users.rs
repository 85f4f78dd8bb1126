//! Users: owners of servers, projects, API keys and cargo.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::info;
use warden_id::UserId;

use super::{require_slug, require_text};
use crate::db::{Database, UpdateBuilder};
use crate::error::{on_unique, Conflict, CoreError, CoreResult};

const USER_COLUMNS: &str = "id, username, email, password_hash, is_admin, created_at, updated_at";

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for User {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            username: row.try_get("username")?,
            email: row.try_get("email")?,
            password_hash: row.try_get("password_hash")?,
            is_admin: row.try_get("is_admin")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    /// Already hashed by the authentication layer.
    pub password_hash: String,
    pub is_admin: bool,
}

impl NewUser {
    fn validate(&self) -> CoreResult<()> {
        require_slug("username", &self.username, 64)?;
        validate_email(&self.email)?;
        require_text("password_hash", &self.password_hash, 512)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password_hash: Option<String>,
    pub is_admin: Option<bool>,
}

fn validate_email(email: &str) -> CoreResult<()> {
    require_text("email", email, 254)?;
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(()),
        _ => Err(CoreError::invalid("email", "not an email address")),
    }
}

#[derive(Clone)]
pub struct UserRepo {
    db: Database,
}

impl UserRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewUser) -> CoreResult<User> {
        new.validate()?;
        self.db
            .timed(async {
                let now = Utc::now();
                let user = sqlx::query_as::<_, User>(&format!(
                    "INSERT INTO users (id, username, email, password_hash, is_admin, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     RETURNING {USER_COLUMNS}"
                ))
                .bind(UserId::new())
                .bind(&new.username)
                .bind(&new.email)
                .bind(&new.password_hash)
                .bind(new.is_admin)
                .bind(now)
                .bind(now)
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| {
                    on_unique(e, || Conflict::AlreadyExists {
                        entity: "user",
                        detail: format!("username {} or email {}", new.username, new.email),
                    })
                })?;

                info!(user_id = %user.id, username = %user.username, "User created");
                Ok(user)
            })
            .await
    }

    pub async fn find(&self, id: UserId) -> CoreResult<Option<User>> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                find_in(&mut conn, id).await
            })
            .await
    }

    pub async fn get(&self, id: UserId) -> CoreResult<User> {
        self.find(id)
            .await?
            .ok_or_else(|| CoreError::not_found("user", id))
    }

    pub async fn find_by_username(&self, username: &str) -> CoreResult<Option<User>> {
        self.db
            .timed(async {
                Ok(sqlx::query_as::<_, User>(&format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE username = ?"
                ))
                .bind(username)
                .fetch_optional(self.db.pool())
                .await?)
            })
            .await
    }

    pub async fn list(&self) -> CoreResult<Vec<User>> {
        self.db
            .timed(async {
                Ok(sqlx::query_as::<_, User>(&format!(
                    "SELECT {USER_COLUMNS} FROM users ORDER BY username"
                ))
                .fetch_all(self.db.pool())
                .await?)
            })
            .await
    }

    pub async fn update(&self, id: UserId, update: UserUpdate) -> CoreResult<User> {
        if let Some(username) = &update.username {
            require_slug("username", username, 64)?;
        }
        if let Some(email) = &update.email {
            validate_email(email)?;
        }
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                let mut builder = UpdateBuilder::new("users");
                builder
                    .set_opt("username", update.username.clone())
                    .set_opt("email", update.email.clone())
                    .set_opt("password_hash", update.password_hash.clone())
                    .set_opt("is_admin", update.is_admin);
                if !builder.is_empty() {
                    builder.execute(id, &mut conn).await.map_err(|e| {
                        on_unique(e, || Conflict::AlreadyExists {
                            entity: "user",
                            detail: "username or email taken".to_string(),
                        })
                    })?;
                }
                find_in(&mut conn, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("user", id))
            })
            .await
    }

    /// Delete a user together with their projects, API keys and cargo.
    ///
    /// Refused while the user still owns servers; those must be deleted
    /// (releasing their allocations) first.
    pub async fn delete(&self, id: UserId) -> CoreResult<()> {
        self.db
            .timed(async {
                let mut tx = self.db.begin().await?;

                let owned: i64 =
                    sqlx::query_scalar("SELECT COUNT(*) FROM servers WHERE owner_id = ?")
                        .bind(id)
                        .fetch_one(&mut *tx)
                        .await?;
                if owned > 0 {
                    return Err(Conflict::InUse {
                        entity: "user",
                        id: id.to_string(),
                        count: owned,
                    }
                    .into());
                }

                let deleted = sqlx::query("DELETE FROM users WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if deleted == 0 {
                    return Err(CoreError::not_found("user", id));
                }

                tx.commit().await?;
                info!(user_id = %id, "User deleted");
                Ok(())
            })
            .await
    }
}

pub(crate) async fn find_in(conn: &mut SqliteConnection, id: UserId) -> CoreResult<Option<User>> {
    Ok(sqlx::query_as::<_, User>(&format!(
        "SELECT {USER_COLUMNS} FROM users WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?)
}
