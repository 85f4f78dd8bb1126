//! Cargo: metadata for user-uploaded files that can be shipped to servers.
//! The bytes themselves live outside the store.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::info;
use warden_id::{CargoItemId, UserId};

use super::require_text;
use crate::db::{Database, DbError};
use crate::error::{Conflict, CoreError, CoreResult};

const CARGO_COLUMNS: &str = "id, owner_id, name, size_bytes, sha256, mime_type, created_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CargoItem {
    pub id: CargoItemId,
    pub owner_id: UserId,
    pub name: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub mime_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for CargoItem {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        let size_bytes: i64 = row.try_get("size_bytes")?;
        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            size_bytes: u64::try_from(size_bytes)
                .map_err(|_| super::decode_error(format!("negative size {size_bytes}")))?,
            sha256: row.try_get("sha256")?,
            mime_type: row.try_get("mime_type")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewCargoItem {
    pub owner_id: UserId,
    pub name: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the content.
    pub sha256: String,
    pub mime_type: Option<String>,
}

impl NewCargoItem {
    fn validate(&self) -> CoreResult<()> {
        require_text("name", &self.name, 255)?;
        if self.name.contains('/') || self.name.contains('\\') {
            return Err(CoreError::invalid("name", "must not contain path separators"));
        }
        if self.sha256.len() != 64 || hex::decode(&self.sha256).is_err() {
            return Err(CoreError::invalid("sha256", "must be 64 hex characters"));
        }
        if i64::try_from(self.size_bytes).is_err() {
            return Err(CoreError::invalid("size_bytes", "too large"));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct CargoRepo {
    db: Database,
}

impl CargoRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewCargoItem) -> CoreResult<CargoItem> {
        new.validate()?;
        self.db
            .timed(async {
                let item = sqlx::query_as::<_, CargoItem>(&format!(
                    "INSERT INTO cargo_items (id, owner_id, name, size_bytes, sha256, mime_type, created_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?)
                     RETURNING {CARGO_COLUMNS}"
                ))
                .bind(CargoItemId::new())
                .bind(new.owner_id)
                .bind(&new.name)
                .bind(new.size_bytes as i64)
                .bind(new.sha256.to_ascii_lowercase())
                .bind(&new.mime_type)
                .bind(Utc::now())
                .fetch_one(self.db.pool())
                .await
                .map_err(|e| {
                    let err = DbError::Query(e);
                    if err.is_foreign_key_violation() {
                        CoreError::not_found("user", new.owner_id)
                    } else if err.is_unique_violation() {
                        Conflict::AlreadyExists {
                            entity: "cargo item",
                            detail: format!("name {}", new.name),
                        }
                        .into()
                    } else {
                        err.into()
                    }
                })?;

                info!(cargo_id = %item.id, owner_id = %item.owner_id, size_bytes = item.size_bytes, "Cargo item recorded");
                Ok(item)
            })
            .await
    }

    pub async fn list_for_owner(&self, owner_id: UserId) -> CoreResult<Vec<CargoItem>> {
        self.db
            .timed(async {
                Ok(sqlx::query_as::<_, CargoItem>(&format!(
                    "SELECT {CARGO_COLUMNS} FROM cargo_items WHERE owner_id = ? ORDER BY name"
                ))
                .bind(owner_id)
                .fetch_all(self.db.pool())
                .await?)
            })
            .await
    }

    pub async fn delete(&self, id: CargoItemId) -> CoreResult<()> {
        self.db
            .timed(async {
                let deleted = sqlx::query("DELETE FROM cargo_items WHERE id = ?")
                    .bind(id)
                    .execute(self.db.pool())
                    .await?
                    .rows_affected();
                if deleted == 0 {
                    return Err(CoreError::not_found("cargo item", id));
                }
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cargo_validation() {
        let item = NewCargoItem {
            owner_id: UserId::new(),
            name: "world.zip".into(),
            size_bytes: 1_048_576,
            sha256: "ab".repeat(32),
            mime_type: Some("application/zip".into()),
        };
        assert!(item.validate().is_ok());
        assert!(NewCargoItem {
            name: "../etc/passwd".into(),
            ..item.clone()
        }
        .validate()
        .is_err());
        assert!(NewCargoItem {
            sha256: "xyz".into(),
            ..item
        }
        .validate()
        .is_err());
    }
}
