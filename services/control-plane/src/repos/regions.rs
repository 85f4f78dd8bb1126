//! Regions: named groups of nodes with an optional capacity cap and a
//! fallback region consulted when they cannot place a server.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use tracing::info;
use warden_id::RegionId;

use super::{require_slug, require_text};
use crate::db::{Database, UpdateBuilder};
use crate::error::{on_unique, Conflict, CoreError, CoreResult};

const REGION_COLUMNS: &str =
    "id, name, identifier, country_code, fallback_region_id, server_limit, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Region {
    pub id: RegionId,
    pub name: String,
    pub identifier: String,
    pub country_code: Option<String>,
    pub fallback_region_id: Option<RegionId>,
    /// Maximum servers across the region's nodes. `None` is unlimited.
    pub server_limit: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for Region {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            identifier: row.try_get("identifier")?,
            country_code: row.try_get("country_code")?,
            fallback_region_id: row.try_get("fallback_region_id")?,
            server_limit: row.try_get("server_limit")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewRegion {
    pub name: String,
    pub identifier: String,
    pub country_code: Option<String>,
    pub fallback_region_id: Option<RegionId>,
    pub server_limit: Option<i64>,
}

/// Field updates. The nested options distinguish "leave alone" (`None`)
/// from "clear" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct RegionUpdate {
    pub name: Option<String>,
    pub identifier: Option<String>,
    pub country_code: Option<Option<String>>,
    pub fallback_region_id: Option<Option<RegionId>>,
    pub server_limit: Option<Option<i64>>,
}

fn normalize_country(code: &str) -> CoreResult<String> {
    if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
        Ok(code.to_ascii_uppercase())
    } else {
        Err(CoreError::invalid("country_code", "must be an ISO 3166-1 alpha-2 code"))
    }
}

fn validate_limit(limit: Option<i64>) -> CoreResult<()> {
    match limit {
        Some(n) if n < 0 => Err(CoreError::invalid("server_limit", "must not be negative")),
        _ => Ok(()),
    }
}

#[derive(Clone)]
pub struct RegionRepo {
    db: Database,
}

impl RegionRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, new: NewRegion) -> CoreResult<Region> {
        require_text("name", &new.name, 100)?;
        require_slug("identifier", &new.identifier, 32)?;
        validate_limit(new.server_limit)?;
        let country_code = new.country_code.as_deref().map(normalize_country).transpose()?;

        self.db
            .timed(async {
                let mut tx = self.db.begin().await?;

                // A new region cannot close a cycle: nothing points at it yet.
                if let Some(fallback) = new.fallback_region_id {
                    if find_in(&mut tx, fallback).await?.is_none() {
                        return Err(CoreError::not_found("region", fallback));
                    }
                }

                let now = Utc::now();
                let region = sqlx::query_as::<_, Region>(&format!(
                    "INSERT INTO regions (id, name, identifier, country_code, fallback_region_id, server_limit, created_at, updated_at)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                     RETURNING {REGION_COLUMNS}"
                ))
                .bind(RegionId::new())
                .bind(&new.name)
                .bind(&new.identifier)
                .bind(&country_code)
                .bind(new.fallback_region_id)
                .bind(new.server_limit)
                .bind(now)
                .bind(now)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| {
                    on_unique(e, || Conflict::AlreadyExists {
                        entity: "region",
                        detail: format!("identifier {}", new.identifier),
                    })
                })?;

                tx.commit().await?;
                info!(region_id = %region.id, identifier = %region.identifier, "Region created");
                Ok(region)
            })
            .await
    }

    pub async fn find(&self, id: RegionId) -> CoreResult<Option<Region>> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                find_in(&mut conn, id).await
            })
            .await
    }

    pub async fn get(&self, id: RegionId) -> CoreResult<Region> {
        self.find(id)
            .await?
            .ok_or_else(|| CoreError::not_found("region", id))
    }

    pub async fn list(&self) -> CoreResult<Vec<Region>> {
        self.db
            .timed(async {
                Ok(sqlx::query_as::<_, Region>(&format!(
                    "SELECT {REGION_COLUMNS} FROM regions ORDER BY identifier"
                ))
                .fetch_all(self.db.pool())
                .await?)
            })
            .await
    }

    /// Update a region. Pointing the fallback at a region whose own chain
    /// leads back here is refused with [`Conflict::FallbackCycle`].
    pub async fn update(&self, id: RegionId, update: RegionUpdate) -> CoreResult<Region> {
        if let Some(name) = &update.name {
            require_text("name", name, 100)?;
        }
        if let Some(identifier) = &update.identifier {
            require_slug("identifier", identifier, 32)?;
        }
        if let Some(limit) = update.server_limit {
            validate_limit(limit)?;
        }
        let country_code = match &update.country_code {
            Some(Some(code)) => Some(Some(normalize_country(code)?)),
            Some(None) => Some(None),
            None => None,
        };

        self.db
            .timed(async {
                let mut tx = self.db.begin().await?;

                if find_in(&mut tx, id).await?.is_none() {
                    return Err(CoreError::not_found("region", id));
                }
                if let Some(Some(fallback)) = update.fallback_region_id {
                    ensure_acyclic_in(&mut tx, id, fallback).await?;
                }

                let mut builder = UpdateBuilder::new("regions");
                builder
                    .set_opt("name", update.name.clone())
                    .set_opt("identifier", update.identifier.clone())
                    .set_opt("country_code", country_code)
                    .set_opt("fallback_region_id", update.fallback_region_id)
                    .set_opt("server_limit", update.server_limit);
                if !builder.is_empty() {
                    builder.execute(id, &mut tx).await.map_err(|e| {
                        on_unique(e, || Conflict::AlreadyExists {
                            entity: "region",
                            detail: "identifier taken".to_string(),
                        })
                    })?;
                }

                let region = find_in(&mut tx, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("region", id))?;
                tx.commit().await?;
                info!(region_id = %id, "Region updated");
                Ok(region)
            })
            .await
    }

    /// Delete a region. Its nodes become unassigned and regions falling back
    /// to it lose their fallback.
    pub async fn delete(&self, id: RegionId) -> CoreResult<()> {
        self.db
            .timed(async {
                let deleted = sqlx::query("DELETE FROM regions WHERE id = ?")
                    .bind(id)
                    .execute(self.db.pool())
                    .await?
                    .rows_affected();
                if deleted == 0 {
                    return Err(CoreError::not_found("region", id));
                }
                info!(region_id = %id, "Region deleted");
                Ok(())
            })
            .await
    }
}

pub(crate) async fn find_in(
    conn: &mut SqliteConnection,
    id: RegionId,
) -> CoreResult<Option<Region>> {
    Ok(sqlx::query_as::<_, Region>(&format!(
        "SELECT {REGION_COLUMNS} FROM regions WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await?)
}

/// Walk the fallback chain starting at `fallback` and refuse if it reaches
/// `region` (or loops on itself, which only a pre-existing cycle can do).
async fn ensure_acyclic_in(
    conn: &mut SqliteConnection,
    region: RegionId,
    fallback: RegionId,
) -> CoreResult<()> {
    let mut seen = HashSet::from([region]);
    let mut next = Some(fallback);

    while let Some(current) = next {
        if !seen.insert(current) {
            return Err(Conflict::FallbackCycle { region_id: region }.into());
        }
        let hop = find_in(conn, current)
            .await?
            .ok_or_else(|| CoreError::not_found("region", current))?;
        next = hop.fallback_region_id;
    }

    Ok(())
}
