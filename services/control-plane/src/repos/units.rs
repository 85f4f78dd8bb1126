//! Units: templates describing how to install and run a kind of server.
//!
//! Every read and write first passes through [`SchemaEvolution`] so the
//! table is at its current shape, and every row read is reconciled with
//! [`UnitShape::reconcile`] in case another process wrote an older shape.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, SqliteConnection};
use tracing::{info, warn};
use warden_id::UnitId;

use super::{require_slug, require_text};
use crate::db::Database;
use crate::error::{Conflict, CoreError, CoreResult};
use crate::evolution::units::{DockerImage, StoredUnitShape, UnitMeta, UnitShape};
use crate::evolution::SchemaEvolution;

const UNITS_TABLE: &str = "units";

const UNIT_COLUMNS: &str = "id, name, short_name, description, docker_image, docker_images, \
     default_docker_image, startup, config, variables, install_script, features, meta, \
     created_at, updated_at";

/// An environment variable a unit exposes to its servers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitVariable {
    pub name: String,
    pub env_variable: String,
    #[serde(default)]
    pub default_value: String,
    #[serde(default)]
    pub user_viewable: bool,
    #[serde(default)]
    pub user_editable: bool,
    /// Validation rules, e.g. `required|string|max:20`.
    #[serde(default)]
    pub rules: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Unit {
    pub id: UnitId,
    pub name: String,
    pub short_name: String,
    pub description: Option<String>,
    pub docker_images: Vec<DockerImage>,
    pub default_docker_image: String,
    pub startup: String,
    pub config: Value,
    pub variables: Vec<UnitVariable>,
    pub install_script: Option<String>,
    pub features: Vec<String>,
    pub meta: UnitMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Unit {
    pub fn offers_image(&self, image: &str) -> bool {
        self.docker_images.iter().any(|d| d.image == image)
    }
}

/// A unit row before reconciliation.
struct UnitRow {
    id: UnitId,
    name: String,
    short_name: String,
    description: Option<String>,
    docker_image: Option<String>,
    docker_images: Option<String>,
    default_docker_image: Option<String>,
    startup: String,
    config: Json<Value>,
    variables: Json<Vec<UnitVariable>>,
    install_script: Option<String>,
    features: Option<String>,
    meta: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for UnitRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            short_name: row.try_get("short_name")?,
            description: row.try_get("description")?,
            docker_image: row.try_get("docker_image")?,
            docker_images: row.try_get("docker_images")?,
            default_docker_image: row.try_get("default_docker_image")?,
            startup: row.try_get("startup")?,
            config: row.try_get("config")?,
            variables: row.try_get("variables")?,
            install_script: row.try_get("install_script")?,
            features: row.try_get("features")?,
            meta: row.try_get("meta")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl UnitRow {
    fn into_unit(self) -> CoreResult<Unit> {
        let stored = StoredUnitShape {
            docker_image: self.docker_image.as_deref(),
            docker_images: self.docker_images.as_deref(),
            default_docker_image: self.default_docker_image.as_deref(),
            features: self.features.as_deref(),
            meta: self.meta.as_deref(),
        };
        if stored.is_incomplete() {
            warn!(unit_id = %self.id, "Unit row has an older shape; reconciling on read");
        }
        let shape = UnitShape::reconcile(&stored)
            .map_err(|e| CoreError::Internal(format!("unit {}: {e}", self.id)))?;

        Ok(Unit {
            id: self.id,
            name: self.name,
            short_name: self.short_name,
            description: self.description,
            docker_images: shape.docker_images,
            default_docker_image: shape.default_docker_image,
            startup: self.startup,
            config: self.config.0,
            variables: self.variables.0,
            install_script: self.install_script,
            features: shape.features,
            meta: shape.meta,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Desired state of a unit, keyed by `short_name`.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    pub name: String,
    pub short_name: String,
    pub description: Option<String>,
    pub docker_images: Vec<DockerImage>,
    /// Defaults to the first image.
    pub default_docker_image: Option<String>,
    pub startup: String,
    pub config: Value,
    pub variables: Vec<UnitVariable>,
    pub install_script: Option<String>,
    pub features: Vec<String>,
    pub update_url: Option<String>,
    pub file_denylist: Vec<String>,
}

impl UnitSpec {
    /// A minimal spec with one image.
    pub fn new(name: &str, short_name: &str, image: &str, startup: &str) -> Self {
        Self {
            name: name.to_string(),
            short_name: short_name.to_string(),
            description: None,
            docker_images: vec![DockerImage::from_reference(image)],
            default_docker_image: None,
            startup: startup.to_string(),
            config: Value::Object(Default::default()),
            variables: Vec::new(),
            install_script: None,
            features: Vec::new(),
            update_url: None,
            file_denylist: Vec::new(),
        }
    }

    fn validate(&self) -> CoreResult<()> {
        require_text("name", &self.name, 100)?;
        require_slug("short_name", &self.short_name, 64)?;
        require_text("startup", &self.startup, 4096)?;

        if self.docker_images.is_empty() {
            return Err(CoreError::invalid("docker_images", "at least one image is required"));
        }
        let mut labels = HashSet::new();
        for image in &self.docker_images {
            require_text("docker_images", &image.image, 255)?;
            require_text("docker_images", &image.label, 100)?;
            if !labels.insert(image.label.as_str()) {
                return Err(CoreError::invalid(
                    "docker_images",
                    format!("duplicate label {}", image.label),
                ));
            }
        }
        if let Some(default) = &self.default_docker_image {
            if !self.docker_images.iter().any(|d| &d.image == default) {
                return Err(CoreError::invalid(
                    "default_docker_image",
                    "must be one of the unit's images",
                ));
            }
        }

        let mut env = HashSet::new();
        for variable in &self.variables {
            let valid = !variable.env_variable.is_empty()
                && variable
                    .env_variable
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
            if !valid {
                return Err(CoreError::invalid(
                    "variables",
                    format!("{} is not an environment variable name", variable.env_variable),
                ));
            }
            if !env.insert(variable.env_variable.as_str()) {
                return Err(CoreError::invalid(
                    "variables",
                    format!("duplicate variable {}", variable.env_variable),
                ));
            }
        }
        Ok(())
    }

    fn default_image(&self) -> &str {
        self.default_docker_image
            .as_deref()
            .unwrap_or(&self.docker_images[0].image)
    }
}

#[derive(Clone)]
pub struct UnitRepo {
    db: Database,
    evolution: Arc<SchemaEvolution>,
}

impl UnitRepo {
    pub fn new(db: Database, evolution: Arc<SchemaEvolution>) -> Self {
        Self { db, evolution }
    }

    /// Create the unit named by `spec.short_name`, or replace its definition.
    pub async fn upsert(&self, spec: UnitSpec) -> CoreResult<Unit> {
        spec.validate()?;
        self.evolution.ensure(UNITS_TABLE).await?;

        self.db
            .timed(async {
                let mut tx = self.db.begin().await?;

                let existing = find_by_short_name_in(&mut tx, &spec.short_name).await?;
                let meta = UnitMeta {
                    update_url: spec.update_url.clone(),
                    file_denylist: spec.file_denylist.clone(),
                    upgraded_from: existing.as_ref().and_then(|u| u.meta.upgraded_from),
                };
                let now = Utc::now();
                let images = serde_json::to_string(&spec.docker_images)?;
                let features = serde_json::to_string(&spec.features)?;
                let meta = meta.encode()?;
                let default_image = spec.default_image();

                let id = match &existing {
                    Some(unit) => {
                        sqlx::query(
                            "UPDATE units SET name = ?, description = ?, docker_image = ?, docker_images = ?,
                                 default_docker_image = ?, startup = ?, config = ?, variables = ?,
                                 install_script = ?, features = ?, meta = ?, updated_at = ?
                             WHERE id = ?",
                        )
                        .bind(&spec.name)
                        .bind(&spec.description)
                        .bind(default_image)
                        .bind(&images)
                        .bind(default_image)
                        .bind(&spec.startup)
                        .bind(Json(&spec.config))
                        .bind(Json(&spec.variables))
                        .bind(&spec.install_script)
                        .bind(&features)
                        .bind(&meta)
                        .bind(now)
                        .bind(unit.id)
                        .execute(&mut *tx)
                        .await?;
                        unit.id
                    }
                    None => {
                        let id = UnitId::new();
                        sqlx::query(
                            "INSERT INTO units (id, name, short_name, description, docker_image, docker_images,
                                 default_docker_image, startup, config, variables, install_script, features,
                                 meta, created_at, updated_at)
                             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                        )
                        .bind(id)
                        .bind(&spec.name)
                        .bind(&spec.short_name)
                        .bind(&spec.description)
                        .bind(default_image)
                        .bind(&images)
                        .bind(default_image)
                        .bind(&spec.startup)
                        .bind(Json(&spec.config))
                        .bind(Json(&spec.variables))
                        .bind(&spec.install_script)
                        .bind(&features)
                        .bind(&meta)
                        .bind(now)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;
                        id
                    }
                };

                let unit = find_in(&mut tx, id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("unit", id))?;
                tx.commit().await?;

                info!(
                    unit_id = %unit.id,
                    short_name = %unit.short_name,
                    created = existing.is_none(),
                    "Unit upserted"
                );
                Ok(unit)
            })
            .await
    }

    pub async fn find(&self, id: UnitId) -> CoreResult<Option<Unit>> {
        self.evolution.ensure(UNITS_TABLE).await?;
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                find_in(&mut conn, id).await
            })
            .await
    }

    pub async fn get(&self, id: UnitId) -> CoreResult<Unit> {
        self.find(id)
            .await?
            .ok_or_else(|| CoreError::not_found("unit", id))
    }

    pub async fn find_by_short_name(&self, short_name: &str) -> CoreResult<Option<Unit>> {
        self.evolution.ensure(UNITS_TABLE).await?;
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                find_by_short_name_in(&mut conn, short_name).await
            })
            .await
    }

    pub async fn list(&self) -> CoreResult<Vec<Unit>> {
        self.evolution.ensure(UNITS_TABLE).await?;
        self.db
            .timed(async {
                let rows = sqlx::query_as::<_, UnitRow>(&format!(
                    "SELECT {UNIT_COLUMNS} FROM units ORDER BY short_name"
                ))
                .fetch_all(self.db.pool())
                .await?;
                rows.into_iter().map(UnitRow::into_unit).collect()
            })
            .await
    }

    /// Delete a unit no server uses.
    pub async fn delete(&self, id: UnitId) -> CoreResult<()> {
        self.evolution.ensure(UNITS_TABLE).await?;
        self.db
            .timed(async {
                let mut tx = self.db.begin().await?;

                let in_use: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM servers WHERE unit_id = ?")
                    .bind(id)
                    .fetch_one(&mut *tx)
                    .await?;
                if in_use > 0 {
                    return Err(Conflict::InUse {
                        entity: "unit",
                        id: id.to_string(),
                        count: in_use,
                    }
                    .into());
                }

                let deleted = sqlx::query("DELETE FROM units WHERE id = ?")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();
                if deleted == 0 {
                    return Err(CoreError::not_found("unit", id));
                }

                tx.commit().await?;
                info!(unit_id = %id, "Unit deleted");
                Ok(())
            })
            .await
    }
}

async fn find_in(conn: &mut SqliteConnection, id: UnitId) -> CoreResult<Option<Unit>> {
    sqlx::query_as::<_, UnitRow>(&format!("SELECT {UNIT_COLUMNS} FROM units WHERE id = ?"))
        .bind(id)
        .fetch_optional(conn)
        .await?
        .map(UnitRow::into_unit)
        .transpose()
}

async fn find_by_short_name_in(
    conn: &mut SqliteConnection,
    short_name: &str,
) -> CoreResult<Option<Unit>> {
    sqlx::query_as::<_, UnitRow>(&format!(
        "SELECT {UNIT_COLUMNS} FROM units WHERE short_name = ?"
    ))
    .bind(short_name)
    .fetch_optional(conn)
    .await?
    .map(UnitRow::into_unit)
    .transpose()
}
