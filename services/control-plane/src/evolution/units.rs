//! Unit shapes across schema versions.
//!
//! Version 1 units carried one `docker_image` and nothing else. Version 2
//! adds a labelled image list with a default, a feature list and a
//! versioned `meta` record. Rows of either shape (and rows half-written by
//! processes running an older build) are reconciled into [`UnitShape`] by
//! [`UnitShape::reconcile`], which the backfill and every read share.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use thiserror::Error;
use tracing::debug;

use super::{ColumnSpec, EvolutionError, TableUpgrade};

/// Version written into every `meta` record by this build.
pub const UNIT_SCHEMA_VERSION: u64 = 2;

const LEGACY_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShapeError {
    #[error("unit meta version {0} is newer than this build understands")]
    UnknownVersion(u64),

    #[error("column {column} is malformed: {reason}")]
    Malformed {
        column: &'static str,
        reason: String,
    },

    #[error("unit has no docker image")]
    NoImages,
}

// =============================================================================
// Records
// =============================================================================

/// A selectable container image.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DockerImage {
    pub label: String,
    pub image: String,
}

impl DockerImage {
    pub fn new(label: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            image: image.into(),
        }
    }

    /// Label a bare image reference by its last path segment,
    /// `ghcr.io/yolks/java:17` becoming `java:17`.
    pub fn from_reference(image: &str) -> Self {
        let label = image.rsplit('/').next().unwrap_or(image);
        Self::new(label, image)
    }
}

/// Free-form unit metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnitMeta {
    pub update_url: Option<String>,
    pub file_denylist: Vec<String>,
    /// Schema version the unit was upgraded from, if it was.
    pub upgraded_from: Option<u64>,
}

#[derive(Deserialize)]
struct MetaV1 {
    #[serde(default)]
    update_url: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct MetaV2 {
    version: u64,
    #[serde(default)]
    update_url: Option<String>,
    #[serde(default)]
    file_denylist: Vec<String>,
    #[serde(default)]
    upgraded_from: Option<u64>,
}

impl UnitMeta {
    /// Decode a stored record by its `version` field.
    pub fn decode(raw: &str) -> Result<Self, ShapeError> {
        let malformed = |e: serde_json::Error| ShapeError::Malformed {
            column: "meta",
            reason: e.to_string(),
        };
        let value: Value = serde_json::from_str(raw).map_err(malformed)?;
        let version = value
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| ShapeError::Malformed {
                column: "meta",
                reason: "missing version".to_string(),
            })?;

        match version {
            LEGACY_SCHEMA_VERSION => {
                let v1: MetaV1 = serde_json::from_value(value).map_err(malformed)?;
                Ok(Self {
                    update_url: v1.update_url,
                    file_denylist: Vec::new(),
                    upgraded_from: Some(LEGACY_SCHEMA_VERSION),
                })
            }
            UNIT_SCHEMA_VERSION => {
                let v2: MetaV2 = serde_json::from_value(value).map_err(malformed)?;
                Ok(Self {
                    update_url: v2.update_url,
                    file_denylist: v2.file_denylist,
                    upgraded_from: v2.upgraded_from,
                })
            }
            other => Err(ShapeError::UnknownVersion(other)),
        }
    }

    /// Encode at the current version.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&MetaV2 {
            version: UNIT_SCHEMA_VERSION,
            update_url: self.update_url.clone(),
            file_denylist: self.file_denylist.clone(),
            upgraded_from: self.upgraded_from,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredImage {
    Labeled(DockerImage),
    Bare(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StoredFeatures {
    List(Vec<String>),
    Flags(std::collections::BTreeMap<String, bool>),
}

fn decode_images(raw: &str) -> Result<Vec<DockerImage>, ShapeError> {
    let stored: Vec<StoredImage> =
        serde_json::from_str(raw).map_err(|e| ShapeError::Malformed {
            column: "docker_images",
            reason: e.to_string(),
        })?;
    Ok(stored
        .into_iter()
        .map(|image| match image {
            StoredImage::Labeled(image) => image,
            StoredImage::Bare(reference) => DockerImage::from_reference(&reference),
        })
        .collect())
}

fn decode_features(raw: &str) -> Result<Vec<String>, ShapeError> {
    let stored: StoredFeatures = serde_json::from_str(raw).map_err(|e| ShapeError::Malformed {
        column: "features",
        reason: e.to_string(),
    })?;
    Ok(match stored {
        StoredFeatures::List(features) => features,
        StoredFeatures::Flags(flags) => flags
            .into_iter()
            .filter_map(|(name, enabled)| enabled.then_some(name))
            .collect(),
    })
}

// =============================================================================
// Reconciliation
// =============================================================================

/// The image, feature and meta columns of a unit row as stored.
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredUnitShape<'a> {
    pub docker_image: Option<&'a str>,
    pub docker_images: Option<&'a str>,
    pub default_docker_image: Option<&'a str>,
    pub features: Option<&'a str>,
    pub meta: Option<&'a str>,
}

impl StoredUnitShape<'_> {
    /// Whether any current-shape column is still unset.
    pub fn is_incomplete(&self) -> bool {
        self.docker_images.is_none()
            || self.default_docker_image.is_none()
            || self.features.is_none()
            || self.meta.is_none()
    }
}

/// Current-shape view of a unit's evolving fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitShape {
    pub docker_images: Vec<DockerImage>,
    pub default_docker_image: String,
    pub features: Vec<String>,
    pub meta: UnitMeta,
}

impl UnitShape {
    /// Build the current shape from whatever the row holds.
    ///
    /// - no image list: the legacy `docker_image` becomes a one-entry list
    /// - no usable default: the legacy image if listed, else the first image
    /// - no features: empty
    /// - no meta: an empty record marked as upgraded from version 1
    pub fn reconcile(stored: &StoredUnitShape<'_>) -> Result<Self, ShapeError> {
        let legacy = stored.docker_image.filter(|image| !image.trim().is_empty());

        let mut docker_images = match stored.docker_images {
            Some(raw) => decode_images(raw)?,
            None => Vec::new(),
        };
        if docker_images.is_empty() {
            docker_images = legacy
                .map(|image| vec![DockerImage::from_reference(image)])
                .ok_or(ShapeError::NoImages)?;
        }

        let listed = |image: &str| docker_images.iter().any(|d| d.image == image);
        let default_docker_image = stored
            .default_docker_image
            .filter(|image| listed(*image))
            .or_else(|| legacy.filter(|image| listed(*image)))
            .map(str::to_string)
            .unwrap_or_else(|| docker_images[0].image.clone());

        let features = match stored.features {
            Some(raw) => decode_features(raw)?,
            None => Vec::new(),
        };

        let meta = match stored.meta {
            Some(raw) => UnitMeta::decode(raw)?,
            None => UnitMeta {
                upgraded_from: Some(LEGACY_SCHEMA_VERSION),
                ..UnitMeta::default()
            },
        };

        Ok(Self {
            docker_images,
            default_docker_image,
            features,
            meta,
        })
    }
}

// =============================================================================
// Table Upgrade
// =============================================================================

const UNIT_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec {
        name: "docker_images",
        definition: "TEXT",
    },
    ColumnSpec {
        name: "default_docker_image",
        definition: "TEXT",
    },
    ColumnSpec {
        name: "features",
        definition: "TEXT",
    },
    ColumnSpec {
        name: "meta",
        definition: "TEXT",
    },
];

/// Brings `units` from the single-image shape to the current one.
pub struct UnitsUpgrade;

struct PendingRow {
    id: String,
    docker_image: Option<String>,
    docker_images: Option<String>,
    default_docker_image: Option<String>,
    features: Option<String>,
    meta: Option<String>,
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for PendingRow {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            docker_image: row.try_get("docker_image")?,
            docker_images: row.try_get("docker_images")?,
            default_docker_image: row.try_get("default_docker_image")?,
            features: row.try_get("features")?,
            meta: row.try_get("meta")?,
        })
    }
}

impl PendingRow {
    fn stored(&self) -> StoredUnitShape<'_> {
        StoredUnitShape {
            docker_image: self.docker_image.as_deref(),
            docker_images: self.docker_images.as_deref(),
            default_docker_image: self.default_docker_image.as_deref(),
            features: self.features.as_deref(),
            meta: self.meta.as_deref(),
        }
    }
}

#[async_trait]
impl TableUpgrade for UnitsUpgrade {
    fn table(&self) -> &'static str {
        "units"
    }

    fn columns(&self) -> &'static [ColumnSpec] {
        UNIT_COLUMNS
    }

    async fn backfill(&self, conn: &mut SqliteConnection) -> Result<u64, EvolutionError> {
        let rows: Vec<PendingRow> = sqlx::query_as(
            "SELECT id, docker_image, docker_images, default_docker_image, features, meta
             FROM units
             WHERE docker_images IS NULL OR default_docker_image IS NULL
                OR features IS NULL OR meta IS NULL
             ORDER BY id",
        )
        .fetch_all(&mut *conn)
        .await?;

        let mut written = 0;
        for row in &rows {
            let backfill_error = |reason: String| EvolutionError::Backfill {
                row_id: row.id.clone(),
                reason,
            };
            let shape = UnitShape::reconcile(&row.stored()).map_err(|e| backfill_error(e.to_string()))?;
            let images = serde_json::to_string(&shape.docker_images)
                .map_err(|e| backfill_error(e.to_string()))?;
            let features = serde_json::to_string(&shape.features)
                .map_err(|e| backfill_error(e.to_string()))?;
            let meta = shape.meta.encode().map_err(|e| backfill_error(e.to_string()))?;

            sqlx::query(
                "UPDATE units
                 SET docker_images = ?, default_docker_image = ?, features = ?, meta = ?
                 WHERE id = ?",
            )
            .bind(images)
            .bind(&shape.default_docker_image)
            .bind(features)
            .bind(meta)
            .bind(&row.id)
            .execute(&mut *conn)
            .await?;

            debug!(unit_id = %row.id, "Backfilled unit");
            written += 1;
        }

        Ok(written)
    }
}
