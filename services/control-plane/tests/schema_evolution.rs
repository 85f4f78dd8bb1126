mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::{database, init_tracing, Harness};
use sqlx::SqliteConnection;
use warden_control_plane::db::{Database, DbConfig};
use warden_control_plane::evolution::units::{DockerImage, UNIT_SCHEMA_VERSION};
use warden_control_plane::evolution::{
    table_columns, ColumnSpec, EvolutionError, SchemaEvolution, TableUpgrade,
};
use warden_control_plane::repos::UnitSpec;
use warden_control_plane::{ControlPlane, CoreError, ErrorKind};
use warden_id::UnitId;

const LEGACY_UNITS: &str = r#"
CREATE TABLE units (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    short_name TEXT NOT NULL UNIQUE,
    description TEXT,
    docker_image TEXT,
    startup TEXT NOT NULL,
    config TEXT NOT NULL DEFAULT '{}',
    variables TEXT NOT NULL DEFAULT '[]',
    install_script TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
)
"#;

async fn insert_legacy_unit(db: &Database, short_name: &str, image: &str) -> UnitId {
    let id = UnitId::new();
    sqlx::query(
        "INSERT INTO units (id, name, short_name, docker_image, startup, created_at, updated_at)
         VALUES (?, ?, ?, ?, 'java -jar server.jar', ?, ?)",
    )
    .bind(id)
    .bind(short_name.to_uppercase())
    .bind(short_name)
    .bind(image)
    .bind(Utc::now())
    .bind(Utc::now())
    .execute(db.pool())
    .await
    .unwrap();
    id
}

async fn legacy_database() -> Database {
    init_tracing();
    let db = database().await;
    sqlx::query(LEGACY_UNITS).execute(db.pool()).await.unwrap();
    db
}

async fn unit_columns(db: &Database) -> std::collections::HashSet<String> {
    let mut conn = db.acquire().await.unwrap();
    table_columns(&mut conn, "units").await.unwrap()
}

#[tokio::test]
async fn test_legacy_units_are_upgraded_on_first_use() {
    let db = legacy_database().await;
    let paper = insert_legacy_unit(&db, "paper", "ghcr.io/warden/yolks:java_17").await;
    insert_legacy_unit(&db, "velocity", "ghcr.io/warden/yolks:java_21").await;
    db.apply_schema().await.unwrap();

    assert!(!unit_columns(&db).await.contains("docker_images"));

    let plane = ControlPlane::new(db.clone());
    let unit = plane.units().get(paper).await.unwrap();

    assert_eq!(
        unit.docker_images,
        vec![DockerImage::new("yolks:java_17", "ghcr.io/warden/yolks:java_17")]
    );
    assert_eq!(unit.default_docker_image, "ghcr.io/warden/yolks:java_17");
    assert!(unit.offers_image(&unit.default_docker_image));
    assert_eq!(unit.meta.upgraded_from, Some(1));

    let columns = unit_columns(&db).await;
    for column in ["docker_images", "default_docker_image", "features", "meta"] {
        assert!(columns.contains(column), "missing column {column}");
    }

    // Every legacy row now carries the version marker.
    let metas: Vec<String> = sqlx::query_scalar("SELECT meta FROM units ORDER BY short_name")
        .fetch_all(db.pool())
        .await
        .unwrap();
    assert_eq!(metas.len(), 2);
    for meta in metas {
        let meta: serde_json::Value = serde_json::from_str(&meta).unwrap();
        assert_eq!(meta["version"], UNIT_SCHEMA_VERSION);
    }
}

#[tokio::test]
async fn test_evolution_is_a_no_op_once_current() {
    let db = legacy_database().await;
    insert_legacy_unit(&db, "paper", "ghcr.io/warden/yolks:java_17").await;
    db.apply_schema().await.unwrap();

    let first = SchemaEvolution::new(db.clone()).ensure_all().await.unwrap();
    assert_eq!(first[0].table, "units");
    assert_eq!(first[0].added_columns.len(), 4);
    assert_eq!(first[0].backfilled_rows, 1);

    // A fresh process sees nothing left to do.
    let second = SchemaEvolution::new(db.clone()).ensure_all().await.unwrap();
    assert!(second[0].added_columns.is_empty());
    assert_eq!(second[0].backfilled_rows, 0);
}

#[tokio::test]
async fn test_failed_backfill_restores_table_and_is_remembered() {
    init_tracing();
    let db = database().await;
    sqlx::query(LEGACY_UNITS).execute(db.pool()).await.unwrap();
    sqlx::query("ALTER TABLE units ADD COLUMN meta TEXT")
        .execute(db.pool())
        .await
        .unwrap();
    let id = insert_legacy_unit(&db, "paper", "ghcr.io/warden/yolks:java_17").await;
    sqlx::query("UPDATE units SET meta = '{\"version\":9}' WHERE id = ?")
        .bind(id)
        .execute(db.pool())
        .await
        .unwrap();
    db.apply_schema().await.unwrap();

    let before = unit_columns(&db).await;
    let plane = ControlPlane::new(db.clone());

    let err = plane.units().list().await.unwrap_err();
    assert!(matches!(err, CoreError::MigrationFailed { table: "units", .. }));
    assert_eq!(err.kind(), ErrorKind::MigrationFailed);
    assert!(!err.is_retryable());

    // Columns added before the failure were rolled back with it.
    assert_eq!(unit_columns(&db).await, before);
    assert!(!before.contains("docker_images"));

    // The outcome is cached for the life of the process.
    let err = plane.units().find(id).await.unwrap_err();
    assert!(matches!(err, CoreError::MigrationFailed { .. }));
}

#[tokio::test]
async fn test_rows_written_in_old_shape_are_reconciled_on_read() {
    let h = Harness::new().await;
    h.unit("paper").await;

    // An older build writes a row without the new columns.
    let legacy = insert_legacy_unit(h.plane.db(), "forge", "ghcr.io/warden/yolks:java_8").await;

    let unit = h.plane.units().get(legacy).await.unwrap();
    assert_eq!(unit.default_docker_image, "ghcr.io/warden/yolks:java_8");
    assert_eq!(unit.docker_images.len(), 1);
    assert!(unit.features.is_empty());

    let all = h.plane.units().list().await.unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_upsert_keeps_default_in_candidate_list() {
    let h = Harness::new().await;

    let mut spec = UnitSpec::new("Paper", "paper", "ghcr.io/warden/yolks:java_17", "java -jar server.jar");
    spec.docker_images.push(DockerImage::new("Java 21", "ghcr.io/warden/yolks:java_21"));
    spec.default_docker_image = Some("ghcr.io/warden/yolks:java_21".to_string());
    spec.features = vec!["eula".to_string()];
    let created = h.plane.upsert_unit(spec.clone()).await.unwrap();
    assert_eq!(created.default_docker_image, "ghcr.io/warden/yolks:java_21");

    let found = h.plane.units().find_by_short_name("paper").await.unwrap().unwrap();
    assert_eq!(found.id, created.id);
    assert!(found.offers_image(&found.default_docker_image));
    assert_eq!(found.features, vec!["eula".to_string()]);

    // Same short name updates in place; a dropped default falls back to the first image.
    spec.docker_images.truncate(1);
    spec.default_docker_image = None;
    let updated = h.plane.upsert_unit(spec.clone()).await.unwrap();
    assert_eq!(updated.id, created.id);
    assert_eq!(updated.default_docker_image, "ghcr.io/warden/yolks:java_17");
    assert_eq!(h.plane.units().list().await.unwrap().len(), 1);

    spec.default_docker_image = Some("ghcr.io/other/image".to_string());
    let err = h.plane.upsert_unit(spec).await.unwrap_err();
    assert!(matches!(err, CoreError::Invalid { field: "default_docker_image", .. }));
}

struct CountingUpgrade {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl TableUpgrade for CountingUpgrade {
    fn table(&self) -> &'static str {
        "regions"
    }

    fn columns(&self) -> &'static [ColumnSpec] {
        &[]
    }

    async fn backfill(&self, _conn: &mut SqliteConnection) -> Result<u64, EvolutionError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(0)
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_runs_once() {
    init_tracing();
    let db = database().await;
    db.apply_schema().await.unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let evolution = Arc::new(SchemaEvolution::with_upgrades(
        db,
        vec![Box::new(CountingUpgrade { runs: runs.clone() })],
    ));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let evolution = evolution.clone();
        handles.push(tokio::spawn(async move { evolution.ensure("regions").await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    // Tables without an upgrade are always ready.
    evolution.ensure("servers").await.unwrap();
}

#[tokio::test]
async fn test_evolution_timeout_is_not_remembered() {
    init_tracing();
    let db = Database::connect(&DbConfig {
        store_timeout: Duration::from_millis(250),
        ..DbConfig::in_memory()
    })
    .await
    .unwrap();
    db.apply_schema().await.unwrap();
    let evolution = SchemaEvolution::new(db.clone());

    // The only connection is busy elsewhere.
    let held = db.acquire().await.unwrap();
    let err = evolution.ensure("units").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
    assert!(err.is_retryable());

    drop(held);
    evolution.ensure("units").await.unwrap();
}
