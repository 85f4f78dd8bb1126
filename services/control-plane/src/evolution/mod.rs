//! In-place schema evolution for tables that predate newer columns.
//!
//! A [`TableUpgrade`] names the columns its table must carry and how to
//! backfill rows written before they existed. [`SchemaEvolution`] runs each
//! upgrade at most once per process, the first time the table is used:
//!
//! 1. inspect the live columns (`PRAGMA table_info`)
//! 2. `ALTER TABLE ... ADD COLUMN` for each missing one
//! 3. backfill
//!
//! all inside one transaction. SQLite DDL is transactional, so a failed
//! backfill leaves the table exactly as it was. A definitive failure is
//! remembered and returned to every later caller; only transient store
//! errors, including an expired store timeout, are retried on the next call.

pub mod units;

use std::collections::HashSet;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqliteConnection;
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{error, info, instrument};

use crate::db::{is_transient, Database, DbError};
use crate::error::{CoreError, CoreResult};

pub use units::UnitsUpgrade;

/// A column a table must carry, with the definition used to add it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub definition: &'static str,
}

/// What one evolution pass did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvolutionReport {
    pub table: &'static str,
    pub added_columns: Vec<&'static str>,
    pub backfilled_rows: u64,
}

#[derive(Debug, Error)]
pub enum EvolutionError {
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("cannot backfill row {row_id}: {reason}")]
    Backfill { row_id: String, reason: String },
}

impl EvolutionError {
    fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => is_transient(e),
            Self::Db(e) => e.is_transient(),
            Self::Backfill { .. } => false,
        }
    }
}

/// An additive upgrade of one table.
#[async_trait]
pub trait TableUpgrade: Send + Sync {
    fn table(&self) -> &'static str;

    /// Columns added after the table's first shape.
    fn columns(&self) -> &'static [ColumnSpec];

    /// Fill the added columns for rows that lack them. Must be
    /// deterministic and idempotent. Returns the number of rows written.
    async fn backfill(&self, conn: &mut SqliteConnection) -> Result<u64, EvolutionError>;
}

struct Registered {
    upgrade: Box<dyn TableUpgrade>,
    gate: OnceCell<Result<EvolutionReport, String>>,
}

/// Runs every registered upgrade at most once per process.
pub struct SchemaEvolution {
    db: Database,
    upgrades: Vec<Registered>,
}

impl SchemaEvolution {
    /// Evolution for the fleet schema.
    pub fn new(db: Database) -> Self {
        Self::with_upgrades(db, vec![Box::new(UnitsUpgrade)])
    }

    pub fn with_upgrades(db: Database, upgrades: Vec<Box<dyn TableUpgrade>>) -> Self {
        Self {
            db,
            upgrades: upgrades
                .into_iter()
                .map(|upgrade| Registered {
                    upgrade,
                    gate: OnceCell::new(),
                })
                .collect(),
        }
    }

    /// Make sure `table` has been evolved. Concurrent first callers wait on
    /// a single pass. Tables without an upgrade are always ready.
    pub async fn ensure(&self, table: &str) -> CoreResult<()> {
        match self.upgrades.iter().find(|r| r.upgrade.table() == table) {
            Some(registered) => self.run(registered).await.map(|_| ()),
            None => Ok(()),
        }
    }

    /// Evolve every registered table, stopping at the first failure.
    pub async fn ensure_all(&self) -> CoreResult<Vec<EvolutionReport>> {
        let mut reports = Vec::with_capacity(self.upgrades.len());
        for registered in &self.upgrades {
            reports.push(self.run(registered).await?);
        }
        Ok(reports)
    }

    async fn run(&self, registered: &Registered) -> CoreResult<EvolutionReport> {
        let table = registered.upgrade.table();
        let outcome = registered
            .gate
            .get_or_try_init(|| async {
                match self
                    .db
                    .timed(evolve(&self.db, registered.upgrade.as_ref()))
                    .await
                {
                    Ok(report) => Ok(Ok(report)),
                    Err(e) if e.is_transient() => Err(CoreError::StoreUnavailable(e.to_string())),
                    Err(e) => {
                        error!(table, error = %e, "Schema evolution failed; table left unchanged");
                        Ok(Err(e.to_string()))
                    }
                }
            })
            .await?;

        match outcome {
            Ok(report) => Ok(report.clone()),
            Err(reason) => Err(CoreError::MigrationFailed {
                table,
                reason: reason.clone(),
            }),
        }
    }
}

/// Column names of `table` as the database currently has them.
pub async fn table_columns(
    conn: &mut SqliteConnection,
    table: &str,
) -> Result<HashSet<String>, sqlx::Error> {
    let columns: Vec<(i32, String, String, i32, Option<String>, i32)> =
        sqlx::query_as(&format!("PRAGMA table_info({table})"))
            .fetch_all(conn)
            .await?;
    Ok(columns.into_iter().map(|(_, name, ..)| name).collect())
}

#[instrument(skip(db, upgrade), fields(table = upgrade.table()))]
async fn evolve(db: &Database, upgrade: &dyn TableUpgrade) -> Result<EvolutionReport, EvolutionError> {
    let table = upgrade.table();
    let mut tx = db.begin().await?;

    let exists: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
    )
    .bind(table)
    .fetch_one(&mut *tx)
    .await?;

    let mut report = EvolutionReport {
        table,
        added_columns: Vec::new(),
        backfilled_rows: 0,
    };
    if !exists {
        return Ok(report);
    }

    let present = table_columns(&mut tx, table).await?;
    for column in upgrade.columns() {
        if !present.contains(column.name) {
            sqlx::query(&format!(
                "ALTER TABLE {table} ADD COLUMN {} {}",
                column.name, column.definition
            ))
            .execute(&mut *tx)
            .await?;
            report.added_columns.push(column.name);
        }
    }

    report.backfilled_rows = upgrade.backfill(&mut tx).await?;
    tx.commit().await?;

    if report.added_columns.is_empty() && report.backfilled_rows == 0 {
        info!(table, "Table already at current shape");
    } else {
        info!(
            table,
            added_columns = ?report.added_columns,
            backfilled_rows = report.backfilled_rows,
            "Table evolved"
        );
    }
    Ok(report)
}
