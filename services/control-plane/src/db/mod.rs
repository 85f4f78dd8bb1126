//! Database layer for the control plane.
//!
//! This module provides:
//! - Connection pool management
//! - Schema application
//! - Bounded store calls ([`Database::timed`])
//! - A partial-update statement builder shared by the repositories
//!
//! The database layer uses SQLx with SQLite.

mod error;
mod query;
mod schema;

pub use error::DbError;
pub(crate) use error::is_transient;
pub(crate) use query::UpdateBuilder;
pub use schema::SCHEMA;

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use tracing::{info, warn};

const DEFAULT_DATABASE_URL: &str = "sqlite://warden.db";

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Database connection URL.
    pub database_url: String,

    /// Maximum number of connections in the pool.
    pub max_connections: u32,

    /// Minimum number of idle connections.
    pub min_connections: u32,

    /// Connection acquire timeout.
    pub acquire_timeout: Duration,

    /// Idle connection timeout.
    pub idle_timeout: Option<Duration>,

    /// Maximum lifetime of a connection.
    pub max_lifetime: Option<Duration>,

    /// Upper bound on a single store operation.
    pub store_timeout: Duration,

    /// How long SQLite waits on a locked database before failing.
    pub busy_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 1,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Some(Duration::from_secs(600)),
            max_lifetime: Some(Duration::from_secs(1800)),
            store_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let database_url =
            std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());

        let max_connections = std::env::var("DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1);

        let acquire_timeout = std::env::var("DB_ACQUIRE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        let store_timeout = std::env::var("WARDEN_STORE_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(10));

        Self {
            database_url,
            max_connections,
            acquire_timeout,
            store_timeout,
            ..Default::default()
        }
    }

    /// A private in-memory database.
    ///
    /// The pool pins a single connection that never idles out, since an
    /// in-memory SQLite database lives exactly as long as its connection.
    pub fn in_memory() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            idle_timeout: None,
            max_lifetime: None,
            ..Default::default()
        }
    }

    fn is_memory(&self) -> bool {
        self.database_url.contains(":memory:") || self.database_url.contains("mode=memory")
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
    store_timeout: Duration,
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            store_timeout_ms = config.store_timeout.as_millis() as u64,
            "Connecting to database"
        );

        let mut options = SqliteConnectOptions::from_str(&config.database_url)
            .map_err(DbError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout);
        if !config.is_memory() {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(SqliteSynchronous::Normal);
        }

        // Every connection to `:memory:` opens its own empty database.
        let max_connections = if config.is_memory() && config.max_connections > 1 {
            warn!(
                requested = config.max_connections,
                "In-memory database limited to one connection"
            );
            1
        } else {
            config.max_connections
        };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(config.min_connections.min(max_connections))
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(config.idle_timeout)
            .max_lifetime(config.max_lifetime)
            .connect_with(options)
            .await
            .map_err(DbError::Connect)?;

        info!("Database connection pool established");

        Ok(Self {
            pool,
            store_timeout: config.store_timeout,
        })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn store_timeout(&self) -> Duration {
        self.store_timeout
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> Result<(), DbError> {
        self.timed(async {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    /// Create every table and index that does not exist yet.
    pub async fn apply_schema(&self) -> Result<(), DbError> {
        info!("Applying database schema");
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        info!("Database schema applied");
        Ok(())
    }

    pub async fn acquire(&self) -> Result<PoolConnection<Sqlite>, DbError> {
        Ok(self.pool.acquire().await?)
    }

    /// Open a write transaction.
    ///
    /// `BEGIN IMMEDIATE` takes the write lock up front, so concurrent writers
    /// queue on the busy timeout instead of failing when a deferred read
    /// lock cannot be upgraded.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, DbError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    /// Run `fut` under the configured store timeout.
    ///
    /// On expiry the future is dropped, which rolls back any transaction it
    /// had open, and the caller sees [`DbError::Timeout`].
    pub async fn timed<T, E, F>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<DbError>,
    {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(DbError::Timeout(self.store_timeout).into()),
        }
    }
}
