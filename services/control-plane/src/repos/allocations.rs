//! Allocation rows. Policy (locking, error selection, bulk creation) lives
//! in [`crate::allocation`]; these are the statements it composes.
//!
//! Every state change is a conditional `UPDATE ... RETURNING`, so a
//! statement that lost a race touches no row instead of overwriting.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};
use warden_id::{AllocationId, NodeId, ServerId};
use warden_networking::BindAddress;

use super::decode_u16;

pub(crate) const ALLOCATION_COLUMNS: &str = "id, node_id, bind_address, port, alias, notes, \
     assigned, server_id, reserved_at, created_at, updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub id: AllocationId,
    pub node_id: NodeId,
    pub bind_address: String,
    pub port: u16,
    pub alias: Option<String>,
    pub notes: Option<String>,
    /// Reserved or bound. Always set when `server_id` is.
    pub assigned: bool,
    pub server_id: Option<ServerId>,
    /// When an unbound reservation was taken.
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Allocation {
    pub fn is_free(&self) -> bool {
        !self.assigned && self.server_id.is_none()
    }

    /// `address:port`, bracketed for IPv6.
    pub fn endpoint(&self) -> String {
        match BindAddress::parse(&self.bind_address) {
            Ok(address) => address.endpoint(self.port),
            Err(_) => format!("{}:{}", self.bind_address, self.port),
        }
    }
}

impl<'r> sqlx::FromRow<'r, SqliteRow> for Allocation {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            node_id: row.try_get("node_id")?,
            bind_address: row.try_get("bind_address")?,
            port: decode_u16("port", row.try_get("port")?)?,
            alias: row.try_get("alias")?,
            notes: row.try_get("notes")?,
            assigned: row.try_get("assigned")?,
            server_id: row.try_get("server_id")?,
            reserved_at: row.try_get("reserved_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Operator-editable labels. `Some(None)` clears a field.
#[derive(Debug, Clone, Default)]
pub struct AllocationUpdate {
    pub alias: Option<Option<String>>,
    pub notes: Option<Option<String>>,
}

pub(crate) async fn find_in(
    conn: &mut SqliteConnection,
    id: AllocationId,
) -> Result<Option<Allocation>, sqlx::Error> {
    sqlx::query_as::<_, Allocation>(&format!(
        "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(conn)
    .await
}

pub(crate) async fn find_by_server_in(
    conn: &mut SqliteConnection,
    server_id: ServerId,
) -> Result<Option<Allocation>, sqlx::Error> {
    sqlx::query_as::<_, Allocation>(&format!(
        "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE server_id = ?"
    ))
    .bind(server_id)
    .fetch_optional(conn)
    .await
}

/// Allocations of a node ordered by bind address then port. `free` narrows
/// to free (`Some(true)`) or assigned (`Some(false)`) ones.
pub(crate) async fn list_in(
    conn: &mut SqliteConnection,
    node_id: NodeId,
    free: Option<bool>,
) -> Result<Vec<Allocation>, sqlx::Error> {
    let filter = match free {
        None => "",
        Some(true) => " AND assigned = 0 AND server_id IS NULL",
        Some(false) => " AND (assigned = 1 OR server_id IS NOT NULL)",
    };
    sqlx::query_as::<_, Allocation>(&format!(
        "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE node_id = ?{filter}
         ORDER BY bind_address, port"
    ))
    .bind(node_id)
    .fetch_all(conn)
    .await
}

/// Every allocation bound to a server, across nodes.
pub(crate) async fn list_bound_in(
    conn: &mut SqliteConnection,
) -> Result<Vec<Allocation>, sqlx::Error> {
    sqlx::query_as::<_, Allocation>(&format!(
        "SELECT {ALLOCATION_COLUMNS} FROM allocations WHERE server_id IS NOT NULL ORDER BY id"
    ))
    .fetch_all(conn)
    .await
}

pub(crate) async fn insert_in(
    conn: &mut SqliteConnection,
    node_id: NodeId,
    bind_address: &str,
    port: u16,
    alias: Option<&str>,
    notes: Option<&str>,
) -> Result<Allocation, sqlx::Error> {
    let now = Utc::now();
    sqlx::query_as::<_, Allocation>(&format!(
        "INSERT INTO allocations (id, node_id, bind_address, port, alias, notes, assigned, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
         RETURNING {ALLOCATION_COLUMNS}"
    ))
    .bind(AllocationId::new())
    .bind(node_id)
    .bind(bind_address)
    .bind(i64::from(port))
    .bind(alias)
    .bind(notes)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await
}

/// Reserve the free allocation with the lowest port on `node_id`. An
/// allocation still named by a server row being removed is skipped.
pub(crate) async fn reserve_lowest_in(
    conn: &mut SqliteConnection,
    node_id: NodeId,
    now: DateTime<Utc>,
) -> Result<Option<Allocation>, sqlx::Error> {
    sqlx::query_as::<_, Allocation>(&format!(
        "UPDATE allocations SET assigned = 1, reserved_at = ?, updated_at = ?
         WHERE id = (
             SELECT a.id FROM allocations a
             WHERE a.node_id = ? AND a.assigned = 0 AND a.server_id IS NULL
               AND NOT EXISTS (SELECT 1 FROM servers s WHERE s.allocation_id = a.id)
             ORDER BY a.port, a.bind_address
             LIMIT 1
         )
         RETURNING {ALLOCATION_COLUMNS}"
    ))
    .bind(now)
    .bind(now)
    .bind(node_id)
    .fetch_optional(conn)
    .await
}

/// Reserve one specific allocation if it is still free.
pub(crate) async fn reserve_exact_in(
    conn: &mut SqliteConnection,
    id: AllocationId,
    now: DateTime<Utc>,
) -> Result<Option<Allocation>, sqlx::Error> {
    sqlx::query_as::<_, Allocation>(&format!(
        "UPDATE allocations SET assigned = 1, reserved_at = ?, updated_at = ?
         WHERE id = ? AND assigned = 0 AND server_id IS NULL
           AND NOT EXISTS (SELECT 1 FROM servers s WHERE s.allocation_id = allocations.id)
         RETURNING {ALLOCATION_COLUMNS}"
    ))
    .bind(now)
    .bind(now)
    .bind(id)
    .fetch_optional(conn)
    .await
}

/// Bind an allocation to a server. Re-binding to the same server succeeds;
/// an allocation bound elsewhere is left untouched and `None` returned.
pub(crate) async fn bind_in(
    conn: &mut SqliteConnection,
    id: AllocationId,
    server_id: ServerId,
    now: DateTime<Utc>,
) -> Result<Option<Allocation>, sqlx::Error> {
    sqlx::query_as::<_, Allocation>(&format!(
        "UPDATE allocations SET assigned = 1, server_id = ?, reserved_at = NULL, updated_at = ?
         WHERE id = ? AND (server_id IS NULL OR server_id = ?)
         RETURNING {ALLOCATION_COLUMNS}"
    ))
    .bind(server_id)
    .bind(now)
    .bind(id)
    .bind(server_id)
    .fetch_optional(conn)
    .await
}

/// Return an allocation to the free pool. Zero rows means it was already free
/// or does not exist.
pub(crate) async fn release_in(
    conn: &mut SqliteConnection,
    id: AllocationId,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    Ok(sqlx::query(
        "UPDATE allocations SET assigned = 0, server_id = NULL, reserved_at = NULL, updated_at = ?
         WHERE id = ? AND (assigned = 1 OR server_id IS NOT NULL)",
    )
    .bind(now)
    .bind(id)
    .execute(conn)
    .await?
    .rows_affected())
}

/// Free reservations taken before `before` that were never bound.
pub(crate) async fn release_unbound_before_in(
    conn: &mut SqliteConnection,
    before: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    Ok(sqlx::query(
        "UPDATE allocations SET assigned = 0, reserved_at = NULL, updated_at = ?
         WHERE assigned = 1 AND server_id IS NULL AND reserved_at IS NOT NULL AND reserved_at < ?",
    )
    .bind(Utc::now())
    .bind(before)
    .execute(conn)
    .await?
    .rows_affected())
}

/// Delete an allocation only while it is free.
pub(crate) async fn delete_free_in(
    conn: &mut SqliteConnection,
    id: AllocationId,
) -> Result<u64, sqlx::Error> {
    Ok(sqlx::query(
        "DELETE FROM allocations WHERE id = ? AND assigned = 0 AND server_id IS NULL",
    )
    .bind(id)
    .execute(conn)
    .await?
    .rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(bind_address: &str, port: u16) -> Allocation {
        let now = Utc::now();
        Allocation {
            id: AllocationId::new(),
            node_id: NodeId::new(),
            bind_address: bind_address.to_string(),
            port,
            alias: None,
            notes: None,
            assigned: false,
            server_id: None,
            reserved_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_endpoint_formatting() {
        assert_eq!(allocation("10.0.0.5", 25565).endpoint(), "10.0.0.5:25565");
        assert_eq!(allocation("2001:db8::1", 25565).endpoint(), "[2001:db8::1]:25565");
    }

    #[test]
    fn test_free_requires_unassigned_and_unbound() {
        let mut a = allocation("0.0.0.0", 27015);
        assert!(a.is_free());
        a.assigned = true;
        assert!(!a.is_free());
    }
}
