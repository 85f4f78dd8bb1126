//! Typed ID definitions for all fleet entities.
//!
//! Each ID type has a unique prefix that identifies the entity kind.
//! IDs are ULID-based for sortability and uniqueness.

use crate::define_id;

// =============================================================================
// Identity
// =============================================================================

define_id!(UserId, "usr");
define_id!(ApiKeyId, "key");
define_id!(ProjectId, "prj");

// =============================================================================
// Fleet Topology
// =============================================================================

define_id!(RegionId, "reg");
define_id!(NodeId, "node");
define_id!(AllocationId, "alloc");

// =============================================================================
// Workloads
// =============================================================================

define_id!(UnitId, "unit");
define_id!(ServerId, "srv");
define_id!(CargoItemId, "cargo");

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_id_roundtrip() {
        let id = ServerId::new();
        let s = id.to_string();
        let parsed: ServerId = s.parse().unwrap();
        assert_eq!(id, parsed);
        assert!(s.starts_with("srv_"));
    }

    #[test]
    fn test_allocation_id_rejects_server_prefix() {
        let server = ServerId::new().to_string();
        let result: Result<AllocationId, _> = server.parse();
        assert!(matches!(
            result.unwrap_err(),
            crate::IdError::InvalidPrefix {
                expected: "alloc",
                ..
            }
        ));
    }

    #[test]
    fn test_missing_separator() {
        let result: Result<NodeId, _> = "node01HV4Z2WQXKJNM8GPQY6VBKC3D".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::MissingSeparator));
    }

    #[test]
    fn test_empty() {
        let result: Result<NodeId, _> = "".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::Empty));
    }

    #[test]
    fn test_invalid_ulid() {
        let result: Result<RegionId, _> = "reg_invalid".parse();
        assert!(matches!(result.unwrap_err(), crate::IdError::InvalidUlid(_)));
    }

    #[test]
    fn test_json_roundtrip() {
        let id = UnitId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{id}\""));
        let parsed: UnitId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_sortable() {
        let id1 = AllocationId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = AllocationId::new();
        assert!(id1 < id2);
    }

    #[tokio::test]
    async fn test_sqlite_text_roundtrip() {
        use sqlx::Connection;

        let mut conn = sqlx::SqliteConnection::connect("sqlite::memory:")
            .await
            .unwrap();
        let id = NodeId::new();
        let back: NodeId = sqlx::query_scalar("SELECT ?")
            .bind(id)
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(id, back);

        let raw: String = sqlx::query_scalar("SELECT ?")
            .bind(id)
            .fetch_one(&mut conn)
            .await
            .unwrap();
        assert_eq!(raw, id.to_string());
    }

    #[test]
    fn test_all_id_prefixes_unique() {
        let prefixes = vec![
            UserId::PREFIX,
            ApiKeyId::PREFIX,
            ProjectId::PREFIX,
            RegionId::PREFIX,
            NodeId::PREFIX,
            AllocationId::PREFIX,
            UnitId::PREFIX,
            ServerId::PREFIX,
            CargoItemId::PREFIX,
        ];

        let unique: std::collections::HashSet<_> = prefixes.iter().collect();
        assert_eq!(prefixes.len(), unique.len(), "Duplicate ID prefixes found!");
    }

    proptest::proptest! {
        #[test]
        fn prop_parse_never_panics(s in "\\PC*") {
            let _ = ServerId::parse(&s);
        }
    }
}
