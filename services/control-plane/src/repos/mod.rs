//! Typed access to the fleet's entities.
//!
//! Each repository owns one table. Methods on the repository structs run
//! against the pool under the store timeout; the `*_in` functions take an
//! open connection so services can compose them inside one transaction.

pub mod allocations;
pub mod api_keys;
pub mod cargo;
pub mod nodes;
pub mod projects;
pub mod regions;
pub mod servers;
pub mod units;
pub mod users;

pub use allocations::{Allocation, AllocationUpdate};
pub use api_keys::{ApiKey, ApiKeyRepo, IssuedApiKey, NewApiKey};
pub use cargo::{CargoItem, CargoRepo, NewCargoItem};
pub use nodes::{NewNode, Node, NodeRepo, NodeUpdate};
pub use projects::{NewProject, Project, ProjectRepo};
pub use regions::{NewRegion, Region, RegionRepo, RegionUpdate};
pub use servers::{ResourceLimits, Server, ServerRepo};
pub use units::{Unit, UnitRepo, UnitSpec, UnitVariable};
pub use users::{NewUser, User, UserRepo, UserUpdate};

use crate::error::{CoreError, CoreResult};

pub(crate) fn decode_error(message: impl Into<String>) -> sqlx::Error {
    sqlx::Error::Decode(message.into().into())
}

pub(crate) fn decode_u16(column: &str, value: i64) -> Result<u16, sqlx::Error> {
    u16::try_from(value).map_err(|_| decode_error(format!("{column} out of range: {value}")))
}

/// Trimmed, non-empty, bounded text.
pub(crate) fn require_text(field: &'static str, value: &str, max: usize) -> CoreResult<()> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(CoreError::invalid(field, "must not be empty"));
    }
    if trimmed.len() != value.len() {
        return Err(CoreError::invalid(field, "must not have surrounding whitespace"));
    }
    if value.chars().count() > max {
        return Err(CoreError::invalid(field, format!("longer than {max} characters")));
    }
    Ok(())
}

/// Lowercase slug: `[a-z0-9]` with inner `-`, `_` or `.`.
pub(crate) fn require_slug(field: &'static str, value: &str, max: usize) -> CoreResult<()> {
    require_text(field, value, max)?;
    let valid_chars = value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));
    let valid_edges = value
        .chars()
        .next()
        .zip(value.chars().last())
        .is_some_and(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric());
    if !valid_chars || !valid_edges {
        return Err(CoreError::invalid(
            field,
            "must be lowercase alphanumerics separated by '-', '_' or '.'",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_text() {
        assert!(require_text("name", "Frankfurt", 16).is_ok());
        assert!(require_text("name", "", 16).is_err());
        assert!(require_text("name", " padded", 16).is_err());
        assert!(require_text("name", "this name is far too long", 16).is_err());
    }

    #[test]
    fn test_require_slug() {
        assert!(require_slug("identifier", "eu-central-1", 32).is_ok());
        assert!(require_slug("identifier", "EU", 32).is_err());
        assert!(require_slug("identifier", "-edge", 32).is_err());
        assert!(require_slug("identifier", "edge-", 32).is_err());
        assert!(require_slug("identifier", "a b", 32).is_err());
    }

    #[test]
    fn test_decode_u16_bounds() {
        assert_eq!(decode_u16("port", 25565).unwrap(), 25565);
        assert!(decode_u16("port", 70000).is_err());
        assert!(decode_u16("port", -1).is_err());
    }
}
