//! # warden-id
//!
//! Typed identifiers for every entity the warden control-plane persists.
//!
//! ## Format
//!
//! All identifiers use a prefixed format: `{prefix}_{ulid}`
//!
//! - `node_01HV4Z2WQXKJNM8GPQY6VBKC3D`
//! - `alloc_01HV4Z3MXNKPQR9HSTZ7WCLD4E`
//! - `srv_01HV4Z4NYPLTRS0JTUA8XDME5F`
//!
//! Callers outside the control-plane treat them as opaque strings. Inside,
//! the prefix keeps a server id from being bound where an allocation id is
//! expected, and the ULID keeps rows sortable by creation time.
//!
//! Every id type encodes to and decodes from a SQLite `TEXT` column, so
//! repositories bind ids directly.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;

#[doc(hidden)]
pub mod __private {
    pub use sqlx;
}
