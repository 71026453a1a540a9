//! Tollgate Database Layer
//!
//! SQLite-backed storage for tenant credentials and shared access tokens.
//!
//! # Architecture
//!
//! - **One shared database file** - every worker process opens its own handle
//! - **Tenant column on every row** - every query filters on it explicitly
//! - **Opaque ciphertext** - this crate never sees plaintext secrets
//! - **Lease rows for locking** - coordination survives worker crashes via expiry
//!
//! # Usage
//!
//! ```rust,ignore
//! use tollgate_db::VaultDb;
//!
//! let db = VaultDb::open("path/to/vault.db").await?;
//! ```

pub mod connection;
pub mod error;
pub mod models;
pub mod queries;
pub mod repository;

pub use connection::VaultDb;
pub use error::{DbError, DbResult};

pub use models::{
    AccessToken, ActiveStatus, CoordinationLease, Credential, LeaseMetrics, LockPurpose,
    TokenCounts, TokenSelection, UsageLogEntry, UsageOutcome,
};
pub use queries::LeaseScope;
pub use repository::{CredentialRepository, LeaseRepository, TokenRepository};
