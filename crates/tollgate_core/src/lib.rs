//! Tollgate Core - tenant-isolated credentials and shared access tokens
//!
//! Stateless workers use this crate to read long-lived credentials and to
//! share a small pool of short-lived provider tokens. The only shared state is
//! the vault database; coordination between workers happens through locks
//! stored there.
//!
//! # Layers
//!
//! - [`crypto::CryptoBox`] seals secrets with a per-tenant derived key
//! - [`credentials::CredentialStore`] and [`ledger::TokenLedger`] sit on the
//!   repository traits from `tollgate_db`
//! - [`lock::CoordinationLock`] serializes generation per tenant and provider
//! - [`pool::TokenPool`] runs the reuse / lock / re-check / generate cycle
//! - [`service::CredentialService`] is the entry point most callers want
//!
//! ```rust,ignore
//! let config = TollgateConfig::load_from_standard_locations().await?;
//! let db = VaultDb::open(&config.database.path).await?;
//! let crypto = CryptoBox::new(config.master_key()?);
//! let service = CredentialService::from_config(db, crypto, &config)?
//!     .with_generator("shopify", Arc::new(my_generator))?;
//!
//! let ctx = RequestContext::new("acme")?;
//! let token = service.get_valid_access_token(&ctx, "shopify", "orders.list").await?;
//! ```

pub mod config;
pub mod context;
pub mod credentials;
pub mod crypto;
pub mod error;
pub mod generator;
pub mod ledger;
pub mod lock;
pub mod maintenance;
pub mod pool;
pub mod service;

#[cfg(test)]
pub mod test_helpers;

pub use config::{LockTimeoutPolicy, PoolConfig, TollgateConfig};
pub use context::{RequestContext, TenantId};
pub use credentials::{CredentialStore, CredentialSummary, DecryptedCredential};
pub use crypto::{CryptoBox, CryptoError, MasterKey};
pub use error::{ConfigError, CoreError, CoreResult};
pub use generator::{FnGenerator, GenerationError, GenerationRequest, TokenGenerator};
pub use ledger::TokenLedger;
pub use lock::{CoordinationLock, LeaseLock, LockKey};
pub use maintenance::{Maintenance, MaintenancePolicy, MaintenanceReport};
pub use pool::{
    CoordinationMetrics, DispensedToken, PoolStatistics, TokenPool, TokenSource, UsageReport,
};
pub use service::CredentialService;

#[cfg(feature = "postgres")]
pub use lock::PgAdvisoryLock;
