use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tollgate_db::DbError;

use crate::crypto::CryptoError;

/// Configuration-specific errors
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

#[derive(Error, Diagnostic, Debug)]
pub enum CoreError {
    #[error("Validation failed: {message}")]
    #[diagnostic(
        code(tollgate_core::validation),
        help("Check the tenant id, names and payload passed to this call")
    )]
    Validation { message: String },

    #[error("{entity} not found: {name}")]
    #[diagnostic(
        code(tollgate_core::not_found),
        help("The {entity} doesn't exist for tenant '{tenant_id}'")
    )]
    NotFound {
        entity: &'static str,
        tenant_id: String,
        name: String,
    },

    #[error("Credential '{system_name}' expired at {expired_at}")]
    #[diagnostic(
        code(tollgate_core::expired),
        help("Store fresh credentials with `update` to replace the expired ones")
    )]
    Expired {
        tenant_id: String,
        system_name: String,
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    #[error("Credential '{system_name}' is inactive")]
    #[diagnostic(code(tollgate_core::inactive))]
    Inactive {
        tenant_id: String,
        system_name: String,
    },

    #[error("{entity} already exists: {name}")]
    #[diagnostic(
        code(tollgate_core::duplicate),
        help("Use update instead of create, or pick a different name")
    )]
    Duplicate { entity: &'static str, name: String },

    #[error("No usable token for provider '{provider}' and no generator configured")]
    #[diagnostic(
        code(tollgate_core::token_not_available),
        help("Store a token for this provider or configure a token generator")
    )]
    TokenNotAvailable { tenant_id: String, provider: String },

    #[error("Tenant isolation violation during {operation}")]
    #[diagnostic(
        code(tollgate_core::tenant_isolation_violation),
        severity(Error),
        help("A row for tenant '{actual_tenant}' was returned to a request for tenant '{requested_tenant}'. This is a storage bug.")
    )]
    TenantIsolationViolation {
        operation: &'static str,
        requested_tenant: String,
        actual_tenant: String,
    },

    #[error("Timed out after {waited_ms}ms waiting for {purpose} lock on '{provider}'")]
    #[diagnostic(
        code(tollgate_core::lock_timeout),
        help("Another worker holds the lock. Retry later or raise lock_timeout_seconds.")
    )]
    LockTimeout {
        tenant_id: String,
        provider: String,
        purpose: String,
        waited_ms: u64,
    },

    #[error("Service error in {operation}: {message}")]
    #[diagnostic(code(tollgate_core::service))]
    Service {
        operation: String,
        message: String,
        #[source]
        cause: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Encryption error")]
    #[diagnostic(
        code(tollgate_core::crypto),
        help("Check that the master key matches the one the data was written with")
    )]
    Crypto(#[from] CryptoError),

    #[error("Database error")]
    #[diagnostic(code(tollgate_core::database))]
    Database(#[from] DbError),

    #[error("Configuration error in {config_path}: field '{field}'")]
    #[diagnostic(
        code(tollgate_core::config_error),
        help("Expected {expected}")
    )]
    Config {
        config_path: String,
        field: String,
        expected: String,
        #[source]
        cause: ConfigError,
    },
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(
        entity: &'static str,
        tenant_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            entity,
            tenant_id: tenant_id.into(),
            name: name.into(),
        }
    }

    pub fn service(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Service {
            operation: operation.into(),
            message: message.into(),
            cause: None,
        }
    }

    pub fn service_with_cause<E>(
        operation: impl Into<String>,
        message: impl Into<String>,
        cause: E,
    ) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Service {
            operation: operation.into(),
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    pub fn config(
        config_path: impl Into<String>,
        field: impl Into<String>,
        expected: impl Into<String>,
        cause: ConfigError,
    ) -> Self {
        Self::Config {
            config_path: config_path.into(),
            field: field.into(),
            expected: expected.into(),
            cause,
        }
    }

    /// Map a storage error, turning uniqueness violations into `Duplicate`.
    pub(crate) fn from_db(err: DbError, entity: &'static str, name: impl Into<String>) -> Self {
        if err.is_already_exists() {
            Self::Duplicate {
                entity,
                name: name.into(),
            }
        } else {
            Self::Database(err)
        }
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
