//! Configuration for Tollgate
//!
//! A TOML file carries the database location, an optional master key, pool
//! defaults and per-provider overrides:
//!
//! ```toml
//! master_key = "base64..."
//!
//! [database]
//! path = "/var/lib/tollgate/vault.db"
//!
//! [defaults]
//! max_tokens = 25
//!
//! [providers.shopify]
//! max_tokens = 10
//! selection = "oldest_first"
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tollgate_db::TokenSelection;

use crate::crypto::MasterKey;
use crate::error::{ConfigError, CoreError, CoreResult};

/// Longest token validity accepted, one year.
pub const MAX_TOKEN_VALIDITY_HOURS: i64 = 24 * 365;

/// Upper bound for lock timeouts and lease TTLs, one day.
pub const MAX_WAIT_SECONDS: u64 = 24 * 60 * 60;

/// What to do when a coordination lock can't be acquired in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockTimeoutPolicy {
    /// Carry on uncoordinated and log a warning. May generate a redundant token.
    #[default]
    Proceed,
    /// Return `CoreError::LockTimeout`.
    Fail,
}

/// Token pool settings for one provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_tokens: i64,
    pub token_validity_hours: i64,
    pub expiry_buffer_minutes: i64,
    pub lock_timeout_seconds: u64,
    pub cleanup_lock_timeout_seconds: u64,
    pub lease_ttl_seconds: u64,
    pub selection: TokenSelection,
    pub on_lock_timeout: LockTimeoutPolicy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_tokens: 25,
            token_validity_hours: 1,
            expiry_buffer_minutes: 20,
            lock_timeout_seconds: 5,
            cleanup_lock_timeout_seconds: 30,
            lease_ttl_seconds: 30,
            selection: TokenSelection::NewestFirst,
            on_lock_timeout: LockTimeoutPolicy::Proceed,
        }
    }
}

impl PoolConfig {
    pub fn token_validity(&self) -> chrono::Duration {
        chrono::Duration::hours(self.token_validity_hours)
    }

    pub fn expiry_buffer(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.expiry_buffer_minutes)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_seconds)
    }

    pub fn cleanup_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_lock_timeout_seconds)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    /// Reject settings that would make the pool unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_tokens", self.max_tokens),
            ("token_validity_hours", self.token_validity_hours),
        ];
        for (field, value) in positive {
            if value <= 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("must be positive, got {value}"),
                });
            }
        }
        if self.token_validity_hours > MAX_TOKEN_VALIDITY_HOURS {
            return Err(ConfigError::InvalidValue {
                field: "token_validity_hours".to_string(),
                reason: format!("must be at most {MAX_TOKEN_VALIDITY_HOURS}"),
            });
        }
        if self.expiry_buffer_minutes < 0 {
            return Err(ConfigError::InvalidValue {
                field: "expiry_buffer_minutes".to_string(),
                reason: "must not be negative".to_string(),
            });
        }
        let validity_minutes = self
            .token_validity_hours
            .checked_mul(60)
            .unwrap_or(i64::MAX);
        if self.expiry_buffer_minutes >= validity_minutes {
            return Err(ConfigError::InvalidValue {
                field: "expiry_buffer_minutes".to_string(),
                reason: "must be shorter than the token validity".to_string(),
            });
        }
        if self.lease_ttl_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lease_ttl_seconds".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        let waits = [
            ("lock_timeout_seconds", self.lock_timeout_seconds),
            ("cleanup_lock_timeout_seconds", self.cleanup_lock_timeout_seconds),
            ("lease_ttl_seconds", self.lease_ttl_seconds),
        ];
        for (field, value) in waits {
            if value > MAX_WAIT_SECONDS {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: format!("must be at most {MAX_WAIT_SECONDS} seconds, got {value}"),
                });
            }
        }
        Ok(())
    }

    /// Apply the fields set in `overlay` on top of these settings.
    pub fn merged(&self, overlay: &PartialPoolConfig) -> Self {
        Self {
            max_tokens: overlay.max_tokens.unwrap_or(self.max_tokens),
            token_validity_hours: overlay
                .token_validity_hours
                .unwrap_or(self.token_validity_hours),
            expiry_buffer_minutes: overlay
                .expiry_buffer_minutes
                .unwrap_or(self.expiry_buffer_minutes),
            lock_timeout_seconds: overlay
                .lock_timeout_seconds
                .unwrap_or(self.lock_timeout_seconds),
            cleanup_lock_timeout_seconds: overlay
                .cleanup_lock_timeout_seconds
                .unwrap_or(self.cleanup_lock_timeout_seconds),
            lease_ttl_seconds: overlay.lease_ttl_seconds.unwrap_or(self.lease_ttl_seconds),
            selection: overlay.selection.unwrap_or(self.selection),
            on_lock_timeout: overlay.on_lock_timeout.unwrap_or(self.on_lock_timeout),
        }
    }
}

/// Per-provider overrides. Unset fields fall back to `[defaults]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialPoolConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_validity_hours: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_buffer_minutes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cleanup_lock_timeout_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_ttl_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection: Option<TokenSelection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_lock_timeout: Option<LockTimeoutPolicy>,
}

/// Database configuration for SQLite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the vault database file.
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("tollgate")
                .join("vault.db"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TollgateConfig {
    pub database: DatabaseConfig,
    /// Base64 master key. Falls back to `TOLLGATE_MASTER_KEY` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master_key: Option<String>,
    pub defaults: PoolConfig,
    pub providers: HashMap<String, PartialPoolConfig>,
}

impl TollgateConfig {
    /// Parse from TOML text. `origin` names the source in error messages.
    pub fn from_toml_str(content: &str, origin: &str) -> CoreResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            CoreError::config(
                origin,
                "content",
                "valid TOML configuration",
                ConfigError::TomlParse(e.to_string()),
            )
        })?;

        config
            .defaults
            .validate()
            .map_err(|e| CoreError::config(origin, "defaults", "valid pool settings", e))?;
        for name in config.providers.keys() {
            config.pool_config(name).validate().map_err(|e| {
                CoreError::config(origin, format!("providers.{name}"), "valid pool settings", e)
            })?;
        }
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub async fn load(path: &Path) -> CoreResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            CoreError::config(
                path.display().to_string(),
                "file",
                "readable TOML file",
                ConfigError::Io(e.to_string()),
            )
        })?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Load from the first standard location that exists, or defaults.
    pub async fn load_from_standard_locations() -> CoreResult<Self> {
        for path in config_paths() {
            if path.exists() {
                return Self::load(&path).await;
            }
        }
        Ok(Self::default())
    }

    /// Effective pool settings for a provider.
    pub fn pool_config(&self, provider: &str) -> PoolConfig {
        match self.providers.get(provider) {
            Some(overlay) => self.defaults.merged(overlay),
            None => self.defaults.clone(),
        }
    }

    /// Resolve the master key from the config or the environment.
    pub fn master_key(&self) -> CoreResult<MasterKey> {
        let key = match &self.master_key {
            Some(encoded) => MasterKey::from_base64(encoded)?,
            None => MasterKey::from_env()?,
        };
        Ok(key)
    }
}

/// Standard config file locations
pub fn config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // Project-specific config
    paths.push(PathBuf::from("tollgate.toml"));

    // User config directory
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("tollgate").join("config.toml"));
    }

    paths
}
