//! Coordination lease rows.
//!
//! One row per (tenant, provider, purpose). On SQLite the row doubles as the
//! lock itself; with a native advisory lock it is kept for contention metrics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::from_millis;

/// What a coordination lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LockPurpose {
    /// Generating and inserting a new token.
    TokenGeneration,
    /// Sweeping expired tokens.
    Cleanup,
}

impl LockPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TokenGeneration => "token_generation",
            Self::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for LockPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinationLease {
    pub tenant_id: String,
    pub provider: String,
    pub purpose: LockPurpose,
    pub lock_key: i64,
    /// Empty when nobody holds the lease.
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Number of successful acquisitions.
    pub attempt_count: i64,
    pub last_attempt_at: DateTime<Utc>,
}

impl CoordinationLease {
    pub fn is_held_at(&self, now: DateTime<Utc>) -> bool {
        !self.locked_by.is_empty() && self.expires_at > now
    }
}

/// Aggregate lease counters for one (tenant, provider).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LeaseMetrics {
    pub active_leases: i64,
    pub total_attempts: i64,
    pub max_attempts: i64,
}

/// Database row for the `coordination_leases` table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct CoordinationLeaseRow {
    tenant_id: String,
    provider: String,
    purpose: LockPurpose,
    lock_key: i64,
    locked_by: String,
    locked_at: i64,
    expires_at: i64,
    attempt_count: i64,
    last_attempt_at: i64,
}

impl CoordinationLeaseRow {
    pub(crate) fn into_lease(self) -> CoordinationLease {
        CoordinationLease {
            tenant_id: self.tenant_id,
            provider: self.provider,
            purpose: self.purpose,
            lock_key: self.lock_key,
            locked_by: self.locked_by,
            locked_at: from_millis(self.locked_at),
            expires_at: from_millis(self.expires_at),
            attempt_count: self.attempt_count,
            last_attempt_at: from_millis(self.last_attempt_at),
        }
    }
}
