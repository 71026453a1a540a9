//! Database models.
//!
//! Public structs carry `chrono` timestamps; the private `*Row` types map the
//! raw columns (epoch milliseconds) via sqlx.

mod credential;
mod lease;
mod token;
mod usage;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use credential::Credential;
pub(crate) use credential::CredentialRow;
pub use lease::{CoordinationLease, LeaseMetrics, LockPurpose};
pub(crate) use lease::CoordinationLeaseRow;
pub use token::{AccessToken, TokenCounts, TokenSelection};
pub(crate) use token::AccessTokenRow;
pub use usage::{UsageLogEntry, UsageOutcome};
pub(crate) use usage::UsageLogRow;

/// Soft-delete flag shared by credentials and access tokens.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ActiveStatus {
    #[default]
    Active,
    Inactive,
}

impl ActiveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }
}

impl std::fmt::Display for ActiveStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convert a timestamp to the stored epoch-millisecond form.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

/// Convert stored epoch milliseconds back to a timestamp.
///
/// Out-of-range values clamp to the epoch rather than failing the read.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_roundtrip_keeps_millisecond_precision() {
        let at = from_millis(1_700_000_123_456);
        assert_eq!(to_millis(at), 1_700_000_123_456);
    }

    #[test]
    fn test_from_millis_clamps_out_of_range() {
        assert_eq!(from_millis(i64::MAX), DateTime::<Utc>::UNIX_EPOCH);
    }
}
