//! Token usage audit trail.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::from_millis;

/// Outcome recorded for a token use.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UsageOutcome {
    Success,
    Failed,
    #[default]
    Unknown,
    /// Token handed out, caller has not reported back yet.
    Pending,
}

/// Append-only audit record of a token being dispensed or used.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageLogEntry {
    pub id: String,
    pub tenant_id: String,
    pub provider: String,
    pub token_id: String,
    pub token_hash: String,
    pub operation: String,
    pub outcome: UsageOutcome,
    pub used_at: DateTime<Utc>,
    pub duration_ms: Option<i64>,
    pub response_status: Option<i64>,
    pub holder: Option<String>,
    pub context: Option<serde_json::Value>,
}

/// Database row for the `token_usage_log` table.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct UsageLogRow {
    id: String,
    tenant_id: String,
    provider: String,
    token_id: String,
    token_hash: String,
    operation: String,
    outcome: UsageOutcome,
    used_at: i64,
    duration_ms: Option<i64>,
    response_status: Option<i64>,
    holder: Option<String>,
    context: Option<String>,
}

impl UsageLogRow {
    pub(crate) fn into_entry(self) -> crate::DbResult<UsageLogEntry> {
        let context = self
            .context
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;

        Ok(UsageLogEntry {
            id: self.id,
            tenant_id: self.tenant_id,
            provider: self.provider,
            token_id: self.token_id,
            token_hash: self.token_hash,
            operation: self.operation,
            outcome: self.outcome,
            used_at: from_millis(self.used_at),
            duration_ms: self.duration_ms,
            response_status: self.response_status,
            holder: self.holder,
            context,
        })
    }
}
