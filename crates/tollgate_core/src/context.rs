//! Request-scoped tenant context.
//!
//! The tenant is always passed explicitly. Nothing here is global or
//! thread-local, so a worker reused across requests cannot leak one tenant's
//! identity into another's call.

use std::future::Future;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{Instrument, debug, error, info_span};

use crate::error::{CoreError, CoreResult};

const MAX_IDENTIFIER_LEN: usize = 255;

/// Validated, non-empty tenant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> CoreResult<Self> {
        let id = id.into();
        validate_identifier("tenant id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reject empty, overlong, or control-character identifiers.
///
/// Used for tenant ids, system names and provider names alike.
pub fn validate_identifier(field: &str, value: &str) -> CoreResult<()> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(format!("{field} must not be empty")));
    }
    if value.len() > MAX_IDENTIFIER_LEN {
        return Err(CoreError::validation(format!(
            "{field} exceeds {MAX_IDENTIFIER_LEN} bytes"
        )));
    }
    if value.chars().any(char::is_control) {
        return Err(CoreError::validation(format!(
            "{field} contains control characters"
        )));
    }
    Ok(())
}

/// Everything a call needs to know about who is asking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub tenant: TenantId,
    pub request_id: String,
}

impl RequestContext {
    /// Build a context with a fresh request id.
    pub fn new(tenant_id: impl Into<String>) -> CoreResult<Self> {
        Ok(Self {
            tenant: TenantId::new(tenant_id)?,
            request_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn tenant_id(&self) -> &str {
        self.tenant.as_str()
    }
}

/// Compare a row's tenant against the requesting tenant.
///
/// A mismatch means a query returned another tenant's data. It is logged as a
/// security event and surfaced as `TenantIsolationViolation`.
pub(crate) fn ensure_tenant(
    requested: &TenantId,
    actual: &str,
    operation: &'static str,
) -> CoreResult<()> {
    if requested.as_str() == actual {
        return Ok(());
    }
    error!(
        event = "security.tenant_isolation",
        requested_tenant = %requested,
        actual_tenant = actual,
        operation,
        "SECURITY VIOLATION: row from another tenant returned"
    );
    Err(CoreError::TenantIsolationViolation {
        operation,
        requested_tenant: requested.to_string(),
        actual_tenant: actual.to_string(),
    })
}

/// Run `fut` inside a span carrying the tenant and request id, and log
/// start and end with the elapsed time.
///
/// Storage and isolation failures are logged at error level here so they are
/// recorded even if the caller drops the error.
pub async fn traced<F, T>(ctx: &RequestContext, operation: &'static str, fut: F) -> CoreResult<T>
where
    F: Future<Output = CoreResult<T>>,
{
    let span = info_span!(
        "tollgate",
        tenant_id = %ctx.tenant,
        request_id = %ctx.request_id,
        operation,
    );

    async move {
        let started = Instant::now();
        debug!(event = "operation.start", "Starting {operation}");

        let result = fut.await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => debug!(event = "operation.end", elapsed_ms, "Finished {operation}"),
            Err(err @ (CoreError::Database(_) | CoreError::TenantIsolationViolation { .. })) => {
                error!(event = "operation.end", elapsed_ms, error = %err, "{operation} failed")
            }
            Err(err) => debug!(event = "operation.end", elapsed_ms, error = %err, "{operation} failed"),
        }
        result
    }
    .instrument(span)
    .await
}
