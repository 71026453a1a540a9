//! Credential commands.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use miette::{IntoDiagnostic, Result};
use owo_colors::OwoColorize;
use tollgate_core::{CoreError, CredentialStore};

use crate::helpers::{Env, context};
use crate::output::{Output, format_relative_time};

async fn store(env: &Env) -> Result<CredentialStore> {
    Ok(CredentialStore::new(Arc::new(env.db().await?), env.crypto()?))
}

/// Create the credential, or replace its payload if it already exists.
pub async fn set(
    env: &Env,
    tenant: &str,
    system: &str,
    auth_type: &str,
    payload: &str,
    expires_in_hours: Option<i64>,
) -> Result<()> {
    let output = Output::new();
    let ctx = context(tenant)?;
    let payload: serde_json::Value = serde_json::from_str(payload).into_diagnostic()?;
    let expires_at = expires_in_hours.map(expiry_after_hours).transpose()?;
    let store = store(env).await?;

    match store.create(&ctx, system, auth_type, &payload, expires_at).await {
        Ok(id) => {
            output.success(&format!("Stored credential {}", system.bright_cyan()));
            output.info("Id:", &id);
        }
        Err(CoreError::Duplicate { .. }) => {
            let existing = store.get(&ctx, system).await?;
            ensure_same_auth_type(system, &existing.auth_type, auth_type)?;
            store.update(&ctx, system, &payload, expires_at).await?;
            output.success(&format!("Updated credential {}", system.bright_cyan()));
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn expiry_after_hours(hours: i64) -> Result<DateTime<Utc>> {
    Duration::try_hours(hours)
        .and_then(|validity| Utc::now().checked_add_signed(validity))
        .ok_or_else(|| miette::miette!("--expires-in-hours {hours} is out of range"))
}

/// An update only replaces the payload, so the auth type has to match.
fn ensure_same_auth_type(system: &str, stored: &str, requested: &str) -> Result<()> {
    if stored == requested {
        return Ok(());
    }
    Err(miette::miette!(
        help = "Delete the credential first to change its auth type",
        "Credential {system} already exists with auth type '{stored}', not '{requested}'"
    ))
}

pub async fn get(env: &Env, tenant: &str, system: &str) -> Result<()> {
    let output = Output::new();
    let ctx = context(tenant)?;
    let credential = store(env).await?.get(&ctx, system).await?;

    output.section(&format!("Credential {}/{}", tenant, system.bright_cyan()));
    output.info("Id:", &credential.id);
    output.info("Auth type:", &credential.auth_type);
    output.info(
        "Expires:",
        &credential
            .expires_at
            .map(format_relative_time)
            .unwrap_or_else(|| "Never".to_string()),
    );
    output.info("Updated:", &format_relative_time(credential.updated_at));
    output.print("");
    output.print(&serde_json::to_string_pretty(&credential.payload).into_diagnostic()?);
    Ok(())
}

pub async fn delete(env: &Env, tenant: &str, system: &str) -> Result<()> {
    let output = Output::new();
    let ctx = context(tenant)?;
    if store(env).await?.delete(&ctx, system).await? {
        output.success(&format!("Deleted credential {}", system.bright_cyan()));
    } else {
        output.warning(&format!("No credential named {system}"));
    }
    Ok(())
}

pub async fn list(env: &Env, tenant: &str, include_expired: bool) -> Result<()> {
    let output = Output::new();
    let ctx = context(tenant)?;
    let credentials = store(env).await?.list(&ctx, include_expired).await?;

    output.section(&format!("Credentials for {}", tenant.bright_cyan()));
    if credentials.is_empty() {
        output.status("No credentials stored.");
        return Ok(());
    }
    for credential in credentials {
        let state = if !credential.is_active {
            "INACTIVE".bright_red().to_string()
        } else if credential.is_expired {
            "EXPIRED".yellow().to_string()
        } else {
            "ACTIVE".bright_green().to_string()
        };
        let expires = credential
            .expires_at
            .map(|at| format!("expires {}", format_relative_time(at)))
            .unwrap_or_else(|| "no expiry".to_string());
        output.list_item(&format!(
            "{} ({}) {} {}",
            credential.system_name.bold(),
            credential.auth_type,
            state,
            expires.dimmed()
        ));
    }
    Ok(())
}
