//! Token pool commands.

use miette::Result;
use owo_colors::OwoColorize;

use crate::helpers::{Env, context};
use crate::output::{Output, format_relative_time};

pub async fn store(env: &Env, tenant: &str, provider: &str, value: &str) -> Result<()> {
    let output = Output::new();
    let ctx = context(tenant)?;
    let pool = env.pool(provider).await?;
    let token = pool.store(&ctx, value, Some("cli"), None, None).await?;

    output.success(&format!("Stored token for {}", provider.bright_cyan()));
    output.info("Id:", &token.id);
    output.info("Hash:", token.hash_preview());
    output.info("Expires:", &format_relative_time(token.expires_at));
    Ok(())
}

/// Dispense a pooled token. Without a generator this only reuses.
pub async fn get(env: &Env, tenant: &str, provider: &str) -> Result<()> {
    let output = Output::new();
    let ctx = context(tenant)?;
    let pool = env.pool(provider).await?;
    let token = pool.get_valid_token(&ctx, "cli.get").await?;

    output.info("Id:", &token.token_id);
    output.info("Uses:", &token.usage_count.to_string());
    output.info("Expires:", &format_relative_time(token.expires_at));
    output.print(&token.value);
    Ok(())
}

pub async fn stats(env: &Env, tenant: &str, provider: &str) -> Result<()> {
    let output = Output::new();
    let ctx = context(tenant)?;
    let pool = env.pool(provider).await?;
    let stats = pool.statistics(&ctx).await?;
    let metrics = pool.coordination_metrics(&ctx).await?;

    output.section(&format!("Token pool {}/{}", tenant, provider.bright_cyan()));
    output.info("Active:", &format!("{} of {}", stats.active, stats.max_tokens));
    output.info("Expired:", &stats.expired.to_string());
    output.info("Inactive:", &stats.inactive.to_string());
    output.info("Available slots:", &stats.available_slots.to_string());
    output.info("Validity:", &format!("{}h", stats.token_validity_hours));
    if let Some(age) = stats.oldest_active_token_age_seconds {
        output.info("Oldest active:", &format!("{}m", age / 60));
    }
    output.print("");
    output.info("Held locks:", &metrics.active_leases.to_string());
    output.info("Lock acquisitions:", &metrics.total_attempts.to_string());
    Ok(())
}

pub async fn cleanup(env: &Env, tenant: &str, provider: &str, force: bool) -> Result<()> {
    let output = Output::new();
    let ctx = context(tenant)?;
    let pool = env.pool(provider).await?;
    let deactivated = pool.cleanup_expired_tokens(&ctx, force).await?;
    output.success(&format!("Deactivated {deactivated} expired tokens"));
    Ok(())
}
