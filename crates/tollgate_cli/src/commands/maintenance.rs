use miette::Result;
use tollgate_core::{Maintenance, MaintenancePolicy};

use crate::helpers::Env;
use crate::output::Output;

pub async fn run(env: &Env, policy: MaintenancePolicy) -> Result<()> {
    let output = Output::new();
    let report = Maintenance::new(env.db().await?).run(policy).await?;

    output.section("Maintenance");
    output.info("Tokens deactivated:", &report.tokens_deactivated.to_string());
    output.info("Tokens deleted:", &report.tokens_deleted.to_string());
    output.info("Usage entries deleted:", &report.usage_entries_deleted.to_string());
    output.info("Leases deleted:", &report.leases_deleted.to_string());
    Ok(())
}
