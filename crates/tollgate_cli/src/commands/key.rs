use miette::Result;
use tollgate_core::MasterKey;
use tollgate_core::crypto::MASTER_KEY_ENV;

use crate::output::Output;

pub fn generate() -> Result<()> {
    let output = Output::new();
    let key = MasterKey::generate()?;
    output.status(&format!("Store this as {MASTER_KEY_ENV} or `master_key` in the config:"));
    output.print(&key.to_base64());
    Ok(())
}
