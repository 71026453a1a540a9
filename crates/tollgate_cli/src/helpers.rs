use std::path::{Path, PathBuf};

use miette::Result;
use tollgate_core::{CryptoBox, RequestContext, TokenPool, TollgateConfig};
use tollgate_db::VaultDb;
use tracing::info;

/// Resolved configuration plus the command line overrides.
pub struct Env {
    pub config: TollgateConfig,
}

impl Env {
    pub async fn load(config_path: Option<&Path>, db_path: Option<PathBuf>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                info!("Loading config from: {:?}", path);
                TollgateConfig::load(path).await?
            }
            None => {
                info!("Loading config from standard locations");
                TollgateConfig::load_from_standard_locations().await?
            }
        };
        if let Some(db_path) = db_path {
            config.database.path = db_path;
        }
        Ok(Self { config })
    }

    pub async fn db(&self) -> Result<VaultDb> {
        Ok(VaultDb::open(&self.config.database.path).await?)
    }

    pub fn crypto(&self) -> Result<CryptoBox> {
        Ok(CryptoBox::new(self.config.master_key()?))
    }

    /// Pool for `provider`, using its configured settings or the defaults.
    pub async fn pool(&self, provider: &str) -> Result<TokenPool> {
        let pool = TokenPool::new(
            self.db().await?,
            self.crypto()?,
            provider,
            self.config.pool_config(provider),
        )?;
        Ok(pool)
    }
}

pub fn context(tenant: &str) -> Result<RequestContext> {
    Ok(RequestContext::new(tenant)?.with_request_id(format!("cli-{}", std::process::id())))
}
