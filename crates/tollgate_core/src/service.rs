//! Front door for callers: credentials plus one token pool per provider.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tollgate_db::{AccessToken, VaultDb};

use crate::config::{PoolConfig, TollgateConfig};
use crate::context::RequestContext;
use crate::credentials::{CredentialStore, DecryptedCredential};
use crate::crypto::CryptoBox;
use crate::error::{CoreError, CoreResult};
use crate::generator::TokenGenerator;
use crate::pool::{DispensedToken, TokenPool};

#[derive(Debug)]
pub struct CredentialService {
    credentials: CredentialStore,
    pools: HashMap<String, TokenPool>,
}

impl CredentialService {
    pub fn new(credentials: CredentialStore) -> Self {
        Self {
            credentials,
            pools: HashMap::new(),
        }
    }

    /// Service over `db` with a pool for every provider named in `config`.
    pub fn from_config(db: VaultDb, crypto: CryptoBox, config: &TollgateConfig) -> CoreResult<Self> {
        let credentials = CredentialStore::new(Arc::new(db.clone()), crypto.clone());
        let mut service = Self::new(credentials);
        for provider in config.providers.keys() {
            let pool = TokenPool::new(
                db.clone(),
                crypto.clone(),
                provider.as_str(),
                config.pool_config(provider),
            )?;
            service = service.with_pool(pool);
        }
        Ok(service)
    }

    /// Register a pool, replacing any existing one for the same provider.
    pub fn with_pool(mut self, pool: TokenPool) -> Self {
        self.pools.insert(pool.provider().to_string(), pool);
        self
    }

    /// Convenience for `with_pool(TokenPool::new(..))`.
    pub fn with_provider(
        self,
        db: VaultDb,
        crypto: CryptoBox,
        provider: &str,
        config: PoolConfig,
    ) -> CoreResult<Self> {
        Ok(self.with_pool(TokenPool::new(db, crypto, provider, config)?))
    }

    /// Attach a generator to an already registered provider.
    pub fn with_generator(
        mut self,
        provider: &str,
        generator: Arc<dyn TokenGenerator>,
    ) -> CoreResult<Self> {
        let pool = self
            .pools
            .remove(provider)
            .ok_or_else(|| pool_not_configured(provider))?;
        self.pools
            .insert(provider.to_string(), pool.with_generator(generator));
        Ok(self)
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    pub fn pool(&self, provider: &str) -> CoreResult<&TokenPool> {
        self.pools
            .get(provider)
            .ok_or_else(|| pool_not_configured(provider))
    }

    pub fn providers(&self) -> impl Iterator<Item = &str> {
        self.pools.keys().map(String::as_str)
    }

    pub async fn get_credentials(
        &self,
        ctx: &RequestContext,
        system_name: &str,
    ) -> CoreResult<DecryptedCredential> {
        self.credentials.get(ctx, system_name).await
    }

    pub async fn store_credentials(
        &self,
        ctx: &RequestContext,
        system_name: &str,
        auth_type: &str,
        payload: &serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<String> {
        self.credentials
            .create(ctx, system_name, auth_type, payload, expires_at)
            .await
    }

    pub async fn update_credentials(
        &self,
        ctx: &RequestContext,
        system_name: &str,
        payload: &serde_json::Value,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<()> {
        self.credentials
            .update(ctx, system_name, payload, expires_at)
            .await
    }

    pub async fn delete_credentials(&self, ctx: &RequestContext, system_name: &str) -> CoreResult<bool> {
        self.credentials.delete(ctx, system_name).await
    }

    pub async fn store_access_token(
        &self,
        ctx: &RequestContext,
        provider: &str,
        raw_token: &str,
        generated_by: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> CoreResult<AccessToken> {
        self.pool(provider)?
            .store(ctx, raw_token, generated_by, None, expires_at)
            .await
    }

    pub async fn get_valid_access_token(
        &self,
        ctx: &RequestContext,
        provider: &str,
        operation: &str,
    ) -> CoreResult<DispensedToken> {
        self.pool(provider)?.get_valid_token(ctx, operation).await
    }
}

fn pool_not_configured(provider: &str) -> CoreError {
    CoreError::service(
        format!("token pool '{provider}'"),
        "token pool not configured",
    )
}
