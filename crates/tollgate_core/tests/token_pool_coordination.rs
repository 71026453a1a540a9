//! Integration tests for token pools shared by independent workers.
//!
//! Each worker opens its own handle on a file-backed vault, the way separate
//! processes would. Nothing but the database is shared between them.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::json;
use tempfile::TempDir;
use tollgate_core::{
    CoreError, CredentialService, CredentialStore, CryptoBox, FnGenerator, GenerationRequest,
    MasterKey, PoolConfig, RequestContext, TokenGenerator, TokenPool, TokenSource,
};
use tollgate_db::VaultDb;

fn crypto_box() -> CryptoBox {
    CryptoBox::new(MasterKey::from_bytes(&[42u8; 32]).unwrap())
}

fn ctx(tenant: &str) -> RequestContext {
    RequestContext::new(tenant).unwrap()
}

/// Generator that sleeps, then returns a distinct token per call.
fn slow_generator(calls: Arc<AtomicUsize>, delay: Duration) -> Arc<dyn TokenGenerator> {
    Arc::new(FnGenerator::new(move |req: GenerationRequest| {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(delay).await;
            Ok(format!("{}-{}-tok-{n}", req.tenant_id, req.provider))
        }
    }))
}

async fn worker(path: &Path, config: PoolConfig, generator: Arc<dyn TokenGenerator>) -> TokenPool {
    let db = VaultDb::open(path).await.unwrap();
    TokenPool::new(db, crypto_box(), "shopify", config)
        .unwrap()
        .with_generator(generator)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn thundering_herd_generates_few_tokens() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.db");
    let calls = Arc::new(AtomicUsize::new(0));
    let generator = slow_generator(calls.clone(), Duration::from_millis(50));

    let mut workers = Vec::new();
    for _ in 0..10 {
        workers.push(worker(&path, PoolConfig::default(), generator.clone()).await);
    }

    let handles: Vec<_> = workers
        .into_iter()
        .enumerate()
        .map(|(i, pool)| {
            tokio::spawn(async move {
                let ctx = ctx("acme").with_request_id(format!("req-{i}"));
                pool.get_valid_token(&ctx, "orders.list").await
            })
        })
        .collect();

    let mut values = HashSet::new();
    for handle in handles {
        let token = handle.await.unwrap().unwrap();
        values.insert(token.value);
    }

    assert!(calls.load(Ordering::SeqCst) <= 3, "generated {} tokens", calls.load(Ordering::SeqCst));
    assert!(!values.is_empty() && values.len() <= 3);
}

#[tokio::test]
async fn acme_shopify_scenario() {
    let dir = TempDir::new().unwrap();
    let db = VaultDb::open(dir.path().join("vault.db")).await.unwrap();
    let generator: Arc<dyn TokenGenerator> =
        Arc::new(FnGenerator::new(|_req: GenerationRequest| async move { Ok("tok-123".to_string()) }));

    let service = CredentialService::new(CredentialStore::new(Arc::new(db.clone()), crypto_box()))
        .with_provider(db, crypto_box(), "shopify", PoolConfig::default())
        .unwrap()
        .with_generator("shopify", generator)
        .unwrap();
    let acme = ctx("acme");

    service
        .store_credentials(
            &acme,
            "shopify",
            "api_token",
            &json!({"api_key": "k", "shop": "acme.myshopify.com"}),
            None,
        )
        .await
        .unwrap();
    let credential = service.get_credentials(&acme, "shopify").await.unwrap();
    assert_eq!(credential.payload["shop"], "acme.myshopify.com");

    let first = service
        .get_valid_access_token(&acme, "shopify", "orders.list")
        .await
        .unwrap();
    assert_eq!(first.value, "tok-123");
    assert_eq!(first.source, TokenSource::Generated);

    let second = service
        .get_valid_access_token(&acme, "shopify", "orders.list")
        .await
        .unwrap();
    assert_eq!(second.value, "tok-123");
    assert_eq!(second.source, TokenSource::Reused);
    assert_eq!(second.usage_count, 2);
}

#[tokio::test]
async fn limit_enforced_across_workers() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.db");
    let config = PoolConfig {
        max_tokens: 3,
        ..PoolConfig::default()
    };
    let calls = Arc::new(AtomicUsize::new(0));
    let generator = slow_generator(calls, Duration::ZERO);

    let a = worker(&path, config.clone(), generator.clone()).await;
    let b = worker(&path, config, generator).await;
    let acme = ctx("acme");

    a.store(&acme, "t1", None, None, None).await.unwrap();
    b.store(&acme, "t2", None, None, None).await.unwrap();
    a.store(&acme, "t3", None, None, None).await.unwrap();

    let err = b.store(&acme, "t4", None, None, None).await.unwrap_err();
    assert!(err.is_validation(), "unexpected error: {err}");
    assert_eq!(a.statistics(&acme).await.unwrap().available_slots, 0);
}

#[tokio::test]
async fn tenants_never_share_tokens() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("vault.db");
    let calls = Arc::new(AtomicUsize::new(0));
    let generator = slow_generator(calls.clone(), Duration::ZERO);
    let pool = worker(&path, PoolConfig::default(), generator).await;

    let acme = pool.get_valid_token(&ctx("acme"), "op").await.unwrap();
    let globex = pool.get_valid_token(&ctx("globex"), "op").await.unwrap();

    assert_ne!(acme.token_id, globex.token_id);
    assert_eq!(acme.value, "acme-shopify-tok-1");
    assert_eq!(globex.value, "globex-shopify-tok-2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // A token id from another tenant is invisible.
    let err = pool
        .report_usage(&ctx("globex"), &acme.token_id, "op", Default::default())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));

    let stats = pool.statistics(&ctx("acme")).await.unwrap();
    assert_eq!(stats.active, 1);
}

#[tokio::test]
async fn ciphertext_is_bound_to_its_tenant() {
    let crypto = crypto_box();
    let acme = ctx("acme").tenant;
    let globex = ctx("globex").tenant;

    let sealed = crypto
        .encrypt(&acme, tollgate_core::crypto::KeyPurpose::Token, b"tok-123")
        .unwrap();
    assert!(
        crypto
            .decrypt(&globex, tollgate_core::crypto::KeyPurpose::Token, &sealed)
            .is_err()
    );
    assert!(
        crypto
            .decrypt(&acme, tollgate_core::crypto::KeyPurpose::Credential, &sealed)
            .is_err()
    );
}
