//! Pluggable token generation.
//!
//! A generator may be invoked by several workers at once when the pool is
//! empty and locks time out. Each call must produce an independent token or
//! fail; returning an empty string counts as failure.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;

/// What the generator is asked to produce a token for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub tenant_id: String,
    pub provider: String,
    pub operation: String,
    pub request_id: String,
    /// Lock holder identity of the generating worker.
    pub holder: String,
}

#[derive(Error, Diagnostic, Debug)]
#[error("Token generation failed: {message}")]
#[diagnostic(code(tollgate_core::generation))]
pub struct GenerationError {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl GenerationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

#[async_trait]
pub trait TokenGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError>;
}

type BoxedGeneration = Pin<Box<dyn Future<Output = Result<String, GenerationError>> + Send>>;

/// Adapts an async closure into a [`TokenGenerator`].
///
/// ```rust,ignore
/// let generator = FnGenerator::new(|req| async move {
///     Ok(format!("tok-{}", req.request_id))
/// });
/// ```
pub struct FnGenerator {
    f: Box<dyn Fn(GenerationRequest) -> BoxedGeneration + Send + Sync>,
}

impl FnGenerator {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(GenerationRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, GenerationError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |request| Box::pin(f(request))),
        }
    }
}

impl std::fmt::Debug for FnGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FnGenerator")
    }
}

#[async_trait]
impl TokenGenerator for FnGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String, GenerationError> {
        (self.f)(request.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest {
            tenant_id: "acme".to_string(),
            provider: "shopify".to_string(),
            operation: "orders.list".to_string(),
            request_id: "req-1".to_string(),
            holder: "worker_0000_test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_fn_generator_passes_request() {
        let generator = FnGenerator::new(|req: GenerationRequest| async move {
            Ok(format!("{}-{}", req.provider, req.request_id))
        });
        assert_eq!(generator.generate(&request()).await.unwrap(), "shopify-req-1");
    }

    #[tokio::test]
    async fn test_fn_generator_propagates_error() {
        let generator =
            FnGenerator::new(|_req| async move { Err(GenerationError::new("upstream 503")) });
        let err = generator.generate(&request()).await.unwrap_err();
        assert_eq!(err.message, "upstream 503");
    }
}
