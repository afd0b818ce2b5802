use std::{fmt, future::Future, pin::Pin, sync::Arc, time::Duration};

use axum::http::HeaderMap;
use thiserror::Error;
use tracing::warn;
use webhook_gate_storage::{TenantSecretError, TenantSecretRepository};

/// Shared webhook signing key. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(Arc<[u8]>);

impl WebhookSecret {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into().into_boxed_slice()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret(**redacted**)")
    }
}

pub type SecretFuture = Pin<Box<dyn Future<Output = Result<WebhookSecret, SecretError>> + Send>>;

type SecretLookup = Arc<dyn Fn(&HeaderMap) -> SecretFuture + Send + Sync>;

/// Where the signing key for a request comes from.
#[derive(Clone)]
pub enum SecretResolver {
    Static(WebhookSecret),
    /// Per-request lookup, e.g. keyed by a tenant header.
    Dynamic(SecretLookup),
}

impl SecretResolver {
    pub fn fixed(secret: impl Into<Vec<u8>>) -> Self {
        Self::Static(WebhookSecret::new(secret))
    }

    pub fn dynamic<F>(lookup: F) -> Self
    where
        F: Fn(&HeaderMap) -> SecretFuture + Send + Sync + 'static,
    {
        Self::Dynamic(Arc::new(lookup))
    }

    /// Resolves the secret registered in storage for the tenant named by `header`.
    pub fn tenant(repository: TenantSecretRepository, header: String) -> Self {
        Self::dynamic(move |headers: &HeaderMap| {
            let tenant = headers
                .get(header.as_str())
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let header = header.clone();
            let repository = repository.clone();
            Box::pin(async move {
                let tenant = tenant
                    .filter(|tenant| !tenant.is_empty())
                    .ok_or(SecretError::MissingTenant(header))?;
                let secret = repository
                    .fetch(&tenant)
                    .await?
                    .ok_or_else(|| SecretError::UnknownTenant(tenant))?;
                Ok::<_, SecretError>(WebhookSecret::new(secret))
            })
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Static(_) => "static",
            Self::Dynamic(_) => "dynamic",
        }
    }

    /// Produces the secret for one request, bounded by `timeout`.
    pub async fn resolve(
        &self,
        headers: &HeaderMap,
        timeout: Duration,
    ) -> Result<WebhookSecret, SecretError> {
        let lookup = match self {
            Self::Static(secret) => return Ok(secret.clone()),
            Self::Dynamic(lookup) => lookup(headers),
        };

        let secret = match tokio::time::timeout(timeout, lookup).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    stage = "secret",
                    timeout_ms = timeout.as_millis() as u64,
                    "secret resolution timed out"
                );
                return Err(SecretError::Timeout(timeout));
            }
        };

        if secret.as_bytes().is_empty() {
            return Err(SecretError::Empty);
        }
        Ok(secret)
    }
}

impl fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretResolver::{}", self.kind())
    }
}

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("secret resolution timed out after {0:?}")]
    Timeout(Duration),
    #[error("request is missing tenant header {0}")]
    MissingTenant(String),
    #[error("no webhook secret registered for tenant {0}")]
    UnknownTenant(String),
    #[error("resolved webhook secret is empty")]
    Empty,
    #[error("failed to load tenant secret: {0}")]
    Storage(#[from] TenantSecretError),
}
