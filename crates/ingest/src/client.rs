//! Stripe API client

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use stripe::{Client, StripeError};
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;

use crate::error::{IngestError, IngestResult};

/// Wait between attempts when Stripe rate-limits or reports a lock timeout
const RETRY_INTERVAL: Duration = Duration::from_secs(3);
const RETRY_ATTEMPTS: usize = 3;

/// Stripe configuration
#[derive(Debug, Clone)]
pub struct StripeConfig {
    pub secret_key: String,
    /// Signing secret for inbound webhooks. Signatures are not checked when unset.
    pub webhook_secret: Option<String>,
}

impl StripeConfig {
    /// Load from `STRIPE_SECRET_KEY` and `STRIPE_WEBHOOK_SECRET`
    pub fn from_env() -> IngestResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| IngestError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        if secret_key.trim().is_empty() {
            return Err(IngestError::Config("STRIPE_SECRET_KEY is empty".to_string()));
        }

        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            secret_key,
            webhook_secret,
        })
    }
}

/// Thin wrapper around the async-stripe client used for read-only lookups
#[derive(Clone)]
pub struct StripeClient {
    inner: Client,
    config: StripeConfig,
}

impl StripeClient {
    pub fn new(config: StripeConfig) -> Self {
        let inner = Client::new(config.secret_key.clone());
        Self { inner, config }
    }

    pub fn from_env() -> IngestResult<Self> {
        Ok(Self::new(StripeConfig::from_env()?))
    }

    pub fn config(&self) -> &StripeConfig {
        &self.config
    }

    pub fn inner(&self) -> &Client {
        &self.inner
    }

    /// GET `path` with query `params`, retrying on rate limits and lock timeouts
    pub async fn get<T, P>(&self, path: &str, params: &P) -> IngestResult<T>
    where
        T: DeserializeOwned + Send + 'static,
        P: Serialize,
    {
        let strategy = FixedInterval::new(RETRY_INTERVAL).take(RETRY_ATTEMPTS);

        RetryIf::spawn(
            strategy,
            || self.inner.get_query::<T, &P>(path, params),
            |err: &StripeError| {
                let retry = is_retryable(err);
                if retry {
                    tracing::warn!(path = %path, error = %err, "Stripe request throttled, retrying");
                }
                retry
            },
        )
        .await
        .map_err(|e| {
            tracing::error!(path = %path, error = %e, "Stripe request failed");
            IngestError::from(e)
        })
    }
}

/// Rate limiting (429) and object lock timeouts (409) clear on their own
fn is_retryable(err: &StripeError) -> bool {
    matches!(err, StripeError::Stripe(req) if req.http_status == 429 || req.http_status == 409)
}
