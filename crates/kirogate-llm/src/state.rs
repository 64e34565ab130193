//! Process-wide state shared by the LLM route handlers

use std::sync::Arc;

use kirogate_auth::{CredentialStore, HttpRefresher, TokenRefresher};
use kirogate_config::{ModelsConfig, UpstreamConfig};
use kirogate_core::BackoffPolicy;

use crate::relay::StreamingRelay;

/// Shared state for LLM route handlers
///
/// Built once at startup; the credential store and model caches inside
/// bound their own lifetimes.
#[derive(Clone)]
pub struct LlmState {
    pub(crate) relay: Arc<StreamingRelay>,
}

impl LlmState {
    /// Build the credential store, transport and caches from configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a configured credentials file is unreadable or
    /// an HTTP client cannot be built
    pub async fn from_config(upstream: UpstreamConfig, models: &ModelsConfig) -> anyhow::Result<Self> {
        let upstream = Arc::new(upstream);
        let retry = &upstream.retry;
        let backoff = BackoffPolicy::new(retry.max_attempts, retry.base_delay(), retry.max_delay(), retry.jitter);

        let refresher: Arc<dyn TokenRefresher> = Arc::new(HttpRefresher::new(Arc::clone(&upstream), backoff)?);
        let store = CredentialStore::from_config(&upstream, refresher).await?;

        Ok(Self::new(StreamingRelay::from_config(upstream, models, store)?))
    }

    pub fn new(relay: StreamingRelay) -> Self {
        Self { relay: Arc::new(relay) }
    }

    pub fn relay(&self) -> &StreamingRelay {
        &self.relay
    }
}
