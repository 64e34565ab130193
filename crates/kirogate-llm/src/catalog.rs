//! Model names and upstream model metadata

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use kirogate_auth::AccessGrant;
use kirogate_config::{ModelsConfig, UpstreamConfig};
use mini_moka::sync::Cache;
use tokio::sync::Mutex;

use crate::error::LlmError;
use crate::protocol::kiro::{KiroModelList, ORIGIN};
use crate::transport::upstream_headers;

/// Public model names and the upstream ids they map to
const BUILTIN_MODELS: &[(&str, &str)] = &[
    ("claude-opus-4-5", "claude-opus-4.5"),
    ("claude-opus-4-5-20251101", "claude-opus-4.5"),
    ("claude-haiku-4-5", "claude-haiku-4.5"),
    ("claude-haiku-4-5-20251001", "claude-haiku-4.5"),
    ("claude-sonnet-4-5", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4-5-20250929", "CLAUDE_SONNET_4_5_20250929_V1_0"),
    ("claude-sonnet-4", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
];

/// Routes to whatever the upstream currently considers its default
const AUTO_MODEL: (&str, &str) = ("auto", "claude-sonnet-4.5");

/// Static mapping from public model names to upstream ids
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    /// Listed by `/v1/models`, in order
    public: IndexMap<String, String>,
    /// Accepted but not listed
    hidden: IndexMap<String, String>,
}

impl ModelCatalog {
    /// Built-in names plus configured aliases; aliases win on conflict
    pub fn new(config: &ModelsConfig) -> Self {
        let mut public: IndexMap<String, String> = BUILTIN_MODELS
            .iter()
            .map(|(name, id)| ((*name).to_owned(), (*id).to_owned()))
            .collect();
        public.extend(config.aliases.iter().map(|(name, id)| (name.clone(), id.clone())));

        let hidden = IndexMap::from([
            (AUTO_MODEL.0.to_owned(), AUTO_MODEL.1.to_owned()),
            ("claude-haiku-4.5".to_owned(), "claude-haiku-4.5".to_owned()),
        ]);

        Self { public, hidden }
    }

    /// Upstream id for a requested model
    ///
    /// Upstream ids are accepted verbatim.
    pub fn resolve(&self, model: &str) -> Result<&str, LlmError> {
        if let Some(id) = self.public.get(model).or_else(|| self.hidden.get(model)) {
            return Ok(id);
        }

        self.public
            .values()
            .chain(self.hidden.values())
            .find(|id| id.as_str() == model)
            .map(String::as_str)
            .ok_or_else(|| LlmError::ModelNotFound {
                model: model.to_owned(),
                available: self.public_names().collect::<Vec<_>>().join(", "),
            })
    }

    /// Names advertised to callers
    pub fn public_names(&self) -> impl Iterator<Item = &str> {
        self.public.keys().map(String::as_str)
    }
}

/// How long a failed listing keeps callers on the default context size
const FAILED_LISTING_TTL: Duration = Duration::from_secs(60);

/// Upper bound for one listing call, well below chat timeouts
const LISTING_TIMEOUT: Duration = Duration::from_secs(10);

/// Context window sizes reported by `ListAvailableModels`
///
/// Fetched lazily per region and cached for the configured TTL. Lookups
/// never fail: an unreachable listing falls back to the configured default
/// and is not retried for a minute. Concurrent misses share one fetch.
pub struct ModelInfoCache {
    http: reqwest::Client,
    upstream: Arc<UpstreamConfig>,
    limits: Cache<String, Arc<HashMap<String, u32>>>,
    failed: Cache<String, ()>,
    fetching: Mutex<()>,
    default_max_input_tokens: u32,
}

impl ModelInfoCache {
    pub fn new(http: reqwest::Client, upstream: Arc<UpstreamConfig>, config: &ModelsConfig) -> Self {
        Self {
            http,
            upstream,
            limits: Cache::builder().max_capacity(64).time_to_live(config.cache_ttl()).build(),
            failed: Cache::builder().max_capacity(64).time_to_live(FAILED_LISTING_TTL).build(),
            fetching: Mutex::new(()),
            default_max_input_tokens: config.default_max_input_tokens,
        }
    }

    /// `maxInputTokens` for an upstream model id
    pub async fn max_input_tokens(&self, model_id: &str, grant: &AccessGrant) -> u32 {
        self.limits_for(grant)
            .await
            .and_then(|limits| limits.get(model_id).copied())
            .unwrap_or(self.default_max_input_tokens)
    }

    async fn limits_for(&self, grant: &AccessGrant) -> Option<Arc<HashMap<String, u32>>> {
        if let Some(limits) = self.limits.get(&grant.region) {
            return Some(limits);
        }
        if self.failed.get(&grant.region).is_some() {
            return None;
        }

        // Whoever waited on the lock finds the winner's result in a cache
        let _guard = self.fetching.lock().await;
        if let Some(limits) = self.limits.get(&grant.region) {
            return Some(limits);
        }
        if self.failed.get(&grant.region).is_some() {
            return None;
        }

        match self.fetch(grant).await {
            Ok(limits) => {
                let limits = Arc::new(limits);
                self.limits.insert(grant.region.clone(), Arc::clone(&limits));
                Some(limits)
            }
            Err(e) => {
                tracing::warn!(region = %grant.region, error = %e, "model listing unavailable, using default context size");
                self.failed.insert(grant.region.clone(), ());
                None
            }
        }
    }

    async fn fetch(&self, grant: &AccessGrant) -> Result<HashMap<String, u32>, LlmError> {
        let mut url = self
            .upstream
            .models_endpoint(&grant.region)
            .map_err(|e| LlmError::Internal(anyhow::anyhow!("invalid models endpoint: {e}")))?;
        url.query_pairs_mut().append_pair("origin", ORIGIN);
        if let Some(arn) = &grant.profile_arn {
            url.query_pairs_mut().append_pair("profileArn", arn);
        }

        let response = self
            .http
            .get(url)
            .headers(upstream_headers(grant, 1, 1)?)
            .timeout(LISTING_TIMEOUT.min(self.upstream.timeouts.connect()))
            .send()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let listing: KiroModelList = response
            .json()
            .await
            .map_err(|e| LlmError::Transport(format!("malformed model listing: {e}")))?;

        tracing::info!(region = %grant.region, models = listing.models.len(), "model listing refreshed");

        Ok(listing
            .models
            .into_iter()
            .filter_map(|model| {
                let limit = model.token_limits?.max_input_tokens?;
                Some((model.model_id, limit))
            })
            .collect())
    }
}
