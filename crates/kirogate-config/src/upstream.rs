use std::path::PathBuf;
use std::time::Duration;

use indexmap::IndexMap;
use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

/// Region used when neither config nor credentials file names one
pub const DEFAULT_REGION: &str = "us-east-1";

/// Name of the tier every unmapped model falls into
pub const DEFAULT_TIER: &str = "default";

/// Upstream credentials, endpoints and dispatch policy
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// AWS region the upstream endpoints live in
    #[serde(default = "default_region")]
    pub region: String,
    /// Refresh token for the default tenant
    #[serde(default)]
    pub refresh_token: Option<SecretString>,
    /// Profile ARN sent with chat and model-list requests
    #[serde(default)]
    pub profile_arn: Option<String>,
    /// JSON credentials file merged over the values above
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
    /// OIDC client id, selects IDC refresh when paired with a secret
    #[serde(default)]
    pub client_id: Option<String>,
    /// OIDC client secret
    #[serde(default)]
    pub client_secret: Option<SecretString>,
    /// Override for the chat endpoint
    #[serde(default)]
    pub chat_url: Option<Url>,
    /// Override for the social token refresh endpoint
    #[serde(default)]
    pub refresh_url: Option<Url>,
    /// Override for the IDC token endpoint
    #[serde(default)]
    pub idc_refresh_url: Option<Url>,
    /// Override for the model listing endpoint
    #[serde(default)]
    pub models_url: Option<Url>,
    /// Tokens expiring within this window are refreshed before use
    #[serde(default = "default_refresh_margin_secs")]
    pub refresh_margin_secs: u64,
    /// Maximum number of multi-tenant credentials kept in memory
    #[serde(default = "default_tenant_cache_capacity")]
    pub tenant_cache_capacity: u64,
    /// Idle tenants are evicted after this many seconds
    #[serde(default = "default_tenant_cache_idle_secs")]
    pub tenant_cache_idle_secs: u64,
    /// Upper bound on simultaneous upstream calls per tenant
    #[serde(default = "default_max_concurrent_per_tenant")]
    pub max_concurrent_per_tenant: usize,
    /// Backoff policy for chat and refresh calls
    #[serde(default)]
    pub retry: RetryConfig,
    /// Timeout policy
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            refresh_token: None,
            profile_arn: None,
            credentials_file: None,
            client_id: None,
            client_secret: None,
            chat_url: None,
            refresh_url: None,
            idc_refresh_url: None,
            models_url: None,
            refresh_margin_secs: default_refresh_margin_secs(),
            tenant_cache_capacity: default_tenant_cache_capacity(),
            tenant_cache_idle_secs: default_tenant_cache_idle_secs(),
            max_concurrent_per_tenant: default_max_concurrent_per_tenant(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl UpstreamConfig {
    /// Chat endpoint for a region, honoring the configured override
    ///
    /// # Errors
    ///
    /// Returns an error if the region produces an invalid URL
    pub fn chat_endpoint(&self, region: &str) -> Result<Url, url::ParseError> {
        override_or(
            self.chat_url.as_ref(),
            &format!("https://codewhisperer.{region}.amazonaws.com/generateAssistantResponse"),
        )
    }

    /// Social (desktop) token refresh endpoint for a region
    ///
    /// # Errors
    ///
    /// Returns an error if the region produces an invalid URL
    pub fn refresh_endpoint(&self, region: &str) -> Result<Url, url::ParseError> {
        override_or(
            self.refresh_url.as_ref(),
            &format!("https://prod.{region}.auth.desktop.kiro.dev/refreshToken"),
        )
    }

    /// IDC (SSO OIDC) token endpoint for a region
    ///
    /// # Errors
    ///
    /// Returns an error if the region produces an invalid URL
    pub fn idc_refresh_endpoint(&self, region: &str) -> Result<Url, url::ParseError> {
        override_or(
            self.idc_refresh_url.as_ref(),
            &format!("https://oidc.{region}.amazonaws.com/token"),
        )
    }

    /// Model listing endpoint for a region
    ///
    /// # Errors
    ///
    /// Returns an error if the region produces an invalid URL
    pub fn models_endpoint(&self, region: &str) -> Result<Url, url::ParseError> {
        override_or(
            self.models_url.as_ref(),
            &format!("https://q.{region}.amazonaws.com/ListAvailableModels"),
        )
    }

    pub const fn refresh_margin(&self) -> Duration {
        Duration::from_secs(self.refresh_margin_secs)
    }

    pub const fn tenant_cache_idle(&self) -> Duration {
        Duration::from_secs(self.tenant_cache_idle_secs)
    }
}

fn override_or(configured: Option<&Url>, fallback: &str) -> Result<Url, url::ParseError> {
    configured.map_or_else(|| Url::parse(fallback), |url| Ok(url.clone()))
}

/// Exponential backoff settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Total attempts including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling for any single delay, including server-supplied ones
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fraction of each delay randomized in either direction
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub const fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub const fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Timeout settings for chat requests
///
/// `tiers` bounds the time from dispatch until the first response byte.
/// Once bytes flow, `idle_secs` bounds the gap between frames and
/// `total_secs` bounds the whole request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_idle_secs")]
    pub idle_secs: u64,
    #[serde(default = "default_total_secs")]
    pub total_secs: u64,
    /// Tier name to first-byte timeout in seconds
    #[serde(default = "default_tiers")]
    pub tiers: IndexMap<String, u64>,
    /// Model name (public or upstream) to tier name
    #[serde(default = "default_model_tiers")]
    pub models: IndexMap<String, String>,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            idle_secs: default_idle_secs(),
            total_secs: default_total_secs(),
            tiers: default_tiers(),
            models: default_model_tiers(),
        }
    }
}

impl TimeoutConfig {
    /// Tier a model belongs to
    pub fn tier_for(&self, model: &str) -> &str {
        self.models.get(model).map_or(DEFAULT_TIER, String::as_str)
    }

    /// First-byte timeout for a tier, falling back to the default tier
    pub fn first_byte_timeout(&self, tier: &str) -> Duration {
        let secs = self
            .tiers
            .get(tier)
            .or_else(|| self.tiers.get(DEFAULT_TIER))
            .copied()
            .unwrap_or_else(default_tier_secs);
        Duration::from_secs(secs)
    }

    pub const fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub const fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub const fn total(&self) -> Duration {
        Duration::from_secs(self.total_secs)
    }
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

const fn default_refresh_margin_secs() -> u64 {
    600
}

const fn default_tenant_cache_capacity() -> u64 {
    1000
}

const fn default_tenant_cache_idle_secs() -> u64 {
    3600
}

const fn default_max_concurrent_per_tenant() -> usize {
    16
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    1000
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_jitter() -> f64 {
    0.2
}

const fn default_connect_secs() -> u64 {
    30
}

const fn default_idle_secs() -> u64 {
    300
}

const fn default_total_secs() -> u64 {
    900
}

const fn default_tier_secs() -> u64 {
    60
}

fn default_tiers() -> IndexMap<String, u64> {
    IndexMap::from([(DEFAULT_TIER.to_string(), default_tier_secs()), ("premium".to_string(), 300)])
}

fn default_model_tiers() -> IndexMap<String, String> {
    [
        "claude-opus-4-5",
        "claude-opus-4-5-20251101",
        "claude-opus-4.5",
        "claude-3-opus",
        "claude-3-opus-20240229",
    ]
    .into_iter()
    .map(|model| (model.to_string(), "premium".to_string()))
    .collect()
}
