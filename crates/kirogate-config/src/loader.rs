use std::path::Path;

use secrecy::ExposeSecret;

use crate::{Config, DEFAULT_TIER};

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, environment variable
    /// expansion fails, TOML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;

        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from TOML text
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing or validation fails
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistency found
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_server()?;
        self.validate_upstream()?;
        self.validate_timeouts()?;
        self.validate_retry()?;
        Ok(())
    }

    fn validate_server(&self) -> anyhow::Result<()> {
        let key = self.server.api_key.expose_secret();

        if key.is_empty() {
            anyhow::bail!("server.api_key must not be empty");
        }

        Ok(())
    }

    fn validate_upstream(&self) -> anyhow::Result<()> {
        let upstream = &self.upstream;

        for (name, endpoint) in [
            ("chat", upstream.chat_endpoint(&upstream.region)),
            ("refresh", upstream.refresh_endpoint(&upstream.region)),
            ("idc refresh", upstream.idc_refresh_endpoint(&upstream.region)),
            ("models", upstream.models_endpoint(&upstream.region)),
        ] {
            endpoint.map_err(|e| anyhow::anyhow!("invalid {name} endpoint for region '{}': {e}", upstream.region))?;
        }

        if upstream.client_id.is_some() != upstream.client_secret.is_some() {
            anyhow::bail!("upstream.client_id and upstream.client_secret must be set together");
        }

        if upstream.max_concurrent_per_tenant == 0 {
            anyhow::bail!("upstream.max_concurrent_per_tenant must be greater than 0");
        }

        if upstream.tenant_cache_capacity == 0 {
            anyhow::bail!("upstream.tenant_cache_capacity must be greater than 0");
        }

        Ok(())
    }

    fn validate_timeouts(&self) -> anyhow::Result<()> {
        let timeouts = &self.upstream.timeouts;

        if !timeouts.tiers.contains_key(DEFAULT_TIER) {
            anyhow::bail!("upstream.timeouts.tiers must define a '{DEFAULT_TIER}' tier");
        }

        for (model, tier) in &timeouts.models {
            if !timeouts.tiers.contains_key(tier) {
                anyhow::bail!("model '{model}' references unknown timeout tier '{tier}'");
            }
        }

        if timeouts.tiers.values().any(|secs| *secs == 0) {
            anyhow::bail!("timeout tiers must be greater than 0 seconds");
        }

        if timeouts.total_secs < timeouts.idle_secs {
            anyhow::bail!("upstream.timeouts.total_secs must not be shorter than idle_secs");
        }

        Ok(())
    }

    fn validate_retry(&self) -> anyhow::Result<()> {
        let retry = &self.upstream.retry;

        if retry.max_attempts == 0 {
            anyhow::bail!("upstream.retry.max_attempts must be at least 1");
        }

        if !(0.0..=1.0).contains(&retry.jitter) {
            anyhow::bail!("upstream.retry.jitter must be within [0, 1]");
        }

        if retry.base_delay_ms > retry.max_delay_ms {
            anyhow::bail!("upstream.retry.base_delay_ms must not exceed max_delay_ms");
        }

        Ok(())
    }
}
