//! Programmatic configuration builder for integration tests

use std::net::SocketAddr;

use indexmap::IndexMap;
use kirogate_config::{Config, HealthConfig, RetryConfig, ServerConfig, TimeoutConfig, UpstreamConfig};
use secrecy::SecretString;

use super::mock_kiro::MockKiro;
use super::server::API_KEY;

/// Builder for constructing test configurations
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Configuration pointing every upstream endpoint at `mock`
    ///
    /// Retries are fast and jitter-free so tests stay deterministic.
    pub fn new(mock: &MockKiro) -> Self {
        Self {
            config: Config {
                server: ServerConfig {
                    listen_address: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
                    api_key: SecretString::from(API_KEY),
                    health: HealthConfig::default(),
                },
                upstream: UpstreamConfig {
                    refresh_token: Some(SecretString::from("default-refresh")),
                    chat_url: Some(mock.url("/generateAssistantResponse").parse().unwrap()),
                    refresh_url: Some(mock.url("/refreshToken").parse().unwrap()),
                    models_url: Some(mock.url("/ListAvailableModels").parse().unwrap()),
                    retry: RetryConfig {
                        max_attempts: 3,
                        base_delay_ms: 1,
                        max_delay_ms: 10,
                        jitter: 0.0,
                    },
                    ..UpstreamConfig::default()
                },
                ..Config::default()
            },
        }
    }

    /// Total attempts per upstream call
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.config.upstream.retry.max_attempts = attempts;
        self
    }

    /// First-byte timeouts per tier and the models in each non-default tier
    pub fn with_tiers(mut self, default_secs: u64, premium_secs: u64, premium_models: &[&str]) -> Self {
        self.config.upstream.timeouts = TimeoutConfig {
            tiers: IndexMap::from([("default".to_owned(), default_secs), ("premium".to_owned(), premium_secs)]),
            models: premium_models
                .iter()
                .map(|model| ((*model).to_owned(), "premium".to_owned()))
                .collect(),
            ..TimeoutConfig::default()
        };
        self
    }

    /// Idle window between upstream chunks once streaming started
    pub fn with_idle_timeout(mut self, secs: u64) -> Self {
        self.config.upstream.timeouts.idle_secs = secs;
        self
    }

    /// No default refresh token: only multi-tenant callers are served
    pub fn without_default_tenant(mut self) -> Self {
        self.config.upstream.refresh_token = None;
        self
    }

    /// Build the final config
    pub fn build(self) -> Config {
        self.config
    }
}
