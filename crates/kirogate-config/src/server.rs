use std::net::SocketAddr;

use secrecy::SecretString;
use serde::Deserialize;

use crate::health::HealthConfig;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub listen_address: Option<SocketAddr>,
    /// Key callers present as `Bearer <key>` or `Bearer <key>:<refresh token>`
    #[serde(default = "default_api_key")]
    pub api_key: SecretString,
    #[serde(default)]
    pub health: HealthConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: None,
            api_key: default_api_key(),
            health: HealthConfig::default(),
        }
    }
}

fn default_api_key() -> SecretString {
    SecretString::from(String::new())
}
