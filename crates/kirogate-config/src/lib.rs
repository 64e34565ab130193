#![allow(clippy::must_use_candidate)]

mod env;
pub mod health;
mod loader;
pub mod log;
pub mod models;
pub mod server;
pub mod upstream;

use serde::Deserialize;

pub use health::*;
pub use log::*;
pub use models::*;
pub use server::*;
pub use upstream::*;

/// Top-level kirogate configuration
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
    /// Upstream credentials, endpoints, retry and timeout policy
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Model catalog and model-info cache settings
    #[serde(default)]
    pub models: ModelsConfig,
}
