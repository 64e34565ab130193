use std::time::Duration;

use indexmap::IndexMap;
use serde::Deserialize;

/// Model catalog and model-info cache configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelsConfig {
    /// How long fetched model metadata stays valid
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Context window assumed for models the upstream did not describe
    #[serde(default = "default_max_input_tokens")]
    pub default_max_input_tokens: u32,
    /// Longer tool descriptions are moved into the system prompt
    #[serde(default = "default_tool_description_max_length")]
    pub tool_description_max_length: usize,
    /// Extra public model names mapped to upstream model ids
    #[serde(default)]
    pub aliases: IndexMap<String, String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
            default_max_input_tokens: default_max_input_tokens(),
            tool_description_max_length: default_tool_description_max_length(),
            aliases: IndexMap::new(),
        }
    }
}

impl ModelsConfig {
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

const fn default_cache_ttl_secs() -> u64 {
    3600
}

const fn default_max_input_tokens() -> u32 {
    200_000
}

const fn default_tool_description_max_length() -> usize {
    10_000
}
