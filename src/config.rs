//! Engine configuration.
//!
//! Tunables for the cooperative build loop and destroy path. Deserializable
//! from TOML so an embedding application can ship overrides next to its other
//! engine settings; every field falls back to the defaults in [`constants`].

use serde::Deserialize;

use crate::constants;
use crate::error::{AvatarError, AvatarResult};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Primitives built per frame before the build task suspends.
    pub build_budget_per_frame: u32,

    /// Budget used when the owning entity allows frame blocking.
    pub build_budget_blocking: u32,

    /// Cap on the primitive enumeration output buffer.
    pub primitive_cap: usize,

    /// Sleep between destroy-path polls of the skeleton worker gate (ms).
    pub destroy_poll_interval_ms: u64,

    /// Maximum destroy-path polls before releasing anyway (with a warning).
    pub destroy_poll_max: u32,

    /// Whether merged-mesh batching is attempted at all.
    pub batching_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            build_budget_per_frame: constants::build::DEFAULT_BUDGET_PER_FRAME,
            build_budget_blocking: constants::build::DEFAULT_BUDGET_BLOCKING,
            primitive_cap: constants::build::DEFAULT_PRIMITIVE_CAP,
            destroy_poll_interval_ms: constants::destroy::DEFAULT_POLL_INTERVAL_MS,
            destroy_poll_max: constants::destroy::DEFAULT_POLL_MAX,
            batching_enabled: true,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> AvatarResult<Self> {
        toml::from_str(text).map_err(|e| AvatarError::ConfigParse {
            error: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.batching_enabled);
        assert!(config.build_budget_blocking > config.build_budget_per_frame);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = EngineConfig::from_toml_str(
            "build_budget_per_frame = 2\nbatching_enabled = false\n",
        )
        .expect("valid toml");
        assert_eq!(config.build_budget_per_frame, 2);
        assert!(!config.batching_enabled);
        // Untouched fields keep their defaults.
        assert_eq!(
            config.primitive_cap,
            constants::build::DEFAULT_PRIMITIVE_CAP
        );
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        assert!(EngineConfig::from_toml_str("build_budget_per_frame = \"lots\"").is_err());
    }
}
