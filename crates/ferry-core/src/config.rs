//! Engine configuration: defaults applied to newly created documents.

use std::time::Duration;

/// Defaults the engine applies while normalizing a new workflow document.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Poll interval used when a document does not specify one.
    pub default_poll_delay: Duration,

    /// How long a document lives past creation before it may be reaped.
    pub default_expiration: chrono::Duration,
}

impl EngineConfig {
    /// Default configuration for v1 (half-second polls, one-day expiration).
    pub fn default_v1() -> Self {
        Self {
            default_poll_delay: Duration::from_millis(500),
            default_expiration: chrono::Duration::days(1),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::default_v1()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_reasonable_values() {
        let config = EngineConfig::default_v1();
        assert_eq!(config.default_poll_delay, Duration::from_millis(500));
        assert_eq!(config.default_expiration, chrono::Duration::days(1));
    }
}
