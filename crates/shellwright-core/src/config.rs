//! Engine configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellwright_exec::LogMode;

/// Settings shared by every resource the engine applies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Pause between two dial attempts of the same stage, in milliseconds
    #[serde(default = "default_dial_retry_delay_ms")]
    pub dial_retry_delay_ms: u64,
    /// Logging mode for resources that do not set one
    #[serde(default)]
    pub default_logging: LogMode,
}

fn default_dial_retry_delay_ms() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dial_retry_delay_ms: default_dial_retry_delay_ms(),
            default_logging: LogMode::default(),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn dial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.dial_retry_delay_ms)
    }

    /// The resource's own mode, else the configured default
    #[must_use]
    pub fn logging(&self, requested: Option<LogMode>) -> LogMode {
        requested.unwrap_or(self.default_logging)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_table() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.dial_retry_delay(), Duration::from_secs(1));
        assert_eq!(config.logging(None), LogMode::StdoutAndStderr);
    }

    #[test]
    fn test_overrides() {
        let config: EngineConfig =
            toml::from_str("dialRetryDelayMs = 250\ndefaultLogging = \"stderr\"").unwrap();
        assert_eq!(config.dial_retry_delay(), Duration::from_millis(250));
        assert_eq!(config.logging(None), LogMode::Stderr);
        assert_eq!(config.logging(Some(LogMode::None)), LogMode::None);
    }
}
