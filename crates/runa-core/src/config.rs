//! Runtime configuration.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

/// What happens when a turn is requested while another is in flight for
/// the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnPolicy {
    /// Queue behind the in-flight turn (default).
    #[default]
    Wait,
    /// Fail immediately.
    Reject,
}

/// Tunable parameters for the agent runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Token budget for the context window.
    pub token_budget: u64,
    /// Number of most-recent messages never evicted by summarization.
    pub recency_guard: usize,
    /// Retries after a failed tool execution (0 disables retry).
    pub tool_retry_limit: usize,
    /// Maximum tool dispatches in a single turn.
    pub max_tool_iterations: usize,
    /// Seconds to wait for the next model stream event.
    pub model_timeout_secs: u64,
    /// Seconds a single tool execution may run.
    pub tool_timeout_secs: u64,
    /// Concurrent-turn behavior per session.
    pub turn_policy: TurnPolicy,
    /// Capacity of the bounded event channel handed to callers.
    pub event_channel_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            token_budget: 8192,
            recency_guard: 2,
            tool_retry_limit: 1,
            max_tool_iterations: 16,
            model_timeout_secs: 120,
            tool_timeout_secs: 60,
            turn_policy: TurnPolicy::Wait,
            event_channel_capacity: 128,
        }
    }
}

impl RuntimeConfig {
    pub fn model_timeout(&self) -> Duration {
        Duration::from_secs(self.model_timeout_secs)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tool_timeout_secs)
    }

    /// Parses a config from TOML text. Missing fields take defaults.
    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        toml::from_str(text).context("failed to parse runtime config")
    }

    /// Loads a config file; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::from_toml_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.token_budget, 8192);
        assert_eq!(config.recency_guard, 2);
        assert_eq!(config.tool_retry_limit, 1);
        assert_eq!(config.max_tool_iterations, 16);
        assert_eq!(config.turn_policy, TurnPolicy::Wait);
        assert_eq!(config.model_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RuntimeConfig::from_toml_str(
            r#"
            token_budget = 2048
            turn_policy = "reject"
            "#,
        )
        .unwrap();
        assert_eq!(config.token_budget, 2048);
        assert_eq!(config.turn_policy, TurnPolicy::Reject);
        assert_eq!(config.tool_retry_limit, 1);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        assert!(RuntimeConfig::from_toml_str("turn_policy = \"drop\"").is_err());
    }
}
