//! Kernel configuration.
//!
//! The kernel consumes a fully typed [`Config`] value; TOML loading lives at
//! the binary seam. Every section rejects unknown keys — a typo in an
//! operator config is an error, never a silent default.

mod types;

pub use types::{
    AgentConfig, CallBudgetConfig, CheckpointConfig, Config, DiskBytesConfig, MintConfig,
    ResourcesConfig, SupervisorConfig,
};

use std::path::Path;

use crate::error::{KernelError, KernelResult};

impl Config {
    /// Load and validate a TOML config file.
    pub fn from_toml_file(path: &Path) -> KernelResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| KernelError::Validation(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a TOML config document.
    pub fn from_toml_str(raw: &str) -> KernelResult<Self> {
        let config: Config = toml::from_str(raw)
            .map_err(|e| KernelError::Validation(format!("config parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation beyond what serde can express.
    pub fn validate(&self) -> KernelResult<()> {
        if self.resources.call_budget.capacity == 0 {
            return Err(KernelError::Validation(
                "resources.call_budget.capacity must be positive".into(),
            ));
        }
        if self.resources.call_budget.window_seconds == 0 {
            return Err(KernelError::Validation(
                "resources.call_budget.window_seconds must be positive".into(),
            ));
        }
        if self.mint.period_seconds == 0 {
            return Err(KernelError::Validation(
                "mint.period_seconds must be positive".into(),
            ));
        }
        if self.checkpoint.interval_events == 0 {
            return Err(KernelError::Validation(
                "checkpoint.interval_events must be positive".into(),
            ));
        }
        if self.supervisor.multiplier < 1.0 {
            return Err(KernelError::Validation(
                "supervisor.multiplier must be >= 1.0".into(),
            ));
        }
        for (id, agent) in &self.agents {
            if id.is_empty() {
                return Err(KernelError::Validation("agent id must be non-empty".into()));
            }
            if agent.llm_model.is_empty() {
                return Err(KernelError::Validation(format!(
                    "agents.{}.llm_model must be non-empty",
                    id
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [resources]
        llm_dollar_budget = 5000000

        [resources.call_budget]
        capacity = 10
        window_seconds = 60

        [resources.disk_bytes]
        capacity = 1048576

        [mint]
        period_seconds = 60
        first_auction_delay_seconds = 60
        minimum_bid = 1

        [supervisor]
        initial_backoff_seconds = 1
        max_backoff_seconds = 300
        multiplier = 2.0
        max_restarts_per_hour = 10

        [checkpoint]
        interval_events = 500
        directory = "/tmp/oikos"

        [agents.alice]
        llm_model = "test-model"
        system_prompt = "you are alice"
        subscribed_artifacts = []
        max_consecutive_errors = 3
        initial_scrip = 100
    "#;

    #[test]
    fn minimal_config_parses() {
        let config = Config::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.resources.llm_dollar_budget, 5_000_000);
        assert_eq!(config.agents["alice"].initial_scrip, 100);
        assert_eq!(config.mint.period_seconds, 60);
    }

    #[test]
    fn unknown_keys_are_errors() {
        let raw = format!("{}\nnot_a_section = 1\n", MINIMAL);
        assert!(Config::from_toml_str(&raw).is_err());

        let raw = MINIMAL.replace("minimum_bid = 1", "minimum_bid = 1\nsurprise = true");
        assert!(Config::from_toml_str(&raw).is_err());
    }

    #[test]
    fn zero_window_is_rejected() {
        let raw = MINIMAL.replace("window_seconds = 60", "window_seconds = 0");
        assert!(Config::from_toml_str(&raw).is_err());
    }
}
