//! Shared fixtures: a two-agent kernel on a manual clock.
#![allow(dead_code)]

use std::sync::Arc;

pub use oikos_kernel::config::{
    AgentConfig, CallBudgetConfig, CheckpointConfig, Config, DiskBytesConfig, MintConfig,
    ResourcesConfig, SupervisorConfig,
};
pub use oikos_kernel::prelude::*;
pub use oikos_kernel::types::ManualClock;

pub const START_MS: u64 = 1_700_000_000_000;

pub fn agent(initial_scrip: u64) -> AgentConfig {
    AgentConfig {
        llm_model: "test-model".into(),
        system_prompt: "act".into(),
        subscribed_artifacts: vec![],
        max_consecutive_errors: 3,
        initial_scrip,
    }
}

pub fn base_config(checkpoint_dir: std::path::PathBuf) -> Config {
    Config {
        resources: ResourcesConfig {
            llm_dollar_budget: 5_000_000,
            call_budget: CallBudgetConfig {
                capacity: 10,
                window_seconds: 60,
            },
            disk_bytes: DiskBytesConfig {
                capacity: 1 << 20,
            },
        },
        mint: MintConfig {
            period_seconds: 60,
            first_auction_delay_seconds: 60,
            minimum_bid: 1,
            reward_amount: 0,
        },
        agents: [
            ("alice".to_string(), agent(100)),
            ("bob".to_string(), agent(100)),
        ]
        .into_iter()
        .collect(),
        supervisor: SupervisorConfig {
            initial_backoff_seconds: 1,
            max_backoff_seconds: 60,
            multiplier: 2.0,
            max_restarts_per_hour: 10,
        },
        checkpoint: CheckpointConfig {
            interval_events: 100_000,
            directory: checkpoint_dir,
        },
    }
}

pub fn test_kernel() -> (Kernel, Arc<ManualClock>) {
    let clock = ManualClock::new(START_MS);
    let config = base_config(std::env::temp_dir().join("oikos-unused"));
    let kernel = Kernel::in_memory(config, clock.clone()).expect("bootstrap");
    (kernel, clock)
}

pub fn balance(kernel: &Kernel, principal: &str) -> u64 {
    kernel.ledger().balance(principal).unwrap()
}

pub fn intent(raw: serde_json::Value) -> ActionIntent {
    serde_json::from_value(raw).expect("intent json")
}

/// Event type names from `since` (exclusive) to the journal head.
pub fn event_types_since(kernel: &Kernel, since: u64) -> Vec<String> {
    kernel
        .journal()
        .events()
        .iter()
        .filter(|e| e.event_number > since)
        .map(|e| e.kind.as_str().to_string())
        .collect()
}
