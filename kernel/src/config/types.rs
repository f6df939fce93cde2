//! Typed configuration sections.
//!
//! Maps one-to-one onto the recognized config document: `resources`, `mint`,
//! `agents`, `supervisor`, `checkpoint`. All sections use
//! `deny_unknown_fields`.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::types::{ArtifactId, PrincipalId};

/// Top-level kernel configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub resources: ResourcesConfig,
    pub mint: MintConfig,
    /// Agent definitions, keyed by principal id.
    #[serde(default)]
    pub agents: IndexMap<PrincipalId, AgentConfig>,
    pub supervisor: SupervisorConfig,
    pub checkpoint: CheckpointConfig,
}

/// Resource registry parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ResourcesConfig {
    /// Initial depletable LLM budget per agent, in integer micro-dollars.
    pub llm_dollar_budget: u64,
    pub call_budget: CallBudgetConfig,
    pub disk_bytes: DiskBytesConfig,
}

/// Renewable rate window for LLM calls.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CallBudgetConfig {
    /// Maximum consumptions within one window.
    pub capacity: u64,
    /// Sliding-window length in seconds.
    pub window_seconds: u64,
}

/// Allocatable disk quota per principal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct DiskBytesConfig {
    pub capacity: u64,
}

/// Mint auction parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MintConfig {
    pub period_seconds: u64,
    pub first_auction_delay_seconds: u64,
    /// Floor on the price a winner pays.
    pub minimum_bid: u64,
    /// Newly minted scrip credited to each auction winner. Defaults to zero:
    /// winning then only costs the clearing price.
    #[serde(default)]
    pub reward_amount: u64,
}

/// One agent definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    pub llm_model: String,
    pub system_prompt: String,
    #[serde(default)]
    pub subscribed_artifacts: Vec<ArtifactId>,
    pub max_consecutive_errors: u32,
    /// Scrip granted at bootstrap.
    #[serde(default)]
    pub initial_scrip: u64,
}

/// Supervisor restart policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    pub initial_backoff_seconds: u64,
    pub max_backoff_seconds: u64,
    pub multiplier: f64,
    pub max_restarts_per_hour: u32,
}

/// Checkpoint cadence and location.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Snapshot every this many events.
    pub interval_events: u64,
    pub directory: PathBuf,
}
