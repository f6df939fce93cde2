//! Resource registry and per-principal state types.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::ResourceId;

/// The three accounting disciplines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Fixed budget that shrinks with use (e.g. `llm_dollar_budget`).
    Depletable,
    /// Quota cap with a live allocation count (e.g. `disk_bytes`).
    Allocatable,
    /// Rolling-window counter (e.g. `call_budget`).
    Renewable,
}

/// Registration record for one resource.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceSpec {
    pub id: ResourceId,
    pub kind: ResourceKind,
    /// Depletable: initial per-principal balance. Allocatable/renewable:
    /// per-principal cap.
    pub capacity: u64,
    /// Renewable only: sliding-window length.
    pub window_seconds: Option<u64>,
    /// Whether `transfer_quota` is permitted on this resource.
    pub tradeable: bool,
}

/// One timestamped consumption inside a renewable window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct WindowRecord {
    pub at_ms: u64,
    pub amount: u64,
}

/// Per-(principal, resource) state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceState {
    Depletable { balance: u64 },
    Allocatable { allocated: u64, capacity: u64 },
    Renewable {
        capacity: u64,
        window_ms: u64,
        records: VecDeque<WindowRecord>,
    },
}

impl ResourceState {
    pub fn fresh(spec: &ResourceSpec) -> Self {
        match spec.kind {
            ResourceKind::Depletable => ResourceState::Depletable {
                balance: spec.capacity,
            },
            ResourceKind::Allocatable => ResourceState::Allocatable {
                allocated: 0,
                capacity: spec.capacity,
            },
            ResourceKind::Renewable => ResourceState::Renewable {
                capacity: spec.capacity,
                window_ms: spec.window_seconds.unwrap_or(1) * 1_000,
                records: VecDeque::new(),
            },
        }
    }
}

/// Why a consumption was denied, carried into `ResourceExhausted` errors.
#[derive(Debug, Clone, PartialEq)]
pub struct Headroom {
    /// How much could still be consumed right now.
    pub available: u64,
}
