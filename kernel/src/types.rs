//! Core identifier aliases and the kernel clock seam.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Identifier of any entity that can hold resources (agent or
/// artifact-principal).
pub type PrincipalId = String;

/// Stable unique identifier of an artifact.
pub type ArtifactId = String;

/// Identifier of a registered resource (`llm_dollar_budget`, `disk_bytes`,
/// `call_budget`, ...).
pub type ResourceId = String;

/// Monotonic event number, strictly increasing from 1.
pub type EventNumber = u64;

/// The principal id the kernel itself acts under. Only kernel primitives run
/// as this principal; it is not creatable or impersonable through the action
/// surface.
pub const KERNEL_PRINCIPAL: &str = "kernel";

/// Reserved artifact-id prefix for charge delegations. An id of the form
/// `charge_delegation:<payer>` may only be created by `<payer>`.
pub const CHARGE_DELEGATION_PREFIX: &str = "charge_delegation:";

/// Reserved artifact-id prefix for rights artifacts.
pub const RIGHT_PREFIX: &str = "right:";

/// Wall-clock source for the mint auction, rate windows, and journal
/// timestamps. Everything time-dependent inside the kernel reads this trait
/// so tests can drive time explicitly.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Production clock backed by the system time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Deterministic clock for tests: starts at an arbitrary epoch and only
/// moves when advanced.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Arc<Self> {
        Arc::new(Self {
            now_ms: AtomicU64::new(start_ms),
        })
    }

    pub fn advance_ms(&self, delta: u64) {
        self.now_ms.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn set_ms(&self, now: u64) {
        self.now_ms.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
