//! Resource manager: three-kind accounting over (principal, resource) rows.
//!
//! All kinds share one API surface: `can_consume`, `consume`, `refund`,
//! `balance`, and `transfer_quota` for tradeable resources. Renewable
//! windows prune on every read; time comes in from the caller so the whole
//! manager stays deterministic under a manual clock.

mod types;

pub use types::{Headroom, ResourceKind, ResourceSpec, ResourceState, WindowRecord};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::types::{PrincipalId, ResourceId};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ResourceManager {
    specs: IndexMap<ResourceId, ResourceSpec>,
    states: IndexMap<PrincipalId, IndexMap<ResourceId, ResourceState>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a resource. Existing principals pick up a fresh row for it
    /// immediately so the registry and the rows never drift.
    pub fn register(&mut self, spec: ResourceSpec) -> KernelResult<()> {
        if spec.kind == ResourceKind::Renewable && spec.window_seconds.unwrap_or(0) == 0 {
            return Err(KernelError::Validation(format!(
                "renewable resource {} requires a positive window",
                spec.id
            )));
        }
        for rows in self.states.values_mut() {
            rows.entry(spec.id.clone())
                .or_insert_with(|| ResourceState::fresh(&spec));
        }
        self.specs.insert(spec.id.clone(), spec);
        Ok(())
    }

    pub fn registered(&self) -> impl Iterator<Item = &ResourceSpec> {
        self.specs.values()
    }

    pub fn spec(&self, resource: &str) -> KernelResult<&ResourceSpec> {
        self.specs
            .get(resource)
            .ok_or_else(|| KernelError::NotFound(format!("resource {}", resource)))
    }

    /// Idempotent: creates an empty state for every registered resource.
    pub fn ensure_principal(&mut self, principal: &str) {
        let rows = self.states.entry(principal.to_string()).or_default();
        for spec in self.specs.values() {
            rows.entry(spec.id.clone())
                .or_insert_with(|| ResourceState::fresh(spec));
        }
    }

    pub fn has_principal(&self, principal: &str) -> bool {
        self.states.contains_key(principal)
    }

    pub fn drop_principal(&mut self, principal: &str) {
        self.states.shift_remove(principal);
    }

    pub fn principals(&self) -> impl Iterator<Item = &PrincipalId> {
        self.states.keys()
    }

    /// Headroom available right now.
    pub fn balance(&mut self, principal: &str, resource: &str, now_ms: u64) -> KernelResult<u64> {
        let state = self.state_mut(principal, resource)?;
        Ok(Self::headroom(state, now_ms))
    }

    pub fn can_consume(
        &mut self,
        principal: &str,
        resource: &str,
        amount: u64,
        now_ms: u64,
    ) -> KernelResult<bool> {
        let state = self.state_mut(principal, resource)?;
        Ok(Self::headroom(state, now_ms) >= amount)
    }

    /// Consume, or fail with a `ResourceExhausted` naming the resource.
    pub fn consume(
        &mut self,
        principal: &str,
        resource: &str,
        amount: u64,
        now_ms: u64,
    ) -> KernelResult<()> {
        let state = self.state_mut(principal, resource)?;
        let available = Self::headroom(state, now_ms);
        if available < amount {
            return Err(KernelError::ResourceExhausted {
                principal: principal.to_string(),
                resource: resource.to_string(),
                needed: amount,
                available,
            });
        }
        match state {
            ResourceState::Depletable { balance } => *balance -= amount,
            ResourceState::Allocatable { allocated, .. } => *allocated += amount,
            ResourceState::Renewable { records, .. } => {
                records.push_back(WindowRecord { at_ms: now_ms, amount })
            }
        }
        Ok(())
    }

    /// Return previously consumed amounts. For renewable resources the most
    /// recent window records are unwound.
    pub fn refund(
        &mut self,
        principal: &str,
        resource: &str,
        amount: u64,
        now_ms: u64,
    ) -> KernelResult<()> {
        let state = self.state_mut(principal, resource)?;
        Self::prune(state, now_ms);
        match state {
            ResourceState::Depletable { balance } => {
                *balance = balance.checked_add(amount).ok_or_else(|| {
                    KernelError::System(format!("overflow refunding {} {}", amount, resource))
                })?;
            }
            ResourceState::Allocatable { allocated, .. } => {
                if *allocated < amount {
                    return Err(KernelError::System(format!(
                        "refund of {} exceeds live allocation {} for {}",
                        amount, allocated, principal
                    )));
                }
                *allocated -= amount;
            }
            ResourceState::Renewable { records, .. } => {
                let mut remaining = amount;
                while remaining > 0 {
                    let Some(back) = records.back_mut() else { break };
                    if back.amount > remaining {
                        back.amount -= remaining;
                        remaining = 0;
                    } else {
                        remaining -= back.amount;
                        records.pop_back();
                    }
                }
            }
        }
        Ok(())
    }

    /// Move quota between principals for a tradeable resource. Depletable
    /// moves balance; allocatable and renewable move capacity. The donor
    /// must keep capacity at or above its live allocation.
    pub fn transfer_quota(
        &mut self,
        from: &str,
        to: &str,
        resource: &str,
        amount: u64,
        now_ms: u64,
    ) -> KernelResult<()> {
        let spec = self.spec(resource)?.clone();
        if !spec.tradeable {
            return Err(KernelError::Validation(format!(
                "resource {} is not tradeable",
                resource
            )));
        }
        if !self.has_principal(to) {
            return Err(KernelError::NotFound(format!("principal {}", to)));
        }

        // Withdraw from the donor first; both rows are validated before any
        // mutation of the recipient.
        {
            let state = self.state_mut(from, resource)?;
            Self::prune(state, now_ms);
            match state {
                ResourceState::Depletable { balance } => {
                    if *balance < amount {
                        return Err(KernelError::ResourceExhausted {
                            principal: from.to_string(),
                            resource: resource.to_string(),
                            needed: amount,
                            available: *balance,
                        });
                    }
                    *balance -= amount;
                }
                ResourceState::Allocatable { allocated, capacity } => {
                    let spare = capacity.saturating_sub(*allocated);
                    if spare < amount {
                        return Err(KernelError::ResourceExhausted {
                            principal: from.to_string(),
                            resource: resource.to_string(),
                            needed: amount,
                            available: spare,
                        });
                    }
                    *capacity -= amount;
                }
                ResourceState::Renewable { capacity, .. } => {
                    if *capacity < amount {
                        return Err(KernelError::ResourceExhausted {
                            principal: from.to_string(),
                            resource: resource.to_string(),
                            needed: amount,
                            available: *capacity,
                        });
                    }
                    *capacity -= amount;
                }
            }
        }
        let state = self
            .state_mut(to, resource)
            .expect("recipient presence checked above");
        match state {
            ResourceState::Depletable { balance } => *balance += amount,
            ResourceState::Allocatable { capacity, .. } => *capacity += amount,
            ResourceState::Renewable { capacity, .. } => *capacity += amount,
        }
        Ok(())
    }

    /// Raw state access for checkpointing and invariant checks.
    pub fn state(&self, principal: &str, resource: &str) -> Option<&ResourceState> {
        self.states.get(principal).and_then(|rows| rows.get(resource))
    }

    pub(crate) fn snapshot(
        &self,
    ) -> (
        IndexMap<ResourceId, ResourceSpec>,
        IndexMap<PrincipalId, IndexMap<ResourceId, ResourceState>>,
    ) {
        (self.specs.clone(), self.states.clone())
    }

    pub(crate) fn restore(
        specs: IndexMap<ResourceId, ResourceSpec>,
        states: IndexMap<PrincipalId, IndexMap<ResourceId, ResourceState>>,
    ) -> Self {
        Self { specs, states }
    }

    fn state_mut(&mut self, principal: &str, resource: &str) -> KernelResult<&mut ResourceState> {
        if !self.specs.contains_key(resource) {
            return Err(KernelError::NotFound(format!("resource {}", resource)));
        }
        self.states
            .get_mut(principal)
            .and_then(|rows| rows.get_mut(resource))
            .ok_or_else(|| {
                KernelError::NotFound(format!("resource row ({}, {})", principal, resource))
            })
    }

    /// Prune expired renewable records, then report headroom.
    fn headroom(state: &mut ResourceState, now_ms: u64) -> u64 {
        Self::prune(state, now_ms);
        match state {
            ResourceState::Depletable { balance } => *balance,
            ResourceState::Allocatable { allocated, capacity } => {
                capacity.saturating_sub(*allocated)
            }
            ResourceState::Renewable {
                capacity, records, ..
            } => {
                let used: u64 = records.iter().map(|r| r.amount).sum();
                capacity.saturating_sub(used)
            }
        }
    }

    fn prune(state: &mut ResourceState, now_ms: u64) {
        if let ResourceState::Renewable {
            window_ms, records, ..
        } = state
        {
            let cutoff = now_ms.saturating_sub(*window_ms);
            while records.front().is_some_and(|r| r.at_ms <= cutoff) {
                records.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager() -> ResourceManager {
        let mut rm = ResourceManager::new();
        rm.register(ResourceSpec {
            id: "llm_dollar_budget".into(),
            kind: ResourceKind::Depletable,
            capacity: 1_000,
            window_seconds: None,
            tradeable: true,
        })
        .unwrap();
        rm.register(ResourceSpec {
            id: "disk_bytes".into(),
            kind: ResourceKind::Allocatable,
            capacity: 100,
            window_seconds: None,
            tradeable: true,
        })
        .unwrap();
        rm.register(ResourceSpec {
            id: "call_budget".into(),
            kind: ResourceKind::Renewable,
            capacity: 3,
            window_seconds: Some(60),
            tradeable: false,
        })
        .unwrap();
        rm.ensure_principal("alice");
        rm.ensure_principal("bob");
        rm
    }

    #[test]
    fn depletable_shrinks_and_never_refills_on_its_own() {
        let mut rm = manager();
        rm.consume("alice", "llm_dollar_budget", 400, 0).unwrap();
        assert_eq!(rm.balance("alice", "llm_dollar_budget", 1_000_000).unwrap(), 600);
        let err = rm.consume("alice", "llm_dollar_budget", 601, 0).unwrap_err();
        assert!(matches!(err, KernelError::ResourceExhausted { .. }));
    }

    #[test]
    fn allocatable_tracks_live_allocation() {
        let mut rm = manager();
        rm.consume("alice", "disk_bytes", 80, 0).unwrap();
        assert!(!rm.can_consume("alice", "disk_bytes", 21, 0).unwrap());
        rm.refund("alice", "disk_bytes", 30, 0).unwrap();
        assert_eq!(rm.balance("alice", "disk_bytes", 0).unwrap(), 50);
        // Refunding more than is allocated is an internal invariant breach.
        assert!(rm.refund("alice", "disk_bytes", 51, 0).is_err());
    }

    #[test]
    fn renewable_window_slides() {
        let mut rm = manager();
        rm.consume("alice", "call_budget", 1, 1_000).unwrap();
        rm.consume("alice", "call_budget", 1, 2_000).unwrap();
        rm.consume("alice", "call_budget", 1, 3_000).unwrap();
        assert!(!rm.can_consume("alice", "call_budget", 1, 3_500).unwrap());
        // 61s after the first record it falls out of the window.
        assert!(rm.can_consume("alice", "call_budget", 1, 62_000).unwrap());
        rm.consume("alice", "call_budget", 1, 62_000).unwrap();
        assert_eq!(rm.balance("alice", "call_budget", 62_500).unwrap(), 0);
    }

    #[test]
    fn renewable_refund_unwinds_recent_records() {
        let mut rm = manager();
        rm.consume("alice", "call_budget", 2, 1_000).unwrap();
        rm.consume("alice", "call_budget", 1, 2_000).unwrap();
        rm.refund("alice", "call_budget", 1, 2_100).unwrap();
        assert_eq!(rm.balance("alice", "call_budget", 2_200).unwrap(), 1);
    }

    #[test]
    fn quota_transfer_requires_tradeable_and_both_rows() {
        let mut rm = manager();
        let err = rm
            .transfer_quota("alice", "bob", "call_budget", 1, 0)
            .unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));

        rm.transfer_quota("alice", "bob", "disk_bytes", 40, 0).unwrap();
        assert_eq!(rm.balance("alice", "disk_bytes", 0).unwrap(), 60);
        assert_eq!(rm.balance("bob", "disk_bytes", 0).unwrap(), 140);

        let err = rm
            .transfer_quota("alice", "carol", "disk_bytes", 1, 0)
            .unwrap_err();
        assert!(matches!(err, KernelError::NotFound(_)));
    }

    #[test]
    fn donor_capacity_never_drops_below_live_allocation() {
        let mut rm = manager();
        rm.consume("alice", "disk_bytes", 90, 0).unwrap();
        let err = rm
            .transfer_quota("alice", "bob", "disk_bytes", 20, 0)
            .unwrap_err();
        assert!(matches!(err, KernelError::ResourceExhausted { .. }));
    }

    #[test]
    fn late_registration_backfills_existing_principals() {
        let mut rm = manager();
        rm.register(ResourceSpec {
            id: "gpu_seconds".into(),
            kind: ResourceKind::Depletable,
            capacity: 10,
            window_seconds: None,
            tradeable: false,
        })
        .unwrap();
        assert_eq!(rm.balance("alice", "gpu_seconds", 0).unwrap(), 10);
    }
}
