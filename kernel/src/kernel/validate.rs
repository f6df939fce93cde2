//! Kernel invariant validation.
//!
//! Run after restore and whenever a system-category error is detected.
//! Every violation is a hard error; the only recovery path is checkpoint
//! restore.

use crate::error::{KernelError, KernelResult};
use crate::resources::ResourceState;

use super::Kernel;

pub(super) fn validate(kernel: &Kernel) -> KernelResult<()> {
    journal_invariants(kernel)?;
    standing_invariant(kernel)?;
    resource_invariants(kernel)?;
    Ok(())
}

fn journal_invariants(kernel: &Kernel) -> KernelResult<()> {
    kernel.journal.verify_chain()
}

/// Standing invariant, both directions: `has_standing` artifact ⇔ ledger
/// row ⇔ resource rows for every registered resource.
fn standing_invariant(kernel: &Kernel) -> KernelResult<()> {
    for artifact in kernel.store.iter() {
        if !artifact.has_standing {
            continue;
        }
        if !kernel.ledger.has_row(&artifact.id) {
            return Err(KernelError::System(format!(
                "standing invariant: {} has no ledger row",
                artifact.id
            )));
        }
        for spec in kernel.resources.registered() {
            if kernel.resources.state(&artifact.id, &spec.id).is_none() {
                return Err(KernelError::System(format!(
                    "standing invariant: {} missing resource row {}",
                    artifact.id, spec.id
                )));
            }
        }
    }
    for (principal, _) in kernel.ledger.rows() {
        let standing = kernel
            .store
            .get(principal)
            .map(|a| a.has_standing)
            .unwrap_or(false);
        if !standing {
            return Err(KernelError::System(format!(
                "standing invariant: ledger row {} has no standing artifact",
                principal
            )));
        }
    }
    Ok(())
}

fn resource_invariants(kernel: &Kernel) -> KernelResult<()> {
    let principals: Vec<String> = kernel.resources.principals().cloned().collect();
    let specs: Vec<String> = kernel
        .resources
        .registered()
        .map(|s| s.id.clone())
        .collect();
    for principal in &principals {
        for resource in &specs {
            let Some(state) = kernel.resources.state(principal, resource) else {
                return Err(KernelError::System(format!(
                    "resource row ({}, {}) missing",
                    principal, resource
                )));
            };
            if let ResourceState::Allocatable { allocated, capacity } = state {
                if allocated > capacity {
                    return Err(KernelError::System(format!(
                        "allocatable {} for {} over capacity: {} > {}",
                        resource, principal, allocated, capacity
                    )));
                }
            }
        }
    }
    Ok(())
}
