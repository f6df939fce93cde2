//! The kernel interface: the only surface genesis artifacts and executable
//! code use to touch kernel state.
//!
//! [`KernelState`] is read-only; nothing reachable through it mutates.
//! [`KernelActions`] mutates, and every method logs one `kernel_*` audit
//! event alongside the specific mutation event(s). Genesis wrappers hold no
//! privileged accessors beyond these traits, so an agent-authored
//! replacement of any genesis artifact would be behaviorally equivalent.

use indexmap::IndexMap;

use crate::artifact::{Artifact, WritePatch};
use crate::contract::AccessKind;
use crate::error::{KernelError, KernelResult};
use crate::events::EventKind;
use crate::mint::{Submission, MINT_PRINCIPAL};
use crate::types::{CHARGE_DELEGATION_PREFIX, KERNEL_PRINCIPAL};

use super::Kernel;

/// Read-only kernel projections.
pub trait KernelState {
    fn balance_of(&self, principal: &str) -> KernelResult<u64>;
    fn artifact(&self, id: &str) -> Option<&Artifact>;
    fn artifacts_by_type(&self, artifact_type: &str) -> Vec<&Artifact>;
    fn artifacts_by_creator(&self, creator: &str) -> Vec<&Artifact>;
    fn mint_status_view(&self) -> serde_json::Value;
    fn current_time_ms(&self) -> u64;
}

/// Mutating kernel operations. `caller` is the acting principal; methods
/// that act on someone else's state check authorization themselves.
pub trait KernelActions {
    fn transfer_scrip(&mut self, from: &str, to: &str, amount: u64, reason: &str)
        -> KernelResult<()>;
    fn transfer_resource(
        &mut self,
        from: &str,
        to: &str,
        resource: &str,
        amount: u64,
    ) -> KernelResult<()>;
    fn consume_quota(
        &mut self,
        caller: &str,
        principal: &str,
        resource: &str,
        amount: u64,
    ) -> KernelResult<()>;
    fn submit_for_mint(
        &mut self,
        submitter: &str,
        artifact_id: &str,
        bid: u64,
    ) -> KernelResult<String>;
    fn cancel_mint_submission(&mut self, caller: &str, submission_id: &str) -> KernelResult<u64>;
    fn install_library(
        &mut self,
        id: &str,
        content: &str,
        code: Option<String>,
    ) -> KernelResult<()>;
    fn update_artifact_metadata(
        &mut self,
        caller: &str,
        artifact_id: &str,
        metadata: IndexMap<String, serde_json::Value>,
    ) -> KernelResult<()>;
    fn grant_charge_delegation(
        &mut self,
        payer: &str,
        delegate: &str,
        resource: &str,
        amount: u64,
    ) -> KernelResult<()>;
    fn revoke_charge_delegation(&mut self, payer: &str, delegate: &str) -> KernelResult<()>;
    /// Kernel-only entrypoint; rejected from every agent-reachable path.
    fn modify_protected_content(&mut self, artifact_id: &str, content: &str) -> KernelResult<()>;
}

impl KernelState for Kernel {
    fn balance_of(&self, principal: &str) -> KernelResult<u64> {
        self.ledger.balance(principal)
    }

    fn artifact(&self, id: &str) -> Option<&Artifact> {
        self.store.get(id)
    }

    fn artifacts_by_type(&self, artifact_type: &str) -> Vec<&Artifact> {
        self.store.list_by_type(artifact_type)
    }

    fn artifacts_by_creator(&self, creator: &str) -> Vec<&Artifact> {
        self.store.list_by_creator(creator)
    }

    fn mint_status_view(&self) -> serde_json::Value {
        self.mint_status()
    }

    fn current_time_ms(&self) -> u64 {
        self.now_ms()
    }
}

impl KernelActions for Kernel {
    fn transfer_scrip(
        &mut self,
        from: &str,
        to: &str,
        amount: u64,
        reason: &str,
    ) -> KernelResult<()> {
        // Validate fully before the first event so the audit pair never
        // records a transfer that did not happen.
        if !self.ledger.has_row(to) {
            return Err(KernelError::NotFound(format!("ledger row for {}", to)));
        }
        let available = self.ledger.balance(from)?;
        if available < amount {
            return Err(KernelError::InsufficientFunds {
                principal: from.to_string(),
                needed: amount,
                available,
            });
        }
        self.emit(
            EventKind::KernelTransferScrip,
            serde_json::json!({ "from": from, "to": to, "amount": amount, "reason": reason }),
        )?;
        self.ledger.transfer(from, to, amount)?;
        self.emit(
            EventKind::ScripTransferred,
            serde_json::json!({ "from": from, "to": to, "amount": amount, "reason": reason }),
        )?;
        Ok(())
    }

    fn transfer_resource(
        &mut self,
        from: &str,
        to: &str,
        resource: &str,
        amount: u64,
    ) -> KernelResult<()> {
        let now_ms = self.now_ms();
        self.resources
            .transfer_quota(from, to, resource, amount, now_ms)?;
        self.emit(
            EventKind::KernelTransferResource,
            serde_json::json!({ "from": from, "to": to, "resource": resource, "amount": amount }),
        )?;
        self.emit(
            EventKind::QuotaTransferred,
            serde_json::json!({
                "from": from, "to": to, "resource": resource,
                "amount": amount, "at_ms": now_ms,
            }),
        )?;
        Ok(())
    }

    fn consume_quota(
        &mut self,
        caller: &str,
        principal: &str,
        resource: &str,
        amount: u64,
    ) -> KernelResult<()> {
        if caller != principal && caller != KERNEL_PRINCIPAL {
            self.spend_charge_delegation(principal, caller, resource, amount)?;
        }
        let now_ms = self.now_ms();
        self.resources.consume(principal, resource, amount, now_ms)?;
        self.emit(
            EventKind::KernelConsumeQuota,
            serde_json::json!({
                "caller": caller, "principal": principal,
                "resource": resource, "amount": amount,
            }),
        )?;
        self.emit(
            EventKind::ResourceConsumed,
            serde_json::json!({
                "principal": principal, "resource": resource,
                "amount": amount, "at_ms": now_ms,
            }),
        )?;
        Ok(())
    }

    fn submit_for_mint(
        &mut self,
        submitter: &str,
        artifact_id: &str,
        bid: u64,
    ) -> KernelResult<String> {
        self.store.get_required(artifact_id)?;
        if bid < self.mint.minimum_bid() {
            return Err(KernelError::Validation(format!(
                "bid {} below minimum {}",
                bid,
                self.mint.minimum_bid()
            )));
        }
        let submission = Submission {
            id: format!("sub-{}", uuid::Uuid::new_v4()),
            submitter: submitter.to_string(),
            artifact_id: artifact_id.to_string(),
            bid,
            submitted_at_ms: self.now_ms(),
        };
        // Escrow the bid with the mint principal before recording it.
        self.transfer_scrip(submitter, MINT_PRINCIPAL, bid, "mint_escrow")?;
        self.mint.submit(submission.clone())?;
        self.emit(
            EventKind::MintSubmitted,
            serde_json::json!({ "submission": submission }),
        )?;
        Ok(submission.id)
    }

    fn cancel_mint_submission(&mut self, caller: &str, submission_id: &str) -> KernelResult<u64> {
        let submission = self.mint.cancel(submission_id, caller)?;
        self.emit(
            EventKind::MintCancelled,
            serde_json::json!({ "submission_id": submission_id, "submitter": caller }),
        )?;
        self.transfer_scrip(MINT_PRINCIPAL, caller, submission.bid, "mint_escrow_release")?;
        Ok(submission.bid)
    }

    fn install_library(
        &mut self,
        id: &str,
        content: &str,
        code: Option<String>,
    ) -> KernelResult<()> {
        self.emit(
            EventKind::KernelInstallLibrary,
            serde_json::json!({ "artifact_id": id }),
        )?;
        self.install_kernel_artifact(id, "code", content, code)
    }

    fn update_artifact_metadata(
        &mut self,
        caller: &str,
        artifact_id: &str,
        metadata: IndexMap<String, serde_json::Value>,
    ) -> KernelResult<()> {
        // Ordinary write-class permission applies; there is no privileged
        // metadata path for non-kernel callers.
        self.check_permission(caller, AccessKind::Write, artifact_id)?;
        self.emit(
            EventKind::KernelUpdateArtifactMetadata,
            serde_json::json!({
                "caller": caller, "artifact_id": artifact_id,
                "keys": metadata.keys().collect::<Vec<_>>(),
            }),
        )?;
        let event_number = self.journal.next_number();
        let updated = self.store.write(
            artifact_id,
            WritePatch {
                metadata: Some(metadata),
                ..WritePatch::default()
            },
            caller,
            false,
            event_number,
        )?;
        self.emit(
            EventKind::ArtifactWritten,
            serde_json::json!({ "artifact": updated }),
        )?;
        Ok(())
    }

    fn grant_charge_delegation(
        &mut self,
        payer: &str,
        delegate: &str,
        resource: &str,
        amount: u64,
    ) -> KernelResult<()> {
        self.resources.spec(resource)?;
        let id = format!("{}{}", CHARGE_DELEGATION_PREFIX, payer);
        let mut table = match self.store.get(&id) {
            Some(artifact) => parse_delegations(&artifact.content)?,
            None => {
                self.install_kernel_artifact(
                    &id,
                    "capability_request",
                    "{}",
                    None,
                )?;
                serde_json::Map::new()
            }
        };
        let entry = table
            .entry(delegate.to_string())
            .or_insert_with(|| serde_json::json!({}));
        if !entry.is_object() {
            *entry = serde_json::json!({});
        }
        entry[resource] = serde_json::json!(amount);
        let rendered = serde_json::Value::Object(table).to_string();
        self.emit(
            EventKind::KernelGrantChargeDelegation,
            serde_json::json!({
                "payer": payer, "delegate": delegate,
                "resource": resource, "amount": amount,
            }),
        )?;
        self.modify_protected_content(&id, &rendered)
    }

    fn revoke_charge_delegation(&mut self, payer: &str, delegate: &str) -> KernelResult<()> {
        let id = format!("{}{}", CHARGE_DELEGATION_PREFIX, payer);
        let artifact = self.store.get_required(&id)?;
        let mut table = parse_delegations(&artifact.content)?;
        if table.remove(delegate).is_none() {
            return Err(KernelError::NotFound(format!(
                "no delegation from {} to {}",
                payer, delegate
            )));
        }
        let rendered = serde_json::Value::Object(table).to_string();
        self.emit(
            EventKind::KernelRevokeChargeDelegation,
            serde_json::json!({ "payer": payer, "delegate": delegate }),
        )?;
        self.modify_protected_content(&id, &rendered)
    }

    fn modify_protected_content(&mut self, artifact_id: &str, content: &str) -> KernelResult<()> {
        self.emit(
            EventKind::KernelModifyProtectedContent,
            serde_json::json!({ "artifact_id": artifact_id }),
        )?;
        let event_number = self.journal.next_number();
        let updated = self.store.write(
            artifact_id,
            WritePatch {
                content: Some(content.to_string()),
                ..WritePatch::default()
            },
            KERNEL_PRINCIPAL,
            true,
            event_number,
        )?;
        self.emit(
            EventKind::ArtifactWritten,
            serde_json::json!({ "artifact": updated }),
        )?;
        Ok(())
    }
}

impl Kernel {
    /// Debit a delegation entry before a cross-principal `consume_quota`.
    /// The entry lives in the payer's kernel-protected
    /// `charge_delegation:<payer>` artifact; forging one is blocked by the
    /// reserved-id namespace.
    fn spend_charge_delegation(
        &mut self,
        payer: &str,
        delegate: &str,
        resource: &str,
        amount: u64,
    ) -> KernelResult<()> {
        let id = format!("{}{}", CHARGE_DELEGATION_PREFIX, payer);
        let artifact = self.store.get(&id).ok_or_else(|| KernelError::Permission {
            principal: delegate.to_string(),
            artifact: id.clone(),
            reason: format!("{} has no charge delegations", payer),
        })?;
        let mut table = parse_delegations(&artifact.content)?;
        let remaining = table
            .get(delegate)
            .and_then(|entry| entry.get(resource))
            .and_then(|v| v.as_u64())
            .ok_or_else(|| KernelError::Permission {
                principal: delegate.to_string(),
                artifact: id.clone(),
                reason: format!("no {} delegation from {}", resource, payer),
            })?;
        if remaining < amount {
            return Err(KernelError::ResourceExhausted {
                principal: delegate.to_string(),
                resource: format!("charge_delegation:{}", resource),
                needed: amount,
                available: remaining,
            });
        }
        table
            .get_mut(delegate)
            .expect("entry present above")[resource] = serde_json::json!(remaining - amount);
        let rendered = serde_json::Value::Object(table).to_string();
        self.modify_protected_content(&id, &rendered)
    }

    /// Current delegation table for a payer; introspection for queries.
    pub fn charge_delegations(&self, payer: &str) -> KernelResult<serde_json::Value> {
        let id = format!("{}{}", CHARGE_DELEGATION_PREFIX, payer);
        match self.store.get(&id) {
            None => Ok(serde_json::json!({})),
            Some(artifact) => Ok(serde_json::Value::Object(parse_delegations(
                &artifact.content,
            )?)),
        }
    }
}

fn parse_delegations(
    content: &str,
) -> KernelResult<serde_json::Map<String, serde_json::Value>> {
    let value: serde_json::Value = serde_json::from_str(content)
        .map_err(|e| KernelError::System(format!("malformed delegation table: {}", e)))?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => Err(KernelError::System(
            "delegation table must be a JSON object".into(),
        )),
    }
}
