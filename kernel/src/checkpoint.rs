//! Checkpointing: periodic self-contained snapshots plus deterministic
//! restore.
//!
//! A snapshot plus the journal tail beyond it reconstructs the kernel.
//! Restore order is load snapshot, re-register resources, repair standing
//! drift, replay the tail idempotently, rebuild indices, then validate
//! every invariant — any violation is a hard error.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::artifact::{Artifact, ArtifactStore};
use crate::config::Config;
use crate::error::{KernelError, KernelResult};
use crate::events::{Event, EventJournal, EventKind};
use crate::kernel::{AgentRuntime, Kernel};
use crate::ledger::Ledger;
use crate::mint::{BidScorer, MintAuction, MintSnapshot, Resolution, Scorer, Submission};
use crate::resources::{ResourceManager, ResourceSpec, ResourceState};
use crate::types::{Clock, EventNumber, PrincipalId, ResourceId};

pub const CHECKPOINT_VERSION: u32 = 1;
pub const JOURNAL_FILE: &str = "events.jsonl";

/// The single JSON document written per checkpoint.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckpointDoc {
    pub version: u32,
    pub event_number: EventNumber,
    pub last_hash: String,
    pub store: Vec<Artifact>,
    pub ledger: IndexMap<PrincipalId, u64>,
    pub resources: ResourcesDoc,
    pub mint: MintSnapshot,
    pub agents: IndexMap<PrincipalId, AgentRuntime>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResourcesDoc {
    pub specs: IndexMap<ResourceId, ResourceSpec>,
    pub states: IndexMap<PrincipalId, IndexMap<ResourceId, ResourceState>>,
}

/// Snapshot the kernel's entire state at its current event high-water.
pub fn snapshot(kernel: &Kernel) -> CheckpointDoc {
    let (specs, states) = kernel.resources.snapshot();
    CheckpointDoc {
        version: CHECKPOINT_VERSION,
        event_number: kernel.journal.last_number(),
        last_hash: kernel.journal.last_hash().to_string(),
        store: kernel.store.iter().cloned().collect(),
        ledger: kernel.ledger.snapshot(),
        resources: ResourcesDoc { specs, states },
        mint: kernel.mint.snapshot(),
        agents: kernel.agents.clone(),
    }
}

/// Write a checkpoint into the configured directory and mark the event
/// high-water. The `checkpoint_written` event lands after the snapshot, so
/// replaying it is a no-op.
pub fn write_checkpoint(kernel: &mut Kernel) -> KernelResult<PathBuf> {
    let doc = snapshot(kernel);
    let dir = kernel.config.checkpoint.directory.clone();
    std::fs::create_dir_all(&dir)
        .map_err(|e| KernelError::System(format!("cannot create checkpoint dir: {}", e)))?;
    let path = dir.join(format!("checkpoint-{:016}.json", doc.event_number));
    let rendered = serde_json::to_string(&doc)
        .map_err(|e| KernelError::System(format!("checkpoint serialize: {}", e)))?;
    std::fs::write(&path, rendered)
        .map_err(|e| KernelError::System(format!("checkpoint write: {}", e)))?;
    kernel.last_checkpoint_event = doc.event_number;
    kernel.emit(
        EventKind::CheckpointWritten,
        serde_json::json!({
            "snapshot_event_number": doc.event_number,
            "path": path.display().to_string(),
        }),
    )?;
    log::info!(
        "checkpoint written at event {} ({})",
        doc.event_number,
        path.display()
    );
    Ok(path)
}

/// Newest checkpoint document in a directory, by event number.
pub fn load_latest(dir: &Path) -> KernelResult<CheckpointDoc> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| KernelError::NotFound(format!("checkpoint dir {}: {}", dir.display(), e)))?;
    let mut best: Option<PathBuf> = None;
    for entry in entries {
        let entry =
            entry.map_err(|e| KernelError::System(format!("checkpoint dir read: {}", e)))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("checkpoint-") && name.ends_with(".json") {
            let path = entry.path();
            if best.as_ref().map_or(true, |b| path > *b) {
                best = Some(path);
            }
        }
    }
    let path = best.ok_or_else(|| {
        KernelError::NotFound(format!("no checkpoint in {}", dir.display()))
    })?;
    let raw = std::fs::read_to_string(&path)
        .map_err(|e| KernelError::System(format!("checkpoint read: {}", e)))?;
    let doc: CheckpointDoc = serde_json::from_str(&raw)
        .map_err(|e| KernelError::System(format!("checkpoint parse: {}", e)))?;
    if doc.version != CHECKPOINT_VERSION {
        return Err(KernelError::Validation(format!(
            "unknown checkpoint version {}",
            doc.version
        )));
    }
    Ok(doc)
}

impl Kernel {
    /// Restore from the newest checkpoint under the configured directory
    /// plus the journal tail beyond it.
    pub fn restore_latest(config: Config, clock: Arc<dyn Clock>) -> KernelResult<Self> {
        Self::restore_latest_with_scorer(config, clock, Box::new(BidScorer))
    }

    pub fn restore_latest_with_scorer(
        config: Config,
        clock: Arc<dyn Clock>,
        scorer: Box<dyn Scorer>,
    ) -> KernelResult<Self> {
        config.validate()?;
        let dir = config.checkpoint.directory.clone();
        let doc = load_latest(&dir)?;

        let journal_path = dir.join(JOURNAL_FILE);
        let tail = EventJournal::load_file(&journal_path)?;
        let mut journal = EventJournal::with_file(&journal_path)?;
        journal.fast_forward(doc.event_number, doc.last_hash.clone());

        let mut store = ArtifactStore::new();
        for artifact in doc.store {
            store.insert_restored(artifact);
        }
        let ledger = Ledger::restore(doc.ledger);
        let resources = ResourceManager::restore(doc.resources.specs, doc.resources.states);
        let mint = MintAuction::restore(&config.mint, doc.mint, scorer);

        let mut kernel = Kernel::from_parts(
            config,
            clock,
            store,
            ledger,
            resources,
            mint,
            journal,
            doc.agents,
            doc.event_number,
        );

        kernel.register_default_resources()?;
        kernel.repair_standing_drift();
        for event in tail {
            // Idempotent apply: anything at or below the high-water is
            // already inside the snapshot.
            if event.event_number <= kernel.journal.last_number() {
                continue;
            }
            apply_event(&mut kernel, &event)?;
            kernel.journal.adopt(event)?;
        }
        kernel.store.rebuild_indices();
        kernel.validate_invariants()?;
        Ok(kernel)
    }

    /// Standing-invariant drift repair, both directions: every
    /// `has_standing` artifact gets its rows, every orphaned ledger row is
    /// dropped.
    pub(crate) fn repair_standing_drift(&mut self) {
        let standing: Vec<String> = self
            .store
            .iter()
            .filter(|a| a.has_standing)
            .map(|a| a.id.clone())
            .collect();
        for principal in &standing {
            self.ledger.ensure_row(principal);
            self.resources.ensure_principal(principal);
        }
        let orphans: Vec<String> = self
            .ledger
            .rows()
            .map(|(p, _)| p.clone())
            .filter(|p| {
                self.store
                    .get(p)
                    .map(|a| !a.has_standing)
                    .unwrap_or(true)
            })
            .collect();
        for principal in orphans {
            log::warn!("dropping orphaned ledger row {}", principal);
            self.ledger.purge_row(&principal);
            self.resources.drop_principal(&principal);
        }
    }
}

/// Re-apply one journaled event to restored state. Audit events
/// (`action_*`, `thinking`, `kernel_*`, faults) are no-ops; mutation events
/// carry their full post-state.
fn apply_event(kernel: &mut Kernel, event: &Event) -> KernelResult<()> {
    let payload = &event.payload;
    let field = |key: &str| {
        payload
            .get(key)
            .ok_or_else(|| {
                KernelError::System(format!(
                    "event {} missing field {}",
                    event.event_number, key
                ))
            })
    };
    let str_field = |key: &str| -> KernelResult<String> {
        Ok(field(key)?
            .as_str()
            .ok_or_else(|| {
                KernelError::System(format!(
                    "event {} field {} is not a string",
                    event.event_number, key
                ))
            })?
            .to_string())
    };
    let u64_field = |key: &str| -> KernelResult<u64> {
        field(key)?.as_u64().ok_or_else(|| {
            KernelError::System(format!(
                "event {} field {} is not an integer",
                event.event_number, key
            ))
        })
    };

    match event.kind {
        EventKind::ArtifactCreated | EventKind::ArtifactWritten => {
            let artifact: Artifact = serde_json::from_value(field("artifact")?.clone())
                .map_err(|e| KernelError::System(format!("artifact replay: {}", e)))?;
            kernel.store.insert_restored(artifact);
        }
        EventKind::ArtifactDeleted => {
            let id = str_field("artifact_id")?;
            let had_standing = payload
                .get("had_standing")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            kernel.store.remove_restored(&id);
            if had_standing {
                kernel.ledger.purge_row(&id);
                kernel.resources.drop_principal(&id);
                kernel.agents.shift_remove(&id);
            }
        }
        EventKind::PrincipalCreated => {
            let principal = str_field("principal")?;
            kernel.store.set_standing(&principal, event.event_number)?;
            kernel.ledger.ensure_row(&principal);
            kernel.resources.ensure_principal(&principal);
        }
        EventKind::ScripCredited => {
            let to = str_field("to")?;
            kernel.ledger.credit(&to, u64_field("amount")?)?;
        }
        EventKind::ScripTransferred => {
            let from = str_field("from")?;
            let to = str_field("to")?;
            kernel.ledger.transfer(&from, &to, u64_field("amount")?)?;
        }
        EventKind::ResourceConsumed => {
            let principal = str_field("principal")?;
            let resource = str_field("resource")?;
            kernel
                .resources
                .consume(&principal, &resource, u64_field("amount")?, u64_field("at_ms")?)?;
        }
        EventKind::ResourceRefunded => {
            let principal = str_field("principal")?;
            let resource = str_field("resource")?;
            kernel
                .resources
                .refund(&principal, &resource, u64_field("amount")?, u64_field("at_ms")?)?;
        }
        EventKind::QuotaTransferred => {
            let from = str_field("from")?;
            let to = str_field("to")?;
            let resource = str_field("resource")?;
            kernel.resources.transfer_quota(
                &from,
                &to,
                &resource,
                u64_field("amount")?,
                u64_field("at_ms")?,
            )?;
        }
        EventKind::MintSubmitted => {
            let submission: Submission = serde_json::from_value(field("submission")?.clone())
                .map_err(|e| KernelError::System(format!("submission replay: {}", e)))?;
            kernel.mint.submit(submission)?;
        }
        EventKind::MintCancelled => {
            let submission_id = str_field("submission_id")?;
            let submitter = str_field("submitter")?;
            kernel.mint.cancel(&submission_id, &submitter)?;
        }
        EventKind::MintResolution => {
            let resolution: Resolution = serde_json::from_value(field("resolution")?.clone())
                .map_err(|e| KernelError::System(format!("resolution replay: {}", e)))?;
            kernel.mint.replay_resolution(&resolution);
            if resolution.reward > 0 {
                kernel.ledger.credit(&resolution.winner, resolution.reward)?;
            }
        }
        EventKind::AgentSubscribed => {
            let agent = str_field("agent")?;
            let artifact_id = str_field("artifact_id")?;
            kernel
                .agents
                .entry(agent)
                .or_insert_with(AgentRuntime::default)
                .subscriptions
                .insert(artifact_id);
        }
        EventKind::AgentUnsubscribed => {
            let agent = str_field("agent")?;
            let artifact_id = str_field("artifact_id")?;
            if let Some(runtime) = kernel.agents.get_mut(&agent) {
                runtime.subscriptions.shift_remove(&artifact_id);
            }
        }
        // Audit trail: no state to re-apply.
        EventKind::ActionExecuted
        | EventKind::ActionDenied
        | EventKind::Thinking
        | EventKind::ContractFault
        | EventKind::AgentLlmTimeout
        | EventKind::KernelTransferScrip
        | EventKind::KernelTransferResource
        | EventKind::KernelConsumeQuota
        | EventKind::KernelCreatePrincipal
        | EventKind::KernelInstallLibrary
        | EventKind::KernelUpdateArtifactMetadata
        | EventKind::KernelGrantChargeDelegation
        | EventKind::KernelRevokeChargeDelegation
        | EventKind::KernelModifyProtectedContent
        | EventKind::CheckpointWritten => {}
    }
    Ok(())
}
