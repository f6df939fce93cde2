//! Append-only event journal: the authoritative state-transition record.
//!
//! Every mutation emits exactly one event with a strictly increasing
//! `event_number` (from 1). Events are chained with a sha256 hash so the
//! journal is tamper-evident, kept fully in memory for projections, and
//! mirrored to a newline-delimited JSON file when a path is configured.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{KernelError, KernelResult};
use crate::types::EventNumber;

/// The closed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Store mutations.
    ArtifactCreated,
    ArtifactWritten,
    ArtifactDeleted,
    // Principal and scrip movements.
    PrincipalCreated,
    ScripCredited,
    ScripTransferred,
    // Resource accounting.
    ResourceConsumed,
    ResourceRefunded,
    QuotaTransferred,
    // Action surface.
    ActionExecuted,
    ActionDenied,
    Thinking,
    ContractFault,
    // Mint auction.
    MintSubmitted,
    MintCancelled,
    MintResolution,
    // Agent runtime.
    AgentSubscribed,
    AgentUnsubscribed,
    AgentLlmTimeout,
    // Kernel facade audit trail.
    KernelTransferScrip,
    KernelTransferResource,
    KernelConsumeQuota,
    KernelCreatePrincipal,
    KernelInstallLibrary,
    KernelUpdateArtifactMetadata,
    KernelGrantChargeDelegation,
    KernelRevokeChargeDelegation,
    KernelModifyProtectedContent,
    // Checkpointing.
    CheckpointWritten,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ArtifactCreated => "artifact_created",
            EventKind::ArtifactWritten => "artifact_written",
            EventKind::ArtifactDeleted => "artifact_deleted",
            EventKind::PrincipalCreated => "principal_created",
            EventKind::ScripCredited => "scrip_credited",
            EventKind::ScripTransferred => "scrip_transferred",
            EventKind::ResourceConsumed => "resource_consumed",
            EventKind::ResourceRefunded => "resource_refunded",
            EventKind::QuotaTransferred => "quota_transferred",
            EventKind::ActionExecuted => "action_executed",
            EventKind::ActionDenied => "action_denied",
            EventKind::Thinking => "thinking",
            EventKind::ContractFault => "contract_fault",
            EventKind::MintSubmitted => "mint_submitted",
            EventKind::MintCancelled => "mint_cancelled",
            EventKind::MintResolution => "mint_resolution",
            EventKind::AgentSubscribed => "agent_subscribed",
            EventKind::AgentUnsubscribed => "agent_unsubscribed",
            EventKind::AgentLlmTimeout => "agent_llm_timeout",
            EventKind::KernelTransferScrip => "kernel_transfer_scrip",
            EventKind::KernelTransferResource => "kernel_transfer_resource",
            EventKind::KernelConsumeQuota => "kernel_consume_quota",
            EventKind::KernelCreatePrincipal => "kernel_create_principal",
            EventKind::KernelInstallLibrary => "kernel_install_library",
            EventKind::KernelUpdateArtifactMetadata => "kernel_update_artifact_metadata",
            EventKind::KernelGrantChargeDelegation => "kernel_grant_charge_delegation",
            EventKind::KernelRevokeChargeDelegation => "kernel_revoke_charge_delegation",
            EventKind::KernelModifyProtectedContent => "kernel_modify_protected_content",
            EventKind::CheckpointWritten => "checkpoint_written",
        }
    }
}

/// One journal line: `{event_number, t, type, chain_hash, ...payload}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_number: EventNumber,
    /// ISO-8601 UTC wall-clock timestamp.
    pub t: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub chain_hash: String,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// The journal. `events` is complete from process start (or from restore,
/// where it is rebuilt from snapshot tail + file).
#[derive(Debug)]
pub struct EventJournal {
    events: Vec<Event>,
    next_number: EventNumber,
    last_hash: String,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
}

const GENESIS_HASH: &str = "genesis";

impl EventJournal {
    /// In-memory only journal (tests).
    pub fn in_memory() -> Self {
        Self {
            events: Vec::new(),
            next_number: 1,
            last_hash: GENESIS_HASH.to_string(),
            writer: None,
            path: None,
        }
    }

    /// Journal mirrored to `path`, created if absent, appended if present.
    pub fn with_file(path: &Path) -> KernelResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                KernelError::System(format!("cannot create journal dir: {}", e))
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| KernelError::System(format!("cannot open journal: {}", e)))?;
        Ok(Self {
            events: Vec::new(),
            next_number: 1,
            last_hash: GENESIS_HASH.to_string(),
            writer: Some(BufWriter::new(file)),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn next_number(&self) -> EventNumber {
        self.next_number
    }

    pub fn last_number(&self) -> EventNumber {
        self.next_number - 1
    }

    /// Append one event. `payload` must be a JSON object; `now_ms` supplies
    /// the wall timestamp.
    pub fn append(
        &mut self,
        kind: EventKind,
        payload: serde_json::Value,
        now_ms: u64,
    ) -> KernelResult<&Event> {
        let serde_json::Value::Object(payload) = payload else {
            return Err(KernelError::System(format!(
                "event payload for {} must be a JSON object",
                kind.as_str()
            )));
        };
        let event_number = self.next_number;
        let chain_hash = chain_hash(&self.last_hash, event_number, kind, &payload);
        let event = Event {
            event_number,
            t: ms_to_datetime(now_ms),
            kind,
            chain_hash: chain_hash.clone(),
            payload,
        };
        if let Some(writer) = &mut self.writer {
            let line = serde_json::to_string(&event)
                .map_err(|e| KernelError::System(format!("event serialize: {}", e)))?;
            writeln!(writer, "{}", line)
                .and_then(|_| writer.flush())
                .map_err(|e| KernelError::System(format!("journal write: {}", e)))?;
        }
        self.events.push(event);
        self.next_number += 1;
        self.last_hash = chain_hash;
        Ok(self.events.last().expect("just pushed"))
    }

    /// Re-seat an already-journaled event during restore. The file is not
    /// rewritten; numbering and the hash chain advance as if freshly
    /// appended.
    pub(crate) fn adopt(&mut self, event: Event) -> KernelResult<()> {
        if event.event_number != self.next_number {
            return Err(KernelError::System(format!(
                "journal adoption out of order: got {}, expected {}",
                event.event_number, self.next_number
            )));
        }
        self.next_number += 1;
        self.last_hash = event.chain_hash.clone();
        self.events.push(event);
        Ok(())
    }

    /// Skip numbering past a snapshot's high-water mark without replaying
    /// the events below it.
    pub(crate) fn fast_forward(&mut self, high_water: EventNumber, last_hash: String) {
        self.next_number = high_water + 1;
        self.last_hash = last_hash;
    }

    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn recent(&self, n: usize) -> &[Event] {
        let start = self.events.len().saturating_sub(n);
        &self.events[start..]
    }

    /// Verify strict +1 monotonicity and the hash chain over the in-memory
    /// suffix.
    pub fn verify_chain(&self) -> KernelResult<()> {
        let mut expected_hash: Option<String> = None;
        let mut expected_number: Option<EventNumber> = None;
        for event in &self.events {
            if let Some(n) = expected_number {
                if event.event_number != n {
                    return Err(KernelError::System(format!(
                        "event number gap: got {}, expected {}",
                        event.event_number, n
                    )));
                }
            }
            let prev = expected_hash.as_deref().unwrap_or(GENESIS_HASH);
            // Only the very first in-memory event after a restore may hang
            // off an unknown predecessor; everything else must chain.
            if expected_hash.is_some() || event.event_number == 1 {
                let recomputed =
                    chain_hash(prev, event.event_number, event.kind, &event.payload);
                if recomputed != event.chain_hash {
                    return Err(KernelError::System(format!(
                        "chain hash mismatch at event {}",
                        event.event_number
                    )));
                }
            }
            expected_hash = Some(event.chain_hash.clone());
            expected_number = Some(event.event_number + 1);
        }
        Ok(())
    }

    /// Read every journal line from a file; used by restore.
    pub fn load_file(path: &Path) -> KernelResult<Vec<Event>> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path)
            .map_err(|e| KernelError::System(format!("cannot open journal: {}", e)))?;
        let mut events = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line =
                line.map_err(|e| KernelError::System(format!("journal read: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line).map_err(|e| {
                KernelError::System(format!("journal line {} malformed: {}", idx + 1, e))
            })?;
            events.push(event);
        }
        Ok(events)
    }
}

fn ms_to_datetime(now_ms: u64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(now_ms as i64)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().expect("epoch is valid"))
}

fn chain_hash(
    prev: &str,
    event_number: EventNumber,
    kind: EventKind,
    payload: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev.as_bytes());
    hasher.update(event_number.to_be_bytes());
    hasher.update(kind.as_str().as_bytes());
    hasher.update(serde_json::Value::Object(payload.clone()).to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn numbering_is_strictly_monotonic_from_one() {
        let mut journal = EventJournal::in_memory();
        for i in 0..5 {
            let event = journal
                .append(
                    EventKind::ActionExecuted,
                    serde_json::json!({"n": i}),
                    1_000 + i,
                )
                .unwrap();
            assert_eq!(event.event_number, i + 1);
        }
        journal.verify_chain().unwrap();
    }

    #[test]
    fn non_object_payloads_are_rejected() {
        let mut journal = EventJournal::in_memory();
        assert!(journal
            .append(EventKind::Thinking, serde_json::json!(42), 0)
            .is_err());
        assert_eq!(journal.next_number(), 1);
    }

    #[test]
    fn tampering_breaks_the_chain() {
        let mut journal = EventJournal::in_memory();
        journal
            .append(EventKind::ScripTransferred, serde_json::json!({"n": 30}), 0)
            .unwrap();
        journal
            .append(EventKind::ScripTransferred, serde_json::json!({"n": 31}), 1)
            .unwrap();
        journal.events[0]
            .payload
            .insert("n".into(), serde_json::json!(99));
        assert!(journal.verify_chain().is_err());
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.jsonl");
        {
            let mut journal = EventJournal::with_file(&path).unwrap();
            journal
                .append(
                    EventKind::ArtifactCreated,
                    serde_json::json!({"artifact": {"id": "x"}}),
                    1_700_000_000_000,
                )
                .unwrap();
            journal
                .append(EventKind::ActionExecuted, serde_json::json!({"kind": "write"}), 2)
                .unwrap();
        }
        let events = EventJournal::load_file(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_number, 1);
        assert_eq!(events[0].kind, EventKind::ArtifactCreated);
        assert_eq!(events[1].payload["kind"], serde_json::json!("write"));
    }

    #[test]
    fn timestamps_are_iso8601_utc() {
        let mut journal = EventJournal::in_memory();
        let event = journal
            .append(EventKind::Thinking, serde_json::json!({}), 1_700_000_000_000)
            .unwrap();
        let line = serde_json::to_string(event).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&line).unwrap();
        let t = parsed["t"].as_str().unwrap();
        assert!(t.starts_with("2023-11-14T"), "unexpected timestamp {}", t);
        assert_eq!(parsed["type"], serde_json::json!("thinking"));
    }
}
