//! Kernel assembly: owns every stateful component and exposes the facade.
//!
//! The kernel is the single serialization point. It lives behind one coarse
//! `Arc<tokio::sync::Mutex<..>>`; agent loops lock it only while inside an
//! apply, and all I/O (LLM calls) happens outside the lock. Genesis
//! artifacts and executable code reach state exclusively through the facade
//! methods in [`facade`]; nothing else mutates the store, ledger, resource
//! manager, or mint.

pub mod facade;
mod validate;

pub use facade::{KernelActions, KernelState};

use std::collections::VecDeque;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};

use crate::artifact::{ArtifactStore, CreateSpec};
use crate::config::Config;
use crate::contract;
use crate::error::{KernelError, KernelResult};
use crate::events::{Event, EventJournal, EventKind};
use crate::ledger::Ledger;
use crate::mint::{BidScorer, MintAuction, Scorer, MINT_PRINCIPAL};
use crate::resources::{ResourceKind, ResourceManager, ResourceSpec};
use crate::types::{ArtifactId, Clock, EventNumber, PrincipalId, KERNEL_PRINCIPAL};

/// Registered resource ids.
pub const RES_LLM_BUDGET: &str = "llm_dollar_budget";
pub const RES_DISK_BYTES: &str = "disk_bytes";
pub const RES_CALL_BUDGET: &str = "call_budget";

/// How deep `invoke` may recurse through artifact code.
pub const MAX_INVOKE_DEPTH: usize = 8;

/// Fuel units of interpreter work per scrip charged on invoke.
pub const FUEL_PER_SCRIP: u64 = 1_000;

/// Bounded per-agent action history.
pub const HISTORY_CAPACITY: usize = 64;

pub type SharedKernel = Arc<tokio::sync::Mutex<Kernel>>;

/// One entry of an agent's bounded action history ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub event_number: EventNumber,
    pub action: String,
    pub ok: bool,
    pub message: String,
}

/// Checkpointable per-agent runtime state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentRuntime {
    /// Artifacts auto-materialized into the agent's next prompt,
    /// re-read every cycle.
    pub subscriptions: IndexSet<ArtifactId>,
    pub history: VecDeque<HistoryEntry>,
}

impl AgentRuntime {
    pub fn push_history(&mut self, entry: HistoryEntry) {
        if self.history.len() >= HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }
}

pub struct Kernel {
    pub(crate) config: Config,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) store: ArtifactStore,
    pub(crate) ledger: Ledger,
    pub(crate) resources: ResourceManager,
    pub(crate) mint: MintAuction,
    pub(crate) journal: EventJournal,
    pub(crate) agents: IndexMap<PrincipalId, AgentRuntime>,
    pub(crate) last_checkpoint_event: EventNumber,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("artifacts", &self.store.len())
            .field("event_number", &self.journal.last_number())
            .field("agents", &self.agents.len())
            .finish()
    }
}

impl Kernel {
    /// Fully in-memory kernel (tests and embedding).
    pub fn in_memory(config: Config, clock: Arc<dyn Clock>) -> KernelResult<Self> {
        Self::bootstrap(config, clock, EventJournal::in_memory(), Box::new(BidScorer))
    }

    /// Kernel journaling to `<checkpoint.directory>/events.jsonl`.
    pub fn with_journal_file(config: Config, clock: Arc<dyn Clock>) -> KernelResult<Self> {
        let path = config.checkpoint.directory.join("events.jsonl");
        let journal = EventJournal::with_file(&path)?;
        Self::bootstrap(config, clock, journal, Box::new(BidScorer))
    }

    /// Build and bootstrap a kernel: register resources, install genesis
    /// artifacts, create agent principals, seed initial scrip.
    pub fn bootstrap(
        config: Config,
        clock: Arc<dyn Clock>,
        journal: EventJournal,
        scorer: Box<dyn Scorer>,
    ) -> KernelResult<Self> {
        config.validate()?;
        let now_ms = clock.now_ms();
        let mint = MintAuction::new(&config.mint, now_ms, scorer);
        let mut kernel = Self {
            config,
            clock,
            store: ArtifactStore::new(),
            ledger: Ledger::new(),
            resources: ResourceManager::new(),
            mint,
            journal,
            agents: IndexMap::new(),
            last_checkpoint_event: 0,
        };
        kernel.register_default_resources()?;
        kernel.install_genesis()?;
        kernel.install_agents()?;
        Ok(kernel)
    }

    /// Assemble a kernel from restored parts. Used by checkpoint restore;
    /// skips bootstrap entirely.
    pub(crate) fn from_parts(
        config: Config,
        clock: Arc<dyn Clock>,
        store: ArtifactStore,
        ledger: Ledger,
        resources: ResourceManager,
        mint: MintAuction,
        journal: EventJournal,
        agents: IndexMap<PrincipalId, AgentRuntime>,
        last_checkpoint_event: EventNumber,
    ) -> Self {
        Self {
            config,
            clock,
            store,
            ledger,
            resources,
            mint,
            journal,
            agents,
            last_checkpoint_event,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn mint(&self) -> &MintAuction {
        &self.mint
    }

    pub fn agents(&self) -> &IndexMap<PrincipalId, AgentRuntime> {
        &self.agents
    }

    pub fn agent_mut(&mut self, agent: &str) -> KernelResult<&mut AgentRuntime> {
        self.agents
            .get_mut(agent)
            .ok_or_else(|| KernelError::NotFound(format!("agent {}", agent)))
    }

    pub(crate) fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Append an event stamped with the kernel clock.
    pub(crate) fn emit(
        &mut self,
        kind: EventKind,
        payload: serde_json::Value,
    ) -> KernelResult<EventNumber> {
        let now_ms = self.now_ms();
        let event = self.journal.append(kind, payload, now_ms)?;
        Ok(event.event_number)
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    pub(crate) fn register_default_resources(&mut self) -> KernelResult<()> {
        let res = self.config.resources.clone();
        self.resources.register(ResourceSpec {
            id: RES_LLM_BUDGET.into(),
            kind: ResourceKind::Depletable,
            capacity: res.llm_dollar_budget,
            window_seconds: None,
            tradeable: true,
        })?;
        self.resources.register(ResourceSpec {
            id: RES_DISK_BYTES.into(),
            kind: ResourceKind::Allocatable,
            capacity: res.disk_bytes.capacity,
            window_seconds: None,
            tradeable: true,
        })?;
        self.resources.register(ResourceSpec {
            id: RES_CALL_BUDGET.into(),
            kind: ResourceKind::Renewable,
            capacity: res.call_budget.capacity,
            window_seconds: Some(res.call_budget.window_seconds),
            tradeable: false,
        })?;
        Ok(())
    }

    fn install_genesis(&mut self) -> KernelResult<()> {
        for contract_id in contract::GENESIS_CONTRACT_IDS {
            self.install_kernel_artifact(
                contract_id,
                "contract",
                "Typed genesis contract implemented by the kernel.",
                None,
            )?;
        }
        for (id, description) in crate::genesis::GENESIS_ARTIFACTS {
            self.install_kernel_artifact(id, "code", description, None)?;
        }
        // Escrow and mint hold scrip on behalf of trades and bids.
        self.create_principal(crate::genesis::GENESIS_ESCROW)?;
        self.create_principal(MINT_PRINCIPAL)?;

        // The escrow's listing table is escrow-owned and written through
        // the ordinary permission-checked path, not kernel-protected.
        let event_number = self.journal.next_number();
        let listings = self
            .store
            .create(
                CreateSpec {
                    id: crate::genesis::ESCROW_LISTINGS_ARTIFACT.to_string(),
                    artifact_type: "memory".to_string(),
                    created_by: crate::genesis::GENESIS_ESCROW.to_string(),
                    content: "[]".to_string(),
                    code: None,
                    access_contract_id: Some(
                        contract::GENESIS_CONTRACT_CREATOR_ONLY.to_string(),
                    ),
                    kernel_protected: false,
                    metadata: IndexMap::new(),
                },
                event_number,
                true,
            )?
            .clone();
        self.emit(
            EventKind::ArtifactCreated,
            serde_json::json!({ "artifact": listings }),
        )?;
        Ok(())
    }

    /// Create a kernel-protected artifact owned by the kernel.
    pub(crate) fn install_kernel_artifact(
        &mut self,
        id: &str,
        artifact_type: &str,
        content: &str,
        code: Option<String>,
    ) -> KernelResult<()> {
        let event_number = self.journal.next_number();
        let artifact = self
            .store
            .create(
                CreateSpec {
                    id: id.to_string(),
                    artifact_type: artifact_type.to_string(),
                    created_by: KERNEL_PRINCIPAL.to_string(),
                    content: content.to_string(),
                    code,
                    access_contract_id: Some(
                        contract::GENESIS_CONTRACT_FREEWARE.to_string(),
                    ),
                    kernel_protected: true,
                    metadata: IndexMap::new(),
                },
                event_number,
                true,
            )?
            .clone();
        self.emit(
            EventKind::ArtifactCreated,
            serde_json::json!({ "artifact": artifact }),
        )?;
        Ok(())
    }

    fn install_agents(&mut self) -> KernelResult<()> {
        let agents = self.config.agents.clone();
        for (agent_id, agent_config) in agents {
            let event_number = self.journal.next_number();
            let mut metadata = IndexMap::new();
            metadata.insert(
                "system_prompt".to_string(),
                serde_json::json!(agent_config.system_prompt),
            );
            metadata.insert(
                "llm_model".to_string(),
                serde_json::json!(agent_config.llm_model),
            );
            metadata.insert("context".to_string(), serde_json::json!({}));
            let artifact = self
                .store
                .create(
                    CreateSpec {
                        id: agent_id.clone(),
                        artifact_type: "agent".to_string(),
                        created_by: agent_id.clone(),
                        content: String::new(),
                        code: None,
                        access_contract_id: Some(
                            contract::GENESIS_CONTRACT_SELF_OWNED.to_string(),
                        ),
                        kernel_protected: false,
                        metadata,
                    },
                    event_number,
                    true,
                )?
                .clone();
            self.emit(
                EventKind::ArtifactCreated,
                serde_json::json!({ "artifact": artifact }),
            )?;
            self.create_principal(&agent_id)?;
            if agent_config.initial_scrip > 0 {
                self.credit_scrip(&agent_id, agent_config.initial_scrip, "genesis_grant")?;
            }
            let mut runtime = AgentRuntime::default();
            for artifact_id in agent_config.subscribed_artifacts {
                runtime.subscriptions.insert(artifact_id);
            }
            self.agents.insert(agent_id, runtime);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shared primitives
    // ------------------------------------------------------------------

    /// The only path that grants standing: marks the artifact, creates the
    /// ledger row at zero, and ensures a row for every registered resource.
    /// All three happen in one apply, or not at all.
    pub fn create_principal(&mut self, artifact_id: &str) -> KernelResult<()> {
        let artifact = self.store.get_required(artifact_id)?;
        if artifact.has_standing {
            return Err(KernelError::Validation(format!(
                "{} already has standing",
                artifact_id
            )));
        }
        self.emit(
            EventKind::KernelCreatePrincipal,
            serde_json::json!({ "principal": artifact_id }),
        )?;
        let event_number = self.journal.next_number();
        self.store.set_standing(artifact_id, event_number)?;
        self.ledger.ensure_row(artifact_id);
        self.resources.ensure_principal(artifact_id);
        self.emit(
            EventKind::PrincipalCreated,
            serde_json::json!({ "principal": artifact_id }),
        )?;
        Ok(())
    }

    /// Mint-side credit (bootstrap grants, auction rewards). Total scrip
    /// grows only here.
    pub(crate) fn credit_scrip(
        &mut self,
        to: &str,
        amount: u64,
        reason: &str,
    ) -> KernelResult<()> {
        self.ledger.credit(to, amount)?;
        self.emit(
            EventKind::ScripCredited,
            serde_json::json!({ "to": to, "amount": amount, "reason": reason }),
        )?;
        Ok(())
    }

    pub fn is_principal(&self, id: &str) -> bool {
        self.ledger.has_row(id)
    }

    // ------------------------------------------------------------------
    // Mint resolution
    // ------------------------------------------------------------------

    /// Resolve every due auction period. Returns how many resolutions were
    /// applied. Called by the scheduler's mint timer.
    pub fn resolve_due_auctions(&mut self) -> KernelResult<usize> {
        let mut applied = 0;
        loop {
            let now_ms = self.now_ms();
            if !self.mint.is_due(now_ms) {
                break;
            }
            let store = &self.store;
            let outcome = self
                .mint
                .resolve_due(now_ms, |id| store.get(id).map(|a| a.content.clone()));
            let Some(outcome) = outcome else {
                continue; // empty period: clock advanced, nothing to settle
            };
            // Escrow unwinding: refunds flow back out of the mint principal;
            // the clearing price stays with it. The reward is new scrip.
            for (principal, amount) in &outcome.refunds {
                self.ledger.transfer(MINT_PRINCIPAL, principal, *amount)?;
                self.emit(
                    EventKind::ScripTransferred,
                    serde_json::json!({
                        "from": MINT_PRINCIPAL,
                        "to": principal,
                        "amount": amount,
                        "reason": "mint_refund",
                    }),
                )?;
            }
            let resolution = outcome.resolution;
            if resolution.reward > 0 {
                self.ledger.credit(&resolution.winner, resolution.reward)?;
            }
            self.emit(
                EventKind::MintResolution,
                serde_json::json!({ "resolution": resolution }),
            )?;
            applied += 1;
        }
        if applied > 0 {
            self.maybe_checkpoint()?;
        }
        Ok(applied)
    }

    // ------------------------------------------------------------------
    // Checkpointing hook
    // ------------------------------------------------------------------

    /// Write a snapshot when the configured interval has elapsed.
    pub(crate) fn maybe_checkpoint(&mut self) -> KernelResult<()> {
        let interval = self.config.checkpoint.interval_events;
        if self.journal.last_number() < self.last_checkpoint_event + interval {
            return Ok(());
        }
        crate::checkpoint::write_checkpoint(self)?;
        Ok(())
    }

    /// Validate every kernel invariant; any violation is a hard error.
    pub fn validate_invariants(&self) -> KernelResult<()> {
        validate::validate(self)
    }

    // ------------------------------------------------------------------
    // Projections used by the scheduler and genesis wrappers
    // ------------------------------------------------------------------

    /// Artifact ids invoked by whom, from the journal's `action_executed`
    /// trail.
    pub fn invokers_of(&self, artifact_id: &str) -> Vec<PrincipalId> {
        let mut seen = IndexSet::new();
        for event in self.journal.events() {
            if event.kind == EventKind::ActionExecuted
                && event.payload.get("action").and_then(|v| v.as_str()) == Some("invoke")
                && event.payload.get("target").and_then(|v| v.as_str()) == Some(artifact_id)
            {
                if let Some(principal) = event.payload.get("principal").and_then(|v| v.as_str()) {
                    seen.insert(principal.to_string());
                }
            }
        }
        seen.into_iter().collect()
    }

    /// Compact projection of a recent journal slice.
    pub fn recent_events(&self, n: usize) -> Vec<serde_json::Value> {
        self.journal
            .recent(n)
            .iter()
            .map(event_summary)
            .collect()
    }

    /// Current headroom for one `(principal, resource)` row. Prunes
    /// renewable windows as a side effect, like every resource read.
    pub fn resource_headroom(&mut self, principal: &str, resource: &str) -> KernelResult<u64> {
        let now_ms = self.now_ms();
        self.resources.balance(principal, resource, now_ms)
    }

    /// `(id, tradeable)` for every registered resource.
    pub fn resource_specs(&self) -> Vec<(String, bool)> {
        self.resources
            .registered()
            .map(|s| (s.id.clone(), s.tradeable))
            .collect()
    }

    /// Mint status projection: pending count, clearing parameters, time to
    /// the next resolution.
    pub fn mint_status(&self) -> serde_json::Value {
        let now_ms = self.now_ms();
        serde_json::json!({
            "pending_submissions": self.mint.pending().len(),
            "minimum_bid": self.mint.minimum_bid(),
            "next_resolution_ms": self.mint.next_due_ms(),
            "seconds_to_next_auction":
                self.mint.next_due_ms().saturating_sub(now_ms) / 1_000,
            "resolutions": self.mint.history(usize::MAX).len(),
        })
    }
}

pub(crate) fn event_summary(event: &Event) -> serde_json::Value {
    serde_json::json!({
        "event_number": event.event_number,
        "t": event.t,
        "type": event.kind.as_str(),
        "payload": serde_json::Value::Object(event.payload.clone()),
    })
}
