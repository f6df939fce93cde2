//! One cooperative loop per agent.
//!
//! Cycle: budget gate, rate gate, prompt assembly (subscriptions re-read
//! every cycle), LLM call outside the kernel lock, fail-loud usage
//! accounting, intent parse, executor dispatch, history + working-memory
//! update, `thinking` event. Cancellation and pause are observed at the top
//! of each cycle; an abandoned LLM call costs nothing because the debit
//! happens after the response returns.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

use crate::action::{ActionIntent, ActionResult};
use crate::events::EventKind;
use crate::kernel::{
    HistoryEntry, KernelActions, SharedKernel, RES_CALL_BUDGET, RES_LLM_BUDGET,
};
use crate::llm::{parse_action_content, LlmProvider, LlmRequest, Message};
use crate::scheduler::supervisor::{Supervisor, Verdict};
use crate::types::PrincipalId;

/// Pre-call estimate used by the budget gate, in micro-dollars.
pub const ESTIMATED_CALL_COST_MICRO: u64 = 10_000;
/// How long a gated loop sleeps before re-checking.
pub const GATE_RECHECK: Duration = Duration::from_secs(1);
/// Per-call LLM timeout.
pub const LLM_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_TOKENS: u32 = 1_024;
/// Per-artifact and total caps on subscribed content materialized into the
/// prompt.
pub const SUBSCRIBED_BYTES_CAP: usize = 8 * 1024;
pub const SUBSCRIBED_TOTAL_CAP: usize = 64 * 1024;
/// Budget-starved cycles tolerated before smart death.
pub const SMART_DEATH_GRACE_CYCLES: u32 = 3;

/// Loop lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Thinking,
    Acting,
    Sleeping,
    Paused,
    Stopped,
}

/// Shared control block: the supervisor and operators flip these; the loop
/// observes them cooperatively at cycle boundaries.
#[derive(Debug, Default)]
pub struct LoopControl {
    paused: AtomicBool,
    stopped: AtomicBool,
    state: std::sync::Mutex<Option<LoopState>>,
    pub notify: Notify,
}

impl LoopControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: std::sync::Mutex::new(Some(LoopState::Idle)),
            ..Self::default()
        })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> LoopState {
        self.state
            .lock()
            .ok()
            .and_then(|s| *s)
            .unwrap_or(LoopState::Stopped)
    }

    fn set_state(&self, state: LoopState) {
        if let Ok(mut slot) = self.state.lock() {
            *slot = Some(state);
        }
    }
}

/// What one cycle did; drives the outer `run` loop and the tests.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Acted(ActionResult),
    /// A gate held the cycle; sleep and retry.
    Gated { resource: String, wait: Duration },
    Paused,
    Stopped,
    /// Terminal starvation: not restarted.
    SmartDeath,
    /// Cycle-level failure with the supervisor's verdict applied.
    Errored { reason: String, backoff: Option<Duration> },
}

pub struct AgentLoopConfig {
    pub agent_id: PrincipalId,
    pub llm_model: String,
    pub llm_timeout: Duration,
    pub max_tokens: u32,
}

pub struct AgentLoop {
    kernel: SharedKernel,
    provider: Arc<dyn LlmProvider>,
    control: Arc<LoopControl>,
    supervisor: Supervisor,
    config: AgentLoopConfig,
    budget_starved_cycles: u32,
}

impl AgentLoop {
    pub fn new(
        kernel: SharedKernel,
        provider: Arc<dyn LlmProvider>,
        control: Arc<LoopControl>,
        supervisor: Supervisor,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            kernel,
            provider,
            control,
            supervisor,
            config,
            budget_starved_cycles: 0,
        }
    }

    pub fn control(&self) -> Arc<LoopControl> {
        Arc::clone(&self.control)
    }

    /// Drive cycles until stopped. Pauses cooperatively; backoffs sleep in
    /// place with state preserved.
    pub async fn run(mut self) {
        loop {
            match self.run_cycle().await {
                CycleOutcome::Stopped | CycleOutcome::SmartDeath => break,
                CycleOutcome::Paused => {
                    self.control.set_state(LoopState::Paused);
                    self.control.notify.notified().await;
                }
                CycleOutcome::Gated { wait, .. } => {
                    self.control.set_state(LoopState::Sleeping);
                    tokio::time::sleep(wait).await;
                }
                CycleOutcome::Errored {
                    backoff: Some(backoff),
                    ..
                } => {
                    self.control.set_state(LoopState::Paused);
                    tokio::time::sleep(backoff).await;
                }
                CycleOutcome::Errored { backoff: None, .. } | CycleOutcome::Acted(_) => {
                    self.control.set_state(LoopState::Idle);
                    tokio::task::yield_now().await;
                }
            }
        }
        self.control.set_state(LoopState::Stopped);
    }

    /// One full cycle. Public so tests can drive the loop deterministically.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if self.control.is_stopped() {
            return CycleOutcome::Stopped;
        }
        if self.control.is_paused() {
            return CycleOutcome::Paused;
        }

        // Gates and prompt assembly under the lock; the LLM call outside it.
        let agent = self.config.agent_id.clone();
        let request = {
            let mut kernel = self.kernel.lock().await;
            if !kernel.is_principal(&agent) {
                self.control.stop();
                return CycleOutcome::Stopped;
            }
            let scrip = kernel.ledger().balance(&agent).unwrap_or(0);
            let llm_headroom = kernel
                .resource_headroom(&agent, RES_LLM_BUDGET)
                .unwrap_or(0);
            if llm_headroom < ESTIMATED_CALL_COST_MICRO {
                // Depletable budgets never refill on their own; an agent
                // with no scrip to trade for budget is terminally starved.
                self.budget_starved_cycles += 1;
                if scrip == 0 && self.budget_starved_cycles > SMART_DEATH_GRACE_CYCLES {
                    log::info!("agent {} starved of budget and scrip; stopping", agent);
                    self.control.stop();
                    return CycleOutcome::SmartDeath;
                }
                return CycleOutcome::Gated {
                    resource: RES_LLM_BUDGET.to_string(),
                    wait: GATE_RECHECK,
                };
            }
            self.budget_starved_cycles = 0;
            let rate_ok = kernel
                .resource_headroom(&agent, RES_CALL_BUDGET)
                .unwrap_or(0)
                >= 1;
            if !rate_ok {
                return CycleOutcome::Gated {
                    resource: RES_CALL_BUDGET.to_string(),
                    wait: GATE_RECHECK,
                };
            }
            self.control.set_state(LoopState::Thinking);
            self.build_request(&mut kernel, &agent)
        };

        let completion = tokio::time::timeout(
            self.config.llm_timeout,
            self.provider.complete(request),
        )
        .await;

        let mut kernel = self.kernel.lock().await;
        let now_ms = kernel.now_ms();
        let completion = match completion {
            Err(_) => {
                let _ = kernel.emit(
                    EventKind::AgentLlmTimeout,
                    serde_json::json!({
                        "agent": agent,
                        "timeout_ms": self.config.llm_timeout.as_millis() as u64,
                    }),
                );
                drop(kernel);
                return self.fail_cycle("llm timeout", now_ms);
            }
            Ok(Err(e)) => {
                drop(kernel);
                return self.fail_cycle(&format!("provider: {}", e), now_ms);
            }
            Ok(Ok(completion)) => completion,
        };

        // Fail-loud accounting: a malformed cost is an error cycle, never a
        // silent zero.
        let cost_micro = match completion.usage.cost_micro_dollars() {
            Ok(cost) => cost,
            Err(e) => {
                drop(kernel);
                return self.fail_cycle(&e.to_string(), now_ms);
            }
        };
        let headroom = kernel
            .resource_headroom(&agent, RES_LLM_BUDGET)
            .unwrap_or(0);
        let charged = cost_micro.min(headroom);
        if charged < cost_micro {
            log::warn!(
                "agent {} llm cost {} overran remaining budget {}",
                agent,
                cost_micro,
                headroom
            );
        }
        if charged > 0 {
            if let Err(e) = kernel.consume_quota(&agent, &agent, RES_LLM_BUDGET, charged) {
                log::error!("budget debit failed for {}: {}", agent, e);
            }
        }
        if let Err(e) = kernel.consume_quota(&agent, &agent, RES_CALL_BUDGET, 1) {
            log::error!("rate debit failed for {}: {}", agent, e);
        }

        let intent = match parse_action_content(&completion.content) {
            Ok(intent) if intent.principal_id() == agent => intent,
            Ok(intent) => {
                drop(kernel);
                return self.fail_cycle(
                    &format!(
                        "proposal impersonates {} instead of {}",
                        intent.principal_id(),
                        agent
                    ),
                    now_ms,
                );
            }
            Err(e) => {
                drop(kernel);
                return self.fail_cycle(&e, now_ms);
            }
        };

        self.control.set_state(LoopState::Acting);
        let result = kernel.execute(intent.clone());

        let entry = HistoryEntry {
            event_number: kernel.journal().last_number(),
            action: intent.kind_name().to_string(),
            ok: result.ok,
            message: result.message.clone(),
        };
        if let Ok(runtime) = kernel.agent_mut(&agent) {
            runtime.push_history(entry);
        }
        self.write_working_memory(&mut kernel, &agent, &intent, &result);
        let _ = kernel.emit(
            EventKind::Thinking,
            serde_json::json!({
                "agent": agent,
                "action": intent.kind_name(),
                "ok": result.ok,
                "usage": completion.usage,
                "charged_micro_dollars": charged,
            }),
        );
        self.supervisor.on_success();
        CycleOutcome::Acted(result)
    }

    fn fail_cycle(&mut self, reason: &str, now_ms: u64) -> CycleOutcome {
        log::warn!("agent {} cycle failed: {}", self.config.agent_id, reason);
        match self.supervisor.on_error(now_ms) {
            Verdict::Continue => CycleOutcome::Errored {
                reason: reason.to_string(),
                backoff: None,
            },
            Verdict::Backoff(backoff) => CycleOutcome::Errored {
                reason: reason.to_string(),
                backoff: Some(backoff),
            },
            Verdict::Stop(why) => {
                log::error!("agent {} stopped by supervisor: {}", self.config.agent_id, why);
                self.control.stop();
                CycleOutcome::Stopped
            }
        }
    }

    /// System prompt plus a context message carrying balances, recent
    /// history, and subscribed artifact contents. Subscriptions are
    /// re-read every cycle; a write to a subscribed artifact is visible in
    /// the very next prompt.
    fn build_request(
        &self,
        kernel: &mut crate::kernel::Kernel,
        agent: &str,
    ) -> LlmRequest {
        let system_prompt = kernel
            .store()
            .get(agent)
            .and_then(|a| a.metadata.get("system_prompt"))
            .and_then(|v| v.as_str())
            .unwrap_or("You are an agent in an artifact ecology.")
            .to_string();

        let balance = kernel.ledger().balance(agent).unwrap_or(0);
        let history: Vec<serde_json::Value> = kernel
            .agents()
            .get(agent)
            .map(|runtime| {
                runtime
                    .history
                    .iter()
                    .rev()
                    .take(8)
                    .map(|h| {
                        serde_json::json!({
                            "action": h.action, "ok": h.ok, "message": h.message,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let subscriptions: Vec<String> = kernel
            .agents()
            .get(agent)
            .map(|r| r.subscriptions.iter().cloned().collect())
            .unwrap_or_default();
        let mut subscribed = serde_json::Map::new();
        let mut total = 0usize;
        for artifact_id in subscriptions {
            if total >= SUBSCRIBED_TOTAL_CAP {
                break;
            }
            // Permission-checked read; artifacts the agent lost access to
            // simply drop out of the prompt.
            let Ok(projection) = kernel.read_as(agent, &artifact_id) else {
                continue;
            };
            let raw = projection
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let cap = SUBSCRIBED_BYTES_CAP.min(SUBSCRIBED_TOTAL_CAP - total);
            let content = truncate_at_char_boundary(raw, cap).to_string();
            total += content.len();
            subscribed.insert(artifact_id, serde_json::json!(content));
        }

        let context = serde_json::json!({
            "principal_id": agent,
            "scrip_balance": balance,
            "recent_actions": history,
            "subscribed_artifacts": subscribed,
            "reply_format":
                "Reply with a single JSON object: {\"action_type\": ..., \"principal_id\": ..., ...}",
        });
        LlmRequest {
            model: self.config.llm_model.clone(),
            messages: vec![
                Message::system(system_prompt),
                Message::user(context.to_string()),
            ],
            max_tokens: self.config.max_tokens,
        }
    }

    /// Persist a compact working-memory artifact through the ordinary write
    /// action, so quota and contract rules apply to the agent's own memory.
    fn write_working_memory(
        &self,
        kernel: &mut crate::kernel::Kernel,
        agent: &str,
        intent: &ActionIntent,
        result: &ActionResult,
    ) {
        let memory_id = format!("memory:{}", agent);
        let content = serde_json::json!({
            "last_action": intent.kind_name(),
            "ok": result.ok,
            "message": result.message,
            "error_code": result.error_code,
        })
        .to_string();
        let write = ActionIntent::Write {
            principal_id: agent.to_string(),
            artifact_id: memory_id,
            content: Some(content),
            code: None,
            metadata: None,
            access_contract_id: Some(
                crate::contract::GENESIS_CONTRACT_PRIVATE.to_string(),
            ),
            artifact_type: Some("memory".to_string()),
            created_by: None,
        };
        let memory_result = kernel.execute(write);
        if !memory_result.ok {
            log::debug!(
                "agent {} working-memory write failed: {}",
                agent,
                memory_result.message
            );
        }
    }
}

/// Byte-capped prefix that never splits a UTF-8 character.
fn truncate_at_char_boundary(s: &str, cap: usize) -> &str {
    if s.len() <= cap {
        return s;
    }
    let mut end = cap;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
