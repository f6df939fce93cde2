//! Agent loop cycles against a live kernel with scripted and misbehaving
//! providers. Tokio time is paused, so timeouts fire deterministically.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use oikos_kernel::llm::{Completion, LlmError, LlmProvider, LlmRequest};
use oikos_kernel::scheduler::supervisor::{Supervisor, SupervisorPolicy};
use oikos_kernel::scheduler::{AgentLoop, AgentLoopConfig, CycleOutcome, LoopControl};
use pretty_assertions::assert_eq;
use serde_json::json;

/// Wraps a scripted provider and records every request it sees.
struct RecordingProvider {
    inner: ScriptedProvider,
    requests: Mutex<Vec<LlmRequest>>,
}

#[async_trait]
impl LlmProvider for RecordingProvider {
    async fn complete(&self, request: LlmRequest) -> Result<Completion, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        self.inner.complete(request).await
    }
}

/// Never answers; exercises the per-call timeout.
struct HungProvider;

#[async_trait]
impl LlmProvider for HungProvider {
    async fn complete(&self, _request: LlmRequest) -> Result<Completion, LlmError> {
        std::future::pending().await
    }
}

fn shared(kernel: Kernel) -> SharedKernel {
    Arc::new(tokio::sync::Mutex::new(kernel))
}

fn agent_loop(
    kernel: SharedKernel,
    provider: Arc<dyn LlmProvider>,
    agent: &str,
    max_errors: u32,
) -> AgentLoop {
    let policy = SupervisorPolicy {
        initial_backoff: Duration::from_secs(1),
        max_backoff: Duration::from_secs(60),
        multiplier: 2.0,
        max_restarts_per_hour: 10,
    };
    AgentLoop::new(
        kernel,
        provider,
        LoopControl::new(),
        Supervisor::new(policy, max_errors),
        AgentLoopConfig {
            agent_id: agent.to_string(),
            llm_model: "test-model".to_string(),
            llm_timeout: Duration::from_secs(5),
            max_tokens: 256,
        },
    )
}

#[tokio::test(start_paused = true)]
async fn a_cycle_debits_budgets_and_executes_the_proposal() {
    let (kernel, _clock) = test_kernel();
    let kernel = shared(kernel);
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::action(
        r#"{"action_type":"invoke","principal_id":"alice","artifact_id":"genesis_ledger","method":"transfer","args":{"to":"bob","amount":10}}"#,
        0.002,
    )]));
    let mut agent = agent_loop(Arc::clone(&kernel), provider, "alice", 3);

    let outcome = agent.run_cycle().await;
    let CycleOutcome::Acted(result) = outcome else {
        panic!("expected an action, got {:?}", outcome);
    };
    assert!(result.ok, "{}", result.message);

    let mut kernel = kernel.lock().await;
    assert_eq!(balance(&kernel, "bob"), 110);
    // $0.002 = 2000 micro-dollars debited from the depletable budget.
    assert_eq!(
        kernel.resource_headroom("alice", "llm_dollar_budget").unwrap(),
        5_000_000 - 2_000
    );
    assert_eq!(kernel.resource_headroom("alice", "call_budget").unwrap(), 9);
    // History ring and working memory updated; thinking event journaled.
    assert_eq!(kernel.agents()["alice"].history.len(), 1);
    assert!(kernel.agents()["alice"].history[0].ok);
    let memory = kernel.store().get("memory:alice").expect("working memory");
    assert!(memory.content.contains("\"ok\":true"));
    let types = event_types_since(&kernel, 0);
    assert!(types.contains(&"thinking".to_string()));
}

#[tokio::test(start_paused = true)]
async fn subscriptions_are_reread_every_cycle() {
    let (mut kernel, _clock) = test_kernel();
    kernel.execute(intent(json!({
        "action_type": "write",
        "principal_id": "bob",
        "artifact_id": "board",
        "type": "memory",
        "content": "version one",
    })));
    kernel.execute(intent(json!({
        "action_type": "subscribe",
        "principal_id": "alice",
        "artifact_id": "board",
    })));
    let kernel = shared(kernel);

    let noop = r#"{"action_type":"noop","principal_id":"alice"}"#;
    let provider = Arc::new(RecordingProvider {
        inner: ScriptedProvider::new(vec![
            ScriptedProvider::action(noop, 0.001),
            ScriptedProvider::action(noop, 0.001),
        ]),
        requests: Mutex::new(Vec::new()),
    });
    let recording: Arc<dyn LlmProvider> = Arc::clone(&provider) as Arc<dyn LlmProvider>;
    let mut agent = agent_loop(Arc::clone(&kernel), recording, "alice", 3);

    assert!(matches!(agent.run_cycle().await, CycleOutcome::Acted(_)));
    // The board changes between cycles.
    kernel.lock().await.execute(intent(json!({
        "action_type": "write",
        "principal_id": "bob",
        "artifact_id": "board",
        "content": "version two",
    })));
    assert!(matches!(agent.run_cycle().await, CycleOutcome::Acted(_)));

    let requests = provider.requests.lock().unwrap();
    let prompt_of = |i: usize| requests[i].messages[1].content.clone();
    assert!(prompt_of(0).contains("version one"));
    assert!(!prompt_of(0).contains("version two"));
    assert!(
        prompt_of(1).contains("version two"),
        "second prompt must see the fresh content"
    );
}

#[tokio::test(start_paused = true)]
async fn rate_window_gates_the_loop() {
    let clock = ManualClock::new(START_MS);
    let mut config = base_config(std::env::temp_dir().join("oikos-unused"));
    config.resources.call_budget.capacity = 1;
    let kernel = shared(Kernel::in_memory(config, clock.clone()).unwrap());

    let noop = r#"{"action_type":"noop","principal_id":"alice"}"#;
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::action(noop, 0.001),
        ScriptedProvider::action(noop, 0.001),
    ]));
    let mut agent = agent_loop(Arc::clone(&kernel), provider, "alice", 3);

    assert!(matches!(agent.run_cycle().await, CycleOutcome::Acted(_)));
    let gated = agent.run_cycle().await;
    let CycleOutcome::Gated { resource, .. } = gated else {
        panic!("expected rate gating, got {:?}", gated);
    };
    assert_eq!(resource, "call_budget");

    // The window slides; the loop can think again.
    clock.advance_ms(61_000);
    assert!(matches!(agent.run_cycle().await, CycleOutcome::Acted(_)));
}

#[tokio::test(start_paused = true)]
async fn starved_agents_die_smart_and_stay_dead() {
    let clock = ManualClock::new(START_MS);
    let mut config = base_config(std::env::temp_dir().join("oikos-unused"));
    config.resources.llm_dollar_budget = 0;
    config.agents.get_mut("alice").unwrap().initial_scrip = 0;
    let kernel = shared(Kernel::in_memory(config, clock).unwrap());

    let provider = Arc::new(ScriptedProvider::new(vec![]));
    let mut agent = agent_loop(kernel, provider, "alice", 3);

    for _ in 0..oikos_kernel::scheduler::SMART_DEATH_GRACE_CYCLES {
        let outcome = agent.run_cycle().await;
        assert!(
            matches!(outcome, CycleOutcome::Gated { ref resource, .. }
                if resource == "llm_dollar_budget"),
            "expected budget gate during grace, got {:?}",
            outcome
        );
    }
    assert_eq!(agent.run_cycle().await, CycleOutcome::SmartDeath);
    assert_eq!(agent.run_cycle().await, CycleOutcome::Stopped);
    assert!(agent.control().is_stopped());
}

#[tokio::test(start_paused = true)]
async fn llm_timeouts_are_journaled_and_backed_off() {
    let (kernel, _clock) = test_kernel();
    let kernel = shared(kernel);
    let mut agent = agent_loop(Arc::clone(&kernel), Arc::new(HungProvider), "alice", 2);

    let first = agent.run_cycle().await;
    assert!(
        matches!(first, CycleOutcome::Errored { backoff: None, .. }),
        "first timeout continues, got {:?}",
        first
    );
    let second = agent.run_cycle().await;
    assert!(
        matches!(second, CycleOutcome::Errored { backoff: Some(_), .. }),
        "threshold reached, expected backoff, got {:?}",
        second
    );

    let kernel = kernel.lock().await;
    let timeouts = event_types_since(&kernel, 0)
        .into_iter()
        .filter(|t| t == "agent_llm_timeout")
        .count();
    assert_eq!(timeouts, 2);
    // No proposal ever reached the executor; the abandoned calls cost
    // nothing.
    assert_eq!(
        kernel
            .agents()
            .get("alice")
            .map(|r| r.history.len())
            .unwrap_or(0),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn malformed_and_impersonating_proposals_fail_the_cycle() {
    let (kernel, _clock) = test_kernel();
    let kernel = shared(kernel);
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::action("this is not json", 0.001),
        ScriptedProvider::action(
            r#"{"action_type":"noop","principal_id":"bob"}"#,
            0.001,
        ),
    ]));
    let mut agent = agent_loop(Arc::clone(&kernel), provider, "alice", 10);

    let outcome = agent.run_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Errored { .. }), "{:?}", outcome);
    let outcome = agent.run_cycle().await;
    let CycleOutcome::Errored { reason, .. } = outcome else {
        panic!("impersonation must fail the cycle");
    };
    assert!(reason.contains("impersonates"), "{}", reason);

    // Usage was still debited: the model was called, the budget is spent.
    let mut kernel = kernel.lock().await;
    assert_eq!(
        kernel.resource_headroom("alice", "llm_dollar_budget").unwrap(),
        5_000_000 - 2 * 1_000
    );
}
