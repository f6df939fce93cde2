//! Agent scheduler: cooperative loops on one runtime, plus the mint timer.
//!
//! Everything here is a cooperative tokio task. Kernel state is touched
//! only under the shared lock; the only suspension points are LLM I/O, gate
//! sleeps, and supervisor backoffs — never inside an apply.

mod agent_loop;
pub mod supervisor;

pub use agent_loop::{
    AgentLoop, AgentLoopConfig, CycleOutcome, LoopControl, LoopState,
    ESTIMATED_CALL_COST_MICRO, LLM_TIMEOUT, MAX_TOKENS, SMART_DEATH_GRACE_CYCLES,
    SUBSCRIBED_BYTES_CAP, SUBSCRIBED_TOTAL_CAP,
};
pub use supervisor::{Supervisor, SupervisorPolicy, Verdict};

use std::sync::Arc;
use std::time::Duration;

use indexmap::IndexMap;
use tokio::task::JoinHandle;

use crate::error::KernelResult;
use crate::kernel::SharedKernel;
use crate::llm::LlmProvider;
use crate::types::PrincipalId;

/// How often the mint timer re-checks the clock.
const MINT_TICK: Duration = Duration::from_millis(250);

/// Spawns and controls every agent loop and the mint timer.
pub struct LoopManager {
    kernel: SharedKernel,
    controls: IndexMap<PrincipalId, Arc<LoopControl>>,
    handles: Vec<JoinHandle<()>>,
}

impl LoopManager {
    pub fn new(kernel: SharedKernel) -> Self {
        Self {
            kernel,
            controls: IndexMap::new(),
            handles: Vec::new(),
        }
    }

    pub fn kernel(&self) -> SharedKernel {
        Arc::clone(&self.kernel)
    }

    /// One task per configured agent, all sharing the provider.
    pub async fn spawn_agents(&mut self, provider: Arc<dyn LlmProvider>) -> KernelResult<()> {
        let (agent_configs, supervisor_config) = {
            let kernel = self.kernel.lock().await;
            (
                kernel.config().agents.clone(),
                kernel.config().supervisor.clone(),
            )
        };
        let policy = SupervisorPolicy::from(&supervisor_config);
        for (agent_id, agent_config) in agent_configs {
            let control = LoopControl::new();
            let agent_loop = AgentLoop::new(
                Arc::clone(&self.kernel),
                Arc::clone(&provider),
                Arc::clone(&control),
                Supervisor::new(policy.clone(), agent_config.max_consecutive_errors),
                AgentLoopConfig {
                    agent_id: agent_id.clone(),
                    llm_model: agent_config.llm_model.clone(),
                    llm_timeout: LLM_TIMEOUT,
                    max_tokens: MAX_TOKENS,
                },
            );
            log::info!("spawning agent loop {}", agent_id);
            self.controls.insert(agent_id, control);
            self.handles.push(tokio::spawn(agent_loop.run()));
        }
        Ok(())
    }

    /// Background task resolving due auction periods, draining any backlog.
    pub fn spawn_mint_timer(&mut self) {
        let kernel = Arc::clone(&self.kernel);
        self.handles.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(MINT_TICK).await;
                let mut kernel = kernel.lock().await;
                if let Err(e) = kernel.resolve_due_auctions() {
                    log::error!("mint resolution failed: {}", e);
                }
            }
        }));
    }

    pub fn control(&self, agent: &str) -> Option<&Arc<LoopControl>> {
        self.controls.get(agent)
    }

    pub fn pause(&self, agent: &str) {
        if let Some(control) = self.controls.get(agent) {
            control.pause();
        }
    }

    pub fn resume(&self, agent: &str) {
        if let Some(control) = self.controls.get(agent) {
            control.resume();
        }
    }

    /// Stop every loop, wait for them to unwind, write a final checkpoint.
    pub async fn shutdown(mut self) -> KernelResult<()> {
        for control in self.controls.values() {
            control.stop();
        }
        for handle in self.handles.drain(..) {
            handle.abort();
            let _ = handle.await;
        }
        let mut kernel = self.kernel.lock().await;
        crate::checkpoint::write_checkpoint(&mut kernel)?;
        Ok(())
    }
}
