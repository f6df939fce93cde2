//! oikos — the kernel of an agent-ecology simulation.
//!
//! A single-process runtime hosting many autonomous agents that read, write,
//! invoke, and trade content-addressed artifacts under strict resource and
//! permission rules. The kernel enforces the physics — ownership, quotas,
//! rate limits, contracts, event ordering — while agents (driven by external
//! language models) freely propose actions through a narrow surface of
//! eleven action kinds.
//!
//! Layering, leaves first:
//! - [`artifact`]: the artifact store and its immutability invariants.
//! - [`ledger`] / [`resources`]: scrip balances and three-kind resource
//!   accounting (depletable, allocatable, renewable).
//! - [`contract`]: permission dispatch through genesis or executable
//!   contracts.
//! - [`lang`]: the constrained interpreter that runs executable contract and
//!   artifact code under fuel and deadline budgets.
//! - [`action`] / the executor on [`kernel::Kernel`]: the total function from
//!   `ActionIntent` to `ActionResult`.
//! - [`genesis`]: unprivileged wrappers exposing kernel primitives to agents.
//! - [`mint`]: the sealed-bid second-price scoring auction.
//! - [`events`] / [`checkpoint`]: the append-only journal and the snapshot /
//!   restore path.
//! - [`scheduler`]: cooperative per-agent loops, the mint timer, and the
//!   supervisor restart policy.
//! - [`llm`]: the pluggable provider boundary.
//!
//! Concurrency model: one coarse lock around the whole kernel. Agent loops
//! are cooperative tokio tasks that hold the lock only while inside an apply;
//! LLM I/O happens outside it. No component takes finer-grained locks on
//! ledger or resource rows.

pub mod action;
pub mod artifact;
pub mod checkpoint;
pub mod config;
pub mod contract;
pub mod error;
mod executor;
pub mod events;
pub mod genesis;
pub mod kernel;
pub mod lang;
pub mod ledger;
pub mod llm;
pub mod mint;
pub mod resources;
pub mod scheduler;
pub mod types;

pub mod prelude {
    //! Convenience re-exports for embedding the kernel.
    pub use crate::action::{ActionIntent, ActionResult};
    pub use crate::artifact::{Artifact, ArtifactStore};
    pub use crate::config::Config;
    pub use crate::error::{ErrorCode, KernelError};
    pub use crate::events::{Event, EventKind};
    pub use crate::kernel::{Kernel, SharedKernel};
    pub use crate::llm::{Completion, LlmProvider, LlmRequest, ScriptedProvider, Usage};
    pub use crate::scheduler::LoopManager;
    pub use crate::types::{Clock, ManualClock, SystemClock, KERNEL_PRINCIPAL};
}
