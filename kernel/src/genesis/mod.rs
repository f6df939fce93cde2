//! Genesis artifacts: unprivileged wrappers exposing kernel primitives.
//!
//! Each is an artifact of `type=code` with `kernel_protected=true`,
//! method-dispatched on `invoke`. Handlers reach state only through the
//! kernel facade ([`crate::kernel::KernelState`] /
//! [`crate::kernel::KernelActions`]) and the ordinary permission-checked
//! write path, so an agent-authored replacement would be behaviorally
//! equivalent — these are conveniences, not privileges.

mod escrow;
mod event_log;
mod ledger;
mod mint;
mod rights;
mod store;

use crate::error::{KernelError, KernelResult};
use crate::kernel::Kernel;

pub const GENESIS_STORE: &str = "genesis_store";
pub const GENESIS_LEDGER: &str = "genesis_ledger";
pub const GENESIS_EVENT_LOG: &str = "genesis_event_log";
pub const GENESIS_MINT: &str = "genesis_mint";
pub const GENESIS_ESCROW: &str = "genesis_escrow";
pub const GENESIS_RIGHTS_REGISTRY: &str = "genesis_rights_registry";

/// Artifact backing the escrow's listing table. Owned by the escrow
/// principal and written through the ordinary permission-checked path.
pub const ESCROW_LISTINGS_ARTIFACT: &str = "genesis_escrow_listings";

/// `(id, description)` for every genesis wrapper installed at bootstrap.
pub const GENESIS_ARTIFACTS: &[(&str, &str)] = &[
    (
        GENESIS_STORE,
        "Artifact index queries: list(filter?), get(id), by_type(t).",
    ),
    (
        GENESIS_LEDGER,
        "Scrip ledger: balance(principal?), transfer(to, amount).",
    ),
    (
        GENESIS_EVENT_LOG,
        "Event journal projections: recent(n), get_invokers(artifact_id).",
    ),
    (
        GENESIS_MINT,
        "Mint auction: submit(artifact_id, bid), cancel(submission_id), status(), history(limit).",
    ),
    (
        GENESIS_ESCROW,
        "Artifact trade escrow: list(artifact_id, price), purchase(listing_id), cancel(listing_id), listings().",
    ),
    (
        GENESIS_RIGHTS_REGISTRY,
        "Quota introspection and tradeable-quota transfers.",
    ),
];

pub fn is_genesis(artifact_id: &str) -> bool {
    GENESIS_ARTIFACTS.iter().any(|(id, _)| *id == artifact_id)
}

/// Invoke a genesis method as `caller`. Arguments arrive as the intent's
/// JSON `args` payload.
pub fn dispatch(
    kernel: &mut Kernel,
    caller: &str,
    artifact_id: &str,
    method: Option<&str>,
    args: serde_json::Value,
) -> KernelResult<serde_json::Value> {
    let method = method.ok_or_else(|| {
        KernelError::Validation(format!("invoking {} requires a method", artifact_id))
    })?;
    match artifact_id {
        GENESIS_STORE => store::dispatch(kernel, caller, method, &args),
        GENESIS_LEDGER => ledger::dispatch(kernel, caller, method, &args),
        GENESIS_EVENT_LOG => event_log::dispatch(kernel, caller, method, &args),
        GENESIS_MINT => mint::dispatch(kernel, caller, method, &args),
        GENESIS_ESCROW => escrow::dispatch(kernel, caller, method, &args),
        GENESIS_RIGHTS_REGISTRY => rights::dispatch(kernel, caller, method, &args),
        other => Err(KernelError::NotFound(format!("genesis artifact {}", other))),
    }
}

pub(crate) fn unknown_method(artifact_id: &str, method: &str) -> KernelError {
    KernelError::Validation(format!("{} has no method {}", artifact_id, method))
}

pub(crate) fn req_str<'a>(
    args: &'a serde_json::Value,
    key: &str,
) -> KernelResult<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| KernelError::Validation(format!("missing string argument {}", key)))
}

pub(crate) fn opt_str<'a>(args: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

pub(crate) fn req_u64(args: &serde_json::Value, key: &str) -> KernelResult<u64> {
    args.get(key)
        .and_then(|v| v.as_u64())
        .ok_or_else(|| {
            KernelError::Validation(format!("missing non-negative integer argument {}", key))
        })
}

pub(crate) fn opt_u64(args: &serde_json::Value, key: &str) -> Option<u64> {
    args.get(key).and_then(|v| v.as_u64())
}
