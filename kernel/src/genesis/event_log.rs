//! `genesis_event_log`: journal projections for agents.

use super::{opt_u64, req_str, unknown_method, GENESIS_EVENT_LOG};
use crate::error::KernelResult;
use crate::kernel::Kernel;

const DEFAULT_RECENT: u64 = 20;
const MAX_RECENT: u64 = 200;

pub(super) fn dispatch(
    kernel: &mut Kernel,
    _caller: &str,
    method: &str,
    args: &serde_json::Value,
) -> KernelResult<serde_json::Value> {
    match method {
        "recent" => {
            let n = opt_u64(args, "n").unwrap_or(DEFAULT_RECENT).min(MAX_RECENT) as usize;
            Ok(serde_json::json!(kernel.recent_events(n)))
        }
        "get_invokers" => {
            let artifact_id = req_str(args, "artifact_id")?;
            Ok(serde_json::json!(kernel.invokers_of(artifact_id)))
        }
        other => Err(unknown_method(GENESIS_EVENT_LOG, other)),
    }
}
