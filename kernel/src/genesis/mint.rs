//! `genesis_mint`: the auction surface. All auction state is owned by the
//! kernel's mint; this wrapper only routes.

use super::{opt_u64, req_str, req_u64, unknown_method, GENESIS_MINT};
use crate::error::KernelResult;
use crate::kernel::{Kernel, KernelActions};

pub(super) fn dispatch(
    kernel: &mut Kernel,
    caller: &str,
    method: &str,
    args: &serde_json::Value,
) -> KernelResult<serde_json::Value> {
    match method {
        "submit" => {
            let artifact_id = req_str(args, "artifact_id")?.to_string();
            let bid = req_u64(args, "bid")?;
            let submission_id = kernel.submit_for_mint(caller, &artifact_id, bid)?;
            Ok(serde_json::json!({ "submission_id": submission_id }))
        }
        "cancel" => {
            let submission_id = req_str(args, "submission_id")?.to_string();
            let refunded = kernel.cancel_mint_submission(caller, &submission_id)?;
            Ok(serde_json::json!({ "refunded": refunded }))
        }
        "status" => Ok(kernel.mint_status()),
        "history" => {
            let limit = opt_u64(args, "limit").unwrap_or(10).min(100) as usize;
            Ok(serde_json::json!(kernel.mint().history(limit)))
        }
        other => Err(unknown_method(GENESIS_MINT, other)),
    }
}
