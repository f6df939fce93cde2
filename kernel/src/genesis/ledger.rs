//! `genesis_ledger`: balances and caller-originated transfers.

use super::{opt_str, req_str, req_u64, unknown_method, GENESIS_LEDGER};
use crate::error::KernelResult;
use crate::kernel::{Kernel, KernelActions, KernelState};

pub(super) fn dispatch(
    kernel: &mut Kernel,
    caller: &str,
    method: &str,
    args: &serde_json::Value,
) -> KernelResult<serde_json::Value> {
    match method {
        "balance" => {
            let principal = opt_str(args, "principal").unwrap_or(caller);
            Ok(serde_json::json!({
                "principal": principal,
                "balance": kernel.balance_of(principal)?,
            }))
        }
        // Transfers always debit the caller; there is no way to move
        // someone else's scrip through this wrapper.
        "transfer" => {
            let to = req_str(args, "to")?.to_string();
            let amount = req_u64(args, "amount")?;
            kernel.transfer_scrip(caller, &to, amount, "ledger_transfer")?;
            Ok(serde_json::json!({
                "from": caller,
                "to": to,
                "amount": amount,
            }))
        }
        other => Err(unknown_method(GENESIS_LEDGER, other)),
    }
}
