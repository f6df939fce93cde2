//! `genesis_rights_registry`: quota introspection and tradeable-quota
//! transfers over the resource manager.

use super::{opt_str, req_str, req_u64, unknown_method, GENESIS_RIGHTS_REGISTRY};
use crate::error::KernelResult;
use crate::kernel::{Kernel, KernelActions};

pub(super) fn dispatch(
    kernel: &mut Kernel,
    caller: &str,
    method: &str,
    args: &serde_json::Value,
) -> KernelResult<serde_json::Value> {
    match method {
        "quotas" => {
            let principal = opt_str(args, "principal").unwrap_or(caller).to_string();
            let mut out = serde_json::Map::new();
            for (resource, tradeable) in kernel.resource_specs() {
                out.insert(
                    resource.clone(),
                    serde_json::json!({
                        "available": kernel.resource_headroom(&principal, &resource)?,
                        "tradeable": tradeable,
                    }),
                );
            }
            Ok(serde_json::Value::Object(out))
        }
        // Quota moves from the caller only; the resource must be marked
        // tradeable.
        "transfer" => {
            let to = req_str(args, "to")?.to_string();
            let resource = req_str(args, "resource")?.to_string();
            let amount = req_u64(args, "amount")?;
            kernel.transfer_resource(caller, &to, &resource, amount)?;
            Ok(serde_json::json!({
                "from": caller,
                "to": to,
                "resource": resource,
                "amount": amount,
            }))
        }
        "delegations" => {
            let payer = opt_str(args, "payer").unwrap_or(caller);
            kernel.charge_delegations(payer)
        }
        other => Err(unknown_method(GENESIS_RIGHTS_REGISTRY, other)),
    }
}
