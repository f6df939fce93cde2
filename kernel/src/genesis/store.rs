//! `genesis_store`: artifact index queries over the C1 indices.

use super::{opt_str, req_str, unknown_method, GENESIS_STORE};
use crate::error::KernelResult;
use crate::kernel::{Kernel, KernelState};

pub(super) fn dispatch(
    kernel: &mut Kernel,
    caller: &str,
    method: &str,
    args: &serde_json::Value,
) -> KernelResult<serde_json::Value> {
    match method {
        // Index-backed listing; filters narrow by type or creator.
        "list" => {
            let hits = match (opt_str(args, "type"), opt_str(args, "created_by")) {
                (Some(t), _) => kernel.artifacts_by_type(t),
                (None, Some(creator)) => kernel.artifacts_by_creator(creator),
                (None, None) => kernel.store().iter().collect(),
            };
            Ok(serde_json::json!(hits
                .iter()
                .map(|a| summary(a))
                .collect::<Vec<_>>()))
        }
        "by_type" => {
            let t = req_str(args, "type")?;
            Ok(serde_json::json!(kernel
                .artifacts_by_type(t)
                .iter()
                .map(|a| summary(a))
                .collect::<Vec<_>>()))
        }
        // Contract-gated read; costs apply exactly as a read action.
        "get" => {
            let id = req_str(args, "id")?.to_string();
            kernel.read_as(caller, &id)
        }
        other => Err(unknown_method(GENESIS_STORE, other)),
    }
}

fn summary(artifact: &crate::artifact::Artifact) -> serde_json::Value {
    serde_json::json!({
        "id": artifact.id,
        "type": artifact.artifact_type,
        "created_by": artifact.created_by,
        "has_standing": artifact.has_standing,
        "event_number": artifact.event_number,
    })
}
