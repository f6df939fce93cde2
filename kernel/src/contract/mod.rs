//! Permission engine: dispatch `(caller, action, target)` to a decision.
//!
//! Contracts come in two flavors. Genesis contracts are a small closed set
//! implemented here and selected by id. Executable contracts are artifacts
//! whose code runs in the constrained interpreter under a bounded budget;
//! any fault, timeout, or non-coercible return is a denial. Kernel overrides
//! (`kernel_protected`, reserved ids, field immutability) sit above both and
//! are enforced by the store and executor, not here.

use crate::artifact::Artifact;
use crate::lang::{self, EvalBudget, LangHost, Value};

pub const GENESIS_CONTRACT_FREEWARE: &str = "genesis_contract_freeware";
pub const GENESIS_CONTRACT_SELF_OWNED: &str = "genesis_contract_self_owned";
pub const GENESIS_CONTRACT_PRIVATE: &str = "genesis_contract_private";
pub const GENESIS_CONTRACT_CREATOR_ONLY: &str = "genesis_contract_creator_only";
pub const GENESIS_CONTRACT_TRANSFERABLE_FREEWARE: &str = "genesis_contract_transferable_freeware";

pub const GENESIS_CONTRACT_IDS: &[&str] = &[
    GENESIS_CONTRACT_FREEWARE,
    GENESIS_CONTRACT_SELF_OWNED,
    GENESIS_CONTRACT_PRIVATE,
    GENESIS_CONTRACT_CREATOR_ONLY,
    GENESIS_CONTRACT_TRANSFERABLE_FREEWARE,
];

/// The permission-relevant view of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Invoke,
    Write,
    Edit,
    Delete,
}

impl AccessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessKind::Read => "read",
            AccessKind::Invoke => "invoke",
            AccessKind::Write => "write",
            AccessKind::Edit => "edit",
            AccessKind::Delete => "delete",
        }
    }

    /// Write-class actions share contract semantics.
    fn is_mutation(&self) -> bool {
        matches!(self, AccessKind::Write | AccessKind::Edit | AccessKind::Delete)
    }
}

/// Outcome of a contract check. `cost` is scrip charged to the caller on
/// success, zero by default.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub cost: u64,
}

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
            cost: 0,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            cost: 0,
        }
    }
}

/// Typed genesis contract semantics. Returns `None` when `contract_id` is
/// not a genesis contract (the caller then evaluates it as executable).
pub fn genesis_decision(
    contract_id: &str,
    caller: &str,
    access: AccessKind,
    target: &Artifact,
) -> Option<Decision> {
    let creator_only_mutation = |label: &str| {
        if caller == target.created_by {
            Decision::allow()
        } else {
            Decision::deny(format!("{}: {} requires creator", label, access.as_str()))
        }
    };
    let decision = match contract_id {
        GENESIS_CONTRACT_FREEWARE => {
            if access.is_mutation() {
                creator_only_mutation("freeware")
            } else {
                Decision::allow()
            }
        }
        // Same table as freeware; kept distinct so agents can signal intent.
        GENESIS_CONTRACT_CREATOR_ONLY => {
            if access.is_mutation() {
                creator_only_mutation("creator_only")
            } else {
                Decision::allow()
            }
        }
        GENESIS_CONTRACT_SELF_OWNED => {
            if caller == target.created_by {
                Decision::allow()
            } else {
                Decision::deny(format!("self_owned: {} requires creator", access.as_str()))
            }
        }
        GENESIS_CONTRACT_PRIVATE => match access {
            AccessKind::Invoke => Decision::deny("private: invoke denied"),
            _ => {
                if caller == target.created_by {
                    Decision::allow()
                } else {
                    Decision::deny(format!("private: {} requires creator", access.as_str()))
                }
            }
        },
        GENESIS_CONTRACT_TRANSFERABLE_FREEWARE => {
            if access.is_mutation() {
                if caller == target.authorized_writer() {
                    Decision::allow()
                } else {
                    Decision::deny(format!(
                        "transferable_freeware: {} requires authorized writer",
                        access.as_str()
                    ))
                }
            } else {
                Decision::allow()
            }
        }
        _ => return None,
    };
    Some(decision)
}

/// Context map handed to executable contracts, per the check signature.
pub fn build_context(caller: &str, access: AccessKind, target: &Artifact) -> Value {
    let metadata = lang::json_to_value(&serde_json::Value::Object(
        target
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
    ));
    Value::Map(
        [
            ("target_id".to_string(), Value::Str(target.id.clone())),
            (
                "target_type".to_string(),
                Value::Str(target.artifact_type.clone()),
            ),
            (
                "target_created_by".to_string(),
                Value::Str(target.created_by.clone()),
            ),
            ("target_metadata".to_string(), metadata),
            (
                "action".to_string(),
                Value::Keyword(access.as_str().to_string()),
            ),
            (
                "caller_principal".to_string(),
                Value::Str(caller.to_string()),
            ),
        ]
        .into_iter()
        .collect(),
    )
}

/// Coerce an evaluated value to a [`Decision`]. A bare bool is a costless
/// decision; a map must carry `:allowed` and may carry `:reason` and a
/// non-negative integer `:cost`. A present but mistyped `:cost` is a fault,
/// never silently zeroed.
pub fn coerce_decision(value: &Value) -> Result<Decision, String> {
    match value {
        Value::Bool(allowed) => Ok(Decision {
            allowed: *allowed,
            reason: None,
            cost: 0,
        }),
        Value::Map(map) => {
            let allowed = match map.get("allowed") {
                Some(Value::Bool(b)) => *b,
                Some(other) => {
                    return Err(format!(
                        ":allowed must be a bool, got {}",
                        other.type_name()
                    ))
                }
                None => return Err(":allowed is required".to_string()),
            };
            let reason = match map.get("reason") {
                None | Some(Value::Nil) => None,
                Some(Value::Str(s)) => Some(s.clone()),
                Some(other) => {
                    return Err(format!(
                        ":reason must be a string, got {}",
                        other.type_name()
                    ))
                }
            };
            let cost = match map.get("cost") {
                None | Some(Value::Nil) => 0,
                Some(Value::Int(i)) if *i >= 0 => *i as u64,
                Some(other) => {
                    return Err(format!(
                        ":cost must be a non-negative integer, got {}",
                        other
                    ))
                }
            };
            Ok(Decision {
                allowed,
                reason,
                cost,
            })
        }
        other => Err(format!(
            "contract returned {}, expected bool or decision map",
            other.type_name()
        )),
    }
}

/// Evaluate an executable contract's code. The `check` entry receives
/// `(caller action target-id ctx)`; failures come back as `Err(reason)` for
/// the executor to log as `contract_fault` and map to a denial.
pub fn evaluate_executable(
    code: &str,
    caller: &str,
    access: AccessKind,
    target: &Artifact,
    host: &mut dyn LangHost,
    budget: EvalBudget,
) -> Result<Decision, String> {
    let ctx = build_context(caller, access, target);
    let bindings = [
        ("caller", Value::Str(caller.to_string())),
        ("action", Value::Keyword(access.as_str().to_string())),
        ("target", Value::Str(target.id.clone())),
        ("ctx", ctx.clone()),
    ];
    let call_args = vec![
        Value::Str(caller.to_string()),
        Value::Keyword(access.as_str().to_string()),
        Value::Str(target.id.clone()),
        ctx,
    ];
    let outcome = lang::eval_entry(code, &bindings, Some(call_args), host, budget)
        .map_err(|e| e.to_string())?;
    coerce_decision(&outcome.value)
}
