//! The narrow waist: the eleven action kinds and the action result.
//!
//! Intents arrive from agents as JSON tagged by `action_type`; the executor
//! consumes them by value and always returns an [`ActionResult`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, KernelError};
use crate::types::{ArtifactId, PrincipalId, ResourceId};

/// A proposed action. Ownership of the intent is the caller's; the executor
/// consumes it by value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionIntent {
    Noop {
        principal_id: PrincipalId,
    },
    Read {
        principal_id: PrincipalId,
        artifact_id: ArtifactId,
    },
    /// Upsert: writing a missing id creates the artifact (with `type`
    /// required); writing an existing id patches it. A `type` on an
    /// existing artifact must match or the write is an `ImmutableField`
    /// error; same for `created_by`.
    Write {
        principal_id: PrincipalId,
        artifact_id: ArtifactId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<IndexMap<String, serde_json::Value>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_contract_id: Option<ArtifactId>,
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        artifact_type: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        created_by: Option<PrincipalId>,
    },
    Edit {
        principal_id: PrincipalId,
        artifact_id: ArtifactId,
        old_string: String,
        new_string: String,
    },
    Invoke {
        principal_id: PrincipalId,
        artifact_id: ArtifactId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        method: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        args: Option<serde_json::Value>,
    },
    Delete {
        principal_id: PrincipalId,
        artifact_id: ArtifactId,
    },
    QueryKernel {
        principal_id: PrincipalId,
        query: String,
        #[serde(default)]
        params: serde_json::Map<String, serde_json::Value>,
    },
    Subscribe {
        principal_id: PrincipalId,
        artifact_id: ArtifactId,
    },
    Unsubscribe {
        principal_id: PrincipalId,
        artifact_id: ArtifactId,
    },
    ConfigureContext {
        principal_id: PrincipalId,
        context: serde_json::Map<String, serde_json::Value>,
    },
    ModifySystemPrompt {
        principal_id: PrincipalId,
        system_prompt: String,
    },
}

impl ActionIntent {
    pub fn principal_id(&self) -> &str {
        match self {
            ActionIntent::Noop { principal_id }
            | ActionIntent::Read { principal_id, .. }
            | ActionIntent::Write { principal_id, .. }
            | ActionIntent::Edit { principal_id, .. }
            | ActionIntent::Invoke { principal_id, .. }
            | ActionIntent::Delete { principal_id, .. }
            | ActionIntent::QueryKernel { principal_id, .. }
            | ActionIntent::Subscribe { principal_id, .. }
            | ActionIntent::Unsubscribe { principal_id, .. }
            | ActionIntent::ConfigureContext { principal_id, .. }
            | ActionIntent::ModifySystemPrompt { principal_id, .. } => principal_id,
        }
    }

    /// The wire name of this action kind.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ActionIntent::Noop { .. } => "noop",
            ActionIntent::Read { .. } => "read",
            ActionIntent::Write { .. } => "write",
            ActionIntent::Edit { .. } => "edit",
            ActionIntent::Invoke { .. } => "invoke",
            ActionIntent::Delete { .. } => "delete",
            ActionIntent::QueryKernel { .. } => "query_kernel",
            ActionIntent::Subscribe { .. } => "subscribe",
            ActionIntent::Unsubscribe { .. } => "unsubscribe",
            ActionIntent::ConfigureContext { .. } => "configure_context",
            ActionIntent::ModifySystemPrompt { .. } => "modify_system_prompt",
        }
    }

    /// Target artifact, where the action has one.
    pub fn target(&self) -> Option<&str> {
        match self {
            ActionIntent::Read { artifact_id, .. }
            | ActionIntent::Write { artifact_id, .. }
            | ActionIntent::Edit { artifact_id, .. }
            | ActionIntent::Invoke { artifact_id, .. }
            | ActionIntent::Delete { artifact_id, .. }
            | ActionIntent::Subscribe { artifact_id, .. }
            | ActionIntent::Unsubscribe { artifact_id, .. } => Some(artifact_id),
            _ => None,
        }
    }
}

/// What every action returns. `ok=false` carries a stable error code and a
/// human-readable message; `resources_consumed` names everything actually
/// charged (empty on denial).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ActionResult {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    pub message: String,
    #[serde(default)]
    pub resources_consumed: IndexMap<ResourceId, u64>,
}

impl ActionResult {
    pub fn success(
        data: Option<serde_json::Value>,
        message: impl Into<String>,
        resources_consumed: IndexMap<ResourceId, u64>,
    ) -> Self {
        Self {
            ok: true,
            data,
            error_code: None,
            message: message.into(),
            resources_consumed,
        }
    }

    pub fn failure(error: &KernelError) -> Self {
        Self {
            ok: false,
            data: None,
            error_code: Some(error.code()),
            message: error.to_string(),
            resources_consumed: IndexMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_format_round_trips() {
        let raw = r#"{
            "action_type": "invoke",
            "principal_id": "alice",
            "artifact_id": "genesis_ledger",
            "method": "transfer",
            "args": {"to": "bob", "amount": 30}
        }"#;
        let intent: ActionIntent = serde_json::from_str(raw).unwrap();
        assert_eq!(intent.kind_name(), "invoke");
        assert_eq!(intent.principal_id(), "alice");
        assert_eq!(intent.target(), Some("genesis_ledger"));

        let json = serde_json::to_value(&intent).unwrap();
        assert_eq!(json["action_type"], serde_json::json!("invoke"));
    }

    #[test]
    fn write_accepts_a_type_field_for_immutability_checks() {
        let raw = r#"{
            "action_type": "write",
            "principal_id": "alice",
            "artifact_id": "x",
            "type": "right",
            "content": "new"
        }"#;
        let intent: ActionIntent = serde_json::from_str(raw).unwrap();
        let ActionIntent::Write { artifact_type, .. } = &intent else {
            panic!("expected write");
        };
        assert_eq!(artifact_type.as_deref(), Some("right"));
    }

    #[test]
    fn unknown_action_types_fail_to_parse() {
        let raw = r#"{"action_type": "format_disk", "principal_id": "mallory"}"#;
        assert!(serde_json::from_str::<ActionIntent>(raw).is_err());
    }

    #[test]
    fn results_serialize_with_stable_codes() {
        let result = ActionResult::failure(&KernelError::NotFound("artifact x".into()));
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["ok"], serde_json::json!(false));
        assert_eq!(json["error_code"], serde_json::json!("NotFound"));
    }
}
