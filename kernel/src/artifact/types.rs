//! Artifact record types.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::types::{ArtifactId, EventNumber, PrincipalId};

/// Metadata key carrying the writable-controller override under the
/// `transferable_freeware` contract. Escrow trades swap this key, never
/// `created_by`.
pub const META_AUTHORIZED_WRITER: &str = "authorized_writer";

/// Metadata key carrying the per-invoke price in scrip.
pub const META_INVOKE_PRICE: &str = "invoke_price";

/// System fields that must never appear in the metadata map; keeping them
/// out is what makes them untoggleable via metadata merge.
pub const FORBIDDEN_METADATA_KEYS: &[&str] = &["kernel_protected", "has_standing"];

/// The unit of persistent state. May hold content, code, or both.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    /// Unique stable identifier.
    pub id: ArtifactId,
    /// Kernel dispatch discriminator (`code`, `contract`, `memory`,
    /// `trigger`, `workflow`, `capability_request`, `agent`, ...).
    /// Immutable after creation.
    #[serde(rename = "type")]
    pub artifact_type: String,
    /// Principal id of the creator. Historical provenance, never mutated.
    pub created_by: PrincipalId,
    /// Event number at creation.
    pub created_at: EventNumber,
    /// Opaque payload, typed per `artifact_type`.
    #[serde(default)]
    pub content: String,
    /// Optional executable payload for invoke.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Contract governing reads/writes/invokes/edits/deletes. `None` means
    /// freeware.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_contract_id: Option<ArtifactId>,
    /// Whether this artifact holds resources. Set only by
    /// `create_principal`.
    #[serde(default)]
    pub has_standing: bool,
    /// When true, only kernel primitives may mutate content/code/metadata.
    /// One-way: set at creation, never toggled.
    #[serde(default)]
    pub kernel_protected: bool,
    /// Artifact ids referenced by `code`, from static best-effort
    /// extraction. Updated on write.
    #[serde(default)]
    pub depends_on: Vec<ArtifactId>,
    /// Free-form key-value map. System fields are excluded by construction.
    #[serde(default)]
    pub metadata: IndexMap<String, serde_json::Value>,
    /// Event number of the last mutation.
    pub event_number: EventNumber,
}

impl Artifact {
    /// The principal currently allowed to write under
    /// `transferable_freeware`: `metadata.authorized_writer` with fallback
    /// to `created_by`.
    pub fn authorized_writer(&self) -> &str {
        self.metadata
            .get(META_AUTHORIZED_WRITER)
            .and_then(|v| v.as_str())
            .unwrap_or(&self.created_by)
    }

    /// Per-invoke price in scrip, zero when unset. A present non-integer
    /// value is a validation fault surfaced by the executor, never silently
    /// zeroed.
    pub fn invoke_price(&self) -> Result<u64, String> {
        match self.metadata.get(META_INVOKE_PRICE) {
            None => Ok(0),
            Some(v) => v
                .as_u64()
                .ok_or_else(|| format!("invoke_price must be a non-negative integer, got {}", v)),
        }
    }

    /// Bytes charged against the creator's disk quota for this artifact.
    pub fn disk_footprint(&self) -> u64 {
        (self.content.len() + self.code.as_deref().map_or(0, str::len)) as u64
    }
}

/// Parameters for creating an artifact. The store fills in `created_at`,
/// `event_number`, and `depends_on`.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub id: ArtifactId,
    pub artifact_type: String,
    pub created_by: PrincipalId,
    pub content: String,
    pub code: Option<String>,
    pub access_contract_id: Option<ArtifactId>,
    pub kernel_protected: bool,
    pub metadata: IndexMap<String, serde_json::Value>,
}

/// Partial update applied by `write`. `None` fields are left untouched;
/// metadata entries are merged key-by-key.
#[derive(Debug, Clone, Default)]
pub struct WritePatch {
    pub content: Option<String>,
    pub code: Option<String>,
    pub metadata: Option<IndexMap<String, serde_json::Value>>,
    pub access_contract_id: Option<ArtifactId>,
}

impl WritePatch {
    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.code.is_none()
            && self.metadata.is_none()
            && self.access_contract_id.is_none()
    }
}
