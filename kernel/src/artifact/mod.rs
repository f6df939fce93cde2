//! Artifact store: sole owner of artifact records and their indices.
//!
//! The store enforces the system-field invariants (`id` uniqueness,
//! reserved-id namespaces, `type`/`created_by` immutability, one-way
//! `kernel_protected`); contract-based permission checks live a layer up in
//! the executor. Indices are maintained on every mutation so queries over
//! populated indices never scan.

mod types;

pub use types::{
    Artifact, CreateSpec, WritePatch, FORBIDDEN_METADATA_KEYS, META_AUTHORIZED_WRITER,
    META_INVOKE_PRICE,
};

use std::collections::BTreeSet;

use indexmap::IndexMap;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{KernelError, KernelResult};
use crate::types::{
    ArtifactId, EventNumber, PrincipalId, CHARGE_DELEGATION_PREFIX, KERNEL_PRINCIPAL, RIGHT_PREFIX,
};

/// Metadata keys indexed by default, in addition to `type` and `created_by`.
pub const DEFAULT_METADATA_INDEX_KEYS: &[&str] = &[META_AUTHORIZED_WRITER];

/// Static, best-effort extraction of invoke targets from code. Captures
/// `(kernel/invoke "id" ...)` forms and `invoke("id", ...)` call syntax;
/// dynamically computed targets are not captured.
static INVOKE_TARGET_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?:kernel/invoke\s+|invoke\s*\(\s*)"([^"]+)""#).expect("static regex")
});

pub fn extract_dependencies(code: &str) -> Vec<ArtifactId> {
    let mut seen = BTreeSet::new();
    for cap in INVOKE_TARGET_RE.captures_iter(code) {
        seen.insert(cap[1].to_string());
    }
    seen.into_iter().collect()
}

/// For a reserved id, the only principal allowed to create it.
/// `charge_delegation:<P>` belongs to `<P>`; the `right:` namespace is
/// kernel-reserved.
pub fn reserved_owner(id: &str) -> Option<PrincipalId> {
    if let Some(payer) = id.strip_prefix(CHARGE_DELEGATION_PREFIX) {
        return Some(payer.to_string());
    }
    if id.starts_with(RIGHT_PREFIX) {
        return Some(KERNEL_PRINCIPAL.to_string());
    }
    None
}

type IdSet = BTreeSet<ArtifactId>;

/// Owns every artifact record. `by_id` is authoritative; the remaining maps
/// are derived indices rebuilt on restore.
#[derive(Debug)]
pub struct ArtifactStore {
    by_id: IndexMap<ArtifactId, Artifact>,
    by_type: IndexMap<String, IdSet>,
    by_creator: IndexMap<PrincipalId, IdSet>,
    /// metadata key -> rendered value -> ids. Only configured keys are
    /// indexed.
    by_metadata: IndexMap<String, IndexMap<String, IdSet>>,
}

impl ArtifactStore {
    pub fn new() -> Self {
        Self::with_metadata_indices(
            DEFAULT_METADATA_INDEX_KEYS
                .iter()
                .map(|k| k.to_string())
                .collect(),
        )
    }

    pub fn with_metadata_indices(keys: Vec<String>) -> Self {
        let mut by_metadata = IndexMap::new();
        for key in keys {
            by_metadata.insert(key, IndexMap::new());
        }
        Self {
            by_id: IndexMap::new(),
            by_type: IndexMap::new(),
            by_creator: IndexMap::new(),
            by_metadata,
        }
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Artifact> {
        self.by_id.get(id)
    }

    pub fn get_required(&self, id: &str) -> KernelResult<&Artifact> {
        self.by_id
            .get(id)
            .ok_or_else(|| KernelError::NotFound(format!("artifact {}", id)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.by_id.values()
    }

    /// Ids of a given type, via index.
    pub fn list_by_type(&self, artifact_type: &str) -> Vec<&Artifact> {
        self.ids_to_artifacts(self.by_type.get(artifact_type))
    }

    /// Ids created by a principal, via index.
    pub fn list_by_creator(&self, creator: &str) -> Vec<&Artifact> {
        self.ids_to_artifacts(self.by_creator.get(creator))
    }

    /// Ids whose indexed metadata key renders to `value`. Falls back to an
    /// error for unindexed keys rather than scanning.
    pub fn list_by_metadata(&self, key: &str, value: &str) -> KernelResult<Vec<&Artifact>> {
        let index = self
            .by_metadata
            .get(key)
            .ok_or_else(|| KernelError::NotFound(format!("no index on metadata key {}", key)))?;
        Ok(self.ids_to_artifacts(index.get(value)))
    }

    fn ids_to_artifacts(&self, ids: Option<&IdSet>) -> Vec<&Artifact> {
        ids.map(|set| set.iter().filter_map(|id| self.by_id.get(id)).collect())
            .unwrap_or_default()
    }

    /// Create and index an artifact. `as_kernel` marks kernel-originated
    /// creation, the only path allowed into reserved namespaces other than
    /// the matching principal and the only path that may set
    /// `kernel_protected`.
    pub fn create(
        &mut self,
        spec: CreateSpec,
        event_number: EventNumber,
        as_kernel: bool,
    ) -> KernelResult<&Artifact> {
        if spec.id.is_empty() {
            return Err(KernelError::Validation("artifact id must be non-empty".into()));
        }
        if spec.artifact_type.is_empty() {
            return Err(KernelError::Validation(
                "artifact type must be non-empty".into(),
            ));
        }
        if self.by_id.contains_key(&spec.id) {
            return Err(KernelError::DuplicateId(spec.id));
        }
        if let Some(owner) = reserved_owner(&spec.id) {
            if !as_kernel && spec.created_by != owner {
                return Err(KernelError::ReservedId {
                    id: spec.id,
                    owner,
                });
            }
        }
        if spec.kernel_protected && !as_kernel {
            return Err(KernelError::Permission {
                principal: spec.created_by,
                artifact: spec.id,
                reason: "kernel_protected is a kernel-only field".into(),
            });
        }
        Self::check_metadata_keys(&spec.metadata)?;

        let depends_on = spec
            .code
            .as_deref()
            .map(extract_dependencies)
            .unwrap_or_default();
        let artifact = Artifact {
            id: spec.id.clone(),
            artifact_type: spec.artifact_type,
            created_by: spec.created_by,
            created_at: event_number,
            content: spec.content,
            code: spec.code,
            access_contract_id: spec.access_contract_id,
            has_standing: false,
            kernel_protected: spec.kernel_protected,
            depends_on,
            metadata: spec.metadata,
            event_number,
        };
        self.index_artifact(&artifact);
        let id = artifact.id.clone();
        self.by_id.insert(id.clone(), artifact);
        Ok(&self.by_id[&id])
    }

    /// Apply a partial update. Enforces `kernel_protected` and the
    /// `access_contract_id` ownership rule; content/code changes recompute
    /// `depends_on`.
    pub fn write(
        &mut self,
        id: &str,
        patch: WritePatch,
        caller: &str,
        as_kernel: bool,
        event_number: EventNumber,
    ) -> KernelResult<Artifact> {
        let artifact = self
            .by_id
            .get(id)
            .ok_or_else(|| KernelError::NotFound(format!("artifact {}", id)))?;
        if artifact.kernel_protected && !as_kernel {
            return Err(KernelError::Permission {
                principal: caller.to_string(),
                artifact: id.to_string(),
                reason: "kernel_protected".into(),
            });
        }
        if patch.access_contract_id.is_some() && !as_kernel && caller != artifact.created_by {
            return Err(KernelError::Permission {
                principal: caller.to_string(),
                artifact: id.to_string(),
                reason: "only the creator may change access_contract_id".into(),
            });
        }
        if let Some(metadata) = &patch.metadata {
            Self::check_metadata_keys(metadata)?;
        }

        self.unindex_artifact(id);
        let artifact = self.by_id.get_mut(id).expect("presence checked above");
        if let Some(content) = patch.content {
            artifact.content = content;
        }
        if let Some(code) = patch.code {
            artifact.depends_on = extract_dependencies(&code);
            artifact.code = Some(code);
        }
        if let Some(metadata) = patch.metadata {
            for (key, value) in metadata {
                if value.is_null() {
                    artifact.metadata.shift_remove(&key);
                } else {
                    artifact.metadata.insert(key, value);
                }
            }
        }
        if let Some(contract) = patch.access_contract_id {
            artifact.access_contract_id = Some(contract);
        }
        artifact.event_number = event_number;
        let snapshot = artifact.clone();
        self.index_artifact(&snapshot);
        Ok(snapshot)
    }

    /// Single-occurrence string replacement in `content`; delegates to
    /// [`ArtifactStore::write`] so every write invariant applies.
    pub fn edit(
        &mut self,
        id: &str,
        old_string: &str,
        new_string: &str,
        caller: &str,
        as_kernel: bool,
        event_number: EventNumber,
    ) -> KernelResult<Artifact> {
        let artifact = self.get_required(id)?;
        let occurrences = artifact.content.matches(old_string).count();
        match occurrences {
            0 => return Err(KernelError::OldStringNotFound(id.to_string())),
            1 => {}
            _ => return Err(KernelError::OldStringNotUnique(id.to_string())),
        }
        let new_content = artifact.content.replacen(old_string, new_string, 1);
        self.write(
            id,
            WritePatch {
                content: Some(new_content),
                ..WritePatch::default()
            },
            caller,
            as_kernel,
            event_number,
        )
    }

    /// Remove an artifact and its index entries, returning the record.
    /// Dependents are not cascaded; dangling references fail at next
    /// resolution.
    pub fn delete(&mut self, id: &str, as_kernel: bool) -> KernelResult<Artifact> {
        let artifact = self.get_required(id)?;
        if artifact.kernel_protected && !as_kernel {
            return Err(KernelError::Permission {
                principal: String::new(),
                artifact: id.to_string(),
                reason: "kernel_protected".into(),
            });
        }
        self.unindex_artifact(id);
        Ok(self
            .by_id
            .shift_remove(id)
            .expect("presence checked above"))
    }

    /// Mark an artifact as a resource-holding principal. Crate-visible:
    /// reachable only through `create_principal`, which also creates the
    /// ledger and resource-manager rows.
    pub(crate) fn set_standing(&mut self, id: &str, event_number: EventNumber) -> KernelResult<()> {
        let artifact = self
            .by_id
            .get_mut(id)
            .ok_or_else(|| KernelError::NotFound(format!("artifact {}", id)))?;
        artifact.has_standing = true;
        artifact.event_number = event_number;
        Ok(())
    }

    /// Insert a fully formed record, used by checkpoint restore and event
    /// replay. Indexes but does not re-validate: the record already passed
    /// validation when first created.
    pub(crate) fn insert_restored(&mut self, artifact: Artifact) {
        self.unindex_artifact(&artifact.id);
        self.index_artifact(&artifact);
        self.by_id.insert(artifact.id.clone(), artifact);
    }

    pub(crate) fn remove_restored(&mut self, id: &str) {
        self.unindex_artifact(id);
        self.by_id.shift_remove(id);
    }

    /// Drop and rebuild every derived index from `by_id`.
    pub fn rebuild_indices(&mut self) {
        self.by_type.clear();
        self.by_creator.clear();
        for index in self.by_metadata.values_mut() {
            index.clear();
        }
        let snapshots: Vec<Artifact> = self.by_id.values().cloned().collect();
        for artifact in &snapshots {
            self.index_artifact(artifact);
        }
    }

    fn check_metadata_keys(
        metadata: &IndexMap<String, serde_json::Value>,
    ) -> KernelResult<()> {
        for key in FORBIDDEN_METADATA_KEYS {
            if metadata.contains_key(*key) {
                return Err(KernelError::Validation(format!(
                    "{} is a system field, not metadata",
                    key
                )));
            }
        }
        Ok(())
    }

    fn index_artifact(&mut self, artifact: &Artifact) {
        self.by_type
            .entry(artifact.artifact_type.clone())
            .or_default()
            .insert(artifact.id.clone());
        self.by_creator
            .entry(artifact.created_by.clone())
            .or_default()
            .insert(artifact.id.clone());
        for (key, index) in self.by_metadata.iter_mut() {
            if let Some(value) = artifact.metadata.get(key) {
                index
                    .entry(render_index_value(value))
                    .or_default()
                    .insert(artifact.id.clone());
            }
        }
    }

    fn unindex_artifact(&mut self, id: &str) {
        let Some(artifact) = self.by_id.get(id) else {
            return;
        };
        let artifact_type = artifact.artifact_type.clone();
        let created_by = artifact.created_by.clone();
        let meta: Vec<(String, String)> = self
            .by_metadata
            .keys()
            .filter_map(|key| {
                artifact
                    .metadata
                    .get(key)
                    .map(|v| (key.clone(), render_index_value(v)))
            })
            .collect();

        if let Some(set) = self.by_type.get_mut(&artifact_type) {
            set.remove(id);
        }
        if let Some(set) = self.by_creator.get_mut(&created_by) {
            set.remove(id);
        }
        for (key, value) in meta {
            if let Some(index) = self.by_metadata.get_mut(&key) {
                if let Some(set) = index.get_mut(&value) {
                    set.remove(id);
                }
            }
        }
    }
}

impl Default for ArtifactStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical string form used as the key of a metadata index. Strings index
/// by their value, everything else by its JSON rendering.
fn render_index_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn spec(id: &str, creator: &str) -> CreateSpec {
        CreateSpec {
            id: id.into(),
            artifact_type: "code".into(),
            created_by: creator.into(),
            ..CreateSpec::default()
        }
    }

    #[test]
    fn create_rejects_duplicate_ids() {
        let mut store = ArtifactStore::new();
        store.create(spec("x", "alice"), 1, false).unwrap();
        let err = store.create(spec("x", "bob"), 2, false).unwrap_err();
        assert_eq!(err, KernelError::DuplicateId("x".into()));
    }

    #[test]
    fn reserved_prefix_requires_matching_principal() {
        let mut store = ArtifactStore::new();
        let err = store
            .create(spec("charge_delegation:alice", "bob"), 1, false)
            .unwrap_err();
        assert!(matches!(err, KernelError::ReservedId { .. }));

        store
            .create(spec("charge_delegation:alice", "alice"), 1, false)
            .unwrap();
    }

    #[test]
    fn right_namespace_is_kernel_reserved() {
        let mut store = ArtifactStore::new();
        let err = store
            .create(spec("right:disk_bytes:alice", "alice"), 1, false)
            .unwrap_err();
        assert!(matches!(err, KernelError::ReservedId { .. }));
        store
            .create(spec("right:disk_bytes:alice", "kernel"), 1, true)
            .unwrap();
    }

    #[test]
    fn kernel_protected_blocks_non_kernel_writes() {
        let mut store = ArtifactStore::new();
        let mut s = spec("r", "kernel");
        s.kernel_protected = true;
        store.create(s, 1, true).unwrap();

        let err = store
            .write(
                "r",
                WritePatch {
                    content: Some("tampered".into()),
                    ..WritePatch::default()
                },
                "kernel",
                false,
                2,
            )
            .unwrap_err();
        assert!(matches!(err, KernelError::Permission { .. }));

        // The kernel primitive path still mutates.
        store
            .write(
                "r",
                WritePatch {
                    content: Some("legit".into()),
                    ..WritePatch::default()
                },
                "kernel",
                true,
                3,
            )
            .unwrap();
        assert_eq!(store.get("r").unwrap().content, "legit");
    }

    #[test]
    fn access_contract_change_is_creator_only() {
        let mut store = ArtifactStore::new();
        store.create(spec("x", "alice"), 1, false).unwrap();
        let err = store
            .write(
                "x",
                WritePatch {
                    access_contract_id: Some("genesis_contract_private".into()),
                    ..WritePatch::default()
                },
                "bob",
                false,
                2,
            )
            .unwrap_err();
        assert!(matches!(err, KernelError::Permission { .. }));
    }

    #[test]
    fn metadata_cannot_carry_system_fields() {
        let mut store = ArtifactStore::new();
        let mut s = spec("x", "alice");
        s.metadata
            .insert("kernel_protected".into(), serde_json::json!(true));
        let err = store.create(s, 1, false).unwrap_err();
        assert!(matches!(err, KernelError::Validation(_)));
    }

    #[test]
    fn edit_requires_unique_occurrence() {
        let mut store = ArtifactStore::new();
        let mut s = spec("x", "alice");
        s.content = "aa-aa".into();
        store.create(s, 1, false).unwrap();

        let err = store.edit("x", "aa", "bb", "alice", false, 2).unwrap_err();
        assert_eq!(err, KernelError::OldStringNotUnique("x".into()));
        assert_eq!(store.get("x").unwrap().content, "aa-aa");

        let err = store.edit("x", "zz", "bb", "alice", false, 2).unwrap_err();
        assert_eq!(err, KernelError::OldStringNotFound("x".into()));

        store.edit("x", "aa-", "bb-", "alice", false, 2).unwrap();
        assert_eq!(store.get("x").unwrap().content, "bb-aa");
    }

    #[test]
    fn indices_track_mutations() {
        let mut store = ArtifactStore::new();
        store.create(spec("x", "alice"), 1, false).unwrap();
        store.create(spec("y", "alice"), 2, false).unwrap();
        assert_eq!(store.list_by_creator("alice").len(), 2);
        assert_eq!(store.list_by_type("code").len(), 2);

        let mut metadata = IndexMap::new();
        metadata.insert(
            META_AUTHORIZED_WRITER.to_string(),
            serde_json::json!("bob"),
        );
        store
            .write(
                "x",
                WritePatch {
                    metadata: Some(metadata),
                    ..WritePatch::default()
                },
                "alice",
                false,
                3,
            )
            .unwrap();
        let hits = store.list_by_metadata(META_AUTHORIZED_WRITER, "bob").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "x");

        store.delete("x", false).unwrap();
        assert!(store
            .list_by_metadata(META_AUTHORIZED_WRITER, "bob")
            .unwrap()
            .is_empty());
        assert_eq!(store.list_by_creator("alice").len(), 1);
    }

    #[test]
    fn dependency_extraction_is_static_best_effort() {
        let deps = extract_dependencies(
            r#"(do (kernel/invoke "genesis_ledger" "balance") (kernel/invoke "helper" []))"#,
        );
        assert_eq!(deps, vec!["genesis_ledger".to_string(), "helper".to_string()]);

        let deps = extract_dependencies(r#"invoke("tool_a", {"x": 1})"#);
        assert_eq!(deps, vec!["tool_a".to_string()]);

        // Dynamic targets are documented as uncaptured.
        let deps = extract_dependencies(r#"(kernel/invoke target-id)"#);
        assert!(deps.is_empty());
    }
}
