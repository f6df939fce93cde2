//! Kernel error taxonomy and the stable wire-level error codes.
//!
//! Inside an apply every failure becomes a structured `ActionResult` with
//! `ok=false`; nothing escapes the executor as a panic. `KernelError` is the
//! internal taxonomy, [`ErrorCode`] the closed set agents see on the wire.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ArtifactId, PrincipalId, ResourceId};

/// Stable error codes surfaced in `ActionResult.error_code`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    PermissionDenied,
    ResourceExhausted,
    NotFound,
    TypeMismatch,
    ImmutableField,
    ContractFault,
    OldStringNotFound,
    OldStringNotUnique,
    ReservedIdViolation,
    SystemError,
}

/// Internal error taxonomy. Kinds, not transport: the executor maps each
/// variant onto an [`ErrorCode`] and a human-readable message.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum KernelError {
    #[error("permission denied for {principal} on {artifact}: {reason}")]
    Permission {
        principal: PrincipalId,
        artifact: ArtifactId,
        reason: String,
    },

    #[error("resource {resource} exhausted for {principal}: need {needed}, have {available}")]
    ResourceExhausted {
        principal: PrincipalId,
        resource: ResourceId,
        needed: u64,
        available: u64,
    },

    #[error("insufficient funds for {principal}: need {needed}, have {available}")]
    InsufficientFunds {
        principal: PrincipalId,
        needed: u64,
        available: u64,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("immutable field {field} on artifact {artifact}")]
    ImmutableField {
        artifact: ArtifactId,
        field: &'static str,
    },

    #[error("contract fault on {contract}: {reason}")]
    ContractFault {
        contract: ArtifactId,
        reason: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate artifact id {0}")]
    DuplicateId(ArtifactId),

    #[error("reserved id violation: {id} may only be created by {owner}")]
    ReservedId { id: ArtifactId, owner: PrincipalId },

    #[error("old_string not found in {0}")]
    OldStringNotFound(ArtifactId),

    #[error("old_string occurs more than once in {0}")]
    OldStringNotUnique(ArtifactId),

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("system error: {0}")]
    System(String),
}

impl KernelError {
    /// The stable wire code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            KernelError::Permission { .. } => ErrorCode::PermissionDenied,
            KernelError::ResourceExhausted { .. } | KernelError::InsufficientFunds { .. } => {
                ErrorCode::ResourceExhausted
            }
            KernelError::Validation(_) => ErrorCode::TypeMismatch,
            KernelError::ImmutableField { .. } => ErrorCode::ImmutableField,
            KernelError::ContractFault { .. } => ErrorCode::ContractFault,
            KernelError::NotFound(_) => ErrorCode::NotFound,
            KernelError::DuplicateId(_) => ErrorCode::ImmutableField,
            KernelError::ReservedId { .. } => ErrorCode::ReservedIdViolation,
            KernelError::OldStringNotFound(_) => ErrorCode::OldStringNotFound,
            KernelError::OldStringNotUnique(_) => ErrorCode::OldStringNotUnique,
            KernelError::TypeMismatch(_) => ErrorCode::TypeMismatch,
            KernelError::System(_) => ErrorCode::SystemError,
        }
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
