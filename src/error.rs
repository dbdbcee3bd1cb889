//! Error taxonomy for path validation.
//!
//! [`ValidationError`] is closed: every failure of
//! [`crate::validator::SelfHealingValidator::validate_and_resolve`] is one of
//! these five kinds. Messages name the caller's own input and the reason,
//! never a canonical path, so they are safe to surface.

use thiserror::Error;

use crate::boundary::RejectReason;

/// Errors returned by the self-healing validator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Malformed input (empty, NUL byte, control characters) or a target
    /// the filesystem refused to resolve for a reason other than absence.
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: RejectReason },

    /// Absolute path, traversal, or symlink escape. Never recovered.
    #[error("path '{path}' is outside the safe root: {reason}")]
    OutsideSafeRoot { path: String, reason: RejectReason },

    /// The target does not exist. Eligible for bounded recovery.
    #[error("structure missing for '{path}'")]
    StructureMissing { path: String },

    /// The per-path recovery budget is spent. Carries the original cause.
    #[error("recovery exhausted for '{path}' after {attempts} attempts: {cause}")]
    RecoveryExhausted {
        path: String,
        attempts: u32,
        #[source]
        cause: Box<ValidationError>,
    },

    /// A recovery action itself failed (e.g. permission denied).
    #[error("recovery failed for '{path}': {detail}")]
    RecoveryFailed { path: String, detail: String },
}

impl ValidationError {
    /// Maps a resolver rejection onto the taxonomy.
    pub fn from_rejection(path: &str, reason: RejectReason) -> Self {
        let path = path.to_string();
        match reason {
            RejectReason::NotFound => Self::StructureMissing { path },
            RejectReason::AbsolutePath
            | RejectReason::ParentTraversal
            | RejectReason::DuplicateSeparator
            | RejectReason::SymlinkEscape => Self::OutsideSafeRoot { path, reason },
            RejectReason::Empty
            | RejectReason::NullByte
            | RejectReason::ControlCharacter
            | RejectReason::Unresolvable(_) => Self::InvalidPath { path, reason },
        }
    }

    /// True for boundary violations.
    pub fn is_security(&self) -> bool {
        match self {
            Self::OutsideSafeRoot { .. } => true,
            Self::InvalidPath { reason, .. } => reason.is_security(),
            _ => false,
        }
    }

    /// The underlying cause: for `RecoveryExhausted` this is the original
    /// `StructureMissing`, for everything else the error itself.
    pub fn root_cause(&self) -> &ValidationError {
        match self {
            Self::RecoveryExhausted { cause, .. } => cause.root_cause(),
            other => other,
        }
    }

    /// Short machine-readable kind, used in events and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidPath { .. } => "invalid_path",
            Self::OutsideSafeRoot { .. } => "outside_safe_root",
            Self::StructureMissing { .. } => "structure_missing",
            Self::RecoveryExhausted { .. } => "recovery_exhausted",
            Self::RecoveryFailed { .. } => "recovery_failed",
        }
    }
}
