//! Provenance consumer: digests and attests artifacts that live under the
//! safe root.
//!
//! Every path goes through [`SelfHealingValidator::validate_and_resolve`]
//! first. Callers only ever learn that a path was "not found"; the reason,
//! the canonical location and the safe root stay in the debug log.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_json::{json, Value};
use thiserror::Error;

use crate::{
    attest::{self, BuilderInfo, Subject},
    digest::{self, TreeDigest},
    validator::SelfHealingValidator,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvenanceError {
    #[error("not found: {requested}")]
    NotFound { requested: String },

    #[error("cannot digest {requested}")]
    Digest { requested: String },

    #[error("cannot build attestation: {0}")]
    Attestation(String),
}

pub struct ProvenanceService {
    validator: Arc<SelfHealingValidator>,
    max_file_bytes: u64,
}

impl ProvenanceService {
    pub fn new(validator: Arc<SelfHealingValidator>, max_file_bytes: u64) -> Self {
        Self {
            validator,
            max_file_bytes,
        }
    }

    pub fn validator(&self) -> &Arc<SelfHealingValidator> {
        &self.validator
    }

    /// Validated canonical path for `requested`.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, ProvenanceError> {
        self.validator.validate_and_resolve(requested).map_err(|e| {
            tracing::debug!(path = requested, kind = e.kind(), error = %e, "provenance lookup failed");
            ProvenanceError::NotFound {
                requested: requested.to_string(),
            }
        })
    }

    /// SHA-256 subject for a single file, named by the caller's path.
    pub fn digest(&self, requested: &str) -> Result<Subject, ProvenanceError> {
        let canonical = self.resolve(requested)?;
        self.file_subject(requested, &canonical)
    }

    /// Aggregate subject for a directory plus its per-file listing.
    pub fn digest_tree(&self, requested: &str) -> Result<(Subject, TreeDigest), ProvenanceError> {
        let canonical = self.resolve(requested)?;
        self.tree_subject(requested, &canonical)
    }

    /// Subject for whatever `requested` resolves to: a file digest or a
    /// tree digest for directories.
    pub fn subject(&self, requested: &str) -> Result<Subject, ProvenanceError> {
        let canonical = self.resolve(requested)?;
        if canonical.is_dir() {
            Ok(self.tree_subject(requested, &canonical)?.0)
        } else {
            self.file_subject(requested, &canonical)
        }
    }

    /// in-toto statement with a SLSA v1 predicate over `subjects` that were
    /// digested elsewhere.
    pub fn attest(subjects: &[Subject], builder: &BuilderInfo) -> Result<Value, ProvenanceError> {
        build_statement(subjects, builder, &json!({}))
    }

    /// Digests each path (files directly, directories as trees) and attests
    /// the result. The requested paths are recorded as external parameters.
    pub fn attest_paths(&self, paths: &[String], builder: &BuilderInfo) -> Result<Value, ProvenanceError> {
        let subjects = paths
            .iter()
            .map(|p| self.subject(p))
            .collect::<Result<Vec<_>, _>>()?;
        build_statement(&subjects, builder, &json!({ "paths": paths }))
    }

    fn file_subject(&self, requested: &str, canonical: &Path) -> Result<Subject, ProvenanceError> {
        let (sha256, _) = digest::sha256_file(canonical, self.max_file_bytes)
            .map_err(|e| self.digest_error(requested, &e))?;
        Ok(Subject::sha256(requested, sha256))
    }

    fn tree_subject(
        &self,
        requested: &str,
        canonical: &Path,
    ) -> Result<(Subject, TreeDigest), ProvenanceError> {
        let tree = digest::hash_tree(canonical, self.max_file_bytes)
            .map_err(|e| self.digest_error(requested, &e))?;
        Ok((Subject::sha256(requested, tree.sha256.clone()), tree))
    }

    fn digest_error(&self, requested: &str, e: &anyhow::Error) -> ProvenanceError {
        tracing::warn!(
            path = requested,
            root = %self.validator.boundary().root().display(),
            error = %format!("{e:#}"),
            "digest failed"
        );
        ProvenanceError::Digest {
            requested: requested.to_string(),
        }
    }
}

fn build_statement(
    subjects: &[Subject],
    builder: &BuilderInfo,
    external: &Value,
) -> Result<Value, ProvenanceError> {
    attest::make_provenance_statement(subjects, builder, attest::DEFAULT_BUILD_TYPE, external)
        .map_err(|e| ProvenanceError::Attestation(e.to_string()))
}
