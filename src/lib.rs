//! # rootguard -- self-healing path validation
//!
//! Confines every file-system path a build or attestation pipeline touches
//! to a declared safe root, and repairs missing directory structure on the
//! fly without ever relaxing the boundary.
//!
//! ## Security Properties
//!
//! - **`#![forbid(unsafe_code)]`**: No `unsafe` blocks anywhere.
//! - **Security failures never heal**: traversal, absolute paths outside the
//!   allowed prefixes and symlink escapes are rejected immediately and
//!   produce no recovery events under any configuration.
//! - **Bounded recovery**: each logical path gets a fixed number of recovery
//!   attempts; every attempt creates directories strictly inside the root.
//! - **Defensive input handling**: config and artifact reads are
//!   symlink-checked and size-bounded via [`fs_guard`].
//! - **Delegated signing**: statements are signed by `cosign`; the only
//!   cryptographic operation performed here is SHA-256 via `sha2`.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`boundary`] | Safe root definition and pure path resolution |
//! | [`validator`] | Resolution with bounded structure recovery |
//! | [`events`] | Lifecycle events and the synchronous bus |
//! | [`dag`] | Dependency graph of validated paths |
//! | [`snapshot`] | Immutable structure snapshots and the scheduler |
//! | [`governance`] | Metrics, compliance policies, audit report |
//! | [`provenance`] | Digests and SLSA statements for validated paths |
//! | [`fs_guard`] | Symlink-safe reads and directory materialization |

/// Safe root boundary and the pure, side-effect-free resolver.
pub mod boundary;

/// `rootguard.json` model with secure defaults.
pub mod config;

pub mod dag;

/// Streaming SHA-256 of files and directory trees.
pub mod digest;

/// in-toto Statement v1 with a SLSA provenance v1 predicate.
pub mod attest;

pub mod error;
pub mod events;

/// Symlink-safe, size-bounded file reads and in-root directory creation.
/// Single source of truth for file I/O on untrusted paths.
pub mod fs_guard;

pub mod governance;
pub mod provenance;

/// External signing of statements (`cosign`).
pub mod signing;

pub mod snapshot;
pub mod validator;

pub use boundary::{RejectReason, SafeRootBoundary, ValidationOutcome};
pub use config::GuardConfig;
pub use error::ValidationError;
pub use events::{EventBus, EventKind, ValidationEvent};
pub use governance::GovernanceRecorder;
pub use provenance::{ProvenanceError, ProvenanceService};
pub use validator::SelfHealingValidator;
