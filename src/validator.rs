//! Self-healing validation.
//!
//! [`SelfHealingValidator`] wraps the boundary resolver with a bounded
//! recovery loop. The asymmetry is deliberate and absolute: a path that is
//! merely *missing* may be healed within its attempt budget, a path that
//! *violates the boundary* is rejected immediately and never healed under
//! any configuration.
//!
//! ## Per-call state machine
//!
//! ```text
//! resolve ──Resolved──────────────────────────────► record valid, Ok
//!    │
//!    ├─Rejected(NotFound)──► FAILED, MISSING ─┬─ recovery off / absolute ─► Err(StructureMissing)
//!    │                                         ├─ budget spent ──────────► Err(RecoveryExhausted)
//!    │                                         └─ restore structure, retry once
//!    │                                              ├─ Resolved ─► RECOVERED(ok), Ok
//!    │                                              └─ Rejected ─► RECOVERED(fail), Err
//!    │
//!    └─Rejected(other)─────► FAILED, FALLBACK ──────────────────────────► Err
//! ```
//!
//! Locks guard only the live mapping table, the DAG and the attempt
//! counters, and every lock is released before an event is published.

use std::{
    collections::{BTreeMap, HashMap},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use anyhow::Result;

use crate::{
    boundary::{SafeRootBoundary, ValidationOutcome},
    config::{GuardConfig, RecoveryConfig},
    dag::{NodeId, NodeStatus, PathDag, PathKind, PathNode},
    error::ValidationError,
    events::{EventBus, EventKind, ValidationEvent},
    fs_guard,
    snapshot::{SnapshotScheduler, SnapshotStore, StructureSnapshot},
};

/// Path used on events that concern the whole structure, not one path.
const STRUCTURE_EVENT_PATH: &str = ".";

#[derive(Debug, Default)]
struct LiveState {
    /// Logical path -> canonical path, for paths whose last resolution
    /// succeeded on the happy path.
    mappings: BTreeMap<String, PathBuf>,
    dag: PathDag,
}

/// What a recovery attempt will restore.
struct RecoveryPlan {
    /// Directory chain to create, relative to the safe root.
    target: PathBuf,
    snapshot_id: Option<String>,
}

/// Resolves paths against a [`SafeRootBoundary`] and heals missing
/// structure within a per-path attempt budget.
#[derive(Debug)]
pub struct SelfHealingValidator {
    boundary: SafeRootBoundary,
    recovery: RecoveryConfig,
    dag_tracking: bool,
    bus: Arc<EventBus>,
    snapshots: SnapshotStore,
    state: Mutex<LiveState>,
    attempts: Mutex<HashMap<String, u32>>,
}

impl SelfHealingValidator {
    pub fn new(
        boundary: SafeRootBoundary,
        recovery: RecoveryConfig,
        dag_tracking: bool,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            boundary,
            recovery,
            dag_tracking,
            bus,
            snapshots: SnapshotStore::new(),
            state: Mutex::new(LiveState::default()),
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Builds the boundary from `config` (canonicalizing the root and
    /// prefixes) and wires the validator to `bus`.
    pub fn from_config(config: &GuardConfig, bus: Arc<EventBus>) -> Result<Self> {
        let boundary = SafeRootBoundary::new(&config.safe_root, &config.allowed_prefixes)?;
        Ok(Self::new(
            boundary,
            config.recovery.clone(),
            config.snapshots.dag_tracking,
            bus,
        ))
    }

    pub fn boundary(&self) -> &SafeRootBoundary {
        &self.boundary
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    /// Resolves `candidate` to a canonical path inside the boundary,
    /// healing missing structure where policy allows.
    pub fn validate_and_resolve(&self, candidate: &str) -> Result<PathBuf, ValidationError> {
        let (key, relative) = self.logical_key(candidate);

        match self.boundary.resolve(candidate) {
            ValidationOutcome::Resolved(canonical) => {
                self.record_success(&key, &canonical);
                tracing::debug!(path = %key, "path resolved");
                self.emit(
                    ValidationEvent::new(EventKind::ValidationSucceeded, &key, self.boundary.root())
                        .with_canonical(canonical.clone()),
                );
                Ok(canonical)
            }
            ValidationOutcome::Rejected(reason) if reason.is_missing_structure() => {
                self.heal(candidate, &key, relative.as_deref())
            }
            ValidationOutcome::Rejected(reason) => {
                let err = ValidationError::from_rejection(candidate, reason.clone());
                if reason.is_security() {
                    tracing::warn!(path = %key, %reason, "boundary violation rejected");
                } else {
                    tracing::debug!(path = %key, %reason, "path rejected");
                }
                self.emit(
                    ValidationEvent::new(EventKind::ValidationFailed, &key, self.boundary.root())
                        .with_error(&err),
                );
                self.emit(
                    ValidationEvent::new(EventKind::FallbackTriggered, &key, self.boundary.root())
                        .with_error(&reason),
                );
                Err(err)
            }
        }
    }

    /// Captures the live mapping table and DAG as the current snapshot.
    ///
    /// Every path the snapshot lists as valid gets its recovery budget back.
    pub fn create_snapshot(&self) -> Result<Arc<StructureSnapshot>> {
        let (mappings, dag) = {
            let state = self.lock_state();
            (state.mappings.clone(), state.dag.clone())
        };
        let snapshot = self.snapshots.capture(&self.boundary, mappings, dag)?;
        {
            let mut attempts = self.lock_attempts();
            for key in snapshot.mappings.keys() {
                attempts.remove(key);
            }
        }
        tracing::info!(
            snapshot = %snapshot.id,
            paths = snapshot.mappings.len(),
            nodes = snapshot.dag.len(),
            "snapshot created"
        );
        self.emit(
            ValidationEvent::new(
                EventKind::SnapshotCreated,
                STRUCTURE_EVENT_PATH,
                self.boundary.root(),
            )
            .with_snapshot(snapshot.id.clone()),
        );
        Ok(snapshot)
    }

    /// Replaces the live mapping table and DAG with the current snapshot's
    /// copies. Restored nodes are marked `recovered`. Returns the snapshot id,
    /// or `None` if there is no snapshot to restore from.
    pub fn restore_snapshot(&self) -> Option<String> {
        let snapshot = self.snapshots.current()?;
        if snapshot.boundary != self.boundary {
            tracing::warn!(snapshot = %snapshot.id, "snapshot boundary differs; not restoring");
            return None;
        }

        let mut dag = snapshot.dag.clone();
        dag.mark_all(NodeStatus::Recovered);
        let restored: Vec<(NodeId, String)> = dag
            .iter()
            .map(|n| (n.id, n.logical_path.clone()))
            .collect();
        {
            let mut state = self.lock_state();
            state.mappings = snapshot.mappings.clone();
            state.dag = dag;
        }

        tracing::info!(snapshot = %snapshot.id, nodes = restored.len(), "live state restored");
        for (id, logical) in restored {
            self.emit(
                ValidationEvent::new(EventKind::DagNodeRebuilt, &logical, self.boundary.root())
                    .with_node(id)
                    .with_snapshot(snapshot.id.clone()),
            );
        }
        Some(snapshot.id.clone())
    }

    /// Starts a background thread that snapshots every `interval`. The
    /// thread holds only a weak reference and exits quietly once the
    /// validator is dropped.
    pub fn start_snapshot_scheduler(self: &Arc<Self>, interval: Duration) -> Result<SnapshotScheduler> {
        let weak = Arc::downgrade(self);
        SnapshotScheduler::spawn(interval, move || {
            if let Some(validator) = weak.upgrade() {
                if let Err(e) = validator.create_snapshot() {
                    tracing::warn!(error = %e, "scheduled snapshot failed");
                }
            }
        })
    }

    /// Recovery attempts spent on `candidate` since it last succeeded.
    pub fn recovery_attempts(&self, candidate: &str) -> u32 {
        let (key, _) = self.logical_key(candidate);
        self.lock_attempts().get(&key).copied().unwrap_or(0)
    }

    /// Gives `candidate` its full recovery budget back.
    pub fn reset_recovery(&self, candidate: &str) {
        let (key, _) = self.logical_key(candidate);
        self.lock_attempts().remove(&key);
    }

    /// Tracked DAG node for `candidate`, if any.
    pub fn node(&self, candidate: &str) -> Option<PathNode> {
        let (key, _) = self.logical_key(candidate);
        self.lock_state().dag.get_path(&key).cloned()
    }

    /// Copy of the live DAG.
    pub fn dag(&self) -> PathDag {
        self.lock_state().dag.clone()
    }

    fn heal(
        &self,
        candidate: &str,
        key: &str,
        relative: Option<&Path>,
    ) -> Result<PathBuf, ValidationError> {
        let original = ValidationError::StructureMissing {
            path: candidate.to_string(),
        };
        let root = self.boundary.root();

        self.emit(
            ValidationEvent::new(EventKind::ValidationFailed, key, root).with_error(&original),
        );
        self.emit(ValidationEvent::new(EventKind::StructureMissing, key, root));

        let missing_nodes = self.forget(key);
        for (id, logical) in &missing_nodes {
            self.emit(ValidationEvent::new(EventKind::DagNodeMissing, logical, root).with_node(id));
        }

        // Absolute candidates live under an allowed prefix; that structure
        // is not ours to create.
        let Some(relative) = relative.filter(|_| self.recovery.enabled) else {
            return Err(original);
        };

        let attempt = match self.claim_attempt(key) {
            Ok(n) => n,
            Err(spent) => {
                tracing::warn!(path = %key, attempts = spent, "recovery budget exhausted");
                return Err(ValidationError::RecoveryExhausted {
                    path: candidate.to_string(),
                    attempts: spent,
                    cause: Box::new(original),
                });
            }
        };

        let plan = self.plan_recovery(key, relative);
        tracing::info!(
            path = %key,
            attempt,
            max = self.recovery.max_attempts,
            snapshot = plan.snapshot_id.as_deref().unwrap_or("-"),
            "attempting structure recovery"
        );

        if let Err(e) = fs_guard::materialize_dirs(root, &plan.target) {
            tracing::warn!(path = %key, error = %e, "recovery action failed");
            self.emit(self.recovered_event(key, &plan, false).with_error(format!("{e:#}")));
            // Messages from fs_guard carry absolute paths; surface only the kind.
            let detail = e
                .chain()
                .find_map(|c| c.downcast_ref::<io::Error>())
                .map_or_else(|| "unsafe structure on recovery path".to_string(), |io| io.kind().to_string());
            return Err(ValidationError::RecoveryFailed {
                path: candidate.to_string(),
                detail,
            });
        }

        let rebuilt = self.mark_rebuilt(&missing_nodes);
        for (id, logical) in &rebuilt {
            self.emit(ValidationEvent::new(EventKind::DagNodeRebuilt, logical, root).with_node(id));
        }

        match self.boundary.resolve(candidate) {
            ValidationOutcome::Resolved(canonical) => {
                self.record_recovered(key, &canonical);
                tracing::info!(path = %key, attempt, "structure recovered");
                self.emit(
                    self.recovered_event(key, &plan, true)
                        .with_canonical(canonical.clone()),
                );
                Ok(canonical)
            }
            ValidationOutcome::Rejected(reason) => {
                tracing::info!(path = %key, %reason, "structure restored but target still unresolved");
                self.emit(self.recovered_event(key, &plan, false).with_error(&reason));
                if reason.is_missing_structure() {
                    Err(original)
                } else {
                    Err(ValidationError::from_rejection(candidate, reason))
                }
            }
        }
    }

    /// Chooses what to restore: the snapshotted structure if the current
    /// snapshot knows the path, otherwise the parent directory chain (plus
    /// the leaf when `materialize_leaf` is set).
    fn plan_recovery(&self, key: &str, relative: &Path) -> RecoveryPlan {
        if let Some(snapshot) = self.snapshots.current() {
            if snapshot.boundary == self.boundary {
                if let Some(rel) = snapshot
                    .lookup(key)
                    .and_then(|c| c.strip_prefix(self.boundary.root()).ok())
                {
                    let is_dir = snapshot
                        .node(key)
                        .is_some_and(|n| n.kind == PathKind::Directory);
                    let target = if is_dir {
                        rel.to_path_buf()
                    } else {
                        rel.parent().map(Path::to_path_buf).unwrap_or_default()
                    };
                    return RecoveryPlan {
                        target,
                        snapshot_id: Some(snapshot.id.clone()),
                    };
                }
            }
        }

        let target = if self.recovery.materialize_leaf {
            relative.to_path_buf()
        } else {
            relative.parent().map(Path::to_path_buf).unwrap_or_default()
        };
        RecoveryPlan {
            target,
            snapshot_id: None,
        }
    }

    fn recovered_event(&self, key: &str, plan: &RecoveryPlan, ok: bool) -> ValidationEvent {
        let mut event = ValidationEvent::new(EventKind::StructureRecovered, key, self.boundary.root())
            .with_recovered(ok);
        if let Some(id) = &plan.snapshot_id {
            event = event.with_snapshot(id.clone());
        }
        if self.dag_tracking {
            event = event.with_node(NodeId::for_path(key));
        }
        event
    }

    /// Takes one unit of the recovery budget for `key`. `Err` carries the
    /// number of attempts already spent when the budget is gone.
    fn claim_attempt(&self, key: &str) -> Result<u32, u32> {
        let mut attempts = self.lock_attempts();
        let spent = attempts.entry(key.to_string()).or_insert(0);
        if *spent >= self.recovery.max_attempts {
            return Err(*spent);
        }
        *spent += 1;
        Ok(*spent)
    }

    fn record_success(&self, key: &str, canonical: &Path) {
        {
            let mut state = self.lock_state();
            state.mappings.insert(key.to_string(), canonical.to_path_buf());
            if self.dag_tracking {
                state
                    .dag
                    .record_valid(key, canonical.to_path_buf(), kind_of(canonical));
            }
        }
        self.lock_attempts().remove(key);
    }

    /// A resolved retry counts as a success for the attempt budget.
    fn record_recovered(&self, key: &str, canonical: &Path) {
        self.lock_attempts().remove(key);
        if !self.dag_tracking {
            return;
        }
        let mut state = self.lock_state();
        let id = state
            .dag
            .record_valid(key, canonical.to_path_buf(), kind_of(canonical));
        state.dag.set_status(&id, NodeStatus::Recovered);
    }

    /// Drops the stale mapping for `key` and returns the tracked nodes on
    /// its dependency chain that no longer exist on disk.
    fn forget(&self, key: &str) -> Vec<(NodeId, String)> {
        let mut state = self.lock_state();
        state.mappings.remove(key);
        if !self.dag_tracking {
            return Vec::new();
        }
        state.dag.set_status(&NodeId::for_path(key), NodeStatus::Unknown);

        let root = self.boundary.root();
        let missing: Vec<(NodeId, String)> = state
            .dag
            .chain(key)
            .into_iter()
            .filter(|n| !root.join(&n.logical_path).exists())
            .map(|n| (n.id, n.logical_path.clone()))
            .collect();
        for (id, _) in &missing {
            state.dag.set_status(id, NodeStatus::Unknown);
        }
        missing
    }

    /// Marks the previously missing nodes that exist again as `recovered`.
    fn mark_rebuilt(&self, missing: &[(NodeId, String)]) -> Vec<(NodeId, String)> {
        if missing.is_empty() {
            return Vec::new();
        }
        let root = self.boundary.root();
        let mut state = self.lock_state();
        missing
            .iter()
            .filter(|(_, logical)| root.join(logical).exists())
            .map(|(id, logical)| {
                state.dag.set_status(id, NodeStatus::Recovered);
                (*id, logical.clone())
            })
            .collect()
    }

    /// Normalized `/`-joined key for root-relative candidates, with the
    /// relative path itself; the raw candidate for everything else.
    fn logical_key(&self, candidate: &str) -> (String, Option<PathBuf>) {
        match self.boundary.normalize(candidate) {
            Some(rel) => {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                (key, Some(rel))
            }
            None => (candidate.to_string(), None),
        }
    }

    fn emit(&self, event: ValidationEvent) {
        self.bus.publish(&event);
    }

    fn lock_state(&self) -> MutexGuard<'_, LiveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_attempts(&self) -> MutexGuard<'_, HashMap<String, u32>> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn kind_of(canonical: &Path) -> PathKind {
    match std::fs::metadata(canonical) {
        Ok(m) if m.is_dir() => PathKind::Directory,
        Ok(_) => PathKind::File,
        Err(_) => PathKind::Unknown,
    }
}
