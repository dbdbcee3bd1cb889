//! Governance: metrics, compliance checks and the audit trail.
//!
//! The [`GovernanceRecorder`] is a pure observer. It is attached to an
//! [`EventBus`] like any other subscriber, never returns an error to it, and
//! never touches validator state. Policy violations are recorded, not
//! enforced; enforcement is the validator's recovery cap.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fmt, fs,
    path::Path,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::config::ComplianceConfig;
use crate::events::{EventBus, EventKind, ValidationEvent};

const REPORT_SCHEMA: &str = "rootguard/audit-report/v1";

/// Fixed compliance policy set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PolicyId {
    /// At most N recovery attempts per path within the recovery window.
    #[serde(rename = "GOV-001")]
    RecoveryRate,
    /// Snapshot-backed recovery must use a known snapshot younger than the
    /// configured maximum age.
    #[serde(rename = "GOV-002")]
    SnapshotFreshness,
    /// A path that triggered a fallback must never be healed.
    #[serde(rename = "GOV-003")]
    NoHealingAfterFallback,
}

impl PolicyId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecoveryRate => "GOV-001",
            Self::SnapshotFreshness => "GOV-002",
            Self::NoHealingAfterFallback => "GOV-003",
        }
    }
}

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters owned by the recorder. Only ever increase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GovernanceMetrics {
    pub total_validations: u64,
    pub total_failures: u64,
    pub total_recoveries: u64,
    pub successful_recoveries: u64,
    pub failed_recoveries: u64,
    pub snapshots_created: u64,
    pub dag_nodes_rebuilt: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_event_at: Option<OffsetDateTime>,
}

/// One append-only entry per observed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub event_kind: EventKind,
    pub path: String,
    pub recovery_attempted: bool,
    pub recovery_succeeded: bool,
    pub compliant: bool,
    pub violations: Vec<PolicyId>,
}

#[derive(Debug, Default)]
struct RecorderState {
    metrics: GovernanceMetrics,
    records: Vec<AuditRecord>,
    /// Recovery timestamps per path, oldest first, pruned to the window.
    recoveries: HashMap<String, VecDeque<OffsetDateTime>>,
    /// Snapshot id -> creation time, as announced on the bus.
    snapshots: HashMap<String, OffsetDateTime>,
    /// Paths that triggered a fallback.
    fallbacks: HashSet<String>,
}

/// Bus observer that keeps metrics and the audit trail.
#[derive(Debug)]
pub struct GovernanceRecorder {
    policy: ComplianceConfig,
    state: Mutex<RecorderState>,
}

impl GovernanceRecorder {
    pub fn new(policy: ComplianceConfig) -> Self {
        Self {
            policy,
            state: Mutex::new(RecorderState::default()),
        }
    }

    /// Subscribes this recorder to every event kind on `bus`.
    pub fn attach(self: &Arc<Self>, bus: &EventBus) {
        let recorder = Arc::clone(self);
        bus.subscribe_all(move |event| {
            recorder.on_event(event);
            Ok(())
        });
    }

    /// Records `event`: updates metrics, evaluates policies, appends an
    /// audit record. Never fails.
    pub fn on_event(&self, event: &ValidationEvent) {
        let mut state = self.lock();
        update_metrics(&mut state.metrics, event);
        let violations = self.evaluate(&mut state, event);
        if !violations.is_empty() {
            tracing::warn!(
                kind = %event.kind,
                path = %event.path,
                violations = ?violations,
                "compliance policy violated"
            );
        }

        let id = format!("AR-{:08}", state.records.len() + 1);
        let recovery_attempted = event.kind == EventKind::StructureRecovered;
        state.records.push(AuditRecord {
            id,
            timestamp: event.timestamp,
            event_kind: event.kind,
            path: event.path.clone(),
            recovery_attempted,
            recovery_succeeded: recovery_attempted && event.recovered == Some(true),
            compliant: violations.is_empty(),
            violations,
        });
    }

    pub fn metrics(&self) -> GovernanceMetrics {
        self.lock().metrics.clone()
    }

    /// Successful recoveries over recovery attempts; `0.0` with no attempts.
    pub fn success_rate(&self) -> f64 {
        rate(&self.lock().metrics)
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.lock().records.clone()
    }

    /// Audit document: timestamp, success rate, metrics, compliance summary
    /// and the full record list.
    pub fn export_report(&self) -> Result<Value> {
        let generated_at = OffsetDateTime::now_utc().format(&Rfc3339)?;
        let state = self.lock();

        let compliant = state.records.iter().filter(|r| r.compliant).count();
        let mut by_policy: BTreeMap<&'static str, u64> = BTreeMap::new();
        for v in state.records.iter().flat_map(|r| &r.violations) {
            *by_policy.entry(v.as_str()).or_default() += 1;
        }
        let violation_count: u64 = by_policy.values().sum();

        Ok(json!({
            "report_schema": REPORT_SCHEMA,
            "rootguard_version": env!("CARGO_PKG_VERSION"),
            "generated_at": generated_at,
            "success_rate": rate(&state.metrics),
            "metrics": state.metrics,
            "compliance": {
                "total_events": state.records.len(),
                "compliant_events": compliant,
                "violation_count": violation_count,
                "violations_by_policy": by_policy,
            },
            "records": state.records,
        }))
    }

    /// Writes [`Self::export_report`] as pretty JSON to `path`.
    pub fn write_report(&self, path: &Path) -> Result<()> {
        let report = self.export_report()?;
        fs::write(path, serde_json::to_vec_pretty(&report)?)
            .with_context(|| format!("write report {}", path.display()))
    }

    fn evaluate(&self, state: &mut RecorderState, event: &ValidationEvent) -> Vec<PolicyId> {
        let mut violations = Vec::new();
        match event.kind {
            EventKind::SnapshotCreated => {
                if let Some(id) = &event.snapshot_id {
                    state.snapshots.insert(id.clone(), event.timestamp);
                }
            }
            EventKind::FallbackTriggered => {
                state.fallbacks.insert(event.path.clone());
            }
            EventKind::StructureRecovered => {
                let window = time::Duration::try_from(self.policy.recovery_window())
                    .unwrap_or(time::Duration::MAX);
                state.recoveries.retain(|_, seen| {
                    while seen.front().is_some_and(|t| event.timestamp - *t > window) {
                        seen.pop_front();
                    }
                    !seen.is_empty()
                });
                let seen = state.recoveries.entry(event.path.clone()).or_default();
                seen.push_back(event.timestamp);
                if seen.len() > self.policy.max_recoveries_per_window as usize {
                    violations.push(PolicyId::RecoveryRate);
                }

                if let Some(id) = &event.snapshot_id {
                    let max_age = time::Duration::try_from(self.policy.max_snapshot_age())
                        .unwrap_or(time::Duration::MAX);
                    let fresh = state
                        .snapshots
                        .get(id)
                        .is_some_and(|created| event.timestamp - *created <= max_age);
                    if !fresh {
                        violations.push(PolicyId::SnapshotFreshness);
                    }
                }

                if state.fallbacks.contains(&event.path) {
                    violations.push(PolicyId::NoHealingAfterFallback);
                }
            }
            _ => {}
        }
        violations
    }

    fn lock(&self) -> MutexGuard<'_, RecorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn update_metrics(m: &mut GovernanceMetrics, event: &ValidationEvent) {
    match event.kind {
        EventKind::ValidationSucceeded => m.total_validations += 1,
        EventKind::ValidationFailed => {
            m.total_validations += 1;
            m.total_failures += 1;
        }
        EventKind::StructureRecovered => {
            m.total_recoveries += 1;
            if event.recovered == Some(true) {
                m.successful_recoveries += 1;
            } else {
                m.failed_recoveries += 1;
            }
        }
        EventKind::SnapshotCreated => m.snapshots_created += 1,
        EventKind::DagNodeRebuilt => m.dag_nodes_rebuilt += 1,
        EventKind::StructureMissing | EventKind::FallbackTriggered | EventKind::DagNodeMissing => {}
    }
    m.last_event_at = Some(event.timestamp);
}

#[allow(clippy::cast_precision_loss)]
fn rate(m: &GovernanceMetrics) -> f64 {
    if m.total_recoveries == 0 {
        0.0
    } else {
        m.successful_recoveries as f64 / m.total_recoveries as f64
    }
}
