//! Point-in-time captures of known-good structure.
//!
//! A [`StructureSnapshot`] is immutable once built. The [`SnapshotStore`]
//! holds exactly one current snapshot behind an `Arc`, so recovery reads a
//! stable copy while a newer capture may be installed concurrently.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, PoisonError, RwLock,
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::boundary::SafeRootBoundary;
use crate::dag::{PathDag, PathNode};

/// Immutable capture of the mapping table and DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructureSnapshot {
    /// `snap-<sequence>-<content hash prefix>`.
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub boundary: SafeRootBoundary,
    pub mappings: BTreeMap<String, PathBuf>,
    pub dag: PathDag,
}

impl StructureSnapshot {
    pub fn lookup(&self, logical: &str) -> Option<&Path> {
        self.mappings.get(logical).map(PathBuf::as_path)
    }

    pub fn node(&self, logical: &str) -> Option<&PathNode> {
        self.dag.get_path(logical)
    }

    /// Age at `now`; zero if the clock went backwards.
    pub fn age_at(&self, now: OffsetDateTime) -> Duration {
        Duration::try_from(now - self.created_at).unwrap_or(Duration::ZERO)
    }
}

/// Holder of the current snapshot.
#[derive(Debug, Default)]
pub struct SnapshotStore {
    current: RwLock<Option<Arc<StructureSnapshot>>>,
    sequence: AtomicU64,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a snapshot from copies of the live state and makes it current.
    /// The previous snapshot is dropped once no reader holds it.
    pub fn capture(
        &self,
        boundary: &SafeRootBoundary,
        mappings: BTreeMap<String, PathBuf>,
        dag: PathDag,
    ) -> Result<Arc<StructureSnapshot>> {
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let digest = content_digest(&mappings)?;
        let snapshot = Arc::new(StructureSnapshot {
            id: format!("snap-{seq:06}-{}", &digest[..12]),
            created_at: OffsetDateTime::now_utc(),
            boundary: boundary.clone(),
            mappings,
            dag,
        });
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    pub fn current(&self) -> Option<Arc<StructureSnapshot>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Known-good canonical path for `logical` in the current snapshot.
    pub fn lookup(&self, logical: &str) -> Option<PathBuf> {
        self.current()
            .and_then(|s| s.lookup(logical).map(Path::to_path_buf))
    }

    /// DAG node for `logical` in the current snapshot.
    pub fn lookup_node(&self, logical: &str) -> Option<PathNode> {
        self.current().and_then(|s| s.node(logical).cloned())
    }
}

fn content_digest(mappings: &BTreeMap<String, PathBuf>) -> Result<String> {
    let bytes = serde_json::to_vec(mappings).context("serialize snapshot mappings")?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Background thread that runs `tick` every `interval` until stopped.
///
/// Dropping the scheduler stops it and joins the thread.
#[derive(Debug)]
pub struct SnapshotScheduler {
    stop: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SnapshotScheduler {
    pub fn spawn<F>(interval: Duration, tick: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<()>();
        let handle = thread::Builder::new()
            .name("rootguard-snapshots".into())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(mpsc::RecvTimeoutError::Timeout) => tick(),
                    Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
                }
            })
            .context("spawn snapshot scheduler")?;
        tracing::debug!(interval_ms = interval.as_millis(), "snapshot scheduler started");
        Ok(Self {
            stop: Some(tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel and ends the loop.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("snapshot scheduler thread panicked");
            }
        }
    }
}

impl Drop for SnapshotScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
