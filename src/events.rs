//! Validation lifecycle events and the in-process bus that fans them out.
//!
//! The bus is an ordinary value: construct one, share it behind an `Arc`,
//! and hand it to the validator and any observers. Delivery is synchronous
//! and reaches every subscriber registered at publish time. A subscriber
//! that returns an error or panics is logged and skipped; the publisher
//! never sees it.

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    path::PathBuf,
    sync::{Arc, PoisonError, RwLock},
};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Closed set of lifecycle event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ValidationSucceeded,
    ValidationFailed,
    StructureMissing,
    StructureRecovered,
    FallbackTriggered,
    SnapshotCreated,
    DagNodeMissing,
    DagNodeRebuilt,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        Self::ValidationSucceeded,
        Self::ValidationFailed,
        Self::StructureMissing,
        Self::StructureRecovered,
        Self::FallbackTriggered,
        Self::SnapshotCreated,
        Self::DagNodeMissing,
        Self::DagNodeRebuilt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationSucceeded => "VALIDATION_SUCCEEDED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::StructureMissing => "STRUCTURE_MISSING",
            Self::StructureRecovered => "STRUCTURE_RECOVERED",
            Self::FallbackTriggered => "FALLBACK_TRIGGERED",
            Self::SnapshotCreated => "SNAPSHOT_CREATED",
            Self::DagNodeMissing => "DAG_NODE_MISSING",
            Self::DagNodeRebuilt => "DAG_NODE_REBUILT",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One immutable lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationEvent {
    pub kind: EventKind,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub path: String,
    pub safe_root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canonical_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovered: Option<bool>,
}

impl ValidationEvent {
    pub fn new(kind: EventKind, path: &str, safe_root: &std::path::Path) -> Self {
        Self {
            kind,
            timestamp: OffsetDateTime::now_utc(),
            path: path.to_string(),
            safe_root: safe_root.to_path_buf(),
            canonical_path: None,
            error: None,
            snapshot_id: None,
            node_id: None,
            recovered: None,
        }
    }

    #[must_use]
    pub fn with_canonical(mut self, canonical: PathBuf) -> Self {
        self.canonical_path = Some(canonical);
        self
    }

    #[must_use]
    pub fn with_error(mut self, error: impl fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self
    }

    #[must_use]
    pub fn with_snapshot(mut self, snapshot_id: impl Into<String>) -> Self {
        self.snapshot_id = Some(snapshot_id.into());
        self
    }

    #[must_use]
    pub fn with_node(mut self, node_id: impl fmt::Display) -> Self {
        self.node_id = Some(node_id.to_string());
        self
    }

    #[must_use]
    pub fn with_recovered(mut self, recovered: bool) -> Self {
        self.recovered = Some(recovered);
        self
    }
}

/// Subscriber callback. Errors are logged by the bus and go no further.
pub type EventHandler = Arc<dyn Fn(&ValidationEvent) -> anyhow::Result<()> + Send + Sync>;

struct Subscription {
    /// `None` subscribes to every kind.
    kind: Option<EventKind>,
    handler: EventHandler,
}

/// Synchronous fan-out bus.
#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<Vec<Subscription>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for events of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&ValidationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push(Some(kind), Arc::new(handler));
    }

    /// Registers `handler` for every event kind.
    pub fn subscribe_all<F>(&self, handler: F)
    where
        F: Fn(&ValidationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push(None, Arc::new(handler));
    }

    fn push(&self, kind: Option<EventKind>, handler: EventHandler) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { kind, handler });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Delivers `event` to every matching subscriber and returns how many
    /// handled it without error.
    ///
    /// The subscriber list is copied out before any handler runs, so a
    /// handler may itself subscribe or publish without deadlocking.
    pub fn publish(&self, event: &ValidationEvent) -> usize {
        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind.map_or(true, |k| k == event.kind))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    tracing::warn!(kind = %event.kind, error = %e, "event subscriber failed");
                }
                Err(_) => {
                    tracing::error!(kind = %event.kind, "event subscriber panicked");
                }
            }
        }
        tracing::trace!(kind = %event.kind, path = %event.path, delivered, "event published");
        delivered
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn event(kind: EventKind) -> ValidationEvent {
        ValidationEvent::new(kind, "a/b.txt", Path::new("/safe"))
    }

    #[test]
    fn routes_by_kind() {
        let bus = EventBus::new();
        let failed = Arc::new(AtomicUsize::new(0));
        let all = Arc::new(AtomicUsize::new(0));
        {
            let failed = Arc::clone(&failed);
            bus.subscribe(EventKind::ValidationFailed, move |_| {
                failed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        {
            let all = Arc::clone(&all);
            bus.subscribe_all(move |_| {
                all.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        bus.publish(&event(EventKind::ValidationFailed));
        bus.publish(&event(EventKind::SnapshotCreated));

        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(all.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failing_and_panicking_subscribers_are_isolated() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe_all(|_| Err(anyhow::anyhow!("observer is broken")));
        bus.subscribe_all(|_| panic!("observer panicked"));
        {
            let seen = Arc::clone(&seen);
            bus.subscribe_all(move |e| {
                seen.lock().unwrap().push(e.kind);
                Ok(())
            });
        }

        let delivered = bus.publish(&event(EventKind::FallbackTriggered));
        assert_eq!(delivered, 1);
        assert_eq!(*seen.lock().unwrap(), vec![EventKind::FallbackTriggered]);
    }

    #[test]
    fn handler_may_subscribe_during_delivery() {
        let bus = Arc::new(EventBus::new());
        {
            let inner = Arc::clone(&bus);
            bus.subscribe_all(move |_| {
                inner.subscribe_all(|_| Ok(()));
                Ok(())
            });
        }
        bus.publish(&event(EventKind::StructureMissing));
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn event_serializes_with_screaming_kind() {
        let e = event(EventKind::DagNodeRebuilt).with_recovered(true);
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["kind"], "DAG_NODE_REBUILT");
        assert_eq!(v["recovered"], true);
        assert!(v.get("snapshot_id").is_none());
    }
}
