//! Dependency graph of validated paths.
//!
//! Nodes live in a `BTreeMap<NodeId, PathNode>` arena; edges are id lists on
//! the dependent node (a path depends on its parent directory). The
//! filesystem hierarchy makes the graph acyclic by construction, and having
//! no references between nodes keeps snapshot copies a plain `clone()`.

use std::{collections::BTreeMap, fmt, path::PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

/// Content-derived node identity: SHA-256 of the logical path string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct NodeId([u8; 32]);

impl NodeId {
    pub fn for_path(logical: &str) -> Self {
        Self(Sha256::digest(logical.as_bytes()).into())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for NodeId {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        let bytes = hex::decode(&s).map_err(|e| format!("invalid node id {s}: {e}"))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| format!("node id must be 32 bytes: {s}"))?;
        Ok(Self(arr))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Produced by a successful resolution since the last snapshot.
    Valid,
    /// Restored by recovery; re-validate before trusting it for writes.
    Recovered,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathKind {
    File,
    Directory,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathNode {
    pub id: NodeId,
    pub logical_path: String,
    /// `None` for ancestors tracked implicitly and never resolved directly.
    pub canonical_path: Option<PathBuf>,
    pub status: NodeStatus,
    pub kind: PathKind,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_validated: Option<OffsetDateTime>,
    pub depends_on: Vec<NodeId>,
}

/// Arena of path nodes keyed by [`NodeId`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathDag {
    nodes: BTreeMap<NodeId, PathNode>,
}

impl PathDag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a successful resolution of `logical` and ensures every
    /// ancestor is tracked. Returns the node id.
    pub fn record_valid(&mut self, logical: &str, canonical: PathBuf, kind: PathKind) -> NodeId {
        let id = self.ensure_chain(logical, kind);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.canonical_path = Some(canonical);
            node.status = NodeStatus::Valid;
            node.kind = kind;
            node.last_validated = Some(OffsetDateTime::now_utc());
        }
        id
    }

    /// Marks a tracked node with `status`. Unknown ids are ignored.
    pub fn set_status(&mut self, id: &NodeId, status: NodeStatus) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.status = status;
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&PathNode> {
        self.nodes.get(id)
    }

    pub fn get_path(&self, logical: &str) -> Option<&PathNode> {
        self.nodes.get(&NodeId::for_path(logical))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathNode> {
        self.nodes.values()
    }

    /// Tracked nodes on the dependency chain of `logical`, nearest first.
    ///
    /// Starts at the nearest tracked node on the path (the node itself if
    /// known) and follows `depends_on` edges toward the root.
    pub fn chain(&self, logical: &str) -> Vec<&PathNode> {
        let mut probe = Some(logical);
        let mut node = None;
        while let Some(p) = probe {
            if let Some(n) = self.get_path(p) {
                node = Some(n);
                break;
            }
            probe = parent_of(p);
        }

        let mut out = Vec::new();
        while let Some(n) = node {
            out.push(n);
            node = n.depends_on.first().and_then(|id| self.nodes.get(id));
        }
        out
    }

    /// Replaces every node's status, e.g. after restoring from a snapshot.
    pub fn mark_all(&mut self, status: NodeStatus) {
        for node in self.nodes.values_mut() {
            node.status = status;
        }
    }

    /// Inserts `logical` and all of its ancestors, wiring `depends_on`.
    /// Ancestors are directories by definition.
    fn ensure_chain(&mut self, logical: &str, kind: PathKind) -> NodeId {
        let id = NodeId::for_path(logical);
        let parent = parent_of(logical).map(|p| self.ensure_chain(p, PathKind::Directory));
        let node = self.nodes.entry(id).or_insert_with(|| PathNode {
            id,
            logical_path: logical.to_string(),
            canonical_path: None,
            status: NodeStatus::Unknown,
            kind,
            last_validated: None,
            depends_on: parent.into_iter().collect(),
        });
        if node.kind == PathKind::Unknown {
            node.kind = kind;
        }
        id
    }
}

/// Logical parent of a normalized, `/`-separated path. `None` at the top.
pub fn parent_of(logical: &str) -> Option<&str> {
    logical.rsplit_once('/').map(|(parent, _)| parent)
}
