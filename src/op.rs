//! Operation model for conflict-free document mutation.
//!
//! Every mutation of a document is an immutable [`Operation`] identified by
//! `(replica id, per-replica sequence number)`. Items are addressed by the
//! [`ItemId`] of the insertion that created them — never by array index,
//! since indices shift under concurrent edits.
//!
//! Causal ordering is carried two ways:
//! - a Lamport timestamp on every operation (advanced past everything the
//!   generating replica had seen), and
//! - the anchor/target item reference, which names the causal predecessor
//!   the operation was generated against.
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Identifier of one replica (one client's copy of a document).
pub type ReplicaId = Uuid;

/// Globally unique operation identifier.
///
/// Sequence numbers are strictly increasing per replica, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OpId {
    pub replica: ReplicaId,
    pub seq: u64,
}

impl OpId {
    pub fn new(replica: ReplicaId, seq: u64) -> Self {
        Self { replica, seq }
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.replica, self.seq)
    }
}

/// Stable identifier of an item in the document sequence.
///
/// An item keeps the id of the insert operation that created it, so the
/// identifier survives any amount of concurrent editing around it.
pub type ItemId = OpId;

/// Attribute value for item attribute registers.
///
/// A closed set of scalar shapes so operations round-trip through the
/// non-self-describing wire encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// The three mutation kinds of the document model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert a new item after `anchor` (`None` = head of sequence).
    /// The inserted item's id is the operation's own id.
    Insert {
        anchor: Option<ItemId>,
        body: String,
    },

    /// Tombstone an item. The item stays in the sequence as a deletion
    /// marker so later concurrent references still resolve.
    Delete { target: ItemId },

    /// Set one attribute of an item, last-writer-wins.
    ///
    /// `timestamp` is wall-clock milliseconds at the originating replica.
    /// LWW by wall clock is vulnerable to skew between clients; ties and
    /// skew are broken deterministically by `(timestamp, replica id)`.
    SetAttr {
        target: ItemId,
        key: String,
        value: AttrValue,
        timestamp: u64,
    },
}

/// One atomic, causally-ordered, immutable mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// `(replica, seq)` — globally unique.
    pub id: OpId,
    /// Lamport timestamp at generation (greater than everything seen).
    pub lamport: u64,
    pub kind: OpKind,
}

impl Operation {
    pub fn new(id: OpId, lamport: u64, kind: OpKind) -> Self {
        Self { id, lamport, kind }
    }

    /// The item this operation references, if any.
    ///
    /// Inserts reference their anchor (`None` for head inserts), deletes
    /// and attribute writes reference their target.
    pub fn reference(&self) -> Option<ItemId> {
        match &self.kind {
            OpKind::Insert { anchor, .. } => *anchor,
            OpKind::Delete { target } => Some(*target),
            OpKind::SetAttr { target, .. } => Some(*target),
        }
    }

    /// Structural validity check, independent of replica state.
    ///
    /// Sequence numbers start at 1 and an insert may not anchor on itself.
    pub fn is_well_formed(&self) -> bool {
        if self.id.seq == 0 {
            return false;
        }
        match &self.kind {
            OpKind::Insert { anchor, .. } => *anchor != Some(self.id),
            _ => true,
        }
    }
}

/// Per-replica high-water marks: how far of each replica's sequence has
/// been observed.
///
/// Doubles as the reconnection watermark in the handshake — the peer
/// resends only operations past this vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionVector {
    entries: HashMap<ReplicaId, u64>,
}

impl VersionVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest contiguous sequence observed for `replica` (0 = none).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// Record that `seq` from `replica` has been observed.
    ///
    /// Only moves forward; stale observations are ignored.
    pub fn observe(&mut self, replica: ReplicaId, seq: u64) {
        let entry = self.entries.entry(replica).or_insert(0);
        if seq > *entry {
            *entry = seq;
        }
    }

    /// Whether the operation id is already covered by this vector.
    pub fn contains(&self, id: &OpId) -> bool {
        id.seq <= self.get(&id.replica)
    }

    /// Pointwise maximum with another vector.
    pub fn merge(&mut self, other: &VersionVector) {
        for (replica, seq) in &other.entries {
            self.observe(*replica, *seq);
        }
    }

    /// True if every entry of `other` is covered by this vector.
    pub fn dominates(&self, other: &VersionVector) -> bool {
        other
            .entries
            .iter()
            .all(|(replica, seq)| self.get(replica) >= *seq)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, &u64)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
