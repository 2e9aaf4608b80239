//! Deterministic merge of concurrent operation histories.
//!
//! The engine linearizes an insert tree: every item hangs off the item it
//! was anchored on, and siblings under the same anchor are ordered by
//! descending `(lamport, replica id)`. Lamport timestamps embed the causal
//! partial order (an operation generated after seeing another always has a
//! larger timestamp), so the combined rule is: causal order first, then
//! replica id for concurrent ties — identical on every replica, whatever
//! the arrival order.
//!
//! Conflict rules:
//! - concurrent inserts at one anchor: ordered by the sibling rule above;
//! - delete vs. edit of one item: the delete wins — the edit still lands
//!   in the attribute register but a tombstoned item is never visible;
//! - concurrent writes to one attribute: last writer wins by
//!   `(wall-clock timestamp, replica id)`, not by arrival order.
//!
//! Applying the same set of operations in any order, any number of times,
//! yields the same sequence (commutativity and idempotence).
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::op::{AttrValue, ItemId, OpKind, Operation, ReplicaId};

/// Last-writer-wins register for a single item attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttrRegister {
    pub value: AttrValue,
    /// Wall-clock milliseconds at the writing replica.
    pub timestamp: u64,
    pub writer: ReplicaId,
}

impl AttrRegister {
    /// Whether a write stamped `(timestamp, writer)` supersedes this one.
    pub fn superseded_by(&self, timestamp: u64, writer: ReplicaId) -> bool {
        (timestamp, writer) > (self.timestamp, self.writer)
    }
}

/// One element of the document sequence, tombstones included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    /// Anchor the creating insert was generated against (`None` = head).
    pub anchor: Option<ItemId>,
    /// Lamport timestamp of the creating insert, for sibling ordering.
    pub lamport: u64,
    pub body: String,
    pub attrs: HashMap<String, AttrRegister>,
    /// Logical deletion marker. Tombstoned items stay in the sequence so
    /// concurrent operations referencing them still have a target.
    pub deleted: bool,
}

impl Item {
    pub fn new(id: ItemId, anchor: Option<ItemId>, lamport: u64, body: String) -> Self {
        Self {
            id,
            anchor,
            lamport,
            body,
            attrs: HashMap::new(),
            deleted: false,
        }
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attrs.get(key).map(|r| &r.value)
    }
}

/// Merge failures. A missing reference is not fatal — the caller parks the
/// operation until the referenced item arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeError {
    /// The operation references an item not present in the sequence.
    MissingReference(ItemId),
    /// An item with this id already exists (duplicate insert).
    DuplicateItem(ItemId),
}

impl std::fmt::Display for MergeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MergeError::MissingReference(id) => write!(f, "unknown referenced item {id}"),
            MergeError::DuplicateItem(id) => write!(f, "item {id} already integrated"),
        }
    }
}

impl std::error::Error for MergeError {}

/// Position of an item in the sequence, tombstones included.
fn position_of(items: &[Item], id: &ItemId) -> Option<usize> {
    items.iter().position(|item| item.id == *id)
}

/// Anchor position of an item: index of its anchor, or -1 for head items.
fn anchor_position(items: &[Item], item: &Item) -> i64 {
    match &item.anchor {
        None => -1,
        // Anchors are integrated before their dependents, so this resolves.
        Some(anchor) => position_of(items, anchor).map(|p| p as i64).unwrap_or(-1),
    }
}

/// Sibling ordering: `a` comes earlier in the sequence than `b` when both
/// hang off the same anchor.
fn wins_tiebreak(a_lamport: u64, a_replica: ReplicaId, b_lamport: u64, b_replica: ReplicaId) -> bool {
    (a_lamport, a_replica) > (b_lamport, b_replica)
}

/// Integrate a remote or local insert at its converged position.
///
/// Walks forward from the anchor, skipping earlier siblings and their
/// subtrees, and places the new item where every replica will place it.
pub fn integrate_insert(items: &mut Vec<Item>, op: &Operation) -> Result<usize, MergeError> {
    let (anchor, body) = match &op.kind {
        OpKind::Insert { anchor, body } => (*anchor, body.clone()),
        _ => unreachable!("integrate_insert called with non-insert"),
    };

    if position_of(items, &op.id).is_some() {
        return Err(MergeError::DuplicateItem(op.id));
    }

    let anchor_pos: i64 = match anchor {
        None => -1,
        Some(a) => position_of(items, &a).ok_or(MergeError::MissingReference(a))? as i64,
    };

    // Scan for the insertion point among existing successors of the anchor.
    let mut index = (anchor_pos + 1) as usize;
    while index < items.len() {
        let other = &items[index];
        let other_anchor_pos = anchor_position(items, other);

        if other_anchor_pos < anchor_pos {
            // `other` hangs off something before our anchor: scope ends.
            break;
        }
        if other_anchor_pos == anchor_pos {
            // Same sibling set: earlier siblings (and their subtrees) are
            // the ones that win the tie-break.
            if wins_tiebreak(other.lamport, other.id.replica, op.lamport, op.id.replica) {
                index += 1;
                continue;
            }
            break;
        }
        // Deeper anchor: part of a preceding sibling's subtree, skip.
        index += 1;
    }

    items.insert(index, Item::new(op.id, anchor, op.lamport, body));
    Ok(index)
}

/// Tombstone the target item. Idempotent.
pub fn apply_delete(items: &mut [Item], op: &Operation) -> Result<(), MergeError> {
    let target = match &op.kind {
        OpKind::Delete { target } => *target,
        _ => unreachable!("apply_delete called with non-delete"),
    };
    let pos = position_of(items, &target).ok_or(MergeError::MissingReference(target))?;
    items[pos].deleted = true;
    Ok(())
}

/// Apply an attribute write, last-writer-wins.
///
/// A write that loses the `(timestamp, replica)` comparison is dropped
/// silently; a write to a tombstoned item is stored but never visible.
pub fn apply_set_attr(items: &mut [Item], op: &Operation) -> Result<(), MergeError> {
    let (target, key, value, timestamp) = match &op.kind {
        OpKind::SetAttr {
            target,
            key,
            value,
            timestamp,
        } => (*target, key.clone(), value.clone(), *timestamp),
        _ => unreachable!("apply_set_attr called with non-set-attr"),
    };

    let pos = position_of(items, &target).ok_or(MergeError::MissingReference(target))?;
    let item = &mut items[pos];

    match item.attrs.get(&key) {
        Some(existing) if !existing.superseded_by(timestamp, op.id.replica) => {}
        _ => {
            item.attrs.insert(
                key,
                AttrRegister {
                    value,
                    timestamp,
                    writer: op.id.replica,
                },
            );
        }
    }
    Ok(())
}

/// Apply any operation kind against the sequence.
pub fn apply(items: &mut Vec<Item>, op: &Operation) -> Result<(), MergeError> {
    match &op.kind {
        OpKind::Insert { .. } => integrate_insert(items, op).map(|_| ()),
        OpKind::Delete { .. } => apply_delete(items, op),
        OpKind::SetAttr { .. } => apply_set_attr(items, op),
    }
}
