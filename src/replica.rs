//! One client's local copy of a document: materialized item sequence plus
//! operation history.
//!
//! ```text
//! local edit ──► apply_local ──► Operation ──► transport (broadcast)
//!                     │
//!                     ▼ (optimistic, synchronous)
//!              materialized items
//!                     ▲
//!                     │ merge engine
//! remote op ──► apply_remote ──┘
//! ```
//!
//! `apply_local` never fails visibly beyond addressing errors — the edit is
//! applied before the network ever sees it. `apply_remote` is idempotent:
//! redelivered operations are detected by the version vector and dropped.
//! Operations arriving ahead of their per-replica predecessor, or before
//! the item they reference, are parked and replayed once the gap closes.

use std::collections::{BTreeMap, HashMap};

use crate::merge::{self, Item, MergeError};
use crate::op::{AttrValue, ItemId, OpId, OpKind, Operation, ReplicaId, VersionVector};
use crate::snapshot::Snapshot;

/// A local edit submitted by the rendering collaborator.
///
/// Insertions address live positions (what the user sees); deletions and
/// attribute writes address stable item ids.
#[derive(Debug, Clone, PartialEq)]
pub enum Edit {
    /// Insert a new item so it appears at live index `at`.
    Insert { at: usize, body: String },
    /// Tombstone an item.
    Delete { item: ItemId },
    /// Set one attribute of an item.
    SetAttr {
        item: ItemId,
        key: String,
        value: AttrValue,
    },
}

/// Outcome of feeding a remote operation to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    /// Integrated into the materialized state.
    Applied,
    /// Already seen — no-op.
    Duplicate,
    /// Parked until a sequence gap or missing reference resolves.
    Deferred,
    /// Structurally invalid — dropped.
    Rejected,
}

/// Local edit addressing errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaError {
    IndexOutOfRange { index: usize, len: usize },
    UnknownItem(ItemId),
}

impl std::fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaError::IndexOutOfRange { index, len } => {
                write!(f, "index {index} out of range (live length {len})")
            }
            ReplicaError::UnknownItem(id) => write!(f, "unknown item {id}"),
        }
    }
}

impl std::error::Error for ReplicaError {}

/// A live item as seen by the rendering collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemView {
    pub id: ItemId,
    pub body: String,
    pub attrs: HashMap<String, AttrValue>,
}

/// The materialized sequence of live items.
///
/// Two replicas that have received the same set of operations produce equal
/// converged states, whatever the arrival orders were.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConvergedState {
    pub items: Vec<ItemView>,
}

impl ConvergedState {
    /// Concatenated item bodies, handy for tests and text documents.
    pub fn text(&self) -> String {
        self.items.iter().map(|i| i.body.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// The replica store: item sequence, operation log, and causal bookkeeping.
pub struct ReplicaStore {
    replica: ReplicaId,
    items: Vec<Item>,
    log: Vec<Operation>,
    version: VersionVector,
    /// Lamport clock, advanced past every operation seen.
    lamport: u64,
    next_seq: u64,
    /// Remote operations ahead of their per-replica predecessor.
    gapped: HashMap<ReplicaId, BTreeMap<u64, Operation>>,
    /// Remote operations whose referenced item has not arrived yet.
    orphans: Vec<Operation>,
}

impl ReplicaStore {
    /// Create an empty replica for a new document.
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            items: Vec::new(),
            log: Vec::new(),
            version: VersionVector::new(),
            lamport: 0,
            next_seq: 1,
            gapped: HashMap::new(),
            orphans: Vec::new(),
        }
    }

    /// Seed a replica from a persisted snapshot (bootstrap path).
    ///
    /// The snapshot is a checkpoint, not the full log: the local log starts
    /// empty and any operations past the snapshot's version vector replay
    /// on top through `apply_remote`.
    pub fn from_snapshot(replica: ReplicaId, snapshot: &Snapshot) -> Self {
        let mut store = Self::new(replica);
        store.items = snapshot.items.clone();
        store.version = snapshot.version.clone();
        store.lamport = snapshot.lamport;
        store.next_seq = snapshot.version.get(&replica) + 1;
        store
    }

    pub fn replica_id(&self) -> ReplicaId {
        self.replica
    }

    pub fn version(&self) -> &VersionVector {
        &self.version
    }

    pub fn log(&self) -> &[Operation] {
        &self.log
    }

    /// Full item sequence, tombstones included (snapshot export).
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    pub fn lamport(&self) -> u64 {
        self.lamport
    }

    /// Operations parked on a missing reference or sequence gap.
    pub fn deferred_count(&self) -> usize {
        self.orphans.len() + self.gapped.values().map(|m| m.len()).sum::<usize>()
    }

    /// Export a checkpoint of the current converged state.
    pub fn export_snapshot(&self) -> Snapshot {
        Snapshot {
            items: self.items.clone(),
            version: self.version.clone(),
            lamport: self.lamport,
        }
    }

    /// Fold a checkpoint into an existing replica (late-join state
    /// transfer).
    ///
    /// Items already present keep their state; missing items integrate
    /// through the normal sibling rule, so local concurrent edits keep
    /// their converged positions. Deletion markers and attribute
    /// registers merge item by item, and the checkpoint's version vector
    /// is absorbed so operations it covers are treated as seen.
    pub fn absorb_snapshot(&mut self, snapshot: &Snapshot) {
        for incoming in &snapshot.items {
            match self.items.iter_mut().find(|i| i.id == incoming.id) {
                Some(existing) => {
                    existing.deleted = existing.deleted || incoming.deleted;
                    for (key, reg) in &incoming.attrs {
                        match existing.attrs.get(key) {
                            Some(current)
                                if !current.superseded_by(reg.timestamp, reg.writer) => {}
                            _ => {
                                existing.attrs.insert(key.clone(), reg.clone());
                            }
                        }
                    }
                }
                None => {
                    let op = Operation::new(
                        incoming.id,
                        incoming.lamport,
                        OpKind::Insert {
                            anchor: incoming.anchor,
                            body: incoming.body.clone(),
                        },
                    );
                    // Snapshot items come in document order, so anchors
                    // resolve before their dependents.
                    match merge::integrate_insert(&mut self.items, &op) {
                        Ok(index) => {
                            self.items[index].deleted = incoming.deleted;
                            self.items[index].attrs = incoming.attrs.clone();
                        }
                        Err(e) => {
                            log::warn!("checkpoint item {} not integrated: {e}", incoming.id);
                        }
                    }
                }
            }
        }
        self.version.merge(&snapshot.version);
        self.lamport = self.lamport.max(snapshot.lamport);
        self.drain_parked();
    }

    /// Stable id of the live item at `index`.
    pub fn item_at(&self, index: usize) -> Option<ItemId> {
        self.items
            .iter()
            .filter(|i| !i.deleted)
            .nth(index)
            .map(|i| i.id)
    }

    /// Apply a local edit optimistically and return the operation to
    /// transmit.
    ///
    /// The materialized state is mutated before this returns; the caller
    /// hands the operation to the transport session for broadcast.
    pub fn apply_local(&mut self, edit: Edit) -> Result<Operation, ReplicaError> {
        let kind = match edit {
            Edit::Insert { at, body } => {
                let anchor = self.anchor_for_live_index(at)?;
                OpKind::Insert { anchor, body }
            }
            Edit::Delete { item } => {
                if !self.contains_item(&item) {
                    return Err(ReplicaError::UnknownItem(item));
                }
                OpKind::Delete { target: item }
            }
            Edit::SetAttr { item, key, value } => {
                if !self.contains_item(&item) {
                    return Err(ReplicaError::UnknownItem(item));
                }
                OpKind::SetAttr {
                    target: item,
                    key,
                    value,
                    timestamp: wall_clock_millis(),
                }
            }
        };

        self.lamport += 1;
        let op = Operation::new(OpId::new(self.replica, self.next_seq), self.lamport, kind);
        self.next_seq += 1;

        // Local ops always integrate: the anchor was just resolved against
        // the live state and the id is fresh.
        merge::apply(&mut self.items, &op).expect("local operation must integrate");
        self.version.observe(op.id.replica, op.id.seq);
        self.log.push(op.clone());
        Ok(op)
    }

    /// Feed one remote operation through the merge engine.
    ///
    /// Idempotent under redelivery and tolerant of arbitrary cross-replica
    /// interleaving. Never panics on malformed input — a structurally
    /// invalid operation is dropped with a protocol warning.
    pub fn apply_remote(&mut self, op: Operation) -> RemoteApply {
        if !op.is_well_formed() {
            log::warn!("dropping malformed operation {}", op.id);
            return RemoteApply::Rejected;
        }
        if self.version.contains(&op.id) {
            log::trace!("duplicate operation {} ignored", op.id);
            return RemoteApply::Duplicate;
        }

        let expected = self.version.get(&op.id.replica) + 1;
        if op.id.seq > expected {
            log::debug!(
                "operation {} ahead of watermark (expected seq {expected}), parking",
                op.id
            );
            self.gapped
                .entry(op.id.replica)
                .or_default()
                .insert(op.id.seq, op);
            return RemoteApply::Deferred;
        }

        let outcome = self.integrate(op);
        if outcome == RemoteApply::Applied {
            self.drain_parked();
        }
        outcome
    }

    /// Operations in the local log past the given watermark, in generation
    /// order per replica (replay / gap-resend path).
    pub fn ops_since(&self, since: &VersionVector) -> Vec<Operation> {
        self.log
            .iter()
            .filter(|op| !since.contains(&op.id))
            .cloned()
            .collect()
    }

    /// Materialize the live sequence.
    pub fn current_state(&self) -> ConvergedState {
        ConvergedState {
            items: self
                .items
                .iter()
                .filter(|i| !i.deleted)
                .map(|i| ItemView {
                    id: i.id,
                    body: i.body.clone(),
                    attrs: i
                        .attrs
                        .iter()
                        .map(|(k, reg)| (k.clone(), reg.value.clone()))
                        .collect(),
                })
                .collect(),
        }
    }

    fn contains_item(&self, id: &ItemId) -> bool {
        self.items.iter().any(|i| i.id == *id)
    }

    /// Anchor for inserting at live index `at`: the live predecessor, or
    /// `None` when inserting at the head.
    fn anchor_for_live_index(&self, at: usize) -> Result<Option<ItemId>, ReplicaError> {
        let live_len = self.items.iter().filter(|i| !i.deleted).count();
        if at > live_len {
            return Err(ReplicaError::IndexOutOfRange {
                index: at,
                len: live_len,
            });
        }
        if at == 0 {
            return Ok(None);
        }
        Ok(self.item_at(at - 1))
    }

    fn integrate(&mut self, op: Operation) -> RemoteApply {
        self.lamport = self.lamport.max(op.lamport);
        match merge::apply(&mut self.items, &op) {
            Ok(()) => {
                self.version.observe(op.id.replica, op.id.seq);
                self.log.push(op);
                RemoteApply::Applied
            }
            Err(MergeError::MissingReference(missing)) => {
                // Redelivery of an op already parked here must not park a
                // second copy.
                if self.orphans.iter().any(|parked| parked.id == op.id) {
                    log::trace!("operation {} already parked, ignoring redelivery", op.id);
                    return RemoteApply::Deferred;
                }
                log::debug!("operation {} references unseen item {missing}, parking", op.id);
                self.orphans.push(op);
                RemoteApply::Deferred
            }
            Err(MergeError::DuplicateItem(_)) => {
                // Item present from a snapshot seed; mark the id as seen.
                self.version.observe(op.id.replica, op.id.seq);
                RemoteApply::Duplicate
            }
        }
    }

    /// Replay parked operations until no further progress is possible.
    fn drain_parked(&mut self) {
        loop {
            let mut progressed = false;

            // Orphans whose reference has arrived.
            let orphans = std::mem::take(&mut self.orphans);
            for op in orphans {
                let resolvable = op
                    .reference()
                    .map(|r| self.contains_item(&r))
                    .unwrap_or(true);
                if !resolvable {
                    self.orphans.push(op);
                    continue;
                }
                if self.integrate(op) == RemoteApply::Applied {
                    progressed = true;
                }
            }

            // Gapped ops that are now contiguous.
            let replicas: Vec<ReplicaId> = self.gapped.keys().copied().collect();
            for replica in replicas {
                loop {
                    let next = self.version.get(&replica) + 1;
                    let op = match self.gapped.get_mut(&replica).and_then(|m| m.remove(&next)) {
                        Some(op) => op,
                        None => break,
                    };
                    if self.integrate(op) != RemoteApply::Applied {
                        break;
                    }
                    progressed = true;
                }
                if self.gapped.get(&replica).is_some_and(|m| m.is_empty()) {
                    self.gapped.remove(&replica);
                }
            }

            if !progressed {
                break;
            }
        }
    }
}

fn wall_clock_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
