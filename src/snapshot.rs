//! Snapshot coordinator: periodic durable checkpoints of converged state.
//!
//! Snapshots are an optimization, never the source of truth — the
//! operation log always wins. A checkpoint captures the full item
//! sequence (tombstones included), the version vector it covers, and the
//! lamport high-water mark, so a cold start seeds from the checkpoint and
//! replays only newer operations on top.
//!
//! ```text
//! ReplicaStore ──export──► Snapshot ──lz4 + bincode──► SnapshotStore
//!      ▲                                                    │
//!      └───────────── bootstrap (seed + replay) ◄───────────┘
//! ```
//!
//! Storage is a collaborator boundary: the engine talks to a
//! [`SnapshotStore`] trait and ships a file-backed and an in-memory
//! implementation. Write failures are retried in the background and never
//! disturb in-memory document state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::merge::Item;
use crate::op::VersionVector;
use crate::protocol::DocumentKey;

/// A durable checkpoint of one document's converged state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Full item sequence in document order, tombstones included.
    pub items: Vec<Item>,
    /// Every operation folded into `items`.
    pub version: VersionVector,
    /// Lamport high-water mark at checkpoint time.
    pub lamport: u64,
}

impl Snapshot {
    /// Serialize and lz4-compress for storage.
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        let (snapshot, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        Ok(snapshot)
    }

    pub fn live_item_count(&self) -> usize {
        self.items.iter().filter(|i| !i.deleted).count()
    }
}

/// Snapshot storage failure.
#[derive(Debug, Clone)]
pub enum StoreError {
    Io(String),
    Serialization(String),
    /// Stored bytes that no longer decode. Treated as fatal on load —
    /// never silently discarded.
    Corrupt(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "Snapshot I/O error: {e}"),
            StoreError::Serialization(e) => write!(f, "Snapshot serialization error: {e}"),
            StoreError::Corrupt(e) => write!(f, "Snapshot corrupt: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Durable storage boundary. The engine owns the schedule; the store
/// owns the bytes.
pub trait SnapshotStore: Send + Sync {
    fn load(&self, doc: &DocumentKey) -> Result<Option<Snapshot>, StoreError>;
    fn save(&self, doc: &DocumentKey, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// In-memory store for tests and ephemeral embedders.
///
/// Stores encoded bytes so the codec path is exercised. Supports
/// injected transient failures for retry tests.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<DocumentKey, Vec<u8>>>,
    fail_saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` saves fail with an I/O error.
    pub fn fail_next_saves(&self, n: usize) {
        self.fail_saves.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SnapshotStore for MemoryStore {
    fn load(&self, doc: &DocumentKey) -> Result<Option<Snapshot>, StoreError> {
        match self.entries.lock().unwrap().get(doc) {
            Some(bytes) => Ok(Some(Snapshot::decode(bytes)?)),
            None => Ok(None),
        }
    }

    fn save(&self, doc: &DocumentKey, snapshot: &Snapshot) -> Result<(), StoreError> {
        let remaining = self.fail_saves.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_saves.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Io("injected save failure".into()));
        }
        self.entries
            .lock()
            .unwrap()
            .insert(*doc, snapshot.encode()?);
        Ok(())
    }
}

/// One compressed file per document under a root directory.
///
/// Writes go through a temp file and rename so a crash mid-write leaves
/// the previous checkpoint intact.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, doc: &DocumentKey) -> PathBuf {
        self.root
            .join(format!("{}-{}.snap", doc.kind.as_str(), doc.id))
    }
}

impl SnapshotStore for FileStore {
    fn load(&self, doc: &DocumentKey) -> Result<Option<Snapshot>, StoreError> {
        let path = self.path_for(doc);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Snapshot::decode(&bytes)?))
    }

    fn save(&self, doc: &DocumentKey, snapshot: &Snapshot) -> Result<(), StoreError> {
        let path = self.path_for(doc);
        let tmp = path.with_extension("snap.tmp");
        std::fs::write(&tmp, snapshot.encode()?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Checkpoint cadence knobs.
#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    /// Wall-clock interval between checkpoints.
    pub interval: Duration,
    /// Checkpoint early once this many operations accumulate.
    pub op_threshold: u64,
    /// Failed writes retry this many times before giving up until the
    /// next cycle.
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            op_threshold: 500,
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

impl SnapshotConfig {
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(50),
            op_threshold: 5,
            max_retries: 2,
            retry_backoff: Duration::from_millis(1),
        }
    }
}

/// Decides when to checkpoint and pushes writes to the store.
///
/// The coordinator tracks operations applied since the last successful
/// checkpoint; either the wall-clock interval or the op threshold
/// triggers a write. One coordinator per open document.
pub struct SnapshotCoordinator {
    doc: DocumentKey,
    store: Arc<dyn SnapshotStore>,
    config: SnapshotConfig,
    last_checkpoint: Instant,
    /// Shared with detached write tasks so a failed write hands its
    /// operations back to the next cycle.
    ops_since_checkpoint: Arc<AtomicU64>,
}

impl SnapshotCoordinator {
    pub fn new(doc: DocumentKey, store: Arc<dyn SnapshotStore>, config: SnapshotConfig) -> Self {
        Self {
            doc,
            store,
            config,
            last_checkpoint: Instant::now(),
            ops_since_checkpoint: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Load the checkpoint to seed a cold start. `None` means fresh
    /// document; corruption surfaces as an error.
    pub fn bootstrap(&self) -> Result<Option<Snapshot>, StoreError> {
        self.store.load(&self.doc)
    }

    /// Note operations applied to the replica since the last call.
    pub fn record_ops(&mut self, count: u64) {
        self.ops_since_checkpoint.fetch_add(count, Ordering::SeqCst);
    }

    /// A checkpoint is due when there is anything new to persist and
    /// either trigger fires.
    pub fn checkpoint_due(&self) -> bool {
        let pending = self.ops_since_checkpoint.load(Ordering::SeqCst);
        pending > 0
            && (pending >= self.config.op_threshold
                || self.last_checkpoint.elapsed() >= self.config.interval)
    }

    /// Write a checkpoint now, retrying transient failures inline. A
    /// checkpoint that still fails after retries is logged and dropped;
    /// the next cycle will carry the same operations.
    pub fn checkpoint(&mut self, snapshot: &Snapshot) -> Result<(), StoreError> {
        match save_with_retries(self.store.as_ref(), &self.doc, snapshot, &self.config) {
            Ok(()) => {
                log::debug!(
                    "checkpointed {} ({} items)",
                    self.doc,
                    snapshot.items.len()
                );
                self.last_checkpoint = Instant::now();
                self.ops_since_checkpoint.store(0, Ordering::SeqCst);
                Ok(())
            }
            Err(e) => {
                log::error!("checkpoint for {} abandoned after retries: {e}", self.doc);
                Err(e)
            }
        }
    }

    /// Checkpoint if due. The write, including its retry backoff, runs on
    /// a detached blocking task, so a failing or slow store never stalls
    /// the caller; the task also outlives the session that scheduled it.
    /// A write that still fails hands its operation count back for the
    /// next cycle.
    pub fn maybe_checkpoint(&mut self, snapshot: Snapshot) {
        if !self.checkpoint_due() {
            return;
        }
        let pending = self.ops_since_checkpoint.swap(0, Ordering::SeqCst);
        self.last_checkpoint = Instant::now();

        let store = Arc::clone(&self.store);
        let doc = self.doc;
        let config = self.config.clone();
        let counter = Arc::clone(&self.ops_since_checkpoint);
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || {
                save_with_retries(store.as_ref(), &doc, &snapshot, &config)
            })
            .await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    log::error!("checkpoint for {doc} abandoned after retries: {e}");
                    counter.fetch_add(pending, Ordering::SeqCst);
                }
                Err(e) => {
                    log::error!("checkpoint task for {doc} panicked: {e}");
                    counter.fetch_add(pending, Ordering::SeqCst);
                }
            }
        });
    }
}

fn save_with_retries(
    store: &dyn SnapshotStore,
    doc: &DocumentKey,
    snapshot: &Snapshot,
    config: &SnapshotConfig,
) -> Result<(), StoreError> {
    let mut attempt = 0;
    loop {
        match store.save(doc, snapshot) {
            Ok(()) => return Ok(()),
            Err(e) if attempt < config.max_retries => {
                attempt += 1;
                log::warn!("checkpoint write for {doc} failed (attempt {attempt}): {e}");
                std::thread::sleep(config.retry_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}
