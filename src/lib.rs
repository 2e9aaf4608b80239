//! # quill-collab — Real-time collaborative document synchronization
//!
//! Conflict-free multi-user editing of sequence documents over WebSocket,
//! built on an RGA-style replicated list with tombstones.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐     WebSocket      ┌──────────────────┐
//! │ DocumentSession  │ ◄─────────────────► │ RelayServer      │
//! │ (per document)   │    Binary Proto     │ (central)        │
//! └───────┬──────────┘                     └───────┬──────────┘
//!         │                                        │
//!         ▼                                        ▼
//! ┌──────────────────┐                     ┌──────────────────┐
//! │ ReplicaStore     │                     │ ReplicaStore     │
//! │ + PresenceRegistry│                    │ (log of record)  │
//! └───────┬──────────┘                     └───────┬──────────┘
//!         │                                        │
//!         ▼                                ┌───────┴───────┐
//! ┌──────────────────┐                     │ DocumentRoom  │
//! │ SnapshotStore    │                     │ (fan-out)     │
//! │ (checkpoints)    │                     └───────────────┘
//! └──────────────────┘
//! ```
//!
//! Every replica that applies the same set of operations converges to the
//! same document, regardless of delivery order. Edits always apply
//! locally first; connectivity affects delivery, never placement.
//!
//! ## Modules
//!
//! - [`op`] — Operation model: ids, version vectors, attribute values
//! - [`merge`] — Deterministic integration of concurrent operations
//! - [`replica`] — Per-document replica: local edits, remote merge, log
//! - [`presence`] — Live cursor and participant awareness
//! - [`protocol`] — Binary wire protocol (bincode-encoded WireMessage)
//! - [`session`] — Client session: connect, reconnect, offline queue
//! - [`snapshot`] — Durable checkpoints and the storage boundary
//! - [`broadcast`] — Room-based fan-out with backpressure
//! - [`server`] — WebSocket relay server

pub mod broadcast;
pub mod merge;
pub mod op;
pub mod presence;
pub mod protocol;
pub mod replica;
pub mod server;
pub mod session;
pub mod snapshot;

// Re-exports for convenience
pub use broadcast::{DocumentRoom, RoomDirectory, RoomStats};
pub use merge::{AttrRegister, Item, MergeError};
pub use op::{AttrValue, ItemId, OpId, OpKind, Operation, ReplicaId, VersionVector};
pub use presence::{
    CursorLocation, IdentityProvider, PresenceConfig, PresenceEntry, PresenceRegistry,
    PresenceUpdate,
};
pub use protocol::{
    DocumentKey, MessageKind, PeerProfile, ProtocolError, ResourceKind, WireMessage,
    PROTOCOL_VERSION,
};
pub use replica::{ConvergedState, Edit, RemoteApply, ReplicaError, ReplicaStore};
pub use server::{RelayConfig, RelayServer, RelayStats};
pub use session::{
    ConnectionState, DocumentSession, SessionConfig, SessionEvent, SessionRegistry, UnackedQueue,
};
pub use snapshot::{
    FileStore, MemoryStore, Snapshot, SnapshotConfig, SnapshotCoordinator, SnapshotStore,
    StoreError,
};
