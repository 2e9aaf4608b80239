//! WebSocket relay server with room-based document routing.
//!
//! Architecture:
//! ```text
//! Session A ──┐
//!              ├── Room (DocumentKey) ── ReplicaStore (log of record)
//! Session B ──┘           │
//!                         ├── DocumentRoom (fan-out)
//!                         └── SnapshotStore (optional, on room close)
//! ```
//!
//! Each room keeps an authoritative replica: every accepted operation is
//! merged server-side, so a reconnecting session's handshake version
//! vector is enough to compute exactly the operations it missed. The
//! relay acknowledges accepted batches with a per-replica watermark;
//! presence frames are relayed verbatim and never persisted.
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 3 & 8

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::{DocumentRoom, RoomDirectory};
use crate::op::{ReplicaId, VersionVector};
use crate::presence::PresenceUpdate;
use crate::protocol::{DocumentKey, MessageKind, WireMessage, PROTOCOL_VERSION};
use crate::replica::{RemoteApply, ReplicaStore};
use crate::snapshot::SnapshotStore;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Sessions allowed per document room.
    pub max_sessions_per_room: usize,
    /// Broadcast channel capacity per room.
    pub broadcast_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_sessions_per_room: 100,
            broadcast_capacity: 256,
        }
    }
}

/// Relay-wide counters.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub active_rooms: usize,
}

/// One document's server-side state: the log of record plus fan-out.
struct RoomState {
    replica: Mutex<ReplicaStore>,
    room: Arc<DocumentRoom>,
    /// Version covered by the checkpoint this room was seeded from.
    /// Those operations have no log entries, so joiners not covering
    /// this watermark get a state transfer instead of a gap resend.
    base_version: VersionVector,
}

/// The relay server.
pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RwLock<HashMap<DocumentKey, Arc<RoomState>>>>,
    directory: Arc<RoomDirectory>,
    stats: Arc<RwLock<RelayStats>>,
    store: Option<Arc<dyn SnapshotStore>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let directory = Arc::new(RoomDirectory::new(config.broadcast_capacity));
        let (shutdown_tx, _) = tokio::sync::watch::channel(false);
        Self {
            config,
            rooms: Arc::new(RwLock::new(HashMap::new())),
            directory,
            stats: Arc::new(RwLock::new(RelayStats::default())),
            store: None,
            shutdown_tx,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    /// Relay that seeds rooms from and persists rooms to a snapshot
    /// store when they close.
    pub fn with_store(config: RelayConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let mut server = Self::new(config);
        server.store = Some(store);
        server
    }

    /// Listen and serve until the listener fails or [`shutdown`] fires.
    ///
    /// [`shutdown`]: RelayServer::shutdown
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("relay listening on {}", self.config.bind_addr);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            let accepted = tokio::select! {
                _ = shutdown_rx.changed() => {
                    log::info!("relay on {} shutting down", self.config.bind_addr);
                    return Ok(());
                }
                accepted = listener.accept() => accepted?,
            };
            let (stream, addr) = accepted;
            log::debug!("new TCP connection from {addr}");

            let rooms = Arc::clone(&self.rooms);
            let directory = Arc::clone(&self.directory);
            let stats = Arc::clone(&self.stats);
            let config = self.config.clone();
            let store = self.store.clone();
            let conn_shutdown = self.shutdown_tx.subscribe();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(
                    stream,
                    addr,
                    rooms,
                    directory,
                    stats,
                    config,
                    store,
                    conn_shutdown,
                )
                .await
                {
                    log::error!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Stop accepting and close every open connection; rooms persist
    /// their checkpoints as they drain.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    async fn open_room(
        rooms: &RwLock<HashMap<DocumentKey, Arc<RoomState>>>,
        directory: &RoomDirectory,
        store: &Option<Arc<dyn SnapshotStore>>,
        doc: DocumentKey,
    ) -> Arc<RoomState> {
        {
            let rooms_r = rooms.read().await;
            if let Some(state) = rooms_r.get(&doc) {
                return Arc::clone(state);
            }
        }

        let mut rooms_w = rooms.write().await;
        if let Some(state) = rooms_w.get(&doc) {
            return Arc::clone(state);
        }

        // First open: seed the log of record from the checkpoint, if any.
        let server_replica: ReplicaId = Uuid::new_v4();
        let (replica, base_version) = match store {
            Some(store) => match store.load(&doc) {
                Ok(Some(snapshot)) => {
                    log::info!(
                        "seeded room {doc} from checkpoint ({} items)",
                        snapshot.items.len()
                    );
                    let base = snapshot.version.clone();
                    (ReplicaStore::from_snapshot(server_replica, &snapshot), base)
                }
                Ok(None) => (ReplicaStore::new(server_replica), VersionVector::new()),
                Err(e) => {
                    log::error!("checkpoint load for {doc} failed: {e}; starting empty");
                    (ReplicaStore::new(server_replica), VersionVector::new())
                }
            },
            None => (ReplicaStore::new(server_replica), VersionVector::new()),
        };

        let state = Arc::new(RoomState {
            replica: Mutex::new(replica),
            room: directory.get_or_create(doc).await,
            base_version,
        });
        rooms_w.insert(doc, Arc::clone(&state));
        state
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RwLock<HashMap<DocumentKey, Arc<RoomState>>>>,
        directory: Arc<RoomDirectory>,
        stats: Arc<RwLock<RelayStats>>,
        config: RelayConfig,
        store: Option<Arc<dyn SnapshotStore>>,
        mut shutdown_rx: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Per-connection state, set by the handshake.
        let mut session_id: Option<Uuid> = None;
        let mut doc: Option<DocumentKey> = None;
        let mut room_state: Option<Arc<RoomState>> = None;
        let mut broadcast_rx: Option<tokio::sync::broadcast::Receiver<Arc<Vec<u8>>>> = None;

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    log::info!("closing connection from {addr} (relay shutdown)");
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
                msg = ws_receiver.next() => {
                    let data = match msg {
                        Some(Ok(Message::Binary(data))) => data,
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("connection closed from {addr}");
                            break;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }
                        _ => continue,
                    };
                    let bytes: Vec<u8> = data.into();
                    let wire = match WireMessage::decode(&bytes) {
                        Ok(wire) => wire,
                        Err(e) => {
                            log::warn!("failed to decode frame from {addr}: {e}");
                            continue;
                        }
                    };
                    {
                        let mut s = stats.write().await;
                        s.total_frames += 1;
                        s.total_bytes += bytes.len() as u64;
                    }

                    match wire.kind {
                        MessageKind::Handshake => {
                            let payload = match wire.handshake_payload() {
                                Ok(payload) => payload,
                                Err(e) => {
                                    log::warn!("bad handshake from {addr}: {e}");
                                    break;
                                }
                            };

                            if payload.protocol_version != PROTOCOL_VERSION {
                                log::warn!(
                                    "rejecting {addr}: protocol version {} (ours {})",
                                    payload.protocol_version,
                                    PROTOCOL_VERSION
                                );
                                let reject = WireMessage::error(
                                    Uuid::nil(),
                                    wire.doc,
                                    true,
                                    format!(
                                        "protocol version mismatch: server speaks {PROTOCOL_VERSION}, client speaks {}",
                                        payload.protocol_version
                                    ),
                                )?;
                                ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
                                break;
                            }

                            let state =
                                Self::open_room(&rooms, &directory, &store, wire.doc).await;

                            if state.room.session_count().await >= config.max_sessions_per_room {
                                let reject = WireMessage::error(
                                    Uuid::nil(),
                                    wire.doc,
                                    false,
                                    "room is full",
                                )?;
                                ws_sender.send(Message::Binary(reject.encode()?.into())).await?;
                                break;
                            }

                            session_id = Some(wire.session_id);
                            doc = Some(wire.doc);

                            let rx = state
                                .room
                                .attach(wire.session_id, payload.profile.clone())
                                .await;
                            broadcast_rx = Some(rx);

                            // Seeded rooms hold state with no log entries
                            // behind it; a joiner whose watermark does not
                            // cover the seed gets a state transfer in the
                            // ack instead of a gap resend.
                            let transfer = if payload.acked.dominates(&state.base_version) {
                                None
                            } else {
                                log::info!(
                                    "state transfer to {} for seeded room {}",
                                    wire.session_id,
                                    wire.doc
                                );
                                let snapshot =
                                    state.replica.lock().await.export_snapshot();
                                Some(snapshot.encode()?)
                            };
                            let transferred = transfer.is_some();

                            let ack =
                                WireMessage::handshake_ack(Uuid::nil(), wire.doc, transfer)?;
                            ws_sender.send(Message::Binary(ack.encode()?.into())).await?;

                            // Resend the gap: everything past the client's
                            // acked version vector. A state transfer
                            // already covers the full room state.
                            if !transferred {
                                let gap =
                                    state.replica.lock().await.ops_since(&payload.acked);
                                if !gap.is_empty() {
                                    log::info!(
                                        "resending {} operations to {} for {}",
                                        gap.len(),
                                        wire.session_id,
                                        wire.doc
                                    );
                                    let batch =
                                        WireMessage::op_batch(Uuid::nil(), wire.doc, gap)?;
                                    ws_sender
                                        .send(Message::Binary(batch.encode()?.into()))
                                        .await?;
                                }
                            }

                            room_state = Some(state);
                            {
                                let mut s = stats.write().await;
                                s.active_rooms = rooms.read().await.len();
                            }
                            log::info!(
                                "session {} ({}) joined {}",
                                wire.session_id,
                                payload.profile.name,
                                wire.doc
                            );
                        }

                        MessageKind::OpBatch => {
                            let Some(state) = room_state.as_ref() else { continue };
                            let ops = match wire.op_batch_payload() {
                                Ok(payload) => payload.ops,
                                Err(e) => {
                                    log::warn!("bad op batch from {addr}: {e}");
                                    continue;
                                }
                            };

                            // Merge into the log of record; per-replica
                            // watermarks drive the acks.
                            let mut watermarks: HashMap<ReplicaId, u64> = HashMap::new();
                            {
                                let mut replica = state.replica.lock().await;
                                for op in &ops {
                                    match replica.apply_remote(op.clone()) {
                                        RemoteApply::Applied | RemoteApply::Duplicate => {
                                            let mark =
                                                watermarks.entry(op.id.replica).or_insert(0);
                                            *mark = (*mark).max(op.id.seq);
                                        }
                                        // Not durable yet: the op is parked
                                        // outside the version vector, so a
                                        // close-time checkpoint would drop
                                        // it. The sender keeps it unacked
                                        // and replays on reconnect.
                                        RemoteApply::Deferred => {
                                            log::debug!(
                                                "operation {} parked, ack withheld",
                                                op.id
                                            );
                                        }
                                        RemoteApply::Rejected => {
                                            log::warn!(
                                                "rejected malformed operation {} from {addr}",
                                                op.id
                                            );
                                        }
                                    }
                                }
                            }

                            for (replica_id, seq) in watermarks {
                                let ack =
                                    WireMessage::ack(Uuid::nil(), wire.doc, replica_id, seq)?;
                                ws_sender.send(Message::Binary(ack.encode()?.into())).await?;
                            }

                            // Relay the original frame; subscribers filter
                            // out their own session id.
                            state.room.broadcast_raw(Arc::new(bytes));
                        }

                        MessageKind::PresenceUpdate => {
                            // Relayed, never persisted.
                            let Some(state) = room_state.as_ref() else { continue };
                            log::trace!("presence frame in {}", wire.doc);
                            state.room.broadcast_raw(Arc::new(bytes));
                        }

                        MessageKind::Ping => {
                            let pong = WireMessage::pong(Uuid::nil(), wire.doc);
                            ws_sender.send(Message::Binary(pong.encode()?.into())).await?;
                        }

                        _ => {
                            log::debug!("unhandled message kind {:?} from {addr}", wire.kind);
                        }
                    }
                }

                msg = async {
                    match broadcast_rx.as_mut() {
                        Some(rx) => rx.recv().await,
                        // Not attached yet.
                        None => std::future::pending().await,
                    }
                } => {
                    match msg {
                        Ok(frame) => {
                            if let Ok(wire) = WireMessage::decode(&frame) {
                                if Some(wire.session_id) == session_id {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            // The next handshake's version vector recovers
                            // whatever fell out of the buffer.
                            log::warn!("session {session_id:?} lagged by {n} frames");
                        }
                        Err(_) => break,
                    }
                }
            }
        }

        // Detach, announce departure, and persist-then-drop empty rooms.
        if let (Some(sid), Some(doc), Some(state)) = (session_id, doc, room_state) {
            state.room.detach(&sid).await;

            // Cleanup must run to completion; an encode failure here only
            // costs the goodbye announcement.
            if let Ok(payload) = (PresenceUpdate::Goodbye { session_id: sid }).encode() {
                match WireMessage::presence(sid, doc, payload).encode() {
                    Ok(frame) => {
                        state.room.broadcast_raw(Arc::new(frame));
                    }
                    Err(e) => log::warn!("goodbye for {sid} not broadcast: {e}"),
                }
            }

            if state.room.session_count().await == 0 {
                if let Some(store) = &store {
                    let snapshot = state.replica.lock().await.export_snapshot();
                    match store.save(&doc, &snapshot) {
                        Ok(()) => log::info!("persisted checkpoint for {doc} (room closing)"),
                        Err(e) => log::error!("failed to persist checkpoint for {doc}: {e}"),
                    }
                }
                rooms.write().await.remove(&doc);
                directory.remove_if_empty(&doc).await;
                log::info!("room {doc} removed (empty)");
            }

            let mut s = stats.write().await;
            s.active_connections -= 1;
            s.active_rooms = rooms.read().await.len();
        } else {
            let mut s = stats.write().await;
            s.active_connections -= 1;
        }

        Ok(())
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn directory(&self) -> &Arc<RoomDirectory> {
        &self.directory
    }
}
