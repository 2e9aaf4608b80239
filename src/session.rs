//! Transport session: one document's connection to the relay server.
//!
//! A session owns the replica, the presence registry, and the WebSocket
//! lifecycle for a single open document:
//!
//! ```text
//!            edits / cursor moves
//!                    │
//!                    ▼
//! DocumentSession ── replica + presence + unacked queue
//!      │ connect / reconnect (exp. backoff) / heartbeat
//!      ▼
//! relay server ◄── WireMessage frames ──► events to the embedder
//! ```
//!
//! Offline behavior: local edits always apply immediately and queue as
//! unacknowledged operations; reconnection handshakes carry the acked
//! version vector so the server resends only the gap, and the session
//! replays its own unacked operations. Placement never depends on
//! connectivity — only delivery does.
//!
//! A fatal server error (protocol version mismatch) parks the session in
//! [`ConnectionState::Failed`]; automatic reconnection stops until the
//! embedder calls [`DocumentSession::retry`].
//!
//! Reference: Kleppmann, Chapter 5 — Replication

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, SinkExt, StreamExt};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use uuid::Uuid;

use crate::op::Operation;
use crate::presence::{
    CursorLocation, PresenceConfig, PresenceEntry, PresenceRegistry, PresenceUpdate,
};
use crate::protocol::{DocumentKey, PeerProfile, ProtocolError, WireMessage, PROTOCOL_VERSION};
use crate::replica::{ConvergedState, Edit, RemoteApply, ReplicaError, ReplicaStore};
use crate::snapshot::{Snapshot, SnapshotConfig, SnapshotCoordinator, SnapshotStore, StoreError};

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or explicitly closed.
    Idle,
    Connecting,
    /// Handshake complete, live sync.
    Synced,
    /// Connection lost; reconnecting with backoff.
    Disconnected,
    /// Fatal error. No automatic reconnection until `retry()`.
    Failed,
}

/// Events emitted to the embedder.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(ConnectionState),
    /// Remote operations merged into the document.
    RemoteOps { applied: usize, deferred: usize },
    PresenceChanged,
    /// Terminal failure; the message comes from the server or transport.
    FatalError(String),
}

/// Session timing and capacity knobs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub presence_sweep_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Reconnect attempts before parking in `Failed`.
    pub max_reconnect_attempts: u32,
    /// Unacknowledged operations held while offline.
    pub max_unacked: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            presence_sweep_interval: Duration::from_secs(5),
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            max_reconnect_attempts: 10,
            max_unacked: 10_000,
        }
    }
}

impl SessionConfig {
    /// Tight timings for tests.
    pub fn for_testing() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_millis(50),
            presence_sweep_interval: Duration::from_millis(20),
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(100),
            max_reconnect_attempts: 3,
            max_unacked: 1_000,
        }
    }
}

/// Operations sent (or generated offline) but not yet acknowledged by
/// the server. Pruned by ack watermark, replayed on reconnect.
pub struct UnackedQueue {
    queue: VecDeque<Operation>,
    max_size: usize,
}

impl UnackedQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// False when full; the caller surfaces backpressure to the embedder.
    pub fn push(&mut self, op: Operation) -> bool {
        if self.queue.len() >= self.max_size {
            return false;
        }
        self.queue.push_back(op);
        true
    }

    /// Drop everything the watermark covers.
    pub fn prune(&mut self, replica: crate::op::ReplicaId, seq: u64) {
        self.queue
            .retain(|op| op.id.replica != replica || op.id.seq > seq);
    }

    /// Snapshot of pending operations for replay, oldest first.
    pub fn pending(&self) -> Vec<Operation> {
        self.queue.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

struct Shared {
    session_id: Uuid,
    doc: DocumentKey,
    server_url: String,
    config: SessionConfig,
    replica: Mutex<ReplicaStore>,
    presence: Mutex<PresenceRegistry>,
    state: RwLock<ConnectionState>,
    unacked: Mutex<UnackedQueue>,
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    event_tx: mpsc::Sender<SessionEvent>,
    shutdown_rx: watch::Receiver<bool>,
    /// Cancellation for the current connection's tasks; replaced on
    /// every successful dial so stale heartbeat and sweep loops die
    /// with the connection that spawned them.
    conn_stop: Mutex<Option<watch::Sender<bool>>>,
    snapshots: Option<Mutex<SnapshotCoordinator>>,
}

/// One shared session per open document.
pub struct DocumentSession {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    event_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
}

impl DocumentSession {
    /// Session with no durable storage (relay-only sync).
    pub fn new(
        doc: DocumentKey,
        profile: PeerProfile,
        server_url: impl Into<String>,
        config: SessionConfig,
    ) -> Self {
        Self::build(doc, profile, server_url.into(), config, None, None)
    }

    /// Session that bootstraps from and checkpoints to a snapshot store.
    pub fn with_store(
        doc: DocumentKey,
        profile: PeerProfile,
        server_url: impl Into<String>,
        config: SessionConfig,
        store: Arc<dyn SnapshotStore>,
        snapshot_config: SnapshotConfig,
    ) -> Result<Self, StoreError> {
        let coordinator = SnapshotCoordinator::new(doc, store, snapshot_config);
        let seed = coordinator.bootstrap()?;
        Ok(Self::build(
            doc,
            profile,
            server_url.into(),
            config,
            Some(coordinator),
            seed,
        ))
    }

    fn build(
        doc: DocumentKey,
        profile: PeerProfile,
        server_url: String,
        config: SessionConfig,
        coordinator: Option<SnapshotCoordinator>,
        seed: Option<Snapshot>,
    ) -> Self {
        let session_id = Uuid::new_v4();
        let replica_id = Uuid::new_v4();
        let replica = match &seed {
            Some(snapshot) => {
                log::info!(
                    "bootstrapping {doc} from checkpoint ({} items)",
                    snapshot.items.len()
                );
                ReplicaStore::from_snapshot(replica_id, snapshot)
            }
            None => ReplicaStore::new(replica_id),
        };
        let presence = PresenceRegistry::new(session_id, profile, PresenceConfig::default());
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let max_unacked = config.max_unacked;

        Self {
            shared: Arc::new(Shared {
                session_id,
                doc,
                server_url,
                config,
                replica: Mutex::new(replica),
                presence: Mutex::new(presence),
                state: RwLock::new(ConnectionState::Idle),
                unacked: Mutex::new(UnackedQueue::new(max_unacked)),
                outgoing: RwLock::new(None),
                event_tx,
                shutdown_rx,
                conn_stop: Mutex::new(None),
                snapshots: coordinator.map(Mutex::new),
            }),
            shutdown_tx,
            event_rx: Mutex::new(Some(event_rx)),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    pub fn doc(&self) -> DocumentKey {
        self.shared.doc
    }

    /// Take the event receiver. Can only be taken once.
    pub async fn take_event_rx(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.lock().await.take()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// The converged document as the rendering collaborator consumes it.
    pub async fn current_state(&self) -> ConvergedState {
        self.shared.replica.lock().await.current_state()
    }

    pub async fn text(&self) -> String {
        self.current_state().await.text()
    }

    pub async fn unacked_len(&self) -> usize {
        self.shared.unacked.lock().await.len()
    }

    /// Live user list, local entry first.
    pub async fn roster(&self) -> Vec<PresenceEntry> {
        self.shared.presence.lock().await.roster()
    }

    /// Subscribe to roster changes.
    pub async fn subscribe_roster(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.shared.presence.lock().await.subscribe()
    }

    /// Apply a local edit. Always succeeds locally regardless of
    /// connectivity; the resulting operation ships now or on reconnect.
    pub async fn edit(&self, edit: Edit) -> Result<Operation, ReplicaError> {
        let op = self.shared.replica.lock().await.apply_local(edit)?;

        {
            let mut unacked = self.shared.unacked.lock().await;
            if !unacked.push(op.clone()) {
                log::warn!(
                    "unacked queue full for {}; operation held only in the local log",
                    self.shared.doc
                );
            }
        }

        if let Some(snapshots) = &self.shared.snapshots {
            let mut coordinator = snapshots.lock().await;
            coordinator.record_ops(1);
            if coordinator.checkpoint_due() {
                let snapshot = self.shared.replica.lock().await.export_snapshot();
                // Detached write; the edit path never waits on the store.
                coordinator.maybe_checkpoint(snapshot);
            }
        }

        if *self.shared.state.read().await == ConnectionState::Synced {
            let msg = WireMessage::op_batch(self.shared.session_id, self.shared.doc, vec![op.clone()]);
            match msg {
                Ok(msg) => self.shared.send(msg).await,
                Err(e) => log::error!("failed to encode op batch: {e}"),
            }
        }

        Ok(op)
    }

    /// Move the local cursor. Broadcast is rate-limited; cursor updates
    /// are dropped while offline, never queued.
    pub async fn update_cursor(&self, cursor: CursorLocation) {
        let update = self
            .shared
            .presence
            .lock()
            .await
            .update_local_cursor(cursor);

        if *self.shared.state.read().await != ConnectionState::Synced {
            return;
        }
        if let Some(update) = update {
            self.shared.send_presence(update).await;
        }
    }

    /// Dial the server and handshake. On success spawns the reader,
    /// heartbeat, and presence-sweep tasks.
    pub async fn connect(&self) -> Result<(), ProtocolError> {
        Shared::connect_once(&self.shared).await
    }

    /// Clear a `Failed` state and reconnect.
    pub async fn retry(&self) -> Result<(), ProtocolError> {
        {
            let mut state = self.shared.state.write().await;
            if *state == ConnectionState::Failed {
                *state = ConnectionState::Idle;
            }
        }
        self.connect().await
    }

    /// Announce departure and stop all background tasks. Idempotent.
    pub async fn close(&self) {
        let goodbye = self.shared.presence.lock().await.goodbye();
        if *self.shared.state.read().await == ConnectionState::Synced {
            self.shared.send_presence(goodbye).await;
        }
        let _ = self.shutdown_tx.send(true);
        *self.shared.outgoing.write().await = None;
        self.shared.set_state(ConnectionState::Idle).await;
    }
}

impl Shared {
    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().await;
        if *state == next {
            return;
        }
        log::debug!("session {} for {}: {:?} -> {next:?}", self.session_id, self.doc, *state);
        *state = next;
        drop(state);
        let _ = self.event_tx.send(SessionEvent::StateChanged(next)).await;
    }

    async fn send(&self, msg: WireMessage) {
        let encoded = match msg.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::error!("failed to encode wire message: {e}");
                return;
            }
        };
        if let Some(tx) = self.outgoing.read().await.as_ref() {
            let _ = tx.send(encoded).await;
        }
    }

    async fn send_presence(&self, update: PresenceUpdate) {
        match update.encode() {
            Ok(payload) => {
                self.send(WireMessage::presence(self.session_id, self.doc, payload))
                    .await
            }
            Err(e) => log::error!("failed to encode presence update: {e}"),
        }
    }

    async fn connect_once(shared: &Arc<Self>) -> Result<(), ProtocolError> {
        {
            // A live or in-flight connection must not be stacked with a
            // second reader.
            let mut state = shared.state.write().await;
            if matches!(
                *state,
                ConnectionState::Synced | ConnectionState::Connecting
            ) {
                log::debug!("connect for {} ignored ({:?})", shared.doc, *state);
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        let _ = shared
            .event_tx
            .send(SessionEvent::StateChanged(ConnectionState::Connecting))
            .await;

        let url = format!("{}/{}", shared.server_url, shared.doc);
        let (ws_stream, _) = match tokio_tungstenite::connect_async(&url).await {
            Ok(ok) => ok,
            Err(e) => {
                log::warn!("connection to {url} failed: {e}");
                shared.set_state(ConnectionState::Disconnected).await;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task owns the sink; dropping the channel ends it.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        *shared.outgoing.write().await = Some(out_tx);

        // Handshake carries the acked version vector: the server resends
        // only the gap.
        let (replica_id, acked) = {
            let replica = shared.replica.lock().await;
            (replica.replica_id(), replica.version().clone())
        };
        let profile = shared.presence.lock().await.local_profile().clone();
        let handshake =
            WireMessage::handshake(shared.session_id, shared.doc, replica_id, profile, acked)?;
        shared.send(handshake).await;

        // Wait for the ack (or a fatal rejection) before going live.
        let ack = match tokio::time::timeout(
            shared.config.handshake_timeout,
            Self::await_handshake_ack(shared, &mut ws_reader),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                shared.set_state(ConnectionState::Disconnected).await;
                return Err(ProtocolError::Timeout);
            }
        };

        if let Err(e) = ack {
            match &e {
                ProtocolError::VersionMismatch { .. } => {
                    shared.set_state(ConnectionState::Failed).await;
                    let _ = shared
                        .event_tx
                        .send(SessionEvent::FatalError(e.to_string()))
                        .await;
                }
                _ => shared.set_state(ConnectionState::Disconnected).await,
            }
            return Err(e);
        }

        shared.set_state(ConnectionState::Synced).await;

        // Replay operations the server never acknowledged.
        let pending = shared.unacked.lock().await.pending();
        if !pending.is_empty() {
            log::info!(
                "replaying {} unacked operations for {}",
                pending.len(),
                shared.doc
            );
            if let Ok(msg) = WireMessage::op_batch(shared.session_id, shared.doc, pending) {
                shared.send(msg).await;
            }
        }

        let hello = shared.presence.lock().await.hello();
        shared.send_presence(hello).await;

        // Fresh cancellation token for this connection's tasks; any
        // survivors of the previous connection die now.
        let (stop_tx, stop_rx) = watch::channel(false);
        if let Some(old) = shared.conn_stop.lock().await.replace(stop_tx) {
            let _ = old.send(true);
        }

        tokio::spawn(Self::reader_loop(
            Arc::clone(shared),
            ws_reader,
            stop_rx.clone(),
        ));
        tokio::spawn(Self::heartbeat_loop(Arc::clone(shared), stop_rx.clone()));
        tokio::spawn(Self::presence_sweep_loop(Arc::clone(shared), stop_rx));

        Ok(())
    }

    /// Boxed edge for the reconnect task. `reconnect_loop` awaits
    /// `connect_once`, which spawns `reader_loop`, which spawns
    /// `reconnect_loop` again; boxing here gives the cycle a nameable
    /// future type the spawner can prove `Send`.
    fn connect_once_boxed(shared: Arc<Self>) -> BoxFuture<'static, Result<(), ProtocolError>> {
        async move { Self::connect_once(&shared).await }.boxed()
    }

    async fn await_handshake_ack<S>(shared: &Arc<Self>, ws_reader: &mut S) -> Result<(), ProtocolError>
    where
        S: StreamExt<Item = Result<tokio_tungstenite::tungstenite::Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        while let Some(msg) = ws_reader.next().await {
            let data = match msg {
                Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => data,
                Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                _ => continue,
            };
            let bytes: Vec<u8> = data.into();
            let wire = WireMessage::decode(&bytes)?;
            match wire.kind {
                crate::protocol::MessageKind::HandshakeAck => {
                    let payload = wire.handshake_ack_payload()?;
                    if payload.protocol_version != PROTOCOL_VERSION {
                        return Err(ProtocolError::VersionMismatch {
                            ours: PROTOCOL_VERSION,
                            theirs: payload.protocol_version,
                        });
                    }
                    // A seeded room transfers state the relay cannot
                    // resend as operations.
                    if let Some(bytes) = payload.snapshot {
                        let snapshot = Snapshot::decode(&bytes).map_err(|e| {
                            ProtocolError::DeserializationError(e.to_string())
                        })?;
                        shared.replica.lock().await.absorb_snapshot(&snapshot);
                    }
                    return Ok(());
                }
                crate::protocol::MessageKind::Error => {
                    let payload = wire.error_payload()?;
                    if payload.fatal {
                        // The only fatal handshake rejection is a version
                        // mismatch; surface it as such.
                        return Err(ProtocolError::VersionMismatch {
                            ours: PROTOCOL_VERSION,
                            theirs: 0,
                        });
                    }
                    return Err(ProtocolError::ConnectionClosed);
                }
                // Anything else before the ack is a protocol violation.
                _ => return Err(ProtocolError::InvalidMessageKind),
            }
        }
        Err(ProtocolError::ConnectionClosed)
    }

    async fn reader_loop<S>(shared: Arc<Self>, mut ws_reader: S, mut stop_rx: watch::Receiver<bool>)
    where
        S: StreamExt<Item = Result<tokio_tungstenite::tungstenite::Message, tokio_tungstenite::tungstenite::Error>>
            + Unpin,
    {
        let mut shutdown = shared.shutdown_rx.clone();
        loop {
            let msg = tokio::select! {
                _ = shutdown.changed() => break,
                _ = stop_rx.changed() => break,
                msg = ws_reader.next() => msg,
            };
            let data = match msg {
                Some(Ok(tokio_tungstenite::tungstenite::Message::Binary(data))) => data,
                Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_)))
                | Some(Err(_))
                | None => break,
                Some(Ok(_)) => continue,
            };
            let bytes: Vec<u8> = data.into();
            match WireMessage::decode(&bytes) {
                Ok(wire) => shared.handle_message(wire).await,
                Err(e) => log::warn!("dropping undecodable frame: {e}"),
            }
            if *shared.state.read().await == ConnectionState::Failed {
                break;
            }
        }

        // This connection is over; take its heartbeat and sweep tasks
        // down with it, unless a newer connection already replaced them.
        let superseded = *stop_rx.borrow();
        if !superseded {
            if let Some(stop) = shared.conn_stop.lock().await.as_ref() {
                let _ = stop.send(true);
            }
        }

        // Back off and redial unless shutting down, superseded, or
        // parked in Failed.
        if superseded || *shared.shutdown_rx.borrow() {
            return;
        }
        if *shared.state.read().await == ConnectionState::Failed {
            return;
        }
        shared.set_state(ConnectionState::Disconnected).await;
        tokio::spawn(Self::reconnect_loop(shared));
    }

    async fn handle_message(&self, wire: WireMessage) {
        match wire.kind {
            crate::protocol::MessageKind::OpBatch => {
                let ops = match wire.op_batch_payload() {
                    Ok(payload) => payload.ops,
                    Err(e) => {
                        log::warn!("bad op batch: {e}");
                        return;
                    }
                };
                let (applied, deferred, snapshot) = {
                    let mut replica = self.replica.lock().await;
                    let mut applied = 0;
                    let mut deferred = 0;
                    for op in ops {
                        match replica.apply_remote(op) {
                            RemoteApply::Applied => applied += 1,
                            RemoteApply::Deferred => deferred += 1,
                            RemoteApply::Duplicate | RemoteApply::Rejected => {}
                        }
                    }
                    (applied, deferred, replica.export_snapshot())
                };
                if applied > 0 || deferred > 0 {
                    let _ = self
                        .event_tx
                        .send(SessionEvent::RemoteOps { applied, deferred })
                        .await;
                }
                if let Some(snapshots) = &self.snapshots {
                    let mut coordinator = snapshots.lock().await;
                    coordinator.record_ops(applied as u64);
                    coordinator.maybe_checkpoint(snapshot);
                }
            }
            crate::protocol::MessageKind::Ack => {
                if let Ok(payload) = wire.ack_payload() {
                    self.unacked.lock().await.prune(payload.replica, payload.seq);
                }
            }
            crate::protocol::MessageKind::PresenceUpdate => {
                match PresenceUpdate::decode(&wire.payload) {
                    Ok(update) => {
                        self.presence.lock().await.handle_update(update);
                        let _ = self.event_tx.send(SessionEvent::PresenceChanged).await;
                    }
                    Err(e) => log::warn!("bad presence update: {e}"),
                }
            }
            crate::protocol::MessageKind::Ping => {
                self.send(WireMessage::pong(self.session_id, self.doc)).await;
            }
            crate::protocol::MessageKind::Pong => {}
            crate::protocol::MessageKind::Error => {
                if let Ok(payload) = wire.error_payload() {
                    if payload.fatal {
                        log::error!("fatal server error for {}: {}", self.doc, payload.message);
                        self.set_state(ConnectionState::Failed).await;
                        let _ = self
                            .event_tx
                            .send(SessionEvent::FatalError(payload.message))
                            .await;
                    } else {
                        log::warn!("server error for {}: {}", self.doc, payload.message);
                    }
                }
            }
            crate::protocol::MessageKind::Handshake
            | crate::protocol::MessageKind::HandshakeAck => {
                log::warn!("unexpected {:?} after handshake", wire.kind);
            }
        }
    }

    async fn reconnect_loop(shared: Arc<Self>) {
        let mut shutdown = shared.shutdown_rx.clone();
        let mut attempt: u32 = 0;
        loop {
            if attempt >= shared.config.max_reconnect_attempts {
                log::error!(
                    "giving up on {} after {attempt} reconnect attempts",
                    shared.doc
                );
                shared.set_state(ConnectionState::Failed).await;
                let _ = shared
                    .event_tx
                    .send(SessionEvent::FatalError(
                        "reconnect attempts exhausted".into(),
                    ))
                    .await;
                return;
            }

            let delay = shared
                .config
                .backoff_base
                .saturating_mul(2u32.saturating_pow(attempt))
                .min(shared.config.backoff_cap);
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            attempt += 1;
            log::info!("reconnect attempt {attempt} for {}", shared.doc);
            match Self::connect_once_boxed(Arc::clone(&shared)).await {
                Ok(()) => return,
                Err(ProtocolError::VersionMismatch { .. }) => return,
                Err(_) => {}
            }
            if *shared.state.read().await == ConnectionState::Failed {
                return;
            }
        }
    }

    async fn heartbeat_loop(shared: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut shutdown = shared.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(shared.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {}
            }
            if *shared.state.read().await != ConnectionState::Synced {
                return;
            }
            shared.send(WireMessage::ping(shared.session_id, shared.doc)).await;
        }
    }

    async fn presence_sweep_loop(shared: Arc<Self>, mut stop_rx: watch::Receiver<bool>) {
        let mut shutdown = shared.shutdown_rx.clone();
        let mut ticker = tokio::time::interval(shared.config.presence_sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {}
            }
            if *shared.state.read().await != ConnectionState::Synced {
                return;
            }
            let purged = shared.presence.lock().await.expire();
            if !purged.is_empty() {
                let _ = shared.event_tx.send(SessionEvent::PresenceChanged).await;
            }
        }
    }
}

/// Hands out one shared session per document. Opening the same document
/// twice returns the same session.
pub struct SessionRegistry {
    server_url: String,
    profile: PeerProfile,
    config: SessionConfig,
    sessions: Mutex<HashMap<DocumentKey, Arc<DocumentSession>>>,
}

impl SessionRegistry {
    pub fn new(server_url: impl Into<String>, profile: PeerProfile, config: SessionConfig) -> Self {
        Self {
            server_url: server_url.into(),
            profile,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get the session for a document, creating it on first open. The
    /// caller drives `connect()`.
    pub async fn open(&self, doc: DocumentKey) -> Arc<DocumentSession> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&doc) {
            return Arc::clone(session);
        }
        let session = Arc::new(DocumentSession::new(
            doc,
            self.profile.clone(),
            self.server_url.clone(),
            self.config.clone(),
        ));
        sessions.insert(doc, Arc::clone(&session));
        session
    }

    /// Close and drop a document's session.
    pub async fn close(&self, doc: &DocumentKey) {
        let session = self.sessions.lock().await.remove(doc);
        if let Some(session) = session {
            session.close().await;
        }
    }

    pub async fn open_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}
