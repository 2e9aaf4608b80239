//! End-to-end WebSocket tests: a real relay server and real sessions,
//! covering the full sync pipeline.

use quill_collab::protocol::{DocumentKey, PeerProfile, WireMessage};
use quill_collab::replica::Edit;
use quill_collab::server::{RelayConfig, RelayServer};
use quill_collab::session::{ConnectionState, DocumentSession, SessionConfig};
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a relay on a free port, return the port.
async fn start_test_relay() -> u16 {
    let port = free_port().await;
    let config = RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_sessions_per_room: 10,
        broadcast_capacity: 64,
    };
    let server = RelayServer::new(config);
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give the listener time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    port
}

fn session(port: u16, doc: DocumentKey, name: &str) -> DocumentSession {
    DocumentSession::new(
        doc,
        PeerProfile::new(Uuid::new_v4(), name),
        format!("ws://127.0.0.1:{port}"),
        SessionConfig::for_testing(),
    )
}

/// Poll until the condition holds or the deadline passes.
async fn wait_until<F, Fut>(mut condition: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Duration::from_secs(5);
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let port = start_test_relay().await;
    let url = format!("ws://127.0.0.1:{port}");

    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "should connect to relay");
}

#[tokio::test]
async fn test_session_handshake_reaches_synced() {
    let port = start_test_relay().await;
    let doc = DocumentKey::project(Uuid::new_v4());
    let alice = session(port, doc, "Alice");

    alice.connect().await.unwrap();
    assert_eq!(alice.connection_state().await, ConnectionState::Synced);
    alice.close().await;
}

#[tokio::test]
async fn test_edits_propagate_between_sessions() {
    let port = start_test_relay().await;
    let doc = DocumentKey::project(Uuid::new_v4());

    let alice = session(port, doc, "Alice");
    let bob = session(port, doc, "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    alice
        .edit(Edit::Insert {
            at: 0,
            body: "Hello".to_string(),
        })
        .await
        .unwrap();

    wait_until(|| async { bob.text().await == "Hello" }, "bob to see alice's edit").await;

    bob.edit(Edit::Insert {
        at: 1,
        body: " World".to_string(),
    })
    .await
    .unwrap();

    wait_until(
        || async { alice.text().await == "Hello World" },
        "alice to see bob's edit",
    )
    .await;
    assert_eq!(bob.text().await, "Hello World");

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_late_joiner_receives_gap_resend() {
    let port = start_test_relay().await;
    let doc = DocumentKey::guide(Uuid::new_v4());

    let alice = session(port, doc, "Alice");
    alice.connect().await.unwrap();
    alice
        .edit(Edit::Insert {
            at: 0,
            body: "already here".to_string(),
        })
        .await
        .unwrap();

    // Let the relay's log of record absorb the batch.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Fresh session with an empty version vector: the handshake resend
    // must deliver the whole history.
    let bob = session(port, doc, "Bob");
    bob.connect().await.unwrap();
    wait_until(
        || async { bob.text().await == "already here" },
        "late joiner to catch up",
    )
    .await;

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_offline_edits_replay_on_connect() {
    let port = start_test_relay().await;
    let doc = DocumentKey::project(Uuid::new_v4());

    // Edits made before ever connecting apply locally and queue.
    let alice = session(port, doc, "Alice");
    alice
        .edit(Edit::Insert {
            at: 0,
            body: "offline work".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(alice.text().await, "offline work");
    assert_eq!(alice.unacked_len().await, 1);

    alice.connect().await.unwrap();

    // The server ack prunes the queue once the replayed batch lands.
    wait_until(
        || async { alice.unacked_len().await == 0 },
        "replayed batch to be acked",
    )
    .await;

    // And a second session sees the offline work.
    let bob = session(port, doc, "Bob");
    bob.connect().await.unwrap();
    wait_until(
        || async { bob.text().await == "offline work" },
        "bob to see replayed edits",
    )
    .await;

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_presence_roster_propagates() {
    let port = start_test_relay().await;
    let doc = DocumentKey::project(Uuid::new_v4());

    let alice = session(port, doc, "Alice");
    let bob = session(port, doc, "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    // Bob's hello reaches alice; rosters include both participants.
    wait_until(
        || async { alice.roster().await.len() == 2 },
        "alice's roster to include bob",
    )
    .await;

    let names: Vec<String> = alice
        .roster()
        .await
        .into_iter()
        .map(|e| e.profile.name)
        .collect();
    assert!(names.contains(&"Alice".to_string()));
    assert!(names.contains(&"Bob".to_string()));

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_documents_are_isolated() {
    let port = start_test_relay().await;
    let doc_a = DocumentKey::project(Uuid::new_v4());
    let doc_b = DocumentKey::project(Uuid::new_v4());

    let alice = session(port, doc_a, "Alice");
    let bob = session(port, doc_b, "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    alice
        .edit(Edit::Insert {
            at: 0,
            body: "only in doc a".to_string(),
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(bob.text().await.is_empty(), "doc b must stay untouched");

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_session_survives_heartbeat_cycles() {
    let port = start_test_relay().await;
    let doc = DocumentKey::project(Uuid::new_v4());

    // for_testing pings every 50ms; several cycles must pass cleanly.
    let alice = session(port, doc, "Alice");
    alice.connect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(alice.connection_state().await, ConnectionState::Synced);

    alice.close().await;
}

#[tokio::test]
async fn test_protocol_version_mismatch_is_fatal() {
    use futures_util::{SinkExt, StreamExt};
    use quill_collab::op::VersionVector;
    use quill_collab::protocol::{HandshakePayload, MessageKind};

    let port = start_test_relay().await;
    let url = format!("ws://127.0.0.1:{port}");
    let doc = DocumentKey::project(Uuid::new_v4());

    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    // Hand-built handshake claiming a future protocol version.
    let payload = HandshakePayload {
        protocol_version: 99,
        replica: Uuid::new_v4(),
        profile: PeerProfile::new(Uuid::new_v4(), "TimeTraveler"),
        acked: VersionVector::new(),
    };
    let frame = WireMessage {
        kind: MessageKind::Handshake,
        session_id: Uuid::new_v4(),
        doc,
        payload: bincode::serde::encode_to_vec(&payload, bincode::config::standard()).unwrap(),
    };
    ws.send(tokio_tungstenite::tungstenite::Message::Binary(
        frame.encode().unwrap().into(),
    ))
    .await
    .unwrap();

    let reply = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("relay should answer")
        .unwrap()
        .unwrap();
    let bytes: Vec<u8> = match reply {
        tokio_tungstenite::tungstenite::Message::Binary(data) => data.into(),
        other => panic!("expected binary reply, got {other:?}"),
    };
    let wire = WireMessage::decode(&bytes).unwrap();
    assert_eq!(wire.kind, MessageKind::Error);
    let error = wire.error_payload().unwrap();
    assert!(error.fatal, "version mismatch must be fatal");
    assert!(error.message.contains("version"));
}

#[tokio::test]
async fn test_connect_twice_keeps_single_sync_pipeline() {
    let port = start_test_relay().await;
    let doc = DocumentKey::project(Uuid::new_v4());

    let alice = session(port, doc, "Alice");
    let bob = session(port, doc, "Bob");
    alice.connect().await.unwrap();
    bob.connect().await.unwrap();

    // A second connect on a live session is a no-op, not a second
    // reader stacked on the same socket.
    alice.connect().await.unwrap();
    assert_eq!(alice.connection_state().await, ConnectionState::Synced);

    alice
        .edit(Edit::Insert {
            at: 0,
            body: "still syncing".to_string(),
        })
        .await
        .unwrap();
    wait_until(
        || async { bob.text().await == "still syncing" },
        "edits to flow after redundant connect",
    )
    .await;

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_checkpoint_seeded_room_transfers_state_to_fresh_joiner() {
    use quill_collab::replica::ReplicaStore;
    use quill_collab::snapshot::{MemoryStore, SnapshotStore};

    let doc = DocumentKey::project(Uuid::new_v4());

    // A checkpoint written by an earlier run of the relay.
    let store = Arc::new(MemoryStore::new());
    let mut author = ReplicaStore::new(Uuid::new_v4());
    author
        .apply_local(Edit::Insert {
            at: 0,
            body: "persisted".to_string(),
        })
        .unwrap();
    store.save(&doc, &author.export_snapshot()).unwrap();

    let port = free_port().await;
    let server = RelayServer::with_store(
        RelayConfig {
            bind_addr: format!("127.0.0.1:{port}"),
            max_sessions_per_room: 10,
            broadcast_capacity: 64,
        },
        Arc::clone(&store) as Arc<dyn SnapshotStore>,
    );
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The seeded ops never went through this relay's log, so the
    // handshake must hand the joiner the document state outright.
    let bob = session(port, doc, "Bob");
    bob.connect().await.unwrap();
    wait_until(
        || async { bob.text().await == "persisted" },
        "fresh joiner to receive seeded state",
    )
    .await;

    bob.close().await;
}

#[tokio::test]
async fn test_reconnect_after_relay_restart_replays_offline_edits() {
    use quill_collab::snapshot::{MemoryStore, SnapshotStore};

    let doc = DocumentKey::project(Uuid::new_v4());
    let store = Arc::new(MemoryStore::new());
    let port = free_port().await;
    let relay_config = || RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_sessions_per_room: 10,
        broadcast_capacity: 64,
    };

    let first = Arc::new(RelayServer::with_store(
        relay_config(),
        Arc::clone(&store) as Arc<dyn SnapshotStore>,
    ));
    let runner = Arc::clone(&first);
    let first_handle = tokio::spawn(async move { runner.run().await.unwrap() });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Enough backoff headroom to outlast the restart window.
    let alice = DocumentSession::new(
        doc,
        PeerProfile::new(Uuid::new_v4(), "Alice"),
        format!("ws://127.0.0.1:{port}"),
        SessionConfig {
            max_reconnect_attempts: 20,
            ..SessionConfig::for_testing()
        },
    );
    alice.connect().await.unwrap();
    alice
        .edit(Edit::Insert {
            at: 0,
            body: "before ".to_string(),
        })
        .await
        .unwrap();
    wait_until(
        || async { alice.unacked_len().await == 0 },
        "first edit to be acked",
    )
    .await;

    // Take the relay down; its connections drain through the room
    // checkpoint on the way out.
    first.shutdown();
    first_handle.await.unwrap();
    wait_until(
        || async { store.load(&doc).unwrap().is_some() },
        "relay to persist on shutdown",
    )
    .await;
    wait_until(
        || async { alice.connection_state().await != ConnectionState::Synced },
        "alice to notice the dead transport",
    )
    .await;

    // Offline edit queues while the backoff loop keeps dialing.
    alice
        .edit(Edit::Insert {
            at: 1,
            body: "after".to_string(),
        })
        .await
        .unwrap();

    let second = RelayServer::with_store(
        relay_config(),
        Arc::clone(&store) as Arc<dyn SnapshotStore>,
    );
    tokio::spawn(async move { second.run().await.unwrap() });

    wait_until(
        || async {
            alice.connection_state().await == ConnectionState::Synced
                && alice.unacked_len().await == 0
        },
        "alice to reconnect and replay the offline edit",
    )
    .await;

    // A fresh joiner sees the checkpointed history plus the replay.
    let bob = session(port, doc, "Bob");
    bob.connect().await.unwrap();
    wait_until(
        || async { bob.text().await == "before after" },
        "bob to see pre-restart and post-restart edits",
    )
    .await;

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn test_fan_out_throughput() {
    use quill_collab::broadcast::DocumentRoom;

    let room = DocumentRoom::new(2048);
    let mut receivers = Vec::new();
    for i in 0..100 {
        let rx = room
            .attach(Uuid::new_v4(), PeerProfile::new(Uuid::new_v4(), format!("S{i}")))
            .await;
        receivers.push(rx);
    }

    let start = std::time::Instant::now();
    for i in 0..1000u64 {
        room.broadcast_raw(Arc::new(vec![i as u8; 64]));
    }
    let elapsed = start.elapsed();

    // Generous limit for CI.
    assert!(
        elapsed.as_millis() < 100,
        "1000 broadcasts took {elapsed:?}, expected <100ms"
    );
    assert_eq!(room.stats().await.active_sessions, 100);
}
