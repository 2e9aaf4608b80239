//! Relay-side fan-out: one broadcast channel per document room.
//!
//! Every session attached to the same document shares a tokio broadcast
//! channel; a frame sent by one session fans out to all subscribers in
//! O(1). Receivers that lag past the channel capacity drop frames — a
//! session that falls behind recovers through its next handshake's
//! version vector, never by blocking the room.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{DocumentKey, PeerProfile, ProtocolError, WireMessage};

/// Room health counters for the stats endpoint.
#[derive(Debug, Clone, Default)]
pub struct RoomStats {
    pub frames_sent: u64,
    pub active_sessions: usize,
}

struct AtomicRoomStats {
    frames_sent: AtomicU64,
}

/// Fan-out channel for one document.
///
/// Tracks which sessions are attached and who they present as; the
/// actual frame delivery rides the broadcast channel. Filtering out the
/// sender's own frames is the subscriber's job.
pub struct DocumentRoom {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    sessions: RwLock<HashMap<Uuid, PeerProfile>>,
    capacity: usize,
    stats: AtomicRoomStats,
}

impl DocumentRoom {
    /// `capacity` bounds frames buffered per lagging receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicRoomStats {
                frames_sent: AtomicU64::new(0),
            },
        }
    }

    /// Attach a session; returns its frame receiver.
    pub async fn attach(
        &self,
        session_id: Uuid,
        profile: PeerProfile,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sessions.write().await.insert(session_id, profile);
        self.sender.subscribe()
    }

    pub async fn detach(&self, session_id: &Uuid) -> Option<PeerProfile> {
        self.sessions.write().await.remove(session_id)
    }

    /// Encode and fan out a message. Returns the receiver count.
    pub fn broadcast(&self, msg: &WireMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Fan out pre-encoded bytes. Lock-free.
    pub fn broadcast_raw(&self, frame: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn profiles(&self) -> Vec<PeerProfile> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            frames_sent: self.stats.frames_sent.load(Ordering::Relaxed),
            active_sessions: self.sessions.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps document keys to rooms; rooms for different documents are fully
/// isolated.
pub struct RoomDirectory {
    rooms: RwLock<HashMap<DocumentKey, Arc<DocumentRoom>>>,
    default_capacity: usize,
}

impl RoomDirectory {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, doc: DocumentKey) -> Arc<DocumentRoom> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc) {
                return Arc::clone(room);
            }
        }

        let mut rooms = self.rooms.write().await;
        // Re-check: another task may have created it between locks.
        if let Some(room) = rooms.get(&doc) {
            return Arc::clone(room);
        }
        let room = Arc::new(DocumentRoom::new(self.default_capacity));
        rooms.insert(doc, Arc::clone(&room));
        room
    }

    /// Drop a room once its last session detaches.
    pub async fn remove_if_empty(&self, doc: &DocumentKey) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(doc) {
            if room.session_count().await == 0 {
                rooms.remove(doc);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<DocumentKey> {
        self.rooms.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(name: &str) -> PeerProfile {
        PeerProfile::new(Uuid::new_v4(), name)
    }

    #[tokio::test]
    async fn test_attach_detach() {
        let room = DocumentRoom::new(16);
        let session = Uuid::new_v4();

        let _rx = room.attach(session, profile("Alice")).await;
        assert_eq!(room.session_count().await, 1);

        let detached = room.detach(&session).await;
        assert_eq!(detached.unwrap().name, "Alice");
        assert_eq!(room.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_fan_out_reaches_all_receivers() {
        let room = DocumentRoom::new(16);
        let doc = DocumentKey::project(Uuid::new_v4());
        let sender_session = Uuid::new_v4();

        let mut rx1 = room.attach(sender_session, profile("Alice")).await;
        let mut rx2 = room.attach(Uuid::new_v4(), profile("Bob")).await;
        let mut rx3 = room.attach(Uuid::new_v4(), profile("Carol")).await;

        let msg = WireMessage::ping(sender_session, doc);
        let count = room.broadcast(&msg).unwrap();
        // Fan-out includes the sender's receiver; filtering happens at
        // the subscriber.
        assert_eq!(count, 3);

        for rx in [&mut rx1, &mut rx2, &mut rx3] {
            let frame = rx.recv().await.unwrap();
            let decoded = WireMessage::decode(&frame).unwrap();
            assert_eq!(decoded.session_id, sender_session);
        }
    }

    #[tokio::test]
    async fn test_broadcast_raw_shares_encoding() {
        let room = DocumentRoom::new(16);
        let mut rx = room.attach(Uuid::new_v4(), profile("Alice")).await;

        let frame = Arc::new(vec![10, 20, 30]);
        assert_eq!(room.broadcast_raw(Arc::clone(&frame)), 1);
        assert_eq!(*rx.recv().await.unwrap(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_room_stats() {
        let room = DocumentRoom::new(16);
        let doc = DocumentKey::guide(Uuid::new_v4());
        let session = Uuid::new_v4();
        let _rx = room.attach(session, profile("Alice")).await;

        room.broadcast(&WireMessage::ping(session, doc)).unwrap();
        room.broadcast(&WireMessage::ping(session, doc)).unwrap();

        let stats = room.stats().await;
        assert_eq!(stats.frames_sent, 2);
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_directory_shares_rooms_per_doc() {
        let directory = RoomDirectory::new(16);
        let doc = DocumentKey::project(Uuid::new_v4());

        let a = directory.get_or_create(doc).await;
        let b = directory.get_or_create(doc).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(directory.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_directory_isolates_documents() {
        let directory = RoomDirectory::new(16);
        let doc1 = DocumentKey::project(Uuid::new_v4());
        let doc2 = DocumentKey::guide(Uuid::new_v4());

        let _a = directory.get_or_create(doc1).await;
        let _b = directory.get_or_create(doc2).await;

        assert_eq!(directory.room_count().await, 2);
        let docs = directory.active_documents().await;
        assert!(docs.contains(&doc1));
        assert!(docs.contains(&doc2));
    }

    #[tokio::test]
    async fn test_empty_room_cleanup() {
        let directory = RoomDirectory::new(16);
        let doc = DocumentKey::project(Uuid::new_v4());

        let room = directory.get_or_create(doc).await;
        let session = Uuid::new_v4();
        let _rx = room.attach(session, profile("Alice")).await;

        assert!(!directory.remove_if_empty(&doc).await);
        room.detach(&session).await;
        assert!(directory.remove_if_empty(&doc).await);
        assert_eq!(directory.room_count().await, 0);
    }
}
