//! Binary wire protocol for the document sync channel.
//!
//! One logical bidirectional channel exists per open document. Message
//! kinds:
//!
//! ```text
//! handshake        client ──► relay   protocol version + acked watermark
//! handshake-ack    relay  ──► client  version agreement, gap follows
//! op-batch         both directions    ordered operations
//! presence-update  both directions    ephemeral cursor/identity state
//! ack              relay  ──► client  (replica, seq) durability watermark
//! error            relay  ──► client  protocol / fatal errors
//! ping / pong      both directions    heartbeat
//! ```
//!
//! Everything is bincode-encoded; presence rides in its own message kind so
//! it can be dropped freely without touching the operation stream.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::op::{Operation, ReplicaId, VersionVector};

/// Bumped on incompatible wire or operation model changes. A peer with a
/// different version is a fatal mismatch, surfaced for explicit retry.
pub const PROTOCOL_VERSION: u16 = 1;

/// The resource a document belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Project,
    Guide,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Project => "project",
            ResourceKind::Guide => "guide",
        }
    }
}

/// Identifies one logical document: `(resource kind, resource id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub kind: ResourceKind,
    pub id: Uuid,
}

impl DocumentKey {
    pub fn new(kind: ResourceKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    pub fn project(id: Uuid) -> Self {
        Self::new(ResourceKind::Project, id)
    }

    pub fn guide(id: Uuid) -> Self {
        Self::new(ResourceKind::Guide, id)
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.id)
    }
}

/// Display identity carried in handshakes and presence entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerProfile {
    pub user_id: Uuid,
    pub name: String,
    /// RGBA cursor color, stable per user.
    pub color: [f32; 4],
}

impl PeerProfile {
    pub fn new(user_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            user_id,
            name: name.into(),
            color: stable_color(user_id),
        }
    }

    /// Fallback identity when the identity collaborator is unavailable.
    /// Degrades the session to anonymous presence instead of blocking it.
    pub fn anonymous() -> Self {
        let user_id = Uuid::new_v4();
        Self::new(user_id, format!("Guest-{}", &user_id.to_string()[..8]))
    }
}

/// Stable, visually distinct RGBA color from a user id.
fn stable_color(id: Uuid) -> [f32; 4] {
    let hash = id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// Wire message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageKind {
    Handshake = 1,
    HandshakeAck = 2,
    OpBatch = 3,
    PresenceUpdate = 4,
    Ack = 5,
    Error = 6,
    Ping = 7,
    Pong = 8,
}

/// Handshake payload: who is connecting and how far they have already
/// been acknowledged, so the peer resends only the gap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub protocol_version: u16,
    pub replica: ReplicaId,
    pub profile: PeerProfile,
    /// Everything at or below this watermark is already held locally.
    pub acked: VersionVector,
}

/// Handshake acknowledgement. The operation gap follows as an op-batch;
/// state the relay holds only as a checkpoint (no log entries to resend)
/// rides along as an encoded snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAckPayload {
    pub protocol_version: u16,
    /// Checkpoint state transfer for joiners whose acked watermark does
    /// not cover the relay's seeded state.
    pub snapshot: Option<Vec<u8>>,
}

/// A batch of operations. Each operation is self-identifying
/// (`(replica, seq)`); operations from one replica appear in generation
/// order within a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpBatchPayload {
    pub ops: Vec<Operation>,
}

/// Durability watermark: everything from `replica` up to and including
/// `seq` has been accepted by the peer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub replica: ReplicaId,
    pub seq: u64,
}

/// Peer-reported error. `fatal` means the session cannot continue
/// (version/schema mismatch) and requires explicit caller-initiated retry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub fatal: bool,
    pub message: String,
}

/// Top-level wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub kind: MessageKind,
    /// Originating session.
    pub session_id: Uuid,
    pub doc: DocumentKey,
    /// Kind-specific payload, bincode-encoded.
    pub payload: Vec<u8>,
}

impl WireMessage {
    fn with_payload<T: Serialize>(
        kind: MessageKind,
        session_id: Uuid,
        doc: DocumentKey,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            kind,
            session_id,
            doc,
            payload,
        })
    }

    pub fn handshake(
        session_id: Uuid,
        doc: DocumentKey,
        replica: ReplicaId,
        profile: PeerProfile,
        acked: VersionVector,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageKind::Handshake,
            session_id,
            doc,
            &HandshakePayload {
                protocol_version: PROTOCOL_VERSION,
                replica,
                profile,
                acked,
            },
        )
    }

    pub fn handshake_ack(
        session_id: Uuid,
        doc: DocumentKey,
        snapshot: Option<Vec<u8>>,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageKind::HandshakeAck,
            session_id,
            doc,
            &HandshakeAckPayload {
                protocol_version: PROTOCOL_VERSION,
                snapshot,
            },
        )
    }

    pub fn op_batch(
        session_id: Uuid,
        doc: DocumentKey,
        ops: Vec<Operation>,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageKind::OpBatch,
            session_id,
            doc,
            &OpBatchPayload { ops },
        )
    }

    /// Presence payload is opaque here; see the presence module.
    pub fn presence(session_id: Uuid, doc: DocumentKey, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::PresenceUpdate,
            session_id,
            doc,
            payload,
        }
    }

    pub fn ack(
        session_id: Uuid,
        doc: DocumentKey,
        replica: ReplicaId,
        seq: u64,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageKind::Ack, session_id, doc, &AckPayload { replica, seq })
    }

    pub fn error(
        session_id: Uuid,
        doc: DocumentKey,
        fatal: bool,
        message: impl Into<String>,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(
            MessageKind::Error,
            session_id,
            doc,
            &ErrorPayload {
                fatal,
                message: message.into(),
            },
        )
    }

    pub fn ping(session_id: Uuid, doc: DocumentKey) -> Self {
        Self {
            kind: MessageKind::Ping,
            session_id,
            doc,
            payload: Vec::new(),
        }
    }

    pub fn pong(session_id: Uuid, doc: DocumentKey) -> Self {
        Self {
            kind: MessageKind::Pong,
            session_id,
            doc,
            payload: Vec::new(),
        }
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from the binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn expect_kind(&self, kind: MessageKind) -> Result<(), ProtocolError> {
        if self.kind != kind {
            return Err(ProtocolError::InvalidMessageKind);
        }
        Ok(())
    }

    fn decode_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        let (payload, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(payload)
    }

    pub fn handshake_payload(&self) -> Result<HandshakePayload, ProtocolError> {
        self.expect_kind(MessageKind::Handshake)?;
        self.decode_payload()
    }

    pub fn handshake_ack_payload(&self) -> Result<HandshakeAckPayload, ProtocolError> {
        self.expect_kind(MessageKind::HandshakeAck)?;
        self.decode_payload()
    }

    pub fn op_batch_payload(&self) -> Result<OpBatchPayload, ProtocolError> {
        self.expect_kind(MessageKind::OpBatch)?;
        self.decode_payload()
    }

    pub fn ack_payload(&self) -> Result<AckPayload, ProtocolError> {
        self.expect_kind(MessageKind::Ack)?;
        self.decode_payload()
    }

    pub fn error_payload(&self) -> Result<ErrorPayload, ProtocolError> {
        self.expect_kind(MessageKind::Error)?;
        self.decode_payload()
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageKind,
    /// Fatal: the peer speaks an incompatible protocol version.
    VersionMismatch { ours: u16, theirs: u16 },
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            Self::InvalidMessageKind => write!(f, "invalid message kind"),
            Self::VersionMismatch { ours, theirs } => {
                write!(f, "protocol version mismatch: ours {ours}, theirs {theirs}")
            }
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
