//! Presence registry: who has the document open, and where their cursor is.
//!
//! Presence is deliberately weaker than document state — entries are not
//! causally ordered, never persisted, and the latest write per session
//! wins. Entries vanish on explicit goodbye or after a liveness window
//! with no refresh.
//!
//! ```text
//! local cursor move
//!       │  (rate-limited)
//!       ▼
//! PresenceRegistry::update_local_cursor() ──► PresenceUpdate ──► transport
//!
//! remote PresenceUpdate ──► handle_update() ──┐
//! liveness sweep ──────────► expire() ────────┤
//!                                             ▼
//!                              watch channel: live roster
//! ```
//!
//! The roster subscription replaces callback-style change notification:
//! the rendering collaborator holds a `watch::Receiver` and awaits or
//! polls it; dropping the receiver is the cancellation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use uuid::Uuid;

use crate::op::ItemId;
use crate::protocol::PeerProfile;

/// Where a participant's cursor sits in the document.
///
/// Addressed by stable item id, not index: the location stays meaningful
/// while concurrent edits shift positions around it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorLocation {
    /// Item the cursor is on (`None` = document head).
    pub item: Option<ItemId>,
    /// Character offset within the item body.
    pub offset: u32,
    /// Items in the active selection (empty = no selection).
    pub selection: Vec<ItemId>,
}

impl Default for CursorLocation {
    fn default() -> Self {
        Self {
            item: None,
            offset: 0,
            selection: Vec::new(),
        }
    }
}

/// Presence messages carried in `presence-update` wire messages.
///
/// Cursor moves are high-frequency and throttled at the source;
/// hello/goodbye always pass immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PresenceUpdate {
    /// Session opened the document (or re-announces after reconnect).
    Hello {
        session_id: Uuid,
        profile: PeerProfile,
    },
    /// Cursor or selection moved.
    Cursor {
        session_id: Uuid,
        cursor: CursorLocation,
    },
    /// Clean departure — removes the entry immediately, no timeout wait.
    Goodbye { session_id: Uuid },
}

impl PresenceUpdate {
    pub fn session_id(&self) -> Uuid {
        match self {
            PresenceUpdate::Hello { session_id, .. } => *session_id,
            PresenceUpdate::Cursor { session_id, .. } => *session_id,
            PresenceUpdate::Goodbye { session_id } => *session_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, String> {
        bincode::serde::encode_to_vec(self, bincode::config::standard()).map_err(|e| e.to_string())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| e.to_string())?;
        Ok(msg)
    }
}

/// One participant in the live user list.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub session_id: Uuid,
    pub profile: PeerProfile,
    pub cursor: CursorLocation,
}

/// Presence timing knobs.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// Entries with no refresh inside this window are purged.
    pub liveness_window: Duration,
    /// Minimum interval between outgoing cursor broadcasts.
    pub cursor_broadcast_interval: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(30),
            cursor_broadcast_interval: Duration::from_millis(33),
        }
    }
}

impl PresenceConfig {
    /// Tight windows for tests.
    pub fn for_testing() -> Self {
        Self {
            liveness_window: Duration::from_millis(50),
            cursor_broadcast_interval: Duration::from_millis(1),
        }
    }
}

struct RemoteEntry {
    entry: PresenceEntry,
    last_seen: Instant,
}

/// Tracks the local entry plus every remote session's latest entry.
///
/// Writes are restricted to the owning session's entry; any component may
/// read the roster. The registry never expires its own local entry.
pub struct PresenceRegistry {
    local: PresenceEntry,
    remote: HashMap<Uuid, RemoteEntry>,
    config: PresenceConfig,
    /// `None` until the first broadcast goes out.
    last_cursor_broadcast: Option<Instant>,
    roster_tx: watch::Sender<Vec<PresenceEntry>>,
}

impl PresenceRegistry {
    pub fn new(session_id: Uuid, profile: PeerProfile, config: PresenceConfig) -> Self {
        let local = PresenceEntry {
            session_id,
            profile,
            cursor: CursorLocation::default(),
        };
        let (roster_tx, _) = watch::channel(vec![local.clone()]);
        Self {
            local,
            remote: HashMap::new(),
            config,
            last_cursor_broadcast: None,
            roster_tx,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.local.session_id
    }

    pub fn local_profile(&self) -> &PeerProfile {
        &self.local.profile
    }

    /// Announcement for handshake / reconnect.
    pub fn hello(&self) -> PresenceUpdate {
        PresenceUpdate::Hello {
            session_id: self.local.session_id,
            profile: self.local.profile.clone(),
        }
    }

    /// Explicit departure for session close.
    pub fn goodbye(&self) -> PresenceUpdate {
        PresenceUpdate::Goodbye {
            session_id: self.local.session_id,
        }
    }

    /// Move the local cursor; returns an update to broadcast unless
    /// throttled.
    pub fn update_local_cursor(&mut self, cursor: CursorLocation) -> Option<PresenceUpdate> {
        self.local.cursor = cursor.clone();
        self.publish_roster();

        if let Some(last) = self.last_cursor_broadcast {
            if last.elapsed() < self.config.cursor_broadcast_interval {
                return None;
            }
        }
        self.last_cursor_broadcast = Some(Instant::now());
        Some(PresenceUpdate::Cursor {
            session_id: self.local.session_id,
            cursor,
        })
    }

    /// Apply an inbound presence message. Latest write per session wins;
    /// every inbound message also re-evaluates expiry.
    pub fn handle_update(&mut self, update: PresenceUpdate) {
        if update.session_id() == self.local.session_id {
            return;
        }

        match update {
            PresenceUpdate::Hello {
                session_id,
                profile,
            } => {
                let cursor = self
                    .remote
                    .get(&session_id)
                    .map(|r| r.entry.cursor.clone())
                    .unwrap_or_default();
                self.remote.insert(
                    session_id,
                    RemoteEntry {
                        entry: PresenceEntry {
                            session_id,
                            profile,
                            cursor,
                        },
                        last_seen: Instant::now(),
                    },
                );
            }
            PresenceUpdate::Cursor { session_id, cursor } => {
                match self.remote.get_mut(&session_id) {
                    Some(remote) => {
                        remote.entry.cursor = cursor;
                        remote.last_seen = Instant::now();
                    }
                    // Cursor from a session whose hello we missed (joined
                    // before we connected) — synthesize a placeholder.
                    None => {
                        let profile = PeerProfile::new(
                            session_id,
                            format!("Peer-{}", &session_id.to_string()[..8]),
                        );
                        self.remote.insert(
                            session_id,
                            RemoteEntry {
                                entry: PresenceEntry {
                                    session_id,
                                    profile,
                                    cursor,
                                },
                                last_seen: Instant::now(),
                            },
                        );
                    }
                }
            }
            PresenceUpdate::Goodbye { session_id } => {
                self.remote.remove(&session_id);
            }
        }

        self.expire();
    }

    /// Purge remote entries past the liveness window. The local entry is
    /// never expired. Returns the purged session ids.
    pub fn expire(&mut self) -> Vec<Uuid> {
        self.expire_at(Instant::now())
    }

    pub fn expire_at(&mut self, now: Instant) -> Vec<Uuid> {
        let window = self.config.liveness_window;
        let stale: Vec<Uuid> = self
            .remote
            .iter()
            .filter(|(_, r)| now.duration_since(r.last_seen) > window)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            log::debug!("presence entry {id} expired");
            self.remote.remove(id);
        }
        self.publish_roster();
        stale
    }

    /// The live user list: local entry first, remotes in stable order.
    pub fn roster(&self) -> Vec<PresenceEntry> {
        let mut roster = vec![self.local.clone()];
        let mut remotes: Vec<&RemoteEntry> = self.remote.values().collect();
        remotes.sort_by_key(|r| r.entry.session_id);
        roster.extend(remotes.into_iter().map(|r| r.entry.clone()));
        roster
    }

    /// Subscribe to roster changes. Dropping the receiver cancels.
    pub fn subscribe(&self) -> watch::Receiver<Vec<PresenceEntry>> {
        self.roster_tx.subscribe()
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }

    fn publish_roster(&self) {
        // send_replace never fails, receivers or not.
        self.roster_tx.send_replace(self.roster());
    }
}

/// Identity collaborator boundary: supplies the local display identity.
pub trait IdentityProvider {
    fn local_profile(&self) -> Result<PeerProfile, IdentityError>;
}

/// Identity lookup failure.
#[derive(Debug, Clone)]
pub struct IdentityError(pub String);

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "identity lookup failed: {}", self.0)
    }
}

impl std::error::Error for IdentityError {}

/// Fixed identity, for tests and embedders that resolve identity upfront.
pub struct StaticIdentity(pub PeerProfile);

impl IdentityProvider for StaticIdentity {
    fn local_profile(&self) -> Result<PeerProfile, IdentityError> {
        Ok(self.0.clone())
    }
}

/// Resolve the local profile, degrading to anonymous on failure —
/// identity trouble must never block the session.
pub fn resolve_profile(provider: &dyn IdentityProvider) -> PeerProfile {
    match provider.local_profile() {
        Ok(profile) => profile,
        Err(e) => {
            log::warn!("{e}; continuing with anonymous presence");
            PeerProfile::anonymous()
        }
    }
}
