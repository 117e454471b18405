#![forbid(unsafe_code)]

// Room module - the registry owning all room, membership, and voice state.
// Every mutation flows through RoomManager operations; nothing else holds a
// reference into room internals.

pub mod password;
pub mod voice;

use crate::attachments::{self, AttachmentStore};
use crate::error::{ChatError, ChatResult};
use crate::metrics::ServerMetrics;
use crate::sanitize::{sanitize, sanitize_nickname, password_ok, MAX_MSG_LEN, MAX_ROOM_LEN};
use crate::sfu::SfuAdapter;
use crate::signaling::protocol::{ChatBroadcast, ChatKind, MediaInfo, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// How long an empty room survives before deferred deletion. The timer
/// re-checks membership at fire time, so a rejoin inside the window wins.
pub const EMPTY_ROOM_GRACE: Duration = Duration::from_secs(300);

/// A connected member of a room.
pub struct Member {
    pub nickname: String,
    pub joined_at: SystemTime,
    pub is_creator: bool,
    pub sender: mpsc::Sender<Arc<String>>,
}

/// Room state. Lives behind its own lock inside the registry map.
pub struct Room {
    pub name: String,
    password_hash: String,
    pub created_at: SystemTime,
    pub creator_id: String,
    pub members: HashMap<String, Member>,
    /// Stored filenames owned by this room, purged in bulk on deletion.
    pub(crate) attachments: Vec<String>,
    /// Lazily created on first voice join; lives until the room dies.
    pub(crate) voice: Option<voice::VoiceSession>,
}

impl Room {
    fn new(name: String, password_hash: String, creator_id: String) -> Self {
        Self {
            name,
            password_hash,
            created_at: SystemTime::now(),
            creator_id,
            members: HashMap::new(),
            attachments: Vec::new(),
            voice: None,
        }
    }

    /// Broadcast a message to all members except the sender
    pub(crate) fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, member) in &self.members {
            if id != sender_id {
                match member.sender.try_send(json.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!("Channel full for member {} in room {}, dropping message", id, self.name);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        debug!("Channel closed for member {} in room {} (disconnected)", id, self.name);
                    }
                }
            }
        }
    }

    /// Send a message to a specific member
    pub(crate) fn send_to(&self, member_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                return;
            }
        };
        if let Some(member) = self.members.get(member_id) {
            match member.sender.try_send(json) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for member {} in room {}, dropping message", member_id, self.name);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for member {} in room {} (disconnected)", member_id, self.name);
                }
            }
        }
    }

    /// Broadcast a message to all members
    pub(crate) fn broadcast_all(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, member) in &self.members {
            match member.sender.try_send(json.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for member {} in room {}, dropping message", id, self.name);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for member {} in room {} (disconnected)", id, self.name);
                }
            }
        }
    }
}

/// Confirmation returned by create_room/join_room.
#[derive(Debug, Clone)]
pub struct JoinInfo {
    pub room: String,
    pub nickname: String,
    pub user_count: usize,
    pub is_creator: bool,
}

/// Owns the room map and coordinates membership, attachments, and voice.
///
/// Uses per-room locking: the outer HashMap is protected by a std::sync::RwLock
/// (held only for brief lookups/inserts, never across await points), while each
/// room is protected by its own tokio::sync::RwLock (held across async
/// operations but only blocking members of that specific room).
pub struct RoomManager {
    pub(crate) rooms: Arc<StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>>,
    /// connection id -> room name. The Connection's single current room.
    pub(crate) memberships: Arc<StdRwLock<HashMap<String, String>>>,
    pub(crate) sfu: Arc<dyn SfuAdapter>,
    pub(crate) store: AttachmentStore,
    pub(crate) metrics: ServerMetrics,
}

impl RoomManager {
    pub fn new(sfu: Arc<dyn SfuAdapter>, store: AttachmentStore, metrics: ServerMetrics) -> Self {
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            memberships: Arc::new(StdRwLock::new(HashMap::new())),
            sfu,
            store,
            metrics,
        }
    }

    /// Gets a room lock by name (brief outer read lock, no await)
    pub(crate) fn get_room(&self, name: &str) -> ChatResult<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(name).cloned().ok_or(ChatError::NotFound("Room"))
    }

    /// The room a connection currently occupies, if any.
    pub fn room_of(&self, conn_id: &str) -> Option<String> {
        let memberships = self.memberships.read().unwrap_or_else(|e| e.into_inner());
        memberships.get(conn_id).cloned()
    }

    /// Creates a room with the requester as sole member and creator.
    ///
    /// # Errors
    /// `Validation` on bad inputs, `Conflict` if the name is taken (first
    /// writer wins, no merge).
    pub async fn create_room(
        &self,
        room_raw: &str,
        password: &str,
        nickname_raw: Option<&str>,
        conn_id: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> ChatResult<JoinInfo> {
        let name = sanitize(room_raw, MAX_ROOM_LEN)
            .ok_or_else(|| ChatError::Validation("Invalid data".into()))?;
        let nickname = sanitize_nickname(nickname_raw)
            .ok_or_else(|| ChatError::Validation("Invalid data".into()))?;
        if !password_ok(password) {
            return Err(ChatError::Validation("Invalid data".into()));
        }

        // Hash before taking the lock; the digest is the slow part.
        let password_hash = password::hash_password(password)
            .map_err(|e| ChatError::Validation(format!("Password rejected: {e}")))?;

        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if rooms.contains_key(&name) {
                return Err(ChatError::Conflict);
            }
            let mut room = Room::new(name.clone(), password_hash, conn_id.to_string());
            room.members.insert(
                conn_id.to_string(),
                Member {
                    nickname: nickname.clone(),
                    joined_at: SystemTime::now(),
                    is_creator: true,
                    sender,
                },
            );
            rooms.insert(name.clone(), Arc::new(TokioRwLock::new(room)));
        }
        {
            let mut memberships = self.memberships.write().unwrap_or_else(|e| e.into_inner());
            memberships.insert(conn_id.to_string(), name.clone());
        }

        self.metrics.inc_rooms_created();
        info!("Room {} created by {} ({})", name, conn_id, nickname);

        Ok(JoinInfo {
            room: name,
            nickname,
            user_count: 1,
            is_creator: true,
        })
    }

    /// Joins an existing room after password verification.
    ///
    /// # Errors
    /// `NotFound` if the room is absent, `Unauthorized` on password mismatch
    /// (membership is never mutated in that case).
    pub async fn join_room(
        &self,
        room_raw: &str,
        password: &str,
        nickname_raw: Option<&str>,
        conn_id: &str,
        sender: mpsc::Sender<Arc<String>>,
    ) -> ChatResult<JoinInfo> {
        let name = sanitize(room_raw, MAX_ROOM_LEN)
            .ok_or_else(|| ChatError::Validation("Invalid data".into()))?;
        let nickname = sanitize_nickname(nickname_raw)
            .ok_or_else(|| ChatError::Validation("Invalid data".into()))?;
        if password.is_empty() {
            return Err(ChatError::Validation("Invalid data".into()));
        }

        let room_lock = self.get_room(&name)?;

        // Verify against a snapshot of the digest; no mutation yet.
        let hash = room_lock.read().await.password_hash.clone();
        if !password::verify_password(password, &hash).unwrap_or(false) {
            return Err(ChatError::Unauthorized);
        }

        let mut room = room_lock.write().await;

        // The room may have expired between lookup and lock; re-check the
        // registry by key rather than trusting the captured Arc.
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if !rooms.contains_key(&name) {
                return Err(ChatError::NotFound("Room"));
            }
        }

        let is_creator = room.creator_id == conn_id;
        room.members.insert(
            conn_id.to_string(),
            Member {
                nickname: nickname.clone(),
                joined_at: SystemTime::now(),
                is_creator,
                sender,
            },
        );
        let user_count = room.members.len();

        room.broadcast_except(conn_id, &ServerMessage::UserJoined {
            nickname: nickname.clone(),
        });
        room.broadcast_all(&ServerMessage::UpdateUserCount { count: user_count });
        drop(room);

        {
            let mut memberships = self.memberships.write().unwrap_or_else(|e| e.into_inner());
            memberships.insert(conn_id.to_string(), name.clone());
        }

        self.metrics.inc_joins();
        info!("{} ({}) joined room {}", conn_id, nickname, name);

        Ok(JoinInfo {
            room: name,
            nickname,
            user_count,
            is_creator,
        })
    }

    /// Removes a connection from whatever room it occupies. Idempotent no-op
    /// for connections that are not members. Tears down the connection's
    /// voice peer first, then the membership; schedules deferred deletion
    /// when the room empties.
    pub async fn leave_room(&self, conn_id: &str) {
        let name = {
            let mut memberships = self.memberships.write().unwrap_or_else(|e| e.into_inner());
            memberships.remove(conn_id)
        };
        let Some(name) = name else { return };

        let room_lock = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.get(&name).cloned()
        };
        let Some(room_lock) = room_lock else { return };

        let (peer, empty) = {
            let mut room = room_lock.write().await;

            // Voice peer goes first: a peer must never outlive its membership.
            let peer = room.take_voice_peer(conn_id);

            let Some(member) = room.members.remove(conn_id) else {
                // Stale index entry. Still close any peer media we took.
                drop(room);
                if let Some(peer) = peer {
                    voice::close_peer_media(&self.sfu, peer).await;
                }
                return;
            };

            room.broadcast_all(&ServerMessage::UserLeft {
                nickname: member.nickname.clone(),
            });
            room.broadcast_all(&ServerMessage::UpdateUserCount {
                count: room.members.len(),
            });
            if peer.is_some() {
                let participants = room.voice_participants();
                room.broadcast_all(&ServerMessage::VoiceParticipants { participants });
            }

            info!("{} ({}) left room {}", conn_id, member.nickname, name);
            (peer, room.members.is_empty())
        };

        // Close the peer's media objects outside the room lock; teardown is
        // best-effort and swallows collaborator errors.
        if let Some(peer) = peer {
            voice::close_peer_media(&self.sfu, peer).await;
        }

        if empty {
            self.schedule_expiry(name);
        }
        self.metrics.inc_leaves();
    }

    /// Disconnect is the same teardown as an explicit leave.
    pub async fn on_disconnect(&self, conn_id: &str) {
        self.leave_room(conn_id).await;
    }

    /// Closes a room immediately. Creator only; no grace period.
    pub async fn close_room(&self, room_raw: &str, requester: &str) -> ChatResult<()> {
        let name = sanitize(room_raw, MAX_ROOM_LEN)
            .ok_or_else(|| ChatError::Validation("Invalid data".into()))?;
        let room_lock = self.get_room(&name)?;
        let mut room = room_lock.write().await;

        if room.creator_id != requester {
            return Err(ChatError::Forbidden);
        }

        if room.voice.is_some() {
            room.broadcast_all(&ServerMessage::VoiceRoomClosed);
        }
        room.broadcast_all(&ServerMessage::RoomClosed { room: name.clone() });

        let member_ids: Vec<String> = room.members.keys().cloned().collect();
        let stored = std::mem::take(&mut room.attachments);
        let session = room.voice.take();
        room.members.clear();

        // Deregister while still holding the room lock so a concurrent join
        // cannot slip into a room being torn down.
        {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.remove(&name);
        }
        {
            let mut memberships = self.memberships.write().unwrap_or_else(|e| e.into_inner());
            for id in &member_ids {
                memberships.remove(id);
            }
        }
        drop(room);

        // Collaborator and disk cleanup happen outside every lock.
        if let Some(session) = session {
            voice::close_room_voice(&self.sfu, session).await;
        }
        self.store.purge(&stored).await;

        info!("Room {} closed by its creator ({} members notified)", name, member_ids.len());
        Ok(())
    }

    /// Fans a chat message out to the sender's room. The sender receives the
    /// same message marked `self: true`.
    pub async fn broadcast_chat(&self, conn_id: &str, raw_text: &str) -> ChatResult<()> {
        let name = self.room_of(conn_id).ok_or(ChatError::NotInRoom)?;
        let text = sanitize(raw_text, MAX_MSG_LEN)
            .ok_or_else(|| ChatError::Validation("Invalid message".into()))?;

        let room_lock = self.get_room(&name)?;
        let room = room_lock.read().await;
        let member = room.members.get(conn_id).ok_or(ChatError::NotInRoom)?;

        let broadcast = ChatBroadcast {
            kind: ChatKind::Text,
            msg: Some(text),
            nickname: member.nickname.clone(),
            time: chat_timestamp(),
            is_self: false,
            media: None,
        };
        room.broadcast_except(conn_id, &ServerMessage::ChatMessage(broadcast.clone()));
        room.send_to(conn_id, &ServerMessage::ChatMessage(ChatBroadcast {
            is_self: true,
            ..broadcast
        }));
        Ok(())
    }

    /// Relays a typing indicator to the other members. Not persisted; the
    /// latest state per connection wins on the client.
    pub async fn typing(&self, conn_id: &str, started: bool) -> ChatResult<()> {
        let name = self.room_of(conn_id).ok_or(ChatError::NotInRoom)?;
        let room_lock = self.get_room(&name)?;
        let room = room_lock.read().await;
        let member = room.members.get(conn_id).ok_or(ChatError::NotInRoom)?;
        let nickname = member.nickname.clone();
        let message = if started {
            ServerMessage::UserTyping { nickname }
        } else {
            ServerMessage::UserStoppedTyping { nickname }
        };
        room.broadcast_except(conn_id, &message);
        Ok(())
    }

    /// Validates, stores, and announces a media attachment.
    ///
    /// Validation order: membership, declared size, declared type, decoded
    /// payload. A storage failure is reported to the uploader only; nothing
    /// is broadcast.
    pub async fn upload_media(
        &self,
        conn_id: &str,
        file_name: &str,
        file_type: &str,
        file_size: u64,
        data: &str,
        thumbnail: Option<String>,
    ) -> ChatResult<()> {
        let name = self.room_of(conn_id).ok_or(ChatError::NotInRoom)?;

        if file_size > attachments::MAX_UPLOAD_BYTES {
            return Err(ChatError::TooLarge {
                max: attachments::MAX_UPLOAD_BYTES,
            });
        }
        let ext = attachments::extension_for(file_type)
            .ok_or_else(|| ChatError::TypeRejected(file_type.to_string()))?;

        let bytes = attachments::decode_payload(data)?;
        if bytes.len() as u64 > attachments::MAX_UPLOAD_BYTES {
            return Err(ChatError::TooLarge {
                max: attachments::MAX_UPLOAD_BYTES,
            });
        }

        let stored_name = attachments::generate_name(ext);
        self.store
            .persist(&stored_name, &bytes)
            .await
            .map_err(|e| ChatError::StorageFailed(e.to_string()))?;

        // Persistence awaited; re-validate room and membership before the
        // manifest write and broadcast.
        let Ok(room_lock) = self.get_room(&name) else {
            self.store.purge(std::slice::from_ref(&stored_name)).await;
            return Err(ChatError::NotInRoom);
        };
        let mut room = room_lock.write().await;
        let Some(member) = room.members.get(conn_id) else {
            drop(room);
            self.store.purge(std::slice::from_ref(&stored_name)).await;
            return Err(ChatError::NotInRoom);
        };
        let nickname = member.nickname.clone();

        room.attachments.push(stored_name.clone());

        let broadcast = ChatBroadcast {
            kind: ChatKind::Media,
            msg: None,
            nickname,
            time: chat_timestamp(),
            is_self: false,
            media: Some(MediaInfo {
                path: AttachmentStore::public_path(&stored_name),
                file_type: file_type.to_string(),
                file_size,
                thumbnail,
                metadata_stripped: true,
                file_name: attachments::truncate_display_name(file_name),
            }),
        };
        room.broadcast_except(conn_id, &ServerMessage::ChatMessage(broadcast.clone()));
        room.send_to(conn_id, &ServerMessage::ChatMessage(ChatBroadcast {
            is_self: true,
            ..broadcast
        }));

        self.metrics.inc_uploads();
        info!("Stored attachment {} ({} bytes) for room {}", stored_name, bytes.len(), name);
        Ok(())
    }

    /// Schedules deferred deletion of an empty room. The task re-reads live
    /// state by key at fire time, so a rejoin during the window survives.
    fn schedule_expiry(&self, name: String) {
        let rooms = self.rooms.clone();
        let sfu = self.sfu.clone();
        let store = self.store.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            tokio::time::sleep(EMPTY_ROOM_GRACE).await;

            let removed = {
                let mut map = rooms.write().unwrap_or_else(|e| e.into_inner());
                let still_empty = map
                    .get(&name)
                    .is_some_and(|lock| lock.try_write().map_or(false, |room| room.members.is_empty()));
                if still_empty {
                    map.remove(&name)
                } else {
                    None
                }
            };

            let Some(room_lock) = removed else {
                debug!("Room {} was rejoined during the grace window, keeping it", name);
                return;
            };

            let (stored, session) = {
                let mut room = room_lock.write().await;
                (std::mem::take(&mut room.attachments), room.voice.take())
            };
            if let Some(session) = session {
                voice::close_room_voice(&sfu, session).await;
            }
            store.purge(&stored).await;
            metrics.inc_rooms_expired();
            info!("Room {} expired after staying empty for the grace window", name);
        });
    }

    /// Current room count (for /health and /metrics)
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Total member count across all rooms
    pub fn total_member_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let mut total = 0;
        for room_lock in room_locks {
            if let Ok(room) = room_lock.try_read() {
                total += room.members.len();
            }
        }
        total
    }
}

/// Wall-clock HH:MM stamp attached to chat broadcasts.
fn chat_timestamp() -> String {
    chrono::Local::now().format("%H:%M").to_string()
}
