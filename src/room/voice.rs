#![forbid(unsafe_code)]

// Voice session management - per-room voice peer bookkeeping layered over
// the SFU adapter. The registry owns all of this state; SFU calls are never
// awaited while a room lock is held, and every post-await path re-validates
// that the room and peer still exist.

use super::{Room, RoomManager};
use crate::error::{ChatError, ChatResult};
use crate::sfu::{ConsumerDescriptor, SfuError, SfuEvent, SfuAdapter, TransportDescriptor, TransportDirection};
use crate::signaling::protocol::{RemoteProducer, ServerMessage, VoiceParticipant};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle of a voice peer relative to a room it has already joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoicePeerState {
    /// Created, still negotiating with the SFU.
    Joining,
    /// Fully joined; may create transports and produce/consume.
    Active,
    /// Being torn down.
    Leaving,
}

/// A room member's active voice-session state.
pub struct VoicePeer {
    pub nickname: String,
    pub muted: bool,
    pub deafened: bool,
    pub speaking: bool,
    pub state: VoicePeerState,
    /// transport id -> direction tag. The handles live in the SFU.
    pub transports: HashMap<String, TransportDirection>,
    pub producers: HashSet<String>,
    /// consumer id -> producer id it consumes, for closure propagation.
    pub consumers: HashMap<String, String>,
}

impl VoicePeer {
    fn new(nickname: String) -> Self {
        Self {
            nickname,
            muted: false,
            deafened: false,
            speaking: false,
            state: VoicePeerState::Joining,
            transports: HashMap::new(),
            producers: HashSet::new(),
            consumers: HashMap::new(),
        }
    }
}

/// Lazily created per room on first voice join; the routing context is
/// reused until the room itself dies.
pub struct VoiceSession {
    pub router_id: String,
    pub peers: HashMap<String, VoicePeer>,
}

impl VoiceSession {
    fn new(router_id: String) -> Self {
        Self {
            router_id,
            peers: HashMap::new(),
        }
    }
}

impl Room {
    /// Removes a connection's voice peer, if any, marking it Leaving. The
    /// caller owns the returned peer and must close its media objects.
    pub(crate) fn take_voice_peer(&mut self, conn_id: &str) -> Option<VoicePeer> {
        let voice = self.voice.as_mut()?;
        let mut peer = voice.peers.remove(conn_id)?;
        peer.state = VoicePeerState::Leaving;
        Some(peer)
    }

    /// Current participant list (empty when no voice session exists).
    pub(crate) fn voice_participants(&self) -> Vec<VoiceParticipant> {
        self.voice
            .as_ref()
            .map(|v| {
                v.peers
                    .iter()
                    .map(|(id, peer)| VoiceParticipant {
                        id: id.clone(),
                        nickname: peer.nickname.clone(),
                        muted: peer.muted,
                        deafened: peer.deafened,
                        speaking: peer.speaking,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn map_sfu(err: SfuError) -> ChatError {
    match err {
        SfuError::Unreachable(e) => ChatError::ServiceUnavailable(e),
        SfuError::UnknownResource { kind, .. } => ChatError::NotFound(kind),
        SfuError::Incompatible => ChatError::Incompatible,
        SfuError::Negotiation(e) => ChatError::Validation(e),
    }
}

/// Closes all of a peer's media objects, in any order. Teardown is
/// idempotent and failure-tolerant: collaborator errors are swallowed.
pub(crate) async fn close_peer_media(sfu: &Arc<dyn SfuAdapter>, peer: VoicePeer) {
    for consumer_id in peer.consumers.keys() {
        let _ = sfu.close_consumer(consumer_id).await;
    }
    for producer_id in &peer.producers {
        let _ = sfu.close_producer(producer_id).await;
    }
    for transport_id in peer.transports.keys() {
        let _ = sfu.close_transport(transport_id).await;
    }
}

/// Room-level voice teardown: every peer's media objects, then the routing
/// context itself. Must run before the room is deleted.
pub(crate) async fn close_room_voice(sfu: &Arc<dyn SfuAdapter>, session: VoiceSession) {
    for (_, peer) in session.peers {
        close_peer_media(sfu, peer).await;
    }
    let _ = sfu.close_router(&session.router_id).await;
}

impl RoomManager {
    /// Joins the room's voice session. Lazily creates the routing context,
    /// registers the peer, and returns the context's capability descriptor
    /// plus the currently active remote producers.
    pub async fn voice_join(&self, conn_id: &str) -> ChatResult<(Value, Vec<RemoteProducer>)> {
        let name = self.room_of(conn_id).ok_or(ChatError::NotInRoom)?;
        let room_lock = self.get_room(&name)?;

        // Membership gate and existing-context lookup.
        let router_id = {
            let room = room_lock.read().await;
            room.members.get(conn_id).ok_or(ChatError::NotInRoom)?;
            if room
                .voice
                .as_ref()
                .is_some_and(|v| v.peers.contains_key(conn_id))
            {
                return Err(ChatError::Validation("Already in voice session".into()));
            }
            room.voice.as_ref().map(|v| v.router_id.clone())
        };

        // Obtain the routing context, allocating one if this is the room's
        // first voice join.
        let router_id = match router_id {
            Some(id) => id,
            None => {
                let new_id = self
                    .sfu
                    .create_router()
                    .await
                    .map_err(|e| ChatError::ServiceUnavailable(e.to_string()))?;
                let mut room = room_lock.write().await;
                if !room.members.contains_key(conn_id) {
                    drop(room);
                    let _ = self.sfu.close_router(&new_id).await;
                    return Err(ChatError::NotInRoom);
                }
                let raced = room.voice.as_ref().map(|v| v.router_id.clone());
                match raced {
                    Some(id) => {
                        // Lost the creation race; reuse theirs.
                        drop(room);
                        let _ = self.sfu.close_router(&new_id).await;
                        id
                    }
                    None => {
                        room.voice = Some(VoiceSession::new(new_id.clone()));
                        new_id
                    }
                }
            }
        };

        // Register the peer in Joining state before the capability fetch so
        // concurrent media requests for it are rejected until it is Active.
        {
            let mut room = room_lock.write().await;
            let member = room.members.get(conn_id).ok_or(ChatError::NotInRoom)?;
            let nickname = member.nickname.clone();
            let voice = room
                .voice
                .as_mut()
                .ok_or_else(|| ChatError::ServiceUnavailable("Voice session lost".into()))?;
            if voice.peers.contains_key(conn_id) {
                return Err(ChatError::Validation("Already in voice session".into()));
            }
            voice.peers.insert(conn_id.to_string(), VoicePeer::new(nickname));
        }

        let capabilities = match self.sfu.router_capabilities(&router_id).await {
            Ok(caps) => caps,
            Err(e) => {
                // Roll the half-joined peer back before reporting.
                let mut room = room_lock.write().await;
                room.take_voice_peer(conn_id);
                return Err(map_sfu(e));
            }
        };

        // Re-validate after the await: a disconnect mid-negotiation tears
        // the peer down through the normal leave path.
        let producers = {
            let mut room = room_lock.write().await;
            let voice = room
                .voice
                .as_mut()
                .ok_or(ChatError::NotFound("Voice session"))?;
            let peer = voice
                .peers
                .get_mut(conn_id)
                .ok_or(ChatError::NotFound("Voice peer"))?;
            peer.state = VoicePeerState::Active;

            let producers: Vec<RemoteProducer> = voice
                .peers
                .iter()
                .filter(|(id, _)| id.as_str() != conn_id)
                .flat_map(|(id, peer)| {
                    peer.producers.iter().map(|producer_id| RemoteProducer {
                        producer_id: producer_id.clone(),
                        peer_id: id.clone(),
                        nickname: peer.nickname.clone(),
                    })
                })
                .collect();

            let participants = room.voice_participants();
            room.broadcast_all(&ServerMessage::VoiceParticipants { participants });
            producers
        };

        self.metrics.inc_voice_joins();
        info!("{} joined voice in room {}", conn_id, name);
        Ok((capabilities, producers))
    }

    /// Allocates a transport for an Active voice peer.
    pub async fn voice_create_transport(
        &self,
        conn_id: &str,
        direction: TransportDirection,
    ) -> ChatResult<TransportDescriptor> {
        let name = self.room_of(conn_id).ok_or(ChatError::NotInRoom)?;
        let room_lock = self.get_room(&name)?;

        let router_id = {
            let room = room_lock.read().await;
            let voice = room.voice.as_ref().ok_or(ChatError::NotFound("Voice session"))?;
            let peer = voice.peers.get(conn_id).ok_or(ChatError::NotFound("Voice peer"))?;
            if peer.state != VoicePeerState::Active {
                return Err(ChatError::Validation("Voice peer not active".into()));
            }
            voice.router_id.clone()
        };

        let descriptor = self
            .sfu
            .create_transport(&router_id, direction)
            .await
            .map_err(map_sfu)?;

        let mut room = room_lock.write().await;
        match room.voice.as_mut().and_then(|v| v.peers.get_mut(conn_id)) {
            Some(peer) => {
                peer.transports.insert(descriptor.id.clone(), direction);
            }
            None => {
                // Peer vanished during the allocation; don't leak the handle.
                drop(room);
                let _ = self.sfu.close_transport(&descriptor.id).await;
                return Err(ChatError::NotFound("Voice peer"));
            }
        }
        debug!("Created {:?} transport {} for {}", direction, descriptor.id, conn_id);
        Ok(descriptor)
    }

    /// Forwards the handshake for a transport the peer owns.
    pub async fn voice_connect_transport(
        &self,
        conn_id: &str,
        transport_id: &str,
        params: Value,
    ) -> ChatResult<()> {
        let name = self.room_of(conn_id).ok_or(ChatError::NotInRoom)?;
        let room_lock = self.get_room(&name)?;

        {
            let room = room_lock.read().await;
            let voice = room.voice.as_ref().ok_or(ChatError::NotFound("Voice session"))?;
            let peer = voice.peers.get(conn_id).ok_or(ChatError::NotFound("Voice peer"))?;
            if !peer.transports.contains_key(transport_id) {
                return Err(ChatError::NotFound("Transport"));
            }
        }

        self.sfu
            .connect_transport(transport_id, params)
            .await
            .map_err(map_sfu)
    }

    /// Creates an outbound producer on one of the peer's send transports and
    /// announces it to every other room member.
    pub async fn voice_produce(
        &self,
        conn_id: &str,
        transport_id: &str,
        params: Value,
    ) -> ChatResult<String> {
        let name = self.room_of(conn_id).ok_or(ChatError::NotInRoom)?;
        let room_lock = self.get_room(&name)?;

        {
            let room = room_lock.read().await;
            let voice = room.voice.as_ref().ok_or(ChatError::NotFound("Voice session"))?;
            let peer = voice.peers.get(conn_id).ok_or(ChatError::NotFound("Voice peer"))?;
            if peer.state != VoicePeerState::Active {
                return Err(ChatError::Validation("Voice peer not active".into()));
            }
            match peer.transports.get(transport_id) {
                Some(TransportDirection::Send) => {}
                Some(TransportDirection::Recv) => {
                    return Err(ChatError::Validation("Not a send transport".into()));
                }
                None => return Err(ChatError::NotFound("Transport")),
            }
        }

        let producer_id = self
            .sfu
            .create_producer(transport_id, params)
            .await
            .map_err(map_sfu)?;

        let mut room = room_lock.write().await;
        let nickname = match room.voice.as_mut().and_then(|v| v.peers.get_mut(conn_id)) {
            Some(peer) => {
                peer.producers.insert(producer_id.clone());
                peer.nickname.clone()
            }
            None => {
                drop(room);
                let _ = self.sfu.close_producer(&producer_id).await;
                return Err(ChatError::NotFound("Voice peer"));
            }
        };

        room.broadcast_except(conn_id, &ServerMessage::VoiceNewProducer(RemoteProducer {
            producer_id: producer_id.clone(),
            peer_id: conn_id.to_string(),
            nickname,
        }));

        info!("{} producing {} in room {}", conn_id, producer_id, name);
        Ok(producer_id)
    }

    /// Creates a paused consumer bound to one of the peer's recv transports.
    pub async fn voice_consume(
        &self,
        conn_id: &str,
        transport_id: &str,
        producer_id: &str,
        capabilities: Value,
    ) -> ChatResult<ConsumerDescriptor> {
        let name = self.room_of(conn_id).ok_or(ChatError::NotInRoom)?;
        let room_lock = self.get_room(&name)?;

        {
            let room = room_lock.read().await;
            let voice = room.voice.as_ref().ok_or(ChatError::NotFound("Voice session"))?;
            let peer = voice.peers.get(conn_id).ok_or(ChatError::NotFound("Voice peer"))?;
            match peer.transports.get(transport_id) {
                Some(TransportDirection::Recv) => {}
                Some(TransportDirection::Send) => {
                    return Err(ChatError::Validation("Not a recv transport".into()));
                }
                None => return Err(ChatError::NotFound("Transport")),
            }
            let known = voice
                .peers
                .values()
                .any(|p| p.producers.contains(producer_id));
            if !known {
                return Err(ChatError::NotFound("Producer"));
            }
        }

        let descriptor = self
            .sfu
            .create_consumer(transport_id, producer_id, capabilities)
            .await
            .map_err(map_sfu)?;

        let mut room = room_lock.write().await;
        match room.voice.as_mut().and_then(|v| v.peers.get_mut(conn_id)) {
            Some(peer) => {
                peer.consumers
                    .insert(descriptor.id.clone(), producer_id.to_string());
            }
            None => {
                drop(room);
                let _ = self.sfu.close_consumer(&descriptor.id).await;
                return Err(ChatError::NotFound("Voice peer"));
            }
        }
        Ok(descriptor)
    }

    /// Unpauses a consumer the peer owns.
    pub async fn voice_resume_consumer(&self, conn_id: &str, consumer_id: &str) -> ChatResult<()> {
        let name = self.room_of(conn_id).ok_or(ChatError::NotInRoom)?;
        let room_lock = self.get_room(&name)?;

        {
            let room = room_lock.read().await;
            let voice = room.voice.as_ref().ok_or(ChatError::NotFound("Voice session"))?;
            let peer = voice.peers.get(conn_id).ok_or(ChatError::NotFound("Voice peer"))?;
            if !peer.consumers.contains_key(consumer_id) {
                return Err(ChatError::NotFound("Consumer"));
            }
        }

        self.sfu.resume_consumer(consumer_id).await.map_err(map_sfu)
    }

    /// Leaves the voice session, tearing down everything the peer owned.
    /// Idempotent: leaving while not in voice is a no-op.
    pub async fn voice_leave(&self, conn_id: &str) -> ChatResult<()> {
        let Some(name) = self.room_of(conn_id) else {
            return Ok(());
        };
        let Ok(room_lock) = self.get_room(&name) else {
            return Ok(());
        };

        let peer = {
            let mut room = room_lock.write().await;
            let peer = room.take_voice_peer(conn_id);
            if peer.is_some() {
                let participants = room.voice_participants();
                room.broadcast_all(&ServerMessage::VoiceParticipants { participants });
            }
            peer
        };

        if let Some(peer) = peer {
            close_peer_media(&self.sfu, peer).await;
            info!("{} left voice in room {}", conn_id, name);
        }
        Ok(())
    }

    /// Partially merges the peer's client-reported display flags and
    /// rebroadcasts the participant list. Display metadata only.
    pub async fn voice_state_update(
        &self,
        conn_id: &str,
        muted: Option<bool>,
        deafened: Option<bool>,
        speaking: Option<bool>,
    ) -> ChatResult<()> {
        let name = self.room_of(conn_id).ok_or(ChatError::NotInRoom)?;
        let room_lock = self.get_room(&name)?;
        let mut room = room_lock.write().await;

        let voice = room.voice.as_mut().ok_or(ChatError::NotFound("Voice session"))?;
        let peer = voice.peers.get_mut(conn_id).ok_or(ChatError::NotFound("Voice peer"))?;
        if let Some(muted) = muted {
            peer.muted = muted;
        }
        if let Some(deafened) = deafened {
            peer.deafened = deafened;
        }
        if let Some(speaking) = speaking {
            peer.speaking = speaking;
        }

        let participants = room.voice_participants();
        room.broadcast_all(&ServerMessage::VoiceParticipants { participants });
        Ok(())
    }

    /// Starts the background task that pumps SFU events into room state.
    /// Call once after construction.
    pub fn spawn_sfu_event_pump(self: &Arc<Self>) {
        let Some(mut events) = self.sfu.take_events() else {
            warn!("SFU event stream already taken; producer-closed propagation disabled");
            return;
        };
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(manager) = weak.upgrade() else { break };
                match event {
                    SfuEvent::ProducerClosed { producer_id } => {
                        manager.handle_producer_closed(&producer_id).await;
                    }
                }
            }
            debug!("SFU event pump finished");
        });
    }

    /// A producer went away on the collaborator side. Drops every consumer
    /// record bound to it and notifies the consuming peers.
    pub(crate) async fn handle_producer_closed(&self, producer_id: &str) {
        let room_locks: Vec<_> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        for room_lock in room_locks {
            let mut dropped_consumers: Vec<(String, String)> = Vec::new();
            {
                let mut room = room_lock.write().await;
                let Some(voice) = room.voice.as_mut() else {
                    continue;
                };
                for (conn, peer) in voice.peers.iter_mut() {
                    peer.producers.remove(producer_id);
                    let dead: Vec<String> = peer
                        .consumers
                        .iter()
                        .filter(|(_, pid)| pid.as_str() == producer_id)
                        .map(|(cid, _)| cid.clone())
                        .collect();
                    for cid in dead {
                        peer.consumers.remove(&cid);
                        dropped_consumers.push((conn.clone(), cid));
                    }
                }
                for (conn, _) in &dropped_consumers {
                    room.send_to(conn, &ServerMessage::VoiceProducerClosed {
                        producer_id: producer_id.to_string(),
                    });
                }
            }
            for (_, consumer_id) in &dropped_consumers {
                let _ = self.sfu.close_consumer(consumer_id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::AttachmentStore;
    use crate::metrics::ServerMetrics;
    use crate::sfu::fake::FakeSfu;
    use serde_json::{json, Value as Json};
    use tokio::sync::mpsc;
    use tokio::sync::mpsc::Receiver;

    fn test_manager() -> (Arc<RoomManager>, Arc<FakeSfu>, tempfile::TempDir) {
        let sfu = Arc::new(FakeSfu::new());
        let tmp = tempfile::tempdir().unwrap();
        let store = AttachmentStore::new(tmp.path());
        let manager = Arc::new(RoomManager::new(sfu.clone(), store, ServerMetrics::new()));
        (manager, sfu, tmp)
    }

    fn channel() -> (mpsc::Sender<Arc<String>>, Receiver<Arc<String>>) {
        mpsc::channel(64)
    }

    fn drain(rx: &mut Receiver<Arc<String>>) -> Vec<Json> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    fn opus_caps() -> Json {
        json!({"codecs": [{"mimeType": "audio/opus"}]})
    }

    async fn two_member_room(manager: &Arc<RoomManager>) -> (Receiver<Arc<String>>, Receiver<Arc<String>>) {
        let (tx_a, rx_a) = channel();
        let (tx_b, rx_b) = channel();
        manager
            .create_room("den", "pw", Some("ada"), "conn-a", tx_a)
            .await
            .unwrap();
        manager
            .join_room("den", "pw", Some("bob"), "conn-b", tx_b)
            .await
            .unwrap();
        (rx_a, rx_b)
    }

    #[tokio::test]
    async fn voice_join_requires_room_membership() {
        let (manager, _, _tmp) = test_manager();
        let err = manager.voice_join("loner").await.unwrap_err();
        assert!(matches!(err, ChatError::NotInRoom));
    }

    #[tokio::test]
    async fn voice_join_returns_capabilities_and_broadcasts_participants() {
        let (manager, _, _tmp) = test_manager();
        let (mut rx_a, mut rx_b) = two_member_room(&manager).await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        let (caps, producers) = manager.voice_join("conn-a").await.unwrap();
        assert!(caps["codecs"].is_array());
        assert!(producers.is_empty());

        // Everyone in the room, including the joiner, sees the new list.
        for rx in [&mut rx_a, &mut rx_b] {
            let lists: Vec<Json> = drain(rx)
                .into_iter()
                .filter(|m| m["type"] == "voiceParticipants")
                .collect();
            assert_eq!(lists.len(), 1);
            let participants = lists[0]["participants"].as_array().unwrap();
            assert_eq!(participants.len(), 1);
            assert_eq!(participants[0]["id"], "conn-a");
            assert_eq!(participants[0]["nickname"], "ada");
            assert_eq!(participants[0]["muted"], false);
        }
    }

    #[tokio::test]
    async fn second_voice_join_reuses_router() {
        let (manager, sfu, _tmp) = test_manager();
        let _rx = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        manager.voice_join("conn-b").await.unwrap();
        assert_eq!(sfu.router_count(), 1);
    }

    #[tokio::test]
    async fn double_voice_join_is_rejected() {
        let (manager, _, _tmp) = test_manager();
        let _rx = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        let err = manager.voice_join("conn-a").await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));
    }

    #[tokio::test]
    async fn state_update_is_partial_and_rebroadcast() {
        let (manager, _, _tmp) = test_manager();
        let (mut rx_a, mut rx_b) = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        manager
            .voice_state_update("conn-a", Some(true), None, None)
            .await
            .unwrap();

        // Both members, including the updater, see muted=true and the other
        // flags untouched.
        for rx in [&mut rx_a, &mut rx_b] {
            let lists: Vec<Json> = drain(rx)
                .into_iter()
                .filter(|m| m["type"] == "voiceParticipants")
                .collect();
            let participants = lists.last().unwrap()["participants"].as_array().unwrap();
            assert_eq!(participants[0]["muted"], true);
            assert_eq!(participants[0]["deafened"], false);
            assert_eq!(participants[0]["speaking"], false);
        }

        manager
            .voice_state_update("conn-a", None, Some(true), Some(true))
            .await
            .unwrap();
        let lists = drain(&mut rx_b);
        let participants = lists.last().unwrap()["participants"].as_array().unwrap();
        assert_eq!(participants[0]["muted"], true);
        assert_eq!(participants[0]["deafened"], true);
        assert_eq!(participants[0]["speaking"], true);
    }

    #[tokio::test]
    async fn state_update_without_voice_peer_fails() {
        let (manager, _, _tmp) = test_manager();
        let _rx = two_member_room(&manager).await;
        let err = manager
            .voice_state_update("conn-a", Some(true), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn produce_announces_to_other_members_only() {
        let (manager, _, _tmp) = test_manager();
        let (mut rx_a, mut rx_b) = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        let send = manager
            .voice_create_transport("conn-a", TransportDirection::Send)
            .await
            .unwrap();
        manager
            .voice_connect_transport("conn-a", &send.id, json!({"dtls": "params"}))
            .await
            .unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        let producer_id = manager
            .voice_produce("conn-a", &send.id, json!({"rtp": "params"}))
            .await
            .unwrap();

        let to_b: Vec<Json> = drain(&mut rx_b)
            .into_iter()
            .filter(|m| m["type"] == "voiceNewProducer")
            .collect();
        assert_eq!(to_b.len(), 1);
        assert_eq!(to_b[0]["producerId"], producer_id.as_str());
        assert_eq!(to_b[0]["peerId"], "conn-a");
        assert_eq!(to_b[0]["nickname"], "ada");

        assert!(drain(&mut rx_a)
            .iter()
            .all(|m| m["type"] != "voiceNewProducer"));
    }

    #[tokio::test]
    async fn produce_rejects_recv_transport_and_unknown_transport() {
        let (manager, _, _tmp) = test_manager();
        let _rx = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        let recv = manager
            .voice_create_transport("conn-a", TransportDirection::Recv)
            .await
            .unwrap();

        let err = manager
            .voice_produce("conn-a", &recv.id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let err = manager
            .voice_produce("conn-a", "transport-nope", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn transports_are_owned_per_peer() {
        let (manager, _, _tmp) = test_manager();
        let _rx = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        manager.voice_join("conn-b").await.unwrap();
        let send_a = manager
            .voice_create_transport("conn-a", TransportDirection::Send)
            .await
            .unwrap();

        // conn-b cannot act on conn-a's transport even though the SFU knows it.
        let err = manager
            .voice_connect_transport("conn-b", &send_a.id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn full_consume_flow_with_resume() {
        let (manager, _, _tmp) = test_manager();
        let _rx = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        let send = manager
            .voice_create_transport("conn-a", TransportDirection::Send)
            .await
            .unwrap();
        manager
            .voice_connect_transport("conn-a", &send.id, json!({}))
            .await
            .unwrap();
        let producer_id = manager
            .voice_produce("conn-a", &send.id, json!({}))
            .await
            .unwrap();

        let (_caps, remote) = manager.voice_join("conn-b").await.unwrap();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].producer_id, producer_id);
        assert_eq!(remote[0].nickname, "ada");

        let recv = manager
            .voice_create_transport("conn-b", TransportDirection::Recv)
            .await
            .unwrap();
        manager
            .voice_connect_transport("conn-b", &recv.id, json!({}))
            .await
            .unwrap();
        let consumer = manager
            .voice_consume("conn-b", &recv.id, &producer_id, opus_caps())
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer_id);

        manager
            .voice_resume_consumer("conn-b", &consumer.id)
            .await
            .unwrap();

        let err = manager
            .voice_resume_consumer("conn-b", "consumer-nope")
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn consume_incompatible_capabilities_is_rejected() {
        let (manager, _, _tmp) = test_manager();
        let _rx = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        let send = manager
            .voice_create_transport("conn-a", TransportDirection::Send)
            .await
            .unwrap();
        let producer_id = manager
            .voice_produce("conn-a", &send.id, json!({}))
            .await
            .unwrap();

        manager.voice_join("conn-b").await.unwrap();
        let recv = manager
            .voice_create_transport("conn-b", TransportDirection::Recv)
            .await
            .unwrap();

        let err = manager
            .voice_consume(
                "conn-b",
                &recv.id,
                &producer_id,
                json!({"codecs": [{"mimeType": "video/vp9"}]}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::Incompatible));
    }

    #[tokio::test]
    async fn consume_unknown_producer_is_not_found() {
        let (manager, _, _tmp) = test_manager();
        let _rx = two_member_room(&manager).await;

        manager.voice_join("conn-b").await.unwrap();
        let recv = manager
            .voice_create_transport("conn-b", TransportDirection::Recv)
            .await
            .unwrap();
        let err = manager
            .voice_consume("conn-b", &recv.id, "producer-nope", opus_caps())
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn voice_leave_tears_down_and_broadcasts_empty_list() {
        let (manager, sfu, _tmp) = test_manager();
        let (mut rx_a, mut rx_b) = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        let send = manager
            .voice_create_transport("conn-a", TransportDirection::Send)
            .await
            .unwrap();
        let producer_id = manager
            .voice_produce("conn-a", &send.id, json!({}))
            .await
            .unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        manager.voice_leave("conn-a").await.unwrap();

        assert_eq!(sfu.transport_count(), 0);
        assert!(!sfu.producer_exists(&producer_id));

        let lists: Vec<Json> = drain(&mut rx_b)
            .into_iter()
            .filter(|m| m["type"] == "voiceParticipants")
            .collect();
        assert_eq!(lists.len(), 1);
        assert!(lists[0]["participants"].as_array().unwrap().is_empty());

        // The router survives for reuse until the room dies.
        assert_eq!(sfu.router_count(), 1);
    }

    #[tokio::test]
    async fn voice_leave_is_idempotent() {
        let (manager, _, _tmp) = test_manager();
        let _rx = two_member_room(&manager).await;
        manager.voice_leave("conn-a").await.unwrap();
        manager.voice_leave("loner").await.unwrap();
    }

    #[tokio::test]
    async fn disconnect_with_active_peer_leaves_no_dangling_records() {
        let (manager, sfu, _tmp) = test_manager();
        let (mut rx_a, mut rx_b) = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        let send = manager
            .voice_create_transport("conn-a", TransportDirection::Send)
            .await
            .unwrap();
        let recv = manager
            .voice_create_transport("conn-a", TransportDirection::Recv)
            .await
            .unwrap();
        manager
            .voice_connect_transport("conn-a", &send.id, json!({}))
            .await
            .unwrap();
        manager
            .voice_connect_transport("conn-a", &recv.id, json!({}))
            .await
            .unwrap();
        manager.voice_produce("conn-a", &send.id, json!({})).await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        manager.on_disconnect("conn-a").await;

        assert_eq!(sfu.transport_count(), 0);
        let messages = drain(&mut rx_b);
        let lists: Vec<&Json> = messages
            .iter()
            .filter(|m| m["type"] == "voiceParticipants")
            .collect();
        assert_eq!(lists.len(), 1);
        assert!(lists[0]["participants"].as_array().unwrap().is_empty());
        assert!(messages.iter().any(|m| m["type"] == "userLeft"));
    }

    #[tokio::test]
    async fn remote_producer_close_propagates_to_consumers() {
        let (manager, sfu, _tmp) = test_manager();
        let (mut rx_a, mut rx_b) = two_member_room(&manager).await;
        manager.spawn_sfu_event_pump();

        manager.voice_join("conn-a").await.unwrap();
        let send = manager
            .voice_create_transport("conn-a", TransportDirection::Send)
            .await
            .unwrap();
        let producer_id = manager
            .voice_produce("conn-a", &send.id, json!({}))
            .await
            .unwrap();

        manager.voice_join("conn-b").await.unwrap();
        let recv = manager
            .voice_create_transport("conn-b", TransportDirection::Recv)
            .await
            .unwrap();
        let consumer = manager
            .voice_consume("conn-b", &recv.id, &producer_id, opus_caps())
            .await
            .unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        sfu.close_producer_remote(&producer_id).await;

        // Let the pump task run.
        let mut notified = false;
        for _ in 0..100 {
            tokio::task::yield_now().await;
            if drain(&mut rx_b)
                .iter()
                .any(|m| m["type"] == "voiceProducerClosed" && m["producerId"] == producer_id.as_str())
            {
                notified = true;
                break;
            }
        }
        assert!(notified);

        // The consumer record is gone: resuming it now fails.
        let err = manager
            .voice_resume_consumer("conn-b", &consumer.id)
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
    }

    #[tokio::test]
    async fn close_room_releases_router_and_notifies_voice_peers() {
        let (manager, sfu, _tmp) = test_manager();
        let (mut rx_a, mut rx_b) = two_member_room(&manager).await;

        manager.voice_join("conn-a").await.unwrap();
        manager.voice_join("conn-b").await.unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        manager.close_room("den", "conn-a").await.unwrap();

        assert_eq!(sfu.router_count(), 0);
        assert_eq!(sfu.transport_count(), 0);
        let messages = drain(&mut rx_b);
        assert!(messages.iter().any(|m| m["type"] == "voiceRoomClosed"));
        assert!(messages.iter().any(|m| m["type"] == "roomClosed"));
    }
}
