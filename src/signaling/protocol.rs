#![forbid(unsafe_code)]

// Signaling protocol - message types for WebSocket communication

use crate::sfu::{ConsumerDescriptor, TransportDescriptor, TransportDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Create a room and join it as creator
    CreateRoom {
        room: String,
        password: String,
        #[serde(default)]
        nickname: Option<String>,
    },
    /// Join an existing room
    JoinRoom {
        room: String,
        password: String,
        #[serde(default)]
        nickname: Option<String>,
    },
    /// Leave the current room
    LeaveRoom,
    /// Close a room (creator only)
    CloseRoom { room: String },
    /// Send a chat message. Carried as a raw JSON value so the abuse guard
    /// can inspect the payload shape before any handler runs.
    ChatMessage { message: Value },
    /// Upload a media attachment (base64 payload)
    #[serde(rename_all = "camelCase")]
    UploadMedia {
        file_name: String,
        file_type: String,
        file_size: u64,
        data: String,
        #[serde(default)]
        thumbnail: Option<String>,
    },
    /// Typing indicator on
    Typing,
    /// Typing indicator off
    StopTyping,
    /// Join the room's voice session
    VoiceJoin,
    /// Allocate a send or recv transport
    VoiceCreateTransport { direction: TransportDirection },
    /// Forward the transport handshake to the SFU
    #[serde(rename_all = "camelCase")]
    VoiceConnectTransport {
        transport_id: String,
        params: Value,
    },
    /// Create an outbound producer on a send transport
    #[serde(rename_all = "camelCase")]
    VoiceProduce {
        transport_id: String,
        params: Value,
    },
    /// Create an inbound consumer for a remote producer
    #[serde(rename_all = "camelCase")]
    VoiceConsume {
        transport_id: String,
        producer_id: String,
        capabilities: Value,
    },
    /// Unpause a previously created consumer
    #[serde(rename_all = "camelCase")]
    VoiceResumeConsumer { consumer_id: String },
    /// Leave the voice session
    VoiceLeave,
    /// Partial update of the peer's display flags
    VoiceStateUpdate {
        #[serde(default)]
        muted: Option<bool>,
        #[serde(default)]
        deafened: Option<bool>,
        #[serde(default)]
        speaking: Option<bool>,
    },
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Room created or joined successfully
    #[serde(rename_all = "camelCase")]
    RoomJoined {
        room: String,
        nickname: String,
        user_count: usize,
        is_creator: bool,
    },
    /// Room operation failed
    RoomError { message: String },
    /// The room was closed by its creator
    RoomClosed { room: String },
    /// Chat message (text or media) fanned out to the room
    ChatMessage(ChatBroadcast),
    /// Upload failed; reported to the uploader only
    MediaError { message: String },
    /// A member joined the room
    UserJoined { nickname: String },
    /// A member left the room
    UserLeft { nickname: String },
    /// Current member count
    UpdateUserCount { count: usize },
    /// A member started typing
    UserTyping { nickname: String },
    /// A member stopped typing
    UserStoppedTyping { nickname: String },
    /// Voice join succeeded: routing capabilities plus active remote producers
    #[serde(rename_all = "camelCase")]
    VoiceJoined {
        rtp_capabilities: Value,
        producers: Vec<RemoteProducer>,
    },
    /// Transport allocated
    VoiceTransportCreated(TransportDescriptor),
    /// Transport handshake forwarded
    #[serde(rename_all = "camelCase")]
    VoiceTransportConnected { transport_id: String },
    /// Producer created
    #[serde(rename_all = "camelCase")]
    VoiceProduced { producer_id: String },
    /// Consumer created (paused until resumed)
    VoiceConsumerCreated(ConsumerDescriptor),
    /// Consumer unpaused
    #[serde(rename_all = "camelCase")]
    VoiceConsumerResumed { consumer_id: String },
    /// Voice session left
    VoiceLeft,
    /// Voice operation failed
    VoiceError { message: String },
    /// Full participant list for the room's voice session
    VoiceParticipants { participants: Vec<VoiceParticipant> },
    /// A new remote producer is available to consume
    VoiceNewProducer(RemoteProducer),
    /// A producer went away; consumers of it were dropped
    #[serde(rename_all = "camelCase")]
    VoiceProducerClosed { producer_id: String },
    /// The room's voice session was torn down with the room
    VoiceRoomClosed,
}

/// Chat broadcast payload. `kind` is `text` for plain messages and `media`
/// for server-originated attachment notices — clients never send this shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatBroadcast {
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    pub nickname: String,
    pub time: String,
    #[serde(rename = "self")]
    pub is_self: bool,
    #[serde(flatten)]
    pub media: Option<MediaInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Text,
    Media,
}

/// Attachment metadata carried inside a media chat broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    /// Public fetch path under the generated-filename namespace.
    pub path: String,
    pub file_type: String,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    /// Always true: the server-chosen filename is the stripping mechanism.
    pub metadata_stripped: bool,
    /// Client-supplied name, truncated, display only.
    pub file_name: String,
}

/// One entry in the voice participant list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceParticipant {
    pub id: String,
    pub nickname: String,
    pub muted: bool,
    pub deafened: bool,
    pub speaking: bool,
}

/// A producer another peer can consume.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProducer {
    pub producer_id: String,
    pub peer_id: String,
    pub nickname: String,
}
