#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ServerMessage};
use crate::error::{ChatError, ChatResult};
use crate::guard::{inspect_chat, FloodGuard};
use crate::metrics::ServerMetrics;
use crate::room::RoomManager;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client. Messages queued beyond this are
/// stale — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close the connection if no message arrives within this
/// window, so dead sockets can't hold semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Serialize a ServerMessage and push it to the client's send task.
fn send_json(sender: &mpsc::Sender<Arc<String>>, message: &ServerMessage) {
    let json = match serde_json::to_string(message) {
        Ok(j) => Arc::new(j),
        Err(e) => {
            warn!("Failed to serialize response: {}", e);
            return;
        }
    };
    if let Err(e) = sender.try_send(json) {
        debug!("Failed to queue response: {}", e);
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    room_manager: Arc<RoomManager>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let conn_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", conn_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let conn_id_send = conn_id.clone();
    let send_metrics = metrics.clone();

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for connection: {}", conn_id_send);
    });

    let mut flood_guard = FloodGuard::new();

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", conn_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let start = Instant::now();
                        let result = handle_client_message(
                            &client_msg,
                            &conn_id,
                            &tx,
                            &room_manager,
                            &mut flood_guard,
                            &metrics,
                        )
                        .await;
                        metrics.observe_message_handling(start.elapsed());

                        if let Err(e) = result {
                            debug!("Request from {} rejected: {}", conn_id, e);
                            metrics.inc_errors();
                            if tx.is_closed() {
                                break;
                            }
                            send_json(&tx, &error_envelope(&client_msg, &e));
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message format from {}: {}", conn_id, e);
                        metrics.inc_errors();
                        send_json(&tx, &ServerMessage::RoomError {
                            message: format!("Invalid message format: {e}"),
                        });
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", conn_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", conn_id);
            }
        }
    }

    // Disconnect is the same teardown as an explicit leave: voice peer
    // first, then membership, then the empty-room grace timer if needed.
    room_manager.on_disconnect(&conn_id).await;

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for: {}", conn_id);
}

/// Picks the error channel matching the request kind.
fn error_envelope(message: &ClientMessage, err: &ChatError) -> ServerMessage {
    match message {
        ClientMessage::UploadMedia { .. } => ServerMessage::MediaError {
            message: err.to_string(),
        },
        ClientMessage::VoiceJoin
        | ClientMessage::VoiceCreateTransport { .. }
        | ClientMessage::VoiceConnectTransport { .. }
        | ClientMessage::VoiceProduce { .. }
        | ClientMessage::VoiceConsume { .. }
        | ClientMessage::VoiceResumeConsumer { .. }
        | ClientMessage::VoiceLeave
        | ClientMessage::VoiceStateUpdate { .. } => ServerMessage::VoiceError {
            message: err.to_string(),
        },
        _ => ServerMessage::RoomError {
            message: err.to_string(),
        },
    }
}

/// Handle a single client message
async fn handle_client_message(
    message: &ClientMessage,
    conn_id: &str,
    sender: &mpsc::Sender<Arc<String>>,
    room_manager: &Arc<RoomManager>,
    flood_guard: &mut FloodGuard,
    metrics: &ServerMetrics,
) -> ChatResult<()> {
    match message {
        ClientMessage::CreateRoom { room, password, nickname } => {
            // Leave the current room if in one
            if room_manager.room_of(conn_id).is_some() {
                room_manager.leave_room(conn_id).await;
            }

            let info = room_manager
                .create_room(room, password, nickname.as_deref(), conn_id, sender.clone())
                .await?;

            send_json(sender, &ServerMessage::RoomJoined {
                room: info.room,
                nickname: info.nickname,
                user_count: info.user_count,
                is_creator: info.is_creator,
            });
        }

        ClientMessage::JoinRoom { room, password, nickname } => {
            if room_manager.room_of(conn_id).is_some() {
                room_manager.leave_room(conn_id).await;
            }

            let info = room_manager
                .join_room(room, password, nickname.as_deref(), conn_id, sender.clone())
                .await?;

            send_json(sender, &ServerMessage::RoomJoined {
                room: info.room,
                nickname: info.nickname,
                user_count: info.user_count,
                is_creator: info.is_creator,
            });
        }

        ClientMessage::LeaveRoom => {
            room_manager.leave_room(conn_id).await;
        }

        ClientMessage::CloseRoom { room } => {
            room_manager.close_room(room, conn_id).await?;
        }

        ClientMessage::ChatMessage { message } => {
            // Flood policy: too-fast messages are dropped with no feedback.
            if !flood_guard.allow(Instant::now()) {
                metrics.inc_chat_dropped();
                return Ok(());
            }
            let text = inspect_chat(message)?;
            room_manager.broadcast_chat(conn_id, text).await?;
        }

        ClientMessage::UploadMedia { file_name, file_type, file_size, data, thumbnail } => {
            room_manager
                .upload_media(conn_id, file_name, file_type, *file_size, data, thumbnail.clone())
                .await?;
        }

        ClientMessage::Typing => {
            let _ = room_manager.typing(conn_id, true).await;
        }

        ClientMessage::StopTyping => {
            let _ = room_manager.typing(conn_id, false).await;
        }

        ClientMessage::VoiceJoin => {
            let (rtp_capabilities, producers) = room_manager.voice_join(conn_id).await?;
            send_json(sender, &ServerMessage::VoiceJoined {
                rtp_capabilities,
                producers,
            });
        }

        ClientMessage::VoiceCreateTransport { direction } => {
            let descriptor = room_manager
                .voice_create_transport(conn_id, *direction)
                .await?;
            send_json(sender, &ServerMessage::VoiceTransportCreated(descriptor));
        }

        ClientMessage::VoiceConnectTransport { transport_id, params } => {
            room_manager
                .voice_connect_transport(conn_id, transport_id, params.clone())
                .await?;
            send_json(sender, &ServerMessage::VoiceTransportConnected {
                transport_id: transport_id.clone(),
            });
        }

        ClientMessage::VoiceProduce { transport_id, params } => {
            let producer_id = room_manager
                .voice_produce(conn_id, transport_id, params.clone())
                .await?;
            send_json(sender, &ServerMessage::VoiceProduced { producer_id });
        }

        ClientMessage::VoiceConsume { transport_id, producer_id, capabilities } => {
            let descriptor = room_manager
                .voice_consume(conn_id, transport_id, producer_id, capabilities.clone())
                .await?;
            send_json(sender, &ServerMessage::VoiceConsumerCreated(descriptor));
        }

        ClientMessage::VoiceResumeConsumer { consumer_id } => {
            room_manager
                .voice_resume_consumer(conn_id, consumer_id)
                .await?;
            send_json(sender, &ServerMessage::VoiceConsumerResumed {
                consumer_id: consumer_id.clone(),
            });
        }

        ClientMessage::VoiceLeave => {
            room_manager.voice_leave(conn_id).await?;
            send_json(sender, &ServerMessage::VoiceLeft);
        }

        ClientMessage::VoiceStateUpdate { muted, deafened, speaking } => {
            room_manager
                .voice_state_update(conn_id, *muted, *deafened, *speaking)
                .await?;
        }
    }

    Ok(())
}
