#![forbid(unsafe_code)]

// In-memory SFU adapter. Allocates ids and tracks object ownership edges the
// way the real engine would, without forwarding any media. Backs every test,
// and a server started without an external engine runs against it in
// signaling-only mode.

use super::{
    ConsumerDescriptor, SfuAdapter, SfuError, SfuEvent, SfuResult, TransportDescriptor,
    TransportDirection,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex as StdMutex;
use std::sync::RwLock as StdRwLock;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

struct TransportRec {
    router_id: String,
    direction: TransportDirection,
    connected: bool,
}

struct ProducerRec {
    transport_id: String,
}

struct ConsumerRec {
    producer_id: String,
    paused: bool,
}

#[derive(Default)]
struct State {
    routers: HashSet<String>,
    transports: HashMap<String, TransportRec>,
    producers: HashMap<String, ProducerRec>,
    consumers: HashMap<String, ConsumerRec>,
}

pub struct FakeSfu {
    state: StdRwLock<State>,
    events_tx: mpsc::Sender<SfuEvent>,
    events_rx: StdMutex<Option<mpsc::Receiver<SfuEvent>>>,
    shutdown: Notify,
}

impl FakeSfu {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::channel(64);
        Self {
            state: StdRwLock::new(State::default()),
            events_tx,
            events_rx: StdMutex::new(Some(events_rx)),
            shutdown: Notify::new(),
        }
    }

    fn new_id(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }

    /// Simulates the engine closing a producer from its side (remote peer's
    /// transport died). Drops the record and emits a ProducerClosed event.
    pub async fn close_producer_remote(&self, producer_id: &str) {
        let existed = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.producers.remove(producer_id).is_some()
        };
        if existed {
            let _ = self
                .events_tx
                .send(SfuEvent::ProducerClosed {
                    producer_id: producer_id.to_string(),
                })
                .await;
        }
    }

    pub fn producer_exists(&self, producer_id: &str) -> bool {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.producers.contains_key(producer_id)
    }

    pub fn transport_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.transports.len()
    }

    pub fn router_count(&self) -> usize {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state.routers.len()
    }

    fn capabilities() -> Value {
        json!({
            "codecs": [
                {"mimeType": "audio/opus", "clockRate": 48_000, "channels": 2}
            ],
            "headerExtensions": []
        })
    }

    /// A peer can consume when its advertised codec list names opus — the
    /// only codec the fake routes.
    fn can_consume(capabilities: &Value) -> bool {
        capabilities["codecs"]
            .as_array()
            .map(|codecs| {
                codecs.iter().any(|c| {
                    c["mimeType"]
                        .as_str()
                        .is_some_and(|m| m.eq_ignore_ascii_case("audio/opus"))
                })
            })
            .unwrap_or(false)
    }
}

impl Default for FakeSfu {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SfuAdapter for FakeSfu {
    async fn create_router(&self) -> SfuResult<String> {
        let id = Self::new_id("router");
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.routers.insert(id.clone());
        Ok(id)
    }

    async fn router_capabilities(&self, router_id: &str) -> SfuResult<Value> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        if !state.routers.contains(router_id) {
            return Err(SfuError::UnknownResource {
                kind: "router",
                id: router_id.to_string(),
            });
        }
        Ok(Self::capabilities())
    }

    async fn close_router(&self, router_id: &str) -> SfuResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.routers.remove(router_id);
        let orphaned: Vec<String> = state
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for tid in orphaned {
            state.transports.remove(&tid);
            state.producers.retain(|_, p| p.transport_id != tid);
        }
        Ok(())
    }

    async fn create_transport(
        &self,
        router_id: &str,
        direction: TransportDirection,
    ) -> SfuResult<TransportDescriptor> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if !state.routers.contains(router_id) {
            return Err(SfuError::UnknownResource {
                kind: "router",
                id: router_id.to_string(),
            });
        }
        let id = Self::new_id("transport");
        state.transports.insert(
            id.clone(),
            TransportRec {
                router_id: router_id.to_string(),
                direction,
                connected: false,
            },
        );
        Ok(TransportDescriptor {
            id: id.clone(),
            direction,
            params: json!({
                "iceParameters": {"usernameFragment": Self::new_id("ufrag"), "password": Self::new_id("pwd")},
                "iceCandidates": [],
                "dtlsParameters": {"role": "auto", "fingerprints": []},
            }),
        })
    }

    async fn connect_transport(&self, transport_id: &str, _params: Value) -> SfuResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.transports.get_mut(transport_id) {
            Some(t) => {
                t.connected = true;
                Ok(())
            }
            None => Err(SfuError::UnknownResource {
                kind: "transport",
                id: transport_id.to_string(),
            }),
        }
    }

    async fn close_transport(&self, transport_id: &str) -> SfuResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.transports.remove(transport_id);
        state.producers.retain(|_, p| p.transport_id != transport_id);
        Ok(())
    }

    async fn create_producer(&self, transport_id: &str, _params: Value) -> SfuResult<String> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let transport =
            state
                .transports
                .get(transport_id)
                .ok_or_else(|| SfuError::UnknownResource {
                    kind: "transport",
                    id: transport_id.to_string(),
                })?;
        if transport.direction != TransportDirection::Send {
            return Err(SfuError::Negotiation(
                "cannot produce on a recv transport".to_string(),
            ));
        }
        let id = Self::new_id("producer");
        state.producers.insert(
            id.clone(),
            ProducerRec {
                transport_id: transport_id.to_string(),
            },
        );
        Ok(id)
    }

    async fn close_producer(&self, producer_id: &str) -> SfuResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.producers.remove(producer_id);
        Ok(())
    }

    async fn create_consumer(
        &self,
        transport_id: &str,
        producer_id: &str,
        capabilities: Value,
    ) -> SfuResult<ConsumerDescriptor> {
        if !Self::can_consume(&capabilities) {
            return Err(SfuError::Incompatible);
        }
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let transport =
            state
                .transports
                .get(transport_id)
                .ok_or_else(|| SfuError::UnknownResource {
                    kind: "transport",
                    id: transport_id.to_string(),
                })?;
        if transport.direction != TransportDirection::Recv {
            return Err(SfuError::Negotiation(
                "cannot consume on a send transport".to_string(),
            ));
        }
        if !state.producers.contains_key(producer_id) {
            return Err(SfuError::UnknownResource {
                kind: "producer",
                id: producer_id.to_string(),
            });
        }
        let id = Self::new_id("consumer");
        state.consumers.insert(
            id.clone(),
            ConsumerRec {
                producer_id: producer_id.to_string(),
                paused: true,
            },
        );
        Ok(ConsumerDescriptor {
            id,
            producer_id: producer_id.to_string(),
            params: json!({"kind": "audio", "rtpParameters": {"codecs": Self::capabilities()["codecs"]}}),
        })
    }

    async fn resume_consumer(&self, consumer_id: &str) -> SfuResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        match state.consumers.get_mut(consumer_id) {
            Some(c) => {
                c.paused = false;
                Ok(())
            }
            None => Err(SfuError::UnknownResource {
                kind: "consumer",
                id: consumer_id.to_string(),
            }),
        }
    }

    async fn close_consumer(&self, consumer_id: &str) -> SfuResult<()> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.consumers.remove(consumer_id);
        Ok(())
    }

    fn take_events(&self) -> Option<mpsc::Receiver<SfuEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    async fn terminated(&self) {
        // The in-memory engine never dies.
        self.shutdown.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn produce_requires_send_transport() {
        let sfu = FakeSfu::new();
        let router = sfu.create_router().await.unwrap();
        let recv = sfu
            .create_transport(&router, TransportDirection::Recv)
            .await
            .unwrap();
        let err = sfu.create_producer(&recv.id, json!({})).await.unwrap_err();
        assert!(matches!(err, SfuError::Negotiation(_)));
    }

    #[tokio::test]
    async fn consume_rejects_incompatible_capabilities() {
        let sfu = FakeSfu::new();
        let router = sfu.create_router().await.unwrap();
        let send = sfu
            .create_transport(&router, TransportDirection::Send)
            .await
            .unwrap();
        let recv = sfu
            .create_transport(&router, TransportDirection::Recv)
            .await
            .unwrap();
        let producer = sfu.create_producer(&send.id, json!({})).await.unwrap();

        let bad = json!({"codecs": [{"mimeType": "video/vp8"}]});
        assert!(matches!(
            sfu.create_consumer(&recv.id, &producer, bad).await,
            Err(SfuError::Incompatible)
        ));

        let good = json!({"codecs": [{"mimeType": "audio/opus"}]});
        let consumer = sfu
            .create_consumer(&recv.id, &producer, good)
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, producer);
    }

    #[tokio::test]
    async fn close_router_drops_dependents() {
        let sfu = FakeSfu::new();
        let router = sfu.create_router().await.unwrap();
        let send = sfu
            .create_transport(&router, TransportDirection::Send)
            .await
            .unwrap();
        let producer = sfu.create_producer(&send.id, json!({})).await.unwrap();

        sfu.close_router(&router).await.unwrap();
        assert_eq!(sfu.transport_count(), 0);
        assert!(!sfu.producer_exists(&producer));
    }

    #[tokio::test]
    async fn remote_close_emits_event() {
        let sfu = FakeSfu::new();
        let mut events = sfu.take_events().unwrap();
        let router = sfu.create_router().await.unwrap();
        let send = sfu
            .create_transport(&router, TransportDirection::Send)
            .await
            .unwrap();
        let producer = sfu.create_producer(&send.id, json!({})).await.unwrap();

        sfu.close_producer_remote(&producer).await;
        let SfuEvent::ProducerClosed { producer_id } = events.recv().await.unwrap();
        assert_eq!(producer_id, producer);
    }

    #[tokio::test]
    async fn close_operations_are_idempotent() {
        let sfu = FakeSfu::new();
        assert!(sfu.close_producer("nope").await.is_ok());
        assert!(sfu.close_consumer("nope").await.is_ok());
        assert!(sfu.close_transport("nope").await.is_ok());
        assert!(sfu.close_router("nope").await.is_ok());
    }
}
