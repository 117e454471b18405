#![forbid(unsafe_code)]

// SFU adapter boundary - the capability interface the coordinator depends on.
//
// The actual media-routing engine lives outside this process. The core only
// stores the ids handed back by the adapter and forwards negotiation payloads
// verbatim; it never inspects media internals. That keeps every room and
// voice operation testable against the in-memory fake.

pub mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Error, Debug)]
pub enum SfuError {
    #[error("SFU unreachable: {0}")]
    Unreachable(String),

    #[error("Unknown {kind}: {id}")]
    UnknownResource { kind: &'static str, id: String },

    #[error("Peer capabilities cannot consume this producer")]
    Incompatible,

    #[error("Negotiation rejected: {0}")]
    Negotiation(String),
}

pub type SfuResult<T> = Result<T, SfuError>;

/// Direction tag for a transport, as requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Connection parameters for a freshly allocated transport. `params` is the
/// engine's negotiation blob, opaque to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: String,
    pub direction: TransportDirection,
    pub params: Value,
}

/// Descriptor for a created consumer, returned to the requesting client so
/// it can complete the negotiation on its side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: String,
    pub producer_id: String,
    pub params: Value,
}

/// Out-of-band notifications from the engine.
#[derive(Debug, Clone)]
pub enum SfuEvent {
    /// A producer was closed on the engine side (e.g. its transport died).
    ProducerClosed { producer_id: String },
}

/// Capability interface over the external media-routing engine.
///
/// Close operations are idempotent: closing an id the engine no longer knows
/// is not an error worth surfacing, and teardown paths swallow failures
/// anyway.
#[async_trait]
pub trait SfuAdapter: Send + Sync {
    /// Allocates (or addresses) a per-room routing context. Returns its id.
    async fn create_router(&self) -> SfuResult<String>;

    /// The routing context's capability descriptor, handed to joining peers.
    async fn router_capabilities(&self, router_id: &str) -> SfuResult<Value>;

    async fn close_router(&self, router_id: &str) -> SfuResult<()>;

    async fn create_transport(
        &self,
        router_id: &str,
        direction: TransportDirection,
    ) -> SfuResult<TransportDescriptor>;

    /// Forwards the client's handshake for a previously created transport.
    async fn connect_transport(&self, transport_id: &str, params: Value) -> SfuResult<()>;

    async fn close_transport(&self, transport_id: &str) -> SfuResult<()>;

    /// Creates an outbound producer on a send transport. Returns its id.
    async fn create_producer(&self, transport_id: &str, params: Value) -> SfuResult<String>;

    async fn close_producer(&self, producer_id: &str) -> SfuResult<()>;

    /// Creates a paused consumer on a recv transport, bound to `producer_id`.
    /// Fails with `Incompatible` if the peer's capabilities cannot decode
    /// that producer.
    async fn create_consumer(
        &self,
        transport_id: &str,
        producer_id: &str,
        capabilities: Value,
    ) -> SfuResult<ConsumerDescriptor>;

    async fn resume_consumer(&self, consumer_id: &str) -> SfuResult<()>;

    async fn close_consumer(&self, consumer_id: &str) -> SfuResult<()>;

    /// Takes the engine event stream. Yields `None` on second call — there
    /// is exactly one pump task per process.
    fn take_events(&self) -> Option<mpsc::Receiver<SfuEvent>>;

    /// Resolves if the engine terminates unexpectedly. Room and voice state
    /// cannot be reattached to a new engine instance, so the process exits
    /// deliberately when this fires.
    async fn terminated(&self);
}
