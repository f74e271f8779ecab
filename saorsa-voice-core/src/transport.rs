//! Pub/sub transport contract
//!
//! The signaling channel rides on a topic-scoped publish/subscribe bus with
//! at-least-once delivery (a realtime broadcast channel, a gossip overlay, or
//! the in-memory [`LoopbackBroker`](crate::loopback::LoopbackBroker)). This
//! module only describes what the channel needs from it.

use crate::types::Topic;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use thiserror::Error;

/// Stream of raw payloads published on one topic
///
/// Dropping the stream releases the subscription on the transport.
pub type Subscription = BoxStream<'static, Bytes>;

/// Transport errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Subscription could not be established
    #[error("Subscribe error: {0}")]
    SubscribeError(String),

    /// Publish was rejected
    #[error("Send error: {0}")]
    SendError(String),

    /// Publish was not acknowledged in time
    #[error("Publish not acknowledged: {0}")]
    NotAcknowledged(String),
}

/// Topic-scoped publish/subscribe transport
///
/// Implementations may deliver a payload more than once and in any order
/// relative to other publishers; the signaling layer copes with both.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Subscribe to every payload published on `topic` from now on
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, TransportError>;

    /// Publish a payload, resolving once the transport acknowledged it
    async fn publish(&self, topic: &Topic, payload: Bytes) -> Result<(), TransportError>;
}
