//! Call signaling protocol
//!
//! Wire format, boundary validation and the per-topic [`SignalingChannel`].
//!
//! Every message on a call topic is a JSON object
//!
//! ```text
//! { "type": "offer" | "answer" | "candidate" | "bye",
//!   "payload": <description | candidate | {reason}>,
//!   "from": <user id>, "to": <user id>, "meta": <opaque, offers only>,
//!   "call": <call attempt id> }
//! ```
//!
//! The caller picks the `call` id when it sends the offer and both sides stamp
//! it on everything that follows, so a late message from an earlier attempt on
//! the same topic can be told apart from the current one. Messages without an
//! id are accepted by any attempt.
//!
//! Payloads are decoded into the [`SignalBody`] union before anything else sees
//! them; a message that fails to decode is dropped at the channel.

use crate::identity::PeerIdentity;
use crate::transport::{PubSubTransport, TransportError};
use crate::types::{CallId, CallMetadata, IceCandidate, SdpKind, SessionDescription, Topic};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

/// Maximum signaling message size (64KB)
pub const MAX_SIGNALING_MESSAGE_SIZE: usize = 64 * 1024;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// Unparseable payload or missing fields
    #[error("Malformed signal: {0}")]
    Malformed(String),

    /// Encoded message exceeds [`MAX_SIGNALING_MESSAGE_SIZE`]
    #[error("Signal too large: {0} bytes")]
    TooLarge(usize),

    /// Publish failed on every attempt
    #[error("Delivery failed after {attempts} attempt(s): {source}")]
    Delivery {
        /// Attempts made
        attempts: u32,
        /// Last transport error
        #[source]
        source: TransportError,
    },

    /// Transport refused the subscription
    #[error("Subscription failed: {0}")]
    Subscribe(#[source] TransportError),

    /// Channel was destroyed
    #[error("Signaling channel closed")]
    Closed,
}

/// Discriminant of a signaling message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Session offer
    Offer,
    /// Session answer
    Answer,
    /// Network path candidate
    Candidate,
    /// Hang-up notice
    Bye,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Candidate => "candidate",
            Self::Bye => "bye",
        };
        f.write_str(name)
    }
}

/// Validated message content
#[derive(Debug, Clone, PartialEq)]
pub enum SignalBody {
    /// Caller's offer plus opaque UI metadata
    Offer {
        /// Offer description
        description: SessionDescription,
        /// Opaque UI metadata
        meta: Option<CallMetadata>,
    },
    /// Callee's answer
    Answer(SessionDescription),
    /// Candidate from the sender's link
    Candidate(IceCandidate),
    /// Sender hung up
    Bye {
        /// Optional human-readable reason
        reason: Option<String>,
    },
}

impl SignalBody {
    /// Discriminant
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::Offer { .. } => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::Candidate(_) => SignalKind::Candidate,
            Self::Bye { .. } => SignalKind::Bye,
        }
    }
}

/// A signaling message together with its addressing
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage<I: PeerIdentity> {
    /// Content
    pub body: SignalBody,
    /// Sender
    pub from: I,
    /// Intended recipient, `None` for broadcast
    pub to: Option<I>,
    /// Call attempt this message belongs to, `None` when unscoped
    pub call: Option<CallId>,
}

#[derive(Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
struct WireSignal<I: PeerIdentity> {
    #[serde(rename = "type")]
    kind: SignalKind,
    #[serde(default)]
    payload: serde_json::Value,
    from: I,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<I>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    meta: Option<CallMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    call: Option<CallId>,
}

#[derive(Serialize, Deserialize)]
struct ByePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reason: Option<String>,
}

impl<I: PeerIdentity> SignalMessage<I> {
    /// Message type
    #[must_use]
    pub fn kind(&self) -> SignalKind {
        self.body.kind()
    }

    /// Whether a participant named `local` should consume this message
    ///
    /// Self-originated messages and messages addressed to someone else are
    /// rejected.
    #[must_use]
    pub fn is_addressed_to(&self, local: &I) -> bool {
        self.from != *local && self.to.as_ref().map_or(true, |to| to == local)
    }

    /// Whether this message may belong to the attempt `call`
    ///
    /// Only two different ids rule a message out.
    #[must_use]
    pub fn belongs_to(&self, call: Option<CallId>) -> bool {
        match (self.call, call) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }

    /// Encode to the JSON wire format
    ///
    /// # Errors
    ///
    /// Returns error if the encoded message exceeds the size limit
    pub fn encode(&self) -> Result<Bytes, SignalingError> {
        let (payload, meta) = match &self.body {
            SignalBody::Offer { description, meta } => (to_value(description)?, meta.clone()),
            SignalBody::Answer(description) => (to_value(description)?, None),
            SignalBody::Candidate(candidate) => (to_value(candidate)?, None),
            SignalBody::Bye { reason } => (
                to_value(&ByePayload {
                    reason: reason.clone(),
                })?,
                None,
            ),
        };
        let wire = WireSignal {
            kind: self.kind(),
            payload,
            from: self.from.clone(),
            to: self.to.clone(),
            meta,
            call: self.call,
        };
        let bytes =
            serde_json::to_vec(&wire).map_err(|e| SignalingError::Malformed(e.to_string()))?;
        if bytes.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(SignalingError::TooLarge(bytes.len()));
        }
        Ok(Bytes::from(bytes))
    }

    /// Decode and validate a raw payload
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Malformed`] for anything that is not a
    /// well-formed message of a known type
    pub fn decode(raw: &[u8]) -> Result<Self, SignalingError> {
        if raw.len() > MAX_SIGNALING_MESSAGE_SIZE {
            return Err(SignalingError::Malformed(format!(
                "{} bytes exceeds the {} byte limit",
                raw.len(),
                MAX_SIGNALING_MESSAGE_SIZE
            )));
        }
        let wire: WireSignal<I> =
            serde_json::from_slice(raw).map_err(|e| SignalingError::Malformed(e.to_string()))?;

        let body = match wire.kind {
            SignalKind::Offer => {
                let description: SessionDescription = from_value(wire.payload)?;
                if description.kind != SdpKind::Offer {
                    return Err(SignalingError::Malformed(
                        "offer message carries an answer description".to_string(),
                    ));
                }
                SignalBody::Offer {
                    description,
                    meta: wire.meta,
                }
            }
            SignalKind::Answer => {
                let description: SessionDescription = from_value(wire.payload)?;
                if description.kind != SdpKind::Answer {
                    return Err(SignalingError::Malformed(
                        "answer message carries an offer description".to_string(),
                    ));
                }
                SignalBody::Answer(description)
            }
            SignalKind::Candidate => SignalBody::Candidate(from_value(wire.payload)?),
            SignalKind::Bye => {
                let bye: ByePayload = if wire.payload.is_null() {
                    ByePayload { reason: None }
                } else {
                    from_value(wire.payload)?
                };
                SignalBody::Bye { reason: bye.reason }
            }
        };

        Ok(Self {
            body,
            from: wire.from,
            to: wire.to,
            call: wire.call,
        })
    }
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, SignalingError> {
    serde_json::to_value(value).map_err(|e| SignalingError::Malformed(e.to_string()))
}

fn from_value<T: for<'de> Deserialize<'de>>(value: serde_json::Value) -> Result<T, SignalingError> {
    serde_json::from_value(value).map_err(|e| SignalingError::Malformed(e.to_string()))
}

/// Callback receiving every accepted message on a channel
pub type SignalHandler<I> = Arc<dyn Fn(SignalMessage<I>) + Send + Sync>;

enum Phase {
    Idle,
    Subscribing,
    Live(JoinHandle<()>),
    Destroyed,
}

/// Filtered signaling endpoint bound to one topic
///
/// Delivers only messages that pass [`SignalMessage::is_addressed_to`] for the
/// local participant. No de-duplication happens here: the transport is
/// at-least-once and only the session knows which repeats are harmless.
pub struct SignalingChannel<I: PeerIdentity> {
    topic: Topic,
    local: I,
    transport: Arc<dyn PubSubTransport>,
    attempts: u32,
    phase: Mutex<Phase>,
}

impl<I: PeerIdentity> SignalingChannel<I> {
    /// Create a channel; nothing is delivered until [`subscribe`](Self::subscribe)
    pub fn new(
        transport: Arc<dyn PubSubTransport>,
        topic: Topic,
        local: I,
        delivery_attempts: u32,
    ) -> Self {
        Self {
            topic,
            local,
            transport,
            attempts: delivery_attempts.max(1),
            phase: Mutex::new(Phase::Idle),
        }
    }

    /// Topic this channel is bound to
    #[must_use]
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Local participant
    #[must_use]
    pub fn local(&self) -> &I {
        &self.local
    }

    /// Whether a subscription is currently delivering
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Live(_))
    }

    /// Start delivering accepted messages to `handler`
    ///
    /// Calling this again while subscribed (or while a subscription is being
    /// established) is a no-op; the first handler stays in place.
    ///
    /// # Errors
    ///
    /// Returns error if the channel was destroyed or the transport refused
    #[tracing::instrument(skip(self, handler), fields(topic = %self.topic))]
    pub async fn subscribe(&self, handler: SignalHandler<I>) -> Result<(), SignalingError> {
        {
            let mut phase = self.phase.lock();
            match *phase {
                Phase::Idle => *phase = Phase::Subscribing,
                Phase::Subscribing | Phase::Live(_) => {
                    tracing::debug!("Already subscribed");
                    return Ok(());
                }
                Phase::Destroyed => return Err(SignalingError::Closed),
            }
        }

        let mut stream = match self.transport.subscribe(&self.topic).await {
            Ok(stream) => stream,
            Err(e) => {
                let mut phase = self.phase.lock();
                if matches!(*phase, Phase::Subscribing) {
                    *phase = Phase::Idle;
                }
                return Err(SignalingError::Subscribe(e));
            }
        };

        let mut phase = self.phase.lock();
        if matches!(*phase, Phase::Destroyed) {
            tracing::debug!("Channel destroyed while subscribing");
            return Err(SignalingError::Closed);
        }

        let topic = self.topic.clone();
        let local = self.local.clone();
        let reader = tokio::spawn(async move {
            while let Some(raw) = stream.next().await {
                match SignalMessage::<I>::decode(&raw) {
                    Ok(message) if message.is_addressed_to(&local) => {
                        tracing::trace!(topic = %topic, kind = %message.kind(), from = %message.from, "Delivering signal");
                        handler(message);
                    }
                    Ok(message) => {
                        tracing::trace!(topic = %topic, kind = %message.kind(), from = %message.from, "Ignoring signal not meant for us");
                    }
                    Err(e) => {
                        tracing::warn!(topic = %topic, error = %e, "Dropping malformed signal");
                    }
                }
            }
            tracing::debug!(topic = %topic, "Subscription stream ended");
        });
        *phase = Phase::Live(reader);
        tracing::info!("Subscribed to signaling channel");
        Ok(())
    }

    /// Send `body` to `to`, stamped with the local participant as sender
    ///
    /// A failed publish is retried up to the configured attempt count.
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Delivery`] once every attempt failed
    pub async fn send(&self, to: &I, body: SignalBody) -> Result<(), SignalingError> {
        self.publish(to, None, body).await
    }

    /// Like [`send`](Self::send), tagged with the call attempt `call`
    ///
    /// # Errors
    ///
    /// Returns [`SignalingError::Delivery`] once every attempt failed
    pub async fn send_for_call(
        &self,
        to: &I,
        call: CallId,
        body: SignalBody,
    ) -> Result<(), SignalingError> {
        self.publish(to, Some(call), body).await
    }

    #[tracing::instrument(skip(self, to, body), fields(topic = %self.topic, kind = %body.kind(), to = %to, call = ?call))]
    async fn publish(
        &self,
        to: &I,
        call: Option<CallId>,
        body: SignalBody,
    ) -> Result<(), SignalingError> {
        if matches!(*self.phase.lock(), Phase::Destroyed) {
            return Err(SignalingError::Closed);
        }

        let message = SignalMessage {
            body,
            from: self.local.clone(),
            to: Some(to.clone()),
            call,
        };
        let bytes = message.encode()?;

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            match self.transport.publish(&self.topic, bytes.clone()).await {
                Ok(()) => {
                    tracing::debug!(attempt, "Signal sent");
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Signal publish failed");
                    last_error = Some(e);
                }
            }
        }

        Err(SignalingError::Delivery {
            attempts: self.attempts,
            source: last_error
                .unwrap_or_else(|| TransportError::SendError("no attempt made".to_string())),
        })
    }

    /// Release the transport subscription
    ///
    /// Idempotent; safe before anything was delivered.
    pub fn destroy(&self) {
        let previous = std::mem::replace(&mut *self.phase.lock(), Phase::Destroyed);
        match previous {
            Phase::Live(reader) => {
                reader.abort();
                tracing::info!(topic = %self.topic, "Destroyed signaling channel");
            }
            Phase::Idle | Phase::Subscribing => {
                tracing::debug!(topic = %self.topic, "Destroyed unsubscribed channel");
            }
            Phase::Destroyed => {}
        }
    }

    /// Whether [`destroy`](Self::destroy) has run
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        matches!(*self.phase.lock(), Phase::Destroyed)
    }
}

impl<I: PeerIdentity> Drop for SignalingChannel<I> {
    fn drop(&mut self) {
        if let Phase::Live(reader) = std::mem::replace(self.phase.get_mut(), Phase::Destroyed) {
            reader.abort();
        }
    }
}
