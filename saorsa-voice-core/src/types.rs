//! Call signaling types and data structures

use crate::identity::PeerIdentity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for one call attempt
///
/// Every session gets a fresh id; it doubles as the generation tag that lets
/// the orchestrator tell a live session apart from a superseded one on the
/// same topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Signaling topic shared by exactly two participants
///
/// Derived by sorting both identities and joining them, so caller and callee
/// compute the same name independently.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Prefix of every call topic
    pub const PREFIX: &'static str = "call";

    /// Derive the topic for a pair of participants
    ///
    /// The result does not depend on argument order.
    pub fn between<I: PeerIdentity>(a: &I, b: &I) -> Self {
        let (a, b) = (a.to_string_repr(), b.to_string_repr());
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        Self(format!("{}-{}-{}", Self::PREFIX, lo, hi))
    }

    /// Topic name as used on the pub/sub transport
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Call session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallState {
    /// Session created, nothing negotiated yet
    Idle,
    /// Local offer sent, waiting for the answer
    Offering,
    /// Answer sent, waiting for the link to come up
    Answering,
    /// Media path established
    Connected,
    /// Terminal
    Closed,
}

impl CallState {
    /// Whether offer/answer negotiation is still in progress
    #[must_use]
    pub fn is_negotiating(self) -> bool {
        matches!(self, Self::Idle | Self::Offering | Self::Answering)
    }

    /// Whether the session has reached its terminal state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Offering => "offering",
            Self::Answering => "answering",
            Self::Connected => "connected",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Which side of the negotiation a session plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionRole {
    /// Creates the offer
    Caller,
    /// Answers a buffered offer
    Callee,
}

/// Opaque UI payload carried with an offer
///
/// Typically the caller's display name and a message preview. The signaling
/// layer never looks inside.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallMetadata(pub serde_json::Value);

impl CallMetadata {
    /// Wrap an arbitrary JSON value
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    /// Borrow the raw value
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

/// Kind of session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// One side's media and network parameters
///
/// Serialized the way browsers serialize `RTCSessionDescriptionInit`, so
/// payloads from web clients decode unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub kind: SdpKind,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Network path candidate
///
/// Field names follow `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    /// ICE username fragment
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    /// Candidate with only the candidate line set
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Remote media track announced by the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTrack {
    /// Track id
    pub track_id: String,
    /// Stream the track belongs to
    pub stream_id: String,
    /// Media kind (`audio`, `video`)
    pub kind: String,
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallEndReason {
    /// Hung up locally
    LocalHangUp,
    /// The other participant hung up
    RemoteHangUp,
    /// Incoming call declined locally
    Declined,
    /// Not connected within the configured window
    Timeout,
    /// Negotiation, delivery or path failure
    Failed(String),
    /// Orchestrator shut down
    Shutdown,
}

impl fmt::Display for CallEndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalHangUp => f.write_str("hung up"),
            Self::RemoteHangUp => f.write_str("remote hung up"),
            Self::Declined => f.write_str("declined"),
            Self::Timeout => f.write_str("timed out"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
            Self::Shutdown => f.write_str("shut down"),
        }
    }
}

/// Notification for the UI collaborator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "I: PeerIdentity")]
pub enum CallEvent<I: PeerIdentity> {
    /// An offer arrived on an idle topic
    IncomingCall {
        /// Topic to pass to `accept_call` / `decline_call`
        topic: Topic,
        /// Caller
        from: I,
        /// Caller-supplied UI metadata
        meta: Option<CallMetadata>,
        /// When the offer arrived
        received_at: DateTime<Utc>,
    },
    /// Session reached `Connected`
    CallConnected {
        /// Topic
        topic: Topic,
        /// Session
        call_id: CallId,
    },
    /// Session or pending offer is gone
    CallEnded {
        /// Topic
        topic: Topic,
        /// Why
        reason: CallEndReason,
    },
    /// The peer's media arrived
    RemoteTrack {
        /// Topic
        topic: Topic,
        /// Track description
        track: RemoteTrack,
    },
    /// A signaling message could not be delivered after retrying
    DeliveryFailed {
        /// Topic
        topic: Topic,
        /// Message type that was lost
        message_type: String,
        /// Transport error
        error: String,
    },
}

impl<I: PeerIdentity> CallEvent<I> {
    /// Topic the event refers to
    pub fn topic(&self) -> &Topic {
        match self {
            Self::IncomingCall { topic, .. }
            | Self::CallConnected { topic, .. }
            | Self::CallEnded { topic, .. }
            | Self::RemoteTrack { topic, .. }
            | Self::DeliveryFailed { topic, .. } => topic,
        }
    }
}
