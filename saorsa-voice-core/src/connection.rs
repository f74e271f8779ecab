//! Peer connection contract
//!
//! The session drives negotiation through a [`PeerLink`] created by a
//! [`PeerConnector`]. Links report asynchronous happenings (local candidates,
//! remote tracks, connectivity changes) through the [`LinkEventSink`] they were
//! created with; the session consumes those events from the same queue as
//! signaling messages.

use crate::config::CallConfig;
use crate::media::LocalAudio;
use crate::types::{IceCandidate, RemoteTrack, SessionDescription};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Connection errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// Connection object could not be built
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Offer/answer step rejected
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Candidate rejected by the connection
    #[error("Invalid candidate: {0}")]
    InvalidCandidate(String),

    /// Path failed after negotiation
    #[error("Connection failed: {0}")]
    Failed(String),

    /// Connection already closed
    #[error("Connection closed")]
    Closed,
}

/// Something the link wants the session to know
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    /// A local candidate to forward to the peer
    LocalCandidate(IceCandidate),
    /// The peer's media arrived
    RemoteTrack(RemoteTrack),
    /// Direct path established
    Connected,
    /// Connection closed underneath the session
    Closed,
    /// Path or negotiation failure
    Failed(String),
}

/// Where a link sends its [`LinkEvent`]s
#[derive(Clone)]
pub struct LinkEventSink {
    emit: Arc<dyn Fn(LinkEvent) + Send + Sync>,
}

impl LinkEventSink {
    /// Wrap a callback
    pub fn new(emit: impl Fn(LinkEvent) + Send + Sync + 'static) -> Self {
        Self {
            emit: Arc::new(emit),
        }
    }

    /// Deliver one event
    pub fn emit(&self, event: LinkEvent) {
        (self.emit)(event);
    }
}

impl fmt::Debug for LinkEventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkEventSink").finish_non_exhaustive()
    }
}

/// One point-to-point connection attempt
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Attach the local microphone
    async fn add_local_audio(&self, audio: &dyn LocalAudio) -> Result<(), ConnectionError>;

    /// Create an offer description
    async fn create_offer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Create an answer to the applied remote offer
    async fn create_answer(&self) -> Result<SessionDescription, ConnectionError>;

    /// Apply a locally created description
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    /// Apply the peer's description
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), ConnectionError>;

    /// Apply a peer candidate; only valid after the remote description
    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), ConnectionError>;

    /// Tear the connection down
    async fn close(&self);
}

/// Connection collaborator
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Build a link that reports to `events`
    async fn create(
        &self,
        config: &CallConfig,
        events: LinkEventSink,
    ) -> Result<Box<dyn PeerLink>, ConnectionError>;
}
