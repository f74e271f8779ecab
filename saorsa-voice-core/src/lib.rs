//! Saorsa Voice - one-to-one voice call signaling over publish/subscribe
//!
//! Two participants meet on a deterministic topic derived from their
//! identities, exchange offer/answer/candidate/bye messages over any
//! publish/subscribe transport, and hand the media path to a peer connection.
//!
//! - **Signaling channel**: per-topic JSON envelopes with retried delivery
//! - **Call session**: per-call negotiation state machine with candidate
//!   buffering, connect timeout and idempotent teardown
//! - **Call orchestrator**: one session per topic, incoming offer handling
//!   and event fan-out to the application
//!
//! Media capture and the peer connection are collaborators behind traits.
//! The `webrtc-backend` feature provides implementations on top of the
//! `webrtc` crate; [`loopback`] provides in-process ones for tests and demos.
//!
//! # Examples
//!
//! ```rust,no_run
//! use saorsa_voice_core::loopback::{LoopbackBroker, SimulatedConnector, SimulatedMedia};
//! use saorsa_voice_core::{CallEvent, CallOrchestrator, PeerIdentityString};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let broker = Arc::new(LoopbackBroker::new());
//! let alice = CallOrchestrator::builder(PeerIdentityString::new("alice"), broker.clone())
//!     .with_media(Arc::new(SimulatedMedia::new()))
//!     .with_connector(Arc::new(SimulatedConnector::new()))
//!     .build()?;
//! let bob = CallOrchestrator::builder(PeerIdentityString::new("bob"), broker)
//!     .with_media(Arc::new(SimulatedMedia::new()))
//!     .with_connector(Arc::new(SimulatedConnector::new()))
//!     .build()?;
//!
//! let mut bob_events = bob.subscribe_events();
//! bob.listen(&PeerIdentityString::new("alice")).await?;
//! alice.start_call(PeerIdentityString::new("bob"), None).await?;
//!
//! if let CallEvent::IncomingCall { topic, .. } = bob_events.recv().await? {
//!     bob.accept_call(&topic).await?;
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::unused_async)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::derivable_impls)]

/// Peer identity abstraction
pub mod identity;

/// Core call types and events
pub mod types;

/// Call configuration
pub mod config;

/// Publish/subscribe transport contract
pub mod transport;

/// Per-topic signaling channel
pub mod signaling;

/// Local media contract
pub mod media;

/// Peer connection contract
pub mod connection;

/// Per-call negotiation state machine
pub mod session;

/// Top-level call controller
pub mod orchestrator;

/// In-process transport, media and connection implementations
pub mod loopback;

/// WebRTC-backed media and connections (requires webrtc-backend feature)
#[cfg(feature = "webrtc-backend")]
pub mod rtc;

// Re-export main types at crate root
pub use config::{CallConfig, ConfigError, IceServer, DEFAULT_STUN_SERVER};
pub use connection::{ConnectionError, LinkEvent, LinkEventSink, PeerConnector, PeerLink};
pub use identity::{PeerIdentity, PeerIdentityString};
pub use media::{LocalAudio, LocalTrack, MediaError, MediaSource};
pub use orchestrator::{CallError, CallOrchestrator, CallOrchestratorBuilder};
#[cfg(feature = "webrtc-backend")]
pub use rtc::{RtcConnector, RtcLink, RtcLocalAudio, RtcMediaSource};
pub use session::SessionError;
pub use signaling::{
    SignalBody, SignalKind, SignalMessage, SignalingChannel, SignalingError,
    MAX_SIGNALING_MESSAGE_SIZE,
};
pub use transport::{PubSubTransport, Subscription, TransportError};
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::CallConfig;
    pub use crate::identity::{PeerIdentity, PeerIdentityString};
    pub use crate::media::MediaSource;
    pub use crate::connection::PeerConnector;
    pub use crate::orchestrator::{CallError, CallOrchestrator, CallOrchestratorBuilder};
    pub use crate::transport::PubSubTransport;
    pub use crate::types::{CallEndReason, CallEvent, CallId, CallMetadata, CallState, Topic};
}
