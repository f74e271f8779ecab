//! Local media acquisition
//!
//! Calls are audio-only. A [`MediaSource`] hands out a [`LocalAudio`] handle
//! (the microphone capture for one call); the session attaches it to the peer
//! connection and stops it exactly once when the call closes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::any::Any;
use thiserror::Error;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// Permission denied or device busy
    #[error("Device access denied: {0}")]
    DeviceAccess(String),

    /// No capture device present
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Capture pipeline failed after acquisition
    #[error("Stream error: {0}")]
    StreamError(String),
}

/// Description of one local track
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTrack {
    /// Track id
    pub id: String,
    /// Media kind (`audio`)
    pub kind: String,
}

impl LocalTrack {
    /// Audio track with the given id
    pub fn audio(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "audio".to_string(),
        }
    }
}

/// Acquired local audio for one call
pub trait LocalAudio: Send + Sync {
    /// Tracks in this capture
    fn tracks(&self) -> Vec<LocalTrack>;

    /// Stop every track
    fn stop(&mut self);

    /// Backend-specific access, used by connectors to find their native track
    fn as_any(&self) -> &dyn Any;
}

/// Media collaborator
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Acquire the local microphone
    ///
    /// May suspend for an unbounded time (a permission prompt).
    async fn acquire_local_audio(&self) -> Result<Box<dyn LocalAudio>, MediaError>;
}

/// Owns a [`LocalAudio`] and guarantees it is stopped exactly once
pub(crate) struct MediaGuard {
    audio: Option<Box<dyn LocalAudio>>,
}

impl MediaGuard {
    pub(crate) fn new(audio: Box<dyn LocalAudio>) -> Self {
        Self { audio: Some(audio) }
    }

    pub(crate) fn audio(&self) -> Option<&dyn LocalAudio> {
        self.audio.as_deref()
    }

    /// Stop the tracks; later calls do nothing
    pub(crate) fn stop(&mut self) -> bool {
        match self.audio.take() {
            Some(mut audio) => {
                let tracks = audio.tracks().len();
                audio.stop();
                tracing::debug!(tracks, "Stopped local audio");
                true
            }
            None => false,
        }
    }
}

impl Drop for MediaGuard {
    fn drop(&mut self) {
        self.stop();
    }
}
