//! Participant identity abstraction
//!
//! Call participants are addressed by an application-defined identity. The
//! signaling layer only needs to compare identities, render them into topic
//! names and carry them on the wire, so any type meeting [`PeerIdentity`] can be
//! plugged in (account uuids, four-word addresses, plain strings in tests).

use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display};

/// Identity of a call participant
///
/// Two identities are the same participant exactly when they compare equal.
/// The string representation must be stable: both sides of a call derive the
/// shared [`Topic`](crate::types::Topic) from it without a rendezvous step.
pub trait PeerIdentity:
    Clone
    + Debug
    + Display
    + PartialEq
    + Eq
    + Serialize
    + for<'de> Deserialize<'de>
    + Send
    + Sync
    + 'static
{
    /// Convert the identity to its stable string representation
    fn to_string_repr(&self) -> String;

    /// Try to create an identity from its string representation
    fn from_string_repr(s: &str) -> anyhow::Result<Self>
    where
        Self: Sized;
}

/// String-based participant identity
///
/// Serializes as a bare JSON string, which is what the chat backend puts in the
/// `from`/`to` fields of signaling messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerIdentityString(pub String);

impl PeerIdentityString {
    /// Create a new string-based identity
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerIdentityString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl PeerIdentity for PeerIdentityString {
    fn to_string_repr(&self) -> String {
        self.0.clone()
    }

    fn from_string_repr(s: &str) -> anyhow::Result<Self> {
        if s.trim().is_empty() {
            anyhow::bail!("participant identity cannot be empty");
        }
        Ok(Self(s.to_string()))
    }
}

impl From<&str> for PeerIdentityString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for PeerIdentityString {
    fn from(s: String) -> Self {
        Self(s)
    }
}
