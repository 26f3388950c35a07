//! Peer identities and inbound channel partition keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque printable identity of one process-level user. Used as map key and wire field;
/// never derived from a host address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    /// Mint a fresh random identity (uuid v4, simple form).
    pub fn generate() -> Self {
        PeerId(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_owned())
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        PeerId(s)
    }
}

/// Partition key routing inbound envelopes to per-peer / per-feature queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub i32);

impl ChannelId {
    /// Reserved for non-partitioned discovery traffic; never dispatched to listeners.
    pub const UNSET: ChannelId = ChannelId(-1);
    /// Channel used when the feature layer made no assignment.
    pub const DEFAULT: ChannelId = ChannelId(0);

    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
