//! Peerlink wire protocol: envelope, payload sum type, protocol version.

use serde::{Deserialize, Serialize};

use crate::peer::PeerId;

/// Current protocol version. Bumped whenever a payload variant changes shape.
pub const PROTOCOL_VERSION: u8 = 1;

/// Outer message: routing metadata plus one feature payload.
/// Encoding is bincode + lz4; framing depends on the transport (see wire module).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub source: PeerId,
    /// `None` is the broadcast marker.
    pub destination: Option<PeerId>,
    /// Application partition. Empty means "any application".
    pub app_id: String,
    pub payload: Payload,
}

impl Envelope {
    pub fn broadcast(source: PeerId, payload: Payload) -> Self {
        Self {
            source,
            destination: None,
            app_id: String::new(),
            payload,
        }
    }

    pub fn to(source: PeerId, destination: PeerId, payload: Payload) -> Self {
        Self {
            source,
            destination: Some(destination),
            app_id: String::new(),
            payload,
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination.is_none()
    }

    pub fn payload_type(&self) -> PayloadType {
        self.payload.payload_type()
    }

    /// Addressed envelopes must name who sent them; broadcasts may be anonymous.
    pub fn has_valid_source(&self) -> bool {
        self.is_broadcast() || !self.source.is_empty()
    }

    /// True when both sides name an application and the names differ.
    pub fn app_mismatch(&self, local_app: &str) -> bool {
        !self.app_id.is_empty() && !local_app.is_empty() && self.app_id != local_app
    }
}

/// Tagged union over feature domains. `Unset` is kept explicit and always dropped on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Unset,
    Discovery(Discovery),
    Peer(PeerNotice),
    P2p(P2pMessage),
    /// Feature domains below carry bodies encoded by their own modules.
    Connect(Vec<u8>),
    UserInfo(Vec<u8>),
    Friends(Vec<u8>),
    Presence(Vec<u8>),
    Stats(Vec<u8>),
    Achievements(Vec<u8>),
}

impl Payload {
    pub fn payload_type(&self) -> PayloadType {
        match self {
            Payload::Unset => PayloadType::Unset,
            Payload::Discovery(_) => PayloadType::Discovery,
            Payload::Peer(_) => PayloadType::Peer,
            Payload::P2p(_) => PayloadType::P2p,
            Payload::Connect(_) => PayloadType::Connect,
            Payload::UserInfo(_) => PayloadType::UserInfo,
            Payload::Friends(_) => PayloadType::Friends,
            Payload::Presence(_) => PayloadType::Presence,
            Payload::Stats(_) => PayloadType::Stats,
            Payload::Achievements(_) => PayloadType::Achievements,
        }
    }
}

/// Discriminant of [`Payload`]; listeners register against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PayloadType {
    Unset,
    Discovery,
    Peer,
    P2p,
    Connect,
    UserInfo,
    Friends,
    Presence,
    Stats,
    Achievements,
}

/// Discovery sub-messages. Sent with a broadcast destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Discovery {
    /// "Dial me here": reliable listener port of the sender.
    Port { protocol_version: u8, port: u16 },
    /// Every identity hosted by the sender. Also the first frame on a fresh stream (handshake).
    Identities { protocol_version: u8, ids: Vec<PeerId> },
}

/// Link notices produced locally by the network pump; source is the remote identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerNotice {
    Connected,
    Disconnected,
}

/// P2P data-channel control and data messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum P2pMessage {
    ConnectRequest { socket_name: String },
    ConnectResponse { accepted: bool },
    Data(P2pData),
    DataAck { channel: u8 },
    ConnectionClose { socket_name: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct P2pData {
    pub user_id: PeerId,
    pub socket_name: String,
    pub channel: u8,
    pub data: Vec<u8>,
}
