//! Peerlink core: envelopes, wire codec, tick scheduler, inbound dispatch, connection registry
//! and P2P data channels. Host-driven: no socket I/O; the host supplies an [`Outbound`] and
//! calls [`Hub::tick`].

pub mod dispatch;
pub mod hub;
pub mod p2p;
pub mod peer;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod wire;

pub use dispatch::Inbound;
pub use hub::{Context, Hub, Outbound, SendError, Transport, DEFAULT_MAX_FRAMES_PER_TICK};
pub use peer::{ChannelId, PeerId};
pub use protocol::{Discovery, Envelope, Payload, PayloadType, PeerNotice, PROTOCOL_VERSION};
pub use scheduler::{
    CallbackKind, ModuleId, ModuleRef, Notification, NotificationId, Participant, PendingResult,
};
pub use wire::{
    decode_datagram, decode_frame, encode_datagram, encode_frame, FrameBuffer, FrameDecodeError,
    FrameEncodeError,
};
