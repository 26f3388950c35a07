//! Peerlink LAN node: socket layer, discovery and the background network pump.
//! [`Network`] implements [`peerlink_core::Outbound`]; pair it with a [`peerlink_core::Hub`].

pub mod config;
pub mod discovery;
pub mod network;
mod pump;
pub mod socket;

pub use config::NodeConfig;
pub use network::{Network, StartError};
