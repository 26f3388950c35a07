//! Public handle over the network pump. Implements [`Outbound`] so a [`Hub`](peerlink_core::Hub)
//! can send through it from the host thread.

use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use peerlink_core::{
    encode_datagram, encode_frame, ChannelId, Envelope, Inbound, Outbound, PeerId, SendError,
    Transport,
};

use crate::config::NodeConfig;
use crate::pump::{self, Shared};
use crate::socket::{Pollable, SocketError};

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("cannot create network worker: {0}")]
    Runtime(io::Error),
    #[error("no free {socket} port in {first}..+{count}")]
    PortRangeExhausted {
        socket: &'static str,
        first: u16,
        count: u16,
    },
    #[error(transparent)]
    Socket(#[from] SocketError),
    #[error("network worker exited during startup")]
    WorkerGone,
}

/// Running network: background worker plus the send path. Dropping it stops the worker.
pub struct Network {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Network {
    /// Bind sockets on a new worker thread and start advertising.
    pub fn start(config: NodeConfig) -> Result<Self, StartError> {
        let (shared, handle) = pump::spawn(config)?;
        Ok(Self {
            shared,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Inbound queues filled by the worker; hand this to [`peerlink_core::Hub::new`].
    pub fn inbound(&self) -> Arc<Inbound> {
        self.shared.inbound.clone()
    }

    pub fn add_local_peer(&self, id: PeerId) {
        tracing::info!(peer = %id, "hosting identity");
        self.shared.locals.lock().insert(id);
        self.shared.wake.notify_one();
    }

    pub fn remove_local_peer(&self, id: &PeerId) {
        self.shared.locals.lock().remove(id);
        self.shared.inbound.clear_default_channel(id);
    }

    /// Route envelopes addressed to local `id` (and broadcasts) onto `channel`.
    pub fn set_default_channel(&self, id: PeerId, channel: ChannelId) {
        self.shared.inbound.set_default_channel(id, channel);
    }

    pub fn set_advertise(&self, on: bool) {
        self.shared.advertise.store(on, Ordering::Release);
    }

    pub fn listen_port(&self) -> u16 {
        self.shared.listen_port
    }

    pub fn discovery_port(&self) -> u16 {
        self.shared.datagram.port()
    }

    pub fn linked_peers(&self) -> Vec<PeerId> {
        self.shared.registry.lock().linked_peers()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.shared.config
    }

    /// Stop the worker and wait for it. Idempotent.
    pub fn stop(&self) {
        self.shared.stop();
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                tracing::error!("network worker panicked");
            }
        }
    }

    fn stamp(&self, env: &Envelope) -> Envelope {
        let mut env = env.clone();
        if env.app_id.is_empty() {
            env.app_id = self.shared.config.app_id.clone();
        }
        env
    }

    fn send_reliable(&self, dest: &PeerId, env: &Envelope) -> Result<(), SendError> {
        let link = self
            .shared
            .registry
            .lock()
            .link_for(dest)
            .ok_or_else(|| SendError::NoRoute(dest.clone()))?;
        let frame = encode_frame(env)?;
        link.send_frame(&frame)
            .map_err(|e| SendError::Transport(e.to_string()))?;
        if link.wants_write() {
            self.shared.wake.notify_one();
        }
        Ok(())
    }
}

impl Outbound for Network {
    fn send_to_one_peer(&self, env: &Envelope, transport: Transport) -> Result<(), SendError> {
        if self.shared.is_stopped() {
            return Err(SendError::Stopped);
        }
        if env.source.is_empty() {
            return Err(SendError::EmptySource);
        }
        let dest = env
            .destination
            .clone()
            .ok_or(SendError::MissingDestination)?;
        let env = self.stamp(env);

        if self.shared.locals.lock().contains(&dest) {
            let bytes = encode_datagram(&env)?;
            return self
                .shared
                .loopback
                .send(bytes)
                .map_err(|_| SendError::Stopped);
        }

        if transport == Transport::Unreliable {
            let addr = self.shared.registry.lock().datagram_addr(&dest);
            if let Some(addr) = addr {
                match encode_datagram(&env)
                    .map_err(SendError::from)
                    .and_then(|b| {
                        self.shared
                            .datagram
                            .try_send_to(&b, addr)
                            .map_err(|e| SendError::Transport(e.to_string()))
                    }) {
                    Ok(_) => return Ok(()),
                    Err(e) => tracing::debug!(peer = %dest, error = %e, "datagram send failed, using stream"),
                }
            }
        }
        self.send_reliable(&dest, &env)
    }

    fn send_to_all_known_peers(&self, env: &Envelope) -> BTreeSet<PeerId> {
        if env.source.is_empty() {
            tracing::warn!(payload = ?env.payload_type(), "refusing fan-out without a source");
            return BTreeSet::new();
        }
        let mut targets: BTreeSet<PeerId> = self.linked_peers().into_iter().collect();
        targets.extend(self.shared.locals());
        targets.remove(&env.source);
        let mut sent = BTreeSet::new();
        for peer in targets {
            let mut copy = env.clone();
            copy.destination = Some(peer.clone());
            match self.send_to_one_peer(&copy, Transport::Reliable) {
                Ok(()) => {
                    sent.insert(peer);
                }
                Err(e) => tracing::debug!(peer = %peer, error = %e, "fan-out send failed"),
            }
        }
        sent
    }

    fn broadcast(&self, env: &Envelope) -> Result<(), SendError> {
        if self.shared.is_stopped() {
            return Err(SendError::Stopped);
        }
        let bytes = encode_datagram(&self.stamp(env))?;
        let mut last_err = None;
        let mut delivered = false;
        for target in &self.shared.targets {
            match self.shared.datagram.try_send_to(&bytes, *target) {
                Ok(_) => delivered = true,
                Err(e) => last_err = Some(e),
            }
        }
        match (delivered, last_err) {
            (false, Some(e)) => Err(SendError::Transport(e.to_string())),
            _ => Ok(()),
        }
    }

    fn local_peers(&self) -> Vec<PeerId> {
        self.shared.locals().into_iter().collect()
    }
}

impl Drop for Network {
    fn drop(&mut self) {
        self.stop();
    }
}
