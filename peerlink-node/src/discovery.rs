//! LAN discovery: periodic port/identity adverts to the broadcast targets, and classification
//! of adverts received on the discovery socket.

use std::collections::BTreeSet;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use peerlink_core::registry::Registry;
use peerlink_core::{Discovery, Envelope, Payload, PeerId, PROTOCOL_VERSION};

/// Paces advert rounds. A port advert goes out every round; identities every other round.
#[derive(Debug)]
pub struct Advertiser {
    interval: Duration,
    last: Option<Instant>,
    round: u64,
}

impl Advertiser {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            round: 0,
        }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        }
    }

    /// Time left until the next round, for bounding the worker's idle wait.
    pub fn until_due(&self, now: Instant) -> Duration {
        match self.last {
            None => Duration::ZERO,
            Some(last) => (last + self.interval).saturating_duration_since(now),
        }
    }

    /// Build this round's adverts and advance. Empty when no identity is hosted.
    pub fn next_round(
        &mut self,
        now: Instant,
        locals: &BTreeSet<PeerId>,
        listen_port: u16,
        app_id: &str,
    ) -> Vec<Envelope> {
        self.last = Some(now);
        let round = self.round;
        self.round += 1;
        let Some(min) = locals.iter().next() else {
            return Vec::new();
        };
        let mut out = vec![Envelope::broadcast(
            min.clone(),
            Payload::Discovery(Discovery::Port {
                protocol_version: PROTOCOL_VERSION,
                port: listen_port,
            }),
        )
        .with_app_id(app_id)];
        if round % 2 == 1 {
            out.push(
                Envelope::broadcast(
                    min.clone(),
                    Payload::Discovery(Discovery::Identities {
                        protocol_version: PROTOCOL_VERSION,
                        ids: locals.iter().cloned().collect(),
                    }),
                )
                .with_app_id(app_id),
            );
        }
        out
    }
}

/// Every (target, port) pair adverts are sent to. Unparseable targets are skipped.
pub fn advert_targets(targets: &[String], first_port: u16, count: u16) -> Vec<SocketAddr> {
    let mut out = Vec::new();
    for t in targets {
        let ip: IpAddr = match t.trim().parse() {
            Ok(ip) => ip,
            Err(e) => {
                tracing::warn!(target = %t, error = %e, "ignoring broadcast target");
                continue;
            }
        };
        for port in port_range(first_port, count) {
            out.push(SocketAddr::new(ip, port));
        }
    }
    out
}

pub fn port_range(first: u16, count: u16) -> impl Iterator<Item = u16> {
    (0..count.max(1)).map_while(move |i| first.checked_add(i))
}

/// What the worker should do with a received discovery envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryAction {
    /// Unknown node advertised its listener: dial it.
    Dial(PeerId, SocketAddr),
    /// Identity list from a node we may already be linked to.
    Fold(Vec<PeerId>),
    Ignore,
}

pub fn classify<H>(
    env: &Envelope,
    from: SocketAddr,
    locals: &BTreeSet<PeerId>,
    registry: &Registry<H>,
) -> DiscoveryAction {
    let Payload::Discovery(d) = &env.payload else {
        return DiscoveryAction::Ignore;
    };
    match d {
        Discovery::Port {
            protocol_version,
            port,
        } => {
            if *protocol_version != PROTOCOL_VERSION {
                tracing::debug!(source = %env.source, version = protocol_version, "port advert version mismatch");
                return DiscoveryAction::Ignore;
            }
            let source = &env.source;
            if source.is_empty()
                || locals.contains(source)
                || registry.is_linked(source)
                || registry.is_dialing(source)
                || registry.is_linked_at(from)
            {
                return DiscoveryAction::Ignore;
            }
            DiscoveryAction::Dial(source.clone(), SocketAddr::new(from.ip(), *port))
        }
        Discovery::Identities {
            protocol_version,
            ids,
        } => {
            if *protocol_version != PROTOCOL_VERSION {
                return DiscoveryAction::Ignore;
            }
            let remote: Vec<PeerId> = ids
                .iter()
                .filter(|p| !p.is_empty() && !locals.contains(*p))
                .cloned()
                .collect();
            if remote.is_empty() {
                DiscoveryAction::Ignore
            } else {
                DiscoveryAction::Fold(remote)
            }
        }
    }
}

/// Identity list carried by a handshake frame, if it is one we understand.
pub fn handshake_ids(env: &Envelope) -> Option<Vec<PeerId>> {
    match &env.payload {
        Payload::Discovery(Discovery::Identities {
            protocol_version,
            ids,
        }) if *protocol_version == PROTOCOL_VERSION => Some(ids.clone()),
        _ => None,
    }
}
