//! Connection/session registry: peer identity <-> live stream link, plus the pending
//! (handshake not finished) and dialing sets and the last-seen datagram addresses.
//!
//! Pure data. The network worker owns the links; the registry only holds weak references,
//! so a link dropped by the worker simply stops resolving.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Instant;

use crate::peer::PeerId;

/// Worker-assigned handle of one stream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// Which side opened the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    /// We dialed after a port advertisement.
    Dialed,
    /// The remote dialed our listener.
    Accepted,
}

#[derive(Debug)]
struct ConnectionRecord<H> {
    link: Weak<H>,
    provenance: Provenance,
    /// Every remote identity reachable over this link.
    peers: BTreeSet<PeerId>,
}

#[derive(Debug)]
struct PendingLink<H> {
    link: Weak<H>,
    provenance: Provenance,
    deadline: Instant,
}

/// Result of admitting a link whose identity handshake completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// New record; `newly_linked` went from unreachable to reachable.
    Admitted { newly_linked: Vec<PeerId> },
    /// An existing link already covers this node; close the new link.
    Folded { into: LinkId, newly_linked: Vec<PeerId> },
    /// The new link wins the dual-dial tie-break; close `old` without a disconnect notice.
    Replaced { old: LinkId, newly_linked: Vec<PeerId> },
    /// Unknown or already expired link.
    Rejected,
}

#[derive(Debug)]
pub struct Registry<H> {
    next_link: u64,
    records: BTreeMap<LinkId, ConnectionRecord<H>>,
    by_peer: HashMap<PeerId, LinkId>,
    pending: BTreeMap<LinkId, PendingLink<H>>,
    dialing: HashMap<PeerId, Instant>,
    datagram_addrs: HashMap<PeerId, SocketAddr>,
}

impl<H> Default for Registry<H> {
    fn default() -> Self {
        Self {
            next_link: 0,
            records: BTreeMap::new(),
            by_peer: HashMap::new(),
            pending: BTreeMap::new(),
            dialing: HashMap::new(),
            datagram_addrs: HashMap::new(),
        }
    }
}

impl<H> Registry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId(self.next_link)
    }

    pub fn is_linked(&self, peer: &PeerId) -> bool {
        self.by_peer.contains_key(peer)
    }

    pub fn is_dialing(&self, peer: &PeerId) -> bool {
        self.dialing.contains_key(peer)
    }

    /// Mark `peer` as being dialed until `deadline`. False when already linked or dialing.
    pub fn begin_dial(&mut self, peer: PeerId, deadline: Instant) -> bool {
        if self.is_linked(&peer) || self.is_dialing(&peer) {
            return false;
        }
        self.dialing.insert(peer, deadline);
        true
    }

    pub fn finish_dial(&mut self, peer: &PeerId) {
        self.dialing.remove(peer);
    }

    /// A dial to `peer` failed: hold off further dials until `retry_at`.
    pub fn dial_failed(&mut self, peer: &PeerId, retry_at: Instant) {
        if !self.is_linked(peer) {
            self.dialing.insert(peer.clone(), retry_at);
        }
    }

    /// Track a link whose identity handshake has not finished yet.
    pub fn add_pending(&mut self, id: LinkId, link: Weak<H>, provenance: Provenance, deadline: Instant) {
        self.pending.insert(
            id,
            PendingLink {
                link,
                provenance,
                deadline,
            },
        );
    }

    pub fn is_pending(&self, id: LinkId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Promote a pending link once the remote's identity set is known.
    ///
    /// Two nodes that dial each other at the same time end up with two links. Both sides keep
    /// the link whose dialer has the lower minimum identity, so they agree without talking.
    pub fn admit(&mut self, id: LinkId, ids: &[PeerId], local_min: &PeerId) -> Admission {
        let Some(pending) = self.pending.remove(&id) else {
            return Admission::Rejected;
        };
        let ids: BTreeSet<PeerId> = ids.iter().filter(|p| !p.is_empty()).cloned().collect();
        let Some(remote_min) = ids.iter().next().cloned() else {
            return Admission::Rejected;
        };
        for peer in &ids {
            self.dialing.remove(peer);
        }
        let newly_linked: Vec<PeerId> = ids.iter().filter(|p| !self.is_linked(p)).cloned().collect();
        let existing = ids.iter().find_map(|p| self.by_peer.get(p).copied());

        let Some(old) = existing else {
            self.insert_record(id, pending.link, pending.provenance, ids);
            return Admission::Admitted { newly_linked };
        };
        let Some(old_record) = self.records.get(&old) else {
            self.insert_record(id, pending.link, pending.provenance, ids);
            return Admission::Admitted { newly_linked };
        };

        let dialer = |provenance: Provenance, remote: &PeerId| match provenance {
            Provenance::Dialed => local_min.clone(),
            Provenance::Accepted => remote.clone(),
        };
        let old_remote_min = old_record.peers.iter().next().cloned().unwrap_or_else(|| remote_min.clone());
        let new_dialer = dialer(pending.provenance, &remote_min);
        let old_dialer = dialer(old_record.provenance, &old_remote_min);

        if pending.provenance != old_record.provenance && new_dialer < old_dialer {
            let mut peers = self.records.remove(&old).map(|r| r.peers).unwrap_or_default();
            peers.extend(ids);
            self.insert_record(id, pending.link, pending.provenance, peers);
            Admission::Replaced { old, newly_linked }
        } else {
            if let Some(record) = self.records.get_mut(&old) {
                for peer in &ids {
                    record.peers.insert(peer.clone());
                }
            }
            for peer in ids {
                self.by_peer.insert(peer, old);
            }
            Admission::Folded {
                into: old,
                newly_linked,
            }
        }
    }

    fn insert_record(
        &mut self,
        id: LinkId,
        link: Weak<H>,
        provenance: Provenance,
        peers: BTreeSet<PeerId>,
    ) {
        for peer in &peers {
            self.by_peer.insert(peer.clone(), id);
        }
        self.records.insert(
            id,
            ConnectionRecord {
                link,
                provenance,
                peers,
            },
        );
    }

    /// Identity advert over datagrams: add ids to the link already covering any of them.
    /// Never creates a link. Returns ids that became reachable.
    pub fn fold_identities(&mut self, ids: &[PeerId]) -> Vec<PeerId> {
        let Some(link) = ids.iter().find_map(|p| self.by_peer.get(p).copied()) else {
            return Vec::new();
        };
        let Some(record) = self.records.get_mut(&link) else {
            return Vec::new();
        };
        let mut added = Vec::new();
        for peer in ids.iter().filter(|p| !p.is_empty()) {
            if record.peers.insert(peer.clone()) {
                added.push(peer.clone());
            }
            self.by_peer.insert(peer.clone(), link);
        }
        added
    }

    /// Forget a link. Returns the identities that lost their route.
    pub fn remove(&mut self, id: LinkId) -> Vec<PeerId> {
        self.pending.remove(&id);
        let Some(record) = self.records.remove(&id) else {
            return Vec::new();
        };
        let mut lost = Vec::new();
        for peer in record.peers {
            if self.by_peer.get(&peer) == Some(&id) {
                self.by_peer.remove(&peer);
                lost.push(peer);
            }
        }
        lost
    }

    /// Drop pending links and dial markers past their deadline. Returns the links to close.
    pub fn expire(&mut self, now: Instant) -> Vec<LinkId> {
        self.dialing.retain(|_, deadline| *deadline > now);
        let expired: Vec<LinkId> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            self.pending.remove(id);
        }
        expired
    }

    /// Remember where datagrams from `peer` come from.
    pub fn touch(&mut self, peer: &PeerId, addr: SocketAddr) {
        self.datagram_addrs.insert(peer.clone(), addr);
    }

    pub fn datagram_addr(&self, peer: &PeerId) -> Option<SocketAddr> {
        self.datagram_addrs.get(peer).copied()
    }

    /// True when a linked identity last sent datagrams from `addr`, i.e. the node there is
    /// already reachable even if it now advertises under an identity we have not seen.
    pub fn is_linked_at(&self, addr: SocketAddr) -> bool {
        self.datagram_addrs
            .iter()
            .any(|(peer, a)| *a == addr && self.is_linked(peer))
    }

    pub fn link_id_for(&self, peer: &PeerId) -> Option<LinkId> {
        self.by_peer.get(peer).copied()
    }

    /// Live handle for `peer`, if its link is still up.
    pub fn link_for(&self, peer: &PeerId) -> Option<Arc<H>> {
        self.by_peer
            .get(peer)
            .and_then(|id| self.records.get(id))
            .and_then(|r| r.link.upgrade())
    }

    /// Every remote identity with a link, sorted.
    pub fn linked_peers(&self) -> Vec<PeerId> {
        let mut out: Vec<PeerId> = self.by_peer.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn link_count(&self) -> usize {
        self.records.len()
    }
}
