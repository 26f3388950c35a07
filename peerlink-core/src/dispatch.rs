//! Per-channel inbound queues shared between the network worker (producer) and the
//! caller-side tick (consumer). One lock, short critical sections.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::Bound::{Excluded, Unbounded};

use parking_lot::Mutex;

use crate::peer::{ChannelId, PeerId};
use crate::protocol::{Envelope, PayloadType};

#[derive(Default)]
struct InboundState {
    queues: BTreeMap<ChannelId, VecDeque<Envelope>>,
    default_channels: HashMap<PeerId, ChannelId>,
    /// Channels with at least one listener; broadcasts fan out to them.
    listening: BTreeMap<ChannelId, usize>,
    /// Channel `take` served last; the next one after it goes first.
    last_served: Option<ChannelId>,
}

impl InboundState {
    fn broadcast_channels(&self) -> BTreeSet<ChannelId> {
        let mut out: BTreeSet<ChannelId> = self.default_channels.values().copied().collect();
        out.extend(self.listening.keys().copied());
        if out.is_empty() {
            out.insert(ChannelId::DEFAULT);
        }
        out
    }

    fn next_channel(&self) -> Option<ChannelId> {
        let after = self
            .last_served
            .and_then(|last| self.queues.range((Excluded(last), Unbounded)).next());
        after
            .or_else(|| self.queues.iter().next())
            .map(|(channel, _)| *channel)
    }
}

/// Inbound envelope queues, keyed by channel.
#[derive(Default)]
pub struct Inbound {
    state: Mutex<InboundState>,
}

impl Inbound {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route envelopes addressed to `peer` onto `channel`.
    pub fn set_default_channel(&self, peer: PeerId, channel: ChannelId) {
        self.state.lock().default_channels.insert(peer, channel);
    }

    pub fn clear_default_channel(&self, peer: &PeerId) {
        self.state.lock().default_channels.remove(peer);
    }

    pub(crate) fn watch_channel(&self, channel: ChannelId) {
        *self.state.lock().listening.entry(channel).or_default() += 1;
    }

    pub(crate) fn unwatch_channel(&self, channel: ChannelId) {
        let mut state = self.state.lock();
        if let Some(n) = state.listening.get_mut(&channel) {
            *n -= 1;
            if *n == 0 {
                state.listening.remove(&channel);
            }
        }
    }

    /// Enqueue a decoded envelope. Broadcasts are copied onto every active channel;
    /// addressed envelopes go to the destination's assigned channel.
    /// Unset and discovery payloads never reach a queue.
    pub fn push(&self, env: Envelope) {
        match env.payload_type() {
            PayloadType::Unset | PayloadType::Discovery => {
                tracing::debug!(source = %env.source, "dropping non-dispatchable envelope");
                return;
            }
            _ => {}
        }
        let mut state = self.state.lock();
        match &env.destination {
            None => {
                for channel in state.broadcast_channels() {
                    state.queues.entry(channel).or_default().push_back(env.clone());
                }
            }
            Some(dest) => {
                let channel = state
                    .default_channels
                    .get(dest)
                    .copied()
                    .unwrap_or(ChannelId::DEFAULT);
                state.queues.entry(channel).or_default().push_back(env);
            }
        }
    }

    /// Take up to `budget` envelopes, one channel at a time in rotation so a busy channel
    /// cannot starve the others. Oldest first within each channel.
    pub fn take(&self, budget: usize) -> Vec<(ChannelId, Envelope)> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        while out.len() < budget {
            let Some(channel) = state.next_channel() else {
                break;
            };
            state.last_served = Some(channel);
            if let Some(queue) = state.queues.get_mut(&channel) {
                if let Some(env) = queue.pop_front() {
                    out.push((channel, env));
                }
                if queue.is_empty() {
                    state.queues.remove(&channel);
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.state.lock().queues.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything buffered from `peer` on every channel.
    pub fn purge_from(&self, peer: &PeerId) -> usize {
        self.purge_where(|env| &env.source == peer)
    }

    /// Drop every queued envelope matching `doomed`, on every channel.
    pub fn purge_where(&self, mut doomed: impl FnMut(&Envelope) -> bool) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        for queue in state.queues.values_mut() {
            let before = queue.len();
            queue.retain(|env| !doomed(env));
            removed += before - queue.len();
        }
        state.queues.retain(|_, q| !q.is_empty());
        removed
    }
}
