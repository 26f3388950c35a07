//! Host-driven context: owns the scheduler and listener table, shares inbound queues with the
//! network worker, and forwards sends to an [`Outbound`] implementation. Host calls `tick()`.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatch::Inbound;
use crate::peer::{ChannelId, PeerId};
use crate::protocol::{Envelope, PayloadType};
use crate::scheduler::{
    CallbackKind, ModuleId, ModuleRef, Notification, NotificationId, PendingResult, Scheduler,
};
use crate::wire::FrameEncodeError;

/// Default cap on envelopes dispatched per tick.
pub const DEFAULT_MAX_FRAMES_PER_TICK: usize = 300;

/// Which transport an addressed send should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Transport {
    /// Framed over the peer's stream link.
    #[default]
    Reliable,
    /// One datagram to the peer's last-seen address; may be lost.
    Unreliable,
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("addressed envelope has no source")]
    EmptySource,
    #[error("envelope has no destination")]
    MissingDestination,
    #[error("no route to peer {0}")]
    NoRoute(PeerId),
    #[error(transparent)]
    Encode(#[from] FrameEncodeError),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("network stopped")]
    Stopped,
}

/// Outbound side of the network. Calls run synchronously on the caller's thread.
pub trait Outbound: Send + Sync {
    fn send_to_one_peer(&self, env: &Envelope, transport: Transport) -> Result<(), SendError>;

    /// Send to every linked remote peer and every other local identity.
    /// Returns the identities the envelope was handed to.
    fn send_to_all_known_peers(&self, env: &Envelope) -> BTreeSet<PeerId>;

    /// Datagram broadcast to the discovery range.
    fn broadcast(&self, env: &Envelope) -> Result<(), SendError>;

    /// Identities hosted by this process.
    fn local_peers(&self) -> Vec<PeerId>;
}

type ListenerKey = (PayloadType, ChannelId);

/// Explicit runtime context. Construct once, hand `&Hub` (or `Arc<Hub>`) to whatever needs it.
pub struct Hub {
    scheduler: Scheduler,
    inbound: Arc<Inbound>,
    outbound: Arc<dyn Outbound>,
    listeners: Mutex<BTreeMap<ListenerKey, Vec<ModuleId>>>,
    max_frames_per_tick: usize,
}

impl Hub {
    pub fn new(outbound: Arc<dyn Outbound>, inbound: Arc<Inbound>) -> Self {
        Self {
            scheduler: Scheduler::new(),
            inbound,
            outbound,
            listeners: Mutex::new(BTreeMap::new()),
            max_frames_per_tick: DEFAULT_MAX_FRAMES_PER_TICK,
        }
    }

    pub fn with_max_frames_per_tick(mut self, n: usize) -> Self {
        self.max_frames_per_tick = n.max(1);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Shared inbound queues; hand a clone to the network worker.
    pub fn inbound(&self) -> &Arc<Inbound> {
        &self.inbound
    }

    pub fn outbound(&self) -> &Arc<dyn Outbound> {
        &self.outbound
    }

    pub fn context(&self, module: ModuleId) -> Context<'_> {
        Context { hub: self, module }
    }

    pub fn register_module(&self, module: ModuleRef) -> ModuleId {
        self.scheduler.register_module(module)
    }

    /// Drop the module with its frame slot, callbacks, notifications and listeners.
    pub fn unregister_module(&self, id: ModuleId) -> bool {
        let dropped: Vec<ChannelId> = {
            let mut listeners = self.listeners.lock();
            let mut dropped = Vec::new();
            for ((_, channel), modules) in listeners.iter_mut() {
                let before = modules.len();
                modules.retain(|m| *m != id);
                if modules.len() != before {
                    dropped.push(*channel);
                }
            }
            listeners.retain(|_, m| !m.is_empty());
            dropped
        };
        for channel in dropped {
            self.inbound.unwatch_channel(channel);
        }
        self.scheduler.unregister_module(id)
    }

    pub fn register_frame_participant(&self, id: ModuleId) -> bool {
        self.scheduler.register_frame(id)
    }

    pub fn unregister_frame_participant(&self, id: ModuleId) -> bool {
        self.scheduler.unregister_frame(id)
    }

    /// Deliver envelopes of `payload_type` arriving on `channel` to the module's `on_envelope`.
    /// The unset channel carries no dispatchable traffic and is refused.
    pub fn register_listener(&self, id: ModuleId, payload_type: PayloadType, channel: ChannelId) -> bool {
        if channel.is_unset() || !self.scheduler.is_registered(id) {
            return false;
        }
        {
            let mut listeners = self.listeners.lock();
            let modules = listeners.entry((payload_type, channel)).or_default();
            if modules.contains(&id) {
                return false;
            }
            modules.push(id);
        }
        self.inbound.watch_channel(channel);
        true
    }

    pub fn unregister_listener(&self, id: ModuleId, payload_type: PayloadType, channel: ChannelId) -> bool {
        let removed = {
            let mut listeners = self.listeners.lock();
            let Some(modules) = listeners.get_mut(&(payload_type, channel)) else {
                return false;
            };
            let before = modules.len();
            modules.retain(|m| *m != id);
            let removed = modules.len() != before;
            if modules.is_empty() {
                listeners.remove(&(payload_type, channel));
            }
            removed
        };
        if removed {
            self.inbound.unwatch_channel(channel);
        }
        removed
    }

    pub fn enqueue_pending_callback(&self, id: ModuleId, result: PendingResult) -> bool {
        self.scheduler.enqueue_callback(id, result)
    }

    pub fn register_notification(&self, id: ModuleId, notification: Notification) -> NotificationId {
        self.scheduler.register_notification(id, notification)
    }

    pub fn unregister_notification(&self, id: ModuleId, nid: NotificationId) -> bool {
        self.scheduler.unregister_notification(id, nid)
    }

    pub fn lookup_pending_notifications(&self, id: ModuleId, kind: CallbackKind) -> Vec<NotificationId> {
        self.scheduler.lookup_pending_notifications(id, kind)
    }

    pub fn post_notification<T: Any + Send>(&self, id: ModuleId, nid: NotificationId, payload: T) -> bool {
        self.scheduler.post_notification(id, nid, payload)
    }

    /// Advance one tick: frame participants, then bounded inbound dispatch, then ready
    /// callbacks, then posted notifications. Never blocks on the network.
    pub fn tick(&self) {
        self.scheduler.run_frames(self);
        self.dispatch_inbound();
        self.scheduler.run_callbacks(self);
        self.scheduler.run_notifications();
    }

    fn dispatch_inbound(&self) -> usize {
        let batch = self.inbound.take(self.max_frames_per_tick);
        let n = batch.len();
        for (channel, env) in batch {
            let targets: Vec<ModuleId> = self
                .listeners
                .lock()
                .get(&(env.payload_type(), channel))
                .cloned()
                .unwrap_or_default();
            if targets.is_empty() {
                tracing::trace!(channel = %channel, source = %env.source, "no listener for envelope");
                continue;
            }
            for id in targets {
                let Some(module) = self.scheduler.module(id) else {
                    continue;
                };
                let cx = self.context(id);
                module.lock().on_envelope(&cx, &env);
            }
        }
        n
    }
}

/// A module's view of the hub: every call is made on behalf of `module`.
#[derive(Clone, Copy)]
pub struct Context<'a> {
    hub: &'a Hub,
    module: ModuleId,
}

impl<'a> Context<'a> {
    pub fn hub(&self) -> &'a Hub {
        self.hub
    }

    pub fn module(&self) -> ModuleId {
        self.module
    }

    pub fn inbound(&self) -> &'a Inbound {
        &self.hub.inbound
    }

    pub fn send_to_one_peer(&self, env: &Envelope, transport: Transport) -> Result<(), SendError> {
        if env.source.is_empty() {
            return Err(SendError::EmptySource);
        }
        self.hub.outbound.send_to_one_peer(env, transport)
    }

    /// Empty when `env` has no source; nothing is sent.
    pub fn send_to_all_known_peers(&self, env: &Envelope) -> BTreeSet<PeerId> {
        if env.source.is_empty() {
            tracing::warn!(module = ?self.module, "refusing fan-out without a source");
            return BTreeSet::new();
        }
        self.hub.outbound.send_to_all_known_peers(env)
    }

    pub fn broadcast(&self, env: &Envelope) -> Result<(), SendError> {
        self.hub.outbound.broadcast(env)
    }

    pub fn local_peers(&self) -> Vec<PeerId> {
        self.hub.outbound.local_peers()
    }

    pub fn register_listener(&self, payload_type: PayloadType, channel: ChannelId) -> bool {
        self.hub.register_listener(self.module, payload_type, channel)
    }

    pub fn enqueue_callback(&self, result: PendingResult) -> bool {
        self.hub.enqueue_pending_callback(self.module, result)
    }

    pub fn register_notification(&self, notification: Notification) -> NotificationId {
        self.hub.register_notification(self.module, notification)
    }

    pub fn unregister_notification(&self, nid: NotificationId) -> bool {
        self.hub.unregister_notification(self.module, nid)
    }

    /// Post `payload` to every notification of `kind` this module holds. Returns how many took it.
    pub fn notify_all<T: Any + Send + Clone>(&self, kind: CallbackKind, payload: T) -> usize {
        self.hub
            .lookup_pending_notifications(self.module, kind)
            .into_iter()
            .filter(|nid| self.hub.post_notification(self.module, *nid, payload.clone()))
            .count()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::protocol::{Payload, PeerNotice};
    use crate::scheduler::Participant;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Sent {
        One(Envelope, Transport),
        All(Envelope),
        Broadcast(Envelope),
    }

    impl Sent {
        pub(crate) fn envelope(&self) -> &Envelope {
            match self {
                Sent::One(e, _) | Sent::All(e) | Sent::Broadcast(e) => e,
            }
        }
    }

    /// Records every send instead of touching a socket.
    #[derive(Default)]
    pub(crate) struct RecordingOutbound {
        pub(crate) sent: Mutex<Vec<Sent>>,
        pub(crate) locals: Mutex<Vec<PeerId>>,
    }

    impl RecordingOutbound {
        pub(crate) fn take(&self) -> Vec<Sent> {
            std::mem::take(&mut *self.sent.lock())
        }

        /// Move everything sent so far into another hub's inbound queues.
        pub(crate) fn deliver_to(&self, hub: &Hub) -> usize {
            let sent = self.take();
            let n = sent.len();
            for s in sent {
                hub.inbound().push(s.envelope().clone());
            }
            n
        }
    }

    impl Outbound for RecordingOutbound {
        fn send_to_one_peer(&self, env: &Envelope, transport: Transport) -> Result<(), SendError> {
            self.sent.lock().push(Sent::One(env.clone(), transport));
            Ok(())
        }

        fn send_to_all_known_peers(&self, env: &Envelope) -> BTreeSet<PeerId> {
            self.sent.lock().push(Sent::All(env.clone()));
            BTreeSet::new()
        }

        fn broadcast(&self, env: &Envelope) -> Result<(), SendError> {
            self.sent.lock().push(Sent::Broadcast(env.clone()));
            Ok(())
        }

        fn local_peers(&self) -> Vec<PeerId> {
            self.locals.lock().clone()
        }
    }

    #[derive(Default)]
    struct Collector {
        seen: Vec<(PeerId, PayloadType)>,
    }

    impl Participant for Collector {
        fn on_envelope(&mut self, _cx: &Context<'_>, envelope: &Envelope) {
            self.seen.push((envelope.source.clone(), envelope.payload_type()));
        }
    }

    fn hub() -> (Hub, Arc<RecordingOutbound>) {
        let out = Arc::new(RecordingOutbound::default());
        (Hub::new(out.clone(), Arc::new(Inbound::new())), out)
    }

    fn stats(from: &str) -> Envelope {
        Envelope::to(PeerId::from(from), PeerId::from("me"), Payload::Stats(vec![1]))
    }

    #[test]
    fn listener_receives_only_its_type_and_channel() {
        let (hub, _) = hub();
        let c = Arc::new(Mutex::new(Collector::default()));
        let id = hub.register_module(c.clone());
        assert!(hub.register_listener(id, PayloadType::Stats, ChannelId::DEFAULT));
        assert!(!hub.register_listener(id, PayloadType::Stats, ChannelId::DEFAULT));
        assert!(!hub.register_listener(id, PayloadType::Stats, ChannelId::UNSET));

        hub.inbound().push(stats("a"));
        hub.inbound().push(Envelope::to(
            PeerId::from("b"),
            PeerId::from("me"),
            Payload::Friends(vec![]),
        ));
        hub.tick();
        assert_eq!(c.lock().seen, vec![(PeerId::from("a"), PayloadType::Stats)]);
    }

    #[test]
    fn broadcast_reaches_every_listening_channel() {
        let (hub, _) = hub();
        let c1 = Arc::new(Mutex::new(Collector::default()));
        let c2 = Arc::new(Mutex::new(Collector::default()));
        let a = hub.register_module(c1.clone());
        let b = hub.register_module(c2.clone());
        hub.register_listener(a, PayloadType::Peer, ChannelId(1));
        hub.register_listener(b, PayloadType::Peer, ChannelId(2));
        hub.inbound().push(Envelope::broadcast(
            PeerId::from("remote"),
            Payload::Peer(PeerNotice::Connected),
        ));
        hub.tick();
        assert_eq!(c1.lock().seen.len(), 1);
        assert_eq!(c2.lock().seen.len(), 1);
    }

    #[test]
    fn dispatch_is_bounded_per_tick() {
        let out = Arc::new(RecordingOutbound::default());
        let hub = Hub::new(out, Arc::new(Inbound::new())).with_max_frames_per_tick(2);
        let c = Arc::new(Mutex::new(Collector::default()));
        let id = hub.register_module(c.clone());
        hub.register_listener(id, PayloadType::Stats, ChannelId::DEFAULT);
        for _ in 0..5 {
            hub.inbound().push(stats("a"));
        }
        hub.tick();
        assert_eq!(c.lock().seen.len(), 2);
        hub.tick();
        hub.tick();
        assert_eq!(c.lock().seen.len(), 5);
    }

    #[test]
    fn unregistered_module_gets_no_late_envelopes() {
        let (hub, _) = hub();
        let c = Arc::new(Mutex::new(Collector::default()));
        let id = hub.register_module(c.clone());
        hub.register_listener(id, PayloadType::Stats, ChannelId::DEFAULT);
        hub.unregister_module(id);
        hub.inbound().push(stats("a"));
        hub.tick();
        assert!(c.lock().seen.is_empty());
        assert!(!hub.register_listener(id, PayloadType::Stats, ChannelId::DEFAULT));
    }

    #[test]
    fn context_refuses_sourceless_addressed_send() {
        let (hub, out) = hub();
        let id = hub.register_module(Arc::new(Mutex::new(Collector::default())));
        let cx = hub.context(id);
        let env = Envelope::to(PeerId::new(""), PeerId::from("b"), Payload::Stats(vec![]));
        assert!(matches!(
            cx.send_to_one_peer(&env, Transport::Reliable),
            Err(SendError::EmptySource)
        ));
        assert!(cx
            .send_to_all_known_peers(&Envelope::broadcast(PeerId::new(""), Payload::Stats(vec![])))
            .is_empty());
        cx.broadcast(&Envelope::broadcast(PeerId::new(""), Payload::Stats(vec![])))
            .unwrap();
        assert_eq!(out.take(), vec![Sent::Broadcast(Envelope::broadcast(PeerId::new(""), Payload::Stats(vec![])))]);
    }

    #[test]
    fn notify_all_posts_to_each_matching_notification() {
        let (hub, _) = hub();
        let id = hub.register_module(Arc::new(Mutex::new(Collector::default())));
        let hits = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let h = hits.clone();
            hub.register_notification(
                id,
                Notification::new(CallbackKind(9), move |v: &u8| h.lock().push(*v)),
            );
        }
        assert_eq!(hub.context(id).notify_all(CallbackKind(9), 5u8), 2);
        assert_eq!(hub.context(id).notify_all(CallbackKind(8), 5u8), 0);
        hub.tick();
        assert_eq!(*hits.lock(), vec![5, 5]);
    }
}
