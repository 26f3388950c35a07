//! Cooperative per-tick scheduler: frame participants, one-shot callbacks, persistent
//! notifications. Everything is keyed by [`ModuleId`] handles, never by module address.
//!
//! The pools live behind a re-entrant lock so a callback fired mid-tick can register new
//! callbacks or notifications on the same thread. A one-shot callback is taken out of its
//! pool before it is invoked, so it cannot fire twice even if a tick re-enters.

use std::any::Any;
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, ReentrantMutex};

use crate::hub::{Context, Hub};
use crate::protocol::Envelope;

/// Handle of a registered module. Allocated once, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

/// Handle returned by notification registration; only used to unregister or post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NotificationId(u64);

impl NotificationId {
    pub const INVALID: NotificationId = NotificationId(0);

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Completion type tag (the numeric id the host ABI uses to tell result structs apart).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackKind(pub u32);

type Target = Box<dyn FnMut(&dyn Any) + Send>;

/// One-shot scheduled completion.
pub struct PendingResult {
    created_at: Instant,
    ok_timeout: Duration,
    kind: CallbackKind,
    /// Set when the result is ready without asking the owning module again.
    pub done: bool,
    payload: Box<dyn Any + Send>,
    target: Target,
}

impl PendingResult {
    /// Build a result carrying `payload`; `target` receives it when the callback fires.
    pub fn new<T, F>(kind: CallbackKind, payload: T, mut target: F) -> Self
    where
        T: Any + Send,
        F: FnMut(&T) + Send + 'static,
    {
        Self {
            created_at: Instant::now(),
            ok_timeout: Duration::ZERO,
            kind,
            done: false,
            payload: Box::new(payload),
            target: Box::new(move |p: &dyn Any| {
                if let Some(p) = p.downcast_ref::<T>() {
                    target(p);
                }
            }),
        }
    }

    /// Mark as synchronously complete.
    pub fn completed(mut self) -> Self {
        self.done = true;
        self
    }

    /// Do not evaluate before `ok_timeout` has elapsed since creation.
    pub fn with_ok_timeout(mut self, ok_timeout: Duration) -> Self {
        self.ok_timeout = ok_timeout;
        self
    }

    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    fn ok_timeout_elapsed(&self) -> bool {
        self.elapsed() >= self.ok_timeout
    }

    pub fn payload<T: Any>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }

    pub fn payload_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.payload.downcast_mut::<T>()
    }

    fn invoke(&mut self) {
        (self.target)(&*self.payload);
    }
}

impl std::fmt::Debug for PendingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingResult")
            .field("kind", &self.kind)
            .field("done", &self.done)
            .field("ok_timeout", &self.ok_timeout)
            .finish_non_exhaustive()
    }
}

/// Persistent completion, fired once per posted payload until unregistered.
pub struct Notification {
    kind: CallbackKind,
    target: Arc<Mutex<Target>>,
    backlog: VecDeque<Box<dyn Any + Send>>,
}

impl Notification {
    pub fn new<T, F>(kind: CallbackKind, mut handler: F) -> Self
    where
        T: Any + Send,
        F: FnMut(&T) + Send + 'static,
    {
        let target: Target = Box::new(move |p: &dyn Any| {
            if let Some(p) = p.downcast_ref::<T>() {
                handler(p);
            }
        });
        Self {
            kind,
            target: Arc::new(Mutex::new(target)),
            backlog: VecDeque::new(),
        }
    }

    pub fn kind(&self) -> CallbackKind {
        self.kind
    }
}

/// Role a module plays towards the scheduler and dispatcher. Implement only what you need.
pub trait Participant: Send {
    /// Polled once per tick for every registered frame participant.
    fn run_frame(&mut self, _cx: &Context<'_>) {}

    /// Called for each inbound envelope matching one of the module's listener registrations.
    fn on_envelope(&mut self, _cx: &Context<'_>, _envelope: &Envelope) {}

    /// Re-check a pending result that is not `done` yet. Return true when it may fire.
    fn try_complete(&mut self, _cx: &Context<'_>, result: &mut PendingResult) -> bool {
        result.done
    }
}

pub type ModuleRef = Arc<Mutex<dyn Participant>>;

#[derive(Default)]
struct Pools {
    next_module: u64,
    next_notification: u64,
    modules: BTreeMap<ModuleId, ModuleRef>,
    frames: BTreeSet<ModuleId>,
    callbacks: BTreeMap<ModuleId, Vec<PendingResult>>,
    notifications: BTreeMap<ModuleId, BTreeMap<NotificationId, Notification>>,
}

/// Callback/frame scheduler. Advanced only by [`Hub::tick`] on the caller's thread.
#[derive(Default)]
pub struct Scheduler {
    pools: ReentrantMutex<RefCell<Pools>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&self, module: ModuleRef) -> ModuleId {
        let guard = self.pools.lock();
        let mut pools = guard.borrow_mut();
        pools.next_module += 1;
        let id = ModuleId(pools.next_module);
        pools.modules.insert(id, module);
        id
    }

    /// Drop the module and every frame, callback and notification it owns.
    pub fn unregister_module(&self, id: ModuleId) -> bool {
        let guard = self.pools.lock();
        let mut pools = guard.borrow_mut();
        pools.frames.remove(&id);
        pools.callbacks.remove(&id);
        pools.notifications.remove(&id);
        pools.modules.remove(&id).is_some()
    }

    pub fn is_registered(&self, id: ModuleId) -> bool {
        self.pools.lock().borrow().modules.contains_key(&id)
    }

    pub fn module(&self, id: ModuleId) -> Option<ModuleRef> {
        self.pools.lock().borrow().modules.get(&id).cloned()
    }

    pub fn register_frame(&self, id: ModuleId) -> bool {
        let guard = self.pools.lock();
        let mut pools = guard.borrow_mut();
        if !pools.modules.contains_key(&id) {
            return false;
        }
        pools.frames.insert(id)
    }

    pub fn unregister_frame(&self, id: ModuleId) -> bool {
        self.pools.lock().borrow_mut().frames.remove(&id)
    }

    /// Queue a one-shot result. Refused (false) for unknown modules.
    pub fn enqueue_callback(&self, id: ModuleId, result: PendingResult) -> bool {
        let guard = self.pools.lock();
        let mut pools = guard.borrow_mut();
        if !pools.modules.contains_key(&id) {
            return false;
        }
        pools.callbacks.entry(id).or_default().push(result);
        true
    }

    pub fn pending_callbacks(&self, id: ModuleId) -> usize {
        self.pools
            .lock()
            .borrow()
            .callbacks
            .get(&id)
            .map_or(0, Vec::len)
    }

    /// Returns [`NotificationId::INVALID`] for unknown modules.
    pub fn register_notification(&self, id: ModuleId, notification: Notification) -> NotificationId {
        let guard = self.pools.lock();
        let mut pools = guard.borrow_mut();
        if !pools.modules.contains_key(&id) {
            return NotificationId::INVALID;
        }
        pools.next_notification += 1;
        let nid = NotificationId(pools.next_notification);
        pools
            .notifications
            .entry(id)
            .or_default()
            .insert(nid, notification);
        nid
    }

    pub fn unregister_notification(&self, id: ModuleId, nid: NotificationId) -> bool {
        let guard = self.pools.lock();
        let mut pools = guard.borrow_mut();
        pools
            .notifications
            .get_mut(&id)
            .is_some_and(|n| n.remove(&nid).is_some())
    }

    /// Notifications of `kind` currently registered by `id`, in registration order.
    pub fn lookup_pending_notifications(&self, id: ModuleId, kind: CallbackKind) -> Vec<NotificationId> {
        let guard = self.pools.lock();
        let pools = guard.borrow();
        pools
            .notifications
            .get(&id)
            .map(|n| {
                n.iter()
                    .filter(|(_, n)| n.kind == kind)
                    .map(|(nid, _)| *nid)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Queue `payload` for delivery through notification `nid` on the next tick.
    /// False (and the payload dropped) if the notification no longer exists.
    pub fn post_notification<T: Any + Send>(&self, id: ModuleId, nid: NotificationId, payload: T) -> bool {
        let guard = self.pools.lock();
        let mut pools = guard.borrow_mut();
        match pools.notifications.get_mut(&id).and_then(|n| n.get_mut(&nid)) {
            Some(n) => {
                n.backlog.push_back(Box::new(payload));
                true
            }
            None => false,
        }
    }

    /// Poll every frame participant once.
    pub(crate) fn run_frames(&self, hub: &Hub) {
        let guard = self.pools.lock();
        let frames: Vec<(ModuleId, ModuleRef)> = {
            let pools = guard.borrow();
            pools
                .frames
                .iter()
                .filter_map(|id| pools.modules.get(id).map(|m| (*id, m.clone())))
                .collect()
        };
        for (id, module) in frames {
            if !self.is_registered(id) {
                continue;
            }
            let cx = hub.context(id);
            module.lock().run_frame(&cx);
        }
    }

    /// Evaluate pending callbacks; fire and remove the ready ones.
    pub(crate) fn run_callbacks(&self, hub: &Hub) {
        let guard = self.pools.lock();
        let owners: Vec<ModuleId> = guard.borrow().callbacks.keys().copied().collect();
        for id in owners {
            let (module, mut queue) = {
                let mut pools = guard.borrow_mut();
                let Some(module) = pools.modules.get(&id).cloned() else {
                    pools.callbacks.remove(&id);
                    continue;
                };
                let queue = pools
                    .callbacks
                    .get_mut(&id)
                    .map(std::mem::take)
                    .unwrap_or_default();
                (module, queue)
            };
            let cx = hub.context(id);
            let mut keep = Vec::with_capacity(queue.len());
            let mut unregistered = false;
            for mut res in queue.drain(..) {
                if unregistered || !res.ok_timeout_elapsed() {
                    keep.push(res);
                    continue;
                }
                let ready = res.done || module.lock().try_complete(&cx, &mut res);
                if !ready {
                    keep.push(res);
                    continue;
                }
                if !self.is_registered(id) {
                    unregistered = true;
                    continue;
                }
                tracing::trace!(kind = res.kind.0, "callback ready");
                res.invoke();
            }
            let mut pools = guard.borrow_mut();
            if pools.modules.contains_key(&id) {
                // Callbacks enqueued while we were firing go after the survivors.
                let fresh = pools.callbacks.remove(&id).unwrap_or_default();
                keep.extend(fresh);
                if !keep.is_empty() {
                    pools.callbacks.insert(id, keep);
                }
            }
        }
    }

    /// Fire every posted notification payload.
    pub(crate) fn run_notifications(&self) {
        let guard = self.pools.lock();
        let posted: Vec<(ModuleId, NotificationId)> = {
            let pools = guard.borrow();
            pools
                .notifications
                .iter()
                .flat_map(|(id, n)| {
                    n.iter()
                        .filter(|(_, n)| !n.backlog.is_empty())
                        .map(move |(nid, _)| (*id, *nid))
                })
                .collect()
        };
        for (id, nid) in posted {
            loop {
                let next = {
                    let mut pools = guard.borrow_mut();
                    pools
                        .notifications
                        .get_mut(&id)
                        .and_then(|n| n.get_mut(&nid))
                        .and_then(|n| n.backlog.pop_front().map(|p| (n.target.clone(), p)))
                };
                let Some((target, payload)) = next else {
                    break;
                };
                let mut target = target.lock();
                (*target)(&*payload);
            }
        }
    }
}
