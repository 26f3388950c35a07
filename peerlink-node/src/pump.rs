//! Network pump: one background thread running a current-thread runtime that owns the discovery
//! socket, the stream listener and every stream link. It advertises, dials, runs the identity
//! handshake, admits links into the registry and feeds decoded envelopes into the shared inbound
//! queues. Sends from other threads go through [`Shared`] directly.

use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use peerlink_core::registry::{Admission, LinkId, Provenance, Registry};
use peerlink_core::{
    decode_datagram, encode_datagram, encode_frame, Discovery, Envelope, FrameBuffer, Inbound,
    Payload, PeerId, PeerNotice, PROTOCOL_VERSION,
};
use tokio::sync::{mpsc, Notify};

use crate::config::NodeConfig;
use crate::discovery::{advert_targets, classify, handshake_ids, Advertiser, DiscoveryAction};
use crate::network::StartError;
use crate::socket::{
    DatagramSocket, PollSet, Pollable, Readiness, SocketError, StreamListener, StreamSocket,
};

const RECV_BUFFER: usize = 64 * 1024;
/// Queued output per link before sends start failing.
const MAX_PENDING_OUT: usize = 4 * 1024 * 1024;
/// After a failed dial, adverts from that identity are ignored this long.
const DIAL_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// One stream link. The worker reads; any thread may send.
pub(crate) struct Link {
    id: LinkId,
    stream: StreamSocket,
    pending_out: Mutex<Vec<u8>>,
    rx: Mutex<FrameBuffer>,
}

impl Link {
    fn new(id: LinkId, stream: StreamSocket) -> Self {
        Self {
            id,
            stream,
            pending_out: Mutex::new(Vec::new()),
            rx: Mutex::new(FrameBuffer::new()),
        }
    }

    /// Write a whole frame or queue what the socket did not take. Frames never interleave.
    pub(crate) fn send_frame(&self, frame: &[u8]) -> Result<(), SocketError> {
        let mut out = self.pending_out.lock();
        if !out.is_empty() {
            if out.len() + frame.len() > MAX_PENDING_OUT {
                return Err(SocketError::Other(std::io::Error::other("send backlog full")));
            }
            out.extend_from_slice(frame);
            return Ok(());
        }
        match self.stream.try_send(frame) {
            Ok(n) => {
                out.extend_from_slice(&frame[n..]);
                Ok(())
            }
            Err(e) if e.is_would_block() => {
                out.extend_from_slice(frame);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn flush(&self) -> Result<(), SocketError> {
        let mut out = self.pending_out.lock();
        while !out.is_empty() {
            match self.stream.try_send(&out) {
                Ok(n) => {
                    out.drain(..n);
                }
                Err(e) if e.is_would_block() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Read everything available into the frame buffer.
    fn fill(&self, scratch: &mut [u8]) -> Result<(), SocketError> {
        loop {
            match self.stream.try_recv(scratch) {
                Ok(n) => self.rx.lock().extend(&scratch[..n]),
                Err(SocketError::WouldBlock) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn next_envelope(&self) -> Result<Option<Envelope>, peerlink_core::FrameDecodeError> {
        self.rx.lock().next_envelope()
    }
}

impl Pollable for Link {
    fn stream(&self) -> &StreamSocket {
        &self.stream
    }

    fn wants_write(&self) -> bool {
        !self.pending_out.lock().is_empty()
    }
}

/// State shared between the worker and the [`Network`](crate::network::Network) handle.
pub(crate) struct Shared {
    pub(crate) config: NodeConfig,
    pub(crate) registry: Mutex<Registry<Link>>,
    pub(crate) locals: Mutex<BTreeSet<PeerId>>,
    pub(crate) advertise: AtomicBool,
    pub(crate) inbound: Arc<Inbound>,
    pub(crate) datagram: DatagramSocket,
    pub(crate) targets: Vec<SocketAddr>,
    pub(crate) loopback: mpsc::UnboundedSender<Vec<u8>>,
    pub(crate) wake: Notify,
    pub(crate) stopped: AtomicBool,
    pub(crate) listen_port: u16,
}

impl Shared {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    pub(crate) fn locals(&self) -> BTreeSet<PeerId> {
        self.locals.lock().clone()
    }

    fn identities_frame(&self) -> Result<Vec<u8>, peerlink_core::FrameEncodeError> {
        let locals = self.locals();
        let source = locals.iter().next().cloned().unwrap_or_else(|| PeerId::new(""));
        let env = Envelope::broadcast(
            source,
            Payload::Discovery(Discovery::Identities {
                protocol_version: PROTOCOL_VERSION,
                ids: locals.into_iter().collect(),
            }),
        )
        .with_app_id(self.config.app_id.clone());
        encode_frame(&env)
    }

    fn notify(&self, peers: Vec<PeerId>, notice: PeerNotice) {
        for peer in peers {
            tracing::info!(peer = %peer, ?notice, "peer link changed");
            self.inbound
                .push(Envelope::broadcast(peer, Payload::Peer(notice)));
        }
    }
}

/// Start the worker thread, bind its sockets and hand back the shared state once bound.
pub(crate) fn spawn(config: NodeConfig) -> Result<(Arc<Shared>, JoinHandle<()>), StartError> {
    let (tx, rx) = std::sync::mpsc::channel();
    let handle = std::thread::Builder::new()
        .name("peerlink-pump".into())
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = tx.send(Err(StartError::Runtime(e)));
                    return;
                }
            };
            let worker = {
                let _guard = rt.enter();
                match Worker::bind(config) {
                    Ok(w) => w,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                }
            };
            let _ = tx.send(Ok(worker.shared.clone()));
            rt.block_on(worker.run());
        })
        .map_err(StartError::Runtime)?;
    match rx.recv() {
        Ok(Ok(shared)) => Ok((shared, handle)),
        Ok(Err(e)) => {
            let _ = handle.join();
            Err(e)
        }
        Err(_) => {
            let _ = handle.join();
            Err(StartError::WorkerGone)
        }
    }
}

/// Result of a connect attempt running beside the worker loop.
struct Dialed {
    peer: PeerId,
    addr: SocketAddr,
    result: Result<StreamSocket, SocketError>,
}

enum Event {
    Wake,
    Dialed(Dialed),
    Datagram(Result<(usize, SocketAddr), SocketError>),
    Accepted(Result<StreamSocket, SocketError>),
    Loopback(Vec<u8>),
    Ready(Vec<(LinkId, Readiness)>),
    Timeout,
}

#[derive(Debug, Clone, Copy)]
enum Origin {
    Datagram(SocketAddr),
    Stream,
    Loopback,
}

struct Worker {
    shared: Arc<Shared>,
    listener: StreamListener,
    loopback_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    dialed_tx: mpsc::UnboundedSender<Dialed>,
    dialed_rx: mpsc::UnboundedReceiver<Dialed>,
    links: PollSet<LinkId, Link>,
    advertiser: Advertiser,
    scratch: Vec<u8>,
}

impl Worker {
    /// Bind the discovery socket and the listener. Runs inside the worker's runtime context.
    fn bind(config: NodeConfig) -> Result<Self, StartError> {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        let datagram = DatagramSocket::bind_in_range(
            any,
            config.discovery_port,
            config.discovery_port_count,
        )?
        .ok_or(StartError::PortRangeExhausted {
            socket: "discovery",
            first: config.discovery_port,
            count: config.discovery_port_count,
        })?;
        let listener =
            StreamListener::bind_in_range(any, config.listen_port, config.listen_port_count)?
                .ok_or(StartError::PortRangeExhausted {
                    socket: "listener",
                    first: config.listen_port,
                    count: config.listen_port_count,
                })?;
        tracing::info!(
            discovery_port = datagram.port(),
            listen_port = listener.port(),
            "network bound"
        );

        let targets = advert_targets(
            &config.broadcast_targets,
            config.discovery_port,
            config.discovery_port_count,
        );
        let (loopback, loopback_rx) = mpsc::unbounded_channel();
        let (dialed_tx, dialed_rx) = mpsc::unbounded_channel();
        let advertiser = Advertiser::new(config.advertise_interval());
        let shared = Arc::new(Shared {
            advertise: AtomicBool::new(config.advertise),
            registry: Mutex::new(Registry::new()),
            locals: Mutex::new(BTreeSet::new()),
            inbound: Arc::new(Inbound::new()),
            listen_port: listener.port(),
            datagram,
            targets,
            loopback,
            wake: Notify::new(),
            stopped: AtomicBool::new(false),
            config,
        });
        Ok(Self {
            shared,
            listener,
            loopback_rx,
            dialed_tx,
            dialed_rx,
            links: PollSet::new(),
            advertiser,
            scratch: vec![0u8; RECV_BUFFER],
        })
    }

    async fn run(mut self) {
        while !self.shared.is_stopped() {
            let now = Instant::now();
            self.advertise_if_due(now);
            self.expire(now);
            let wait = self
                .shared
                .config
                .poll_wait()
                .min(self.advertiser.until_due(now));

            let event = tokio::select! {
                _ = self.shared.wake.notified() => Event::Wake,
                r = self.shared.datagram.recv_from(&mut self.scratch) => Event::Datagram(r),
                r = self.listener.accept() => Event::Accepted(r),
                Some(bytes) = self.loopback_rx.recv() => Event::Loopback(bytes),
                Some(dialed) = self.dialed_rx.recv() => Event::Dialed(dialed),
                ready = self.links.poll() => Event::Ready(ready),
                _ = tokio::time::sleep(wait) => Event::Timeout,
            };

            match event {
                Event::Wake | Event::Timeout => {}
                Event::Datagram(Ok((n, from))) => match decode_datagram(&self.scratch[..n]) {
                    Ok(env) => {
                        if let Some((peer, addr)) = self.deliver(env, Origin::Datagram(from)) {
                            self.dial(peer, addr);
                        }
                    }
                    Err(e) => tracing::debug!(%from, error = %e, "dropping undecodable datagram"),
                },
                Event::Datagram(Err(e)) => tracing::debug!(error = %e, "datagram receive failed"),
                Event::Dialed(dialed) => self.on_dialed(dialed),
                Event::Accepted(Ok(stream)) => self.accept(stream).await,
                Event::Accepted(Err(e)) => tracing::warn!(error = %e, "accept failed"),
                Event::Loopback(bytes) => match decode_datagram(&bytes) {
                    Ok(env) => {
                        self.deliver(env, Origin::Loopback);
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping undecodable loopback envelope"),
                },
                Event::Ready(ready) => {
                    for (id, readiness) in ready {
                        self.on_ready(id, readiness);
                    }
                }
            }
        }
        tracing::info!(links = self.links.len(), "network worker stopped");
    }

    fn advertise_if_due(&mut self, now: Instant) {
        if !self.advertiser.is_due(now) {
            return;
        }
        let locals = if self.shared.advertise.load(Ordering::Acquire) {
            self.shared.locals()
        } else {
            BTreeSet::new()
        };
        let adverts = self.advertiser.next_round(
            now,
            &locals,
            self.shared.listen_port,
            &self.shared.config.app_id,
        );
        for env in adverts {
            let bytes = match encode_datagram(&env) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "advert does not encode");
                    continue;
                }
            };
            for target in &self.shared.targets {
                if let Err(e) = self.shared.datagram.try_send_to(&bytes, *target) {
                    tracing::debug!(%target, error = %e, "advert send failed");
                }
            }
        }
    }

    fn expire(&mut self, now: Instant) {
        let expired = self.shared.registry.lock().expire(now);
        for id in expired {
            tracing::debug!(link = id.get(), "handshake timed out");
            self.links.remove(&id);
        }
    }

    fn new_link(&self, stream: StreamSocket) -> Arc<Link> {
        let id = self.shared.registry.lock().allocate();
        Arc::new(Link::new(id, stream))
    }

    /// Inbound link: the remote speaks first. Blocks the worker for at most the handshake timeout.
    async fn accept(&mut self, stream: StreamSocket) {
        let remote = stream.peer_addr();
        let link = self.new_link(stream);
        let timeout = self.shared.config.handshake_timeout();
        let first = match tokio::time::timeout(timeout, first_frame(&link, &mut self.scratch)).await {
            Ok(Ok(env)) => env,
            Ok(Err(e)) => {
                tracing::debug!(%remote, error = %e, "handshake read failed");
                return;
            }
            Err(_) => {
                tracing::debug!(%remote, "handshake timed out");
                return;
            }
        };
        if first.app_mismatch(&self.shared.config.app_id) {
            tracing::debug!(%remote, app_id = %first.app_id, "rejecting link from other application");
            return;
        }
        let Some(ids) = handshake_ids(&first) else {
            tracing::debug!(%remote, "first frame is not an identity handshake");
            return;
        };
        let reply = self
            .shared
            .identities_frame()
            .map_err(|e| SocketError::Other(std::io::Error::other(e)))
            .and_then(|frame| link.send_frame(&frame));
        if let Err(e) = reply {
            tracing::debug!(%remote, error = %e, "handshake reply failed");
            return;
        }
        self.shared.registry.lock().add_pending(
            link.id,
            Arc::downgrade(&link),
            Provenance::Accepted,
            Instant::now() + timeout,
        );
        self.links.add(link.id, link.clone());
        self.admit(&link, &ids);
        self.drain(&link);
    }

    /// Outbound link after a port advert. The connect runs as its own task and reports back
    /// through `dialed_rx`, so the loop keeps polling meanwhile.
    fn dial(&mut self, peer: PeerId, addr: SocketAddr) {
        if self.shared.locals.lock().is_empty() {
            return;
        }
        let cfg = &self.shared.config;
        let deadline = Instant::now() + cfg.dial_timeout() + cfg.handshake_timeout();
        if !self.shared.registry.lock().begin_dial(peer.clone(), deadline) {
            return;
        }
        tracing::debug!(peer = %peer, %addr, "dialing");
        let timeout = cfg.dial_timeout();
        let tx = self.dialed_tx.clone();
        tokio::spawn(async move {
            let result = StreamSocket::connect(addr, timeout).await;
            let _ = tx.send(Dialed { peer, addr, result });
        });
    }

    fn on_dialed(&mut self, dialed: Dialed) {
        let Dialed { peer, addr, result } = dialed;
        let stream = match result {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(peer = %peer, %addr, error = %e, "dial failed");
                self.shared
                    .registry
                    .lock()
                    .dial_failed(&peer, Instant::now() + DIAL_RETRY_BACKOFF);
                return;
            }
        };
        let link = self.new_link(stream);
        let hello = self
            .shared
            .identities_frame()
            .map_err(|e| SocketError::Other(std::io::Error::other(e)))
            .and_then(|frame| link.send_frame(&frame));
        if let Err(e) = hello {
            tracing::debug!(peer = %peer, error = %e, "handshake send failed");
            self.shared
                .registry
                .lock()
                .dial_failed(&peer, Instant::now() + DIAL_RETRY_BACKOFF);
            return;
        }
        self.shared.registry.lock().add_pending(
            link.id,
            Arc::downgrade(&link),
            Provenance::Dialed,
            Instant::now() + self.shared.config.handshake_timeout(),
        );
        self.links.add(link.id, link);
    }

    fn admit(&mut self, link: &Arc<Link>, ids: &[PeerId]) {
        let local_min = self
            .shared
            .locals
            .lock()
            .iter()
            .next()
            .cloned()
            .unwrap_or_else(|| PeerId::new(""));
        let outcome = self
            .shared
            .registry
            .lock()
            .admit(link.id, ids, &local_min);
        match outcome {
            Admission::Admitted { newly_linked } => {
                tracing::info!(link = link.id.get(), remote = %link.stream.peer_addr(), "link up");
                self.shared.notify(newly_linked, PeerNotice::Connected);
            }
            Admission::Folded { into, newly_linked } => {
                tracing::debug!(link = link.id.get(), into = into.get(), "duplicate link closed");
                self.links.remove(&link.id);
                self.shared.notify(newly_linked, PeerNotice::Connected);
            }
            Admission::Replaced { old, newly_linked } => {
                tracing::debug!(link = link.id.get(), old = old.get(), "link replaces older duplicate");
                self.links.remove(&old);
                self.shared.notify(newly_linked, PeerNotice::Connected);
            }
            Admission::Rejected => {
                tracing::debug!(link = link.id.get(), "link rejected");
                self.links.remove(&link.id);
            }
        }
    }

    fn close_link(&mut self, id: LinkId, why: &SocketError) {
        self.links.remove(&id);
        let lost = self.shared.registry.lock().remove(id);
        tracing::debug!(link = id.get(), error = %why, lost = lost.len(), "link closed");
        self.shared.notify(lost, PeerNotice::Disconnected);
    }

    fn on_ready(&mut self, id: LinkId, readiness: Readiness) {
        let Some(link) = self.links.get(&id).cloned() else {
            return;
        };
        if readiness.writable {
            if let Err(e) = link.flush() {
                self.close_link(id, &e);
                return;
            }
        }
        let read = if readiness.readable || readiness.hangup {
            link.fill(&mut self.scratch)
        } else {
            Ok(())
        };
        self.drain(&link);
        if let Err(e) = read {
            if self.links.contains(&id) {
                self.close_link(id, &e);
            }
        }
    }

    /// Handle every complete frame buffered on `link`. Stops once the link is gone.
    fn drain(&mut self, link: &Arc<Link>) {
        while self.links.contains(&link.id) {
            let env = match link.next_envelope() {
                Ok(Some(env)) => env,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(link = link.id.get(), error = %e, "dropping corrupt frame");
                    continue;
                }
            };
            let pending = self.shared.registry.lock().is_pending(link.id);
            if !pending {
                self.deliver(env, Origin::Stream);
                continue;
            }
            match handshake_ids(&env) {
                Some(ids) if !env.app_mismatch(&self.shared.config.app_id) => self.admit(link, &ids),
                _ => {
                    tracing::debug!(link = link.id.get(), "bad handshake reply");
                    self.shared.registry.lock().remove(link.id);
                    self.links.remove(&link.id);
                }
            }
        }
    }

    /// Filter and route one received envelope. Returns a dial request for unknown advertisers.
    fn deliver(&mut self, env: Envelope, origin: Origin) -> Option<(PeerId, SocketAddr)> {
        if !env.has_valid_source() {
            return None;
        }
        let locals = self.shared.locals();
        if !matches!(origin, Origin::Loopback) && locals.contains(&env.source) {
            return None;
        }
        if env.app_mismatch(&self.shared.config.app_id) {
            tracing::trace!(source = %env.source, app_id = %env.app_id, "other application");
            return None;
        }
        let addr = match origin {
            Origin::Datagram(from) => Some(from),
            _ => None,
        };
        if let Some(addr) = addr {
            if !env.source.is_empty() {
                self.shared.registry.lock().touch(&env.source, addr);
            }
        }
        if matches!(env.payload, Payload::Discovery(_)) {
            if env.source.is_empty() {
                tracing::debug!(?origin, "dropping anonymous discovery message");
                return None;
            }
            return self.on_discovery(&env, origin, &locals);
        }
        if let Some(dest) = &env.destination {
            if !locals.contains(dest) {
                tracing::trace!(dest = %dest, "not addressed to a local identity");
                return None;
            }
        }
        self.shared.inbound.push(env);
        None
    }

    fn on_discovery(
        &mut self,
        env: &Envelope,
        origin: Origin,
        locals: &BTreeSet<PeerId>,
    ) -> Option<(PeerId, SocketAddr)> {
        let from = match origin {
            Origin::Datagram(from) => from,
            Origin::Stream => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            Origin::Loopback => return None,
        };
        let action = {
            let registry = self.shared.registry.lock();
            classify(env, from, locals, &*registry)
        };
        match action {
            DiscoveryAction::Dial(peer, addr) if matches!(origin, Origin::Datagram(_)) => {
                Some((peer, addr))
            }
            DiscoveryAction::Fold(ids) => {
                let added = self.shared.registry.lock().fold_identities(&ids);
                self.shared.notify(added, PeerNotice::Connected);
                None
            }
            _ => None,
        }
    }
}

/// Read until the first complete frame. A corrupt first frame fails the handshake.
async fn first_frame(link: &Link, scratch: &mut [u8]) -> Result<Envelope, SocketError> {
    loop {
        match link.next_envelope() {
            Ok(Some(env)) => return Ok(env),
            Ok(None) => {}
            Err(e) => return Err(SocketError::Other(std::io::Error::other(e))),
        }
        link.stream.ready(false).await?;
        link.fill(scratch)?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_frames_cross_a_stream() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
            let listener = StreamListener::bind_in_range(localhost, 47251, 4).unwrap().unwrap();
            let addr = SocketAddr::from((localhost, listener.port()));
            let (client, server) = tokio::join!(
                StreamSocket::connect(addr, Duration::from_secs(1)),
                listener.accept()
            );
            let mut reg: Registry<Link> = Registry::new();
            let a = Link::new(reg.allocate(), client.unwrap());
            let b = Link::new(reg.allocate(), server.unwrap());

            let env = Envelope::to(PeerId::from("a"), PeerId::from("b"), Payload::Stats(vec![9; 300]));
            let frame = encode_frame(&env).unwrap();
            a.send_frame(&frame).unwrap();
            a.send_frame(&frame).unwrap();
            assert!(a.flush().is_ok());

            let mut scratch = vec![0u8; 64];
            let got = tokio::time::timeout(Duration::from_secs(1), first_frame(&b, &mut scratch))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, env);
            let second = tokio::time::timeout(Duration::from_secs(1), first_frame(&b, &mut scratch))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(second, env);
            assert!(!a.wants_write());
        });
    }

    #[test]
    fn dial_does_not_hold_up_the_loop() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let config = NodeConfig {
                discovery_port: 47260,
                discovery_port_count: 4,
                listen_port: 47270,
                listen_port_count: 4,
                dial_timeout_ms: 300,
                ..NodeConfig::default()
            };
            let mut worker = Worker::bind(config).unwrap();
            worker.shared.locals.lock().insert(PeerId::from("me"));
            let ghost = PeerId::from("ghost");
            // Non-routable: the connect either hangs until the timeout or fails outright.
            let addr: SocketAddr = "10.255.255.1:9".parse().unwrap();

            let started = Instant::now();
            worker.dial(ghost.clone(), addr);
            assert!(started.elapsed() < Duration::from_millis(100));
            assert!(worker.shared.registry.lock().is_dialing(&ghost));

            let dialed = tokio::time::timeout(Duration::from_secs(2), worker.dialed_rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert!(dialed.result.is_err());
            worker.on_dialed(dialed);

            // Still marked after the dial deadline passes: the next advert does not redial.
            worker.expire(Instant::now() + Duration::from_secs(2));
            assert!(worker.shared.registry.lock().is_dialing(&ghost));
            assert!(worker.links.is_empty());
        });
    }
}
