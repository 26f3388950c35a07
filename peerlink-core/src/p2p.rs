//! P2P data channels: per-remote connection lifecycle, outbound queuing until the two-way
//! handshake completes, per-channel inbound packet buffers.
//!
//! Control messages (request, response, close) go over the reliable transport. Data and its
//! acknowledgement go unreliably and are never retransmitted.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::hub::{Context, Hub, Transport};
use crate::peer::{ChannelId, PeerId};
use crate::protocol::{Envelope, P2pData, P2pMessage, Payload, PayloadType, PeerNotice};
use crate::scheduler::{CallbackKind, ModuleId, Notification, NotificationId, Participant, PendingResult};

/// Largest payload accepted by [`P2pSession::send_packet`].
pub const MAX_PACKET_SIZE: usize = 1170;
pub const MAX_SOCKET_NAME_LEN: usize = 32;
/// Connecting without a response for this long fails the connection.
pub const CONNECTING_TIMEOUT: Duration = Duration::from_secs(10);
/// Lost for this long closes the connection.
pub const LOSS_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PORT: u16 = 7777;
pub const DEFAULT_ADDITIONAL_PORTS: u16 = 99;

pub const CONNECTION_REQUEST: CallbackKind = CallbackKind(2201);
pub const CONNECTION_CLOSED: CallbackKind = CallbackKind(2202);
pub const NAT_TYPE_QUERIED: CallbackKind = CallbackKind(2203);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkStatus {
    #[default]
    Closed,
    /// Remote asked to connect; waiting for a local accept.
    Requesting,
    /// We asked to connect; waiting for the remote's response.
    Connecting,
    Connected,
    /// Transport link dropped while connected; may come back.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClosedByLocal,
    ClosedByPeer,
    TimedOut,
    ConnectionFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NatType {
    #[default]
    Unknown,
    Open,
    Moderate,
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayControl {
    NoRelays,
    #[default]
    AllowRelays,
    ForceRelays,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequestInfo {
    pub local: PeerId,
    pub remote: PeerId,
    pub socket_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionClosedInfo {
    pub local: PeerId,
    pub remote: PeerId,
    pub socket_name: String,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatTypeQueried {
    pub nat_type: NatType,
}

/// Options for one outbound packet.
#[derive(Debug, Clone)]
pub struct SendPacket {
    pub remote: PeerId,
    pub socket_name: String,
    pub channel: u8,
    pub data: Vec<u8>,
    /// Queue while not connected. When false, such packets are dropped.
    pub allow_delayed_delivery: bool,
}

impl SendPacket {
    pub fn new(remote: PeerId, socket_name: impl Into<String>, channel: u8, data: Vec<u8>) -> Self {
        Self {
            remote,
            socket_name: socket_name.into(),
            channel,
            data,
            allow_delayed_delivery: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPacket {
    pub remote: PeerId,
    pub socket_name: String,
    pub channel: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum P2pError {
    #[error("invalid parameter: {0}")]
    InvalidParameters(&'static str),
    #[error("packet of {0} bytes is over the size limit")]
    LimitExceeded(usize),
}

#[derive(Debug, Default)]
struct P2pLinkState {
    status: LinkStatus,
    outbound: VecDeque<P2pData>,
    socket_name: String,
    /// Start of the connecting or loss timer.
    since: Option<Instant>,
}

/// One local identity's P2P endpoint. Register it with [`P2pSession::install`].
pub struct P2pSession {
    local: PeerId,
    links: HashMap<PeerId, P2pLinkState>,
    inbound: BTreeMap<u8, VecDeque<P2pData>>,
    connecting_timeout: Duration,
    loss_timeout: Duration,
    relay_control: RelayControl,
    port: u16,
    additional_ports: u16,
    nat_type: Arc<Mutex<NatType>>,
}

impl P2pSession {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            links: HashMap::new(),
            inbound: BTreeMap::new(),
            connecting_timeout: CONNECTING_TIMEOUT,
            loss_timeout: LOSS_TIMEOUT,
            relay_control: RelayControl::default(),
            port: DEFAULT_PORT,
            additional_ports: DEFAULT_ADDITIONAL_PORTS,
            nat_type: Arc::new(Mutex::new(NatType::Unknown)),
        }
    }

    pub fn with_timeouts(mut self, connecting: Duration, loss: Duration) -> Self {
        self.connecting_timeout = connecting;
        self.loss_timeout = loss;
        self
    }

    /// Register a session for `local` on `channel`: module, frame participant, listeners for
    /// P2P traffic and link notices, and the channel assignment for `local`.
    pub fn install(hub: &Hub, local: PeerId, channel: ChannelId) -> (ModuleId, Arc<Mutex<P2pSession>>) {
        Self::install_session(hub, P2pSession::new(local), channel)
    }

    pub fn install_session(
        hub: &Hub,
        session: P2pSession,
        channel: ChannelId,
    ) -> (ModuleId, Arc<Mutex<P2pSession>>) {
        let local = session.local.clone();
        let session = Arc::new(Mutex::new(session));
        let id = hub.register_module(session.clone());
        hub.register_frame_participant(id);
        hub.register_listener(id, PayloadType::P2p, channel);
        hub.register_listener(id, PayloadType::Peer, channel);
        hub.inbound().set_default_channel(local, channel);
        (id, session)
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    pub fn status(&self, remote: &PeerId) -> LinkStatus {
        self.links.get(remote).map(|l| l.status).unwrap_or_default()
    }

    pub fn queued(&self, remote: &PeerId) -> usize {
        self.links.get(remote).map_or(0, |l| l.outbound.len())
    }

    /// Send now if connected, otherwise queue (or drop) and start connecting if closed.
    /// Success means the packet was accepted, not delivered.
    pub fn send_packet(&mut self, cx: &Context<'_>, packet: SendPacket) -> Result<(), P2pError> {
        if packet.remote.is_empty() {
            return Err(P2pError::InvalidParameters("remote"));
        }
        validate_socket_name(&packet.socket_name)?;
        if packet.data.len() > MAX_PACKET_SIZE {
            return Err(P2pError::LimitExceeded(packet.data.len()));
        }
        let data = P2pData {
            user_id: self.local.clone(),
            socket_name: packet.socket_name.clone(),
            channel: packet.channel,
            data: packet.data,
        };
        let link = self.links.entry(packet.remote.clone()).or_default();
        match link.status {
            LinkStatus::Connected => {
                self.send_data(cx, &packet.remote, data);
            }
            LinkStatus::Lost | LinkStatus::Requesting | LinkStatus::Connecting => {
                if packet.allow_delayed_delivery {
                    link.outbound.push_back(data);
                }
            }
            LinkStatus::Closed => {
                if packet.allow_delayed_delivery {
                    link.outbound.push_back(data);
                }
                link.status = LinkStatus::Connecting;
                link.socket_name = packet.socket_name.clone();
                link.since = Some(Instant::now());
                tracing::debug!(remote = %packet.remote, socket = %packet.socket_name, "p2p connecting");
                self.send_control(
                    cx,
                    &packet.remote,
                    P2pMessage::ConnectRequest {
                        socket_name: packet.socket_name,
                    },
                );
            }
        }
        Ok(())
    }

    /// Size of the packet `receive_packet` would return next.
    pub fn next_packet_size(&self, requested_channel: Option<u8>) -> Option<usize> {
        self.peek(requested_channel).map(|d| d.data.len())
    }

    /// Pop the next buffered packet, oldest first. Data longer than `max_len` is truncated.
    pub fn receive_packet(&mut self, requested_channel: Option<u8>, max_len: usize) -> Option<ReceivedPacket> {
        let queue = match requested_channel {
            Some(ch) => self.inbound.get_mut(&ch)?,
            None => self.inbound.values_mut().find(|q| !q.is_empty())?,
        };
        let mut d = queue.pop_front()?;
        d.data.truncate(max_len);
        Some(ReceivedPacket {
            remote: d.user_id,
            socket_name: d.socket_name,
            channel: d.channel,
            data: d.data,
        })
    }

    fn peek(&self, requested_channel: Option<u8>) -> Option<&P2pData> {
        match requested_channel {
            Some(ch) => self.inbound.get(&ch)?.front(),
            None => self.inbound.values().find_map(|q| q.front()),
        }
    }

    /// Accept `remote`. A pending request is answered; otherwise a later request from
    /// `remote` is accepted automatically.
    pub fn accept_connection(&mut self, cx: &Context<'_>, remote: &PeerId, socket_name: &str) -> Result<(), P2pError> {
        if remote.is_empty() {
            return Err(P2pError::InvalidParameters("remote"));
        }
        validate_socket_name(socket_name)?;
        let link = self.links.entry(remote.clone()).or_default();
        if link.socket_name.is_empty() {
            link.socket_name = socket_name.to_owned();
        }
        if link.status == LinkStatus::Requesting {
            self.send_control(cx, remote, P2pMessage::ConnectResponse { accepted: true });
        }
        self.set_connected(cx, remote);
        Ok(())
    }

    /// Close the connection to `remote` (only if it uses `socket_name`, when given).
    /// Queued outbound and buffered inbound data for `remote` are always dropped.
    pub fn close_connection(
        &mut self,
        cx: &Context<'_>,
        remote: &PeerId,
        socket_name: Option<&str>,
    ) -> Result<(), P2pError> {
        if remote.is_empty() {
            return Err(P2pError::InvalidParameters("remote"));
        }
        self.purge_inbound(cx, remote);
        let Some(link) = self.links.get_mut(remote) else {
            return Ok(());
        };
        link.outbound.clear();
        let matches = socket_name.map_or(true, |s| s == link.socket_name);
        if link.status != LinkStatus::Closed && matches {
            link.status = LinkStatus::Closed;
            link.since = None;
            let socket_name = link.socket_name.clone();
            tracing::debug!(remote = %remote, "p2p closed locally");
            self.send_control(cx, remote, P2pMessage::ConnectionClose { socket_name });
        }
        Ok(())
    }

    /// Close every open connection on `socket_name`.
    pub fn close_connections(&mut self, cx: &Context<'_>, socket_name: &str) -> Result<(), P2pError> {
        validate_socket_name(socket_name)?;
        let remotes: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, l)| l.socket_name == socket_name && l.status != LinkStatus::Closed)
            .map(|(r, _)| r.clone())
            .collect();
        for remote in remotes {
            self.close_connection(cx, &remote, Some(socket_name))?;
        }
        Ok(())
    }

    pub fn add_notify_connection_request<F>(&self, cx: &Context<'_>, handler: F) -> NotificationId
    where
        F: FnMut(&ConnectionRequestInfo) + Send + 'static,
    {
        cx.register_notification(Notification::new(CONNECTION_REQUEST, handler))
    }

    pub fn remove_notify_connection_request(&self, cx: &Context<'_>, nid: NotificationId) -> bool {
        cx.unregister_notification(nid)
    }

    pub fn add_notify_connection_closed<F>(&self, cx: &Context<'_>, handler: F) -> NotificationId
    where
        F: FnMut(&ConnectionClosedInfo) + Send + 'static,
    {
        cx.register_notification(Notification::new(CONNECTION_CLOSED, handler))
    }

    pub fn remove_notify_connection_closed(&self, cx: &Context<'_>, nid: NotificationId) -> bool {
        cx.unregister_notification(nid)
    }

    /// There is no NAT to detect on a LAN: the query completes on the next tick with `Open`.
    pub fn query_nat_type<F>(&self, cx: &Context<'_>, mut handler: F) -> bool
    where
        F: FnMut(&NatTypeQueried) + Send + 'static,
    {
        let cache = self.nat_type.clone();
        let result = PendingResult::new(
            NAT_TYPE_QUERIED,
            NatTypeQueried {
                nat_type: NatType::Open,
            },
            move |q: &NatTypeQueried| {
                *cache.lock() = q.nat_type;
                handler(q);
            },
        )
        .completed();
        cx.enqueue_callback(result)
    }

    /// Last queried NAT type; `Unknown` until a query has completed.
    pub fn nat_type(&self) -> NatType {
        *self.nat_type.lock()
    }

    pub fn set_relay_control(&mut self, relay_control: RelayControl) {
        self.relay_control = relay_control;
    }

    pub fn relay_control(&self) -> RelayControl {
        self.relay_control
    }

    pub fn set_port_range(&mut self, port: u16, additional_ports: u16) -> Result<(), P2pError> {
        if port <= 1024 {
            return Err(P2pError::InvalidParameters("port"));
        }
        self.port = port;
        self.additional_ports = additional_ports;
        Ok(())
    }

    pub fn port_range(&self) -> (u16, u16) {
        (self.port, self.additional_ports)
    }

    fn set_connected(&mut self, cx: &Context<'_>, remote: &PeerId) {
        let Some(link) = self.links.get_mut(remote) else {
            return;
        };
        link.status = LinkStatus::Connected;
        link.since = None;
        let queued: Vec<P2pData> = link.outbound.drain(..).collect();
        tracing::debug!(remote = %remote, flushed = queued.len(), "p2p connected");
        for data in queued {
            self.send_data(cx, remote, data);
        }
    }

    fn close_with(&mut self, cx: &Context<'_>, remote: &PeerId, reason: CloseReason) {
        let socket_name = match self.links.get_mut(remote) {
            Some(link) => {
                link.status = LinkStatus::Closed;
                link.since = None;
                link.outbound.clear();
                link.socket_name.clone()
            }
            None => String::new(),
        };
        tracing::debug!(remote = %remote, ?reason, "p2p closed");
        cx.notify_all(
            CONNECTION_CLOSED,
            ConnectionClosedInfo {
                local: self.local.clone(),
                remote: remote.clone(),
                socket_name,
                reason,
            },
        );
    }

    /// Drop data from `remote` buffered here and still waiting in the hub's queues.
    fn purge_inbound(&mut self, cx: &Context<'_>, remote: &PeerId) {
        for queue in self.inbound.values_mut() {
            queue.retain(|d| &d.user_id != remote);
        }
        self.inbound.retain(|_, q| !q.is_empty());
        let local = &self.local;
        let dropped = cx.inbound().purge_where(|env| {
            &env.source == remote
                && env.destination.as_ref().map_or(true, |d| d == local)
                && matches!(env.payload, Payload::P2p(P2pMessage::Data(_)))
        });
        if dropped > 0 {
            tracing::debug!(remote = %remote, dropped, "purged queued p2p data");
        }
    }

    fn send_control(&self, cx: &Context<'_>, remote: &PeerId, msg: P2pMessage) {
        let env = Envelope::to(self.local.clone(), remote.clone(), Payload::P2p(msg));
        if let Err(e) = cx.send_to_one_peer(&env, Transport::Reliable) {
            tracing::debug!(remote = %remote, error = %e, "p2p control send failed");
        }
    }

    fn send_data(&self, cx: &Context<'_>, remote: &PeerId, data: P2pData) {
        let env = Envelope::to(self.local.clone(), remote.clone(), Payload::P2p(P2pMessage::Data(data)));
        if let Err(e) = cx.send_to_one_peer(&env, Transport::Unreliable) {
            tracing::debug!(remote = %remote, error = %e, "p2p data dropped");
        }
    }

    fn on_request(&mut self, cx: &Context<'_>, remote: &PeerId, socket_name: String) {
        let link = self.links.entry(remote.clone()).or_default();
        match link.status {
            LinkStatus::Connected => {
                self.send_control(cx, remote, P2pMessage::ConnectResponse { accepted: true });
            }
            // Both sides asked at once: their request answers ours.
            LinkStatus::Connecting => {
                self.send_control(cx, remote, P2pMessage::ConnectResponse { accepted: true });
                self.set_connected(cx, remote);
            }
            LinkStatus::Closed | LinkStatus::Requesting | LinkStatus::Lost => {
                link.status = LinkStatus::Requesting;
                link.since = Some(Instant::now());
                link.socket_name = socket_name.clone();
                cx.notify_all(
                    CONNECTION_REQUEST,
                    ConnectionRequestInfo {
                        local: self.local.clone(),
                        remote: remote.clone(),
                        socket_name,
                    },
                );
            }
        }
    }

    fn on_response(&mut self, cx: &Context<'_>, remote: &PeerId, accepted: bool) {
        if accepted {
            if self.status(remote) != LinkStatus::Connected {
                self.set_connected(cx, remote);
            }
        } else {
            self.close_with(cx, remote, CloseReason::ClosedByPeer);
        }
    }

    fn on_data(&mut self, cx: &Context<'_>, remote: &PeerId, mut data: P2pData) {
        let channel = data.channel;
        data.user_id = remote.clone();
        self.inbound.entry(channel).or_default().push_back(data);
        let env = Envelope::to(
            self.local.clone(),
            remote.clone(),
            Payload::P2p(P2pMessage::DataAck { channel }),
        );
        if let Err(e) = cx.send_to_one_peer(&env, Transport::Unreliable) {
            tracing::trace!(remote = %remote, error = %e, "ack not sent");
        }
    }

    fn on_close(&mut self, cx: &Context<'_>, remote: &PeerId) {
        self.purge_inbound(cx, remote);
        self.close_with(cx, remote, CloseReason::ClosedByPeer);
    }

    fn on_peer_notice(&mut self, cx: &Context<'_>, remote: &PeerId, notice: PeerNotice) {
        let Some(link) = self.links.get_mut(remote) else {
            return;
        };
        match (notice, link.status) {
            (PeerNotice::Disconnected, LinkStatus::Connected) => {
                link.status = LinkStatus::Lost;
                link.since = Some(Instant::now());
                tracing::debug!(remote = %remote, "p2p link lost");
            }
            (PeerNotice::Connected, LinkStatus::Lost) => self.set_connected(cx, remote),
            _ => {}
        }
    }
}

impl Participant for P2pSession {
    fn run_frame(&mut self, cx: &Context<'_>) {
        let now = Instant::now();
        let mut expired = Vec::new();
        for (remote, link) in &self.links {
            let Some(since) = link.since else { continue };
            let elapsed = now.saturating_duration_since(since);
            match link.status {
                LinkStatus::Connecting if elapsed > self.connecting_timeout => {
                    expired.push((remote.clone(), CloseReason::ConnectionFailed));
                }
                LinkStatus::Lost if elapsed > self.loss_timeout => {
                    expired.push((remote.clone(), CloseReason::TimedOut));
                }
                _ => {}
            }
        }
        for (remote, reason) in expired {
            self.close_with(cx, &remote, reason);
        }
    }

    fn on_envelope(&mut self, cx: &Context<'_>, envelope: &Envelope) {
        let remote = &envelope.source;
        if remote.is_empty() || remote == &self.local {
            return;
        }
        match &envelope.payload {
            Payload::Peer(notice) => self.on_peer_notice(cx, remote, *notice),
            Payload::P2p(msg) => {
                if envelope.destination.as_ref().is_some_and(|d| d != &self.local) {
                    return;
                }
                match msg {
                    P2pMessage::ConnectRequest { socket_name } => {
                        self.on_request(cx, remote, socket_name.clone())
                    }
                    P2pMessage::ConnectResponse { accepted } => self.on_response(cx, remote, *accepted),
                    P2pMessage::Data(data) => self.on_data(cx, remote, data.clone()),
                    P2pMessage::DataAck { channel } => {
                        tracing::trace!(remote = %remote, channel, "p2p ack");
                    }
                    P2pMessage::ConnectionClose { .. } => self.on_close(cx, remote),
                }
            }
            _ => {}
        }
    }
}

fn validate_socket_name(name: &str) -> Result<(), P2pError> {
    if name.is_empty() || name.len() > MAX_SOCKET_NAME_LEN {
        return Err(P2pError::InvalidParameters("socket name"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Inbound;
    use crate::hub::tests::{RecordingOutbound, Sent};
    use crate::hub::DEFAULT_MAX_FRAMES_PER_TICK;

    const CH: ChannelId = ChannelId(3);

    struct Node {
        hub: Hub,
        out: Arc<RecordingOutbound>,
        id: ModuleId,
        session: Arc<Mutex<P2pSession>>,
        me: PeerId,
    }

    impl Node {
        fn new(name: &str) -> Self {
            Self::with_session(P2pSession::new(PeerId::from(name)))
        }

        fn with_session(session: P2pSession) -> Self {
            Self::build(session, DEFAULT_MAX_FRAMES_PER_TICK)
        }

        fn build(session: P2pSession, max_frames: usize) -> Self {
            let out = Arc::new(RecordingOutbound::default());
            let hub = Hub::new(out.clone(), Arc::new(Inbound::new())).with_max_frames_per_tick(max_frames);
            let me = session.local().clone();
            let (id, session) = P2pSession::install_session(&hub, session, CH);
            Self {
                hub,
                out,
                id,
                session,
                me,
            }
        }

        fn send(&self, to: &Node, body: &[u8]) {
            let cx = self.hub.context(self.id);
            self.session
                .lock()
                .send_packet(&cx, SendPacket::new(to.me.clone(), "game", 0, body.to_vec()))
                .unwrap();
        }

        fn accept(&self, from: &Node) {
            let cx = self.hub.context(self.id);
            self.session.lock().accept_connection(&cx, &from.me, "game").unwrap();
        }

        fn status(&self, other: &Node) -> LinkStatus {
            self.session.lock().status(&other.me)
        }

        fn drain(&self) -> Vec<Vec<u8>> {
            let mut out = Vec::new();
            while let Some(p) = self.session.lock().receive_packet(None, MAX_PACKET_SIZE) {
                out.push(p.data);
            }
            out
        }

        fn closed_log(&self) -> Arc<Mutex<Vec<ConnectionClosedInfo>>> {
            let log = Arc::new(Mutex::new(Vec::new()));
            let l = log.clone();
            let cx = self.hub.context(self.id);
            self.session
                .lock()
                .add_notify_connection_closed(&cx, move |i: &ConnectionClosedInfo| l.lock().push(i.clone()));
            log
        }
    }

    /// Deliver everything `from` sent to `to`, then tick `to`.
    fn hop(from: &Node, to: &Node) {
        from.out.deliver_to(&to.hub);
        to.hub.tick();
    }

    fn data_bodies(sent: &[Sent]) -> Vec<Vec<u8>> {
        sent.iter()
            .filter_map(|s| match s {
                Sent::One(
                    Envelope {
                        payload: Payload::P2p(P2pMessage::Data(d)),
                        ..
                    },
                    Transport::Unreliable,
                ) => Some(d.data.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn send_while_closed_queues_and_requests() {
        let a = Node::new("a");
        let b = Node::new("b");
        a.send(&b, b"1");
        assert_eq!(a.status(&b), LinkStatus::Connecting);
        assert_eq!(a.session.lock().queued(&b.me), 1);
        let sent = a.out.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(
            &sent[0],
            Sent::One(
                Envelope {
                    payload: Payload::P2p(P2pMessage::ConnectRequest { .. }),
                    ..
                },
                Transport::Reliable
            )
        ));
        // A second send while connecting queues without another request.
        a.send(&b, b"2");
        assert!(a.out.take().is_empty());
        assert_eq!(a.session.lock().queued(&b.me), 2);
    }

    #[test]
    fn queued_packets_flush_once_in_order_before_later_sends() {
        let a = Node::new("a");
        let b = Node::new("b");
        let requests = Arc::new(Mutex::new(Vec::new()));
        {
            let r = requests.clone();
            let cx = b.hub.context(b.id);
            b.session
                .lock()
                .add_notify_connection_request(&cx, move |i: &ConnectionRequestInfo| r.lock().push(i.clone()));
        }

        for body in [b"1", b"2", b"3"] {
            a.send(&b, body);
        }
        hop(&a, &b);
        assert_eq!(b.status(&a), LinkStatus::Requesting);
        assert_eq!(requests.lock().len(), 1);
        assert_eq!(requests.lock()[0].remote, a.me);
        assert_eq!(requests.lock()[0].socket_name, "game");

        b.accept(&a);
        assert_eq!(b.status(&a), LinkStatus::Connected);
        hop(&b, &a);
        assert_eq!(a.status(&b), LinkStatus::Connected);
        assert_eq!(a.session.lock().queued(&b.me), 0);

        a.send(&b, b"4");
        let sent = a.out.take();
        assert_eq!(data_bodies(&sent), vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);
        for s in sent {
            b.hub.inbound().push(s.envelope().clone());
        }
        b.hub.tick();
        assert_eq!(b.drain(), vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec(), b"4".to_vec()]);

        // Each data packet was acknowledged unreliably; nothing gets re-sent.
        let acks = b
            .out
            .take()
            .into_iter()
            .filter(|s| matches!(s.envelope().payload, Payload::P2p(P2pMessage::DataAck { .. })))
            .count();
        assert_eq!(acks, 4);
        hop(&b, &a);
        assert!(a.out.take().is_empty());
    }

    #[test]
    fn request_while_connected_is_answered_immediately() {
        let a = Node::new("a");
        let b = Node::new("b");
        b.accept(&a);
        assert_eq!(b.status(&a), LinkStatus::Connected);
        a.send(&b, b"x");
        hop(&a, &b);
        let sent = b.out.take();
        assert!(sent.iter().any(|s| matches!(
            s.envelope().payload,
            Payload::P2p(P2pMessage::ConnectResponse { accepted: true })
        )));
        assert_eq!(b.status(&a), LinkStatus::Connected);
    }

    #[test]
    fn rejected_response_closes_and_notifies() {
        let a = Node::new("a");
        let b = Node::new("b");
        let log = a.closed_log();
        a.send(&b, b"1");
        a.out.take();
        a.hub.inbound().push(Envelope::to(
            b.me.clone(),
            a.me.clone(),
            Payload::P2p(P2pMessage::ConnectResponse { accepted: false }),
        ));
        a.hub.tick();
        assert_eq!(a.status(&b), LinkStatus::Closed);
        assert_eq!(a.session.lock().queued(&b.me), 0);
        let log = log.lock();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].reason, CloseReason::ClosedByPeer);
        assert_eq!(log[0].remote, b.me);
    }

    #[test]
    fn close_purges_both_directions() {
        let a = Node::new("a");
        let b = Node::new("b");
        let c = Node::new("c");
        b.accept(&a);
        b.accept(&c);
        a.accept(&b);
        c.accept(&b);
        a.send(&b, b"from-a");
        c.send(&b, b"from-c");
        hop(&a, &b);
        hop(&c, &b);
        assert_eq!(b.session.lock().next_packet_size(None), Some(6));

        let cx = b.hub.context(b.id);
        b.session.lock().close_connection(&cx, &a.me, None).unwrap();
        assert_eq!(b.status(&a), LinkStatus::Closed);
        assert_eq!(b.drain(), vec![b"from-c".to_vec()]);

        let log = a.closed_log();
        hop(&b, &a);
        assert_eq!(a.status(&b), LinkStatus::Closed);
        assert_eq!(log.lock()[0].reason, CloseReason::ClosedByPeer);
    }

    #[test]
    fn close_drops_data_still_queued_in_the_hub() {
        let a = Node::new("a");
        let b = Node::build(P2pSession::new(PeerId::from("b")), 1);
        b.accept(&a);
        a.accept(&b);
        a.out.take();
        a.send(&b, b"one");
        a.send(&b, b"two");
        a.out.deliver_to(&b.hub);
        b.hub.inbound().push(Envelope::to(
            a.me.clone(),
            b.me.clone(),
            Payload::Stats(vec![1]),
        ));
        b.hub.tick();
        assert_eq!(b.hub.inbound().len(), 2);

        let cx = b.hub.context(b.id);
        b.session.lock().close_connection(&cx, &a.me, None).unwrap();
        // Only the p2p data goes; other traffic from the peer stays queued.
        assert_eq!(b.hub.inbound().len(), 1);
        b.hub.tick();
        b.hub.tick();
        assert!(b.drain().is_empty());
        assert_eq!(b.status(&a), LinkStatus::Closed);
    }

    #[test]
    fn connecting_times_out_as_failed() {
        let a = Node::with_session(
            P2pSession::new(PeerId::from("a")).with_timeouts(Duration::from_millis(20), LOSS_TIMEOUT),
        );
        let b = Node::new("b");
        let log = a.closed_log();
        a.send(&b, b"1");
        a.hub.tick();
        assert!(log.lock().is_empty());
        std::thread::sleep(Duration::from_millis(30));
        a.hub.tick();
        assert_eq!(a.status(&b), LinkStatus::Closed);
        assert_eq!(a.session.lock().queued(&b.me), 0);
        assert_eq!(log.lock()[0].reason, CloseReason::ConnectionFailed);
    }

    #[test]
    fn lost_link_recovers_and_flushes_or_times_out() {
        let a = Node::with_session(
            P2pSession::new(PeerId::from("a")).with_timeouts(CONNECTING_TIMEOUT, Duration::from_millis(20)),
        );
        let b = Node::new("b");
        a.accept(&b);
        let notice = |n| Envelope::broadcast(b.me.clone(), Payload::Peer(n));

        a.hub.inbound().push(notice(PeerNotice::Disconnected));
        a.hub.tick();
        assert_eq!(a.status(&b), LinkStatus::Lost);
        a.send(&b, b"held");
        assert!(a.out.take().is_empty());

        a.hub.inbound().push(notice(PeerNotice::Connected));
        a.hub.tick();
        assert_eq!(a.status(&b), LinkStatus::Connected);
        assert_eq!(data_bodies(&a.out.take()), vec![b"held".to_vec()]);

        let log = a.closed_log();
        a.hub.inbound().push(notice(PeerNotice::Disconnected));
        a.hub.tick();
        std::thread::sleep(Duration::from_millis(30));
        a.hub.tick();
        assert_eq!(a.status(&b), LinkStatus::Closed);
        assert_eq!(log.lock()[0].reason, CloseReason::TimedOut);
    }

    #[test]
    fn undelayed_packets_are_dropped_until_connected() {
        let a = Node::new("a");
        let b = Node::new("b");
        let cx = a.hub.context(a.id);
        let mut packet = SendPacket::new(b.me.clone(), "game", 1, b"now".to_vec());
        packet.allow_delayed_delivery = false;
        a.session.lock().send_packet(&cx, packet).unwrap();
        assert_eq!(a.status(&b), LinkStatus::Connecting);
        assert_eq!(a.session.lock().queued(&b.me), 0);
    }

    #[test]
    fn parameters_are_validated() {
        let a = Node::new("a");
        let cx = a.hub.context(a.id);
        let mut s = a.session.lock();
        let big = SendPacket::new(PeerId::from("b"), "game", 0, vec![0; MAX_PACKET_SIZE + 1]);
        assert_eq!(s.send_packet(&cx, big), Err(P2pError::LimitExceeded(MAX_PACKET_SIZE + 1)));
        let nameless = SendPacket::new(PeerId::from("b"), "", 0, vec![1]);
        assert!(s.send_packet(&cx, nameless).is_err());
        let long = SendPacket::new(PeerId::from("b"), "x".repeat(33), 0, vec![1]);
        assert!(s.send_packet(&cx, long).is_err());
        assert!(s.set_port_range(80, 1).is_err());
        s.set_port_range(9000, 5).unwrap();
        assert_eq!(s.port_range(), (9000, 5));
        s.set_relay_control(RelayControl::ForceRelays);
        assert_eq!(s.relay_control(), RelayControl::ForceRelays);
    }

    #[test]
    fn receive_respects_channel_and_truncates() {
        let a = Node::new("a");
        let b = Node::new("b");
        b.accept(&a);
        a.accept(&b);
        let cx = a.hub.context(a.id);
        for (ch, body) in [(2u8, b"two".to_vec()), (1u8, b"one-long".to_vec())] {
            a.session
                .lock()
                .send_packet(&cx, SendPacket::new(b.me.clone(), "game", ch, body))
                .unwrap();
        }
        hop(&a, &b);
        let mut s = b.session.lock();
        assert_eq!(s.next_packet_size(Some(2)), Some(3));
        assert_eq!(s.next_packet_size(None), Some(8));
        let p = s.receive_packet(Some(2), 64).unwrap();
        assert_eq!((p.channel, p.data.as_slice()), (2, b"two".as_slice()));
        assert_eq!(p.remote, a.me);
        let p = s.receive_packet(None, 3).unwrap();
        assert_eq!(p.data, b"one".to_vec());
        assert!(s.receive_packet(None, 64).is_none());
        assert_eq!(s.next_packet_size(Some(9)), None);
    }

    #[test]
    fn nat_query_completes_on_tick() {
        let a = Node::new("a");
        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        let cx = a.hub.context(a.id);
        assert!(a
            .session
            .lock()
            .query_nat_type(&cx, move |q: &NatTypeQueried| *g.lock() = Some(q.nat_type)));
        assert_eq!(a.session.lock().nat_type(), NatType::Unknown);
        a.hub.tick();
        assert_eq!(*got.lock(), Some(NatType::Open));
        assert_eq!(a.session.lock().nat_type(), NatType::Open);
    }
}
