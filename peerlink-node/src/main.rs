// Peerlink node daemon: hosts one identity, discovers LAN peers and exchanges P2P packets.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::Mutex;
use peerlink_core::p2p::{ConnectionRequestInfo, P2pSession, SendPacket, MAX_PACKET_SIZE};
use peerlink_core::{ChannelId, Context, Envelope, Hub, Participant, Payload, PeerId, PeerNotice};
use peerlink_node::{config, Network};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const TICK_INTERVAL: Duration = Duration::from_millis(20);
const HELLO_SOCKET: &str = "hello";

/// Logs link notices and remembers who to greet.
struct NoticeLog {
    greet: Arc<Mutex<Vec<PeerId>>>,
}

impl Participant for NoticeLog {
    fn on_envelope(&mut self, _cx: &Context<'_>, envelope: &Envelope) {
        match envelope.payload {
            Payload::Peer(PeerNotice::Connected) => {
                tracing::info!(peer = %envelope.source, "peer connected");
                self.greet.lock().push(envelope.source.clone());
            }
            Payload::Peer(PeerNotice::Disconnected) => {
                tracing::info!(peer = %envelope.source, "peer disconnected");
            }
            _ => {}
        }
    }
}

fn main() -> anyhow::Result<()> {
    let mut id = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("peerlink-node {}", VERSION);
                return Ok(());
            }
            "--id" => id = args.next(),
            other => anyhow::bail!("unknown argument {other}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cfg = config::load();
    let local = id.map(PeerId::from).unwrap_or_else(PeerId::generate);
    let max_frames = cfg.max_frames_per_tick;
    let network = Arc::new(Network::start(cfg).context("starting network")?);
    network.add_local_peer(local.clone());
    tracing::info!(
        peer = %local,
        listen_port = network.listen_port(),
        discovery_port = network.discovery_port(),
        "peerlink-node {} up",
        VERSION
    );

    let hub = Hub::new(network.clone(), network.inbound()).with_max_frames_per_tick(max_frames);
    let (p2p_id, session) = P2pSession::install(&hub, local.clone(), ChannelId::DEFAULT);

    let greet = Arc::new(Mutex::new(Vec::new()));
    let log_id = hub.register_module(Arc::new(Mutex::new(NoticeLog {
        greet: greet.clone(),
    })));
    hub.register_listener(log_id, peerlink_core::PayloadType::Peer, ChannelId::DEFAULT);

    let requests: Arc<Mutex<Vec<ConnectionRequestInfo>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let cx = hub.context(p2p_id);
        let s = session.lock();
        let queue = requests.clone();
        s.add_notify_connection_request(&cx, move |req| queue.lock().push(req.clone()));
        s.add_notify_connection_closed(&cx, |closed| {
            tracing::info!(peer = %closed.remote, reason = ?closed.reason, "p2p connection closed");
        });
        s.query_nat_type(&cx, |q| tracing::debug!(nat = ?q.nat_type, "nat type"));
    }

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(async {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                r = &mut shutdown => {
                    r?;
                    break;
                }
            }
            hub.tick();

            let cx = hub.context(p2p_id);
            let mut s = session.lock();
            for req in requests.lock().drain(..) {
                if let Err(e) = s.accept_connection(&cx, &req.remote, &req.socket_name) {
                    tracing::warn!(peer = %req.remote, error = %e, "accept failed");
                }
            }
            for peer in greet.lock().drain(..) {
                let hello = SendPacket::new(peer, HELLO_SOCKET, 0, format!("hello from {local}").into_bytes());
                if let Err(e) = s.send_packet(&cx, hello) {
                    tracing::warn!(error = %e, "greeting not sent");
                }
            }
            while let Some(packet) = s.receive_packet(None, MAX_PACKET_SIZE) {
                tracing::info!(
                    peer = %packet.remote,
                    channel = packet.channel,
                    "received: {}",
                    String::from_utf8_lossy(&packet.data)
                );
            }
        }
        anyhow::Ok(())
    })?;

    tracing::info!("shutting down");
    network.stop();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
