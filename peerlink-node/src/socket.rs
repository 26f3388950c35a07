//! Socket layer over tokio: non-blocking datagram and stream sockets, listener, port-range
//! binding and multiplexed readiness polling. Failures are mapped to [`SocketError`] kinds.

use std::collections::BTreeMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{select_all, FutureExt};
use tokio::io::Interest;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("operation would block")]
    WouldBlock,
    #[error("connection reset")]
    Reset,
    #[error("host or network unreachable")]
    Unreachable,
    #[error("connection refused")]
    Refused,
    #[error("address in use")]
    AddrInUse,
    #[error("timed out")]
    TimedOut,
    #[error("connection closed")]
    Closed,
    #[error(transparent)]
    Other(io::Error),
}

impl From<io::Error> for SocketError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind::*;
        match e.kind() {
            WouldBlock => SocketError::WouldBlock,
            ConnectionReset | ConnectionAborted | BrokenPipe => SocketError::Reset,
            ConnectionRefused => SocketError::Refused,
            AddrInUse => SocketError::AddrInUse,
            TimedOut => SocketError::TimedOut,
            UnexpectedEof => SocketError::Closed,
            _ if matches!(e.raw_os_error(), Some(code) if is_unreachable(code)) => SocketError::Unreachable,
            _ => SocketError::Other(e),
        }
    }
}

#[cfg(unix)]
fn is_unreachable(code: i32) -> bool {
    // ENETUNREACH, EHOSTUNREACH on Linux.
    code == 101 || code == 113
}

#[cfg(not(unix))]
fn is_unreachable(code: i32) -> bool {
    // WSAENETUNREACH, WSAEHOSTUNREACH.
    code == 10051 || code == 10065
}

impl SocketError {
    pub fn is_would_block(&self) -> bool {
        matches!(self, SocketError::WouldBlock)
    }

}

/// Try `first..first+count` in order; address-in-use moves on, other errors abort.
fn bind_in_range<T>(
    first: u16,
    count: u16,
    mut bind: impl FnMut(u16) -> io::Result<T>,
) -> Result<Option<T>, SocketError> {
    for offset in 0..count.max(1) {
        let Some(port) = first.checked_add(offset) else {
            break;
        };
        match bind(port) {
            Ok(s) => return Ok(Some(s)),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                tracing::debug!(port, "port in use, trying next");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(None)
}

/// Connectionless socket with broadcast enabled.
#[derive(Debug)]
pub struct DatagramSocket {
    inner: UdpSocket,
    port: u16,
}

impl DatagramSocket {
    /// Bind the first free port of the range. `Ok(None)` when every port is taken.
    /// Must be called inside a tokio runtime context.
    pub fn bind_in_range(ip: IpAddr, first: u16, count: u16) -> Result<Option<Self>, SocketError> {
        let Some(std_sock) = bind_in_range(first, count, |port| std::net::UdpSocket::bind((ip, port)))? else {
            return Ok(None);
        };
        std_sock.set_broadcast(true)?;
        std_sock.set_nonblocking(true)?;
        let port = std_sock.local_addr()?.port();
        let inner = UdpSocket::from_std(std_sock)?;
        Ok(Some(Self { inner, port }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Non-blocking send; usable from any thread while the owning runtime is alive.
    pub fn try_send_to(&self, bytes: &[u8], to: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.inner.try_send_to(bytes, to)?)
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        Ok(self.inner.recv_from(buf).await?)
    }
}

#[derive(Debug)]
pub struct StreamListener {
    inner: TcpListener,
    port: u16,
}

impl StreamListener {
    /// Bind and listen on the first free port of the range. Must run inside a runtime context.
    pub fn bind_in_range(ip: IpAddr, first: u16, count: u16) -> Result<Option<Self>, SocketError> {
        let Some(std_listener) = bind_in_range(first, count, |port| std::net::TcpListener::bind((ip, port)))? else {
            return Ok(None);
        };
        std_listener.set_nonblocking(true)?;
        let port = std_listener.local_addr()?.port();
        let inner = TcpListener::from_std(std_listener)?;
        Ok(Some(Self { inner, port }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn accept(&self) -> Result<StreamSocket, SocketError> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok(StreamSocket { inner: stream, peer })
    }
}

/// Connected stream socket. All I/O is non-blocking; wait with [`StreamSocket::ready`].
#[derive(Debug)]
pub struct StreamSocket {
    inner: TcpStream,
    peer: SocketAddr,
}

impl StreamSocket {
    pub async fn connect(addr: SocketAddr, timeout: Duration) -> Result<Self, SocketError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SocketError::TimedOut)??;
        stream.set_nodelay(true)?;
        Ok(Self {
            inner: stream,
            peer: addr,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn try_send(&self, bytes: &[u8]) -> Result<usize, SocketError> {
        Ok(self.inner.try_write(bytes)?)
    }

    /// A zero-length read is reported as [`SocketError::Closed`].
    pub fn try_recv(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        match self.inner.try_read(buf)? {
            0 => Err(SocketError::Closed),
            n => Ok(n),
        }
    }

    pub async fn ready(&self, want_write: bool) -> Result<Readiness, SocketError> {
        let interest = if want_write {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        let r = self.inner.ready(interest).await?;
        Ok(Readiness {
            readable: r.is_readable(),
            writable: r.is_writable(),
            hangup: r.is_read_closed() || r.is_write_closed(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
}

impl Readiness {
    fn hangup() -> Self {
        Self {
            readable: false,
            writable: false,
            hangup: true,
        }
    }
}

/// Something a [`PollSet`] can wait on.
pub trait Pollable {
    fn stream(&self) -> &StreamSocket;

    /// Also wait for writability (queued output).
    fn wants_write(&self) -> bool {
        false
    }
}

impl Pollable for StreamSocket {
    fn stream(&self) -> &StreamSocket {
        self
    }
}

/// Readiness multiplexing over many stream sockets.
pub struct PollSet<K, S> {
    entries: BTreeMap<K, Arc<S>>,
}

impl<K, S> Default for PollSet<K, S> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }
}

impl<K: Ord + Clone, S: Pollable> PollSet<K, S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, key: K, socket: Arc<S>) {
        self.entries.insert(key, socket);
    }

    pub fn remove(&mut self, key: &K) -> Option<Arc<S>> {
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&Arc<S>> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait until at least one socket is ready; return every socket ready right now.
    /// An empty set never resolves. A readiness error is reported as hangup.
    pub async fn poll(&self) -> Vec<(K, Readiness)> {
        if self.is_empty() {
            return std::future::pending().await;
        }
        let waits: Vec<_> = self
            .entries
            .iter()
            .map(|(key, socket)| {
                let key = key.clone();
                let want_write = socket.wants_write();
                Box::pin(async move { (key, socket.stream().ready(want_write).await) })
            })
            .collect();
        let (first, _, rest) = select_all(waits).await;
        let mut out = vec![first];
        out.extend(rest.into_iter().filter_map(|w| w.now_or_never()));
        out.into_iter()
            .map(|(key, r)| (key, r.unwrap_or_else(|_| Readiness::hangup())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn rt() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn io_errors_map_to_kinds() {
        let e = |k| SocketError::from(io::Error::from(k));
        assert!(matches!(e(io::ErrorKind::WouldBlock), SocketError::WouldBlock));
        assert!(matches!(e(io::ErrorKind::ConnectionRefused), SocketError::Refused));
        assert!(matches!(e(io::ErrorKind::ConnectionReset), SocketError::Reset));
        assert!(matches!(e(io::ErrorKind::AddrInUse), SocketError::AddrInUse));
        assert!(matches!(e(io::ErrorKind::InvalidData), SocketError::Other(_)));
        assert!(SocketError::WouldBlock.is_would_block());
        assert!(!SocketError::Closed.is_would_block());
    }

    #[test]
    fn datagram_bind_skips_ports_in_use() {
        let rt = rt();
        let _guard = rt.enter();
        let taken = std::net::UdpSocket::bind((LOCALHOST, 47211)).unwrap();
        let s = DatagramSocket::bind_in_range(LOCALHOST, 47211, 3).unwrap().unwrap();
        assert_eq!(s.port(), 47212);
        let none = DatagramSocket::bind_in_range(LOCALHOST, 47211, 1).unwrap();
        assert!(none.is_none());
        drop(taken);
    }

    #[test]
    fn datagram_roundtrip_on_loopback() {
        let rt = rt();
        rt.block_on(async {
            let a = DatagramSocket::bind_in_range(LOCALHOST, 47221, 4).unwrap().unwrap();
            let b = DatagramSocket::bind_in_range(LOCALHOST, 47221, 4).unwrap().unwrap();
            assert_ne!(a.port(), b.port());
            a.try_send_to(b"ping", (LOCALHOST, b.port()).into()).unwrap();
            let mut buf = [0u8; 16];
            let (n, from) = b.recv_from(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"ping");
            assert_eq!(from.port(), a.port());
        });
    }

    #[test]
    fn stream_connect_poll_and_hangup() {
        let rt = rt();
        rt.block_on(async {
            let listener = StreamListener::bind_in_range(LOCALHOST, 47231, 4).unwrap().unwrap();
            let addr = SocketAddr::from((LOCALHOST, listener.port()));
            let (client, server) = tokio::join!(
                StreamSocket::connect(addr, Duration::from_secs(1)),
                listener.accept()
            );
            let client = Arc::new(client.unwrap());
            let server = Arc::new(server.unwrap());

            let mut set: PollSet<u32, StreamSocket> = PollSet::new();
            set.add(1, client.clone());
            set.add(2, server.clone());
            assert_eq!(set.len(), 2);

            client.try_send(b"hello").unwrap();
            let ready = tokio::time::timeout(Duration::from_secs(1), set.poll()).await.unwrap();
            assert!(ready.iter().any(|(k, r)| *k == 2 && r.readable));
            let mut buf = [0u8; 16];
            let n = server.try_recv(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"hello");

            set.remove(&1);
            drop(client);
            let closed = tokio::time::timeout(Duration::from_secs(1), async {
                loop {
                    set.poll().await;
                    match server.try_recv(&mut buf) {
                        Err(SocketError::WouldBlock) => continue,
                        other => return other,
                    }
                }
            })
            .await
            .unwrap();
            assert!(matches!(closed, Err(SocketError::Closed)));
        });
    }

    #[test]
    fn connect_refused_is_distinguishable() {
        let rt = rt();
        rt.block_on(async {
            // Bind then drop to find a port nobody listens on.
            let port = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap().local_addr().unwrap().port();
            let r = StreamSocket::connect((LOCALHOST, port).into(), Duration::from_secs(1)).await;
            assert!(matches!(r, Err(SocketError::Refused)));
        });
    }
}
