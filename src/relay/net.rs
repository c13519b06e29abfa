//! Socket plumbing shared by the relays
//!
//! [`Listener`] and [`PacketSocket`] wrap the inherited sockets, [`Connection`]
//! wraps an outbound connection of any supported network. Outbound halves
//! implement `AsyncRead`/`AsyncWrite` so stream and datagram destinations are
//! driven by the same copy loops.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use socket2::{Domain, Socket};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{
    lookup_host, tcp, unix, TcpListener, TcpStream, UdpSocket, UnixDatagram, UnixListener,
    UnixStream,
};
use tracing::debug;

use super::destination::{Destination, Network, Origin};
use crate::Result;

/// Address family of an inherited socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Family {
    Inet,
    Unix,
}

fn socket_family(socket: &Socket) -> Result<Family> {
    let addr = socket
        .local_addr()
        .context("Failed to query bound address of inherited socket")?;
    if addr.as_socket().is_some() {
        Ok(Family::Inet)
    } else if addr.domain() == Domain::UNIX {
        Ok(Family::Unix)
    } else {
        bail!("Unsupported address family for inherited socket: {:?}", addr.domain())
    }
}

/// Listening socket owned by a stream relay
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Listener {
    /// Take ownership of an inherited, already listening stream socket
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let socket = Socket::from(fd);
        socket
            .set_nonblocking(true)
            .context("Failed to switch inherited listener to non-blocking mode")?;
        let listener = match socket_family(&socket)? {
            Family::Inet => {
                let std_listener = std::net::TcpListener::from(OwnedFd::from(socket));
                Listener::Tcp(TcpListener::from_std(std_listener)?)
            }
            Family::Unix => {
                let std_listener =
                    std::os::unix::net::UnixListener::from(OwnedFd::from(socket));
                Listener::Unix(UnixListener::from_std(std_listener)?)
            }
        };
        Ok(listener)
    }

    /// Accept the next inbound connection
    pub async fn accept(&self) -> io::Result<(Connection, PeerAddr)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Connection::Tcp(stream), PeerAddr::Inet(addr)))
            }
            Listener::Unix(listener) => {
                let (stream, addr) = listener.accept().await?;
                Ok((Connection::Unix(stream), PeerAddr::from(addr)))
            }
        }
    }

    /// Network and bound address as seen by the destination resolver
    pub fn origin(&self) -> Origin {
        match self {
            Listener::Tcp(listener) => Origin::new(Network::Tcp, listener.local_addr().ok()),
            Listener::Unix(_) => Origin::new(Network::Unix, None),
        }
    }

    /// Human readable bound address for logs
    pub fn local_label(&self) -> String {
        match self {
            Listener::Tcp(listener) => describe_inet(listener.local_addr()),
            Listener::Unix(listener) => describe_unix(listener.local_addr()),
        }
    }
}

/// Connectionless socket owned by a packet relay
#[derive(Debug)]
pub enum PacketSocket {
    Udp(UdpSocket),
    Unixgram(UnixDatagram),
}

impl PacketSocket {
    /// Take ownership of an inherited, already bound datagram socket
    pub fn from_fd(fd: OwnedFd) -> Result<Self> {
        let socket = Socket::from(fd);
        socket
            .set_nonblocking(true)
            .context("Failed to switch inherited packet socket to non-blocking mode")?;
        let packet = match socket_family(&socket)? {
            Family::Inet => {
                let std_socket = std::net::UdpSocket::from(OwnedFd::from(socket));
                PacketSocket::Udp(UdpSocket::from_std(std_socket)?)
            }
            Family::Unix => {
                let std_socket =
                    std::os::unix::net::UnixDatagram::from(OwnedFd::from(socket));
                PacketSocket::Unixgram(UnixDatagram::from_std(std_socket)?)
            }
        };
        Ok(packet)
    }

    pub async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, PeerAddr)> {
        match self {
            PacketSocket::Udp(socket) => {
                let (n, addr) = socket.recv_from(buf).await?;
                Ok((n, PeerAddr::Inet(addr)))
            }
            PacketSocket::Unixgram(socket) => {
                let (n, addr) = socket.recv_from(buf).await?;
                Ok((n, PeerAddr::from(addr)))
            }
        }
    }

    pub async fn send_to(&self, buf: &[u8], peer: &PeerAddr) -> io::Result<usize> {
        match (self, peer) {
            (PacketSocket::Udp(socket), PeerAddr::Inet(addr)) => socket.send_to(buf, addr).await,
            (PacketSocket::Unixgram(socket), PeerAddr::Unix(path)) => {
                socket.send_to(buf, path).await
            }
            (_, peer) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot reply to {} from this socket", peer),
            )),
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            PacketSocket::Udp(socket) => Origin::new(Network::Udp, socket.local_addr().ok()),
            PacketSocket::Unixgram(_) => Origin::new(Network::Unixgram, None),
        }
    }

    pub fn local_label(&self) -> String {
        match self {
            PacketSocket::Udp(socket) => describe_inet(socket.local_addr()),
            PacketSocket::Unixgram(socket) => describe_unix(socket.local_addr()),
        }
    }
}

fn describe_inet(addr: io::Result<SocketAddr>) -> String {
    match addr {
        Ok(addr) => addr.to_string(),
        Err(_) => "(unknown)".to_string(),
    }
}

fn describe_unix(addr: io::Result<unix::SocketAddr>) -> String {
    match addr {
        Ok(addr) => PeerAddr::from(addr).to_string(),
        Err(_) => "(unknown)".to_string(),
    }
}

/// Remote end of an inbound connection or datagram
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerAddr {
    Inet(SocketAddr),
    Unix(PathBuf),
    /// Unix peer without a bound path; replies cannot be addressed to it
    Unnamed,
}

impl From<unix::SocketAddr> for PeerAddr {
    fn from(addr: unix::SocketAddr) -> Self {
        match addr.as_pathname() {
            Some(path) => PeerAddr::Unix(path.to_path_buf()),
            None => PeerAddr::Unnamed,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{}", addr),
            PeerAddr::Unix(path) => write!(f, "{}", path.display()),
            PeerAddr::Unnamed => f.write_str("(unnamed)"),
        }
    }
}

/// Connection to a relay destination, or an accepted inbound connection
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
    Udp(UdpSocket),
    Unixgram(UnixDatagram),
}

impl Connection {
    /// Dial the destination, giving up after `timeout`
    pub async fn dial(destination: &Destination, timeout: Duration) -> Result<Self> {
        match tokio::time::timeout(timeout, Self::connect(destination)).await {
            Ok(result) => result.with_context(|| format!("Failed to dial {}", destination)),
            Err(_) => Err(anyhow!(
                "Failed to dial {}: timed out after {:?}",
                destination,
                timeout
            )),
        }
    }

    async fn connect(destination: &Destination) -> io::Result<Self> {
        let network = &destination.network;
        let address = destination.address.as_str();
        match network {
            Network::Tcp | Network::Tcp4 | Network::Tcp6 => {
                let mut last_error = None;
                for addr in resolve_inet(network, address).await? {
                    match TcpStream::connect(addr).await {
                        Ok(stream) => return Ok(Connection::Tcp(stream)),
                        Err(e) => {
                            debug!("Failed to connect to {}: {}", addr, e);
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error.unwrap_or_else(no_addresses))
            }
            Network::Udp | Network::Udp4 | Network::Udp6 => {
                let mut last_error = None;
                for addr in resolve_inet(network, address).await? {
                    let bind_addr = if addr.is_ipv4() {
                        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
                    } else {
                        SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0)
                    };
                    let attempt = async {
                        let socket = UdpSocket::bind(bind_addr).await?;
                        socket.connect(addr).await?;
                        Ok::<_, io::Error>(socket)
                    };
                    match attempt.await {
                        Ok(socket) => return Ok(Connection::Udp(socket)),
                        Err(e) => {
                            debug!("Failed to connect to {}: {}", addr, e);
                            last_error = Some(e);
                        }
                    }
                }
                Err(last_error.unwrap_or_else(no_addresses))
            }
            Network::Unix => Ok(Connection::Unix(UnixStream::connect(address).await?)),
            Network::Unixgram => {
                let socket = UnixDatagram::unbound()?;
                socket.connect(address)?;
                Ok(Connection::Unixgram(socket))
            }
            Network::Other(name) => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported network {:?}", name),
            )),
        }
    }

    /// Split into independently owned read and write halves
    pub fn into_split(self) -> (ReadHalf, WriteHalf) {
        match self {
            Connection::Tcp(stream) => {
                let (read, write) = stream.into_split();
                (ReadHalf::Tcp(read), WriteHalf::Tcp(write))
            }
            Connection::Unix(stream) => {
                let (read, write) = stream.into_split();
                (ReadHalf::Unix(read), WriteHalf::Unix(write))
            }
            Connection::Udp(socket) => {
                let socket = Arc::new(socket);
                (ReadHalf::Udp(Arc::clone(&socket)), WriteHalf::Udp(socket))
            }
            Connection::Unixgram(socket) => {
                let socket = Arc::new(socket);
                (ReadHalf::Unixgram(Arc::clone(&socket)), WriteHalf::Unixgram(socket))
            }
        }
    }
}

fn no_addresses() -> io::Error {
    io::Error::new(io::ErrorKind::AddrNotAvailable, "no addresses resolved")
}

/// Resolve `host:port`, keeping only the IP version a `*4`/`*6` network allows
async fn resolve_inet(network: &Network, address: &str) -> io::Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = lookup_host(address)
        .await?
        .filter(|addr| match network {
            Network::Tcp4 | Network::Udp4 => addr.is_ipv4(),
            Network::Tcp6 | Network::Udp6 => addr.is_ipv6(),
            _ => true,
        })
        .collect();
    if addrs.is_empty() {
        return Err(no_addresses());
    }
    Ok(addrs)
}

/// Read half of a [`Connection`]
#[derive(Debug)]
pub enum ReadHalf {
    Tcp(tcp::OwnedReadHalf),
    Unix(unix::OwnedReadHalf),
    Udp(Arc<UdpSocket>),
    Unixgram(Arc<UnixDatagram>),
}

impl AsyncRead for ReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ReadHalf::Tcp(read) => Pin::new(read).poll_read(cx, buf),
            ReadHalf::Unix(read) => Pin::new(read).poll_read(cx, buf),
            ReadHalf::Udp(socket) => poll_datagram(buf, |buf| socket.poll_recv(cx, buf)),
            ReadHalf::Unixgram(socket) => poll_datagram(buf, |buf| socket.poll_recv(cx, buf)),
        }
    }
}

/// Receive the next non-empty datagram. Copy loops take a zero-length read
/// for end of stream, so empty datagrams are dropped here.
fn poll_datagram<F>(buf: &mut ReadBuf<'_>, mut recv: F) -> Poll<io::Result<()>>
where
    F: FnMut(&mut ReadBuf<'_>) -> Poll<io::Result<()>>,
{
    if buf.remaining() == 0 {
        return Poll::Ready(Ok(()));
    }
    loop {
        let before = buf.filled().len();
        ready!(recv(buf))?;
        if buf.filled().len() > before {
            return Poll::Ready(Ok(()));
        }
    }
}

/// Write half of a [`Connection`]
#[derive(Debug)]
pub enum WriteHalf {
    Tcp(tcp::OwnedWriteHalf),
    Unix(unix::OwnedWriteHalf),
    Udp(Arc<UdpSocket>),
    Unixgram(Arc<UnixDatagram>),
}

impl AsyncWrite for WriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WriteHalf::Tcp(write) => Pin::new(write).poll_write(cx, buf),
            WriteHalf::Unix(write) => Pin::new(write).poll_write(cx, buf),
            WriteHalf::Udp(socket) => socket.poll_send(cx, buf),
            WriteHalf::Unixgram(socket) => socket.poll_send(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WriteHalf::Tcp(write) => Pin::new(write).poll_flush(cx),
            WriteHalf::Unix(write) => Pin::new(write).poll_flush(cx),
            WriteHalf::Udp(_) | WriteHalf::Unixgram(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WriteHalf::Tcp(write) => Pin::new(write).poll_shutdown(cx),
            WriteHalf::Unix(write) => Pin::new(write).poll_shutdown(cx),
            WriteHalf::Udp(_) | WriteHalf::Unixgram(_) => Poll::Ready(Ok(())),
        }
    }
}
