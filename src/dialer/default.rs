//! Default dialer: bound sockets, retry, optional concurrent dial.

use super::tfo::LazyConnect;
use super::{concurrent_dial_enabled, Dialer};
use crate::common::metadata::{Destination, Network};
use crate::config::DialerOptions;
use crate::constant::{
    CONCURRENT_DIAL_FANOUT, DIAL_RETRY_ATTEMPTS, TCP_KEEPALIVE_INITIAL, TCP_KEEPALIVE_INTERVAL,
    TCP_TIMEOUT,
};
use crate::outbound::{OutboundDatagram, ProxyStream, UdpDatagram};
use crate::router::Router;
use crate::{Error, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};

pub struct DefaultDialer {
    inner: Arc<DialerInner>,
}

struct DialerInner {
    router: Weak<Router>,
    bind_interface: Option<String>,
    inet4_bind: Option<Ipv4Addr>,
    inet6_bind: Option<Ipv6Addr>,
    routing_mark: u32,
    reuse_addr: bool,
    connect_timeout: Duration,
    tcp_fast_open: bool,
}

impl DefaultDialer {
    pub fn new(router: Option<&Arc<Router>>, options: &DialerOptions) -> Result<Self> {
        let bind_interface = if options.bind_interface.is_empty() {
            None
        } else {
            Some(options.bind_interface.clone())
        };
        Ok(DefaultDialer {
            inner: Arc::new(DialerInner {
                router: router.map(Arc::downgrade).unwrap_or_default(),
                bind_interface,
                inet4_bind: options.inet4_bind_address,
                inet6_bind: options.inet6_bind_address,
                routing_mark: options.routing_mark,
                reuse_addr: options.reuse_addr,
                connect_timeout: options
                    .connect_timeout
                    .map(|d| d.get())
                    .filter(|d| !d.is_zero())
                    .unwrap_or(TCP_TIMEOUT),
                tcp_fast_open: options.tcp_fast_open,
            }),
        })
    }
}

impl DialerInner {
    /// Interface to bind, re-evaluated per socket so auto-detected default
    /// interface changes take effect on the next dial.
    fn effective_interface(&self) -> Option<String> {
        if self.bind_interface.is_some() {
            return self.bind_interface.clone();
        }
        let router = self.router.upgrade()?;
        if router.auto_detect_interface() || !router.default_interface().is_empty() {
            let interface = router.default_interface();
            if !interface.is_empty() {
                return Some(interface);
            }
        }
        None
    }

    fn effective_mark(&self) -> u32 {
        if self.routing_mark != 0 {
            return self.routing_mark;
        }
        self.router
            .upgrade()
            .map(|router| router.default_mark())
            .unwrap_or(0)
    }

    fn build_socket(&self, domain: Domain, socket_type: Type, protocol: Protocol) -> Result<Socket> {
        let socket = Socket::new(domain, socket_type, Some(protocol))?;
        socket.set_nonblocking(true)?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            if let Some(interface) = self.effective_interface() {
                socket.bind_device(Some(interface.as_bytes()))?;
            }
            let mark = self.effective_mark();
            if mark != 0 {
                socket.set_mark(mark)?;
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let _ = self.effective_interface();
            let _ = self.effective_mark();
        }
        if self.reuse_addr {
            socket.set_reuse_address(true)?;
        }
        if socket_type == Type::STREAM {
            let keepalive = TcpKeepalive::new().with_time(TCP_KEEPALIVE_INITIAL);
            #[cfg(unix)]
            let keepalive = keepalive.with_interval(TCP_KEEPALIVE_INTERVAL);
            socket.set_tcp_keepalive(&keepalive)?;
        }
        Ok(socket)
    }

    fn bind_local(&self, socket: &Socket, remote: SocketAddr) -> Result<()> {
        let local: Option<SocketAddr> = match remote {
            SocketAddr::V4(_) => self.inet4_bind.map(|ip| SocketAddr::new(IpAddr::V4(ip), 0)),
            SocketAddr::V6(_) => self.inet6_bind.map(|ip| SocketAddr::new(IpAddr::V6(ip), 0)),
        };
        if let Some(local) = local {
            socket.bind(&local.into())?;
        }
        Ok(())
    }

    async fn dial_tcp_once(&self, addr: SocketAddr) -> Result<TcpStream> {
        let socket = self.build_socket(Domain::for_address(addr), Type::STREAM, Protocol::TCP)?;
        self.bind_local(&socket, addr)?;
        let socket = TcpSocket::from_std_stream(socket.into());
        let stream = tokio::time::timeout(self.connect_timeout, socket.connect(addr))
            .await
            .map_err(|_| Error::timeout(format!("connect {}", addr)))??;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn dial_tcp_with_retry(&self, addr: SocketAddr) -> Result<TcpStream> {
        let mut last_err = None;
        for _ in 0..DIAL_RETRY_ATTEMPTS {
            match self.dial_tcp_once(addr).await {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::connection(format!("dial {} failed", addr))))
    }

    async fn dial_tcp(self: &Arc<Self>, addr: SocketAddr) -> Result<TcpStream> {
        if !concurrent_dial_enabled() {
            return self.dial_tcp_with_retry(addr).await;
        }
        let (tx, mut rx) = tokio::sync::mpsc::channel(CONCURRENT_DIAL_FANOUT);
        for _ in 0..CONCURRENT_DIAL_FANOUT {
            let inner = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _ = tx.send(inner.dial_tcp_with_retry(addr).await).await;
            });
        }
        drop(tx);
        let mut last_err = None;
        for _ in 0..CONCURRENT_DIAL_FANOUT {
            match rx.recv().await {
                Some(Ok(stream)) => {
                    // Later winners close as their results drop.
                    tokio::spawn(async move { while rx.recv().await.is_some() {} });
                    return Ok(stream);
                }
                Some(Err(err)) => last_err = Some(err),
                None => break,
            }
        }
        Err(last_err.unwrap_or_else(|| Error::connection(format!("dial {} failed", addr))))
    }

    fn bind_udp(&self, remote: SocketAddr) -> Result<UdpSocket> {
        let socket = self.build_socket(Domain::for_address(remote), Type::DGRAM, Protocol::UDP)?;
        let local: SocketAddr = match remote {
            SocketAddr::V4(_) => SocketAddr::new(
                IpAddr::V4(self.inet4_bind.unwrap_or(Ipv4Addr::UNSPECIFIED)),
                0,
            ),
            SocketAddr::V6(_) => SocketAddr::new(
                IpAddr::V6(self.inet6_bind.unwrap_or(Ipv6Addr::UNSPECIFIED)),
                0,
            ),
        };
        socket.bind(&local.into())?;
        Ok(UdpSocket::from_std(socket.into())?)
    }

    fn listen_packet_with_retry(&self, remote: SocketAddr) -> Result<UdpSocket> {
        let mut last_err = None;
        for _ in 0..DIAL_RETRY_ATTEMPTS {
            match self.bind_udp(remote) {
                Ok(socket) => return Ok(socket),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::connection("listen packet failed")))
    }
}

#[async_trait]
impl Dialer for DefaultDialer {
    async fn connect(
        &self,
        network: Network,
        destination: &Destination,
    ) -> Result<Box<dyn ProxyStream>> {
        let addr = destination
            .socket_addr()
            .ok_or_else(|| Error::address(format!("invalid address: {}", destination)))?;
        match network {
            Network::Tcp => {
                if self.inner.tcp_fast_open {
                    let inner = self.inner.clone();
                    let connect = move |payload: Vec<u8>| -> super::tfo::ConnectFuture {
                        Box::pin(async move {
                            let mut stream = inner.dial_tcp(addr).await.map_err(|e| {
                                io::Error::new(io::ErrorKind::ConnectionRefused, e.to_string())
                            })?;
                            if !payload.is_empty() {
                                stream.write_all(&payload).await?;
                            }
                            Ok(stream)
                        })
                    };
                    return Ok(Box::new(LazyConnect::new(connect)));
                }
                Ok(Box::new(self.inner.dial_tcp(addr).await?))
            }
            Network::Udp => {
                let socket = self.inner.listen_packet_with_retry(addr)?;
                socket.connect(addr).await?;
                Ok(Box::new(ConnectedUdpStream::new(socket)))
            }
        }
    }

    async fn listen_packet(&self, destination: &Destination) -> Result<Box<dyn OutboundDatagram>> {
        let addr = destination
            .socket_addr()
            .ok_or_else(|| Error::address(format!("invalid address: {}", destination)))?;
        let socket = self.inner.listen_packet_with_retry(addr)?;
        Ok(Box::new(UdpDatagram(Arc::new(socket))))
    }
}

/// Connected UDP socket presented as a stream, for datagram dials that go
/// through the stream-shaped dialer interface.
pub struct ConnectedUdpStream {
    socket: UdpSocket,
}

impl ConnectedUdpStream {
    fn new(socket: UdpSocket) -> Self {
        ConnectedUdpStream { socket }
    }
}

impl AsyncRead for ConnectedUdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for ConnectedUdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl ProxyStream for ConnectedUdpStream {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialer::set_concurrent_dial;

    fn default_dialer() -> DefaultDialer {
        DefaultDialer::new(None, &DialerOptions::default()).unwrap()
    }

    #[tokio::test]
    async fn test_tcp_dial_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dialer = default_dialer();
        let destination = Destination::from(addr);

        let stream = dialer.connect(Network::Tcp, &destination).await.unwrap();
        let (accepted, _) = listener.accept().await.unwrap();
        drop(accepted);
        drop(stream);
    }

    #[tokio::test]
    async fn test_fqdn_rejected() {
        let dialer = default_dialer();
        let destination = Destination::new_fqdn("example.com", 80);
        let result = dialer.connect(Network::Tcp, &destination).await;
        assert!(matches!(result, Err(Error::Address(_))));
    }

    #[tokio::test]
    async fn test_concurrent_dial_returns_first() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    break;
                };
                drop(conn);
            }
        });

        set_concurrent_dial(true);
        let dialer = default_dialer();
        let result = dialer.connect(Network::Tcp, &Destination::from(addr)).await;
        set_concurrent_dial(false);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_udp_listen_packet() {
        let dialer = default_dialer();
        let server = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let destination = Destination::from(server_addr);

        let datagram = dialer.listen_packet(&destination).await.unwrap();
        datagram.send_to(b"ping", &destination).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = server.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        server.send_to(b"pong", from).await.unwrap();

        let mut buf = [0u8; 16];
        let (n, _) = datagram.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");
    }
}
