//! Interrupt registry for connections lent out by a group.
//!
//! Every socket a group hands to a caller is wrapped and registered here so
//! that a later selection change can tear down stale tunnels. Handles are
//! held weakly: a dropped connection unregisters itself by virtue of its
//! handle dying.

use crate::common::metadata::Destination;
use crate::outbound::{OutboundDatagram, ProxyStream};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

struct ConnHandle {
    external: bool,
    interrupted: AtomicBool,
    wakers: Mutex<Vec<Waker>>,
    notify: tokio::sync::Notify,
}

impl ConnHandle {
    fn new(external: bool) -> Self {
        ConnHandle {
            external,
            interrupted: AtomicBool::new(false),
            wakers: Mutex::new(Vec::new()),
            notify: tokio::sync::Notify::new(),
        }
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        for waker in self.wakers.lock().drain(..) {
            waker.wake();
        }
        self.notify.notify_waiters();
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    fn register(&self, waker: &Waker) {
        let mut wakers = self.wakers.lock();
        if !wakers.iter().any(|w| w.will_wake(waker)) {
            wakers.push(waker.clone());
        }
    }
}

#[derive(Default)]
pub struct InterruptGroup {
    conns: Mutex<HashMap<u64, Weak<ConnHandle>>>,
    next_id: AtomicU64,
}

impl InterruptGroup {
    pub fn new() -> Self {
        InterruptGroup::default()
    }

    fn register(&self, external: bool) -> Arc<ConnHandle> {
        let handle = Arc::new(ConnHandle::new(external));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut conns = self.conns.lock();
        conns.retain(|_, weak| weak.strong_count() > 0);
        conns.insert(id, Arc::downgrade(&handle));
        handle
    }

    /// Wrap a stream and register it for later interruption.
    pub fn new_stream(&self, inner: Box<dyn ProxyStream>, external: bool) -> InterruptStream {
        InterruptStream {
            inner,
            handle: self.register(external),
        }
    }

    /// Wrap a datagram socket and register it for later interruption.
    pub fn new_datagram(
        &self,
        inner: Box<dyn OutboundDatagram>,
        external: bool,
    ) -> InterruptDatagram {
        InterruptDatagram {
            inner,
            handle: self.register(external),
        }
    }

    /// Close registered sockets. With `external_only`, sockets serving
    /// routing-internal flows are spared.
    pub fn interrupt(&self, external_only: bool) {
        let mut conns = self.conns.lock();
        conns.retain(|_, weak| match weak.upgrade() {
            Some(handle) => {
                if !external_only || handle.external {
                    handle.interrupt();
                    false
                } else {
                    true
                }
            }
            None => false,
        });
    }

    pub fn live_count(&self) -> usize {
        self.conns
            .lock()
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

fn interrupted_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, "connection interrupted")
}

/// A stream that fails all pending and future I/O once its group interrupts.
pub struct InterruptStream {
    inner: Box<dyn ProxyStream>,
    handle: Arc<ConnHandle>,
}

impl InterruptStream {
    fn check(&self, cx: &mut Context<'_>) -> Option<io::Error> {
        if self.handle.is_interrupted() {
            return Some(interrupted_error());
        }
        self.handle.register(cx.waker());
        None
    }
}

impl AsyncRead for InterruptStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(err) = self.check(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for InterruptStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if let Some(err) = self.check(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if let Some(err) = self.check(cx) {
            return Poll::Ready(Err(err));
        }
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

impl ProxyStream for InterruptStream {
    fn needs_handshake(&self) -> bool {
        self.inner.needs_handshake()
    }

    fn lazy_headroom(&self) -> bool {
        self.inner.lazy_headroom()
    }
}

/// Datagram wrapper failing all I/O once its group interrupts.
pub struct InterruptDatagram {
    inner: Box<dyn OutboundDatagram>,
    handle: Arc<ConnHandle>,
}

#[async_trait]
impl OutboundDatagram for InterruptDatagram {
    async fn send_to(&self, buf: &[u8], destination: &Destination) -> Result<usize> {
        if self.handle.is_interrupted() {
            return Err(interrupted_error().into());
        }
        self.inner.send_to(buf, destination).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, Destination)> {
        let notified = self.handle.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.handle.is_interrupted() {
            return Err(interrupted_error().into());
        }
        tokio::select! {
            result = self.inner.recv_from(buf) => result,
            _ = notified => Err(interrupted_error().into()),
        }
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_interrupt_fails_io() {
        let group = InterruptGroup::new();
        let (client, mut server) = tokio::io::duplex(64);
        let mut stream = group.new_stream(Box::new(client), true);
        assert_eq!(group.live_count(), 1);

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        group.interrupt(false);
        let err = stream.write_all(b"pong").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(group.live_count(), 0);
    }

    #[tokio::test]
    async fn test_external_only_spares_internal() {
        let group = InterruptGroup::new();
        let (client_a, _keep_a) = tokio::io::duplex(8);
        let (client_b, _keep_b) = tokio::io::duplex(8);
        let mut external = group.new_stream(Box::new(client_a), true);
        let mut internal = group.new_stream(Box::new(client_b), false);

        group.interrupt(true);
        assert!(external.write_all(b"x").await.is_err());
        assert!(internal.write_all(b"x").await.is_ok());
    }

    #[tokio::test]
    async fn test_interrupt_wakes_blocked_reader() {
        let group = std::sync::Arc::new(InterruptGroup::new());
        let (client, _server) = tokio::io::duplex(8);
        let mut stream = group.new_stream(Box::new(client), true);

        let g = group.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            g.interrupt(false);
        });

        let mut buf = [0u8; 1];
        let err = tokio::time::timeout(std::time::Duration::from_secs(1), stream.read(&mut buf))
            .await
            .expect("interrupt must wake the reader")
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
