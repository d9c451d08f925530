//! Lazy dial handle for TCP Fast Open.
//!
//! The socket is not connected at construction: the first write triggers the
//! connect carrying that payload, reads park until the connection exists,
//! and a failed connect is latched so every later operation reports it.

use crate::outbound::ProxyStream;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

pub type ConnectFuture = Pin<Box<dyn Future<Output = io::Result<TcpStream>> + Send>>;
type ConnectFn = Box<dyn FnOnce(Vec<u8>) -> ConnectFuture + Send>;

enum State {
    /// Connect not started; holds the deferred connect function.
    Idle(Option<ConnectFn>),
    /// Connect in flight, first payload already captured.
    Connecting { future: ConnectFuture, len: usize },
    Ready(TcpStream),
    /// Latched failure, reported to every subsequent read and write.
    Failed(io::ErrorKind, String),
}

pub struct LazyConnect {
    state: State,
    read_wakers: Vec<Waker>,
}

impl LazyConnect {
    /// `connect` receives the first write's payload and must resolve to a
    /// connected stream that has already sent it.
    pub fn new<F>(connect: F) -> Self
    where
        F: FnOnce(Vec<u8>) -> ConnectFuture + Send + 'static,
    {
        LazyConnect {
            state: State::Idle(Some(Box::new(connect))),
            read_wakers: Vec::new(),
        }
    }

    fn latched(kind: io::ErrorKind, message: &str) -> io::Error {
        io::Error::new(kind, message.to_string())
    }

    fn wake_readers(&mut self) {
        for waker in self.read_wakers.drain(..) {
            waker.wake();
        }
    }

    fn poll_connect(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let State::Connecting { future, len } = &mut self.state else {
            unreachable!("poll_connect outside Connecting");
        };
        let len = *len;
        match future.as_mut().poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(stream)) => {
                self.state = State::Ready(stream);
                self.wake_readers();
                Poll::Ready(Ok(len))
            }
            Poll::Ready(Err(err)) => {
                self.state = State::Failed(err.kind(), err.to_string());
                self.wake_readers();
                Poll::Ready(Err(err))
            }
        }
    }
}

impl AsyncWrite for LazyConnect {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match &mut this.state {
            State::Idle(connect) => {
                let connect = connect.take().expect("connect function consumed");
                this.state = State::Connecting {
                    future: connect(buf.to_vec()),
                    len: buf.len(),
                };
                this.poll_connect(cx)
            }
            State::Connecting { .. } => this.poll_connect(cx),
            State::Ready(stream) => Pin::new(stream).poll_write(cx, buf),
            State::Failed(kind, message) => {
                Poll::Ready(Err(Self::latched(*kind, message)))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.state {
            State::Ready(stream) => Pin::new(stream).poll_flush(cx),
            State::Failed(kind, message) => Poll::Ready(Err(Self::latched(*kind, message))),
            _ => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.state {
            State::Ready(stream) => Pin::new(stream).poll_shutdown(cx),
            _ => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncRead for LazyConnect {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        match &mut this.state {
            State::Ready(stream) => Pin::new(stream).poll_read(cx, buf),
            State::Failed(kind, message) => Poll::Ready(Err(Self::latched(*kind, message))),
            _ => {
                // Block until the first write creates the connection.
                let waker = cx.waker();
                if !this.read_wakers.iter().any(|w| w.will_wake(waker)) {
                    this.read_wakers.push(waker.clone());
                }
                Poll::Pending
            }
        }
    }
}

impl ProxyStream for LazyConnect {
    fn needs_handshake(&self) -> bool {
        !matches!(self.state, State::Ready(_))
    }

    fn lazy_headroom(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_first_write_connects_and_carries_payload() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");
            conn.write_all(b"world").await.unwrap();
        });

        let mut stream = LazyConnect::new(move |payload| {
            Box::pin(async move {
                let mut stream = TcpStream::connect(addr).await?;
                stream.write_all(&payload).await?;
                Ok(stream)
            }) as ConnectFuture
        });
        assert!(stream.needs_handshake());
        assert!(stream.lazy_headroom());

        stream.write_all(b"hello").await.unwrap();
        assert!(!stream.needs_handshake());

        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_is_latched() {
        let mut stream = LazyConnect::new(move |_payload| {
            Box::pin(async move {
                Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
            }) as ConnectFuture
        });

        let first = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(first.kind(), io::ErrorKind::ConnectionRefused);

        // Subsequent writes and reads return the latched error.
        let second = stream.write_all(b"x").await.unwrap_err();
        assert_eq!(second.kind(), io::ErrorKind::ConnectionRefused);
        let mut buf = [0u8; 1];
        let read_err = stream.read(&mut buf).await.unwrap_err();
        assert_eq!(read_err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_read_blocks_until_write_creates_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(b"r").await.unwrap();
        });

        let stream = LazyConnect::new(move |payload| {
            Box::pin(async move {
                let mut stream = TcpStream::connect(addr).await?;
                stream.write_all(&payload).await?;
                Ok(stream)
            }) as ConnectFuture
        });

        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            read_half.read_exact(&mut buf).await.unwrap();
            buf[0]
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        write_half.write_all(b"w").await.unwrap();
        let byte = tokio::time::timeout(std::time::Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(byte, b'r');
    }
}
