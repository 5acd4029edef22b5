//! The datagram transport seam.
//!
//! The client consumes one pre-established, bidirectional datagram flow to
//! the TURN server and nothing more: no DNS, no socket construction, no
//! reconnection. [`Conn`] abstracts that flow with poll-based send/recv so
//! any runtime object carrying whole datagrams can back a client.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};

use tokio::io::ReadBuf;

/// A connected datagram transport to the TURN server.
///
/// One send call transmits one datagram; one recv call yields one whole
/// datagram. Implementations must be usable from concurrent tasks through
/// `&self`.
pub trait Conn: Send + Sync + 'static {
    /// Send a single datagram, or register for wakeup when sending may
    /// succeed.
    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>>;

    /// Receive a single datagram into `buf`, or register for wakeup.
    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>>;

    /// The local address of the transport.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Conn for tokio::net::UdpSocket {
    fn poll_send(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        tokio::net::UdpSocket::poll_send(self, cx, data)
    }

    fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        tokio::net::UdpSocket::poll_recv(self, cx, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        tokio::net::UdpSocket::local_addr(self)
    }
}

pub(crate) async fn send(conn: &dyn Conn, data: &[u8]) -> io::Result<usize> {
    poll_fn(|cx| conn.poll_send(cx, data)).await
}

pub(crate) async fn recv(conn: &dyn Conn, buf: &mut [u8]) -> io::Result<usize> {
    poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(buf);
        match conn.poll_recv(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(read_buf.filled().len())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    })
    .await
}

#[cfg(test)]
pub(crate) use pipe::{pipe, Pipe};

#[cfg(test)]
mod pipe {
    //! In-memory, boundary-preserving datagram pipe for tests.

    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    pub(crate) struct Pipe {
        tx: mpsc::UnboundedSender<Vec<u8>>,
        rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    }

    /// Two connected in-memory transports, one per end.
    pub(crate) fn pipe() -> (Pipe, Pipe) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Pipe {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Pipe {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }

    impl Pipe {
        pub(crate) async fn send(&self, data: &[u8]) -> io::Result<usize> {
            super::send(self, data).await
        }

        pub(crate) async fn recv(&self) -> io::Result<Vec<u8>> {
            poll_fn(|cx| self.rx.lock().unwrap().poll_recv(cx))
                .await
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "pipe closed"))
        }
    }

    impl Conn for Pipe {
        fn poll_send(&self, _cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
            match self.tx.send(data.to_vec()) {
                Ok(()) => Poll::Ready(Ok(data.len())),
                Err(_) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "pipe closed",
                ))),
            }
        }

        fn poll_recv(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
            match self.rx.lock().unwrap().poll_recv(cx) {
                Poll::Ready(Some(datagram)) => {
                    let n = datagram.len().min(buf.remaining());
                    buf.put_slice(&datagram[..n]);
                    Poll::Ready(Ok(()))
                }
                Poll::Ready(None) => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "pipe closed",
                ))),
                Poll::Pending => Poll::Pending,
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
        }
    }

    #[tokio::test]
    async fn preserves_datagram_boundaries() {
        let (a, b) = pipe();
        a.send(b"one").await.unwrap();
        a.send(b"two").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"one");
        assert_eq!(b.recv().await.unwrap(), b"two");
    }

    #[tokio::test]
    async fn recv_fails_after_peer_drop() {
        let (a, b) = pipe();
        drop(a);
        assert!(b.recv().await.is_err());
    }
}
