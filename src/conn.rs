use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep_until, timeout_at, Instant, Sleep};

use crate::addr::Socksaddr;

/// Byte stream accepted by the capture layer for one TCP flow.
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// True when `set_read_deadline` is not honored natively and the
    /// connection has to be wrapped in a `DeadlineConn`.
    fn needs_additional_read_deadline(&self) -> bool {
        true
    }

    fn set_read_deadline(&mut self, _deadline: Option<Instant>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "read deadline not supported",
        ))
    }
}

pub type BoxConn = Box<dyn Conn>;

impl Conn for Box<dyn Conn> {
    fn local_addr(&self) -> Option<SocketAddr> {
        (**self).local_addr()
    }

    fn needs_additional_read_deadline(&self) -> bool {
        (**self).needs_additional_read_deadline()
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        (**self).set_read_deadline(deadline)
    }
}

impl Conn for TcpStream {
    fn local_addr(&self) -> Option<SocketAddr> {
        TcpStream::local_addr(self).ok()
    }
}

impl Conn for DuplexStream {}

/// Datagram endpoint accepted by the capture layer for one UDP flow.
///
/// Reads happen on a single loop; writes may come from many tasks at once.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Reads one datagram into `buf`, returning its length and destination.
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<(usize, Socksaddr)>;

    /// Sends one datagram whose source, seen by the peer, is `destination`.
    async fn write_packet(&self, buf: &[u8], destination: &Socksaddr) -> io::Result<()>;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn needs_additional_read_deadline(&self) -> bool {
        true
    }

    fn set_read_deadline(&self, _deadline: Option<Instant>) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "read deadline not supported",
        ))
    }

    async fn close(&self) -> io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PacketConn for UdpSocket {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<(usize, Socksaddr)> {
        let (len, from) = self.recv_from(buf).await?;
        Ok((len, Socksaddr::from(from)))
    }

    async fn write_packet(&self, buf: &[u8], destination: &Socksaddr) -> io::Result<()> {
        let target = destination.socket_addr().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot send to unresolved {}", destination),
            )
        })?;
        self.send_to(buf, target).await?;
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        UdpSocket::local_addr(self).ok()
    }
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "read deadline exceeded")
}

/// Adds read deadlines to a stream that ignores them.
pub struct DeadlineConn<C> {
    inner: C,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<C: Conn> DeadlineConn<C> {
    pub fn new(inner: C) -> Self {
        DeadlineConn {
            inner,
            deadline: None,
        }
    }
}

impl<C: Conn> AsyncRead for DeadlineConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(deadline) = this.deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(deadline_exceeded()));
            }
        }

        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<C: Conn> AsyncWrite for DeadlineConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<C: Conn> Conn for DeadlineConn<C> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn needs_additional_read_deadline(&self) -> bool {
        false
    }

    fn set_read_deadline(&mut self, deadline: Option<Instant>) -> io::Result<()> {
        self.deadline = deadline.map(|deadline| Box::pin(sleep_until(deadline)));
        Ok(())
    }
}

/// Adds read deadlines to a packet connection that ignores them.
pub struct DeadlinePacketConn {
    inner: Arc<dyn PacketConn>,
    deadline: Mutex<Option<Instant>>,
}

impl DeadlinePacketConn {
    pub fn new(inner: Arc<dyn PacketConn>) -> Self {
        DeadlinePacketConn {
            inner,
            deadline: Mutex::new(None),
        }
    }

    fn current_deadline(&self) -> Option<Instant> {
        match self.deadline.lock() {
            Ok(deadline) => *deadline,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl PacketConn for DeadlinePacketConn {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<(usize, Socksaddr)> {
        match self.current_deadline() {
            Some(deadline) => timeout_at(deadline, self.inner.read_packet(buf))
                .await
                .map_err(|_| deadline_exceeded())?,
            None => self.inner.read_packet(buf).await,
        }
    }

    async fn write_packet(&self, buf: &[u8], destination: &Socksaddr) -> io::Result<()> {
        self.inner.write_packet(buf, destination).await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn needs_additional_read_deadline(&self) -> bool {
        false
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        match self.deadline.lock() {
            Ok(mut current) => *current = deadline,
            Err(poisoned) => *poisoned.into_inner() = deadline,
        }
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        self.inner.close().await
    }
}

/// Wraps `conn` when it cannot honor read deadlines on its own.
pub fn with_read_deadline(conn: BoxConn) -> BoxConn {
    if conn.needs_additional_read_deadline() {
        Box::new(DeadlineConn::new(conn))
    } else {
        conn
    }
}

pub fn with_packet_read_deadline(conn: Arc<dyn PacketConn>) -> Arc<dyn PacketConn> {
    if conn.needs_additional_read_deadline() {
        Arc::new(DeadlinePacketConn::new(conn))
    } else {
        conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MemoryPacketConn;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn stream_deadline_expires() {
        let (client, _server) = duplex(64);
        let mut conn = with_read_deadline(Box::new(client));
        assert!(!conn.needs_additional_read_deadline());

        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)))
            .unwrap();

        let mut buf = [0u8; 8];
        let err = conn.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn stream_reads_before_deadline() {
        let (client, mut server) = duplex(64);
        let mut conn = with_read_deadline(Box::new(client));
        conn.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)))
            .unwrap();

        server.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // clearing the deadline keeps the stream usable
        conn.set_read_deadline(None).unwrap();
        server.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn packet_deadline_expires() {
        let (inner, _tx) = MemoryPacketConn::new(true);
        let conn = with_packet_read_deadline(inner);
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(20)))
            .unwrap();

        let mut buf = [0u8; 16];
        let err = conn.read_packet(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn native_deadline_is_not_wrapped() {
        let (inner, _tx) = MemoryPacketConn::new(false);
        let as_dyn: Arc<dyn PacketConn> = inner.clone();
        let conn = with_packet_read_deadline(as_dyn.clone());
        assert_eq!(
            Arc::as_ptr(&conn) as *const (),
            Arc::as_ptr(&as_dyn) as *const ()
        );
    }
}
