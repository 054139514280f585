use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::sync::Mutex;

use crate::addr::Socksaddr;
use crate::conn::PacketConn;
use crate::error::WriteBackError;

struct CloserState {
    conn: Arc<dyn PacketConn>,
    closed: bool,
}

/// Reply path of one inbound packet connection.
///
/// Shared by every packet read from that connection. Writes and the close
/// transition go through the same lock, so once `close` returns no write can
/// reach the socket.
pub struct PacketCloser {
    state: Mutex<CloserState>,
}

impl PacketCloser {
    pub fn new(conn: Arc<dyn PacketConn>) -> Self {
        PacketCloser {
            state: Mutex::new(CloserState {
                conn,
                closed: false,
            }),
        }
    }

    pub async fn write_back(
        &self,
        data: &[u8],
        destination: Option<&Socksaddr>,
    ) -> Result<usize, WriteBackError> {
        let destination = destination.ok_or(WriteBackError::InvalidAddress)?;

        let state = self.state.lock().await;
        if state.closed {
            return Err(WriteBackError::Closed);
        }

        let buffer = BytesMut::from(data);
        let result = state.conn.write_packet(&buffer, destination).await;
        drop(buffer);

        match result {
            Ok(()) => Ok(data.len()),
            Err(e) => Err(WriteBackError::Io(Arc::new(e))),
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }

    /// Marks the closer closed and closes the socket. Later calls are no-ops.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        if let Err(e) = state.conn.close().await {
            log::debug!("close packet connection: {}", e);
        }
    }
}

/// One inbound datagram with its writeback handle.
pub struct UdpPacket {
    writer: Arc<PacketCloser>,
    source: Socksaddr,
    in_addr: Option<SocketAddr>,
    buf: BytesMut,
}

impl UdpPacket {
    pub fn new(
        writer: Arc<PacketCloser>,
        source: Socksaddr,
        in_addr: Option<SocketAddr>,
        buf: BytesMut,
    ) -> Self {
        UdpPacket {
            writer,
            source,
            in_addr,
            buf,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Sends a reply whose source, as seen by the client, is `addr`.
    pub async fn write_back(
        &self,
        data: &[u8],
        addr: Option<&Socksaddr>,
    ) -> Result<usize, WriteBackError> {
        self.writer.write_back(data, addr).await
    }

    /// Client address of the datagram.
    pub fn local_addr(&self) -> &Socksaddr {
        &self.source
    }

    /// Address of the inbound socket that received the datagram.
    pub fn in_addr(&self) -> Option<SocketAddr> {
        self.in_addr
    }

    pub fn release(self) {
        drop(self.buf)
    }

    /// Takes the payload buffer out of the packet.
    pub fn into_buffer(self) -> BytesMut {
        self.buf
    }
}
