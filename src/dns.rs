use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::serialize::binary::BinEncodable;
use log::debug;
use tokio::time::{timeout, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::addr::{unmap, Socksaddr};
use crate::conn::{BoxConn, PacketConn};
use crate::error::{should_ignore_packet_error, DispatchError, DnsError};
use crate::listener::{InboundHandler, ListenerHandler};
use crate::metadata::InboundMetadata;
use crate::packet::PacketCloser;

pub const DEFAULT_DNS_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest DNS-over-TCP message accepted on a hijacked stream.
pub const TCP_DNS_BUFFER_SIZE: usize = 65535;

// room for an EDNS answer of the common 1232 byte size
const UDP_DNS_BUFFER_SIZE: usize = 2 * 1024;

/// The resolution service DNS queries are relayed to.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn serve_msg(&self, request: &Message) -> Result<Message, DnsError>;
}

/// Copies the reply bits of `request` onto `response`.
fn set_reply(response: &mut Message, request: &Message, code: ResponseCode) {
    response
        .set_id(request.id())
        .set_message_type(MessageType::Response)
        .set_op_code(request.op_code())
        .set_recursion_desired(request.recursion_desired())
        .set_checking_disabled(request.checking_disabled())
        .set_response_code(code);
    response.take_queries();
    response.add_queries(request.queries().iter().cloned());
}

async fn relay_msg(resolver: &dyn Resolver, request: &Message) -> Result<Vec<u8>, DnsError> {
    let mut response = resolver.serve_msg(request).await?;
    let code = response.response_code();
    set_reply(&mut response, request, code);
    // names are compressed by the default encoder
    Ok(response.to_vec()?)
}

/// Decodes `payload`, resolves it and encodes the answer with the
/// transaction id of the query.
pub async fn relay_dns_packet(resolver: &dyn Resolver, payload: &[u8]) -> Result<Vec<u8>, DnsError> {
    let request = Message::from_vec(payload)?;
    relay_msg(resolver, &request).await
}

/// Encoded SERVFAIL answer to `request`.
pub fn server_failure(request: &Message) -> Result<Vec<u8>, DnsError> {
    let mut response = Message::new();
    set_reply(&mut response, request, ResponseCode::ServFail);
    Ok(response.to_vec()?)
}

/// Dispatcher that answers DNS to the hijack targets locally and passes
/// everything else on.
#[derive(Clone)]
pub struct DnsListenerHandler {
    handler: ListenerHandler,
    dns_adds: Vec<SocketAddr>,
    resolver: Arc<dyn Resolver>,
    tcp_buffer_size: usize,
}

impl DnsListenerHandler {
    pub fn new(handler: ListenerHandler, dns_adds: Vec<SocketAddr>, resolver: Arc<dyn Resolver>) -> Self {
        DnsListenerHandler {
            handler,
            dns_adds,
            resolver,
            tcp_buffer_size: TCP_DNS_BUFFER_SIZE,
        }
    }

    pub fn with_tcp_buffer_size(mut self, size: usize) -> Self {
        self.tcp_buffer_size = size;
        self
    }

    pub fn should_hijack_dns(&self, target: &Socksaddr) -> bool {
        // locally originated queries the system stack redirects to loopback
        if let Some(ip) = target.ip() {
            if unmap(ip).is_loopback() && target.port == 53 {
                return true;
            }
        }

        self.dns_adds.iter().any(|hijack| {
            target.socket_addr() == Some(*hijack)
                || (hijack.ip().is_unspecified() && target.port == 53)
        })
    }

    async fn hijack_tcp(&self, conn: BoxConn) -> Result<(), DispatchError> {
        let codec = LengthDelimitedCodec::builder()
            .length_field_length(2)
            .max_frame_length(self.tcp_buffer_size)
            .new_codec();
        let mut framed = Framed::new(conn, codec);

        loop {
            let frame = match timeout(DEFAULT_DNS_READ_TIMEOUT, framed.next()).await {
                Ok(Some(Ok(frame))) => frame,
                // idle timeout, peer close or a bad frame ends the stream
                _ => break,
            };

            let request = Message::from_vec(&frame).map_err(DnsError::from)?;
            let msg = match relay_msg(&*self.resolver, &request).await {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("[DNS] resolve {} failed: {}", request.id(), e);
                    server_failure(&request)?
                }
            };
            framed.send(Bytes::from(msg)).await?;
        }

        let _ = framed.close().await;
        Ok(())
    }

    async fn hijack_udp(
        &self,
        conn: Arc<dyn PacketConn>,
        closer: &Arc<PacketCloser>,
    ) -> Result<(), DispatchError> {
        loop {
            let mut buf = vec![0u8; UDP_DNS_BUFFER_SIZE];

            let _ = conn.set_read_deadline(Some(Instant::now() + DEFAULT_DNS_READ_TIMEOUT));
            let (n, destination) = match conn.read_packet(&mut buf).await {
                Ok(read) => read,
                Err(e) => {
                    if should_ignore_packet_error(&e) {
                        return Ok(());
                    }
                    return Err(e.into());
                }
            };
            buf.truncate(n);

            let resolver = self.resolver.clone();
            let closer = closer.clone();
            tokio::spawn(async move {
                let msg = match relay_dns_packet(&*resolver, &buf).await {
                    Ok(msg) => msg,
                    Err(e) => {
                        debug!("[DNS] drop udp query: {}", e);
                        return;
                    }
                };
                if let Err(e) = closer.write_back(&msg, Some(&destination)).await {
                    debug!("[DNS] write back to {}: {}", destination, e);
                }
            });
        }
    }
}

#[async_trait]
impl InboundHandler for DnsListenerHandler {
    async fn new_connection(
        &self,
        conn: BoxConn,
        metadata: InboundMetadata,
    ) -> Result<(), DispatchError> {
        if self.should_hijack_dns(&metadata.destination) {
            debug!("[DNS] hijack tcp:{}", metadata.destination);
            return self.hijack_tcp(conn).await;
        }
        self.handler.new_connection(conn, metadata).await
    }

    async fn new_packet_connection(
        &self,
        conn: Arc<dyn PacketConn>,
        metadata: InboundMetadata,
    ) -> Result<(), DispatchError> {
        if self.should_hijack_dns(&metadata.destination) {
            debug!(
                "[DNS] hijack udp:{} from {}",
                metadata.destination, metadata.source
            );
            let conn = crate::conn::with_packet_read_deadline(conn);
            let closer = Arc::new(PacketCloser::new(conn.clone()));
            let result = self.hijack_udp(conn, &closer).await;
            closer.close().await;
            return result;
        }
        self.handler.new_packet_connection(conn, metadata).await
    }

    fn new_error(&self, err: &DispatchError) {
        log::warn!("[DNS] TUN hijack get error: {}", err);
    }
}
