use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinEncodable;
use log::trace;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

use crate::dns::Resolver;
use crate::error::DnsError;

const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Forwards every query to a single upstream server over UDP.
pub struct UdpResolver {
    server: SocketAddr,
    timeout: Duration,
}

impl UdpResolver {
    pub fn new(server: SocketAddr) -> Self {
        UdpResolver {
            server,
            timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Resolver for UdpResolver {
    async fn serve_msg(&self, request: &Message) -> Result<Message, DnsError> {
        let bind = match self.server.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind).await?;
        socket.connect(self.server).await?;
        socket.send(&request.to_vec()?).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = vec![0u8; 4096];
        loop {
            let n = timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| DnsError::Resolve(format!("{} timed out", self.server)))??;

            let response = Message::from_vec(&buf[..n])?;
            if response.id() == request.id() {
                return Ok(response);
            }
            trace!("[DNS] ignore answer {} from {}", response.id(), self.server);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{a_query, StaticResolver};

    async fn fake_upstream(stale_first: bool) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let answers = StaticResolver {
                fail: false,
                delay: Duration::ZERO,
            };
            let mut buf = [0u8; 512];
            let (n, peer) = socket.recv_from(&mut buf).await.unwrap();
            let request = Message::from_vec(&buf[..n]).unwrap();
            let mut response = answers.serve_msg(&request).await.unwrap();
            if stale_first {
                response.set_id(request.id().wrapping_add(1));
                socket.send_to(&response.to_vec().unwrap(), peer).await.unwrap();
            }
            response.set_id(request.id());
            socket.send_to(&response.to_vec().unwrap(), peer).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn answers_from_upstream() {
        let resolver = UdpResolver::new(fake_upstream(false).await);
        let response = resolver.serve_msg(&a_query(11, "example.com.")).await.unwrap();
        assert_eq!(response.id(), 11);
        assert_eq!(response.answers().len(), 1);
    }

    #[tokio::test]
    async fn mismatched_ids_are_skipped() {
        let resolver = UdpResolver::new(fake_upstream(true).await);
        let response = resolver.serve_msg(&a_query(12, "example.com.")).await.unwrap();
        assert_eq!(response.id(), 12);
    }

    #[tokio::test]
    async fn silent_upstream_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let resolver = UdpResolver::new(silent.local_addr().unwrap())
            .with_timeout(Duration::from_millis(50));

        let err = resolver.serve_msg(&a_query(13, "example.com.")).await.unwrap_err();
        assert!(matches!(err, DnsError::Resolve(_)));
    }
}
