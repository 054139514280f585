use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::addr::Socksaddr;
use crate::conn::BoxConn;
use crate::packet::UdpPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Udp => f.write_str("udp"),
        }
    }
}

/// Capture mechanism a flow came in through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    Tun,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub network: Network,
    pub source_type: SourceType,
    pub src_ip: Option<IpAddr>,
    pub src_port: u16,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    pub origin_dst: Option<SocketAddr>,
}

impl Metadata {
    pub fn new(network: Network) -> Self {
        Metadata {
            network,
            source_type: SourceType::Tun,
            src_ip: None,
            src_port: 0,
            dst_ip: None,
            dst_port: 0,
            origin_dst: None,
        }
    }
}

fn fmt_endpoint(f: &mut fmt::Formatter<'_>, ip: Option<IpAddr>, port: u16) -> fmt::Result {
    match ip {
        Some(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, port),
        Some(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, port),
        None => write!(f, "?:{}", port),
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ", self.network)?;
        fmt_endpoint(f, self.src_ip, self.src_port)?;
        f.write_str(" -> ")?;
        fmt_endpoint(f, self.dst_ip, self.dst_port)
    }
}

/// Addresses reported by the capture layer for a new flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMetadata {
    pub source: Socksaddr,
    pub destination: Socksaddr,
}

/// Strips everything but the addresses before handing a flow to a sub-protocol.
pub fn upstream_metadata(metadata: &InboundMetadata) -> InboundMetadata {
    InboundMetadata {
        source: metadata.source.clone(),
        destination: metadata.destination.clone(),
    }
}

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// TCP flow handed to the router.
pub struct ConnContext {
    id: u64,
    metadata: Metadata,
    conn: BoxConn,
}

impl ConnContext {
    pub fn new(conn: BoxConn, metadata: Metadata) -> Self {
        ConnContext {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            metadata,
            conn,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn into_parts(self) -> (Metadata, BoxConn) {
        (self.metadata, self.conn)
    }
}

/// UDP datagram handed to the router.
pub struct PacketAdapter {
    packet: UdpPacket,
    metadata: Metadata,
}

impl PacketAdapter {
    pub fn new(packet: UdpPacket, metadata: Metadata) -> Self {
        PacketAdapter { packet, metadata }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn packet(&self) -> &UdpPacket {
        &self.packet
    }

    pub fn into_parts(self) -> (Metadata, UdpPacket) {
        (self.metadata, self.packet)
    }

    pub fn release(self) {
        self.packet.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn display_marks_unknown_addresses() {
        let mut metadata = Metadata::new(Network::Udp);
        metadata.dst_ip = Some(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        metadata.dst_port = 53;
        assert_eq!(metadata.to_string(), "udp ?:0 -> 1.1.1.1:53");
        assert_eq!(metadata.source_type, SourceType::Tun);
    }
}
