//! UDP over TCP, as spoken by sing-box clients.
//!
//! The current magic address starts with a request header naming the real
//! destination; the legacy one has no header. In both, every datagram is
//! framed as `[address] length(u16 BE) payload`, the address being omitted in
//! connect mode.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{split, AsyncRead, AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

use crate::addr::{Host, Socksaddr};
use crate::conn::{BoxConn, PacketConn};

pub const MAGIC_ADDRESS: &str = "sp.v2.udp-over-tcp.arpa";
pub const LEGACY_MAGIC_ADDRESS: &str = "sp.udp-over-tcp.arpa";

/// Address family bytes used by one of the two address encodings.
pub struct AddrSerializer {
    ipv4: u8,
    ipv6: u8,
    fqdn: u8,
}

/// SOCKS5 style, used by the request header.
pub const SOCKS_ADDR: AddrSerializer = AddrSerializer {
    ipv4: 0x01,
    ipv6: 0x04,
    fqdn: 0x03,
};

/// Per-datagram address encoding.
pub const PACKET_ADDR: AddrSerializer = AddrSerializer {
    ipv4: 0x00,
    ipv6: 0x01,
    fqdn: 0x02,
};

impl AddrSerializer {
    pub async fn read<R: AsyncRead + Unpin>(&self, reader: &mut R) -> io::Result<Socksaddr> {
        let family = reader.read_u8().await?;

        let host = if family == self.ipv4 {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            Host::Ip(IpAddr::V4(Ipv4Addr::from(octets)))
        } else if family == self.ipv6 {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            Host::Ip(IpAddr::V6(Ipv6Addr::from(octets)))
        } else if family == self.fqdn {
            let len = reader.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            Host::Fqdn(name)
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unknown address family {:#04x}", family),
            ));
        };

        let port = reader.read_u16().await?;
        Ok(Socksaddr { host, port })
    }

    pub fn write(&self, addr: &Socksaddr, buf: &mut BytesMut) -> io::Result<()> {
        match &addr.host {
            Host::Ip(IpAddr::V4(ip)) => {
                buf.put_u8(self.ipv4);
                buf.put_slice(&ip.octets());
            }
            Host::Ip(IpAddr::V6(ip)) => {
                buf.put_u8(self.ipv6);
                buf.put_slice(&ip.octets());
            }
            Host::Fqdn(name) => {
                let len = u8::try_from(name.len()).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "domain name too long")
                })?;
                buf.put_u8(self.fqdn);
                buf.put_u8(len);
                buf.put_slice(name.as_bytes());
            }
        }
        buf.put_u16(addr.port);
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub is_connect: bool,
    pub destination: Socksaddr,
}

impl Default for Request {
    fn default() -> Self {
        Request {
            is_connect: false,
            destination: Socksaddr::unspecified(),
        }
    }
}

pub async fn read_request<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Request> {
    let is_connect = reader.read_u8().await? != 0;
    let destination = SOCKS_ADDR.read(reader).await?;
    Ok(Request {
        is_connect,
        destination,
    })
}

pub fn encode_request(request: &Request) -> io::Result<BytesMut> {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_u8(request.is_connect as u8);
    SOCKS_ADDR.write(&request.destination, &mut buf)?;
    Ok(buf)
}

/// Presents a UoT stream as a packet connection.
pub struct UotPacketConn {
    reader: Mutex<ReadHalf<BoxConn>>,
    writer: Mutex<WriteHalf<BoxConn>>,
    request: Request,
    local_addr: Option<SocketAddr>,
}

impl UotPacketConn {
    pub fn new(conn: BoxConn, request: Request) -> Self {
        let local_addr = conn.local_addr();
        let (reader, writer) = split(conn);
        UotPacketConn {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            request,
            local_addr,
        }
    }
}

#[async_trait]
impl PacketConn for UotPacketConn {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<(usize, Socksaddr)> {
        let mut reader = self.reader.lock().await;

        let destination = if self.request.is_connect {
            self.request.destination.clone()
        } else {
            PACKET_ADDR.read(&mut *reader).await?
        };

        let len = reader.read_u16().await? as usize;
        if len <= buf.len() {
            reader.read_exact(&mut buf[..len]).await?;
            return Ok((len, destination));
        }

        // datagram larger than the caller's buffer: consume it and truncate
        let mut payload = vec![0u8; len];
        reader.read_exact(&mut payload).await?;
        let n = buf.len();
        buf.copy_from_slice(&payload[..n]);
        Ok((n, destination))
    }

    async fn write_packet(&self, buf: &[u8], destination: &Socksaddr) -> io::Result<()> {
        let len = u16::try_from(buf.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "datagram too large"))?;

        let mut frame = BytesMut::with_capacity(buf.len() + 32);
        if !self.request.is_connect {
            PACKET_ADDR.write(destination, &mut frame)?;
        }
        frame.put_u16(len);
        frame.put_slice(buf);

        let mut writer = self.writer.lock().await;
        writer.write_all(&frame).await?;
        writer.flush().await
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    async fn close(&self) -> io::Result<()> {
        self.writer.lock().await.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn request_header() {
        let request = Request {
            is_connect: true,
            destination: Socksaddr::new(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 53),
        };
        let encoded = encode_request(&request).unwrap();
        assert_eq!(&encoded[..], &[1, 0x01, 1, 2, 3, 4, 0, 53]);
        assert_eq!(read_request(&mut &encoded[..]).await.unwrap(), request);

        let fqdn = Request {
            is_connect: false,
            destination: Socksaddr::from_fqdn("example.org", 443),
        };
        let encoded = encode_request(&fqdn).unwrap();
        assert_eq!(encoded[1], 0x03);
        assert_eq!(read_request(&mut &encoded[..]).await.unwrap(), fqdn);
    }

    #[tokio::test]
    async fn unknown_family_is_rejected() {
        let raw = [0u8, 0x09, 0, 0];
        let err = read_request(&mut &raw[..]).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn per_packet_addresses() {
        let (client, mut server) = duplex(1024);
        let conn = UotPacketConn::new(Box::new(client), Request::default());

        let target = Socksaddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5353);
        let mut frame = BytesMut::new();
        PACKET_ADDR.write(&target, &mut frame).unwrap();
        frame.put_u16(3);
        frame.put_slice(b"abc");
        server.write_all(&frame).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, destination) = conn.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(destination, target);

        conn.write_packet(b"reply", &target).await.unwrap();
        let mut expected = BytesMut::new();
        PACKET_ADDR.write(&target, &mut expected).unwrap();
        expected.put_u16(5);
        expected.put_slice(b"reply");
        let mut got = vec![0u8; expected.len()];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..], &expected[..]);
    }

    #[tokio::test]
    async fn connect_mode_has_no_addresses() {
        let (client, mut server) = duplex(1024);
        let target = Socksaddr::new(IpAddr::V4(Ipv4Addr::new(9, 9, 9, 9)), 53);
        let conn = UotPacketConn::new(
            Box::new(client),
            Request {
                is_connect: true,
                destination: target.clone(),
            },
        );

        server.write_all(&[0, 2, b'h', b'i']).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, destination) = conn.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hi");
        assert_eq!(destination, target);

        conn.write_packet(b"ok", &target).await.unwrap();
        let mut got = [0u8; 4];
        server.read_exact(&mut got).await.unwrap();
        assert_eq!(got, [0, 2, b'o', b'k']);
    }

    #[tokio::test]
    async fn oversized_datagram_is_truncated() {
        let (client, mut server) = duplex(1024);
        let conn = UotPacketConn::new(
            Box::new(client),
            Request {
                is_connect: true,
                destination: Socksaddr::unspecified(),
            },
        );

        server.write_all(&[0, 6]).await.unwrap();
        server.write_all(b"abcdef").await.unwrap();
        let mut buf = [0u8; 4];
        let (n, _) = conn.read_packet(&mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf, b"abcd");
    }

    #[tokio::test]
    async fn eof_ends_reads() {
        let (client, server) = duplex(64);
        let conn = UotPacketConn::new(Box::new(client), Request::default());
        drop(server);

        let mut buf = [0u8; 8];
        let err = conn.read_packet(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
