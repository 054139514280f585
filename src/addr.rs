use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use crate::error::AddrError;

/// An address handed over by the capture layer.
///
/// Every address can be rendered as `host:port`. Variants that know more
/// about themselves advertise it through the capability accessors, which
/// `normalize` prefers over string parsing.
pub trait NetAddr: fmt::Display + Send + Sync {
    fn as_underlying(&self) -> Option<&dyn HasUnderlyingAddress> {
        None
    }

    fn as_structured(&self) -> Option<&dyn HasStructuredAddrPort> {
        None
    }
}

/// Wrapper addresses (deadline shims, fallback connections) that carry the
/// address of the connection they wrap.
pub trait HasUnderlyingAddress {
    fn raw_addr(&self) -> Option<&dyn NetAddr>;
}

/// Addresses that can expose an (ip, port) view without going through a string.
pub trait HasStructuredAddrPort {
    /// `ip` is `None` when the address is an unresolved domain name.
    fn addr_port(&self) -> AddrPort;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrPort {
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl AddrPort {
    pub fn is_valid(&self) -> bool {
        self.ip.is_some()
    }
}

/// Host part of a `Socksaddr`: either a concrete IP or a domain name that has
/// not been resolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Host {
    Ip(IpAddr),
    Fqdn(String),
}

/// Destination/source address as reported by the capture layer and the
/// tunneling sub-protocols.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Socksaddr {
    pub host: Host,
    pub port: u16,
}

impl Socksaddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Socksaddr {
            host: Host::Ip(ip),
            port,
        }
    }

    pub fn from_fqdn(fqdn: impl Into<String>, port: u16) -> Self {
        Socksaddr {
            host: Host::Fqdn(fqdn.into()),
            port,
        }
    }

    pub fn unspecified() -> Self {
        Socksaddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    pub fn fqdn(&self) -> Option<&str> {
        match &self.host {
            Host::Fqdn(fqdn) => Some(fqdn.as_str()),
            Host::Ip(_) => None,
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self.host {
            Host::Ip(ip) => Some(ip),
            Host::Fqdn(_) => None,
        }
    }

    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.ip().map(|ip| SocketAddr::new(ip, self.port))
    }
}

impl From<SocketAddr> for Socksaddr {
    fn from(addr: SocketAddr) -> Self {
        Socksaddr::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for Socksaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "[{}]:{}", ip, self.port),
            Host::Ip(IpAddr::V4(ip)) => write!(f, "{}:{}", ip, self.port),
            Host::Fqdn(fqdn) => write!(f, "{}:{}", fqdn, self.port),
        }
    }
}

impl NetAddr for Socksaddr {
    fn as_structured(&self) -> Option<&dyn HasStructuredAddrPort> {
        Some(self)
    }
}

impl HasStructuredAddrPort for Socksaddr {
    fn addr_port(&self) -> AddrPort {
        AddrPort {
            ip: self.ip(),
            port: self.port,
        }
    }
}

impl NetAddr for SocketAddr {
    fn as_structured(&self) -> Option<&dyn HasStructuredAddrPort> {
        Some(self)
    }
}

impl HasStructuredAddrPort for SocketAddr {
    fn addr_port(&self) -> AddrPort {
        AddrPort {
            ip: Some(self.ip()),
            port: self.port(),
        }
    }
}

impl NetAddr for String {}

/// Address of a wrapped connection. Displays its own label but resolves to
/// the raw address of the connection underneath when one is known.
pub struct UnderlyingAddr {
    label: String,
    raw: Option<Arc<dyn NetAddr>>,
}

impl UnderlyingAddr {
    pub fn new(label: impl Into<String>, raw: Option<Arc<dyn NetAddr>>) -> Self {
        UnderlyingAddr {
            label: label.into(),
            raw,
        }
    }
}

impl fmt::Display for UnderlyingAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

impl NetAddr for UnderlyingAddr {
    fn as_underlying(&self) -> Option<&dyn HasUnderlyingAddress> {
        Some(self)
    }
}

impl HasUnderlyingAddress for UnderlyingAddr {
    fn raw_addr(&self) -> Option<&dyn NetAddr> {
        self.raw.as_deref()
    }
}

pub fn unmap(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Reduce any address to a canonical (ip, port) pair.
///
/// `None` means "unknown" and is not an error. On failure the caller must
/// leave the metadata field unset.
pub fn normalize(addr: Option<&dyn NetAddr>) -> Result<(Option<IpAddr>, u16), AddrError> {
    let addr = match addr {
        Some(addr) => addr,
        None => return Ok((None, 0)),
    };

    if let Some(raw) = addr.as_underlying().and_then(|u| u.raw_addr()) {
        if let Ok(normalized) = normalize(Some(raw)) {
            return Ok(normalized);
        }
    }

    if let Some(structured) = addr.as_structured() {
        let addr_port = structured.addr_port();
        if addr_port.port != 0 {
            // domain names come back without an ip and fall through to the string path
            if let Some(ip) = addr_port.ip {
                return Ok((Some(unmap(ip)), addr_port.port));
            }
        }
    }

    normalize_str(&addr.to_string())
}

/// String fallback of `normalize`: `host:port` where host must be an IP literal.
pub fn normalize_str(raw: &str) -> Result<(Option<IpAddr>, u16), AddrError> {
    let (host, port) = split_host_port(raw)?;

    // out of range or garbage ports are "unknown", not an error
    let port = port.parse::<u16>().unwrap_or(0);

    let ip = host
        .parse::<IpAddr>()
        .map_err(|_| AddrError::InvalidHost(host.to_string()))?;

    Ok((Some(unmap(ip)), port))
}

pub(crate) fn split_host_port(raw: &str) -> Result<(&str, &str), AddrError> {
    if let Some(rest) = raw.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| AddrError::MissingBracket(raw.to_string()))?;
        let host = &rest[..end];
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| AddrError::MissingPort(raw.to_string()))?;
        return Ok((host, port));
    }

    let colon = raw
        .rfind(':')
        .ok_or_else(|| AddrError::MissingPort(raw.to_string()))?;
    let host = &raw[..colon];
    if host.contains(':') {
        return Err(AddrError::TooManyColons(raw.to_string()));
    }

    Ok((host, &raw[colon + 1..]))
}
