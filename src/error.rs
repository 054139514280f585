use std::io;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddrError {
    #[error("missing port in address {0}")]
    MissingPort(String),
    #[error("missing ']' in address {0}")]
    MissingBracket(String),
    #[error("too many colons in address {0}")]
    TooManyColons(String),
    #[error("host is not an ip literal: {0}")]
    InvalidHost(String),
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid address: {0}")]
    Address(#[from] AddrError),
    #[error("not special fqdn")]
    NotSpecialFqdn,
    #[error("no multiplexer registered for {0}")]
    MuxUnavailable(&'static str),
    #[error("read UoT request: {0}")]
    UotRequest(io::Error),
    #[error("router channel closed")]
    ChannelClosed,
    #[error("dns hijack: {0}")]
    Dns(#[from] DnsError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum DnsError {
    #[error("malformed dns message: {0}")]
    Decode(#[from] hickory_proto::error::ProtoError),
    #[error("resolve failed: {0}")]
    Resolve(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Error, Debug, Clone)]
pub enum WriteBackError {
    #[error("address is invalid")]
    InvalidAddress,
    #[error("writeBack to closed connection")]
    Closed,
    #[error("write packet: {0}")]
    Io(#[source] Arc<io::Error>),
}

impl WriteBackError {
    /// Kind of the socket error behind a failed write, if any.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            WriteBackError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid dns hijack target {0:?}")]
    DnsHijack(String),
    #[error("read settings: {0}")]
    Read(#[from] io::Error),
    #[error("parse settings: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("create tun device: {0}")]
    Create(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors that end a flow normally: timeouts, closes and cancellations.
pub fn should_ignore_packet_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn benign_kinds() {
        for kind in [io::ErrorKind::TimedOut, io::ErrorKind::UnexpectedEof, io::ErrorKind::NotConnected] {
            assert!(should_ignore_packet_error(&io::Error::from(kind)));
        }
        assert!(!should_ignore_packet_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!should_ignore_packet_error(&io::Error::new(io::ErrorKind::Other, "boom")));
    }
}
