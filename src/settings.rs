use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::addr::split_host_port;
use crate::error::ConfigError;

pub const DEFAULT_MTU: u32 = 9000;

#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunStack {
    #[default]
    Gvisor,
    System,
    Mixed,
}

impl fmt::Display for TunStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunStack::Gvisor => f.write_str("gVisor"),
            TunStack::System => f.write_str("System"),
            TunStack::Mixed => f.write_str("Mixed"),
        }
    }
}

/// Virtual interface configuration.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct TunConfig {
    pub enable: bool,
    pub device: String,
    pub stack: TunStack,
    pub dns_hijack: Vec<String>,
    pub auto_route: bool,
    pub auto_detect_interface: bool,

    pub mtu: u32,
    pub inet4_address: Vec<Ipv4Net>,
    pub inet6_address: Vec<Ipv6Net>,
    pub strict_route: bool,
    pub inet4_route_address: Vec<Ipv4Net>,
    pub inet6_route_address: Vec<Ipv6Net>,
    pub include_uid: Vec<u32>,
    pub include_uid_range: Vec<String>,
    pub exclude_uid: Vec<u32>,
    pub exclude_uid_range: Vec<String>,
    pub include_android_user: Vec<i32>,
    pub include_package: Vec<String>,
    pub exclude_package: Vec<String>,
    pub endpoint_independent_nat: bool,
    /// Seconds, zero or negative for the default.
    pub udp_timeout: i64,
    pub file_descriptor: i32,
}

impl Default for TunConfig {
    fn default() -> Self {
        TunConfig {
            enable: false,
            device: String::new(),
            stack: TunStack::Gvisor,
            // hijack every query to port 53
            dns_hijack: vec!["0.0.0.0:53".to_string()],
            auto_route: true,
            auto_detect_interface: true,
            mtu: DEFAULT_MTU,
            inet4_address: Ipv4Net::new(Ipv4Addr::new(198, 18, 0, 1), 30).into_iter().collect(),
            inet6_address: Vec::new(),
            strict_route: false,
            inet4_route_address: Vec::new(),
            inet6_route_address: Vec::new(),
            include_uid: Vec::new(),
            include_uid_range: Vec::new(),
            exclude_uid: Vec::new(),
            exclude_uid_range: Vec::new(),
            include_android_user: Vec::new(),
            include_package: Vec::new(),
            exclude_package: Vec::new(),
            endpoint_independent_nat: false,
            udp_timeout: 0,
            file_descriptor: 0,
        }
    }
}

impl TunConfig {
    pub fn udp_timeout(&self) -> Option<Duration> {
        if self.udp_timeout > 0 {
            Some(Duration::from_secs(self.udp_timeout as u64))
        } else {
            None
        }
    }

    pub fn dns_hijack_targets(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        parse_dns_hijack(&self.dns_hijack)
    }
}

/// Parses hijack targets such as `8.8.8.8:53`, `udp://[::1]:53` or `any:53`.
pub fn parse_dns_hijack(targets: &[String]) -> Result<Vec<SocketAddr>, ConfigError> {
    targets.iter().map(|t| parse_hijack_target(t)).collect()
}

fn parse_hijack_target(raw: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = || ConfigError::DnsHijack(raw.to_string());

    let target = raw
        .strip_prefix("udp://")
        .or_else(|| raw.strip_prefix("tcp://"))
        .unwrap_or(raw);

    let (host, port) = split_host_port(target).map_err(|_| invalid())?;
    let ip = if host == "any" {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        host.parse::<IpAddr>().map_err(|_| invalid())?
    };
    let port = port.parse::<u16>().map_err(|_| invalid())?;

    Ok(SocketAddr::new(ip, port))
}

/// Partial update of a `TunConfig`. `enable` is always taken, everything
/// else only when present.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
pub struct TunPatch {
    #[serde(default)]
    pub enable: bool,
    pub device: Option<String>,
    pub stack: Option<TunStack>,
    pub dns_hijack: Option<Vec<String>>,
    pub auto_route: Option<bool>,
    pub auto_detect_interface: Option<bool>,
    pub mtu: Option<u32>,
    pub inet6_address: Option<Vec<Ipv6Net>>,
    pub strict_route: Option<bool>,
    pub inet4_route_address: Option<Vec<Ipv4Net>>,
    pub inet6_route_address: Option<Vec<Ipv6Net>>,
    pub include_uid: Option<Vec<u32>>,
    pub include_uid_range: Option<Vec<String>>,
    pub exclude_uid: Option<Vec<u32>>,
    pub exclude_uid_range: Option<Vec<String>>,
    pub include_android_user: Option<Vec<i32>>,
    pub include_package: Option<Vec<String>>,
    pub exclude_package: Option<Vec<String>>,
    pub endpoint_independent_nat: Option<bool>,
    pub udp_timeout: Option<i64>,
    pub file_descriptor: Option<i32>,
}

macro_rules! patch_fields {
    ($patch:ident, $conf:ident, $($field:ident),+ $(,)?) => {
        $(
            if let Some(value) = $patch.$field {
                $conf.$field = value;
            }
        )+
    };
}

impl TunPatch {
    pub fn apply(self, mut conf: TunConfig) -> TunConfig {
        conf.enable = self.enable;
        let patch = self;
        patch_fields!(
            patch,
            conf,
            device,
            stack,
            dns_hijack,
            auto_route,
            auto_detect_interface,
            mtu,
            inet6_address,
            strict_route,
            inet4_route_address,
            inet6_route_address,
            include_uid,
            include_uid_range,
            exclude_uid,
            exclude_uid_range,
            include_android_user,
            include_package,
            exclude_package,
            endpoint_independent_nat,
            udp_timeout,
            file_descriptor,
        );
        conf
    }
}

fn default_dns_upstream() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53)
}

fn default_channel_capacity() -> usize {
    200
}

#[derive(Deserialize, Debug, Clone)]
pub struct SettingsFile {
    #[serde(default)]
    pub tun: TunConfig,
    #[serde(default = "default_dns_upstream")]
    pub dns_upstream: SocketAddr,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl SettingsFile {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
