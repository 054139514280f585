use std::sync::Arc;

use async_trait::async_trait;
use log::{error, info};
use tokio::sync::{mpsc, Mutex};

use crate::dns::{DnsListenerHandler, Resolver};
use crate::error::DeviceError;
use crate::listener::{InboundHandler, ListenerHandler, MuxServices};
use crate::metadata::{ConnContext, PacketAdapter};
use crate::settings::TunConfig;

pub mod fd;
pub mod tun;

/// A running virtual interface.
#[async_trait]
pub trait TunDevice: Send + Sync {
    fn config(&self) -> &TunConfig;

    fn address(&self) -> String;

    /// Rebinds to the current default interface without rebuilding the device.
    fn flush_default_interface(&self);

    async fn close(&self);
}

#[async_trait]
pub trait DeviceFactory: Send + Sync {
    async fn create(
        &self,
        conf: &TunConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Box<dyn TunDevice>, DeviceError>;
}

fn sorted<T: Ord + Clone>(list: &[T]) -> Vec<T> {
    let mut list = list.to_vec();
    list.sort();
    list
}

fn sorted_strings<T: ToString>(list: &[T]) -> Vec<String> {
    let mut list: Vec<String> = list.iter().map(|item| item.to_string()).collect();
    list.sort();
    list
}

fn list_changed<T: Ord + Clone>(old: &[T], new: &[T]) -> bool {
    old.len() != new.len() || sorted(old) != sorted(new)
}

fn prefixes_changed<T: ToString>(old: &[T], new: &[T]) -> bool {
    old.len() != new.len() || sorted_strings(old) != sorted_strings(new)
}

/// Whether moving from `old` to `new` needs the device torn down and built
/// again. List fields are compared as sets of values, ignoring order.
pub fn should_recreate(old: &TunConfig, new: &TunConfig) -> bool {
    if old.enable != new.enable
        || old.device != new.device
        || old.stack != new.stack
        || old.auto_route != new.auto_route
        || old.auto_detect_interface != new.auto_detect_interface
        || old.mtu != new.mtu
        || old.strict_route != new.strict_route
        || old.endpoint_independent_nat != new.endpoint_independent_nat
        || old.udp_timeout != new.udp_timeout
        || old.file_descriptor != new.file_descriptor
    {
        return true;
    }

    list_changed(&old.dns_hijack, &new.dns_hijack)
        || prefixes_changed(&old.inet4_address, &new.inet4_address)
        || prefixes_changed(&old.inet6_address, &new.inet6_address)
        || prefixes_changed(&old.inet4_route_address, &new.inet4_route_address)
        || prefixes_changed(&old.inet6_route_address, &new.inet6_route_address)
        || list_changed(&old.include_uid, &new.include_uid)
        || list_changed(&old.include_uid_range, &new.include_uid_range)
        || list_changed(&old.exclude_uid, &new.exclude_uid)
        || list_changed(&old.exclude_uid_range, &new.exclude_uid_range)
        || list_changed(&old.include_android_user, &new.include_android_user)
        || list_changed(&old.include_package, &new.include_package)
        || list_changed(&old.exclude_package, &new.exclude_package)
}

struct DeviceState {
    device: Option<Box<dyn TunDevice>>,
    last: Option<TunConfig>,
}

/// Owns the current device and its configuration. Reloads are serialized.
pub struct DeviceManager {
    factory: Arc<dyn DeviceFactory>,
    resolver: Arc<dyn Resolver>,
    tcp_in: mpsc::Sender<ConnContext>,
    udp_in: mpsc::Sender<PacketAdapter>,
    mux: MuxServices,
    state: Mutex<DeviceState>,
}

impl DeviceManager {
    pub fn new(
        factory: Arc<dyn DeviceFactory>,
        resolver: Arc<dyn Resolver>,
        tcp_in: mpsc::Sender<ConnContext>,
        udp_in: mpsc::Sender<PacketAdapter>,
    ) -> Self {
        DeviceManager {
            factory,
            resolver,
            tcp_in,
            udp_in,
            mux: MuxServices::default(),
            state: Mutex::new(DeviceState {
                device: None,
                last: None,
            }),
        }
    }

    pub fn with_mux(mut self, mux: MuxServices) -> Self {
        self.mux = mux;
        self
    }

    /// Applies `conf`. Creation failures are logged, and the configuration is
    /// then remembered as disabled so the next reload tries again.
    pub async fn recreate(&self, mut conf: TunConfig) {
        let mut state = self.state.lock().await;

        if let Err(e) = self.apply(&mut state, &conf).await {
            error!("Start TUN listening error: {}", e);
            conf.enable = false;
        }

        state.last = Some(conf);
    }

    async fn apply(&self, state: &mut DeviceState, conf: &TunConfig) -> Result<(), DeviceError> {
        let changed = match &state.last {
            Some(last) => should_recreate(last, conf),
            None => true,
        };

        if !changed {
            if let Some(device) = &state.device {
                device.flush_default_interface();
            }
            return Ok(());
        }

        if let Some(device) = state.device.take() {
            device.close().await;
        }

        if !conf.enable {
            return Ok(());
        }

        let handler = self.build_handler(conf)?;
        let device = self.factory.create(conf, handler).await?;
        info!("[TUN] Tun adapter listening at: {}", device.address());
        state.device = Some(device);

        Ok(())
    }

    fn build_handler(&self, conf: &TunConfig) -> Result<Arc<dyn InboundHandler>, DeviceError> {
        let dns_adds = conf.dns_hijack_targets()?;

        let mut handler = ListenerHandler::new(self.tcp_in.clone(), self.udp_in.clone())
            .with_mux(self.mux.clone());
        if let Some(udp_timeout) = conf.udp_timeout() {
            handler = handler.with_udp_timeout(udp_timeout);
        }

        Ok(Arc::new(DnsListenerHandler::new(
            handler,
            dns_adds,
            self.resolver.clone(),
        )))
    }

    /// Configuration of the live device, else the last one applied.
    pub async fn config(&self) -> TunConfig {
        let state = self.state.lock().await;
        match (&state.device, &state.last) {
            (Some(device), _) => device.config().clone(),
            (None, Some(last)) => last.clone(),
            (None, None) => TunConfig::default(),
        }
    }

    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if let Some(device) = state.device.take() {
            device.close().await;
        }
    }
}
