use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use etherparse::{InternetSlice, SlicedPacket, TransportSlice};
use log::{debug, info, trace, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::select;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tun::TunBuilder;
use tokio_util::sync::CancellationToken;

use crate::device::fd::FdTun;
use crate::device::{DeviceFactory, TunDevice};
use crate::error::DeviceError;
use crate::listener::InboundHandler;
use crate::settings::TunConfig;

const PACKET_QUEUE: usize = 1024;

/// Userspace TCP/IP stack. Raw IP packets read from the interface arrive on
/// `ingress`, packets for the interface are sent on `egress`, and every
/// flow the stack terminates goes to `handler`.
#[async_trait]
pub trait NetworkStack: Send + Sync {
    async fn run(
        &self,
        ingress: mpsc::Receiver<BytesMut>,
        egress: mpsc::Sender<Bytes>,
        handler: Arc<dyn InboundHandler>,
        cancel: CancellationToken,
    );
}

pub fn describe_packet(packet: &[u8]) -> Option<String> {
    let sliced = SlicedPacket::from_ip(packet).ok()?;

    let (src, dst) = match sliced.ip {
        Some(InternetSlice::Ipv4(header, ..)) => (
            header.source_addr().to_string(),
            header.destination_addr().to_string(),
        ),
        Some(InternetSlice::Ipv6(header, ..)) => (
            header.source_addr().to_string(),
            header.destination_addr().to_string(),
        ),
        None => return None,
    };

    Some(match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => format!(
            "tcp {}:{} -> {}:{}",
            src,
            tcp.source_port(),
            dst,
            tcp.destination_port()
        ),
        Some(TransportSlice::Udp(udp)) => format!(
            "udp {}:{} -> {}:{}",
            src,
            udp.source_port(),
            dst,
            udp.destination_port()
        ),
        _ => format!("ip {} -> {}", src, dst),
    })
}

/// Stack that only traces what it sees and drops it.
pub struct DiscardStack;

#[async_trait]
impl NetworkStack for DiscardStack {
    async fn run(
        &self,
        mut ingress: mpsc::Receiver<BytesMut>,
        _egress: mpsc::Sender<Bytes>,
        _handler: Arc<dyn InboundHandler>,
        cancel: CancellationToken,
    ) {
        loop {
            select! {
                _ = cancel.cancelled() => break,
                packet = ingress.recv() => match packet {
                    Some(packet) => {
                        if let Some(summary) = describe_packet(&packet) {
                            trace!("[TUN] drop {}", summary);
                        }
                    }
                    None => break,
                }
            }
        }
    }
}

/// Moves packets between the interface and the stack until cancelled.
/// Frames that are not IP packets never reach the stack.
async fn pump<D>(
    device: D,
    frame_size: usize,
    ingress: mpsc::Sender<BytesMut>,
    mut egress: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) where
    D: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(device);
    let mut buf = BytesMut::with_capacity(frame_size);

    loop {
        buf.reserve(frame_size);

        select! {
            _ = cancel.cancelled() => break,

            read = reader.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("[TUN] read: {}", e);
                        break;
                    }
                }

                let packet = buf.split();
                if SlicedPacket::from_ip(&packet).is_err() {
                    trace!("[TUN] drop non-ip frame of {} bytes", packet.len());
                    continue;
                }
                if ingress.try_send(packet).is_err() {
                    trace!("[TUN] stack is behind, drop packet");
                }
            }

            packet = egress.recv() => {
                let packet = match packet {
                    Some(packet) => packet,
                    None => break,
                };
                if let Err(e) = writer.write_all(&packet).await {
                    warn!("[TUN] write: {}", e);
                    break;
                }
            }
        }
    }

    debug!("[TUN] packet pump stopped");
}

pub struct KernelTun {
    conf: TunConfig,
    name: String,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl TunDevice for KernelTun {
    fn config(&self) -> &TunConfig {
        &self.conf
    }

    fn address(&self) -> String {
        self.name.clone()
    }

    fn flush_default_interface(&self) {
        // the kernel device is not bound to an outbound interface
        debug!("[TUN] {} keeps its routes", self.name);
    }

    async fn close(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("[TUN] task of {} ended abnormally: {}", self.name, e);
            }
        }
        info!("[TUN] {} closed", self.name);
    }
}

/// Creates Linux TUN interfaces, or adopts the one passed in
/// `file-descriptor`, and drives them with `stack`.
pub struct TunFactory {
    stack: Arc<dyn NetworkStack>,
}

impl TunFactory {
    pub fn new(stack: Arc<dyn NetworkStack>) -> Self {
        TunFactory { stack }
    }

    fn start<D>(
        &self,
        conf: &TunConfig,
        name: String,
        device: D,
        handler: Arc<dyn InboundHandler>,
    ) -> Box<dyn TunDevice>
    where
        D: AsyncRead + AsyncWrite + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let (ingress_tx, ingress_rx) = mpsc::channel(PACKET_QUEUE);
        let (egress_tx, egress_rx) = mpsc::channel(PACKET_QUEUE);

        let pump_task = tokio::spawn(pump(
            device,
            conf.mtu as usize,
            ingress_tx,
            egress_rx,
            cancel.clone(),
        ));

        let stack = self.stack.clone();
        let stack_cancel = cancel.clone();
        let stack_task = tokio::spawn(async move {
            stack.run(ingress_rx, egress_tx, handler, stack_cancel).await
        });

        Box::new(KernelTun {
            conf: conf.clone(),
            name,
            cancel,
            tasks: Mutex::new(vec![pump_task, stack_task]),
        })
    }
}

#[async_trait]
impl DeviceFactory for TunFactory {
    async fn create(
        &self,
        conf: &TunConfig,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Box<dyn TunDevice>, DeviceError> {
        if conf.file_descriptor != 0 {
            // the descriptor is owned by the device from here on
            let device = FdTun::from_raw_fd(conf.file_descriptor).map_err(|e| {
                DeviceError::Create(format!("file descriptor {}: {}", conf.file_descriptor, e))
            })?;
            let name = format!("fd{}", conf.file_descriptor);
            info!(
                "[TUN] using {} mtu: {} stack: {}",
                name, conf.mtu, conf.stack
            );
            return Ok(self.start(conf, name, device, handler));
        }

        let address = conf
            .inet4_address
            .first()
            .ok_or_else(|| DeviceError::Create("no inet4 address".to_string()))?;
        let mtu = i32::try_from(conf.mtu)
            .map_err(|_| DeviceError::Create(format!("mtu {} out of range", conf.mtu)))?;

        let tun = TunBuilder::new()
            .name(&conf.device)
            .tap(false)
            .packet_info(false)
            .mtu(mtu)
            .up()
            .address(address.addr())
            .netmask(address.netmask())
            .try_build()
            .map_err(|e| DeviceError::Create(e.to_string()))?;

        let name = tun.name().to_string();
        info!(
            "[TUN] created {} address: {} mtu: {} stack: {}",
            name, address, conf.mtu, conf.stack
        );
        if conf.auto_route {
            debug!("[TUN] routes for {} are left to the system", name);
        }

        Ok(self.start(conf, name, tun, handler))
    }
}
