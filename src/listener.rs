use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::addr::{normalize, Socksaddr};
use crate::conn::{with_packet_read_deadline, with_read_deadline, BoxConn, PacketConn};
use crate::error::{should_ignore_packet_error, DispatchError};
use crate::metadata::{upstream_metadata, ConnContext, InboundMetadata, Metadata, Network, PacketAdapter};
use crate::packet::{PacketCloser, UdpPacket};
use crate::uot;

pub const UDP_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Sentinel destination of sing-mux sessions.
pub const SING_MUX_DESTINATION: &str = "sp.mux.sing-box.arpa";
/// Sentinel destination of VMess mux (mux.cool) sessions.
pub const VMESS_MUX_DESTINATION: &str = "v1.mux.cool";

const UDP_BUFFER_SIZE: usize = 65535;

/// Entry point of the capture layer. Multiplexers and UoT re-enter it for
/// every flow they unwrap.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn new_connection(
        &self,
        conn: BoxConn,
        metadata: InboundMetadata,
    ) -> Result<(), DispatchError>;

    async fn new_packet_connection(
        &self,
        conn: Arc<dyn PacketConn>,
        metadata: InboundMetadata,
    ) -> Result<(), DispatchError>;

    fn new_error(&self, err: &DispatchError) {
        warn!("TUN listener get error: {}", err);
    }
}

/// Runs one captured TCP flow on its own task. Failures go to `new_error`.
pub fn spawn_connection(
    handler: Arc<dyn InboundHandler>,
    conn: BoxConn,
    metadata: InboundMetadata,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = handler.new_connection(conn, metadata).await {
            handler.new_error(&e);
        }
    })
}

/// Runs one captured packet connection on its own task. Failures go to `new_error`.
pub fn spawn_packet_connection(
    handler: Arc<dyn InboundHandler>,
    conn: Arc<dyn PacketConn>,
    metadata: InboundMetadata,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = handler.new_packet_connection(conn, metadata).await {
            handler.new_error(&e);
        }
    })
}

/// A multiplexing protocol server. Every sub-stream it demultiplexes is
/// passed back to `handler`.
#[async_trait]
pub trait MuxService: Send + Sync {
    async fn handle_connection(
        &self,
        conn: BoxConn,
        metadata: InboundMetadata,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), DispatchError>;
}

#[derive(Clone, Default)]
pub struct MuxServices {
    pub sing_mux: Option<Arc<dyn MuxService>>,
    pub vmess_mux: Option<Arc<dyn MuxService>>,
}

/// Turns captured flows into router input.
#[derive(Clone)]
pub struct ListenerHandler {
    tcp_in: mpsc::Sender<ConnContext>,
    udp_in: mpsc::Sender<PacketAdapter>,
    udp_timeout: Duration,
    mux: MuxServices,
}

impl ListenerHandler {
    pub fn new(tcp_in: mpsc::Sender<ConnContext>, udp_in: mpsc::Sender<PacketAdapter>) -> Self {
        ListenerHandler {
            tcp_in,
            udp_in,
            udp_timeout: UDP_TIMEOUT,
            mux: MuxServices::default(),
        }
    }

    pub fn with_udp_timeout(mut self, udp_timeout: Duration) -> Self {
        if !udp_timeout.is_zero() {
            self.udp_timeout = udp_timeout;
        }
        self
    }

    pub fn with_mux(mut self, mux: MuxServices) -> Self {
        self.mux = mux;
        self
    }

    pub fn udp_timeout(&self) -> Duration {
        self.udp_timeout
    }

    pub fn is_special_fqdn(fqdn: Option<&str>) -> bool {
        matches!(
            fqdn,
            Some(SING_MUX_DESTINATION)
                | Some(VMESS_MUX_DESTINATION)
                | Some(uot::MAGIC_ADDRESS)
                | Some(uot::LEGACY_MAGIC_ADDRESS)
        )
    }

    pub async fn parse_special_fqdn(
        &self,
        mut conn: BoxConn,
        mut metadata: InboundMetadata,
    ) -> Result<(), DispatchError> {
        let fqdn = metadata.destination.fqdn().map(str::to_owned);
        match fqdn.as_deref() {
            Some(SING_MUX_DESTINATION) => {
                let mux = self
                    .mux
                    .sing_mux
                    .clone()
                    .ok_or(DispatchError::MuxUnavailable(SING_MUX_DESTINATION))?;
                mux.handle_connection(conn, upstream_metadata(&metadata), Arc::new(self.clone()))
                    .await
            }
            Some(VMESS_MUX_DESTINATION) => {
                let mux = self
                    .mux
                    .vmess_mux
                    .clone()
                    .ok_or(DispatchError::MuxUnavailable(VMESS_MUX_DESTINATION))?;
                mux.handle_connection(conn, upstream_metadata(&metadata), Arc::new(self.clone()))
                    .await
            }
            Some(uot::MAGIC_ADDRESS) => {
                let request = uot::read_request(&mut conn)
                    .await
                    .map_err(DispatchError::UotRequest)?;
                debug!("[TUN] UoT request to {}", request.destination);
                metadata.destination = request.destination.clone();
                self.new_packet_connection(Arc::new(uot::UotPacketConn::new(conn, request)), metadata)
                    .await
            }
            Some(uot::LEGACY_MAGIC_ADDRESS) => {
                metadata.destination = Socksaddr::unspecified();
                self.new_packet_connection(
                    Arc::new(uot::UotPacketConn::new(conn, uot::Request::default())),
                    metadata,
                )
                .await
            }
            _ => Err(DispatchError::NotSpecialFqdn),
        }
    }

    fn build_metadata(
        network: Network,
        source: &Socksaddr,
        destination: &Socksaddr,
    ) -> Result<Metadata, DispatchError> {
        let mut metadata = Metadata::new(network);
        (metadata.dst_ip, metadata.dst_port) = normalize(Some(destination))?;
        (metadata.src_ip, metadata.src_port) = normalize(Some(source))?;
        Ok(metadata)
    }

    async fn packet_loop(
        &self,
        conn: &Arc<dyn PacketConn>,
        closer: &Arc<PacketCloser>,
        metadata: &InboundMetadata,
    ) -> Result<(), DispatchError> {
        let mut scratch = vec![0u8; UDP_BUFFER_SIZE];

        loop {
            // a deadline past the clock's range means none at all
            let _ = conn.set_read_deadline(Instant::now().checked_add(self.udp_timeout));
            let (n, destination) = match conn.read_packet(&mut scratch).await {
                Ok(read) => read,
                Err(e) => {
                    if should_ignore_packet_error(&e) {
                        return Ok(());
                    }
                    return Err(e.into());
                }
            };

            // the datagram travels to the router in a buffer sized to fit it
            let buf = BytesMut::from(&scratch[..n]);

            let cmetadata = Self::build_metadata(Network::Udp, &metadata.source, &destination)?;
            let packet = UdpPacket::new(
                closer.clone(),
                metadata.source.clone(),
                conn.local_addr(),
                buf,
            );

            match self.udp_in.try_send(PacketAdapter::new(packet, cmetadata)) {
                Ok(()) => {}
                // drop the newest datagram when the router is behind
                Err(TrySendError::Full(adapter)) => adapter.release(),
                Err(TrySendError::Closed(_)) => return Err(DispatchError::ChannelClosed),
            }
        }
    }
}

#[async_trait]
impl InboundHandler for ListenerHandler {
    async fn new_connection(
        &self,
        conn: BoxConn,
        metadata: InboundMetadata,
    ) -> Result<(), DispatchError> {
        if Self::is_special_fqdn(metadata.destination.fqdn()) {
            return self.parse_special_fqdn(conn, metadata).await;
        }

        let conn = with_read_deadline(conn);

        let mut cmetadata =
            Self::build_metadata(Network::Tcp, &metadata.source, &metadata.destination)?;
        cmetadata.origin_dst = conn.local_addr();

        self.tcp_in
            .send(ConnContext::new(conn, cmetadata))
            .await
            .map_err(|_| DispatchError::ChannelClosed)
    }

    async fn new_packet_connection(
        &self,
        conn: Arc<dyn PacketConn>,
        metadata: InboundMetadata,
    ) -> Result<(), DispatchError> {
        let conn = with_packet_read_deadline(conn);
        let closer = Arc::new(PacketCloser::new(conn.clone()));

        let result = self.packet_loop(&conn, &closer, &metadata).await;

        closer.close().await;
        result
    }
}
