use std::sync::Arc;

use clap::Parser;
use log::{debug, error, info, warn};
use tokio::select;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

use tunin::device::tun::{DiscardStack, TunFactory};
use tunin::device::DeviceManager;
use tunin::metadata::{ConnContext, PacketAdapter};
use tunin::resolver::UdpResolver;
use tunin::settings::SettingsFile;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(long)]
    config: String,
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let args = Args::parse();

    let settings = match SettingsFile::load(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Unable to load {}: {}", args.config, e);
            std::process::exit(1);
        }
    };

    info!("Using config: {:?}", settings);

    let (tcp_tx, mut tcp_rx) = mpsc::channel::<ConnContext>(settings.channel_capacity);
    let (udp_tx, mut udp_rx) = mpsc::channel::<PacketAdapter>(settings.channel_capacity);

    let factory = Arc::new(TunFactory::new(Arc::new(DiscardStack)));
    let resolver = Arc::new(UdpResolver::new(settings.dns_upstream));
    let manager = DeviceManager::new(factory, resolver, tcp_tx, udp_tx);

    manager.recreate(settings.tun.clone()).await;

    let mut reload = match signal(SignalKind::hangup()) {
        Ok(reload) => Some(reload),
        Err(e) => {
            warn!("Config reload on SIGHUP unavailable: {}", e);
            None
        }
    };

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        select! {
            _ = &mut shutdown => {
                info!("Shutting down");
                break;
            }

            Some(_) = async { reload.as_mut()?.recv().await } => {
                match SettingsFile::load(&args.config) {
                    Ok(settings) => {
                        manager.recreate(settings.tun).await;
                        info!("Reloaded, tun enabled: {}", manager.config().await.enable);
                    }
                    Err(e) => error!("Reload of {} failed: {}", args.config, e),
                }
            }

            // No router is attached, flows are logged and dropped
            Some(ctx) = tcp_rx.recv() => {
                info!("[{}] {}", ctx.id(), ctx.metadata());
            }

            Some(adapter) = udp_rx.recv() => {
                debug!("{} ({} bytes)", adapter.metadata(), adapter.packet().data().len());
                adapter.release();
            }
        }
    }

    manager.close().await;
}
