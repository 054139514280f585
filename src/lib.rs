pub mod addr;
pub mod conn;
pub mod device;
pub mod dns;
pub mod error;
pub mod listener;
pub mod metadata;
pub mod packet;
pub mod resolver;
pub mod settings;
pub mod uot;

#[cfg(test)]
mod testutil;

pub use addr::{normalize, Socksaddr};
pub use device::{should_recreate, DeviceManager};
pub use dns::DnsListenerHandler;
pub use listener::{InboundHandler, ListenerHandler};
pub use metadata::{ConnContext, Metadata, PacketAdapter};
pub use packet::PacketCloser;
pub use settings::{SettingsFile, TunConfig};
