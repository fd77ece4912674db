//! Server transport: preamble acceptance, stream upgrades, listener
//! queues, and the shared socket manager.

mod listener;
mod manager;
mod preamble;
mod upgrade;

pub use listener::{ChannelListener, DEFAULT_CHANNEL_BACKLOG};
pub use manager::{Registration, TransportManager};
pub use preamble::{ListenerResolver, ServerPreambleReader};
pub use upgrade::{StreamUpgradeAcceptor, StreamUpgradeInitiator, UpgradeStream};
