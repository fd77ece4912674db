//! Stream upgrades negotiated inside the preamble.
//!
//! A client asks for an upgrade by protocol name (for example
//! `application/ssl-tls`). Once the server answers with `UpgradeResponse`,
//! both sides wrap the raw stream and framing continues over the wrapped
//! one. Bytes already buffered past the response are replayed into the
//! wrapper first.

use std::io;

use async_trait::async_trait;

use crate::connection::ConnectionStream;

/// A stream handed to, and returned from, an upgrade provider.
pub type UpgradeStream = Box<dyn ConnectionStream>;

/// Client half of a stream upgrade.
#[async_trait]
pub trait StreamUpgradeInitiator: Send + Sync {
    /// Protocol name written in the `UpgradeRequest` record.
    fn protocol(&self) -> &str;

    /// Wrap `stream` after the server accepted the upgrade.
    async fn initiate_upgrade(&self, stream: UpgradeStream) -> io::Result<UpgradeStream>;
}

/// Server half of a stream upgrade.
#[async_trait]
pub trait StreamUpgradeAcceptor: Send + Sync {
    /// Returns true if this acceptor can perform `protocol`.
    fn supports(&self, protocol: &str) -> bool;

    /// Wrap `stream` after `UpgradeResponse` has been written.
    async fn accept_upgrade(&self, stream: UpgradeStream) -> io::Result<UpgradeStream>;
}
