//! Real and in-memory listeners for integration tests.

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};

pub use corewcf::test_helpers::{MemoryDialer, MemoryListener};
use rstest::fixture;

/// Error type for fallible integration tests.
pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A TCP listener bound to a free localhost port.
///
/// # Errors
///
/// Returns any IO error encountered while binding.
///
/// ```rust,no_run
/// use corewcf_testing::{TestResult, unused_listener};
///
/// fn example() -> TestResult {
///     let listener = unused_listener()?;
///     assert!(listener.local_addr()?.port() > 0);
///     Ok(())
/// }
/// ```
pub fn unused_listener() -> std::io::Result<StdTcpListener> {
    let listener = StdTcpListener::bind(SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// A [`MemoryListener`] on the default `net.tcp` port and its dialer.
#[fixture]
pub fn memory_listener() -> (std::sync::Arc<MemoryListener>, MemoryDialer) {
    MemoryListener::new(corewcf::dispatcher::DEFAULT_NET_TCP_PORT)
}
