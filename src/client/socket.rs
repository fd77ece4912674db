//! TCP options applied to client sockets before they connect.

use std::{io, time::Duration};

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpSocket;

/// Socket options for [`ClientBuilder`](super::ClientBuilder).
///
/// Unset options keep the operating system default.
///
/// ```
/// use std::time::Duration;
///
/// use corewcf::client::SocketOptions;
///
/// let options = SocketOptions::default()
///     .nodelay(true)
///     .keepalive(Some(Duration::from_secs(30)));
/// assert_ne!(options, SocketOptions::default());
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketOptions {
    nodelay: Option<bool>,
    keepalive: Option<Option<Duration>>,
    linger: Option<Option<Duration>>,
    send_buffer_size: Option<u32>,
    recv_buffer_size: Option<u32>,
    reuseaddr: Option<bool>,
}

impl SocketOptions {
    /// Set `TCP_NODELAY`.
    #[must_use]
    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = Some(enabled);
        self
    }

    /// Enable keepalive probes after `idle`, or disable them with `None`.
    #[must_use]
    pub fn keepalive(mut self, idle: Option<Duration>) -> Self {
        self.keepalive = Some(idle);
        self
    }

    /// Linger on close for `duration`, or not at all with `None`.
    #[must_use]
    pub fn linger(mut self, duration: Option<Duration>) -> Self {
        self.linger = Some(duration);
        self
    }

    /// Set `SO_SNDBUF`.
    #[must_use]
    pub fn send_buffer_size(mut self, size: u32) -> Self {
        self.send_buffer_size = Some(size);
        self
    }

    /// Set `SO_RCVBUF`.
    #[must_use]
    pub fn recv_buffer_size(mut self, size: u32) -> Self {
        self.recv_buffer_size = Some(size);
        self
    }

    /// Set `SO_REUSEADDR`.
    #[must_use]
    pub fn reuseaddr(mut self, enabled: bool) -> Self {
        self.reuseaddr = Some(enabled);
        self
    }

    pub(crate) fn apply(&self, socket: &TcpSocket) -> io::Result<()> {
        if let Some(enabled) = self.nodelay {
            socket.set_nodelay(enabled)?;
        }
        match self.keepalive {
            Some(Some(idle)) => {
                socket.set_keepalive(true)?;
                SockRef::from(socket).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
            }
            Some(None) => socket.set_keepalive(false)?,
            None => {}
        }
        if let Some(linger) = self.linger {
            socket.set_linger(linger)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(enabled) = self.reuseaddr {
            socket.set_reuseaddr(enabled)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_reach_the_socket() {
        let socket = TcpSocket::new_v4().expect("socket");
        SocketOptions::default()
            .nodelay(true)
            .keepalive(Some(Duration::from_secs(30)))
            .reuseaddr(true)
            .apply(&socket)
            .expect("apply");
        assert!(socket.nodelay().expect("nodelay"));
        assert!(socket.keepalive().expect("keepalive"));
        assert!(socket.reuseaddr().expect("reuseaddr"));
    }

    #[test]
    fn unset_options_leave_the_socket_alone() {
        let socket = TcpSocket::new_v4().expect("socket");
        let before = socket.nodelay().expect("nodelay");
        SocketOptions::default().apply(&socket).expect("apply");
        assert_eq!(socket.nodelay().expect("nodelay"), before);
    }
}
