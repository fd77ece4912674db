//! Transport and channel configuration.
//!
//! Settings are plain data with serde support so hosts can load them from
//! whatever configuration source they already use. Call
//! [`TransportSettings::normalized`] before use; the transport does so when a
//! listener or client is built.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::framing::DecoderLimits;

/// Default maximum length of a via URI in bytes.
pub const DEFAULT_MAX_VIA_SIZE: usize = 2048;
/// Default maximum length of an extensible content type in bytes.
pub const DEFAULT_MAX_CONTENT_TYPE_SIZE: usize = 256;
/// Default maximum size of a single envelope in bytes.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 65_536;
/// Default size of the per-connection read buffer in bytes.
pub const DEFAULT_CONNECTION_BUFFER_SIZE: usize = 8192;

/// Time budgets applied to channel operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Budget for opening a channel, including the preamble exchange.
    pub open: Duration,
    /// Budget for a graceful close.
    pub close: Duration,
    /// Budget for a single send.
    pub send: Duration,
    /// Budget for a single receive.
    pub receive: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            open: Duration::from_secs(60),
            close: Duration::from_secs(60),
            send: Duration::from_secs(60),
            receive: Duration::from_secs(600),
        }
    }
}

/// Quotas and limits governing a connection-oriented transport.
///
/// # Default Values
/// - `max_via_size`: 2048 bytes
/// - `max_content_type_size`: 256 bytes
/// - `max_buffer_size`: 65536 bytes
/// - `connection_buffer_size`: 8192 bytes
/// - `max_pending_connections`: 100
/// - `max_pending_accepts`: 10
/// - `channel_initialization_timeout`: 30 seconds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Largest via accepted in a preamble.
    pub max_via_size: usize,
    /// Largest extensible content type accepted in a preamble.
    pub max_content_type_size: usize,
    /// Largest envelope accepted or sent on a session.
    pub max_buffer_size: usize,
    /// Size of each read issued against a connection.
    pub connection_buffer_size: usize,
    /// Accepted connections plus outstanding accepts allowed at once.
    pub max_pending_connections: usize,
    /// Outstanding accepts allowed at once.
    pub max_pending_accepts: usize,
    /// Budget for a new connection to complete its preamble.
    pub channel_initialization_timeout: Duration,
    /// Channel operation budgets.
    pub timeouts: Timeouts,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            max_via_size: DEFAULT_MAX_VIA_SIZE,
            max_content_type_size: DEFAULT_MAX_CONTENT_TYPE_SIZE,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            connection_buffer_size: DEFAULT_CONNECTION_BUFFER_SIZE,
            max_pending_connections: 100,
            max_pending_accepts: 10,
            channel_initialization_timeout: Duration::from_secs(30),
            timeouts: Timeouts::default(),
        }
    }
}

impl TransportSettings {
    /// Clamp limits to usable values.
    ///
    /// Every size and count is raised to at least one, and
    /// `max_pending_accepts` never exceeds `max_pending_connections`.
    ///
    /// # Examples
    ///
    /// ```
    /// use corewcf::config::TransportSettings;
    ///
    /// let settings = TransportSettings {
    ///     max_pending_connections: 4,
    ///     max_pending_accepts: 16,
    ///     ..TransportSettings::default()
    /// }
    /// .normalized();
    /// assert_eq!(settings.max_pending_accepts, 4);
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.max_via_size = self.max_via_size.max(1);
        self.max_content_type_size = self.max_content_type_size.max(1);
        self.max_buffer_size = self.max_buffer_size.max(1);
        self.connection_buffer_size = self.connection_buffer_size.max(1);
        self.max_pending_connections = self.max_pending_connections.max(1);
        self.max_pending_accepts = self.max_pending_accepts.clamp(1, self.max_pending_connections);
        self
    }

    /// Limits handed to the framing decoders.
    #[must_use]
    pub fn decoder_limits(&self) -> DecoderLimits {
        DecoderLimits {
            max_via_size: self.max_via_size,
            max_content_type_size: self.max_content_type_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = TransportSettings::default();
        assert_eq!(settings.max_via_size, 2048);
        assert_eq!(settings.max_content_type_size, 256);
        assert_eq!(settings.max_buffer_size, 65_536);
        assert_eq!(settings.connection_buffer_size, 8192);
        assert_eq!(settings.timeouts.receive, Duration::from_secs(600));
        assert_eq!(settings.channel_initialization_timeout, Duration::from_secs(30));
    }

    #[test]
    fn normalization_raises_zero_limits() {
        let settings = TransportSettings {
            max_buffer_size: 0,
            max_pending_connections: 0,
            max_pending_accepts: 0,
            ..TransportSettings::default()
        }
        .normalized();
        assert_eq!(settings.max_buffer_size, 1);
        assert_eq!(settings.max_pending_connections, 1);
        assert_eq!(settings.max_pending_accepts, 1);
    }

    #[test]
    fn settings_deserialize_with_partial_input() {
        let json = r#"{ "max_buffer_size": 1024 }"#;
        let settings: TransportSettings =
            serde_json::from_str(json).expect("partial settings should deserialize");
        assert_eq!(settings.max_buffer_size, 1024);
        assert_eq!(settings.max_via_size, DEFAULT_MAX_VIA_SIZE);
    }
}
