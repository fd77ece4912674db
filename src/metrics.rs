//! Metric helpers for `corewcf`.
//!
//! This module defines metric names and simple helper functions
//! wrapping the [`metrics`](https://docs.rs/metrics) crate. With the
//! `metrics` feature disabled every helper compiles to a no-op.

#[cfg(feature = "metrics")]
use metrics::{counter, gauge};

use crate::framing::FramingFault;

/// Name of the gauge tracking connections held by acceptors.
pub const CONNECTIONS_ACTIVE: &str = "corewcf_connections_active";
/// Name of the counter tracking envelopes sent and received.
pub const MESSAGES_TOTAL: &str = "corewcf_messages_total";
/// Name of the counter tracking framing fault records sent.
pub const FRAMING_FAULTS_TOTAL: &str = "corewcf_framing_faults_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "corewcf_errors_total";
/// Name of the counter tracking panics caught in operations and handlers.
pub const PANICS_TOTAL: &str = "corewcf_panics_total";

/// Direction of message processing.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Envelopes read from a session.
    Inbound,
    /// Envelopes written to a session.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
pub fn inc_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

/// Decrement the active connections gauge.
pub fn dec_connections() {
    #[cfg(feature = "metrics")]
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record an envelope for the given direction.
pub fn inc_messages(direction: Direction) {
    #[cfg(feature = "metrics")]
    counter!(MESSAGES_TOTAL, "direction" => direction.as_str()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = direction;
}

/// Record a framing fault record written to a peer.
pub fn inc_framing_faults(fault: &FramingFault) {
    #[cfg(feature = "metrics")]
    counter!(FRAMING_FAULTS_TOTAL, "fault" => fault.name().to_owned()).increment(1);
    #[cfg(not(feature = "metrics"))]
    let _ = fault;
}

/// Record an error occurrence.
pub fn inc_errors() {
    #[cfg(feature = "metrics")]
    counter!(ERRORS_TOTAL).increment(1);
}

/// Record a panic caught while dispatching.
pub fn inc_panics() {
    #[cfg(feature = "metrics")]
    counter!(PANICS_TOTAL).increment(1);
}
