//! Utilities for exercising `corewcf` transports and services in tests.
//!
//! [`RecordBuilder`] writes framing records byte by byte, [`drive`] runs a
//! server routine against an in-memory connection and returns what it wrote,
//! and the listener helpers provide real and in-memory sockets.
//!
//! ```rust
//! use corewcf_testing::{RecordBuilder, first_fault};
//!
//! let bytes = RecordBuilder::new().version(9, 9).build();
//! assert!(first_fault(&bytes).is_none());
//! ```

mod drive;
mod listener;
mod logging;
mod records;

pub use drive::{CONNECTION_BUFFER, DEFAULT_CAPACITY, connection_pair, drive, drive_with_capacity};
pub use listener::{MemoryDialer, MemoryListener, TestResult, memory_listener, unused_listener};
pub use logging::{LoggerHandle, logger};
pub use records::{RecordBuilder, first_fault};
