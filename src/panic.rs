//! Readable panic payloads.
//!
//! Operations and channel handlers run behind `catch_unwind`; the payload
//! they surrender is usually a `&str` or `String`, which these helpers pull
//! out for logs and fault reasons.

use std::{any::Any, fmt};

/// Borrowed panic payload that displays as its message.
///
/// ```
/// use corewcf::panic::format_panic;
///
/// let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
/// assert_eq!(format_panic(payload.as_ref()).to_string(), "boom");
/// let payload: Box<dyn std::any::Any + Send> = Box::new(7_u8);
/// assert_eq!(format_panic(payload.as_ref()).to_string(), "non-string panic payload");
/// ```
#[derive(Clone, Copy)]
#[must_use]
pub struct PanicMessage<'a>(&'a (dyn Any + Send));

impl PanicMessage<'_> {
    /// The message, if the payload carried one.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        self.0
            .downcast_ref::<String>()
            .map(String::as_str)
            .or_else(|| self.0.downcast_ref::<&'static str>().copied())
    }
}

impl fmt::Display for PanicMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str().unwrap_or("non-string panic payload"))
    }
}

impl fmt::Debug for PanicMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PanicMessage").field(&self.to_string()).finish()
    }
}

/// View `payload` as a [`PanicMessage`].
pub fn format_panic(payload: &(dyn Any + Send)) -> PanicMessage<'_> { PanicMessage(payload) }
