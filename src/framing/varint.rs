//! Variable-length size prefixes.
//!
//! Sizes are written as little-endian groups of seven bits with the high bit
//! set on every byte except the last. At most five bytes are allowed and the
//! value must fit in a non-negative `i32`.

use bytes::{BufMut, BytesMut};

use super::FramingError;

const MAX_BYTES: u8 = 5;

/// Largest value a size prefix may carry.
pub const MAX_VARINT_VALUE: usize = i32::MAX as usize;

/// Incremental decoder for a single size prefix.
///
/// Bytes may arrive across any number of [`decode`](Self::decode) calls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VarintDecoder {
    value: u32,
    read: u8,
    done: bool,
}

impl VarintDecoder {
    /// Create a decoder awaiting its first byte.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Consume bytes until the value is complete or `bytes` is exhausted.
    ///
    /// Returns the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`FramingError::InvalidVarint`] if the prefix runs past five
    /// bytes or encodes a value above `i32::MAX`.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<usize, FramingError> {
        if self.done {
            return Ok(0);
        }
        for (index, &byte) in bytes.iter().enumerate() {
            if self.read == MAX_BYTES - 1 && byte & 0xF8 != 0 {
                return Err(FramingError::InvalidVarint);
            }
            self.value |= u32::from(byte & 0x7F) << (u32::from(self.read) * 7);
            self.read += 1;
            if byte & 0x80 == 0 {
                self.done = true;
                return Ok(index + 1);
            }
        }
        Ok(bytes.len())
    }

    /// The decoded value once complete.
    #[must_use]
    pub fn value(&self) -> Option<usize> {
        // The final-byte check bounds the value to 31 bits.
        self.done.then(|| self.value as usize)
    }

    /// Returns true once a terminating byte has been seen.
    #[must_use]
    pub fn is_complete(&self) -> bool { self.done }
}

/// Append the size prefix for `value` to `dst`.
///
/// # Errors
///
/// Returns [`FramingError::SizeOutOfRange`] if `value` exceeds
/// [`MAX_VARINT_VALUE`].
pub fn encode_varint(value: usize, dst: &mut BytesMut) -> Result<(), FramingError> {
    if value > MAX_VARINT_VALUE {
        return Err(FramingError::SizeOutOfRange(value));
    }
    let mut remaining = value;
    while remaining >= 0x80 {
        dst.put_u8((remaining as u8 & 0x7F) | 0x80);
        remaining >>= 7;
    }
    dst.put_u8(remaining as u8);
    Ok(())
}

/// Number of bytes [`encode_varint`] writes for `value`.
#[must_use]
pub fn encoded_len(value: usize) -> usize {
    let mut len = 1;
    let mut remaining = value >> 7;
    while remaining > 0 {
        len += 1;
        remaining >>= 7;
    }
    len
}
