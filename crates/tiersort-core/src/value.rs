//! The pipeline payload and its fixed-width framing.

use std::fmt;

use crate::error::{Error, Result};

/// Size of one framed value on a channel and of one slot in the segment.
pub const VALUE_WIDTH: usize = 4;

/// Exclusive upper bound of generated values.
pub const VALUE_BOUND: u32 = 20;

/// One worker-generated value.
///
/// Values have no identity beyond the slot index they are written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Value(pub u32);

impl Value {
    #[inline]
    pub fn to_le_bytes(self) -> [u8; VALUE_WIDTH] {
        self.0.to_le_bytes()
    }

    #[inline]
    pub fn from_le_bytes(bytes: [u8; VALUE_WIDTH]) -> Self {
        Self(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Decode one framed value from exactly the bytes that were received.
///
/// Anything other than [`VALUE_WIDTH`] bytes is a framing error; short input
/// is never zero-padded into a value.
pub fn decode_value(received: &[u8]) -> Result<Value> {
    let bytes: [u8; VALUE_WIDTH] = received.try_into().map_err(|_| Error::TruncatedMessage {
        expected: VALUE_WIDTH,
        got: received.len(),
    })?;
    Ok(Value::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_layout() {
        assert_eq!(Value(19).to_le_bytes(), [19, 0, 0, 0]);
        assert_eq!(Value(0x0403_0201).to_le_bytes(), [1, 2, 3, 4]);
        assert_eq!(Value::from_le_bytes([7, 0, 0, 0]), Value(7));
    }

    #[test]
    fn test_decode_short_frame_is_truncated() {
        let err = decode_value(&[7, 0]).unwrap_err();
        assert!(matches!(
            err,
            Error::TruncatedMessage {
                expected: 4,
                got: 2
            }
        ));
    }

    #[test]
    fn test_decode_empty_frame_is_truncated() {
        assert!(matches!(
            decode_value(&[]),
            Err(Error::TruncatedMessage { got: 0, .. })
        ));
    }

    #[test]
    fn test_ordering_is_numeric() {
        let mut values = vec![Value(19), Value(2), Value(256), Value(7)];
        values.sort();
        assert_eq!(values, vec![Value(2), Value(7), Value(19), Value(256)]);
    }
}
