//! Properties of the two wire frames.
//!
//! - A value frame decodes only at exactly [`VALUE_WIDTH`] bytes; any other
//!   length is a truncation (or an over-long read) and never a value.
//! - A control frame that decodes is canonical: re-encoding the name gives
//!   back the received bytes, padded or not.
//! - A name that validates fits the frame and survives it.

use tiersort_core::{
    decode_segment_name, decode_value, encode_segment_name, Error, SegmentName, Value,
    MAX_SEGMENT_NAME_LEN, VALUE_WIDTH,
};

pub fn check_value_frame(bytes: &[u8]) -> Result<(), String> {
    match decode_value(bytes) {
        Ok(value) => {
            if bytes.len() != VALUE_WIDTH {
                return Err(format!("{} bytes decoded as {}", bytes.len(), value));
            }
            if value.to_le_bytes() != bytes {
                return Err(format!("{:?} decoded as {} (not little-endian)", bytes, value));
            }
            Ok(())
        }
        Err(Error::TruncatedMessage { expected, got }) => {
            if expected != VALUE_WIDTH || got != bytes.len() || got == VALUE_WIDTH {
                return Err(format!(
                    "bad truncation report for {} bytes: expected {}, got {}",
                    bytes.len(),
                    expected,
                    got
                ));
            }
            Ok(())
        }
        Err(e) => Err(format!("unexpected error for {} bytes: {}", bytes.len(), e)),
    }
}

pub fn check_name_frame(frame: &[u8]) -> Result<(), String> {
    match decode_segment_name(frame) {
        Ok(name) => {
            if frame.is_empty() || frame.len() > MAX_SEGMENT_NAME_LEN {
                return Err(format!("{}-byte frame decoded as {}", frame.len(), name));
            }
            let encoded = encode_segment_name(&name);
            if encoded[..frame.len()] != frame[..] {
                return Err(format!("frame for {} is not canonical", name));
            }
            Ok(())
        }
        Err(Error::TruncatedMessage { got: 0, .. }) if frame.is_empty() => Ok(()),
        Err(Error::SegmentNameTooLong { .. }) if frame.len() > MAX_SEGMENT_NAME_LEN => Ok(()),
        Err(Error::InvalidSegmentName { .. }) if frame.len() <= MAX_SEGMENT_NAME_LEN => Ok(()),
        Err(e) => Err(format!("unexpected error for {}-byte frame: {}", frame.len(), e)),
    }
}

pub fn check_name_text(text: &str) -> Result<(), String> {
    let name = match SegmentName::new(text) {
        Ok(name) => name,
        Err(Error::SegmentNameTooLong { len, max }) => {
            if len <= max || max != MAX_SEGMENT_NAME_LEN {
                return Err(format!("{}-byte name rejected as too long", len));
            }
            return Ok(());
        }
        Err(Error::InvalidSegmentName { .. }) => return Ok(()),
        Err(e) => return Err(format!("unexpected error for {:?}: {}", text, e)),
    };
    if text.len() > MAX_SEGMENT_NAME_LEN || !text.starts_with('/') || text.contains('\0') {
        return Err(format!("{:?} accepted but does not fit a control frame", text));
    }
    let decoded = decode_segment_name(&encode_segment_name(&name))
        .map_err(|e| format!("{:?} did not survive framing: {}", text, e))?;
    if decoded != name {
        return Err(format!("{:?} came back as {:?}", text, decoded.as_str()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_lengths() {
        check_value_frame(&[7, 0, 0, 0]).unwrap();
        check_value_frame(&[7, 0]).unwrap();
        check_value_frame(&[]).unwrap();
        check_value_frame(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(decode_value(&[19, 0, 0, 0]).unwrap(), Value(19));
    }

    #[test]
    fn test_name_frames() {
        let mut frame = [0u8; MAX_SEGMENT_NAME_LEN];
        frame[..9].copy_from_slice(b"/tiersort");
        check_name_frame(&frame).unwrap();
        check_name_frame(&frame[..64]).unwrap();
        check_name_frame(&frame[..9]).unwrap();
        check_name_frame(&[]).unwrap();
        check_name_frame(&[0u8; MAX_SEGMENT_NAME_LEN]).unwrap();

        // A NUL followed by more text is not a canonical frame.
        frame[20] = b'x';
        check_name_frame(&frame).unwrap();
    }

    #[test]
    fn test_name_text() {
        check_name_text("/tiersort-1-0").unwrap();
        check_name_text("no-slash").unwrap();
        check_name_text(&format!("/{}", "a".repeat(MAX_SEGMENT_NAME_LEN))).unwrap();
    }
}
