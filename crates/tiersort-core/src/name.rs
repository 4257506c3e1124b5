//! Shared segment names, run identifiers and the control-channel frame.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};

/// Largest control-channel frame, and so the longest segment name.
pub const MAX_SEGMENT_NAME_LEN: usize = 128;

/// Every name this crate generates starts with this prefix.
pub const SEGMENT_NAME_PREFIX: &str = "/tiersort-";

static NEXT_RUN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Identifies one pipeline run: the orchestrator's pid plus a per-process
/// sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId {
    pub pid: u32,
    pub seq: u64,
}

impl RunId {
    /// Allocate a fresh run id for the current process.
    pub fn next() -> Self {
        Self {
            pid: std::process::id(),
            seq: NEXT_RUN_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.pid, self.seq)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidConfig(format!("malformed run id {s:?}"));
        let (pid, seq) = s.split_once('-').ok_or_else(invalid)?;
        Ok(Self {
            pid: pid.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// A validated POSIX shared memory object name.
///
/// Names are `/`-prefixed, contain no further `/` or NUL, and fit the
/// 128-byte control frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentName(String);

impl SegmentName {
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if name.len() > MAX_SEGMENT_NAME_LEN {
            return Err(Error::SegmentNameTooLong {
                len: name.len(),
                max: MAX_SEGMENT_NAME_LEN,
            });
        }
        let reason = if !name.starts_with('/') {
            Some("must start with '/'")
        } else if name.len() == 1 {
            Some("empty after '/'")
        } else if name[1..].contains('/') {
            Some("contains an inner '/'")
        } else if name.contains('\0') {
            Some("contains a NUL byte")
        } else {
            None
        };
        match reason {
            Some(reason) => Err(Error::InvalidSegmentName { name, reason }),
            None => Ok(Self(name)),
        }
    }

    /// The segment name owned by one pipeline run.
    pub fn for_run(run: RunId) -> Self {
        Self(format!("{SEGMENT_NAME_PREFIX}{run}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SegmentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SegmentName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// Encode a name into a NUL-padded control frame.
pub fn encode_segment_name(name: &SegmentName) -> [u8; MAX_SEGMENT_NAME_LEN] {
    let mut frame = [0u8; MAX_SEGMENT_NAME_LEN];
    let bytes = name.as_str().as_bytes();
    frame[..bytes.len()].copy_from_slice(bytes);
    frame
}

/// Decode a control frame, stripping trailing NUL padding.
///
/// The frame is whatever arrived before the sender closed, up to
/// [`MAX_SEGMENT_NAME_LEN`] bytes. Padding is optional: an unpadded name
/// followed by end-of-stream decodes the same as a padded one.
pub fn decode_segment_name(frame: &[u8]) -> Result<SegmentName> {
    if frame.is_empty() {
        return Err(Error::TruncatedMessage {
            expected: MAX_SEGMENT_NAME_LEN,
            got: 0,
        });
    }
    if frame.len() > MAX_SEGMENT_NAME_LEN {
        return Err(Error::SegmentNameTooLong {
            len: frame.len(),
            max: MAX_SEGMENT_NAME_LEN,
        });
    }
    let end = frame.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    let text = std::str::from_utf8(&frame[..end]).map_err(|_| Error::InvalidSegmentName {
        name: String::from_utf8_lossy(&frame[..end]).into_owned(),
        reason: "not valid UTF-8",
    })?;
    SegmentName::new(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_ids_are_unique_within_a_process() {
        let a = RunId::next();
        let b = RunId::next();
        assert_eq!(a.pid, b.pid);
        assert_ne!(a, b);
        assert_ne!(SegmentName::for_run(a), SegmentName::for_run(b));
    }

    #[test]
    fn test_run_id_text_form() {
        let run = RunId { pid: 4242, seq: 7 };
        assert_eq!(run.to_string(), "4242-7");
        assert_eq!("4242-7".parse::<RunId>().unwrap(), run);
        assert!("4242".parse::<RunId>().is_err());
        assert!("a-7".parse::<RunId>().is_err());
    }

    #[test]
    fn test_name_validation() {
        assert!(SegmentName::new("/tiersort-1-0").is_ok());
        assert!(matches!(
            SegmentName::new("tiersort"),
            Err(Error::InvalidSegmentName { .. })
        ));
        assert!(matches!(
            SegmentName::new("/"),
            Err(Error::InvalidSegmentName { .. })
        ));
        assert!(matches!(
            SegmentName::new("/a/b"),
            Err(Error::InvalidSegmentName { .. })
        ));
        let long = format!("/{}", "x".repeat(MAX_SEGMENT_NAME_LEN));
        assert!(matches!(
            SegmentName::new(long),
            Err(Error::SegmentNameTooLong { len: 129, max: 128 })
        ));
    }

    #[test]
    fn test_control_frame_strips_padding() {
        let name = SegmentName::for_run(RunId { pid: 1, seq: 2 });
        let frame = encode_segment_name(&name);
        assert_eq!(frame.len(), MAX_SEGMENT_NAME_LEN);
        assert_eq!(frame[name.as_str().len()], 0);
        assert_eq!(decode_segment_name(&frame).unwrap(), name);
    }

    #[test]
    fn test_name_filling_whole_frame() {
        let name = SegmentName::new(format!("/{}", "n".repeat(MAX_SEGMENT_NAME_LEN - 1))).unwrap();
        let frame = encode_segment_name(&name);
        assert!(frame.iter().all(|&b| b != 0));
        assert_eq!(decode_segment_name(&frame).unwrap(), name);
    }

    #[test]
    fn test_unpadded_control_frame() {
        assert_eq!(
            decode_segment_name(b"/tiersort-1-0").unwrap().as_str(),
            "/tiersort-1-0"
        );
        assert_eq!(
            decode_segment_name(b"/tiersort-1-0\0\0").unwrap().as_str(),
            "/tiersort-1-0"
        );
    }

    #[test]
    fn test_bad_control_frames() {
        assert!(matches!(
            decode_segment_name(b""),
            Err(Error::TruncatedMessage {
                expected: 128,
                got: 0
            })
        ));
        assert!(matches!(
            decode_segment_name(&[0u8; 16]),
            Err(Error::InvalidSegmentName { .. })
        ));
        assert!(matches!(
            decode_segment_name(&[b'a'; MAX_SEGMENT_NAME_LEN + 1]),
            Err(Error::SegmentNameTooLong { len: 129, max: 128 })
        ));
    }
}
