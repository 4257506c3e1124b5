//! POSIX shared memory segments.
//!
//! A segment is a named object created with `shm_open` and mapped with
//! `mmap(MAP_SHARED)`. Its layout is N value slots:
//!
//! ```text
//! offset 0      4      8            4*(N-1)
//!        ┌──────┬──────┬─── ... ───┬──────┐
//!        │ u32  │ u32  │           │ u32  │   little-endian
//!        └──────┴──────┴─── ... ───┴──────┘
//! ```
//!
//! There is no header and no in-segment locking: roles take turns (one
//! writer, then one reader), and the ordering is carried by the channels
//! and the doorbell.
//!
//! Mapping lifetime and name lifetime are separate. [`SharedSegment::detach`]
//! (or drop) removes this process's mapping; [`destroy`] removes the name.
//! Neither implies the other.

use std::ffi::CString;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd};
use std::ptr::NonNull;

use tiersort_core::{Error, Result, SegmentName, Value, VALUE_WIDTH};

/// This process's mapping of a named shared segment.
pub struct SharedSegment {
    name: SegmentName,
    ptr: NonNull<u8>,
    slots: usize,
    mapped: bool,
}

// SAFETY: the mapping is process-wide and SharedSegment hands out no
// references that outlive &self/&mut self.
unsafe impl Send for SharedSegment {}

impl SharedSegment {
    /// Create a new segment of `slots` zeroed slots and map it.
    ///
    /// Fails if the name already exists.
    pub fn create(name: &SegmentName, slots: usize) -> Result<Self> {
        let len = segment_len(slots)?;
        let cname = c_name(name);

        let fd = shm_open(&cname, libc::O_CREAT | libc::O_EXCL | libc::O_RDWR)
            .map_err(Error::io("shm_open (create)"))?;

        let mapped = resize(&fd, len).and_then(|()| map(&fd, len));
        match mapped {
            Ok(ptr) => Ok(Self {
                name: name.clone(),
                ptr,
                slots,
                mapped: true,
            }),
            Err(source) => {
                // Don't leave a half-made name behind.
                unsafe { libc::shm_unlink(cname.as_ptr()) };
                Err(Error::Io {
                    context: "sizing new segment",
                    source,
                })
            }
        }
    }

    /// Map an existing segment that must hold exactly `slots` slots.
    pub fn attach(name: &SegmentName, slots: usize) -> Result<Self> {
        let expected = segment_len(slots)?;
        let cname = c_name(name);

        let fd = shm_open(&cname, libc::O_RDWR).map_err(|e| {
            if e.raw_os_error() == Some(libc::ENOENT) {
                Error::SegmentNotFound {
                    name: name.to_string(),
                }
            } else {
                Error::Io {
                    context: "shm_open (attach)",
                    source: e,
                }
            }
        })?;

        let found = object_len(&fd).map_err(Error::io("fstat segment"))?;
        if found != expected {
            return Err(Error::SegmentSizeMismatch {
                name: name.to_string(),
                expected,
                found,
            });
        }

        let ptr = map(&fd, expected).map_err(Error::io("mmap segment"))?;
        Ok(Self {
            name: name.clone(),
            ptr,
            slots,
            mapped: true,
        })
    }

    pub fn name(&self) -> &SegmentName {
        &self.name
    }

    pub fn slots(&self) -> usize {
        self.slots
    }

    pub fn len(&self) -> usize {
        self.slots * VALUE_WIDTH
    }

    pub fn is_empty(&self) -> bool {
        self.slots == 0
    }

    fn slot_offset(&self, index: usize) -> Result<usize> {
        if index >= self.slots {
            return Err(Error::SlotOutOfBounds {
                index,
                slots: self.slots,
            });
        }
        Ok(index * VALUE_WIDTH)
    }

    /// Write `value` into slot `index`.
    pub fn write_slot(&mut self, index: usize, value: Value) -> Result<()> {
        let offset = self.slot_offset(index)?;
        let bytes = value.to_le_bytes();
        // SAFETY: offset + VALUE_WIDTH <= len, the mapping is live
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                self.ptr.as_ptr().add(offset),
                VALUE_WIDTH,
            );
        }
        Ok(())
    }

    /// Read slot `index`.
    pub fn read_slot(&self, index: usize) -> Result<Value> {
        let offset = self.slot_offset(index)?;
        let mut bytes = [0u8; VALUE_WIDTH];
        // SAFETY: offset + VALUE_WIDTH <= len, the mapping is live
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                bytes.as_mut_ptr(),
                VALUE_WIDTH,
            );
        }
        Ok(Value::from_le_bytes(bytes))
    }

    /// Fill every slot; `values` must have exactly one value per slot.
    pub fn write_all(&mut self, values: &[Value]) -> Result<()> {
        if values.len() != self.slots {
            return Err(Error::SegmentSizeMismatch {
                name: self.name.to_string(),
                expected: self.len(),
                found: values.len() * VALUE_WIDTH,
            });
        }
        for (index, &value) in values.iter().enumerate() {
            self.write_slot(index, value)?;
        }
        Ok(())
    }

    /// Read every slot in index order.
    pub fn read_all(&self) -> Vec<Value> {
        self.as_bytes()
            .chunks_exact(VALUE_WIDTH)
            .map(|c| Value::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    /// The raw bytes of the mapping.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: the mapping is live and len bytes long
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    /// Unmap this process's view. The name stays; see [`destroy`].
    pub fn detach(mut self) -> Result<()> {
        self.unmap().map_err(Error::io("munmap segment"))
    }

    fn unmap(&mut self) -> io::Result<()> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;
        // SAFETY: ptr/len describe a mapping created by map()
        let ret = unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Err(e) = self.unmap() {
            tracing::warn!(segment = %self.name, "munmap failed: {}", e);
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("name", &self.name)
            .field("slots", &self.slots)
            .field("mapped", &self.mapped)
            .finish()
    }
}

/// Remove a segment name.
///
/// Existing mappings stay valid until they are detached. Unlinking a name
/// that is already gone is [`Error::DoubleDestroy`].
pub fn destroy(name: &SegmentName) -> Result<()> {
    let cname = c_name(name);
    let ret = unsafe { libc::shm_unlink(cname.as_ptr()) };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOENT) {
            return Err(Error::DoubleDestroy {
                name: name.to_string(),
            });
        }
        return Err(Error::Io {
            context: "shm_unlink",
            source: err,
        });
    }
    Ok(())
}

fn segment_len(slots: usize) -> Result<usize> {
    if slots == 0 {
        return Err(Error::InvalidConfig("a segment needs at least one slot".into()));
    }
    Ok(slots * VALUE_WIDTH)
}

fn c_name(name: &SegmentName) -> CString {
    // SegmentName rejects interior NULs.
    CString::new(name.as_str()).unwrap_or_default()
}

fn shm_open(name: &CString, oflag: libc::c_int) -> io::Result<OwnedFd> {
    // shm_open descriptors are close-on-exec by POSIX.
    let fd = unsafe { libc::shm_open(name.as_ptr(), oflag, 0o600 as libc::mode_t) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: shm_open succeeded
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn resize(fd: &OwnedFd, len: usize) -> io::Result<()> {
    let ret = unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn object_len(fd: &OwnedFd) -> io::Result<usize> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(stat.st_size as usize)
}

fn map(fd: &OwnedFd, len: usize) -> io::Result<NonNull<u8>> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(ptr as *mut u8).ok_or_else(|| io::Error::other("mmap returned null"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiersort_core::RunId;

    fn fresh_name() -> SegmentName {
        SegmentName::for_run(RunId::next())
    }

    #[test]
    fn test_create_is_zeroed_and_sized() {
        let name = fresh_name();
        let seg = SharedSegment::create(&name, 4).unwrap();
        assert_eq!(seg.len(), 16);
        assert!(seg.as_bytes().iter().all(|&b| b == 0));
        seg.detach().unwrap();
        destroy(&name).unwrap();
    }

    #[test]
    fn test_two_attachments_share_bytes() {
        let name = fresh_name();
        let creator = SharedSegment::create(&name, 4).unwrap();
        let mut a = SharedSegment::attach(&name, 4).unwrap();
        let b = SharedSegment::attach(&name, 4).unwrap();

        // Before any write both views agree.
        assert_eq!(a.as_bytes(), b.as_bytes());

        a.write_slot(2, Value(19)).unwrap();
        assert_eq!(b.read_slot(2).unwrap(), Value(19));
        assert_eq!(creator.read_slot(2).unwrap(), Value(19));
        assert_eq!(&b.as_bytes()[8..12], &[19, 0, 0, 0]);

        a.detach().unwrap();
        b.detach().unwrap();
        creator.detach().unwrap();
        destroy(&name).unwrap();
    }

    // Linux exposes POSIX shm objects under /dev/shm, so a plain shell in
    // another process can stand in for a second attachment.
    #[cfg(target_os = "linux")]
    #[test]
    fn test_other_process_sees_same_bytes() {
        use std::process::Command;

        let name = fresh_name();
        let path = format!("/dev/shm{}", name);
        let mut seg = SharedSegment::create(&name, 4).unwrap();
        seg.write_slot(0, Value(7)).unwrap();

        let out = Command::new("sh")
            .arg("-c")
            .arg(
                r#"od -An -tu1 -N4 "$0" && printf '\023' | dd of="$0" bs=1 seek=8 count=1 conv=notrunc 2>/dev/null"#,
            )
            .arg(&path)
            .output()
            .unwrap();
        assert!(out.status.success(), "{:?}", out);
        let seen: Vec<u8> = String::from_utf8(out.stdout)
            .unwrap()
            .split_whitespace()
            .map(|b| b.parse().unwrap())
            .collect();
        assert_eq!(seen, [7, 0, 0, 0]);

        // The child's write lands in this process's existing mapping.
        assert_eq!(seg.read_slot(2).unwrap(), Value(19));
        assert_eq!(
            SharedSegment::attach(&name, 4).unwrap().read_all(),
            [Value(7), Value(0), Value(19), Value(0)]
        );

        seg.detach().unwrap();
        destroy(&name).unwrap();
    }

    #[test]
    fn test_slots_are_little_endian_at_fixed_offsets() {
        let name = fresh_name();
        let mut seg = SharedSegment::create(&name, 3).unwrap();
        seg.write_all(&[Value(1), Value(0x0100), Value(7)]).unwrap();
        assert_eq!(
            seg.as_bytes(),
            &[1, 0, 0, 0, 0, 1, 0, 0, 7, 0, 0, 0]
        );
        assert_eq!(seg.read_all(), vec![Value(1), Value(0x0100), Value(7)]);
        drop(seg);
        destroy(&name).unwrap();
    }

    #[test]
    fn test_attach_missing_is_not_found() {
        let name = fresh_name();
        assert!(matches!(
            SharedSegment::attach(&name, 4),
            Err(Error::SegmentNotFound { .. })
        ));
    }

    #[test]
    fn test_attach_with_wrong_slot_count() {
        let name = fresh_name();
        let _seg = SharedSegment::create(&name, 4).unwrap();
        assert!(matches!(
            SharedSegment::attach(&name, 5),
            Err(Error::SegmentSizeMismatch {
                expected: 20,
                found: 16,
                ..
            })
        ));
        destroy(&name).unwrap();
    }

    #[test]
    fn test_create_existing_name_fails() {
        let name = fresh_name();
        let _seg = SharedSegment::create(&name, 1).unwrap();
        assert!(matches!(
            SharedSegment::create(&name, 1),
            Err(Error::Io { .. })
        ));
        destroy(&name).unwrap();
    }

    #[test]
    fn test_destroy_twice_is_double_destroy() {
        let name = fresh_name();
        SharedSegment::create(&name, 1).unwrap().detach().unwrap();
        destroy(&name).unwrap();
        assert!(matches!(
            destroy(&name),
            Err(Error::DoubleDestroy { .. })
        ));
    }

    #[test]
    fn test_mapping_outlives_name() {
        let name = fresh_name();
        let mut seg = SharedSegment::create(&name, 1).unwrap();
        destroy(&name).unwrap();
        seg.write_slot(0, Value(3)).unwrap();
        assert_eq!(seg.read_slot(0).unwrap(), Value(3));
        assert!(matches!(
            SharedSegment::attach(&name, 1),
            Err(Error::SegmentNotFound { .. })
        ));
    }

    #[test]
    fn test_slot_bounds() {
        let name = fresh_name();
        let mut seg = SharedSegment::create(&name, 2).unwrap();
        assert!(matches!(
            seg.write_slot(2, Value(1)),
            Err(Error::SlotOutOfBounds { index: 2, slots: 2 })
        ));
        assert!(seg.read_slot(5).is_err());
        assert!(seg.write_all(&[Value(1)]).is_err());
        drop(seg);
        destroy(&name).unwrap();
    }
}
