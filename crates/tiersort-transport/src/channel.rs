//! Unidirectional byte channels over pipes.
//!
//! A channel is created as a pair of inert handles ([`ReadHandle`],
//! [`WriteHandle`]) that own their descriptors and can be handed to the
//! spawner. The process that keeps an end calls `open()` to get an async
//! reader or writer registered with the tokio reactor.
//!
//! End-of-stream is observed only once every copy of the write end is
//! closed, so each process must drop the ends it does not use. Handles are
//! close-on-exec and the parent drops its copy after spawning, which keeps
//! exactly one writer and one reader per channel.

use std::io::{self, ErrorKind};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;

use tiersort_core::{
    decode_segment_name, decode_value, encode_segment_name, Error, Result, SegmentName, Value,
    MAX_SEGMENT_NAME_LEN, VALUE_WIDTH,
};

use crate::fd::{cloexec_pipe, read_fd, set_nonblocking, write_fd};

/// Create a channel and return its (read, write) handles.
pub fn channel() -> io::Result<(ReadHandle, WriteHandle)> {
    let (read, write) = cloexec_pipe()?;
    Ok((ReadHandle(read), WriteHandle(write)))
}

/// The read end of a channel, not yet registered with the runtime.
#[derive(Debug)]
pub struct ReadHandle(OwnedFd);

/// The write end of a channel, not yet registered with the runtime.
#[derive(Debug)]
pub struct WriteHandle(OwnedFd);

macro_rules! impl_handle {
    ($ty:ident) => {
        impl From<OwnedFd> for $ty {
            fn from(fd: OwnedFd) -> Self {
                Self(fd)
            }
        }

        impl From<$ty> for OwnedFd {
            fn from(handle: $ty) -> Self {
                handle.0
            }
        }

        impl AsFd for $ty {
            fn as_fd(&self) -> BorrowedFd<'_> {
                self.0.as_fd()
            }
        }

        impl AsRawFd for $ty {
            fn as_raw_fd(&self) -> RawFd {
                self.0.as_raw_fd()
            }
        }
    };
}

impl_handle!(ReadHandle);
impl_handle!(WriteHandle);

impl ReadHandle {
    /// Register with the current tokio runtime.
    pub fn open(self, what: &'static str) -> io::Result<ChannelReader> {
        set_nonblocking(self.0.as_raw_fd())?;
        Ok(ChannelReader {
            async_fd: AsyncFd::new(self.0)?,
            what,
        })
    }
}

impl WriteHandle {
    /// Register with the current tokio runtime.
    pub fn open(self, what: &'static str) -> io::Result<ChannelWriter> {
        set_nonblocking(self.0.as_raw_fd())?;
        Ok(ChannelWriter {
            async_fd: AsyncFd::new(self.0)?,
            what,
        })
    }
}

/// Async read end of a channel.
pub struct ChannelReader {
    async_fd: AsyncFd<OwnedFd>,
    what: &'static str,
}

impl ChannelReader {
    /// Read until `buf` is full or the writer closes.
    ///
    /// Returns the number of bytes read; less than `buf.len()` means the
    /// stream ended.
    pub async fn read_full(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let mut guard = self.async_fd.readable().await?;
            let dst = &mut buf[filled..];
            match guard.try_io(|inner| read_fd(inner.get_ref().as_raw_fd(), dst)) {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => filled += n,
                Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
                // Spurious readiness; try_io already cleared it.
                Err(_would_block) => continue,
            }
        }
        Ok(filled)
    }

    /// Read exactly one framed value.
    pub async fn read_value(&self) -> Result<Value> {
        let mut buf = [0u8; VALUE_WIDTH];
        let n = self
            .read_full(&mut buf)
            .await
            .map_err(Error::io("channel read"))?;
        decode_value(&buf[..n])
    }

    /// Read `count` framed values.
    pub async fn read_values(&self, count: usize) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(self.read_value().await?);
        }
        Ok(values)
    }

    /// Read one control frame carrying a segment name.
    ///
    /// The frame ends after 128 bytes or when the writer closes, whichever
    /// comes first; trailing NUL padding is stripped. A writer that closes
    /// without sending anything is reported as [`Error::PeerClosed`].
    pub async fn read_segment_name(&self) -> Result<SegmentName> {
        let mut frame = [0u8; MAX_SEGMENT_NAME_LEN];
        let n = self
            .read_full(&mut frame)
            .await
            .map_err(Error::io("control read"))?;
        if n == 0 {
            return Err(Error::PeerClosed { what: self.what });
        }
        decode_segment_name(&frame[..n])
    }
}

impl AsRawFd for ChannelReader {
    fn as_raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }
}

/// Async write end of a channel.
pub struct ChannelWriter {
    async_fd: AsyncFd<OwnedFd>,
    what: &'static str,
}

impl ChannelWriter {
    /// Write every byte of `buf`, retrying partial writes.
    pub async fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            let mut guard = self.async_fd.writable().await?;
            match guard.try_io(|inner| write_fd(inner.get_ref().as_raw_fd(), buf)) {
                Ok(Ok(0)) => {
                    return Err(io::Error::new(
                        ErrorKind::WriteZero,
                        "channel accepted no bytes",
                    ))
                }
                Ok(Ok(n)) => buf = &buf[n..],
                Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    pub async fn write_value(&self, value: Value) -> Result<()> {
        self.write_all(&value.to_le_bytes())
            .await
            .map_err(Error::io("channel write"))
    }

    pub async fn write_values(&self, values: &[Value]) -> Result<()> {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.write_all(&bytes)
            .await
            .map_err(Error::io("channel write"))
    }

    /// Send a segment name as one NUL-padded control frame.
    pub async fn write_segment_name(&self, name: &SegmentName) -> Result<()> {
        self.write_all(&encode_segment_name(name))
            .await
            .map_err(Error::io("control write"))
    }

    /// Close the write end, signalling end-of-stream to the reader.
    pub fn close(self) {
        tracing::trace!(channel = self.what, "closing write end");
    }
}

impl AsRawFd for ChannelWriter {
    fn as_raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }
}
