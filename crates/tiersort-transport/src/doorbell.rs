//! Socketpair doorbell for the "segment populated" handoff.
//!
//! The aggregator rings the doorbell once, after every slot is written and
//! its mapping is gone, then closes its end. The scheduler waits on the
//! other end before reading the segment. A peer that closes without ringing
//! is reported as [`Error::PeerClosed`], so a dead aggregator is detected
//! instead of being mistaken for a finished one.
//!
//! # Usage
//!
//! ```ignore
//! // Orchestrator: create the pair before spawning anything
//! let (aggregator_end, scheduler_end) = Doorbell::pair()?;
//!
//! // Pass scheduler_end to the scheduler via --doorbell-fd=N
//! // Scheduler side: wrap the inherited fd
//! let doorbell = DoorbellHandle::from(inherited_fd(n)?).open()?;
//! doorbell.wait().await?;
//!
//! // Aggregator side, after detaching
//! aggregator_end.open()?.ring()?;
//! ```

use std::io::{self, ErrorKind};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};

use tokio::io::unix::AsyncFd;

use tiersort_core::{Error, Result};

use crate::fd::{cloexec_socketpair, set_nonblocking};

const WHAT: &str = "completion doorbell";

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = libc::MSG_DONTWAIT;

/// One end of a doorbell pair, not yet registered with the runtime.
#[derive(Debug)]
pub struct DoorbellHandle(OwnedFd);

impl From<OwnedFd> for DoorbellHandle {
    fn from(fd: OwnedFd) -> Self {
        Self(fd)
    }
}

impl From<DoorbellHandle> for OwnedFd {
    fn from(handle: DoorbellHandle) -> Self {
        handle.0
    }
}

impl AsFd for DoorbellHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl DoorbellHandle {
    /// Register with the current tokio runtime.
    pub fn open(self) -> io::Result<Doorbell> {
        set_nonblocking(self.0.as_raw_fd())?;
        Ok(Doorbell {
            async_fd: AsyncFd::new(self.0)?,
        })
    }
}

/// A one-shot cross-process signal.
pub struct Doorbell {
    async_fd: AsyncFd<OwnedFd>,
}

impl Doorbell {
    /// Create a connected pair of doorbell ends.
    pub fn pair() -> io::Result<(DoorbellHandle, DoorbellHandle)> {
        let (a, b) = cloexec_socketpair()?;
        Ok((DoorbellHandle(a), DoorbellHandle(b)))
    }

    /// Signal the other side.
    ///
    /// Unlike a wakeup hint, this signal carries the handoff, so any failure
    /// to deliver it is an error.
    pub fn ring(&self) -> Result<()> {
        let buf = [1u8];
        loop {
            // SAFETY: fd is valid, buf is valid
            let ret = unsafe {
                libc::send(
                    self.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    SEND_FLAGS,
                )
            };
            if ret > 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                ErrorKind::Interrupted => continue,
                ErrorKind::BrokenPipe | ErrorKind::ConnectionReset => {
                    return Err(Error::PeerClosed { what: WHAT })
                }
                _ => {
                    return Err(Error::Io {
                        context: "doorbell ring",
                        source: err,
                    })
                }
            }
        }
    }

    /// Wait for the other side to ring.
    pub async fn wait(&self) -> Result<()> {
        loop {
            let mut guard = self
                .async_fd
                .readable()
                .await
                .map_err(Error::io("doorbell wait"))?;

            match guard.try_io(|inner| recv_byte(inner.get_ref().as_raw_fd())) {
                Ok(Ok(0)) => return Err(Error::PeerClosed { what: WHAT }),
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) if e.kind() == ErrorKind::Interrupted => continue,
                Ok(Err(e)) if e.kind() == ErrorKind::ConnectionReset => {
                    return Err(Error::PeerClosed { what: WHAT })
                }
                Ok(Err(e)) => {
                    return Err(Error::Io {
                        context: "doorbell wait",
                        source: e,
                    })
                }
                Err(_would_block) => continue,
            }
        }
    }
}

impl AsRawFd for Doorbell {
    fn as_raw_fd(&self) -> RawFd {
        self.async_fd.get_ref().as_raw_fd()
    }
}

fn recv_byte(fd: RawFd) -> io::Result<usize> {
    let mut buf = [0u8; 1];
    // SAFETY: fd is valid, buf is valid
    let ret = unsafe {
        libc::recv(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            libc::MSG_DONTWAIT,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ret as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_doorbell_ring_and_wait() {
        let (a, b) = Doorbell::pair().unwrap();
        let ringer = a.open().unwrap();
        let waiter = b.open().unwrap();

        ringer.ring().unwrap();
        drop(ringer);

        tokio::time::timeout(Duration::from_millis(500), waiter.wait())
            .await
            .expect("timeout waiting for doorbell")
            .expect("wait failed");
    }

    #[tokio::test]
    async fn test_wait_parks_until_rung() {
        let (a, b) = Doorbell::pair().unwrap();
        let waiter = b.open().unwrap();
        let wait = tokio::spawn(async move { waiter.wait().await });

        tokio::task::yield_now().await;
        assert!(!wait.is_finished());

        a.open().unwrap().ring().unwrap();
        wait.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_without_ring_is_peer_closed() {
        let (a, b) = Doorbell::pair().unwrap();
        let waiter = b.open().unwrap();
        drop(a);

        assert!(matches!(
            waiter.wait().await,
            Err(Error::PeerClosed {
                what: "completion doorbell"
            })
        ));
    }

    #[tokio::test]
    async fn test_ring_after_peer_closed_fails() {
        let (a, b) = Doorbell::pair().unwrap();
        let ringer = a.open().unwrap();
        drop(b);
        assert!(ringer.ring().is_err());
    }
}
