//! tiersort-transport: the OS resources the pipeline roles talk through.
//!
//! # Characteristics
//!
//! - Unidirectional pipe channels with fixed-width framing
//! - A socketpair doorbell for the "segment is populated" signal
//! - POSIX shared memory segments (`shm_open` + `mmap`)
//! - Every descriptor is created close-on-exec; children only inherit what
//!   the spawner declares
//! - Every blocking wait is bounded by [`bounded`]
//!
//! # Topology
//!
//! ```text
//!  worker 0 ──pipe──┐
//!  worker 1 ──pipe──┤                         ┌──────────────┐
//!     ...           ├──> aggregator ──write──>│ shm segment  │──read──> scheduler
//!  worker N ──pipe──┘        ^   │            └──────────────┘            │  │  │
//!                            │   └────────────── doorbell ───────────────>┘  │  │
//!                            └───────────────── control pipe (name) ─────────┘  │
//!  orchestrator <──────────────────────────────── result pipe ──────────────────┘
//! ```

use std::future::Future;
use std::time::Duration;

use tiersort_core::{Error, Result};

pub mod channel;
pub mod doorbell;
mod fd;
pub mod segment;

pub use channel::{channel, ChannelReader, ChannelWriter, ReadHandle, WriteHandle};
pub use doorbell::{Doorbell, DoorbellHandle};
pub use segment::{destroy, SharedSegment};

/// Run `fut` with a deadline; expiry becomes [`Error::Timeout`].
pub async fn bounded<T>(
    limit: Duration,
    what: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout {
            what,
            waited: limit,
        })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_times_out() {
        let err = bounded(Duration::from_millis(20), "nothing", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Timeout { what: "nothing", .. }));
    }

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let v = bounded(Duration::from_secs(1), "value", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(v, 7);
    }
}
