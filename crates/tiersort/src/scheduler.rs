//! Scheduler role: own the shared segment, read it back once populated.
//!
//! ```text
//! create ──> publish name ──> wait doorbell ──> read ──> sort ──> detach
//!                                                                   │
//!                         (scheduler authority only) destroy <──────┤
//!                                                  report result <──┘
//! ```
//!
//! The scheduler keeps the mapping it created instead of attaching a second
//! time. It never reads before the doorbell rings, and it never sleeps in
//! place of waiting.

use std::time::Duration;

use tracing::{debug, info, warn};

use tiersort_core::{
    DestroyAuthority, Error, Handoff, HandoffError, HandoffStep, Phase, Result, Role, RunId,
    SegmentName, Value,
};
use tiersort_transport::{bounded, destroy, ChannelWriter, Doorbell, SharedSegment};

fn tagged(phase: Phase) -> impl FnOnce(Error) -> Error {
    move |e| e.during(Role::Scheduler, phase)
}

fn ledger(phase: Phase) -> impl FnOnce(HandoffError) -> Error {
    move |e| Error::from(e).during(Role::Scheduler, phase)
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    pub slots: usize,
    pub run: RunId,
    pub authority: DestroyAuthority,
    pub io_timeout: Duration,
}

impl Scheduler {
    /// Run the scheduler side of the handoff and report the sorted values.
    pub async fn run(
        &self,
        control: ChannelWriter,
        doorbell: Doorbell,
        result: ChannelWriter,
    ) -> Result<Vec<Value>> {
        let mut handoff = Handoff::new();
        let name = SegmentName::for_run(self.run);

        let segment = SharedSegment::create(&name, self.slots).map_err(tagged(Phase::Create))?;
        handoff
            .record(HandoffStep::Create)
            .map_err(ledger(Phase::Create))?;
        info!(segment = %name, slots = self.slots, "created segment");

        control
            .write_segment_name(&name)
            .await
            .map_err(tagged(Phase::Publish))?;
        control.close();
        handoff
            .record(HandoffStep::Publish)
            .map_err(ledger(Phase::Publish))?;
        debug!(segment = %name, "published segment name");

        let rung = bounded(self.io_timeout, "completion doorbell", doorbell.wait()).await;
        drop(doorbell);
        if let Err(e) = rung {
            return Err(self.abandon(segment, &mut handoff, e));
        }

        // The doorbell is only rung after the aggregator has written every
        // slot and dropped its mapping.
        record_populated(&mut handoff).map_err(ledger(Phase::AwaitPopulated))?;

        handoff
            .record(HandoffStep::Read)
            .map_err(ledger(Phase::ReadBack))?;
        let values = segment.read_all();
        let mut sorted = values.clone();
        sorted.sort();
        debug!(?values, ?sorted, "read back segment");

        segment.detach().map_err(tagged(Phase::Detach))?;
        handoff
            .release(Role::Scheduler)
            .map_err(ledger(Phase::Detach))?;

        if self.authority == DestroyAuthority::Scheduler {
            handoff.destroy().map_err(ledger(Phase::Destroy))?;
            destroy(&name).map_err(tagged(Phase::Destroy))?;
            info!(segment = %name, "destroyed segment");
        }

        result
            .write_values(&sorted)
            .await
            .map_err(tagged(Phase::Report))?;
        result.close();

        info!(?sorted, "reported sorted values");
        Ok(sorted)
    }

    /// The wait failed: drop the mapping and decide what happens to the name.
    ///
    /// A doorbell closed without ringing means the aggregator gave up before
    /// signalling, so nothing will ever read the segment. With scheduler
    /// authority it is unlinked here. A timeout or I/O failure leaves the
    /// segment in place for inspection.
    fn abandon(&self, segment: SharedSegment, handoff: &mut Handoff, cause: Error) -> Error {
        let name = segment.name().clone();
        if let Err(e) = segment.detach() {
            warn!(segment = %name, error = %e, "detach after failed wait");
        }
        if let Err(e) = handoff.release(Role::Scheduler) {
            warn!(error = %e, "ledger rejected scheduler release");
        }

        let abandoned = matches!(cause, Error::PeerClosed { .. });
        if abandoned && self.authority == DestroyAuthority::Scheduler {
            match handoff.destroy().map_err(Error::from).and_then(|_| destroy(&name)) {
                Ok(()) => info!(segment = %name, "destroyed abandoned segment"),
                Err(e) => warn!(segment = %name, error = %e, "could not destroy abandoned segment"),
            }
        } else if self.authority == DestroyAuthority::Scheduler {
            warn!(segment = %name, "leaving segment in place after failed wait");
        }

        cause.during(Role::Scheduler, Phase::AwaitPopulated)
    }
}

fn record_populated(handoff: &mut Handoff) -> Result<(), HandoffError> {
    handoff.record(HandoffStep::Attach)?;
    handoff.record(HandoffStep::Populate)?;
    handoff.release(Role::Aggregator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiersort_transport::{channel, ChannelReader};

    struct Harness {
        control: ChannelReader,
        ring_end: Option<Doorbell>,
        result: ChannelReader,
    }

    /// The scheduler's three ends, plus the harness playing everyone else.
    fn wire() -> (Harness, ChannelWriter, Doorbell, ChannelWriter) {
        let (control_rx, control_tx) = channel().unwrap();
        let (ring_end, wait_end) = Doorbell::pair().unwrap();
        let (result_rx, result_tx) = channel().unwrap();
        let harness = Harness {
            control: control_rx.open("control channel").unwrap(),
            ring_end: Some(ring_end.open().unwrap()),
            result: result_rx.open("result channel").unwrap(),
        };
        (
            harness,
            control_tx.open("control channel").unwrap(),
            wait_end.open().unwrap(),
            result_tx.open("result channel").unwrap(),
        )
    }

    fn scheduler(slots: usize, authority: DestroyAuthority) -> Scheduler {
        Scheduler {
            slots,
            run: RunId::next(),
            authority,
            io_timeout: Duration::from_secs(5),
        }
    }

    async fn play_aggregator(harness: &mut Harness, values: &[Value]) -> SegmentName {
        let name = harness.control.read_segment_name().await.unwrap();
        let mut segment = SharedSegment::attach(&name, values.len()).unwrap();
        segment.write_all(values).unwrap();
        segment.detach().unwrap();
        harness.ring_end.take().unwrap().ring().unwrap();
        name
    }

    #[tokio::test]
    async fn test_reads_after_doorbell_and_reports_sorted() {
        let sched = scheduler(4, DestroyAuthority::Orchestrator);
        let (mut harness, c, d, r) = wire();

        let values = [Value(7), Value(2), Value(19), Value(2)];
        let (sorted, name) = tokio::join!(
            sched.run(c, d, r),
            play_aggregator(&mut harness, &values)
        );
        let sorted = sorted.unwrap();
        assert_eq!(sorted, vec![Value(2), Value(2), Value(7), Value(19)]);
        assert_eq!(harness.result.read_values(4).await.unwrap(), sorted);

        // Orchestrator authority: the name outlives the scheduler.
        destroy(&name).unwrap();
    }

    #[tokio::test]
    async fn test_scheduler_authority_destroys_after_detach() {
        let sched = scheduler(1, DestroyAuthority::Scheduler);
        let (mut harness, c, d, r) = wire();

        let (sorted, name) = tokio::join!(
            sched.run(c, d, r),
            play_aggregator(&mut harness, &[Value(0)])
        );
        assert_eq!(sorted.unwrap(), vec![Value(0)]);
        assert!(matches!(destroy(&name), Err(Error::DoubleDestroy { .. })));
    }

    #[tokio::test]
    async fn test_closed_doorbell_is_peer_closed() {
        let sched = scheduler(2, DestroyAuthority::Scheduler);
        let (mut harness, c, d, r) = wire();

        let abandon = async {
            let name = harness.control.read_segment_name().await.unwrap();
            harness.ring_end = None;
            name
        };
        let (outcome, name) = tokio::join!(sched.run(c, d, r), abandon);
        let err = outcome.unwrap_err();
        assert!(matches!(
            err,
            Error::Role {
                role: Role::Scheduler,
                phase: Phase::AwaitPopulated,
                ..
            }
        ));
        assert!(matches!(err.root(), Error::PeerClosed { .. }));
        // Nothing was written, so the scheduler cleaned up after itself.
        assert!(matches!(
            SharedSegment::attach(&name, 2),
            Err(Error::SegmentNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_doorbell_timeout_leaves_segment() {
        let sched = Scheduler {
            io_timeout: Duration::from_millis(100),
            ..scheduler(1, DestroyAuthority::Scheduler)
        };
        let (harness, c, d, r) = wire();

        let err = sched.run(c, d, r).await.unwrap_err();
        assert!(matches!(err.root(), Error::Timeout { .. }));

        let name = harness.control.read_segment_name().await.unwrap();
        destroy(&name).unwrap();
    }
}
