//! Aggregator role: collect worker values and hand them to the scheduler.
//!
//! The aggregator runs inside the orchestrator process. It owns the
//! orchestrator's view of the [`Handoff`] ledger, which the orchestrator
//! keeps updating after the scheduler exits.

use std::time::Duration;

use tracing::{debug, info, warn};

use tiersort_core::{
    Error, Handoff, HandoffStep, Phase, PipelineConfig, Result, Role, SegmentName, Value,
};
use tiersort_transport::{bounded, ChannelReader, Doorbell, SharedSegment};

fn tagged(phase: Phase) -> impl FnOnce(Error) -> Error {
    move |e| e.during(Role::Aggregator, phase)
}

pub struct Aggregator {
    io_timeout: Duration,
    control_read_delay: Option<Duration>,
    handoff: Handoff,
}

impl Aggregator {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            io_timeout: config.io_timeout,
            control_read_delay: config.control_read_delay,
            handoff: Handoff::new(),
        }
    }

    pub fn handoff(&self) -> &Handoff {
        &self.handoff
    }

    pub fn handoff_mut(&mut self) -> &mut Handoff {
        &mut self.handoff
    }

    /// Read one value from each worker channel, slot `i` from worker `i`.
    pub async fn collect(&self, readers: &[ChannelReader]) -> Result<Vec<Value>> {
        let mut values = Vec::with_capacity(readers.len());
        for (worker, reader) in readers.iter().enumerate() {
            let value = bounded(self.io_timeout, "worker value", reader.read_value())
                .await
                .map_err(tagged(Phase::Collect { worker }))?;
            debug!(worker, %value, "received value");
            values.push(value);
        }
        info!(?values, "collected worker values");
        Ok(values)
    }

    /// Wait for the scheduler to publish the segment name.
    ///
    /// The read blocks on the control channel itself, so a scheduler that
    /// publishes late (or an aggregator that reads late) still meets.
    pub async fn receive_name(&mut self, control: &ChannelReader) -> Result<SegmentName> {
        if let Some(delay) = self.control_read_delay {
            info!(?delay, "delaying control read");
            tokio::time::sleep(delay).await;
        }
        let name = bounded(self.io_timeout, "segment name", control.read_segment_name())
            .await
            .map_err(tagged(Phase::ReceiveName))?;
        self.record_published().map_err(tagged(Phase::ReceiveName))?;
        info!(segment = %name, "received segment name");
        Ok(name)
    }

    /// Best-effort name read after a failure, so the segment can still be
    /// cleaned up.
    pub async fn recover_name(&mut self, control: &ChannelReader) -> Option<SegmentName> {
        match bounded(self.io_timeout, "segment name", control.read_segment_name()).await {
            Ok(name) => {
                if let Err(e) = self.record_published() {
                    warn!(error = %e, "ledger rejected recovered segment name");
                }
                debug!(segment = %name, "recovered segment name for cleanup");
                Some(name)
            }
            Err(e) => {
                debug!(error = %e, "no segment name to recover");
                None
            }
        }
    }

    fn record_published(&mut self) -> Result<()> {
        self.handoff.record(HandoffStep::Create)?;
        self.handoff.record(HandoffStep::Publish)?;
        Ok(())
    }

    /// Attach, write every slot, detach.
    ///
    /// The mapping is gone when this returns, whether or not it succeeded.
    pub fn populate(&mut self, name: &SegmentName, values: &[Value]) -> Result<()> {
        let mut segment =
            SharedSegment::attach(name, values.len()).map_err(tagged(Phase::Attach))?;
        self.handoff
            .record(HandoffStep::Attach)
            .map_err(|e| tagged(Phase::Attach)(e.into()))?;

        if let Err(e) = segment.write_all(values) {
            drop(segment);
            self.handoff.release(Role::Aggregator)?;
            return Err(e.during(Role::Aggregator, Phase::Populate));
        }
        self.handoff
            .record(HandoffStep::Populate)
            .map_err(|e| tagged(Phase::Populate)(e.into()))?;

        let detached = segment.detach();
        self.handoff
            .release(Role::Aggregator)
            .map_err(|e| tagged(Phase::Detach)(e.into()))?;
        detached.map_err(tagged(Phase::Detach))?;

        debug!(segment = %name, slots = values.len(), "populated and detached");
        Ok(())
    }

    /// Ring the completion doorbell and close it.
    pub fn signal(&self, doorbell: Doorbell) -> Result<()> {
        doorbell.ring().map_err(tagged(Phase::Signal))?;
        info!("signalled scheduler");
        Ok(())
    }
}
