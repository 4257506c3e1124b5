//! Orchestrator: wire the channels, start the roles, run the aggregator,
//! join the scheduler, destroy the segment.
//!
//! # Ordering
//!
//! 1. Every channel, the doorbell, and the result pipe exist before the
//!    first process is started.
//! 2. Workers are started first, then the scheduler.
//! 3. The aggregator collects, joins the workers, receives the name,
//!    populates, and rings the doorbell.
//! 4. The scheduler is joined by handle, then the segment is destroyed
//!    (orchestrator authority) exactly once.
//!
//! On failure the doorbell is dropped unrung, the scheduler is joined (or
//! killed after the I/O timeout), and the segment is still destroyed if its
//! name was ever published. The first error is returned, tagged with the
//! role and phase it came from.

use std::io;
use std::path::PathBuf;

use tracing::{debug, info, info_span, warn, Instrument};

use tiersort_core::{
    DestroyAuthority, Error, HandoffStep, Phase, PipelineConfig, Result, Role, RunId,
    SegmentName, Value,
};
use tiersort_spawn::{ExitReport, RoleChild, RoleCommand};
use tiersort_transport::{
    bounded, channel, destroy, ChannelReader, Doorbell, DoorbellHandle, WriteHandle,
};

use crate::aggregator::Aggregator;

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub run: RunId,
    pub segment: SegmentName,
    /// Values in worker order, as the aggregator received them.
    pub collected: Vec<Value>,
    /// The scheduler's sorted read-back.
    pub sorted: Vec<Value>,
    pub destroyed_by: DestroyAuthority,
}

pub struct Orchestrator {
    config: PipelineConfig,
    program: PathBuf,
}

impl Orchestrator {
    /// `program` is the `tiersort` binary the roles are started from.
    pub fn new(config: PipelineConfig, program: impl Into<PathBuf>) -> Self {
        Self {
            config,
            program: program.into(),
        }
    }

    /// Start roles from the currently running executable.
    pub fn from_current_exe(config: PipelineConfig) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(Error::io("locate tiersort binary"))
            .map_err(|e| e.during(Role::Orchestrator, Phase::Configure))?;
        Ok(Self::new(config, program))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run(&self) -> Result<PipelineOutcome> {
        self.run_as(RunId::next()).await
    }

    /// Run under a caller-chosen id, so the segment name is known up front
    /// even when the run fails.
    pub async fn run_as(&self, run: RunId) -> Result<PipelineOutcome> {
        self.config
            .validate()
            .map_err(|e| e.during(Role::Orchestrator, Phase::Configure))?;
        let span = info_span!("pipeline", %run, workers = self.config.workers);
        self.run_inner(run).instrument(span).await
    }

    async fn run_inner(&self, run: RunId) -> Result<PipelineOutcome> {
        let n = self.config.workers;
        let setup = |e: io::Error| {
            Error::Io {
                context: "create channels",
                source: e,
            }
            .during(Role::Orchestrator, Phase::Spawn)
        };

        let mut data_readers = Vec::with_capacity(n);
        let mut data_writers = Vec::with_capacity(n);
        for _ in 0..n {
            let (r, w) = channel().map_err(setup)?;
            data_readers.push(r);
            data_writers.push(w);
        }
        let (control_rx, control_tx) = channel().map_err(setup)?;
        let (bell_aggregator, bell_scheduler) = Doorbell::pair().map_err(setup)?;
        let (result_rx, result_tx) = channel().map_err(setup)?;
        debug!(channels = n + 3, "channels created");

        let mut workers = Vec::with_capacity(n);
        for (index, writer) in data_writers.into_iter().enumerate() {
            let child = self
                .worker_command(index, writer)
                .spawn()
                .map_err(Error::io("spawn"))
                .map_err(|e| e.during(Role::Worker(index), Phase::Spawn))?;
            workers.push(child);
        }
        let mut scheduler = self
            .scheduler_command(run, control_tx, bell_scheduler, result_tx)
            .spawn()
            .map_err(Error::io("spawn"))
            .map_err(|e| e.during(Role::Scheduler, Phase::Spawn))?;
        info!(scheduler_pid = scheduler.id(), "roles started");

        let register = |e: io::Error| {
            Error::Io {
                context: "register channel",
                source: e,
            }
            .during(Role::Orchestrator, Phase::Spawn)
        };
        let readers = data_readers
            .into_iter()
            .map(|h| h.open("worker channel"))
            .collect::<io::Result<Vec<_>>>()
            .map_err(register)?;
        let control = control_rx.open("control channel").map_err(register)?;
        let doorbell = bell_aggregator.open().map_err(register)?;
        let result = result_rx.open("result channel").map_err(register)?;

        let mut aggregator = Aggregator::new(&self.config);
        let mut name = None;
        let aggregated = self
            .aggregate(
                &mut aggregator,
                &readers,
                &mut workers,
                &control,
                doorbell,
                &mut name,
            )
            .await;
        drop(readers);

        let sorted = match &aggregated {
            Ok(_) => bounded(self.config.io_timeout, "scheduler result", result.read_values(n))
                .await
                .map_err(|e| e.during(Role::Orchestrator, Phase::Report)),
            Err(e) => {
                warn!(error = %e, "aggregation failed, aborting run");
                if name.is_none() {
                    name = aggregator.recover_name(&control).await;
                }
                Ok(Vec::new())
            }
        };
        drop(result);
        drop(control);

        let exit = self.join(&mut scheduler, Role::Scheduler).await;
        // Whatever happened, the scheduler process and its mapping are gone.
        if aggregator.handoff().holders().contains(&Role::Scheduler) {
            aggregator.handoff_mut().release(Role::Scheduler)?;
        }

        let settled = self
            .settle(aggregated, sorted, exit, &mut workers)
            .await
            .and_then(|values| {
                aggregator
                    .handoff_mut()
                    .record(HandoffStep::Read)
                    .map_err(|e| Error::from(e).during(Role::Orchestrator, Phase::Join))?;
                Ok(values)
            });

        let destroyed = match (self.config.destroy_authority, &name) {
            (DestroyAuthority::Orchestrator, Some(name)) => self.destroy(&mut aggregator, name),
            (DestroyAuthority::Orchestrator, None) => {
                warn!(
                    expected = %SegmentName::for_run(run),
                    "segment name was never received, nothing to destroy"
                );
                Ok(())
            }
            (DestroyAuthority::Scheduler, _) => Ok(()),
        };

        let (collected, sorted) = settled?;
        destroyed?;

        let segment = name.unwrap_or_else(|| SegmentName::for_run(run));
        info!(segment = %segment, ?sorted, "run complete");
        Ok(PipelineOutcome {
            run,
            segment,
            collected,
            sorted,
            destroyed_by: self.config.destroy_authority,
        })
    }

    /// The aggregator's half of the run, inside this process.
    ///
    /// Takes the doorbell by value: on any early return it is dropped
    /// unrung, which the scheduler sees as an abandoned handoff.
    async fn aggregate(
        &self,
        aggregator: &mut Aggregator,
        readers: &[ChannelReader],
        workers: &mut [RoleChild],
        control: &ChannelReader,
        doorbell: Doorbell,
        name: &mut Option<SegmentName>,
    ) -> Result<Vec<Value>> {
        let collected = aggregator.collect(readers).await?;
        self.join_workers(workers).await?;

        let received = aggregator.receive_name(control).await?;
        *name = Some(received.clone());

        aggregator.populate(&received, &collected)?;
        aggregator.signal(doorbell)?;
        Ok(collected)
    }

    /// Join workers in index order. Any non-zero exit aborts the run.
    async fn join_workers(&self, workers: &mut [RoleChild]) -> Result<()> {
        for (index, child) in workers.iter_mut().enumerate() {
            let role = Role::Worker(index);
            let report = self.join(child, role).await?;
            if !report.success() {
                return Err(child_failed(role, report));
            }
        }
        debug!(workers = workers.len(), "workers joined");
        Ok(())
    }

    async fn join(&self, child: &mut RoleChild, role: Role) -> Result<ExitReport> {
        let timeout = self.config.io_timeout;
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(report) => {
                let report = report
                    .map_err(Error::io("wait for role"))
                    .map_err(|e| e.during(Role::Orchestrator, Phase::Join))?;
                debug!(%role, %report, "role exited");
                Ok(report)
            }
            Err(_) => {
                warn!(%role, ?timeout, "role did not exit in time");
                if let Err(e) = child.terminate().await {
                    warn!(%role, error = %e, "could not kill role");
                }
                Err(Error::Timeout {
                    what: "role exit",
                    waited: timeout,
                }
                .during(Role::Orchestrator, Phase::Join))
            }
        }
    }

    /// Pick the error to report, or the values if everything succeeded.
    ///
    /// An aggregation failure wins over everything else. A clean handoff
    /// still fails if the scheduler exited non-zero.
    async fn settle(
        &self,
        aggregated: Result<Vec<Value>>,
        sorted: Result<Vec<Value>>,
        exit: Result<ExitReport>,
        workers: &mut [RoleChild],
    ) -> Result<(Vec<Value>, Vec<Value>)> {
        let collected = match aggregated {
            Ok(collected) => collected,
            Err(e) => return Err(self.attribute(e, workers, exit.ok()).await),
        };
        let report = exit?;
        if !report.success() {
            return Err(child_failed(Role::Scheduler, report));
        }
        Ok((collected, sorted?))
    }

    /// A channel that ended early is a symptom. If the process on the other
    /// end exited non-zero, report that instead.
    async fn attribute(
        &self,
        err: Error,
        workers: &mut [RoleChild],
        scheduler: Option<ExitReport>,
    ) -> Error {
        if !matches!(
            err.root(),
            Error::TruncatedMessage { .. } | Error::PeerClosed { .. }
        ) {
            return err;
        }

        let culprit = match &err {
            Error::Role {
                phase: Phase::Collect { worker },
                ..
            } => match workers.get_mut(*worker) {
                Some(child) => self
                    .join(child, Role::Worker(*worker))
                    .await
                    .ok()
                    .map(|report| (Role::Worker(*worker), report)),
                None => None,
            },
            Error::Role {
                phase: Phase::ReceiveName,
                ..
            } => scheduler.map(|report| (Role::Scheduler, report)),
            _ => None,
        };

        match culprit {
            Some((role, report)) if !report.success() => {
                debug!(symptom = %err, %role, "attributing failure to role exit");
                child_failed(role, report)
            }
            _ => err,
        }
    }

    fn destroy(&self, aggregator: &mut Aggregator, name: &SegmentName) -> Result<()> {
        aggregator
            .handoff_mut()
            .destroy()
            .map_err(|e| Error::from(e).during(Role::Orchestrator, Phase::Destroy))?;
        destroy(name).map_err(|e| e.during(Role::Orchestrator, Phase::Destroy))?;
        info!(segment = %name, "segment destroyed");
        Ok(())
    }

    fn worker_command(&self, index: usize, writer: WriteHandle) -> RoleCommand {
        let mut command = RoleCommand::new(&self.program, Role::Worker(index).to_string())
            .arg("worker")
            .arg("--index")
            .arg(index.to_string());
        if let Some(value) = self.config.values.for_worker(index) {
            command = command.arg("--value").arg(value.to_string());
        }
        if let Some(bytes) = self.config.short_write_for(index) {
            command = command.arg("--short-write").arg(bytes.to_string());
        }
        command.inherit("data-fd", writer)
    }

    fn scheduler_command(
        &self,
        run: RunId,
        control: WriteHandle,
        doorbell: DoorbellHandle,
        result: WriteHandle,
    ) -> RoleCommand {
        RoleCommand::new(&self.program, Role::Scheduler.to_string())
            .arg("scheduler")
            .arg("--slots")
            .arg(self.config.workers.to_string())
            .arg("--run-id")
            .arg(run.to_string())
            .arg("--destroy-authority")
            .arg(self.config.destroy_authority.to_string())
            .arg("--io-timeout-ms")
            .arg(self.config.io_timeout.as_millis().to_string())
            .inherit("control-fd", control)
            .inherit("doorbell-fd", doorbell)
            .inherit("result-fd", result)
    }
}

fn child_failed(role: Role, report: ExitReport) -> Error {
    Error::ChildProcessFailed {
        role,
        code: report.code,
        signal: report.signal,
    }
    .during(Role::Orchestrator, Phase::Join)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_config_spawns_nothing() {
        let orchestrator = Orchestrator::new(
            PipelineConfig::with_workers(0),
            "/nonexistent/tiersort",
        );
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err.root(), Error::InvalidConfig(_)));
        assert_eq!(err.exit_code(), 9);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let orchestrator = Orchestrator::new(
            PipelineConfig::with_workers(2),
            "/nonexistent/tiersort",
        );
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Role {
                role: Role::Worker(0),
                phase: Phase::Spawn,
                ..
            }
        ));
    }

    #[test]
    fn test_child_failure_is_reported_from_join() {
        let failed = child_failed(
            Role::Scheduler,
            ExitReport {
                code: Some(3),
                signal: None,
            },
        );
        assert_eq!(failed.exit_code(), 8);
        assert_eq!(
            failed.to_string(),
            "orchestrator failed during join: scheduler exited with status 3 (segment not found)"
        );
    }
}
