//! Command line: the public pipeline command and the hidden role entry
//! points the orchestrator re-executes itself with.

use std::io;
use std::os::unix::io::{OwnedFd, RawFd};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{info_span, Instrument};

use tiersort_core::{
    DestroyAuthority, Error, Fault, Phase, PipelineConfig, Result, Role, RunId, Value, ValuePlan,
    DEFAULT_WORKERS,
};
use tiersort_spawn::inherited_fd;
use tiersort_transport::{DoorbellHandle, WriteHandle};

use crate::orchestrator::{Orchestrator, PipelineOutcome};
use crate::scheduler::Scheduler;
use crate::worker::{ValueSource, Worker};

#[derive(Parser, Debug)]
#[command(name = "tiersort", version)]
#[command(about = "Sort worker-generated values through a shared memory handoff")]
pub struct Cli {
    #[command(subcommand)]
    pub role: Option<RoleSubcommand>,

    /// Number of worker processes
    #[arg(short = 'n', long, env = "TIERSORT_WORKERS", default_value_t = DEFAULT_WORKERS)]
    pub workers: usize,

    /// Which role unlinks the segment: orchestrator or scheduler
    #[arg(
        long,
        env = "TIERSORT_DESTROY_AUTHORITY",
        default_value = "orchestrator",
        hide = true
    )]
    pub destroy_authority: DestroyAuthority,

    /// Deadline for every blocking read and wait, in milliseconds
    #[arg(long, env = "TIERSORT_IO_TIMEOUT_MS", default_value_t = 30_000, hide = true)]
    pub io_timeout_ms: u64,

    /// Use these values instead of random ones (one worker per value)
    #[arg(long, value_delimiter = ',', hide = true)]
    pub fixed_values: Option<Vec<u32>>,

    /// Delay the aggregator's control read, in milliseconds
    #[arg(long, env = "TIERSORT_CONTROL_DELAY_MS", hide = true)]
    pub control_delay_ms: Option<u64>,

    /// Make this worker send a truncated frame (`WORKER:BYTES`)
    #[arg(long, value_parser = parse_short_write, hide = true)]
    pub short_write: Option<Fault>,
}

#[derive(Subcommand, Debug)]
pub enum RoleSubcommand {
    #[command(hide = true)]
    Worker(WorkerArgs),
    #[command(hide = true)]
    Scheduler(SchedulerArgs),
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[arg(long)]
    pub index: usize,
    #[arg(long)]
    pub value: Option<u32>,
    #[arg(long)]
    pub short_write: Option<usize>,
    #[arg(long)]
    pub data_fd: RawFd,
}

#[derive(Args, Debug)]
pub struct SchedulerArgs {
    #[arg(long)]
    pub slots: usize,
    #[arg(long)]
    pub run_id: RunId,
    #[arg(long, default_value = "orchestrator")]
    pub destroy_authority: DestroyAuthority,
    #[arg(long, default_value_t = 30_000)]
    pub io_timeout_ms: u64,
    #[arg(long)]
    pub control_fd: RawFd,
    #[arg(long)]
    pub doorbell_fd: RawFd,
    #[arg(long)]
    pub result_fd: RawFd,
}

fn parse_short_write(s: &str) -> std::result::Result<Fault, String> {
    let (worker, bytes) = s
        .split_once(':')
        .ok_or_else(|| format!("expected WORKER:BYTES, got {s:?}"))?;
    Ok(Fault::ShortWrite {
        worker: worker.parse().map_err(|e| format!("worker: {e}"))?,
        bytes: bytes.parse().map_err(|e| format!("bytes: {e}"))?,
    })
}

impl Cli {
    pub fn pipeline_config(&self) -> PipelineConfig {
        let (workers, values) = match &self.fixed_values {
            Some(values) => (
                values.len(),
                ValuePlan::Fixed(values.iter().copied().map(Value).collect()),
            ),
            None => (self.workers, ValuePlan::Random),
        };
        PipelineConfig {
            workers,
            io_timeout: Duration::from_millis(self.io_timeout_ms),
            destroy_authority: self.destroy_authority,
            values,
            control_read_delay: self.control_delay_ms.map(Duration::from_millis),
            fault: self.short_write,
        }
    }
}

pub async fn dispatch(cli: Cli) -> Result<()> {
    match cli.role {
        None => {
            let outcome = Orchestrator::from_current_exe(cli.pipeline_config())?
                .run()
                .await?;
            print_outcome(&outcome);
            Ok(())
        }
        Some(RoleSubcommand::Worker(args)) => {
            let span = info_span!("worker", index = args.index);
            run_worker(args).instrument(span).await
        }
        Some(RoleSubcommand::Scheduler(args)) => {
            let span = info_span!("scheduler", run = %args.run_id);
            run_scheduler(args).instrument(span).await
        }
    }
}

fn print_outcome(outcome: &PipelineOutcome) {
    let line = |values: &[Value]| {
        values
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" ")
    };
    println!("collected: {}", line(&outcome.collected));
    println!("sorted: {}", line(&outcome.sorted));
}

/// Take ownership of a descriptor passed by the orchestrator.
fn adopt(fd: RawFd, role: Role, what: &'static str) -> Result<OwnedFd> {
    // SAFETY: the orchestrator hands each descriptor to exactly one child
    // and names it on the command line; nothing else here owns it.
    unsafe { inherited_fd(fd) }
        .map_err(Error::io(what))
        .map_err(|e| e.during(role, Phase::Spawn))
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    let role = Role::Worker(args.index);
    let writer = WriteHandle::from(adopt(args.data_fd, role, "adopt data fd")?)
        .open("worker channel")
        .map_err(Error::io("register data fd"))
        .map_err(|e| e.during(role, Phase::Spawn))?;

    let source = match args.value {
        Some(v) => ValueSource::Fixed(Value(v)),
        None => ValueSource::Random,
    };
    let worker = Worker {
        index: args.index,
        source,
        short_write: args.short_write,
    };
    worker.run(writer).await?;
    Ok(())
}

async fn run_scheduler(args: SchedulerArgs) -> Result<()> {
    let role = Role::Scheduler;
    let register = |e: io::Error| {
        Error::io("register inherited fd")(e).during(role, Phase::Spawn)
    };

    let control = WriteHandle::from(adopt(args.control_fd, role, "adopt control fd")?)
        .open("control channel")
        .map_err(register)?;
    let doorbell = DoorbellHandle::from(adopt(args.doorbell_fd, role, "adopt doorbell fd")?)
        .open()
        .map_err(register)?;
    let result = WriteHandle::from(adopt(args.result_fd, role, "adopt result fd")?)
        .open("result channel")
        .map_err(register)?;

    let scheduler = Scheduler {
        slots: args.slots,
        run: args.run_id,
        authority: args.destroy_authority,
        io_timeout: Duration::from_millis(args.io_timeout_ms),
    };
    scheduler.run(control, doorbell, result).await?;
    Ok(())
}
