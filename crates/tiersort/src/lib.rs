//! tiersort: a three-tier process pipeline.
//!
//! Worker processes each produce one value and send it over a pipe. The
//! aggregator, running inside the orchestrator, collects them and writes
//! them into a POSIX shared memory segment created by the scheduler
//! process. The scheduler reads them back once the aggregator signals, and
//! reports them sorted.
//!
//! ```text
//!                  ┌───────────── orchestrator ─────────────┐
//!  worker 0 ──┐    │                                        │
//!  worker 1 ──┼──> │  aggregator ── shm segment ──> scheduler ──> result
//!  worker N ──┘    │                                        │
//!                  └────────────────────────────────────────┘
//! ```
//!
//! Every role except the aggregator is a separate process started from the
//! `tiersort` binary (see [`cli`]). The library entry point is
//! [`Orchestrator::run`].

pub mod aggregator;
pub mod cli;
pub mod logging;
pub mod orchestrator;
pub mod scheduler;
pub mod worker;

pub use aggregator::Aggregator;
pub use orchestrator::{Orchestrator, PipelineOutcome};
pub use scheduler::Scheduler;
pub use worker::{ValueSource, Worker};

pub use tiersort_core::{
    DestroyAuthority, Error, Fault, PipelineConfig, Result, SegmentName, Value, ValuePlan,
};
