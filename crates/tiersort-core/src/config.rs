//! Pipeline configuration.
//!
//! The config is built once by the orchestrator and threaded to each role
//! explicitly (role processes receive their slice of it as arguments).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::value::{Value, VALUE_BOUND, VALUE_WIDTH};

/// Worker count when none is given.
pub const DEFAULT_WORKERS: usize = 4;

/// Upper bound on workers; each one costs a pipe and a process.
pub const MAX_WORKERS: usize = 256;

/// Bound on every blocking read, wait and join.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Which role unlinks the shared segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestroyAuthority {
    /// The orchestrator unlinks after joining the scheduler.
    #[default]
    Orchestrator,
    /// The scheduler unlinks after its own detach.
    Scheduler,
}

impl fmt::Display for DestroyAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestroyAuthority::Orchestrator => f.write_str("orchestrator"),
            DestroyAuthority::Scheduler => f.write_str("scheduler"),
        }
    }
}

impl FromStr for DestroyAuthority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "orchestrator" => Ok(DestroyAuthority::Orchestrator),
            "scheduler" => Ok(DestroyAuthority::Scheduler),
            other => Err(Error::InvalidConfig(format!(
                "unknown destroy authority {other:?} (expected orchestrator or scheduler)"
            ))),
        }
    }
}

/// Where worker values come from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ValuePlan {
    /// Each worker draws from `[0, VALUE_BOUND)`.
    #[default]
    Random,
    /// Worker `i` emits element `i`.
    Fixed(Vec<Value>),
}

impl ValuePlan {
    /// The preassigned value for a worker, if any.
    pub fn for_worker(&self, index: usize) -> Option<Value> {
        match self {
            ValuePlan::Random => None,
            ValuePlan::Fixed(values) => values.get(index).copied(),
        }
    }
}

/// Injected failures for exercising the error paths end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Worker `worker` writes only `bytes` bytes of its frame, then closes.
    ShortWrite { worker: usize, bytes: usize },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workers: usize,
    pub io_timeout: Duration,
    pub destroy_authority: DestroyAuthority,
    pub values: ValuePlan,
    /// Delay the aggregator's control read (race testing).
    pub control_read_delay: Option<Duration>,
    pub fault: Option<Fault>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            io_timeout: DEFAULT_IO_TIMEOUT,
            destroy_authority: DestroyAuthority::default(),
            values: ValuePlan::Random,
            control_read_delay: None,
            fault: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers,
            ..Self::default()
        }
    }

    /// A deterministic run: one worker per value.
    pub fn fixed(values: impl IntoIterator<Item = u32>) -> Self {
        let values: Vec<Value> = values.into_iter().map(Value).collect();
        Self {
            workers: values.len(),
            values: ValuePlan::Fixed(values),
            ..Self::default()
        }
    }

    /// Bytes worker `index` should write before closing, if it is faulted.
    pub fn short_write_for(&self, index: usize) -> Option<usize> {
        match self.fault {
            Some(Fault::ShortWrite { worker, bytes }) if worker == index => Some(bytes),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(Error::InvalidConfig(msg));

        if self.workers == 0 || self.workers > MAX_WORKERS {
            return invalid(format!(
                "worker count {} is outside 1..={MAX_WORKERS}",
                self.workers
            ));
        }
        if self.io_timeout.is_zero() {
            return invalid("io timeout must be non-zero".into());
        }
        if let ValuePlan::Fixed(values) = &self.values {
            if values.len() != self.workers {
                return invalid(format!(
                    "{} fixed values for {} workers",
                    values.len(),
                    self.workers
                ));
            }
            if let Some(v) = values.iter().find(|v| v.0 >= VALUE_BOUND) {
                return invalid(format!("fixed value {v} is outside [0, {VALUE_BOUND})"));
            }
        }
        if let Some(delay) = self.control_read_delay {
            if delay >= self.io_timeout {
                return invalid(format!(
                    "control read delay {delay:?} must be shorter than the io timeout {:?}",
                    self.io_timeout
                ));
            }
        }
        if let Some(Fault::ShortWrite { worker, bytes }) = self.fault {
            if worker >= self.workers {
                return invalid(format!("short write targets missing worker {worker}"));
            }
            if bytes >= VALUE_WIDTH {
                return invalid(format!("short write of {bytes} bytes is not short"));
            }
        }
        Ok(())
    }
}
