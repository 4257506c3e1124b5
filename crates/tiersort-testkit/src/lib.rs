//! tiersort-testkit: end-to-end scenarios for the tiersort pipeline.
//!
//! Each scenario runs a full pipeline (real processes, real shared memory)
//! from the given `tiersort` binary and checks the outcome.
//!
//! # Usage
//!
//! Integration tests of the binary crate point the scenarios at the built
//! executable:
//!
//! ```ignore
//! const BIN: &str = env!("CARGO_BIN_EXE_tiersort");
//!
//! #[tokio::test]
//! async fn fixed_values_are_sorted() {
//!     tiersort_testkit::run_fixed_values_sorted(BIN).await;
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use tiersort::{Orchestrator, PipelineOutcome};
use tiersort_core::{
    DestroyAuthority, Error, Fault, Phase, PipelineConfig, Role, RunId, SegmentName, Value,
    VALUE_BOUND,
};
use tiersort_transport::{destroy, SharedSegment};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// The pipeline failed where it should have succeeded.
    Pipeline(Error),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Pipeline(e) => write!(f, "pipeline error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<Error> for TestError {
    fn from(e: Error) -> Self {
        TestError::Pipeline(e)
    }
}

/// Per-scenario deadline for blocking reads, well under the test harness
/// timeout.
const SCENARIO_IO_TIMEOUT: Duration = Duration::from_secs(20);

fn config(base: PipelineConfig) -> PipelineConfig {
    PipelineConfig {
        io_timeout: SCENARIO_IO_TIMEOUT,
        ..base
    }
}

async fn run(program: &Path, config: PipelineConfig) -> Result<PipelineOutcome, Error> {
    Orchestrator::new(config, program).run().await
}

fn values(raw: &[u32]) -> Vec<Value> {
    raw.iter().copied().map(Value).collect()
}

/// Check that `sorted` is non-decreasing and holds exactly the values of
/// `collected`.
pub fn assert_sorted_permutation(collected: &[Value], sorted: &[Value]) -> Result<(), TestError> {
    if let Some(pair) = sorted.windows(2).find(|w| w[0] > w[1]) {
        return Err(TestError::Assertion(format!(
            "result is not sorted: {} before {} in {:?}",
            pair[0], pair[1], sorted
        )));
    }
    let mut expected = collected.to_vec();
    expected.sort();
    if expected != sorted {
        return Err(TestError::Assertion(format!(
            "result {:?} is not a permutation of {:?}",
            sorted, collected
        )));
    }
    Ok(())
}

/// Check that the segment name is gone and a second destroy is flagged.
///
/// Also holds for a segment that was never created, which is what a
/// failed run must leave behind either way.
pub fn assert_destroyed(name: &SegmentName) -> Result<(), TestError> {
    match SharedSegment::attach(name, 1) {
        Err(Error::SegmentNotFound { .. }) => {}
        Ok(_) => {
            return Err(TestError::Assertion(format!(
                "segment {} still exists after the run",
                name
            )))
        }
        Err(e) => {
            return Err(TestError::Assertion(format!(
                "unexpected error probing {}: {}",
                name, e
            )))
        }
    }
    match destroy(name) {
        Err(Error::DoubleDestroy { .. }) => Ok(()),
        other => Err(TestError::Assertion(format!(
            "second destroy of {} should be flagged, got {:?}",
            name, other
        ))),
    }
}

// ============================================================================
// Scenarios
// ============================================================================

/// Four workers with fixed values `[7, 2, 19, 2]` sort to `[2, 2, 7, 19]`.
pub async fn run_fixed_values_sorted(program: impl AsRef<Path>) {
    if let Err(e) = run_fixed_values_sorted_inner(program.as_ref()).await {
        panic!("run_fixed_values_sorted failed: {}", e);
    }
}

async fn run_fixed_values_sorted_inner(program: &Path) -> Result<(), TestError> {
    let outcome = run(program, config(PipelineConfig::fixed([7, 2, 19, 2]))).await?;

    if outcome.collected != values(&[7, 2, 19, 2]) {
        return Err(TestError::Assertion(format!(
            "slot i must hold worker i's value, got {:?}",
            outcome.collected
        )));
    }
    if outcome.sorted != values(&[2, 2, 7, 19]) {
        return Err(TestError::Assertion(format!(
            "expected [2, 2, 7, 19], got {:?}",
            outcome.sorted
        )));
    }
    assert_destroyed(&outcome.segment)
}

/// A single worker sending 0 yields `[0]`, and the segment is destroyed
/// exactly once.
pub async fn run_single_worker(program: impl AsRef<Path>) {
    if let Err(e) = run_single_worker_inner(program.as_ref()).await {
        panic!("run_single_worker failed: {}", e);
    }
}

async fn run_single_worker_inner(program: &Path) -> Result<(), TestError> {
    let outcome = run(program, config(PipelineConfig::fixed([0]))).await?;
    if outcome.sorted != values(&[0]) {
        return Err(TestError::Assertion(format!(
            "expected [0], got {:?}",
            outcome.sorted
        )));
    }
    if outcome.destroyed_by != DestroyAuthority::Orchestrator {
        return Err(TestError::Assertion(format!(
            "expected the orchestrator to destroy, got {:?}",
            outcome.destroyed_by
        )));
    }
    assert_destroyed(&outcome.segment)
}

/// Random values from `workers` workers come back as a sorted permutation.
pub async fn run_random_permutation(program: impl AsRef<Path>, workers: usize) {
    if let Err(e) = run_random_permutation_inner(program.as_ref(), workers).await {
        panic!("run_random_permutation({}) failed: {}", workers, e);
    }
}

async fn run_random_permutation_inner(program: &Path, workers: usize) -> Result<(), TestError> {
    let outcome = run(program, config(PipelineConfig::with_workers(workers))).await?;

    if outcome.collected.len() != workers {
        return Err(TestError::Assertion(format!(
            "expected {} values, got {}",
            workers,
            outcome.collected.len()
        )));
    }
    if let Some(v) = outcome.collected.iter().find(|v| v.0 >= VALUE_BOUND) {
        return Err(TestError::Assertion(format!(
            "value {} is outside [0, {})",
            v, VALUE_BOUND
        )));
    }
    assert_sorted_permutation(&outcome.collected, &outcome.sorted)?;
    assert_destroyed(&outcome.segment)
}

/// The aggregator reads the control channel late; the scheduler's publish
/// still reaches it and the run completes.
pub async fn run_delayed_control_read(program: impl AsRef<Path>, delay: Duration) {
    if let Err(e) = run_delayed_control_read_inner(program.as_ref(), delay).await {
        panic!("run_delayed_control_read({:?}) failed: {}", delay, e);
    }
}

async fn run_delayed_control_read_inner(program: &Path, delay: Duration) -> Result<(), TestError> {
    let config = PipelineConfig {
        control_read_delay: Some(delay),
        ..config(PipelineConfig::fixed([3, 1, 2]))
    };
    let outcome = run(program, config).await?;
    if outcome.sorted != values(&[1, 2, 3]) {
        return Err(TestError::Assertion(format!(
            "expected [1, 2, 3], got {:?}",
            outcome.sorted
        )));
    }
    assert_destroyed(&outcome.segment)
}

/// With scheduler authority the scheduler unlinks the segment itself.
pub async fn run_scheduler_destroys(program: impl AsRef<Path>) {
    if let Err(e) = run_scheduler_destroys_inner(program.as_ref()).await {
        panic!("run_scheduler_destroys failed: {}", e);
    }
}

async fn run_scheduler_destroys_inner(program: &Path) -> Result<(), TestError> {
    let config = PipelineConfig {
        destroy_authority: DestroyAuthority::Scheduler,
        ..config(PipelineConfig::fixed([9, 4]))
    };
    let outcome = run(program, config).await?;
    if outcome.sorted != values(&[4, 9]) {
        return Err(TestError::Assertion(format!(
            "expected [4, 9], got {:?}",
            outcome.sorted
        )));
    }
    if outcome.destroyed_by != DestroyAuthority::Scheduler {
        return Err(TestError::Assertion(format!(
            "expected the scheduler to destroy, got {:?}",
            outcome.destroyed_by
        )));
    }
    assert_destroyed(&outcome.segment)
}

/// A worker that closes after 2 of 4 bytes fails the run with a truncated
/// message attributed to that worker's slot. The segment the scheduler
/// created is still destroyed.
pub async fn run_truncated_worker(program: impl AsRef<Path>) {
    if let Err(e) = run_truncated_worker_inner(program.as_ref()).await {
        panic!("run_truncated_worker failed: {}", e);
    }
}

async fn run_truncated_worker_inner(program: &Path) -> Result<(), TestError> {
    let config = PipelineConfig {
        fault: Some(Fault::ShortWrite {
            worker: 1,
            bytes: 2,
        }),
        ..config(PipelineConfig::fixed([5, 6, 7]))
    };
    let run_id = RunId::next();
    let err = match Orchestrator::new(config, program).run_as(run_id).await {
        Ok(outcome) => {
            return Err(TestError::Assertion(format!(
                "run should fail, got {:?}",
                outcome.sorted
            )))
        }
        Err(e) => e,
    };

    if !matches!(
        err,
        Error::Role {
            role: Role::Aggregator,
            phase: Phase::Collect { worker: 1 },
            ..
        }
    ) {
        return Err(TestError::Assertion(format!(
            "expected a collect failure on worker 1, got: {}",
            err
        )));
    }
    if !matches!(
        err.root(),
        Error::TruncatedMessage {
            expected: 4,
            got: 2,
        }
    ) {
        return Err(TestError::Assertion(format!(
            "expected a 2-byte truncation, got: {}",
            err.root()
        )));
    }
    assert_destroyed(&SegmentName::for_run(run_id))
}
