//! Roles that die are reported as child process failures, not as the
//! channel symptoms they leave behind.
//!
//! Both cases live in one test: the fake role script is written and then
//! executed, and a concurrent fork in a sibling test thread could hold it
//! open and make exec fail with ETXTBSY.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tiersort::{Error, Orchestrator, PipelineConfig, SegmentName};
use tiersort_core::{Role, RunId};
use tiersort_testkit::assert_destroyed;

const BIN: &str = env!("CARGO_BIN_EXE_tiersort");

/// A launcher that exits with `code` for one role and runs the real binary
/// for every other.
fn failing_role(dir: &Path, role: &str, code: i32) -> PathBuf {
    let path = dir.join(format!("fail-{role}"));
    let script = format!(
        "#!/bin/sh\nif [ \"$1\" = {role} ]; then exit {code}; fi\nexec '{BIN}' \"$@\"\n"
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn config() -> PipelineConfig {
    PipelineConfig {
        io_timeout: Duration::from_secs(10),
        ..PipelineConfig::fixed([4, 8, 15])
    }
}

#[tokio::test]
async fn dead_roles_are_reported_by_exit_status() {
    let dir = tempfile::tempdir().unwrap();

    let scheduler = failing_role(dir.path(), "scheduler", 3);
    let run = RunId::next();
    let err = Orchestrator::new(config(), &scheduler)
        .run_as(run)
        .await
        .unwrap_err();
    match err.root() {
        Error::ChildProcessFailed { role, code, .. } => {
            assert_eq!(*role, Role::Scheduler);
            assert_eq!(*code, Some(3));
        }
        other => panic!("expected scheduler failure, got {other}"),
    }
    assert_eq!(err.exit_code(), 8);
    assert_destroyed(&SegmentName::for_run(run)).unwrap();

    // The scheduler did create and publish this one; the orchestrator must
    // recover its name and unlink it.
    let worker = failing_role(dir.path(), "worker", 4);
    let run = RunId::next();
    let err = Orchestrator::new(config(), &worker)
        .run_as(run)
        .await
        .unwrap_err();
    match err.root() {
        Error::ChildProcessFailed { role, code, .. } => {
            assert_eq!(*role, Role::Worker(0));
            assert_eq!(*code, Some(4));
        }
        other => panic!("expected worker failure, got {other}"),
    }
    assert_destroyed(&SegmentName::for_run(run)).unwrap();
}
