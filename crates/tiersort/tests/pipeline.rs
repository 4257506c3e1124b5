//! End-to-end runs of the whole pipeline against the built binary.

use std::time::Duration;

const BIN: &str = env!("CARGO_BIN_EXE_tiersort");

#[tokio::test]
async fn fixed_values_are_sorted() {
    tiersort_testkit::run_fixed_values_sorted(BIN).await;
}

#[tokio::test]
async fn single_worker_destroys_once() {
    tiersort_testkit::run_single_worker(BIN).await;
}

#[tokio::test]
async fn random_values_form_sorted_permutation() {
    for workers in [1, 2, 3, 4, 8, 16] {
        tiersort_testkit::run_random_permutation(BIN, workers).await;
    }
}

#[tokio::test]
async fn late_control_read_still_completes() {
    tiersort_testkit::run_delayed_control_read(BIN, Duration::from_secs(3)).await;
}

#[tokio::test]
async fn scheduler_can_own_destruction() {
    tiersort_testkit::run_scheduler_destroys(BIN).await;
}

#[tokio::test]
async fn truncated_worker_fails_the_run() {
    tiersort_testkit::run_truncated_worker(BIN).await;
}
