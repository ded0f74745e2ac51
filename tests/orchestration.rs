//! End-to-end tests of the generation loop against in-memory drivers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{fast_config, output_path, read_output, sorted_keys, tasks, QuotaDriver};
use session_relay::pipeline::{GenerationEnd, Orchestrator, RunStatus};
use session_relay::storage::read_summary;
use session_relay::{RunError, Task};
use tempfile::TempDir;

fn orchestrator(
    config: session_relay::RunConfig,
    driver: &Arc<QuotaDriver>,
) -> Orchestrator<QuotaDriver> {
    Orchestrator::with_shared_driver(config, Arc::clone(driver)).expect("valid config")
}

#[tokio::test]
async fn test_drains_queue_with_two_workers() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let driver = Arc::new(QuotaDriver::new());
    let config = fast_config(dir.path(), &["id-0"]).with_max_workers(2);

    let report = orchestrator(config, &driver)
        .run(tasks(&["a", "b", "c", "d", "e"]))
        .await
        .expect("run should succeed");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.completed, 5);
    assert_eq!(report.pending(), 0);
    assert_eq!(report.generations.len(), 1);
    assert_eq!(report.generations[0].cohort_size, 2);
    assert_eq!(report.generations[0].end, GenerationEnd::Drained);
    assert_eq!(
        sorted_keys(&output_path(dir.path())).await,
        vec!["a", "b", "c", "d", "e"]
    );
    assert_eq!(driver.total_calls(), 5);
    assert_eq!(driver.sessions_opened(), 2);
    assert_eq!(driver.sessions_closed(), 2);
}

#[tokio::test]
async fn test_cohort_is_sized_to_the_queue() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let driver = Arc::new(QuotaDriver::new());
    let config = fast_config(dir.path(), &["id-0"])
        .with_max_workers(10)
        .with_cohort_slack(1);

    let report = orchestrator(config, &driver)
        .run(tasks(&["a", "b"]))
        .await
        .expect("run should succeed");

    assert_eq!(report.generations[0].cohort_size, 3);
    assert_eq!(report.completed, 2);
}

#[tokio::test]
async fn test_retry_bound_leaves_output_empty() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let driver = Arc::new(QuotaDriver::new().with_flaky("a"));
    let config = fast_config(dir.path(), &["id-0"]);

    let report = orchestrator(config, &driver)
        .run(vec![Task::new("a", "x").with_max_retries(2)])
        .await
        .expect("run should succeed");

    assert_eq!(driver.attempts("a"), 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.completed, 0);
    assert_eq!(report.failed_task_ids, vec!["a"]);
    assert_eq!(report.pending(), 0);
    assert_eq!(report.status, RunStatus::Completed);
    assert!(read_output(&output_path(dir.path())).await.is_empty());
}

#[tokio::test]
async fn test_exhaustion_rotates_identity() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    // The first identity runs dry on the second task.
    let driver = Arc::new(QuotaDriver::new().with_quota("id-0", 1));
    let config = fast_config(dir.path(), &["id-0", "id-1"]).with_max_workers(1);

    let report = orchestrator(config, &driver)
        .run(tasks(&["a", "b", "c"]))
        .await
        .expect("run should succeed");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.identities_consumed(), 2);
    assert_eq!(report.generations[0].end, GenerationEnd::Exhausted);
    assert_eq!(report.generations[1].end, GenerationEnd::Drained);
    assert_eq!(sorted_keys(&output_path(dir.path())).await, vec!["a", "b", "c"]);

    let calls = driver.calls();
    assert_eq!(calls[0], ("id-0".to_string(), "a".to_string()));
    assert_eq!(calls[1], ("id-0".to_string(), "b".to_string()));
    assert!(calls[2..].iter().all(|(identity, _)| identity == "id-1"));
}

#[tokio::test]
async fn test_exhaustion_is_not_charged_to_the_task() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let driver = Arc::new(QuotaDriver::new().with_quota("id-0", 0));
    let config = fast_config(dir.path(), &["id-0", "id-1"]);

    // No retry budget at all: a charged attempt would fail the task.
    let report = orchestrator(config, &driver)
        .run(vec![Task::new("a", "x").with_max_retries(0)])
        .await
        .expect("run should succeed");

    assert_eq!(driver.attempts("a"), 2);
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(sorted_keys(&output_path(dir.path())).await, vec!["a"]);
}

#[tokio::test]
async fn test_partial_status_when_identities_run_out() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let driver = Arc::new(
        QuotaDriver::new()
            .with_quota("id-0", 1)
            .with_quota("id-1", 1),
    );
    let config = fast_config(dir.path(), &["id-0", "id-1"]).with_max_workers(1);

    let report = orchestrator(config, &driver)
        .run(tasks(&["a", "b", "c", "d"]))
        .await
        .expect("run should succeed");

    assert_eq!(report.status, RunStatus::IdentitiesExhausted);
    assert_eq!(report.completed, 2);
    assert_eq!(report.identities_consumed(), 2);

    let mut pending = report.pending_task_ids.clone();
    pending.sort();
    assert_eq!(pending, vec!["b", "d"]);
    assert_eq!(sorted_keys(&output_path(dir.path())).await, vec!["a", "c"]);

    let summary = read_summary(&dir.path().join("run_metrics.json"))
        .await
        .expect("summary should be written");
    assert_eq!(summary.status, RunStatus::IdentitiesExhausted);
    assert_eq!(summary.successful, 2);
    assert_eq!(summary.pending, 2);
    assert_eq!(summary.identities_consumed, 2);
}

#[tokio::test]
async fn test_resume_skips_recorded_tasks() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let input = tasks(&["a", "b", "c", "d"]);

    let first = Arc::new(QuotaDriver::new().with_quota("id-0", 2));
    let report = orchestrator(fast_config(dir.path(), &["id-0"]), &first)
        .run(input.clone())
        .await
        .expect("first run should succeed");
    assert_eq!(report.status, RunStatus::IdentitiesExhausted);
    assert_eq!(report.completed, 2);

    let second = Arc::new(QuotaDriver::new());
    let report = orchestrator(fast_config(dir.path(), &["id-1"]), &second)
        .run(input)
        .await
        .expect("second run should succeed");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.skipped, 2);
    assert_eq!(report.completed, 2);
    assert_eq!(second.total_calls(), 2);
    assert_eq!(
        sorted_keys(&output_path(dir.path())).await,
        vec!["a", "b", "c", "d"]
    );

    // A third run has nothing left to do.
    let third = Arc::new(QuotaDriver::new());
    let report = orchestrator(fast_config(dir.path(), &["id-2"]), &third)
        .run(tasks(&["a", "b", "c", "d"]))
        .await
        .expect("third run should succeed");
    assert_eq!(report.skipped, 4);
    assert_eq!(report.identities_consumed(), 0);
    assert_eq!(third.total_calls(), 0);
    assert_eq!(read_output(&output_path(dir.path())).await.len(), 4);
}

#[tokio::test]
async fn test_collapsed_cohort_moves_to_next_identity() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let driver = Arc::new(QuotaDriver::new().with_broken("dead"));
    let config = fast_config(dir.path(), &["dead", "live"]).with_max_workers(3);

    let report = orchestrator(config, &driver)
        .run(tasks(&["a", "b", "c", "d", "e"]))
        .await
        .expect("run should succeed");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.generations.len(), 2);
    assert_eq!(report.generations[0].end, GenerationEnd::Collapsed);
    assert_eq!(report.generations[0].session_failures, 3);
    assert_eq!(report.generations[1].end, GenerationEnd::Drained);
    assert_eq!(report.completed, 5);
}

#[tokio::test]
async fn test_session_crash_requeues_without_charging() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let driver = Arc::new(QuotaDriver::new().with_crashing("crashy"));
    let config = fast_config(dir.path(), &["crashy", "live"]);

    let input = vec![
        Task::new("a", "x").with_max_retries(0),
        Task::new("b", "y").with_max_retries(0),
    ];
    let report = orchestrator(config, &driver)
        .run(input)
        .await
        .expect("run should succeed");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.failed, 0);
    assert_eq!(driver.attempts("a"), 2);
    assert_eq!(sorted_keys(&output_path(dir.path())).await, vec!["a", "b"]);
}

#[tokio::test]
async fn test_fatal_status_when_nothing_is_produced() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let driver = Arc::new(QuotaDriver::new().with_broken("dead"));
    let config = fast_config(dir.path(), &["dead"]);

    let report = orchestrator(config, &driver)
        .run(tasks(&["a", "b", "c"]))
        .await
        .expect("run should return a report");

    assert_eq!(report.status, RunStatus::Fatal);
    assert_eq!(report.pending(), 3);
    assert_eq!(report.results_recorded, 0);
    assert_eq!(driver.total_calls(), 0);
    assert!(read_output(&output_path(dir.path())).await.is_empty());
}

#[tokio::test]
async fn test_output_stays_valid_under_concurrency() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let driver = Arc::new(
        QuotaDriver::new()
            .with_quota("q-0", 10)
            .with_quota("q-1", 10)
            .with_delay(Duration::from_millis(1)),
    );
    let config = fast_config(dir.path(), &["q-0", "q-1", "q-2"]).with_max_workers(8);

    let ids: Vec<String> = (0..40).map(|i| format!("t{:02}", i)).collect();
    let input: Vec<Task> = ids.iter().map(|id| Task::new(id.clone(), "p")).collect();

    let report = orchestrator(config, &driver)
        .run(input)
        .await
        .expect("run should succeed");

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.completed, 40);

    let keys = sorted_keys(&output_path(dir.path())).await;
    assert_eq!(keys, ids);
    assert_eq!(report.results_recorded, 40);
}

#[tokio::test]
async fn test_run_from_text_file() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let input = dir.path().join("prompts.txt");
    tokio::fs::write(&input, "first prompt\nsecond prompt\n")
        .await
        .expect("write input");

    let driver = Arc::new(QuotaDriver::new());
    let report = orchestrator(fast_config(dir.path(), &["id-0"]), &driver)
        .run_from_file(&input)
        .await
        .expect("run should succeed");

    assert_eq!(report.total, 2);
    let output = read_output(&output_path(dir.path())).await;
    let mut keys: Vec<&str> = output.iter().map(|r| r.key.as_str()).collect();
    keys.sort();
    assert_eq!(keys, vec!["prompt_001", "prompt_002"]);
    assert!(output.iter().any(|r| r.value == "answer to first prompt"));
}

#[tokio::test]
async fn test_unwritable_output_is_a_store_error() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let blocker = dir.path().join("not-a-dir");
    tokio::fs::write(&blocker, "x").await.expect("write");

    let driver = Arc::new(QuotaDriver::new());
    let config = fast_config(dir.path(), &["id-0"]).with_output_path(blocker.join("out.json"));

    let result = orchestrator(config, &driver).run(tasks(&["a"])).await;
    assert!(matches!(result, Err(RunError::Store(_))));
    assert_eq!(driver.total_calls(), 0);
}

#[tokio::test]
async fn test_store_failure_mid_run_aborts_without_rotating() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = output_path(dir.path());
    let driver = Arc::new(QuotaDriver::new().with_remove_on("b", &path));
    let config = fast_config(dir.path(), &["id-0", "id-1"]).with_max_workers(1);

    let result = orchestrator(config, &driver).run(tasks(&["a", "b", "c"])).await;

    assert!(matches!(result, Err(RunError::Store(_))));
    // The failed result is requeued, not retried, and no identity follows.
    assert_eq!(driver.attempts("b"), 1);
    assert_eq!(driver.attempts("c"), 0);
    assert!(driver.calls().iter().all(|(endpoint, _)| endpoint == "id-0"));
    assert_eq!(driver.sessions_opened(), 1);
    assert_eq!(driver.sessions_closed(), 1);
}

#[tokio::test]
async fn test_missing_input_file_is_an_input_error() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let driver = Arc::new(QuotaDriver::new());

    let result = orchestrator(fast_config(dir.path(), &["id-0"]), &driver)
        .run_from_file(dir.path().join("missing.json"))
        .await;
    assert!(matches!(result, Err(RunError::Input(_))));
}
