use std::time::Duration;

use trawl_core::testutil::MockExtractor;
use trawl_core::{AppError, RetryPolicy, RunOptions, RunStatus, Source};

use crate::integration::common::{controller_with, fast_config, targets};

const TEN: &[&str] = &["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"];

#[tokio::test(start_paused = true)]
async fn cancel_stops_new_jobs_and_keeps_results() {
    let extractor = MockExtractor::succeeding().with_latency(Duration::from_secs(1));
    let (controller, reporter) = controller_with(extractor.clone(), fast_config().with_workers(1));

    let handle = controller
        .start_run(targets(Source::Instagram, TEN), RunOptions::default())
        .unwrap();
    let mut rx = controller.subscribe(handle).unwrap();
    rx.wait_for(|s| s.progress.completed >= 2).await.unwrap();

    controller.cancel(handle).unwrap();
    let state = controller.wait(handle).await.unwrap();

    assert_eq!(state.status, RunStatus::Cancelled);
    assert!(state.progress.completed >= 2);
    assert!(state.progress.completed < TEN.len());
    assert_eq!(state.results.len(), state.progress.completed);
    assert!(state.finished_at.is_some());

    let calls = extractor.call_count();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let later = controller.state(handle).unwrap();
    assert_eq!(later.progress.completed, state.progress.completed);
    assert_eq!(extractor.call_count(), calls);
    assert_eq!(reporter.count("worker_started"), reporter.count("worker_stopped"));
}

#[tokio::test(start_paused = true)]
async fn cancel_interrupts_retry_backoff() {
    let extractor = MockExtractor::failing(|| AppError::HttpError("500".into()));
    let config = fast_config().with_retry(
        RetryPolicy::default()
            .with_max_attempts(5)
            .with_delays(Duration::from_secs(30), Duration::from_secs(60)),
    );
    let (controller, reporter) = controller_with(extractor.clone(), config);

    let handle = controller
        .start_run(targets(Source::Instagram, &["down"]), RunOptions::default())
        .unwrap();

    // Let the first attempt fail and its backoff begin.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(extractor.call_count(), 1);

    controller.cancel(handle).unwrap();
    let state = controller.wait(handle).await.unwrap();

    assert_eq!(state.status, RunStatus::Cancelled);
    assert!(state.results.is_empty());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(extractor.call_count(), 1);
    assert_eq!(reporter.count("job_abandoned"), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_after_completion_is_harmless() {
    let (controller, _) = controller_with(MockExtractor::succeeding(), fast_config());

    let handle = controller
        .start_run(targets(Source::Shopee, &["1", "2"]), RunOptions::default())
        .unwrap();
    let done = controller.wait(handle).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);

    controller.cancel(handle).unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(controller.state(handle).unwrap().status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn release_cancels_a_running_run() {
    let extractor = MockExtractor::succeeding().with_latency(Duration::from_secs(5));
    let (controller, _) = controller_with(extractor.clone(), fast_config().with_workers(1));

    let handle = controller
        .start_run(targets(Source::Instagram, TEN), RunOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let last = controller.release(handle).unwrap();
    assert!(!last.status.is_terminal());
    assert!(controller.state(handle).is_err());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(extractor.call_count(), 1);
}
