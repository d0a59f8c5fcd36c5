use std::collections::HashSet;
use std::time::Duration;

use tokio::time::Instant;
use trawl_core::testutil::MockExtractor;
use trawl_core::{
    AppError, ErrorKind, ExtractionResult, RateLimit, RetryPolicy, RunOptions, RunStatus, Source,
    Target,
};

use crate::integration::common::{controller_with, fast_config, targets};

#[tokio::test(start_paused = true)]
async fn rate_limit_paces_a_single_worker() {
    let extractor = MockExtractor::succeeding();
    let config = fast_config()
        .with_workers(1)
        .with_rate_limit(Source::Instagram, RateLimit::new(1, Duration::from_secs(2)));
    let (controller, _) = controller_with(extractor.clone(), config);

    let start = Instant::now();
    let handle = controller
        .start_run(targets(Source::Instagram, &["a", "b", "c"]), RunOptions::default())
        .unwrap();
    let state = controller.wait(handle).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert!(start.elapsed() >= Duration::from_secs(4));

    let mut times: Vec<_> = extractor.calls().into_iter().map(|c| c.at).collect();
    times.sort();
    assert_eq!(times.len(), 3);
    assert!(times[1] - times[0] >= Duration::from_secs(2));
    assert!(times[2] - times[1] >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn always_transient_is_attempted_max_times() {
    let extractor = MockExtractor::failing(|| AppError::NetworkError("connection reset".into()));
    let config = fast_config().with_retry(
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_delays(Duration::from_millis(100), Duration::from_secs(1)),
    );
    let (controller, reporter) = controller_with(extractor.clone(), config);

    let handle = controller
        .start_run(targets(Source::Instagram, &["down"]), RunOptions::default())
        .unwrap();
    let state = controller.wait(handle).await.unwrap();

    assert_eq!(extractor.call_count_for("down"), 3);
    assert_eq!(reporter.count("retry_scheduled"), 2);
    assert_eq!(state.results.len(), 1);
    match &state.results[0] {
        ExtractionResult::Failure { kind, attempts, .. } => {
            assert_eq!(*kind, ErrorKind::Transient);
            assert_eq!(*attempts, 3);
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_is_not_retried() {
    let extractor = MockExtractor::always(|target: &Target| {
        if target.id() == "ghost" {
            Err(AppError::NotFound(format!("user {} does not exist", target.id())))
        } else {
            Ok(trawl_core::testutil::sample_data(target.id(), 2))
        }
    });
    let (controller, reporter) = controller_with(extractor.clone(), fast_config());

    let handle = controller
        .start_run(
            targets(Source::Instagram, &["nasa", "ghost", "esa"]),
            RunOptions::default(),
        )
        .unwrap();
    let state = controller.wait(handle).await.unwrap();

    assert_eq!(state.successes().count(), 2);
    assert_eq!(state.failures().count(), 1);
    assert_eq!(extractor.call_count_for("ghost"), 1);
    assert_eq!(reporter.count_for("retry_scheduled", "instagram:ghost"), 0);

    let failure = state.failures().next().unwrap();
    assert_eq!(failure.target().id(), "ghost");
    assert_eq!(failure.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn completed_run_has_one_result_per_target() {
    let extractor = MockExtractor::succeeding()
        .with_script("flaky", vec![Err(AppError::HttpError("503".into()))])
        .with_script("odd", vec![Err(AppError::ParseError("no data".into()))]);
    let (controller, _) = controller_with(extractor, fast_config().with_workers(3));

    let mut input = targets(Source::Instagram, &["a", "b", "flaky", "odd"]);
    input.extend(targets(Source::Shopee, &["12345", "a"]));
    let handle = controller.start_run(input, RunOptions::default()).unwrap();
    let state = controller.wait(handle).await.unwrap();

    assert_eq!(state.status, RunStatus::Completed);
    assert_eq!(state.progress.completed, state.progress.total);
    assert_eq!(state.results.len(), 6);

    let distinct: HashSet<_> = state.results.iter().map(|r| r.target().clone()).collect();
    assert_eq!(distinct.len(), 6);
    assert!(state.results.iter().all(ExtractionResult::is_success));
}

#[tokio::test(start_paused = true)]
async fn progress_is_observable_and_monotonic() {
    let extractor = MockExtractor::succeeding().with_latency(Duration::from_millis(500));
    let (controller, _) = controller_with(extractor, fast_config().with_workers(2));

    let handle = controller
        .start_run(
            targets(Source::Instagram, &["a", "b", "c", "d", "e"]),
            RunOptions::default(),
        )
        .unwrap();
    let mut rx = controller.subscribe(handle).unwrap();

    let mut seen = vec![rx.borrow_and_update().progress.completed];
    loop {
        if rx.changed().await.is_err() {
            break;
        }
        let state = rx.borrow_and_update();
        seen.push(state.progress.completed);
        assert!(state.progress.completed <= state.progress.total);
        assert_eq!(state.results.len(), state.progress.completed);
        if state.status.is_terminal() {
            break;
        }
    }

    assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(seen.last().copied(), Some(5));
}

#[tokio::test(start_paused = true)]
async fn since_and_max_items_reach_the_extractor() {
    let extractor = MockExtractor::always(|target: &Target| {
        Ok(trawl_core::testutil::sample_data(target.id(), 10))
    });
    let (controller, _) = controller_with(extractor.clone(), fast_config());

    let since = trawl_core::testutil::reference_time() - chrono::Duration::days(3);
    let options = RunOptions::default().with_max_items(8).with_since(since);
    let handle = controller
        .start_run(targets(Source::Instagram, &["nasa"]), options)
        .unwrap();
    let state = controller.wait(handle).await.unwrap();

    let call = &extractor.calls()[0];
    assert_eq!(call.max_items, 8);
    assert_eq!(call.since, Some(since));
    match &state.results[0] {
        ExtractionResult::Success { items, .. } => {
            assert_eq!(items.len(), 4);
            assert!(items.iter().all(|i| i.timestamp >= Some(since)));
        }
        other => panic!("expected success, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_are_independent() {
    let extractor = MockExtractor::succeeding();
    let (controller, _) = controller_with(extractor, fast_config());

    let first = controller
        .start_run(targets(Source::Instagram, &["a", "b"]), RunOptions::default())
        .unwrap();
    let second = controller
        .start_run(targets(Source::Shopee, &["1", "2", "3"]), RunOptions::default())
        .unwrap();
    assert_ne!(first, second);
    assert_eq!(controller.active_runs().len(), 2);

    let a = controller.wait(first).await.unwrap();
    let b = controller.wait(second).await.unwrap();
    assert_eq!(a.results.len(), 2);
    assert_eq!(b.results.len(), 3);
    assert!(b.results.iter().all(|r| r.target().source() == Source::Shopee));

    controller.release(first).unwrap();
    assert_eq!(controller.active_runs(), vec![second]);
}

#[tokio::test]
async fn bad_input_is_rejected_before_any_job_runs() {
    let extractor = MockExtractor::succeeding();
    let (controller, _) = controller_with(extractor.clone(), fast_config());

    let empty = controller.start_run(Vec::new(), RunOptions::default());
    assert!(matches!(empty, Err(AppError::InvalidInput(_))));

    let mut input = targets(Source::Instagram, &["a"]);
    input.extend(targets(Source::PlayStore, &["com.example.app"]));
    let unsupported = controller.start_run(input, RunOptions::default());
    assert!(matches!(unsupported, Err(AppError::InvalidInput(_))));

    assert_eq!(extractor.call_count(), 0);
    assert!(controller.active_runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn panicking_extractor_does_not_stall_the_run() {
    for workers in [1, 2] {
        let extractor = MockExtractor::always(|target: &Target| {
            if target.id() == "boom" {
                panic!("extractor bug");
            }
            Ok(trawl_core::testutil::sample_data(target.id(), 1))
        });
        let (controller, _) = controller_with(extractor.clone(), fast_config().with_workers(workers));

        let handle = controller
            .start_run(targets(Source::Instagram, &["boom", "a", "b"]), RunOptions::default())
            .unwrap();
        let state = tokio::time::timeout(Duration::from_secs(60), controller.wait(handle))
            .await
            .expect("run finishes")
            .unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.results.len(), 3);
        assert_eq!(extractor.call_count_for("a"), 1);
        assert_eq!(extractor.call_count_for("b"), 1);
        let failed: Vec<_> = state.failures().map(|r| r.target().id().to_string()).collect();
        assert_eq!(failed, vec!["boom"]);
    }
}
