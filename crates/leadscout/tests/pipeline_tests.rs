//! Orchestration runs end to end against fake stage runners.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    FailingRunner, GatedRunner, PanickingRunner, RecordingRunner, SearchBuilder, StagesBuilder,
    TestHarness,
};
use leadscout::config::PolicyConfig;
use leadscout::progress::SearchEventKind;
use leadscout::queue::{JobFilter, JobStatus};
use leadscout::{RunMode, SearchPhase, SearchStatus, StageKind, StartOutcome};

#[tokio::test]
async fn test_crm_search_runs_to_completion() {
    let harness = TestHarness::new(StagesBuilder::new().build());
    let search = harness.create_search(SearchBuilder::new().build());

    let outcome = harness
        .service
        .start_orchestration(&search.id, "user-1", RunMode::Foreground)
        .await
        .unwrap();
    let StartOutcome::Finished { snapshot } = outcome else {
        panic!("expected a finished run, got {:?}", outcome);
    };

    assert_eq!(snapshot.status, SearchStatus::Completed);
    assert_eq!(snapshot.phase, SearchPhase::Completed);
    assert_eq!(snapshot.progress_pct, 100);
    assert_eq!(snapshot.counts.business_personas, 2);
    assert_eq!(snapshot.counts.decision_maker_personas, 2);
    assert_eq!(snapshot.counts.personas, 4);
    assert!(snapshot.counts.businesses > 0);
    assert!(snapshot.counts.decision_makers > 0);
    assert!(snapshot.counts.market_insights > 0);
}

#[tokio::test]
async fn test_business_discovery_failure_fails_search_at_personas() {
    let stages = StagesBuilder::new()
        .with(Arc::new(FailingRunner::terminal(StageKind::BusinessDiscovery)))
        .build();
    let harness = TestHarness::new(stages);
    let search = harness.create_search(SearchBuilder::new().build());

    harness
        .service
        .start_orchestration(&search.id, "user-1", RunMode::Foreground)
        .await
        .unwrap();

    let search = harness.search(&search.id);
    assert_eq!(search.status, SearchStatus::Failed);
    assert_eq!(search.phase, SearchPhase::Personas);
    assert_eq!(search.progress_pct, 0);
    assert!(search.error.as_deref().unwrap_or_default().contains("400"));

    let snapshot = harness.service.get_progress(&search.id).unwrap();
    assert_eq!(snapshot.counts.businesses, 0);
    assert_eq!(snapshot.counts.personas, 4);
}

#[tokio::test]
async fn test_progress_events_never_decrease() {
    let harness = TestHarness::new(StagesBuilder::new().build());
    let search = harness.create_search(SearchBuilder::new().build());
    let mut subscription = harness.service.subscribe(&search.id).unwrap();

    harness
        .service
        .start_orchestration(&search.id, "user-1", RunMode::Foreground)
        .await
        .unwrap();

    let mut progress = Vec::new();
    let mut records = 0;
    loop {
        let event = subscription.recv().await.unwrap();
        match &event.kind {
            SearchEventKind::PhaseChanged { progress_pct, .. } => progress.push(*progress_pct),
            SearchEventKind::RecordInserted { .. } => records += 1,
            _ => {}
        }
        if event.is_terminal() {
            assert_eq!(event.kind, SearchEventKind::Completed);
            break;
        }
    }

    assert_eq!(progress, vec![5, 25, 60, 85, 100]);
    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert_eq!(records, 10);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_between_businesses_and_decision_makers() {
    let gate = Arc::new(GatedRunner::new(StageKind::DecisionMakerDiscovery));
    let insights = Arc::new(RecordingRunner::new(StageKind::MarketInsights, 1));
    let stages = StagesBuilder::new()
        .with(gate.clone())
        .with(insights.clone())
        .build();
    let harness = Arc::new(TestHarness::new(stages));
    let search = harness.create_search(SearchBuilder::new().build());

    let run = {
        let harness = Arc::clone(&harness);
        let id = search.id.clone();
        tokio::spawn(async move {
            harness
                .service
                .start_orchestration(&id, "user-1", RunMode::Foreground)
                .await
        })
    };

    // Decision-maker discovery has started; businesses are done.
    gate.entered.notified().await;
    assert_eq!(harness.search(&search.id).phase, SearchPhase::Businesses);

    harness.service.cancel(&search.id).unwrap();
    gate.release.notify_one();

    let outcome = run.await.unwrap().unwrap();
    let StartOutcome::Finished { snapshot } = outcome else {
        panic!("expected a finished run, got {:?}", outcome);
    };
    assert_eq!(snapshot.status, SearchStatus::Cancelled);
    assert_eq!(snapshot.phase, SearchPhase::Cancelled);

    let search = harness.search(&search.id);
    assert_eq!(search.status, SearchStatus::Cancelled);
    assert_eq!(search.phase, SearchPhase::Cancelled);
    assert_eq!(search.progress_pct, 60);
    assert_eq!(insights.runs(), 0);
}

#[tokio::test]
async fn test_retry_resumes_after_last_successful_phase() {
    let discovery = Arc::new(FailingRunner::transient(StageKind::DecisionMakerDiscovery, 1));
    let personas = Arc::new(RecordingRunner::new(StageKind::BusinessPersonas, 2));
    let stages = StagesBuilder::new()
        .with(discovery.clone())
        .with(personas.clone())
        .build();
    let harness = TestHarness::new(stages);
    let search = harness.create_search(SearchBuilder::new().build());

    // Foreground runs never defer, so the transient error fails the search.
    harness
        .service
        .start_orchestration(&search.id, "user-1", RunMode::Foreground)
        .await
        .unwrap();
    let failed = harness.search(&search.id);
    assert_eq!(failed.status, SearchStatus::Failed);
    assert_eq!(failed.phase, SearchPhase::Businesses);

    harness
        .service
        .retry(&search.id, "user-1", RunMode::Foreground)
        .await
        .unwrap();

    let search = harness.search(&search.id);
    assert_eq!(search.status, SearchStatus::Completed);
    assert_eq!(search.progress_pct, 100);
    assert!(search.error.is_none());
    assert_eq!(discovery.runs(), 2);
    assert_eq!(personas.runs(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_failure_is_retried_by_the_job_queue() {
    let flaky = Arc::new(FailingRunner::transient(StageKind::BusinessDiscovery, 1));
    let stages = StagesBuilder::new().with(flaky.clone()).build();
    let harness = TestHarness::new(stages);
    let search = harness.create_search(SearchBuilder::new().build());

    let outcome = harness
        .service
        .start_orchestration(&search.id, "user-1", RunMode::Background)
        .await
        .unwrap();
    let StartOutcome::Accepted { job_id } = outcome else {
        panic!("expected an accepted job, got {:?}", outcome);
    };

    let pool = harness.start_workers(2);
    harness
        .wait_for_status(&search.id, SearchStatus::Completed)
        .await;
    pool.shutdown();
    pool.wait().await.unwrap();

    assert_eq!(flaky.runs(), 2);
    let job = harness.service.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(harness.service.job_store().tasks_for_job(&job_id).unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transient_failures_exhaust_attempts_and_fail_search() {
    let flaky = Arc::new(FailingRunner::transient(StageKind::MarketInsights, usize::MAX));
    let stages = StagesBuilder::new().with(flaky.clone()).build();
    let harness = TestHarness::new(stages);
    let search = harness.create_search(SearchBuilder::new().build());

    harness
        .service
        .start_orchestration(&search.id, "user-1", RunMode::Background)
        .await
        .unwrap();

    let pool = harness.start_workers(1);
    let failed = harness
        .wait_for_status(&search.id, SearchStatus::Failed)
        .await;
    pool.shutdown();
    pool.wait().await.unwrap();

    assert_eq!(failed.phase, SearchPhase::DecisionMakers);
    assert_eq!(failed.progress_pct, 0);
    assert_eq!(flaky.runs(), 3);

    let page = harness
        .service
        .list_jobs(&JobFilter {
            search_id: Some(search.id.clone()),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.jobs[0].status, JobStatus::Failed);
    assert_eq!(page.jobs[0].attempt_count, 3);
}

#[tokio::test]
async fn test_duplicate_trigger_is_suppressed() {
    let harness = TestHarness::new(StagesBuilder::new().build());
    let search = harness.create_search(SearchBuilder::new().build());

    let first = harness
        .service
        .start_orchestration(&search.id, "user-1", RunMode::Background)
        .await
        .unwrap();
    let second = harness
        .service
        .start_orchestration(&search.id, "user-1", RunMode::Foreground)
        .await
        .unwrap();

    let StartOutcome::Accepted { job_id } = first else {
        panic!("expected an accepted job, got {:?}", first);
    };
    assert_eq!(
        second,
        StartOutcome::Duplicate {
            job_id: Some(job_id)
        }
    );
    // The foreground trigger did not run anything.
    assert_eq!(harness.search(&search.id).phase, SearchPhase::Starting);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_foreground_run_blocks_triggers_after_window_expires() {
    let gate = Arc::new(GatedRunner::new(StageKind::BusinessDiscovery));
    let policy = PolicyConfig {
        idempotency_ttl_secs: 1,
        ..Default::default()
    };
    let harness = Arc::new(TestHarness::with_policy(
        StagesBuilder::new().with(gate.clone()).build(),
        &policy,
    ));
    let search = harness.create_search(SearchBuilder::new().build());

    let run = {
        let harness = Arc::clone(&harness);
        let id = search.id.clone();
        tokio::spawn(async move {
            harness
                .service
                .start_orchestration(&id, "user-1", RunMode::Foreground)
                .await
        })
    };
    gate.entered.notified().await;

    // Let the trigger window lapse while the foreground run is still going.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let filter = JobFilter {
        search_id: Some(search.id.clone()),
        ..Default::default()
    };
    let page = harness.service.list_jobs(&filter).unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.jobs[0].status, JobStatus::Running);
    let running_id = page.jobs[0].id.clone();

    let background = harness
        .service
        .start_orchestration(&search.id, "user-1", RunMode::Background)
        .await
        .unwrap();
    assert_eq!(
        background,
        StartOutcome::Duplicate {
            job_id: Some(running_id.clone())
        }
    );

    gate.release.notify_one();
    let outcome = run.await.unwrap().unwrap();
    let StartOutcome::Finished { snapshot } = outcome else {
        panic!("expected a finished run, got {:?}", outcome);
    };
    assert_eq!(snapshot.status, SearchStatus::Completed);
    assert_eq!(snapshot.counts.businesses, 1);

    let page = harness.service.list_jobs(&filter).unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.jobs[0].id, running_id);
    assert_eq!(page.jobs[0].status, JobStatus::Done);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_panicking_stage_fails_search_in_background() {
    let broken = Arc::new(PanickingRunner::new(StageKind::BusinessDiscovery));
    let harness = TestHarness::new(StagesBuilder::new().with(broken.clone()).build());
    let search = harness.create_search(SearchBuilder::new().build());

    let outcome = harness
        .service
        .start_orchestration(&search.id, "user-1", RunMode::Background)
        .await
        .unwrap();
    let StartOutcome::Accepted { job_id } = outcome else {
        panic!("expected an accepted job, got {:?}", outcome);
    };

    let pool = harness.start_workers(1);
    let failed = harness
        .wait_for_status(&search.id, SearchStatus::Failed)
        .await;
    pool.shutdown();
    pool.wait().await.unwrap();

    assert_eq!(failed.phase, SearchPhase::Personas);
    assert_eq!(failed.progress_pct, 0);
    assert!(failed.error.as_deref().unwrap_or_default().contains("panicked"));
    assert_eq!(broken.runs(), 1);

    let job = harness.service.get_job(&job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt_count, 1);
}
