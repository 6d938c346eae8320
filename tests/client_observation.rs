// tests/client_observation.rs

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use pgflow::client::{PgflowClient, RunEventKind, WaitOptions};
use pgflow::errors::PgflowError;
use pgflow::flow::StepDefinition;
use pgflow::state::{RunStatus, StepStatus};
use pgflow::store::{ChangeFeed, SqlGateway};
use pgflow::worker::HandlerRegistry;
use pgflow_test_utils::builders::{fast_client_config, flow};
use pgflow_test_utils::handlers::{constant, BlockingHandler, ConcurrencyProbe, FailingHandler, Recorder};
use pgflow_test_utils::harness::Harness;
use pgflow_test_utils::{init_tracing, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

/// `first -> second`, where `first` is held until the returned gate opens.
fn gated_chain() -> (Harness, CancellationToken) {
    let recorder = Recorder::new();
    let probe = ConcurrencyProbe::new();
    let (hold, release) = BlockingHandler::gated_returning(&probe, json!(1));
    let handlers = HandlerRegistry::new()
        .with("first", hold)
        .with("second", constant(&recorder, json!(2)));
    let h = Harness::start(
        flow(
            "chain",
            vec![
                StepDefinition::single("first"),
                StepDefinition::single("second").depends_on(["first"]),
            ],
        ),
        handlers,
    );
    (h, release)
}

async fn settle(mut done: impl FnMut() -> bool) {
    while !done() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn waiting_for_a_reached_status_returns_immediately() -> TestResult {
    with_timeout(async {
        init_tracing();

        let recorder = Recorder::new();
        let h = Harness::start(
            flow("quick", vec![StepDefinition::single("only")]),
            HandlerRegistry::new().with("only", constant(&recorder, json!("ok"))),
        );
        let run = h.client.start_flow("quick", json!({}), None).await?;
        run.wait_for_status(RunStatus::Completed, WaitOptions::default())
            .await?;

        let started = Instant::now();
        run.wait_for_status(RunStatus::Completed, WaitOptions::timeout(Duration::from_secs(3)))
            .await?;
        // Already past `started`, so this resolves as well.
        run.wait_for_status(RunStatus::Started, WaitOptions::timeout(Duration::from_secs(3)))
            .await?;
        run.step("only")
            .unwrap()
            .wait_for_status(StepStatus::Started, WaitOptions::timeout(Duration::from_secs(3)))
            .await?;
        assert!(started.elapsed() < Duration::from_millis(500));

        h.shutdown().await;
        TestResult::Ok(())
    })
    .await
}

#[tokio::test]
async fn waits_time_out_and_can_be_cancelled() -> TestResult {
    with_timeout(async {
        init_tracing();

        let (h, release) = gated_chain();
        let run = h.client.start_flow("chain", json!({}), None).await?;

        let err = run
            .wait_for_status(RunStatus::Completed, WaitOptions::timeout(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, PgflowError::WaitTimeout { timeout_ms: 50, .. }), "{err}");

        let cancel = CancellationToken::new();
        let waiting = {
            let step = run.step("second").unwrap();
            let options = WaitOptions::default().with_cancel(cancel.clone());
            tokio::spawn(async move { step.wait_for_status(StepStatus::Completed, options).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = waiting.await?.unwrap_err();
        assert!(matches!(err, PgflowError::WaitCancelled { .. }), "{err}");

        // Neither wait affected the run itself.
        release.cancel();
        run.wait_for_status(RunStatus::Completed, WaitOptions::default())
            .await?;

        h.shutdown().await;
        TestResult::Ok(())
    })
    .await
}

#[tokio::test]
async fn a_different_terminal_status_is_unreachable() -> TestResult {
    with_timeout(async {
        init_tracing();

        let recorder = Recorder::new();
        let h = Harness::start(
            flow("doomed", vec![StepDefinition::single("fails").max_attempts(1)]),
            HandlerRegistry::new().with("fails", FailingHandler::always(&recorder)),
        );
        let run = h.client.start_flow("doomed", json!({}), None).await?;
        run.wait_for_status(RunStatus::Failed, WaitOptions::default())
            .await?;

        let err = run
            .wait_for_status(RunStatus::Completed, WaitOptions::default())
            .await
            .unwrap_err();
        assert!(
            matches!(&err, PgflowError::StatusUnreachable { target, current } if target == "completed" && current == "failed"),
            "{err}"
        );
        let err = run
            .step("fails")
            .unwrap()
            .wait_for_status(StepStatus::Completed, WaitOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, PgflowError::StatusUnreachable { .. }), "{err}");

        h.shutdown().await;
        TestResult::Ok(())
    })
    .await
}

#[tokio::test]
async fn many_waiters_share_one_subscription_and_leave_nothing_behind() -> TestResult {
    with_timeout(async {
        init_tracing();

        let (h, release) = gated_chain();
        let run = h.client.start_flow("chain", json!({}), None).await?;
        let run_id = run.run_id();

        let waits: Vec<_> = (0..10)
            .map(|i| {
                let run = run.clone();
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        run.wait_for_status(RunStatus::Completed, WaitOptions::default())
                            .await
                            .map(|_| ())
                    } else {
                        run.step("second")
                            .unwrap()
                            .wait_for_status(StepStatus::Completed, WaitOptions::default())
                            .await
                            .map(|_| ())
                    }
                })
            })
            .collect();

        assert_eq!(h.client.subscriptions().ref_count(run_id), 1);
        assert_eq!(h.store.subscriber_count(run_id), 1);

        release.cancel();
        for wait in waits {
            wait.await??;
        }

        // Looking the run up again reuses the cached observation.
        let again = h.client.get_run(run_id).await?.unwrap();
        assert_eq!(again.run_id(), run_id);
        assert_eq!(h.client.subscriptions().ref_count(run_id), 1);
        assert_eq!(h.store.subscriber_count(run_id), 1);

        assert!(h.client.dispose(run_id));
        assert!(!h.client.dispose(run_id));
        assert_eq!(h.client.subscriptions().active_count(), 0);
        settle(|| h.store.subscriber_count(run_id) == 0).await;

        h.shutdown().await;
        TestResult::Ok(())
    })
    .await
}

#[tokio::test]
async fn disposing_a_run_ends_pending_waits() -> TestResult {
    with_timeout(async {
        init_tracing();

        let (h, _release) = gated_chain();
        let run = h.client.start_flow("chain", json!({}), None).await?;

        let waiting = {
            let run = run.clone();
            tokio::spawn(async move { run.wait_for_status(RunStatus::Completed, WaitOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        h.client.dispose(run.run_id());
        let err = waiting.await?.unwrap_err();
        assert!(matches!(err, PgflowError::WaitCancelled { .. }), "{err}");
        assert!(run.is_disposed());

        h.shutdown().await;
        TestResult::Ok(())
    })
    .await
}

#[tokio::test]
async fn unknown_runs_are_not_observed() -> TestResult {
    with_timeout(async {
        init_tracing();

        let (h, _release) = gated_chain();
        assert!(h.client.get_run(Uuid::new_v4()).await?.is_none());
        assert!(h.client.observed_runs().is_empty());
        assert_eq!(h.client.subscriptions().active_count(), 0);

        let err = h.client.start_flow("no_such_flow", json!({}), None).await.unwrap_err();
        assert!(matches!(err, PgflowError::FlowNotFound(_)), "{err}");
        assert_eq!(h.client.subscriptions().active_count(), 0);

        h.shutdown().await;
        TestResult::Ok(())
    })
    .await
}

#[tokio::test]
async fn a_second_client_can_attach_to_a_running_flow() -> TestResult {
    with_timeout(async {
        init_tracing();

        let (h, release) = gated_chain();
        let run_id = Uuid::new_v4();
        let started = h.client.start_flow("chain", json!({"id": 7}), Some(run_id)).await?;
        assert_eq!(started.run_id(), run_id);

        let gateway: Arc<dyn SqlGateway> = h.store.clone();
        let feed: Arc<dyn ChangeFeed> = h.store.clone();
        let observer = PgflowClient::new(gateway, feed, fast_client_config());
        let attached = observer.get_run(run_id).await?.unwrap();
        assert_eq!(attached.input(), json!({"id": 7}));
        assert_eq!(attached.step("first").unwrap().status(), StepStatus::Started);

        let mut completed = attached.subscribe_to([RunEventKind::Completed]);
        release.cancel();

        let event = completed.recv().await.unwrap();
        assert_eq!(event.run_id(), run_id);
        assert_eq!(attached.output(), Some(json!({"second": 2})));
        assert_eq!(attached.snapshot(), started.wait_for_status(RunStatus::Completed, WaitOptions::default()).await?.snapshot());

        observer.dispose_all();
        h.shutdown().await;
        TestResult::Ok(())
    })
    .await
}

#[tokio::test]
async fn dropped_change_feed_is_reconnected_and_resynced() -> TestResult {
    with_timeout(async {
        init_tracing();

        let (h, release) = gated_chain();
        let run = h.client.start_flow("chain", json!({}), None).await?;
        let run_id = run.run_id();

        assert!(h.store.disconnect(run_id));
        assert_eq!(h.store.subscriber_count(run_id), 0);

        // Everything below happens while the client is disconnected.
        release.cancel();
        settle(|| h.store.subscriber_count(run_id) == 1).await;

        run.wait_for_status(RunStatus::Completed, WaitOptions::default())
            .await?;
        assert_eq!(run.step("first").unwrap().status(), StepStatus::Completed);
        assert_eq!(run.step("second").unwrap().status(), StepStatus::Completed);
        assert_eq!(run.output(), Some(json!({"second": 2})));

        h.shutdown().await;
        TestResult::Ok(())
    })
    .await
}
