// tests/worker_pipeline.rs

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use pgflow::client::{PgflowClient, WaitOptions};
use pgflow::flow::StepDefinition;
use pgflow::state::{RunStatus, StepStatus, TaskStatus};
use pgflow::store::{ChangeFeed, MemoryStore, SqlGateway};
use pgflow::worker::{handler_fn, HandlerRegistry, Worker, WorkerMode, WorkerState};
use pgflow_test_utils::builders::{fast_client_config, fast_worker_config, flow};
use pgflow_test_utils::gateway::{FlakyGateway, GatewayOp};
use pgflow_test_utils::handlers::{constant, BlockingHandler, ConcurrencyProbe, Recorder};
use pgflow_test_utils::harness::Harness;
use pgflow_test_utils::{init_tracing, with_timeout, with_timeout_of};

type TestResult = Result<(), Box<dyn Error>>;

fn flood(slug: &str) -> pgflow::flow::Flow {
    flow(slug, vec![StepDefinition::map("work")])
}

fn items(n: usize) -> serde_json::Value {
    json!((0..n).collect::<Vec<_>>())
}

#[tokio::test(start_paused = true)]
async fn concurrency_never_exceeds_max_concurrent() -> TestResult {
    with_timeout_of(Duration::from_secs(120), async {
        init_tracing();

        let probe = ConcurrencyProbe::new();
        let handlers = HandlerRegistry::new().with(
            "work",
            BlockingHandler::sleeping(&probe, Duration::from_millis(50)),
        );
        let worker_config = pgflow::worker::WorkerConfig {
            max_concurrent: 3,
            ..fast_worker_config("flood")
        };
        let h = Harness::start_with(flood("flood"), handlers, worker_config, fast_client_config());

        let run = h.client.start_flow("flood", items(25), None).await?;
        run.wait_for_status(RunStatus::Completed, WaitOptions::default())
            .await?;

        assert_eq!(probe.finished(), 25);
        assert_eq!(probe.max_observed(), 3);
        let stats = h.worker.stats();
        assert!(stats.max_observed <= 3, "{stats:?}");
        assert_eq!(stats.completed, 25);
        assert_eq!(run.step("work").unwrap().output(), Some(items(25)));

        h.shutdown().await;
        TestResult::Ok(())
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn single_cycle_mode_drains_the_queue_batch_by_batch() -> TestResult {
    with_timeout_of(Duration::from_secs(120), async {
        init_tracing();

        let probe = ConcurrencyProbe::new();
        let handlers = HandlerRegistry::new().with(
            "work",
            BlockingHandler::sleeping(&probe, Duration::from_millis(20)),
        );
        let worker_config = pgflow::worker::WorkerConfig {
            batch_size: 4,
            max_concurrent: 10,
            mode: WorkerMode::SingleCycle,
            ..fast_worker_config("cycles")
        };
        let h = Harness::start_with(flood("cycles"), handlers, worker_config, fast_client_config());

        let run = h.client.start_flow("cycles", items(10), None).await?;
        run.wait_for_status(RunStatus::Completed, WaitOptions::default())
            .await?;

        assert_eq!(probe.finished(), 10);
        assert!(probe.max_observed() <= 4);

        let report = h.worker.stop().await?;
        assert_eq!(report.started, 10);
        h.client.dispose_all();
        TestResult::Ok(())
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn transient_gateway_errors_do_not_lose_tasks() -> TestResult {
    with_timeout_of(Duration::from_secs(60), async {
        init_tracing();

        let store = Arc::new(MemoryStore::new());
        store.register_flow(flow("flaky", vec![StepDefinition::single("only")]));
        let flaky = FlakyGateway::new(store.clone());
        flaky.fail_next(GatewayOp::Poll, 3);
        flaky.fail_next(GatewayOp::Complete, 2);

        let recorder = Recorder::new();
        let handlers = HandlerRegistry::new().with("only", constant(&recorder, json!("done")));
        let worker = Worker::new(flaky.clone(), handlers, fast_worker_config("flaky"));
        worker.start()?;

        let gateway: Arc<dyn SqlGateway> = store.clone();
        let feed: Arc<dyn ChangeFeed> = store.clone();
        let client = PgflowClient::new(gateway, feed, fast_client_config());

        let run = client.start_flow("flaky", json!({}), None).await?;
        run.wait_for_status(RunStatus::Completed, WaitOptions::default())
            .await?;

        assert_eq!(recorder.len(), 1, "completion was retried, not the handler");
        assert!(flaky.calls(GatewayOp::Poll) > 3);
        assert_eq!(flaky.calls(GatewayOp::Complete), 3);

        worker.stop().await?;
        TestResult::Ok(())
    })
    .await
}

#[tokio::test]
async fn panicking_handler_fails_its_task() -> TestResult {
    with_timeout(async {
        init_tracing();

        let handlers = HandlerRegistry::new().with(
            "boom",
            handler_fn(|_ctx| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(json!(null))
            }),
        );
        let h = Harness::start(
            flow("panics", vec![StepDefinition::single("boom").max_attempts(1)]),
            handlers,
        );

        let run = h.client.start_flow("panics", json!({}), None).await?;
        run.wait_for_status(RunStatus::Failed, WaitOptions::default())
            .await?;
        let message = run.step("boom").unwrap().error_message().unwrap();
        assert!(message.contains("handler panicked"), "{message}");
        assert!(message.contains("kaboom"), "{message}");
        assert_eq!(h.worker.state(), WorkerState::Running);

        h.shutdown().await;
        TestResult::Ok(())
    })
    .await
}

#[tokio::test]
async fn stop_aborts_in_flight_handlers_without_failing_them() -> TestResult {
    with_timeout(async {
        init_tracing();

        let probe = ConcurrencyProbe::new();
        let (hold, _never_released) = BlockingHandler::gated(&probe);
        let h = Harness::start(flow("stuck", vec![StepDefinition::single("wait")]), HandlerRegistry::new().with("wait", hold));

        let run = h.client.start_flow("stuck", json!({}), None).await?;
        while probe.current() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        h.worker.stop().await?;
        assert_eq!(h.worker.state(), WorkerState::Stopped);
        let stats = h.worker.stats();
        assert_eq!(stats.aborted, 1, "{stats:?}");
        assert_eq!(stats.failed, 0, "{stats:?}");
        assert_eq!(stats.in_flight, 0);

        // Nothing was reported, so the task is still claimed and will be
        // redelivered once its visibility timeout runs out.
        let snapshot = h.store.get_run(run.run_id()).await?.unwrap();
        assert_eq!(snapshot.tasks[0].status, TaskStatus::Started);
        assert_eq!(snapshot.tasks[0].attempts_count, 0);
        assert_eq!(snapshot.step("wait").unwrap().status, StepStatus::Started);

        h.client.dispose_all();
        TestResult::Ok(())
    })
    .await
}

#[tokio::test(start_paused = true)]
async fn deprecated_worker_finishes_in_flight_work_and_stops_polling() -> TestResult {
    with_timeout_of(Duration::from_secs(60), async {
        init_tracing();

        let probe = ConcurrencyProbe::new();
        let (hold, release) = BlockingHandler::gated_returning(&probe, json!("finished"));
        let h = Harness::start(flow("retire", vec![StepDefinition::single("job")]), HandlerRegistry::new().with("job", hold));

        let first = h.client.start_flow("retire", json!({}), None).await?;
        while probe.current() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(h.store.deprecate_worker(h.worker.identity().worker_id));
        while !h.worker.is_draining() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        release.cancel();

        h.worker.join().await?;
        assert_eq!(h.worker.state(), WorkerState::Stopped);
        first
            .wait_for_status(RunStatus::Completed, WaitOptions::default())
            .await?;

        // New work is left in the queue for other workers.
        let second = h.client.start_flow("retire", json!({}), None).await?;
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(second.status(), RunStatus::Started);
        assert_eq!(h.store.queue_depth("retire"), 1);
        assert!(h.store.heartbeat_count(h.worker.identity().worker_id) >= 1);

        h.client.dispose_all();
        TestResult::Ok(())
    })
    .await
}
