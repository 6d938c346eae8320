use std::sync::Arc;

use pgflow::client::{ClientConfig, PgflowClient};
use pgflow::flow::Flow;
use pgflow::store::{ChangeFeed, MemoryStore, SqlGateway};
use pgflow::worker::{HandlerRegistry, Worker, WorkerConfig};

use crate::builders::{fast_client_config, fast_worker_config};

/// A store with one registered flow, a running worker for its queue and a
/// client, all wired in-process.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub worker: Worker,
    pub client: PgflowClient,
}

impl Harness {
    /// Start a worker with [`fast_worker_config`] and a client with
    /// [`fast_client_config`].
    pub fn start(flow: Flow, handlers: HandlerRegistry) -> Self {
        let config = fast_worker_config(flow.slug());
        Self::start_with(flow, handlers, config, fast_client_config())
    }

    pub fn start_with(
        flow: Flow,
        handlers: HandlerRegistry,
        worker_config: WorkerConfig,
        client_config: ClientConfig,
    ) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.register_flow(flow);
        let gateway: Arc<dyn SqlGateway> = store.clone();
        let feed: Arc<dyn ChangeFeed> = store.clone();

        let worker = Worker::new(Arc::clone(&gateway), handlers, worker_config);
        worker.start().expect("worker failed to start");
        let client = PgflowClient::new(gateway, feed, client_config);
        Self { store, worker, client }
    }

    pub async fn shutdown(self) {
        self.worker.stop().await.expect("worker failed to stop");
        self.client.dispose_all();
    }
}
