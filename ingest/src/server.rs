use std::future::Future;
use std::sync::Arc;

use health::HealthRegistry;
use time::Duration;
use tokio::net::TcpListener;

use crate::aggregate::Aggregator;
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorOptions};
use crate::retry::RetryPolicy;
use crate::router;
use crate::sources::readsb::ReadsbHistSource;
use crate::store::Store;
use crate::stores::memory::MemoryStore;
use crate::stores::sqlite::SqliteStore;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    if config.memory_store {
        let store = Arc::new(MemoryStore::new());
        run(config, store, listener, shutdown).await
    } else {
        let store = SqliteStore::connect(&config.database_url)
            .await
            .expect("failed to connect to sqlite store");
        run(config, Arc::new(store), listener, shutdown).await
    }
}

async fn run<S, F>(config: Config, store: Arc<S>, listener: TcpListener, shutdown: F)
where
    S: Store + Send + Sync + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    let liveness = HealthRegistry::new("liveness");

    let aggregator = Arc::new(Aggregator::new(store.clone(), config.stale_bound.0));

    let source = ReadsbHistSource::new(&config.source_url, config.fetch_timeout.0)
        .expect("failed to create readsb-hist source");

    let options = CoordinatorOptions {
        retry_policy: RetryPolicy::new(
            config.retry_policy.backoff_coefficient,
            config.retry_policy.initial_interval.0,
            config.retry_policy.maximum_interval.0,
        ),
        retry_limit: config.retry_limit,
        partitions: config.partitions,
        batch_size: config.batch_size,
        poll_interval: config.poll_interval.0,
    };
    let coordinator = Arc::new(Coordinator::new(Arc::new(source), store.clone(), options));

    let handle = liveness.register("coordinator".to_string(), Duration::seconds(120));
    let ingestion = coordinator.clone();
    tokio::spawn(async move { ingestion.run(handle).await });

    let app = router::router(store, aggregator, liveness, config.export_prometheus);

    tracing::info!("listening on {:?}", listener.local_addr().unwrap());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("failed to serve");

    // In-flight work past Persisting still runs to completion
    coordinator.cancel();
}
