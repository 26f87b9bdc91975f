//! Runtime wiring for `dispatch run`.

use crate::http::{self, HttpState};
use anyhow::Context;
use dispatch_broker::{BrokerHandle, InMemoryBroker, RedisStreamsBroker, RedisStreamsConfig};
use dispatch_core::{DispatchConfig, WorkerHandle};
use dispatch_database::AsyncDatabase;
use dispatch_metrics::MetricsRegistry;
use dispatch_outbox::OutboxDrainWorker;
use dispatch_webhooks::{
    DeliveryCreator, DeliveryExecutor, DeliveryScheduler, DueRetrySweeper, ReqwestTransport,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info};

/// Run the service until Ctrl-C.
pub async fn run_service(config: DispatchConfig, in_memory_broker: bool) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        database = %config.database_path.display(),
        "Starting dispatch"
    );

    let db = AsyncDatabase::open(&config.database_path)
        .await
        .context("Failed to open database")?;

    let broker: BrokerHandle = if in_memory_broker {
        info!("Using in-memory broker");
        Arc::new(InMemoryBroker::new())
    } else {
        let broker = RedisStreamsBroker::connect(RedisStreamsConfig::new(
            config.redis_url.as_str(),
            config.consumer_name.as_str(),
        ))
        .await
        .context("Failed to connect to Redis")?;
        Arc::new(broker)
    };

    let metrics = Arc::new(MetricsRegistry::new());
    let scheduler = Arc::new(DeliveryScheduler::new(broker.clone()));
    let transport = Arc::new(ReqwestTransport::new(config.http_timeout)?);

    let mut workers: Vec<WorkerHandle> = Vec::new();

    let creator = Arc::new(DeliveryCreator::new(db.clone(), scheduler.clone()));
    workers.extend(
        creator
            .start(broker.as_ref(), &config.event_topics, &config.creator_group())
            .await?,
    );

    let executor = Arc::new(DeliveryExecutor::new(
        db.clone(),
        transport,
        scheduler.clone(),
        metrics.clone(),
    ));
    workers.push(
        executor
            .start(broker.as_ref(), &config.delivery_group())
            .await?,
    );

    workers.push(
        OutboxDrainWorker::new(
            db.clone(),
            broker.clone(),
            metrics.clone(),
            config.outbox_batch_size,
            config.outbox_poll_interval,
        )
        .start(),
    );
    workers.push(
        DueRetrySweeper::new(
            db.clone(),
            scheduler.clone(),
            metrics.clone(),
            config.sweep_batch_size,
            config.sweep_interval,
        )
        .start(),
    );

    let listener = TcpListener::bind(config.metrics_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.metrics_addr))?;
    info!(addr = %config.metrics_addr, "Serving /metrics and /healthz");

    let (http_shutdown_tx, http_shutdown_rx) = oneshot::channel::<()>();
    let router = http::router(HttpState {
        metrics: metrics.clone(),
        db: db.clone(),
    });
    let server = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async {
                let _ = http_shutdown_rx.await;
            })
            .await
    });

    info!(workers = workers.len(), "Dispatch running");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown signal received");

    for worker in workers {
        worker.stop().await;
    }
    scheduler.shutdown();

    let _ = http_shutdown_tx.send(());
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "HTTP server error"),
        Err(e) => error!(error = %e, "HTTP server task panicked"),
    }

    db.close().await?;
    info!("Dispatch stopped");
    Ok(())
}
