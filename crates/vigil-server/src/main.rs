//! `vigild` — audit-event durability pipeline daemon
//!
//! One process, two independent halves: the HTTP ingestion gateway and the
//! log-to-storage worker, coupled only through the durable log.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use vigil_log::DurableLog;
use vigil_server::{provision_partitions, router, AppState, Config, RateLimiter, Worker};
use vigil_store::EventStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    // Either database failing to open is fatal
    let log = DurableLog::open(config.log_config()).context("failed to open durable log")?;
    let store = EventStore::open(config.store_config()).context("failed to open event store")?;

    // Best effort: a partition still missing at save time surfaces as a
    // persistence failure and the record is redelivered
    provision_partitions(&store).await;

    let cancel = CancellationToken::new();
    let worker = Worker::new(
        log.consumer(&config.group_id),
        store.clone(),
        config.fetch_batch,
        cancel.clone(),
    );
    let worker_handle = tokio::spawn(worker.run());

    let state = AppState {
        publisher: Arc::new(log),
        store,
        publish_timeout: config.publish_timeout(),
    };
    let limiter = Arc::new(RateLimiter::new(config.rate_limit, config.rate_window()));
    let app = router(state, limiter);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "Gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("gateway server error")?;

    // Let the worker finish its in-flight batch before exiting
    info!("Shutting down");
    cancel.cancel();
    worker_handle.await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
