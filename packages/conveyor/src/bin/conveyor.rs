// Main entry point for a conveyor queue node: one scheduler, N workers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use conveyor_core::{
    Config, Engine, EngineConfig, RedisStore, Scheduler, SchedulerConfig, TaskRegistry, Worker,
    WorkerConfig,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,conveyor_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting conveyor queue node");

    let config = Config::from_env().context("Failed to load configuration")?;

    tracing::info!(redis_url = %config.redis_url, "Connecting to store...");
    let store = Arc::new(
        RedisStore::connect(&config.redis_url)
            .await
            .context("Failed to connect to the store")?,
    );
    tracing::info!("Store connected");

    let engine = Arc::new(Engine::with_config(
        store.clone(),
        EngineConfig {
            lease_duration_ms: config.lease_duration_ms,
            ..Default::default()
        },
    ));

    let mut registry = TaskRegistry::new();
    registry.register("task.echo", |payload| async move {
        tracing::info!(%payload, "echo");
        Ok(())
    });
    let registry = Arc::new(registry);

    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    let scheduler = Scheduler::with_config(
        engine.clone(),
        store.clone(),
        SchedulerConfig {
            tick_interval: Duration::from_millis(config.tick_interval_ms),
            ..Default::default()
        },
    );
    handles.push(tokio::spawn(scheduler.run(shutdown.clone())));

    for n in 0..config.worker_count {
        let worker = Worker::with_config(
            engine.clone(),
            store.clone(),
            registry.clone(),
            WorkerConfig {
                worker_id: format!("worker-{n}"),
                poll_interval: Duration::from_millis(config.poll_interval_ms),
            },
        );
        handles.push(tokio::spawn(worker.run(shutdown.clone())));
    }

    tracing::info!(workers = config.worker_count, "Node running, Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("received shutdown signal");

    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
