mod simulated;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use requeue_broker::{Broker, InMemoryBroker};
use requeue_core::{Clock, RequeueConfig, SystemClock};
use requeue_engine::Engine;
use requeue_infra::{ConsumerWorker, Scheduler};

use simulated::SimulatedProcessor;

/// Pause after a broker error before the consumer polls again.
const ERROR_PAUSE: Duration = Duration::from_secs(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    requeue_observability::init();

    let config = RequeueConfig::from_env().context("invalid configuration")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    match std::env::var("REDIS_URL") {
        Ok(url) => {
            let broker = redis_broker(&url, &config)?;
            run(config, broker, clock).await
        }
        Err(_) => {
            tracing::warn!("REDIS_URL not set; using in-memory broker (nothing survives a restart)");
            run(config, Arc::new(InMemoryBroker::new()), clock).await
        }
    }
}

#[cfg(feature = "redis")]
fn redis_broker(
    url: &str,
    config: &RequeueConfig,
) -> anyhow::Result<requeue_infra::broker::RedisStreamsBroker> {
    let consumer = std::env::var("REQUEUE_CONSUMER_NAME").ok();
    let broker = requeue_infra::broker::RedisStreamsBroker::new(url, consumer)
        .context("failed to open Redis client")?;
    Ok(broker.with_dead_letter_topic(config.topics.dlq.clone()))
}

#[cfg(not(feature = "redis"))]
fn redis_broker(_url: &str, _config: &RequeueConfig) -> anyhow::Result<Arc<InMemoryBroker>> {
    anyhow::bail!("REDIS_URL is set but this build has no `redis` feature")
}

async fn run<B>(config: RequeueConfig, broker: B, clock: Arc<dyn Clock>) -> anyhow::Result<()>
where
    B: Broker + Clone + 'static,
{
    tracing::info!(
        primary = %config.topics.primary,
        retry = %config.topics.retry,
        dlq = %config.topics.dlq,
        max_attempts = config.max_attempts,
        batch_size = config.batch_size,
        "starting requeue worker"
    );

    let engine = Engine::new(&config, broker, SimulatedProcessor, clock);
    let worker = ConsumerWorker::spawn("requeue-consumer", engine.main_flow(), ERROR_PAUSE);
    let scheduler = Scheduler::spawn(
        "requeue-scheduler",
        engine.reprocessor(),
        config.scheduler_frequency,
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    // Joins block until the in-flight step or tick finishes.
    tokio::task::spawn_blocking(move || {
        worker.shutdown();
        scheduler.shutdown();
    })
    .await
    .context("shutdown task panicked")?;

    tracing::info!("requeue worker stopped");
    Ok(())
}
