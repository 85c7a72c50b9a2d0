use dispatchr::{
    Dispatcher, DispatchrConfig, JobStore, RedisJobStore, WorkerPoolBuilder,
    shutdown::{shutdown_handler, wait_for_signal},
};
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = DispatchrConfig::from_env()?;
    info!(
        redis = %config.queue.redis_url,
        worker_id = %config.worker.worker_id,
        concurrency = config.worker.concurrency,
        "starting dispatchr worker"
    );

    let store: Arc<dyn JobStore> = Arc::new(RedisJobStore::new(config.queue.clone()).await?);
    let dispatcher = Dispatcher::new(config.dispatcher.clone())?;
    let pool = WorkerPoolBuilder::new(store, dispatcher)
        .with_config(config.worker.clone())
        .build()?;

    let grace = config.worker.shutdown_timeout;
    // `run` returns first only on a store failure; exit non-zero so the
    // supervisor restarts us.
    tokio::select! {
        result = pool.run() => {
            if let Err(e) = &result {
                error!("worker stopped: {}", e);
            }
            result?;
        }
        stopped = shutdown_handler(wait_for_signal(), &pool, grace) => stopped?,
    }

    info!("dispatchr worker exited");
    Ok(())
}
