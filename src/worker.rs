// src/worker.rs
use crate::{
    AttemptContext, BackoffStrategy, Clock, Dispatcher, DispatchrError, JobState, JobStore,
    Result, SystemClock, shutdown::Stoppable, store::LeasedJob,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use tokio::{
    sync::{OwnedSemaphorePermit, Semaphore, mpsc},
    task::{JoinHandle, JoinSet},
    time::{Duration, MissedTickBehavior, interval, timeout},
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

/// How long forcibly cancelled attempts get to record their outcome.
const FORCE_CANCEL_WAIT: Duration = Duration::from_secs(5);

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Lease length; must outlast the dispatcher's request timeout.
    pub lease_ttl: Duration,
    pub reclaim_interval: Duration,
    pub shutdown_timeout: Duration,
    pub backoff: BackoffStrategy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            concurrency: 10,
            poll_interval: Duration::from_millis(100),
            lease_ttl: Duration::from_secs(60),
            reclaim_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            backoff: BackoffStrategy::default(),
        }
    }
}

/// Worker builder for fluent configuration
pub struct WorkerPoolBuilder {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
}

impl WorkerPoolBuilder {
    pub fn new(store: Arc<dyn JobStore>, dispatcher: Dispatcher) -> Self {
        Self {
            config: WorkerConfig::default(),
            store,
            dispatcher,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_config(mut self, config: WorkerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.config.worker_id = worker_id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.config.lease_ttl = ttl;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> Result<WorkerPool> {
        if self.config.concurrency == 0 {
            return Err(DispatchrError::Worker(
                "concurrency must be at least 1".to_string(),
            ));
        }
        // Otherwise a second worker can lease a job whose request is still open.
        if self.config.lease_ttl <= self.dispatcher.request_timeout() {
            return Err(DispatchrError::Worker(format!(
                "lease ttl ({:?}) must exceed request timeout ({:?})",
                self.config.lease_ttl,
                self.dispatcher.request_timeout()
            )));
        }
        Ok(WorkerPool::new(
            self.config,
            self.store,
            self.dispatcher,
            self.clock,
        ))
    }
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    completed: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
    lease_lost: AtomicU64,
}

/// Leases jobs, delivers them and records the outcome
pub struct WorkerPool {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    clock: Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
    /// Cancelled to stop leasing.
    shutdown: CancellationToken,
    /// Cancelled to abort in-flight attempts once the grace period is over.
    force: CancellationToken,
    /// Cancelled when `run` has finished draining.
    stopped: CancellationToken,
    grace: std::sync::Mutex<Duration>,
    is_running: AtomicBool,
    counters: Arc<Counters>,
}

impl WorkerPool {
    fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.concurrency));
        let grace = std::sync::Mutex::new(config.shutdown_timeout);

        Self {
            config,
            store,
            dispatcher,
            clock,
            semaphore,
            shutdown: CancellationToken::new(),
            force: CancellationToken::new(),
            stopped: CancellationToken::new(),
            grace,
            is_running: AtomicBool::new(false),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Token that stops leasing when cancelled. `stop` cancels it too.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shut down. Returns an error only when the store becomes
    /// unusable; per-attempt failures are recorded on the job instead.
    pub async fn run(&self) -> Result<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(DispatchrError::Worker(format!(
                "worker {} is already running",
                self.config.worker_id
            )));
        }

        info!(
            "Starting worker {} with concurrency {}",
            self.config.worker_id, self.config.concurrency
        );

        let reclaimer = self.spawn_reclaimer();
        let (fatal_tx, mut fatal_rx) = mpsc::unbounded_channel::<DispatchrError>();
        let mut attempts = JoinSet::new();

        let outcome = self.lease_loop(&mut attempts, &fatal_tx, &mut fatal_rx).await;

        // Stop leasing (also on the fatal path) and let in-flight attempts finish.
        self.shutdown.cancel();
        reclaimer.abort();
        self.drain(&mut attempts).await;

        // A store failure seen while draining still counts.
        let outcome = match (outcome, fatal_rx.try_recv()) {
            (Ok(()), Ok(err)) => Err(err),
            (outcome, _) => outcome,
        };

        self.is_running.store(false, Ordering::SeqCst);
        self.stopped.cancel();
        match &outcome {
            Ok(()) => info!("Worker {} shutdown complete", self.config.worker_id),
            Err(e) => error!("Worker {} stopped on store failure: {}", self.config.worker_id, e),
        }
        outcome
    }

    async fn lease_loop(
        &self,
        attempts: &mut JoinSet<()>,
        fatal_tx: &mpsc::UnboundedSender<DispatchrError>,
        fatal_rx: &mut mpsc::UnboundedReceiver<DispatchrError>,
    ) -> Result<()> {
        let mut poll = interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Take a slot before leasing so a lease is never held without one.
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Ok(()),
                Some(err) = fatal_rx.recv() => return Err(err),
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    log_join(joined);
                    continue;
                }
                permit = self.semaphore.clone().acquire_owned() => permit
                    .map_err(|_| DispatchrError::Worker("semaphore closed".to_string()))?,
            };

            let now = self.clock.now();
            match self
                .store
                .lease_next(&self.config.worker_id, now, self.config.lease_ttl)
                .await
            {
                Ok(Some(leased)) => self.spawn_attempt(attempts, leased, permit, fatal_tx.clone()),
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Ok(()),
                        Some(err) = fatal_rx.recv() => return Err(err),
                        _ = poll.tick() => {}
                    }
                }
                Err(e) => {
                    error!("Failed to lease job: {}", e);
                    return Err(e);
                }
            }
        }
    }

    fn spawn_attempt(
        &self,
        attempts: &mut JoinSet<()>,
        leased: LeasedJob,
        permit: OwnedSemaphorePermit,
        fatal_tx: mpsc::UnboundedSender<DispatchrError>,
    ) {
        let ctx = AttemptContext::new(leased, &self.config.worker_id, self.force.child_token());
        let store = Arc::clone(&self.store);
        let dispatcher = self.dispatcher.clone();
        let clock = Arc::clone(&self.clock);
        let backoff = self.config.backoff.clone();
        let counters = Arc::clone(&self.counters);

        attempts.spawn(async move {
            let _permit = permit; // Keep permit alive

            let job_id = ctx.job_id();
            if let Err(e) =
                Self::execute_job(store, dispatcher, clock, backoff, counters, ctx).await
            {
                error!("Failed to record outcome for job {}: {}", job_id, e);
                let _ = fatal_tx.send(e);
            }
        });
    }

    /// Lease and deliver a single due job inline. Returns the state the job
    /// ended in, or `None` when nothing was due or the lease was lost.
    pub async fn process_next(&self) -> Result<Option<JobState>> {
        let now = self.clock.now();
        let Some(leased) = self
            .store
            .lease_next(&self.config.worker_id, now, self.config.lease_ttl)
            .await?
        else {
            return Ok(None);
        };

        let ctx = AttemptContext::new(leased, &self.config.worker_id, self.force.child_token());
        Self::execute_job(
            Arc::clone(&self.store),
            self.dispatcher.clone(),
            Arc::clone(&self.clock),
            self.config.backoff.clone(),
            Arc::clone(&self.counters),
            ctx,
        )
        .await
    }

    #[instrument(skip_all, fields(job_id = %ctx.job.id, attempt = ctx.job.attempts))]
    async fn execute_job(
        store: Arc<dyn JobStore>,
        dispatcher: Dispatcher,
        clock: Arc<dyn Clock>,
        backoff: BackoffStrategy,
        counters: Arc<Counters>,
        ctx: AttemptContext,
    ) -> Result<Option<JobState>> {
        let job = &ctx.job;
        let result = dispatcher
            .dispatch(&job.target, &job.task_name, &job.payload, &ctx.cancel)
            .instrument(ctx.span.clone())
            .await;

        let now = clock.now();
        let transition = job.resolve(&result, now, &backoff);
        let state = transition.target_state();

        match store.finish(&ctx.lease, &transition, now).await {
            Ok(()) => {}
            Err(e) if e.is_contention() => {
                // The job was reclaimed or deleted; whatever happened to it stands.
                counters.lease_lost.fetch_add(1, Ordering::Relaxed);
                warn!("Abandoning attempt for job {}: {}", job.id, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }
        counters.processed.fetch_add(1, Ordering::Relaxed);

        let elapsed = ctx.started_at.elapsed();
        match state {
            JobState::Completed => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                info!("Job {} completed in {:?}", job.id, elapsed);
            }
            JobState::Retryable => {
                counters.retried.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Job {} attempt {}/{} failed, will retry: {}",
                    job.id, job.attempts, job.max_attempts, result.error_message
                );
            }
            _ => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Job {} failed after {} attempt(s): {}",
                    job.id, job.attempts, result.error_message
                );
            }
        }

        Ok(Some(state))
    }

    /// Wait out the grace period, then force-cancel whatever is left.
    async fn drain(&self, attempts: &mut JoinSet<()>) {
        if attempts.is_empty() {
            return;
        }

        let grace = *self.grace.lock().unwrap_or_else(|e| e.into_inner());
        info!(
            "Waiting up to {:?} for {} active jobs to complete...",
            grace,
            attempts.len()
        );

        if timeout(grace, join_all(attempts)).await.is_ok() {
            info!("All jobs completed successfully during shutdown");
            return;
        }

        warn!(
            "Shutdown timeout reached, cancelling {} in-flight jobs",
            attempts.len()
        );
        self.force.cancel();

        if timeout(FORCE_CANCEL_WAIT, join_all(attempts)).await.is_err() {
            warn!(
                "{} cancelled jobs did not record an outcome; their leases will expire",
                attempts.len()
            );
            attempts.abort_all();
        }
    }

    fn spawn_reclaimer(&self) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let clock = Arc::clone(&self.clock);
        let shutdown = self.shutdown.clone();
        let period = self.config.reclaim_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match store.reclaim_expired(clock.now()).await {
                    Ok(0) => {}
                    Ok(moved) => info!("Reclaimed {} jobs with expired leases", moved),
                    Err(e) => error!("Failed to reclaim expired leases: {}", e),
                }
            }
            debug!("Lease reclaimer stopping");
        })
    }

    /// Get worker statistics
    pub fn stats(&self) -> WorkerStats {
        let available = self.semaphore.available_permits();
        WorkerStats {
            worker_id: self.config.worker_id.clone(),
            concurrency: self.config.concurrency,
            active_jobs: self.config.concurrency.saturating_sub(available),
            is_shutting_down: self.shutdown.is_cancelled(),
            processed: self.counters.processed.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            lease_lost: self.counters.lease_lost.load(Ordering::Relaxed),
        }
    }
}

#[async_trait::async_trait]
impl Stoppable for WorkerPool {
    /// Stop leasing and wait for the pool to drain. In-flight attempts get
    /// `deadline` before they are cancelled.
    async fn stop(&self, deadline: Duration) -> Result<()> {
        info!("Stop requested for worker {}", self.config.worker_id);
        *self.grace.lock().unwrap_or_else(|e| e.into_inner()) = deadline;
        self.shutdown.cancel();

        if !self.is_running.load(Ordering::SeqCst) {
            return Ok(());
        }

        timeout(deadline + FORCE_CANCEL_WAIT * 2, self.stopped.cancelled())
            .await
            .map_err(|_| {
                DispatchrError::Worker(format!(
                    "worker {} did not stop within {:?}",
                    self.config.worker_id, deadline
                ))
            })
    }
}

async fn join_all(attempts: &mut JoinSet<()>) {
    while let Some(joined) = attempts.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Attempt task panicked: {}", e);
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerStats {
    pub worker_id: String,
    pub concurrency: usize,
    pub active_jobs: usize,
    pub is_shutting_down: bool,
    /// Attempts whose outcome was recorded on the job
    pub processed: u64,
    pub completed: u64,
    pub retried: u64,
    pub failed: u64,
    pub lease_lost: u64,
}
