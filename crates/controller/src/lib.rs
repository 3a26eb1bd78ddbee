//! Rudder controller engine: wires an informer, a deduplicating work queue
//! and a pool of worker tasks into at-least-once invocations of user
//! reconciliation logic, optionally gated behind leader election.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rudder_core::{ClusterObject, Handler, LeaderGate, Retriever};
use rudder_informer::{Informer, Store};
use rudder_queue::WorkQueue;

pub const DEFAULT_CONCURRENT_WORKERS: usize = 3;
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(3 * 60);
pub const DEFAULT_PROCESSING_JOB_RETRIES: u32 = 3;

/// Construction-time validation failures. The only error class that escapes
/// to the caller; everything at runtime is retried, dropped with a warning,
/// or a controlled exit.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("controller name must not be empty")]
    MissingName,
    #[error("concurrent_workers must be at least 1")]
    NoWorkers,
    #[error("resync_interval must be positive")]
    ZeroResync,
}

pub struct Config<O: ClusterObject> {
    /// Identifies the queue and log/metric streams.
    pub name: String,
    pub handler: Arc<dyn Handler<O>>,
    pub retriever: Arc<dyn Retriever<O>>,
    /// When set, workers do not start until leadership is acquired and stop
    /// if it is lost.
    pub leader_elector: Option<Arc<dyn LeaderGate>>,
    /// Max retries per key after the first attempt; total attempts = 1 + N.
    pub processing_job_retries: u32,
    pub resync_interval: Duration,
    pub concurrent_workers: usize,
}

impl<O: ClusterObject> Config<O> {
    pub fn new(
        name: impl Into<String>,
        retriever: Arc<dyn Retriever<O>>,
        handler: Arc<dyn Handler<O>>,
    ) -> Self {
        Self {
            name: name.into(),
            handler,
            retriever,
            leader_elector: None,
            processing_job_retries: DEFAULT_PROCESSING_JOB_RETRIES,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            concurrent_workers: DEFAULT_CONCURRENT_WORKERS,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.concurrent_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.resync_interval.is_zero() {
            return Err(ConfigError::ZeroResync);
        }
        Ok(())
    }
}

fn event_queue_cap() -> usize {
    std::env::var("RUDDER_EVENT_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|cap| *cap > 0)
        .unwrap_or(1024)
}

pub struct Controller<O: ClusterObject> {
    cfg: Config<O>,
}

impl<O: ClusterObject> Controller<O> {
    pub fn new(cfg: Config<O>) -> Result<Self, ConfigError> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    /// Run until `shutdown` fires or configured leadership is lost. Blocks
    /// through the initial list so the cache is warm before workers start.
    pub async fn run(self, shutdown: CancellationToken) {
        let cfg = self.cfg;

        // Leadership gate: nothing is listed or watched before the lease is
        // held. Loss of leadership cancels the run token, which is terminal.
        let run = match &cfg.leader_elector {
            Some(gate) => match gate.acquired(&shutdown).await {
                Some(token) => token,
                None => {
                    info!(controller = %cfg.name, "shutdown before leadership acquired");
                    return;
                }
            },
            None => shutdown.child_token(),
        };

        let store: Arc<Store<O>> = Arc::new(Store::new());
        let (events_tx, mut events_rx) = mpsc::channel(event_queue_cap());
        let mut informer = Informer::new(
            Arc::clone(&cfg.retriever),
            Arc::clone(&store),
            events_tx,
            cfg.resync_interval,
        );
        let queue = WorkQueue::new(cfg.name.clone());

        // Event-to-queue adapter. Only the key crosses this boundary: the
        // handler reconciles current state, never the transition. Started
        // ahead of the bootstrap so initial lists larger than the event
        // channel keep draining.
        let pump = tokio::spawn({
            let queue = queue.clone();
            async move {
                while let Some(ev) = events_rx.recv().await {
                    queue.add(ev.key);
                }
            }
        });

        if !informer.bootstrap(&run).await {
            queue.shutdown();
            return;
        }
        let informer_task = tokio::spawn(informer.run(run.clone()));

        info!(controller = %cfg.name, workers = cfg.concurrent_workers, "starting workers");
        let mut workers = Vec::with_capacity(cfg.concurrent_workers);
        for worker in 0..cfg.concurrent_workers {
            workers.push(tokio::spawn(worker_loop(WorkerCtx {
                name: cfg.name.clone(),
                worker,
                queue: queue.clone(),
                store: Arc::clone(&store),
                handler: Arc::clone(&cfg.handler),
                retries: cfg.processing_job_retries,
                run: run.clone(),
            })));
        }

        run.cancelled().await;
        info!(controller = %cfg.name, "stopping");
        queue.shutdown();
        for worker in workers {
            let _ = worker.await;
        }
        // The informer exits on cancellation; the pump drains until the
        // informer's sender is gone.
        let _ = informer_task.await;
        let _ = pump.await;
        info!(controller = %cfg.name, "stopped");
    }
}

struct WorkerCtx<O: ClusterObject> {
    name: String,
    worker: usize,
    queue: WorkQueue,
    store: Arc<Store<O>>,
    handler: Arc<dyn Handler<O>>,
    retries: u32,
    run: CancellationToken,
}

async fn worker_loop<O: ClusterObject>(ctx: WorkerCtx<O>) {
    debug!(controller = %ctx.name, worker = ctx.worker, "worker started");
    while let Some(key) = ctx.queue.get().await {
        // The cache is the source of truth; a miss means the key was deleted
        // and the final snapshot is parked as a tombstone. `None` reaches the
        // handler only when no snapshot was ever cached.
        let snapshot = ctx.store.get(&key).or_else(|| ctx.store.tombstone(&key));
        let started = Instant::now();
        let result = ctx.handler.handle(ctx.run.clone(), snapshot).await;
        histogram!(
            "processing_duration_ms",
            started.elapsed().as_secs_f64() * 1000.0
        );
        match result {
            Ok(()) => {
                counter!("processed_total", 1u64);
                ctx.store.clear_tombstone(&key);
                ctx.queue.forget(&key);
            }
            Err(err) => {
                counter!("processing_failures_total", 1u64);
                if ctx.queue.requeues(&key) < ctx.retries {
                    debug!(controller = %ctx.name, key = %key, error = %err,
                           "handler failed; requeueing with backoff");
                    ctx.queue.add_rate_limited(&key);
                } else {
                    warn!(controller = %ctx.name, key = %key, retries = ctx.retries, error = %err,
                          "handler retries exhausted; dropping key until next event or resync");
                    counter!("processing_dropped_total", 1u64);
                    ctx.store.clear_tombstone(&key);
                    ctx.queue.forget(&key);
                }
            }
        }
        ctx.queue.done(&key);
    }
    debug!(controller = %ctx.name, worker = ctx.worker, "worker stopped");
}
