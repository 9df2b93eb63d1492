//! Worker pool: independent claim loops over the shared queue.
//!
//! Each worker runs its claimed jobs one at a time; parallelism comes from the
//! number of workers. This is the only place where stage outcomes turn into
//! queue transitions.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tap_core::{ExtractionJob, JobOutcome, Outcome, ReleaseReason};
use tap_storage::ReleaseResult;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, field, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::heartbeat::{write_heartbeat, Heartbeat};
use crate::pipeline::Pipeline;

pub const POOL_COMPONENT: &str = "worker-pool";

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub workers: usize,
    pub batch_size: usize,
    pub lease_ttl: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Duration,
    /// How far back start-up reconciliation looks for undispatched jobs.
    pub reconcile_window: chrono::Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            batch_size: 8,
            lease_ttl: Duration::from_secs(300),
            poll_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            reconcile_window: chrono::Duration::hours(24),
        }
    }
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    claimed: AtomicU64,
    ok: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    lease_lost: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub claimed: u64,
    pub ok: u64,
    pub skipped: u64,
    pub failed: u64,
    pub retried: u64,
    pub lease_lost: u64,
}

impl PoolCounters {
    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            claimed: self.claimed.load(Ordering::Relaxed),
            ok: self.ok.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerPool {
    pipeline: Arc<Pipeline>,
    settings: WorkerSettings,
    heartbeat_dir: Option<PathBuf>,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    pub fn new(pipeline: Arc<Pipeline>, settings: WorkerSettings) -> Self {
        Self {
            pipeline,
            settings,
            heartbeat_dir: None,
            counters: Arc::new(PoolCounters::default()),
        }
    }

    pub fn with_heartbeat(mut self, dir: impl Into<PathBuf>) -> Self {
        self.heartbeat_dir = Some(dir.into());
        self
    }

    pub fn counters(&self) -> PoolSnapshot {
        self.counters.snapshot()
    }

    /// Registers the configured version and replays dispatch for recent jobs
    /// that completed without it.
    pub async fn prepare(&self) -> Result<()> {
        let version = self.pipeline.version().clone();
        self.pipeline
            .versions()
            .register_version(&version)
            .await
            .with_context(|| format!("registering pipeline version {version}"))?;
        let replayed = self
            .pipeline
            .reconcile_dispatches(self.settings.reconcile_window)
            .await
            .context("reconciling dispatches")?;
        if replayed > 0 {
            info!(replayed, "re-dispatched jobs that completed without side effects");
        }
        Ok(())
    }

    /// Runs until `shutdown` flips to `true`. Claimed jobs that have not
    /// started by then go back to the queue.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<PoolSnapshot> {
        self.prepare().await?;
        info!(
            workers = self.settings.workers,
            batch_size = self.settings.batch_size,
            pipeline_version = %self.pipeline.version(),
            "worker pool starting"
        );

        let mut tasks = JoinSet::new();
        for index in 0..self.settings.workers.max(1) {
            let worker_id = format!("worker-{index}-{}", Uuid::new_v4().simple());
            let pipeline = self.pipeline.clone();
            let settings = self.settings.clone();
            let counters = self.counters.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                worker_loop(pipeline, worker_id, settings, counters, shutdown).await;
            });
        }
        if let Some(dir) = self.heartbeat_dir.clone() {
            let pipeline = self.pipeline.clone();
            let counters = self.counters.clone();
            let interval = self.settings.heartbeat_interval;
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                heartbeat_loop(pipeline, dir, interval, counters, shutdown).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "worker task panicked");
            }
        }

        let snapshot = self.counters.snapshot();
        if let Some(dir) = &self.heartbeat_dir {
            let beat = pool_heartbeat(&self.pipeline, snapshot).with("state", "stopped");
            if let Err(err) = write_heartbeat(dir, &beat).await {
                warn!(error = %format!("{err:#}"), "final heartbeat failed");
            }
        }
        info!(?snapshot, "worker pool stopped");
        Ok(snapshot)
    }

    /// Processes claimable jobs on the calling task until none are left.
    pub async fn drain(&self) -> Result<PoolSnapshot> {
        let worker_id = format!("drain-{}", Uuid::new_v4().simple());
        loop {
            reap_expired(&self.pipeline).await;
            let jobs = self
                .pipeline
                .queue()
                .claim(&worker_id, self.settings.batch_size.max(1), self.settings.lease_ttl)
                .await
                .context("claiming jobs")?;
            if jobs.is_empty() {
                break;
            }
            self.counters
                .claimed
                .fetch_add(jobs.len() as u64, Ordering::Relaxed);
            for job in jobs {
                if lease_lapsed(&self.pipeline, &job, &self.counters) {
                    continue;
                }
                run_job(&self.pipeline, &worker_id, job, &self.counters).await;
            }
        }
        Ok(self.counters.snapshot())
    }
}

async fn worker_loop(
    pipeline: Arc<Pipeline>,
    worker_id: String,
    settings: WorkerSettings,
    counters: Arc<PoolCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(%worker_id, "worker started");
    while !*shutdown.borrow() {
        reap_expired(&pipeline).await;
        let jobs = match pipeline
            .queue()
            .claim(&worker_id, settings.batch_size.max(1), settings.lease_ttl)
            .await
        {
            Ok(jobs) => jobs,
            Err(err) => {
                error!(%worker_id, error = %err, "claim failed");
                idle(&mut shutdown, settings.poll_interval).await;
                continue;
            }
        };
        if jobs.is_empty() {
            idle(&mut shutdown, settings.poll_interval).await;
            continue;
        }
        counters
            .claimed
            .fetch_add(jobs.len() as u64, Ordering::Relaxed);

        let mut jobs = jobs.into_iter();
        while let Some(job) = jobs.next() {
            if *shutdown.borrow() {
                release_for_shutdown(&pipeline, &worker_id, std::iter::once(job).chain(jobs.by_ref())).await;
                break;
            }
            if lease_lapsed(&pipeline, &job, &counters) {
                continue;
            }
            run_job(&pipeline, &worker_id, job, &counters).await;
        }
    }
    debug!(%worker_id, "worker stopped");
}

async fn idle(shutdown: &mut watch::Receiver<bool>, poll_interval: Duration) {
    tokio::select! {
        _ = shutdown.changed() => {}
        _ = tokio::time::sleep(poll_interval) => {}
    }
}

/// Dead-letters processing jobs whose lease expired with no attempts left.
/// Claim never picks those up, so every claim loop sweeps them first.
async fn reap_expired(pipeline: &Pipeline) {
    match pipeline.queue().fail_exhausted().await {
        Ok(0) => {}
        Ok(failed) => warn!(failed, "dead-lettered jobs with expired leases"),
        Err(err) => warn!(error = %err, "lease sweep failed"),
    }
}

/// A batch is leased at claim time; a job whose lease ran out while earlier
/// jobs were running may already belong to another worker.
fn lease_lapsed(pipeline: &Pipeline, job: &ExtractionJob, counters: &PoolCounters) -> bool {
    if job.lease_is_live(pipeline.clock().now()) {
        return false;
    }
    counters.lease_lost.fetch_add(1, Ordering::Relaxed);
    warn!(
        job_id = %job.job_id,
        lease_expires_at = ?job.lease_expires_at,
        "lease expired before the job started; leaving it for reclaim"
    );
    true
}

async fn release_for_shutdown(
    pipeline: &Pipeline,
    worker_id: &str,
    jobs: impl Iterator<Item = ExtractionJob>,
) {
    for job in jobs {
        match pipeline
            .queue()
            .release(job.job_id, worker_id, ReleaseReason::Shutdown)
            .await
        {
            Ok(_) => debug!(job_id = %job.job_id, "released unstarted job for shutdown"),
            Err(err) => warn!(job_id = %job.job_id, error = %err, "shutdown release failed; lease will expire"),
        }
    }
}

/// Runs one claimed job and records its outcome on the queue.
pub async fn run_job(pipeline: &Pipeline, worker_id: &str, job: ExtractionJob, counters: &PoolCounters) {
    let span = info_span!(
        "job",
        job_id = %job.job_id,
        source_id = %job.source_id,
        pipeline_version = %job.pipeline_version,
        attempt = job.attempts + 1,
        worker_id,
        stage = field::Empty,
    );
    async {
        let outcome = pipeline.process(&job).await;
        let queue = pipeline.queue();
        let result = match outcome {
            Outcome::Ok(done) => {
                let counter = match &done {
                    JobOutcome::Ok { .. } => &counters.ok,
                    JobOutcome::Skipped(reason) => {
                        info!(%reason, "job skipped");
                        &counters.skipped
                    }
                    JobOutcome::Failed(_) => &counters.failed,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                queue.complete(job.job_id, worker_id, done).await.map(|held| held.then_some(()))
            }
            Outcome::Retry(reason) => {
                match queue
                    .release(job.job_id, worker_id, ReleaseReason::Transient(reason.clone()))
                    .await
                {
                    Ok(ReleaseResult::Requeued { attempts, available_at }) => {
                        counters.retried.fetch_add(1, Ordering::Relaxed);
                        warn!(%reason, attempts, %available_at, "transient failure, job requeued");
                        Ok(Some(()))
                    }
                    Ok(ReleaseResult::DeadLettered { attempts }) => {
                        counters.failed.fetch_add(1, Ordering::Relaxed);
                        error!(%reason, attempts, "attempts exhausted, job dead-lettered");
                        Ok(Some(()))
                    }
                    Ok(ReleaseResult::LeaseLost) => Ok(None),
                    Err(err) => Err(err),
                }
            }
            Outcome::Fatal(reason) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                error!(%reason, "job failed permanently");
                queue
                    .complete(job.job_id, worker_id, JobOutcome::Failed(reason))
                    .await
                    .map(|held| held.then_some(()))
            }
        };
        match result {
            Ok(Some(())) => {}
            Ok(None) => {
                counters.lease_lost.fetch_add(1, Ordering::Relaxed);
                warn!("lease lost before the outcome was recorded");
            }
            Err(err) => error!(error = %err, "recording job outcome failed; lease will expire"),
        }
    }
    .instrument(span)
    .await
}

async fn heartbeat_loop(
    pipeline: Arc<Pipeline>,
    dir: PathBuf,
    every: Duration,
    counters: Arc<PoolCounters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = interval.tick() => {
                let beat = pool_heartbeat(&pipeline, counters.snapshot()).with("state", "running");
                if let Err(err) = write_heartbeat(&dir, &beat).await {
                    warn!(error = %format!("{err:#}"), "heartbeat write failed");
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }
    }
}

fn pool_heartbeat(pipeline: &Pipeline, snapshot: PoolSnapshot) -> Heartbeat {
    Heartbeat::new(POOL_COMPONENT, pipeline.clock().now())
        .with("pipeline_version", pipeline.version().as_str())
        .with("claimed", snapshot.claimed)
        .with("ok", snapshot.ok)
        .with("skipped", snapshot.skipped)
        .with("failed", snapshot.failed)
        .with("retried", snapshot.retried)
}
