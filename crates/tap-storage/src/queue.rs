//! Extraction job queue: enqueue, lease-based claim, complete and release.
//!
//! Every transition is a single conditional write per row. A job is owned by
//! at most one worker whose lease has not expired; crashed workers lose their
//! jobs purely through lease expiry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tap_core::{Clock, ExtractionJob, JobOutcome, JobState, PipelineVersion, ReleaseReason};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{to_chrono, BackoffPolicy, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    Created(Uuid),
    /// A job for the same `(source_id, pipeline_version)` already exists.
    Duplicate(Uuid),
    /// `force` reset an existing job back to pending.
    Reset(Uuid),
    /// `force` targeted a job whose lease is still live; left untouched.
    Busy(Uuid),
}

impl EnqueueResult {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueResult::Created(id)
            | EnqueueResult::Duplicate(id)
            | EnqueueResult::Reset(id)
            | EnqueueResult::Busy(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueResult::Created(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseResult {
    Requeued {
        attempts: u32,
        available_at: DateTime<Utc>,
    },
    DeadLettered {
        attempts: u32,
    },
    /// The caller no longer holds the lease.
    LeaseLost,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: BackoffPolicy {
                max_retries: 5,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(30 * 60),
                jitter: 0.5,
            },
        }
    }
}

impl QueueSettings {
    /// Delay before the next attempt after `attempts` failures.
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        self.backoff
            .sample_delay(attempts.saturating_sub(1) as usize)
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub version: Option<PipelineVersion>,
    pub completed_since: Option<DateTime<Utc>>,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StateCount {
    pub pipeline_version: PipelineVersion,
    pub state: JobState,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct QueueStats {
    pub counts: Vec<StateCount>,
    pub oldest_pending_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn count(&self, version: &PipelineVersion, state: JobState) -> u64 {
        self.counts
            .iter()
            .filter(|c| &c.pipeline_version == version && c.state == state)
            .map(|c| c.count)
            .sum()
    }

    pub fn total(&self, state: JobState) -> u64 {
        self.counts
            .iter()
            .filter(|c| c.state == state)
            .map(|c| c.count)
            .sum()
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        source_id: &str,
        version: &PipelineVersion,
        force: bool,
    ) -> StoreResult<EnqueueResult>;

    /// Atomically lease up to `batch_size` claimable jobs to `worker_id`.
    async fn claim(
        &self,
        worker_id: &str,
        batch_size: usize,
        lease_ttl: Duration,
    ) -> StoreResult<Vec<ExtractionJob>>;

    /// Move a leased job to its terminal state. Returns `false` when the lease was lost.
    async fn complete(&self, job_id: Uuid, worker_id: &str, outcome: JobOutcome)
        -> StoreResult<bool>;

    async fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason: ReleaseReason,
    ) -> StoreResult<ReleaseResult>;

    /// Dead-letter expired leases that have no attempts left.
    async fn fail_exhausted(&self) -> StoreResult<u64>;

    async fn get(&self, job_id: Uuid) -> StoreResult<Option<ExtractionJob>>;

    async fn find(
        &self,
        source_id: &str,
        version: &PipelineVersion,
    ) -> StoreResult<Option<ExtractionJob>>;

    async fn list(&self, filter: JobFilter) -> StoreResult<Vec<ExtractionJob>>;

    async fn stats(&self) -> StoreResult<QueueStats>;
}

#[derive(Debug, Default)]
struct MemoryQueueInner {
    jobs: HashMap<Uuid, ExtractionJob>,
    keys: HashMap<(String, PipelineVersion), Uuid>,
}

/// In-process queue with the same conditional semantics as the SQL queue.
///
/// All transitions happen under one lock, which stands in for the row-level
/// compare-and-set of the database implementation.
#[derive(Debug)]
pub struct MemoryJobQueue {
    clock: Arc<dyn Clock>,
    settings: QueueSettings,
    inner: Mutex<MemoryQueueInner>,
}

impl MemoryJobQueue {
    pub fn new(clock: Arc<dyn Clock>, settings: QueueSettings) -> Self {
        Self {
            clock,
            settings,
            inner: Mutex::new(MemoryQueueInner::default()),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }
}

fn reset_for_replay(job: &mut ExtractionJob, now: DateTime<Utc>) {
    if job.state != JobState::Pending {
        job.generation += 1;
    }
    job.state = JobState::Pending;
    job.attempts = 0;
    job.claimed_by = None;
    job.claimed_at = None;
    job.lease_expires_at = None;
    job.last_error = None;
    job.decision = None;
    job.assignment_id = None;
    job.updated_at = now;
}

fn holds_lease(job: &ExtractionJob, worker_id: &str) -> bool {
    job.state == JobState::Processing && job.claimed_by.as_deref() == Some(worker_id)
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        source_id: &str,
        version: &PipelineVersion,
        force: bool,
    ) -> StoreResult<EnqueueResult> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let key = (source_id.to_string(), version.clone());

        if let Some(existing_id) = inner.keys.get(&key).copied() {
            let Some(job) = inner.jobs.get_mut(&existing_id) else {
                return Ok(EnqueueResult::Duplicate(existing_id));
            };
            if !force {
                return Ok(EnqueueResult::Duplicate(existing_id));
            }
            if job.lease_is_live(now) {
                return Ok(EnqueueResult::Busy(existing_id));
            }
            reset_for_replay(job, now);
            return Ok(EnqueueResult::Reset(existing_id));
        }

        let job = ExtractionJob::new(source_id, version.clone(), self.settings.max_attempts, now);
        let job_id = job.job_id;
        inner.keys.insert(key, job_id);
        inner.jobs.insert(job_id, job);
        Ok(EnqueueResult::Created(job_id))
    }

    async fn claim(
        &self,
        worker_id: &str,
        batch_size: usize,
        lease_ttl: Duration,
    ) -> StoreResult<Vec<ExtractionJob>> {
        let now = self.clock.now();
        let lease_until = now + to_chrono(lease_ttl);
        let mut inner = self.inner.lock().await;

        let mut candidates = inner
            .jobs
            .values()
            .filter(|job| job.is_claimable(now))
            .map(|job| {
                (
                    job.lease_expires_at.unwrap_or(job.created_at),
                    job.created_at,
                    job.job_id,
                )
            })
            .collect::<Vec<_>>();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, _, job_id) in candidates.into_iter().take(batch_size) {
            let Some(job) = inner.jobs.get_mut(&job_id) else {
                continue;
            };
            if job.state == JobState::Processing {
                // Reclaiming an expired lease: the previous run counts as an attempt.
                job.attempts += 1;
                warn!(job_id = %job.job_id, previous = ?job.claimed_by, "reclaiming expired lease");
            }
            job.state = JobState::Processing;
            job.claimed_by = Some(worker_id.to_string());
            job.claimed_at = Some(now);
            job.lease_expires_at = Some(lease_until);
            job.updated_at = now;
            claimed.push(job.clone());
        }
        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed jobs");
        }
        Ok(claimed)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(false);
        };
        if !holds_lease(job, worker_id) {
            return Ok(false);
        }
        job.state = outcome.state();
        job.last_error = outcome.reason().map(ToString::to_string);
        if let JobOutcome::Ok {
            decision,
            assignment_id,
        } = outcome
        {
            job.decision = decision;
            job.assignment_id = assignment_id;
        }
        job.lease_expires_at = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason: ReleaseReason,
    ) -> StoreResult<ReleaseResult> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(ReleaseResult::LeaseLost);
        };
        if !holds_lease(job, worker_id) {
            return Ok(ReleaseResult::LeaseLost);
        }
        job.claimed_by = None;
        job.updated_at = now;

        match reason {
            ReleaseReason::Shutdown => {
                job.state = JobState::Pending;
                job.lease_expires_at = None;
                Ok(ReleaseResult::Requeued {
                    attempts: job.attempts,
                    available_at: now,
                })
            }
            ReleaseReason::Transient(message) => {
                job.attempts += 1;
                job.last_error = Some(message);
                if job.attempts >= job.max_attempts {
                    job.state = JobState::Failed;
                    job.lease_expires_at = None;
                    return Ok(ReleaseResult::DeadLettered {
                        attempts: job.attempts,
                    });
                }
                let available_at = now + to_chrono(self.settings.retry_delay(job.attempts));
                job.state = JobState::Pending;
                job.lease_expires_at = Some(available_at);
                Ok(ReleaseResult::Requeued {
                    attempts: job.attempts,
                    available_at,
                })
            }
        }
    }

    async fn fail_exhausted(&self) -> StoreResult<u64> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let mut failed = 0;
        for job in inner.jobs.values_mut() {
            let expired = job.state == JobState::Processing
                && job.lease_expires_at.map_or(true, |at| at < now);
            if expired && job.attempts + 1 >= job.max_attempts {
                job.attempts += 1;
                job.state = JobState::Failed;
                job.last_error = Some("Permanent:lease_expired".to_string());
                job.claimed_by = None;
                job.lease_expires_at = None;
                job.updated_at = now;
                failed += 1;
            }
        }
        Ok(failed)
    }

    async fn get(&self, job_id: Uuid) -> StoreResult<Option<ExtractionJob>> {
        Ok(self.inner.lock().await.jobs.get(&job_id).cloned())
    }

    async fn find(
        &self,
        source_id: &str,
        version: &PipelineVersion,
    ) -> StoreResult<Option<ExtractionJob>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .keys
            .get(&(source_id.to_string(), version.clone()))
            .and_then(|id| inner.jobs.get(id))
            .cloned())
    }

    async fn list(&self, filter: JobFilter) -> StoreResult<Vec<ExtractionJob>> {
        let inner = self.inner.lock().await;
        let mut jobs = inner
            .jobs
            .values()
            .filter(|j| filter.state.map_or(true, |s| j.state == s))
            .filter(|j| filter.version.as_ref().map_or(true, |v| &j.pipeline_version == v))
            .filter(|j| {
                filter
                    .completed_since
                    .map_or(true, |since| j.state.is_terminal() && j.updated_at >= since)
            })
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by_key(|j| (j.created_at, j.job_id));
        if filter.limit > 0 {
            jobs.truncate(filter.limit);
        }
        Ok(jobs)
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        let inner = self.inner.lock().await;
        let mut counts: BTreeMap<(PipelineVersion, &'static str), (JobState, u64)> =
            BTreeMap::new();
        for job in inner.jobs.values() {
            let entry = counts
                .entry((job.pipeline_version.clone(), job.state.as_str()))
                .or_insert((job.state, 0));
            entry.1 += 1;
        }
        let oldest_pending_at = inner
            .jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .map(|j| j.created_at)
            .min();
        Ok(QueueStats {
            counts: counts
                .into_iter()
                .map(|((pipeline_version, _), (state, count))| StateCount {
                    pipeline_version,
                    state,
                    count,
                })
                .collect(),
            oldest_pending_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tap_core::{DecisionKind, ManualClock};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().expect("ts")
    }

    fn queue(max_attempts: u32) -> (MemoryJobQueue, ManualClock) {
        let clock = ManualClock::new(t0());
        let settings = QueueSettings {
            max_attempts,
            backoff: BackoffPolicy {
                max_retries: 10,
                base_delay: Duration::from_secs(60),
                max_delay: Duration::from_secs(600),
                jitter: 0.0,
            },
        };
        (MemoryJobQueue::new(Arc::new(clock.clone()), settings), clock)
    }

    fn ok() -> JobOutcome {
        JobOutcome::Ok {
            decision: Some(DecisionKind::Insert),
            assignment_id: None,
        }
    }

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn enqueue_without_force_is_idempotent() {
        let (q, _) = queue(3);
        let v1 = PipelineVersion::new("v1");
        let first = q.enqueue("S1", &v1, false).await.expect("enqueue");
        assert!(first.is_created());
        let jobs = q.claim("w1", 10, TTL).await.expect("claim");
        assert!(q.complete(jobs[0].job_id, "w1", ok()).await.expect("complete"));

        let again = q.enqueue("S1", &v1, false).await.expect("enqueue");
        assert_eq!(again, EnqueueResult::Duplicate(first.job_id()));
        assert_eq!(q.list(JobFilter::default()).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn new_version_creates_disjoint_job() {
        let (q, _) = queue(3);
        let a = q.enqueue("S1", &"v1".into(), false).await.expect("v1");
        let b = q.enqueue("S1", &"v2".into(), false).await.expect("v2");
        assert!(a.is_created() && b.is_created());
        assert_ne!(a.job_id(), b.job_id());
    }

    #[tokio::test]
    async fn force_resets_terminal_job_and_bumps_generation() {
        let (q, _) = queue(3);
        let v1 = PipelineVersion::new("v1");
        let id = q.enqueue("S1", &v1, false).await.expect("enqueue").job_id();
        q.claim("w1", 1, TTL).await.expect("claim");
        q.complete(id, "w1", JobOutcome::Failed("Permanent:x".into()))
            .await
            .expect("complete");

        let reset = q.enqueue("S1", &v1, true).await.expect("force");
        assert_eq!(reset, EnqueueResult::Reset(id));
        let job = q.get(id).await.expect("get").expect("job");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.generation, 1);
        assert_eq!(job.attempts, 0);
        assert!(job.last_error.is_none());
    }

    #[tokio::test]
    async fn force_never_resets_a_live_lease() {
        let (q, _) = queue(3);
        let v1 = PipelineVersion::new("v1");
        let id = q.enqueue("S1", &v1, false).await.expect("enqueue").job_id();
        q.claim("w1", 1, TTL).await.expect("claim");
        assert_eq!(
            q.enqueue("S1", &v1, true).await.expect("force"),
            EnqueueResult::Busy(id)
        );
        assert!(q.claim("w2", 1, TTL).await.expect("claim").is_empty());
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_lease_expires() {
        let (q, clock) = queue(3);
        let id = q.enqueue("S1", &"v1".into(), false).await.expect("e").job_id();

        let w1 = q.claim("w1", 5, TTL).await.expect("claim");
        assert_eq!(w1.len(), 1);
        assert!(q.claim("w2", 5, TTL).await.expect("claim").is_empty());

        clock.advance(chrono::Duration::seconds(301));
        let w2 = q.claim("w2", 5, TTL).await.expect("claim");
        assert_eq!(w2.len(), 1);
        assert_eq!(w2[0].job_id, id);
        assert_eq!(w2[0].attempts, 1);

        // The stale worker can no longer finish the job.
        assert!(!q.complete(id, "w1", ok()).await.expect("complete"));
        assert!(q.complete(id, "w2", ok()).await.expect("complete"));
    }

    #[tokio::test]
    async fn transient_failures_then_success_end_ok() {
        let (q, clock) = queue(3);
        let id = q.enqueue("S1", &"v1".into(), false).await.expect("e").job_id();

        for attempt in 1..=2u32 {
            q.claim("w", 1, TTL).await.expect("claim");
            let res = q
                .release(id, "w", ReleaseReason::Transient("timeout".into()))
                .await
                .expect("release");
            assert!(matches!(res, ReleaseResult::Requeued { attempts, .. } if attempts == attempt));
            // Not claimable until the backoff elapses.
            assert!(q.claim("w", 1, TTL).await.expect("claim").is_empty());
            clock.advance(chrono::Duration::minutes(30));
        }

        assert_eq!(q.claim("w", 1, TTL).await.expect("claim").len(), 1);
        assert!(q.complete(id, "w", ok()).await.expect("complete"));
        let job = q.get(id).await.expect("get").expect("job");
        assert_eq!(job.state, JobState::Ok);
        assert_eq!(job.decision, Some(DecisionKind::Insert));
    }

    #[tokio::test]
    async fn max_attempts_transient_failures_dead_letter() {
        let (q, clock) = queue(3);
        let id = q.enqueue("S1", &"v1".into(), false).await.expect("e").job_id();
        let mut last = None;
        for _ in 0..3 {
            q.claim("w", 1, TTL).await.expect("claim");
            last = Some(
                q.release(id, "w", ReleaseReason::Transient("down".into()))
                    .await
                    .expect("release"),
            );
            clock.advance(chrono::Duration::hours(1));
        }
        assert_eq!(last, Some(ReleaseResult::DeadLettered { attempts: 3 }));
        assert_eq!(
            q.get(id).await.expect("get").expect("job").state,
            JobState::Failed
        );
        assert!(q.claim("w", 1, TTL).await.expect("claim").is_empty());
    }

    #[tokio::test]
    async fn shutdown_release_does_not_consume_attempt() {
        let (q, _) = queue(3);
        let id = q.enqueue("S1", &"v1".into(), false).await.expect("e").job_id();
        q.claim("w", 1, TTL).await.expect("claim");
        q.release(id, "w", ReleaseReason::Shutdown).await.expect("release");
        let job = q.get(id).await.expect("get").expect("job");
        assert_eq!(job.attempts, 0);
        assert_eq!(q.claim("w", 1, TTL).await.expect("claim").len(), 1);
    }

    #[tokio::test]
    async fn exhausted_expired_leases_are_dead_lettered() {
        let (q, clock) = queue(2);
        let id = q.enqueue("S1", &"v1".into(), false).await.expect("e").job_id();
        q.claim("w1", 1, TTL).await.expect("claim");
        clock.advance(chrono::Duration::seconds(301));
        // attempts(0) + 1 < 2 so it is reclaimed once.
        assert_eq!(q.claim("w2", 1, TTL).await.expect("claim").len(), 1);
        clock.advance(chrono::Duration::seconds(301));
        assert!(q.claim("w3", 1, TTL).await.expect("claim").is_empty());
        assert_eq!(q.fail_exhausted().await.expect("reap"), 1);
        let job = q.get(id).await.expect("get").expect("job");
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.last_error.as_deref(), Some("Permanent:lease_expired"));
    }

    #[tokio::test]
    async fn concurrent_claimers_never_share_a_job() {
        let (q, _) = queue(3);
        let q = Arc::new(q);
        for i in 0..40 {
            q.enqueue(&format!("S{i}"), &"v1".into(), false)
                .await
                .expect("enqueue");
        }
        let mut handles = Vec::new();
        for w in 0..8 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                q.claim(&format!("w{w}"), 7, TTL).await.expect("claim")
            }));
        }
        let mut seen = std::collections::HashSet::new();
        for handle in handles {
            for job in handle.await.expect("join") {
                assert!(seen.insert(job.job_id), "job claimed twice");
            }
        }
        assert_eq!(seen.len(), 40);
    }

    #[tokio::test]
    async fn stats_group_by_version_and_state() {
        let (q, _) = queue(3);
        q.enqueue("S1", &"v1".into(), false).await.expect("e");
        q.enqueue("S2", &"v1".into(), false).await.expect("e");
        q.enqueue("S1", &"v2".into(), false).await.expect("e");
        q.claim("w", 1, TTL).await.expect("claim");
        let stats = q.stats().await.expect("stats");
        assert_eq!(stats.total(JobState::Pending), 2);
        assert_eq!(stats.total(JobState::Processing), 1);
        assert_eq!(stats.count(&"v2".into(), JobState::Processing)
            + stats.count(&"v2".into(), JobState::Pending), 1);
        assert_eq!(stats.oldest_pending_at, Some(t0()));
    }
}
