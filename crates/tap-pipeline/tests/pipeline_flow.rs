// End-to-end job flow against the in-memory stores: enqueue, drain the
// worker pool, then inspect the queue, canonical records and assignments.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use tap_adapters::{
    AdapterError, BroadcastChannel, InferenceClient, InferenceError, InferenceRequest,
    InferenceResponse, OutboundMessage, SectorTable, Taxonomy,
};
use tap_core::{
    Clock, DecisionKind, DispatchChannel, JobState, ManualClock, PipelineVersion, RawEvent,
};
use tap_pipeline::{Collaborators, Pipeline, PipelineConfig, Stores, WorkerPool};
use tap_storage::{
    AssignmentStore, CanonicalStore, JobQueue, MemoryAssignmentStore, MemoryJobQueue,
    MemoryRecordStore, VersionRegistry,
};

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().expect("ts")
}

fn draft() -> serde_json::Value {
    json!({
        "schema_version": 2,
        "is_assignment": true,
        "subjects": ["Math"],
        "level": "Sec 3",
        "rate": "$60/hr",
        "location": "Tampines St 81",
        "postal_code": "520123",
        "availability": "Mon, Wed 3-5pm",
        "agency": "Bright Minds",
        "assignment_code": "BM-1029",
        "confidence": {"rate": 0.9}
    })
}

/// Replies with whatever draft is loaded, after `outages` unavailable replies.
/// With `stall` set, each call moves the clock forward like a slow backend.
struct Scripted {
    draft: Mutex<serde_json::Value>,
    outages: AtomicU32,
    calls: AtomicU32,
    stall: Mutex<Option<(ManualClock, chrono::Duration)>>,
}

impl Scripted {
    fn new() -> Self {
        Self {
            draft: Mutex::new(draft()),
            outages: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            stall: Mutex::new(None),
        }
    }

    fn load(&self, draft: serde_json::Value) {
        *self.draft.lock().expect("lock") = draft;
    }
}

#[async_trait]
impl InferenceClient for Scripted {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn infer(&self, _request: &InferenceRequest) -> Result<InferenceResponse, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some((clock, by)) = self.stall.lock().expect("lock").clone() {
            clock.advance(by);
        }
        let outage = self
            .outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(InferenceError::Unavailable("connection refused".into()));
        }
        Ok(InferenceResponse {
            model: "scripted".into(),
            raw: self.draft.lock().expect("lock").to_string(),
        })
    }
}

#[derive(Default)]
struct Board {
    down: AtomicBool,
    posts: Mutex<Vec<String>>,
}

#[async_trait]
impl BroadcastChannel for Board {
    async fn post(&self, message: &OutboundMessage) -> Result<String, AdapterError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(AdapterError::Unavailable("board down".into()));
        }
        let mut posts = self.posts.lock().expect("lock");
        posts.push(message.text.clone());
        Ok(format!("post-{}", posts.len()))
    }

    async fn retract(&self, _post_ref: &str) -> Result<(), AdapterError> {
        Ok(())
    }
}

struct Harness {
    clock: ManualClock,
    queue: Arc<MemoryJobQueue>,
    records: Arc<MemoryRecordStore>,
    assignments: Arc<MemoryAssignmentStore>,
    inference: Arc<Scripted>,
    spool: tempfile::TempDir,
    base: Vec<(String, String)>,
}

impl Harness {
    fn new(settings: &[(&str, &str)]) -> Self {
        let clock = ManualClock::new(t0());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let spool = tempfile::tempdir().expect("spool dir");
        let mut base = vec![
            ("TAP_SPOOL_DIR".to_string(), spool.path().display().to_string()),
            ("TAP_BACKOFF_BASE_MS".to_string(), "1000".to_string()),
            ("TAP_BACKOFF_MAX_SECS".to_string(), "60".to_string()),
        ];
        base.extend(settings.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        let config = config_from(&base);
        Self {
            queue: Arc::new(MemoryJobQueue::new(shared.clone(), config.queue_settings())),
            records: Arc::new(MemoryRecordStore::new(shared)),
            assignments: Arc::new(MemoryAssignmentStore::new()),
            inference: Arc::new(Scripted::new()),
            clock,
            spool,
            base,
        }
    }

    fn config(&self, version: &str) -> PipelineConfig {
        let mut pairs = self.base.clone();
        pairs.push(("TAP_PIPELINE_VERSION".to_string(), version.to_string()));
        config_from(&pairs)
    }

    fn pipeline(&self, version: &str, board: Option<Arc<Board>>) -> Arc<Pipeline> {
        let stores = Stores {
            queue: self.queue.clone(),
            raw: self.records.clone(),
            records: self.records.clone(),
            versions: self.records.clone(),
            assignments: self.assignments.clone(),
        };
        let collaborators = Collaborators {
            inference: self.inference.clone(),
            taxonomy: Arc::new(Taxonomy::builtin()),
            geo: Arc::new(SectorTable::builtin()),
            broadcast: board.map(|b| b as Arc<dyn BroadcastChannel>),
            notifier: None,
            matcher: None,
        };
        let pipeline = Pipeline::new(&self.config(version), stores, collaborators, Arc::new(self.clock.clone()))
            .expect("pipeline");
        Arc::new(pipeline)
    }

    async fn drain(&self, pipeline: &Arc<Pipeline>) {
        let pool = WorkerPool::new(pipeline.clone(), self.config(pipeline.version().as_str()).worker_settings());
        pool.prepare().await.expect("prepare");
        pool.drain().await.expect("drain");
    }

    async fn post(&self, source_id: &str) {
        self.records
            .put_event(RawEvent::new(source_id, "chan-a", self.clock.now(), "Sec 3 Math @ Tampines $60/hr"))
            .await;
    }

    async fn job(&self, source_id: &str, version: &str) -> tap_core::ExtractionJob {
        self.queue
            .find(source_id, &PipelineVersion::new(version))
            .await
            .expect("find")
            .expect("job exists")
    }
}

fn config_from(pairs: &[(String, String)]) -> PipelineConfig {
    let vars = pairs.iter().cloned().collect::<HashMap<_, _>>();
    PipelineConfig::from_lookup(|key| vars.get(key).cloned())
}

#[tokio::test]
async fn repeat_sightings_go_duplicate_then_bump() {
    let h = Harness::new(&[]);
    let pipeline = h.pipeline("v1", None);
    let v1 = PipelineVersion::new("v1");

    h.post("S1").await;
    pipeline.enqueue("S1", &v1, false).await.expect("enqueue");
    h.drain(&pipeline).await;
    let job = h.job("S1", "v1").await;
    assert_eq!(job.state, JobState::Ok);
    assert_eq!(job.decision, Some(DecisionKind::Insert));
    let assignment_id = job.assignment_id.expect("assignment");

    h.clock.advance(chrono::Duration::hours(1));
    h.records.append_edit("S1", "Sec 3 Math @ Tampines $60/hr (still open)").await.expect("edit");
    pipeline.enqueue("S1", &v1, true).await.expect("re-enqueue");
    h.drain(&pipeline).await;
    let job = h.job("S1", "v1").await;
    assert_eq!(job.generation, 1);
    assert_eq!(job.decision, Some(DecisionKind::Duplicate));

    h.clock.advance(chrono::Duration::hours(6));
    h.records.append_edit("S1", "Sec 3 Math @ Tampines $60/hr (urgent)").await.expect("edit");
    pipeline.enqueue("S1", &v1, true).await.expect("re-enqueue");
    h.drain(&pipeline).await;
    let job = h.job("S1", "v1").await;
    assert_eq!(job.decision, Some(DecisionKind::Bump));
    assert_eq!(job.assignment_id, Some(assignment_id));

    let assignment = h
        .assignments
        .get_assignment(assignment_id)
        .await
        .expect("get")
        .expect("assignment");
    assert_eq!(assignment.bump_count, 2);
    assert_eq!(assignment.last_seen_at, t0() + chrono::Duration::hours(7));
    assert_eq!(h.assignments.count().await, 1);
    assert_eq!(h.inference.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn shadow_version_stays_out_of_persistence_until_promoted() {
    let h = Harness::new(&[]);
    let v1 = h.pipeline("v1", None);
    h.post("S1").await;
    v1.enqueue("S1", &PipelineVersion::new("v1"), false).await.expect("enqueue");
    h.drain(&v1).await;

    h.inference.load({
        let mut next = draft();
        next["rate"] = json!("$70/hr");
        next
    });
    let v2 = h.pipeline("v2", None);
    let version = PipelineVersion::new("v2");
    v2.enqueue("S1", &version, false).await.expect("enqueue");
    h.drain(&v2).await;

    let shadow = h.job("S1", "v2").await;
    assert_eq!(shadow.state, JobState::Ok);
    assert_eq!(shadow.decision, None);
    assert_eq!(shadow.assignment_id, None);
    assert!(h.records.latest_record("S1", &version).await.expect("latest").is_some());
    assert_eq!(h.assignments.count().await, 1);

    let comparison = v2
        .compare_versions(&PipelineVersion::new("v1"), &version)
        .await
        .expect("compare");
    assert_eq!(comparison.changed.len(), 1);
    assert!(comparison.changed[0].fingerprint_changed);
    assert_eq!(comparison.changed[0].changed_fields, vec!["rate".to_string()]);

    let summary = v2.promote(&version, false).await.expect("promote");
    assert_eq!(summary.applied, 1);
    assert_eq!(summary.decisions.get("merge"), Some(&1));
    assert_eq!(h.records.active_version().await.expect("active"), Some(version));
    assert_eq!(h.assignments.count().await, 1);
}

#[tokio::test]
async fn enforce_mode_fails_the_job_without_an_assignment() {
    let h = Harness::new(&[("TAP_HARDENING_MODE", "enforce")]);
    h.inference.load({
        let mut next = draft();
        next["rate"] = serde_json::Value::Null;
        next
    });
    let pipeline = h.pipeline("v1", None);
    h.post("S1").await;
    pipeline.enqueue("S1", &PipelineVersion::new("v1"), false).await.expect("enqueue");
    h.drain(&pipeline).await;

    let job = h.job("S1", "v1").await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.last_error.as_deref(), Some("ValidationFailed:rate_missing"));
    assert_eq!(job.attempts, 0);
    assert_eq!(h.assignments.count().await, 0);
}

#[tokio::test]
async fn transient_failures_retry_until_success_or_exhaustion() {
    let h = Harness::new(&[("TAP_MAX_ATTEMPTS", "3")]);
    let pipeline = h.pipeline("v1", None);
    let v1 = PipelineVersion::new("v1");
    h.post("S1").await;
    pipeline.enqueue("S1", &v1, false).await.expect("enqueue");

    h.inference.outages.store(2, Ordering::SeqCst);
    for _ in 0..3 {
        h.drain(&pipeline).await;
        h.clock.advance(chrono::Duration::minutes(5));
    }
    let job = h.job("S1", "v1").await;
    assert_eq!(job.state, JobState::Ok);
    assert_eq!(job.attempts, 2);

    h.post("S2").await;
    pipeline.enqueue("S2", &v1, false).await.expect("enqueue");
    h.inference.outages.store(10, Ordering::SeqCst);
    for _ in 0..4 {
        h.drain(&pipeline).await;
        h.clock.advance(chrono::Duration::minutes(5));
    }
    let job = h.job("S2", "v1").await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 3);
    assert!(job
        .last_error
        .as_deref()
        .is_some_and(|e| e.starts_with("Transient:inference_unavailable")));
}

#[tokio::test]
async fn failed_broadcast_is_spooled_and_replayed_once() {
    let h = Harness::new(&[]);
    let board = Arc::new(Board::default());
    board.down.store(true, Ordering::SeqCst);
    let pipeline = h.pipeline("v1", Some(board.clone()));
    h.post("S1").await;
    pipeline.enqueue("S1", &PipelineVersion::new("v1"), false).await.expect("enqueue");
    h.drain(&pipeline).await;

    let job = h.job("S1", "v1").await;
    assert_eq!(job.state, JobState::Ok);
    assert!(board.posts.lock().expect("lock").is_empty());
    assert_eq!(std::fs::read_dir(h.spool.path()).expect("spool").count(), 1);

    board.down.store(false, Ordering::SeqCst);
    let summary = pipeline.replay_spool().await.expect("replay");
    assert_eq!(summary.replayed, 1);
    assert_eq!(board.posts.lock().expect("lock").len(), 1);

    let again = pipeline.replay_spool().await.expect("replay");
    assert_eq!(again.replayed, 0);
    assert_eq!(board.posts.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn startup_reconciliation_dispatches_jobs_that_skipped_side_effects() {
    let h = Harness::new(&[]);
    let quiet = h.pipeline("v1", None);
    h.post("S1").await;
    quiet.enqueue("S1", &PipelineVersion::new("v1"), false).await.expect("enqueue");
    h.drain(&quiet).await;
    let assignment_id = h.job("S1", "v1").await.assignment_id.expect("assignment");
    assert!(h.assignments.dispatches_for(assignment_id).await.expect("dispatches").is_empty());

    let board = Arc::new(Board::default());
    let loud = h.pipeline("v1", Some(board.clone()));
    let pool = WorkerPool::new(loud.clone(), h.config("v1").worker_settings());
    pool.prepare().await.expect("prepare");
    assert_eq!(board.posts.lock().expect("lock").len(), 1);
    let dispatches = h.assignments.dispatches_for(assignment_id).await.expect("dispatches");
    assert_eq!(dispatches.len(), 1);
    assert_eq!(dispatches[0].channel, DispatchChannel::Broadcast);

    pool.prepare().await.expect("prepare again");
    assert_eq!(board.posts.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn deleted_source_is_skipped_and_closes_its_assignment() {
    let h = Harness::new(&[]);
    let pipeline = h.pipeline("v1", None);
    let v1 = PipelineVersion::new("v1");
    h.post("S1").await;
    pipeline.enqueue("S1", &v1, false).await.expect("enqueue");
    h.drain(&pipeline).await;
    let assignment_id = h.job("S1", "v1").await.assignment_id.expect("assignment");

    h.clock.advance(chrono::Duration::minutes(30));
    h.records.mark_deleted("S1").await.expect("delete");
    pipeline.enqueue("S1", &v1, true).await.expect("re-enqueue");
    h.drain(&pipeline).await;

    let job = h.job("S1", "v1").await;
    assert_eq!(job.state, JobState::Skipped);
    assert_eq!(job.last_error.as_deref(), Some("deleted"));
    let assignment = h
        .assignments
        .get_assignment(assignment_id)
        .await
        .expect("get")
        .expect("assignment");
    assert!(!assignment.is_open());
    assert_eq!(assignment.close_reason.as_deref(), Some("source_deleted"));
}

#[tokio::test]
async fn drain_dead_letters_a_crashed_lease_with_no_attempts_left() {
    let h = Harness::new(&[("TAP_MAX_ATTEMPTS", "1"), ("TAP_LEASE_TTL_SECS", "60")]);
    let pipeline = h.pipeline("v1", None);
    h.post("S1").await;
    pipeline.enqueue("S1", &PipelineVersion::new("v1"), false).await.expect("enqueue");
    let claimed = h
        .queue
        .claim("crashed", 1, std::time::Duration::from_secs(60))
        .await
        .expect("claim");
    assert_eq!(claimed.len(), 1);

    h.clock.advance(chrono::Duration::hours(1));
    h.drain(&pipeline).await;

    let job = h.job("S1", "v1").await;
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.claimed_by, None);
    assert_eq!(job.last_error.as_deref(), Some("Permanent:lease_expired"));
    assert_eq!(h.inference.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn batch_jobs_whose_lease_ran_out_are_left_for_reclaim() {
    let h = Harness::new(&[("TAP_BATCH_SIZE", "2"), ("TAP_LEASE_TTL_SECS", "60")]);
    let pipeline = h.pipeline("v1", None);
    let v1 = PipelineVersion::new("v1");
    h.post("S1").await;
    pipeline.enqueue("S1", &v1, false).await.expect("enqueue");
    h.clock.advance(chrono::Duration::seconds(1));
    h.post("S2").await;
    pipeline.enqueue("S2", &v1, false).await.expect("enqueue");

    *h.inference.stall.lock().expect("lock") = Some((h.clock.clone(), chrono::Duration::seconds(90)));
    let pool = WorkerPool::new(pipeline.clone(), h.config("v1").worker_settings());
    pool.prepare().await.expect("prepare");
    let snapshot = pool.drain().await.expect("drain");

    assert_eq!(snapshot.lease_lost, 1);
    assert_eq!(snapshot.ok, 2);
    assert_eq!(h.inference.calls.load(Ordering::SeqCst), 2);
    let first = h.job("S1", "v1").await;
    assert_eq!(first.state, JobState::Ok);
    assert_eq!(first.attempts, 0);
    // The lapsed lease counts as an attempt once the job is reclaimed.
    let second = h.job("S2", "v1").await;
    assert_eq!(second.state, JobState::Ok);
    assert_eq!(second.attempts, 1);
}
