//! Operator and scheduled work around the job path: enqueue and replay,
//! deletes, the age-out sweep, version promotion and comparison, dispatch
//! reconciliation and spool replay.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tap_core::{CanonicalRecord, DispatchStatus, JobState, PipelineVersion};
use tap_storage::{EnqueueResult, JobFilter};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

use crate::dispatch::SpoolReplaySummary;
use crate::heartbeat::{write_heartbeat, Heartbeat};
use crate::pipeline::Pipeline;

pub const INGESTER_COMPONENT: &str = "ingester";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnqueueSummary {
    pub created: usize,
    pub duplicate: usize,
    pub reset: usize,
    pub busy: usize,
}

impl EnqueueSummary {
    fn count(&mut self, result: &EnqueueResult) {
        match result {
            EnqueueResult::Created(_) => self.created += 1,
            EnqueueResult::Duplicate(_) => self.duplicate += 1,
            EnqueueResult::Reset(_) => self.reset += 1,
            EnqueueResult::Busy(_) => self.busy += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub closed: usize,
    pub retracted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromoteSummary {
    pub version: PipelineVersion,
    pub applied: usize,
    pub skipped_deleted: usize,
    pub decisions: BTreeMap<String, usize>,
    pub dispatched: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordDiff {
    pub source_id: String,
    pub fingerprint_changed: bool,
    pub changed_fields: Vec<String>,
    pub quality_delta: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionComparison {
    pub left: PipelineVersion,
    pub right: PipelineVersion,
    pub only_left: Vec<String>,
    pub only_right: Vec<String>,
    pub unchanged: usize,
    pub changed: Vec<RecordDiff>,
}

impl Pipeline {
    pub async fn enqueue(
        &self,
        source_id: &str,
        version: &PipelineVersion,
        force: bool,
    ) -> Result<EnqueueResult> {
        let result = self
            .queue
            .enqueue(source_id, version, force)
            .await
            .with_context(|| format!("enqueueing {source_id} for {version}"))?;
        debug!(source_id, pipeline_version = %version, ?result, "enqueued");
        self.touch_ingester(result).await;
        Ok(result)
    }

    /// Enqueues every known raw event (optionally only those observed since
    /// `since`) for `version`. Used for replays after a version bump.
    pub async fn enqueue_all(
        &self,
        version: &PipelineVersion,
        force: bool,
        since: Option<DateTime<Utc>>,
    ) -> Result<EnqueueSummary> {
        let source_ids = self
            .raw
            .list_source_ids(since)
            .await
            .context("listing raw events")?;
        let mut summary = EnqueueSummary::default();
        for source_id in source_ids {
            let result = self.enqueue(&source_id, version, force).await?;
            summary.count(&result);
        }
        info!(pipeline_version = %version, force, ?summary, "replay enqueued");
        Ok(summary)
    }

    async fn touch_ingester(&self, last: EnqueueResult) {
        let Some(dir) = &self.heartbeat_dir else {
            return;
        };
        let beat = Heartbeat::new(INGESTER_COMPONENT, self.clock.now())
            .with("last_job_id", last.job_id().to_string());
        if let Err(err) = write_heartbeat(dir, &beat).await {
            warn!(error = %format!("{err:#}"), "ingester heartbeat failed");
        }
    }

    /// Closes assignments fed only by `source_id` and retracts their posts.
    /// Best effort: the raw delete has already happened.
    pub async fn on_delete(&self, source_id: &str) -> Result<usize> {
        let closed = self
            .persistence
            .close_source(source_id, self.clock.now())
            .await
            .with_context(|| format!("closing assignments for {source_id}"))?;
        if !closed.is_empty() {
            info!(source_id, closed = closed.len(), "assignments closed after delete");
            if let Err(err) = self.dispatcher.retract_closed(&closed).await {
                warn!(source_id, error = %format!("{err:#}"), "retracting closed assignments failed");
            }
        }
        Ok(closed.len())
    }

    /// Ages out open assignments not seen within the configured maximum age.
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let closed = self
            .persistence
            .close_stale(self.assignment_max_age, self.clock.now())
            .await
            .context("closing stale assignments")?;
        let retracted = self.dispatcher.retract_closed(&closed).await?;
        let summary = SweepSummary {
            closed: closed.len(),
            retracted,
        };
        info!(?summary, "sweep finished");
        Ok(summary)
    }

    /// Makes `version` active and re-applies its canonical records through
    /// merge and persistence. Side effects run only when `dispatch` is set.
    pub async fn promote(&self, version: &PipelineVersion, dispatch: bool) -> Result<PromoteSummary> {
        self.versions
            .promote(version)
            .await
            .with_context(|| format!("promoting {version}"))?;

        let mut records = self
            .records
            .records_for_version(version)
            .await
            .context("loading canonical records")?;
        records.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });

        let mut summary = PromoteSummary {
            version: version.clone(),
            applied: 0,
            skipped_deleted: 0,
            decisions: BTreeMap::new(),
            dispatched: 0,
            failed: 0,
        };
        for record in records {
            let deleted = self
                .raw
                .get_event(&record.source_id)
                .await?
                .map_or(true, |raw| raw.is_deleted());
            if deleted {
                summary.skipped_deleted += 1;
                continue;
            }
            let persisted = match self.persistence.upsert(&record).await {
                Ok(persisted) => persisted,
                Err(err) => {
                    error!(source_id = %record.source_id, reason = %err, "promotion upsert failed");
                    summary.failed += 1;
                    continue;
                }
            };
            summary.applied += 1;
            *summary
                .decisions
                .entry(persisted.decision.as_str().to_string())
                .or_default() += 1;
            if dispatch && persisted.decision.requires_dispatch() {
                match self
                    .dispatcher
                    .dispatch(&persisted.assignment, &record, persisted.decision)
                    .await
                {
                    Ok(_) => summary.dispatched += 1,
                    Err(err) => {
                        warn!(source_id = %record.source_id, error = %format!("{err:#}"), "promotion dispatch failed");
                    }
                }
            }
        }
        info!(pipeline_version = %version, applied = summary.applied, failed = summary.failed, "version promoted");
        Ok(summary)
    }

    /// Per-source differences between the latest records of two versions.
    pub async fn compare_versions(
        &self,
        left: &PipelineVersion,
        right: &PipelineVersion,
    ) -> Result<VersionComparison> {
        let index = |records: Vec<CanonicalRecord>| {
            records
                .into_iter()
                .map(|r| (r.source_id.clone(), r))
                .collect::<BTreeMap<_, _>>()
        };
        let a = index(self.records.records_for_version(left).await?);
        let b = index(self.records.records_for_version(right).await?);

        let mut comparison = VersionComparison {
            left: left.clone(),
            right: right.clone(),
            only_left: a.keys().filter(|k| !b.contains_key(*k)).cloned().collect(),
            only_right: b.keys().filter(|k| !a.contains_key(*k)).cloned().collect(),
            unchanged: 0,
            changed: Vec::new(),
        };
        for (source_id, old) in &a {
            let Some(new) = b.get(source_id) else {
                continue;
            };
            let changed_fields = changed_fields(old, new)?;
            let fingerprint_changed = old.fingerprint != new.fingerprint;
            if changed_fields.is_empty() && !fingerprint_changed {
                comparison.unchanged += 1;
                continue;
            }
            comparison.changed.push(RecordDiff {
                source_id: source_id.clone(),
                fingerprint_changed,
                changed_fields,
                quality_delta: new.quality_score - old.quality_score,
            });
        }
        Ok(comparison)
    }

    /// Re-runs dispatch for recent `ok` jobs of the running version whose
    /// decision needed side effects but left no settled dispatch record.
    pub async fn reconcile_dispatches(&self, window: chrono::Duration) -> Result<usize> {
        if !self.dispatcher.is_enabled() {
            return Ok(0);
        }
        let jobs = self
            .queue
            .list(JobFilter {
                state: Some(JobState::Ok),
                version: Some(self.version.clone()),
                completed_since: Some(self.clock.now() - window),
                limit: 0,
            })
            .await
            .context("listing completed jobs")?;

        let mut replayed = 0usize;
        for job in jobs {
            let (Some(decision), Some(assignment_id)) = (job.decision, job.assignment_id) else {
                continue;
            };
            if !decision.requires_dispatch() {
                continue;
            }
            let record_id =
                CanonicalRecord::record_id_for(&job.source_id, &job.pipeline_version, job.generation);
            let dispatches = self
                .persistence
                .store()
                .dispatches_for(assignment_id)
                .await?
                .into_iter()
                .filter(|d| d.record_id == record_id)
                .collect::<Vec<_>>();
            let settled = !dispatches.is_empty()
                && dispatches.iter().all(|d| d.status != DispatchStatus::Pending);
            if settled {
                continue;
            }

            let Some(assignment) = self.persistence.store().get_assignment(assignment_id).await? else {
                continue;
            };
            if !assignment.is_open() {
                continue;
            }
            let Some(record) = self.records.get_record(record_id).await? else {
                warn!(job_id = %job.job_id, %record_id, "completed job has no stored record");
                continue;
            };
            info!(job_id = %job.job_id, %assignment_id, "replaying dispatch for completed job");
            self.dispatcher.dispatch(&assignment, &record, decision).await?;
            replayed += 1;
        }
        Ok(replayed)
    }

    pub async fn replay_spool(&self) -> Result<SpoolReplaySummary> {
        let summary = self.dispatcher.replay_spool().await?;
        info!(?summary, "spool replay finished");
        Ok(summary)
    }
}

/// Field names whose values differ between two records.
fn changed_fields(old: &CanonicalRecord, new: &CanonicalRecord) -> Result<Vec<String>> {
    let old = serde_json::to_value(&old.fields).context("serializing fields")?;
    let new = serde_json::to_value(&new.fields).context("serializing fields")?;
    let empty = serde_json::Map::new();
    let old = old.as_object().unwrap_or(&empty);
    let new = new.as_object().unwrap_or(&empty);
    let names = old.keys().chain(new.keys()).collect::<BTreeSet<_>>();
    Ok(names
        .into_iter()
        .filter(|name| {
            let value = |fields: &serde_json::Map<String, serde_json::Value>| {
                fields.get(*name).and_then(|f| f.get("value")).cloned()
            };
            value(old) != value(new)
        })
        .cloned()
        .collect())
}

/// Cron jobs for the age-out sweep and spool replay.
pub async fn build_scheduler(
    pipeline: Arc<Pipeline>,
    sweep_cron: &str,
    spool_cron: &str,
) -> Result<JobScheduler> {
    let scheduler = JobScheduler::new().await.context("creating scheduler")?;

    let sweep_pipeline = pipeline.clone();
    let sweep = Job::new_async(sweep_cron, move |_uuid, _lock| {
        let pipeline = sweep_pipeline.clone();
        Box::pin(async move {
            if let Err(err) = pipeline.sweep().await {
                error!(error = %format!("{err:#}"), "scheduled sweep failed");
            }
        })
    })
    .with_context(|| format!("creating sweep job for cron {sweep_cron}"))?;
    scheduler.add(sweep).await.context("adding sweep job")?;

    let spool_pipeline = pipeline;
    let spool = Job::new_async(spool_cron, move |_uuid, _lock| {
        let pipeline = spool_pipeline.clone();
        Box::pin(async move {
            if let Err(err) = pipeline.replay_spool().await {
                error!(error = %format!("{err:#}"), "scheduled spool replay failed");
            }
        })
    })
    .with_context(|| format!("creating spool job for cron {spool_cron}"))?;
    scheduler.add(spool).await.context("adding spool job")?;

    info!(sweep_cron, spool_cron, "maintenance scheduler configured");
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tap_core::{AssignmentFields, ConfidenceMeta, Evidence, Field};
    use uuid::Uuid;

    fn record(version: &str, subjects: &[&str], quality: f32) -> CanonicalRecord {
        let at = Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).single().expect("ts");
        let version = PipelineVersion::new(version);
        let evidence = Evidence {
            source_id: "S1".into(),
            observed_at: at,
            quality,
        };
        let fields = AssignmentFields {
            subjects: Field::with_value_and_evidence(
                subjects.iter().map(|s| s.to_string()).collect(),
                evidence.clone(),
            ),
            levels: Field::with_value_and_evidence(vec!["sec3".to_string()], evidence),
            ..AssignmentFields::default()
        };
        CanonicalRecord {
            record_id: CanonicalRecord::record_id_for("S1", &version, 0),
            job_id: Uuid::new_v4(),
            source_id: "S1".into(),
            channel_id: "chan".into(),
            pipeline_version: version,
            generation: 0,
            observed_at: at,
            created_at: at,
            external_id: None,
            quality_score: quality,
            fingerprint: fields.fingerprint(),
            fields,
            violations: Vec::new(),
            confidence: ConfidenceMeta::default(),
        }
    }

    #[test]
    fn changed_fields_compare_values_not_evidence() {
        let a = record("v1", &["math"], 0.6);
        let same = record("v2", &["math"], 0.9);
        assert!(changed_fields(&a, &same).expect("diff").is_empty());

        let other = record("v2", &["math", "physics"], 0.9);
        assert_eq!(changed_fields(&a, &other).expect("diff"), vec!["subjects".to_string()]);
    }

    #[test]
    fn enqueue_summary_counts_each_result() {
        let mut summary = EnqueueSummary::default();
        summary.count(&EnqueueResult::Created(Uuid::nil()));
        summary.count(&EnqueueResult::Duplicate(Uuid::nil()));
        summary.count(&EnqueueResult::Duplicate(Uuid::nil()));
        summary.count(&EnqueueResult::Busy(Uuid::nil()));
        assert_eq!(
            summary,
            EnqueueSummary {
                created: 1,
                duplicate: 2,
                reset: 0,
                busy: 1,
            }
        );
    }
}
