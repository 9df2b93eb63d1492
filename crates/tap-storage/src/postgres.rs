//! PostgreSQL job queue and record stores.
//!
//! Every queue transition is one conditional statement; the claim uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never block on each other.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;
use tap_core::{
    CanonicalRecord, DecisionKind, EditMarker, ExtractionJob, JobOutcome, JobState,
    PipelineVersion, RawEvent, ReleaseReason,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::queue::{
    EnqueueResult, JobFilter, JobQueue, QueueSettings, QueueStats, ReleaseResult, StateCount,
};
use crate::records::{CanonicalStore, RawEventStore, VersionInfo, VersionRegistry};
use crate::{StoreError, StoreResult};

const JOB_COLUMNS: &str = "job_id, source_id, pipeline_version, state, attempts, max_attempts, \
     generation, claimed_by, claimed_at, lease_expires_at, last_error, decision, assignment_id, \
     created_at, updated_at";

pub async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    use anyhow::Context;
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> StoreResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    info!("database migrations applied");
    Ok(())
}

fn to_u32(value: i32, column: &str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::InvalidRow(format!("{column} = {value}")))
}

fn job_from_row(row: &PgRow) -> StoreResult<ExtractionJob> {
    let state: String = row.try_get("state")?;
    let decision: Option<String> = row.try_get("decision")?;
    let pipeline_version: String = row.try_get("pipeline_version")?;
    Ok(ExtractionJob {
        job_id: row.try_get("job_id")?,
        source_id: row.try_get("source_id")?,
        pipeline_version: PipelineVersion::new(pipeline_version),
        state: state
            .parse()
            .map_err(|e: tap_core::ParseEnumError| StoreError::InvalidRow(e.to_string()))?,
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        max_attempts: to_u32(row.try_get("max_attempts")?, "max_attempts")?,
        generation: to_u32(row.try_get("generation")?, "generation")?,
        claimed_by: row.try_get("claimed_by")?,
        claimed_at: row.try_get("claimed_at")?,
        lease_expires_at: row.try_get("lease_expires_at")?,
        last_error: row.try_get("last_error")?,
        decision: decision
            .map(|d| d.parse::<DecisionKind>())
            .transpose()
            .map_err(|e| StoreError::InvalidRow(e.to_string()))?,
        assignment_id: row.try_get("assignment_id")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[derive(Debug, Clone)]
pub struct PgJobQueue {
    pool: PgPool,
    settings: QueueSettings,
}

impl PgJobQueue {
    pub fn new(pool: PgPool, settings: QueueSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        source_id: &str,
        version: &PipelineVersion,
        force: bool,
    ) -> StoreResult<EnqueueResult> {
        let inserted: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO extraction_jobs (job_id, source_id, pipeline_version, max_attempts)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (source_id, pipeline_version) DO NOTHING
            RETURNING job_id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(source_id)
        .bind(version.as_str())
        .bind(self.settings.max_attempts.max(1) as i32)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(job_id) = inserted {
            return Ok(EnqueueResult::Created(job_id));
        }

        let existing: Uuid = sqlx::query_scalar(
            "SELECT job_id FROM extraction_jobs WHERE source_id = $1 AND pipeline_version = $2",
        )
        .bind(source_id)
        .bind(version.as_str())
        .fetch_one(&self.pool)
        .await?;

        if !force {
            return Ok(EnqueueResult::Duplicate(existing));
        }

        // SET expressions read the pre-update row, so `state` below is the old state.
        let reset = sqlx::query(
            r#"
            UPDATE extraction_jobs
               SET generation = generation + CASE WHEN state = 'pending' THEN 0 ELSE 1 END,
                   state = 'pending',
                   attempts = 0,
                   claimed_by = NULL,
                   claimed_at = NULL,
                   lease_expires_at = NULL,
                   last_error = NULL,
                   decision = NULL,
                   assignment_id = NULL,
                   updated_at = NOW()
             WHERE job_id = $1
               AND NOT (state = 'processing' AND lease_expires_at >= NOW())
            "#,
        )
        .bind(existing)
        .execute(&self.pool)
        .await?;

        if reset.rows_affected() == 1 {
            Ok(EnqueueResult::Reset(existing))
        } else {
            Ok(EnqueueResult::Busy(existing))
        }
    }

    async fn claim(
        &self,
        worker_id: &str,
        batch_size: usize,
        lease_ttl: Duration,
    ) -> StoreResult<Vec<ExtractionJob>> {
        let sql = format!(
            r#"
            WITH next_jobs AS (
                SELECT job_id
                  FROM extraction_jobs
                 WHERE (state = 'pending'
                        AND attempts < max_attempts
                        AND (lease_expires_at IS NULL OR lease_expires_at <= NOW()))
                    OR (state = 'processing'
                        AND (lease_expires_at IS NULL OR lease_expires_at < NOW())
                        AND attempts + 1 < max_attempts)
                 ORDER BY COALESCE(lease_expires_at, created_at), created_at
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED
            )
            UPDATE extraction_jobs j
               SET attempts = j.attempts + CASE WHEN j.state = 'processing' THEN 1 ELSE 0 END,
                   state = 'processing',
                   claimed_by = $2,
                   claimed_at = NOW(),
                   lease_expires_at = NOW() + ($3 || ' milliseconds')::INTERVAL,
                   updated_at = NOW()
              FROM next_jobs
             WHERE j.job_id = next_jobs.job_id
         RETURNING {}
            "#,
            JOB_COLUMNS
                .split(", ")
                .map(|c| format!("j.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let rows = sqlx::query(&sql)
            .bind(batch_size as i64)
            .bind(worker_id)
            .bind(lease_ttl.as_millis().to_string())
            .fetch_all(&self.pool)
            .await?;

        let jobs = rows.iter().map(job_from_row).collect::<StoreResult<Vec<_>>>()?;
        if !jobs.is_empty() {
            debug!(worker_id, count = jobs.len(), "claimed jobs");
        }
        Ok(jobs)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        outcome: JobOutcome,
    ) -> StoreResult<bool> {
        let (decision, assignment_id) = match &outcome {
            JobOutcome::Ok {
                decision,
                assignment_id,
            } => (decision.map(|d| d.as_str()), *assignment_id),
            _ => (None, None),
        };
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs
               SET state = $3,
                   last_error = $4,
                   decision = $5,
                   assignment_id = $6,
                   lease_expires_at = NULL,
                   updated_at = NOW()
             WHERE job_id = $1
               AND state = 'processing'
               AND claimed_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(outcome.state().as_str())
        .bind(outcome.reason())
        .bind(decision)
        .bind(assignment_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason: ReleaseReason,
    ) -> StoreResult<ReleaseResult> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            SELECT attempts, max_attempts
              FROM extraction_jobs
             WHERE job_id = $1 AND state = 'processing' AND claimed_by = $2
               FOR UPDATE
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(ReleaseResult::LeaseLost);
        };
        let attempts = to_u32(row.try_get("attempts")?, "attempts")?;
        let max_attempts = to_u32(row.try_get("max_attempts")?, "max_attempts")?;

        let result = match reason {
            ReleaseReason::Shutdown => {
                let available_at: DateTime<Utc> = sqlx::query_scalar(
                    r#"
                    UPDATE extraction_jobs
                       SET state = 'pending', claimed_by = NULL, lease_expires_at = NULL,
                           updated_at = NOW()
                     WHERE job_id = $1
                 RETURNING updated_at
                    "#,
                )
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await?;
                ReleaseResult::Requeued {
                    attempts,
                    available_at,
                }
            }
            ReleaseReason::Transient(message) => {
                let attempts = attempts + 1;
                if attempts >= max_attempts {
                    sqlx::query(
                        r#"
                        UPDATE extraction_jobs
                           SET state = 'failed', attempts = $2, last_error = $3,
                               claimed_by = NULL, lease_expires_at = NULL, updated_at = NOW()
                         WHERE job_id = $1
                        "#,
                    )
                    .bind(job_id)
                    .bind(attempts as i32)
                    .bind(&message)
                    .execute(&mut *tx)
                    .await?;
                    ReleaseResult::DeadLettered { attempts }
                } else {
                    let delay = self.settings.retry_delay(attempts);
                    let available_at: DateTime<Utc> = sqlx::query_scalar(
                        r#"
                        UPDATE extraction_jobs
                           SET state = 'pending', attempts = $2, last_error = $3,
                               claimed_by = NULL,
                               lease_expires_at = NOW() + ($4 || ' milliseconds')::INTERVAL,
                               updated_at = NOW()
                         WHERE job_id = $1
                     RETURNING lease_expires_at
                        "#,
                    )
                    .bind(job_id)
                    .bind(attempts as i32)
                    .bind(&message)
                    .bind(delay.as_millis().to_string())
                    .fetch_one(&mut *tx)
                    .await?;
                    ReleaseResult::Requeued {
                        attempts,
                        available_at,
                    }
                }
            }
        };
        tx.commit().await?;
        Ok(result)
    }

    async fn fail_exhausted(&self) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE extraction_jobs
               SET state = 'failed',
                   attempts = attempts + 1,
                   last_error = 'Permanent:lease_expired',
                   claimed_by = NULL,
                   lease_expires_at = NULL,
                   updated_at = NOW()
             WHERE state = 'processing'
               AND (lease_expires_at IS NULL OR lease_expires_at < NOW())
               AND attempts + 1 >= max_attempts
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, job_id: Uuid) -> StoreResult<Option<ExtractionJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE job_id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn find(
        &self,
        source_id: &str,
        version: &PipelineVersion,
    ) -> StoreResult<Option<ExtractionJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM extraction_jobs WHERE source_id = $1 AND pipeline_version = $2"
        ))
        .bind(source_id)
        .bind(version.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, filter: JobFilter) -> StoreResult<Vec<ExtractionJob>> {
        let limit = if filter.limit == 0 {
            i64::MAX
        } else {
            filter.limit as i64
        };
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
              FROM extraction_jobs
             WHERE ($1::TEXT IS NULL OR state = $1)
               AND ($2::TEXT IS NULL OR pipeline_version = $2)
               AND ($3::TIMESTAMPTZ IS NULL
                    OR (state IN ('ok', 'failed', 'skipped') AND updated_at >= $3))
             ORDER BY created_at, job_id
             LIMIT $4
            "#
        ))
        .bind(filter.state.map(|s| s.as_str()))
        .bind(filter.version.as_ref().map(|v| v.as_str()))
        .bind(filter.completed_since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn stats(&self) -> StoreResult<QueueStats> {
        let rows = sqlx::query(
            r#"
            SELECT pipeline_version, state, COUNT(*) AS count
              FROM extraction_jobs
             GROUP BY pipeline_version, state
             ORDER BY pipeline_version, state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let state: String = row.try_get("state")?;
            let count: i64 = row.try_get("count")?;
            let version: String = row.try_get("pipeline_version")?;
            counts.push(StateCount {
                pipeline_version: PipelineVersion::new(version),
                state: state
                    .parse()
                    .map_err(|e: tap_core::ParseEnumError| StoreError::InvalidRow(e.to_string()))?,
                count: count.max(0) as u64,
            });
        }

        let oldest_pending_at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MIN(created_at) FROM extraction_jobs WHERE state = 'pending'",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(QueueStats {
            counts,
            oldest_pending_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record_from_row(row: &PgRow) -> StoreResult<CanonicalRecord> {
    let Json(record): Json<CanonicalRecord> = row.try_get("payload")?;
    Ok(record)
}

#[async_trait]
impl RawEventStore for PgRecordStore {
    async fn get_event(&self, source_id: &str) -> StoreResult<Option<RawEvent>> {
        let row = sqlx::query(
            r#"
            SELECT source_id, channel_id, observed_at, content, edit_history, deleted_at
              FROM raw_events
             WHERE source_id = $1
            "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let Json(edit_history): Json<Vec<EditMarker>> = row.try_get("edit_history")?;
        Ok(Some(RawEvent {
            source_id: row.try_get("source_id")?,
            channel_id: row.try_get("channel_id")?,
            observed_at: row.try_get("observed_at")?,
            content: row.try_get("content")?,
            edit_history,
            deleted_at: row.try_get("deleted_at")?,
        }))
    }

    async fn list_source_ids(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT source_id
              FROM raw_events
             WHERE ($1::TIMESTAMPTZ IS NULL OR observed_at >= $1)
             ORDER BY observed_at, source_id
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl CanonicalStore for PgRecordStore {
    async fn insert_record(&self, record: &CanonicalRecord) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO canonical_records
                (record_id, job_id, source_id, pipeline_version, generation, fingerprint,
                 quality_score, observed_at, created_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(record.record_id)
        .bind(record.job_id)
        .bind(&record.source_id)
        .bind(record.pipeline_version.as_str())
        .bind(record.generation as i32)
        .bind(&record.fingerprint)
        .bind(record.quality_score)
        .bind(record.observed_at)
        .bind(record.created_at)
        .bind(Json(record))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_record(&self, record_id: Uuid) -> StoreResult<Option<CanonicalRecord>> {
        let row = sqlx::query("SELECT payload FROM canonical_records WHERE record_id = $1")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn latest_record(
        &self,
        source_id: &str,
        version: &PipelineVersion,
    ) -> StoreResult<Option<CanonicalRecord>> {
        let row = sqlx::query(
            r#"
            SELECT payload
              FROM canonical_records
             WHERE source_id = $1 AND pipeline_version = $2
             ORDER BY generation DESC
             LIMIT 1
            "#,
        )
        .bind(source_id)
        .bind(version.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn records_for_version(
        &self,
        version: &PipelineVersion,
    ) -> StoreResult<Vec<CanonicalRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT DISTINCT ON (source_id) payload
              FROM canonical_records
             WHERE pipeline_version = $1
             ORDER BY source_id, generation DESC
            "#,
        )
        .bind(version.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(record_from_row).collect()
    }
}

#[async_trait]
impl VersionRegistry for PgRecordStore {
    async fn register_version(&self, version: &PipelineVersion) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO pipeline_versions (version, registered_at, promoted_at, active)
            SELECT $1, NOW(),
                   CASE WHEN has_active THEN NULL ELSE NOW() END,
                   NOT has_active
              FROM (SELECT EXISTS (SELECT 1 FROM pipeline_versions WHERE active) AS has_active) s
            ON CONFLICT (version) DO NOTHING
            "#,
        )
        .bind(version.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn promote(&self, version: &PipelineVersion) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM pipeline_versions WHERE version = $1)",
        )
        .bind(version.as_str())
        .fetch_one(&mut *tx)
        .await?;
        if !exists {
            return Err(StoreError::NotFound(format!("pipeline version {version}")));
        }
        sqlx::query("UPDATE pipeline_versions SET active = FALSE WHERE active AND version <> $1")
            .bind(version.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "UPDATE pipeline_versions SET active = TRUE, promoted_at = NOW() WHERE version = $1",
        )
        .bind(version.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn active_version(&self) -> StoreResult<Option<PipelineVersion>> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT version FROM pipeline_versions WHERE active LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.map(PipelineVersion::new))
    }

    async fn versions(&self) -> StoreResult<Vec<VersionInfo>> {
        let rows = sqlx::query(
            "SELECT version, registered_at, promoted_at, active FROM pipeline_versions ORDER BY registered_at",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let version: String = row.try_get("version")?;
            out.push(VersionInfo {
                version: PipelineVersion::new(version),
                registered_at: row.try_get("registered_at")?,
                promoted_at: row.try_get("promoted_at")?,
                active: row.try_get("active")?,
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs against a scratch database when `TAP_TEST_DATABASE_URL` is set.
    async fn test_pool() -> Option<PgPool> {
        let url = std::env::var("TAP_TEST_DATABASE_URL").ok()?;
        let pool = connect_pool(&url, 4).await.expect("connect");
        run_migrations(&pool).await.expect("migrate");
        sqlx::query("TRUNCATE extraction_jobs")
            .execute(&pool)
            .await
            .expect("truncate");
        Some(pool)
    }

    #[test]
    fn claim_returns_every_job_column() {
        for column in JOB_COLUMNS.split(", ") {
            assert!(!column.trim().is_empty());
        }
        assert_eq!(JOB_COLUMNS.split(", ").count(), 15);
    }

    #[tokio::test]
    async fn concurrent_claims_are_disjoint_in_postgres() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let queue = PgJobQueue::new(pool, QueueSettings::default());
        let version = PipelineVersion::new("pg-test");
        for i in 0..20 {
            queue
                .enqueue(&format!("S{i}"), &version, false)
                .await
                .expect("enqueue");
        }
        assert!(matches!(
            queue.enqueue("S0", &version, false).await.expect("again"),
            EnqueueResult::Duplicate(_)
        ));

        let (a, b) = tokio::join!(
            queue.claim("w1", 15, Duration::from_secs(60)),
            queue.claim("w2", 15, Duration::from_secs(60))
        );
        let a = a.expect("claim a");
        let b = b.expect("claim b");
        assert_eq!(a.len() + b.len(), 20);
        assert!(a.iter().all(|j| !b.iter().any(|k| k.job_id == j.job_id)));

        let job = &a[0];
        assert!(queue
            .complete(job.job_id, "w1", JobOutcome::Skipped("not_assignment".into()))
            .await
            .expect("complete"));
        assert!(!queue
            .complete(job.job_id, "w1", JobOutcome::Skipped("again".into()))
            .await
            .expect("complete twice"));
    }
}
