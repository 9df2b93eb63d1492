//! Persistence adapter: the only component that writes assignment rows.
//!
//! Every write is conditional on the revision that was read, and a record
//! whose id already sits in `last_record_id` is reported as applied instead
//! of being written again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tap_core::{
    AssignmentStatus, CanonicalRecord, DecisionKind, PersistedAssignment, StageError,
};
use tap_storage::{AssignmentStore, InsertResult, StoreError, StoreResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::merge::{MergeEngine, Resolution};

/// Re-read/re-resolve rounds after losing a conditional write.
pub const MAX_CONFLICT_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct Persisted {
    pub decision: DecisionKind,
    pub assignment: PersistedAssignment,
    /// The store already reflected this record; nothing was written.
    pub replayed: bool,
}

pub struct PersistenceAdapter {
    store: Arc<dyn AssignmentStore>,
    merge: MergeEngine,
}

pub(crate) fn store_stage_error(err: StoreError) -> StageError {
    if err.is_transient() {
        StageError::Transient(format!("store: {err}"))
    } else {
        StageError::Permanent(format!("store: {err}"))
    }
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn AssignmentStore>, merge: MergeEngine) -> Self {
        Self { store, merge }
    }

    pub fn store(&self) -> &Arc<dyn AssignmentStore> {
        &self.store
    }

    /// Resolves `record` and applies the decision. Safe to call again with the
    /// same record after a crash: the second call reports the first decision.
    pub async fn upsert(&self, record: &CanonicalRecord) -> Result<Persisted, StageError> {
        for round in 1..=MAX_CONFLICT_RETRIES {
            let resolution = self.merge.resolve(record).await.map_err(store_stage_error)?;
            let decision = resolution.decision();
            match resolution {
                Resolution::Insert(assignment) => {
                    match self.store.insert_assignment(&assignment).await {
                        Ok(InsertResult::Inserted(stored)) => {
                            return Ok(Persisted {
                                decision,
                                assignment: stored,
                                replayed: false,
                            });
                        }
                        Ok(InsertResult::Exists(winner)) => {
                            debug!(round, assignment_id = %winner.assignment_id, "insert lost to a concurrent writer");
                        }
                        Err(StoreError::Conflict(reason)) => {
                            debug!(round, %reason, "insert conflict");
                        }
                        Err(err) => return Err(store_stage_error(err)),
                    }
                }
                Resolution::Bump { current, next } | Resolution::Merge { current, next } => {
                    match self.store.update_assignment(&next, current.revision).await {
                        Ok(stored) => {
                            return Ok(Persisted {
                                decision,
                                assignment: stored,
                                replayed: false,
                            });
                        }
                        Err(StoreError::Conflict(reason)) | Err(StoreError::NotFound(reason)) => {
                            debug!(round, %reason, "conditional update lost, re-resolving");
                        }
                        Err(err) => return Err(store_stage_error(err)),
                    }
                }
                Resolution::Duplicate(assignment) => {
                    return Ok(Persisted {
                        decision,
                        assignment,
                        replayed: false,
                    });
                }
                Resolution::Replayed(assignment) => {
                    info!(assignment_id = %assignment.assignment_id, record_id = %record.record_id, "record already applied");
                    return Ok(Persisted {
                        decision,
                        assignment,
                        replayed: true,
                    });
                }
            }
        }
        warn!(source_id = %record.source_id, "gave up after repeated write conflicts");
        Err(StageError::Transient("persist_conflict".to_string()))
    }

    /// Read-modify-write with revision check. `change` returns `false` to
    /// leave the row alone.
    async fn modify(
        &self,
        assignment_id: Uuid,
        change: impl Fn(&mut PersistedAssignment) -> bool,
    ) -> StoreResult<Option<PersistedAssignment>> {
        for _ in 0..MAX_CONFLICT_RETRIES {
            let Some(current) = self.store.get_assignment(assignment_id).await? else {
                return Ok(None);
            };
            let mut next = current.clone();
            if !change(&mut next) {
                return Ok(Some(current));
            }
            match self.store.update_assignment(&next, current.revision).await {
                Ok(stored) => return Ok(Some(stored)),
                Err(StoreError::Conflict(_)) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(StoreError::Conflict(format!(
            "assignment {assignment_id} kept changing underneath"
        )))
    }

    /// Drops `source_id` from every open assignment it feeds; assignments left
    /// without a live source close. Returns the assignments that closed.
    pub async fn close_source(
        &self,
        source_id: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<PersistedAssignment>> {
        let mut closed = Vec::new();
        for assignment in self.store.find_by_source(source_id).await? {
            if !assignment.is_open() {
                continue;
            }
            let updated = self
                .modify(assignment.assignment_id, |a| {
                    if !a.is_open() || !a.live_sources.iter().any(|s| s == source_id) {
                        return false;
                    }
                    a.live_sources.retain(|s| s != source_id);
                    if a.live_sources.is_empty() {
                        close(a, at, "source_deleted");
                    }
                    true
                })
                .await?;
            if let Some(updated) = updated.filter(|a| !a.is_open()) {
                closed.push(updated);
            }
        }
        Ok(closed)
    }

    /// Closes open assignments not seen since `now - max_age`.
    pub async fn close_stale(
        &self,
        max_age: chrono::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<Vec<PersistedAssignment>> {
        let cutoff = now - max_age;
        let mut closed = Vec::new();
        for assignment in self.store.list_open().await? {
            if assignment.last_seen_at >= cutoff {
                continue;
            }
            let updated = self
                .modify(assignment.assignment_id, |a| {
                    if !a.is_open() || a.last_seen_at >= cutoff {
                        return false;
                    }
                    close(a, now, "aged_out");
                    true
                })
                .await?;
            if let Some(updated) = updated.filter(|a| !a.is_open()) {
                closed.push(updated);
            }
        }
        Ok(closed)
    }

    pub async fn mark_notified(
        &self,
        assignment_id: Uuid,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<PersistedAssignment>> {
        self.modify(assignment_id, |a| {
            if a.last_notified_at.map_or(false, |prev| prev >= at) {
                return false;
            }
            a.last_notified_at = Some(at);
            true
        })
        .await
    }
}

fn close(assignment: &mut PersistedAssignment, at: DateTime<Utc>, reason: &str) {
    assignment.status = AssignmentStatus::Closed;
    assignment.closed_at = Some(at);
    assignment.close_reason = Some(reason.to_string());
}
