//! Persisted assignments and their dispatch records.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tap_core::{DispatchKey, DispatchRecord, PersistedAssignment};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq)]
pub enum InsertResult {
    Inserted(PersistedAssignment),
    /// An open assignment with the same fingerprint or external id won the race.
    Exists(PersistedAssignment),
}

/// Conditional-write store for assignments.
///
/// `update_assignment` succeeds only when the stored revision still equals
/// `expected_revision`; the stored revision is then incremented.
#[async_trait]
pub trait AssignmentStore: Send + Sync {
    async fn find_open_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> StoreResult<Option<PersistedAssignment>>;

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<PersistedAssignment>>;

    async fn get_assignment(&self, assignment_id: Uuid)
        -> StoreResult<Option<PersistedAssignment>>;

    async fn list_open(&self) -> StoreResult<Vec<PersistedAssignment>>;

    /// Assignments that reference `source_id` as one of their sources.
    async fn find_by_source(&self, source_id: &str) -> StoreResult<Vec<PersistedAssignment>>;

    async fn insert_assignment(
        &self,
        assignment: &PersistedAssignment,
    ) -> StoreResult<InsertResult>;

    async fn update_assignment(
        &self,
        assignment: &PersistedAssignment,
        expected_revision: u64,
    ) -> StoreResult<PersistedAssignment>;

    async fn get_dispatch(&self, key: &DispatchKey) -> StoreResult<Option<DispatchRecord>>;

    /// Upsert keyed on `DispatchKey`.
    async fn put_dispatch(&self, record: &DispatchRecord) -> StoreResult<()>;

    async fn dispatches_for(&self, assignment_id: Uuid) -> StoreResult<Vec<DispatchRecord>>;

    async fn dispatches_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<DispatchRecord>>;
}

#[derive(Debug, Default)]
struct AssignmentState {
    assignments: HashMap<Uuid, PersistedAssignment>,
    dispatches: BTreeMap<DispatchKey, DispatchRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryAssignmentStore {
    state: RwLock<AssignmentState>,
}

impl MemoryAssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.assignments.len()
    }
}

#[async_trait]
impl AssignmentStore for MemoryAssignmentStore {
    async fn find_open_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> StoreResult<Option<PersistedAssignment>> {
        let state = self.state.read().await;
        Ok(state
            .assignments
            .values()
            .filter(|a| a.is_open() && a.fingerprint == fingerprint)
            .min_by_key(|a| a.first_seen_at)
            .cloned())
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> StoreResult<Option<PersistedAssignment>> {
        let state = self.state.read().await;
        Ok(state
            .assignments
            .values()
            .filter(|a| a.external_id.as_deref() == Some(external_id))
            .max_by_key(|a| a.last_seen_at)
            .cloned())
    }

    async fn get_assignment(
        &self,
        assignment_id: Uuid,
    ) -> StoreResult<Option<PersistedAssignment>> {
        Ok(self.state.read().await.assignments.get(&assignment_id).cloned())
    }

    async fn list_open(&self) -> StoreResult<Vec<PersistedAssignment>> {
        let state = self.state.read().await;
        let mut open = state
            .assignments
            .values()
            .filter(|a| a.is_open())
            .cloned()
            .collect::<Vec<_>>();
        open.sort_by_key(|a| a.first_seen_at);
        Ok(open)
    }

    async fn find_by_source(&self, source_id: &str) -> StoreResult<Vec<PersistedAssignment>> {
        let state = self.state.read().await;
        Ok(state
            .assignments
            .values()
            .filter(|a| a.source_ids.iter().any(|s| s == source_id))
            .cloned()
            .collect())
    }

    async fn insert_assignment(
        &self,
        assignment: &PersistedAssignment,
    ) -> StoreResult<InsertResult> {
        let mut state = self.state.write().await;
        let clash = state.assignments.values().find(|a| {
            a.is_open()
                && (a.fingerprint == assignment.fingerprint
                    || (assignment.external_id.is_some() && a.external_id == assignment.external_id))
        });
        if let Some(existing) = clash {
            return Ok(InsertResult::Exists(existing.clone()));
        }
        state
            .assignments
            .insert(assignment.assignment_id, assignment.clone());
        Ok(InsertResult::Inserted(assignment.clone()))
    }

    async fn update_assignment(
        &self,
        assignment: &PersistedAssignment,
        expected_revision: u64,
    ) -> StoreResult<PersistedAssignment> {
        let mut state = self.state.write().await;
        let stored = state
            .assignments
            .get_mut(&assignment.assignment_id)
            .ok_or_else(|| StoreError::NotFound(format!("assignment {}", assignment.assignment_id)))?;
        if stored.revision != expected_revision {
            return Err(StoreError::Conflict(format!(
                "assignment {} at revision {}, expected {}",
                stored.assignment_id, stored.revision, expected_revision
            )));
        }
        let mut next = assignment.clone();
        next.revision = expected_revision + 1;
        *stored = next.clone();
        Ok(next)
    }

    async fn get_dispatch(&self, key: &DispatchKey) -> StoreResult<Option<DispatchRecord>> {
        Ok(self.state.read().await.dispatches.get(key).cloned())
    }

    async fn put_dispatch(&self, record: &DispatchRecord) -> StoreResult<()> {
        self.state
            .write()
            .await
            .dispatches
            .insert(record.key(), record.clone());
        Ok(())
    }

    async fn dispatches_for(&self, assignment_id: Uuid) -> StoreResult<Vec<DispatchRecord>> {
        let state = self.state.read().await;
        Ok(state
            .dispatches
            .values()
            .filter(|d| d.assignment_id == assignment_id)
            .cloned()
            .collect())
    }

    async fn dispatches_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<DispatchRecord>> {
        let state = self.state.read().await;
        let mut records = state
            .dispatches
            .values()
            .filter(|d| d.updated_at >= since)
            .cloned()
            .collect::<Vec<_>>();
        records.sort_by_key(|d| d.created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tap_core::{
        AssignmentFields, AssignmentStatus, CanonicalRecord, ConfidenceMeta, DispatchChannel,
        DispatchStatus, PipelineVersion,
    };

    fn assignment(fingerprint: &str) -> PersistedAssignment {
        let version = PipelineVersion::new("v1");
        let record = CanonicalRecord {
            record_id: CanonicalRecord::record_id_for("S1", &version, 0),
            job_id: Uuid::new_v4(),
            source_id: "S1".into(),
            channel_id: "chan".into(),
            pipeline_version: version,
            generation: 0,
            observed_at: Utc::now(),
            created_at: Utc::now(),
            external_id: None,
            fields: AssignmentFields::default(),
            quality_score: 0.4,
            fingerprint: fingerprint.into(),
            violations: Vec::new(),
            confidence: ConfidenceMeta::default(),
        };
        PersistedAssignment::from_record(&record, Utc::now())
    }

    #[tokio::test]
    async fn insert_detects_open_fingerprint_clash() {
        let store = MemoryAssignmentStore::new();
        let first = assignment("fp");
        assert!(matches!(
            store.insert_assignment(&first).await.expect("insert"),
            InsertResult::Inserted(_)
        ));
        match store.insert_assignment(&assignment("fp")).await.expect("insert") {
            InsertResult::Exists(existing) => assert_eq!(existing.assignment_id, first.assignment_id),
            other => panic!("expected clash, got {other:?}"),
        }

        let mut closed = first.clone();
        closed.status = AssignmentStatus::Closed;
        store.update_assignment(&closed, 0).await.expect("close");
        assert!(matches!(
            store.insert_assignment(&assignment("fp")).await.expect("insert"),
            InsertResult::Inserted(_)
        ));
    }

    #[tokio::test]
    async fn update_requires_matching_revision() {
        let store = MemoryAssignmentStore::new();
        let a = assignment("fp");
        store.insert_assignment(&a).await.expect("insert");

        let mut bumped = a.clone();
        bumped.bump_count = 2;
        let stored = store.update_assignment(&bumped, 0).await.expect("update");
        assert_eq!(stored.revision, 1);

        let err = store
            .update_assignment(&bumped, 0)
            .await
            .expect_err("stale revision");
        assert!(matches!(err, StoreError::Conflict(_)));
        let current = store
            .get_assignment(a.assignment_id)
            .await
            .expect("get")
            .expect("row");
        assert_eq!(current.bump_count, 2);
        assert_eq!(current.revision, 1);
    }

    #[tokio::test]
    async fn dispatch_records_upsert_by_key() {
        let store = MemoryAssignmentStore::new();
        let key = DispatchKey {
            assignment_id: Uuid::new_v4(),
            record_id: Uuid::new_v4(),
            channel: DispatchChannel::Broadcast,
            recipient: None,
        };
        let mut record = DispatchRecord::pending(key.clone(), Utc::now());
        store.put_dispatch(&record).await.expect("put");
        record.status = DispatchStatus::Sent;
        record.external_ref = Some("msg-1".into());
        store.put_dispatch(&record).await.expect("put");

        let stored = store.get_dispatch(&key).await.expect("get").expect("row");
        assert_eq!(stored.status, DispatchStatus::Sent);
        assert_eq!(
            store.dispatches_for(key.assignment_id).await.expect("list").len(),
            1
        );
    }
}
