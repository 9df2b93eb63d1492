//! Raw event store, immutable canonical records and the pipeline version registry.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tap_core::{CanonicalRecord, Clock, EditMarker, PipelineVersion, RawEvent};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::{StoreError, StoreResult};

#[async_trait]
pub trait RawEventStore: Send + Sync {
    async fn get_event(&self, source_id: &str) -> StoreResult<Option<RawEvent>>;

    /// Source ids observed at or after `since`, oldest first.
    async fn list_source_ids(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<String>>;
}

#[async_trait]
pub trait CanonicalStore: Send + Sync {
    /// Insert an immutable record. Returns `false` when the id already exists.
    async fn insert_record(&self, record: &CanonicalRecord) -> StoreResult<bool>;

    async fn get_record(&self, record_id: Uuid) -> StoreResult<Option<CanonicalRecord>>;

    /// Highest-generation record for `(source_id, version)`.
    async fn latest_record(
        &self,
        source_id: &str,
        version: &PipelineVersion,
    ) -> StoreResult<Option<CanonicalRecord>>;

    async fn records_for_version(
        &self,
        version: &PipelineVersion,
    ) -> StoreResult<Vec<CanonicalRecord>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: PipelineVersion,
    pub registered_at: DateTime<Utc>,
    pub promoted_at: Option<DateTime<Utc>>,
    pub active: bool,
}

/// Tracks which pipeline version feeds persistence and side effects.
#[async_trait]
pub trait VersionRegistry: Send + Sync {
    async fn register_version(&self, version: &PipelineVersion) -> StoreResult<()>;

    /// Make `version` the single active version.
    async fn promote(&self, version: &PipelineVersion) -> StoreResult<()>;

    async fn active_version(&self) -> StoreResult<Option<PipelineVersion>>;

    async fn versions(&self) -> StoreResult<Vec<VersionInfo>>;
}

#[derive(Debug, Default)]
struct RecordState {
    events: BTreeMap<String, RawEvent>,
    records: HashMap<Uuid, CanonicalRecord>,
    versions: BTreeMap<PipelineVersion, VersionInfo>,
}

#[derive(Debug)]
pub struct MemoryRecordStore {
    clock: Arc<dyn Clock>,
    state: RwLock<RecordState>,
}

impl MemoryRecordStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: RwLock::new(RecordState::default()),
        }
    }

    pub async fn put_event(&self, event: RawEvent) {
        self.state
            .write()
            .await
            .events
            .insert(event.source_id.clone(), event);
    }

    pub async fn append_edit(&self, source_id: &str, content: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let event = state
            .events
            .get_mut(source_id)
            .ok_or_else(|| StoreError::NotFound(format!("raw event {source_id}")))?;
        event.edit_history.push(EditMarker {
            edited_at: now,
            content: content.to_string(),
        });
        Ok(())
    }

    pub async fn mark_deleted(&self, source_id: &str) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let event = state
            .events
            .get_mut(source_id)
            .ok_or_else(|| StoreError::NotFound(format!("raw event {source_id}")))?;
        event.deleted_at.get_or_insert(now);
        Ok(())
    }
}

#[async_trait]
impl RawEventStore for MemoryRecordStore {
    async fn get_event(&self, source_id: &str) -> StoreResult<Option<RawEvent>> {
        Ok(self.state.read().await.events.get(source_id).cloned())
    }

    async fn list_source_ids(&self, since: Option<DateTime<Utc>>) -> StoreResult<Vec<String>> {
        let state = self.state.read().await;
        let mut events = state
            .events
            .values()
            .filter(|e| since.map_or(true, |s| e.observed_at >= s))
            .collect::<Vec<_>>();
        events.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        Ok(events.into_iter().map(|e| e.source_id.clone()).collect())
    }
}

#[async_trait]
impl CanonicalStore for MemoryRecordStore {
    async fn insert_record(&self, record: &CanonicalRecord) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        if state.records.contains_key(&record.record_id) {
            return Ok(false);
        }
        state.records.insert(record.record_id, record.clone());
        Ok(true)
    }

    async fn get_record(&self, record_id: Uuid) -> StoreResult<Option<CanonicalRecord>> {
        Ok(self.state.read().await.records.get(&record_id).cloned())
    }

    async fn latest_record(
        &self,
        source_id: &str,
        version: &PipelineVersion,
    ) -> StoreResult<Option<CanonicalRecord>> {
        let state = self.state.read().await;
        Ok(state
            .records
            .values()
            .filter(|r| r.source_id == source_id && &r.pipeline_version == version)
            .max_by_key(|r| r.generation)
            .cloned())
    }

    async fn records_for_version(
        &self,
        version: &PipelineVersion,
    ) -> StoreResult<Vec<CanonicalRecord>> {
        let state = self.state.read().await;
        let mut latest: BTreeMap<&str, &CanonicalRecord> = BTreeMap::new();
        for record in state.records.values().filter(|r| &r.pipeline_version == version) {
            let slot = latest.entry(record.source_id.as_str()).or_insert(record);
            if record.generation > slot.generation {
                *slot = record;
            }
        }
        Ok(latest.into_values().cloned().collect())
    }
}

#[async_trait]
impl VersionRegistry for MemoryRecordStore {
    async fn register_version(&self, version: &PipelineVersion) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let no_active = !state.versions.values().any(|v| v.active);
        state
            .versions
            .entry(version.clone())
            .or_insert_with(|| VersionInfo {
                version: version.clone(),
                registered_at: now,
                promoted_at: no_active.then_some(now),
                active: no_active,
            });
        Ok(())
    }

    async fn promote(&self, version: &PipelineVersion) -> StoreResult<()> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        if !state.versions.contains_key(version) {
            return Err(StoreError::NotFound(format!("pipeline version {version}")));
        }
        for info in state.versions.values_mut() {
            if &info.version == version {
                info.active = true;
                info.promoted_at = Some(now);
            } else {
                info.active = false;
            }
        }
        Ok(())
    }

    async fn active_version(&self) -> StoreResult<Option<PipelineVersion>> {
        let state = self.state.read().await;
        Ok(state
            .versions
            .values()
            .find(|v| v.active)
            .map(|v| v.version.clone()))
    }

    async fn versions(&self) -> StoreResult<Vec<VersionInfo>> {
        Ok(self.state.read().await.versions.values().cloned().collect())
    }
}
