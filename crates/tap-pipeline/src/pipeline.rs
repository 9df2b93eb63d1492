//! One job through the stages: load the raw event, extract, harden, store
//! the canonical record, resolve and persist, then dispatch.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use tap_adapters::{
    BroadcastChannel, GeoLookup, InferenceClient, Notifier, RecipientMatcher, Taxonomy,
};
use tap_core::{
    CanonicalRecord, Clock, ExtractionJob, JobOutcome, Outcome, PipelineVersion, StageError,
};
use tap_storage::{
    AssignmentStore, CanonicalStore, FallbackSpool, JobQueue, RawEventStore, VersionRegistry,
};
use tracing::{debug, info, warn, Span};

use crate::config::PipelineConfig;
use crate::dispatch::Dispatcher;
use crate::extract::Extractor;
use crate::harden::Hardener;
use crate::merge::MergeEngine;
use crate::persist::{store_stage_error, PersistenceAdapter};

/// Durable state the pipeline reads and writes.
#[derive(Clone)]
pub struct Stores {
    pub queue: Arc<dyn JobQueue>,
    pub raw: Arc<dyn RawEventStore>,
    pub records: Arc<dyn CanonicalStore>,
    pub versions: Arc<dyn VersionRegistry>,
    pub assignments: Arc<dyn AssignmentStore>,
}

/// External services. Missing channels simply disable that side effect.
#[derive(Clone)]
pub struct Collaborators {
    pub inference: Arc<dyn InferenceClient>,
    pub taxonomy: Arc<Taxonomy>,
    pub geo: Arc<dyn GeoLookup>,
    pub broadcast: Option<Arc<dyn BroadcastChannel>>,
    pub notifier: Option<Arc<dyn Notifier>>,
    pub matcher: Option<Arc<dyn RecipientMatcher>>,
}

pub struct Pipeline {
    pub(crate) queue: Arc<dyn JobQueue>,
    pub(crate) raw: Arc<dyn RawEventStore>,
    pub(crate) records: Arc<dyn CanonicalStore>,
    pub(crate) versions: Arc<dyn VersionRegistry>,
    pub(crate) extractor: Extractor,
    pub(crate) hardener: Hardener,
    pub(crate) persistence: Arc<PersistenceAdapter>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) version: PipelineVersion,
    pub(crate) assignment_max_age: chrono::Duration,
    pub(crate) heartbeat_dir: Option<PathBuf>,
}

impl Pipeline {
    pub fn new(
        config: &PipelineConfig,
        stores: Stores,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let merge = MergeEngine::new(stores.assignments.clone(), config.merge_policy());
        let persistence = Arc::new(PersistenceAdapter::new(stores.assignments.clone(), merge));

        let mut dispatcher = Dispatcher::new(
            persistence.clone(),
            stores.records.clone(),
            FallbackSpool::new(config.spool_dir.clone()),
            clock.clone(),
            config.dispatch_settings(),
        );
        if let Some(broadcast) = collaborators.broadcast {
            dispatcher = dispatcher.with_broadcast(broadcast);
        }
        match (collaborators.notifier, collaborators.matcher) {
            (Some(notifier), Some(matcher)) => {
                dispatcher = dispatcher.with_notifications(notifier, matcher);
            }
            (None, None) => {}
            _ => warn!("notifications need both a notifier and a recipient matcher; disabled"),
        }

        Ok(Self {
            queue: stores.queue,
            raw: stores.raw,
            records: stores.records,
            versions: stores.versions,
            extractor: Extractor::new(collaborators.inference, config.max_corrective_retries),
            hardener: Hardener::new(
                config.hardening_settings(),
                collaborators.taxonomy,
                collaborators.geo,
            )?,
            persistence,
            dispatcher,
            clock,
            version: config.pipeline_version.clone(),
            assignment_max_age: config.assignment_max_age,
            heartbeat_dir: None,
        })
    }

    /// Enables the ingester heartbeat written on every enqueue.
    pub fn with_heartbeat_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.heartbeat_dir = Some(dir.into());
        self
    }

    pub fn version(&self) -> &PipelineVersion {
        &self.version
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn records(&self) -> &Arc<dyn CanonicalStore> {
        &self.records
    }

    pub fn versions(&self) -> &Arc<dyn VersionRegistry> {
        &self.versions
    }

    pub fn persistence(&self) -> &Arc<PersistenceAdapter> {
        &self.persistence
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Runs every stage for `job`. Queue transitions are left to the caller.
    pub async fn process(&self, job: &ExtractionJob) -> Outcome<JobOutcome> {
        self.run_stages(job).await.into()
    }

    async fn run_stages(&self, job: &ExtractionJob) -> Result<JobOutcome, StageError> {
        let span = Span::current();
        span.record("stage", "load");
        let raw = self
            .raw
            .get_event(&job.source_id)
            .await
            .map_err(store_stage_error)?
            .ok_or_else(|| StageError::Permanent("source_missing".to_string()))?;

        if raw.is_deleted() {
            span.record("stage", "delete");
            self.on_delete(&job.source_id)
                .await
                .map_err(|err| StageError::Transient(format!("on_delete: {err:#}")))?;
            return Ok(JobOutcome::Skipped("deleted".to_string()));
        }

        let record_id =
            CanonicalRecord::record_id_for(&job.source_id, &job.pipeline_version, job.generation);
        let stored = self
            .records
            .get_record(record_id)
            .await
            .map_err(store_stage_error)?;
        let record = match stored {
            Some(record) => {
                debug!(%record_id, "canonical record already stored, skipping extraction");
                record
            }
            None => {
                span.record("stage", "extract");
                let extraction = self.extractor.extract(&raw).await?;
                if !extraction.draft.is_assignment {
                    return Ok(JobOutcome::Skipped("not_assignment".to_string()));
                }
                span.record("stage", "harden");
                let record = self
                    .hardener
                    .harden(job, &raw, &extraction, self.clock.now())?;
                self.records
                    .insert_record(&record)
                    .await
                    .map_err(store_stage_error)?;
                record
            }
        };

        let active = self
            .versions
            .active_version()
            .await
            .map_err(store_stage_error)?;
        if active.as_ref() != Some(&job.pipeline_version) {
            info!(active = ?active.as_ref().map(PipelineVersion::as_str), "shadow run, record stored without persisting");
            return Ok(JobOutcome::Ok {
                decision: None,
                assignment_id: None,
            });
        }

        span.record("stage", "persist");
        let persisted = self.persistence.upsert(&record).await?;
        let assignment_id = persisted.assignment.assignment_id;
        info!(%assignment_id, decision = persisted.decision.as_str(), replayed = persisted.replayed, "record persisted");

        if persisted.decision.requires_dispatch() {
            span.record("stage", "dispatch");
            if let Err(err) = self
                .dispatcher
                .dispatch(&persisted.assignment, &record, persisted.decision)
                .await
            {
                // Reconciliation picks this up from the pending dispatch records.
                warn!(%assignment_id, error = %format!("{err:#}"), "dispatch bookkeeping failed");
            }
        }

        Ok(JobOutcome::Ok {
            decision: Some(persisted.decision),
            assignment_id: Some(assignment_id),
        })
    }
}
