//! Dedup & merge engine: decides what a canonical record means for the
//! assignment store. Reads only; writes go through the persistence adapter.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::Serialize;
use strsim::jaro_winkler;
use tap_core::{
    normalize_token, AssignmentFields, CanonicalRecord, DecisionKind, Field, Location,
    PersistedAssignment,
};
use tap_storage::{AssignmentStore, StoreResult};
use tracing::debug;

use crate::harden::overall_quality;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergePolicy {
    pub min_bump_interval: chrono::Duration,
    /// Enables the near-duplicate fallback when set. Exact matching only otherwise.
    pub similarity_threshold: Option<f64>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self {
            min_bump_interval: chrono::Duration::hours(6),
            similarity_threshold: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    ExternalId,
    Fingerprint,
    Source,
    Similarity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Insert(PersistedAssignment),
    /// Bump interval elapsed: counters advance.
    Bump {
        current: PersistedAssignment,
        next: PersistedAssignment,
    },
    /// Inside the bump interval but something changed: fields update, counters stay.
    Merge {
        current: PersistedAssignment,
        next: PersistedAssignment,
    },
    /// Nothing to write.
    Duplicate(PersistedAssignment),
    /// The assignment already reflects this record.
    Replayed(PersistedAssignment),
}

impl Resolution {
    pub fn decision(&self) -> DecisionKind {
        match self {
            Resolution::Insert(_) => DecisionKind::Insert,
            Resolution::Bump { .. } => DecisionKind::Bump,
            Resolution::Merge { .. } => DecisionKind::Merge,
            Resolution::Duplicate(_) => DecisionKind::Duplicate,
            Resolution::Replayed(a) => a.last_decision.unwrap_or(DecisionKind::Duplicate),
        }
    }

    /// The assignment as it should look once the resolution is applied.
    pub fn assignment(&self) -> &PersistedAssignment {
        match self {
            Resolution::Insert(a) | Resolution::Duplicate(a) | Resolution::Replayed(a) => a,
            Resolution::Bump { next, .. } | Resolution::Merge { next, .. } => next,
        }
    }
}

pub struct MergeEngine {
    store: Arc<dyn AssignmentStore>,
    policy: MergePolicy,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn AssignmentStore>, policy: MergePolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &MergePolicy {
        &self.policy
    }

    pub async fn resolve(&self, record: &CanonicalRecord) -> StoreResult<Resolution> {
        let found = self.find_match(record).await?;
        if let Some((existing, matched_by)) = &found {
            debug!(
                source_id = %record.source_id,
                assignment_id = %existing.assignment_id,
                matched_by = ?matched_by,
                "matched existing assignment"
            );
        }
        Ok(decide(&self.policy, record, found.map(|(a, _)| a)))
    }

    /// External id, then open fingerprint, then an open assignment fed by the
    /// same source, then (optionally) text similarity within the same location bucket.
    pub async fn find_match(
        &self,
        record: &CanonicalRecord,
    ) -> StoreResult<Option<(PersistedAssignment, MatchedBy)>> {
        if let Some(external_id) = &record.external_id {
            if let Some(found) = self.store.find_by_external_id(external_id).await? {
                if found.is_open() {
                    return Ok(Some((found, MatchedBy::ExternalId)));
                }
            }
        }

        if let Some(found) = self.store.find_open_by_fingerprint(&record.fingerprint).await? {
            return Ok(Some((found, MatchedBy::Fingerprint)));
        }

        let by_source = self
            .store
            .find_by_source(&record.source_id)
            .await?
            .into_iter()
            .filter(|a| a.is_open() && a.live_sources.contains(&record.source_id))
            .max_by(|a, b| {
                a.last_seen_at
                    .cmp(&b.last_seen_at)
                    .then_with(|| b.assignment_id.cmp(&a.assignment_id))
            });
        if let Some(found) = by_source {
            return Ok(Some((found, MatchedBy::Source)));
        }

        let Some(threshold) = self.policy.similarity_threshold else {
            return Ok(None);
        };
        let bucket = location_bucket(&record.fields);
        let best = self
            .store
            .list_open()
            .await?
            .into_iter()
            .filter(|a| location_bucket(&a.fields) == bucket)
            .map(|a| (similarity(&record.fields, &a.fields), a))
            .filter(|(score, _)| *score >= threshold)
            .max_by(|(sa, a), (sb, b)| {
                sa.total_cmp(sb)
                    .then_with(|| b.assignment_id.cmp(&a.assignment_id))
            });
        Ok(best.map(|(_, a)| (a, MatchedBy::Similarity)))
    }
}

/// Pure decision for `record` against the matched assignment, evaluated at the
/// time the record's content was observed.
pub fn decide(
    policy: &MergePolicy,
    record: &CanonicalRecord,
    existing: Option<PersistedAssignment>,
) -> Resolution {
    let at = record.observed_at;
    let Some(current) = existing else {
        return Resolution::Insert(PersistedAssignment::from_record(record, at));
    };
    if current.last_record_id == record.record_id {
        return Resolution::Replayed(current);
    }

    let mut next = current.clone();
    next.fields = merge_fields(&current.fields, &record.fields);
    next.quality_score = overall_quality(&next.fields);
    next.last_record_id = record.record_id;
    next.pipeline_version = record.pipeline_version.clone();
    if next.external_id.is_none() {
        next.external_id = record.external_id.clone();
    }
    let new_source = !current.live_sources.contains(&record.source_id);
    if !next.source_ids.contains(&record.source_id) {
        next.source_ids.push(record.source_id.clone());
    }
    if new_source {
        next.live_sources.push(record.source_id.clone());
    }

    if at - current.last_bumped_at >= policy.min_bump_interval {
        next.bump_count = current.bump_count.saturating_add(1);
        next.last_seen_at = at.max(current.last_seen_at);
        next.last_bumped_at = at;
        next.last_decision = Some(DecisionKind::Bump);
        return Resolution::Bump { current, next };
    }

    if new_source || !same_values(&current.fields, &next.fields) {
        next.last_decision = Some(DecisionKind::Merge);
        return Resolution::Merge { current, next };
    }
    Resolution::Duplicate(current)
}

/// Per field: higher quality wins, then the more recent observation, then a
/// lexical comparison of the value so the result never depends on call order.
pub fn merge_fields(current: &AssignmentFields, incoming: &AssignmentFields) -> AssignmentFields {
    AssignmentFields {
        subjects: pick(&current.subjects, &incoming.subjects),
        levels: pick(&current.levels, &incoming.levels),
        rate: pick(&current.rate, &incoming.rate),
        location: pick(&current.location, &incoming.location),
        schedule: pick(&current.schedule, &incoming.schedule),
        agency: pick(&current.agency, &incoming.agency),
        lesson_duration: pick(&current.lesson_duration, &incoming.lesson_duration),
        frequency: pick(&current.frequency, &incoming.frequency),
        tutor_preference: pick(&current.tutor_preference, &incoming.tutor_preference),
        remarks: pick(&current.remarks, &incoming.remarks),
    }
}

fn pick<T: Clone + Serialize>(current: &Field<T>, incoming: &Field<T>) -> Field<T> {
    match (current.is_present(), incoming.is_present()) {
        (_, false) => current.clone(),
        (false, true) => incoming.clone(),
        (true, true) => {
            if incoming_wins(current, incoming) {
                incoming.clone()
            } else {
                current.clone()
            }
        }
    }
}

fn incoming_wins<T: Serialize>(current: &Field<T>, incoming: &Field<T>) -> bool {
    let ordering = incoming
        .quality()
        .total_cmp(&current.quality())
        .then_with(|| incoming.observed_at().cmp(&current.observed_at()))
        .then_with(|| tiebreak_key(current).cmp(&tiebreak_key(incoming)));
    ordering == Ordering::Greater
}

fn tiebreak_key<T: Serialize>(field: &Field<T>) -> String {
    let value = serde_json::to_string(&field.value).unwrap_or_default();
    let source = field
        .evidence
        .as_ref()
        .map(|e| e.source_id.as_str())
        .unwrap_or_default();
    format!("{value}|{source}")
}

/// Compares values only; provenance differences do not count as a change.
pub fn same_values(a: &AssignmentFields, b: &AssignmentFields) -> bool {
    a.subjects.value == b.subjects.value
        && a.levels.value == b.levels.value
        && a.rate.value == b.rate.value
        && a.location.value == b.location.value
        && a.schedule.value == b.schedule.value
        && a.agency.value == b.agency.value
        && a.lesson_duration.value == b.lesson_duration.value
        && a.frequency.value == b.frequency.value
        && a.tutor_preference.value == b.tutor_preference.value
        && a.remarks.value == b.remarks.value
}

fn location_bucket(fields: &AssignmentFields) -> String {
    fields
        .location
        .value
        .as_ref()
        .map(Location::bucket)
        .unwrap_or_else(|| "unknown".to_string())
}

fn subject_level_text(fields: &AssignmentFields) -> String {
    let mut parts = fields.subjects.value.clone().unwrap_or_default();
    parts.extend(fields.levels.value.clone().unwrap_or_default());
    parts.sort();
    normalize_token(&parts.join(" "))
}

/// Weighted Jaro-Winkler over subject/level text and remarks, in `0..=1`.
pub fn similarity(a: &AssignmentFields, b: &AssignmentFields) -> f64 {
    let key_score = jaro_winkler(&subject_level_text(a), &subject_level_text(b));
    let remarks_a = normalize_token(a.remarks.value.as_deref().unwrap_or_default());
    let remarks_b = normalize_token(b.remarks.value.as_deref().unwrap_or_default());
    let remarks_score = jaro_winkler(&remarks_a, &remarks_b);
    (key_score * 0.7) + (remarks_score * 0.3)
}
