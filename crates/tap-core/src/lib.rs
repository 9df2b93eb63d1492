//! Core domain model for the assignment extraction pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "tap-core";

/// Highest draft schema revision the hardening stage understands.
pub const SUPPORTED_DRAFT_SCHEMA: u32 = 2;
/// Oldest draft schema still accepted.
pub const MIN_DRAFT_SCHEMA: u32 = 1;

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for deterministic tests and replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard = at;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut guard = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Opaque tag scoping a set of jobs to one extraction-logic revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineVersion(String);

impl PipelineVersion {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PipelineVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PipelineVersion {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditMarker {
    pub edited_at: DateTime<Utc>,
    pub content: String,
}

/// Observed source event. Immutable apart from appended edit/delete markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawEvent {
    pub source_id: String,
    pub channel_id: String,
    pub observed_at: DateTime<Utc>,
    pub content: String,
    #[serde(default)]
    pub edit_history: Vec<EditMarker>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl RawEvent {
    pub fn new(
        source_id: impl Into<String>,
        channel_id: impl Into<String>,
        observed_at: DateTime<Utc>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            channel_id: channel_id.into(),
            observed_at,
            content: content.into(),
            edit_history: Vec::new(),
            deleted_at: None,
        }
    }

    /// Latest text of the post, taking edits into account.
    pub fn current_content(&self) -> &str {
        self.edit_history
            .iter()
            .max_by_key(|e| e.edited_at)
            .map(|e| e.content.as_str())
            .unwrap_or(&self.content)
    }

    /// Time the current content was observed.
    pub fn last_changed_at(&self) -> DateTime<Utc> {
        self.edit_history
            .iter()
            .map(|e| e.edited_at)
            .max()
            .unwrap_or(self.observed_at)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Ok,
    Failed,
    Skipped,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Ok,
        JobState::Failed,
        JobState::Skipped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Ok => "ok",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Ok | JobState::Failed | JobState::Skipped)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}

impl FromStr for JobState {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| ParseEnumError {
                kind: "job state",
                value: s.to_string(),
            })
    }
}

/// Durable extraction job, unique on `(source_id, pipeline_version)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionJob {
    pub job_id: Uuid,
    pub source_id: String,
    pub pipeline_version: PipelineVersion,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub generation: u32,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub decision: Option<DecisionKind>,
    pub assignment_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExtractionJob {
    pub fn new(
        source_id: impl Into<String>,
        pipeline_version: PipelineVersion,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            source_id: source_id.into(),
            pipeline_version,
            state: JobState::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            generation: 0,
            claimed_by: None,
            claimed_at: None,
            lease_expires_at: None,
            last_error: None,
            decision: None,
            assignment_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether another worker may currently claim this job.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            JobState::Pending => {
                self.attempts < self.max_attempts
                    && self.lease_expires_at.map_or(true, |at| at <= now)
            }
            JobState::Processing => {
                self.lease_expires_at.map_or(true, |at| at < now)
                    && self.attempts + 1 < self.max_attempts
            }
            _ => false,
        }
    }

    pub fn lease_is_live(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Processing && self.lease_expires_at.map_or(false, |at| at >= now)
    }
}

/// Terminal result handed to `JobQueue::complete`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Ok {
        decision: Option<DecisionKind>,
        assignment_id: Option<Uuid>,
    },
    Skipped(String),
    Failed(String),
}

impl JobOutcome {
    pub fn state(&self) -> JobState {
        match self {
            JobOutcome::Ok { .. } => JobState::Ok,
            JobOutcome::Skipped(_) => JobState::Skipped,
            JobOutcome::Failed(_) => JobState::Failed,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            JobOutcome::Ok { .. } => None,
            JobOutcome::Skipped(reason) | JobOutcome::Failed(reason) => Some(reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseReason {
    /// Counts as an attempt and backs off.
    Transient(String),
    /// Worker is stopping; the job goes straight back to pending.
    Shutdown,
}

/// Provenance attached to a canonical value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub source_id: String,
    pub observed_at: DateTime<Utc>,
    pub quality: f32,
}

/// Canonical field wrapper with optional value + evidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field<T> {
    pub value: Option<T>,
    pub evidence: Option<Evidence>,
}

impl<T> Default for Field<T> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<T> Field<T> {
    pub fn empty() -> Self {
        Self {
            value: None,
            evidence: None,
        }
    }

    pub fn with_value_and_evidence(value: T, evidence: Evidence) -> Self {
        Self {
            value: Some(value),
            evidence: Some(evidence),
        }
    }

    pub fn is_present(&self) -> bool {
        self.value.is_some()
    }

    pub fn quality(&self) -> f32 {
        match (&self.value, &self.evidence) {
            (Some(_), Some(ev)) => ev.quality,
            _ => 0.0,
        }
    }

    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.evidence.as_ref().map(|ev| ev.observed_at)
    }
}

/// Structured draft as emitted by the inference capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CanonicalDraft {
    pub schema_version: u32,
    pub is_assignment: bool,
    pub subjects: Vec<String>,
    pub level: Option<String>,
    pub rate: Option<String>,
    pub location: Option<String>,
    pub postal_code: Option<String>,
    pub availability: Option<String>,
    pub agency: Option<String>,
    pub assignment_code: Option<String>,
    pub lesson_duration: Option<String>,
    pub frequency: Option<String>,
    pub tutor_gender: Option<String>,
    pub tutor_type: Option<String>,
    pub remarks: Option<String>,
    pub confidence: BTreeMap<String, f32>,
}

impl CanonicalDraft {
    /// Confidence reported for `field`, defaulting to `fallback` when absent.
    pub fn confidence_for(&self, field: &str, fallback: f32) -> f32 {
        self.confidence
            .get(field)
            .copied()
            .unwrap_or(fallback)
            .clamp(0.0, 1.0)
    }
}

/// Result of reading an inference response at the extraction/hardening boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum DraftParse {
    Ok(CanonicalDraft),
    SchemaError(String),
}

impl DraftParse {
    pub fn from_json(text: &str) -> Self {
        let body = strip_code_fence(text);
        let value: serde_json::Value = match serde_json::from_str(body) {
            Ok(value) => value,
            Err(err) => return DraftParse::SchemaError(format!("invalid json: {err}")),
        };
        let Some(object) = value.as_object() else {
            return DraftParse::SchemaError("top-level value is not an object".to_string());
        };
        match object.get("schema_version").and_then(|v| v.as_u64()) {
            None => return DraftParse::SchemaError("schema_version missing".to_string()),
            Some(v) if !(u64::from(MIN_DRAFT_SCHEMA)..=u64::from(SUPPORTED_DRAFT_SCHEMA)).contains(&v) => {
                return DraftParse::SchemaError(format!("unsupported schema_version {v}"))
            }
            Some(_) => {}
        }
        if !object.get("is_assignment").map_or(false, |v| v.is_boolean()) {
            return DraftParse::SchemaError("is_assignment must be a boolean".to_string());
        }
        match serde_json::from_value::<CanonicalDraft>(value) {
            Ok(draft) => DraftParse::Ok(draft),
            Err(err) => DraftParse::SchemaError(err.to_string()),
        }
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ConfidenceMeta {
    pub model: String,
    pub overall: f32,
    pub per_field: BTreeMap<String, f32>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateUnit {
    Hour,
    Lesson,
    Month,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rate {
    pub min: f64,
    pub max: f64,
    pub unit: RateUnit,
}

impl Rate {
    /// Ten-dollar bucket of the lower bound, e.g. `60-69/hour`.
    pub fn band(&self) -> String {
        let floor = ((self.min.max(0.0) / 10.0).floor() as i64) * 10;
        let unit = match self.unit {
            RateUnit::Hour => "hour",
            RateUnit::Lesson => "lesson",
            RateUnit::Month => "month",
        };
        format!("{}-{}/{}", floor, floor + 9, unit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub day: Option<Weekday>,
    pub start: Option<NaiveTime>,
    pub end: Option<NaiveTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Schedule {
    pub slots: Vec<TimeSlot>,
    pub flexible: bool,
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Location {
    pub label: Option<String>,
    pub postal_code: Option<String>,
    pub region: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub online: bool,
}

impl Location {
    pub fn bucket(&self) -> String {
        if self.online {
            return "online".to_string();
        }
        if let Some(region) = &self.region {
            return normalize_token(region);
        }
        if let Some(sector) = self.postal_code.as_deref().and_then(|p| p.get(..2)) {
            return format!("sector-{sector}");
        }
        "unknown".to_string()
    }
}

/// Merge-relevant fields shared by canonical records and persisted assignments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AssignmentFields {
    pub subjects: Field<Vec<String>>,
    pub levels: Field<Vec<String>>,
    pub rate: Field<Rate>,
    pub location: Field<Location>,
    pub schedule: Field<Schedule>,
    pub agency: Field<String>,
    pub lesson_duration: Field<String>,
    pub frequency: Field<String>,
    pub tutor_preference: Field<String>,
    pub remarks: Field<String>,
}

impl AssignmentFields {
    pub fn fingerprint(&self) -> String {
        let rate_band = self
            .rate
            .value
            .as_ref()
            .map(Rate::band)
            .unwrap_or_else(|| "none".to_string());
        let location_bucket = self
            .location
            .value
            .as_ref()
            .map(Location::bucket)
            .unwrap_or_else(|| "unknown".to_string());
        fingerprint(
            self.subjects.value.as_deref().unwrap_or_default(),
            self.levels.value.as_deref().unwrap_or_default(),
            &rate_band,
            &location_bucket,
            self.agency.value.as_deref().unwrap_or_default(),
        )
    }
}

/// Immutable output of extraction + hardening for one job generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub record_id: Uuid,
    pub job_id: Uuid,
    pub source_id: String,
    pub channel_id: String,
    pub pipeline_version: PipelineVersion,
    pub generation: u32,
    pub observed_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub external_id: Option<String>,
    pub fields: AssignmentFields,
    pub quality_score: f32,
    pub fingerprint: String,
    pub violations: Vec<String>,
    pub confidence: ConfidenceMeta,
}

impl CanonicalRecord {
    /// Deterministic id so a replayed generation maps onto the same record.
    pub fn record_id_for(source_id: &str, version: &PipelineVersion, generation: u32) -> Uuid {
        let key = format!("{}:{}:{}", source_id, version, generation);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
    }
}

pub fn normalize_token(input: &str) -> String {
    input
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Coarse duplicate key over normalized subject/level/rate/location/agency fields.
pub fn fingerprint(
    subjects: &[String],
    levels: &[String],
    rate_band: &str,
    location_bucket: &str,
    agency: &str,
) -> String {
    let mut subjects = subjects.iter().map(|s| normalize_token(s)).collect::<Vec<_>>();
    subjects.sort();
    subjects.dedup();
    let mut levels = levels.iter().map(|s| normalize_token(s)).collect::<Vec<_>>();
    levels.sort();
    levels.dedup();
    let material = format!(
        "s={}|l={}|r={}|loc={}|a={}",
        subjects.join(","),
        levels.join(","),
        rate_band,
        location_bucket,
        normalize_token(agency),
    );
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Open,
    Closed,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Open => "open",
            AssignmentStatus::Closed => "closed",
        }
    }
}

/// Durable assignment row keyed by fingerprint (or external id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedAssignment {
    pub assignment_id: Uuid,
    pub fingerprint: String,
    pub external_id: Option<String>,
    pub status: AssignmentStatus,
    pub bump_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_bumped_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_reason: Option<String>,
    pub source_ids: Vec<String>,
    pub live_sources: Vec<String>,
    pub fields: AssignmentFields,
    pub quality_score: f32,
    pub pipeline_version: PipelineVersion,
    pub last_record_id: Uuid,
    pub revision: u64,
    pub last_notified_at: Option<DateTime<Utc>>,
    /// Decision that produced `last_record_id`; lets a replayed write report it again.
    #[serde(default)]
    pub last_decision: Option<DecisionKind>,
}

impl PersistedAssignment {
    /// First sighting of a canonical record.
    pub fn from_record(record: &CanonicalRecord, seen_at: DateTime<Utc>) -> Self {
        Self {
            assignment_id: Uuid::new_v4(),
            fingerprint: record.fingerprint.clone(),
            external_id: record.external_id.clone(),
            status: AssignmentStatus::Open,
            bump_count: 1,
            first_seen_at: seen_at,
            last_seen_at: seen_at,
            last_bumped_at: seen_at,
            closed_at: None,
            close_reason: None,
            source_ids: vec![record.source_id.clone()],
            live_sources: vec![record.source_id.clone()],
            fields: record.fields.clone(),
            quality_score: record.quality_score,
            pipeline_version: record.pipeline_version.clone(),
            last_record_id: record.record_id,
            revision: 0,
            last_notified_at: None,
            last_decision: Some(DecisionKind::Insert),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == AssignmentStatus::Open
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    Insert,
    Bump,
    Merge,
    Duplicate,
}

impl DecisionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionKind::Insert => "insert",
            DecisionKind::Bump => "bump",
            DecisionKind::Merge => "merge",
            DecisionKind::Duplicate => "duplicate",
        }
    }

    pub fn requires_dispatch(&self) -> bool {
        matches!(self, DecisionKind::Insert | DecisionKind::Bump)
    }
}

impl fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DecisionKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            DecisionKind::Insert,
            DecisionKind::Bump,
            DecisionKind::Merge,
            DecisionKind::Duplicate,
        ]
        .into_iter()
        .find(|d| d.as_str() == s)
        .ok_or_else(|| ParseEnumError {
            kind: "decision",
            value: s.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchChannel {
    Broadcast,
    Notify,
}

impl DispatchChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchChannel::Broadcast => "broadcast",
            DispatchChannel::Notify => "notify",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Pending,
    Sent,
    Failed,
    Spooled,
    Skipped,
    /// Broadcast post removed after the assignment closed.
    Retracted,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DispatchKey {
    pub assignment_id: Uuid,
    pub record_id: Uuid,
    pub channel: DispatchChannel,
    pub recipient: Option<String>,
}

/// One side-effect attempt, written before delivery is attempted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub dispatch_id: Uuid,
    pub assignment_id: Uuid,
    pub record_id: Uuid,
    pub channel: DispatchChannel,
    pub recipient: Option<String>,
    pub status: DispatchStatus,
    pub external_ref: Option<String>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DispatchRecord {
    pub fn pending(key: DispatchKey, now: DateTime<Utc>) -> Self {
        Self {
            dispatch_id: Uuid::new_v4(),
            assignment_id: key.assignment_id,
            record_id: key.record_id,
            channel: key.channel,
            recipient: key.recipient,
            status: DispatchStatus::Pending,
            external_ref: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> DispatchKey {
        DispatchKey {
            assignment_id: self.assignment_id,
            record_id: self.record_id,
            channel: self.channel,
            recipient: self.recipient.clone(),
        }
    }
}

/// Failure taxonomy shared by every stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageError {
    #[error("Transient:{0}")]
    Transient(String),
    #[error("Malformed:{0}")]
    Malformed(String),
    #[error("ValidationFailed:{}", .0.join(","))]
    ValidationFailed(Vec<String>),
    #[error("Permanent:{0}")]
    Permanent(String),
}

impl StageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::Transient(_))
    }
}

/// Stage result interpreted by the worker loop into queue transitions.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Ok(T),
    Retry(String),
    Fatal(String),
}

impl<T> Outcome<T> {
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Ok(v) => Outcome::Ok(f(v)),
            Outcome::Retry(r) => Outcome::Retry(r),
            Outcome::Fatal(r) => Outcome::Fatal(r),
        }
    }
}

impl<T> From<Result<T, StageError>> for Outcome<T> {
    fn from(result: Result<T, StageError>) -> Self {
        match result {
            Ok(v) => Outcome::Ok(v),
            Err(err) if err.is_retryable() => Outcome::Retry(err.to_string()),
            Err(err) => Outcome::Fatal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, h, 0, 0).single().expect("ts")
    }

    #[test]
    fn fingerprint_ignores_order_and_case() {
        let a = fingerprint(
            &["Math".into(), "Physics".into()],
            &["sec3".into()],
            "60-69/hour",
            "west",
            "Ace Tutors",
        );
        let b = fingerprint(
            &["physics".into(), "math".into(), "MATH".into()],
            &["SEC3".into()],
            "60-69/hour",
            "west",
            "ace-tutors",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn fingerprint_changes_with_rate_band() {
        let a = fingerprint(&["math".into()], &["sec3".into()], "60-69/hour", "west", "");
        let b = fingerprint(&["math".into()], &["sec3".into()], "70-79/hour", "west", "");
        assert_ne!(a, b);
    }

    #[test]
    fn rate_band_buckets_by_ten() {
        let rate = Rate {
            min: 65.0,
            max: 70.0,
            unit: RateUnit::Hour,
        };
        assert_eq!(rate.band(), "60-69/hour");
    }

    #[test]
    fn location_bucket_prefers_online_then_region_then_sector() {
        let online = Location {
            online: true,
            region: Some("West".into()),
            ..Location::default()
        };
        assert_eq!(online.bucket(), "online");
        let sector = Location {
            postal_code: Some("650123".into()),
            ..Location::default()
        };
        assert_eq!(sector.bucket(), "sector-65");
        assert_eq!(Location::default().bucket(), "unknown");
    }

    #[test]
    fn draft_parse_accepts_fenced_json() {
        let text = "```json\n{\"schema_version\":1,\"is_assignment\":true,\"subjects\":[\"Math\"],\"rate\":\"$60/hr\"}\n```";
        match DraftParse::from_json(text) {
            DraftParse::Ok(draft) => {
                assert_eq!(draft.subjects, vec!["Math".to_string()]);
                assert_eq!(draft.rate.as_deref(), Some("$60/hr"));
            }
            DraftParse::SchemaError(e) => panic!("unexpected schema error {e}"),
        }
    }

    #[test]
    fn draft_parse_rejects_missing_schema_version_and_bad_types() {
        assert!(matches!(
            DraftParse::from_json(r#"{"is_assignment":true}"#),
            DraftParse::SchemaError(_)
        ));
        assert!(matches!(
            DraftParse::from_json(r#"{"schema_version":1,"is_assignment":"yes"}"#),
            DraftParse::SchemaError(_)
        ));
        assert!(matches!(
            DraftParse::from_json(r#"{"schema_version":9,"is_assignment":true}"#),
            DraftParse::SchemaError(_)
        ));
        assert!(matches!(
            DraftParse::from_json(r#"{"schema_version":1,"is_assignment":true,"subjects":"Math"}"#),
            DraftParse::SchemaError(_)
        ));
        assert!(matches!(DraftParse::from_json("not json"), DraftParse::SchemaError(_)));
    }

    #[test]
    fn stage_errors_map_to_outcomes() {
        let retry: Outcome<()> = Err(StageError::Transient("timeout".into())).into();
        assert_eq!(retry, Outcome::Retry("Transient:timeout".into()));
        let fatal: Outcome<()> =
            Err(StageError::ValidationFailed(vec!["rate_missing".into()])).into();
        assert_eq!(fatal, Outcome::Fatal("ValidationFailed:rate_missing".into()));
    }

    #[test]
    fn raw_event_uses_latest_edit() {
        let mut event = RawEvent::new("S1", "chan", ts(1), "first");
        event.edit_history.push(EditMarker {
            edited_at: ts(3),
            content: "third".into(),
        });
        event.edit_history.push(EditMarker {
            edited_at: ts(2),
            content: "second".into(),
        });
        assert_eq!(event.current_content(), "third");
        assert_eq!(event.last_changed_at(), ts(3));
    }

    #[test]
    fn claimability_respects_backoff_and_leases() {
        let now = ts(5);
        let mut job = ExtractionJob::new("S1", "v1".into(), 3, ts(0));
        assert!(job.is_claimable(now));
        job.lease_expires_at = Some(ts(6));
        assert!(!job.is_claimable(now));
        job.state = JobState::Processing;
        assert!(!job.is_claimable(now));
        assert!(job.lease_is_live(now));
        job.lease_expires_at = Some(ts(4));
        assert!(job.is_claimable(now));
        job.state = JobState::Ok;
        assert!(!job.is_claimable(now));
    }

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(ts(0));
        clock.advance(chrono::Duration::hours(7));
        assert_eq!(clock.now(), ts(7));
    }

    #[test]
    fn job_state_round_trips_through_str() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().expect("parse"), state);
        }
        assert!("bogus".parse::<JobState>().is_err());
    }
}
