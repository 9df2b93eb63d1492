//! Hardening stage: deterministic normalization and validation of drafts.
//!
//! Given the same draft and lookup tables the output is always the same;
//! nothing here talks to the inference capability.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveTime, Utc, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tap_adapters::{GeoLookup, Taxonomy};
use tap_core::{
    normalize_token, AssignmentFields, CanonicalDraft, CanonicalRecord, Evidence, ExtractionJob,
    Field, Location, ParseEnumError, Rate, RateUnit, RawEvent, Schedule, StageError, TimeSlot,
    MIN_DRAFT_SCHEMA, SUPPORTED_DRAFT_SCHEMA,
};
use tracing::warn;

use crate::extract::{Extraction, DEFAULT_FIELD_CONFIDENCE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardeningMode {
    /// No validation rules run.
    Off,
    /// Violations are recorded on the record and logged.
    Report,
    /// Any violation fails the job.
    Enforce,
}

impl HardeningMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HardeningMode::Off => "off",
            HardeningMode::Report => "report",
            HardeningMode::Enforce => "enforce",
        }
    }
}

impl fmt::Display for HardeningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HardeningMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(HardeningMode::Off),
            "report" => Ok(HardeningMode::Report),
            "enforce" => Ok(HardeningMode::Enforce),
            _ => Err(ParseEnumError::new("hardening mode", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardeningSettings {
    pub mode: HardeningMode,
    pub require_location: bool,
}

impl Default for HardeningSettings {
    fn default() -> Self {
        Self {
            mode: HardeningMode::Report,
            require_location: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Violation {
    SchemaVersionUnsupported,
    SubjectsMissing,
    LevelMissing,
    RateMissing,
    RateOutOfRange,
    LocationMissing,
}

impl Violation {
    pub fn code(&self) -> &'static str {
        match self {
            Violation::SchemaVersionUnsupported => "schema_version_unsupported",
            Violation::SubjectsMissing => "subjects_missing",
            Violation::LevelMissing => "level_missing",
            Violation::RateMissing => "rate_missing",
            Violation::RateOutOfRange => "rate_out_of_range",
            Violation::LocationMissing => "location_missing",
        }
    }
}

/// Normalized fields plus the rules they broke.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub fields: AssignmentFields,
    pub external_id: Option<String>,
    pub violations: Vec<Violation>,
}

pub struct Hardener {
    settings: HardeningSettings,
    taxonomy: Arc<Taxonomy>,
    geo: Arc<dyn GeoLookup>,
    schedule: ScheduleParser,
}

impl Hardener {
    pub fn new(
        settings: HardeningSettings,
        taxonomy: Arc<Taxonomy>,
        geo: Arc<dyn GeoLookup>,
    ) -> Result<Self> {
        Ok(Self {
            settings,
            taxonomy,
            geo,
            schedule: ScheduleParser::new()?,
        })
    }

    pub fn mode(&self) -> HardeningMode {
        self.settings.mode
    }

    /// Builds the immutable canonical record for `job`. Under `enforce` any
    /// violation is returned as `ValidationFailed` with the rule codes.
    pub fn harden(
        &self,
        job: &ExtractionJob,
        raw: &RawEvent,
        extraction: &Extraction,
        created_at: DateTime<Utc>,
    ) -> Result<CanonicalRecord, StageError> {
        let observed_at = raw.last_changed_at();
        let normalized = self.normalize(&extraction.draft, &raw.source_id, &raw.channel_id, observed_at);
        let codes = normalized
            .violations
            .iter()
            .map(|v| v.code().to_string())
            .collect::<Vec<_>>();

        let violations = match self.settings.mode {
            HardeningMode::Off => Vec::new(),
            HardeningMode::Report => {
                if !codes.is_empty() {
                    warn!(source_id = %raw.source_id, violations = ?codes, "hardening violations (report mode)");
                }
                codes
            }
            HardeningMode::Enforce if !codes.is_empty() => {
                return Err(StageError::ValidationFailed(codes));
            }
            HardeningMode::Enforce => codes,
        };

        let fields = normalized.fields;
        Ok(CanonicalRecord {
            record_id: CanonicalRecord::record_id_for(&raw.source_id, &job.pipeline_version, job.generation),
            job_id: job.job_id,
            source_id: raw.source_id.clone(),
            channel_id: raw.channel_id.clone(),
            pipeline_version: job.pipeline_version.clone(),
            generation: job.generation,
            observed_at,
            created_at,
            external_id: normalized.external_id,
            quality_score: overall_quality(&fields),
            fingerprint: fields.fingerprint(),
            fields,
            violations,
            confidence: extraction.confidence.clone(),
        })
    }

    pub fn normalize(
        &self,
        draft: &CanonicalDraft,
        source_id: &str,
        channel_id: &str,
        observed_at: DateTime<Utc>,
    ) -> Normalized {
        let evidence = |field: &str, factor: f32| Evidence {
            source_id: source_id.to_string(),
            observed_at,
            quality: (draft.confidence_for(field, DEFAULT_FIELD_CONFIDENCE) * factor).clamp(0.0, 1.0),
        };
        let mut fields = AssignmentFields::default();
        let mut violations = Vec::new();

        if !(MIN_DRAFT_SCHEMA..=SUPPORTED_DRAFT_SCHEMA).contains(&draft.schema_version) {
            violations.push(Violation::SchemaVersionUnsupported);
        }

        let (known, unknown) = self.taxonomy.canonical_subjects(&draft.subjects);
        let total = known.len() + unknown.len();
        if total == 0 {
            violations.push(Violation::SubjectsMissing);
        } else {
            let factor = 0.5 + 0.5 * (known.len() as f32 / total as f32);
            let mut subjects = known;
            subjects.extend(unknown);
            fields.subjects = Field::with_value_and_evidence(subjects, evidence("subjects", factor));
        }

        match non_empty(draft.level.as_deref()) {
            None => violations.push(Violation::LevelMissing),
            Some(text) => {
                let codes = self.taxonomy.canonical_levels(text);
                fields.levels = if codes.is_empty() {
                    Field::with_value_and_evidence(vec![normalize_token(text)], evidence("level", 0.5))
                } else {
                    Field::with_value_and_evidence(codes, evidence("level", 1.0))
                };
            }
        }

        match non_empty(draft.rate.as_deref()).and_then(parse_rate) {
            None => violations.push(Violation::RateMissing),
            Some(rate) => {
                let factor = if rate_in_range(&rate) {
                    1.0
                } else {
                    violations.push(Violation::RateOutOfRange);
                    0.3
                };
                fields.rate = Field::with_value_and_evidence(rate, evidence("rate", factor));
            }
        }

        match self.location(draft) {
            None if self.settings.require_location => violations.push(Violation::LocationMissing),
            None => {}
            Some((location, factor)) => {
                fields.location = Field::with_value_and_evidence(location, evidence("location", factor));
            }
        }

        if let Some(text) = non_empty(draft.availability.as_deref()) {
            let schedule = self.schedule.parse(text);
            let factor = if schedule.slots.is_empty() && !schedule.flexible {
                0.5
            } else {
                1.0
            };
            fields.schedule = Field::with_value_and_evidence(schedule, evidence("availability", factor));
        }

        if let Some(agency) = non_empty(draft.agency.as_deref()) {
            fields.agency = Field::with_value_and_evidence(agency.to_string(), evidence("agency", 1.0));
        }
        if let Some(text) = non_empty(draft.lesson_duration.as_deref()) {
            fields.lesson_duration =
                Field::with_value_and_evidence(text.to_string(), evidence("lesson_duration", 1.0));
        }
        if let Some(text) = non_empty(draft.frequency.as_deref()) {
            fields.frequency = Field::with_value_and_evidence(text.to_string(), evidence("frequency", 1.0));
        }
        let preference = [draft.tutor_gender.as_deref(), draft.tutor_type.as_deref()]
            .into_iter()
            .filter_map(non_empty)
            .collect::<Vec<_>>();
        if !preference.is_empty() {
            fields.tutor_preference =
                Field::with_value_and_evidence(preference.join(" / "), evidence("tutor_type", 1.0));
        }
        if let Some(text) = non_empty(draft.remarks.as_deref()) {
            fields.remarks = Field::with_value_and_evidence(text.to_string(), evidence("remarks", 1.0));
        }

        Normalized {
            fields,
            external_id: external_id(draft, channel_id),
            violations,
        }
    }

    fn location(&self, draft: &CanonicalDraft) -> Option<(Location, f32)> {
        let label = non_empty(draft.location.as_deref()).map(str::to_string);
        let lower = label.as_deref().unwrap_or_default().to_ascii_lowercase();
        let online = ["online", "zoom", "virtual", "remote"]
            .iter()
            .any(|w| lower.contains(w));
        let postal_code = non_empty(draft.postal_code.as_deref())
            .and_then(find_postal_code)
            .or_else(|| label.as_deref().and_then(find_postal_code));
        if label.is_none() && postal_code.is_none() {
            return None;
        }

        // Lookup failures degrade to an unresolved region.
        let point = postal_code.as_deref().and_then(|p| self.geo.lookup(p));
        let factor = if online || point.is_some() { 1.0 } else { 0.6 };
        Some((
            Location {
                label,
                postal_code,
                region: point.as_ref().map(|p| p.region.clone()),
                latitude: point.as_ref().and_then(|p| p.latitude),
                longitude: point.as_ref().and_then(|p| p.longitude),
                online,
            },
            factor,
        ))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Agency-scoped assignment code, or channel-scoped when no agency is named.
fn external_id(draft: &CanonicalDraft, channel_id: &str) -> Option<String> {
    let code = normalize_token(non_empty(draft.assignment_code.as_deref())?).replace(' ', "");
    if code.is_empty() {
        return None;
    }
    let scope = non_empty(draft.agency.as_deref())
        .map(normalize_token)
        .filter(|a| !a.is_empty())
        .unwrap_or_else(|| format!("channel {}", normalize_token(channel_id)));
    Some(format!("{scope}:{code}"))
}

fn find_postal_code(text: &str) -> Option<String> {
    let mut run = String::new();
    for ch in text.chars().chain(std::iter::once(' ')) {
        if ch.is_ascii_digit() {
            run.push(ch);
            continue;
        }
        if run.len() == 6 {
            return Some(run);
        }
        run.clear();
    }
    None
}

/// Mean quality over present fields; 0 when nothing is present.
pub fn overall_quality(fields: &AssignmentFields) -> f32 {
    let scores = [
        (fields.subjects.is_present(), fields.subjects.quality()),
        (fields.levels.is_present(), fields.levels.quality()),
        (fields.rate.is_present(), fields.rate.quality()),
        (fields.location.is_present(), fields.location.quality()),
        (fields.schedule.is_present(), fields.schedule.quality()),
        (fields.agency.is_present(), fields.agency.quality()),
        (fields.lesson_duration.is_present(), fields.lesson_duration.quality()),
        (fields.frequency.is_present(), fields.frequency.quality()),
        (fields.tutor_preference.is_present(), fields.tutor_preference.quality()),
        (fields.remarks.is_present(), fields.remarks.quality()),
    ];
    let present = scores.iter().filter(|(p, _)| *p).map(|(_, q)| *q).collect::<Vec<_>>();
    if present.is_empty() {
        0.0
    } else {
        present.iter().sum::<f32>() / present.len() as f32
    }
}

fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if ch == ',' && !seen_dot && !current.is_empty() {
            // Thousands separator, e.g. "1,200".
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.parse::<f64>() {
            out.push(v);
        }
    }
    out
}

/// Parses rate text like `$50-60/hr`, `$45 per lesson` or `1,200/month`.
/// Hourly when no unit is named.
pub fn parse_rate(text: &str) -> Option<Rate> {
    let lower = text.to_ascii_lowercase();
    let unit = if ["/lesson", "per lesson", "/session", "per session", "per class", "a lesson"]
        .iter()
        .any(|p| lower.contains(p))
    {
        RateUnit::Lesson
    } else if ["/month", "per month", "/mth", "monthly", "a month"]
        .iter()
        .any(|p| lower.contains(p))
    {
        RateUnit::Month
    } else {
        RateUnit::Hour
    };

    let scope = match lower.find('$') {
        Some(idx) => &lower[idx..],
        None => lower.as_str(),
    };
    let numbers = extract_numbers(scope)
        .into_iter()
        .filter(|n| *n > 0.0)
        .collect::<Vec<_>>();
    let min = *numbers.first()?;
    let max = numbers.get(1).copied().filter(|m| *m >= min).unwrap_or(min);
    Some(Rate { min, max, unit })
}

pub fn rate_in_range(rate: &Rate) -> bool {
    let (lo, hi) = match rate.unit {
        RateUnit::Hour => (10.0, 300.0),
        RateUnit::Lesson => (10.0, 600.0),
        RateUnit::Month => (40.0, 6_000.0),
    };
    rate.min >= lo && rate.max <= hi
}

/// Availability text → weekday/time-window slots.
pub struct ScheduleParser {
    days: Regex,
    range: Regex,
    after: Regex,
    before: Regex,
}

const TIME: &str = r"(\d{1,2})(?:[:.](\d{2}))?\s*(am|pm)?";

impl ScheduleParser {
    pub fn new() -> Result<Self> {
        Ok(Self {
            days: Regex::new(
                r"\b(mon(?:day)?|tue(?:s|sday)?|wed(?:s|nesday)?|thu(?:r|rs|rsday)?|fri(?:day)?|sat(?:urday)?|sun(?:day)?|weekdays?|weekends?)\b",
            )
            .context("compiling day pattern")?,
            range: Regex::new(&format!(r"\b{TIME}\s*(?:-|to)\s*(\d{{1,2}})(?:[:.](\d{{2}}))?\s*(am|pm)?"))
                .context("compiling time range pattern")?,
            after: Regex::new(&format!(r"\b(?:after|from)\s+{TIME}")).context("compiling after pattern")?,
            before: Regex::new(&format!(r"\b(?:before|by)\s+{TIME}")).context("compiling before pattern")?,
        })
    }

    pub fn parse(&self, text: &str) -> Schedule {
        let lower = text.to_ascii_lowercase();
        let flexible = ["flexible", "any day", "anytime", "any time", "negotiable", "tbc", "to be discussed"]
            .iter()
            .any(|w| lower.contains(w));

        let mut slots: Vec<TimeSlot> = Vec::new();
        // Days named without a time wait for the next segment that has one ("Mon, Wed 3-5pm").
        let mut waiting: Vec<Weekday> = Vec::new();
        for segment in lower.split(|c| matches!(c, ',' | ';' | '\n' | '&')) {
            let days = self.days_in(segment);
            let window = self.window_in(segment);
            match window {
                None => waiting.extend(days),
                Some((start, end)) => {
                    let mut targets = std::mem::take(&mut waiting);
                    targets.extend(days);
                    if targets.is_empty() {
                        push_slot(&mut slots, TimeSlot { day: None, start, end });
                    }
                    for day in targets {
                        push_slot(&mut slots, TimeSlot { day: Some(day), start, end });
                    }
                }
            }
        }
        for day in waiting {
            push_slot(
                &mut slots,
                TimeSlot {
                    day: Some(day),
                    start: None,
                    end: None,
                },
            );
        }

        Schedule {
            slots,
            flexible,
            raw: text.trim().to_string(),
        }
    }

    fn days_in(&self, segment: &str) -> Vec<Weekday> {
        let mut out = Vec::new();
        let mut previous: Option<(usize, Weekday)> = None;
        for m in self.days.find_iter(segment) {
            let token = m.as_str();
            if token.starts_with("weekday") {
                out.extend([Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri]);
                previous = None;
                continue;
            }
            if token.starts_with("weekend") {
                out.extend([Weekday::Sat, Weekday::Sun]);
                previous = None;
                continue;
            }
            let Some(day) = weekday(token) else {
                continue;
            };
            if let Some((end, from)) = previous {
                let between = segment[end..m.start()].trim();
                if between == "-" || between == "to" {
                    let mut cursor = from.succ();
                    while cursor != day {
                        out.push(cursor);
                        cursor = cursor.succ();
                    }
                }
            }
            out.push(day);
            previous = Some((m.end(), day));
        }
        let mut unique = Vec::new();
        for day in out {
            if !unique.contains(&day) {
                unique.push(day);
            }
        }
        unique
    }

    fn window_in(&self, segment: &str) -> Option<(Option<NaiveTime>, Option<NaiveTime>)> {
        if let Some(caps) = self.range.captures(segment) {
            let end_meridiem = caps.get(6).map(|m| m.as_str());
            let start_meridiem = caps.get(3).map(|m| m.as_str()).or(end_meridiem);
            let start = clock_time(caps.get(1)?.as_str(), caps.get(2).map(|m| m.as_str()), start_meridiem);
            let end = clock_time(caps.get(4)?.as_str(), caps.get(5).map(|m| m.as_str()), end_meridiem);
            if start.is_some() || end.is_some() {
                return Some((start, end));
            }
        }
        if let Some(caps) = self.after.captures(segment) {
            let start = clock_time(
                caps.get(1)?.as_str(),
                caps.get(2).map(|m| m.as_str()),
                caps.get(3).map(|m| m.as_str()),
            );
            return start.map(|s| (Some(s), None));
        }
        if let Some(caps) = self.before.captures(segment) {
            let end = clock_time(
                caps.get(1)?.as_str(),
                caps.get(2).map(|m| m.as_str()),
                caps.get(3).map(|m| m.as_str()),
            );
            return end.map(|e| (None, Some(e)));
        }
        None
    }
}

fn push_slot(slots: &mut Vec<TimeSlot>, slot: TimeSlot) {
    if !slots.contains(&slot) {
        slots.push(slot);
    }
}

fn weekday(token: &str) -> Option<Weekday> {
    Some(match token.get(..3)? {
        "mon" => Weekday::Mon,
        "tue" => Weekday::Tue,
        "wed" => Weekday::Wed,
        "thu" => Weekday::Thu,
        "fri" => Weekday::Fri,
        "sat" => Weekday::Sat,
        "sun" => Weekday::Sun,
        _ => return None,
    })
}

fn clock_time(hour: &str, minute: Option<&str>, meridiem: Option<&str>) -> Option<NaiveTime> {
    let mut hour = hour.parse::<u32>().ok()?;
    let minute = minute.map(str::parse::<u32>).transpose().ok()?.unwrap_or(0);
    match meridiem {
        Some("pm") if hour < 12 => hour += 12,
        Some("am") if hour == 12 => hour = 0,
        Some(_) if hour > 12 => return None,
        _ => {}
    }
    NaiveTime::from_hms_opt(hour, minute, 0)
}
