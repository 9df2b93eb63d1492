//! Side effects for persisted assignments: the public broadcast post and the
//! targeted notifications.
//!
//! A `DispatchRecord` is written as `pending` before every delivery attempt
//! and updated afterwards, so a restart can tell what was already sent. A
//! sub-channel that fails outright spills into the fallback spool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tap_adapters::{BroadcastChannel, Notifier, OutboundMessage, RecipientMatcher};
use tap_core::{
    CanonicalRecord, Clock, DecisionKind, DispatchChannel, DispatchKey, DispatchRecord,
    DispatchStatus, PersistedAssignment, RateUnit,
};
use tap_storage::{
    AssignmentStore, CanonicalStore, FallbackSpool, SimpleTokenBucket, SpoolEntry, SpooledFile,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::persist::PersistenceAdapter;

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub max_recipients: usize,
    /// Minimum gap between two notification rounds for one assignment.
    pub notify_cooldown: chrono::Duration,
    pub messages_per_second: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_recipients: 50,
            notify_cooldown: chrono::Duration::minutes(30),
            messages_per_second: 20,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub broadcast: Option<DispatchStatus>,
    pub notified: usize,
    pub notify_failed: usize,
    /// Notification round suppressed by the per-assignment cooldown.
    pub cooled_down: bool,
    pub spooled: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpoolReplaySummary {
    pub replayed: usize,
    pub dropped: usize,
    pub remaining: usize,
}

pub struct Dispatcher {
    persistence: Arc<PersistenceAdapter>,
    records: Arc<dyn CanonicalStore>,
    broadcast: Option<Arc<dyn BroadcastChannel>>,
    notifier: Option<Arc<dyn Notifier>>,
    matcher: Option<Arc<dyn RecipientMatcher>>,
    spool: FallbackSpool,
    bucket: SimpleTokenBucket,
    clock: Arc<dyn Clock>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        persistence: Arc<PersistenceAdapter>,
        records: Arc<dyn CanonicalStore>,
        spool: FallbackSpool,
        clock: Arc<dyn Clock>,
        settings: DispatchSettings,
    ) -> Self {
        let per_second = settings.messages_per_second.max(1);
        let bucket = SimpleTokenBucket::new(per_second, Duration::from_secs(1) / per_second);
        Self {
            persistence,
            records,
            broadcast: None,
            notifier: None,
            matcher: None,
            spool,
            bucket,
            clock,
            settings,
        }
    }

    pub fn with_broadcast(mut self, channel: Arc<dyn BroadcastChannel>) -> Self {
        self.broadcast = Some(channel);
        self
    }

    pub fn with_notifications(
        mut self,
        notifier: Arc<dyn Notifier>,
        matcher: Arc<dyn RecipientMatcher>,
    ) -> Self {
        self.notifier = Some(notifier);
        self.matcher = Some(matcher);
        self
    }

    pub fn spool(&self) -> &FallbackSpool {
        &self.spool
    }

    /// Whether any sub-channel is configured.
    pub fn is_enabled(&self) -> bool {
        self.broadcast.is_some() || self.notifier.is_some()
    }

    fn store(&self) -> &Arc<dyn AssignmentStore> {
        self.persistence.store()
    }

    /// Runs both sub-channels for the decision that produced `record`.
    /// Delivery failures are recorded, never returned; errors mean the
    /// dispatch bookkeeping itself could not be written.
    pub async fn dispatch(
        &self,
        assignment: &PersistedAssignment,
        record: &CanonicalRecord,
        decision: DecisionKind,
    ) -> Result<DispatchOutcome> {
        let mut outcome = DispatchOutcome::default();
        if !decision.requires_dispatch() {
            debug!(assignment_id = %assignment.assignment_id, decision = decision.as_str(), "no side effects for decision");
            return Ok(outcome);
        }
        let message = render_message(assignment);

        if let Some(channel) = &self.broadcast {
            let key = DispatchKey {
                assignment_id: assignment.assignment_id,
                record_id: record.record_id,
                channel: DispatchChannel::Broadcast,
                recipient: None,
            };
            let status = self.deliver_broadcast(channel.as_ref(), key, &message, true).await?;
            if status == DispatchStatus::Spooled {
                outcome.spooled += 1;
            }
            outcome.broadcast = Some(status);
        }

        if let (Some(notifier), Some(matcher)) = (&self.notifier, &self.matcher) {
            self.notify_round(notifier.as_ref(), matcher.as_ref(), assignment, record, &message, &mut outcome)
                .await?;
        }

        info!(
            assignment_id = %assignment.assignment_id,
            record_id = %record.record_id,
            broadcast = ?outcome.broadcast,
            notified = outcome.notified,
            notify_failed = outcome.notify_failed,
            spooled = outcome.spooled,
            "dispatch finished"
        );
        Ok(outcome)
    }

    async fn deliver_broadcast(
        &self,
        channel: &dyn BroadcastChannel,
        key: DispatchKey,
        message: &OutboundMessage,
        spool_on_failure: bool,
    ) -> Result<DispatchStatus> {
        let existing = self.store().get_dispatch(&key).await?;
        if let Some(done) = existing.as_ref().filter(|d| settled(d.status)) {
            return Ok(done.status);
        }
        let mut dispatch = self.begin(existing, key).await?;

        match channel.post(message).await {
            Ok(post_ref) => {
                dispatch.status = DispatchStatus::Sent;
                dispatch.external_ref = Some(post_ref);
                dispatch.last_error = None;
            }
            Err(err) => {
                warn!(assignment_id = %dispatch.assignment_id, error = %err, "broadcast failed");
                dispatch.status = DispatchStatus::Failed;
                dispatch.last_error = Some(err.to_string());
                if spool_on_failure {
                    let entry = SpoolEntry::new(
                        DispatchChannel::Broadcast,
                        dispatch.assignment_id,
                        dispatch.record_id,
                        Vec::new(),
                        err.to_string(),
                        self.clock.now(),
                    );
                    if self.spill(&entry).await {
                        dispatch.status = DispatchStatus::Spooled;
                    }
                }
            }
        }
        self.finish(&mut dispatch).await?;
        Ok(dispatch.status)
    }

    async fn notify_round(
        &self,
        notifier: &dyn Notifier,
        matcher: &dyn RecipientMatcher,
        assignment: &PersistedAssignment,
        record: &CanonicalRecord,
        message: &OutboundMessage,
        outcome: &mut DispatchOutcome,
    ) -> Result<()> {
        let now = self.clock.now();
        let round_key = DispatchKey {
            assignment_id: assignment.assignment_id,
            record_id: record.record_id,
            channel: DispatchChannel::Notify,
            recipient: None,
        };
        let started = self
            .store()
            .dispatches_for(assignment.assignment_id)
            .await?
            .into_iter()
            .any(|d| d.record_id == record.record_id && d.channel == DispatchChannel::Notify);

        // A round already under way for this record resumes past the cooldown.
        let cooling = assignment
            .last_notified_at
            .map_or(false, |prev| now - prev < self.settings.notify_cooldown);
        if cooling && !started {
            let mut skipped = DispatchRecord::pending(round_key, now);
            skipped.status = DispatchStatus::Skipped;
            skipped.last_error = Some("notify_cooldown".to_string());
            self.store().put_dispatch(&skipped).await?;
            outcome.cooled_down = true;
            return Ok(());
        }
        if let Some(round) = self.store().get_dispatch(&round_key).await? {
            if round.status == DispatchStatus::Skipped || round.status == DispatchStatus::Spooled {
                outcome.cooled_down = round.status == DispatchStatus::Skipped;
                return Ok(());
            }
        }

        let recipients = match matcher
            .match_recipients(record, self.settings.max_recipients)
            .await
        {
            Ok(matches) => matches
                .into_iter()
                .take(self.settings.max_recipients)
                .map(|m| m.recipient_id)
                .collect::<Vec<_>>(),
            Err(err) => {
                warn!(assignment_id = %assignment.assignment_id, error = %err, "recipient matching failed");
                let entry = SpoolEntry::new(
                    DispatchChannel::Notify,
                    assignment.assignment_id,
                    record.record_id,
                    Vec::new(),
                    err.to_string(),
                    now,
                );
                let mut round = DispatchRecord::pending(round_key, now);
                round.last_error = Some(err.to_string());
                round.status = if self.spill(&entry).await {
                    outcome.spooled += 1;
                    DispatchStatus::Spooled
                } else {
                    DispatchStatus::Failed
                };
                self.store().put_dispatch(&round).await?;
                return Ok(());
            }
        };
        if recipients.is_empty() {
            debug!(assignment_id = %assignment.assignment_id, "no matching recipients");
            return Ok(());
        }

        let (sent, failed) = self
            .deliver_notifications(notifier, assignment.assignment_id, record.record_id, &recipients, message)
            .await?;
        outcome.notified = sent;
        outcome.notify_failed = failed.len();

        if sent == 0 && !failed.is_empty() {
            let entry = SpoolEntry::new(
                DispatchChannel::Notify,
                assignment.assignment_id,
                record.record_id,
                failed.clone(),
                "all notifications failed",
                self.clock.now(),
            );
            if self.spill(&entry).await {
                outcome.spooled += 1;
                for recipient in failed {
                    let key = DispatchKey {
                        recipient: Some(recipient),
                        ..round_key.clone()
                    };
                    if let Some(mut dispatch) = self.store().get_dispatch(&key).await? {
                        dispatch.status = DispatchStatus::Spooled;
                        self.finish(&mut dispatch).await?;
                    }
                }
            }
        }
        if sent > 0 {
            self.persistence
                .mark_notified(assignment.assignment_id, self.clock.now())
                .await?;
        }
        Ok(())
    }

    /// Sends to each recipient not already served. Returns how many are now
    /// sent and which ones failed.
    async fn deliver_notifications(
        &self,
        notifier: &dyn Notifier,
        assignment_id: Uuid,
        record_id: Uuid,
        recipients: &[String],
        message: &OutboundMessage,
    ) -> Result<(usize, Vec<String>)> {
        let mut sent = 0usize;
        let mut failed = Vec::new();
        for recipient in recipients {
            let key = DispatchKey {
                assignment_id,
                record_id,
                channel: DispatchChannel::Notify,
                recipient: Some(recipient.clone()),
            };
            let existing = self.store().get_dispatch(&key).await?;
            if existing.as_ref().map_or(false, |d| d.status == DispatchStatus::Sent) {
                sent += 1;
                continue;
            }
            let mut dispatch = self.begin(existing, key).await?;
            self.bucket.take().await;
            match notifier.notify(recipient, message).await {
                Ok(message_ref) => {
                    dispatch.status = DispatchStatus::Sent;
                    dispatch.external_ref = Some(message_ref);
                    dispatch.last_error = None;
                    sent += 1;
                }
                Err(err) => {
                    debug!(%recipient, error = %err, "notification failed");
                    dispatch.status = DispatchStatus::Failed;
                    dispatch.last_error = Some(err.to_string());
                    failed.push(recipient.clone());
                }
            }
            self.finish(&mut dispatch).await?;
        }
        Ok((sent, failed))
    }

    /// Persists the attempt as pending before anything leaves the process.
    async fn begin(
        &self,
        existing: Option<DispatchRecord>,
        key: DispatchKey,
    ) -> Result<DispatchRecord> {
        let now = self.clock.now();
        let mut dispatch = existing.unwrap_or_else(|| DispatchRecord::pending(key, now));
        dispatch.status = DispatchStatus::Pending;
        dispatch.attempts += 1;
        dispatch.updated_at = now;
        self.store()
            .put_dispatch(&dispatch)
            .await
            .context("recording pending dispatch")?;
        Ok(dispatch)
    }

    async fn finish(&self, dispatch: &mut DispatchRecord) -> Result<()> {
        dispatch.updated_at = self.clock.now();
        self.store()
            .put_dispatch(dispatch)
            .await
            .context("recording dispatch result")?;
        Ok(())
    }

    async fn spill(&self, entry: &SpoolEntry) -> bool {
        match self.spool.write(entry).await {
            Ok(path) => {
                info!(path = %path.display(), channel = entry.channel.as_str(), "dispatch spooled");
                true
            }
            Err(err) => {
                warn!(error = %err, assignment_id = %entry.assignment_id, "could not spool failed dispatch");
                false
            }
        }
    }

    /// Removes broadcast posts of assignments that have closed.
    pub async fn retract_closed(&self, closed: &[PersistedAssignment]) -> Result<usize> {
        let Some(channel) = &self.broadcast else {
            return Ok(0);
        };
        let mut retracted = 0usize;
        for assignment in closed.iter().filter(|a| !a.is_open()) {
            for mut dispatch in self.store().dispatches_for(assignment.assignment_id).await? {
                if dispatch.channel != DispatchChannel::Broadcast
                    || dispatch.status != DispatchStatus::Sent
                {
                    continue;
                }
                let Some(post_ref) = dispatch.external_ref.clone() else {
                    continue;
                };
                match channel.retract(&post_ref).await {
                    Ok(()) => {
                        dispatch.status = DispatchStatus::Retracted;
                        self.finish(&mut dispatch).await?;
                        retracted += 1;
                    }
                    Err(err) => {
                        warn!(assignment_id = %assignment.assignment_id, %post_ref, error = %err, "retract failed");
                    }
                }
            }
        }
        Ok(retracted)
    }

    /// Re-drives spooled dispatches. Entries for assignments that no longer
    /// exist or have closed are dropped; delivered entries are deleted.
    pub async fn replay_spool(&self) -> Result<SpoolReplaySummary> {
        let mut summary = SpoolReplaySummary::default();
        for file in self.spool.list().await? {
            let entry = &file.entry;
            let assignment = self.store().get_assignment(entry.assignment_id).await?;
            let Some(assignment) = assignment.filter(|a| a.is_open()) else {
                info!(spool_id = %entry.spool_id, "dropping spool entry for closed or missing assignment");
                self.spool.remove(&file).await?;
                summary.dropped += 1;
                continue;
            };
            let message = render_message(&assignment);
            let done = match entry.channel {
                DispatchChannel::Broadcast => self.replay_broadcast(&file, &message).await?,
                DispatchChannel::Notify => self.replay_notify(&file, &message).await?,
            };
            if done {
                self.spool.remove(&file).await?;
                summary.replayed += 1;
            } else {
                summary.remaining += 1;
            }
        }
        Ok(summary)
    }

    async fn replay_broadcast(&self, file: &SpooledFile, message: &OutboundMessage) -> Result<bool> {
        let Some(channel) = &self.broadcast else {
            return Ok(false);
        };
        let key = DispatchKey {
            assignment_id: file.entry.assignment_id,
            record_id: file.entry.record_id,
            channel: DispatchChannel::Broadcast,
            recipient: None,
        };
        // The spooled record is settled; reopen it so delivery runs again.
        if let Some(mut spooled) = self.store().get_dispatch(&key).await? {
            if spooled.status == DispatchStatus::Sent {
                return Ok(true);
            }
            spooled.status = DispatchStatus::Failed;
            self.finish(&mut spooled).await?;
        }
        let status = self
            .deliver_broadcast(channel.as_ref(), key.clone(), message, false)
            .await?;
        if status == DispatchStatus::Sent {
            return Ok(true);
        }
        if let Some(mut failed) = self.store().get_dispatch(&key).await? {
            failed.status = DispatchStatus::Spooled;
            self.finish(&mut failed).await?;
        }
        Ok(false)
    }

    async fn replay_notify(&self, file: &SpooledFile, message: &OutboundMessage) -> Result<bool> {
        let (Some(notifier), Some(matcher)) = (&self.notifier, &self.matcher) else {
            return Ok(false);
        };
        let entry = &file.entry;
        let recipients = if entry.recipients.is_empty() {
            let Some(record) = self.records.get_record(entry.record_id).await? else {
                warn!(record_id = %entry.record_id, "spooled notification lost its record");
                return Ok(true);
            };
            match matcher
                .match_recipients(&record, self.settings.max_recipients)
                .await
            {
                Ok(matches) => matches
                    .into_iter()
                    .take(self.settings.max_recipients)
                    .map(|m| m.recipient_id)
                    .collect(),
                Err(err) => {
                    warn!(error = %err, "recipient matching still failing");
                    return Ok(false);
                }
            }
        } else {
            entry.recipients.clone()
        };

        let (sent, failed) = self
            .deliver_notifications(notifier.as_ref(), entry.assignment_id, entry.record_id, &recipients, message)
            .await?;
        if sent > 0 {
            self.persistence
                .mark_notified(entry.assignment_id, self.clock.now())
                .await?;
        }
        if failed.is_empty() {
            return Ok(true);
        }
        let mut rest = entry.clone();
        rest.recipients = failed;
        self.spool.rewrite(file, &rest).await?;
        Ok(false)
    }
}

/// Settled broadcast states are not attempted again by a plain dispatch.
fn settled(status: DispatchStatus) -> bool {
    matches!(
        status,
        DispatchStatus::Sent
            | DispatchStatus::Spooled
            | DispatchStatus::Retracted
            | DispatchStatus::Skipped
    )
}

/// Plain-text post shared by the broadcast and every notification.
pub fn render_message(assignment: &PersistedAssignment) -> OutboundMessage {
    let fields = &assignment.fields;
    let bumped = assignment.last_decision == Some(DecisionKind::Bump);
    let mut lines = Vec::new();

    let subjects = fields.subjects.value.clone().unwrap_or_default().join(", ");
    let levels = fields.levels.value.clone().unwrap_or_default().join(", ");
    let headline = match (levels.is_empty(), subjects.is_empty()) {
        (false, false) => format!("{levels} {subjects}"),
        (true, false) => subjects,
        (false, true) => levels,
        (true, true) => "Tuition assignment".to_string(),
    };
    lines.push(if bumped {
        format!("[BUMP] {headline}")
    } else {
        headline
    });

    if let Some(rate) = &fields.rate.value {
        let unit = match rate.unit {
            RateUnit::Hour => "hr",
            RateUnit::Lesson => "lesson",
            RateUnit::Month => "month",
        };
        if (rate.max - rate.min).abs() < f64::EPSILON {
            lines.push(format!("Rate: ${}/{unit}", rate.min));
        } else {
            lines.push(format!("Rate: ${}-{}/{unit}", rate.min, rate.max));
        }
    }
    if let Some(location) = &fields.location.value {
        let place = if location.online {
            Some("Online".to_string())
        } else {
            location.label.clone().or_else(|| location.region.clone())
        };
        if let Some(place) = place {
            lines.push(format!("Location: {place}"));
        }
    }
    if let Some(schedule) = fields.schedule.value.as_ref().filter(|s| !s.raw.is_empty()) {
        lines.push(format!("Timing: {}", schedule.raw));
    }
    for (label, value) in [
        ("Duration", &fields.lesson_duration.value),
        ("Frequency", &fields.frequency.value),
        ("Tutor", &fields.tutor_preference.value),
        ("Agency", &fields.agency.value),
        ("Remarks", &fields.remarks.value),
    ] {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            lines.push(format!("{label}: {value}"));
        }
    }
    lines.push(format!("Ref: {}", assignment.assignment_id));

    OutboundMessage {
        assignment_id: assignment.assignment_id,
        text: lines.join("\n"),
        bumped,
    }
}
