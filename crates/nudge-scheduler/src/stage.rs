//! Stage scheduler: decides which message, if any, a recipient is due for,
//! drives one send, and persists the transition.
//!
//! ```text
//! NotContacted ──initial──▶ InitialSent ──reminder_1 (≥24h)──▶ FirstReminderSent ──reminder_2 (≥72h)──▶ SecondReminderSent
//!       │                        │                                   │
//!       └────────────────────────┴──── excluded / completed / failed ┘   (absorbing)
//! ```
//!
//! Both reminder windows are measured from `initial_sent_at`. At most one
//! send is attempted per recipient per pass.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use nudge_core::traits::RecordStore;
use nudge_core::types::{
    CellValue, Column, DeliveryOutcome, RecipientRecord, RecordPatch, Stage, StageKey,
    UpdateOutcome,
};
use std::sync::Arc;
use std::time::Duration;

use crate::content::ContentResolver;
use crate::delivery::DeliveryExecutor;
use crate::eligibility::{Eligibility, EligibilityGate};
use crate::shutdown::Shutdown;

/// Timing and give-up rules.
#[derive(Debug, Clone, Copy)]
pub struct StagePolicy {
    pub first_reminder_after: ChronoDuration,
    pub second_reminder_after: ChronoDuration,
    /// 0 disables giving up.
    pub max_permanent_failures: u32,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            first_reminder_after: ChronoDuration::hours(24),
            second_reminder_after: ChronoDuration::hours(72),
            max_permanent_failures: 5,
        }
    }
}

/// Why nothing is sent this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleReason {
    Terminal,
    /// All three messages have gone out.
    Exhausted,
    NotDue,
    /// Stage says a message went out but its timestamp is absent.
    MissingTimestamp,
}

/// Pure decision for one record at `now`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Idle(IdleReason),
    Send(StageKey),
}

pub fn plan(record: &RecipientRecord, now: DateTime<Utc>, policy: &StagePolicy) -> Plan {
    let since_initial = |window: ChronoDuration| match record.initial_sent_at {
        None => Err(IdleReason::MissingTimestamp),
        Some(at) if now - at >= window => Ok(()),
        Some(_) => Err(IdleReason::NotDue),
    };

    match record.stage {
        s if s.is_terminal() => Plan::Idle(IdleReason::Terminal),
        Stage::NotContacted => Plan::Send(StageKey::Initial),
        Stage::InitialSent => match since_initial(policy.first_reminder_after) {
            Ok(()) => Plan::Send(StageKey::Reminder1),
            Err(reason) => Plan::Idle(reason),
        },
        // The 72h branch is only reachable once the 24h reminder is recorded,
        // so a record due for both gets the 24h one this pass.
        Stage::FirstReminderSent => match since_initial(policy.second_reminder_after) {
            Ok(()) => Plan::Send(StageKey::Reminder2),
            Err(reason) => Plan::Idle(reason),
        },
        _ => Plan::Idle(IdleReason::Exhausted),
    }
}

/// Why a due send was not attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The stored stage moved on since the pass loaded it (e.g. completed).
    StageChanged(Stage),
    /// The record disappeared from the store.
    Vanished,
    /// Could not re-read the record before sending.
    StoreUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Idle(IdleReason),
    Excluded,
    Skipped(SkipReason),
    Sent(StageKey),
    Throttled(StageKey),
    Failed {
        key: StageKey,
        reason: String,
        gave_up: bool,
    },
}

/// Result of one scheduler step. `unpersisted` carries a write that must be
/// retried before this recipient is considered again.
#[derive(Debug, Clone)]
pub struct Step {
    pub outcome: StepOutcome,
    pub unpersisted: Option<RecordPatch>,
}

impl Step {
    fn done(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            unpersisted: None,
        }
    }
}

enum Persisted {
    Applied,
    Mismatch,
    Deferred,
}

pub struct StageScheduler {
    store: Arc<dyn RecordStore>,
    gate: EligibilityGate,
    resolver: Arc<ContentResolver>,
    executor: DeliveryExecutor,
    policy: StagePolicy,
    store_timeout: Duration,
}

impl StageScheduler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        gate: EligibilityGate,
        resolver: Arc<ContentResolver>,
        executor: DeliveryExecutor,
        policy: StagePolicy,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            gate,
            resolver,
            executor,
            policy,
            store_timeout,
        }
    }

    pub fn policy(&self) -> &StagePolicy {
        &self.policy
    }

    pub fn executor(&self) -> &DeliveryExecutor {
        &self.executor
    }

    pub fn resolver(&self) -> &Arc<ContentResolver> {
        &self.resolver
    }

    /// Apply the state machine to one record. `record` is the pass's working
    /// copy and is kept in sync with whatever gets persisted.
    ///
    /// Due-ness is decided before exclusion, on purpose: the oracle is asked
    /// only when a message is about to go out. A recipient who becomes
    /// excluded while nothing is due (or after the last reminder) keeps their
    /// stage instead of moving to `Excluded`. No extra message can result,
    /// but stage counts show them under their last send rather than as
    /// excluded.
    pub async fn step(
        &self,
        record: &mut RecipientRecord,
        now: DateTime<Utc>,
        shutdown: &mut Shutdown,
    ) -> Step {
        let key = match plan(record, now, &self.policy) {
            Plan::Idle(reason) => {
                if reason == IdleReason::MissingTimestamp {
                    tracing::warn!(
                        "⚠️ {} is {} but has no initial_sent_at; skipping",
                        record.identity,
                        record.stage
                    );
                }
                return Step::done(StepOutcome::Idle(reason));
            }
            Plan::Send(key) => key,
        };
        let identity = record.identity.clone();
        let observed = record.stage;

        if self.gate.check(&identity).await == Eligibility::Excluded {
            tracing::info!("🚫 {identity} holds an excluded attribute; no further messages");
            let patch = RecordPatch::guarded(observed).stage(Stage::Excluded);
            return match self.persist(record, &patch).await {
                Persisted::Deferred => Step {
                    outcome: StepOutcome::Excluded,
                    unpersisted: Some(patch),
                },
                Persisted::Mismatch => self.refetched_skip(record).await,
                Persisted::Applied => Step::done(StepOutcome::Excluded),
            };
        }

        // Re-read right before sending so an out-of-band completion or send wins.
        match tokio::time::timeout(self.store_timeout, self.store.get(&identity)).await {
            Ok(Ok(Some(current))) if current.stage == observed => {}
            Ok(Ok(Some(current))) => {
                tracing::info!(
                    "↪️ {identity} moved {observed} → {} since load; not sending '{key}'",
                    current.stage
                );
                let stage = current.stage;
                *record = current;
                return Step::done(StepOutcome::Skipped(SkipReason::StageChanged(stage)));
            }
            Ok(Ok(None)) => return Step::done(StepOutcome::Skipped(SkipReason::Vanished)),
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Could not re-read {identity} before send: {e}");
                return Step::done(StepOutcome::Skipped(SkipReason::StoreUnavailable));
            }
            Err(_) => {
                tracing::warn!("⚠️ Re-reading {identity} timed out; not sending this pass");
                return Step::done(StepOutcome::Skipped(SkipReason::StoreUnavailable));
            }
        }

        let body = self.resolver.render(key, &identity);
        match self.executor.send(&identity, key, &body, shutdown).await {
            DeliveryOutcome::Sent => {
                tracing::info!("📨 Sent '{key}' to {identity}");
                let patch = RecordPatch::guarded(observed)
                    .stage(key.target_stage())
                    .time(key.sent_column(), now)
                    .set(Column::FailureCount, CellValue::Int(0));
                let unpersisted = match self.persist(record, &patch).await {
                    Persisted::Applied => None,
                    Persisted::Mismatch => {
                        // Someone else advanced the record while we were sending;
                        // their state wins and this send stays unrecorded.
                        tracing::warn!(
                            "⚠️ {identity} changed while '{key}' was being sent; keeping stored state"
                        );
                        if let Ok(Ok(Some(current))) =
                            tokio::time::timeout(self.store_timeout, self.store.get(&identity)).await
                        {
                            *record = current;
                        }
                        None
                    }
                    Persisted::Deferred => Some(patch),
                };
                Step {
                    outcome: StepOutcome::Sent(key),
                    unpersisted,
                }
            }
            DeliveryOutcome::Throttled => Step::done(StepOutcome::Throttled(key)),
            DeliveryOutcome::PermanentFailure(reason) => {
                let failures = record.failure_count.saturating_add(1);
                let gave_up = self.policy.max_permanent_failures > 0
                    && failures >= self.policy.max_permanent_failures;
                let mut patch = RecordPatch::guarded(observed)
                    .set(Column::LastError, CellValue::Text(reason.clone()))
                    .set(Column::FailureCount, CellValue::Int(failures as i64));
                if gave_up {
                    tracing::warn!(
                        "🛑 Giving up on {identity} after {failures} permanent failures: {reason}"
                    );
                    patch = patch.stage(Stage::Failed);
                }
                let unpersisted = match self.persist(record, &patch).await {
                    Persisted::Deferred => Some(patch),
                    _ => None,
                };
                Step {
                    outcome: StepOutcome::Failed {
                        key,
                        reason,
                        gave_up,
                    },
                    unpersisted,
                }
            }
        }
    }

    async fn persist(&self, record: &mut RecipientRecord, patch: &RecordPatch) -> Persisted {
        let identity = record.identity.clone();
        match tokio::time::timeout(self.store_timeout, self.store.update(&identity, patch)).await {
            Ok(Ok(UpdateOutcome::Applied)) => {
                record.apply(patch);
                Persisted::Applied
            }
            Ok(Ok(UpdateOutcome::GuardMismatch)) => Persisted::Mismatch,
            Ok(Ok(UpdateOutcome::NotFound)) => {
                tracing::warn!("⚠️ {identity} vanished from the store before its update");
                Persisted::Mismatch
            }
            Ok(Err(e)) => {
                tracing::warn!("⚠️ Failed to persist {identity}, will retry next pass: {e}");
                Persisted::Deferred
            }
            Err(_) => {
                tracing::warn!("⚠️ Persisting {identity} timed out, will retry next pass");
                Persisted::Deferred
            }
        }
    }

    async fn refetched_skip(&self, record: &mut RecipientRecord) -> Step {
        match tokio::time::timeout(self.store_timeout, self.store.get(&record.identity)).await {
            Ok(Ok(Some(current))) => {
                let stage = current.stage;
                *record = current;
                Step::done(StepOutcome::Skipped(SkipReason::StageChanged(stage)))
            }
            Ok(Ok(None)) => Step::done(StepOutcome::Skipped(SkipReason::Vanished)),
            _ => Step::done(StepOutcome::Skipped(SkipReason::StoreUnavailable)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Pacing;
    use crate::test_support::{FakeContent, FakeOracle, FakeTransport, FlakyStore};
    use nudge_core::error::DeliveryError;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn record_at(stage: Stage, initial: Option<DateTime<Utc>>) -> RecipientRecord {
        let mut rec = RecipientRecord::new("42");
        rec.stage = stage;
        rec.initial_sent_at = initial;
        if stage == Stage::FirstReminderSent {
            rec.first_reminder_sent_at = initial.map(|t| t + ChronoDuration::hours(24));
        }
        rec
    }

    #[test]
    fn test_plan_initial_and_terminal() {
        let policy = StagePolicy::default();
        let rec = RecipientRecord::new("1");
        assert_eq!(plan(&rec, t0(), &policy), Plan::Send(StageKey::Initial));
        for stage in [Stage::Completed, Stage::Excluded, Stage::Failed] {
            let rec = record_at(stage, Some(t0()));
            assert_eq!(plan(&rec, t0(), &policy), Plan::Idle(IdleReason::Terminal));
        }
    }

    #[test]
    fn test_plan_first_reminder_window() {
        let policy = StagePolicy::default();
        let rec = record_at(Stage::InitialSent, Some(t0()));
        assert_eq!(
            plan(&rec, t0() + ChronoDuration::hours(23), &policy),
            Plan::Idle(IdleReason::NotDue)
        );
        assert_eq!(
            plan(&rec, t0() + ChronoDuration::hours(24), &policy),
            Plan::Send(StageKey::Reminder1)
        );
        // Also past 72h: still only the first reminder
        assert_eq!(
            plan(&rec, t0() + ChronoDuration::hours(100), &policy),
            Plan::Send(StageKey::Reminder1)
        );
    }

    #[test]
    fn test_plan_second_reminder_measured_from_initial() {
        let policy = StagePolicy::default();
        let rec = record_at(Stage::FirstReminderSent, Some(t0()));
        assert_eq!(
            plan(&rec, t0() + ChronoDuration::hours(71), &policy),
            Plan::Idle(IdleReason::NotDue)
        );
        assert_eq!(
            plan(&rec, t0() + ChronoDuration::hours(72), &policy),
            Plan::Send(StageKey::Reminder2)
        );
        let done = record_at(Stage::SecondReminderSent, Some(t0()));
        assert_eq!(
            plan(&done, t0() + ChronoDuration::hours(500), &policy),
            Plan::Idle(IdleReason::Exhausted)
        );
    }

    #[test]
    fn test_plan_missing_timestamp() {
        let policy = StagePolicy::default();
        let rec = record_at(Stage::InitialSent, None);
        assert_eq!(
            plan(&rec, t0(), &policy),
            Plan::Idle(IdleReason::MissingTimestamp)
        );
    }

    struct Harness {
        store: Arc<FlakyStore>,
        transport: Arc<FakeTransport>,
        oracle: Arc<FakeOracle>,
        scheduler: StageScheduler,
    }

    async fn harness(ids: &[&str], max_failures: u32) -> Harness {
        let store = Arc::new(FlakyStore::with_recipients(ids).await);
        let transport = Arc::new(FakeTransport::default());
        let oracle = Arc::new(FakeOracle::default());
        let content = Arc::new(FakeContent::new(&[("initial", "Hi <@user>")]));
        let resolver = Arc::new(ContentResolver::new(content, "<@user>", Duration::from_secs(5)));
        resolver.refresh().await.unwrap();
        let scheduler = StageScheduler::new(
            store.clone(),
            EligibilityGate::new(oracle.clone(), Duration::from_secs(5)),
            resolver,
            DeliveryExecutor::new(transport.clone(), Duration::from_secs(5), Pacing::none()),
            StagePolicy {
                max_permanent_failures: max_failures,
                ..StagePolicy::default()
            },
            Duration::from_secs(5),
        );
        Harness {
            store,
            transport,
            oracle,
            scheduler,
        }
    }

    #[tokio::test]
    async fn test_initial_send_advances_stage() {
        let h = harness(&["42"], 5).await;
        let mut rec = h.store.record("42").await;
        let step = h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;

        assert_eq!(step.outcome, StepOutcome::Sent(StageKey::Initial));
        assert!(step.unpersisted.is_none());
        assert_eq!(h.transport.sent(), vec![("42".to_string(), "Hi <@42>".to_string())]);

        let stored = h.store.record("42").await;
        assert_eq!(stored.stage, Stage::InitialSent);
        assert_eq!(stored.initial_sent_at, Some(t0()));
        assert_eq!(rec, stored);
    }

    #[tokio::test]
    async fn test_excluded_recipient_is_never_sent() {
        let h = harness(&["42"], 5).await;
        h.oracle.exclude("42");
        let mut rec = h.store.record("42").await;
        let step = h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        assert_eq!(step.outcome, StepOutcome::Excluded);
        assert!(h.transport.sent().is_empty());
        assert_eq!(h.store.record("42").await.stage, Stage::Excluded);

        // Oracle changes its mind; the record stays excluded and is not re-queried
        h.oracle.include("42");
        let calls = h.oracle.calls();
        let step = h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        assert_eq!(step.outcome, StepOutcome::Idle(IdleReason::Terminal));
        assert_eq!(h.oracle.calls(), calls);
        assert!(h.transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_exclusion_is_checked_only_when_a_send_is_due() {
        let h = harness(&["42"], 5).await;
        let mut rec = h.store.record("42").await;
        h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        h.oracle.exclude("42");
        let calls = h.oracle.calls();

        // Reminder not due yet: no oracle call, stage kept
        let later = t0() + ChronoDuration::hours(2);
        let step = h.scheduler.step(&mut rec, later, &mut Shutdown::never()).await;
        assert_eq!(step.outcome, StepOutcome::Idle(IdleReason::NotDue));
        assert_eq!(h.oracle.calls(), calls);
        assert_eq!(h.store.record("42").await.stage, Stage::InitialSent);

        // Once due, the gate runs before anything is sent
        let due = t0() + ChronoDuration::hours(25);
        let step = h.scheduler.step(&mut rec, due, &mut Shutdown::never()).await;
        assert_eq!(step.outcome, StepOutcome::Excluded);
        assert_eq!(h.transport.sent().len(), 1);
        assert_eq!(h.store.record("42").await.stage, Stage::Excluded);
    }

    #[tokio::test]
    async fn test_throttled_leaves_record_untouched() {
        let h = harness(&["42"], 5).await;
        h.transport
            .fail_with("42", DeliveryError::RateLimited { retry_after_secs: 3.0 });
        let mut rec = h.store.record("42").await;
        let step = h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        assert_eq!(step.outcome, StepOutcome::Throttled(StageKey::Initial));
        let stored = h.store.record("42").await;
        assert_eq!(stored.stage, Stage::NotContacted);
        assert!(stored.initial_sent_at.is_none());
        assert!(stored.last_error.is_none());
    }

    #[tokio::test]
    async fn test_permanent_failure_records_error_then_gives_up() {
        let h = harness(&["42"], 2).await;
        h.transport
            .fail_with("42", DeliveryError::Unreachable("Cannot send messages to this user".into()));

        let mut rec = h.store.record("42").await;
        let step = h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        assert!(matches!(step.outcome, StepOutcome::Failed { gave_up: false, .. }));
        let stored = h.store.record("42").await;
        assert_eq!(stored.stage, Stage::NotContacted);
        assert_eq!(stored.failure_count, 1);
        assert!(stored.last_error.unwrap().contains("Cannot send"));

        let step = h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        assert!(matches!(step.outcome, StepOutcome::Failed { gave_up: true, .. }));
        assert_eq!(h.store.record("42").await.stage, Stage::Failed);
    }

    #[tokio::test]
    async fn test_unbounded_retries_when_disabled() {
        let h = harness(&["42"], 0).await;
        h.transport
            .fail_with("42", DeliveryError::Unreachable("blocked".into()));
        let mut rec = h.store.record("42").await;
        for _ in 0..10 {
            h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        }
        let stored = h.store.record("42").await;
        assert_eq!(stored.stage, Stage::NotContacted);
        assert_eq!(stored.failure_count, 10);
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let h = harness(&["42"], 5).await;
        h.transport
            .fail_with("42", DeliveryError::Unreachable("blocked".into()));
        let mut rec = h.store.record("42").await;
        h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        h.transport.clear_failures();
        h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        let stored = h.store.record("42").await;
        assert_eq!(stored.stage, Stage::InitialSent);
        assert_eq!(stored.failure_count, 0);
    }

    #[tokio::test]
    async fn test_completion_before_send_wins() {
        let h = harness(&["42"], 5).await;
        let mut rec = h.store.record("42").await;
        h.store.complete_before_get("42");
        let step = h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        assert_eq!(
            step.outcome,
            StepOutcome::Skipped(SkipReason::StageChanged(Stage::Completed))
        );
        assert!(h.transport.sent().is_empty());
        assert_eq!(rec.stage, Stage::Completed);
    }

    #[tokio::test]
    async fn test_completion_during_send_is_not_overwritten() {
        let h = harness(&["42"], 5).await;
        let mut rec = h.store.record("42").await;
        h.store.complete_before_update("42");
        let step = h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        assert_eq!(step.outcome, StepOutcome::Sent(StageKey::Initial));
        assert!(step.unpersisted.is_none());
        let stored = h.store.record("42").await;
        assert_eq!(stored.stage, Stage::Completed);
        assert!(stored.initial_sent_at.is_none());
        assert_eq!(rec.stage, Stage::Completed);
    }

    #[tokio::test]
    async fn test_failed_write_is_handed_back() {
        let h = harness(&["42"], 5).await;
        let mut rec = h.store.record("42").await;
        h.store.set_fail_updates(true);
        let step = h.scheduler.step(&mut rec, t0(), &mut Shutdown::never()).await;
        assert_eq!(step.outcome, StepOutcome::Sent(StageKey::Initial));
        let patch = step.unpersisted.expect("write should be handed back");
        assert_eq!(patch.expect_stage, Some(Stage::NotContacted));
        assert_eq!(h.store.record("42").await.stage, Stage::NotContacted);
    }

    #[tokio::test]
    async fn test_reminder_timestamps_follow_order() {
        let h = harness(&["42"], 5).await;
        let mut rec = h.store.record("42").await;
        let sched = &h.scheduler;
        sched.step(&mut rec, t0(), &mut Shutdown::never()).await;
        let later = t0() + ChronoDuration::hours(25);
        assert_eq!(
            sched.step(&mut rec, later, &mut Shutdown::never()).await.outcome,
            StepOutcome::Sent(StageKey::Reminder1)
        );
        let last = t0() + ChronoDuration::hours(73);
        assert_eq!(
            sched.step(&mut rec, last, &mut Shutdown::never()).await.outcome,
            StepOutcome::Sent(StageKey::Reminder2)
        );
        let stored = h.store.record("42").await;
        assert_eq!(stored.stage, Stage::SecondReminderSent);
        assert!(stored.initial_sent_at <= stored.first_reminder_sent_at);
        assert!(stored.first_reminder_sent_at <= stored.second_reminder_sent_at);
        assert_eq!(h.transport.sent_to("42"), 3);
    }
}
