//! Reconciler: the periodic pass over every recipient.
//! Uses tokio::interval for ticking and a pass lock so an operator-triggered
//! pass never overlaps the periodic one.

use chrono::{DateTime, Utc};
use nudge_core::config::{MAX_REMINDER_HOURS, NudgeConfig};
use nudge_core::error::Result;
use nudge_core::traits::{ContentSource, EligibilityOracle, LogChannel, RecordStore, Transport};
use nudge_core::types::{
    CompletionSubmission, DeliveryOutcome, RecordPatch, Stage, StageKey, UpdateOutcome,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::Instrument;

use crate::completion::{self, CompletionResult};
use crate::content::ContentResolver;
use crate::delivery::{DeliveryExecutor, Pacing};
use crate::eligibility::EligibilityGate;
use crate::notify::{CampaignEvent, EventKind, EventLog};
use crate::recovery::{self, RebaseReport};
use crate::shutdown::Shutdown;
use crate::stage::{StagePolicy, StageScheduler, StepOutcome};

/// Source of "now" for a pass.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Gap between the three bodies of a test send.
const TEST_SEND_GAP: Duration = Duration::from_secs(1);

/// Hours to a reminder window, clamped so out-of-range values cannot overflow.
fn reminder_window(hours: i64) -> chrono::Duration {
    chrono::Duration::hours(hours.clamp(0, MAX_REMINDER_HOURS))
}

/// Which records a pass considers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassScope {
    #[default]
    All,
    /// Only recipients that have not been contacted yet (campaign launch).
    InitialOnly,
}

/// What one pass did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: String,
    pub scope: PassScope,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub loaded: usize,
    pub sent: usize,
    pub throttled: usize,
    pub failed: usize,
    pub gave_up: usize,
    pub excluded: usize,
    pub skipped: usize,
    /// Writes from earlier passes that were persisted at the start of this one.
    pub flushed: usize,
    /// Recipients held back because an earlier write is still unpersisted.
    pub deferred: usize,
    pub aborted: Option<String>,
    /// Stopped early because shutdown was requested.
    pub interrupted: bool,
}

impl PassReport {
    fn is_quiet(&self) -> bool {
        self.sent == 0 && self.failed == 0 && self.excluded == 0
    }
}

/// Snapshot for status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CampaignStatus {
    pub total: usize,
    pub stages: BTreeMap<Stage, usize>,
    pub pending_writes: usize,
    pub transport: String,
    pub templates_fetched_at: Option<DateTime<Utc>>,
    /// Stage keys currently served from built-in default bodies.
    pub default_templates: Vec<StageKey>,
    pub last_pass: Option<PassReport>,
}

/// The outside world a campaign runs against.
pub struct Collaborators {
    pub store: Arc<dyn RecordStore>,
    pub content: Arc<dyn ContentSource>,
    pub transport: Arc<dyn Transport>,
    pub oracle: Arc<dyn EligibilityOracle>,
    pub log: Option<Arc<dyn LogChannel>>,
}

struct PendingWrite {
    identity: String,
    patch: RecordPatch,
}

pub struct Reconciler {
    store: Arc<dyn RecordStore>,
    scheduler: StageScheduler,
    events: Arc<EventLog>,
    /// Held for the length of a pass; owns the writes still to be persisted.
    outbox: Mutex<Vec<PendingWrite>>,
    pending: std::sync::atomic::AtomicUsize,
    last_report: std::sync::Mutex<Option<PassReport>>,
    store_timeout: Duration,
    clock: Clock,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        scheduler: StageScheduler,
        events: Arc<EventLog>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            scheduler,
            events,
            outbox: Mutex::new(Vec::new()),
            pending: std::sync::atomic::AtomicUsize::new(0),
            last_report: std::sync::Mutex::new(None),
            store_timeout,
            clock: Arc::new(Utc::now),
        }
    }

    /// Wire the scheduler stack from configuration.
    pub fn from_config(config: &NudgeConfig, parts: Collaborators) -> Self {
        let campaign = &config.campaign;
        let resolver = Arc::new(ContentResolver::new(
            parts.content,
            &campaign.mention_token,
            config.timeouts.store(),
        ));
        let pacing = Pacing {
            initial: Duration::from_secs(campaign.initial_pacing_secs),
            reminder: Duration::from_secs(campaign.reminder_pacing_secs),
        };
        let policy = StagePolicy {
            first_reminder_after: reminder_window(campaign.first_reminder_after_hours),
            second_reminder_after: reminder_window(campaign.second_reminder_after_hours),
            max_permanent_failures: campaign.max_permanent_failures,
        };
        let scheduler = StageScheduler::new(
            parts.store.clone(),
            EligibilityGate::new(parts.oracle, config.timeouts.eligibility()),
            resolver,
            DeliveryExecutor::new(parts.transport, config.timeouts.transport(), pacing),
            policy,
            config.timeouts.store(),
        );
        Self::new(
            parts.store,
            scheduler,
            Arc::new(EventLog::new(parts.log)),
            config.timeouts.store(),
        )
    }

    pub fn with_clock<F>(mut self, clock: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn resolver(&self) -> &Arc<ContentResolver> {
        self.scheduler.resolver()
    }

    pub fn last_report(&self) -> Option<PassReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn pending_writes(&self) -> usize {
        self.pending.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Run one full pass. Never returns an error: failures are in the report.
    pub async fn run_pass(&self, scope: PassScope, shutdown: &mut Shutdown) -> PassReport {
        let mut outbox = self.outbox.lock().await;
        let pass_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("pass", pass_id = %&pass_id[..8]);

        let report = self
            .pass(&mut outbox, pass_id, scope, shutdown)
            .instrument(span)
            .await;

        self.pending
            .store(outbox.len(), std::sync::atomic::Ordering::SeqCst);
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    async fn pass(
        &self,
        outbox: &mut Vec<PendingWrite>,
        pass_id: String,
        scope: PassScope,
        shutdown: &mut Shutdown,
    ) -> PassReport {
        let mut report = PassReport {
            pass_id,
            scope,
            started_at: Some((self.clock)()),
            ..Default::default()
        };

        // Errors are logged inside refresh; the previous snapshot keeps serving.
        let _ = self.scheduler.resolver().refresh().await;

        report.flushed = self.flush(outbox).await;
        let blocked: HashSet<String> = outbox.iter().map(|w| w.identity.clone()).collect();

        let records = match tokio::time::timeout(self.store_timeout, self.store.load_all()).await {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => return self.abort(report, e.to_string()).await,
            Err(_) => {
                let reason = format!("load timed out after {}s", self.store_timeout.as_secs());
                return self.abort(report, reason).await;
            }
        };
        report.loaded = records.len();
        tracing::debug!("Loaded {} recipients", records.len());

        for mut record in records {
            if shutdown.is_triggered() {
                tracing::info!("🛑 Shutdown requested, ending pass early");
                report.interrupted = true;
                break;
            }
            if scope == PassScope::InitialOnly && record.stage != Stage::NotContacted {
                continue;
            }
            if blocked.contains(&record.identity) {
                report.deferred += 1;
                continue;
            }

            let identity = record.identity.clone();
            let step = self
                .scheduler
                .step(&mut record, (self.clock)(), shutdown)
                .await;
            if let Some(patch) = step.unpersisted {
                outbox.push(PendingWrite {
                    identity: identity.clone(),
                    patch,
                });
            }

            let event = match step.outcome {
                StepOutcome::Idle(_) => None,
                StepOutcome::Skipped(_) => {
                    report.skipped += 1;
                    None
                }
                StepOutcome::Throttled(_) => {
                    report.throttled += 1;
                    None
                }
                StepOutcome::Excluded => {
                    report.excluded += 1;
                    Some(EventKind::Excluded)
                }
                StepOutcome::Sent(key) => {
                    report.sent += 1;
                    Some(EventKind::Sent { key })
                }
                StepOutcome::Failed {
                    reason,
                    gave_up: true,
                    ..
                } => {
                    report.failed += 1;
                    report.gave_up += 1;
                    Some(EventKind::GaveUp { reason })
                }
                StepOutcome::Failed { key, reason, .. } => {
                    report.failed += 1;
                    Some(EventKind::SendFailed { key, reason })
                }
            };
            if let Some(kind) = event {
                self.events
                    .emit(CampaignEvent::new(kind, Some(&identity)))
                    .await;
            }
        }

        report.finished_at = Some((self.clock)());
        if report.is_quiet() {
            tracing::debug!("Pass finished with nothing to do");
        } else {
            tracing::info!(
                "📋 Pass finished: {} sent, {} throttled, {} failed, {} excluded",
                report.sent,
                report.throttled,
                report.failed,
                report.excluded
            );
            self.events
                .emit(CampaignEvent::new(
                    EventKind::PassFinished {
                        sent: report.sent,
                        failed: report.failed,
                    },
                    None,
                ))
                .await;
        }
        report
    }

    async fn abort(&self, mut report: PassReport, reason: String) -> PassReport {
        tracing::error!("❌ Could not load recipients, skipping pass: {reason}");
        self.events
            .emit(CampaignEvent::new(
                EventKind::PassAborted {
                    reason: reason.clone(),
                },
                None,
            ))
            .await;
        report.aborted = Some(reason);
        report.finished_at = Some((self.clock)());
        report
    }

    /// Retry writes left over from earlier passes. Returns how many landed.
    async fn flush(&self, outbox: &mut Vec<PendingWrite>) -> usize {
        if outbox.is_empty() {
            return 0;
        }
        let mut flushed = 0;
        let mut still_pending = Vec::new();
        for write in outbox.drain(..) {
            let attempt = self.store.update(&write.identity, &write.patch);
            match tokio::time::timeout(self.store_timeout, attempt).await {
                Ok(Ok(UpdateOutcome::Applied)) => {
                    tracing::info!("💾 Persisted deferred write for {}", write.identity);
                    flushed += 1;
                }
                Ok(Ok(outcome)) => {
                    tracing::warn!(
                        "⚠️ Dropping deferred write for {}: {outcome:?}",
                        write.identity
                    );
                }
                Ok(Err(_)) | Err(_) => still_pending.push(write),
            }
        }
        if !still_pending.is_empty() {
            tracing::warn!("⚠️ {} writes still unpersisted", still_pending.len());
        }
        *outbox = still_pending;
        flushed
    }

    /// Reset reminder clocks after downtime. Waits for any running pass.
    pub async fn rebase(&self) -> Result<RebaseReport> {
        let _pass = self.outbox.lock().await;
        let report = recovery::rebase(self.store.as_ref(), (self.clock)(), self.store_timeout).await?;
        self.events
            .emit(CampaignEvent::new(
                EventKind::Rebased {
                    count: report.rebased,
                },
                None,
            ))
            .await;
        Ok(report)
    }

    /// Record a completion. Does not wait for a running pass; guarded writes
    /// settle the race.
    pub async fn complete(&self, submission: &CompletionSubmission) -> Result<CompletionResult> {
        let result = completion::complete(
            self.store.as_ref(),
            submission,
            (self.clock)(),
            self.store_timeout,
        )
        .await?;
        if matches!(result, CompletionResult::Completed { .. }) {
            self.events
                .emit(CampaignEvent::new(
                    EventKind::Completed,
                    Some(submission.identity.trim()),
                ))
                .await;
        }
        Ok(result)
    }

    /// Send all three bodies to `identity` without touching its record.
    pub async fn test_send(&self, identity: &str) -> Vec<(StageKey, DeliveryOutcome)> {
        let _pass = self.outbox.lock().await;
        let mut results = Vec::new();
        for (i, key) in StageKey::ALL.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(TEST_SEND_GAP).await;
            }
            let body = self.scheduler.resolver().render(key, identity);
            let outcome = self.scheduler.executor().attempt(identity, key, &body).await;
            tracing::info!("🧪 Test send of '{key}' to {identity}: {outcome:?}");
            results.push((key, outcome));
        }
        results
    }

    pub async fn status(&self) -> Result<CampaignStatus> {
        let stages = tokio::time::timeout(self.store_timeout, self.store.stage_counts())
            .await
            .map_err(|_| {
                nudge_core::NudgeError::timeout("stage counts", self.store_timeout.as_secs())
            })??;
        let snapshot = self.scheduler.resolver().snapshot();
        Ok(CampaignStatus {
            total: stages.values().sum(),
            stages,
            pending_writes: self.pending_writes(),
            transport: self.scheduler.executor().transport_name().to_string(),
            templates_fetched_at: snapshot.fetched_at,
            default_templates: StageKey::ALL
                .into_iter()
                .filter(|k| !snapshot.has_template(*k))
                .collect(),
            last_pass: self.last_report(),
        })
    }
}

/// Spawn the periodic pass loop. The first pass runs immediately.
pub fn spawn_loop(
    reconciler: Arc<Reconciler>,
    every: Duration,
    mut shutdown: Shutdown,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("⏰ Reconciler started (pass every {}s)", every.as_secs());
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.wait() => break,
            }
            let mut pass_shutdown = shutdown.clone();
            reconciler.run_pass(PassScope::All, &mut pass_shutdown).await;
            if shutdown.is_triggered() {
                break;
            }
        }
        tracing::info!("⏰ Reconciler stopped");
    })
}
