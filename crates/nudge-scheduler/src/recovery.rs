//! Restart recovery.
//!
//! After a long outage every `InitialSent` recipient would be overdue at once
//! and get the 24h reminder in the first pass. Rebasing moves their
//! `initial_sent_at` to now so the reminder clock restarts. It is an
//! operator action and never runs on its own.

use chrono::{DateTime, Utc};
use nudge_core::error::Result;
use nudge_core::traits::RecordStore;
use nudge_core::types::{Column, RecipientRecord, RecordPatch, Stage, UpdateOutcome};
use serde::Serialize;
use std::time::Duration;

use crate::persistence::bounded;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebaseReport {
    pub rebased: usize,
    /// Changed stage between load and write.
    pub raced: usize,
    pub failed: usize,
}

fn needs_rebase(record: &RecipientRecord) -> bool {
    record.stage == Stage::InitialSent
        && record.first_reminder_sent_at.is_none()
        && record.second_reminder_sent_at.is_none()
}

/// Reset the reminder clock of every recipient that got the initial message
/// and nothing since. Other records are not touched. Each store call gets
/// `limit`; a write that runs out of time counts as failed.
pub async fn rebase(
    store: &dyn RecordStore,
    now: DateTime<Utc>,
    limit: Duration,
) -> Result<RebaseReport> {
    let records = bounded(limit, "rebase load", store.load_all()).await?;
    let mut report = RebaseReport::default();

    for record in records.iter().filter(|r| needs_rebase(r)) {
        let patch = RecordPatch::guarded(Stage::InitialSent).time(Column::InitialSentAt, now);
        match bounded(limit, "rebase write", store.update(&record.identity, &patch)).await {
            Ok(UpdateOutcome::Applied) => report.rebased += 1,
            Ok(_) => report.raced += 1,
            Err(e) => {
                tracing::warn!("⚠️ Failed to rebase {}: {e}", record.identity);
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        "🔁 Rebased {} recipients ({} raced, {} failed)",
        report.rebased,
        report.raced,
        report.failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::CampaignDb;
    use crate::test_support::FlakyStore;
    use chrono::Duration;

    #[tokio::test]
    async fn test_rebase_only_touches_initial_sent() {
        let db = CampaignDb::open_in_memory(false).unwrap();
        let ids: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        db.enroll(&ids).await.unwrap();

        let old = Utc::now() - Duration::days(10);
        db.update(
            "a",
            &RecordPatch::new()
                .stage(Stage::InitialSent)
                .time(Column::InitialSentAt, old),
        )
        .await
        .unwrap();
        db.update(
            "b",
            &RecordPatch::new()
                .stage(Stage::FirstReminderSent)
                .time(Column::InitialSentAt, old)
                .time(Column::FirstReminderSentAt, old),
        )
        .await
        .unwrap();
        db.update("c", &RecordPatch::new().stage(Stage::Completed))
            .await
            .unwrap();

        let now = Utc::now();
        let report = rebase(&db, now, std::time::Duration::from_secs(5)).await.unwrap();
        assert_eq!(report.rebased, 1);

        let a = db.get("a").await.unwrap().unwrap();
        assert_eq!(a.stage, Stage::InitialSent);
        assert_eq!(a.initial_sent_at.map(|t| t.timestamp()), Some(now.timestamp()));

        let b = db.get("b").await.unwrap().unwrap();
        assert_eq!(b.initial_sent_at.map(|t| t.timestamp()), Some(old.timestamp()));
        assert_eq!(db.get("d").await.unwrap().unwrap().stage, Stage::NotContacted);
    }

    #[tokio::test]
    async fn test_rebase_gives_up_on_a_stuck_store() {
        let store = FlakyStore::with_recipients(&["a"]).await;
        store.set_hanging(true);
        let limit = std::time::Duration::from_millis(100);
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            rebase(&store, Utc::now(), limit),
        )
        .await
        .expect("rebase must not wait on the store forever");
        assert!(matches!(outcome, Err(nudge_core::NudgeError::Timeout { .. })));
    }
}
