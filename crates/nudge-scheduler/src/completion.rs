//! Completion trigger: records a form submission and stops the campaign for
//! that recipient.

use chrono::{DateTime, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::RecordStore;
use nudge_core::types::{Column, CompletionSubmission, RecordPatch, Stage, UpdateOutcome};
use serde::Serialize;
use std::time::Duration;

use crate::persistence::bounded;

/// Guard retries when a pass advances the record between read and write.
const MAX_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CompletionResult {
    Completed { previous: Stage },
    AlreadyCompleted,
    /// Excluded is absorbing; the submission is still recorded.
    Excluded,
}

/// Look the recipient up, append the submission to the audit table, then move
/// the recipient to `Completed`. Allowed from every non-absorbing stage
/// including `Failed`. Unknown identities are rejected before anything is
/// written. Each store call gets `limit`.
pub async fn complete(
    store: &dyn RecordStore,
    submission: &CompletionSubmission,
    now: DateTime<Utc>,
    limit: Duration,
) -> Result<CompletionResult> {
    let identity = submission.identity.trim();
    if identity.is_empty() {
        return Err(NudgeError::Other("completion without identity".into()));
    }
    let lookup = move || async move {
        bounded(limit, "completion lookup", store.get(identity))
            .await?
            .ok_or_else(|| NudgeError::RecipientNotFound(identity.to_string()))
    };

    let mut record = lookup().await?;
    bounded(limit, "response append", store.append_response(submission)).await?;

    for attempt in 0..MAX_ATTEMPTS {
        if attempt > 0 {
            record = lookup().await?;
        }

        match record.stage {
            Stage::Completed => return Ok(CompletionResult::AlreadyCompleted),
            Stage::Excluded => {
                tracing::info!("📝 Response from excluded {identity} recorded; stage unchanged");
                return Ok(CompletionResult::Excluded);
            }
            _ => {}
        }

        let patch = RecordPatch::guarded(record.stage)
            .stage(Stage::Completed)
            .time(Column::CompletedAt, now);
        match bounded(limit, "completion write", store.update(identity, &patch)).await? {
            UpdateOutcome::Applied => {
                tracing::info!("✅ {identity} completed (was {})", record.stage);
                return Ok(CompletionResult::Completed {
                    previous: record.stage,
                });
            }
            UpdateOutcome::GuardMismatch => continue,
            UpdateOutcome::NotFound => {
                return Err(NudgeError::RecipientNotFound(identity.to_string()));
            }
        }
    }

    Err(NudgeError::Store(format!(
        "{identity} kept changing stage while being completed"
    )))
}
