//! Campaign data model: recipient records, stages and store patches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Position of a recipient in the initial → 24h → 72h sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotContacted,
    InitialSent,
    FirstReminderSent,
    SecondReminderSent,
    /// Recipient performed the requested action.
    Completed,
    /// Recipient holds a disqualifying attribute.
    Excluded,
    /// Gave up after repeated permanent delivery failures.
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::NotContacted,
        Stage::InitialSent,
        Stage::FirstReminderSent,
        Stage::SecondReminderSent,
        Stage::Completed,
        Stage::Excluded,
        Stage::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::NotContacted => "not_contacted",
            Stage::InitialSent => "initial_sent",
            Stage::FirstReminderSent => "first_reminder_sent",
            Stage::SecondReminderSent => "second_reminder_sent",
            Stage::Completed => "completed",
            Stage::Excluded => "excluded",
            Stage::Failed => "failed",
        }
    }

    /// No scheduled send ever leaves a terminal stage.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Completed | Stage::Excluded | Stage::Failed)
    }

    /// Whether `next` is a legal edge from `self`.
    pub fn can_transition_to(&self, next: Stage) -> bool {
        use Stage::*;
        match (self, next) {
            (Completed | Excluded, _) => false,
            (Failed, Completed) => true,
            (Failed, _) => false,
            (_, Completed | Excluded) => true,
            (NotContacted | InitialSent | FirstReminderSent, Failed) => true,
            (NotContacted, InitialSent) => true,
            (InitialSent, FirstReminderSent) => true,
            (FirstReminderSent, SecondReminderSent) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == normalized)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// A message of the campaign: which body to render and which stage it advances to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKey {
    Initial,
    #[serde(rename = "reminder_1")]
    Reminder1,
    #[serde(rename = "reminder_2")]
    Reminder2,
}

impl StageKey {
    pub const ALL: [StageKey; 3] = [StageKey::Initial, StageKey::Reminder1, StageKey::Reminder2];

    /// Content lookup key.
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKey::Initial => "initial",
            StageKey::Reminder1 => "reminder_1",
            StageKey::Reminder2 => "reminder_2",
        }
    }

    /// Key used by older content tables.
    pub fn legacy_key(&self) -> &'static str {
        match self {
            StageKey::Initial => "initial_dm",
            StageKey::Reminder1 => "followup_24h",
            StageKey::Reminder2 => "followup_72h",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        StageKey::ALL
            .into_iter()
            .find(|k| k.as_str() == key || k.legacy_key() == key)
    }

    /// Stage a record must be in for this message to be due.
    pub fn from_stage(&self) -> Stage {
        match self {
            StageKey::Initial => Stage::NotContacted,
            StageKey::Reminder1 => Stage::InitialSent,
            StageKey::Reminder2 => Stage::FirstReminderSent,
        }
    }

    /// Stage entered once this message is sent.
    pub fn target_stage(&self) -> Stage {
        match self {
            StageKey::Initial => Stage::InitialSent,
            StageKey::Reminder1 => Stage::FirstReminderSent,
            StageKey::Reminder2 => Stage::SecondReminderSent,
        }
    }

    /// Column stamped when this message is sent.
    pub fn sent_column(&self) -> Column {
        match self {
            StageKey::Initial => Column::InitialSentAt,
            StageKey::Reminder1 => Column::FirstReminderSentAt,
            StageKey::Reminder2 => Column::SecondReminderSentAt,
        }
    }

    /// Built-in body used when the content source has no template.
    pub fn default_body(&self) -> &'static str {
        match self {
            StageKey::Initial => "Hey <@user>, tap below to claim your free week.",
            StageKey::Reminder1 => "Just following up, tap below to claim.",
            StageKey::Reminder2 => "**IMPORTANT NOTICE**: last chance to claim.",
        }
    }
}

impl fmt::Display for StageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Durable state for one recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecipientRecord {
    pub identity: String,
    pub stage: Stage,
    pub initial_sent_at: Option<DateTime<Utc>>,
    pub first_reminder_sent_at: Option<DateTime<Utc>>,
    pub second_reminder_sent_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Diagnostic only.
    pub last_error: Option<String>,
    /// Consecutive permanent failures at the current stage.
    #[serde(default)]
    pub failure_count: u32,
}

impl RecipientRecord {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            stage: Stage::NotContacted,
            initial_sent_at: None,
            first_reminder_sent_at: None,
            second_reminder_sent_at: None,
            completed_at: None,
            last_error: None,
            failure_count: 0,
        }
    }

    pub fn sent_at(&self, key: StageKey) -> Option<DateTime<Utc>> {
        match key {
            StageKey::Initial => self.initial_sent_at,
            StageKey::Reminder1 => self.first_reminder_sent_at,
            StageKey::Reminder2 => self.second_reminder_sent_at,
        }
    }

    /// Mirror a patch onto this in-memory copy.
    pub fn apply(&mut self, patch: &RecordPatch) {
        for (column, value) in &patch.cells {
            match column {
                Column::Stage => {
                    if let CellValue::Text(s) = value
                        && let Ok(stage) = s.parse()
                    {
                        self.stage = stage;
                    }
                }
                Column::InitialSentAt => self.initial_sent_at = value.as_time(),
                Column::FirstReminderSentAt => self.first_reminder_sent_at = value.as_time(),
                Column::SecondReminderSentAt => self.second_reminder_sent_at = value.as_time(),
                Column::CompletedAt => self.completed_at = value.as_time(),
                Column::LastError => self.last_error = value.as_text().map(str::to_string),
                Column::FailureCount => {
                    self.failure_count = match value {
                        CellValue::Int(n) => (*n).max(0) as u32,
                        _ => 0,
                    }
                }
            }
        }
    }
}

/// Writable columns of the recipient table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    Stage,
    InitialSentAt,
    FirstReminderSentAt,
    SecondReminderSentAt,
    CompletedAt,
    LastError,
    FailureCount,
}

impl Column {
    pub const ALL: [Column; 7] = [
        Column::Stage,
        Column::InitialSentAt,
        Column::FirstReminderSentAt,
        Column::SecondReminderSentAt,
        Column::CompletedAt,
        Column::LastError,
        Column::FailureCount,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Column::Stage => "stage",
            Column::InitialSentAt => "initial_sent_at",
            Column::FirstReminderSentAt => "first_reminder_sent_at",
            Column::SecondReminderSentAt => "second_reminder_sent_at",
            Column::CompletedAt => "completed_at",
            Column::LastError => "last_error",
            Column::FailureCount => "failure_count",
        }
    }
}

/// A cell value written by a patch.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Text(String),
    Time(DateTime<Utc>),
    Int(i64),
    Null,
}

impl CellValue {
    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            CellValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// A set of cell writes for one recipient, optionally guarded by the
/// stage the writer last observed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    /// Apply only while the stored stage still equals this.
    pub expect_stage: Option<Stage>,
    pub cells: Vec<(Column, CellValue)>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guarded(stage: Stage) -> Self {
        Self {
            expect_stage: Some(stage),
            cells: Vec::new(),
        }
    }

    pub fn set(mut self, column: Column, value: CellValue) -> Self {
        self.cells.retain(|(c, _)| *c != column);
        self.cells.push((column, value));
        self
    }

    pub fn stage(self, stage: Stage) -> Self {
        self.set(Column::Stage, CellValue::Text(stage.as_str().to_string()))
    }

    pub fn time(self, column: Column, at: DateTime<Utc>) -> Self {
        self.set(column, CellValue::Time(at))
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Result of a guarded store write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The stored stage no longer matched the guard; nothing was written.
    GuardMismatch,
    NotFound,
}

/// Classified result of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// Rate limited or transiently unavailable. Do not advance, do not retry this pass.
    Throttled,
    /// Recipient unreachable or the send was malformed.
    PermanentFailure(String),
}

/// Fields captured when a recipient completes the requested action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionSubmission {
    pub identity: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}
