//! Campaign events: a short in-memory history plus forwarding to an
//! operator log channel. Forwarding is best-effort and never blocks a pass
//! for longer than the post timeout.

use nudge_core::traits::LogChannel;
use nudge_core::types::StageKey;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const HISTORY_LIMIT: usize = 100;

/// Event priority.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotifyPriority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    Online,
    Sent { key: StageKey },
    SendFailed { key: StageKey, reason: String },
    GaveUp { reason: String },
    Excluded,
    Completed,
    Rebased { count: usize },
    PassFinished { sent: usize, failed: usize },
    PassAborted { reason: String },
}

/// Something that happened during the campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    pub identity: Option<String>,
    pub priority: NotifyPriority,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl CampaignEvent {
    pub fn new(kind: EventKind, identity: Option<&str>) -> Self {
        let priority = match &kind {
            EventKind::PassAborted { .. } => NotifyPriority::Urgent,
            EventKind::GaveUp { .. } | EventKind::SendFailed { .. } => NotifyPriority::High,
            EventKind::PassFinished { .. } | EventKind::Rebased { .. } => NotifyPriority::Low,
            _ => NotifyPriority::Normal,
        };
        Self {
            kind,
            identity: identity.map(str::to_string),
            priority,
            timestamp: chrono::Utc::now(),
        }
    }

    /// One-line rendering for the operator channel.
    pub fn line(&self) -> String {
        let who = self
            .identity
            .as_deref()
            .map(|id| format!("<@{id}> ({id})"))
            .unwrap_or_default();
        match &self.kind {
            EventKind::Online => "🟢 Campaign service online".to_string(),
            EventKind::Sent { key } => format!("📨 Sent {key} to {who}"),
            EventKind::SendFailed { key, reason } => {
                format!("⚠️ Could not send {key} to {who}: {reason}")
            }
            EventKind::GaveUp { reason } => format!("🛑 Gave up on {who}: {reason}"),
            EventKind::Excluded => format!("🚫 Excluded {who}"),
            EventKind::Completed => format!("✅ {who} completed the form"),
            EventKind::Rebased { count } => {
                format!("🔁 Rebased {count} recipients' reminder clocks")
            }
            EventKind::PassFinished { sent, failed } => {
                format!("📋 Pass finished: {sent} sent, {failed} failed")
            }
            EventKind::PassAborted { reason } => format!("🚨 Pass aborted: {reason}"),
        }
    }
}

/// Event history (ring buffer, max 100) with optional forwarding.
pub struct EventLog {
    history: Mutex<VecDeque<CampaignEvent>>,
    channel: Option<Arc<dyn LogChannel>>,
    post_timeout: Duration,
}

impl EventLog {
    pub fn new(channel: Option<Arc<dyn LogChannel>>) -> Self {
        Self {
            history: Mutex::new(VecDeque::with_capacity(HISTORY_LIMIT)),
            channel,
            post_timeout: Duration::from_secs(5),
        }
    }

    pub async fn emit(&self, event: CampaignEvent) {
        let line = event.line();
        self.record(event);
        let Some(channel) = &self.channel else {
            return;
        };
        match tokio::time::timeout(self.post_timeout, channel.post(&line)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!("Log channel post failed: {e}"),
            Err(_) => tracing::debug!("Log channel post timed out"),
        }
    }

    fn record(&self, event: CampaignEvent) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() == HISTORY_LIMIT {
            history.pop_front();
        }
        history.push_back(event);
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<CampaignEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new(None)
    }
}
