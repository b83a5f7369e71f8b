//! Content resolver: stage key → rendered message body.
//!
//! Templates live in an immutable snapshot that a background task swaps out on
//! a fixed interval. Rendering clones the current `Arc` and never waits on a fetch.

use chrono::{DateTime, Utc};
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::ContentSource;
use nudge_core::types::StageKey;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;

/// Templates as of one successful fetch.
#[derive(Debug, Clone, Default)]
pub struct ContentSnapshot {
    templates: HashMap<StageKey, String>,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl ContentSnapshot {
    /// Build from raw `key → content` rows. Canonical keys win over legacy ones,
    /// blank content counts as missing, and a literal `\n` becomes a newline.
    pub fn from_rows(rows: &HashMap<String, String>) -> Self {
        let mut templates = HashMap::new();
        for key in StageKey::ALL {
            let content = rows
                .get(key.as_str())
                .filter(|c| !c.trim().is_empty())
                .or_else(|| rows.get(key.legacy_key()).filter(|c| !c.trim().is_empty()));
            if let Some(content) = content {
                templates.insert(key, content.replace("\\n", "\n"));
            }
        }
        Self {
            templates,
            fetched_at: Some(Utc::now()),
        }
    }

    /// Template for a stage, falling back to the built-in default.
    pub fn template(&self, key: StageKey) -> &str {
        self.templates
            .get(&key)
            .map(String::as_str)
            .unwrap_or_else(|| key.default_body())
    }

    pub fn has_template(&self, key: StageKey) -> bool {
        self.templates.contains_key(&key)
    }
}

pub struct ContentResolver {
    source: Arc<dyn ContentSource>,
    snapshot: RwLock<Arc<ContentSnapshot>>,
    mention_token: String,
    fetch_timeout: Duration,
}

impl ContentResolver {
    /// Starts with an empty snapshot (built-in defaults) until the first refresh.
    pub fn new(source: Arc<dyn ContentSource>, mention_token: &str, fetch_timeout: Duration) -> Self {
        Self {
            source,
            snapshot: RwLock::new(Arc::new(ContentSnapshot::default())),
            mention_token: mention_token.to_string(),
            fetch_timeout,
        }
    }

    pub fn snapshot(&self) -> Arc<ContentSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Fetch templates and swap the snapshot. On failure or timeout the
    /// previous snapshot stays.
    pub async fn refresh(&self) -> Result<usize> {
        let fetched = tokio::time::timeout(self.fetch_timeout, self.source.fetch())
            .await
            .unwrap_or_else(|_| {
                Err(NudgeError::timeout("content fetch", self.fetch_timeout.as_secs()))
            });
        let rows = match fetched {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!("⚠️ Content refresh failed, keeping previous templates: {e}");
                return Err(e);
            }
        };
        let next = Arc::new(ContentSnapshot::from_rows(&rows));
        let loaded = next.templates.len();
        match self.snapshot.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        tracing::debug!("📝 Content refreshed ({loaded} of {} templates)", StageKey::ALL.len());
        Ok(loaded)
    }

    /// Render the body for `key`, personalised for `identity`.
    pub fn render(&self, key: StageKey, identity: &str) -> String {
        let snapshot = self.snapshot();
        snapshot
            .template(key)
            .replace(&self.mention_token, &format!("<@{identity}>"))
    }
}

/// Refresh content every `every` until shutdown flips to `true`.
pub fn spawn_refresher(
    resolver: Arc<ContentResolver>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!("📝 Content refresher started (every {}s)", every.as_secs());
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    // Errors are logged inside refresh; the old snapshot keeps serving.
                    let _ = resolver.refresh().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("📝 Content refresher stopped");
    })
}
