//! Webhook log channel: operator log lines without a bot-visible channel.
//! Supports Discord webhooks and generic HTTP webhooks (POST with JSON body).

use async_trait::async_trait;
use nudge_core::error::{NudgeError, Result};
use nudge_core::traits::LogChannel;

use crate::discord::truncate_content;

/// Where the webhook points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookKind {
    /// Discord webhook URL: posts `{ "content": .. }`.
    Discord,
    /// Generic endpoint: posts `{ "text", "source", "timestamp" }`.
    Json,
}

impl WebhookKind {
    /// Discord webhook URLs are recognised by host and path.
    pub fn detect(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();
        if (lower.contains("discord.com/") || lower.contains("discordapp.com/"))
            && lower.contains("/api/webhooks/")
        {
            WebhookKind::Discord
        } else {
            WebhookKind::Json
        }
    }
}

pub struct WebhookLog {
    client: reqwest::Client,
    url: String,
    kind: WebhookKind,
}

impl WebhookLog {
    pub fn new(url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.to_string(),
            kind: WebhookKind::detect(url),
        }
    }

    pub fn kind(&self) -> &WebhookKind {
        &self.kind
    }

    fn body(&self, line: &str) -> serde_json::Value {
        match self.kind {
            WebhookKind::Discord => serde_json::json!({
                "content": truncate_content(line),
                "allowed_mentions": { "parse": [] },
            }),
            WebhookKind::Json => serde_json::json!({
                "text": line,
                "source": "nudge",
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }),
        }
    }
}

#[async_trait]
impl LogChannel for WebhookLog {
    async fn post(&self, line: &str) -> Result<()> {
        let resp = self
            .client
            .post(&self.url)
            .json(&self.body(line))
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| NudgeError::Channel(format!("Webhook send failed: {e}")))?;

        if resp.status().is_success() {
            tracing::debug!("Webhook log line delivered");
            Ok(())
        } else {
            let status = resp.status();
            Err(NudgeError::Channel(format!("Webhook error {status}")))
        }
    }
}
