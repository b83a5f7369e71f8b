//! # Nudge Channels
//! Discord implementations of the campaign's outside collaborators.

pub mod discord;
pub mod webhook;

pub use discord::{DiscordHttp, DiscordLogChannel, DiscordRoleOracle, DiscordTransport, DmStyle};
pub use webhook::WebhookLog;

use nudge_core::config::DiscordConfig;
use nudge_core::traits::LogChannel;
use std::sync::Arc;

/// Pick the operator log sink: a bot-posted channel if configured, else a webhook.
pub fn log_channel_from_config(config: &DiscordConfig) -> Option<Arc<dyn LogChannel>> {
    if let Some(channel_id) = config.log_channel_id {
        return Some(Arc::new(DiscordLogChannel::new(
            DiscordHttp::from_config(config),
            channel_id,
        )));
    }
    config
        .log_webhook_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .map(|url| Arc::new(WebhookLog::new(url)) as Arc<dyn LogChannel>)
}
