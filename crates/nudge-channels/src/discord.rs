//! Discord REST channel: direct messages, guild role lookup and a log channel.
//!
//! Only the plain HTTP API is used; no gateway connection is opened. Every
//! request carries `Authorization: Bot <token>`.

use async_trait::async_trait;
use nudge_core::config::DiscordConfig;
use nudge_core::error::{DeliveryError, NudgeError, Result};
use nudge_core::traits::{EligibilityOracle, LogChannel, Transport};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;

/// Discord refuses message content longer than this.
const MAX_CONTENT_CHARS: usize = 2000;
/// "Cannot send messages to this user" (DMs closed or no shared guild).
const CODE_CANNOT_DM: u64 = 50007;
/// "Unknown Member"
const CODE_UNKNOWN_MEMBER: u64 = 10007;

/// Thin authenticated client shared by the Discord components.
#[derive(Clone)]
pub struct DiscordHttp {
    client: reqwest::Client,
    api_base: String,
    token: String,
}

impl DiscordHttp {
    pub fn new(api_base: &str, token: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    pub fn from_config(config: &DiscordConfig) -> Self {
        Self::new(&config.api_base, &config.bot_token)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("Authorization", format!("Bot {}", self.token))
            .header(
                "User-Agent",
                concat!("DiscordBot (nudge, ", env!("CARGO_PKG_VERSION"), ")"),
            )
    }
}

/// Error body Discord returns on non-2xx responses.
#[derive(Debug, Default, Deserialize)]
pub struct ApiError {
    #[serde(default)]
    pub code: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub retry_after: Option<f64>,
}

/// Map a failed response to a delivery error.
pub fn classify_response(status: u16, body: &str) -> DeliveryError {
    let api: ApiError = serde_json::from_str(body).unwrap_or_default();
    let message = api
        .message
        .clone()
        .unwrap_or_else(|| format!("HTTP {status}"));
    match status {
        429 => DeliveryError::RateLimited {
            retry_after_secs: api.retry_after.unwrap_or(1.0),
        },
        // A bad bot token is our problem, not the recipient's.
        401 => DeliveryError::Unavailable(format!("401: {message}")),
        _ if api.code == Some(CODE_CANNOT_DM) => DeliveryError::Unreachable(message),
        403 | 404 => DeliveryError::Unreachable(message),
        400..=499 => DeliveryError::Rejected(format!("{status}: {message}")),
        _ => DeliveryError::Unavailable(format!("{status}: {message}")),
    }
}

fn parse_snowflake(identity: &str) -> Option<u64> {
    identity.trim().parse::<u64>().ok().filter(|id| *id != 0)
}

/// How a campaign DM looks: the body as an embed plus one button.
#[derive(Debug, Clone)]
pub struct DmStyle {
    pub embed_color: u32,
    pub banner_url: Option<String>,
    pub button_label: String,
    pub button_custom_id: String,
}

impl DmStyle {
    pub fn from_config(config: &DiscordConfig) -> Self {
        Self {
            embed_color: config.embed_color,
            banner_url: config.banner_url.clone().filter(|u| !u.trim().is_empty()),
            button_label: config.button_label.clone(),
            button_custom_id: config.button_custom_id.clone(),
        }
    }

    /// Message payload for `POST /channels/{id}/messages`.
    pub fn payload(&self, body: &str) -> serde_json::Value {
        let mut embed = serde_json::json!({
            "description": body,
            "color": self.embed_color,
        });
        if let Some(url) = &self.banner_url {
            embed["image"] = serde_json::json!({ "url": url });
        }
        serde_json::json!({
            "embeds": [embed],
            "components": [{
                "type": 1,
                "components": [{
                    "type": 2,
                    "style": 1,
                    "label": self.button_label,
                    "custom_id": self.button_custom_id,
                }]
            }]
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChannelRef {
    id: String,
}

/// Sends campaign messages as Discord DMs.
pub struct DiscordTransport {
    http: DiscordHttp,
    style: DmStyle,
    /// user id → DM channel id
    dm_channels: Mutex<HashMap<u64, String>>,
}

impl DiscordTransport {
    pub fn new(http: DiscordHttp, style: DmStyle) -> Self {
        Self {
            http,
            style,
            dm_channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &DiscordConfig) -> Self {
        Self::new(DiscordHttp::from_config(config), DmStyle::from_config(config))
    }

    fn cached_channel(&self, user_id: u64) -> Option<String> {
        self.dm_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&user_id)
            .cloned()
    }

    fn forget_channel(&self, user_id: u64) {
        self.dm_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&user_id);
    }

    async fn open_dm(&self, user_id: u64) -> std::result::Result<String, DeliveryError> {
        if let Some(id) = self.cached_channel(user_id) {
            return Ok(id);
        }
        let response = self
            .http
            .request(reqwest::Method::POST, "/users/@me/channels")
            .json(&serde_json::json!({ "recipient_id": user_id.to_string() }))
            .send()
            .await
            .map_err(|e| DeliveryError::Unavailable(format!("open DM failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status.as_u16(), &body));
        }
        let channel: ChannelRef = response
            .json()
            .await
            .map_err(|e| DeliveryError::Unavailable(format!("invalid DM channel response: {e}")))?;
        self.dm_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id, channel.id.clone());
        Ok(channel.id)
    }
}

#[async_trait]
impl Transport for DiscordTransport {
    fn name(&self) -> &str {
        "discord"
    }

    async fn send(&self, identity: &str, body: &str) -> std::result::Result<(), DeliveryError> {
        let user_id = parse_snowflake(identity)
            .ok_or_else(|| DeliveryError::Rejected(format!("'{identity}' is not a Discord user id")))?;
        let channel_id = self.open_dm(user_id).await?;

        let response = self
            .http
            .request(reqwest::Method::POST, &format!("/channels/{channel_id}/messages"))
            .json(&self.style.payload(body))
            .send()
            .await
            .map_err(|e| DeliveryError::Unavailable(format!("send DM failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        self.forget_channel(user_id);
        let body = response.text().await.unwrap_or_default();
        Err(classify_response(status.as_u16(), &body))
    }
}

#[derive(Debug, Deserialize)]
struct GuildMember {
    #[serde(default)]
    roles: Vec<String>,
}

pub fn has_excluded_role(roles: &[String], excluded: &[u64]) -> bool {
    roles
        .iter()
        .filter_map(|r| r.parse::<u64>().ok())
        .any(|r| excluded.contains(&r))
}

/// Excludes members of one guild holding any of the configured roles.
pub struct DiscordRoleOracle {
    http: DiscordHttp,
    guild_id: Option<u64>,
    excluded_role_ids: Vec<u64>,
}

impl DiscordRoleOracle {
    pub fn new(http: DiscordHttp, guild_id: Option<u64>, excluded_role_ids: Vec<u64>) -> Self {
        Self {
            http,
            guild_id,
            excluded_role_ids,
        }
    }

    pub fn from_config(config: &DiscordConfig) -> Self {
        Self::new(
            DiscordHttp::from_config(config),
            config.guild_id,
            config.excluded_role_ids.clone(),
        )
    }
}

#[async_trait]
impl EligibilityOracle for DiscordRoleOracle {
    async fn is_excluded(&self, identity: &str) -> Result<bool> {
        let Some(guild_id) = self.guild_id else {
            return Ok(false);
        };
        if self.excluded_role_ids.is_empty() {
            return Ok(false);
        }
        let Some(user_id) = parse_snowflake(identity) else {
            return Ok(false);
        };

        let response = self
            .http
            .request(
                reqwest::Method::GET,
                &format!("/guilds/{guild_id}/members/{user_id}"),
            )
            .send()
            .await
            .map_err(|e| NudgeError::Eligibility(format!("member lookup failed: {e}")))?;

        let status = response.status();
        if status.as_u16() == 404 {
            // Not (or no longer) in the guild: nothing to exclude on.
            let body = response.text().await.unwrap_or_default();
            let api: ApiError = serde_json::from_str(&body).unwrap_or_default();
            if api.code != Some(CODE_UNKNOWN_MEMBER) {
                tracing::debug!("Member lookup 404 for {user_id}: {:?}", api.message);
            }
            return Ok(false);
        }
        if !status.is_success() {
            return Err(NudgeError::Eligibility(format!(
                "member lookup returned {status}"
            )));
        }
        let member: GuildMember = response
            .json()
            .await
            .map_err(|e| NudgeError::Eligibility(format!("invalid member response: {e}")))?;
        Ok(has_excluded_role(&member.roles, &self.excluded_role_ids))
    }
}

/// Truncate to Discord's content limit on a char boundary.
pub fn truncate_content(line: &str) -> String {
    if line.chars().count() <= MAX_CONTENT_CHARS {
        return line.to_string();
    }
    let mut out: String = line.chars().take(MAX_CONTENT_CHARS - 1).collect();
    out.push('…');
    out
}

/// Posts operator log lines into a guild text channel.
pub struct DiscordLogChannel {
    http: DiscordHttp,
    channel_id: u64,
}

impl DiscordLogChannel {
    pub fn new(http: DiscordHttp, channel_id: u64) -> Self {
        Self { http, channel_id }
    }
}

#[async_trait]
impl LogChannel for DiscordLogChannel {
    async fn post(&self, line: &str) -> Result<()> {
        let response = self
            .http
            .request(
                reqwest::Method::POST,
                &format!("/channels/{}/messages", self.channel_id),
            )
            .json(&serde_json::json!({
                "content": truncate_content(line),
                "allowed_mentions": { "parse": [] },
            }))
            .send()
            .await
            .map_err(|e| NudgeError::Channel(format!("log post failed: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(NudgeError::Channel(format!("Discord log error {status}: {body}")))
        }
    }
}
