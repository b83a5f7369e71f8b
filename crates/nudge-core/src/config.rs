//! Nudge configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{NudgeError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NudgeConfig {
    #[serde(default)]
    pub discord: DiscordConfig,
    #[serde(default)]
    pub campaign: CampaignConfig,
    #[serde(default)]
    pub content: ContentConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl NudgeConfig {
    /// Load config from the default path (~/.nudge/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NudgeError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| NudgeError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.campaign.validate()
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| NudgeError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Secrets and deployment-specific ids may come from the environment.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("DISCORD_TOKEN")
            && !token.is_empty()
        {
            self.discord.bot_token = token;
        }
        if let Some(id) = std::env::var("LOG_CHANNEL_ID")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|id| *id != 0)
        {
            self.discord.log_channel_id = Some(id);
        }
        if let Ok(token) = std::env::var("NUDGE_ADMIN_TOKEN")
            && !token.is_empty()
        {
            self.gateway.admin_token = Some(token);
        }
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Nudge home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".nudge")
    }
}

/// Discord credentials, exclusion rule and message look.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscordConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Guild whose roles decide exclusion. `None` disables the exclusion rule.
    #[serde(default)]
    pub guild_id: Option<u64>,
    #[serde(default)]
    pub excluded_role_ids: Vec<u64>,
    #[serde(default)]
    pub log_channel_id: Option<u64>,
    /// Webhook used for operator logs when no log channel id is set.
    #[serde(default)]
    pub log_webhook_url: Option<String>,
    #[serde(default = "default_embed_color")]
    pub embed_color: u32,
    #[serde(default)]
    pub banner_url: Option<String>,
    #[serde(default = "default_button_label")]
    pub button_label: String,
    #[serde(default = "default_button_custom_id")]
    pub button_custom_id: String,
}

fn default_api_base() -> String { "https://discord.com/api/v10".into() }
fn default_embed_color() -> u32 { 0x963BF3 }
fn default_button_label() -> String { "Claim Your Free Week".into() }
fn default_button_custom_id() -> String { "claim_free_week_btn".into() }

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            api_base: default_api_base(),
            guild_id: None,
            excluded_role_ids: Vec::new(),
            log_channel_id: None,
            log_webhook_url: None,
            embed_color: default_embed_color(),
            banner_url: None,
            button_label: default_button_label(),
            button_custom_id: default_button_custom_id(),
        }
    }
}

/// Campaign timing and pacing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignConfig {
    #[serde(default = "default_pass_interval")]
    pub pass_interval_secs: u64,
    /// Pause after each successful initial send.
    #[serde(default = "default_initial_pacing")]
    pub initial_pacing_secs: u64,
    /// Pause after each successful reminder send.
    #[serde(default = "default_reminder_pacing")]
    pub reminder_pacing_secs: u64,
    #[serde(default = "default_first_reminder_hours")]
    pub first_reminder_after_hours: i64,
    /// Measured from the initial send, not from the first reminder.
    #[serde(default = "default_second_reminder_hours")]
    pub second_reminder_after_hours: i64,
    #[serde(default = "default_mention_token")]
    pub mention_token: String,
    /// Consecutive permanent failures before a recipient is marked failed. 0 = never.
    #[serde(default = "default_max_permanent_failures")]
    pub max_permanent_failures: u32,
}

/// Upper bound for either reminder window (ten years).
pub const MAX_REMINDER_HOURS: i64 = 24 * 365 * 10;

impl CampaignConfig {
    pub fn validate(&self) -> Result<()> {
        let (first, second) = (self.first_reminder_after_hours, self.second_reminder_after_hours);
        for (name, hours) in [
            ("first_reminder_after_hours", first),
            ("second_reminder_after_hours", second),
        ] {
            if !(0..=MAX_REMINDER_HOURS).contains(&hours) {
                return Err(NudgeError::Config(format!(
                    "campaign.{name} must be between 0 and {MAX_REMINDER_HOURS}, got {hours}"
                )));
            }
        }
        if second <= first {
            return Err(NudgeError::Config(format!(
                "campaign.second_reminder_after_hours ({second}) must be greater than \
                 first_reminder_after_hours ({first})"
            )));
        }
        Ok(())
    }
}

fn default_pass_interval() -> u64 { 60 }
fn default_initial_pacing() -> u64 { 15 }
fn default_reminder_pacing() -> u64 { 5 }
fn default_first_reminder_hours() -> i64 { 24 }
fn default_second_reminder_hours() -> i64 { 72 }
fn default_mention_token() -> String { "<@user>".into() }
fn default_max_permanent_failures() -> u32 { 5 }

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            pass_interval_secs: default_pass_interval(),
            initial_pacing_secs: default_initial_pacing(),
            reminder_pacing_secs: default_reminder_pacing(),
            first_reminder_after_hours: default_first_reminder_hours(),
            second_reminder_after_hours: default_second_reminder_hours(),
            mention_token: default_mention_token(),
            max_permanent_failures: default_max_permanent_failures(),
        }
    }
}

/// Content refresh cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentConfig {
    #[serde(default = "default_content_refresh")]
    pub refresh_secs: u64,
}

fn default_content_refresh() -> u64 { 600 }

impl Default for ContentConfig {
    fn default() -> Self {
        Self { refresh_secs: default_content_refresh() }
    }
}

/// Record store location and schema policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// Reject writes to columns missing from the table instead of skipping them.
    #[serde(default)]
    pub strict_schema: bool,
}

fn default_db_path() -> String { "~/.nudge/nudge.db".into() }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            strict_schema: false,
        }
    }
}

impl StoreConfig {
    /// Database path with `~` expanded.
    pub fn resolved_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.db_path).to_string())
    }
}

/// Upper bounds for every external call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_store_timeout")]
    pub store_secs: u64,
    #[serde(default = "default_transport_timeout")]
    pub transport_secs: u64,
    #[serde(default = "default_eligibility_timeout")]
    pub eligibility_secs: u64,
}

fn default_store_timeout() -> u64 { 10 }
fn default_transport_timeout() -> u64 { 15 }
fn default_eligibility_timeout() -> u64 { 5 }

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            store_secs: default_store_timeout(),
            transport_secs: default_transport_timeout(),
            eligibility_secs: default_eligibility_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn store(&self) -> Duration { Duration::from_secs(self.store_secs) }
    pub fn transport(&self) -> Duration { Duration::from_secs(self.transport_secs) }
    pub fn eligibility(&self) -> Duration { Duration::from_secs(self.eligibility_secs) }
}

/// Admin HTTP gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Required in `X-Admin-Token` when set.
    #[serde(default)]
    pub admin_token: Option<String>,
}

fn bool_true() -> bool { true }
fn default_host() -> String { "127.0.0.1".into() }
fn default_port() -> u16 { 3000 }

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_port(),
            admin_token: None,
        }
    }
}
