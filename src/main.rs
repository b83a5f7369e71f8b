//! # Nudge: drip DM campaign runner
//!
//! Sends each enrolled recipient an initial Discord DM, a reminder after 24h
//! and a last one after 72h, stopping as soon as they complete the form.
//!
//! Usage:
//!   nudge run                         # Periodic passes + admin gateway
//!   nudge run --rebase-on-start       # Restart reminder clocks first
//!   nudge enroll 1234 5678            # Add recipients
//!   nudge pass --initial-only         # One launch pass and exit
//!   nudge status                      # Per-stage counts

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nudge_channels::{DiscordRoleOracle, DiscordTransport, log_channel_from_config};
use nudge_core::NudgeConfig;
use nudge_core::traits::eligibility::NoExclusions;
use nudge_core::traits::{EligibilityOracle, RecordStore};
use nudge_core::types::{CompletionSubmission, StageKey};
use nudge_scheduler::{
    CampaignDb, CampaignEvent, Collaborators, EventKind, PassScope, Reconciler, Shutdown,
    spawn_loop, spawn_refresher,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nudge", version, about = "📨 Nudge: drip DM campaign runner")]
struct Cli {
    /// Config file (default: ~/.nudge/config.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the campaign until ctrl-c
    Run {
        /// Reset reminder clocks of recipients that only got the initial message
        #[arg(long)]
        rebase_on_start: bool,
        /// Do not start the HTTP admin gateway
        #[arg(long)]
        no_gateway: bool,
    },
    /// Run a single pass and exit
    Pass {
        /// Only contact recipients that were never messaged
        #[arg(long)]
        initial_only: bool,
    },
    /// Reset reminder clocks after downtime
    Rebase,
    /// Add recipients (already enrolled ones are ignored)
    Enroll {
        ids: Vec<String>,
        /// File with one identity per line
        #[arg(long)]
        file: Option<String>,
    },
    /// Record a completion for a recipient
    Complete {
        id: String,
        #[arg(long)]
        username: Option<String>,
        /// Extra form field, as key=value (repeatable)
        #[arg(long = "field")]
        fields: Vec<String>,
    },
    /// Set a message template (initial, reminder_1, reminder_2)
    ContentSet { key: String, text: String },
    /// Send all three messages to one identity without touching its record
    TestSend { id: String },
    /// Show per-stage counts and the last pass
    Status,
    /// Write a default config file
    Init,
}

fn load_config(path: Option<&str>) -> Result<NudgeConfig> {
    let mut config = match path {
        Some(p) => {
            let path = PathBuf::from(shellexpand::tilde(p).to_string());
            NudgeConfig::load_from(&path)?
        }
        None => NudgeConfig::load()?,
    };
    config.apply_env_overrides();
    Ok(config)
}

fn parse_fields(raw: &[String]) -> Result<BTreeMap<String, String>> {
    raw.iter()
        .map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .with_context(|| format!("field '{kv}' is not key=value"))
        })
        .collect()
}

/// Open the store and wire the scheduler stack.
fn build(config: &NudgeConfig, needs_transport: bool) -> Result<(CampaignDb, Arc<Reconciler>)> {
    if needs_transport && config.discord.bot_token.trim().is_empty() {
        anyhow::bail!("discord.bot_token is not set (config file or DISCORD_TOKEN)");
    }

    let db_path = config.store.resolved_path();
    let db = CampaignDb::open(&db_path, config.store.strict_schema)?;
    tracing::info!("💾 Campaign DB: {}", db_path.display());

    let oracle: Arc<dyn EligibilityOracle> =
        if config.discord.guild_id.is_some() && !config.discord.excluded_role_ids.is_empty() {
            Arc::new(DiscordRoleOracle::from_config(&config.discord))
        } else {
            tracing::info!("No exclusion roles configured; everyone is eligible");
            Arc::new(NoExclusions)
        };

    let reconciler = Reconciler::from_config(
        config,
        Collaborators {
            store: Arc::new(db.clone()),
            content: Arc::new(db.clone()),
            transport: Arc::new(DiscordTransport::from_config(&config.discord)),
            oracle,
            log: log_channel_from_config(&config.discord),
        },
    );
    Ok((db, Arc::new(reconciler)))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "nudge=debug,nudge_core=debug,nudge_scheduler=debug,nudge_channels=debug,nudge_gateway=debug,tower_http=debug"
    } else {
        "nudge=info,nudge_core=info,nudge_scheduler=info,nudge_channels=info,nudge_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    if let Command::Init = cli.command {
        let path = NudgeConfig::default_path();
        if path.exists() {
            println!("⚠️  {} already exists.", path.display());
        } else {
            NudgeConfig::default().save()?;
            println!("✅ Wrote default config to {}", path.display());
        }
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            rebase_on_start,
            no_gateway,
        } => run(config, rebase_on_start, no_gateway).await,
        Command::Pass { initial_only } => {
            let (_, reconciler) = build(&config, true)?;
            let scope = if initial_only {
                PassScope::InitialOnly
            } else {
                PassScope::All
            };
            let (tx, mut shutdown) = Shutdown::channel();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = tx.send(true);
                }
            });
            let report = reconciler.run_pass(scope, &mut shutdown).await;
            print_json(&report)?;
            match report.aborted {
                Some(reason) => anyhow::bail!("pass aborted: {reason}"),
                None => Ok(()),
            }
        }
        Command::Rebase => {
            let (_, reconciler) = build(&config, false)?;
            print_json(&reconciler.rebase().await?)
        }
        Command::Enroll { mut ids, file } => {
            if let Some(file) = file {
                let path = shellexpand::tilde(&file).to_string();
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {path}"))?;
                ids.extend(content.lines().map(|l| l.trim().to_string()));
            }
            ids.retain(|id| !id.is_empty());
            let (db, _) = build(&config, false)?;
            let added = db.enroll(&ids).await?;
            println!("✅ Enrolled {added} new recipient(s) ({} given)", ids.len());
            Ok(())
        }
        Command::Complete {
            id,
            username,
            fields,
        } => {
            let (_, reconciler) = build(&config, false)?;
            let submission = CompletionSubmission {
                identity: id,
                username,
                fields: parse_fields(&fields)?,
            };
            print_json(&reconciler.complete(&submission).await?)
        }
        Command::ContentSet { key, text } => {
            let stage_key = StageKey::from_key(key.trim())
                .with_context(|| format!("unknown content key '{key}'"))?;
            let (db, _) = build(&config, false)?;
            db.set_content(stage_key.as_str(), &text).await?;
            println!("✅ Updated '{stage_key}'");
            Ok(())
        }
        Command::TestSend { id } => {
            let (_, reconciler) = build(&config, true)?;
            reconciler.resolver().refresh().await?;
            for (key, outcome) in reconciler.test_send(&id).await {
                println!("{key}: {outcome:?}");
            }
            Ok(())
        }
        Command::Status => {
            let (_, reconciler) = build(&config, false)?;
            reconciler.resolver().refresh().await.ok();
            print_json(&reconciler.status().await?)
        }
        Command::Init => Ok(()),
    }
}

async fn run(config: NudgeConfig, rebase_on_start: bool, no_gateway: bool) -> Result<()> {
    let (db, reconciler) = build(&config, true)?;
    let (tx, shutdown) = Shutdown::channel();

    if let Err(e) = reconciler.resolver().refresh().await {
        tracing::warn!("⚠️ Starting with built-in message bodies: {e}");
    }
    if rebase_on_start {
        let report = reconciler.rebase().await?;
        tracing::info!("🔁 Rebased {} recipient(s) on start", report.rebased);
    }
    reconciler
        .events()
        .emit(CampaignEvent::new(EventKind::Online, None))
        .await;

    let refresher = spawn_refresher(
        reconciler.resolver().clone(),
        Duration::from_secs(config.content.refresh_secs.max(1)),
        shutdown.receiver(),
    );
    let passes = spawn_loop(
        reconciler.clone(),
        Duration::from_secs(config.campaign.pass_interval_secs.max(1)),
        shutdown.clone(),
    );

    let gateway = if config.gateway.enabled && !no_gateway {
        let state = nudge_gateway::AppState::new(
            config.gateway.clone(),
            reconciler.clone(),
            db,
            shutdown.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(e) = nudge_gateway::serve(state).await {
                tracing::error!("❌ Gateway failed: {e}");
            }
        }))
    } else {
        None
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("🛑 Shutdown requested, finishing in-flight work");
    let _ = tx.send(true);

    let _ = passes.await;
    let _ = refresher.await;
    if let Some(gateway) = gateway {
        let _ = gateway.await;
    }
    tracing::info!("👋 Nudge stopped");
    Ok(())
}
