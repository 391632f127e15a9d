use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::db::DatabaseManager;
use crate::discord::{DiscordGateway, DiscordPlatform};
use crate::ledger::maintenance;
use crate::ledger::scanner::ScanSettings;
use crate::ledger::{
    EventIngest, Maintenance, QueryEngine, ReconciliationScanner, ScanControl, ScanMode,
    ScanRegistry,
};
use crate::platform::{Platform, RetryPolicy};
use crate::web::WebServer;

#[derive(Debug, Parser)]
#[command(name = "reputation-ledger")]
#[command(about = "Reaction-driven reputation ledger for Discord communities", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "CONFIG_PATH", default_value = "config.yaml")]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the gateway listener and the operator API
    Serve,

    /// Replay reactions still present in channel history
    Scan {
        /// Community (guild) to scan
        #[arg(long)]
        community: i64,

        /// Restrict the scan to one channel of the community
        #[arg(long)]
        channel: Option<i64>,

        /// Walk from the start of each channel instead of the stored watermark
        #[arg(long)]
        full: bool,
    },

    /// Wipe votes and aggregates, then rebuild them from history
    Rebuild {
        /// Communities to rebuild; defaults to scan.communities, then to every
        /// community the ledger has settings for
        #[arg(long = "community")]
        communities: Vec<i64>,

        /// Confirm the destructive reset
        #[arg(long)]
        yes: bool,
    },

    /// Recompute received counts and fan/hater pairs from the vote rows
    Recompute,

    /// Refresh display names of every known user from the platform
    RefillNames,

    /// Reset every score offset to the default and clear the transaction log
    ResetOffsets {
        /// Confirm the destructive reset
        #[arg(long)]
        yes: bool,
    },

    /// Print the current leaderboard
    Leaderboard {
        /// Only users who posted or voted in this community
        #[arg(long)]
        community: Option<i64>,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

struct Services {
    platform: Arc<DiscordPlatform>,
    scanner: Arc<ReconciliationScanner>,
    maintenance: Arc<Maintenance>,
}

impl Services {
    fn build(config: &Config, db: &Arc<DatabaseManager>) -> Result<Self> {
        let token = config.require_bot_token()?;
        let platform = Arc::new(DiscordPlatform::new(token));
        let scanner = Arc::new(ReconciliationScanner::new(
            db.clone(),
            platform.clone() as Arc<dyn Platform>,
            ScanSettings::from_config(&config.scan),
        ));
        let maintenance = Arc::new(Maintenance::new(
            db.clone(),
            scanner.clone(),
            config.scan.refill_concurrency,
        ));
        Ok(Self {
            platform,
            scanner,
            maintenance,
        })
    }
}

pub async fn run(command: Command, config: Arc<Config>, db: Arc<DatabaseManager>) -> Result<()> {
    match command {
        Command::Serve => serve(config, db).await,
        Command::Scan {
            community,
            channel,
            full,
        } => {
            let services = Services::build(&config, &db)?;
            let mode = if full { ScanMode::Full } else { ScanMode::Resume };
            let control = cancel_on_ctrl_c();
            match channel {
                Some(channel_id) => {
                    let report = services
                        .scanner
                        .scan_channel(community, channel_id, mode, chrono::Utc::now(), &control)
                        .await?;
                    print_json(&report)
                }
                None => {
                    let report = services
                        .scanner
                        .scan_community(community, mode, &control)
                        .await?;
                    print_json(&report)
                }
            }
        }
        Command::Rebuild { communities, yes } => {
            if !yes {
                bail!("rebuild deletes every vote and aggregate; pass --yes to confirm");
            }
            let communities = if !communities.is_empty() {
                communities
            } else if !config.scan.communities.is_empty() {
                config.scan.communities.clone()
            } else {
                db.settings_store().list_communities().await?
            };
            if communities.is_empty() {
                bail!("no communities to rebuild; pass --community or set scan.communities");
            }

            let services = Services::build(&config, &db)?;
            let report = services
                .maintenance
                .rebuild(&communities, &cancel_on_ctrl_c())
                .await?;
            print_json(&report)
        }
        Command::Recompute => {
            let report = maintenance::recompute(&db).await?;
            print_json(&report)
        }
        Command::RefillNames => {
            let services = Services::build(&config, &db)?;
            let report = services.maintenance.refill_names().await?;
            print_json(&report)
        }
        Command::ResetOffsets { yes } => {
            if !yes {
                bail!("reset-offsets clears the transaction log; pass --yes to confirm");
            }
            let users = db.user_store().reset_offsets().await?;
            warn!("score offsets reset users={}", users);
            print_json(&serde_json::json!({ "users_reset": users }))
        }
        Command::Leaderboard { community, limit } => {
            let entries = QueryEngine::new(db)
                .leaderboard(community, limit.clamp(1, 100))
                .await?;
            for (rank, entry) in entries.iter().enumerate() {
                println!("{:>3}. {:<32} {}", rank + 1, entry.display_name, entry.score);
            }
            Ok(())
        }
    }
}

async fn serve(config: Arc<Config>, db: Arc<DatabaseManager>) -> Result<()> {
    let services = Services::build(&config, &db)?;
    let ingest = Arc::new(EventIngest::new(
        db.clone(),
        services.platform.clone() as Arc<dyn Platform>,
        RetryPolicy::from_config(&config.scan),
    ));
    let gateway = DiscordGateway::new(
        config.require_bot_token()?,
        config.auth.use_privileged_intents,
        ingest,
    );

    let web_handle = if config.web.enabled {
        let server = WebServer::new(
            config.web.clone(),
            db.clone(),
            services.scanner.clone(),
            Arc::new(ScanRegistry::new()),
            services.maintenance.clone(),
        );
        Some(tokio::spawn(async move {
            if let Err(err) = server.start().await {
                error!("web server error: {}", err);
            }
        }))
    } else {
        info!("operator api disabled");
        None
    };

    let gateway_task = gateway.clone();
    let gateway_handle = tokio::spawn(async move {
        if let Err(err) = gateway_task.start().await {
            error!("discord gateway error: {}", err);
            return;
        }
        gateway_task.wait().await;
    });

    let web_finished = async {
        match web_handle {
            Some(handle) => {
                let _ = handle.await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = web_finished => warn!("web server exited"),
        _ = gateway_handle => warn!("discord gateway exited"),
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    gateway.stop().await?;
    Ok(())
}

/// A control that is cancelled when the operator presses ctrl-c.
fn cancel_on_ctrl_c() -> ScanControl {
    let control = ScanControl::new();
    let signal_control = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("cancellation requested; stopping after the current page");
            signal_control.cancel();
        }
    });
    control
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
