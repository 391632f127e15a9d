#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod cli;
mod config;
mod db;
mod discord;
mod ledger;
mod platform;
mod utils;
mod web;

use cli::Cli;
use config::Config;
use web::metrics::Metrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::load_from_file(&cli.config)?);

    utils::logging::init_tracing(&config.logging);
    Metrics::start();
    info!(
        "reputation ledger starting version={} config={}",
        env!("CARGO_PKG_VERSION"),
        cli.config.display()
    );

    let db = Arc::new(db::DatabaseManager::new(&config.database, config.ledger.defaults()).await?);
    db.migrate().await?;

    cli::run(cli.command, config, db).await?;

    info!("reputation ledger shutting down");
    Ok(())
}
