//! Stakeroom service
//!
//! Opens the ledger database, seeds bootstrap rooms and accounts, starts every
//! configured room and runs until interrupted.

use clap::Parser;
use stakeroom::{
    common::types::UserProfile,
    config::ServiceConfig,
    storage::{RocksStore, Store},
    ChannelBroadcaster, LoggingRiskChecker, RoomRegistry, StaticUserDirectory, TransactionType,
    TxContext,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stakeroom")]
#[command(about = "Multiplayer betting room service", long_about = None)]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<String>,

    /// Database directory (overrides the config file)
    #[arg(long)]
    data_dir: Option<String>,

    /// Log filter, e.g. "info" or "stakeroom=debug" (RUST_LOG wins)
    #[arg(long)]
    log_level: Option<String>,

    /// Wipe the database before starting
    #[arg(long)]
    clear: bool,

    /// Start from the development preset instead of defaults
    #[arg(long)]
    dev: bool,
}

const METRICS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServiceConfig::load(path)?,
        None if args.dev => ServiceConfig::development(),
        None => ServiceConfig::default(),
    };
    if let Some(dir) = args.data_dir {
        config.storage.data_directory = dir;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    if args.clear {
        config.storage.clear_on_start = true;
    }
    config.validate()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    tracing::info!(data_directory = %config.storage.data_directory, "starting stakeroom");

    let store: Arc<dyn Store> = if config.storage.clear_on_start {
        Arc::new(RocksStore::open_fresh(&config.storage.data_directory)?)
    } else {
        Arc::new(RocksStore::open(&config.storage.data_directory)?)
    };

    let directory = Arc::new(StaticUserDirectory::with_profiles(
        config
            .bootstrap
            .accounts
            .iter()
            .map(|a| UserProfile::new(a.user_id.clone(), a.display_name.clone())),
    ));

    let broadcaster = Arc::new(ChannelBroadcaster::new(1024));
    spawn_event_log(&broadcaster);

    let registry = RoomRegistry::from_config(
        &config,
        store.clone(),
        broadcaster,
        Arc::new(LoggingRiskChecker),
        directory,
    )?;

    bootstrap(&config, store.as_ref(), &registry).await?;

    let mut report = tokio::time::interval(METRICS_INTERVAL);
    report.tick().await;
    loop {
        tokio::select! {
            _ = report.tick() => {
                let snapshot = registry.metrics().snapshot();
                tracing::info!(
                    rooms = registry.active_rooms().len(),
                    rounds_settled = snapshot.rounds_settled,
                    rounds_failed = snapshot.rounds_failed,
                    rounds_cancelled = snapshot.rounds_cancelled,
                    stakes = %snapshot.stakes_collected,
                    prizes = %snapshot.prizes_paid,
                    "room metrics"
                );
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::error!(error = %e, "failed to listen for shutdown signal");
                }
                break;
            }
        }
    }

    registry.shutdown();
    tracing::info!("stakeroom stopped");
    Ok(())
}

/// Create missing accounts and rooms, then start every configured room
async fn bootstrap(
    config: &ServiceConfig,
    store: &dyn Store,
    registry: &RoomRegistry,
) -> Result<(), Box<dyn std::error::Error>> {
    store.open_account(&config.ledger.platform_account).await?;

    for account in &config.bootstrap.accounts {
        if store.get_account(&account.user_id).await?.is_some() {
            continue;
        }
        if account.deposit.is_positive() {
            registry
                .cache()
                .add(
                    &account.user_id,
                    account.deposit,
                    TransactionType::Deposit,
                    TxContext::remark("bootstrap deposit"),
                )
                .await?;
        } else {
            store.open_account(&account.user_id).await?;
        }
        tracing::info!(user_id = %account.user_id, deposit = %account.deposit, "bootstrap account created");
    }

    for room in &config.bootstrap.rooms {
        if store.get_room(&room.room_id).await?.is_none() {
            registry.create_room(room.clone()).await?;
        }
        registry.get_or_create_room(&room.room_id).await?;
    }
    Ok(())
}

/// Stand-in transport: log every outbound room message
fn spawn_event_log(broadcaster: &ChannelBroadcaster) {
    let mut rx = broadcaster.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => match serde_json::to_string(&message) {
                    Ok(json) => tracing::debug!(room_id = %message.room_id, kind = message.event.kind(), "{}", json),
                    Err(e) => tracing::warn!(error = %e, "unserialisable room message"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("event log lagged; skipped {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    });
}
