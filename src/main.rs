mod cli;

use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use eth_gas_telemetry::api::{self, AppState};
use eth_gas_telemetry::config::Config;
use eth_gas_telemetry::envelope::RawBlockEnvelope;
use eth_gas_telemetry::eth::EthClient;
use eth_gas_telemetry::extract;
use eth_gas_telemetry::ingest::{self, Ingestor};
use eth_gas_telemetry::models::TimeRange;
use eth_gas_telemetry::series::{LiveSeries, SeriesAggregator};
use eth_gas_telemetry::storage::{self, DbPool};
use eth_gas_telemetry::whales;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    match cli.command {
        Commands::Serve { addr, follow } => {
            let bind = addr.unwrap_or_else(|| config.http_bind_addr.clone());
            let ingestor = ingestor(&config).await?;
            let aggregator =
                SeriesAggregator::new(ingestor.pool().clone(), config.max_chart_points);
            let live = LiveSeries::spawn(
                aggregator.clone(),
                TimeRange::default(),
                config.poll_interval,
            );
            let state = AppState::new(ingestor.clone(), aggregator).with_live_series(live);

            if follow {
                let client = EthClient::new(config.require_rpc_url()?)?;
                let config = config.clone();
                tokio::spawn(async move {
                    if let Err(err) = follow_head(&ingestor, &client, &config).await {
                        tracing::error!("chain follower stopped: {:#}", err);
                    }
                });
            }

            api::run_http_server(&bind, state).await?;
        }
        Commands::IngestOnce { blocks } => {
            let client = EthClient::new(config.require_rpc_url()?)?;
            let ingestor = ingestor(&config).await?;
            let summary = ingest::ingest_recent(&ingestor, &client, blocks).await?;
            tracing::info!(
                "ingest-once done: {} stored, {} duplicates, {} failed",
                summary.stored,
                summary.duplicates,
                summary.failed
            );
        }
        Commands::Watch { poll_secs } => {
            let client = EthClient::new(config.require_rpc_url()?)?;
            let ingestor = ingestor(&config).await?;
            let mut config = config;
            if let Some(secs) = poll_secs.filter(|s| *s > 0) {
                config.poll_interval = Duration::from_secs(secs);
            }
            follow_head(&ingestor, &client, &config).await?;
        }
        Commands::Extract { file } => {
            let raw = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let value: serde_json::Value =
                serde_json::from_str(&raw).context("block file is not valid JSON")?;
            let metrics = extract::extract(RawBlockEnvelope::from_value(value))?;
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Commands::Series { range, max_points } => {
            let pool = pool(&config).await?;
            let aggregator = SeriesAggregator::new(
                pool,
                max_points.unwrap_or(config.max_chart_points).max(1),
            );
            let series = aggregator.query(range).await?;
            println!("{}", serde_json::to_string_pretty(&series)?);
        }
        Commands::GasStats { blocks } => {
            let pool = pool(&config).await?;
            match storage::get_gas_stats(&pool, blocks.max(1) as i64).await? {
                Some(stats) => println!(
                    "last {} blocks: min {:.2} Gwei, max {:.2} Gwei, avg {:.2} Gwei",
                    stats.blocks, stats.min, stats.max, stats.avg
                ),
                None => println!("no blocks stored yet"),
            }
        }
        Commands::TopWhales { limit, page } => {
            let pool = pool(&config).await?;
            let limit = limit.max(1) as i64;
            let offset = (page.max(1) as i64 - 1) * limit;
            for whale in storage::get_top_whales(&pool, limit, offset).await? {
                println!(
                    "{} {:.4} ETH over {} txs in {} blocks",
                    whale.address, whale.total_value_eth, whale.total_transactions, whale.total_blocks
                );
            }
        }
        Commands::AlertAdd {
            name,
            threshold,
            direction,
            disabled,
        } => {
            let pool = pool(&config).await?;
            let id = storage::create_alert(&pool, &name, threshold, direction, !disabled).await?;
            println!("{}", id);
        }
        Commands::AlertList => {
            let pool = pool(&config).await?;
            for alert in storage::list_alerts(&pool).await? {
                println!(
                    "{} {} {} {} Gwei{}",
                    alert.id,
                    alert.name,
                    alert.direction.as_str(),
                    alert.threshold,
                    if alert.enabled { "" } else { " (disabled)" }
                );
            }
        }
        Commands::AlertToggle { id, enabled } => {
            let pool = pool(&config).await?;
            if !storage::set_alert_enabled(&pool, &id, enabled).await? {
                anyhow::bail!("no alert with id {}", id);
            }
        }
        Commands::AlertDelete { id } => {
            let pool = pool(&config).await?;
            if !storage::delete_alert(&pool, &id).await? {
                anyhow::bail!("no alert with id {}", id);
            }
        }
    }

    Ok(())
}

async fn pool(config: &Config) -> anyhow::Result<DbPool> {
    storage::init_pool(&config.database_url).await
}

async fn ingestor(config: &Config) -> anyhow::Result<Ingestor> {
    let pool = pool(config).await?;
    Ok(Ingestor::new(pool, whales::eth_to_wei(config.whale_min_eth)))
}

async fn follow_head(
    ingestor: &Ingestor,
    client: &EthClient,
    config: &Config,
) -> anyhow::Result<()> {
    match &config.eth_ws_url {
        Some(ws_url) => ingest::watch_ws(ingestor, client, ws_url).await,
        None => ingest::watch_poll(ingestor, client, config.poll_interval).await,
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}
