// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use vault_tx_engine::app::config::GlobalSettings;
use vault_tx_engine::app::logging::setup_logging;
use vault_tx_engine::common::parsing::{parse_address_hex, parse_amount, parse_hex_bytes};
use vault_tx_engine::domain::error::AppError;
use vault_tx_engine::domain::types::GasStrategy;
use vault_tx_engine::network::provider::AlloyConnector;
use vault_tx_engine::network::signer::{LocalSigner, TransactionSigner};
use vault_tx_engine::retry::TxPayload;
use vault_tx_engine::services::metrics::spawn_metrics_server;
use vault_tx_engine::{Engine, EngineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "vault transaction engine")]
struct Cli {
    /// Path to config file (default: config.{toml,yaml,...})
    #[arg(long)]
    config: Option<String>,

    /// Emit JSON log lines
    #[arg(long, default_value_t = false)]
    json_logs: bool,

    /// Log level or directive string (overrides config)
    #[arg(long)]
    log_level: Option<String>,

    /// Metrics port (overrides config/env)
    #[arg(long)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the engine and serve metrics until Ctrl-C
    Run,
    /// Submit one transaction with the configured retry policy
    Send {
        /// Network name as configured under [networks]
        #[arg(long)]
        network: String,
        #[arg(long)]
        to: String,
        /// Wei, 0x-hex, or a gwei/ether suffixed decimal
        #[arg(long, default_value = "0")]
        value: String,
        /// Hex calldata
        #[arg(long, default_value = "0x")]
        data: String,
        /// standard | fast | adaptive (overrides config)
        #[arg(long)]
        gas_strategy: Option<GasStrategy>,
        #[arg(long)]
        confirmations: Option<u64>,
    },
}

fn build_signer(settings: &GlobalSettings) -> Result<Option<Arc<dyn TransactionSigner>>, AppError> {
    match settings.wallet_key() {
        Some(key) => {
            let signer = LocalSigner::from_hex(key)?;
            tracing::info!(target: "config", address = %signer.address(), "Local signer loaded");
            Ok(Some(Arc::new(signer)))
        }
        None => {
            tracing::warn!(
                target: "config",
                "No wallet_key configured; transactions are signed by the node"
            );
            Ok(None)
        }
    }
}

async fn run(engine: Arc<Engine>, settings: &GlobalSettings, metrics_port: u16) {
    if settings.metrics_enabled {
        spawn_metrics_server(metrics_port, engine.clone()).await;
    }

    let mut ticker = tokio::time::interval(Duration::from_secs(
        settings.stats_log_interval_secs.max(1),
    ));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(target: "engine", "Ctrl-C received");
                break;
            }
            _ = ticker.tick() => {
                for network in engine.networks() {
                    if let Ok(stats) = engine.get_pool_stats(Some(&network)) {
                        tracing::info!(
                            target: "pool",
                            network = %network,
                            size = stats.size,
                            available = stats.available,
                            busy = stats.busy,
                            success_rate = stats.success_rate,
                            avg_latency_ms = stats.average_latency_ms,
                            "Pool stats"
                        );
                    }
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = GlobalSettings::load_with_path(cli.config.as_deref())
        .context("loading settings")?;
    let log_level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| settings.effective_log_level().to_string());
    setup_logging(&log_level, cli.json_logs || settings.json_logs);

    let metrics_port = cli.metrics_port.unwrap_or(settings.metrics_port);
    let signer = build_signer(&settings).context("loading wallet key")?;
    let config = EngineConfig::new(settings.network_configs()).with_pool(settings.pool_settings());
    let engine = Engine::start(config, Arc::new(AlloyConnector), signer)
        .await
        .context("starting engine")?;

    let result = match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            run(engine.clone(), &settings, metrics_port).await;
            Ok(())
        }
        Command::Send {
            network,
            to,
            value,
            data,
            gas_strategy,
            confirmations,
        } => {
            let to = parse_address_hex(&to)
                .with_context(|| format!("invalid --to address: {to}"))?;
            let value = parse_amount(&value).with_context(|| format!("invalid --value: {value}"))?;
            let data = parse_hex_bytes(&data).with_context(|| format!("invalid --data hex: {data}"))?;
            let mut policy = settings.default_policy();
            if let Some(strategy) = gas_strategy {
                policy.gas_strategy = strategy;
            }
            if let Some(confirmations) = confirmations {
                policy.confirmations = confirmations;
            }
            let payload = TxPayload {
                to,
                value,
                data,
                ..TxPayload::default()
            };

            match engine.execute_with_retry(&network, payload, policy).await {
                Ok(outcome) => {
                    tracing::info!(
                        target: "engine",
                        hash = %outcome.hash,
                        block = outcome.receipt.block_number,
                        attempts = outcome.attempts,
                        gas_used = outcome.gas_used,
                        "Transaction confirmed"
                    );
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&outcome).unwrap_or_default()
                    );
                    Ok(())
                }
                Err(err) => {
                    eprintln!("{}", serde_json::to_string_pretty(&err).unwrap_or_default());
                    Err(anyhow::Error::new(err))
                }
            }
        }
    };

    engine.shutdown().await;
    result
}
