// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::domain::constants::{self, GWEI};
use crate::domain::error::AppError;
use crate::domain::types::{BackoffStrategy, GasStrategy};
use crate::network::gas::GasSettings;
use crate::network::pool::{LoadBalancing, NetworkConfig, PoolSettings};
use crate::services::retry::RetryPolicy;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use url::Url;

pub const ENV_PREFIX: &str = "VAULT_ENGINE";

#[derive(Debug, Deserialize, Clone)]
pub struct GlobalSettings {
    // General
    #[serde(default = "default_debug")]
    pub debug: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
    #[serde(default = "default_stats_log_interval_secs")]
    pub stats_log_interval_secs: u64,

    // Identity. Without a key the engine relies on node-side signing.
    pub wallet_key: Option<String>,

    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PoolSection {
    #[serde(default)]
    pub load_balancing: LoadBalancing,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_idle_sweep_interval_ms")]
    pub idle_sweep_interval_ms: u64,
    #[serde(default = "default_acquire_retries")]
    pub acquire_retries: u32,
    #[serde(default = "default_acquire_retry_delay_ms")]
    pub acquire_retry_delay_ms: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            load_balancing: LoadBalancing::default(),
            health_check_interval_ms: default_health_check_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            idle_sweep_interval_ms: default_idle_sweep_interval_ms(),
            acquire_retries: default_acquire_retries(),
            acquire_retry_delay_ms: default_acquire_retry_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrySection {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default)]
    pub backoff: BackoffStrategy,
    #[serde(default)]
    pub gas_strategy: GasStrategy,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_true")]
    pub enable_replacement: bool,
    #[serde(default = "default_max_replacements")]
    pub max_replacements: u32,
    #[serde(default = "default_replacement_multiplier_bps")]
    pub replacement_multiplier_bps: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_stuck_after_ms")]
    pub stuck_after_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff: BackoffStrategy::default(),
            gas_strategy: GasStrategy::default(),
            confirmations: default_confirmations(),
            timeout_ms: default_timeout_ms(),
            enable_replacement: default_true(),
            max_replacements: default_max_replacements(),
            replacement_multiplier_bps: default_replacement_multiplier_bps(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            jitter_ratio: default_jitter_ratio(),
            poll_interval_ms: None,
            stuck_after_ms: default_stuck_after_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NetworkSection {
    pub chain_id: u64,
    pub endpoints: Vec<String>,
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub essential: bool,
    #[serde(default = "default_true")]
    pub eip1559: bool,
    #[serde(default = "default_min_fee_gwei")]
    pub min_fee_gwei: f64,
    #[serde(default = "default_max_fee_gwei")]
    pub max_fee_gwei: f64,
    #[serde(default = "default_fast_multiplier_bps")]
    pub fast_multiplier_bps: u64,
    #[serde(default = "default_adaptive_max_multiplier_bps")]
    pub adaptive_max_multiplier_bps: u64,
    #[serde(default = "default_fee_history_blocks")]
    pub fee_history_blocks: u64,
    #[serde(default = "default_fee_cache_ttl_ms")]
    pub fee_cache_ttl_ms: u64,
    #[serde(default = "default_gas_limit_margin_bps")]
    pub gas_limit_margin_bps: u64,
    #[serde(default = "default_fallback_gas_limit")]
    pub fallback_gas_limit: u64,
}

fn default_debug() -> bool {
    false
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_metrics_port() -> u16 {
    9100
}
fn default_stats_log_interval_secs() -> u64 {
    60
}
fn default_health_check_interval_ms() -> u64 {
    constants::DEFAULT_HEALTH_CHECK_INTERVAL_MS
}
fn default_idle_timeout_ms() -> u64 {
    constants::DEFAULT_IDLE_TIMEOUT_MS
}
fn default_idle_sweep_interval_ms() -> u64 {
    constants::DEFAULT_IDLE_SWEEP_INTERVAL_MS
}
fn default_acquire_retries() -> u32 {
    constants::DEFAULT_ACQUIRE_RETRIES
}
fn default_acquire_retry_delay_ms() -> u64 {
    constants::DEFAULT_ACQUIRE_RETRY_DELAY_MS
}
fn default_max_retries() -> u32 {
    constants::DEFAULT_MAX_RETRIES
}
fn default_confirmations() -> u64 {
    constants::DEFAULT_CONFIRMATIONS
}
fn default_timeout_ms() -> u64 {
    constants::DEFAULT_JOB_TIMEOUT_MS
}
fn default_max_replacements() -> u32 {
    constants::DEFAULT_MAX_REPLACEMENTS
}
fn default_replacement_multiplier_bps() -> u64 {
    constants::DEFAULT_REPLACEMENT_MULTIPLIER_BPS
}
fn default_backoff_base_ms() -> u64 {
    constants::DEFAULT_BACKOFF_BASE_MS
}
fn default_backoff_max_ms() -> u64 {
    constants::DEFAULT_BACKOFF_MAX_MS
}
fn default_jitter_ratio() -> f64 {
    constants::DEFAULT_BACKOFF_JITTER
}
fn default_stuck_after_ms() -> u64 {
    constants::DEFAULT_STUCK_AFTER_MS
}
fn default_min_connections() -> usize {
    constants::DEFAULT_MIN_CONNECTIONS
}
fn default_max_connections() -> usize {
    constants::DEFAULT_MAX_CONNECTIONS
}
fn default_connect_timeout_ms() -> u64 {
    constants::DEFAULT_CONNECT_TIMEOUT_MS
}
fn default_request_timeout_ms() -> u64 {
    constants::DEFAULT_REQUEST_TIMEOUT_MS
}
fn default_health_check_timeout_ms() -> u64 {
    constants::DEFAULT_HEALTH_CHECK_TIMEOUT_MS
}
fn default_min_fee_gwei() -> f64 {
    constants::DEFAULT_MIN_FEE_WEI as f64 / GWEI as f64
}
fn default_max_fee_gwei() -> f64 {
    constants::DEFAULT_MAX_FEE_WEI as f64 / GWEI as f64
}
fn default_fast_multiplier_bps() -> u64 {
    constants::DEFAULT_FAST_MULTIPLIER_BPS
}
fn default_adaptive_max_multiplier_bps() -> u64 {
    constants::DEFAULT_ADAPTIVE_MAX_MULTIPLIER_BPS
}
fn default_fee_history_blocks() -> u64 {
    constants::DEFAULT_FEE_HISTORY_BLOCKS
}
fn default_fee_cache_ttl_ms() -> u64 {
    constants::DEFAULT_FEE_CACHE_TTL_MS
}
fn default_gas_limit_margin_bps() -> u64 {
    constants::DEFAULT_GAS_LIMIT_MARGIN_BPS
}
fn default_fallback_gas_limit() -> u64 {
    constants::DEFAULT_FALLBACK_GAS_LIMIT
}

fn gwei_to_wei(gwei: f64) -> u128 {
    (gwei.max(0.0) * GWEI as f64).round() as u128
}

impl NetworkSection {
    fn to_network_config(&self, name: &str) -> NetworkConfig {
        let mut network = NetworkConfig::new(name, self.chain_id, self.endpoints.clone());
        network.min_connections = self.min_connections;
        network.max_connections = self.max_connections;
        network.connect_timeout = Duration::from_millis(self.connect_timeout_ms);
        network.request_timeout = Duration::from_millis(self.request_timeout_ms);
        network.health_check_timeout = Duration::from_millis(self.health_check_timeout_ms);
        network.essential = self.essential;
        network.gas = GasSettings {
            eip1559: self.eip1559,
            min_fee: gwei_to_wei(self.min_fee_gwei),
            max_fee: gwei_to_wei(self.max_fee_gwei),
            fast_multiplier_bps: self.fast_multiplier_bps,
            adaptive_max_multiplier_bps: self.adaptive_max_multiplier_bps,
            fee_history_blocks: self.fee_history_blocks,
            fee_cache_ttl: Duration::from_millis(self.fee_cache_ttl_ms),
            gas_limit_margin_bps: self.gas_limit_margin_bps,
            fallback_gas_limit: self.fallback_gas_limit,
        };
        network
    }
}

impl GlobalSettings {
    pub fn load() -> Result<Self, AppError> {
        Self::load_with_path(None)
    }

    /// Precedence: CLI (applied in main) > `VAULT_ENGINE_*` env/.env > file.
    pub fn load_with_path(path: Option<&str>) -> Result<Self, AppError> {
        // Load .env file if it exists
        dotenvy::dotenv().ok();

        let mut builder = Config::builder();
        if let Some(selected_path) = path {
            builder = builder.add_source(File::from(Path::new(selected_path)).required(true));
        } else {
            builder = builder.add_source(File::with_name("config").required(false));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let settings: GlobalSettings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        tracing::debug!(
            target: "config",
            path = path.unwrap_or("config.*"),
            networks = settings.networks.len(),
            "Settings loaded"
        );
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.networks.is_empty() {
            return Err(AppError::Config("no networks configured".into()));
        }
        for (name, section) in &self.networks {
            for endpoint in &section.endpoints {
                validate_endpoint(name, endpoint)?;
            }
            section.to_network_config(name).validate()?;
        }
        self.default_policy().validate()?;
        if let Some(key) = self.wallet_key.as_deref()
            && key.trim().is_empty()
        {
            return Err(AppError::Config("wallet_key is set but empty".into()));
        }
        Ok(())
    }

    /// Networks in name order.
    pub fn network_configs(&self) -> Vec<NetworkConfig> {
        self.networks
            .iter()
            .map(|(name, section)| section.to_network_config(name))
            .collect()
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            load_balancing: self.pool.load_balancing,
            health_check_interval: Duration::from_millis(self.pool.health_check_interval_ms),
            idle_timeout: Duration::from_millis(self.pool.idle_timeout_ms),
            idle_sweep_interval: Duration::from_millis(self.pool.idle_sweep_interval_ms),
            acquire_retries: self.pool.acquire_retries,
            acquire_retry_delay: Duration::from_millis(self.pool.acquire_retry_delay_ms),
        }
    }

    pub fn default_policy(&self) -> RetryPolicy {
        let r = &self.retry;
        RetryPolicy {
            max_retries: r.max_retries,
            backoff: r.backoff,
            gas_strategy: r.gas_strategy,
            confirmations: r.confirmations,
            timeout: Duration::from_millis(r.timeout_ms),
            enable_replacement: r.enable_replacement,
            max_replacements: r.max_replacements,
            replacement_multiplier_bps: r.replacement_multiplier_bps,
            backoff_base: Duration::from_millis(r.backoff_base_ms),
            backoff_max: Duration::from_millis(r.backoff_max_ms),
            jitter_ratio: r.jitter_ratio,
            poll_interval: r.poll_interval_ms.map(Duration::from_millis),
            stuck_after: Duration::from_millis(r.stuck_after_ms),
        }
    }

    pub fn wallet_key(&self) -> Option<&str> {
        self.wallet_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
    }

    pub fn effective_log_level(&self) -> &str {
        if self.debug { "debug" } else { self.log_level.as_str() }
    }
}

fn validate_endpoint(network: &str, endpoint: &str) -> Result<(), AppError> {
    let trimmed = endpoint.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.ends_with(".ipc") || lower.starts_with('/') {
        return Ok(());
    }
    let url = Url::parse(trimmed).map_err(|e| {
        AppError::Config(format!("networks.{network}: invalid endpoint '{trimmed}': {e}"))
    })?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(()),
        other => Err(AppError::Config(format!(
            "networks.{network}: unsupported endpoint scheme '{other}'"
        ))),
    }
}
