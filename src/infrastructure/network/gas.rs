// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@oxidity.com>

use crate::common::retry::retry_transient;
use crate::domain::constants::{
    BASE_FEE_HEADROOM_BPS, BPS_DENOMINATOR, DEFAULT_ADAPTIVE_MAX_MULTIPLIER_BPS,
    DEFAULT_FALLBACK_GAS_LIMIT, DEFAULT_FAST_MULTIPLIER_BPS, DEFAULT_FEE_CACHE_TTL_MS,
    DEFAULT_FEE_HISTORY_BLOCKS, DEFAULT_GAS_LIMIT_MARGIN_BPS, DEFAULT_MAX_FEE_WEI,
    DEFAULT_MIN_FEE_WEI, DEFAULT_PRIORITY_FEE_WEI, FEE_HISTORY_PERCENTILES, TRANSFER_GAS_LIMIT,
};
use crate::domain::error::AppError;
use crate::domain::events::{EngineEvent, EventBus};
use crate::domain::types::GasStrategy;
use crate::network::pool::ConnectionPool;
use crate::network::rpc::RpcRequest;
use alloy::rpc::types::TransactionRequest;
use alloy::rpc::types::eth::FeeHistory;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Clone, Debug, PartialEq)]
pub struct GasSettings {
    /// Price with maxFee/priorityFee; legacy networks get a single gas price.
    pub eip1559: bool,
    pub min_fee: u128,
    pub max_fee: u128,
    pub fast_multiplier_bps: u64,
    pub adaptive_max_multiplier_bps: u64,
    pub fee_history_blocks: u64,
    pub fee_cache_ttl: Duration,
    pub gas_limit_margin_bps: u64,
    pub fallback_gas_limit: u64,
}

impl Default for GasSettings {
    fn default() -> Self {
        Self {
            eip1559: true,
            min_fee: DEFAULT_MIN_FEE_WEI,
            max_fee: DEFAULT_MAX_FEE_WEI,
            fast_multiplier_bps: DEFAULT_FAST_MULTIPLIER_BPS,
            adaptive_max_multiplier_bps: DEFAULT_ADAPTIVE_MAX_MULTIPLIER_BPS,
            fee_history_blocks: DEFAULT_FEE_HISTORY_BLOCKS,
            fee_cache_ttl: Duration::from_millis(DEFAULT_FEE_CACHE_TTL_MS),
            gas_limit_margin_bps: DEFAULT_GAS_LIMIT_MARGIN_BPS,
            fallback_gas_limit: DEFAULT_FALLBACK_GAS_LIMIT,
        }
    }
}

impl GasSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_fee > self.max_fee {
            return Err("min_fee exceeds max_fee".into());
        }
        if self.fast_multiplier_bps < BPS_DENOMINATOR
            || self.adaptive_max_multiplier_bps < BPS_DENOMINATOR
        {
            return Err("fee multipliers must be at least 10000 bps".into());
        }
        if self.fee_history_blocks == 0 {
            return Err("fee_history_blocks must be greater than zero".into());
        }
        Ok(())
    }

    /// Premium over the median fee, in bps. Adaptive is continuous in `congestion`.
    pub fn multiplier_bps(&self, strategy: GasStrategy, congestion: f64) -> u64 {
        match strategy {
            GasStrategy::Standard => BPS_DENOMINATOR,
            GasStrategy::Fast => self.fast_multiplier_bps,
            GasStrategy::Adaptive => {
                let headroom = self.adaptive_max_multiplier_bps.saturating_sub(BPS_DENOMINATOR);
                BPS_DENOMINATOR + (headroom as f64 * congestion.clamp(0.0, 1.0)).round() as u64
            }
        }
    }

    fn clamp_fee(&self, fee: u128) -> u128 {
        fee.clamp(self.min_fee, self.max_fee)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeePricing {
    Legacy {
        gas_price: u128,
    },
    Eip1559 {
        max_fee_per_gas: u128,
        max_priority_fee_per_gas: u128,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeSource {
    Live,
    Cached,
    Floor,
}

#[derive(Clone, Debug, Serialize)]
pub struct GasQuote {
    pub gas_limit: u64,
    pub pricing: FeePricing,
    pub strategy: GasStrategy,
    pub congestion: f64,
    pub source: FeeSource,
    #[serde(skip)]
    pub quoted_at: Instant,
}

fn scale_up(value: u128, bps: u64) -> u128 {
    let denom = BPS_DENOMINATOR as u128;
    let scaled = value
        .saturating_mul(bps as u128)
        .saturating_add(denom - 1)
        / denom;
    scaled.max(value.saturating_add(1))
}

impl GasQuote {
    /// Highest per-gas price this quote may pay.
    pub fn fee_cap(&self) -> u128 {
        match self.pricing {
            FeePricing::Legacy { gas_price } => gas_price,
            FeePricing::Eip1559 {
                max_fee_per_gas, ..
            } => max_fee_per_gas,
        }
    }

    pub fn priority_fee(&self) -> Option<u128> {
        match self.pricing {
            FeePricing::Legacy { .. } => None,
            FeePricing::Eip1559 {
                max_priority_fee_per_gas,
                ..
            } => Some(max_priority_fee_per_gas),
        }
    }

    /// Replacement quote: every fee field ≥ previous × `multiplier_bps`, rounded up and
    /// strictly greater. Not capped, since a replacement that does not outbid is rejected.
    pub fn bumped(&self, multiplier_bps: u64) -> GasQuote {
        let pricing = match self.pricing {
            FeePricing::Legacy { gas_price } => FeePricing::Legacy {
                gas_price: scale_up(gas_price, multiplier_bps),
            },
            FeePricing::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => FeePricing::Eip1559 {
                max_fee_per_gas: scale_up(max_fee_per_gas, multiplier_bps),
                max_priority_fee_per_gas: scale_up(max_priority_fee_per_gas, multiplier_bps),
            },
        };
        GasQuote {
            pricing,
            quoted_at: Instant::now(),
            ..self.clone()
        }
    }

    /// Bump over `self`, raised further to `market` where the market moved more.
    pub fn outbid(&self, market: &GasQuote, multiplier_bps: u64) -> GasQuote {
        let mut next = self.bumped(multiplier_bps);
        next.pricing = match (next.pricing, market.pricing) {
            (FeePricing::Legacy { gas_price }, FeePricing::Legacy { gas_price: m }) => {
                FeePricing::Legacy {
                    gas_price: gas_price.max(m),
                }
            }
            (
                FeePricing::Eip1559 {
                    max_fee_per_gas,
                    max_priority_fee_per_gas,
                },
                FeePricing::Eip1559 {
                    max_fee_per_gas: m_fee,
                    max_priority_fee_per_gas: m_tip,
                },
            ) => FeePricing::Eip1559 {
                max_fee_per_gas: max_fee_per_gas.max(m_fee),
                max_priority_fee_per_gas: max_priority_fee_per_gas.max(m_tip),
            },
            (own, _) => own,
        };
        next.congestion = market.congestion;
        next
    }

    /// Write the limit and fee fields into a draft transaction.
    pub fn apply(&self, tx: &mut TransactionRequest) {
        tx.gas = Some(self.gas_limit);
        match self.pricing {
            FeePricing::Legacy { gas_price } => {
                tx.gas_price = Some(gas_price);
                tx.max_fee_per_gas = None;
                tx.max_priority_fee_per_gas = None;
            }
            FeePricing::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                tx.gas_price = None;
                tx.max_fee_per_gas = Some(max_fee_per_gas);
                tx.max_priority_fee_per_gas = Some(max_priority_fee_per_gas);
            }
        }
    }
}

/// Market reading, priced per strategy on demand so the cache serves every strategy.
#[derive(Clone, Debug)]
struct FeeMarket {
    /// `None` on legacy networks.
    next_base_fee: Option<u128>,
    /// Median tip on EIP-1559 networks, `eth_gasPrice` otherwise.
    reference_fee: u128,
    congestion: f64,
    observed_at: Instant,
}

impl FeeMarket {
    fn price(&self, settings: &GasSettings, strategy: GasStrategy) -> FeePricing {
        let bps = settings.multiplier_bps(strategy, self.congestion);
        let scaled = self
            .reference_fee
            .saturating_mul(bps as u128)
            / BPS_DENOMINATOR as u128;
        let fee = settings.clamp_fee(scaled);
        match self.next_base_fee {
            Some(base) => {
                let max_fee = base
                    .saturating_mul(BASE_FEE_HEADROOM_BPS as u128)
                    / BPS_DENOMINATOR as u128;
                let max_fee = max_fee.saturating_add(fee).min(settings.max_fee).max(fee);
                FeePricing::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: fee,
                }
            }
            None => FeePricing::Legacy { gas_price: fee },
        }
    }
}

fn floor_pricing(settings: &GasSettings) -> FeePricing {
    if settings.eip1559 {
        FeePricing::Eip1559 {
            max_fee_per_gas: settings.min_fee,
            max_priority_fee_per_gas: settings.min_fee,
        }
    } else {
        FeePricing::Legacy {
            gas_price: settings.min_fee,
        }
    }
}

fn median(values: &mut [u128]) -> Option<u128> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable();
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        Some(values[mid - 1] / 2 + values[mid] / 2 + (values[mid - 1] % 2 + values[mid] % 2) / 2)
    } else {
        Some(values[mid])
    }
}

/// Congestion signal: mean block fullness, clamped to [0, 1].
pub fn congestion_from_history(history: &FeeHistory) -> f64 {
    if history.gas_used_ratio.is_empty() {
        return 0.0;
    }
    let sum: f64 = history.gas_used_ratio.iter().copied().sum();
    (sum / history.gas_used_ratio.len() as f64).clamp(0.0, 1.0)
}

/// Median of the per-block p50 rewards.
pub fn median_tip(history: &FeeHistory) -> Option<u128> {
    let mid = FEE_HISTORY_PERCENTILES.iter().position(|p| *p == 50.0)?;
    let mut tips: Vec<u128> = history
        .reward
        .as_ref()?
        .iter()
        .filter_map(|block| block.get(mid).copied())
        .collect();
    median(&mut tips)
}

fn next_base_fee(history: &FeeHistory) -> Option<u128> {
    let latest = history
        .latest_block_base_fee()
        .or_else(|| history.base_fee_per_gas.iter().rev().nth(1).copied())?;
    if latest == 0 {
        return None;
    }
    match history.next_block_base_fee() {
        Some(next) if next > 0 => Some(next),
        _ => Some(latest.saturating_mul(1125) / 1000),
    }
}

/// Per-attempt fee and gas-limit quotes, read live through the pool.
pub struct GasOptimizer {
    pool: Arc<ConnectionPool>,
    events: EventBus,
    last_good: DashMap<String, FeeMarket>,
}

impl GasOptimizer {
    pub fn new(pool: Arc<ConnectionPool>, events: EventBus) -> Self {
        Self {
            pool,
            events,
            last_good: DashMap::new(),
        }
    }

    /// Quote one attempt. Fails only for an unknown network; every data
    /// outage degrades to the cached market or the configured floor.
    pub async fn estimate_gas(
        &self,
        network: &str,
        tx: &TransactionRequest,
        strategy: GasStrategy,
    ) -> Result<GasQuote, AppError> {
        let settings = self.pool.network(network)?.config().gas.clone();

        let (pricing, congestion, source) = match self.read_market(network, &settings).await {
            Ok(market) => {
                let pricing = market.price(&settings, strategy);
                let congestion = market.congestion;
                self.last_good.insert(network.to_string(), market);
                (pricing, congestion, FeeSource::Live)
            }
            Err(e) => self.fallback_pricing(network, &settings, strategy, &e),
        };
        let gas_limit = self.gas_limit(network, tx, &settings).await;

        tracing::debug!(
            target: "gas",
            network,
            strategy = strategy.as_str(),
            congestion,
            ?source,
            gas_limit,
            ?pricing,
            "Gas quote"
        );
        Ok(GasQuote {
            gas_limit,
            pricing,
            strategy,
            congestion,
            source,
            quoted_at: Instant::now(),
        })
    }

    fn fallback_pricing(
        &self,
        network: &str,
        settings: &GasSettings,
        strategy: GasStrategy,
        error: &AppError,
    ) -> (FeePricing, f64, FeeSource) {
        let cached = self
            .last_good
            .get(network)
            .filter(|m| m.observed_at.elapsed() <= settings.fee_cache_ttl)
            .map(|m| m.clone());
        let (pricing, congestion, source) = match cached {
            Some(market) => (
                market.price(settings, strategy),
                market.congestion,
                FeeSource::Cached,
            ),
            None => (floor_pricing(settings), 0.0, FeeSource::Floor),
        };
        tracing::warn!(
            target: "gas",
            network,
            error = %error,
            ?source,
            "Fee data unavailable; using fallback pricing"
        );
        self.events.emit(EngineEvent::GasFallback {
            network: network.to_string(),
            reason: error.to_string(),
        });
        (pricing, congestion, source)
    }

    async fn read_market(
        &self,
        network: &str,
        settings: &GasSettings,
    ) -> Result<FeeMarket, AppError> {
        if !settings.eip1559 {
            return self.legacy_market(network).await;
        }
        let history = self.fee_history(network, settings.fee_history_blocks).await?;
        let congestion = congestion_from_history(&history);
        match next_base_fee(&history) {
            Some(base) => {
                let tip = match median_tip(&history) {
                    Some(tip) => tip,
                    None => self
                        .pool
                        .execute(network, RpcRequest::MaxPriorityFeePerGas)
                        .await
                        .and_then(|r| r.into_priority_fee())
                        .unwrap_or(DEFAULT_PRIORITY_FEE_WEI),
                };
                Ok(FeeMarket {
                    next_base_fee: Some(base),
                    reference_fee: tip,
                    congestion,
                    observed_at: Instant::now(),
                })
            }
            // No base fee in history: the chain has not activated London.
            None => {
                let mut market = self.legacy_market(network).await?;
                market.congestion = congestion;
                Ok(market)
            }
        }
    }

    async fn legacy_market(&self, network: &str) -> Result<FeeMarket, AppError> {
        let gas_price = self
            .pool
            .execute(network, RpcRequest::GasPrice)
            .await?
            .into_gas_price()?;
        Ok(FeeMarket {
            next_base_fee: None,
            reference_fee: gas_price,
            congestion: 0.0,
            observed_at: Instant::now(),
        })
    }

    async fn fee_history(&self, network: &str, blocks: u64) -> Result<FeeHistory, AppError> {
        let pool = &self.pool;
        retry_transient(
            move |_| async move {
                pool.execute(
                    network,
                    RpcRequest::FeeHistory {
                        block_count: blocks,
                        reward_percentiles: FEE_HISTORY_PERCENTILES.to_vec(),
                    },
                )
                .await?
                .into_fee_history()
            },
            3,
            Duration::from_millis(100),
        )
        .await
    }

    /// Caller's limit wins; otherwise a padded `eth_estimateGas`, or a static fallback.
    pub async fn gas_limit(
        &self,
        network: &str,
        tx: &TransactionRequest,
        settings: &GasSettings,
    ) -> u64 {
        if let Some(limit) = tx.gas {
            return limit;
        }
        let mut probe = tx.clone();
        probe.max_fee_per_gas = None;
        probe.max_priority_fee_per_gas = None;
        probe.gas_price = None;
        match self
            .pool
            .execute(network, RpcRequest::EstimateGas(Box::new(probe)))
            .await
            .and_then(|r| r.into_gas_estimate())
        {
            Ok(estimate) => {
                let padded = (estimate as u128)
                    .saturating_mul((BPS_DENOMINATOR + settings.gas_limit_margin_bps) as u128)
                    .div_ceil(BPS_DENOMINATOR as u128);
                u64::try_from(padded).unwrap_or(u64::MAX)
            }
            Err(e) => {
                let empty = tx.input.input().is_none_or(|data| data.is_empty());
                let fallback = if empty {
                    TRANSFER_GAS_LIMIT
                } else {
                    settings.fallback_gas_limit
                };
                tracing::warn!(
                    target: "gas",
                    network,
                    error = %e,
                    fallback,
                    "eth_estimateGas failed; using fallback gas limit"
                );
                fallback
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::constants::GWEI;
    use crate::network::pool::{NetworkConfig, PoolSettings};
    use crate::network::provider::Connector;
    use crate::network::rpc::{RpcResponse, RpcTransport};
    use alloy::primitives::Bytes;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MarketTransport {
        history: FeeHistory,
        gas_price: u128,
        estimate: Option<u64>,
        fee_history_up: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RpcTransport for MarketTransport {
        async fn call(&self, request: RpcRequest) -> Result<RpcResponse, AppError> {
            match request {
                RpcRequest::ChainId => Ok(RpcResponse::ChainId(1)),
                RpcRequest::BlockNumber => Ok(RpcResponse::BlockNumber(1)),
                RpcRequest::FeeHistory { .. } if self.fee_history_up.load(Ordering::SeqCst) => {
                    Ok(RpcResponse::FeeHistory(Box::new(self.history.clone())))
                }
                RpcRequest::FeeHistory { .. } => Err(AppError::Connection("fee history down".into())),
                RpcRequest::GasPrice => Ok(RpcResponse::GasPrice(self.gas_price)),
                RpcRequest::MaxPriorityFeePerGas => Ok(RpcResponse::MaxPriorityFeePerGas(GWEI)),
                RpcRequest::EstimateGas(_) => match self.estimate {
                    Some(gas) => Ok(RpcResponse::GasEstimate(gas)),
                    None => Err(AppError::Rpc {
                        code: 3,
                        message: "execution reverted".into(),
                    }),
                },
                other => Err(AppError::Rpc {
                    code: -32601,
                    message: other.method().into(),
                }),
            }
        }
    }

    struct MarketConnector(Arc<MarketTransport>);

    #[async_trait]
    impl Connector for MarketConnector {
        async fn connect(&self, _: &str) -> Result<Arc<dyn RpcTransport>, AppError> {
            Ok(self.0.clone())
        }
    }

    fn history(ratio: f64) -> FeeHistory {
        FeeHistory {
            oldest_block: 100,
            base_fee_per_gas: vec![10 * GWEI, 10 * GWEI, 10 * GWEI],
            gas_used_ratio: vec![ratio, ratio],
            reward: Some(vec![
                vec![GWEI, 2 * GWEI, 5 * GWEI],
                vec![GWEI, 2 * GWEI, 5 * GWEI],
            ]),
            ..Default::default()
        }
    }

    async fn optimizer(
        transport: MarketTransport,
        gas: GasSettings,
    ) -> (GasOptimizer, Arc<ConnectionPool>) {
        let mut cfg = NetworkConfig::new("mainnet", 1, vec!["http://node".into()]);
        cfg.min_connections = 1;
        cfg.max_connections = 2;
        cfg.gas = gas;
        let pool = ConnectionPool::initialize(
            vec![cfg],
            PoolSettings::default(),
            Arc::new(MarketConnector(Arc::new(transport))),
            EventBus::default(),
        )
        .await
        .expect("pool");
        (GasOptimizer::new(pool.clone(), EventBus::default()), pool)
    }

    fn transport(ratio: f64) -> MarketTransport {
        MarketTransport {
            history: history(ratio),
            gas_price: 20 * GWEI,
            estimate: Some(100_000),
            fee_history_up: Arc::new(AtomicBool::new(true)),
        }
    }

    #[tokio::test]
    async fn standard_uses_median_tip_and_base_fee_headroom() {
        let (gas, pool) = optimizer(transport(0.5), GasSettings::default()).await;
        let quote = gas
            .estimate_gas("mainnet", &TransactionRequest::default(), GasStrategy::Standard)
            .await
            .unwrap();
        assert_eq!(quote.source, FeeSource::Live);
        assert_eq!(quote.priority_fee(), Some(2 * GWEI));
        assert_eq!(quote.fee_cap(), 2 * 10 * GWEI + 2 * GWEI);
        assert_eq!(quote.gas_limit, 120_000);
        assert!((quote.congestion - 0.5).abs() < 1e-9);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn strategies_order_by_premium() {
        let (gas, pool) = optimizer(transport(0.5), GasSettings::default()).await;
        let tx = TransactionRequest::default();
        let standard = gas.estimate_gas("mainnet", &tx, GasStrategy::Standard).await.unwrap();
        let adaptive = gas.estimate_gas("mainnet", &tx, GasStrategy::Adaptive).await.unwrap();
        let fast = gas.estimate_gas("mainnet", &tx, GasStrategy::Fast).await.unwrap();
        // Adaptive at 50% congestion sits halfway to 2x.
        assert_eq!(adaptive.priority_fee(), Some(3 * GWEI));
        assert_eq!(fast.priority_fee(), Some(3 * GWEI));
        assert!(standard.priority_fee() < adaptive.priority_fee());
        pool.shutdown().await;
    }

    #[test]
    fn adaptive_multiplier_is_monotonic_in_congestion() {
        let settings = GasSettings::default();
        let mut last = 0;
        for step in 0..=10 {
            let bps = settings.multiplier_bps(GasStrategy::Adaptive, step as f64 / 10.0);
            assert!(bps >= last);
            last = bps;
        }
        assert_eq!(settings.multiplier_bps(GasStrategy::Adaptive, 0.0), 10_000);
        assert_eq!(settings.multiplier_bps(GasStrategy::Adaptive, 7.0), 20_000);
    }

    #[tokio::test]
    async fn fees_are_clamped_to_network_bounds() {
        let settings = GasSettings {
            min_fee: 3 * GWEI,
            max_fee: 15 * GWEI,
            ..GasSettings::default()
        };
        let (gas, pool) = optimizer(transport(0.0), settings).await;
        let quote = gas
            .estimate_gas("mainnet", &TransactionRequest::default(), GasStrategy::Standard)
            .await
            .unwrap();
        assert_eq!(quote.priority_fee(), Some(3 * GWEI));
        assert_eq!(quote.fee_cap(), 15 * GWEI);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn legacy_network_uses_gas_price() {
        let settings = GasSettings {
            eip1559: false,
            ..GasSettings::default()
        };
        let (gas, pool) = optimizer(transport(0.9), settings).await;
        let quote = gas
            .estimate_gas("mainnet", &TransactionRequest::default(), GasStrategy::Fast)
            .await
            .unwrap();
        assert_eq!(quote.pricing, FeePricing::Legacy { gas_price: 30 * GWEI });
        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn outage_falls_back_to_cache_then_floor() {
        let t = transport(0.5);
        let up = t.fee_history_up.clone();
        let settings = GasSettings {
            fee_cache_ttl: Duration::from_secs(10),
            ..GasSettings::default()
        };
        let (gas, pool) = optimizer(t, settings.clone()).await;
        let tx = TransactionRequest::default();
        let live = gas.estimate_gas("mainnet", &tx, GasStrategy::Standard).await.unwrap();

        up.store(false, Ordering::SeqCst);
        let cached = gas.estimate_gas("mainnet", &tx, GasStrategy::Standard).await.unwrap();
        assert_eq!(cached.source, FeeSource::Cached);
        assert_eq!(cached.pricing, live.pricing);

        tokio::time::advance(Duration::from_secs(11)).await;
        let floor = gas.estimate_gas("mainnet", &tx, GasStrategy::Standard).await.unwrap();
        assert_eq!(floor.source, FeeSource::Floor);
        assert_eq!(floor.fee_cap(), settings.min_fee);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn gas_limit_prefers_caller_then_estimate_then_fallback() {
        let mut t = transport(0.5);
        t.estimate = None;
        let (gas, pool) = optimizer(t, GasSettings::default()).await;
        let settings = GasSettings::default();

        let mut tx = TransactionRequest::default();
        tx.gas = Some(42_000);
        assert_eq!(gas.gas_limit("mainnet", &tx, &settings).await, 42_000);

        let transfer = TransactionRequest::default();
        assert_eq!(
            gas.gas_limit("mainnet", &transfer, &settings).await,
            TRANSFER_GAS_LIMIT
        );

        let call = TransactionRequest::default().input(Bytes::from(vec![0xa9, 0x05]).into());
        assert_eq!(
            gas.gas_limit("mainnet", &call, &settings).await,
            settings.fallback_gas_limit
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_network_is_an_error() {
        let (gas, pool) = optimizer(transport(0.5), GasSettings::default()).await;
        let res = gas
            .estimate_gas("nowhere", &TransactionRequest::default(), GasStrategy::Standard)
            .await;
        assert!(matches!(res, Err(AppError::UnknownNetwork(_))));
        pool.shutdown().await;
    }

    #[test]
    fn bump_is_strictly_greater_and_rounds_up() {
        let quote = GasQuote {
            gas_limit: 21_000,
            pricing: FeePricing::Eip1559 {
                max_fee_per_gas: 101,
                max_priority_fee_per_gas: 1,
            },
            strategy: GasStrategy::Standard,
            congestion: 0.0,
            source: FeeSource::Live,
            quoted_at: Instant::now(),
        };
        let bumped = quote.bumped(11_000);
        assert_eq!(
            bumped.pricing,
            FeePricing::Eip1559 {
                max_fee_per_gas: 112,
                max_priority_fee_per_gas: 2,
            }
        );
        assert_eq!(bumped.gas_limit, quote.gas_limit);
    }

    #[test]
    fn outbid_follows_a_rising_market() {
        let base = GasQuote {
            gas_limit: 21_000,
            pricing: FeePricing::Legacy { gas_price: 100 },
            strategy: GasStrategy::Fast,
            congestion: 0.1,
            source: FeeSource::Live,
            quoted_at: Instant::now(),
        };
        let market = GasQuote {
            pricing: FeePricing::Legacy { gas_price: 500 },
            congestion: 0.8,
            ..base.clone()
        };
        assert_eq!(base.outbid(&market, 11_000).fee_cap(), 500);
        let calm = GasQuote {
            pricing: FeePricing::Legacy { gas_price: 50 },
            ..base.clone()
        };
        assert_eq!(base.outbid(&calm, 11_000).fee_cap(), 110);
    }

    #[test]
    fn median_of_even_sample_rounds_down() {
        assert_eq!(median(&mut [4, 1, 3, 2]), Some(2));
        assert_eq!(median(&mut [5]), Some(5));
        assert_eq!(median(&mut []), None);
    }
}
