// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@oxidity.com>

//! Top-level owner of the connection pool, gas optimizer and retry manager.
//!
//! There is no process-wide state: every collaborator is built here and
//! handed to the next by `Arc`, and `shutdown` tears them down in reverse.

use crate::domain::constants::EVENT_CHANNEL_CAPACITY;
use crate::domain::error::AppError;
use crate::domain::events::{EngineEvent, EventBus};
use crate::domain::types::{GasStrategy, JobId};
use crate::network::gas::{GasOptimizer, GasQuote};
use crate::network::pool::{ConnectionPool, NetworkConfig, PoolSettings, PoolSnapshot, PoolStats};
use crate::network::provider::Connector;
use crate::network::signer::TransactionSigner;
use crate::services::metrics::EngineStats;
use crate::services::retry::{
    ExecutionError, ExecutionOutcome, JobHandle, JobStatus, RetryManager, RetryPolicy, TxPayload,
};
use alloy::primitives::{Address, B256};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub networks: Vec<NetworkConfig>,
    pub pool: PoolSettings,
    pub event_capacity: usize,
}

impl EngineConfig {
    pub fn new(networks: Vec<NetworkConfig>) -> Self {
        Self {
            networks,
            pool: PoolSettings::default(),
            event_capacity: EVENT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }
}

pub struct Engine {
    pool: Arc<ConnectionPool>,
    gas: Arc<GasOptimizer>,
    retry: RetryManager,
    events: EventBus,
    stats: Arc<EngineStats>,
    signer_address: Option<Address>,
    started_at: Instant,
    stopping: CancellationToken,
    tasks: TaskTracker,
}

impl Engine {
    /// Build every collaborator and open the per-network pools.
    ///
    /// Fails if an essential network cannot reach its minimum size.
    pub async fn start(
        config: EngineConfig,
        connector: Arc<dyn Connector>,
        signer: Option<Arc<dyn TransactionSigner>>,
    ) -> Result<Arc<Self>, AppError> {
        if config.networks.is_empty() {
            return Err(AppError::Config("no networks configured".into()));
        }
        let events = EventBus::new(config.event_capacity);
        let stats = Arc::new(EngineStats::default());
        let stopping = CancellationToken::new();
        let tasks = TaskTracker::new();

        // Subscribe before the pool opens so connection events are counted.
        tasks.spawn(feed_stats(events.subscribe(), stats.clone(), stopping.clone()));

        let network_names: Vec<String> = config.networks.iter().map(|n| n.name.clone()).collect();
        let pool = match ConnectionPool::initialize(
            config.networks,
            config.pool,
            connector,
            events.clone(),
        )
        .await
        {
            Ok(pool) => pool,
            Err(e) => {
                stopping.cancel();
                tasks.close();
                tasks.wait().await;
                return Err(e);
            }
        };
        let gas = Arc::new(GasOptimizer::new(pool.clone(), events.clone()));
        let signer_address = signer.as_ref().map(|s| s.address());
        let retry = RetryManager::new(pool.clone(), gas.clone(), signer, events.clone());

        tracing::info!(
            target: "engine",
            networks = %network_names.join(","),
            signer = ?signer_address,
            "Engine started"
        );

        Ok(Arc::new(Self {
            pool,
            gas,
            retry,
            events,
            stats,
            signer_address,
            started_at: Instant::now(),
            stopping,
            tasks,
        }))
    }

    pub fn submit(
        &self,
        network: &str,
        payload: TxPayload,
        policy: RetryPolicy,
    ) -> Result<JobHandle, AppError> {
        let handle = self.retry.submit(network, payload, policy)?;
        self.stats.record_submission();
        Ok(handle)
    }

    pub async fn execute_with_retry(
        &self,
        network: &str,
        payload: TxPayload,
        policy: RetryPolicy,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        match self.submit(network, payload, policy) {
            Ok(handle) => handle.wait().await,
            Err(e) => Err(ExecutionError::rejected(network, &e)),
        }
    }

    pub fn get_transaction_status(&self, id: JobId) -> Option<JobStatus> {
        self.retry.get_transaction_status(id)
    }

    pub fn cancel(&self, id: JobId) -> bool {
        self.retry.cancel(id)
    }

    pub fn job_for_hash(&self, hash: &B256) -> Option<JobId> {
        self.retry.job_for_hash(hash)
    }

    /// Stats for one network, or aggregated over all of them.
    pub fn get_pool_stats(&self, network: Option<&str>) -> Result<PoolStats, AppError> {
        self.pool.stats(network)
    }

    pub fn pool_snapshot(&self, network: &str) -> Result<PoolSnapshot, AppError> {
        self.pool.snapshot(network)
    }

    pub async fn estimate_gas(
        &self,
        network: &str,
        payload: &TxPayload,
        strategy: GasStrategy,
    ) -> Result<GasQuote, AppError> {
        let chain_id = self.pool.network(network)?.config().chain_id;
        let mut draft = payload.to_request(chain_id);
        if draft.from.is_none() {
            draft.from = self.signer_address;
        }
        self.gas.estimate_gas(network, &draft, strategy).await
    }

    pub fn networks(&self) -> Vec<String> {
        self.pool.networks()
    }

    pub fn active_jobs(&self) -> usize {
        self.retry.active_jobs()
    }

    pub fn signer_address(&self) -> Option<Address> {
        self.signer_address
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Abort live jobs, then close every pool.
    pub async fn shutdown(&self) {
        if self.stopping.is_cancelled() {
            return;
        }
        tracing::info!(target: "engine", active = self.retry.active_jobs(), "Engine shutting down");
        self.retry.shutdown().await;
        self.pool.shutdown().await;
        self.stopping.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::info!(target: "engine", "Engine stopped");
    }
}

async fn feed_stats(
    mut rx: broadcast::Receiver<EngineEvent>,
    stats: Arc<EngineStats>,
    stopping: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stopping.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => stats.observe(&event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(target: "engine", skipped, "Stats feed lagged behind the event bus");
            }
            Err(RecvError::Closed) => break,
        }
    }
    // Drain what is already buffered so final counts are complete.
    while let Ok(event) = rx.try_recv() {
        stats.observe(&event);
    }
}
