// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Multi-network RPC connection pool.
//!
//! Each network owns a bounded set of live connections guarded by one mutex.
//! The lock is never held across an `.await`: connection creation reserves a
//! slot under the lock, opens the transport unlocked, then re-locks to insert.
//! Health probes and idle sweeps run on their own tasks and only take the lock
//! to read targets and to apply removals.

use crate::domain::constants::{
    DEFAULT_ACQUIRE_RETRIES, DEFAULT_ACQUIRE_RETRY_DELAY_MS, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_HEALTH_CHECK_INTERVAL_MS, DEFAULT_HEALTH_CHECK_TIMEOUT_MS, DEFAULT_IDLE_SWEEP_INTERVAL_MS,
    DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_MAX_CONNECTIONS, DEFAULT_MIN_CONNECTIONS,
    DEFAULT_REQUEST_TIMEOUT_MS,
};
use crate::domain::error::AppError;
use crate::domain::events::{EngineEvent, EventBus, RemovalReason};
use crate::domain::types::ConnectionId;
use crate::network::gas::GasSettings;
use crate::network::provider::Connector;
use crate::network::rpc::{RpcRequest, RpcResponse, RpcTransport};
use dashmap::DashMap;
use futures::future::join_all;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, sleep, timeout};
use tokio_util::sync::CancellationToken;

/// Consecutive transport failures after which a connection is evicted without
/// waiting for the next health probe.
const MAX_CONSECUTIVE_TRANSPORT_ERRORS: u32 = 3;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastConnections,
    Random,
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub name: String,
    pub chain_id: u64,
    pub endpoints: Vec<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub health_check_timeout: Duration,
    pub min_connections: usize,
    pub max_connections: usize,
    /// Initialization fails when an essential network ends up with no connection.
    pub essential: bool,
    pub gas: GasSettings,
}

impl NetworkConfig {
    pub fn new(name: impl Into<String>, chain_id: u64, endpoints: Vec<String>) -> Self {
        Self {
            name: name.into(),
            chain_id,
            endpoints,
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            health_check_timeout: Duration::from_millis(DEFAULT_HEALTH_CHECK_TIMEOUT_MS),
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            essential: true,
            gas: GasSettings::default(),
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |field: &str, message: &str| AppError::Validation {
            field: format!("networks.{}.{}", self.name, field),
            message: message.to_string(),
        };
        if self.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(invalid("endpoints", "at least one endpoint is required"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections", "must be greater than zero"));
        }
        if self.min_connections > self.max_connections {
            return Err(invalid(
                "min_connections",
                "must not exceed max_connections",
            ));
        }
        self.gas
            .validate()
            .map_err(|message| invalid("gas", &message))?;
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub load_balancing: LoadBalancing,
    pub health_check_interval: Duration,
    pub idle_timeout: Duration,
    pub idle_sweep_interval: Duration,
    pub acquire_retries: u32,
    pub acquire_retry_delay: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            load_balancing: LoadBalancing::RoundRobin,
            health_check_interval: Duration::from_millis(DEFAULT_HEALTH_CHECK_INTERVAL_MS),
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            idle_sweep_interval: Duration::from_millis(DEFAULT_IDLE_SWEEP_INTERVAL_MS),
            acquire_retries: DEFAULT_ACQUIRE_RETRIES,
            acquire_retry_delay: Duration::from_millis(DEFAULT_ACQUIRE_RETRY_DELAY_MS),
        }
    }
}

struct Connection {
    id: ConnectionId,
    endpoint: String,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
    healthy: bool,
    request_count: u64,
    error_count: u64,
    consecutive_transport_errors: u32,
    total_latency: Duration,
    transport: Arc<dyn RpcTransport>,
}

/// Read-only view of a pooled connection.
#[derive(Clone, Debug, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub network: String,
    pub endpoint: String,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub in_use: bool,
    pub healthy: bool,
    pub request_count: u64,
    pub error_count: u64,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PoolSnapshot {
    pub connections: Vec<ConnectionInfo>,
    pub available: Vec<ConnectionId>,
    pub busy: Vec<ConnectionId>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub size: usize,
    pub available: usize,
    pub busy: usize,
    pub total_requests: u64,
    pub total_failures: u64,
    pub success_rate: f64,
    pub average_latency_ms: f64,
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<ConnectionId, Connection>,
    /// Creation order; round-robin rotates over it.
    order: Vec<ConnectionId>,
    available: Vec<ConnectionId>,
    /// Busy connection -> lease sequence of its current holder.
    busy: HashMap<ConnectionId, u64>,
    rr_cursor: usize,
    endpoint_cursor: usize,
    pending_creates: usize,
    total_requests: u64,
    total_failures: u64,
    total_latency: Duration,
}

impl PoolState {
    fn size(&self) -> usize {
        self.connections.len() + self.pending_creates
    }

    fn select(&mut self, policy: LoadBalancing) -> Option<ConnectionId> {
        if self.available.is_empty() {
            return None;
        }
        match policy {
            LoadBalancing::RoundRobin => {
                let n = self.order.len();
                for step in 0..n {
                    let idx = (self.rr_cursor + step) % n;
                    let id = self.order[idx];
                    if self.available.contains(&id) {
                        self.rr_cursor = (idx + 1) % n;
                        return Some(id);
                    }
                }
                None
            }
            LoadBalancing::LeastConnections => {
                let order = &self.order;
                let connections = &self.connections;
                self.available.iter().copied().min_by_key(|id| {
                    let requests = connections.get(id).map(|c| c.request_count).unwrap_or(u64::MAX);
                    let position = order.iter().position(|o| o == id).unwrap_or(usize::MAX);
                    (requests, position)
                })
            }
            LoadBalancing::Random => {
                let idx = rand::thread_rng().gen_range(0..self.available.len());
                Some(self.available[idx])
            }
        }
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        self.available.retain(|c| *c != id);
        self.busy.remove(&id);
        if let Some(pos) = self.order.iter().position(|c| *c == id) {
            self.order.remove(pos);
            if self.rr_cursor > pos {
                self.rr_cursor -= 1;
            }
            if self.rr_cursor >= self.order.len() {
                self.rr_cursor = 0;
            }
        }
        self.connections.remove(&id)
    }
}

enum Take {
    Leased(ConnectionLease),
    Grow(String),
    Full,
}

/// Connections of one network.
pub struct NetworkPool {
    config: NetworkConfig,
    load_balancing: LoadBalancing,
    acquire_retries: u32,
    acquire_retry_delay: Duration,
    state: Mutex<PoolState>,
    released: Notify,
    lease_seq: AtomicU64,
    closed: AtomicBool,
    connector: Arc<dyn Connector>,
    owners: Arc<DashMap<ConnectionId, String>>,
    events: EventBus,
}

impl NetworkPool {
    fn new(
        config: NetworkConfig,
        settings: &PoolSettings,
        connector: Arc<dyn Connector>,
        owners: Arc<DashMap<ConnectionId, String>>,
        events: EventBus,
    ) -> Self {
        Self {
            config,
            load_balancing: settings.load_balancing,
            acquire_retries: settings.acquire_retries,
            acquire_retry_delay: settings.acquire_retry_delay,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
            lease_seq: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            connector,
            owners,
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Reserve a creation slot if the pool has headroom. Caller holds the lock.
    fn reserve_slot(&self, state: &mut PoolState) -> Option<String> {
        if state.size() >= self.config.max_connections || self.config.endpoints.is_empty() {
            return None;
        }
        let endpoint = self.config.endpoints[state.endpoint_cursor % self.config.endpoints.len()]
            .trim()
            .to_string();
        state.endpoint_cursor = state.endpoint_cursor.wrapping_add(1);
        state.pending_creates += 1;
        Some(endpoint)
    }

    async fn open_transport(&self, endpoint: &str) -> Result<Arc<dyn RpcTransport>, AppError> {
        let started = Instant::now();
        let open = async {
            let transport = self.connector.connect(endpoint).await?;
            let chain_id = transport.call(RpcRequest::ChainId).await?.into_chain_id()?;
            if chain_id != self.config.chain_id {
                return Err(AppError::Config(format!(
                    "endpoint {endpoint} reports chain {chain_id}, expected {}",
                    self.config.chain_id
                )));
            }
            Ok(transport)
        };
        match timeout(self.config.connect_timeout, open).await {
            Ok(res) => res,
            Err(_) => Err(AppError::Timeout {
                operation: format!("connect {endpoint}"),
                elapsed: started.elapsed(),
            }),
        }
    }

    /// Open a connection into a reserved slot. Busy connections are handed to the caller.
    async fn open_reserved(
        self: &Arc<Self>,
        endpoint: String,
        as_busy: bool,
    ) -> Result<Option<ConnectionLease>, AppError> {
        let opened = self.open_transport(&endpoint).await;
        let mut state = self.state();
        state.pending_creates = state.pending_creates.saturating_sub(1);
        let transport = match opened {
            Ok(t) => t,
            Err(e) => {
                drop(state);
                tracing::warn!(
                    target: "pool",
                    network = %self.config.name,
                    endpoint = %endpoint,
                    error = %e,
                    "Failed to open RPC connection"
                );
                return Err(e);
            }
        };
        if self.closed.load(Ordering::Acquire) {
            return Err(AppError::Shutdown);
        }

        let id = ConnectionId::next();
        let now = Instant::now();
        state.connections.insert(
            id,
            Connection {
                id,
                endpoint: endpoint.clone(),
                created_at: now,
                last_used: now,
                in_use: as_busy,
                healthy: true,
                request_count: 0,
                error_count: 0,
                consecutive_transport_errors: 0,
                total_latency: Duration::ZERO,
                transport: transport.clone(),
            },
        );
        state.order.push(id);
        let lease = if as_busy {
            let seq = self.lease_seq.fetch_add(1, Ordering::Relaxed);
            state.busy.insert(id, seq);
            Some(ConnectionLease {
                pool: self.clone(),
                id,
                seq,
                endpoint: endpoint.clone(),
                transport,
                released: false,
            })
        } else {
            state.available.push(id);
            None
        };
        let size = state.connections.len();
        drop(state);

        self.owners.insert(id, self.config.name.clone());
        tracing::debug!(
            target: "pool",
            network = %self.config.name,
            connection = %id,
            endpoint = %endpoint,
            size,
            "RPC connection created"
        );
        self.events.emit(EngineEvent::ConnectionCreated {
            network: self.config.name.clone(),
            id,
            endpoint,
        });
        Ok(lease)
    }

    fn deficit(&self) -> usize {
        let state = self.state();
        self.config.min_connections.saturating_sub(state.size())
    }

    /// Top the pool back up to its minimum, rotating through endpoints so a dead
    /// endpoint does not block the others. Returns the number of connections created.
    pub async fn replenish(self: &Arc<Self>) -> usize {
        let mut created = 0;
        let rounds = self.config.endpoints.len() + self.config.min_connections;
        for _ in 0..rounds {
            if self.closed.load(Ordering::Acquire) {
                break;
            }
            let endpoints: Vec<String> = {
                let mut state = self.state();
                let deficit = self.config.min_connections.saturating_sub(state.size());
                (0..deficit)
                    .filter_map(|_| self.reserve_slot(&mut state))
                    .collect()
            };
            if endpoints.is_empty() {
                break;
            }
            let results = join_all(
                endpoints
                    .into_iter()
                    .map(|endpoint| self.open_reserved(endpoint, false)),
            )
            .await;
            created += results.iter().filter(|r| r.is_ok()).count();
        }
        if self.deficit() > 0 {
            tracing::warn!(
                target: "pool",
                network = %self.config.name,
                missing = self.deficit(),
                "Pool below minimum after replenish"
            );
        }
        created
    }

    fn try_take(self: &Arc<Self>) -> Take {
        let mut state = self.state();
        if let Some(id) = state.select(self.load_balancing) {
            state.available.retain(|c| *c != id);
            let seq = self.lease_seq.fetch_add(1, Ordering::Relaxed);
            state.busy.insert(id, seq);
            if let Some(conn) = state.connections.get_mut(&id) {
                conn.in_use = true;
                conn.last_used = Instant::now();
                return Take::Leased(ConnectionLease {
                    pool: self.clone(),
                    id,
                    seq,
                    endpoint: conn.endpoint.clone(),
                    transport: conn.transport.clone(),
                    released: false,
                });
            }
            // Unreachable while `available ⊆ connections`; heal the bookkeeping.
            state.busy.remove(&id);
            return Take::Full;
        }
        match self.reserve_slot(&mut state) {
            Some(endpoint) => Take::Grow(endpoint),
            None => Take::Full,
        }
    }

    pub async fn acquire(self: &Arc<Self>) -> Result<ConnectionLease, AppError> {
        let attempts = self.acquire_retries.saturating_add(1);
        for attempt in 1..=attempts {
            if self.closed.load(Ordering::Acquire) {
                return Err(AppError::Shutdown);
            }
            let notified = self.released.notified();
            match self.try_take() {
                Take::Leased(lease) => return Ok(lease),
                Take::Grow(endpoint) => match self.open_reserved(endpoint, true).await {
                    Ok(Some(lease)) => return Ok(lease),
                    Ok(None) => {}
                    Err(AppError::Shutdown) => return Err(AppError::Shutdown),
                    Err(_) => {}
                },
                Take::Full => {}
            }
            if attempt == attempts {
                break;
            }
            tokio::select! {
                _ = notified => {}
                _ = sleep(self.acquire_retry_delay) => {}
            }
        }
        tracing::warn!(
            target: "pool",
            network = %self.config.name,
            attempts,
            "Connection pool exhausted"
        );
        Err(AppError::PoolExhausted {
            network: self.config.name.clone(),
            attempts,
        })
    }

    /// Return a busy connection. With `seq`, only the lease that took it may return it.
    fn release_inner(self: &Arc<Self>, id: ConnectionId, seq: Option<u64>) -> bool {
        let mut state = self.state();
        match (state.busy.get(&id).copied(), seq) {
            (None, _) => return false,
            (Some(held), Some(expected)) if held != expected => return false,
            _ => {}
        }
        state.busy.remove(&id);
        let healthy = match state.connections.get_mut(&id) {
            Some(conn) => {
                conn.in_use = false;
                conn.last_used = Instant::now();
                conn.healthy
            }
            None => return false,
        };
        let removed = if healthy {
            state.available.push(id);
            false
        } else {
            state.remove(id);
            true
        };
        drop(state);
        self.released.notify_one();

        if removed {
            self.on_removed(id, RemovalReason::Unhealthy);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let pool = self.clone();
                handle.spawn(async move {
                    pool.replenish().await;
                });
            }
        }
        true
    }

    pub fn release(self: &Arc<Self>, id: ConnectionId) -> bool {
        self.release_inner(id, None)
    }

    fn holds(&self, id: ConnectionId, seq: u64) -> bool {
        self.state().busy.get(&id) == Some(&seq)
    }

    fn on_removed(&self, id: ConnectionId, reason: RemovalReason) {
        self.owners.remove(&id);
        tracing::info!(
            target: "pool",
            network = %self.config.name,
            connection = %id,
            ?reason,
            "RPC connection removed"
        );
        self.events.emit(EngineEvent::ConnectionRemoved {
            network: self.config.name.clone(),
            id,
            reason,
        });
    }

    fn record(&self, id: ConnectionId, latency: Duration, result: &Result<RpcResponse, AppError>) {
        let mut state = self.state();
        state.total_requests += 1;
        state.total_latency += latency;
        if result.is_err() {
            state.total_failures += 1;
        }
        let mut evict = None;
        if let Some(conn) = state.connections.get_mut(&id) {
            conn.request_count += 1;
            conn.total_latency += latency;
            match result {
                Ok(_) => conn.consecutive_transport_errors = 0,
                Err(e) => {
                    conn.error_count += 1;
                    if matches!(e, AppError::Connection(_) | AppError::Timeout { .. }) {
                        conn.consecutive_transport_errors += 1;
                        if conn.consecutive_transport_errors >= MAX_CONSECUTIVE_TRANSPORT_ERRORS
                            && conn.healthy
                        {
                            conn.healthy = false;
                            evict = Some(e.to_string());
                        }
                    } else {
                        conn.consecutive_transport_errors = 0;
                    }
                }
            }
        }
        drop(state);
        if let Some(error) = evict {
            tracing::warn!(
                target: "pool",
                network = %self.config.name,
                connection = %id,
                %error,
                "Connection marked unhealthy after repeated transport errors"
            );
            self.events.emit(EngineEvent::ConnectionUnhealthy {
                network: self.config.name.clone(),
                id,
                error,
            });
        }
    }

    /// Mark a connection unhealthy; idle ones are removed now, busy ones on release.
    fn mark_unhealthy(&self, id: ConnectionId, error: String) -> bool {
        let mut state = self.state();
        let busy = state.busy.contains_key(&id);
        match state.connections.get_mut(&id) {
            Some(conn) => conn.healthy = false,
            None => return false,
        }
        let removed = if busy { false } else { state.remove(id).is_some() };
        drop(state);

        tracing::warn!(
            target: "pool",
            network = %self.config.name,
            connection = %id,
            %error,
            "Health probe failed"
        );
        self.events.emit(EngineEvent::ConnectionUnhealthy {
            network: self.config.name.clone(),
            id,
            error,
        });
        if removed {
            self.on_removed(id, RemovalReason::Unhealthy);
        }
        removed
    }

    /// Probe every healthy connection with `eth_blockNumber`, evict failures, refill.
    pub async fn health_check(self: &Arc<Self>) {
        let targets: Vec<(ConnectionId, Arc<dyn RpcTransport>)> = {
            let state = self.state();
            state
                .connections
                .values()
                .filter(|c| c.healthy)
                .map(|c| (c.id, c.transport.clone()))
                .collect()
        };
        let probe_timeout = self.config.health_check_timeout;
        let results = join_all(targets.into_iter().map(|(id, transport)| async move {
            let outcome = match timeout(probe_timeout, transport.call(RpcRequest::BlockNumber)).await
            {
                Ok(Ok(resp)) => resp.into_block_number().map(|_| ()),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(AppError::Timeout {
                    operation: "health probe".into(),
                    elapsed: probe_timeout,
                }),
            };
            (id, outcome)
        }))
        .await;

        for (id, outcome) in results {
            if let Err(e) = outcome {
                self.mark_unhealthy(id, e.to_string());
            }
        }
        if !self.closed.load(Ordering::Acquire) {
            self.replenish().await;
        }
    }

    /// Drop available connections idle beyond `idle_timeout`, oldest first, never below min.
    pub fn sweep_idle(&self, idle_timeout: Duration) -> usize {
        let mut state = self.state();
        let now = Instant::now();
        let mut idle: Vec<(Instant, ConnectionId)> = state
            .available
            .iter()
            .filter_map(|id| state.connections.get(id))
            .filter(|c| now.duration_since(c.last_used) > idle_timeout)
            .map(|c| (c.last_used, c.id))
            .collect();
        idle.sort();
        let mut removed = Vec::new();
        for (_, id) in idle {
            if state.connections.len() <= self.config.min_connections {
                break;
            }
            if state.remove(id).is_some() {
                removed.push(id);
            }
        }
        drop(state);
        for id in &removed {
            self.on_removed(*id, RemovalReason::Idle);
        }
        removed.len()
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        let success_rate = if state.total_requests == 0 {
            1.0
        } else {
            (state.total_requests - state.total_failures) as f64 / state.total_requests as f64
        };
        let average_latency_ms = if state.total_requests == 0 {
            0.0
        } else {
            state.total_latency.as_secs_f64() * 1000.0 / state.total_requests as f64
        };
        PoolStats {
            size: state.connections.len(),
            available: state.available.len(),
            busy: state.busy.len(),
            total_requests: state.total_requests,
            total_failures: state.total_failures,
            success_rate,
            average_latency_ms,
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state();
        let now = Instant::now();
        let connections = state
            .order
            .iter()
            .filter_map(|id| state.connections.get(id))
            .map(|c| ConnectionInfo {
                id: c.id,
                network: self.config.name.clone(),
                endpoint: c.endpoint.clone(),
                age_ms: now.duration_since(c.created_at).as_millis() as u64,
                idle_ms: now.duration_since(c.last_used).as_millis() as u64,
                in_use: c.in_use,
                healthy: c.healthy,
                request_count: c.request_count,
                error_count: c.error_count,
            })
            .collect();
        let mut busy: Vec<ConnectionId> = state.busy.keys().copied().collect();
        busy.sort();
        PoolSnapshot {
            connections,
            available: state.available.clone(),
            busy,
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let removed: Vec<ConnectionId> = {
            let mut state = self.state();
            let ids: Vec<ConnectionId> = state.order.clone();
            for id in &ids {
                state.remove(*id);
            }
            ids
        };
        for id in removed {
            self.on_removed(id, RemovalReason::Shutdown);
        }
        self.released.notify_waiters();
    }
}

/// Exclusive hold on one connection. Returned to the pool on drop.
///
/// A lease whose connection was taken back with [`ConnectionPool::release`]
/// is revoked: further calls fail without touching the transport.
pub struct ConnectionLease {
    pool: Arc<NetworkPool>,
    id: ConnectionId,
    seq: u64,
    endpoint: String,
    transport: Arc<dyn RpcTransport>,
    released: bool,
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("network", &self.pool.name())
            .field("id", &self.id)
            .field("seq", &self.seq)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl ConnectionLease {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn network(&self) -> &str {
        self.pool.name()
    }

    /// Perform one call under the network's request timeout, recording latency and outcome.
    pub async fn call(&self, request: RpcRequest) -> Result<RpcResponse, AppError> {
        if !self.pool.holds(self.id, self.seq) {
            return Err(AppError::Connection(format!(
                "lease on connection {} was revoked",
                self.id
            )));
        }
        let method = request.method();
        let started = Instant::now();
        let result = match timeout(
            self.pool.config.request_timeout,
            self.transport.call(request),
        )
        .await
        {
            Ok(res) => res,
            Err(_) => Err(AppError::Timeout {
                operation: method.to_string(),
                elapsed: started.elapsed(),
            }),
        };
        self.pool.record(self.id, started.elapsed(), &result);
        if let Err(e) = &result {
            tracing::debug!(
                target: "pool",
                network = %self.pool.name(),
                connection = %self.id,
                method,
                error = %e,
                "RPC call failed"
            );
        }
        result
    }

    pub fn release(mut self) {
        self.released = true;
        self.pool.release_inner(self.id, Some(self.seq));
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if !self.released {
            self.pool.release_inner(self.id, Some(self.seq));
        }
    }
}

/// Owner of every network's pool plus the background health and idle tasks.
pub struct ConnectionPool {
    pools: HashMap<String, Arc<NetworkPool>>,
    owners: Arc<DashMap<ConnectionId, String>>,
    settings: PoolSettings,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Build every network's pool up to its minimum and start background maintenance.
    pub async fn initialize(
        configs: Vec<NetworkConfig>,
        settings: PoolSettings,
        connector: Arc<dyn Connector>,
        events: EventBus,
    ) -> Result<Arc<Self>, AppError> {
        if configs.is_empty() {
            return Err(AppError::Config("no networks configured".into()));
        }
        let owners = Arc::new(DashMap::new());
        let mut pools = HashMap::new();
        for config in configs {
            config.validate()?;
            if pools.contains_key(&config.name) {
                return Err(AppError::Config(format!(
                    "network {} configured twice",
                    config.name
                )));
            }
            let name = config.name.clone();
            let pool = Arc::new(NetworkPool::new(
                config,
                &settings,
                connector.clone(),
                owners.clone(),
                events.clone(),
            ));
            pools.insert(name, pool);
        }

        let fills = join_all(pools.values().map(|pool| async move {
            let created = pool.replenish().await;
            (pool.clone(), created)
        }))
        .await;
        for (pool, created) in fills {
            let size = pool.stats().size;
            tracing::info!(
                target: "pool",
                network = %pool.name(),
                chain_id = pool.config.chain_id,
                created,
                size,
                min = pool.config.min_connections,
                max = pool.config.max_connections,
                "Network pool initialized"
            );
            if size == 0 && pool.config.essential {
                for p in pools.values() {
                    p.close();
                }
                return Err(AppError::Initialization(format!(
                    "no reachable endpoint for essential network {}",
                    pool.name()
                )));
            }
        }

        let this = Arc::new(Self {
            pools,
            owners,
            settings,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        });
        this.spawn_maintenance();
        Ok(this)
    }

    fn spawn_maintenance(&self) {
        let mut handles = Vec::new();
        for pool in self.pools.values() {
            let pool = pool.clone();
            let token = self.shutdown.clone();
            let every = self.settings.health_check_interval;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => pool.health_check().await,
                    }
                }
                tracing::debug!(target: "pool", network = %pool.name(), "Health monitor stopped");
            }));
        }

        let pools: Vec<Arc<NetworkPool>> = self.pools.values().cloned().collect();
        let token = self.shutdown.clone();
        let every = self.settings.idle_sweep_interval;
        let idle_timeout = self.settings.idle_timeout;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        for pool in &pools {
                            pool.sweep_idle(idle_timeout);
                        }
                    }
                }
            }
        }));

        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend(handles);
    }

    pub fn network(&self, network: &str) -> Result<&Arc<NetworkPool>, AppError> {
        self.pools
            .get(network)
            .ok_or_else(|| AppError::UnknownNetwork(network.to_string()))
    }

    pub fn networks(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn acquire(&self, network: &str) -> Result<ConnectionLease, AppError> {
        if self.shutdown.is_cancelled() {
            return Err(AppError::Shutdown);
        }
        self.network(network)?.acquire().await
    }

    /// Return a connection by id regardless of which lease holds it.
    /// The current lease is revoked and its later calls are refused.
    pub fn release(&self, id: ConnectionId) -> bool {
        let network = match self.owners.get(&id) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };
        match self.pools.get(&network) {
            Some(pool) => pool.release(id),
            None => false,
        }
    }

    /// acquire → call → record → release; the lease returns the connection even on error.
    pub async fn execute(
        &self,
        network: &str,
        request: RpcRequest,
    ) -> Result<RpcResponse, AppError> {
        let lease = self.acquire(network).await?;
        lease.call(request).await
    }

    /// Per-network stats, or the aggregate over every network when `network` is `None`.
    pub fn stats(&self, network: Option<&str>) -> Result<PoolStats, AppError> {
        if let Some(name) = network {
            return Ok(self.network(name)?.stats());
        }
        let mut total = PoolStats::default();
        let mut latency_weighted = 0.0;
        for pool in self.pools.values() {
            let s = pool.stats();
            total.size += s.size;
            total.available += s.available;
            total.busy += s.busy;
            total.total_requests += s.total_requests;
            total.total_failures += s.total_failures;
            latency_weighted += s.average_latency_ms * s.total_requests as f64;
        }
        if total.total_requests == 0 {
            total.success_rate = 1.0;
        } else {
            total.success_rate = (total.total_requests - total.total_failures) as f64
                / total.total_requests as f64;
            total.average_latency_ms = latency_weighted / total.total_requests as f64;
        }
        Ok(total)
    }

    pub fn snapshot(&self, network: &str) -> Result<PoolSnapshot, AppError> {
        Ok(self.network(network)?.snapshot())
    }

    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        for pool in self.pools.values() {
            pool.close();
        }
        tracing::info!(target: "pool", "Connection pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;

    struct StaticTransport {
        chain_id: u64,
        healthy: Arc<AtomicBool>,
    }

    #[async_trait]
    impl RpcTransport for StaticTransport {
        async fn call(&self, request: RpcRequest) -> Result<RpcResponse, AppError> {
            if !self.healthy.load(Ordering::SeqCst) {
                return Err(AppError::Connection("endpoint down".into()));
            }
            match request {
                RpcRequest::ChainId => Ok(RpcResponse::ChainId(self.chain_id)),
                RpcRequest::BlockNumber => Ok(RpcResponse::BlockNumber(100)),
                RpcRequest::GasPrice => Ok(RpcResponse::GasPrice(1)),
                other => Err(AppError::Rpc {
                    code: -32601,
                    message: format!("{} not scripted", other.method()),
                }),
            }
        }
    }

    struct TestConnector {
        chain_id: u64,
        opened: AtomicUsize,
        healthy: Arc<AtomicBool>,
        dead_endpoints: Vec<String>,
    }

    impl TestConnector {
        fn new(chain_id: u64) -> Self {
            Self {
                chain_id,
                opened: AtomicUsize::new(0),
                healthy: Arc::new(AtomicBool::new(true)),
                dead_endpoints: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl Connector for TestConnector {
        async fn connect(&self, endpoint: &str) -> Result<Arc<dyn RpcTransport>, AppError> {
            if self.dead_endpoints.iter().any(|d| d == endpoint) {
                return Err(AppError::Connection(format!("{endpoint} refused")));
            }
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(StaticTransport {
                chain_id: self.chain_id,
                healthy: self.healthy.clone(),
            }))
        }
    }

    fn config(min: usize, max: usize) -> NetworkConfig {
        let mut cfg = NetworkConfig::new("testnet", 1, vec!["http://a".into(), "http://b".into()]);
        cfg.min_connections = min;
        cfg.max_connections = max;
        cfg
    }

    fn fast_settings(policy: LoadBalancing) -> PoolSettings {
        PoolSettings {
            load_balancing: policy,
            acquire_retries: 2,
            acquire_retry_delay: Duration::from_millis(5),
            ..PoolSettings::default()
        }
    }

    fn assert_invariants(snapshot: &PoolSnapshot, min: usize, max: usize) {
        let size = snapshot.connections.len();
        assert!(size >= min && size <= max, "size {size} outside [{min}, {max}]");
        assert_eq!(snapshot.available.len() + snapshot.busy.len(), size);
        for id in &snapshot.available {
            assert!(!snapshot.busy.contains(id), "{id} both available and busy");
        }
    }

    #[tokio::test]
    async fn initialize_fills_to_minimum() {
        let connector = Arc::new(TestConnector::new(1));
        let pool = ConnectionPool::initialize(
            vec![config(3, 5)],
            fast_settings(LoadBalancing::RoundRobin),
            connector.clone(),
            EventBus::default(),
        )
        .await
        .expect("init");

        let snap = pool.snapshot("testnet").unwrap();
        assert_invariants(&snap, 3, 5);
        assert_eq!(connector.opened.load(Ordering::SeqCst), 3);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn initialize_skips_dead_endpoint() {
        let mut connector = TestConnector::new(1);
        connector.dead_endpoints = vec!["http://a".into()];
        let pool = ConnectionPool::initialize(
            vec![config(2, 4)],
            fast_settings(LoadBalancing::RoundRobin),
            Arc::new(connector),
            EventBus::default(),
        )
        .await
        .expect("init survives one dead endpoint");

        let snap = pool.snapshot("testnet").unwrap();
        assert_eq!(snap.connections.len(), 2);
        assert!(snap.connections.iter().all(|c| c.endpoint == "http://b"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn wrong_chain_id_fails_essential_network() {
        let res = ConnectionPool::initialize(
            vec![config(1, 1)],
            fast_settings(LoadBalancing::RoundRobin),
            Arc::new(TestConnector::new(5)),
            EventBus::default(),
        )
        .await;
        assert!(matches!(res, Err(AppError::Initialization(_))));
    }

    #[tokio::test]
    async fn round_robin_visits_each_connection_once() {
        let pool = ConnectionPool::initialize(
            vec![config(4, 4)],
            fast_settings(LoadBalancing::RoundRobin),
            Arc::new(TestConnector::new(1)),
            EventBus::default(),
        )
        .await
        .unwrap();

        let mut seen = HashSet::new();
        for _ in 0..4 {
            let lease = pool.acquire("testnet").await.unwrap();
            assert!(seen.insert(lease.id()));
            lease.release();
        }
        assert_eq!(seen.len(), 4);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn least_connections_prefers_idle_history() {
        let pool = ConnectionPool::initialize(
            vec![config(2, 2)],
            fast_settings(LoadBalancing::LeastConnections),
            Arc::new(TestConnector::new(1)),
            EventBus::default(),
        )
        .await
        .unwrap();

        let first = pool.acquire("testnet").await.unwrap();
        let busy_id = first.id();
        first.call(RpcRequest::BlockNumber).await.unwrap();
        first.call(RpcRequest::BlockNumber).await.unwrap();
        drop(first);

        let next = pool.acquire("testnet").await.unwrap();
        assert_ne!(next.id(), busy_id);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn acquire_grows_on_demand_up_to_max() {
        let connector = Arc::new(TestConnector::new(1));
        let pool = ConnectionPool::initialize(
            vec![config(1, 2)],
            fast_settings(LoadBalancing::Random),
            connector.clone(),
            EventBus::default(),
        )
        .await
        .unwrap();

        let a = pool.acquire("testnet").await.unwrap();
        let b = pool.acquire("testnet").await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(connector.opened.load(Ordering::SeqCst), 2);
        assert_invariants(&pool.snapshot("testnet").unwrap(), 1, 2);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn exhausted_pool_reports_error_without_growing() {
        let connector = Arc::new(TestConnector::new(1));
        let pool = ConnectionPool::initialize(
            vec![config(1, 1)],
            fast_settings(LoadBalancing::RoundRobin),
            connector.clone(),
            EventBus::default(),
        )
        .await
        .unwrap();

        let held = pool.acquire("testnet").await.unwrap();
        let err = pool.acquire("testnet").await.unwrap_err();
        assert!(matches!(err, AppError::PoolExhausted { attempts: 3, .. }));
        assert_eq!(connector.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.snapshot("testnet").unwrap().connections.len(), 1);
        drop(held);

        assert!(pool.acquire("testnet").await.is_ok());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn waiting_acquire_wakes_on_release() {
        let mut cfg = config(1, 1);
        cfg.endpoints = vec!["http://a".into()];
        let settings = PoolSettings {
            acquire_retries: 1,
            acquire_retry_delay: Duration::from_secs(5),
            ..PoolSettings::default()
        };
        let pool = ConnectionPool::initialize(
            vec![cfg],
            settings,
            Arc::new(TestConnector::new(1)),
            EventBus::default(),
        )
        .await
        .unwrap();

        let held = pool.acquire("testnet").await.unwrap();
        let id = held.id();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("testnet").await.map(|l| l.id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.release(id));
        drop(held);
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .unwrap()
            .unwrap();
        assert_eq!(got, id);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn stale_lease_cannot_release_new_holder() {
        let pool = ConnectionPool::initialize(
            vec![config(1, 1)],
            fast_settings(LoadBalancing::RoundRobin),
            Arc::new(TestConnector::new(1)),
            EventBus::default(),
        )
        .await
        .unwrap();

        let stale = pool.acquire("testnet").await.unwrap();
        assert!(pool.release(stale.id()));
        let fresh = pool.acquire("testnet").await.unwrap();
        assert!(matches!(
            stale.call(RpcRequest::BlockNumber).await,
            Err(AppError::Connection(_))
        ));
        assert!(fresh.call(RpcRequest::BlockNumber).await.is_ok());
        drop(stale);
        let snap = pool.snapshot("testnet").unwrap();
        assert_eq!(snap.busy, vec![fresh.id()]);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn execute_records_failures_and_still_releases() {
        let pool = ConnectionPool::initialize(
            vec![config(1, 1)],
            fast_settings(LoadBalancing::RoundRobin),
            Arc::new(TestConnector::new(1)),
            EventBus::default(),
        )
        .await
        .unwrap();

        assert!(pool.execute("testnet", RpcRequest::GasPrice).await.is_ok());
        let err = pool
            .execute("testnet", RpcRequest::TransactionReceipt(Default::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Rpc { code: -32601, .. }));

        let stats = pool.stats(Some("testnet")).unwrap();
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.total_failures, 1);
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.available, 1);
        assert!((stats.success_rate - 0.5).abs() < f64::EPSILON);
        assert!(matches!(
            pool.execute("unknown", RpcRequest::GasPrice).await,
            Err(AppError::UnknownNetwork(_))
        ));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn health_check_evicts_and_replenishes() {
        let connector = Arc::new(TestConnector::new(1));
        let pool = ConnectionPool::initialize(
            vec![config(2, 3)],
            fast_settings(LoadBalancing::RoundRobin),
            connector.clone(),
            EventBus::default(),
        )
        .await
        .unwrap();
        let net = pool.network("testnet").unwrap().clone();
        let before: Vec<ConnectionId> = net.snapshot().connections.iter().map(|c| c.id).collect();

        connector.healthy.store(false, Ordering::SeqCst);
        net.health_check().await;
        assert_eq!(net.snapshot().connections.len(), 0);

        connector.healthy.store(true, Ordering::SeqCst);
        assert_eq!(net.replenish().await, 2);

        let after = net.snapshot();
        assert_invariants(&after, 2, 3);
        assert!(after.connections.iter().all(|c| !before.contains(&c.id)));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn busy_unhealthy_connection_is_removed_on_release() {
        let pool = ConnectionPool::initialize(
            vec![config(1, 2)],
            fast_settings(LoadBalancing::RoundRobin),
            Arc::new(TestConnector::new(1)),
            EventBus::default(),
        )
        .await
        .unwrap();
        let net = pool.network("testnet").unwrap().clone();

        let lease = pool.acquire("testnet").await.unwrap();
        let id = lease.id();
        assert!(!net.mark_unhealthy(id, "probe failed".into()));
        assert_eq!(net.snapshot().busy, vec![id]);
        drop(lease);
        assert!(net.snapshot().connections.iter().all(|c| c.id != id));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn idle_sweep_respects_minimum() {
        let pool = ConnectionPool::initialize(
            vec![config(1, 3)],
            fast_settings(LoadBalancing::RoundRobin),
            Arc::new(TestConnector::new(1)),
            EventBus::default(),
        )
        .await
        .unwrap();
        let a = pool.acquire("testnet").await.unwrap();
        let b = pool.acquire("testnet").await.unwrap();
        let c = pool.acquire("testnet").await.unwrap();
        drop((a, b, c));
        let net = pool.network("testnet").unwrap();
        assert_eq!(net.snapshot().connections.len(), 3);

        assert_eq!(net.sweep_idle(Duration::ZERO), 2);
        assert_eq!(net.snapshot().connections.len(), 1);
        assert_eq!(net.sweep_idle(Duration::ZERO), 0);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn aggregate_stats_span_networks() {
        let mut other = config(1, 1);
        other.name = "other".into();
        let pool = ConnectionPool::initialize(
            vec![config(2, 2), other],
            fast_settings(LoadBalancing::RoundRobin),
            Arc::new(TestConnector::new(1)),
            EventBus::default(),
        )
        .await
        .unwrap();
        let total = pool.stats(None).unwrap();
        assert_eq!(total.size, 3);
        assert_eq!(total.available, 3);
        assert_eq!(pool.networks(), vec!["other".to_string(), "testnet".to_string()]);
        pool.shutdown().await;
        assert!(matches!(
            pool.acquire("testnet").await,
            Err(AppError::Shutdown)
        ));
    }

    #[test]
    fn config_validation_rejects_inverted_bounds() {
        let cfg = config(3, 2);
        assert!(matches!(cfg.validate(), Err(AppError::Validation { .. })));
        let mut cfg = config(1, 2);
        cfg.endpoints.clear();
        assert!(cfg.validate().is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn invariants_hold_while_health_checks_race_leases() {
        let connector = Arc::new(TestConnector::new(1));
        let pool = ConnectionPool::initialize(
            vec![config(2, 4)],
            fast_settings(LoadBalancing::Random),
            connector.clone(),
            EventBus::default(),
        )
        .await
        .unwrap();
        let net = pool.network("testnet").unwrap().clone();
        let held = Arc::new(Mutex::new(HashSet::new()));

        let workers: Vec<_> = (0..12)
            .map(|_| {
                let pool = pool.clone();
                let held = held.clone();
                tokio::spawn(async move {
                    for _ in 0..25 {
                        let Ok(lease) = pool.acquire("testnet").await else {
                            tokio::task::yield_now().await;
                            continue;
                        };
                        assert!(
                            held.lock().unwrap().insert(lease.id()),
                            "{} leased twice",
                            lease.id()
                        );
                        let _ = lease.call(RpcRequest::BlockNumber).await;
                        tokio::task::yield_now().await;
                        held.lock().unwrap().remove(&lease.id());
                        drop(lease);
                    }
                })
            })
            .collect();

        let checker = {
            let net = net.clone();
            let healthy = connector.healthy.clone();
            tokio::spawn(async move {
                for round in 0..20 {
                    if round == 8 {
                        healthy.store(false, Ordering::SeqCst);
                    }
                    if round == 12 {
                        healthy.store(true, Ordering::SeqCst);
                    }
                    net.health_check().await;
                    let snap = net.snapshot();
                    assert!(snap.connections.len() <= 4);
                    assert_eq!(
                        snap.available.len() + snap.busy.len(),
                        snap.connections.len()
                    );
                    for id in &snap.available {
                        assert!(!snap.busy.contains(id));
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        for worker in workers {
            worker.await.expect("worker");
        }
        checker.await.expect("checker");

        net.replenish().await;
        let snap = net.snapshot();
        assert_invariants(&snap, 2, 4);
        assert!(snap.busy.is_empty());
        pool.shutdown().await;
    }
}
