// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

use crate::common::retry::retry_transient;
use crate::domain::error::AppError;
use crate::network::pool::ConnectionPool;
use crate::network::rpc::RpcRequest;
use alloy::primitives::Address;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

type NonceKey = (String, Address);

#[derive(Default)]
struct NonceSlot {
    next: Option<u64>,
    /// Reserved below `next` but handed back unused; reused lowest first.
    returned: BTreeSet<u64>,
}

/// Hands out sequential nonces per (network, sender), seeded from the pending count.
#[derive(Clone)]
pub struct NonceManager {
    pool: Arc<ConnectionPool>,
    next: Arc<DashMap<NonceKey, Arc<Mutex<NonceSlot>>>>,
}

impl NonceManager {
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        Self {
            pool,
            next: Arc::new(DashMap::new()),
        }
    }

    fn slot(&self, network: &str, address: Address) -> Arc<Mutex<NonceSlot>> {
        self.next
            .entry((network.to_string(), address))
            .or_default()
            .clone()
    }

    async fn pending_count(&self, network: &str, address: Address) -> Result<u64, AppError> {
        let pool = &self.pool;
        retry_transient(
            move |_| async move {
                pool.execute(
                    network,
                    RpcRequest::TransactionCount {
                        address,
                        pending: true,
                    },
                )
                .await?
                .into_transaction_count()
            },
            3,
            Duration::from_millis(100),
        )
        .await
    }

    /// Reserve the next nonce. The slot lock is held across the first fetch so
    /// concurrent callers never see the same value.
    pub async fn reserve(&self, network: &str, address: Address) -> Result<u64, AppError> {
        let slot = self.slot(network, address);
        let mut guard = slot.lock().await;
        if let Some(nonce) = guard.returned.pop_first() {
            return Ok(nonce);
        }
        let nonce = match guard.next {
            Some(n) => n,
            None => self.pending_count(network, address).await?,
        };
        guard.next = Some(nonce.saturating_add(1));
        Ok(nonce)
    }

    /// Give back a reserved nonce that never reached the node. The newest
    /// reservation rolls the counter back; an older one becomes a gap that
    /// the next `reserve` fills first.
    pub async fn release(&self, network: &str, address: Address, nonce: u64) {
        let slot = self.slot(network, address);
        let mut guard = slot.lock().await;
        let Some(next) = guard.next else {
            return;
        };
        if nonce >= next {
            return;
        }
        if nonce + 1 == next {
            let mut next = nonce;
            while next > 0 && guard.returned.remove(&(next - 1)) {
                next -= 1;
            }
            guard.next = Some(next);
        } else {
            guard.returned.insert(nonce);
        }
        tracing::debug!(
            target: "retry",
            network,
            %address,
            nonce,
            "Unused nonce returned"
        );
    }

    /// Forget the local counter and reload it from the node.
    pub async fn resync(&self, network: &str, address: Address) -> Result<u64, AppError> {
        let slot = self.slot(network, address);
        let mut guard = slot.lock().await;
        let on_chain = self.pending_count(network, address).await?;
        tracing::debug!(
            target: "retry",
            network,
            %address,
            nonce = on_chain,
            "Nonce resynced"
        );
        guard.next = Some(on_chain);
        guard.returned.clear();
        Ok(on_chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::EventBus;
    use crate::network::pool::{NetworkConfig, PoolSettings};
    use crate::network::provider::Connector;
    use crate::network::rpc::{RpcResponse, RpcTransport};
    use async_trait::async_trait;
    use futures::future::join_all;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountTransport {
        pending: AtomicU64,
    }

    #[async_trait]
    impl RpcTransport for CountTransport {
        async fn call(&self, request: RpcRequest) -> Result<RpcResponse, AppError> {
            match request {
                RpcRequest::ChainId => Ok(RpcResponse::ChainId(1)),
                RpcRequest::TransactionCount { .. } => Ok(RpcResponse::TransactionCount(
                    self.pending.load(Ordering::SeqCst),
                )),
                other => Err(AppError::Rpc {
                    code: -32601,
                    message: other.method().into(),
                }),
            }
        }
    }

    struct CountConnector(Arc<CountTransport>);

    #[async_trait]
    impl Connector for CountConnector {
        async fn connect(&self, _: &str) -> Result<Arc<dyn RpcTransport>, AppError> {
            Ok(self.0.clone())
        }
    }

    async fn manager(pending: u64) -> (NonceManager, Arc<CountTransport>, Arc<ConnectionPool>) {
        let transport = Arc::new(CountTransport {
            pending: AtomicU64::new(pending),
        });
        let mut cfg = NetworkConfig::new("mainnet", 1, vec!["http://node".into()]);
        cfg.min_connections = 1;
        cfg.max_connections = 4;
        let pool = ConnectionPool::initialize(
            vec![cfg],
            PoolSettings::default(),
            Arc::new(CountConnector(transport.clone())),
            EventBus::default(),
        )
        .await
        .unwrap();
        (NonceManager::new(pool.clone()), transport, pool)
    }

    #[tokio::test]
    async fn concurrent_reservations_are_unique() {
        let (nonces, _, pool) = manager(40).await;
        let sender = Address::repeat_byte(0x11);
        let reserved = join_all((0..16).map(|_| nonces.reserve("mainnet", sender))).await;
        let values: HashSet<u64> = reserved.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(values.len(), 16);
        assert_eq!(values.iter().min(), Some(&40));
        assert_eq!(values.iter().max(), Some(&55));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn resync_reloads_from_node() {
        let (nonces, transport, pool) = manager(3).await;
        let sender = Address::repeat_byte(0x22);
        assert_eq!(nonces.reserve("mainnet", sender).await.unwrap(), 3);
        assert_eq!(nonces.reserve("mainnet", sender).await.unwrap(), 4);

        transport.pending.store(9, Ordering::SeqCst);
        assert_eq!(nonces.resync("mainnet", sender).await.unwrap(), 9);
        assert_eq!(nonces.reserve("mainnet", sender).await.unwrap(), 9);
        // Other senders keep their own counters.
        assert_eq!(
            nonces.reserve("mainnet", Address::repeat_byte(0x33)).await.unwrap(),
            9
        );
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn released_nonces_are_reused_before_new_ones() {
        let (nonces, _, pool) = manager(7).await;
        let sender = Address::repeat_byte(0x44);
        for expected in 7..=10 {
            assert_eq!(nonces.reserve("mainnet", sender).await.unwrap(), expected);
        }

        // Newest reservation: the counter simply steps back.
        nonces.release("mainnet", sender, 10).await;
        assert_eq!(nonces.reserve("mainnet", sender).await.unwrap(), 10);

        // Older reservations leave gaps that are filled lowest first.
        nonces.release("mainnet", sender, 9).await;
        nonces.release("mainnet", sender, 8).await;
        assert_eq!(nonces.reserve("mainnet", sender).await.unwrap(), 8);
        assert_eq!(nonces.reserve("mainnet", sender).await.unwrap(), 9);
        assert_eq!(nonces.reserve("mainnet", sender).await.unwrap(), 11);

        // Releasing the tail also swallows adjacent gaps.
        nonces.release("mainnet", sender, 10).await;
        nonces.release("mainnet", sender, 11).await;
        assert_eq!(nonces.reserve("mainnet", sender).await.unwrap(), 10);

        // Unknown or future nonces are ignored.
        nonces.release("mainnet", sender, 99).await;
        nonces.release("mainnet", Address::repeat_byte(0x55), 3).await;
        assert_eq!(nonces.reserve("mainnet", sender).await.unwrap(), 11);
        pool.shutdown().await;
    }
}
