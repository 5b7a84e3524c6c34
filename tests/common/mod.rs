#![allow(dead_code)]

use alloy::consensus::{Transaction, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::eth::FeeHistory;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use vault_tx_engine::domain::error::AppError;
use vault_tx_engine::domain::types::GasStrategy;
use vault_tx_engine::network::pool::{NetworkConfig, PoolSettings};
use vault_tx_engine::network::provider::Connector;
use vault_tx_engine::network::rpc::{RpcReceipt, RpcRequest, RpcResponse, RpcTransport};
use vault_tx_engine::network::signer::TransactionSigner;
use vault_tx_engine::retry::RetryPolicy;
use vault_tx_engine::{Engine, EngineConfig};

pub const NETWORK: &str = "testnet";
pub const CHAIN_ID: u64 = 31_337;
pub const GWEI: u128 = 1_000_000_000;
pub const START_NONCE: u64 = 7;

pub fn sender() -> Address {
    Address::repeat_byte(0x51)
}

pub fn recipient() -> Address {
    Address::repeat_byte(0xaa)
}

/// How the fake node answers one `eth_sendTransaction`.
#[derive(Clone, Debug)]
pub enum Answer {
    /// Accepted and mined into the next block.
    Mine,
    /// Accepted, never mined.
    Pending,
    /// Accepted and mined with a failed status.
    Revert,
    /// Refused with a JSON-RPC error.
    Reject(i64, &'static str),
}

#[derive(Clone, Debug)]
pub struct Submission {
    pub hash: Option<B256>,
    pub to: Option<Address>,
    pub value: Option<U256>,
    pub nonce: Option<u64>,
    pub gas: Option<u64>,
    pub max_fee_per_gas: Option<u128>,
    pub max_priority_fee_per_gas: Option<u128>,
}

impl Submission {
    pub fn fee_cap(&self) -> u128 {
        self.max_fee_per_gas.unwrap_or_default()
    }
}

struct ChainState {
    head: u64,
    script: VecDeque<Answer>,
    fallback: Answer,
    submissions: Vec<Submission>,
    receipts: HashMap<B256, RpcReceipt>,
    next_hash: u64,
}

/// Scripted in-process node: fixed fee market, scripted submission outcomes.
pub struct FakeChain {
    state: Mutex<ChainState>,
}

impl FakeChain {
    pub fn new(script: Vec<Answer>, fallback: Answer) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                head: 1_000,
                script: script.into(),
                fallback,
                submissions: Vec::new(),
                receipts: HashMap::new(),
                next_hash: 1,
            }),
        })
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().unwrap().submissions.clone()
    }

    pub fn advance(&self, blocks: u64) {
        self.state.lock().unwrap().head += blocks;
    }

    fn fee_history() -> FeeHistory {
        FeeHistory {
            oldest_block: 990,
            base_fee_per_gas: vec![10 * GWEI; 11],
            gas_used_ratio: vec![0.5; 10],
            reward: Some(vec![vec![GWEI, 2 * GWEI, 3 * GWEI]; 10]),
            ..Default::default()
        }
    }

    fn submit(&self, mut submission: Submission) -> Result<RpcResponse, AppError> {
        let signed_hash = submission.hash.take();
        let mut state = self.state.lock().unwrap();
        let answer = state
            .script
            .pop_front()
            .unwrap_or_else(|| state.fallback.clone());
        if let Answer::Reject(code, message) = answer {
            state.submissions.push(submission);
            return Err(AppError::Rpc {
                code,
                message: message.to_string(),
            });
        }

        let hash = signed_hash.unwrap_or_else(|| B256::from(U256::from(state.next_hash)));
        state.next_hash += 1;
        submission.hash = Some(hash);
        state.submissions.push(submission);

        let mined = match answer {
            Answer::Mine => Some(true),
            Answer::Revert => Some(false),
            _ => None,
        };
        if let Some(status) = mined {
            Self::include(&mut state, hash, status);
        }
        Ok(RpcResponse::TransactionHash(hash))
    }

    fn include(state: &mut ChainState, hash: B256, status: bool) {
        state.head += 1;
        let block_number = state.head;
        state.receipts.insert(
            hash,
            RpcReceipt {
                transaction_hash: hash,
                block_number,
                status,
                gas_used: 21_000,
                effective_gas_price: 12 * GWEI,
            },
        );
    }

    /// Mine a transaction that was accepted as pending earlier.
    pub fn mine(&self, hash: B256) {
        let mut state = self.state.lock().unwrap();
        Self::include(&mut state, hash, true);
    }
}

#[async_trait]
impl RpcTransport for FakeChain {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, AppError> {
        match request {
            RpcRequest::ChainId => Ok(RpcResponse::ChainId(CHAIN_ID)),
            RpcRequest::BlockNumber => Ok(RpcResponse::BlockNumber(self.state.lock().unwrap().head)),
            RpcRequest::GasPrice => Ok(RpcResponse::GasPrice(12 * GWEI)),
            RpcRequest::MaxPriorityFeePerGas => Ok(RpcResponse::MaxPriorityFeePerGas(2 * GWEI)),
            RpcRequest::FeeHistory { .. } => Ok(RpcResponse::FeeHistory(Box::new(Self::fee_history()))),
            RpcRequest::EstimateGas(_) => Ok(RpcResponse::GasEstimate(21_000)),
            RpcRequest::TransactionCount { .. } => Ok(RpcResponse::TransactionCount(START_NONCE)),
            RpcRequest::SendTransaction(tx) => self.submit(Submission {
                hash: None,
                to: tx.to.and_then(|kind| kind.to().copied()),
                value: tx.value,
                nonce: tx.nonce,
                gas: tx.gas,
                max_fee_per_gas: tx.max_fee_per_gas,
                max_priority_fee_per_gas: tx.max_priority_fee_per_gas,
            }),
            RpcRequest::SendRawTransaction(raw) => {
                let envelope = TxEnvelope::decode_2718(&mut &raw[..]).map_err(|e| AppError::Rpc {
                    code: -32602,
                    message: format!("invalid raw transaction: {e}"),
                })?;
                self.submit(Submission {
                    hash: Some(*envelope.tx_hash()),
                    to: envelope.to(),
                    value: Some(envelope.value()),
                    nonce: Some(envelope.nonce()),
                    gas: Some(envelope.gas_limit()),
                    max_fee_per_gas: Some(envelope.max_fee_per_gas()),
                    max_priority_fee_per_gas: envelope.max_priority_fee_per_gas(),
                })
            }
            RpcRequest::TransactionReceipt(hash) => Ok(RpcResponse::Receipt(
                self.state.lock().unwrap().receipts.get(&hash).cloned(),
            )),
        }
    }
}

pub struct FakeConnector(pub Arc<FakeChain>);

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _endpoint: &str) -> Result<Arc<dyn RpcTransport>, AppError> {
        Ok(self.0.clone())
    }
}

pub fn network(min: usize, max: usize) -> NetworkConfig {
    let mut cfg = NetworkConfig::new(NETWORK, CHAIN_ID, vec!["fake://node-a".into()]);
    cfg.min_connections = min;
    cfg.max_connections = max;
    cfg
}

pub async fn engine(chain: Arc<FakeChain>) -> Arc<Engine> {
    engine_with_signer(chain, None).await
}

pub async fn engine_with_signer(
    chain: Arc<FakeChain>,
    signer: Option<Arc<dyn TransactionSigner>>,
) -> Arc<Engine> {
    let pool = PoolSettings {
        acquire_retries: 2,
        acquire_retry_delay: Duration::from_millis(10),
        ..PoolSettings::default()
    };
    start(chain, network(1, 4), pool, signer).await
}

pub async fn start(
    chain: Arc<FakeChain>,
    network: NetworkConfig,
    pool: PoolSettings,
    signer: Option<Arc<dyn TransactionSigner>>,
) -> Arc<Engine> {
    let config = EngineConfig::new(vec![network]).with_pool(pool);
    Engine::start(config, Arc::new(FakeConnector(chain)), signer)
        .await
        .expect("engine starts")
}

/// Fast timers so scenarios finish in milliseconds.
pub fn policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 3,
        gas_strategy: GasStrategy::Standard,
        confirmations: 1,
        timeout: Duration::from_secs(10),
        backoff_base: Duration::from_millis(5),
        backoff_max: Duration::from_millis(20),
        jitter_ratio: 0.0,
        poll_interval: Some(Duration::from_millis(10)),
        stuck_after: Duration::from_secs(5),
        ..RetryPolicy::default()
    }
}
