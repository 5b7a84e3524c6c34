// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@on1.no>

use crate::domain::error::AppError;
use crate::network::rpc::{RpcReceipt, RpcRequest, RpcResponse, RpcTransport};
use alloy::network::Ethereum;
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::BlockNumberOrTag;
use alloy::rpc::types::eth::TransactionReceipt;
use alloy::transports::{RpcError, TransportError};
use async_trait::async_trait;
use std::sync::Arc;
use url::Url;

pub type HttpProvider = RootProvider<Ethereum>;
pub type WsProvider = RootProvider<Ethereum>;
pub type IpcProvider = RootProvider<Ethereum>;

pub struct ConnectionFactory;

impl ConnectionFactory {
    pub fn http(rpc_url: &str) -> Result<HttpProvider, AppError> {
        let url =
            Url::parse(rpc_url).map_err(|e| AppError::Config(format!("Invalid RPC URL: {}", e)))?;

        let provider = RootProvider::new_http(url);
        Ok(provider)
    }

    pub async fn ws(ws_url: &str) -> Result<WsProvider, AppError> {
        let provider = RootProvider::connect(ws_url)
            .await
            .map_err(|e| AppError::Connection(format!("WS Connection failed: {}", e)))?;

        Ok(provider)
    }

    pub async fn ipc(ipc_path: &str) -> Result<IpcProvider, AppError> {
        // `connect` resolves filesystem paths to the IPC transport.
        let provider = RootProvider::connect(ipc_path)
            .await
            .map_err(|e| AppError::Connection(format!("IPC Connection failed: {}", e)))?;

        Ok(provider)
    }

    /// Pick the transport from the endpoint scheme.
    pub async fn for_endpoint(endpoint: &str) -> Result<RootProvider<Ethereum>, AppError> {
        let lower = endpoint.trim().to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Self::http(endpoint.trim())
        } else if lower.starts_with("ws://") || lower.starts_with("wss://") {
            Self::ws(endpoint.trim()).await
        } else if lower.ends_with(".ipc") || lower.starts_with('/') {
            Self::ipc(endpoint.trim()).await
        } else {
            Err(AppError::Config(format!(
                "Unsupported endpoint scheme: {endpoint}"
            )))
        }
    }
}

/// Opens transports for the pool. Swapped out in tests for scripted fakes.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn RpcTransport>, AppError>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct AlloyConnector;

#[async_trait]
impl Connector for AlloyConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn RpcTransport>, AppError> {
        let provider = ConnectionFactory::for_endpoint(endpoint).await?;
        Ok(Arc::new(AlloyTransport::new(provider)))
    }
}

/// `RpcTransport` over an alloy provider.
#[derive(Clone)]
pub struct AlloyTransport {
    provider: RootProvider<Ethereum>,
}

impl AlloyTransport {
    pub fn new(provider: RootProvider<Ethereum>) -> Self {
        Self { provider }
    }
}

fn map_rpc_error(method: &str, err: TransportError) -> AppError {
    if let Some(payload) = err.as_error_resp() {
        return AppError::Rpc {
            code: payload.code,
            message: payload.message.to_string(),
        };
    }
    match err {
        RpcError::DeserError { .. } | RpcError::SerError(_) => AppError::Decode {
            method: method.to_string(),
            reason: err.to_string(),
        },
        other => AppError::Connection(format!("{method} failed: {other}")),
    }
}

fn convert_receipt(receipt: TransactionReceipt) -> Option<RpcReceipt> {
    // Pending receipts (some nodes return them) carry no inclusion block.
    let block_number = receipt.block_number?;
    Some(RpcReceipt {
        transaction_hash: receipt.transaction_hash,
        block_number,
        status: receipt.status(),
        gas_used: receipt.gas_used,
        effective_gas_price: receipt.effective_gas_price,
    })
}

#[async_trait]
impl RpcTransport for AlloyTransport {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, AppError> {
        let method = request.method();
        let provider = &self.provider;
        let response = match request {
            RpcRequest::ChainId => RpcResponse::ChainId(
                provider
                    .get_chain_id()
                    .await
                    .map_err(|e| map_rpc_error(method, e))?,
            ),
            RpcRequest::BlockNumber => RpcResponse::BlockNumber(
                provider
                    .get_block_number()
                    .await
                    .map_err(|e| map_rpc_error(method, e))?,
            ),
            RpcRequest::GasPrice => RpcResponse::GasPrice(
                provider
                    .get_gas_price()
                    .await
                    .map_err(|e| map_rpc_error(method, e))?,
            ),
            RpcRequest::MaxPriorityFeePerGas => RpcResponse::MaxPriorityFeePerGas(
                provider
                    .get_max_priority_fee_per_gas()
                    .await
                    .map_err(|e| map_rpc_error(method, e))?,
            ),
            RpcRequest::FeeHistory {
                block_count,
                reward_percentiles,
            } => {
                let history = provider
                    .get_fee_history(block_count, BlockNumberOrTag::Latest, &reward_percentiles)
                    .await
                    .map_err(|e| map_rpc_error(method, e))?;
                if history.gas_used_ratio.is_empty() {
                    return Err(AppError::Decode {
                        method: method.to_string(),
                        reason: "empty gasUsedRatio".into(),
                    });
                }
                RpcResponse::FeeHistory(Box::new(history))
            }
            RpcRequest::EstimateGas(tx) => RpcResponse::GasEstimate(
                provider
                    .estimate_gas(*tx)
                    .await
                    .map_err(|e| map_rpc_error(method, e))?,
            ),
            RpcRequest::TransactionCount { address, pending } => {
                let call = provider.get_transaction_count(address);
                let count = if pending {
                    call.pending().await
                } else {
                    call.latest().await
                };
                RpcResponse::TransactionCount(count.map_err(|e| map_rpc_error(method, e))?)
            }
            RpcRequest::SendRawTransaction(raw) => {
                let pending = provider
                    .send_raw_transaction(&raw)
                    .await
                    .map_err(|e| map_rpc_error(method, e))?;
                RpcResponse::TransactionHash(*pending.tx_hash())
            }
            RpcRequest::SendTransaction(tx) => {
                let pending = provider
                    .send_transaction(*tx)
                    .await
                    .map_err(|e| map_rpc_error(method, e))?;
                RpcResponse::TransactionHash(*pending.tx_hash())
            }
            RpcRequest::TransactionReceipt(hash) => RpcResponse::Receipt(
                provider
                    .get_transaction_receipt(hash)
                    .await
                    .map_err(|e| map_rpc_error(method, e))?
                    .and_then(convert_receipt),
            ),
        };
        Ok(response)
    }
}
