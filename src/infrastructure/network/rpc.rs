// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@mitander.dev>

//! Typed JSON-RPC surface used by the pool.
//!
//! Every method the engine needs has its own request and response variant, so
//! malformed node responses are rejected at the transport boundary instead of
//! leaking half-decoded values into the retry logic.

use crate::domain::error::AppError;
use alloy::primitives::{Address, B256, Bytes};
use alloy::rpc::types::eth::{FeeHistory, TransactionRequest};
use async_trait::async_trait;
use serde::Serialize;

pub mod methods {
    pub const CHAIN_ID: &str = "eth_chainId";
    pub const BLOCK_NUMBER: &str = "eth_blockNumber";
    pub const GAS_PRICE: &str = "eth_gasPrice";
    pub const MAX_PRIORITY_FEE: &str = "eth_maxPriorityFeePerGas";
    pub const FEE_HISTORY: &str = "eth_feeHistory";
    pub const ESTIMATE_GAS: &str = "eth_estimateGas";
    pub const TRANSACTION_COUNT: &str = "eth_getTransactionCount";
    pub const SEND_RAW_TRANSACTION: &str = "eth_sendRawTransaction";
    pub const SEND_TRANSACTION: &str = "eth_sendTransaction";
    pub const TRANSACTION_RECEIPT: &str = "eth_getTransactionReceipt";
}

#[derive(Clone, Debug)]
pub enum RpcRequest {
    ChainId,
    BlockNumber,
    GasPrice,
    MaxPriorityFeePerGas,
    FeeHistory {
        block_count: u64,
        reward_percentiles: Vec<f64>,
    },
    EstimateGas(Box<TransactionRequest>),
    TransactionCount {
        address: Address,
        pending: bool,
    },
    SendRawTransaction(Bytes),
    SendTransaction(Box<TransactionRequest>),
    TransactionReceipt(B256),
}

impl RpcRequest {
    pub fn method(&self) -> &'static str {
        match self {
            RpcRequest::ChainId => methods::CHAIN_ID,
            RpcRequest::BlockNumber => methods::BLOCK_NUMBER,
            RpcRequest::GasPrice => methods::GAS_PRICE,
            RpcRequest::MaxPriorityFeePerGas => methods::MAX_PRIORITY_FEE,
            RpcRequest::FeeHistory { .. } => methods::FEE_HISTORY,
            RpcRequest::EstimateGas(_) => methods::ESTIMATE_GAS,
            RpcRequest::TransactionCount { .. } => methods::TRANSACTION_COUNT,
            RpcRequest::SendRawTransaction(_) => methods::SEND_RAW_TRANSACTION,
            RpcRequest::SendTransaction(_) => methods::SEND_TRANSACTION,
            RpcRequest::TransactionReceipt(_) => methods::TRANSACTION_RECEIPT,
        }
    }
}

/// Receipt fields the engine reasons about. A receipt without an inclusion block
/// is still pending and never reaches this type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RpcReceipt {
    pub transaction_hash: B256,
    pub block_number: u64,
    pub status: bool,
    pub gas_used: u64,
    pub effective_gas_price: u128,
}

#[derive(Clone, Debug)]
pub enum RpcResponse {
    ChainId(u64),
    BlockNumber(u64),
    GasPrice(u128),
    MaxPriorityFeePerGas(u128),
    FeeHistory(Box<FeeHistory>),
    GasEstimate(u64),
    TransactionCount(u64),
    TransactionHash(B256),
    Receipt(Option<RpcReceipt>),
}

impl RpcResponse {
    fn variant(&self) -> &'static str {
        match self {
            RpcResponse::ChainId(_) => "ChainId",
            RpcResponse::BlockNumber(_) => "BlockNumber",
            RpcResponse::GasPrice(_) => "GasPrice",
            RpcResponse::MaxPriorityFeePerGas(_) => "MaxPriorityFeePerGas",
            RpcResponse::FeeHistory(_) => "FeeHistory",
            RpcResponse::GasEstimate(_) => "GasEstimate",
            RpcResponse::TransactionCount(_) => "TransactionCount",
            RpcResponse::TransactionHash(_) => "TransactionHash",
            RpcResponse::Receipt(_) => "Receipt",
        }
    }

    fn mismatch(self, method: &str) -> AppError {
        AppError::Decode {
            method: method.to_string(),
            reason: format!("unexpected {} response", self.variant()),
        }
    }

    pub fn into_chain_id(self) -> Result<u64, AppError> {
        match self {
            RpcResponse::ChainId(v) => Ok(v),
            other => Err(other.mismatch(methods::CHAIN_ID)),
        }
    }

    pub fn into_block_number(self) -> Result<u64, AppError> {
        match self {
            RpcResponse::BlockNumber(v) => Ok(v),
            other => Err(other.mismatch(methods::BLOCK_NUMBER)),
        }
    }

    pub fn into_gas_price(self) -> Result<u128, AppError> {
        match self {
            RpcResponse::GasPrice(v) => Ok(v),
            other => Err(other.mismatch(methods::GAS_PRICE)),
        }
    }

    pub fn into_priority_fee(self) -> Result<u128, AppError> {
        match self {
            RpcResponse::MaxPriorityFeePerGas(v) => Ok(v),
            other => Err(other.mismatch(methods::MAX_PRIORITY_FEE)),
        }
    }

    pub fn into_fee_history(self) -> Result<FeeHistory, AppError> {
        match self {
            RpcResponse::FeeHistory(v) => Ok(*v),
            other => Err(other.mismatch(methods::FEE_HISTORY)),
        }
    }

    pub fn into_gas_estimate(self) -> Result<u64, AppError> {
        match self {
            RpcResponse::GasEstimate(v) => Ok(v),
            other => Err(other.mismatch(methods::ESTIMATE_GAS)),
        }
    }

    pub fn into_transaction_count(self) -> Result<u64, AppError> {
        match self {
            RpcResponse::TransactionCount(v) => Ok(v),
            other => Err(other.mismatch(methods::TRANSACTION_COUNT)),
        }
    }

    pub fn into_transaction_hash(self) -> Result<B256, AppError> {
        match self {
            RpcResponse::TransactionHash(v) => Ok(v),
            other => Err(other.mismatch(methods::SEND_RAW_TRANSACTION)),
        }
    }

    pub fn into_receipt(self) -> Result<Option<RpcReceipt>, AppError> {
        match self {
            RpcResponse::Receipt(v) => Ok(v),
            other => Err(other.mismatch(methods::TRANSACTION_RECEIPT)),
        }
    }
}

/// A single live JSON-RPC client bound to one endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn call(&self, request: RpcRequest) -> Result<RpcResponse, AppError>;
}

// =============================================================================
// SUBMISSION ERROR CLASSIFICATION
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum SubmissionErrorKind {
    /// Transient transport/node trouble; retry after backoff.
    Retryable,
    /// Fee below what the pool accepts, or below a pending tx at the same nonce.
    Underpriced,
    /// Node already holds this exact transaction.
    AlreadyKnown,
    /// Nonce already consumed on chain.
    NonceTooLow,
    InsufficientFunds,
    Malformed,
    Unsupported,
    Reverted,
}

impl SubmissionErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            SubmissionErrorKind::Retryable
                | SubmissionErrorKind::Underpriced
                | SubmissionErrorKind::AlreadyKnown
        )
    }
}

// EIP-1474 and common node codes.
const CODE_EXECUTION_REVERTED: i64 = 3;
const CODE_PARSE_ERROR: i64 = -32700;
const CODE_INVALID_REQUEST: i64 = -32600;
const CODE_METHOD_NOT_FOUND: i64 = -32601;
const CODE_INVALID_PARAMS: i64 = -32602;
const CODE_INTERNAL: i64 = -32603;
const CODE_METHOD_NOT_SUPPORTED: i64 = -32004;
const CODE_LIMIT_EXCEEDED: i64 = -32005;

/// Txpool rejection reasons as reported by geth/erigon/reth (lowercase prose)
/// and Nethermind (PascalCase tokens, matched lowercased). First match wins.
const REJECTION_REASONS: &[(&str, SubmissionErrorKind)] = &[
    ("replacement transaction underpriced", SubmissionErrorKind::Underpriced),
    ("replacementnotallowed", SubmissionErrorKind::Underpriced),
    ("transaction underpriced", SubmissionErrorKind::Underpriced),
    ("max fee per gas less than block base fee", SubmissionErrorKind::Underpriced),
    ("gas price too low", SubmissionErrorKind::Underpriced),
    ("feetoolow", SubmissionErrorKind::Underpriced),
    ("already known", SubmissionErrorKind::AlreadyKnown),
    ("alreadyknown", SubmissionErrorKind::AlreadyKnown),
    ("known transaction", SubmissionErrorKind::AlreadyKnown),
    ("nonce too low", SubmissionErrorKind::NonceTooLow),
    ("oldnonce", SubmissionErrorKind::NonceTooLow),
    ("insufficient funds", SubmissionErrorKind::InsufficientFunds),
    ("insufficientfunds", SubmissionErrorKind::InsufficientFunds),
    ("intrinsic gas too low", SubmissionErrorKind::Malformed),
    ("exceeds block gas limit", SubmissionErrorKind::Malformed),
    ("invalid sender", SubmissionErrorKind::Malformed),
    ("invalid chain id", SubmissionErrorKind::Malformed),
    ("oversized data", SubmissionErrorKind::Malformed),
    ("execution reverted", SubmissionErrorKind::Reverted),
    ("nonce too high", SubmissionErrorKind::Retryable),
    ("txpool is full", SubmissionErrorKind::Retryable),
];

/// Classify a JSON-RPC error: code first, then the known rejection reasons.
pub fn classify(code: i64, message: &str) -> SubmissionErrorKind {
    match code {
        CODE_EXECUTION_REVERTED => return SubmissionErrorKind::Reverted,
        CODE_PARSE_ERROR | CODE_INVALID_REQUEST | CODE_INVALID_PARAMS => {
            return SubmissionErrorKind::Malformed;
        }
        CODE_METHOD_NOT_FOUND | CODE_METHOD_NOT_SUPPORTED => {
            return SubmissionErrorKind::Unsupported;
        }
        CODE_LIMIT_EXCEEDED | CODE_INTERNAL => return SubmissionErrorKind::Retryable,
        _ => {}
    }
    let lower = message.to_ascii_lowercase();
    REJECTION_REASONS
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, kind)| *kind)
        .unwrap_or(SubmissionErrorKind::Retryable)
}

pub fn classify_submission_error(err: &AppError) -> SubmissionErrorKind {
    match err {
        AppError::Rpc { code, message } => classify(*code, message),
        AppError::Connection(_)
        | AppError::PoolExhausted { .. }
        | AppError::Timeout { .. }
        | AppError::Decode { .. } => SubmissionErrorKind::Retryable,
        AppError::Signing(_) | AppError::Validation { .. } => SubmissionErrorKind::Malformed,
        AppError::Config(_)
        | AppError::Initialization(_)
        | AppError::UnknownNetwork(_)
        | AppError::Shutdown => SubmissionErrorKind::Unsupported,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(code: i64, message: &str) -> AppError {
        AppError::Rpc {
            code,
            message: message.to_string(),
        }
    }

    #[test]
    fn geth_style_messages_map_to_kinds() {
        assert_eq!(
            classify_submission_error(&rpc(-32000, "replacement transaction underpriced")),
            SubmissionErrorKind::Underpriced
        );
        assert_eq!(
            classify_submission_error(&rpc(-32000, "nonce too low: next nonce 5, tx nonce 4")),
            SubmissionErrorKind::NonceTooLow
        );
        assert_eq!(
            classify_submission_error(&rpc(
                -32000,
                "insufficient funds for gas * price + value"
            )),
            SubmissionErrorKind::InsufficientFunds
        );
        assert_eq!(
            classify_submission_error(&rpc(-32000, "already known")),
            SubmissionErrorKind::AlreadyKnown
        );
    }

    #[test]
    fn nethermind_tokens_map_to_kinds() {
        assert_eq!(
            classify_submission_error(&rpc(-32010, "FeeTooLow, MaxFeePerGas too low")),
            SubmissionErrorKind::Underpriced
        );
        assert_eq!(
            classify_submission_error(&rpc(-32010, "OldNonce")),
            SubmissionErrorKind::NonceTooLow
        );
        assert_eq!(
            classify_submission_error(&rpc(-32010, "InsufficientFunds")),
            SubmissionErrorKind::InsufficientFunds
        );
    }

    #[test]
    fn codes_take_precedence_over_text() {
        assert_eq!(
            classify_submission_error(&rpc(-32602, "nonce too low")),
            SubmissionErrorKind::Malformed
        );
        assert_eq!(
            classify_submission_error(&rpc(3, "execution reverted: paused")),
            SubmissionErrorKind::Reverted
        );
        assert_eq!(
            classify_submission_error(&rpc(-32005, "rate limited")),
            SubmissionErrorKind::Retryable
        );
    }

    #[test]
    fn transport_failures_are_retryable() {
        let err = AppError::Connection("connection reset".into());
        assert!(classify_submission_error(&err).is_retryable());
        let err = AppError::PoolExhausted {
            network: "mainnet".into(),
            attempts: 3,
        };
        assert!(classify_submission_error(&err).is_retryable());
        assert!(!SubmissionErrorKind::InsufficientFunds.is_retryable());
    }

    #[test]
    fn mismatched_response_is_a_decode_error() {
        let err = RpcResponse::GasPrice(1).into_block_number().unwrap_err();
        assert!(matches!(err, AppError::Decode { .. }));
    }
}
