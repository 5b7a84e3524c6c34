// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@oxidity.com>

use crate::domain::constants::{
    BPS_DENOMINATOR, DEFAULT_BACKOFF_BASE_MS, DEFAULT_BACKOFF_JITTER, DEFAULT_BACKOFF_MAX_MS,
    DEFAULT_CONFIRMATIONS, DEFAULT_JOB_TIMEOUT_MS, DEFAULT_MAX_REPLACEMENTS, DEFAULT_MAX_RETRIES,
    DEFAULT_REPLACEMENT_MULTIPLIER_BPS, DEFAULT_STUCK_AFTER_MS,
};
use crate::domain::error::AppError;
use crate::domain::types::{BackoffStrategy, GasStrategy, JobId, JobState};
use crate::network::gas::GasQuote;
use crate::network::rpc::{RpcReceipt, SubmissionErrorKind, classify_submission_error};
use alloy::primitives::{Address, B256, Bytes, U256};
use alloy::rpc::types::TransactionRequest;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// What the caller wants on chain. Fees and gas limit are filled per attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxPayload {
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub nonce: Option<u64>,
    pub from: Option<Address>,
    pub gas_limit: Option<u64>,
}

impl TxPayload {
    pub fn transfer(to: Address, value: U256) -> Self {
        Self {
            to,
            value,
            ..Self::default()
        }
    }

    pub fn call(to: Address, data: Bytes) -> Self {
        Self {
            to,
            data,
            ..Self::default()
        }
    }

    pub fn with_from(mut self, from: Address) -> Self {
        self.from = Some(from);
        self
    }

    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = Some(gas_limit);
        self
    }

    /// Unpriced draft for gas estimation and submission.
    pub fn to_request(&self, chain_id: u64) -> TransactionRequest {
        let mut tx = TransactionRequest::default()
            .to(self.to)
            .value(self.value)
            .input(self.data.clone().into());
        tx.chain_id = Some(chain_id);
        tx.from = self.from;
        tx.nonce = self.nonce;
        tx.gas = self.gas_limit;
        tx
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, replacements included.
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
    pub gas_strategy: GasStrategy,
    pub confirmations: u64,
    pub timeout: Duration,
    pub enable_replacement: bool,
    pub max_replacements: u32,
    pub replacement_multiplier_bps: u64,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub jitter_ratio: f64,
    /// Receipt poll cadence; `None` derives it from the chain's block time.
    pub poll_interval: Option<Duration>,
    /// Wait without a receipt after which a broadcast counts as stuck.
    pub stuck_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            backoff: BackoffStrategy::Exponential,
            gas_strategy: GasStrategy::Standard,
            confirmations: DEFAULT_CONFIRMATIONS,
            timeout: Duration::from_millis(DEFAULT_JOB_TIMEOUT_MS),
            enable_replacement: true,
            max_replacements: DEFAULT_MAX_REPLACEMENTS,
            replacement_multiplier_bps: DEFAULT_REPLACEMENT_MULTIPLIER_BPS,
            backoff_base: Duration::from_millis(DEFAULT_BACKOFF_BASE_MS),
            backoff_max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
            jitter_ratio: DEFAULT_BACKOFF_JITTER,
            poll_interval: None,
            stuck_after: Duration::from_millis(DEFAULT_STUCK_AFTER_MS),
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> Result<(), AppError> {
        let invalid = |field: &str, message: &str| {
            Err(AppError::Validation {
                field: format!("policy.{field}"),
                message: message.to_string(),
            })
        };
        if self.max_retries == 0 {
            return invalid("max_retries", "must allow at least one attempt");
        }
        if self.confirmations == 0 {
            return invalid("confirmations", "must be at least 1");
        }
        if self.timeout.is_zero() {
            return invalid("timeout", "must be greater than zero");
        }
        if self.replacement_multiplier_bps <= BPS_DENOMINATOR {
            return invalid("replacement_multiplier_bps", "must exceed 10000");
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return invalid("jitter_ratio", "must be within [0, 1]");
        }
        if self.backoff_max < self.backoff_base {
            return invalid("backoff_max", "must be at least backoff_base");
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Error, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("retry budget exhausted: {last_error}")]
    Exhausted { last_error: String },
    #[error("rejected as {kind:?}: {message}")]
    Rejected {
        kind: SubmissionErrorKind,
        message: String,
    },
    #[error("reverted in block {block}")]
    Reverted { block: u64 },
    #[error("no confirmation within {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("cancelled")]
    Cancelled,
    #[error("aborted: {message}")]
    Aborted { message: String },
}

impl FailureReason {
    pub fn terminal_state(&self) -> JobState {
        match self {
            FailureReason::Timeout { .. } => JobState::Timeout,
            _ => JobState::Failed,
        }
    }
}

#[derive(Clone, Debug, Error, Serialize)]
#[error("{job_id} failed after {attempts} attempt(s): {reason}")]
pub struct ExecutionError {
    pub job_id: JobId,
    pub network: String,
    pub reason: FailureReason,
    pub attempts: u32,
    pub last_hash: Option<B256>,
    /// Present for reverts.
    pub receipt: Option<RpcReceipt>,
}

impl ExecutionError {
    /// A job refused before any attempt, e.g. an invalid policy or unknown network.
    pub fn rejected(network: &str, err: &AppError) -> Self {
        Self {
            job_id: JobId::next(),
            network: network.to_string(),
            reason: FailureReason::Rejected {
                kind: classify_submission_error(err),
                message: err.to_string(),
            },
            attempts: 0,
            last_hash: None,
            receipt: None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct ExecutionOutcome {
    pub job_id: JobId,
    pub network: String,
    pub hash: B256,
    pub receipt: RpcReceipt,
    pub gas_used: u64,
    pub effective_gas_price: u128,
    pub attempts: u32,
    pub replacements: u32,
}

/// Published snapshot of a job; the driver task is its only writer.
#[derive(Clone, Debug, Serialize)]
pub struct JobStatus {
    pub job_id: JobId,
    pub network: String,
    pub state: JobState,
    pub attempts: u32,
    pub replacements: u32,
    pub hash: Option<B256>,
    pub hashes: Vec<B256>,
    pub nonce: Option<u64>,
    pub fee_cap: Option<u128>,
    pub receipt: Option<RpcReceipt>,
    pub error: Option<FailureReason>,
    pub elapsed_ms: u64,
}

/// Links a broadcast hash back to its job while the job is live.
#[derive(Clone, Debug)]
pub struct MonitorEntry {
    pub job_id: JobId,
    pub network: String,
    pub nonce: Option<u64>,
    pub broadcast_at: Instant,
}

pub struct TransactionJob {
    pub id: JobId,
    pub network: String,
    pub payload: TxPayload,
    pub policy: RetryPolicy,
    pub state: JobState,
    pub attempts: u32,
    pub replacements: u32,
    /// Broadcast hashes, most recent last.
    pub hashes: Vec<B256>,
    pub nonce: Option<u64>,
    pub last_quote: Option<GasQuote>,
    pub receipt: Option<RpcReceipt>,
    pub started_at: Instant,
    pub last_attempt_at: Option<Instant>,
    pub error: Option<FailureReason>,
}

impl TransactionJob {
    pub fn new(network: String, payload: TxPayload, policy: RetryPolicy) -> Self {
        Self {
            id: JobId::next(),
            network,
            nonce: payload.nonce,
            payload,
            policy,
            state: JobState::Pending,
            attempts: 0,
            replacements: 0,
            hashes: Vec::new(),
            last_quote: None,
            receipt: None,
            started_at: Instant::now(),
            last_attempt_at: None,
            error: None,
        }
    }

    pub fn last_hash(&self) -> Option<B256> {
        self.hashes.last().copied()
    }

    pub fn deadline(&self) -> Instant {
        self.started_at + self.policy.timeout
    }

    pub fn status(&self) -> JobStatus {
        JobStatus {
            job_id: self.id,
            network: self.network.clone(),
            state: self.state,
            attempts: self.attempts,
            replacements: self.replacements,
            hash: self.last_hash(),
            hashes: self.hashes.clone(),
            nonce: self.nonce,
            fee_cap: self.last_quote.as_ref().map(|q| q.fee_cap()),
            receipt: self.receipt.clone(),
            error: self.error.clone(),
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_valid() {
        assert!(RetryPolicy::default().validate().is_ok());
        let zero = RetryPolicy {
            max_retries: 0,
            ..RetryPolicy::default()
        };
        assert!(zero.validate().is_err());
        let flat = RetryPolicy {
            replacement_multiplier_bps: BPS_DENOMINATOR,
            ..RetryPolicy::default()
        };
        assert!(flat.validate().is_err());
    }

    #[test]
    fn request_carries_payload_fields() {
        let payload = TxPayload::transfer(Address::repeat_byte(0xaa), U256::from(5))
            .with_from(Address::repeat_byte(0x01))
            .with_nonce(9);
        let tx = payload.to_request(137);
        assert_eq!(tx.chain_id, Some(137));
        assert_eq!(tx.nonce, Some(9));
        assert_eq!(tx.value, Some(U256::from(5)));
        assert_eq!(tx.from, Some(Address::repeat_byte(0x01)));
        assert!(tx.gas.is_none());
    }

    #[test]
    fn only_timeouts_map_to_timeout_state() {
        assert_eq!(
            FailureReason::Timeout { elapsed_ms: 1 }.terminal_state(),
            JobState::Timeout
        );
        assert_eq!(FailureReason::Cancelled.terminal_state(), JobState::Failed);
    }

    #[test]
    fn every_failure_reason_serializes_with_its_tag() {
        let reasons = [
            FailureReason::Exhausted {
                last_error: "connection reset".into(),
            },
            FailureReason::Rejected {
                kind: SubmissionErrorKind::InsufficientFunds,
                message: "insufficient funds".into(),
            },
            FailureReason::Reverted { block: 12 },
            FailureReason::Timeout { elapsed_ms: 500 },
            FailureReason::Cancelled,
            FailureReason::Aborted {
                message: "engine shutting down".into(),
            },
        ];
        let tags = [
            "exhausted",
            "rejected",
            "reverted",
            "timeout",
            "cancelled",
            "aborted",
        ];
        for (reason, tag) in reasons.iter().zip(tags) {
            let value = serde_json::to_value(reason).expect("serializes");
            assert_eq!(value["reason"], tag);
        }

        let rejected = serde_json::to_value(&reasons[1]).unwrap();
        assert_eq!(rejected["kind"], "InsufficientFunds");
        let aborted = serde_json::to_value(&reasons[5]).unwrap();
        assert_eq!(aborted["message"], "engine shutting down");
    }
}
