// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@oxidity.com>

//! Transaction lifecycle driver.
//!
//! Every job runs on its own task and is the only writer of its
//! `TransactionJob`. Readers see the `JobStatus` published on a `watch`
//! channel, and finished statuses stay queryable in a bounded history.

use crate::common::bounded::BoundedMap;
use crate::domain::constants::{
    CANCEL_MULTIPLIER_BPS, FINISHED_JOB_HISTORY, TRANSFER_GAS_LIMIT,
    default_receipt_poll_interval,
};
use crate::domain::error::AppError;
use crate::domain::events::{EngineEvent, EventBus};
use crate::domain::types::{JobId, JobState};
use crate::network::gas::{GasOptimizer, GasQuote};
use crate::network::nonce::NonceManager;
use crate::network::pool::ConnectionPool;
use crate::network::rpc::{
    RpcReceipt, RpcRequest, SubmissionErrorKind, classify_submission_error,
};
use crate::network::signer::TransactionSigner;
use crate::services::retry::backoff::delay_for;
use crate::services::retry::confirm::{ConfirmationTracker, Progress};
use crate::services::retry::job::{
    ExecutionError, ExecutionOutcome, FailureReason, JobStatus, MonitorEntry, RetryPolicy,
    TransactionJob, TxPayload,
};
use alloy::primitives::{Address, B256, U256};
use alloy::rpc::types::TransactionRequest;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

type Terminal = Result<RpcReceipt, (FailureReason, Option<RpcReceipt>)>;

struct ActiveJob {
    status: watch::Receiver<JobStatus>,
    cancel: CancellationToken,
}

struct Inner {
    pool: Arc<ConnectionPool>,
    gas: Arc<GasOptimizer>,
    nonces: NonceManager,
    signer: Option<Arc<dyn TransactionSigner>>,
    events: EventBus,
    active: DashMap<JobId, ActiveJob>,
    monitored: DashMap<B256, MonitorEntry>,
    finished: Mutex<BoundedMap<JobId, JobStatus>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Handle to a running job.
pub struct JobHandle {
    id: JobId,
    network: String,
    status: watch::Receiver<JobStatus>,
    result: oneshot::Receiver<Result<ExecutionOutcome, ExecutionError>>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn status(&self) -> JobStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status.clone()
    }

    pub async fn wait(self) -> Result<ExecutionOutcome, ExecutionError> {
        match self.result.await {
            Ok(result) => result,
            Err(_) => {
                let last = self.status.borrow().clone();
                Err(ExecutionError {
                    job_id: self.id,
                    network: self.network,
                    reason: FailureReason::Aborted {
                        message: "job driver stopped without a result".into(),
                    },
                    attempts: last.attempts,
                    last_hash: last.hash,
                    receipt: None,
                })
            }
        }
    }
}

#[derive(Clone)]
pub struct RetryManager {
    inner: Arc<Inner>,
}

impl RetryManager {
    pub fn new(
        pool: Arc<ConnectionPool>,
        gas: Arc<GasOptimizer>,
        signer: Option<Arc<dyn TransactionSigner>>,
        events: EventBus,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                nonces: NonceManager::new(pool.clone()),
                pool,
                gas,
                signer,
                events,
                active: DashMap::new(),
                monitored: DashMap::new(),
                finished: Mutex::new(BoundedMap::new(FINISHED_JOB_HISTORY)),
                shutdown: CancellationToken::new(),
                tasks: TaskTracker::new(),
            }),
        }
    }

    /// Start a job and return immediately.
    pub fn submit(
        &self,
        network: &str,
        payload: TxPayload,
        policy: RetryPolicy,
    ) -> Result<JobHandle, AppError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(AppError::Shutdown);
        }
        policy.validate()?;
        let chain_id = self.inner.pool.network(network)?.config().chain_id;
        let sender = match (&self.inner.signer, payload.from) {
            (Some(signer), Some(from)) if from != signer.address() => {
                return Err(AppError::Validation {
                    field: "payload.from".into(),
                    message: format!("{from} does not match signer {}", signer.address()),
                });
            }
            (Some(signer), _) => Some(signer.address()),
            (None, from) => from,
        };

        let job = TransactionJob::new(network.to_string(), payload, policy);
        let id = job.id;
        let poll_interval = job
            .policy
            .poll_interval
            .unwrap_or_else(|| default_receipt_poll_interval(chain_id));
        let (status_tx, status_rx) = watch::channel(job.status());
        let cancel = CancellationToken::new();
        self.inner.active.insert(
            id,
            ActiveJob {
                status: status_rx.clone(),
                cancel: cancel.clone(),
            },
        );

        tracing::info!(
            target: "retry",
            job = %id,
            network,
            to = %job.payload.to,
            strategy = job.policy.gas_strategy.as_str(),
            max_retries = job.policy.max_retries,
            "Job submitted"
        );

        let driver = JobDriver {
            inner: self.inner.clone(),
            job,
            chain_id,
            sender,
            poll_interval,
            tracker: ConfirmationTracker::default(),
            status_tx,
            cancel,
            cancel_requested: false,
            cancel_hash: None,
            bumps: 0,
            previous_fee: None,
            nonce_managed: false,
        };
        let (result_tx, result_rx) = oneshot::channel();
        self.inner.tasks.spawn(async move {
            let result = driver.run().await;
            let _ = result_tx.send(result);
        });

        Ok(JobHandle {
            id,
            network: network.to_string(),
            status: status_rx,
            result: result_rx,
        })
    }

    /// Submit and wait for the terminal outcome.
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
        if let Some(active) = self.inner.active.get(&id) {
            return Some(active.status.borrow().clone());
        }
        self.inner
            .finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&id)
            .cloned()
    }

    /// Request cancellation. Returns `false` for unknown or finished jobs.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.inner.active.get(&id) {
            Some(active) => {
                tracing::info!(target: "retry", job = %id, "Cancellation requested");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn active_jobs(&self) -> usize {
        self.inner.active.len()
    }

    /// Job currently monitoring `hash`, if any.
    pub fn job_for_hash(&self, hash: &B256) -> Option<JobId> {
        self.inner.monitored.get(hash).map(|entry| entry.job_id)
    }

    /// Stop every driver and wait for them to report.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        tracing::info!(target: "retry", "Retry manager stopped");
    }
}

/// How the next broadcast is priced.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NextSend {
    Fresh,
    /// Same transaction again, same fees.
    Rebroadcast,
    /// Outbid the last quote at the same nonce.
    Bump,
}

enum WaitOutcome {
    Confirmed(RpcReceipt),
    Reverted(RpcReceipt),
    CancelConfirmed(RpcReceipt),
    Stuck,
    Deadline,
    Shutdown,
}

enum Wake {
    Tick,
    Cancel,
    Deadline,
    Shutdown,
}

struct JobDriver {
    inner: Arc<Inner>,
    job: TransactionJob,
    chain_id: u64,
    sender: Option<Address>,
    poll_interval: Duration,
    tracker: ConfirmationTracker,
    status_tx: watch::Sender<JobStatus>,
    cancel: CancellationToken,
    cancel_requested: bool,
    cancel_hash: Option<B256>,
    bumps: u32,
    previous_fee: Option<u128>,
    nonce_managed: bool,
}

impl JobDriver {
    async fn run(mut self) -> Result<ExecutionOutcome, ExecutionError> {
        let terminal = self.drive().await;
        self.return_unused_nonce().await;
        self.finish(terminal)
    }

    /// A nonce reserved for a job that never had a broadcast accepted would
    /// otherwise leave a gap that stalls every later job from this sender.
    async fn return_unused_nonce(&mut self) {
        if !self.nonce_managed || !self.job.hashes.is_empty() {
            return;
        }
        if let (Some(sender), Some(nonce)) = (self.sender, self.job.nonce) {
            self.inner
                .nonces
                .release(&self.job.network, sender, nonce)
                .await;
            self.job.nonce = None;
            self.nonce_managed = false;
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.job.status());
    }

    fn transition(&mut self, to: JobState) {
        let from = self.job.state;
        if from == to {
            return;
        }
        self.job.state = to;
        tracing::debug!(
            target: "retry",
            job = %self.job.id,
            from = from.as_str(),
            to = to.as_str(),
            "Job state changed"
        );
        self.inner.events.emit(EngineEvent::JobStateChanged {
            job: self.job.id,
            network: self.job.network.clone(),
            from,
            to,
        });
        self.publish();
    }

    fn timed_out(&self) -> Terminal {
        Err((
            FailureReason::Timeout {
                elapsed_ms: self.job.started_at.elapsed().as_millis() as u64,
            },
            None,
        ))
    }

    fn aborted(&self) -> Terminal {
        Err((
            FailureReason::Aborted {
                message: "engine shutting down".into(),
            },
            None,
        ))
    }

    fn can_bump(&self) -> bool {
        self.job.policy.enable_replacement
            && self.job.nonce.is_some()
            && self.bumps < self.job.policy.max_replacements
    }

    async fn drive(&mut self) -> Terminal {
        let deadline = self.job.deadline();
        let shutdown = self.inner.shutdown.clone();
        let mut next = NextSend::Fresh;
        let mut last_error = String::from("no attempt made");
        let mut last_wait_stuck = false;

        loop {
            if Instant::now() >= deadline {
                return self.timed_out();
            }
            if self.cancel.is_cancelled() {
                if self.job.hashes.is_empty() {
                    return Err((FailureReason::Cancelled, None));
                }
                if !self.cancel_requested {
                    self.send_cancel().await;
                }
                let outcome = self.await_receipt(deadline, None).await;
                return self.settle(outcome);
            }
            if self.job.attempts >= self.job.policy.max_retries {
                let reason = if last_wait_stuck {
                    FailureReason::Timeout {
                        elapsed_ms: self.job.started_at.elapsed().as_millis() as u64,
                    }
                } else {
                    FailureReason::Exhausted { last_error }
                };
                return Err((reason, None));
            }

            self.job.attempts += 1;
            self.job.last_attempt_at = Some(Instant::now());
            self.inner.events.emit(EngineEvent::AttemptStarted {
                job: self.job.id,
                attempt: self.job.attempts,
            });
            self.publish();

            let sent = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return self.aborted(),
                _ = sleep_until(deadline) => return self.timed_out(),
                res = self.send_attempt(next) => res,
            };

            match sent {
                Ok(hash) => {
                    self.on_broadcast(hash, next);
                    if let Some(terminal) = self.watch(deadline).await {
                        return terminal;
                    }
                    last_wait_stuck = true;
                    last_error = self.stuck_error();
                    next = self.after_stuck();
                    if next == NextSend::Bump {
                        continue;
                    }
                }
                Err(e) => {
                    last_wait_stuck = false;
                    last_error = e.to_string();
                    let kind = classify_submission_error(&e);
                    tracing::warn!(
                        target: "retry",
                        job = %self.job.id,
                        network = %self.job.network,
                        attempt = self.job.attempts,
                        ?kind,
                        error = %e,
                        "Submission failed"
                    );
                    match kind {
                        // The node still holds our last broadcast: keep watching it.
                        SubmissionErrorKind::AlreadyKnown if !self.job.hashes.is_empty() => {
                            if let Some(terminal) = self.watch(deadline).await {
                                return terminal;
                            }
                            last_wait_stuck = true;
                            last_error = self.stuck_error();
                            next = self.after_stuck();
                            if next == NextSend::Bump {
                                continue;
                            }
                        }
                        // Our nonce is consumed: one of our broadcasts may have landed.
                        SubmissionErrorKind::NonceTooLow if !self.job.hashes.is_empty() => {
                            let outcome = self.await_receipt(deadline, None).await;
                            return self.settle(outcome);
                        }
                        SubmissionErrorKind::Underpriced if self.can_bump() => {
                            next = NextSend::Bump;
                            continue;
                        }
                        k if k.is_retryable() => {
                            next = if self.job.hashes.is_empty() {
                                NextSend::Fresh
                            } else {
                                NextSend::Rebroadcast
                            };
                        }
                        k => {
                            if k == SubmissionErrorKind::NonceTooLow
                                && self.nonce_managed
                                && let Some(sender) = self.sender
                            {
                                let _ = self.inner.nonces.resync(&self.job.network, sender).await;
                                // Already consumed on chain; never hand it out again.
                                self.nonce_managed = false;
                            }
                            return Err((
                                FailureReason::Rejected {
                                    kind: k,
                                    message: e.to_string(),
                                },
                                None,
                            ));
                        }
                    }
                }
            }

            if self.job.attempts >= self.job.policy.max_retries {
                continue;
            }
            let delay = delay_for(&self.job.policy, self.job.attempts);
            self.inner.events.emit(EngineEvent::RetryScheduled {
                job: self.job.id,
                attempt: self.job.attempts + 1,
                delay,
                error: last_error.clone(),
            });
            tracing::debug!(
                target: "retry",
                job = %self.job.id,
                delay_ms = delay.as_millis() as u64,
                next_attempt = self.job.attempts + 1,
                "Retry scheduled"
            );
            let cancel = self.cancel.clone();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return self.aborted(),
                _ = sleep_until(deadline) => return self.timed_out(),
                _ = cancel.cancelled() => {}
                _ = sleep(delay) => {}
            }
        }
    }

    /// Wait on every broadcast hash; `None` once the wait has gone stuck.
    async fn watch(&mut self, deadline: Instant) -> Option<Terminal> {
        match self
            .await_receipt(deadline, Some(self.job.policy.stuck_after))
            .await
        {
            WaitOutcome::Stuck => None,
            other => Some(self.settle(other)),
        }
    }

    fn stuck_error(&self) -> String {
        format!(
            "no receipt within {}ms",
            self.job.policy.stuck_after.as_millis()
        )
    }

    fn after_stuck(&self) -> NextSend {
        tracing::warn!(
            target: "retry",
            job = %self.job.id,
            hash = ?self.job.last_hash(),
            attempt = self.job.attempts,
            "Transaction stuck"
        );
        if self.can_bump() {
            NextSend::Bump
        } else {
            NextSend::Rebroadcast
        }
    }

    fn settle(&self, outcome: WaitOutcome) -> Terminal {
        match outcome {
            WaitOutcome::Confirmed(receipt) => Ok(receipt),
            WaitOutcome::Reverted(receipt) => Err((
                FailureReason::Reverted {
                    block: receipt.block_number,
                },
                Some(receipt),
            )),
            WaitOutcome::CancelConfirmed(receipt) => Err((FailureReason::Cancelled, Some(receipt))),
            // Only reachable with a stuck limit, which settle callers never pass.
            WaitOutcome::Stuck | WaitOutcome::Deadline => self.timed_out(),
            WaitOutcome::Shutdown => self.aborted(),
        }
    }

    async fn ensure_nonce(&mut self) -> Result<(), AppError> {
        if self.job.nonce.is_some() {
            return Ok(());
        }
        let Some(sender) = self.sender else {
            // No known sender: the node assigns the nonce and replacement is off.
            return Ok(());
        };
        let nonce = self.inner.nonces.reserve(&self.job.network, sender).await?;
        self.job.nonce = Some(nonce);
        self.nonce_managed = true;
        Ok(())
    }

    fn draft(&self) -> TransactionRequest {
        let mut tx = self.job.payload.to_request(self.chain_id);
        tx.from = self.sender;
        tx.nonce = self.job.nonce;
        tx
    }

    async fn quote(&mut self, next: NextSend) -> Result<GasQuote, AppError> {
        let strategy = self.job.policy.gas_strategy;
        let previous = self.job.last_quote.clone();
        match (next, previous) {
            (NextSend::Rebroadcast, Some(last)) => Ok(last),
            (NextSend::Bump, Some(last)) => {
                let mut draft = self.draft();
                draft.gas = Some(last.gas_limit);
                let market = self
                    .inner
                    .gas
                    .estimate_gas(&self.job.network, &draft, strategy)
                    .await?;
                self.bumps += 1;
                Ok(last.outbid(&market, self.job.policy.replacement_multiplier_bps))
            }
            _ => {
                let draft = self.draft();
                self.inner
                    .gas
                    .estimate_gas(&self.job.network, &draft, strategy)
                    .await
            }
        }
    }

    async fn send_attempt(&mut self, next: NextSend) -> Result<B256, AppError> {
        self.ensure_nonce().await?;
        let quote = self.quote(next).await?;
        let mut tx = self.draft();
        quote.apply(&mut tx);
        self.previous_fee = self.job.last_quote.as_ref().map(|q| q.fee_cap());
        self.job.last_quote = Some(quote);
        self.broadcast(tx).await
    }

    async fn broadcast(&self, tx: TransactionRequest) -> Result<B256, AppError> {
        let network = self.job.network.as_str();
        match &self.inner.signer {
            Some(signer) => {
                let signed = signer.sign(self.chain_id, &tx)?;
                match self
                    .inner
                    .pool
                    .execute(network, RpcRequest::SendRawTransaction(signed.raw.clone()))
                    .await
                {
                    Ok(resp) => resp.into_transaction_hash(),
                    Err(e) if classify_submission_error(&e) == SubmissionErrorKind::AlreadyKnown => {
                        Ok(signed.hash)
                    }
                    Err(e) => Err(e),
                }
            }
            None => self
                .inner
                .pool
                .execute(network, RpcRequest::SendTransaction(Box::new(tx)))
                .await?
                .into_transaction_hash(),
        }
    }

    fn monitor(&mut self, hash: B256) {
        if !self.job.hashes.contains(&hash) {
            self.job.hashes.push(hash);
        }
        self.inner.monitored.insert(
            hash,
            MonitorEntry {
                job_id: self.job.id,
                network: self.job.network.clone(),
                nonce: self.job.nonce,
                broadcast_at: Instant::now(),
            },
        );
    }

    fn on_broadcast(&mut self, hash: B256, next: NextSend) {
        let previous = self.job.last_hash().filter(|h| *h != hash);
        self.monitor(hash);
        let fee = self.job.last_quote.as_ref().map(|q| q.fee_cap()).unwrap_or_default();

        match (next, previous) {
            (NextSend::Bump, Some(previous_hash)) => {
                self.job.replacements += 1;
                self.transition(JobState::Replaced);
                let previous_fee = self.previous_fee.unwrap_or_default();
                self.inner.events.emit(EngineEvent::ReplacementSent {
                    job: self.job.id,
                    nonce: self.job.nonce.unwrap_or_default(),
                    previous_hash,
                    hash,
                    previous_fee,
                    fee,
                });
                tracing::info!(
                    target: "retry",
                    job = %self.job.id,
                    nonce = self.job.nonce,
                    %previous_hash,
                    %hash,
                    fee,
                    "Replacement broadcast"
                );
                self.transition(JobState::Sent);
            }
            _ => {
                tracing::info!(
                    target: "retry",
                    job = %self.job.id,
                    network = %self.job.network,
                    attempt = self.job.attempts,
                    nonce = self.job.nonce,
                    %hash,
                    fee,
                    "Transaction broadcast"
                );
                self.transition(JobState::Sent);
            }
        }
        self.publish();
    }

    /// Zero-value self-transfer at the job's nonce, outbidding the last quote.
    async fn send_cancel(&mut self) {
        self.cancel_requested = true;
        let (Some(sender), Some(nonce), Some(last)) =
            (self.sender, self.job.nonce, self.job.last_quote.clone())
        else {
            tracing::warn!(
                target: "retry",
                job = %self.job.id,
                "Cannot cancel a broadcast without a known sender and nonce; monitoring until deadline"
            );
            return;
        };
        let mut quote = last.bumped(CANCEL_MULTIPLIER_BPS);
        quote.gas_limit = TRANSFER_GAS_LIMIT;
        let mut tx = TransactionRequest::default().to(sender).value(U256::ZERO);
        tx.from = Some(sender);
        tx.nonce = Some(nonce);
        tx.chain_id = Some(self.chain_id);
        quote.apply(&mut tx);

        match self.broadcast(tx).await {
            Ok(hash) => {
                let previous_hash = self.job.last_hash().unwrap_or_default();
                self.cancel_hash = Some(hash);
                self.monitor(hash);
                self.inner.events.emit(EngineEvent::ReplacementSent {
                    job: self.job.id,
                    nonce,
                    previous_hash,
                    hash,
                    previous_fee: last.fee_cap(),
                    fee: quote.fee_cap(),
                });
                tracing::info!(target: "retry", job = %self.job.id, %hash, nonce, "Cancellation broadcast");
                self.publish();
            }
            Err(e) => {
                tracing::warn!(
                    target: "retry",
                    job = %self.job.id,
                    error = %e,
                    "Cancellation broadcast failed; monitoring original"
                );
            }
        }
    }

    async fn find_receipt(&self) -> Option<RpcReceipt> {
        for hash in self.job.hashes.iter().rev() {
            match self
                .inner
                .pool
                .execute(&self.job.network, RpcRequest::TransactionReceipt(*hash))
                .await
                .and_then(|r| r.into_receipt())
            {
                Ok(Some(receipt)) => return Some(receipt),
                Ok(None) => {}
                Err(e) => tracing::debug!(
                    target: "retry",
                    job = %self.job.id,
                    %hash,
                    error = %e,
                    "Receipt poll failed"
                ),
            }
        }
        None
    }

    async fn head(&mut self, inclusion: u64) -> u64 {
        let observed = self
            .inner
            .pool
            .execute(&self.job.network, RpcRequest::BlockNumber)
            .await
            .and_then(|r| r.into_block_number())
            .unwrap_or(inclusion);
        self.tracker.observe_head(observed)
    }

    /// Poll every broadcast hash until one confirms, the wait turns stuck, or the job ends.
    async fn await_receipt(&mut self, deadline: Instant, stuck_after: Option<Duration>) -> WaitOutcome {
        let started = Instant::now();
        let shutdown = self.inner.shutdown.clone();
        let cancel = self.cancel.clone();
        let required = self.job.policy.confirmations;
        loop {
            let mut included = false;
            if let Some(receipt) = self.find_receipt().await {
                included = true;
                let is_cancel = Some(receipt.transaction_hash) == self.cancel_hash;
                if !receipt.status && !is_cancel {
                    return WaitOutcome::Reverted(receipt);
                }
                self.head(receipt.block_number).await;
                match self.tracker.record(&receipt, required) {
                    Progress::Confirmed | Progress::AlreadyConfirmed => {
                        let confirmed = self.tracker.confirmed().cloned().unwrap_or(receipt);
                        return if is_cancel {
                            WaitOutcome::CancelConfirmed(confirmed)
                        } else {
                            WaitOutcome::Confirmed(confirmed)
                        };
                    }
                    Progress::Included { confirmations } => {
                        tracing::trace!(
                            target: "retry",
                            job = %self.job.id,
                            confirmations,
                            required,
                            "Awaiting confirmations"
                        );
                    }
                }
            }
            if !included
                && !self.cancel_requested
                && let Some(limit) = stuck_after
                && started.elapsed() >= limit
            {
                return WaitOutcome::Stuck;
            }

            let wake = tokio::select! {
                biased;
                _ = shutdown.cancelled() => Wake::Shutdown,
                _ = sleep_until(deadline) => Wake::Deadline,
                _ = cancel.cancelled(), if !self.cancel_requested => Wake::Cancel,
                _ = sleep(self.poll_interval) => Wake::Tick,
            };
            match wake {
                Wake::Tick => {}
                Wake::Cancel => self.send_cancel().await,
                Wake::Deadline => return WaitOutcome::Deadline,
                Wake::Shutdown => return WaitOutcome::Shutdown,
            }
        }
    }

    fn finish(mut self, terminal: Terminal) -> Result<ExecutionOutcome, ExecutionError> {
        let result = match terminal {
            Ok(receipt) => {
                self.job.receipt = Some(receipt.clone());
                self.transition(JobState::Confirmed);
                Ok(ExecutionOutcome {
                    job_id: self.job.id,
                    network: self.job.network.clone(),
                    hash: receipt.transaction_hash,
                    gas_used: receipt.gas_used,
                    effective_gas_price: receipt.effective_gas_price,
                    receipt,
                    attempts: self.job.attempts,
                    replacements: self.job.replacements,
                })
            }
            Err((reason, receipt)) => {
                self.job.receipt = receipt.clone();
                self.job.error = Some(reason.clone());
                self.transition(reason.terminal_state());
                Err(ExecutionError {
                    job_id: self.job.id,
                    network: self.job.network.clone(),
                    reason,
                    attempts: self.job.attempts,
                    last_hash: self.job.last_hash(),
                    receipt,
                })
            }
        };

        self.publish();
        let status = self.job.status();
        self.inner
            .finished
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remember(self.job.id, status);
        self.inner.active.remove(&self.job.id);
        for hash in &self.job.hashes {
            self.inner.monitored.remove(hash);
        }

        let hash = match &result {
            Ok(outcome) => Some(outcome.hash),
            Err(err) => err.last_hash,
        };
        self.inner.events.emit(EngineEvent::JobTerminal {
            job: self.job.id,
            network: self.job.network.clone(),
            state: self.job.state,
            attempts: self.job.attempts,
            hash,
        });
        match &result {
            Ok(outcome) => tracing::info!(
                target: "retry",
                job = %outcome.job_id,
                network = %outcome.network,
                hash = %outcome.hash,
                attempts = outcome.attempts,
                replacements = outcome.replacements,
                block = outcome.receipt.block_number,
                "Job confirmed"
            ),
            Err(err) => tracing::warn!(
                target: "retry",
                job = %err.job_id,
                network = %err.network,
                attempts = err.attempts,
                last_hash = ?err.last_hash,
                reason = %err.reason,
                "Job failed"
            ),
        }
        result
    }
}
