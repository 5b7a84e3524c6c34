// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@oxidity.com>

pub mod backoff;
pub mod confirm;
pub mod job;
pub mod manager;

pub use job::{
    ExecutionError, ExecutionOutcome, FailureReason, JobStatus, RetryPolicy, TxPayload,
};
pub use manager::{JobHandle, RetryManager};
