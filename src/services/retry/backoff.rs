// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@on1.no>

use crate::domain::types::BackoffStrategy;
use crate::services::retry::job::RetryPolicy;
use rand::Rng;
use std::time::Duration;

/// Delay before attempt `attempt + 1`, without jitter. `attempt` is 1-based.
pub fn base_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let n = attempt.max(1);
    let raw = match policy.backoff {
        BackoffStrategy::Exponential => {
            let factor = 1u32.checked_shl(n - 1).unwrap_or(u32::MAX);
            policy.backoff_base.saturating_mul(factor)
        }
        BackoffStrategy::Linear => policy.backoff_base.saturating_mul(n),
    };
    raw.min(policy.backoff_max)
}

/// `base_delay` plus uniform jitter in `[0, jitter_ratio × delay]`.
pub fn delay_for(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = base_delay(policy, attempt);
    let spread = delay.mul_f64(policy.jitter_ratio.clamp(0.0, 1.0));
    if spread.is_zero() {
        return delay;
    }
    let jitter = rand::thread_rng().gen_range(Duration::ZERO..=spread);
    delay + jitter
}
