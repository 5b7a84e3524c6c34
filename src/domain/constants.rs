// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@oxidity.com>

use std::time::Duration;

// =============================================================================
// NETWORK CONSTANTS
// =============================================================================

pub const CHAIN_ETHEREUM: u64 = 1;
pub const CHAIN_OPTIMISM: u64 = 10;
pub const CHAIN_BSC: u64 = 56;
pub const CHAIN_POLYGON: u64 = 137;
pub const CHAIN_BASE: u64 = 8453;
pub const CHAIN_ARBITRUM: u64 = 42161;

// Block times in seconds (approximate)
pub fn get_block_time(chain_id: u64) -> u64 {
    match chain_id {
        CHAIN_ETHEREUM => 12,
        CHAIN_BSC => 3,
        CHAIN_POLYGON | CHAIN_OPTIMISM | CHAIN_BASE => 2,
        CHAIN_ARBITRUM => 1,
        _ => 12, // Default
    }
}

/// Receipt poll cadence: half a block, never faster than 500ms.
pub fn default_receipt_poll_interval(chain_id: u64) -> Duration {
    let half_block_ms = get_block_time(chain_id).saturating_mul(1000) / 2;
    Duration::from_millis(half_block_ms.max(500))
}

// =============================================================================
// POOL CONSTANTS
// =============================================================================

pub const DEFAULT_MIN_CONNECTIONS: usize = 2;
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_IDLE_SWEEP_INTERVAL_MS: u64 = 60_000;
pub const DEFAULT_ACQUIRE_RETRIES: u32 = 3;
pub const DEFAULT_ACQUIRE_RETRY_DELAY_MS: u64 = 250;

// =============================================================================
// GAS & TRANSACTION CONSTANTS
// =============================================================================

pub const GWEI: u128 = 1_000_000_000;
pub const TRANSFER_GAS_LIMIT: u64 = 21_000;
pub const DEFAULT_FALLBACK_GAS_LIMIT: u64 = 500_000;
pub const DEFAULT_GAS_LIMIT_MARGIN_BPS: u64 = 2_000;
pub const DEFAULT_FEE_HISTORY_BLOCKS: u64 = 10;
pub const FEE_HISTORY_PERCENTILES: [f64; 3] = [25.0, 50.0, 90.0];
pub const DEFAULT_FAST_MULTIPLIER_BPS: u64 = 15_000;
pub const DEFAULT_ADAPTIVE_MAX_MULTIPLIER_BPS: u64 = 20_000;
pub const DEFAULT_FEE_CACHE_TTL_MS: u64 = 30_000;
/// Base fee can grow 12.5% per block; 2x covers six full blocks.
pub const BASE_FEE_HEADROOM_BPS: u64 = 20_000;
pub const DEFAULT_MIN_FEE_WEI: u128 = GWEI / 10;
pub const DEFAULT_MAX_FEE_WEI: u128 = 500 * GWEI;
pub const DEFAULT_PRIORITY_FEE_WEI: u128 = 2 * GWEI;

// =============================================================================
// RETRY CONSTANTS
// =============================================================================

pub const BPS_DENOMINATOR: u64 = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_MAX_REPLACEMENTS: u32 = 3;
pub const DEFAULT_REPLACEMENT_MULTIPLIER_BPS: u64 = 11_000;
/// Cancellation bumps harder so the self-transfer outbids the original.
pub const CANCEL_MULTIPLIER_BPS: u64 = 12_000;
pub const DEFAULT_CONFIRMATIONS: u64 = 1;
pub const DEFAULT_JOB_TIMEOUT_MS: u64 = 300_000;
pub const DEFAULT_STUCK_AFTER_MS: u64 = 60_000;
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 1_000;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_JITTER: f64 = 0.1;
pub const FINISHED_JOB_HISTORY: usize = 1_024;
pub const EVENT_CHANNEL_CAPACITY: usize = 1_024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_interval_tracks_block_time() {
        assert_eq!(
            default_receipt_poll_interval(CHAIN_ETHEREUM),
            Duration::from_secs(6)
        );
        assert_eq!(
            default_receipt_poll_interval(CHAIN_ARBITRUM),
            Duration::from_millis(500)
        );
    }
}
