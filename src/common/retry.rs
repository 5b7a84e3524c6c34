// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2026 ® John Hauger Mitander <john@on1.no>

use crate::domain::error::AppError;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry a read with doubling delays while the error is transient.
///
/// Node-side rejections (`AppError::Rpc`) return at once: asking again
/// gets the same answer.
pub async fn retry_transient<F, Fut, T>(
    mut op: F,
    attempts: usize,
    initial_delay: Duration,
) -> Result<T, AppError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, AppError>>,
{
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < attempts && e.is_transient() => {
                tracing::debug!(attempt, error = %e, "Transient read failure, retrying");
                sleep(delay).await;
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
