use std::time::Duration;

use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;

/// Exponential backoff w/ "full jitter":
/// sleep for a random duration in [0, min(cap, base * 2^attempt)].
///
/// This tends to behave well under contention and avoids lockstep retries.
pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    // Use millis math to avoid Duration overflow footguns.
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    // 2^attempt, saturating if attempt is huge.
    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1); // avoid 0ms upper bound

    // Full jitter: uniform random in [0, upper]
    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

/// Deterministic variant of the backoff term: min(cap, base * 2^attempt).
///
/// Used where the caller wants a schedule deadline rather than a sleep.
pub fn backoff_capped(base: Duration, cap: Duration, attempt: usize) -> Duration {
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;
    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };
    Duration::from_millis(base_ms.saturating_mul(pow).min(cap_ms).max(1))
}

pub async fn sleep_with_backoff(
    cancel: &CancellationToken,
    base: Duration,
    cap: Duration,
    attempt: usize,
) -> Result<()> {
    let delay = backoff_full_jitter(base, cap, attempt);
    tokio::select! {
        _ = cancel.cancelled() => bail!("Context cancelled"),
        _ = tokio::time::sleep(delay) => {}
    }
    Ok(())
}
