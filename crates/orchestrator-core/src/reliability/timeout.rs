//! Per-step timeout wrapping.
//!
//! The teacher's `TimeoutManager` scans a background queue of in-flight
//! activities looking for ones past their deadline. Spec §4.4's per-step
//! timeout is simpler than that: each step dispatch is one future, so it's
//! wrapped directly in `tokio::time::timeout` rather than tracked out of
//! band.

use std::future::Future;
use std::time::Duration;

/// Default step timeout (spec §4.4): 600s, with `policy` steps defaulting
/// to 300s instead.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_POLICY_STEP_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of racing a step future against its deadline.
pub enum TimeoutOutcome<T> {
    Completed(T),
    TimedOut,
}

/// Runs `fut` to completion or until `timeout` elapses, whichever is first.
pub async fn with_timeout<T>(timeout: Duration, fut: impl Future<Output = T>) -> TimeoutOutcome<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(value) => TimeoutOutcome::Completed(value),
        Err(_) => TimeoutOutcome::TimedOut,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_deadline() {
        let result = with_timeout(Duration::from_millis(50), async { 42 }).await;
        assert!(matches!(result, TimeoutOutcome::Completed(42)));
    }

    #[tokio::test]
    async fn times_out_past_deadline() {
        let result = with_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            42
        })
        .await;
        assert!(matches!(result, TimeoutOutcome::TimedOut));
    }
}
