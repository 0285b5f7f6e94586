//! Condition polling with a hard deadline.
//!
//! Replaces fixed sleeps after a scroll: the caller polls rendered content
//! until a predicate holds, and a timeout is an outcome rather than an error.

use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl WaitPolicy {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }
}

impl Default for WaitPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_millis(250))
    }
}

/// Result of [`poll_until`]. Both arms carry the last probed value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    TimedOut(T),
}

impl<T> WaitOutcome<T> {
    pub fn is_ready(&self) -> bool {
        matches!(self, WaitOutcome::Ready(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            WaitOutcome::Ready(v) | WaitOutcome::TimedOut(v) => v,
        }
    }
}

/// Probe repeatedly until `done` accepts the value or the policy's timeout
/// elapses. Always probes at least once. Probe errors propagate immediately.
pub async fn poll_until<T, P, Fut, D>(policy: WaitPolicy, mut probe: P, mut done: D) -> Result<WaitOutcome<T>>
where
    P: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    D: FnMut(&T) -> bool,
{
    let deadline = Instant::now() + policy.timeout;
    loop {
        let value = probe().await?;
        if done(&value) {
            return Ok(WaitOutcome::Ready(value));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(WaitOutcome::TimedOut(value));
        }
        let remaining = deadline - now;
        tokio::time::sleep(policy.poll_interval.min(remaining)).await;
    }
}
