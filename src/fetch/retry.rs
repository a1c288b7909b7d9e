//! Bounded retry with a fixed wait between attempts.

use async_trait::async_trait;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self { max_attempts, wait }
    }
}

/// Waits between attempts. Tests substitute an implementation that returns
/// immediately.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Runs `attempt` (called with the 1-based attempt number) until it
/// succeeds or `policy.max_attempts` attempts have failed. Exhaustion is
/// reported as `None`; the caller decides what a skipped period means.
pub async fn retry<T, E, F, Fut, S>(policy: &RetryPolicy, sleeper: &S, mut attempt: F) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    S: Sleeper + ?Sized,
{
    for n in 1..=policy.max_attempts {
        match attempt(n).await {
            Ok(value) => return Some(value),
            Err(e) if n < policy.max_attempts => {
                warn!(
                    attempt = n,
                    max_attempts = policy.max_attempts,
                    wait_secs = policy.wait.as_secs(),
                    error = %e,
                    "Attempt failed, retrying"
                );
                sleeper.sleep(policy.wait).await;
            }
            Err(e) => {
                warn!(attempt = n, error = %e, "Attempt failed, giving up");
            }
        }
    }
    None
}
