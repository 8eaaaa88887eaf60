//! Bounded retry for flaky operations.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Re-invokes a fallible async operation until it succeeds or the attempts
/// are exhausted, surfacing the last error.
///
/// Used for info-file round trips and directory synchronization, which can
/// fail transiently on network filesystems.
#[derive(Debug, Clone, Copy)]
pub struct Retry {
    max_tries: u32,
    wait: Duration,
}

impl Retry {
    /// Create a retry policy with the given attempt count and pause
    /// between attempts.
    pub fn new(max_tries: u32, wait: Duration) -> Self {
        Self {
            max_tries: max_tries.max(1),
            wait,
        }
    }

    /// A policy that tries exactly once.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run the operation under this policy.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= self.max_tries => return Err(e),
                Err(e) => {
                    warn!(
                        "{e}; this was attempt {attempt} of {}, retrying in {:?}",
                        self.max_tries, self.wait
                    );
                    attempt += 1;
                    tokio::time::sleep(self.wait).await;
                }
            }
        }
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(30))
    }
}
