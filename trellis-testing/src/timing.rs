//! Time budgets for tests.
//!
//! Every duration derives from one base value so slow machines can stretch
//! the whole suite at once through `TRELLIS_TIMING_MULTIPLE`.

use std::time::Duration;
use tokio::sync::Semaphore;

const DEFAULT_BASE: Duration = Duration::from_millis(200);

/// Test time budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    base: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self::new()
    }
}

impl Timing {
    /// Budgets from the default base, scaled by `TRELLIS_TIMING_MULTIPLE`.
    pub fn new() -> Self {
        let multiple = std::env::var("TRELLIS_TIMING_MULTIPLE")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|multiple| *multiple > 0)
            .unwrap_or(1);
        Self::with_base(DEFAULT_BASE * multiple)
    }

    pub fn with_base(base: Duration) -> Self {
        Self { base }
    }

    /// Budgets `n` times as long.
    pub fn multiple(&self, n: u32) -> Self {
        Self::with_base(self.base * n)
    }

    /// Session timeout to give clients.
    pub fn session(&self) -> Duration {
        self.base * 5
    }

    /// Connection timeout to give clients.
    pub fn connection(&self) -> Duration {
        self.base * 2
    }

    /// Upper bound for anything a test waits on.
    pub fn wait(&self) -> Duration {
        self.base * 50
    }

    /// Short pause to let background work settle.
    pub async fn sleep_a_bit(&self) {
        tokio::time::sleep(self.base).await;
    }

    /// Take one permit from `semaphore` within [`wait`](Self::wait).
    pub async fn acquire_semaphore(&self, semaphore: &Semaphore) -> bool {
        match tokio::time::timeout(self.wait(), semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            _ => false,
        }
    }

    /// Poll `condition` until it holds or [`wait`](Self::wait) passes.
    pub async fn eventually(&self, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + self.wait();
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.base / 10).await;
        }
    }
}
