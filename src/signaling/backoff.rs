use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Fixed-delay, bounded reconnect policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: 20,
        }
    }
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration, max_attempts: u32) -> Self {
        Self { delay, max_attempts }
    }

    /// Delay before reconnect attempt number `attempt` (0-based), or `None`
    /// once the budget is spent.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        (attempt < self.max_attempts).then_some(self.delay)
    }

    /// Sleep before `attempt`. Returns `false` when the budget is spent or
    /// `cancel` fires first.
    pub async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        let Some(delay) = self.delay_for(attempt) else {
            return false;
        };
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
