use std::time::Duration;
use tokio::time::sleep;

/// Exponential backoff with a delay cap and an optional attempt budget
///
/// `max_retries: None` retries forever (used for the source connection,
/// which must recover rather than give up).
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    max_retries: Option<u32>,
    current_attempt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxRetriesExceeded;

impl std::fmt::Display for MaxRetriesExceeded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Maximum retry attempts exceeded")
    }
}

impl std::error::Error for MaxRetriesExceeded {}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration, retries: u32) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: Some(retries),
            current_attempt: 0,
        }
    }

    pub fn unbounded(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            max_retries: None,
            current_attempt: 0,
        }
    }

    /// Delay for the next attempt, or an error once the budget is spent
    pub fn next_delay(&self) -> Result<Duration, MaxRetriesExceeded> {
        if let Some(max) = self.max_retries {
            if self.current_attempt >= max {
                return Err(MaxRetriesExceeded);
            }
        }

        let factor = 2u32.saturating_pow(self.current_attempt.min(31));
        Ok(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }

    pub async fn sleep(&mut self) -> Result<(), MaxRetriesExceeded> {
        let delay = self.next_delay()?;

        match self.max_retries {
            Some(max) => log::warn!(
                "⏳ Retry attempt {} of {} in {}ms",
                self.current_attempt + 1,
                max,
                delay.as_millis()
            ),
            None => log::warn!(
                "⏳ Retry attempt {} in {}ms",
                self.current_attempt + 1,
                delay.as_millis()
            ),
        }

        sleep(delay).await;
        self.current_attempt = self.current_attempt.saturating_add(1);
        Ok(())
    }

    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }

    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }
}
