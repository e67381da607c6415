//! Retry policy with capped exponential backoff.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{ErrorInfo, ErrorKind};

/// Progress of one failing operation through the policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
  /// Attempts made so far
  pub attempt: u32,
  pub next_delay: Duration,
}

/// Decides whether and when a failed operation is attempted again.
///
/// Backoff doubles per retry: `min(base_delay * 2^attempt, max_delay)`.
/// Query policies retry anything classified retryable; mutation policies
/// additionally restrict retries to network, server and rate-limit errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts including the first one
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub conservative: bool,
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      base_delay,
      max_delay: max_delay.max(base_delay),
      conservative: false,
    }
  }

  /// Default read policy: 3 attempts, 1s base, 30s cap.
  pub fn queries() -> Self {
    Self::new(3, Duration::from_secs(1), Duration::from_secs(30))
  }

  /// Default write policy: 2 attempts, transient failures only.
  pub fn mutations() -> Self {
    Self::new(2, Duration::from_secs(1), Duration::from_secs(30)).conservative()
  }

  /// A policy that never retries.
  pub fn never() -> Self {
    Self::new(1, Duration::ZERO, Duration::ZERO)
  }

  pub fn conservative(mut self) -> Self {
    self.conservative = true;
    self
  }

  /// Whether to try again after `attempt` attempts have failed, the last
  /// one with `error`.
  pub fn should_retry(&self, error: &ErrorInfo, attempt: u32) -> bool {
    if !error.retryable || attempt >= self.max_attempts {
      return false;
    }
    if self.conservative {
      return matches!(
        error.kind,
        ErrorKind::Network | ErrorKind::ServerError | ErrorKind::RateLimited
      );
    }
    true
  }

  /// Backoff before retry number `attempt` (zero-based).
  pub fn delay_for(&self, attempt: u32) -> Duration {
    2u32
      .checked_pow(attempt)
      .and_then(|factor| self.base_delay.checked_mul(factor))
      .unwrap_or(self.max_delay)
      .min(self.max_delay)
  }

  /// Drive `operation` until it succeeds or the policy gives up.
  pub async fn run<F, Fut, T>(&self, mut operation: F) -> Result<T, ErrorInfo>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ErrorInfo>>,
  {
    let mut state = RetryState::default();
    loop {
      state.attempt += 1;
      match operation().await {
        Ok(value) => {
          if state.attempt > 1 {
            debug!(attempt = state.attempt, "succeeded after retry");
          }
          return Ok(value);
        }
        Err(error) => {
          if !self.should_retry(&error, state.attempt) {
            return Err(error);
          }
          state.next_delay = self.delay_for(state.attempt - 1);
          warn!(
            attempt = state.attempt,
            max_attempts = self.max_attempts,
            kind = %error.kind,
            delay_ms = state.next_delay.as_millis() as u64,
            "retrying after failure"
          );
          sleep(state.next_delay).await;
        }
      }
    }
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::queries()
  }
}
