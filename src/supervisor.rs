//! Reconnect supervision with capped exponential backoff.
//!
//! The supervisor owns the retry schedule only; the actual connect action
//! is passed in as an async closure so it can be exercised against fake
//! transports. Backoff waits race against the shutdown signal, so a
//! shutdown request interrupts even a multi-second delay immediately.

use std::future::Future;
use std::time::Duration;

use log::{info, warn};
use tokio::sync::watch;

use crate::config::ReconnectSettings;
use crate::error::{AppResult, SmuError};

/// Parameters of the retry schedule.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            backoff_factor: 1.5,
            max_delay: Duration::from_secs(3),
        }
    }
}

impl From<&ReconnectSettings> for ReconnectPolicy {
    fn from(settings: &ReconnectSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            initial_delay: settings.initial_delay,
            backoff_factor: settings.backoff_factor,
            max_delay: settings.max_delay,
        }
    }
}

/// Pure backoff ladder; yields the wait before each successive attempt.
#[derive(Debug)]
pub struct BackoffState {
    next: Duration,
}

impl BackoffState {
    pub fn new(policy: &ReconnectPolicy) -> Self {
        Self {
            next: policy.initial_delay.min(policy.max_delay),
        }
    }

    /// Delay to wait before the upcoming attempt, then advance the ladder.
    pub fn next_delay(&mut self, policy: &ReconnectPolicy) -> Duration {
        let current = self.next;
        self.next = current.mul_f64(policy.backoff_factor).min(policy.max_delay);
        current
    }

    pub fn reset(&mut self, policy: &ReconnectPolicy) {
        self.next = policy.initial_delay.min(policy.max_delay);
    }
}

/// Sleep that aborts early on shutdown. Returns `true` when cancelled.
pub(crate) async fn wait_or_cancel(
    delay: Duration,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

/// Drives repeated connect attempts until one succeeds, the schedule is
/// exhausted, or shutdown is requested.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSupervisor {
    policy: ReconnectPolicy,
}

impl ConnectionSupervisor {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Run the reconnect schedule. Each attempt is preceded by its backoff
    /// wait. Returns the 1-based attempt number that succeeded,
    /// `SmuError::Cancelled` when shutdown interrupted the schedule, or
    /// `SmuError::CriticalDisconnect` when every attempt failed.
    pub async fn run<F, Fut>(
        &self,
        mut connect: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AppResult<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<()>>,
    {
        let mut backoff = BackoffState::new(&self.policy);
        for attempt in 1..=self.policy.max_attempts {
            let delay = backoff.next_delay(&self.policy);
            if wait_or_cancel(delay, shutdown).await {
                info!("reconnect cancelled by shutdown before attempt {attempt}");
                return Err(SmuError::Cancelled);
            }
            match connect().await {
                Ok(()) => {
                    info!(
                        "reconnected on attempt {attempt}/{}",
                        self.policy.max_attempts
                    );
                    return Ok(attempt);
                }
                Err(err) => {
                    warn!(
                        "reconnect attempt {attempt}/{} failed: {err}",
                        self.policy.max_attempts
                    );
                }
            }
        }
        Err(SmuError::CriticalDisconnect {
            attempts: self.policy.max_attempts,
        })
    }
}
