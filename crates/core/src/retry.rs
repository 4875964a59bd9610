//! Flakiness retries around a single capture
//!
//! An attempt is unstable when it fails, times out, or (with
//! [`StabilityCheck::ConsecutiveMatch`]) does not match the image produced by
//! the attempt right before it. The last attempt is used once the budget is
//! spent, stable or not.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ShotResult;

/// Policy deciding whether a successful attempt is stable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityCheck {
    /// With retries available, an image is only accepted once two consecutive
    /// attempts agree within the target threshold
    #[default]
    ConsecutiveMatch,
    /// Only failures and timeouts are retried
    ErrorsOnly,
}

/// Retry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub flakyness_retries: u32,

    /// Delay between attempts (milliseconds)
    pub wait_between_flakyness_retries: u64,

    pub stability: StabilityCheck,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            flakyness_retries: 0,
            wait_between_flakyness_retries: 2000,
            stability: StabilityCheck::default(),
        }
    }
}

/// Final image (or error) plus the number of attempts it took
#[derive(Debug)]
pub struct RetryOutcome {
    pub result: ShotResult<Vec<u8>>,
    pub attempts: u32,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    retries: u32,
    delay: Duration,
    stability: StabilityCheck,
}

impl RetryController {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            retries: config.flakyness_retries,
            delay: Duration::from_millis(config.wait_between_flakyness_retries),
            stability: config.stability,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Run `attempt` until it is stable or the budget is exhausted.
    ///
    /// `attempt` receives the 1-based attempt number. `matches` compares the
    /// previous image against the new one and may hand the work off the runtime.
    pub async fn run<A, Fut, M, MFut>(&self, label: &str, mut attempt: A, mut matches: M) -> RetryOutcome
    where
        A: FnMut(u32) -> Fut,
        Fut: Future<Output = ShotResult<Vec<u8>>>,
        M: FnMut(Vec<u8>, Vec<u8>) -> MFut,
        MFut: Future<Output = bool>,
    {
        let max_attempts = self.max_attempts();
        let mut previous: Option<Vec<u8>> = None;
        let mut number = 1;

        loop {
            let result = attempt(number).await;
            let last = number >= max_attempts;

            match result {
                Ok(image) => {
                    let stable = match (self.stability, previous.take()) {
                        (StabilityCheck::ErrorsOnly, _) => true,
                        (StabilityCheck::ConsecutiveMatch, Some(prev)) => matches(prev, image.clone()).await,
                        // Nothing to confirm against yet
                        (StabilityCheck::ConsecutiveMatch, None) => max_attempts == 1,
                    };

                    if stable || last {
                        if !stable {
                            warn!("'{}' still unstable after {} attempt(s), keeping last image", label, number);
                        }
                        return RetryOutcome {
                            result: Ok(image),
                            attempts: number,
                        };
                    }

                    debug!("'{}' attempt {} unconfirmed, retrying", label, number);
                    previous = Some(image);
                }
                Err(e) => {
                    if last {
                        return RetryOutcome {
                            result: Err(e),
                            attempts: number,
                        };
                    }
                    warn!("'{}' attempt {}/{} failed: {}", label, number, max_attempts, e);
                    previous = None;
                }
            }

            number += 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
        }
    }
}
