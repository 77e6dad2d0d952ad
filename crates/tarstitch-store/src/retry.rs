//! Backoff for transient store failures
//!
//! Every store call made during assembly goes through [`RetryPolicy::run`].
//! Errors that [`StoreError::should_retry`] accepts are repeated with
//! exponential backoff. The caller's cancellation token ends the call in
//! flight or the backoff sleep at once, so an interrupted archive never
//! waits out a long delay before its upload is aborted.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use rand::{RngExt, rng};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::{StoreError, StoreResult};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 100;
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Largest fraction added to a delay when jitter is on
const JITTER_SPREAD: f64 = 0.3;

/// Retry settings for store calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first failure
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Cap on any single delay
    pub max_backoff: Duration,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Stretch each delay by up to 30% so part workers do not retry in lockstep
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_MAX_BACKOFF_MS),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that gives up after the first failure
    pub fn none() -> Self {
        Self {
            max_attempts: 0,
            ..Self::default()
        }
    }

    /// Read the policy from `TARSTITCH_MAX_RETRIES`,
    /// `TARSTITCH_RETRY_BACKOFF_MS`, `TARSTITCH_MAX_BACKOFF_MS`,
    /// `TARSTITCH_BACKOFF_MULTIPLIER` and `TARSTITCH_RETRY_JITTER`
    ///
    /// Unset variables keep their defaults. A value that does not parse, or a
    /// policy that fails [`validate`](Self::validate), is a configuration
    /// error.
    pub fn from_env() -> StoreResult<Self> {
        let policy = Self {
            max_attempts: env_or("TARSTITCH_MAX_RETRIES", DEFAULT_MAX_ATTEMPTS)?,
            initial_backoff: Duration::from_millis(env_or(
                "TARSTITCH_RETRY_BACKOFF_MS",
                DEFAULT_BACKOFF_MS,
            )?),
            max_backoff: Duration::from_millis(env_or(
                "TARSTITCH_MAX_BACKOFF_MS",
                DEFAULT_MAX_BACKOFF_MS,
            )?),
            multiplier: env_or("TARSTITCH_BACKOFF_MULTIPLIER", 2.0)?,
            jitter: env_or("TARSTITCH_RETRY_JITTER", true)?,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Check that delays never shrink and the first one is within the cap
    pub fn validate(&self) -> StoreResult<()> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(StoreError::InvalidConfig(format!(
                "backoff multiplier must be at least 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_backoff > self.max_backoff {
            return Err(StoreError::InvalidConfig(format!(
                "initial backoff {:?} exceeds maximum backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        Ok(())
    }

    /// Delay before retry number `retry`, counted from 1, without jitter
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64()).max(0.0);
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }

    fn delay(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        if !self.jitter {
            return base;
        }
        base.mul_f64(1.0 + rng().random_range(0.0..JITTER_SPREAD))
    }

    /// Run `call`, retrying transient failures with backoff
    ///
    /// `operation` labels the log lines. Once `cancel` fires, the call in
    /// flight is dropped and [`StoreError::Cancelled`] is returned.
    pub async fn run<F, Fut, T>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut retry = 0;
        loop {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StoreError::Cancelled),
                result = call() => result,
            };
            let error = match result {
                Ok(value) => return Ok(value),
                Err(e) if !e.should_retry() || retry >= self.max_attempts => return Err(e),
                Err(e) => e,
            };

            retry += 1;
            let delay = self.delay(retry);
            warn!(
                "{} failed, retry {}/{} in {:?}: {}",
                operation, retry, self.max_attempts, delay, error
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(StoreError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> StoreResult<T> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| {
            StoreError::InvalidConfig(format!("{name} has an invalid value {value:?}"))
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
#[allow(
    unsafe_code,
    clippy::expect_used,
    clippy::unwrap_used,
    clippy::significant_drop_tightening
)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    const ENV_VARS: [&str; 5] = [
        "TARSTITCH_MAX_RETRIES",
        "TARSTITCH_RETRY_BACKOFF_MS",
        "TARSTITCH_MAX_BACKOFF_MS",
        "TARSTITCH_BACKOFF_MULTIPLIER",
        "TARSTITCH_RETRY_JITTER",
    ];

    fn policy(max_attempts: u32, initial_backoff: Duration) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff,
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: false,
        }
    }

    fn throttled() -> StoreError {
        StoreError::transient("upload_part", "dest", "archive.tar", "SlowDown")
    }

    fn clear_env() {
        for var in ENV_VARS {
            unsafe {
                std::env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_backoff_grows_to_cap() {
        let policy = RetryPolicy {
            max_backoff: Duration::from_millis(500),
            ..policy(10, Duration::from_millis(100))
        };
        let delays: Vec<_> = (1..=5).map(|retry| policy.backoff(retry)).collect();
        assert_eq!(
            delays,
            [100, 200, 400, 500, 500].map(Duration::from_millis).to_vec()
        );
        assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(500));
    }

    #[test]
    fn test_validate() {
        RetryPolicy::default().validate().expect("valid");

        let shrinking = RetryPolicy {
            multiplier: 0.5,
            ..RetryPolicy::default()
        };
        let err = shrinking.validate().expect_err("shrinking");
        assert!(err.is_configuration_error());

        let inverted = RetryPolicy {
            initial_backoff: Duration::from_secs(30),
            ..RetryPolicy::default()
        };
        assert!(inverted.validate().is_err());
    }

    // Environment variables are process-wide, so one test covers every case
    #[test]
    fn test_from_env() {
        clear_env();
        let policy = RetryPolicy::from_env().expect("defaults");
        assert_eq!(policy, RetryPolicy::default());

        unsafe {
            std::env::set_var("TARSTITCH_MAX_RETRIES", "5");
            std::env::set_var("TARSTITCH_RETRY_BACKOFF_MS", "200");
            std::env::set_var("TARSTITCH_MAX_BACKOFF_MS", "20000");
            std::env::set_var("TARSTITCH_BACKOFF_MULTIPLIER", "1.5");
            std::env::set_var("TARSTITCH_RETRY_JITTER", "false");
        }
        let policy = RetryPolicy::from_env().expect("valid values");
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(200));
        assert_eq!(policy.max_backoff, Duration::from_secs(20));
        assert!((policy.multiplier - 1.5).abs() < f64::EPSILON);
        assert!(!policy.jitter);

        unsafe {
            std::env::set_var("TARSTITCH_MAX_RETRIES", "lots");
        }
        let err = RetryPolicy::from_env().expect_err("unparsable value");
        assert!(err.to_string().contains("TARSTITCH_MAX_RETRIES"));

        unsafe {
            std::env::set_var("TARSTITCH_MAX_RETRIES", "5");
            std::env::set_var("TARSTITCH_BACKOFF_MULTIPLIER", "0.9");
        }
        assert!(RetryPolicy::from_env().is_err());

        clear_env();
    }

    #[tokio::test]
    async fn test_retry_on_transient_error() {
        let calls = AtomicU32::new(0);
        let start = Instant::now();
        let result = policy(3, Duration::from_millis(1))
            .run("upload_part", &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(throttled())
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.expect("third call succeeds"), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(3));
    }

    #[tokio::test]
    async fn test_no_retry_on_permanent_error() {
        let calls = AtomicU32::new(0);
        let result = policy(3, Duration::from_millis(1))
            .run("get_object_range", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StoreError::NotFound {
                    bucket: "src".to_string(),
                    key: "gone".to_string(),
                })
            })
            .await;

        assert!(result.expect_err("should fail").is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result = policy(2, Duration::from_millis(1))
            .run("upload_part", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(throttled())
            })
            .await;

        assert!(result.expect_err("should fail").should_retry());
        // Initial call plus two retries
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let trigger = cancel.clone();

        let start = Instant::now();
        let result = policy(5, Duration::from_secs(30))
            .run("upload_part_copy", &cancel, || {
                let counter = Arc::clone(&counter);
                let trigger = trigger.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    // Cancel while the policy is about to sleep for 30s
                    trigger.cancel();
                    Err::<(), _>(throttled())
                }
            })
            .await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancelled_token_skips_call() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);
        let result = RetryPolicy::default()
            .run("create_multipart_upload", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(StoreError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
