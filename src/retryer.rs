//! Retry and backoff driver for a single asynchronous operation.
//!
//! A [`Retryer`] runs an operation until it succeeds, the [`RetryPolicy`] gives
//! up, or its [`CancellationToken`] fires. Cancellation is observed promptly
//! both during an attempt and during a backoff delay.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::QueryError;
use crate::manager::OnlineManager;

/// Upper bound of the default exponential backoff.
const MAX_DEFAULT_DELAY: Duration = Duration::from_secs(30);

/// Whether a failed attempt is retried.
#[derive(Clone, Default)]
pub enum RetryPolicy {
    /// Never retry; the first failure is final.
    Never,
    /// Retry forever.
    Always,
    /// Retry up to this many times after the first failure.
    Count(u32),
    /// Decide per failure. Receives the number of failures so far (starting at
    /// zero for the first failure) and the error.
    Predicate(Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>),
    /// Three retries.
    #[default]
    Default,
}

impl RetryPolicy {
    /// Build a predicate policy.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(u32, &QueryError) -> bool + Send + Sync + 'static,
    {
        RetryPolicy::Predicate(Arc::new(f))
    }

    /// Returns `true` if the failure numbered `failure_count` should be retried.
    pub fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Always => true,
            RetryPolicy::Count(max) => failure_count < *max,
            RetryPolicy::Predicate(f) => f(failure_count, error),
            RetryPolicy::Default => failure_count < 3,
        }
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry {
            RetryPolicy::Always
        } else {
            RetryPolicy::Never
        }
    }
}

impl From<u32> for RetryPolicy {
    fn from(count: u32) -> Self {
        RetryPolicy::Count(count)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Never => write!(f, "Never"),
            RetryPolicy::Always => write!(f, "Always"),
            RetryPolicy::Count(n) => write!(f, "Count({})", n),
            RetryPolicy::Predicate(_) => write!(f, "Predicate(..)"),
            RetryPolicy::Default => write!(f, "Default"),
        }
    }
}

/// Delay before the next attempt.
#[derive(Clone, Default)]
pub enum RetryDelay {
    /// `min(1s * 2^failures, 30s)`.
    #[default]
    Exponential,
    /// A constant delay.
    Fixed(Duration),
    /// Computed from the failure count (starting at one) and the error.
    Custom(Arc<dyn Fn(u32, &QueryError) -> Duration + Send + Sync>),
}

impl RetryDelay {
    /// Build a custom delay function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32, &QueryError) -> Duration + Send + Sync + 'static,
    {
        RetryDelay::Custom(Arc::new(f))
    }

    /// Delay after the `failure_count`-th failure.
    pub fn delay(&self, failure_count: u32, error: &QueryError) -> Duration {
        match self {
            RetryDelay::Exponential => {
                let factor = 1u64.checked_shl(failure_count).unwrap_or(u64::MAX);
                Duration::from_millis(1000u64.saturating_mul(factor)).min(MAX_DEFAULT_DELAY)
            }
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Custom(f) => f(failure_count, error),
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Exponential => write!(f, "Exponential"),
            RetryDelay::Fixed(d) => write!(f, "Fixed({:?})", d),
            RetryDelay::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// When fetches may run relative to connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NetworkMode {
    /// Attempts only run while online; otherwise the fetch pauses.
    #[default]
    Online,
    /// Attempts always run.
    Always,
    /// The first attempt always runs; retries pause while offline.
    OfflineFirst,
}

/// Observes retryer progress.
///
/// All methods default to doing nothing.
pub trait RetryHooks: Send + Sync {
    /// Called after a failed attempt that will be retried.
    #[inline]
    fn on_fail(&self, _failure_count: u32, _error: &QueryError) {}

    /// Called when the retryer starts waiting for connectivity.
    #[inline]
    fn on_pause(&self) {}

    /// Called when the retryer resumes after a pause.
    #[inline]
    fn on_continue(&self) {}
}

/// Hooks that ignore every event.
pub struct NoopHooks;

impl RetryHooks for NoopHooks {}

/// Retry configuration.
#[derive(Debug, Clone, Default)]
pub struct RetryConfig {
    /// Whether failures are retried.
    pub retry: RetryPolicy,
    /// Backoff between attempts.
    pub retry_delay: RetryDelay,
    /// Connectivity requirements.
    pub network_mode: NetworkMode,
}

/// Drives one operation through the retry policy.
pub struct Retryer {
    config: RetryConfig,
    token: CancellationToken,
    online: OnlineManager,
    hooks: Arc<dyn RetryHooks>,
}

impl Retryer {
    /// Create a retryer that is always online and has no hooks.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            token: CancellationToken::new(),
            online: OnlineManager::default(),
            hooks: Arc::new(NoopHooks),
        }
    }

    /// Use `token` to cancel the operation.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Use `online` to decide whether attempts may run.
    pub fn with_online_manager(mut self, online: OnlineManager) -> Self {
        self.online = online;
        self
    }

    /// Report progress to `hooks`.
    pub fn with_hooks(mut self, hooks: Arc<dyn RetryHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// The token that cancels this retryer.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Abort the pending attempt or backoff.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    fn can_run(&self, failure_count: u32) -> bool {
        match self.config.network_mode {
            NetworkMode::Always => true,
            NetworkMode::OfflineFirst if failure_count == 0 => true,
            NetworkMode::Online | NetworkMode::OfflineFirst => self.online.is_online(),
        }
    }

    async fn wait_until_runnable(&self) -> Result<(), QueryError> {
        self.hooks.on_pause();
        tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(QueryError::Cancelled),
            _ = self.online.wait_online() => {}
        }
        self.hooks.on_continue();
        Ok(())
    }

    /// Run `operation` until it succeeds, the policy stops retrying, or the
    /// retryer is cancelled.
    pub async fn run<T, F, Fut>(&self, mut operation: F) -> Result<T, QueryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueryError>>,
    {
        let mut failure_count = 0u32;
        loop {
            if self.token.is_cancelled() {
                return Err(QueryError::Cancelled);
            }
            if !self.can_run(failure_count) {
                self.wait_until_runnable().await?;
            }

            let outcome = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(QueryError::Cancelled),
                outcome = operation() => outcome,
            };

            let error = match outcome {
                Ok(value) => return Ok(value),
                Err(error) if error.is_cancelled() => return Err(error),
                Err(error) => error,
            };

            if !self.config.retry.should_retry(failure_count, &error) {
                return Err(error);
            }

            failure_count += 1;
            self.hooks.on_fail(failure_count, &error);
            let delay = self.config.retry_delay.delay(failure_count, &error);
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(QueryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
