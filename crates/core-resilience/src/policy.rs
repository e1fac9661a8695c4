//! Execution policies applied around a protected operation
//!
//! - [`RetryConfig`]: exponential backoff with optional jitter and error allow/deny lists
//! - [`TimeoutConfig`]: overall deadline for the operation including its retries
//! - [`FallbackConfig`]: a function or static value used when the call cannot succeed

use super::error::ResilienceError;
use futures::future::BoxFuture;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retry behavior for a single `execute` call
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Multiplier applied per attempt (exponential backoff)
    pub backoff_multiplier: f64,
    /// Scale each delay by a uniform factor in `[0.5, 1.0]`
    pub jitter: bool,
    /// When non-empty, only these error kinds are retried
    pub retryable_errors: Vec<String>,
    /// Error kinds that are never retried
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: false,
            retryable_errors: Vec::new(),
            non_retryable_errors: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Delay to wait after the given (1-based) failed attempt
    ///
    /// `min(max_delay, initial_delay * multiplier^(attempt - 1))`, optionally jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64()).max(0.0);

        let factor = if self.jitter {
            rand::rng().random_range(0.5..=1.0)
        } else {
            1.0
        };

        Duration::from_secs_f64(capped * factor)
    }

    /// Whether an error of this kind may be retried
    pub fn should_retry(&self, error: &ResilienceError) -> bool {
        let kind = error.kind();

        if self.non_retryable_errors.iter().any(|k| k == kind) {
            return false;
        }

        if !self.retryable_errors.is_empty() {
            return self.retryable_errors.iter().any(|k| k == kind);
        }

        true
    }
}

/// Deadline applied around the whole protected call
#[derive(Clone)]
pub struct TimeoutConfig {
    pub enabled: bool,
    pub timeout: Duration,
    pub message: String,
    /// Invoked once when the deadline fires
    pub on_timeout: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl TimeoutConfig {
    pub fn new(timeout: Duration) -> Self {
        Self {
            enabled: true,
            timeout,
            message: "Operation timed out".to_string(),
            on_timeout: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn on_timeout(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_timeout = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for TimeoutConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutConfig")
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .field("message", &self.message)
            .field("on_timeout", &self.on_timeout.is_some())
            .finish()
    }
}

type FallbackFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, ResilienceError>> + Send + Sync>;

/// Safe default produced when the protected call is rejected or fails
pub struct FallbackConfig<T> {
    pub enabled: bool,
    function: Option<FallbackFn<T>>,
    value: Option<T>,
    /// Deadline for the fallback function
    pub timeout: Option<Duration>,
}

impl<T> Clone for FallbackConfig<T>
where
    T: Clone,
{
    fn clone(&self) -> Self {
        Self {
            enabled: self.enabled,
            function: self.function.clone(),
            value: self.value.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T> fmt::Debug for FallbackConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackConfig")
            .field("enabled", &self.enabled)
            .field("function", &self.function.is_some())
            .field("value", &self.value.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl<T> FallbackConfig<T>
where
    T: Clone + Send + 'static,
{
    /// Fall back to a static value
    pub fn value(value: T) -> Self {
        Self {
            enabled: true,
            function: None,
            value: Some(value),
            timeout: None,
        }
    }

    /// Fall back to an async function
    pub fn function<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ResilienceError>> + Send + 'static,
    {
        let function: FallbackFn<T> =
            Arc::new(move || -> BoxFuture<'static, Result<T, ResilienceError>> { Box::pin(f()) });
        Self {
            enabled: true,
            function: Some(function),
            value: None,
            timeout: None,
        }
    }

    /// Enabled fallback with nothing to run; always fails with [`ResilienceError::NoFallback`]
    pub fn empty() -> Self {
        Self {
            enabled: true,
            function: None,
            value: None,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Run the fallback; a function takes precedence over a static value
    pub(crate) async fn run(&self) -> Result<T, ResilienceError> {
        if let Some(function) = &self.function {
            let fut = function();
            return match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(ResilienceError::FallbackTimeout(limit)),
                },
                None => fut.await,
            };
        }

        match &self.value {
            Some(value) => Ok(value.clone()),
            None => Err(ResilienceError::NoFallback),
        }
    }
}

/// Bundle of optional policies for one `execute` call
pub struct ExecutionPolicy<T> {
    pub retry: Option<RetryConfig>,
    pub timeout: Option<TimeoutConfig>,
    pub fallback: Option<FallbackConfig<T>>,
}

impl<T> Default for ExecutionPolicy<T> {
    fn default() -> Self {
        Self {
            retry: None,
            timeout: None,
            fallback: None,
        }
    }
}

impl<T> ExecutionPolicy<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutConfig) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackConfig<T>) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_delay_is_capped() {
        let retry = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            backoff_multiplier: 2.0,
            ..Default::default()
        };

        assert_eq!(retry.delay_for(1), Duration::from_millis(100));
        assert_eq!(retry.delay_for(2), Duration::from_millis(200));
        assert_eq!(retry.delay_for(3), Duration::from_millis(350));
        assert_eq!(retry.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let retry = RetryConfig {
            initial_delay: Duration::from_millis(200),
            jitter: true,
            ..Default::default()
        };

        for _ in 0..100 {
            let delay = retry.delay_for(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_retry_lists() {
        let deny = RetryConfig {
            non_retryable_errors: vec!["Permanent".to_string()],
            ..Default::default()
        };
        assert!(!deny.should_retry(&ResilienceError::Permanent("no".into())));
        assert!(deny.should_retry(&ResilienceError::Transient("yes".into())));

        let allow = RetryConfig {
            retryable_errors: vec!["Throttled".to_string()],
            ..Default::default()
        };
        assert!(allow.should_retry(&ResilienceError::operation("Throttled", "slow down")));
        assert!(!allow.should_retry(&ResilienceError::Transient("other".into())));
    }

    #[tokio::test]
    async fn test_fallback_function_timeout() {
        let fallback = FallbackConfig::function(|| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, ResilienceError>(1)
        })
        .with_timeout(Duration::from_millis(20));

        let result = fallback.run().await;
        assert!(matches!(result, Err(ResilienceError::FallbackTimeout(_))));
    }

    #[tokio::test]
    async fn test_empty_fallback() {
        let fallback: FallbackConfig<u32> = FallbackConfig::empty();
        assert_eq!(fallback.run().await, Err(ResilienceError::NoFallback));
    }
}
