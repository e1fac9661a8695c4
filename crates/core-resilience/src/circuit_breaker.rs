//! Circuit Breaker implementation for fault tolerance
//!
//! The circuit breaker prevents cascading failures by failing fast when a dependency
//! is experiencing issues. It has three states:
//! - Closed: Normal operation, requests pass through
//! - Open: Dependency is unhealthy, requests are rejected (fallback if configured)
//! - HalfOpen: A bounded number of trial calls probe whether it has recovered
//!
//! `execute` never returns an `Err` directly; every outcome, including rejections and
//! fallback results, is reported through [`ExecutionResult`].

use super::error::ResilienceError;
use super::events::{CircuitBreakerEvent, CircuitBreakerEventKind, EventBus};
use super::policy::{ExecutionPolicy, FallbackConfig, RetryConfig, TimeoutConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Response time samples kept for the average
const MAX_RESPONSE_SAMPLES: usize = 100;

/// State transitions kept for metrics
const MAX_TRANSITIONS: usize = 50;

/// State of the circuit breaker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing dependency recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Why a transition happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionReason {
    FailureThresholdReached,
    FailureInHalfOpen,
    ResetTimeoutExpired,
    SuccessThresholdReached,
    ManualReset,
}

/// One entry of the bounded transition history
#[derive(Debug, Clone, Serialize)]
pub struct StateTransition {
    pub from_state: CircuitState,
    pub to_state: CircuitState,
    pub timestamp: DateTime<Utc>,
    pub reason: TransitionReason,
    /// Failure count when opening, success count otherwise
    pub trigger_value: u32,
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name used in logs, events and the manager registry
    pub name: String,
    /// Failures while closed before opening the circuit
    pub failure_threshold: u32,
    /// Successes while half-open before closing the circuit
    pub success_threshold: u32,
    /// Duration to wait before transitioning from open to half-open
    pub reset_timeout: Duration,
    /// Concurrent trial calls admitted while half-open
    pub half_open_max_calls: u32,
    /// Master switch for fallbacks supplied to `execute`
    pub fallback_enabled: bool,
    /// Publish events to subscribers
    pub notification_enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            fallback_enabled: true,
            notification_enabled: true,
        }
    }
}

impl CircuitBreakerConfig {
    /// Default configuration with a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Apply the fields set in `overrides`
    pub fn apply(mut self, overrides: &CircuitBreakerOverrides) -> Self {
        if let Some(v) = overrides.failure_threshold {
            self.failure_threshold = v;
        }
        if let Some(v) = overrides.success_threshold {
            self.success_threshold = v;
        }
        if let Some(ms) = overrides.reset_timeout_ms {
            self.reset_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = overrides.half_open_max_calls {
            self.half_open_max_calls = v;
        }
        if let Some(v) = overrides.fallback_enabled {
            self.fallback_enabled = v;
        }
        if let Some(v) = overrides.notification_enabled {
            self.notification_enabled = v;
        }
        self
    }
}

/// Partial configuration, merged over the defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerOverrides {
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
    pub reset_timeout_ms: Option<u64>,
    pub half_open_max_calls: Option<u32>,
    pub fallback_enabled: Option<bool>,
    pub notification_enabled: Option<bool>,
}

/// Outcome of a protected call
#[derive(Debug, Clone)]
pub struct ExecutionResult<T> {
    pub outcome: Result<T, ResilienceError>,
    /// Wall time from admission check to completion, including retries and fallback
    pub execution_time: Duration,
    pub from_fallback: bool,
    /// Breaker state after the call was recorded
    pub state: CircuitState,
    pub timestamp: DateTime<Utc>,
}

impl<T> ExecutionResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&T> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&ResilienceError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, ResilienceError> {
        self.outcome
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub next_attempt_time: Option<DateTime<Utc>>,
    pub total_calls: u64,
    pub failure_rate: f64,
    pub average_response_time_ms: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregated call metrics of a breaker
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub average_response_time_ms: f64,
    pub failure_rate: f64,
    pub success_rate: f64,
    pub current_state: CircuitState,
    pub state_transitions: Vec<StateTransition>,
    pub last_metrics_reset: DateTime<Utc>,
}

/// How a call got past the admission check
#[derive(Debug, Clone, Copy)]
enum Admission {
    Normal,
    /// Trial call in the given half-open window
    Trial { window: u64 },
}

/// Internal state of the circuit breaker
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    /// Half-open window generation; stale trials must not release new slots
    window: u64,
    trials_in_flight: u32,
    next_attempt: Option<Instant>,
    total_calls: u64,
    successful_calls: u64,
    failed_calls: u64,
    rejected_calls: u64,
    last_failure_time: Option<DateTime<Utc>>,
    last_success_time: Option<DateTime<Utc>>,
    response_times: VecDeque<Duration>,
    transitions: VecDeque<StateTransition>,
    metrics_reset_at: DateTime<Utc>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            window: 0,
            trials_in_flight: 0,
            next_attempt: None,
            total_calls: 0,
            successful_calls: 0,
            failed_calls: 0,
            rejected_calls: 0,
            last_failure_time: None,
            last_success_time: None,
            response_times: VecDeque::with_capacity(MAX_RESPONSE_SAMPLES),
            transitions: VecDeque::with_capacity(MAX_TRANSITIONS),
            metrics_reset_at: Utc::now(),
        }
    }

    fn record_response_time(&mut self, elapsed: Duration) {
        self.response_times.push_back(elapsed);
        while self.response_times.len() > MAX_RESPONSE_SAMPLES {
            self.response_times.pop_front();
        }
    }

    fn finish_trial(&mut self, admission: Admission) {
        if let Admission::Trial { window } = admission {
            if window == self.window {
                self.trials_in_flight = self.trials_in_flight.saturating_sub(1);
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.total_calls == 0 {
            0.0
        } else {
            self.failure_count as f64 / self.total_calls as f64 * 100.0
        }
    }

    fn average_response_time_ms(&self) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        let total: Duration = self.response_times.iter().sum();
        total.as_secs_f64() * 1000.0 / self.response_times.len() as f64
    }
}

/// Circuit breaker for protecting against cascading failures
///
/// Cloning is cheap; clones share state.
///
/// # Example
/// ```no_run
/// use tether_core_resilience::{CircuitBreaker, CircuitBreakerConfig, ResilienceError};
///
/// #[tokio::main]
/// async fn main() {
///     let breaker = CircuitBreaker::new(CircuitBreakerConfig::named("inventory"));
///
///     let result = breaker
///         .execute(|| async { Ok::<_, ResilienceError>(42) })
///         .await;
///
///     assert_eq!(result.value(), Some(&42));
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<BreakerState>>,
    events: EventBus,
    created_at: DateTime<Utc>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let events = EventBus::new(config.name.clone(), config.notification_enabled);
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(BreakerState::new())),
            events,
            created_at: Utc::now(),
        }
    }

    /// Create a new circuit breaker with default configuration
    pub fn new_default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Subscribe to this breaker's events
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitBreakerEvent> {
        self.events.subscribe()
    }

    /// Get the current state of the circuit breaker
    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Get current failure count
    pub async fn get_failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }

    /// Get current success count
    pub async fn get_success_count(&self) -> u32 {
        self.state.lock().await.success_count
    }

    /// Reset the circuit breaker to closed state
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        self.transition(&mut state, CircuitState::Closed, TransitionReason::ManualReset);
        state.failure_count = 0;
        state.success_count = 0;
        state.next_attempt = None;
        state.last_failure_time = None;
        state.last_success_time = None;
        state.response_times.clear();
    }

    /// Execute an operation with circuit breaker protection and no extra policies
    pub async fn execute<F, Fut, T>(&self, op: F) -> ExecutionResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
        T: Clone + Send + 'static,
    {
        self.execute_with(op, ExecutionPolicy::default()).await
    }

    /// Execute an operation with retry, timeout and fallback policies
    ///
    /// Pipeline: admission check, retries with backoff inside an optional overall
    /// deadline, outcome recording, then the fallback on rejection or failure.
    pub async fn execute_with<F, Fut, T>(
        &self,
        op: F,
        policy: ExecutionPolicy<T>,
    ) -> ExecutionResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
        T: Clone + Send + 'static,
    {
        let started = Instant::now();

        let admission = match self.admit().await {
            Ok(admission) => admission,
            Err(rejection) => {
                return self
                    .on_rejected(rejection, policy.fallback.as_ref(), started)
                    .await
            }
        };

        let outcome = self
            .run_protected(&op, policy.retry.as_ref(), policy.timeout.as_ref())
            .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(value) => {
                let state = self.on_success(admission, elapsed).await;
                ExecutionResult {
                    outcome: Ok(value),
                    execution_time: elapsed,
                    from_fallback: false,
                    state,
                    timestamp: Utc::now(),
                }
            }
            Err(error) => {
                let state = self.on_failure(admission, &error, elapsed).await;
                match self.active_fallback(policy.fallback.as_ref()) {
                    Some(fallback) => self.run_fallback(fallback, started).await,
                    None => ExecutionResult {
                        outcome: Err(error),
                        execution_time: elapsed,
                        from_fallback: false,
                        state,
                        timestamp: Utc::now(),
                    },
                }
            }
        }
    }

    /// Current status snapshot
    pub async fn get_status(&self) -> CircuitBreakerStatus {
        let state = self.state.lock().await;
        let next_attempt_time = state.next_attempt.map(|at| {
            let remaining = at.saturating_duration_since(Instant::now());
            Utc::now()
                + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero())
        });

        CircuitBreakerStatus {
            name: self.config.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_time: state.last_failure_time,
            last_success_time: state.last_success_time,
            next_attempt_time,
            total_calls: state.total_calls,
            failure_rate: state.failure_rate(),
            average_response_time_ms: state.average_response_time_ms(),
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }

    /// Aggregated metrics snapshot
    pub async fn get_metrics(&self) -> CircuitBreakerMetrics {
        let state = self.state.lock().await;
        let success_rate = if state.total_calls == 0 {
            0.0
        } else {
            state.successful_calls as f64 / state.total_calls as f64 * 100.0
        };

        CircuitBreakerMetrics {
            name: self.config.name.clone(),
            total_calls: state.total_calls,
            successful_calls: state.successful_calls,
            failed_calls: state.failed_calls,
            rejected_calls: state.rejected_calls,
            average_response_time_ms: state.average_response_time_ms(),
            failure_rate: state.failure_rate(),
            success_rate,
            current_state: state.state,
            state_transitions: state.transitions.iter().cloned().collect(),
            last_metrics_reset: state.metrics_reset_at,
        }
    }

    /// Admission gate; performs the lazy OPEN -> HALF_OPEN transition
    async fn admit(&self) -> Result<Admission, ResilienceError> {
        let mut state = self.state.lock().await;

        match state.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let eligible = state
                    .next_attempt
                    .map_or(true, |at| Instant::now() >= at);
                if !eligible {
                    return Err(ResilienceError::CircuitOpen(self.config.name.clone()));
                }

                self.transition(
                    &mut state,
                    CircuitState::HalfOpen,
                    TransitionReason::ResetTimeoutExpired,
                );
                state.trials_in_flight = 1;
                Ok(Admission::Trial {
                    window: state.window,
                })
            }
            CircuitState::HalfOpen => {
                if state.trials_in_flight >= self.config.half_open_max_calls {
                    return Err(ResilienceError::HalfOpenSaturated(self.config.name.clone()));
                }
                state.trials_in_flight += 1;
                Ok(Admission::Trial {
                    window: state.window,
                })
            }
        }
    }

    /// Retries inside the optional overall deadline
    async fn run_protected<F, Fut, T>(
        &self,
        op: &F,
        retry: Option<&RetryConfig>,
        timeout: Option<&TimeoutConfig>,
    ) -> Result<T, ResilienceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let attempts = self.run_attempts(op, retry);

        let Some(timeout) = timeout.filter(|t| t.enabled) else {
            return attempts.await;
        };

        match tokio::time::timeout(timeout.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => {
                if let Some(hook) = &timeout.on_timeout {
                    hook();
                }
                self.events.publish(CircuitBreakerEventKind::CallTimeout {
                    timeout_ms: timeout.timeout.as_millis() as u64,
                });
                Err(ResilienceError::Timeout {
                    duration: timeout.timeout,
                    message: timeout.message.clone(),
                })
            }
        }
    }

    async fn run_attempts<F, Fut, T>(
        &self,
        op: &F,
        retry: Option<&RetryConfig>,
    ) -> Result<T, ResilienceError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError>>,
    {
        let Some(retry) = retry else {
            return op().await;
        };

        let max_attempts = retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < max_attempts && retry.should_retry(&e) => {
                    let delay = retry.delay_for(attempt);
                    debug!(
                        breaker = %self.config.name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying operation"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn on_success(&self, admission: Admission, elapsed: Duration) -> CircuitState {
        let mut state = self.state.lock().await;
        state.finish_trial(admission);
        state.total_calls += 1;
        state.successful_calls += 1;
        state.success_count += 1;
        state.last_success_time = Some(Utc::now());
        state.record_response_time(elapsed);

        self.events.publish(CircuitBreakerEventKind::CallSuccess {
            response_time_ms: elapsed.as_secs_f64() * 1000.0,
        });

        if state.state == CircuitState::HalfOpen
            && state.success_count >= self.config.success_threshold
        {
            self.transition(
                &mut state,
                CircuitState::Closed,
                TransitionReason::SuccessThresholdReached,
            );
            state.failure_count = 0;
        }

        state.state
    }

    async fn on_failure(
        &self,
        admission: Admission,
        error: &ResilienceError,
        elapsed: Duration,
    ) -> CircuitState {
        let mut state = self.state.lock().await;
        state.finish_trial(admission);
        state.total_calls += 1;
        state.failed_calls += 1;
        state.failure_count += 1;
        state.last_failure_time = Some(Utc::now());
        state.record_response_time(elapsed);

        self.events.publish(CircuitBreakerEventKind::CallFailure {
            error: error.to_string(),
            response_time_ms: Some(elapsed.as_secs_f64() * 1000.0),
        });

        match state.state {
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                self.transition(
                    &mut state,
                    CircuitState::Open,
                    TransitionReason::FailureThresholdReached,
                );
            }
            CircuitState::HalfOpen => {
                self.transition(
                    &mut state,
                    CircuitState::Open,
                    TransitionReason::FailureInHalfOpen,
                );
            }
            _ => {}
        }

        state.state
    }

    async fn on_rejected<T>(
        &self,
        rejection: ResilienceError,
        fallback: Option<&FallbackConfig<T>>,
        started: Instant,
    ) -> ExecutionResult<T>
    where
        T: Clone + Send + 'static,
    {
        let state = {
            let mut state = self.state.lock().await;
            state.rejected_calls += 1;
            state.state
        };

        warn!(breaker = %self.config.name, state = %state, "call rejected");
        self.events.publish(CircuitBreakerEventKind::CallFailure {
            error: rejection.to_string(),
            response_time_ms: None,
        });

        match self.active_fallback(fallback) {
            Some(fallback) => self.run_fallback(fallback, started).await,
            None => ExecutionResult {
                outcome: Err(rejection),
                execution_time: started.elapsed(),
                from_fallback: false,
                state,
                timestamp: Utc::now(),
            },
        }
    }

    fn active_fallback<'a, T>(
        &self,
        fallback: Option<&'a FallbackConfig<T>>,
    ) -> Option<&'a FallbackConfig<T>> {
        fallback.filter(|f| f.enabled && self.config.fallback_enabled)
    }

    async fn run_fallback<T>(
        &self,
        fallback: &FallbackConfig<T>,
        started: Instant,
    ) -> ExecutionResult<T>
    where
        T: Clone + Send + 'static,
    {
        let outcome = fallback.run().await;

        self.events.publish(CircuitBreakerEventKind::FallbackExecuted {
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(|e| e.to_string()),
        });

        ExecutionResult {
            outcome,
            execution_time: started.elapsed(),
            from_fallback: true,
            state: self.get_state().await,
            timestamp: Utc::now(),
        }
    }

    /// Apply a transition; caller holds the state lock
    fn transition(&self, state: &mut BreakerState, to: CircuitState, reason: TransitionReason) {
        let from = state.state;
        state.state = to;

        match to {
            CircuitState::Open => {
                state.next_attempt = Some(Instant::now() + self.config.reset_timeout);
                state.success_count = 0;
                state.window += 1;
                state.trials_in_flight = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count = 0;
                state.window += 1;
                state.trials_in_flight = 0;
            }
            CircuitState::Closed => {
                state.next_attempt = None;
                state.trials_in_flight = 0;
            }
        }

        let trigger_value = if to == CircuitState::Open {
            state.failure_count
        } else {
            state.success_count
        };

        state.transitions.push_back(StateTransition {
            from_state: from,
            to_state: to,
            timestamp: Utc::now(),
            reason,
            trigger_value,
        });
        while state.transitions.len() > MAX_TRANSITIONS {
            state.transitions.pop_front();
        }

        info!(
            breaker = %self.config.name,
            from = %from,
            to = %to,
            ?reason,
            "circuit breaker transition"
        );
        self.events
            .publish(CircuitBreakerEventKind::StateChange { from, to, reason });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CircuitBreakerEventType;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing() -> impl Fn() -> std::future::Ready<Result<(), ResilienceError>> {
        || std::future::ready(Err(ResilienceError::Transient("test error".to_string())))
    }

    #[tokio::test]
    async fn test_circuit_breaker_closed_to_open() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..3 {
            let result = breaker.execute(failing()).await;
            assert!(!result.is_success());
        }

        assert_eq!(breaker.get_state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn test_open_circuit_rejects_without_invoking() {
        let config = CircuitBreakerConfig {
            failure_threshold: 3,
            reset_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            breaker
                .execute(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(ResilienceError::Transient("down".into())) }
                })
                .await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let probe = calls.clone();
        let result = breaker
            .execute(move || {
                probe.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ResilienceError>(()) }
            })
            .await;

        assert!(matches!(result.error(), Some(ResilienceError::CircuitOpen(_))));
        assert!(!result.from_fallback);
        assert_eq!(result.state, CircuitState::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(breaker.get_metrics().await.rejected_calls, 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_half_open_to_closed() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);

        for _ in 0..2 {
            breaker.execute(failing()).await;
        }
        assert_eq!(breaker.get_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(60)).await;

        for _ in 0..2 {
            let result = breaker
                .execute(|| async { Ok::<_, ResilienceError>(()) })
                .await;
            assert!(result.is_success());
        }

        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        assert_eq!(breaker.get_failure_count().await, 0);
    }

    #[tokio::test]
    async fn test_failure_in_half_open_reopens() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_millis(30),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);

        breaker.execute(failing()).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        let result = breaker.execute(failing()).await;
        assert_eq!(result.state, CircuitState::Open);

        let metrics = breaker.get_metrics().await;
        let reasons: Vec<_> = metrics.state_transitions.iter().map(|t| t.reason).collect();
        assert_eq!(
            reasons,
            vec![
                TransitionReason::FailureThresholdReached,
                TransitionReason::ResetTimeoutExpired,
                TransitionReason::FailureInHalfOpen,
            ]
        );
        assert_eq!(breaker.get_success_count().await, 0);
    }

    #[tokio::test]
    async fn test_half_open_limits_concurrent_trials() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            success_threshold: 5,
            half_open_max_calls: 1,
            reset_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);
        breaker.execute(failing()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let slow = breaker.clone();
        let trial = tokio::spawn(async move {
            slow.execute(|| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<_, ResilienceError>(())
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = breaker
            .execute(|| async { Ok::<_, ResilienceError>(()) })
            .await;
        assert!(matches!(
            second.error(),
            Some(ResilienceError::HalfOpenSaturated(_))
        ));

        let first = trial.await.unwrap();
        assert!(first.is_success());
        assert_eq!(first.state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn test_retry_with_backoff_recovers() {
        let breaker = CircuitBreaker::new_default();
        let attempts = Arc::new(AtomicU32::new(0));

        let counter = attempts.clone();
        let retry = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let started = Instant::now();
        let result = breaker
            .execute_with(
                move || {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ResilienceError::Transient("flaky".into()))
                        } else {
                            Ok(n)
                        }
                    }
                },
                ExecutionPolicy::new().with_retry(retry),
            )
            .await;

        assert_eq!(result.value(), Some(&2));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // 10ms + 20ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(breaker.get_failure_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let breaker = CircuitBreaker::new_default();
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let retry = RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            non_retryable_errors: vec!["Permanent".to_string()],
            ..Default::default()
        };
        let result = breaker
            .execute_with(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(ResilienceError::Permanent("bad request".into())) }
                },
                ExecutionPolicy::new().with_retry(retry),
            )
            .await;

        assert!(!result.is_success());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_invokes_hook() {
        let breaker = CircuitBreaker::new_default();
        let fired = Arc::new(AtomicU32::new(0));
        let hook = fired.clone();

        let timeout = TimeoutConfig::new(Duration::from_millis(20))
            .with_message("inventory lookup timed out")
            .on_timeout(move || {
                hook.fetch_add(1, Ordering::SeqCst);
            });

        let result = breaker
            .execute_with(
                || async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, ResilienceError>(())
                },
                ExecutionPolicy::new().with_timeout(timeout),
            )
            .await;

        match result.error() {
            Some(ResilienceError::Timeout { message, .. }) => {
                assert_eq!(message, "inventory lookup timed out")
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fallback_value_on_failure() {
        let breaker = CircuitBreaker::new_default();

        let result = breaker
            .execute_with(
                || async { Err::<u32, _>(ResilienceError::Transient("down".into())) },
                ExecutionPolicy::new().with_fallback(FallbackConfig::value(7)),
            )
            .await;

        assert!(result.is_success());
        assert!(result.from_fallback);
        assert_eq!(result.value(), Some(&7));
        assert_eq!(breaker.get_failure_count().await, 1);
    }

    #[tokio::test]
    async fn test_fallback_on_rejection() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);
        breaker.execute(failing()).await;

        let result = breaker
            .execute_with(
                || async { Ok::<_, ResilienceError>("live".to_string()) },
                ExecutionPolicy::new()
                    .with_fallback(FallbackConfig::function(|| async { Ok("cached".to_string()) })),
            )
            .await;

        assert!(result.from_fallback);
        assert_eq!(result.value().map(String::as_str), Some("cached"));
    }

    #[tokio::test]
    async fn test_failed_fallback_reports_from_fallback() {
        let breaker = CircuitBreaker::new_default();

        let fallback = FallbackConfig::function(|| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(1u32)
        })
        .with_timeout(Duration::from_millis(10));

        let result = breaker
            .execute_with(
                || async { Err::<u32, _>(ResilienceError::Transient("down".into())) },
                ExecutionPolicy::new().with_fallback(fallback),
            )
            .await;

        assert!(!result.is_success());
        assert!(result.from_fallback);
        assert!(matches!(
            result.error(),
            Some(ResilienceError::FallbackTimeout(_))
        ));
    }

    #[tokio::test]
    async fn test_fallback_disabled_by_config() {
        let config = CircuitBreakerConfig {
            fallback_enabled: false,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);

        let result = breaker
            .execute_with(
                || async { Err::<u32, _>(ResilienceError::Transient("down".into())) },
                ExecutionPolicy::new().with_fallback(FallbackConfig::value(1)),
            )
            .await;

        assert!(!result.from_fallback);
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_events_published() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::named("events")
        };
        let breaker = CircuitBreaker::new(config);
        let mut rx = breaker.subscribe();

        breaker.execute(failing()).await;

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_type(), CircuitBreakerEventType::CallFailure);
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second.kind,
            CircuitBreakerEventKind::StateChange {
                from: CircuitState::Closed,
                to: CircuitState::Open,
                reason: TransitionReason::FailureThresholdReached,
            }
        );
    }

    #[tokio::test]
    async fn test_metrics_and_status() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::named("metrics"));

        breaker
            .execute(|| async { Ok::<_, ResilienceError>(()) })
            .await;
        breaker.execute(failing()).await;

        let status = breaker.get_status().await;
        assert_eq!(status.name, "metrics");
        assert_eq!(status.total_calls, 2);
        assert_eq!(status.failure_rate, 50.0);
        assert!(status.last_failure_time.is_some());
        assert!(status.next_attempt_time.is_none());

        let metrics = breaker.get_metrics().await;
        assert_eq!(metrics.successful_calls, 1);
        assert_eq!(metrics.failed_calls, 1);
        assert_eq!(metrics.success_rate, 50.0);
    }

    #[tokio::test]
    async fn test_response_history_is_bounded() {
        let breaker = CircuitBreaker::new_default();
        for _ in 0..150 {
            breaker
                .execute(|| async { Ok::<_, ResilienceError>(()) })
                .await;
        }
        assert_eq!(
            breaker.state.lock().await.response_times.len(),
            MAX_RESPONSE_SAMPLES
        );
    }

    #[tokio::test]
    async fn test_reset() {
        let config = CircuitBreakerConfig {
            failure_threshold: 1,
            ..Default::default()
        };
        let breaker = CircuitBreaker::new(config);

        breaker.execute(failing()).await;
        assert_eq!(breaker.get_state().await, CircuitState::Open);

        breaker.reset().await;

        assert_eq!(breaker.get_state().await, CircuitState::Closed);
        assert_eq!(breaker.get_failure_count().await, 0);
        let metrics = breaker.get_metrics().await;
        assert_eq!(
            metrics.state_transitions.last().map(|t| t.reason),
            Some(TransitionReason::ManualReset)
        );
    }

    #[test]
    fn test_overrides_merge() {
        let config = CircuitBreakerConfig::named("merge").apply(&CircuitBreakerOverrides {
            failure_threshold: Some(9),
            reset_timeout_ms: Some(1500),
            ..Default::default()
        });

        assert_eq!(config.name, "merge");
        assert_eq!(config.failure_threshold, 9);
        assert_eq!(config.reset_timeout, Duration::from_millis(1500));
        assert_eq!(config.success_threshold, 3);
    }
}
