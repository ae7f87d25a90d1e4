//! Circuit breaker guarding a single downstream dependency.
//!
//! Each breaker is a small state machine that stops calling a failing
//! dependency for a cooldown period instead of letting load pile onto it.
//! Callers obtain breakers through the registry so every call site for a
//! given dependency shares the same state.

use crate::config::CircuitBreakerConfig;
use crate::error::ResilienceError;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    probe_in_flight: bool,
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
}

/// Point-in-time snapshot of a breaker, safe to hand to dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    pub seconds_since_state_change: u64,
    pub config: CircuitBreakerConfig,
}

enum CallPermit {
    Allowed { probe: bool },
    Rejected { retry_after: Duration },
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                last_state_change: Instant::now(),
                probe_in_flight: false,
                total_calls: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Execute an operation under breaker protection.
    ///
    /// While open, calls are rejected with [`ResilienceError::CircuitOpen`]
    /// without invoking the operation. An operation error is counted as a
    /// failure and passed through as [`ResilienceError::Operation`], never
    /// replaced. Deadline enforcement belongs to the caller; a timed-out
    /// operation must surface here as an `Err` so it counts as a failure.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
    {
        match self.begin_call().await {
            CallPermit::Allowed { probe } => match op().await {
                Ok(value) => {
                    self.on_success(probe).await;
                    Ok(value)
                }
                Err(error) => {
                    debug!(breaker = %self.name, %error, "guarded call failed");
                    self.on_failure(probe).await;
                    Err(ResilienceError::Operation(error))
                }
            },
            CallPermit::Rejected { retry_after } => Err(ResilienceError::CircuitOpen {
                service: self.name.clone(),
                retry_after,
            }),
        }
    }

    /// Like [`execute`](Self::execute), but substitutes the fallback value
    /// when the breaker rejects the call. Operation failures still
    /// propagate; converting those into fallbacks is the orchestrator's
    /// decision, not the breaker's.
    pub async fn execute_with_fallback<T, F, Fut, FB>(
        &self,
        op: F,
        fallback: FB,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, anyhow::Error>>,
        FB: FnOnce() -> T,
    {
        match self.execute(op).await {
            Err(ResilienceError::CircuitOpen { service, .. }) => {
                debug!(breaker = %service, "circuit open, serving fallback");
                Ok(fallback())
            }
            other => other,
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    pub async fn metrics(&self) -> BreakerMetrics {
        let inner = self.inner.read().await;
        BreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            seconds_since_state_change: inner.last_state_change.elapsed().as_secs(),
            config: self.config.clone(),
        }
    }

    /// Return to CLOSED and zero all counters.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        inner.last_state_change = Instant::now();
        inner.probe_in_flight = false;
        inner.total_calls = 0;
        inner.total_failures = 0;
        inner.total_rejections = 0;
        debug!(breaker = %self.name, "circuit manually reset");
    }

    /// Force OPEN, e.g. for a maintenance window on the dependency.
    pub async fn force_open(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitState::Open;
        inner.last_state_change = Instant::now();
        inner.probe_in_flight = false;
        warn!(breaker = %self.name, "circuit manually forced open");
    }

    async fn begin_call(&self) -> CallPermit {
        let mut inner = self.inner.write().await;
        inner.total_calls += 1;

        match inner.state {
            CircuitState::Closed => CallPermit::Allowed { probe: false },
            CircuitState::Open => {
                let since_open = inner.last_state_change.elapsed();
                if since_open >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.last_state_change = Instant::now();
                    inner.probe_in_flight = true;
                    info!(breaker = %self.name, "circuit half-open, probing dependency");
                    CallPermit::Allowed { probe: true }
                } else {
                    inner.total_rejections += 1;
                    CallPermit::Rejected {
                        retry_after: self.config.recovery_timeout - since_open,
                    }
                }
            }
            CircuitState::HalfOpen => {
                // One probe at a time. A probe whose holder vanished without
                // settling frees the slot after another full cooldown.
                let since_change = inner.last_state_change.elapsed();
                if inner.probe_in_flight && since_change < self.config.recovery_timeout {
                    inner.total_rejections += 1;
                    CallPermit::Rejected {
                        retry_after: self.config.recovery_timeout - since_change,
                    }
                } else {
                    inner.last_state_change = Instant::now();
                    inner.probe_in_flight = true;
                    CallPermit::Allowed { probe: true }
                }
            }
        }
    }

    async fn on_success(&self, probe: bool) {
        let mut inner = self.inner.write().await;
        if probe {
            inner.state = CircuitState::Closed;
            inner.consecutive_failures = 0;
            inner.last_failure = None;
            inner.probe_in_flight = false;
            inner.last_state_change = Instant::now();
            info!(breaker = %self.name, "circuit closed after successful probe");
        } else {
            inner.consecutive_failures = 0;
        }
    }

    async fn on_failure(&self, probe: bool) {
        let mut inner = self.inner.write().await;
        inner.total_failures += 1;
        let now = Instant::now();

        if probe {
            inner.state = CircuitState::Open;
            inner.probe_in_flight = false;
            inner.last_state_change = now;
            inner.last_failure = Some(now);
            warn!(breaker = %self.name, "probe failed, circuit reopened");
            return;
        }

        // Failures separated by more than the monitoring window are not
        // consecutive for trip purposes.
        if let Some(last) = inner.last_failure {
            if now.duration_since(last) > self.config.monitoring_window {
                inner.consecutive_failures = 0;
            }
        }
        inner.consecutive_failures += 1;
        inner.last_failure = Some(now);

        if inner.state == CircuitState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = CircuitState::Open;
            inner.last_state_change = now;
            warn!(
                breaker = %self.name,
                failures = inner.consecutive_failures,
                "failure threshold reached, circuit opened"
            );
        }
    }
}
