//! Graceful-degradation orchestrator.
//!
//! Executes a prioritized plan of dependent service calls under a global
//! deadline. Each call is guarded by that service's circuit breaker,
//! optionally coalesced with identical in-flight calls, raced against its
//! own timeout, and substituted by its fallback when it cannot complete.
//! Every attempt is reported to the API monitor.

use crate::config::DependencyProfile;
use crate::error::ResilienceError;
use crate::monitoring::{ApiMonitor, MetricSample};
use crate::registry::ResilienceRegistry;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServicePriority {
    Critical,
    Optional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationStrategy {
    /// Run everything; report what completed.
    BestEffort,
    /// Abort on the first critical service with no usable fallback.
    FailFast,
    /// Fail-fast over a plan that is all-critical by construction.
    EssentialOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Complete,
    Partial,
    Failed,
}

type ServiceOperation = Box<dyn FnOnce() -> BoxFuture<'static, Result<Value, anyhow::Error>> + Send>;
type ServiceFallback = Box<dyn FnOnce() -> Value + Send>;

/// One entry of a degradation plan. The operation is a concrete callable
/// bound at plan-construction time, not a name resolved at execution time.
pub struct PlannedService {
    pub name: String,
    pub priority: ServicePriority,
    pub timeout: Duration,
    pub profile: DependencyProfile,
    operation: ServiceOperation,
    fallback: Option<ServiceFallback>,
    coalesce_key: Option<String>,
}

impl PlannedService {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        profile: DependencyProfile,
        timeout: Duration,
        operation: F,
    ) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
    {
        Self {
            name: name.into(),
            priority: ServicePriority::Optional,
            timeout,
            profile,
            operation: Box::new(move || operation().boxed()),
            fallback: None,
            coalesce_key: None,
        }
    }

    pub fn critical(mut self) -> Self {
        self.priority = ServicePriority::Critical;
        self
    }

    pub fn with_fallback<FB>(mut self, fallback: FB) -> Self
    where
        FB: FnOnce() -> Value + Send + 'static,
    {
        self.fallback = Some(Box::new(fallback));
        self
    }

    /// Coalesce this call with identical in-flight calls under `key`.
    pub fn coalesced(mut self, key: impl Into<String>) -> Self {
        self.coalesce_key = Some(key.into());
        self
    }
}

pub struct DegradationPlan {
    pub strategy: DegradationStrategy,
    pub global_timeout: Duration,
    services: Vec<PlannedService>,
}

impl DegradationPlan {
    pub fn builder(strategy: DegradationStrategy) -> DegradationPlanBuilder {
        DegradationPlanBuilder {
            strategy,
            global_timeout: Duration::from_secs(30),
            services: Vec::new(),
        }
    }

    pub fn services(&self) -> &[PlannedService] {
        &self.services
    }
}

pub struct DegradationPlanBuilder {
    strategy: DegradationStrategy,
    global_timeout: Duration,
    services: Vec<PlannedService>,
}

impl DegradationPlanBuilder {
    pub fn global_timeout(mut self, timeout: Duration) -> Self {
        self.global_timeout = timeout;
        self
    }

    pub fn service(mut self, service: PlannedService) -> Self {
        self.services.push(service);
        self
    }

    /// Validate plan invariants before anything runs.
    pub fn build(self) -> Result<DegradationPlan, ResilienceError> {
        if self.services.is_empty() {
            return Err(ResilienceError::InvalidPlan(
                "plan declares no services".to_string(),
            ));
        }
        if self.global_timeout.is_zero() {
            return Err(ResilienceError::InvalidPlan(
                "global_timeout must be greater than zero".to_string(),
            ));
        }
        if self.strategy == DegradationStrategy::EssentialOnly {
            if let Some(service) = self
                .services
                .iter()
                .find(|s| s.priority != ServicePriority::Critical)
            {
                return Err(ResilienceError::InvalidPlan(format!(
                    "essential_only plan contains non-critical service '{}'",
                    service.name
                )));
            }
        }
        Ok(DegradationPlan {
            strategy: self.strategy,
            global_timeout: self.global_timeout,
            services: self.services,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DegradationResult {
    pub status: PlanStatus,
    pub results: HashMap<String, Value>,
    pub fallbacks_used: u32,
    pub elapsed: Duration,
}

enum AttemptOutcome {
    Success(Value),
    CircuitOpen { retry_after: Duration },
    TimedOut { elapsed: Duration },
    Failed(anyhow::Error),
    BudgetExhausted,
}

pub struct GracefulDegradation {
    registry: Arc<ResilienceRegistry>,
    monitor: Arc<ApiMonitor>,
}

impl GracefulDegradation {
    pub fn new(registry: Arc<ResilienceRegistry>, monitor: Arc<ApiMonitor>) -> Self {
        Self { registry, monitor }
    }

    /// Run a plan to completion or abort, per its strategy.
    ///
    /// Critical services run before optional ones. Under `best_effort`
    /// the call always returns a result describing what completed; under
    /// `fail_fast`/`essential_only` the first critical miss with no
    /// fallback aborts with the classified error. Samples recorded for
    /// attempts made before an abort are retained.
    pub async fn execute_with_degradation(
        &self,
        plan: DegradationPlan,
    ) -> Result<DegradationResult, ResilienceError> {
        let started = Instant::now();
        let deadline = started + plan.global_timeout;
        let strategy = plan.strategy;
        let declared = plan.services.len();

        let mut services = plan.services;
        services.sort_by_key(|s| s.priority);

        let mut results: HashMap<String, Value> = HashMap::new();
        let mut fallbacks_used = 0u32;
        let mut critical_total = 0u32;
        let mut critical_missing = 0u32;

        for service in services {
            let name = service.name.clone();
            let is_critical = service.priority == ServicePriority::Critical;
            if is_critical {
                critical_total += 1;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let attempt_started = Instant::now();
            let outcome = if remaining.is_zero() {
                warn!(service = %name, "global budget exhausted, shedding service");
                AttemptOutcome::BudgetExhausted
            } else {
                let budget = service.timeout.min(remaining);
                self.attempt(
                    &name,
                    service.profile,
                    budget,
                    service.operation,
                    service.coalesce_key,
                )
                .await
            };
            let attempt_ms = attempt_started.elapsed().as_millis() as u64;

            let failure: Option<ResilienceError> = match outcome {
                AttemptOutcome::Success(value) => {
                    self.report(&name, 200, attempt_ms);
                    results.insert(name, value);
                    continue;
                }
                AttemptOutcome::CircuitOpen { retry_after } => {
                    self.report(&name, 503, attempt_ms);
                    Some(ResilienceError::CircuitOpen {
                        service: name.clone(),
                        retry_after,
                    })
                }
                AttemptOutcome::TimedOut { elapsed } => {
                    self.report(&name, 504, attempt_ms);
                    Some(ResilienceError::DegradationTimeout {
                        service: name.clone(),
                        elapsed,
                    })
                }
                AttemptOutcome::BudgetExhausted => {
                    self.report(&name, 504, 0);
                    Some(ResilienceError::DegradationTimeout {
                        service: name.clone(),
                        elapsed: started.elapsed(),
                    })
                }
                AttemptOutcome::Failed(error) => {
                    self.report(&name, 500, attempt_ms);
                    Some(ResilienceError::CriticalServiceFailed {
                        service: name.clone(),
                        cause: error,
                    })
                }
            };

            if let Some(fallback) = service.fallback {
                debug!(service = %name, "serving fallback value");
                results.insert(name, fallback());
                fallbacks_used += 1;
                continue;
            }

            if is_critical {
                critical_missing += 1;
                if strategy != DegradationStrategy::BestEffort {
                    let error = failure.unwrap_or_else(|| ResilienceError::CriticalServiceFailed {
                        service: name.clone(),
                        cause: anyhow::anyhow!("service produced no result"),
                    });
                    warn!(service = %name, %error, "aborting plan");
                    return Err(error);
                }
            }
            debug!(service = %name, "service missing from plan results");
        }

        let status = if results.len() == declared {
            PlanStatus::Complete
        } else if critical_total > 0 && critical_missing == critical_total {
            PlanStatus::Failed
        } else {
            PlanStatus::Partial
        };

        let result = DegradationResult {
            status,
            results,
            fallbacks_used,
            elapsed: started.elapsed(),
        };
        info!(
            status = ?result.status,
            fallbacks = result.fallbacks_used,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "degradation plan finished"
        );
        Ok(result)
    }

    async fn attempt(
        &self,
        name: &str,
        profile: DependencyProfile,
        budget: Duration,
        operation: ServiceOperation,
        coalesce_key: Option<String>,
    ) -> AttemptOutcome {
        let breaker = self.registry.circuit_breaker(name, profile).await;
        let coalescer = match coalesce_key {
            Some(_) => Some(self.registry.coalescer("plan_services").await),
            None => None,
        };

        let guarded = breaker
            .execute(move || async move {
                let fut = operation();
                let run = async move {
                    match (coalescer, coalesce_key) {
                        (Some(coalescer), Some(key)) => coalescer
                            .coalesce(&key, move || fut)
                            .await
                            .map_err(anyhow::Error::new),
                        _ => fut.await,
                    }
                };
                // The timeout races inside the breaker so an elapsed
                // deadline is counted as a failure, not silently dropped.
                match timeout(budget, run).await {
                    Ok(result) => result,
                    Err(elapsed) => Err(anyhow::Error::new(elapsed)),
                }
            })
            .await;

        match guarded {
            Ok(value) => AttemptOutcome::Success(value),
            Err(ResilienceError::CircuitOpen { retry_after, .. }) => {
                AttemptOutcome::CircuitOpen { retry_after }
            }
            Err(ResilienceError::Operation(error)) => {
                if error.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
                    AttemptOutcome::TimedOut { elapsed: budget }
                } else {
                    AttemptOutcome::Failed(error)
                }
            }
            Err(other) => AttemptOutcome::Failed(anyhow::Error::new(other)),
        }
    }

    fn report(&self, service: &str, status_code: u16, response_time_ms: u64) {
        self.monitor.record_metric(MetricSample::new(
            service,
            "PLAN",
            status_code,
            response_time_ms,
        ));
    }
}
