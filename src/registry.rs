//! Named-instance registry for breakers and coalescers.
//!
//! One registry instance owns every breaker in a process: repeated lookups
//! for the same name return the same `Arc`, so all call sites guarding a
//! dependency share its state. The registry is constructed explicitly and
//! passed to whichever layer builds request handlers; there is no global.

use crate::breaker::{BreakerMetrics, CircuitBreaker};
use crate::coalescer::RequestCoalescer;
use crate::config::{CircuitBreakerConfig, DependencyProfile, ResilienceConfig};
use crate::error::ResilienceError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

pub struct ResilienceRegistry {
    config: ResilienceConfig,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    coalescers: RwLock<HashMap<String, Arc<RequestCoalescer<Value>>>>,
}

impl Default for ResilienceRegistry {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl ResilienceRegistry {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            coalescers: RwLock::new(HashMap::new()),
        }
    }

    /// Get or create the breaker for `name`, configured from `profile` on
    /// first use. The profile of an existing breaker is never changed by a
    /// later lookup.
    pub async fn circuit_breaker(
        &self,
        name: &str,
        profile: DependencyProfile,
    ) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().await.get(name) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write().await;
        Arc::clone(breakers.entry(name.to_string()).or_insert_with(|| {
            debug!(breaker = name, profile = profile.as_str(), "registering circuit breaker");
            Arc::new(CircuitBreaker::new(
                name,
                CircuitBreakerConfig::for_profile(profile),
            ))
        }))
    }

    /// Register a breaker with a bespoke configuration. Fails if the config
    /// violates its invariants; returns the existing instance if the name
    /// is already registered.
    pub async fn circuit_breaker_with_config(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> Result<Arc<CircuitBreaker>, ResilienceError> {
        config.validate()?;

        let mut breakers = self.breakers.write().await;
        Ok(Arc::clone(breakers.entry(name.to_string()).or_insert_with(
            || {
                debug!(breaker = name, "registering circuit breaker with custom config");
                Arc::new(CircuitBreaker::new(name, config))
            },
        )))
    }

    /// Get or create a named coalescer for plan-level (JSON-valued) calls.
    pub async fn coalescer(&self, name: &str) -> Arc<RequestCoalescer<Value>> {
        if let Some(coalescer) = self.coalescers.read().await.get(name) {
            return Arc::clone(coalescer);
        }

        let mut coalescers = self.coalescers.write().await;
        Arc::clone(
            coalescers
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(RequestCoalescer::new(self.config.coalescer.clone()))),
        )
    }

    /// Snapshot every registered breaker, for dashboards and export.
    pub async fn breaker_metrics(&self) -> Vec<BreakerMetrics> {
        let breakers = self.breakers.read().await;
        let mut metrics = Vec::with_capacity(breakers.len());
        for breaker in breakers.values() {
            metrics.push(breaker.metrics().await);
        }
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Reset every breaker to CLOSED and clear every coalescer. Intended
    /// for the test harness that owns this instance.
    pub async fn reset_all(&self) {
        for breaker in self.breakers.read().await.values() {
            breaker.reset().await;
        }
        for coalescer in self.coalescers.read().await.values() {
            coalescer.clear().await;
        }
        debug!("all resilience instances reset");
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }
}
