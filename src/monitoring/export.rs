//! Prometheus exposition of control-plane state.
//!
//! The in-process aggregates stay the source of truth; this exporter
//! mirrors snapshots into a registry so the scrape endpoint owned by the
//! embedding application can serve them in text format.

use super::HealthMetrics;
use crate::breaker::{BreakerMetrics, CircuitState};
use crate::coalescer::CoalescerMetrics;
use prometheus::{Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use tracing::error;

pub struct ControlPlaneExporter {
    registry: Arc<Registry>,

    // API health
    pub api_requests_total: IntGauge,
    pub api_success_rate: Gauge,
    pub api_error_rate: Gauge,
    pub api_rate_limit_hits: IntGauge,
    pub api_avg_response_time_ms: Gauge,
    pub api_active_users: IntGauge,

    // Per-breaker gauges, labelled by breaker name
    pub breaker_state: IntGaugeVec,
    pub breaker_consecutive_failures: IntGaugeVec,
    pub breaker_rejections_total: IntGaugeVec,
    pub breaker_calls_total: IntGaugeVec,

    // Coalescer
    pub coalescer_cache_hit_rate: Gauge,
    pub coalescer_cache_size: IntGauge,
    pub coalescer_coalesced_total: IntGauge,
}

impl ControlPlaneExporter {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let api_requests_total = IntGauge::with_opts(Opts::new(
            "api_requests_total",
            "Requests observed within the retention window",
        ))?;
        registry.register(Box::new(api_requests_total.clone()))?;

        let api_success_rate = Gauge::with_opts(Opts::new(
            "api_success_rate_percent",
            "Share of requests with status below 400",
        ))?;
        registry.register(Box::new(api_success_rate.clone()))?;

        let api_error_rate = Gauge::with_opts(Opts::new(
            "api_error_rate_percent",
            "Share of requests with status 500 or above",
        ))?;
        registry.register(Box::new(api_error_rate.clone()))?;

        let api_rate_limit_hits = IntGauge::with_opts(Opts::new(
            "api_rate_limit_hits",
            "Requests rejected with status 429 within the window",
        ))?;
        registry.register(Box::new(api_rate_limit_hits.clone()))?;

        let api_avg_response_time_ms = Gauge::with_opts(Opts::new(
            "api_avg_response_time_ms",
            "Mean response time over the retention window",
        ))?;
        registry.register(Box::new(api_avg_response_time_ms.clone()))?;

        let api_active_users = IntGauge::with_opts(Opts::new(
            "api_active_users",
            "Distinct users observed within the window",
        ))?;
        registry.register(Box::new(api_active_users.clone()))?;

        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Breaker state: 0 closed, 1 half-open, 2 open",
            ),
            &["breaker"],
        )?;
        registry.register(Box::new(breaker_state.clone()))?;

        let breaker_consecutive_failures = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_consecutive_failures",
                "Consecutive failures within the monitoring window",
            ),
            &["breaker"],
        )?;
        registry.register(Box::new(breaker_consecutive_failures.clone()))?;

        let breaker_rejections_total = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_rejections_total",
                "Calls rejected without reaching the dependency",
            ),
            &["breaker"],
        )?;
        registry.register(Box::new(breaker_rejections_total.clone()))?;

        let breaker_calls_total = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_calls_total",
                "Calls admitted to the breaker since creation",
            ),
            &["breaker"],
        )?;
        registry.register(Box::new(breaker_calls_total.clone()))?;

        let coalescer_cache_hit_rate = Gauge::with_opts(Opts::new(
            "coalescer_cache_hit_rate_percent",
            "Share of requests served from the coalescer cache",
        ))?;
        registry.register(Box::new(coalescer_cache_hit_rate.clone()))?;

        let coalescer_cache_size = IntGauge::with_opts(Opts::new(
            "coalescer_cache_size",
            "Entries currently retained by the coalescer",
        ))?;
        registry.register(Box::new(coalescer_cache_size.clone()))?;

        let coalescer_coalesced_total = IntGauge::with_opts(Opts::new(
            "coalescer_coalesced_requests_total",
            "Requests that attached to an in-flight execution",
        ))?;
        registry.register(Box::new(coalescer_coalesced_total.clone()))?;

        Ok(Self {
            registry,
            api_requests_total,
            api_success_rate,
            api_error_rate,
            api_rate_limit_hits,
            api_avg_response_time_ms,
            api_active_users,
            breaker_state,
            breaker_consecutive_failures,
            breaker_rejections_total,
            breaker_calls_total,
            coalescer_cache_hit_rate,
            coalescer_cache_size,
            coalescer_coalesced_total,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn sync_health(&self, health: &HealthMetrics) {
        self.api_requests_total.set(health.total_requests as i64);
        self.api_success_rate.set(health.success_rate);
        self.api_error_rate.set(health.error_rate);
        self.api_rate_limit_hits.set(health.rate_limit_hits as i64);
        self.api_avg_response_time_ms
            .set(health.average_response_time_ms);
        self.api_active_users.set(health.active_users as i64);
    }

    pub fn sync_breakers(&self, breakers: &[BreakerMetrics]) {
        for metrics in breakers {
            let state = match metrics.state {
                CircuitState::Closed => 0,
                CircuitState::HalfOpen => 1,
                CircuitState::Open => 2,
            };
            self.breaker_state
                .with_label_values(&[&metrics.name])
                .set(state);
            self.breaker_consecutive_failures
                .with_label_values(&[&metrics.name])
                .set(metrics.consecutive_failures as i64);
            self.breaker_rejections_total
                .with_label_values(&[&metrics.name])
                .set(metrics.total_rejections as i64);
            self.breaker_calls_total
                .with_label_values(&[&metrics.name])
                .set(metrics.total_calls as i64);
        }
    }

    pub fn sync_coalescer(&self, metrics: &CoalescerMetrics) {
        self.coalescer_cache_hit_rate.set(metrics.cache_hit_rate);
        self.coalescer_cache_size.set(metrics.cache_size as i64);
        self.coalescer_coalesced_total
            .set(metrics.coalesced_requests as i64);
    }

    /// Encode the registry in Prometheus text format.
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        encoder.encode_to_string(&families).unwrap_or_else(|e| {
            error!("failed to encode metrics: {e}");
            String::new()
        })
    }
}
