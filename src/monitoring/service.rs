//! In-process API health monitor.
//!
//! Records outcome/latency samples per endpoint, derives rolling health
//! metrics on demand, and maintains threshold alerts. Recording sits on the
//! request path of every guarded call, so it must never fail: every code
//! path in [`ApiMonitor::record_metric`] either succeeds or silently drops
//! the sample.

use super::{Alert, AlertSeverity, AlertType, EndpointMetrics, HealthMetrics, MetricSample};
use crate::config::{AlertThresholds, MonitorConfig};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

struct MonitorInner {
    samples: VecDeque<MetricSample>,
    active_alerts: HashMap<AlertType, Alert>,
    alert_history: Vec<Alert>,
    thresholds: AlertThresholds,
}

pub struct ApiMonitor {
    config: MonitorConfig,
    inner: Mutex<MonitorInner>,
}

impl Default for ApiMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl ApiMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let thresholds = config.thresholds.clone();
        Self {
            config,
            inner: Mutex::new(MonitorInner {
                samples: VecDeque::new(),
                active_alerts: HashMap::new(),
                alert_history: Vec::new(),
                thresholds,
            }),
        }
    }

    /// Append a sample and evaluate alerts. Infallible by construction: a
    /// monitoring problem must not take down the caller's request path.
    pub fn record_metric(&self, sample: MetricSample) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };

        inner.samples.push_back(sample);
        while inner.samples.len() > self.config.max_samples {
            inner.samples.pop_front();
        }
        Self::prune(&mut inner.samples, self.retention_cutoff());

        self.evaluate_alerts(&mut inner);
    }

    pub fn health_metrics(&self) -> HealthMetrics {
        let Ok(mut inner) = self.inner.lock() else {
            return HealthMetrics::default();
        };
        Self::prune(&mut inner.samples, self.retention_cutoff());
        Self::aggregate(inner.samples.iter())
    }

    /// Per-endpoint aggregates keyed `"METHOD endpoint"`.
    pub fn endpoint_metrics(&self) -> HashMap<String, EndpointMetrics> {
        let Ok(mut inner) = self.inner.lock() else {
            return HashMap::new();
        };
        Self::prune(&mut inner.samples, self.retention_cutoff());

        let mut grouped: HashMap<String, Vec<&MetricSample>> = HashMap::new();
        for sample in &inner.samples {
            grouped
                .entry(format!("{} {}", sample.method, sample.endpoint))
                .or_default()
                .push(sample);
        }

        grouped
            .into_iter()
            .map(|(key, samples)| {
                let health = Self::aggregate(samples.iter().copied());
                let first = samples[0];
                (
                    key,
                    EndpointMetrics {
                        endpoint: first.endpoint.clone(),
                        method: first.method.clone(),
                        total_requests: health.total_requests,
                        success_rate: health.success_rate,
                        error_rate: health.error_rate,
                        average_response_time_ms: health.average_response_time_ms,
                    },
                )
            })
            .collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut alerts: Vec<Alert> = inner.active_alerts.values().cloned().collect();
        alerts.sort_by(|a, b| b.raised_at.cmp(&a.raised_at));
        alerts
    }

    pub fn alert_history(&self, limit: Option<usize>) -> Vec<Alert> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut history: Vec<Alert> = inner.alert_history.clone();
        history.sort_by(|a, b| b.raised_at.cmp(&a.raised_at));
        match limit {
            Some(limit) => history.into_iter().take(limit).collect(),
            None => history,
        }
    }

    pub fn update_alert_thresholds(&self, thresholds: AlertThresholds) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        info!(?thresholds, "alert thresholds updated");
        inner.thresholds = thresholds;
    }

    /// Drop all samples, active alerts, and history.
    pub fn reset(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.samples.clear();
        inner.active_alerts.clear();
        inner.alert_history.clear();
    }

    fn retention_cutoff(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.config.retention_window)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        Utc::now() - window
    }

    fn prune(samples: &mut VecDeque<MetricSample>, cutoff: DateTime<Utc>) {
        while samples
            .front()
            .map(|s| s.timestamp < cutoff)
            .unwrap_or(false)
        {
            samples.pop_front();
        }
    }

    fn aggregate<'a>(samples: impl Iterator<Item = &'a MetricSample>) -> HealthMetrics {
        let mut total = 0u64;
        let mut successes = 0u64;
        let mut errors = 0u64;
        let mut rate_limited = 0u64;
        let mut response_time_sum = 0u64;
        let mut users: HashSet<&str> = HashSet::new();

        for sample in samples {
            total += 1;
            if sample.is_success() {
                successes += 1;
            }
            if sample.is_error() {
                errors += 1;
            }
            if sample.is_rate_limited() {
                rate_limited += 1;
            }
            response_time_sum += sample.response_time_ms;
            if let Some(user) = sample.user_id.as_deref() {
                users.insert(user);
            }
        }

        if total == 0 {
            return HealthMetrics::default();
        }

        HealthMetrics {
            total_requests: total,
            success_rate: successes as f64 / total as f64 * 100.0,
            error_rate: errors as f64 / total as f64 * 100.0,
            rate_limit_hits: rate_limited,
            average_response_time_ms: response_time_sum as f64 / total as f64,
            active_users: users.len() as u64,
        }
    }

    fn evaluate_alerts(&self, inner: &mut MonitorInner) {
        let health = Self::aggregate(inner.samples.iter());
        let latest_latency = inner
            .samples
            .back()
            .map(|s| s.response_time_ms as f64)
            .unwrap_or(0.0);
        let rate_limit_rate = if health.total_requests > 0 {
            health.rate_limit_hits as f64 / health.total_requests as f64 * 100.0
        } else {
            0.0
        };
        let tokens_in_window: u64 = inner
            .samples
            .iter()
            .filter_map(|s| s.tokens_used)
            .sum();

        let conditions = [
            (
                AlertType::HighLatency,
                latest_latency,
                inner.thresholds.high_latency_ms as f64,
            ),
            (
                AlertType::HighErrorRate,
                health.error_rate,
                inner.thresholds.error_rate_percent,
            ),
            (
                AlertType::RateLimitRate,
                rate_limit_rate,
                inner.thresholds.rate_limit_rate_percent,
            ),
            (
                AlertType::TokenUsage,
                tokens_in_window as f64,
                inner.thresholds.token_usage_per_window as f64,
            ),
        ];

        for (alert_type, current_value, threshold) in conditions {
            if current_value > threshold {
                Self::raise_or_update(inner, alert_type, current_value, threshold);
            } else {
                Self::clear_if_active(inner, alert_type, current_value);
            }
        }
    }

    fn raise_or_update(
        inner: &mut MonitorInner,
        alert_type: AlertType,
        current_value: f64,
        threshold: f64,
    ) {
        if let Some(active) = inner.active_alerts.get_mut(&alert_type) {
            // Idempotent: an already-active alert only tracks the latest value.
            active.current_value = current_value;
            if let Some(history) = inner
                .alert_history
                .iter_mut()
                .find(|a| a.id == active.id)
            {
                history.current_value = current_value;
            }
            return;
        }

        let severity = if current_value >= threshold * 2.0 {
            AlertSeverity::Critical
        } else {
            AlertSeverity::Warning
        };
        let alert = Alert {
            id: Uuid::new_v4(),
            alert_type,
            severity,
            message: format!(
                "{} at {:.1} crossed threshold {:.1}",
                alert_type.as_str(),
                current_value,
                threshold
            ),
            threshold,
            current_value,
            raised_at: Utc::now(),
            cleared_at: None,
        };

        match severity {
            AlertSeverity::Critical => error!(alert = alert_type.as_str(), current_value, threshold, "alert raised"),
            AlertSeverity::Warning => warn!(alert = alert_type.as_str(), current_value, threshold, "alert raised"),
        }

        inner.alert_history.push(alert.clone());
        inner.active_alerts.insert(alert_type, alert);
    }

    fn clear_if_active(inner: &mut MonitorInner, alert_type: AlertType, current_value: f64) {
        if let Some(mut alert) = inner.active_alerts.remove(&alert_type) {
            let now = Utc::now();
            alert.cleared_at = Some(now);
            info!(alert = alert_type.as_str(), current_value, "alert cleared");
            if let Some(history) = inner.alert_history.iter_mut().find(|a| a.id == alert.id) {
                history.cleared_at = Some(now);
                history.current_value = current_value;
            }
        }
    }
}
