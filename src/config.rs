use crate::error::ResilienceError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Downstream dependency classes guarded by the control plane.
///
/// Each class carries its own tolerance for failure: a database hiccup
/// should trip fast, while a flaky external social API gets a much longer
/// leash before calls are shed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyProfile {
    AiService,
    Database,
    ExternalApi,
    Cache,
}

impl DependencyProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyProfile::AiService => "ai_service",
            DependencyProfile::Database => "database",
            DependencyProfile::ExternalApi => "external_api",
            DependencyProfile::Cache => "cache",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures within the monitoring window that trip the circuit open
    pub failure_threshold: u32,

    /// How long an open circuit waits before allowing a recovery probe
    pub recovery_timeout: Duration,

    /// Sliding window within which failures count as consecutive
    pub monitoring_window: Duration,

    /// Baseline failure rate (percent) used for health comparisons, not a trip condition
    pub expected_failure_rate: f64,
}

impl CircuitBreakerConfig {
    /// Documented per-profile defaults. These values are a published
    /// contract with the route-handler layer and must not drift.
    pub fn for_profile(profile: DependencyProfile) -> Self {
        match profile {
            DependencyProfile::AiService => Self {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(60),
                monitoring_window: Duration::from_secs(300),
                expected_failure_rate: 10.0,
            },
            DependencyProfile::Database => Self {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(30),
                monitoring_window: Duration::from_secs(120),
                expected_failure_rate: 5.0,
            },
            DependencyProfile::ExternalApi => Self {
                failure_threshold: 10,
                recovery_timeout: Duration::from_secs(120),
                monitoring_window: Duration::from_secs(600),
                expected_failure_rate: 15.0,
            },
            DependencyProfile::Cache => Self {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(15),
                monitoring_window: Duration::from_secs(60),
                expected_failure_rate: 8.0,
            },
        }
    }

    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.failure_threshold < 1 {
            return Err(ResilienceError::InvalidConfig(
                "failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.recovery_timeout.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "recovery_timeout must be greater than zero".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.expected_failure_rate) {
            return Err(ResilienceError::InvalidConfig(format!(
                "expected_failure_rate must be within 0..=100, got {}",
                self.expected_failure_rate
            )));
        }
        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::for_profile(DependencyProfile::AiService)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescerConfig {
    /// TTL applied to cached values when the caller does not supply one
    pub default_ttl: Duration,

    /// Upper bound on retained entries before least-recently-used eviction
    pub max_entries: usize,
}

impl CoalescerConfig {
    pub fn validate(&self) -> Result<(), ResilienceError> {
        if self.default_ttl.is_zero() {
            return Err(ResilienceError::InvalidConfig(
                "default_ttl must be greater than zero".to_string(),
            ));
        }
        if self.max_entries == 0 {
            return Err(ResilienceError::InvalidConfig(
                "max_entries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(30),
            max_entries: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Single-sample response time (ms) above which a latency alert is raised
    pub high_latency_ms: u64,

    /// Windowed error rate (percent) above which an error-rate alert is raised
    pub error_rate_percent: f64,

    /// Windowed 429 rate (percent) above which a rate-limit alert is raised
    pub rate_limit_rate_percent: f64,

    /// Total tokens consumed within the retention window before alerting
    pub token_usage_per_window: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            high_latency_ms: 5_000,
            error_rate_percent: 10.0,
            rate_limit_rate_percent: 5.0,
            token_usage_per_window: 500_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// How long recorded samples participate in aggregation
    pub retention_window: Duration,

    /// Hard cap on retained samples regardless of age
    pub max_samples: usize,

    pub thresholds: AlertThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            retention_window: Duration::from_secs(3_600),
            max_samples: 50_000,
            thresholds: AlertThresholds::default(),
        }
    }
}

/// Top-level settings for one control-plane instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResilienceConfig {
    pub coalescer: CoalescerConfig,
    pub monitor: MonitorConfig,
}
