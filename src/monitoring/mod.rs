pub mod export;
pub mod service;

pub use export::*;
pub use service::*;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One observed API call. Samples are append-only facts; aggregation never
/// mutates them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub endpoint: String,
    pub method: String,
    pub status_code: u16,
    pub response_time_ms: u64,
    pub user_id: Option<String>,
    pub tokens_used: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    pub fn new(
        endpoint: impl Into<String>,
        method: impl Into<String>,
        status_code: u16,
        response_time_ms: u64,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            method: method.into(),
            status_code,
            response_time_ms,
            user_id: None,
            tokens_used: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = Some(tokens);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status_code < 400
    }

    pub fn is_error(&self) -> bool {
        self.status_code >= 500
    }

    pub fn is_rate_limited(&self) -> bool {
        self.status_code == 429
    }
}

/// Rolling health snapshot derived from the retained samples, recomputed
/// on every query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub total_requests: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub rate_limit_hits: u64,
    pub average_response_time_ms: f64,
    pub active_users: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub endpoint: String,
    pub method: String,
    pub total_requests: u64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub average_response_time_ms: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighLatency,
    HighErrorRate,
    RateLimitRate,
    TokenUsage,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighLatency => "high_latency",
            AlertType::HighErrorRate => "high_error_rate",
            AlertType::RateLimitRate => "rate_limit_rate",
            AlertType::TokenUsage => "token_usage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// A threshold crossing. Active while the condition holds; cleared, not
/// deleted, once the metric recovers. History stays for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub threshold: f64,
    pub current_value: f64,
    pub raised_at: DateTime<Utc>,
    pub cleared_at: Option<DateTime<Utc>>,
}
