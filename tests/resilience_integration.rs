//! Cross-component scenarios for the resilience control plane.
//!
//! These tests drive the same surfaces a synthetic load harness would:
//! high-concurrency coalescing, breaker trip/recovery on the documented
//! profile constants, degradation plans under deadline pressure, and the
//! monitor's aggregation and alerting. Time-dependent cases run on the
//! paused runtime clock, so nothing here sleeps for real.

use approx::assert_relative_eq;
use futures::future::join_all;
use guardian_core::{
    AlertThresholds, ApiMonitor, CircuitState, CoalescerConfig, ControlPlaneExporter,
    DegradationPlan, DegradationStrategy, DependencyProfile, GracefulDegradation, MetricSample,
    MonitorConfig, PlanStatus, PlannedService, RequestCoalescer, ResilienceConfig,
    ResilienceError, ResilienceRegistry,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{advance, sleep};

fn control_plane() -> (Arc<ResilienceRegistry>, Arc<ApiMonitor>, GracefulDegradation) {
    let registry = Arc::new(ResilienceRegistry::new(ResilienceConfig::default()));
    let monitor = Arc::new(ApiMonitor::default());
    let orchestrator = GracefulDegradation::new(Arc::clone(&registry), Arc::clone(&monitor));
    (registry, monitor, orchestrator)
}

#[tokio::test(start_paused = true)]
async fn breaker_scenario_trip_then_probe_after_cooldown() {
    let registry = ResilienceRegistry::default();
    let breaker = registry
        .circuit_breaker("orders_db", DependencyProfile::Database)
        .await;
    assert_eq!(breaker.config().failure_threshold, 3);
    assert_eq!(breaker.config().recovery_timeout, Duration::from_secs(30));

    let invocations = Arc::new(AtomicU32::new(0));
    for _ in 0..3 {
        let counter = Arc::clone(&invocations);
        let _ = breaker
            .execute(|| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("connection reset"))
            })
            .await;
    }
    assert_eq!(breaker.state().await, CircuitState::Open);

    // Fourth call is rejected without invoking the operation.
    let counter = Arc::clone(&invocations);
    let rejected = breaker
        .execute(|| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(())
        })
        .await;
    assert!(matches!(rejected, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    // After 31 simulated seconds the next call is the half-open probe.
    advance(Duration::from_secs(31)).await;
    let probe = breaker.execute(|| async { Ok::<_, anyhow::Error>(42) }).await;
    assert_eq!(probe.unwrap(), 42);
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn hundred_concurrent_callers_coalesce_to_one_execution() {
    let coalescer: Arc<RequestCoalescer<String>> = Arc::new(RequestCoalescer::default());
    let invocations = Arc::new(AtomicU32::new(0));

    let mut tasks = Vec::with_capacity(100);
    for _ in 0..100 {
        let coalescer = Arc::clone(&coalescer);
        let counter = Arc::clone(&invocations);
        tasks.push(tokio::spawn(async move {
            coalescer
                .coalesce("dashboard:summary", move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    sleep(Duration::from_millis(80)).await;
                    Ok("X".to_string())
                })
                .await
        }));
    }

    for task in join_all(tasks).await {
        assert_eq!(task.unwrap().unwrap(), "X");
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let metrics = coalescer.metrics().await;
    assert_eq!(metrics.total_requests, 100);
    assert_eq!(metrics.coalesced_requests, 99);
    assert_eq!(metrics.originating_calls, 1);
    assert_eq!(
        metrics.coalesced_requests + metrics.cache_hits + metrics.originating_calls,
        metrics.total_requests
    );
}

#[tokio::test(start_paused = true)]
async fn coalesced_value_expires_after_ttl() {
    let coalescer: RequestCoalescer<String> = RequestCoalescer::new(CoalescerConfig {
        default_ttl: Duration::from_secs(5),
        max_entries: 64,
    });
    let invocations = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let counter = Arc::clone(&invocations);
        coalescer
            .coalesce("rates:usd", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("1.07".to_string())
            })
            .await
            .unwrap();
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    advance(Duration::from_secs(6)).await;
    let counter = Arc::clone(&invocations);
    coalescer
        .coalesce("rates:usd", move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok("1.08".to_string())
        })
        .await
        .unwrap();
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn coalescer_stays_bounded_under_sustained_unique_keys() {
    let coalescer: RequestCoalescer<u64> = RequestCoalescer::new(CoalescerConfig {
        default_ttl: Duration::from_secs(300),
        max_entries: 128,
    });

    for i in 0u64..5_000 {
        coalescer
            .coalesce(&format!("user:{i}:profile"), move || async move { Ok(i) })
            .await
            .unwrap();
    }

    let metrics = coalescer.metrics().await;
    assert!(metrics.cache_size <= 128);
    assert_eq!(metrics.total_requests, 5_000);
}

#[tokio::test(start_paused = true)]
async fn degraded_dashboard_plan_survives_a_failing_provider() {
    let (_registry, monitor, orchestrator) = control_plane();

    let plan = DegradationPlan::builder(DegradationStrategy::BestEffort)
        .global_timeout(Duration::from_secs(10))
        .service(
            PlannedService::new(
                "content_feed",
                DependencyProfile::Database,
                Duration::from_secs(2),
                || async { Ok(json!({"posts": [1, 2, 3]})) },
            )
            .critical(),
        )
        .service(
            PlannedService::new(
                "ai_captions",
                DependencyProfile::AiService,
                Duration::from_secs(2),
                || async { Err(anyhow::anyhow!("model overloaded")) },
            )
            .with_fallback(|| json!({"captions": []})),
        )
        .service(
            PlannedService::new(
                "engagement_stats",
                DependencyProfile::ExternalApi,
                Duration::from_secs(2),
                || async {
                    sleep(Duration::from_secs(30)).await;
                    Ok(json!("late"))
                },
            )
            .with_fallback(|| json!({"stats": "stale"})),
        )
        .build()
        .unwrap();

    let result = orchestrator.execute_with_degradation(plan).await.unwrap();
    assert_eq!(result.status, PlanStatus::Complete);
    assert_eq!(result.results.len(), 3);
    assert_eq!(result.fallbacks_used, 2);

    // One sample per attempt reached the monitor.
    let health = monitor.health_metrics();
    assert_eq!(health.total_requests, 3);
    let by_endpoint = monitor.endpoint_metrics();
    assert_eq!(by_endpoint["PLAN ai_captions"].total_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn fail_fast_plan_aborts_but_keeps_recorded_samples() {
    let (_registry, monitor, orchestrator) = control_plane();

    let plan = DegradationPlan::builder(DegradationStrategy::FailFast)
        .service(
            PlannedService::new(
                "billing",
                DependencyProfile::ExternalApi,
                Duration::from_secs(2),
                || async { Err(anyhow::anyhow!("stripe 503")) },
            )
            .critical(),
        )
        .service(PlannedService::new(
            "recommendations",
            DependencyProfile::AiService,
            Duration::from_secs(2),
            || async { Ok(json!("unused")) },
        ))
        .build()
        .unwrap();

    let error = orchestrator.execute_with_degradation(plan).await.unwrap_err();
    assert!(matches!(
        error,
        ResilienceError::CriticalServiceFailed { .. }
    ));

    // The attempted service was recorded even though the plan aborted.
    assert_eq!(monitor.health_metrics().total_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn essential_only_plan_runs_all_critical_services() {
    let (_registry, _monitor, orchestrator) = control_plane();

    let plan = DegradationPlan::builder(DegradationStrategy::EssentialOnly)
        .global_timeout(Duration::from_secs(5))
        .service(
            PlannedService::new(
                "auth",
                DependencyProfile::Database,
                Duration::from_secs(1),
                || async { Ok(json!({"session": "ok"})) },
            )
            .critical(),
        )
        .service(
            PlannedService::new(
                "entitlements",
                DependencyProfile::Cache,
                Duration::from_secs(1),
                || async { Ok(json!({"plan": "pro"})) },
            )
            .critical(),
        )
        .build()
        .unwrap();

    let result = orchestrator.execute_with_degradation(plan).await.unwrap();
    assert_eq!(result.status, PlanStatus::Complete);
    assert_eq!(result.fallbacks_used, 0);
}

#[tokio::test(start_paused = true)]
async fn monitor_aggregates_the_canonical_fixture() {
    let monitor = ApiMonitor::default();
    for (status, rt) in [(200, 100), (200, 200), (500, 300), (200, 150), (429, 50)] {
        monitor.record_metric(MetricSample::new("/api/posts", "GET", status, rt));
    }

    let health = monitor.health_metrics();
    assert_eq!(health.total_requests, 5);
    assert_relative_eq!(health.success_rate, 60.0);
    assert_relative_eq!(health.error_rate, 20.0);
    assert_eq!(health.rate_limit_hits, 1);
    assert_relative_eq!(health.average_response_time_ms, 160.0);
}

#[tokio::test(start_paused = true)]
async fn alert_lifecycle_raise_update_clear() {
    let monitor = ApiMonitor::new(MonitorConfig {
        thresholds: AlertThresholds {
            error_rate_percent: 40.0,
            high_latency_ms: u64::MAX,
            ..AlertThresholds::default()
        },
        ..MonitorConfig::default()
    });

    monitor.record_metric(MetricSample::new("/api", "GET", 500, 100));
    let raised = monitor.active_alerts();
    assert_eq!(raised.len(), 1);
    let alert_id = raised[0].id;

    monitor.record_metric(MetricSample::new("/api", "GET", 500, 100));
    let updated = monitor.active_alerts();
    assert_eq!(updated.len(), 1);
    assert_eq!(updated[0].id, alert_id);

    // Enough successes pull the windowed error rate back under threshold.
    for _ in 0..8 {
        monitor.record_metric(MetricSample::new("/api", "GET", 200, 100));
    }
    assert!(monitor.active_alerts().is_empty());
    let history = monitor.alert_history(None);
    assert_eq!(history.len(), 1);
    assert!(history[0].cleared_at.is_some());
}

#[tokio::test(start_paused = true)]
async fn registry_shares_breakers_across_call_sites_until_reset() {
    let (registry, _monitor, orchestrator) = control_plane();

    // A plan trips the ai_service-profiled breaker through repeated failures.
    for _ in 0..5 {
        let plan = DegradationPlan::builder(DegradationStrategy::BestEffort)
            .service(
                PlannedService::new(
                    "caption_model",
                    DependencyProfile::AiService,
                    Duration::from_secs(1),
                    || async { Err(anyhow::anyhow!("429 from provider")) },
                )
                .with_fallback(|| json!(null)),
            )
            .build()
            .unwrap();
        orchestrator.execute_with_degradation(plan).await.unwrap();
    }

    // Direct callers observe the same tripped instance.
    let breaker = registry
        .circuit_breaker("caption_model", DependencyProfile::AiService)
        .await;
    assert_eq!(breaker.state().await, CircuitState::Open);

    registry.reset_all().await;
    assert_eq!(breaker.state().await, CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn exporter_reflects_live_control_plane_state() {
    let (registry, monitor, orchestrator) = control_plane();

    let plan = DegradationPlan::builder(DegradationStrategy::BestEffort)
        .service(PlannedService::new(
            "media_cdn",
            DependencyProfile::ExternalApi,
            Duration::from_secs(1),
            || async { Ok(json!("ok")) },
        ))
        .build()
        .unwrap();
    orchestrator.execute_with_degradation(plan).await.unwrap();

    let exporter = ControlPlaneExporter::new().unwrap();
    exporter.sync_health(&monitor.health_metrics());
    exporter.sync_breakers(&registry.breaker_metrics().await);

    let text = exporter.gather_metrics();
    assert!(text.contains("api_requests_total 1"));
    assert!(text.contains("circuit_breaker_state{breaker=\"media_cdn\"} 0"));
}

proptest! {
    #[test]
    fn aggregation_invariants_hold_for_arbitrary_samples(
        samples in prop::collection::vec(
            (
                prop_oneof![
                    Just(200u16), Just(201), Just(304), Just(404),
                    Just(429), Just(500), Just(502), Just(503),
                ],
                0u64..5_000,
            ),
            1..200,
        )
    ) {
        let monitor = ApiMonitor::default();
        let mut response_sum = 0u64;
        for (status, rt) in &samples {
            response_sum += rt;
            monitor.record_metric(MetricSample::new("/any", "GET", *status, *rt));
        }

        let health = monitor.health_metrics();
        prop_assert_eq!(health.total_requests, samples.len() as u64);
        prop_assert!((0.0..=100.0).contains(&health.success_rate));
        prop_assert!((0.0..=100.0).contains(&health.error_rate));
        // Success (<400) and error (>=500) classes are disjoint.
        prop_assert!(health.success_rate + health.error_rate <= 100.0 + f64::EPSILON);
        let expected_mean = response_sum as f64 / samples.len() as f64;
        prop_assert!((health.average_response_time_ms - expected_mean).abs() < 1e-6);
    }
}
