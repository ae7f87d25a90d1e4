//! Request coalescing: merge concurrent identical calls into one execution.
//!
//! A coalescer is keyed by caller-supplied strings. While a call for a key
//! is in flight, every other caller for that key attaches to the same
//! shared future instead of invoking the operation again; once it settles
//! successfully the value is cached for a short TTL. Failures are never
//! cached; the next caller originates a fresh execution.

use crate::config::CoalescerConfig;
use crate::error::{ResilienceError, SharedOperationError};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

type SharedOutcome<T> = Result<T, SharedOperationError>;
type InFlight<T> = Shared<BoxFuture<'static, SharedOutcome<T>>>;

enum Entry<T: Clone> {
    InFlight(InFlight<T>),
    Cached {
        value: T,
        cached_at: Instant,
        ttl: Duration,
        last_access: Instant,
    },
}

struct CoalescerShared<T: Clone> {
    config: CoalescerConfig,
    entries: Mutex<HashMap<String, Entry<T>>>,
    total_requests: AtomicU64,
    coalesced_requests: AtomicU64,
    cache_hits: AtomicU64,
    originating_calls: AtomicU64,
}

/// Counter snapshot. `coalesced_requests + cache_hits + originating_calls`
/// always equals `total_requests`.
#[derive(Debug, Clone, Serialize)]
pub struct CoalescerMetrics {
    pub total_requests: u64,
    pub coalesced_requests: u64,
    pub cache_hits: u64,
    pub originating_calls: u64,
    pub cache_hit_rate: f64,
    pub cache_size: usize,
}

pub struct RequestCoalescer<T: Clone + Send + Sync + 'static> {
    inner: Arc<CoalescerShared<T>>,
}

impl<T: Clone + Send + Sync + 'static> Clone for RequestCoalescer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for RequestCoalescer<T> {
    fn default() -> Self {
        Self::new(CoalescerConfig::default())
    }
}

impl<T: Clone + Send + Sync + 'static> RequestCoalescer<T> {
    pub fn new(config: CoalescerConfig) -> Self {
        Self {
            inner: Arc::new(CoalescerShared {
                config,
                entries: Mutex::new(HashMap::new()),
                total_requests: AtomicU64::new(0),
                coalesced_requests: AtomicU64::new(0),
                cache_hits: AtomicU64::new(0),
                originating_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Coalesce with the configured default TTL.
    pub async fn coalesce<F, Fut>(&self, key: &str, op: F) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
    {
        self.coalesce_with_ttl(key, op, self.inner.config.default_ttl)
            .await
    }

    /// Coalesce identical requests under `key`, caching a successful value
    /// for `ttl`. All callers attached to one in-flight execution receive
    /// the identical value or the identical error.
    pub async fn coalesce_with_ttl<F, Fut>(
        &self,
        key: &str,
        op: F,
        ttl: Duration,
    ) -> Result<T, ResilienceError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, anyhow::Error>> + Send + 'static,
    {
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);

        let shared = {
            let mut entries = self.inner.entries.lock().await;

            match entries.get(key) {
                Some(Entry::InFlight(fut)) => {
                    self.inner.coalesced_requests.fetch_add(1, Ordering::Relaxed);
                    trace!(key, "attaching to in-flight request");
                    fut.clone()
                }
                Some(Entry::Cached {
                    value,
                    cached_at,
                    ttl: entry_ttl,
                    ..
                }) if cached_at.elapsed() < *entry_ttl => {
                    let value = value.clone();
                    if let Some(Entry::Cached { last_access, .. }) = entries.get_mut(key) {
                        *last_access = Instant::now();
                    }
                    self.inner.cache_hits.fetch_add(1, Ordering::Relaxed);
                    trace!(key, "serving cached value");
                    return Ok(value);
                }
                _ => {
                    // Miss, or an expired entry invalidated lazily here.
                    entries.remove(key);
                    self.inner.originating_calls.fetch_add(1, Ordering::Relaxed);

                    let shared_state = Arc::clone(&self.inner);
                    let owned_key = key.to_string();
                    let fut: InFlight<T> = async move {
                        match op().await {
                            Ok(value) => {
                                let mut entries = shared_state.entries.lock().await;
                                let now = Instant::now();
                                entries.insert(
                                    owned_key,
                                    Entry::Cached {
                                        value: value.clone(),
                                        cached_at: now,
                                        ttl,
                                        last_access: now,
                                    },
                                );
                                enforce_capacity(shared_state.config.max_entries, &mut entries);
                                Ok(value)
                            }
                            Err(error) => {
                                // Never cache failures; every waiter sees
                                // the same shared error.
                                shared_state.entries.lock().await.remove(&owned_key);
                                Err(SharedOperationError(Arc::new(error)))
                            }
                        }
                    }
                    .boxed()
                    .shared();

                    entries.insert(key.to_string(), Entry::InFlight(fut.clone()));
                    debug!(key, "originating coalesced request");
                    fut
                }
            }
        };

        shared.await.map_err(ResilienceError::Coalesced)
    }

    /// Drop any cached or in-flight entry for `key`. Waiters already
    /// attached to an in-flight execution still settle together.
    pub async fn invalidate(&self, key: &str) {
        self.inner.entries.lock().await.remove(key);
    }

    pub async fn clear(&self) {
        self.inner.entries.lock().await.clear();
    }

    pub async fn metrics(&self) -> CoalescerMetrics {
        let total = self.inner.total_requests.load(Ordering::Relaxed);
        let cache_hits = self.inner.cache_hits.load(Ordering::Relaxed);
        CoalescerMetrics {
            total_requests: total,
            coalesced_requests: self.inner.coalesced_requests.load(Ordering::Relaxed),
            cache_hits,
            originating_calls: self.inner.originating_calls.load(Ordering::Relaxed),
            cache_hit_rate: if total > 0 {
                cache_hits as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            cache_size: self.inner.entries.lock().await.len(),
        }
    }
}

/// Bound memory under sustained unique-key load: expired entries go first,
/// then the least-recently-accessed cached values. In-flight entries are
/// never evicted.
fn enforce_capacity<T: Clone>(max_entries: usize, entries: &mut HashMap<String, Entry<T>>) {
    if entries.len() <= max_entries {
        return;
    }

    entries.retain(|_, entry| match entry {
        Entry::Cached { cached_at, ttl, .. } => cached_at.elapsed() < *ttl,
        Entry::InFlight(_) => true,
    });

    while entries.len() > max_entries {
        let oldest = entries
            .iter()
            .filter_map(|(key, entry)| match entry {
                Entry::Cached { last_access, .. } => Some((key.clone(), *last_access)),
                Entry::InFlight(_) => None,
            })
            .min_by_key(|(_, accessed)| *accessed)
            .map(|(key, _)| key);

        match oldest {
            Some(key) => {
                entries.remove(&key);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::AtomicU32;
    use tokio::time::{advance, sleep};

    fn small_coalescer(max_entries: usize) -> RequestCoalescer<String> {
        RequestCoalescer::new(CoalescerConfig {
            default_ttl: Duration::from_secs(30),
            max_entries,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let coalescer: RequestCoalescer<String> = RequestCoalescer::default();
        let invocations = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..10 {
            let coalescer = coalescer.clone();
            let counter = invocations.clone();
            tasks.push(tokio::spawn(async move {
                coalescer
                    .coalesce("profile:42", move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(50)).await;
                        Ok("X".to_string())
                    })
                    .await
            }));
        }

        let results = join_all(tasks).await;
        for result in results {
            assert_eq!(result.unwrap().unwrap(), "X");
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        let metrics = coalescer.metrics().await;
        assert_eq!(metrics.total_requests, 10);
        assert_eq!(metrics.originating_calls, 1);
        assert_eq!(metrics.coalesced_requests, 9);
        assert_eq!(metrics.cache_hits, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_value_served_until_ttl() {
        let coalescer: RequestCoalescer<String> = RequestCoalescer::default();
        let invocations = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let counter = invocations.clone();
            let value = coalescer
                .coalesce_with_ttl(
                    "feed:home",
                    move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok("fresh".to_string())
                    },
                    Duration::from_secs(10),
                )
                .await
                .unwrap();
            assert_eq!(value, "fresh");
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        advance(Duration::from_secs(11)).await;

        let counter = invocations.clone();
        coalescer
            .coalesce_with_ttl(
                "feed:home",
                move || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("fresh".to_string())
                },
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 2);

        let metrics = coalescer.metrics().await;
        assert_eq!(metrics.cache_hits, 2);
        assert_eq!(metrics.originating_calls, 2);
        assert_eq!(
            metrics.coalesced_requests + metrics.cache_hits + metrics.originating_calls,
            metrics.total_requests
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failure_propagates_to_all_waiters_and_is_not_cached() {
        let coalescer: RequestCoalescer<String> = RequestCoalescer::default();
        let invocations = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let coalescer = coalescer.clone();
            let counter = invocations.clone();
            tasks.push(tokio::spawn(async move {
                coalescer
                    .coalesce("broken", move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(10)).await;
                        Err::<String, _>(anyhow::anyhow!("upstream 500"))
                    })
                    .await
            }));
        }

        for result in join_all(tasks).await {
            match result.unwrap() {
                Err(ResilienceError::Coalesced(e)) => {
                    assert!(e.to_string().contains("upstream 500"))
                }
                other => panic!("expected shared failure, got {other:?}"),
            }
        }
        assert_eq!(invocations.load(Ordering::SeqCst), 1);

        // The failure was not cached; a fresh call re-invokes.
        let counter = invocations.clone();
        let value = coalescer
            .coalesce("broken", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("recovered".to_string())
            })
            .await
            .unwrap();
        assert_eq!(value, "recovered");
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_is_bounded_under_unique_key_load() {
        let coalescer = small_coalescer(16);
        for i in 0..200 {
            coalescer
                .coalesce(&format!("unique:{i}"), move || async move {
                    Ok(format!("value-{i}"))
                })
                .await
                .unwrap();
        }

        let metrics = coalescer.metrics().await;
        assert!(metrics.cache_size <= 16, "size {} > 16", metrics.cache_size);
        assert_eq!(metrics.originating_calls, 200);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_prefers_least_recently_accessed() {
        let coalescer = small_coalescer(2);
        coalescer
            .coalesce("a", || async { Ok("a".to_string()) })
            .await
            .unwrap();
        coalescer
            .coalesce("b", || async { Ok("b".to_string()) })
            .await
            .unwrap();

        // Touch "a" so "b" becomes the eviction candidate.
        advance(Duration::from_secs(1)).await;
        coalescer
            .coalesce("a", || async { Ok("ignored".to_string()) })
            .await
            .unwrap();

        coalescer
            .coalesce("c", || async { Ok("c".to_string()) })
            .await
            .unwrap();

        let before = coalescer.metrics().await.cache_hits;
        coalescer
            .coalesce("a", || async { Ok("reloaded".to_string()) })
            .await
            .unwrap();
        assert_eq!(coalescer.metrics().await.cache_hits, before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_reexecution() {
        let coalescer: RequestCoalescer<String> = RequestCoalescer::default();
        let invocations = Arc::new(AtomicU32::new(0));

        let counter = invocations.clone();
        coalescer
            .coalesce("settings", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("v1".to_string())
            })
            .await
            .unwrap();

        coalescer.invalidate("settings").await;

        let counter = invocations.clone();
        coalescer
            .coalesce("settings", move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok("v2".to_string())
            })
            .await
            .unwrap();
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }
}
