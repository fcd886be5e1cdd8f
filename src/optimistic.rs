//! Stale-while-revalidate orchestration and background sync.
//!
//! - [`SwrOrchestrator::stale_while_revalidate`] answers from cache at once
//!   and refreshes in a spawned task.
//! - [`BackgroundSyncQueue`] runs fire-and-forget work with bounded
//!   concurrency, in submission order.
//! - [`BackgroundRefresher`] keeps named periodic re-fetches on the scheduler.

use dashmap::DashSet;
use futures::future::{BoxFuture, FutureExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, warn};

use crate::cache::CacheStore;
use crate::cache_key::{RequestParams, StoreKind};
use crate::errors::{ReadError, ReadResult};
use crate::metrics;
use crate::request_coordinator::RequestCoordinator;
use crate::scheduler::TaskScheduler;
use crate::settings::BackgroundSync;

/// Called with a refreshed value that differs from what the caller was given.
pub type OnUpdate<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Outcome of a stale-while-revalidate read.
pub struct SwrResult<T> {
    pub data: T,
    /// True when `data` came from cache and a refresh is running.
    pub is_stale: bool,
    /// Resolves with the fresh value, or with the stale one when the refresh
    /// failed after a cached value was delivered.
    pub refresh: BoxFuture<'static, ReadResult<T>>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for SwrResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwrResult")
            .field("data", &self.data)
            .field("is_stale", &self.is_stale)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SyncQueueStats {
    pub queue_length: usize,
    pub active_count: usize,
    pub is_processing: bool,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStats {
    pub background_queue: SyncQueueStats,
    pub active_refreshers: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PrefetchReport {
    pub requested: usize,
    pub already_cached: usize,
    pub fetched: usize,
    pub failed: usize,
}

struct CountGuard(Arc<AtomicUsize>);

impl CountGuard {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CountGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded-concurrency queue for background work.
///
/// Tasks start in submission order (the semaphore is fair). `clear` cancels
/// every task that has not started yet; running tasks finish.
pub struct BackgroundSyncQueue {
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    waiting: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    generation: watch::Sender<u64>,
}

impl BackgroundSyncQueue {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        let (generation, _) = watch::channel(0);
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            waiting: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            generation,
        }
    }

    /// Spawns `task` behind the concurrency limit. The returned future only
    /// observes the outcome; dropping it does not cancel the task.
    pub fn add<T, Fut>(&self, task: Fut) -> impl Future<Output = ReadResult<T>> + Send + 'static
    where
        T: Send + 'static,
        Fut: Future<Output = ReadResult<T>> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let active = Arc::clone(&self.active);
        let waiting = CountGuard::enter(&self.waiting);
        let mut cleared = self.generation.subscribe();

        let handle = tokio::spawn(async move {
            let permit = tokio::select! {
                permit = permits.acquire_owned() => permit
                    .map_err(|_| ReadError::Cancelled("background queue closed".to_string()))?,
                _ = cleared.changed() => {
                    return Err(ReadError::Cancelled("background queue cleared".to_string()));
                }
            };
            drop(waiting);
            let _running = CountGuard::enter(&active);
            let result = task.await;
            drop(permit);
            result
        });

        async move {
            handle
                .await
                .unwrap_or_else(|e| Err(ReadError::TaskFailed(e.to_string())))
        }
    }

    /// Cancels tasks still waiting for a slot.
    pub fn clear(&self) {
        self.generation.send_modify(|generation| *generation += 1);
    }

    pub fn stats(&self) -> SyncQueueStats {
        let active_count = self.active.load(Ordering::SeqCst);
        SyncQueueStats {
            queue_length: self.waiting.load(Ordering::SeqCst),
            active_count,
            is_processing: active_count > 0,
            max_concurrent: self.max_concurrent,
        }
    }
}

/// Named periodic refreshers (`refresh:{key}` timers).
pub struct BackgroundRefresher {
    scheduler: Arc<TaskScheduler>,
    keys: DashSet<String>,
    default_interval: Duration,
}

impl BackgroundRefresher {
    pub fn new(scheduler: Arc<TaskScheduler>, default_interval: Duration) -> Self {
        Self {
            scheduler,
            keys: DashSet::new(),
            default_interval,
        }
    }

    /// Runs `task` every `interval` (default 30 s), replacing any refresher
    /// registered under `key`. Failures are logged and the schedule goes on.
    pub fn register<F, Fut>(&self, key: &str, interval: Option<Duration>, task: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReadResult<()>> + Send + 'static,
    {
        let interval = interval.unwrap_or(self.default_interval);
        let label = key.to_string();
        self.scheduler
            .schedule_interval(format!("refresh:{}", key), interval, move || {
                let refresh = task();
                let label = label.clone();
                async move {
                    if let Err(e) = refresh.await {
                        warn!(refresher = %label, error = %e, "background refresh failed");
                    }
                }
            });
        self.keys.insert(key.to_string());
        debug!(refresher = key, ?interval, "background refresh registered");
    }

    pub fn unregister(&self, key: &str) -> bool {
        self.scheduler.cancel(&format!("refresh:{}", key));
        self.keys.remove(key).is_some()
    }

    pub fn unregister_all(&self) {
        self.scheduler.cancel_prefix("refresh:");
        self.keys.clear();
    }

    pub fn active_count(&self) -> usize {
        self.keys.len()
    }
}

/// Composes the cache, the request coordinator and the background queues.
pub struct SwrOrchestrator {
    cache: Arc<CacheStore>,
    coordinator: RequestCoordinator,
    sync_queue: BackgroundSyncQueue,
    refresher: BackgroundRefresher,
}

impl SwrOrchestrator {
    pub fn new(
        cache: Arc<CacheStore>,
        coordinator: RequestCoordinator,
        scheduler: Arc<TaskScheduler>,
        settings: &BackgroundSync,
    ) -> Self {
        Self {
            cache,
            coordinator,
            sync_queue: BackgroundSyncQueue::new(settings.max_concurrent),
            refresher: BackgroundRefresher::new(
                scheduler,
                Duration::from_secs(settings.refresh_interval_seconds),
            ),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    pub fn sync_queue(&self) -> &BackgroundSyncQueue {
        &self.sync_queue
    }

    pub fn refresher(&self) -> &BackgroundRefresher {
        &self.refresher
    }

    /// Cached value now plus a background refresh, or the fetched value when
    /// nothing is cached.
    ///
    /// Concurrent fetches of the same parameters share one request. The
    /// refresh writes the fresh value to cache and calls `on_update` when
    /// it differs from the value handed out. When a cached value existed, a
    /// refresh failure is logged and resolves to that cached value.
    pub async fn stale_while_revalidate<T, F, Fut>(
        &self,
        kind: StoreKind,
        params: &RequestParams,
        ttl: Duration,
        work: F,
        on_update: Option<OnUpdate<T>>,
    ) -> ReadResult<SwrResult<T>>
    where
        T: Serialize + DeserializeOwned + Clone + PartialEq + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ReadResult<T>> + Send + 'static,
    {
        let cached: Option<T> = self.cache.get_as(kind, params, ttl).await;

        let cache = Arc::clone(&self.cache);
        let coordinator = self.coordinator.clone();
        let refresh_params = params.clone();
        let previous = cached.clone();
        let fetch = work();
        let refresh = async move {
            let fetched = coordinator
                .deduplicate(kind.store_name(), &refresh_params, move || fetch)
                .await;
            match fetched {
                Ok(fresh) => {
                    cache
                        .set(kind, &refresh_params, &fresh, refresh_params.chain_id())
                        .await;
                    if let Some(on_update) = &on_update {
                        if previous.as_ref() != Some(&fresh) {
                            on_update(fresh.clone());
                        }
                    }
                    Ok(fresh)
                }
                Err(e) => match previous {
                    Some(stale) => {
                        warn!(store = %kind, error = %e, "refresh failed, keeping cached value");
                        metrics::increment_swr_refresh_failure(kind.store_name());
                        Ok(stale)
                    }
                    None => Err(e),
                },
            }
        };

        match cached {
            Some(data) => {
                metrics::increment_swr_stale_served(kind.store_name());
                let handle = tokio::spawn(refresh);
                Ok(SwrResult {
                    data,
                    is_stale: true,
                    refresh: async move {
                        handle
                            .await
                            .unwrap_or_else(|e| Err(ReadError::TaskFailed(e.to_string())))
                    }
                    .boxed(),
                })
            }
            None => {
                let data = refresh.await?;
                Ok(SwrResult {
                    data: data.clone(),
                    is_stale: false,
                    refresh: futures::future::ready(Ok(data)).boxed(),
                })
            }
        }
    }

    /// Cache hit, or a deduplicated fetch whose result is cached.
    pub async fn get_or_fetch<T, F, Fut>(
        &self,
        kind: StoreKind,
        params: &RequestParams,
        ttl: Duration,
        work: F,
    ) -> ReadResult<T>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ReadResult<T>> + Send + 'static,
    {
        if let Some(hit) = self.cache.get_as(kind, params, ttl).await {
            return Ok(hit);
        }

        let cache = Arc::clone(&self.cache);
        let write_params = params.clone();
        let fetch = work();
        self.coordinator
            .deduplicate(kind.store_name(), params, move || async move {
                let fresh = fetch.await?;
                cache
                    .set(kind, &write_params, &fresh, write_params.chain_id())
                    .await;
                Ok(fresh)
            })
            .await
    }

    /// Warms the cache for every parameter set not already cached, through
    /// the background queue.
    pub async fn prefetch<T, F, Fut>(
        &self,
        kind: StoreKind,
        params_list: Vec<RequestParams>,
        ttl: Duration,
        fetch: F,
    ) -> PrefetchReport
    where
        T: Serialize + Send + Sync + 'static,
        F: Fn(RequestParams) -> Fut,
        Fut: Future<Output = ReadResult<T>> + Send + 'static,
    {
        let mut report = PrefetchReport {
            requested: params_list.len(),
            ..PrefetchReport::default()
        };

        let mut pending = Vec::new();
        for params in params_list {
            if self.cache.get(kind, &params, ttl).await.is_some() {
                report.already_cached += 1;
                continue;
            }
            let cache = Arc::clone(&self.cache);
            let fetching = fetch(params.clone());
            pending.push(self.sync_queue.add(async move {
                let data = fetching.await?;
                cache.set(kind, &params, &data, params.chain_id()).await;
                Ok(())
            }));
        }

        for outcome in futures::future::join_all(pending).await {
            match outcome {
                Ok(()) => report.fetched += 1,
                Err(e) => {
                    debug!(store = %kind, error = %e, "prefetch failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Returns `optimistic` right away and runs `operation` on the background
    /// queue, reporting its outcome to the callbacks.
    pub fn optimistic_update<T, R, Fut>(
        &self,
        optimistic: T,
        operation: Fut,
        on_success: Option<Box<dyn FnOnce(R) + Send>>,
        on_error: Option<Box<dyn FnOnce(ReadError) + Send>>,
    ) -> T
    where
        R: Send + 'static,
        Fut: Future<Output = ReadResult<R>> + Send + 'static,
    {
        let outcome = self.sync_queue.add(operation);
        tokio::spawn(async move {
            match outcome.await {
                Ok(result) => {
                    if let Some(on_success) = on_success {
                        on_success(result);
                    }
                }
                Err(e) => {
                    warn!(error = %e, "optimistic operation failed, rolling back");
                    if let Some(on_error) = on_error {
                        on_error(e);
                    }
                }
            }
        });
        optimistic
    }

    pub fn sync_stats(&self) -> SyncStats {
        SyncStats {
            background_queue: self.sync_queue.stats(),
            active_refreshers: self.refresher.active_count(),
        }
    }

    pub fn clear_all_background_tasks(&self) {
        self.sync_queue.clear();
        self.refresher.unregister_all();
    }
}
