//! Request coordination: deduplicate, debounce, throttle and batch-window.
//!
//! Keys are `identifier` plus the canonical form of the request parameters,
//! so `{b:2,a:1}` and `{A:1,B:2}` coordinate as the same request. State for
//! different result types lives in the same maps behind `Any`; reusing one
//! identifier with two result types is reported as `InvalidInput`.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::debug;
use serde::Serialize;
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::cache_key::RequestParams;
use crate::errors::{ReadError, ReadResult};
use crate::metrics;
use crate::scheduler::TaskScheduler;
use crate::settings::Requests;
use crate::utils::lock;

type SharedWork<T> = Shared<BoxFuture<'static, ReadResult<T>>>;
type BatchFn<P, T> = Arc<dyn Fn(Vec<P>) -> BoxFuture<'static, ReadResult<Vec<T>>> + Send + Sync>;
type AnyState = Box<dyn Any + Send + Sync>;

struct DebounceState<T> {
    work: Option<BoxFuture<'static, ReadResult<T>>>,
    waiters: Vec<oneshot::Sender<ReadResult<T>>>,
}

struct ThrottleState<T> {
    last_call: Option<Instant>,
    last_result: Option<T>,
}

struct BatchWindowState<P, T> {
    pending: Mutex<Vec<(P, oneshot::Sender<ReadResult<T>>)>>,
    batch_fn: BatchFn<P, T>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestStats {
    pub in_flight: usize,
    pub debounced: usize,
    pub throttled: usize,
    pub batch_windows: usize,
}

pub fn request_key(identifier: &str, params: &RequestParams) -> String {
    format!("{}::{}", identifier, params.canonical())
}

fn type_mismatch(identifier: &str) -> ReadError {
    ReadError::InvalidInput(format!(
        "request `{}` is already tracked with a different result type",
        identifier
    ))
}

#[derive(Clone)]
pub struct RequestCoordinator {
    inflight: Arc<DashMap<String, AnyState>>,
    debounced: Arc<DashMap<String, AnyState>>,
    throttled: Arc<DashMap<String, AnyState>>,
    batch_windows: Arc<DashMap<String, Arc<dyn Any + Send + Sync>>>,
    scheduler: Arc<TaskScheduler>,
    settings: Requests,
}

impl RequestCoordinator {
    pub fn new(scheduler: Arc<TaskScheduler>, settings: Requests) -> Self {
        Self {
            inflight: Arc::new(DashMap::new()),
            debounced: Arc::new(DashMap::new()),
            throttled: Arc::new(DashMap::new()),
            batch_windows: Arc::new(DashMap::new()),
            scheduler,
            settings,
        }
    }

    pub fn default_debounce(&self) -> Duration {
        Duration::from_millis(self.settings.debounce_ms)
    }

    pub fn default_throttle(&self) -> Duration {
        Duration::from_millis(self.settings.throttle_ms)
    }

    pub fn default_batch_window(&self) -> Duration {
        Duration::from_millis(self.settings.batch_window_ms)
    }

    /// Runs `work` unless an identical request is in flight, in which case
    /// the caller shares that request's outcome.
    ///
    /// The work runs on its own task: it completes, and releases its key, even
    /// if every caller stops waiting.
    pub async fn deduplicate<T, F, Fut>(
        &self,
        identifier: &str,
        params: &RequestParams,
        work: F,
    ) -> ReadResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ReadResult<T>> + Send + 'static,
    {
        let key = request_key(identifier, params);

        let existing = self
            .inflight
            .get(&key)
            .map(|entry| entry.value().downcast_ref::<SharedWork<T>>().cloned());
        if let Some(existing) = existing {
            let shared = existing.ok_or_else(|| type_mismatch(identifier))?;
            metrics::increment_dedup_hit(identifier);
            debug!("🔁 Joining in-flight request {}", key);
            return shared.await;
        }

        let fut = work();
        let shared = match self.inflight.entry(key.clone()) {
            Entry::Occupied(entry) => entry
                .get()
                .downcast_ref::<SharedWork<T>>()
                .cloned()
                .ok_or_else(|| type_mismatch(identifier))?,
            Entry::Vacant(entry) => {
                let inflight = Arc::clone(&self.inflight);
                let tracked = key.clone();
                let handle = tokio::spawn(async move {
                    let result = fut.await;
                    inflight.remove(&tracked);
                    result
                });
                let shared: SharedWork<T> = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(ReadError::TaskFailed(e.to_string())))
                }
                .boxed()
                .shared();
                entry.insert(Box::new(shared.clone()));
                shared
            }
        };
        shared.await
    }

    /// Delays `work` until `wait` passes with no newer call for the same key.
    /// Every caller of one quiet period receives the outcome of the last
    /// supplied `work`.
    pub async fn debounce<T, F, Fut>(
        &self,
        identifier: &str,
        params: &RequestParams,
        work: F,
        wait: Duration,
    ) -> ReadResult<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ReadResult<T>> + Send + 'static,
    {
        let key = request_key(identifier, params);
        let (tx, rx) = oneshot::channel();
        {
            let slot = self.debounced.entry(key.clone()).or_insert_with(|| {
                Box::new(Mutex::new(DebounceState::<T> {
                    work: None,
                    waiters: Vec::new(),
                })) as AnyState
            });
            let state = slot
                .downcast_ref::<Mutex<DebounceState<T>>>()
                .ok_or_else(|| type_mismatch(identifier))?;
            let mut state = lock(state);
            state.work = Some(work().boxed());
            state.waiters.push(tx);
        }

        let debounced = Arc::clone(&self.debounced);
        let slot_key = key.clone();
        self.scheduler
            .schedule_once(format!("debounce:{}", key), wait, async move {
                let Some((_, slot)) = debounced.remove(&slot_key) else {
                    return;
                };
                let Ok(state) = slot.downcast::<Mutex<DebounceState<T>>>() else {
                    return;
                };
                let DebounceState { work, waiters } =
                    (*state).into_inner().unwrap_or_else(PoisonError::into_inner);
                let Some(work) = work else {
                    return;
                };
                tokio::spawn(async move {
                    let result = work.await;
                    for waiter in waiters {
                        let _ = waiter.send(result.clone());
                    }
                });
            });

        rx.await.unwrap_or_else(|_| {
            Err(ReadError::Cancelled(format!(
                "debounced request `{}` was cancelled",
                identifier
            )))
        })
    }

    /// Debounce whose eventual work is also deduplicated.
    pub async fn debounce_and_dedupe<T, F, Fut>(
        &self,
        identifier: &str,
        params: &RequestParams,
        work: F,
        wait: Duration,
    ) -> ReadResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ReadResult<T>> + Send + 'static,
    {
        let coordinator = self.clone();
        let id = identifier.to_string();
        let dedupe_params = params.clone();
        self.debounce(
            identifier,
            params,
            move || async move { coordinator.deduplicate(&id, &dedupe_params, work).await },
            wait,
        )
        .await
    }

    /// At most one invocation of `work` per `limit` for the same key. Inside
    /// the window the last result is returned; with no result yet the call
    /// waits out the window and then runs. A failure clears the key.
    pub async fn throttle<T, F, Fut>(
        &self,
        identifier: &str,
        params: &RequestParams,
        work: F,
        limit: Duration,
    ) -> ReadResult<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = ReadResult<T>>,
    {
        let key = request_key(identifier, params);
        let wait = {
            let mut slot = self.throttled.entry(key.clone()).or_insert_with(|| {
                Box::new(ThrottleState::<T> {
                    last_call: None,
                    last_result: None,
                }) as AnyState
            });
            let state = slot
                .downcast_mut::<ThrottleState<T>>()
                .ok_or_else(|| type_mismatch(identifier))?;

            let now = Instant::now();
            match state.last_call {
                Some(last) if now.duration_since(last) < limit => {
                    if let Some(result) = &state.last_result {
                        return Ok(result.clone());
                    }
                    // reserva la siguiente ventana
                    let next = last + limit;
                    state.last_call = Some(next);
                    next - now
                }
                _ => {
                    state.last_call = Some(now);
                    Duration::ZERO
                }
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        match work().await {
            Ok(result) => {
                if let Some(mut slot) = self.throttled.get_mut(&key) {
                    if let Some(state) = slot.downcast_mut::<ThrottleState<T>>() {
                        state.last_result = Some(result.clone());
                    }
                }
                Ok(result)
            }
            Err(e) => {
                self.throttled.remove(&key);
                Err(e)
            }
        }
    }

    /// Collects calls sharing `identifier` for `window` (opened by the first
    /// call, whose `batch_fn` is used), then runs `batch_fn` once with every
    /// collected item and hands result `i` to caller `i`.
    pub async fn batch_window<P, T, F, Fut>(
        &self,
        identifier: &str,
        params: P,
        batch_fn: F,
        window: Duration,
    ) -> ReadResult<T>
    where
        P: Send + 'static,
        T: Clone + Send + 'static,
        F: Fn(Vec<P>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ReadResult<Vec<T>>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let opened = {
            let mut created = false;
            let slot = self
                .batch_windows
                .entry(identifier.to_string())
                .or_insert_with(|| {
                    created = true;
                    let batch_fn: BatchFn<P, T> = Arc::new(move |items| batch_fn(items).boxed());
                    Arc::new(BatchWindowState {
                        pending: Mutex::new(Vec::new()),
                        batch_fn,
                    }) as Arc<dyn Any + Send + Sync>
                });
            let state = Arc::clone(slot.value())
                .downcast::<BatchWindowState<P, T>>()
                .map_err(|_| type_mismatch(identifier))?;
            lock(&state.pending).push((params, tx));
            created
        };

        if opened {
            let windows = Arc::clone(&self.batch_windows);
            let id = identifier.to_string();
            self.scheduler
                .schedule_once(format!("batch-window:{}", id), window, async move {
                    let Some((_, state)) = windows.remove(&id) else {
                        return;
                    };
                    let Ok(state) = state.downcast::<BatchWindowState<P, T>>() else {
                        return;
                    };
                    let items = std::mem::take(&mut *lock(&state.pending));
                    let batch_fn = Arc::clone(&state.batch_fn);
                    tokio::spawn(run_batch_window(id, items, batch_fn));
                });
        }

        rx.await.unwrap_or_else(|_| {
            Err(ReadError::Cancelled(format!(
                "batch window `{}` was cleared",
                identifier
            )))
        })
    }

    pub fn cancel_debounced(&self, identifier: &str, params: &RequestParams) -> bool {
        let key = request_key(identifier, params);
        self.scheduler.cancel(&format!("debounce:{}", key));
        self.debounced.remove(&key).is_some()
    }

    pub fn cancel_all_debounced(&self) -> usize {
        self.scheduler.cancel_prefix("debounce:");
        let count = self.debounced.len();
        self.debounced.clear();
        count
    }

    pub fn clear_throttles(&self) {
        self.throttled.clear();
    }

    /// Forgets all tracking. In-flight work keeps running; pending debounce
    /// and batch-window callers are rejected with `Cancelled`.
    pub fn clear_all(&self) {
        self.inflight.clear();
        self.cancel_all_debounced();
        self.clear_throttles();
        self.scheduler.cancel_prefix("batch-window:");
        self.batch_windows.clear();
    }

    pub fn stats(&self) -> RequestStats {
        RequestStats {
            in_flight: self.inflight.len(),
            debounced: self.debounced.len(),
            throttled: self.throttled.len(),
            batch_windows: self.batch_windows.len(),
        }
    }
}

async fn run_batch_window<P, T>(
    identifier: String,
    items: Vec<(P, oneshot::Sender<ReadResult<T>>)>,
    batch_fn: BatchFn<P, T>,
) where
    T: Clone,
{
    let (params, waiters): (Vec<P>, Vec<_>) = items.into_iter().unzip();
    debug!("📦 Batch window {} flushing {} items", identifier, params.len());

    match batch_fn(params).await {
        Ok(results) => {
            let mut results = results.into_iter();
            for (index, waiter) in waiters.into_iter().enumerate() {
                let outcome = results.next().ok_or_else(|| ReadError::MissingBatchResult {
                    identifier: identifier.clone(),
                    index,
                });
                let _ = waiter.send(outcome);
            }
        }
        Err(e) => {
            for waiter in waiters {
                let _ = waiter.send(Err(e.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn coordinator() -> RequestCoordinator {
        RequestCoordinator::new(Arc::new(TaskScheduler::new()), Requests::default())
    }

    fn params() -> RequestParams {
        RequestParams::new().with("chainId", 1).with("tokenAddress", "0xABC")
    }

    #[tokio::test(start_paused = true)]
    async fn test_identical_requests_share_one_invocation() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));

        let work = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok::<_, ReadError>(7u64)
            }
        };
        // mismo request con otro orden y mayusculas
        let other = RequestParams::new().with("TOKENADDRESS", "0xabc").with("chainid", 1);

        let first = params();
        let (a, b) = tokio::join!(
            coordinator.deduplicate("token", &first, work(calls.clone())),
            coordinator.deduplicate("token", &other, work(calls.clone())),
        );
        assert_eq!((a.unwrap(), b.unwrap()), (7, 7));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().in_flight, 0);

        coordinator
            .deduplicate("token", &params(), work(calls.clone()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_request_still_completes() {
        let coordinator = coordinator();
        let done = Arc::new(AtomicUsize::new(0));
        let flag = done.clone();

        let attempt = tokio::time::timeout(
            Duration::from_millis(1),
            coordinator.deduplicate("slow", &params(), move || async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                flag.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ReadError>(())
            }),
        )
        .await;
        assert!(attempt.is_err());
        assert_eq!(coordinator.stats().in_flight, 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_shared_and_released() {
        let coordinator = coordinator();
        let (p1, p2) = (params(), params());
        let (a, b) = tokio::join!(
            coordinator.deduplicate("fail", &p1, || async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Err::<u8, _>(ReadError::transport("https://rpc", "503"))
            }),
            coordinator.deduplicate("fail", &p2, || async { Ok::<u8, ReadError>(1) }),
        );
        assert!(matches!(a, Err(ReadError::Transport { .. })));
        assert_eq!(a, b);
        assert_eq!(coordinator.stats().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_runs_latest_work_once() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let wait = Duration::from_millis(300);

        let mut handles = Vec::new();
        for value in 1..=3u32 {
            let c = coordinator.clone();
            let counter = calls.clone();
            handles.push(tokio::spawn(async move {
                c.debounce(
                    "search",
                    &params(),
                    move || async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<_, ReadError>(value)
                    },
                    wait,
                )
                .await
            }));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 3);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.stats().debounced, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_debounce_rejects_waiters() {
        let coordinator = coordinator();
        let c = coordinator.clone();
        let pending = tokio::spawn(async move {
            c.debounce(
                "search",
                &params(),
                || async { Ok::<_, ReadError>(1u8) },
                Duration::from_secs(1),
            )
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(coordinator.cancel_debounced("search", &params()));
        assert!(matches!(pending.await.unwrap(), Err(ReadError::Cancelled(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_reuses_last_result_within_window() {
        let coordinator = coordinator();
        let calls = Arc::new(AtomicUsize::new(0));
        let limit = Duration::from_secs(1);

        let call = |calls: Arc<AtomicUsize>| {
            move || async move { Ok::<_, ReadError>(calls.fetch_add(1, Ordering::SeqCst) + 1) }
        };

        assert_eq!(coordinator.throttle("prices", &params(), call(calls.clone()), limit).await, Ok(1));
        assert_eq!(coordinator.throttle("prices", &params(), call(calls.clone()), limit).await, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(limit).await;
        assert_eq!(coordinator.throttle("prices", &params(), call(calls.clone()), limit).await, Ok(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_failure_clears_key() {
        let coordinator = coordinator();
        let limit = Duration::from_secs(1);
        let failed = coordinator
            .throttle("prices", &params(), || async { Err::<u8, _>(ReadError::Cancelled("x".into())) }, limit)
            .await;
        assert!(failed.is_err());
        assert_eq!(coordinator.stats().throttled, 0);

        let start = Instant::now();
        let ok = coordinator
            .throttle("prices", &params(), || async { Ok::<u8, ReadError>(9) }, limit)
            .await;
        assert_eq!(ok, Ok(9));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_window_fans_out_by_position() {
        let coordinator = coordinator();
        let invocations = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for item in 1..=3u64 {
            let c = coordinator.clone();
            let invocations = invocations.clone();
            handles.push(tokio::spawn(async move {
                c.batch_window(
                    "prices",
                    item,
                    move |items: Vec<u64>| {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        async move { Ok::<_, ReadError>(items.into_iter().map(|i| i * 10).collect::<Vec<_>>()) }
                    },
                    Duration::from_millis(100),
                )
                .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(results, vec![10, 20, 30]);
        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_window_short_result_fails_only_missing_item() {
        let coordinator = coordinator();
        let batch_fn = |items: Vec<u8>| async move { Ok::<_, ReadError>(items.into_iter().take(1).collect::<Vec<_>>()) };

        let (first, second) = tokio::join!(
            coordinator.batch_window("short", 1u8, batch_fn, Duration::from_millis(50)),
            coordinator.batch_window("short", 2u8, batch_fn, Duration::from_millis(50)),
        );
        assert_eq!(first, Ok(1));
        assert_eq!(
            second,
            Err(ReadError::MissingBatchResult {
                identifier: "short".to_string(),
                index: 1
            })
        );
    }
}
