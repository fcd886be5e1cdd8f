// src/rpc_pool.rs

use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;

use dashmap::DashMap;
use ethers::types::{Address, Bytes, U256};

use crate::chains::{ChainConfig, ChainRegistry};
use crate::errors::{ReadError, ReadResult};
use crate::metrics;
use crate::scheduler::TaskScheduler;
use crate::settings::Rpc;
use crate::transport::RpcTransport;
use crate::utils::lock;

#[derive(Debug)]
struct EndpointState {
    is_healthy: bool,
    failure_count: u32,
    success_count: u32,
    avg_latency_ms: f64,
    /// Requests admitted in the current rate window.
    request_count: u32,
    total_requests: u64,
    total_errors: u64,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            is_healthy: true, // Assume healthy initially
            failure_count: 0,
            success_count: 0,
            avg_latency_ms: 0.0,
            request_count: 0,
            total_requests: 0,
            total_errors: 0,
        }
    }
}

/// Snapshot of one endpoint for debug panels.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointStats {
    pub url: String,
    pub is_primary: bool,
    pub is_healthy: bool,
    pub avg_latency_ms: u64,
    /// Completed requests, failed ones included.
    pub total_requests: u64,
    pub total_errors: u64,
    /// `total_errors / total_requests`, so at most 100%.
    pub error_rate: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainRpcStats {
    pub chain_id: u64,
    pub endpoints: Vec<EndpointStats>,
    pub healthy_count: usize,
    pub total_count: usize,
}

/// One RPC URL with health, latency and rate-window accounting.
///
/// Health uses failure credits: each failure adds one, each success removes
/// one (floored at 0). `failure_threshold` credits mark the endpoint
/// unhealthy; `success_threshold` consecutive successes mark it healthy again.
/// Counters are not time-windowed, so an endpoint alternating between
/// failure and success stays where it is.
#[derive(Debug)]
pub struct RpcEndpoint {
    url: String,
    is_primary: bool,
    rate_limit: u32,
    failure_threshold: u32,
    success_threshold: u32,
    latency_weight: f64,
    state: Mutex<EndpointState>,
}

impl RpcEndpoint {
    pub fn new(url: impl Into<String>, is_primary: bool, settings: &Rpc) -> Self {
        let rate_limit = if is_primary {
            settings.primary_rate_limit
        } else {
            settings.fallback_rate_limit
        };
        Self {
            url: url.into(),
            is_primary,
            rate_limit,
            failure_threshold: settings.health_check.failure_threshold,
            success_threshold: settings.health_check.success_threshold,
            latency_weight: settings.latency_ema_weight,
            state: Mutex::new(EndpointState::default()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn rate_limit(&self) -> u32 {
        self.rate_limit
    }

    pub fn is_healthy(&self) -> bool {
        lock(&self.state).is_healthy
    }

    /// Under the per-window request budget.
    pub fn can_accept(&self) -> bool {
        lock(&self.state).request_count < self.rate_limit
    }

    fn is_available(&self) -> bool {
        let state = lock(&self.state);
        state.is_healthy && state.request_count < self.rate_limit
    }

    /// Counts one request against the current rate window.
    pub fn admit(&self) {
        lock(&self.state).request_count += 1;
    }

    /// Returns true when this success flipped the endpoint back to healthy.
    pub fn record_success(&self, latency: Duration) -> bool {
        let mut state = lock(&self.state);
        state.success_count += 1;
        state.failure_count = state.failure_count.saturating_sub(1);
        state.total_requests += 1;

        let sample = latency.as_secs_f64() * 1000.0;
        state.avg_latency_ms = if state.avg_latency_ms == 0.0 {
            sample
        } else {
            state.avg_latency_ms * (1.0 - self.latency_weight) + sample * self.latency_weight
        };

        let mut recovered = false;
        if state.success_count >= self.success_threshold {
            recovered = !state.is_healthy;
            state.is_healthy = true;
            state.success_count = 0;
        }
        recovered
    }

    /// Returns true when this failure flipped the endpoint to unhealthy.
    /// Failures count towards `total_requests` as well as `total_errors`.
    pub fn record_failure(&self) -> bool {
        let mut state = lock(&self.state);
        state.failure_count += 1;
        state.success_count = 0;
        state.total_requests += 1;
        state.total_errors += 1;

        if state.failure_count >= self.failure_threshold && state.is_healthy {
            state.is_healthy = false;
            return true;
        }
        false
    }

    pub fn reset_rate_limit(&self) {
        lock(&self.state).request_count = 0;
    }

    pub fn reset(&self) {
        *lock(&self.state) = EndpointState::default();
    }

    pub fn stats(&self) -> EndpointStats {
        let state = lock(&self.state);
        let error_rate = if state.total_requests > 0 {
            format!(
                "{:.2}%",
                state.total_errors as f64 / state.total_requests as f64 * 100.0
            )
        } else {
            "0%".to_string()
        };
        EndpointStats {
            url: self.url.clone(),
            is_primary: self.is_primary,
            is_healthy: state.is_healthy,
            avg_latency_ms: state.avg_latency_ms.round() as u64,
            total_requests: state.total_requests,
            total_errors: state.total_errors,
            error_rate,
        }
    }
}

/// Endpoint pool of one chain: the primary first, then its fallbacks.
pub struct ProviderManager {
    chain_id: u64,
    endpoints: Vec<Arc<RpcEndpoint>>,
    next_fallback: AtomicUsize,
    settings: Rpc,
}

impl ProviderManager {
    pub fn new(config: &ChainConfig, settings: &Rpc) -> Self {
        let mut endpoints = vec![Arc::new(RpcEndpoint::new(
            config.primary_rpc_url.clone(),
            true,
            settings,
        ))];
        for url in &config.fallback_rpc_urls {
            if *url != config.primary_rpc_url {
                endpoints.push(Arc::new(RpcEndpoint::new(url.clone(), false, settings)));
            }
        }

        Self {
            chain_id: config.chain_id,
            endpoints,
            next_fallback: AtomicUsize::new(0),
            settings: settings.clone(),
        }
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn endpoints(&self) -> &[Arc<RpcEndpoint>] {
        &self.endpoints
    }

    /// Best endpoint to try next. Never fails: with every endpoint unhealthy
    /// the primary is returned as a last resort.
    pub fn get_endpoint(&self) -> Arc<RpcEndpoint> {
        Arc::clone(&self.endpoints[self.select(&[])])
    }

    /// Primary if healthy and under budget, else round-robin over healthy
    /// under-budget fallbacks, else any healthy endpoint, else the first
    /// candidate (the primary unless it was already tried).
    fn select(&self, tried: &[usize]) -> usize {
        let candidates: Vec<usize> = (0..self.endpoints.len())
            .filter(|i| !tried.contains(i))
            .collect();
        let Some(&first) = candidates.first() else {
            return 0;
        };

        let available: Vec<usize> = candidates
            .iter()
            .copied()
            .filter(|&i| self.endpoints[i].is_available())
            .collect();

        if let Some(&primary) = available.iter().find(|&&i| self.endpoints[i].is_primary) {
            return primary;
        }
        if !available.is_empty() {
            let turn = self.next_fallback.fetch_add(1, Ordering::Relaxed);
            return available[turn % available.len()];
        }
        candidates
            .iter()
            .copied()
            .find(|&i| self.endpoints[i].is_healthy())
            .unwrap_or(first)
    }

    /// Backoff between failover attempts: base, 2x base, 4x base ... capped.
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.settings.backoff_base_ms / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(Duration::from_millis(self.settings.backoff_max_ms))
    }

    /// Runs `request` against successive endpoints until one succeeds, at most
    /// once per endpoint of the chain. A JSON-RPC error reply ends the loop
    /// at once and leaves the endpoint healthy.
    pub async fn execute_request<T, F, Fut>(&self, request: F) -> ReadResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ReadResult<T>>,
    {
        let max_attempts = self.endpoints.len();
        let mut delays = self.backoff();
        let mut tried = Vec::with_capacity(max_attempts);
        let mut last_error: Option<ReadError> = None;

        for attempt in 0..max_attempts {
            let index = self.select(&tried);
            tried.push(index);
            let endpoint = &self.endpoints[index];
            endpoint.admit();

            let started = Instant::now();
            match request(endpoint.url.clone()).await {
                Ok(result) => {
                    let latency = started.elapsed();
                    if endpoint.record_success(latency) {
                        info!("✅ RPC endpoint {} is healthy again", endpoint.url);
                        metrics::set_endpoint_health(&endpoint.url, true);
                    }
                    metrics::record_rpc_success(self.chain_id, latency);
                    return Ok(result);
                }
                // el nodo respondio: otro endpoint daria el mismo error
                Err(e) if e.is_rpc_response() => {
                    if endpoint.record_success(started.elapsed()) {
                        info!("✅ RPC endpoint {} is healthy again", endpoint.url);
                        metrics::set_endpoint_health(&endpoint.url, true);
                    }
                    debug!("RPC error from {} is final: {}", endpoint.url, e);
                    return Err(e);
                }
                Err(e) => {
                    if endpoint.record_failure() {
                        warn!("🔴 RPC endpoint {} marked unhealthy", endpoint.url);
                        metrics::set_endpoint_health(&endpoint.url, false);
                    }
                    metrics::record_rpc_failure(self.chain_id);
                    warn!(
                        "⚠️ RPC request failed on {} (attempt {}/{}): {}",
                        endpoint.url,
                        attempt + 1,
                        max_attempts,
                        e
                    );
                    last_error = Some(e);

                    if attempt + 1 < max_attempts {
                        if let Some(delay) = delays.next() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        Err(ReadError::AllEndpointsFailed {
            chain_id: self.chain_id,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no endpoints configured".to_string()),
        })
    }

    pub fn reset_rate_limits(&self) {
        for endpoint in &self.endpoints {
            endpoint.reset_rate_limit();
        }
    }

    /// Probes every endpoint with `eth_blockNumber`; outcomes feed the same
    /// health accounting as live traffic.
    pub async fn health_check(&self, transport: &dyn RpcTransport) {
        let timeout = self.settings.health_check_timeout();
        let checks = self.endpoints.iter().map(|endpoint| async move {
            let started = Instant::now();
            let outcome = tokio::time::timeout(timeout, transport.block_number(&endpoint.url)).await;
            match outcome {
                Ok(Ok(_)) => {
                    endpoint.record_success(started.elapsed());
                }
                Ok(Err(e)) => {
                    debug!("Health check failed for {}: {}", endpoint.url, e);
                    endpoint.record_failure();
                }
                Err(_) => {
                    debug!("Health check timed out for {}", endpoint.url);
                    endpoint.record_failure();
                }
            }
            metrics::set_endpoint_health(&endpoint.url, endpoint.is_healthy());
        });
        join_all(checks).await;
    }

    pub fn reset(&self) {
        for endpoint in &self.endpoints {
            endpoint.reset();
        }
    }

    pub fn stats(&self) -> ChainRpcStats {
        let endpoints: Vec<EndpointStats> = self.endpoints.iter().map(|e| e.stats()).collect();
        ChainRpcStats {
            chain_id: self.chain_id,
            healthy_count: endpoints.iter().filter(|e| e.is_healthy).count(),
            total_count: endpoints.len(),
            endpoints,
        }
    }
}

/// Load-balanced RPC access for every configured chain.
///
/// Pools are created on first use of a chain. Each pool gets a rate-window
/// reset timer (`rpc:rate:{chain}`); `start_health_checks` adds the periodic
/// probe (`rpc:health`). `dispose` cancels both and forgets every pool.
///
/// ## Usage
///
/// ```rust,ignore
/// let balancer = RpcLoadBalancer::new(registry, transport, scheduler, settings.rpc.clone());
/// let block = balancer.block_number(1).await?;
/// ```
pub struct RpcLoadBalancer {
    registry: Arc<ChainRegistry>,
    transport: Arc<dyn RpcTransport>,
    scheduler: Arc<TaskScheduler>,
    settings: Rpc,
    managers: DashMap<u64, Arc<ProviderManager>>,
}

impl RpcLoadBalancer {
    pub fn new(
        registry: Arc<ChainRegistry>,
        transport: Arc<dyn RpcTransport>,
        scheduler: Arc<TaskScheduler>,
        settings: Rpc,
    ) -> Self {
        Self {
            registry,
            transport,
            scheduler,
            settings,
            managers: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    pub fn transport(&self) -> &Arc<dyn RpcTransport> {
        &self.transport
    }

    /// Endpoint pool for `chain_id`, created on first use.
    pub fn manager(&self, chain_id: u64) -> ReadResult<Arc<ProviderManager>> {
        if let Some(manager) = self.managers.get(&chain_id) {
            return Ok(Arc::clone(manager.value()));
        }
        let config = self.registry.get(chain_id)?;

        let mut created = false;
        let manager = self
            .managers
            .entry(chain_id)
            .or_insert_with(|| {
                created = true;
                Arc::new(ProviderManager::new(config, &self.settings))
            })
            .value()
            .clone();

        if created {
            info!(
                "🔌 RPC pool for chain {} ({}) with {} endpoints",
                chain_id,
                config.name,
                manager.endpoints().len()
            );
            let ticking = Arc::clone(&manager);
            self.scheduler.schedule_interval(
                format!("rpc:rate:{}", chain_id),
                self.settings.rate_window(),
                move || {
                    ticking.reset_rate_limits();
                    async {}
                },
            );
        }
        Ok(manager)
    }

    pub async fn execute<T, F, Fut>(&self, chain_id: u64, request: F) -> ReadResult<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = ReadResult<T>>,
    {
        self.manager(chain_id)?.execute_request(request).await
    }

    pub async fn call(&self, chain_id: u64, to: Address, data: Bytes) -> ReadResult<Bytes> {
        let transport = &self.transport;
        self.execute(chain_id, |url| {
            let data = data.clone();
            async move { transport.call(&url, to, data).await }
        })
        .await
    }

    pub async fn get_balance(&self, chain_id: u64, account: Address) -> ReadResult<U256> {
        let transport = &self.transport;
        self.execute(chain_id, |url| async move {
            transport.get_balance(&url, account).await
        })
        .await
    }

    pub async fn block_number(&self, chain_id: u64) -> ReadResult<u64> {
        let transport = &self.transport;
        self.execute(chain_id, |url| async move { transport.block_number(&url).await })
            .await
    }

    /// Probes every endpoint of every active pool.
    pub async fn health_check_all(&self) {
        let managers: Vec<Arc<ProviderManager>> =
            self.managers.iter().map(|m| Arc::clone(m.value())).collect();
        let transport = self.transport.as_ref();
        join_all(managers.iter().map(|m| m.health_check(transport))).await;
    }

    /// Registers the periodic health probe.
    pub fn start_health_checks(self: &Arc<Self>) {
        let balancer = Arc::downgrade(self);
        let interval = self.settings.health_check_interval();
        self.scheduler
            .schedule_interval("rpc:health", interval, move || {
                let balancer = balancer.clone();
                async move {
                    if let Some(balancer) = balancer.upgrade() {
                        balancer.health_check_all().await;
                    }
                }
            });
        info!("🔄 Periodic RPC health checks enabled (interval: {:?})", interval);
    }

    pub fn stats(&self) -> BTreeMap<u64, ChainRpcStats> {
        self.managers
            .iter()
            .map(|m| (*m.key(), m.value().stats()))
            .collect()
    }

    pub fn reset_all_endpoints(&self) {
        for manager in self.managers.iter() {
            manager.value().reset();
        }
    }

    /// Cancels every RPC timer and drops all pools.
    pub fn dispose(&self) {
        self.scheduler.cancel_prefix("rpc:");
        self.managers.clear();
    }
}
