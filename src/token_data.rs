//! Token data facade: symbol, decimals and balances for any configured chain.
//!
//! Every read goes cache → request coordinator → call batcher → load
//! balancer. Token info is cached for a week, balances for 30 seconds with
//! stale-while-revalidate. Balances are integer strings in the token's
//! smallest unit; formatting is left to [`crate::utils::format_token_balance`].
//!
//! The native coin of each chain is addressed with
//! [`NATIVE_TOKEN`](crate::chains::NATIVE_TOKEN) and read
//! with `eth_getBalance` instead of ERC20 calls.
//!
//! ```rust,ignore
//! let service = TokenDataService::builder().build().await?;
//! service.start();
//! let data = service.get_token_data(usdc, Some(wallet), 1, None).await;
//! println!("{} {}", data.symbol, data.balance);
//! service.shutdown();
//! ```

use ethers::types::Address;
use futures::future::join_all;
use indexmap::{IndexMap, IndexSet};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheStats, CacheStore};
use crate::cache_key::{BalanceRequest, CacheRequest, RequestParams, StoreKind, TokenInfoRequest};
use crate::call_batcher::{BalanceResult, BatcherStats, CallBatcher, TokenInfoResult};
use crate::chains::{is_native_token, ChainRegistry, NATIVE_DECIMALS};
use crate::clock::{Clock, SystemClock};
use crate::contracts::{BalanceOfCall, BalanceOfReturn, DecimalsCall, DecimalsReturn, SymbolCall, SymbolReturn};
use crate::errors::ReadResult;
use crate::metrics;
use crate::multicall::Multicall;
use crate::optimistic::{OnUpdate, PrefetchReport, SwrOrchestrator, SyncStats};
use crate::persistence::{open_store, PersistentStore};
use crate::request_coordinator::{RequestCoordinator, RequestStats};
use crate::rpc_pool::{ChainRpcStats, RpcLoadBalancer};
use crate::scheduler::TaskScheduler;
use crate::settings::Settings;
use crate::transport::{HttpTransport, RpcTransport};

pub const UNKNOWN_SYMBOL: &str = "UNKNOWN";
pub const DEFAULT_DECIMALS: u8 = 18;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenInfo {
    pub symbol: String,
    pub decimals: u8,
}

impl TokenInfo {
    pub fn unknown() -> Self {
        Self {
            symbol: UNKNOWN_SYMBOL.to_string(),
            decimals: DEFAULT_DECIMALS,
        }
    }
}

/// What callers render for one token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenData {
    pub address: Address,
    pub symbol: String,
    pub decimals: u8,
    /// Integer string in the smallest unit, `"0"` without a wallet.
    pub balance: String,
    pub needs_wallet: bool,
}

impl TokenData {
    fn from_info(address: Address, info: TokenInfo, balance: String, needs_wallet: bool) -> Self {
        Self {
            address,
            symbol: info.symbol,
            decimals: info.decimals,
            balance,
            needs_wallet,
        }
    }

    fn unknown(address: Address, needs_wallet: bool) -> Self {
        Self::from_info(address, TokenInfo::unknown(), "0".to_string(), needs_wallet)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub requests: RequestStats,
    pub batching: BatcherStats,
    pub rpc: BTreeMap<u64, ChainRpcStats>,
    pub sync: SyncStats,
    pub scheduled_timers: usize,
}

async fn fetch_token_info(batcher: CallBatcher, chain_id: u64, token: Address) -> ReadResult<TokenInfo> {
    let (symbol, decimals) = futures::join!(
        batcher.batched_call::<_, SymbolReturn>(chain_id, token, SymbolCall),
        batcher.batched_call::<_, DecimalsReturn>(chain_id, token, DecimalsCall),
    );
    Ok(TokenInfo {
        symbol: symbol?.0,
        decimals: decimals?.0,
    })
}

/// Tokens list as a stable request parameter (`0xa,0xb`).
fn token_list(tokens: &[Address]) -> String {
    tokens
        .iter()
        .map(|t| format!("{:?}", t))
        .collect::<Vec<_>>()
        .join(",")
}

/// Configures and wires a [`TokenDataService`].
#[derive(Default)]
pub struct TokenDataServiceBuilder {
    settings: Option<Settings>,
    transport: Option<Arc<dyn RpcTransport>>,
    store: Option<Arc<dyn PersistentStore>>,
    clock: Option<Arc<dyn Clock>>,
}

impl TokenDataServiceBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn RpcTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn persistent_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Opens the configured persistent backend unless one was injected.
    pub async fn build(self) -> anyhow::Result<TokenDataService> {
        let settings = self.settings.unwrap_or_default();
        let store = match self.store {
            Some(store) => store,
            None => open_store(&settings.cache.persistence).await?,
        };
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HttpTransport::new(settings.rpc.request_timeout())) as Arc<dyn RpcTransport>);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>);

        let registry = Arc::new(ChainRegistry::new(settings.networks()));
        if registry.chain_ids().is_empty() {
            anyhow::bail!("no usable chain configured");
        }
        let scheduler = Arc::new(TaskScheduler::new());
        let cache = Arc::new(CacheStore::new(&settings.cache, store, clock));
        let coordinator = RequestCoordinator::new(Arc::clone(&scheduler), settings.requests.clone());
        let balancer = Arc::new(RpcLoadBalancer::new(
            Arc::clone(&registry),
            transport,
            Arc::clone(&scheduler),
            settings.rpc.clone(),
        ));
        let batcher = CallBatcher::new(
            Multicall::new(Arc::clone(&balancer)),
            Arc::clone(&scheduler),
            settings.batching.clone(),
        );
        let swr = SwrOrchestrator::new(
            Arc::clone(&cache),
            coordinator.clone(),
            Arc::clone(&scheduler),
            &settings.sync,
        );

        info!("✅ Token data service ready for chains {:?}", registry.chain_ids());
        Ok(TokenDataService {
            settings,
            registry,
            scheduler,
            cache,
            coordinator,
            balancer,
            batcher,
            swr,
        })
    }
}

/// Read facade over the cache, coordinator, batcher and load balancer.
///
/// The `get_*` and `fetch_*` methods never fail: errors are logged and
/// replaced with neutral values (`UNKNOWN`, 18 decimals, `"0"`, empty list).
/// The `try_*` methods return the error instead.
pub struct TokenDataService {
    settings: Settings,
    registry: Arc<ChainRegistry>,
    scheduler: Arc<TaskScheduler>,
    cache: Arc<CacheStore>,
    coordinator: RequestCoordinator,
    balancer: Arc<RpcLoadBalancer>,
    batcher: CallBatcher,
    swr: SwrOrchestrator,
}

impl TokenDataService {
    pub fn builder() -> TokenDataServiceBuilder {
        TokenDataServiceBuilder::default()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ChainRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    pub fn balancer(&self) -> &Arc<RpcLoadBalancer> {
        &self.balancer
    }

    pub fn batcher(&self) -> &CallBatcher {
        &self.batcher
    }

    pub fn swr(&self) -> &SwrOrchestrator {
        &self.swr
    }

    /// Starts the cache sweeper and the periodic RPC health checks.
    pub fn start(&self) {
        metrics::describe_metrics();
        self.cache
            .start_sweeper(&self.scheduler, self.settings.cache.sweep_interval());
        self.balancer.start_health_checks();
    }

    /// Rejects queued work and cancels every timer.
    pub fn shutdown(&self) {
        self.swr.clear_all_background_tasks();
        self.coordinator.clear_all();
        let dropped = self.batcher.clear_all();
        self.balancer.dispose();
        self.scheduler.shutdown();
        info!("🛑 Token data service stopped ({} queued calls dropped)", dropped);
    }

    fn ttl(&self, kind: StoreKind) -> Duration {
        self.cache.ttl(kind)
    }

    pub async fn try_get_token_info(&self, token: Address, chain_id: u64) -> ReadResult<TokenInfo> {
        if token.is_zero() {
            return Ok(TokenInfo::unknown());
        }
        if is_native_token(&token) {
            return Ok(TokenInfo {
                symbol: self.registry.native_symbol(chain_id)?.to_string(),
                decimals: NATIVE_DECIMALS,
            });
        }
        // chain desconocida: fallar antes de tocar la cache
        self.registry.get(chain_id)?;

        let request = TokenInfoRequest { token, chain_id };
        let batcher = self.batcher.clone();
        self.swr
            .get_or_fetch(
                StoreKind::TokenInfo,
                &request.params(),
                self.ttl(StoreKind::TokenInfo),
                move || fetch_token_info(batcher, chain_id, token),
            )
            .await
    }

    pub async fn get_token_info(&self, token: Address, chain_id: u64) -> TokenInfo {
        self.try_get_token_info(token, chain_id)
            .await
            .unwrap_or_else(|e| {
                warn!("⚠️ Token info for {:?} on chain {} unavailable: {}", token, chain_id, e);
                TokenInfo::unknown()
            })
    }

    /// Balance with stale-while-revalidate: a cached value is returned at
    /// once and `on_update` receives the refreshed one if it changed.
    pub async fn try_get_token_balance(
        &self,
        token: Address,
        user: Address,
        chain_id: u64,
        on_update: Option<OnUpdate<String>>,
    ) -> ReadResult<String> {
        if token.is_zero() || user.is_zero() {
            return Ok("0".to_string());
        }
        self.registry.get(chain_id)?;

        let request = BalanceRequest { token, user, chain_id };
        let batcher = self.batcher.clone();
        let balancer = Arc::clone(&self.balancer);
        let result = self
            .swr
            .stale_while_revalidate(
                StoreKind::Balances,
                &request.params(),
                self.ttl(StoreKind::Balances),
                move || async move {
                    let balance = if is_native_token(&token) {
                        balancer.get_balance(chain_id, user).await?
                    } else {
                        batcher
                            .batched_call::<_, BalanceOfReturn>(chain_id, token, BalanceOfCall { account: user })
                            .await?
                            .0
                    };
                    Ok(balance.to_string())
                },
                on_update,
            )
            .await?;
        Ok(result.data)
    }

    pub async fn get_token_balance(
        &self,
        token: Address,
        user: Address,
        chain_id: u64,
        on_update: Option<OnUpdate<String>>,
    ) -> String {
        self.try_get_token_balance(token, user, chain_id, on_update)
            .await
            .unwrap_or_else(|e| {
                warn!("⚠️ Balance of {:?} for {:?} on chain {} unavailable: {}", token, user, chain_id, e);
                "0".to_string()
            })
    }

    /// Info and balance together. Without `user` only the info is read and
    /// the result asks for a wallet.
    pub async fn get_token_data(
        &self,
        token: Address,
        user: Option<Address>,
        chain_id: u64,
        on_update: Option<OnUpdate<String>>,
    ) -> TokenData {
        if token.is_zero() {
            return TokenData::unknown(token, user.is_none());
        }
        match user {
            None => {
                let info = self.get_token_info(token, chain_id).await;
                TokenData::from_info(token, info, "0".to_string(), true)
            }
            Some(user) => {
                let (info, balance) = futures::join!(
                    self.get_token_info(token, chain_id),
                    self.get_token_balance(token, user, chain_id, on_update),
                );
                TokenData::from_info(token, info, balance, false)
            }
        }
    }

    /// Token data for many tokens in as few multicalls as possible.
    ///
    /// Results follow the first-seen order of `tokens`, duplicates removed.
    /// Every result is written back to the token-info and balance caches.
    pub async fn fetch_multiple_tokens_data(
        &self,
        tokens: &[Address],
        user: Option<Address>,
        chain_id: u64,
    ) -> Vec<TokenData> {
        let unique: IndexSet<Address> = tokens.iter().copied().collect();
        if unique.is_empty() {
            return Vec::new();
        }
        match self.try_fetch_multiple_tokens_data(&unique, user, chain_id).await {
            Ok(results) => results,
            Err(e) => {
                warn!("⚠️ Batch token data on chain {} failed: {}", chain_id, e);
                unique
                    .into_iter()
                    .map(|token| TokenData::unknown(token, user.is_none()))
                    .collect()
            }
        }
    }

    async fn try_fetch_multiple_tokens_data(
        &self,
        unique: &IndexSet<Address>,
        user: Option<Address>,
        chain_id: u64,
    ) -> ReadResult<Vec<TokenData>> {
        let (native, erc20): (Vec<Address>, Vec<Address>) =
            unique.iter().copied().partition(is_native_token);

        let mut by_token: IndexMap<Address, TokenData> = IndexMap::with_capacity(unique.len());

        if !erc20.is_empty() {
            let mut params = RequestParams::new()
                .with("chainId", chain_id)
                .with("tokens", token_list(&erc20));
            if let Some(user) = user {
                params.insert("userAddress", format!("{:?}", user));
            }
            let batcher = self.batcher.clone();
            let batch_tokens = erc20.clone();
            let results = self
                .coordinator
                .deduplicate("batchGetTokenData", &params, move || async move {
                    batcher.batch_get_token_data(chain_id, &batch_tokens, user).await
                })
                .await?;

            for result in results {
                let info = match (result.symbol, result.decimals) {
                    (Some(symbol), Some(decimals)) => {
                        let info = TokenInfo { symbol, decimals };
                        self.cache
                            .set_request(&TokenInfoRequest { token: result.address, chain_id }, &info)
                            .await;
                        info
                    }
                    (symbol, decimals) => TokenInfo {
                        symbol: symbol.unwrap_or_else(|| UNKNOWN_SYMBOL.to_string()),
                        decimals: decimals.unwrap_or(DEFAULT_DECIMALS),
                    },
                };
                let balance = match (user, result.balance) {
                    (Some(user), Some(balance)) => {
                        let balance = balance.to_string();
                        self.cache
                            .set_request(
                                &BalanceRequest { token: result.address, user, chain_id },
                                &balance,
                            )
                            .await;
                        balance
                    }
                    _ => "0".to_string(),
                };
                by_token.insert(
                    result.address,
                    TokenData::from_info(result.address, info, balance, user.is_none()),
                );
            }
        }

        let native_reads = native
            .iter()
            .map(|&token| self.get_token_data(token, user, chain_id, None));
        for data in join_all(native_reads).await {
            by_token.insert(data.address, data);
        }

        Ok(unique
            .iter()
            .map(|token| {
                by_token
                    .shift_remove(token)
                    .unwrap_or_else(|| TokenData::unknown(*token, user.is_none()))
            })
            .collect())
    }

    /// `symbol()`/`decimals()` for many ERC20 tokens; the native placeholder
    /// is skipped. Complete results are cached.
    pub async fn fetch_multiple_tokens_info(&self, tokens: &[Address], chain_id: u64) -> Vec<TokenInfoResult> {
        let erc20: Vec<Address> = tokens
            .iter()
            .copied()
            .filter(|t| !is_native_token(t))
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        if erc20.is_empty() {
            return Vec::new();
        }

        let params = RequestParams::new()
            .with("chainId", chain_id)
            .with("tokens", token_list(&erc20));
        let batcher = self.batcher.clone();
        let batch_tokens = erc20.clone();
        let outcome = self
            .coordinator
            .deduplicate("batchGetTokenInfo", &params, move || async move {
                batcher.batch_get_token_info(chain_id, &batch_tokens).await
            })
            .await;

        match outcome {
            Ok(results) => {
                for result in &results {
                    if let (Some(symbol), Some(decimals)) = (&result.symbol, result.decimals) {
                        let info = TokenInfo {
                            symbol: symbol.clone(),
                            decimals,
                        };
                        self.cache
                            .set_request(&TokenInfoRequest { token: result.address, chain_id }, &info)
                            .await;
                    }
                }
                results
            }
            Err(e) => {
                warn!("⚠️ Batch token info on chain {} failed: {}", chain_id, e);
                Vec::new()
            }
        }
    }

    /// `balanceOf(user)` for many ERC20 tokens. Balances that decoded are
    /// cached as integer strings.
    pub async fn fetch_multiple_balances(
        &self,
        tokens: &[Address],
        user: Address,
        chain_id: u64,
    ) -> Vec<BalanceResult> {
        let erc20: Vec<Address> = tokens
            .iter()
            .copied()
            .filter(|t| !is_native_token(t))
            .collect::<IndexSet<_>>()
            .into_iter()
            .collect();
        if erc20.is_empty() || user.is_zero() {
            return Vec::new();
        }

        let params = RequestParams::new()
            .with("chainId", chain_id)
            .with("tokens", token_list(&erc20))
            .with("userAddress", format!("{:?}", user));
        let batcher = self.batcher.clone();
        let batch_tokens = erc20.clone();
        let outcome = self
            .coordinator
            .deduplicate("batchGetBalances", &params, move || async move {
                batcher.batch_get_balances(chain_id, &batch_tokens, user).await
            })
            .await;

        match outcome {
            Ok(results) => {
                for result in results.iter().filter(|r| r.error.is_none()) {
                    let request = BalanceRequest {
                        token: result.token_address,
                        user,
                        chain_id,
                    };
                    self.cache
                        .set_request(&request, &result.balance.to_string())
                        .await;
                }
                results
            }
            Err(e) => {
                warn!("⚠️ Batch balances on chain {} failed: {}", chain_id, e);
                Vec::new()
            }
        }
    }

    /// Warms the token-info cache in the background queue.
    pub async fn preload_tokens(&self, tokens: &[Address], chain_id: u64) -> PrefetchReport {
        let params: Vec<RequestParams> = tokens
            .iter()
            .copied()
            .filter(|t| !is_native_token(t) && !t.is_zero())
            .collect::<IndexSet<_>>()
            .into_iter()
            .map(|token| TokenInfoRequest { token, chain_id }.params())
            .collect();

        let batcher = self.batcher.clone();
        let report = self
            .swr
            .prefetch(
                StoreKind::TokenInfo,
                params,
                self.ttl(StoreKind::TokenInfo),
                move |params: RequestParams| {
                    let batcher = batcher.clone();
                    async move {
                        let token = crate::utils::parse_address(params.get("tokenAddress").unwrap_or_default())?;
                        fetch_token_info(batcher, chain_id, token).await
                    }
                },
            )
            .await;
        debug!("Preloaded token info on chain {}: {:?}", chain_id, report);
        report
    }

    /// Drops every cached entry of `chain_id`, or of every configured chain.
    pub async fn invalidate_user_balances(&self, chain_id: Option<u64>) {
        let chains = match chain_id {
            Some(chain_id) => vec![chain_id],
            None => self.registry.chain_ids(),
        };
        for chain_id in chains {
            self.cache.invalidate_by_chain(chain_id).await;
        }
    }

    pub async fn invalidate_token_cache(&self, token: Address, chain_id: u64) {
        let request = TokenInfoRequest { token, chain_id };
        self.cache
            .invalidate(request.store_kind(), &request.params())
            .await;
    }

    /// Forces the next balance read to hit the chain, e.g. after the user's
    /// own transaction confirmed.
    pub async fn invalidate_balance(&self, token: Address, user: Address, chain_id: u64) {
        let request = BalanceRequest { token, user, chain_id };
        self.cache
            .invalidate(request.store_kind(), &request.params())
            .await;
    }

    pub async fn clear_all_caches(&self) {
        self.cache.clear_all().await;
    }

    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.stats().await,
            requests: self.coordinator.stats(),
            batching: self.batcher.stats(),
            rpc: self.balancer.stats(),
            sync: self.swr.sync_stats(),
            scheduled_timers: self.scheduler.pending_count(),
        }
    }
}
