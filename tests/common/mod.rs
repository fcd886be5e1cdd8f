//! Shared fixtures for integration tests: a scripted node and a service
//! wired to it.

#![allow(dead_code)]

use async_trait::async_trait;
use chain_read_sdk::chains::ChainConfig;
use chain_read_sdk::clock::ManualClock;
use chain_read_sdk::contracts::{
    BalanceOfCall, BalanceOfReturn, DecimalsCall, DecimalsReturn, SymbolCall, SymbolReturn,
};
use chain_read_sdk::errors::{ReadError, ReadResult};
use chain_read_sdk::multicall::{decode_aggregate_calls, encode_aggregate_result};
use chain_read_sdk::persistence::InMemoryStore;
use chain_read_sdk::settings::Settings;
use chain_read_sdk::token_data::TokenDataService;
use chain_read_sdk::transport::RpcTransport;
use ethers::abi::{AbiDecode, AbiEncode};
use ethers::contract::EthCall;
use ethers::types::{Address, Bytes, U256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const MOCK_BLOCK: u64 = 19_000_000;

pub fn addr(n: u64) -> Address {
    Address::from_low_u64_be(n)
}

pub fn primary_url(chain_id: u64) -> String {
    format!("http://primary.mock/{}", chain_id)
}

pub fn fallback_url(chain_id: u64, n: usize) -> String {
    format!("http://fallback{}.mock/{}", n, chain_id)
}

/// Mock network table: each chain gets one primary and `fallbacks` fallbacks.
pub fn mock_chain(chain_id: u64, native_symbol: &str, fallbacks: usize) -> ChainConfig {
    ChainConfig {
        chain_id,
        name: format!("mock-{}", chain_id),
        native_symbol: native_symbol.to_string(),
        primary_rpc_url: primary_url(chain_id),
        fallback_rpc_urls: (0..fallbacks).map(|n| fallback_url(chain_id, n)).collect(),
        multicall_address: chain_read_sdk::settings::default_multicall_address(),
    }
}

pub fn mock_settings() -> Settings {
    Settings {
        chains: vec![
            mock_chain(1, "ETH", 1),
            mock_chain(8453, "ETH", 1),
            mock_chain(5000, "MNT", 1),
            mock_chain(999, "HYPE", 0),
        ],
        ..Settings::default()
    }
}

#[derive(Debug, Clone)]
struct MockToken {
    symbol: String,
    decimals: u8,
    balances: HashMap<Address, U256>,
}

/// Scripted node. Answers `aggregate` with ERC20 data per token, fails on
/// selected URLs and records everything it was asked.
#[derive(Default)]
pub struct MockTransport {
    tokens: Mutex<HashMap<Address, MockToken>>,
    native_balances: Mutex<HashMap<Address, U256>>,
    failing: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
    aggregate_sizes: Mutex<Vec<usize>>,
    endpoints_called: Mutex<Vec<String>>,
    erc20_calls: AtomicUsize,
    balance_calls: AtomicUsize,
    block_calls: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_token(&self, token: Address, symbol: &str, decimals: u8) {
        self.tokens.lock().unwrap().insert(
            token,
            MockToken {
                symbol: symbol.to_string(),
                decimals,
                balances: HashMap::new(),
            },
        );
    }

    pub fn set_balance(&self, token: Address, user: Address, balance: u64) {
        if let Some(entry) = self.tokens.lock().unwrap().get_mut(&token) {
            entry.balances.insert(user, U256::from(balance));
        }
    }

    pub fn set_native_balance(&self, user: Address, balance: u64) {
        self.native_balances
            .lock()
            .unwrap()
            .insert(user, U256::from(balance));
    }

    pub fn fail_url(&self, url: &str) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn heal_url(&self, url: &str) {
        self.failing.lock().unwrap().remove(url);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Size of every `aggregate` request, in arrival order.
    pub fn aggregate_sizes(&self) -> Vec<usize> {
        self.aggregate_sizes.lock().unwrap().clone()
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregate_sizes.lock().unwrap().len()
    }

    /// Individual ERC20 sub-calls across all aggregates.
    pub fn erc20_calls(&self) -> usize {
        self.erc20_calls.load(Ordering::SeqCst)
    }

    pub fn balance_calls(&self) -> usize {
        self.balance_calls.load(Ordering::SeqCst)
    }

    pub fn block_calls(&self) -> usize {
        self.block_calls.load(Ordering::SeqCst)
    }

    pub fn endpoints_called(&self) -> Vec<String> {
        self.endpoints_called.lock().unwrap().clone()
    }

    async fn enter(&self, endpoint: &str) -> ReadResult<()> {
        self.endpoints_called
            .lock()
            .unwrap()
            .push(endpoint.to_string());
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.failing.lock().unwrap().contains(endpoint) {
            return Err(ReadError::transport(endpoint, "503 Service Unavailable"));
        }
        Ok(())
    }

    /// Empty return data for unknown tokens, which fails to decode.
    fn answer(&self, target: Address, call_data: &[u8]) -> Bytes {
        self.erc20_calls.fetch_add(1, Ordering::SeqCst);
        let tokens = self.tokens.lock().unwrap();
        let Some(token) = tokens.get(&target) else {
            return Bytes::new();
        };
        let selector = &call_data[..4.min(call_data.len())];
        if selector == SymbolCall::selector() {
            SymbolReturn(token.symbol.clone()).encode().into()
        } else if selector == DecimalsCall::selector() {
            DecimalsReturn(token.decimals).encode().into()
        } else if selector == BalanceOfCall::selector() {
            match BalanceOfCall::decode(call_data) {
                Ok(call) => {
                    let balance = token.balances.get(&call.account).copied().unwrap_or_default();
                    BalanceOfReturn(balance).encode().into()
                }
                Err(_) => Bytes::new(),
            }
        } else {
            Bytes::new()
        }
    }
}

#[async_trait]
impl RpcTransport for MockTransport {
    async fn call(&self, endpoint: &str, _to: Address, data: Bytes) -> ReadResult<Bytes> {
        let calls = decode_aggregate_calls(&data)
            .map_err(|e| ReadError::transport(endpoint, format!("bad aggregate: {}", e)))?;
        self.aggregate_sizes.lock().unwrap().push(calls.len());
        self.enter(endpoint).await?;

        let results = calls
            .iter()
            .map(|call| self.answer(call.target, &call.call_data))
            .collect();
        Ok(encode_aggregate_result(U256::from(MOCK_BLOCK), results))
    }

    async fn get_balance(&self, endpoint: &str, account: Address) -> ReadResult<U256> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(endpoint).await?;
        Ok(self
            .native_balances
            .lock()
            .unwrap()
            .get(&account)
            .copied()
            .unwrap_or_default())
    }

    async fn block_number(&self, endpoint: &str) -> ReadResult<u64> {
        self.block_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(endpoint).await?;
        Ok(MOCK_BLOCK)
    }
}

/// Service over `transport` with in-memory persistence and a manual clock.
pub async fn service_with(transport: Arc<MockTransport>) -> (TokenDataService, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let service = TokenDataService::builder()
        .settings(mock_settings())
        .transport(transport)
        .persistent_store(Arc::new(InMemoryStore::new()))
        .clock(clock.clone())
        .build()
        .await
        .expect("service builds");
    (service, clock)
}
