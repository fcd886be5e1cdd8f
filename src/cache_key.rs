//! Cache keys and request descriptors.
//!
//! A key is `"{store}:{k1}:{v1}|{k2}:{v2}"` with parameter names sorted and
//! both names and values lower-cased, so the same logical request always maps
//! to the same key whatever order or casing the caller used.

use ethers::types::Address;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Logical cache partitions, each with its own TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    TokenInfo,
    Balances,
    Positions,
    Prices,
    Metadata,
}

impl StoreKind {
    pub const ALL: [StoreKind; 5] = [
        StoreKind::TokenInfo,
        StoreKind::Balances,
        StoreKind::Positions,
        StoreKind::Prices,
        StoreKind::Metadata,
    ];

    pub fn store_name(self) -> &'static str {
        match self {
            StoreKind::TokenInfo => "token-info",
            StoreKind::Balances => "balances",
            StoreKind::Positions => "positions",
            StoreKind::Prices => "prices",
            StoreKind::Metadata => "metadata",
        }
    }

    pub fn from_store_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.store_name() == name)
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.store_name())
    }
}

/// Canonicalized parameter set of a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RequestParams(BTreeMap<String, String>);

impl RequestParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: &str, value: impl fmt::Display) {
        self.0
            .insert(name.to_lowercase(), value.to_string().to_lowercase());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(&name.to_lowercase()).map(String::as_str)
    }

    pub fn chain_id(&self) -> Option<u64> {
        self.get("chainId")?.parse().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `k1:v1|k2:v2` in sorted name order.
    pub fn canonical(&self) -> String {
        self.0
            .iter()
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect::<Vec<_>>()
            .join("|")
    }
}

impl<K: AsRef<str>, V: fmt::Display> FromIterator<(K, V)> for RequestParams {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = RequestParams::new();
        for (k, v) in iter {
            params.insert(k.as_ref(), v);
        }
        params
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(kind: StoreKind, params: &RequestParams) -> Self {
        CacheKey(format!("{}:{}", kind.store_name(), params.canonical()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Store kind encoded in the key prefix.
    pub fn store_kind(&self) -> Option<StoreKind> {
        store_kind_of(&self.0)
    }
}

pub(crate) fn store_kind_of(raw_key: &str) -> Option<StoreKind> {
    raw_key
        .split_once(':')
        .and_then(|(prefix, _)| StoreKind::from_store_name(prefix))
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Typed request with a fixed store kind and canonical parameters.
pub trait CacheRequest {
    fn store_kind(&self) -> StoreKind;
    fn params(&self) -> RequestParams;

    fn chain_tag(&self) -> Option<u64> {
        self.params().chain_id()
    }

    fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.store_kind(), &self.params())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TokenInfoRequest {
    pub token: Address,
    pub chain_id: u64,
}

impl CacheRequest for TokenInfoRequest {
    fn store_kind(&self) -> StoreKind {
        StoreKind::TokenInfo
    }

    fn params(&self) -> RequestParams {
        RequestParams::new()
            .with("tokenAddress", format!("{:?}", self.token))
            .with("chainId", self.chain_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BalanceRequest {
    pub token: Address,
    pub user: Address,
    pub chain_id: u64,
}

impl CacheRequest for BalanceRequest {
    fn store_kind(&self) -> StoreKind {
        StoreKind::Balances
    }

    fn params(&self) -> RequestParams {
        RequestParams::new()
            .with("tokenAddress", format!("{:?}", self.token))
            .with("userAddress", format!("{:?}", self.user))
            .with("chainId", self.chain_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionsRequest {
    pub user: Address,
    pub chain_id: u64,
    pub protocol: String,
}

impl CacheRequest for PositionsRequest {
    fn store_kind(&self) -> StoreKind {
        StoreKind::Positions
    }

    fn params(&self) -> RequestParams {
        RequestParams::new()
            .with("userAddress", format!("{:?}", self.user))
            .with("chainId", self.chain_id)
            .with("protocol", &self.protocol)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PriceRequest {
    pub token: Address,
    pub chain_id: u64,
    pub quote: String,
}

impl CacheRequest for PriceRequest {
    fn store_kind(&self) -> StoreKind {
        StoreKind::Prices
    }

    fn params(&self) -> RequestParams {
        RequestParams::new()
            .with("tokenAddress", format!("{:?}", self.token))
            .with("chainId", self.chain_id)
            .with("quote", &self.quote)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetadataRequest {
    pub name: String,
    pub chain_id: Option<u64>,
}

impl CacheRequest for MetadataRequest {
    fn store_kind(&self) -> StoreKind {
        StoreKind::Metadata
    }

    fn params(&self) -> RequestParams {
        let params = RequestParams::new().with("name", &self.name);
        match self.chain_id {
            Some(chain_id) => params.with("chainId", chain_id),
            None => params,
        }
    }
}
