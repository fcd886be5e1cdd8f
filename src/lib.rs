//! # Chain Read SDK
//!
//! Cached, deduplicated, batched and load-balanced token reads for EVM
//! chains (Ethereum, Base, Mantle, Mantle Sepolia, HyperEVM).
//!
//! ## Overview
//!
//! Callers ask for `{ token, user?, chain }` and get symbol, decimals and an
//! integer balance string. Underneath, every read travels through the same
//! layers:
//!
//! - **Cache**: bounded in-memory map over a persistent store, per-kind TTLs
//! - **Coordination**: in-flight deduplication, debounce, throttle, batch windows
//! - **Batching**: per-chain queues flushed as one Multicall3 `aggregate`
//! - **Transport**: per-chain endpoint pools with health, rate limits and failover
//!
//! ## Architecture
//!
//! ### Storage Layer
//! [`cache::CacheStore`] fronts a [`persistence::PersistentStore`] (memory,
//! file or Redis) and evicts by TTL, by key or by chain.
//!
//! ### Coordination Layer
//! [`request_coordinator::RequestCoordinator`] and
//! [`optimistic::SwrOrchestrator`] decide whether a read hits the network at
//! all, and when.
//!
//! ### Network Layer
//! [`call_batcher::CallBatcher`] packs reads into multicalls that
//! [`rpc_pool::RpcLoadBalancer`] routes to a healthy endpoint.
//!
//! ### Facade
//! [`token_data::TokenDataService`] wires everything together and never
//! surfaces errors to display code.

// Configuration
/// Configuration management
pub mod settings;
/// Network table and native-coin placeholder
pub mod chains;
/// Error types
pub mod errors;

// Runtime primitives
/// Wall clock abstraction for cache timestamps
pub mod clock;
/// Named timer ownership
pub mod scheduler;

// Storage Layer
/// Cache keys and typed request descriptors
pub mod cache_key;
/// Persistent cache backends
pub mod persistence;
/// Two-layer cache store
pub mod cache;

// Coordination Layer
/// Deduplication, debounce, throttle and batch windows
pub mod request_coordinator;
/// Stale-while-revalidate and background sync
pub mod optimistic;

// Network Layer
/// Smart contract ABIs (read-only)
pub mod contracts;
/// JSON-RPC transport
pub mod transport;
/// RPC endpoint pools with load balancing
pub mod rpc_pool;
/// Multicall aggregate codec and executor
pub mod multicall;
/// Per-chain call batching
pub mod call_batcher;

// Facade
/// Token data service
pub mod token_data;

// Utilities
/// Metrics and observability
pub mod metrics;
/// General utilities
pub mod utils;

// Re-exports for convenience
pub use cache::CacheStore;
pub use cache_key::{RequestParams, StoreKind};
pub use chains::{ChainRegistry, NATIVE_TOKEN};
pub use errors::{ReadError, ReadResult};
pub use settings::Settings;
pub use token_data::{TokenData, TokenDataService, TokenInfo};
