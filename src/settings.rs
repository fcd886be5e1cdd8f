use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::cache_key::StoreKind;
use crate::chains::{builtin_chains, ChainConfig};

/// Time-to-live per logical store kind.
#[derive(Debug, Deserialize, Clone)]
pub struct CacheTtls {
    #[serde(default = "default_token_info_ttl_seconds")]
    pub token_info_seconds: u64,
    #[serde(default = "default_balances_ttl_seconds")]
    pub balances_seconds: u64,
    #[serde(default = "default_positions_ttl_seconds")]
    pub positions_seconds: u64,
    #[serde(default = "default_prices_ttl_seconds")]
    pub prices_seconds: u64,
    #[serde(default = "default_metadata_ttl_seconds")]
    pub metadata_seconds: u64,
}

fn default_token_info_ttl_seconds() -> u64 {
    7 * 24 * 60 * 60 // symbol/decimals no cambian
}
fn default_balances_ttl_seconds() -> u64 {
    30
}
fn default_positions_ttl_seconds() -> u64 {
    2 * 60
}
fn default_prices_ttl_seconds() -> u64 {
    60
}
fn default_metadata_ttl_seconds() -> u64 {
    5 * 60
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            token_info_seconds: default_token_info_ttl_seconds(),
            balances_seconds: default_balances_ttl_seconds(),
            positions_seconds: default_positions_ttl_seconds(),
            prices_seconds: default_prices_ttl_seconds(),
            metadata_seconds: default_metadata_ttl_seconds(),
        }
    }
}

impl CacheTtls {
    pub fn ttl(&self, kind: StoreKind) -> Duration {
        let seconds = match kind {
            StoreKind::TokenInfo => self.token_info_seconds,
            StoreKind::Balances => self.balances_seconds,
            StoreKind::Positions => self.positions_seconds,
            StoreKind::Prices => self.prices_seconds,
            StoreKind::Metadata => self.metadata_seconds,
        };
        Duration::from_secs(seconds)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PersistentBackend {
    Memory,
    File,
    Redis,
}

impl Default for PersistentBackend {
    fn default() -> Self {
        PersistentBackend::Memory
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Persistence {
    #[serde(default)]
    pub backend: PersistentBackend,
    #[serde(default = "default_persistence_path")]
    pub path: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_redis_namespace")]
    pub redis_namespace: String,
}

fn default_persistence_path() -> String {
    ".chain-read-cache".to_string()
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_redis_namespace() -> String {
    "chain-read".to_string()
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            backend: PersistentBackend::default(),
            path: default_persistence_path(),
            redis_url: default_redis_url(),
            redis_namespace: default_redis_namespace(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheSettings {
    #[serde(default = "default_memory_limit")]
    pub memory_limit: usize,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    #[serde(default)]
    pub ttl: CacheTtls,
    #[serde(default)]
    pub persistence: Persistence,
}

fn default_memory_limit() -> usize {
    500
}
fn default_sweep_interval_seconds() -> u64 {
    5 * 60
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            memory_limit: default_memory_limit(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            ttl: CacheTtls::default(),
            persistence: Persistence::default(),
        }
    }
}

impl CacheSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Batching {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,
}

fn default_max_batch_size() -> usize {
    100
}
fn default_batch_delay_ms() -> u64 {
    50
}
/// Multicall3, deployed at the same address on every supported chain.
pub fn default_multicall_address() -> String {
    "0xcA11bde05977b3631167028862bE2a173976CA11".to_string()
}

impl Default for Batching {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            batch_delay_ms: default_batch_delay_ms(),
        }
    }
}

impl Batching {
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HealthCheck {
    #[serde(default = "default_health_check_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_health_check_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

fn default_health_check_interval_seconds() -> u64 {
    60
}
fn default_health_check_timeout_seconds() -> u64 {
    5
}
fn default_failure_threshold() -> u32 {
    3
}
fn default_success_threshold() -> u32 {
    2
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            interval_seconds: default_health_check_interval_seconds(),
            timeout_seconds: default_health_check_timeout_seconds(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Rpc {
    #[serde(default = "default_primary_rate_limit")]
    pub primary_rate_limit: u32,
    #[serde(default = "default_fallback_rate_limit")]
    pub fallback_rate_limit: u32,
    #[serde(default = "default_rate_window_ms")]
    pub rate_window_ms: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_latency_ema_weight")]
    pub latency_ema_weight: f64,
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
    #[serde(default)]
    pub health_check: HealthCheck,
}

fn default_primary_rate_limit() -> u32 {
    50
}
fn default_fallback_rate_limit() -> u32 {
    10 // endpoints publicos
}
fn default_rate_window_ms() -> u64 {
    1000
}
fn default_backoff_base_ms() -> u64 {
    100
}
fn default_backoff_max_ms() -> u64 {
    1000
}
fn default_latency_ema_weight() -> f64 {
    0.1
}
fn default_request_timeout_seconds() -> u64 {
    10
}

impl Default for Rpc {
    fn default() -> Self {
        Self {
            primary_rate_limit: default_primary_rate_limit(),
            fallback_rate_limit: default_fallback_rate_limit(),
            rate_window_ms: default_rate_window_ms(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            latency_ema_weight: default_latency_ema_weight(),
            request_timeout_seconds: default_request_timeout_seconds(),
            health_check: HealthCheck::default(),
        }
    }
}

impl Rpc {
    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check.interval_seconds)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check.timeout_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Requests {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
}

fn default_debounce_ms() -> u64 {
    300
}
fn default_throttle_ms() -> u64 {
    1000
}
fn default_batch_window_ms() -> u64 {
    100
}

impl Default for Requests {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            throttle_ms: default_throttle_ms(),
            batch_window_ms: default_batch_window_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackgroundSync {
    #[serde(default = "default_max_concurrent_sync")]
    pub max_concurrent: usize,
    #[serde(default = "default_refresh_interval_seconds")]
    pub refresh_interval_seconds: u64,
}

fn default_max_concurrent_sync() -> usize {
    3
}
fn default_refresh_interval_seconds() -> u64 {
    30
}

impl Default for BackgroundSync {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent_sync(),
            refresh_interval_seconds: default_refresh_interval_seconds(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Log {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Log {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub batching: Batching,
    #[serde(default)]
    pub rpc: Rpc,
    #[serde(default)]
    pub requests: Requests,
    #[serde(default)]
    pub sync: BackgroundSync,
    #[serde(default)]
    pub log: Log,
    /// Empty means the built-in network table.
    #[serde(default)]
    pub chains: Vec<ChainConfig>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache: CacheSettings::default(),
            batching: Batching::default(),
            rpc: Rpc::default(),
            requests: Requests::default(),
            sync: BackgroundSync::default(),
            log: Log::default(),
            chains: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads `Config.toml` (optional) and `CHAIN_READ__*` environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::from_file("Config.toml")
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(Environment::with_prefix("CHAIN_READ").separator("__"))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        if settings.chains.is_empty() {
            settings.chains = builtin_chains();
        }

        // CHAIN_READ_RPC_<chain_id>=<url> reemplaza el endpoint primario
        for (name, value) in env::vars() {
            let Some(raw_id) = name.strip_prefix("CHAIN_READ_RPC_") else {
                continue;
            };
            let Ok(chain_id) = raw_id.parse::<u64>() else {
                continue;
            };
            let url = value.trim();
            if url.is_empty() {
                continue;
            }
            if let Some(chain) = settings.chains.iter_mut().find(|c| c.chain_id == chain_id) {
                chain.primary_rpc_url = url.to_string();
            }
        }

        Ok(settings)
    }

    /// Configured networks, falling back to the built-in table.
    pub fn networks(&self) -> Vec<ChainConfig> {
        if self.chains.is_empty() {
            builtin_chains()
        } else {
            self.chains.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_tuning_constants() {
        let settings = Settings::default();
        assert_eq!(settings.cache.memory_limit, 500);
        assert_eq!(settings.cache.sweep_interval(), Duration::from_secs(300));
        assert_eq!(settings.batching.max_batch_size, 100);
        assert_eq!(settings.batching.batch_delay(), Duration::from_millis(50));
        assert_eq!(settings.rpc.primary_rate_limit, 50);
        assert_eq!(settings.rpc.fallback_rate_limit, 10);
        assert_eq!(settings.rpc.health_check.failure_threshold, 3);
        assert_eq!(settings.rpc.health_check.success_threshold, 2);
        assert_eq!(settings.sync.max_concurrent, 3);
    }

    #[test]
    fn test_ttl_per_store_kind() {
        let ttls = CacheTtls::default();
        assert_eq!(ttls.ttl(StoreKind::TokenInfo), Duration::from_secs(604_800));
        assert_eq!(ttls.ttl(StoreKind::Balances), Duration::from_secs(30));
        assert_eq!(ttls.ttl(StoreKind::Positions), Duration::from_secs(120));
        assert_eq!(ttls.ttl(StoreKind::Prices), Duration::from_secs(60));
        assert_eq!(ttls.ttl(StoreKind::Metadata), Duration::from_secs(300));
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let settings = Settings::from_file("does-not-exist.toml").unwrap();
        assert_eq!(settings.requests.debounce_ms, 300);
        assert!(settings.chains.iter().any(|c| c.chain_id == 5000));
    }
}
