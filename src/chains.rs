//! Network table: which chains are readable, where their RPC endpoints live
//! and what their native coin is called.

use ethers::types::{Address, H160};
use log::warn;
use serde::Deserialize;
use std::collections::HashMap;
use std::str::FromStr;
use url::Url;

use crate::errors::{ReadError, ReadResult};
use crate::settings::default_multicall_address;

/// EIP-7528 placeholder for a chain's native coin (`0xEeee...EEeE`).
pub const NATIVE_TOKEN: Address = H160([0xee; 20]);

pub const NATIVE_DECIMALS: u8 = 18;

pub fn is_native_token(address: &Address) -> bool {
    *address == NATIVE_TOKEN
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    pub native_symbol: String,
    pub primary_rpc_url: String,
    #[serde(default)]
    pub fallback_rpc_urls: Vec<String>,
    #[serde(default = "default_multicall_address")]
    pub multicall_address: String,
}

impl ChainConfig {
    fn builtin(
        chain_id: u64,
        name: &str,
        native_symbol: &str,
        primary: &str,
        fallbacks: &[&str],
    ) -> Self {
        Self {
            chain_id,
            name: name.to_string(),
            native_symbol: native_symbol.to_string(),
            primary_rpc_url: primary.to_string(),
            fallback_rpc_urls: fallbacks.iter().map(|u| u.to_string()).collect(),
            multicall_address: default_multicall_address(),
        }
    }

    pub fn multicall_address(&self) -> ReadResult<Address> {
        Address::from_str(&self.multicall_address).map_err(|e| {
            ReadError::InvalidInput(format!(
                "multicall address {} for chain {}: {}",
                self.multicall_address, self.chain_id, e
            ))
        })
    }
}

/// Built-in networks with public endpoints.
pub fn builtin_chains() -> Vec<ChainConfig> {
    vec![
        ChainConfig::builtin(
            1,
            "Ethereum",
            "ETH",
            "https://ethereum-rpc.publicnode.com",
            &[
                "https://eth.llamarpc.com",
                "https://rpc.ankr.com/eth",
                "https://ethereum.publicnode.com",
                "https://eth-pokt.nodies.app",
                "https://eth.drpc.org",
            ],
        ),
        ChainConfig::builtin(
            8453,
            "Base",
            "ETH",
            "https://base-rpc.publicnode.com",
            &[
                "https://mainnet.base.org",
                "https://base.llamarpc.com",
                "https://base-pokt.nodies.app",
                "https://base.drpc.org",
            ],
        ),
        ChainConfig::builtin(
            5000,
            "Mantle",
            "MNT",
            "https://rpc.mantle.xyz",
            &["https://mantle.publicnode.com", "https://mantle.drpc.org"],
        ),
        ChainConfig::builtin(
            5003,
            "Mantle Sepolia",
            "MNT",
            "https://rpc.sepolia.mantle.xyz",
            &[],
        ),
        ChainConfig::builtin(
            999,
            "HyperEVM",
            "HYPE",
            "https://rpc.hyperliquid.xyz/evm",
            &[],
        ),
    ]
}

/// Validated, immutable view of the configured networks.
#[derive(Debug, Clone)]
pub struct ChainRegistry {
    chains: HashMap<u64, ChainConfig>,
}

impl ChainRegistry {
    /// Drops chains whose primary URL does not parse and fallback URLs that do
    /// not parse or repeat the primary.
    pub fn new(configs: Vec<ChainConfig>) -> Self {
        let mut chains = HashMap::new();
        for mut config in configs {
            if let Err(e) = Url::parse(&config.primary_rpc_url) {
                warn!(
                    "⚠️ Skipping chain {}: invalid primary RPC url {}: {}",
                    config.chain_id, config.primary_rpc_url, e
                );
                continue;
            }
            let primary = config.primary_rpc_url.clone();
            config.fallback_rpc_urls.retain(|url| {
                if *url == primary {
                    return false;
                }
                match Url::parse(url) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("⚠️ Ignoring fallback RPC url {}: {}", url, e);
                        false
                    }
                }
            });
            chains.insert(config.chain_id, config);
        }
        Self { chains }
    }

    pub fn builtin() -> Self {
        Self::new(builtin_chains())
    }

    pub fn get(&self, chain_id: u64) -> ReadResult<&ChainConfig> {
        self.chains
            .get(&chain_id)
            .ok_or(ReadError::UnsupportedChain(chain_id))
    }

    pub fn native_symbol(&self, chain_id: u64) -> ReadResult<&str> {
        self.get(chain_id).map(|c| c.native_symbol.as_str())
    }

    pub fn chain_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.chains.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_native_sentinel_matches_eip7528() {
        let parsed = Address::from_str("0xEeeeeEeeeEeEeeEeEeEeeEEEeeeeEeeeeeeeEEeE").unwrap();
        assert_eq!(parsed, NATIVE_TOKEN);
        assert!(is_native_token(&parsed));
        assert!(!is_native_token(&Address::zero()));
    }

    #[test]
    fn test_native_symbols() {
        let registry = ChainRegistry::builtin();
        assert_eq!(registry.native_symbol(1).unwrap(), "ETH");
        assert_eq!(registry.native_symbol(8453).unwrap(), "ETH");
        assert_eq!(registry.native_symbol(5000).unwrap(), "MNT");
        assert_eq!(registry.native_symbol(999).unwrap(), "HYPE");
    }

    #[test]
    fn test_unknown_chain_is_rejected() {
        let registry = ChainRegistry::builtin();
        assert_eq!(
            registry.get(42161).unwrap_err(),
            ReadError::UnsupportedChain(42161)
        );
    }

    #[test]
    fn test_invalid_urls_are_filtered() {
        let mut config = ChainConfig::builtin(
            10,
            "Test",
            "ETH",
            "https://primary.example",
            &["not a url", "https://primary.example", "https://fallback.example"],
        );
        let registry = ChainRegistry::new(vec![config.clone()]);
        assert_eq!(
            registry.get(10).unwrap().fallback_rpc_urls,
            vec!["https://fallback.example".to_string()]
        );

        config.primary_rpc_url = "::bad::".to_string();
        let registry = ChainRegistry::new(vec![config]);
        assert!(registry.get(10).is_err());
    }

    #[test]
    fn test_default_multicall_address_parses() {
        let registry = ChainRegistry::builtin();
        let address = registry.get(1).unwrap().multicall_address().unwrap();
        assert_eq!(
            format!("{:?}", address),
            "0xca11bde05977b3631167028862be2a173976ca11"
        );
    }
}
