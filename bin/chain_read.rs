//! # chain-read
//!
//! Command line front end for the Chain Read SDK. Every subcommand prints
//! JSON to stdout; logs go to stderr.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin chain-read -- token 0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48 --chain-id 1
//! cargo run --bin chain-read -- tokens 0xA0b8...eB48 0xEeee...EEeE --user 0xd8dA...6045
//! cargo run --bin chain-read -- health --chain-id 5000
//! ```
//!
//! Settings come from `Config.toml` (optional) and `CHAIN_READ__*` variables;
//! `CHAIN_READ_RPC_<chain_id>` replaces a chain's primary RPC URL.

use anyhow::{Context, Result};
use chain_read_sdk::settings::Settings;
use chain_read_sdk::token_data::TokenDataService;
use chain_read_sdk::utils::{format_token_balance, parse_address};
use clap::{Parser, Subcommand};
use ethers::types::Address;
use log::info;
use serde_json::json;

#[derive(Parser)]
#[command(name = "chain-read")]
#[command(about = "Cached, batched token reads across EVM chains")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (TOML)
    #[arg(long, default_value = "Config.toml")]
    config: String,

    /// Prometheus listener, e.g. 0.0.0.0:9100
    #[cfg(feature = "observability")]
    #[arg(long)]
    metrics_addr: Option<std::net::SocketAddr>,
}

#[derive(Subcommand)]
enum Commands {
    /// Symbol, decimals and (with --user) balance of one token
    Token {
        address: String,

        #[arg(short, long, default_value = "1")]
        chain_id: u64,

        /// Wallet whose balance is read
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Same as `token` for several tokens, batched into multicalls
    Tokens {
        #[arg(required = true)]
        addresses: Vec<String>,

        #[arg(short, long, default_value = "1")]
        chain_id: u64,

        #[arg(short, long)]
        user: Option<String>,
    },

    /// Probe every endpoint of the given chains (all configured if none)
    Health {
        #[arg(short, long)]
        chain_id: Vec<u64>,
    },

    /// Read one token, then print every internal counter
    Stats {
        address: String,

        #[arg(short, long, default_value = "1")]
        chain_id: u64,
    },
}

fn init_logging(settings: &Settings) {
    #[cfg(feature = "observability")]
    {
        use std::str::FromStr;
        let level = tracing::Level::from_str(&settings.log.level).unwrap_or(tracing::Level::INFO);
        tracing_subscriber::fmt()
            .json()
            .with_max_level(level)
            .with_writer(std::io::stderr)
            .init();
    }

    #[cfg(not(feature = "observability"))]
    {
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log.level.as_str()))
            .target(env_logger::Target::Stderr)
            .init();
    }
}

fn parse_user(user: Option<&str>) -> Result<Option<Address>> {
    user.map(|u| parse_address(u).context("invalid --user"))
        .transpose()
}

fn with_display_balance(data: &chain_read_sdk::TokenData) -> serde_json::Value {
    let display = format_token_balance(&data.balance, data.decimals, 6).unwrap_or_else(|_| data.balance.clone());
    json!({
        "address": data.address,
        "symbol": data.symbol,
        "decimals": data.decimals,
        "balance": data.balance,
        "display_balance": display,
        "needs_wallet": data.needs_wallet,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    let settings = Settings::from_file(&cli.config).context("failed to load settings")?;
    init_logging(&settings);

    #[cfg(feature = "observability")]
    if let Some(addr) = cli.metrics_addr {
        chain_read_sdk::metrics::install_prometheus_exporter(addr)?;
        info!("📊 Prometheus exporter on {}", addr);
    }

    let service = TokenDataService::builder().settings(settings).build().await?;
    service.start();

    let output = match cli.command {
        Commands::Token {
            address,
            chain_id,
            user,
        } => {
            let token = parse_address(&address)?;
            let user = parse_user(user.as_deref())?;
            let data = service.get_token_data(token, user, chain_id, None).await;
            with_display_balance(&data)
        }

        Commands::Tokens {
            addresses,
            chain_id,
            user,
        } => {
            let tokens = addresses
                .iter()
                .map(|a| parse_address(a))
                .collect::<Result<Vec<_>, _>>()?;
            let user = parse_user(user.as_deref())?;
            let results = service
                .fetch_multiple_tokens_data(&tokens, user, chain_id)
                .await;
            serde_json::Value::Array(results.iter().map(with_display_balance).collect())
        }

        Commands::Health { chain_id } => {
            let chains = if chain_id.is_empty() {
                service.registry().chain_ids()
            } else {
                chain_id
            };
            for chain in &chains {
                service.balancer().manager(*chain)?;
            }
            info!("🩺 Probing {} chain(s)", chains.len());
            service.balancer().health_check_all().await;
            serde_json::to_value(service.balancer().stats())?
        }

        Commands::Stats { address, chain_id } => {
            let token = parse_address(&address)?;
            service.get_token_info(token, chain_id).await;
            serde_json::to_value(service.stats().await)?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    service.shutdown();
    Ok(())
}
