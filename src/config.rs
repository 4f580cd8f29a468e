//! Configuration management for the HTLC relayer
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub relayer: RelayerConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub evm: EvmConfig,
    pub aptos: AptosConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelayerConfig {
    pub instance_id: String,
    /// Refund sweep period
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Period for retrying stalled destination locks and withdrawals
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Destination leg expires this long before the source leg
    pub timelock_safety_margin_secs: u64,
    /// Minimum time a new destination leg must stay open
    pub min_timelock_window_secs: u64,
    #[serde(default = "default_queue_capacity")]
    pub event_queue_capacity: usize,
    pub health_check_interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    600
}

fn default_retry_interval() -> u64 {
    60
}

fn default_queue_capacity() -> usize {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvmConfig {
    pub chain_id: u64,
    pub name: String,
    pub rpc_urls: Vec<String>,
    pub htlc_address: String,
    pub confirmation_blocks: u64,
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_block_range")]
    pub max_block_range: u64,
    /// First block to scan when no checkpoint exists
    #[serde(default)]
    pub start_block: u64,
    pub gas_price_strategy: GasPriceStrategy,
    pub max_gas_price_gwei: u64,
    pub private_key_env: String,
}

fn default_max_block_range() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AptosConfig {
    pub node_url: String,
    /// Account that published the `htlc` module
    pub module_address: String,
    pub poll_interval_ms: u64,
    pub max_gas_amount: u64,
    pub gas_unit_price: u64,
    pub txn_expiration_secs: u64,
    pub private_key_env: String,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("HTLC_RELAYER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(config_str: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.relayer.sweep_interval_secs == 0 {
            anyhow::bail!("relayer.sweep_interval_secs must be positive");
        }
        if self.relayer.retry_interval_secs == 0 {
            anyhow::bail!("relayer.retry_interval_secs must be positive");
        }
        if self.relayer.timelock_safety_margin_secs == 0 {
            anyhow::bail!("relayer.timelock_safety_margin_secs must be positive");
        }
        if self.evm.rpc_urls.is_empty() {
            anyhow::bail!("Chain {} has no RPC URLs configured", self.evm.name);
        }
        if self.evm.htlc_address.is_empty() {
            anyhow::bail!("Chain {} has no HTLC contract address", self.evm.name);
        }
        if self.aptos.node_url.is_empty() {
            anyhow::bail!("aptos.node_url must be set");
        }
        if self.aptos.module_address.is_empty() {
            anyhow::bail!("aptos.module_address must be set");
        }
        if self.evm.confirmation_blocks == 0 {
            tracing::warn!(
                "Chain {} has confirmation_blocks = 0; reorged events will reach the coordinator",
                self.evm.name
            );
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    lazy_static::lazy_static! {
        static ref ENV_VAR: regex::Regex =
            regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");
    }

    ENV_VAR
        .replace_all(input, |cap: &regex::Captures| {
            env::var(&cap[1]).unwrap_or_default()
        })
        .into_owned()
}
