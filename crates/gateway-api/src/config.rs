//! Configuration management for the gateway
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use dhansetu_common::{supported_chains, ChainConfig};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Redis,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Where payments and subscriptions live
    pub storage_backend: StorageBackend,

    /// Redis connection URL (Redis backend only)
    pub redis_url: String,

    /// Base URL for hosted payment pages
    pub base_url: String,

    /// Merchant webhook endpoint; unset disables delivery
    pub webhook_url: Option<String>,

    /// HMAC secret for webhook signatures
    pub webhook_secret: String,

    pub livemode: bool,

    /// Gateway fee rate, e.g. 0.01 for 1%
    pub fee_rate: Decimal,

    /// Default payment lifetime in hours
    pub payment_expiry_hours: i64,

    /// Whether to use mock chain gateways (for development/testing)
    pub mock_chains: bool,

    /// Per-call RPC timeout in seconds
    pub rpc_timeout_secs: u64,

    /// Receiving address per chain key
    pub receiving_addresses: HashMap<String, String>,

    /// RPC URL overrides per chain key
    pub rpc_urls: HashMap<String, String>,

    /// Billing sweep cadence in seconds
    pub billing_interval_secs: u64,

    /// Trial expiry sweep cadence in seconds
    pub trial_interval_secs: u64,

    /// Payment expiry sweep cadence in seconds
    pub payment_expiry_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenvy::dotenv().ok();

        let storage_backend = match env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => StorageBackend::Memory,
            "redis" => StorageBackend::Redis,
            other => anyhow::bail!("Invalid STORAGE_BACKEND: {other} (expected memory/redis)"),
        };

        let mut receiving_addresses = HashMap::new();
        let mut rpc_urls = HashMap::new();
        for chain in supported_chains() {
            let suffix = chain.key.to_uppercase();
            if let Ok(address) = env::var(format!("RECEIVING_ADDRESS_{suffix}")) {
                receiving_addresses.insert(chain.key.clone(), address);
            }
            if let Ok(url) = env::var(format!("RPC_URL_{suffix}")) {
                rpc_urls.insert(chain.key.clone(), url);
            }
        }

        let config = Config {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            api_port: env::var("API_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid API_PORT")?,

            storage_backend,

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),

            base_url: env::var("BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),

            webhook_url: env::var("WEBHOOK_URL").ok(),

            webhook_secret: env::var("WEBHOOK_SECRET")
                .unwrap_or_else(|_| "dhansetu-dev-secret".to_string()),

            livemode: env::var("LIVEMODE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .context("Invalid LIVEMODE (expected true/false)")?,

            fee_rate: env::var("FEE_RATE")
                .unwrap_or_else(|_| "0.01".to_string())
                .parse()
                .context("Invalid FEE_RATE")?,

            payment_expiry_hours: env::var("PAYMENT_EXPIRY_HOURS")
                .unwrap_or_else(|_| "24".to_string())
                .parse()
                .context("Invalid PAYMENT_EXPIRY_HOURS")?,

            mock_chains: env::var("MOCK_CHAINS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid MOCK_CHAINS (expected true/false)")?,

            rpc_timeout_secs: env::var("RPC_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid RPC_TIMEOUT_SECS")?,

            receiving_addresses,
            rpc_urls,

            billing_interval_secs: env::var("BILLING_INTERVAL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .context("Invalid BILLING_INTERVAL_SECS")?,

            trial_interval_secs: env::var("TRIAL_INTERVAL_SECS")
                .unwrap_or_else(|_| "86400".to_string())
                .parse()
                .context("Invalid TRIAL_INTERVAL_SECS")?,

            payment_expiry_interval_secs: env::var("PAYMENT_EXPIRY_INTERVAL_SECS")
                .unwrap_or_else(|_| "3600".to_string())
                .parse()
                .context("Invalid PAYMENT_EXPIRY_INTERVAL_SECS")?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.fee_rate < Decimal::ZERO || self.fee_rate >= Decimal::ONE {
            anyhow::bail!("FEE_RATE must be in [0, 1)");
        }

        if self.payment_expiry_hours <= 0 {
            anyhow::bail!("PAYMENT_EXPIRY_HOURS must be greater than 0");
        }

        if self.webhook_secret.is_empty() {
            anyhow::bail!("WEBHOOK_SECRET must not be empty");
        }

        // Live chains need RPC endpoints for every chain we accept
        // payments on
        if !self.mock_chains {
            for chain in self.receiving_addresses.keys() {
                if !self.rpc_urls.contains_key(chain) {
                    anyhow::bail!(
                        "RPC_URL_{} is required when MOCK_CHAINS=false",
                        chain.to_uppercase()
                    );
                }
            }
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    /// Chain registry entries with RPC URLs applied, restricted to chains
    /// that have both an RPC endpoint and a receiving address.
    pub fn chain_configs(&self) -> Vec<ChainConfig> {
        supported_chains()
            .into_iter()
            .filter_map(|mut chain| {
                let url = self.rpc_urls.get(&chain.key)?;
                if !self.receiving_addresses.contains_key(&chain.key) {
                    return None;
                }
                chain.rpc_url = url.clone();
                Some(chain)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Tests here read and mutate process env; run them one at a time.
    fn env_lock() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(())).lock().unwrap()
    }

    #[test]
    fn test_config_defaults() {
        let _env = env_lock();
        for var in [
            "API_HOST",
            "API_PORT",
            "STORAGE_BACKEND",
            "REDIS_URL",
            "FEE_RATE",
            "MOCK_CHAINS",
            "LIVEMODE",
        ] {
            env::remove_var(var);
        }

        let config = Config::from_env().unwrap();
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.storage_backend, StorageBackend::Memory);
        assert!(config.mock_chains);
        assert!(!config.livemode);
        assert_eq!(config.fee_rate, "0.01".parse::<Decimal>().unwrap());
        assert_eq!(config.api_address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_chain_configs_require_address_and_rpc() {
        let _env = env_lock();
        let mut config = Config::from_env().unwrap();
        config.rpc_urls.clear();
        config.receiving_addresses.clear();
        config
            .rpc_urls
            .insert("ethereum".into(), "http://localhost:8545".into());
        assert!(config.chain_configs().is_empty());

        config
            .receiving_addresses
            .insert("ethereum".into(), "0xrecv".into());
        let configs = config.chain_configs();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].rpc_url, "http://localhost:8545");
    }
}
