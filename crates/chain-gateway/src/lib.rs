//! Chain Gateway
//!
//! One interface over blockchain RPC operations: transaction verification,
//! balance queries, address validation, fee estimation. Each chain family
//! has its own implementation, selected once at configuration time; the
//! rest of the gateway never branches on chain identity.

pub mod evm;
pub mod mock;
pub mod rpc;
pub mod solana;
pub mod types;
pub mod units;

use async_trait::async_trait;
use dhansetu_common::{ChainConfig, ChainFamily, Error, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use evm::EvmGateway;
pub use mock::MockChain;
pub use solana::SolanaGateway;
pub use types::{FeeEstimate, TokenTransfer, Transfer, TxStatus, TxVerification};

/// Default per-call RPC timeout.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Blockchain RPC operations the core consumes.
#[async_trait]
pub trait ChainGateway: Send + Sync + std::fmt::Debug {
    fn config(&self) -> &ChainConfig;

    /// Observe a transaction's settlement state.
    ///
    /// A reachable node that does not know the hash reports `Pending`;
    /// transport failures are `Error::ExternalService` and retryable.
    async fn transaction(&self, tx_hash: &str) -> Result<TxVerification>;

    /// Native or token balance for an address, in whole units.
    async fn balance(&self, address: &str, token: Option<&str>) -> Result<Decimal>;

    fn validate_address(&self, address: &str) -> bool;

    async fn estimate_fee(
        &self,
        to: &str,
        value: Decimal,
        data: Option<&str>,
    ) -> Result<FeeEstimate>;
}

/// Routes chain keys to their configured gateway.
pub struct ChainRouter {
    gateways: HashMap<String, Arc<dyn ChainGateway>>,
}

impl ChainRouter {
    pub fn new() -> Self {
        Self {
            gateways: HashMap::new(),
        }
    }

    /// Build a router with one live gateway per configured chain.
    pub fn from_configs(configs: Vec<ChainConfig>, timeout: Duration) -> Result<Self> {
        let mut router = Self::new();

        for config in configs {
            let key = config.key.clone();
            let gateway: Arc<dyn ChainGateway> = match config.family {
                ChainFamily::Evm => Arc::new(EvmGateway::new(config, timeout)?),
                ChainFamily::Solana => Arc::new(SolanaGateway::new(config, timeout)?),
            };
            info!("Configured chain gateway: {}", key);
            router.gateways.insert(key, gateway);
        }

        Ok(router)
    }

    /// Build a router of mock chains for every supported chain.
    ///
    /// Returns the mock handles so tests can inject transactions.
    pub fn mock() -> (Self, HashMap<String, Arc<MockChain>>) {
        let mut router = Self::new();
        let mut mocks = HashMap::new();

        for config in dhansetu_common::supported_chains() {
            let key = config.key.clone();
            let mock = Arc::new(MockChain::new(config));
            mocks.insert(key.clone(), Arc::clone(&mock));
            router.gateways.insert(key, mock);
        }

        (router, mocks)
    }

    pub fn insert(&mut self, gateway: Arc<dyn ChainGateway>) {
        self.gateways
            .insert(gateway.config().key.clone(), gateway);
    }

    pub fn for_chain(&self, chain: &str) -> Result<Arc<dyn ChainGateway>> {
        self.gateways
            .get(chain)
            .cloned()
            .ok_or_else(|| Error::UnsupportedChain(chain.to_string()))
    }

    pub fn chain_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.gateways.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for ChainRouter {
    fn default() -> Self {
        Self::new()
    }
}
