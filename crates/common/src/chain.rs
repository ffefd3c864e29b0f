//! Supported chain registry
//!
//! Static configuration for the chains the gateway can accept payments on.
//! EVM chains share native-value and ERC-20 semantics; Solana is the one
//! account-model chain with a different native unit scale.

use serde::{Deserialize, Serialize};

/// Chain family, selected once per chain at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainFamily {
    /// Ethereum-style chains: native value transfers plus ERC-20 tokens.
    Evm,
    /// Account-model chains with lamport-scale native units.
    Solana,
}

/// Configuration for one supported chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Lowercase chain key used in requests ("ethereum", "polygon", ...)
    pub key: String,

    /// Display name
    pub name: String,

    pub family: ChainFamily,

    /// EIP-155 chain id for EVM chains
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,

    /// Native currency symbol ("ETH", "MATIC", "SOL", ...)
    pub native_symbol: String,

    /// Native currency decimals (18 for EVM, 9 for Solana)
    pub native_decimals: u32,

    /// JSON-RPC endpoint
    pub rpc_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_explorer: Option<String>,
}

impl ChainConfig {
    fn evm(
        key: &str,
        name: &str,
        chain_id: u64,
        native_symbol: &str,
        rpc_url: &str,
        block_explorer: &str,
    ) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            family: ChainFamily::Evm,
            chain_id: Some(chain_id),
            native_symbol: native_symbol.to_string(),
            native_decimals: 18,
            rpc_url: rpc_url.to_string(),
            block_explorer: Some(block_explorer.to_string()),
        }
    }
}

/// Default chain registry.
///
/// RPC URLs are overridable per chain via `RPC_URL_<KEY>` at startup; the
/// defaults here are public endpoints suitable for development.
pub fn supported_chains() -> Vec<ChainConfig> {
    vec![
        ChainConfig::evm(
            "ethereum",
            "Ethereum",
            1,
            "ETH",
            "https://eth.llamarpc.com",
            "https://etherscan.io",
        ),
        ChainConfig::evm(
            "polygon",
            "Polygon",
            137,
            "MATIC",
            "https://polygon-rpc.com",
            "https://polygonscan.com",
        ),
        ChainConfig::evm(
            "bsc",
            "BNB Smart Chain",
            56,
            "BNB",
            "https://bsc-dataseed.binance.org",
            "https://bscscan.com",
        ),
        ChainConfig::evm(
            "arbitrum",
            "Arbitrum",
            42161,
            "ETH",
            "https://arb1.arbitrum.io/rpc",
            "https://arbiscan.io",
        ),
        ChainConfig::evm(
            "optimism",
            "Optimism",
            10,
            "ETH",
            "https://mainnet.optimism.io",
            "https://optimistic.etherscan.io",
        ),
        ChainConfig {
            key: "solana".to_string(),
            name: "Solana".to_string(),
            family: ChainFamily::Solana,
            chain_id: None,
            native_symbol: "SOL".to_string(),
            native_decimals: 9,
            rpc_url: "https://api.mainnet-beta.solana.com".to_string(),
            block_explorer: Some("https://explorer.solana.com".to_string()),
        },
    ]
}

/// Look up a chain by key in the default registry.
pub fn chain_config(key: &str) -> Option<ChainConfig> {
    supported_chains().into_iter().find(|c| c.key == key)
}
