//! Verification results returned by chain gateways

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// On-chain transaction state as seen by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStatus {
    /// Not yet included, or unknown to the node
    Pending,
    /// Included with a successful execution result
    Confirmed,
    /// Included but reverted / errored
    Failed,
}

/// A native-currency credit observed in a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    pub to: String,
    /// Amount in whole native units (ETH, SOL, ...), not base units
    pub amount: Decimal,
}

/// A token transfer decoded from a transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenTransfer {
    /// Token contract / mint address
    pub token: String,
    pub to: String,
    /// Amount in whole token units, scaled by the token's decimals
    pub amount: Decimal,
}

/// Everything the Payment Ledger needs to judge settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxVerification {
    pub status: TxStatus,
    pub confirmations: u64,
    /// Native-currency credits by recipient
    pub native_credits: Vec<Transfer>,
    /// Token transfers by recipient
    pub token_credits: Vec<TokenTransfer>,
}

impl TxVerification {
    pub fn pending() -> Self {
        Self {
            status: TxStatus::Pending,
            confirmations: 0,
            native_credits: Vec::new(),
            token_credits: Vec::new(),
        }
    }

    pub fn failed() -> Self {
        Self {
            status: TxStatus::Failed,
            confirmations: 0,
            native_credits: Vec::new(),
            token_credits: Vec::new(),
        }
    }

    /// Total amount credited to `recipient`, in native currency when
    /// `token` is `None`, otherwise in the given token.
    ///
    /// Hex addresses compare case-insensitively; base58 addresses exactly.
    pub fn credited_amount(&self, recipient: &str, token: Option<&str>) -> Decimal {
        match token {
            None => self
                .native_credits
                .iter()
                .filter(|t| address_eq(&t.to, recipient))
                .map(|t| t.amount)
                .sum(),
            Some(token) => self
                .token_credits
                .iter()
                .filter(|t| address_eq(&t.token, token) && address_eq(&t.to, recipient))
                .map(|t| t.amount)
                .sum(),
        }
    }
}

fn address_eq(a: &str, b: &str) -> bool {
    if a.starts_with("0x") && b.starts_with("0x") {
        a.eq_ignore_ascii_case(b)
    } else {
        a == b
    }
}

/// Fee estimate for a prospective transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeEstimate {
    /// Estimated gas limit (EVM only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,

    /// Gas price in gwei (EVM only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gas_price_gwei: Option<Decimal>,

    /// Total estimated fee in whole native units
    pub total_native: Decimal,
}
