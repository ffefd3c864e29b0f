//! Mock chain gateway for development and testing
//!
//! Simulates a chain without any RPC connection: tests inject the
//! transactions and balances they want observed.

use crate::types::{FeeEstimate, TokenTransfer, Transfer, TxStatus, TxVerification};
use crate::ChainGateway;
use async_trait::async_trait;
use dhansetu_common::{ChainConfig, ChainFamily, Error, Result};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug)]
pub struct MockChain {
    config: ChainConfig,
    transactions: Mutex<HashMap<String, TxVerification>>,
    balances: Mutex<HashMap<String, Decimal>>,
    /// When set, every RPC-backed call fails as if the endpoint were down.
    offline: Mutex<bool>,
}

impl MockChain {
    pub fn new(config: ChainConfig) -> Self {
        Self {
            config,
            transactions: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
            offline: Mutex::new(false),
        }
    }

    /// Inject a transaction observation for `tx_hash`.
    pub fn set_transaction(&self, tx_hash: &str, verification: TxVerification) {
        self.transactions
            .lock()
            .unwrap()
            .insert(tx_hash.to_string(), verification);
    }

    /// Inject a confirmed native transfer to `to`.
    pub fn confirm_native(&self, tx_hash: &str, to: &str, amount: Decimal) {
        self.set_transaction(
            tx_hash,
            TxVerification {
                status: TxStatus::Confirmed,
                confirmations: 12,
                native_credits: vec![Transfer {
                    to: to.to_string(),
                    amount,
                }],
                token_credits: vec![],
            },
        );
    }

    /// Inject a confirmed token transfer to `to`.
    pub fn confirm_token(&self, tx_hash: &str, token: &str, to: &str, amount: Decimal) {
        self.set_transaction(
            tx_hash,
            TxVerification {
                status: TxStatus::Confirmed,
                confirmations: 12,
                native_credits: vec![],
                token_credits: vec![TokenTransfer {
                    token: token.to_string(),
                    to: to.to_string(),
                    amount,
                }],
            },
        );
    }

    pub fn set_balance(&self, address: &str, amount: Decimal) {
        self.balances
            .lock()
            .unwrap()
            .insert(address.to_string(), amount);
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock().unwrap() = offline;
    }

    fn check_online(&self) -> Result<()> {
        if *self.offline.lock().unwrap() {
            return Err(Error::ExternalService(format!(
                "Mock RPC for {} is offline",
                self.config.key
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainGateway for MockChain {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn transaction(&self, tx_hash: &str) -> Result<TxVerification> {
        self.check_online()?;

        let known = self.transactions.lock().unwrap().get(tx_hash).cloned();
        debug!(
            "Mock chain {}: transaction({}) -> known={}",
            self.config.key,
            tx_hash,
            known.is_some()
        );

        // Unknown hashes are pending, matching a live node's view.
        Ok(known.unwrap_or_else(TxVerification::pending))
    }

    async fn balance(&self, address: &str, _token: Option<&str>) -> Result<Decimal> {
        self.check_online()?;
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    fn validate_address(&self, address: &str) -> bool {
        match self.config.family {
            ChainFamily::Evm => crate::evm::is_evm_address(address),
            ChainFamily::Solana => crate::solana::is_solana_address(address),
        }
    }

    async fn estimate_fee(
        &self,
        _to: &str,
        _value: Decimal,
        _data: Option<&str>,
    ) -> Result<FeeEstimate> {
        self.check_online()?;
        Ok(FeeEstimate {
            gas_limit: Some(21_000),
            gas_price_gwei: Some(Decimal::from(20)),
            total_native: Decimal::new(42, 5),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dhansetu_common::chain_config;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_unknown_transaction_is_pending() {
        let chain = MockChain::new(chain_config("ethereum").unwrap());
        let verification = chain.transaction("0xunknown").await.unwrap();
        assert_eq!(verification.status, TxStatus::Pending);
    }

    #[tokio::test]
    async fn test_injected_transaction_is_observed() {
        let chain = MockChain::new(chain_config("ethereum").unwrap());
        chain.confirm_native("0xabc", "0xrecv", dec("1.5"));

        let verification = chain.transaction("0xabc").await.unwrap();
        assert_eq!(verification.status, TxStatus::Confirmed);
        assert_eq!(verification.credited_amount("0xrecv", None), dec("1.5"));
    }

    #[tokio::test]
    async fn test_offline_mode_fails_retryably() {
        let chain = MockChain::new(chain_config("polygon").unwrap());
        chain.set_offline(true);

        let err = chain.transaction("0xabc").await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_address_validation_per_family() {
        let evm = MockChain::new(chain_config("ethereum").unwrap());
        assert!(evm.validate_address("0x742d35Cc6634C0532925a3b8D4C9db96590c6C87"));
        assert!(!evm.validate_address("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM"));

        let sol = MockChain::new(chain_config("solana").unwrap());
        assert!(sol.validate_address("9WzDXwBbmkg8ZTbNMqUxvQRAyrZzDsGYdLVL9zYtAWWM"));
        assert!(!sol.validate_address("0x742d35Cc6634C0532925a3b8D4C9db96590c6C87"));
    }
}
