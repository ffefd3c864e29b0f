//! Solana chain gateway
//!
//! Account-model implementation. Settlement credits are derived from the
//! lamport balance deltas and token-balance deltas recorded in transaction
//! metadata.

use crate::rpc::RpcClient;
use crate::types::{FeeEstimate, TokenTransfer, Transfer, TxStatus, TxVerification};
use crate::units::base_units_to_decimal;
use crate::ChainGateway;
use async_trait::async_trait;
use dhansetu_common::{ChainConfig, Error, Result};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::time::Duration;

/// Flat base fee per signature, in lamports.
const BASE_FEE_LAMPORTS: u128 = 5_000;

const BASE58_ALPHABET: &str =
    "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

#[derive(Debug)]
pub struct SolanaGateway {
    config: ChainConfig,
    rpc: RpcClient,
}

impl SolanaGateway {
    pub fn new(config: ChainConfig, timeout: Duration) -> Result<Self> {
        let rpc = RpcClient::new(&config.rpc_url, timeout)?;
        Ok(Self { config, rpc })
    }

    /// Native credits: positive lamport deltas per account in the message.
    fn native_credits(&self, tx: &Value) -> Result<Vec<Transfer>> {
        let meta = &tx["meta"];
        let pre = meta["preBalances"].as_array().cloned().unwrap_or_default();
        let post = meta["postBalances"].as_array().cloned().unwrap_or_default();
        let keys = tx["transaction"]["message"]["accountKeys"]
            .as_array()
            .cloned()
            .unwrap_or_default();

        let mut credits = Vec::new();
        for (i, key) in keys.iter().enumerate() {
            let (Some(pre), Some(post)) = (
                pre.get(i).and_then(Value::as_u64),
                post.get(i).and_then(Value::as_u64),
            ) else {
                continue;
            };

            if post > pre {
                let Some(address) = key.as_str() else { continue };
                credits.push(Transfer {
                    to: address.to_string(),
                    amount: base_units_to_decimal(
                        (post - pre) as u128,
                        self.config.native_decimals,
                    )?,
                });
            }
        }

        Ok(credits)
    }

    /// Token credits: positive ui-amount deltas between pre/post token balances.
    fn token_credits(&self, tx: &Value) -> Vec<TokenTransfer> {
        let meta = &tx["meta"];
        let pre = meta["preTokenBalances"].as_array().cloned().unwrap_or_default();
        let post = meta["postTokenBalances"].as_array().cloned().unwrap_or_default();

        let mut credits = Vec::new();
        for entry in &post {
            let index = entry["accountIndex"].as_u64();
            let mint = entry["mint"].as_str();
            let owner = entry["owner"].as_str();
            let post_amount = token_ui_amount(entry);

            let pre_amount = pre
                .iter()
                .find(|p| p["accountIndex"].as_u64() == index && p["mint"].as_str() == mint)
                .map(token_ui_amount)
                .unwrap_or(Decimal::ZERO);

            if let (Some(mint), Some(owner)) = (mint, owner) {
                if post_amount > pre_amount {
                    credits.push(TokenTransfer {
                        token: mint.to_string(),
                        to: owner.to_string(),
                        amount: post_amount - pre_amount,
                    });
                }
            }
        }

        credits
    }
}

fn token_ui_amount(entry: &Value) -> Decimal {
    entry["uiTokenAmount"]["uiAmountString"]
        .as_str()
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

#[async_trait]
impl ChainGateway for SolanaGateway {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn transaction(&self, tx_hash: &str) -> Result<TxVerification> {
        if !is_solana_signature(tx_hash) {
            return Err(Error::Validation(format!(
                "Malformed transaction signature: {tx_hash}"
            )));
        }

        let statuses = self
            .rpc
            .call(
                "getSignatureStatuses",
                json!([[tx_hash], {"searchTransactionHistory": true}]),
            )
            .await?;

        let status = &statuses["value"][0];
        if status.is_null() {
            return Ok(TxVerification::pending());
        }

        if !status["err"].is_null() {
            return Ok(TxVerification::failed());
        }

        let confirmation_status = status["confirmationStatus"].as_str().unwrap_or("processed");
        if confirmation_status == "processed" {
            return Ok(TxVerification::pending());
        }

        // `confirmations` is null once the transaction is finalized.
        let confirmations = status["confirmations"].as_u64().unwrap_or(64);

        let tx = self
            .rpc
            .call(
                "getTransaction",
                json!([tx_hash, {"encoding": "json", "maxSupportedTransactionVersion": 0}]),
            )
            .await?;

        if tx.is_null() {
            return Ok(TxVerification::pending());
        }

        Ok(TxVerification {
            status: TxStatus::Confirmed,
            confirmations,
            native_credits: self.native_credits(&tx)?,
            token_credits: self.token_credits(&tx),
        })
    }

    async fn balance(&self, address: &str, token: Option<&str>) -> Result<Decimal> {
        match token {
            None => {
                let result = self.rpc.call("getBalance", json!([address])).await?;
                let lamports = result["value"].as_u64().ok_or_else(|| {
                    Error::ExternalService("getBalance returned no value".into())
                })?;
                base_units_to_decimal(lamports as u128, self.config.native_decimals)
            }
            Some(mint) => {
                let result = self
                    .rpc
                    .call(
                        "getTokenAccountsByOwner",
                        json!([address, {"mint": mint}, {"encoding": "jsonParsed"}]),
                    )
                    .await?;

                let accounts = result["value"].as_array().cloned().unwrap_or_default();
                let mut total = Decimal::ZERO;
                for account in &accounts {
                    total += token_ui_amount(&account["account"]["data"]["parsed"]["info"]);
                }
                Ok(total)
            }
        }
    }

    fn validate_address(&self, address: &str) -> bool {
        is_solana_address(address)
    }

    async fn estimate_fee(
        &self,
        _to: &str,
        _value: Decimal,
        _data: Option<&str>,
    ) -> Result<FeeEstimate> {
        Ok(FeeEstimate {
            gas_limit: None,
            gas_price_gwei: None,
            total_native: base_units_to_decimal(BASE_FEE_LAMPORTS, self.config.native_decimals)?,
        })
    }
}

/// Base58 format check for a 32-byte public key.
pub(crate) fn is_solana_address(address: &str) -> bool {
    (32..=44).contains(&address.len())
        && address.chars().all(|c| BASE58_ALPHABET.contains(c))
}

/// Base58 format check for a 64-byte signature.
pub(crate) fn is_solana_signature(signature: &str) -> bool {
    (64..=90).contains(&signature.len())
        && signature.chars().all(|c| BASE58_ALPHABET.contains(c))
}
