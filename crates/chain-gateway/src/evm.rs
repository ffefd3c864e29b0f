//! EVM chain gateway
//!
//! JSON-RPC implementation shared by all Ethereum-style chains. Settlement
//! checks decode the transaction's native value and its ERC-20 `Transfer`
//! logs so the ledger can enforce the amount policy.

use crate::rpc::RpcClient;
use crate::types::{FeeEstimate, TokenTransfer, Transfer, TxStatus, TxVerification};
use crate::units::{base_units_to_decimal, decimal_to_base_units, parse_hex_quantity};
use crate::ChainGateway;
use async_trait::async_trait;
use dhansetu_common::{ChainConfig, Error, Result};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// keccak256("Transfer(address,address,uint256)")
const TRANSFER_TOPIC: &str =
    "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

/// balanceOf(address) selector
const BALANCE_OF_SELECTOR: &str = "0x70a08231";

/// decimals() selector
const DECIMALS_SELECTOR: &str = "0x313ce567";

#[derive(Debug)]
pub struct EvmGateway {
    config: ChainConfig,
    rpc: RpcClient,
}

impl EvmGateway {
    pub fn new(config: ChainConfig, timeout: Duration) -> Result<Self> {
        let rpc = RpcClient::new(&config.rpc_url, timeout)?;
        Ok(Self { config, rpc })
    }

    async fn block_number(&self) -> Result<u64> {
        let raw = self.rpc.call("eth_blockNumber", json!([])).await?;
        let hex = raw
            .as_str()
            .ok_or_else(|| Error::ExternalService("eth_blockNumber returned non-string".into()))?;
        Ok(parse_hex_quantity(hex)? as u64)
    }

    async fn token_decimals(&self, token: &str) -> Result<u32> {
        let result = self
            .rpc
            .call(
                "eth_call",
                json!([{"to": token, "data": DECIMALS_SELECTOR}, "latest"]),
            )
            .await?;

        let hex = result
            .as_str()
            .ok_or_else(|| Error::ExternalService("decimals() returned non-string".into()))?;
        Ok(parse_hex_quantity(hex)? as u32)
    }

    /// Decode ERC-20 Transfer events from a receipt's logs.
    async fn decode_token_credits(&self, receipt: &Value) -> Result<Vec<TokenTransfer>> {
        let mut credits = Vec::new();

        let logs = receipt
            .get("logs")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        for log in logs {
            let topics: Vec<&str> = log
                .get("topics")
                .and_then(Value::as_array)
                .map(|t| t.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();

            // Transfer(from indexed, to indexed, value)
            if topics.len() != 3 || !topics[0].eq_ignore_ascii_case(TRANSFER_TOPIC) {
                continue;
            }

            let Some(token) = log.get("address").and_then(Value::as_str) else {
                continue;
            };
            let Some(data) = log.get("data").and_then(Value::as_str) else {
                continue;
            };

            let to = topic_to_address(topics[2]);
            let raw_amount = parse_hex_quantity(data)?;
            let decimals = self.token_decimals(token).await?;

            credits.push(TokenTransfer {
                token: token.to_string(),
                to,
                amount: base_units_to_decimal(raw_amount, decimals)?,
            });
        }

        Ok(credits)
    }
}

#[async_trait]
impl ChainGateway for EvmGateway {
    fn config(&self) -> &ChainConfig {
        &self.config
    }

    async fn transaction(&self, tx_hash: &str) -> Result<TxVerification> {
        if !is_evm_tx_hash(tx_hash) {
            return Err(Error::Validation(format!(
                "Malformed transaction hash: {tx_hash}"
            )));
        }

        let receipt = self
            .rpc
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;

        if receipt.is_null() {
            // Not mined yet (or unknown to this node): either way, pending.
            debug!("No receipt for {} on {}", tx_hash, self.config.key);
            return Ok(TxVerification::pending());
        }

        let status_hex = receipt
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("0x0");

        if status_hex != "0x1" {
            // Reverted transactions never count as settlement.
            return Ok(TxVerification::failed());
        }

        let receipt_block = receipt
            .get("blockNumber")
            .and_then(Value::as_str)
            .map(parse_hex_quantity)
            .transpose()?
            .unwrap_or(0) as u64;

        let current_block = self.block_number().await?;
        let confirmations = current_block.saturating_sub(receipt_block) + 1;

        let tx = self
            .rpc
            .call("eth_getTransactionByHash", json!([tx_hash]))
            .await?;

        let mut native_credits = Vec::new();
        if let (Some(to), Some(value_hex)) = (
            tx.get("to").and_then(Value::as_str),
            tx.get("value").and_then(Value::as_str),
        ) {
            let value = parse_hex_quantity(value_hex)?;
            if value > 0 {
                native_credits.push(Transfer {
                    to: to.to_string(),
                    amount: base_units_to_decimal(value, self.config.native_decimals)?,
                });
            }
        }

        let token_credits = self.decode_token_credits(&receipt).await?;

        Ok(TxVerification {
            status: TxStatus::Confirmed,
            confirmations,
            native_credits,
            token_credits,
        })
    }

    async fn balance(&self, address: &str, token: Option<&str>) -> Result<Decimal> {
        match token {
            None => {
                let raw = self
                    .rpc
                    .call("eth_getBalance", json!([address, "latest"]))
                    .await?;
                let hex = raw.as_str().ok_or_else(|| {
                    Error::ExternalService("eth_getBalance returned non-string".into())
                })?;
                base_units_to_decimal(parse_hex_quantity(hex)?, self.config.native_decimals)
            }
            Some(token) => {
                let data = format!("{}{:0>64}", BALANCE_OF_SELECTOR, address.trim_start_matches("0x"));
                let raw = self
                    .rpc
                    .call("eth_call", json!([{"to": token, "data": data}, "latest"]))
                    .await?;
                let hex = raw.as_str().ok_or_else(|| {
                    Error::ExternalService("balanceOf returned non-string".into())
                })?;
                let decimals = self.token_decimals(token).await?;
                base_units_to_decimal(parse_hex_quantity(hex)?, decimals)
            }
        }
    }

    fn validate_address(&self, address: &str) -> bool {
        is_evm_address(address)
    }

    async fn estimate_fee(
        &self,
        to: &str,
        value: Decimal,
        data: Option<&str>,
    ) -> Result<FeeEstimate> {
        let gas_price_raw = self.rpc.call("eth_gasPrice", json!([])).await?;
        let gas_price_hex = gas_price_raw
            .as_str()
            .ok_or_else(|| Error::ExternalService("eth_gasPrice returned non-string".into()))?;
        let gas_price_wei = parse_hex_quantity(gas_price_hex)?;

        let value_base: u128 = decimal_to_base_units(value, self.config.native_decimals)?
            .parse()
            .map_err(|_| Error::Validation(format!("Value out of range: {value}")))?;

        let mut call = json!({
            "to": to,
            "value": format!("0x{:x}", value_base),
        });
        if let Some(data) = data {
            call["data"] = json!(data);
        }

        let gas_raw = self.rpc.call("eth_estimateGas", json!([call])).await?;
        let gas_hex = gas_raw
            .as_str()
            .ok_or_else(|| Error::ExternalService("eth_estimateGas returned non-string".into()))?;
        let gas_limit = parse_hex_quantity(gas_hex)? as u64;

        let total_wei = gas_price_wei.saturating_mul(gas_limit as u128);

        Ok(FeeEstimate {
            gas_limit: Some(gas_limit),
            gas_price_gwei: Some(base_units_to_decimal(gas_price_wei, 9)?),
            total_native: base_units_to_decimal(total_wei, self.config.native_decimals)?,
        })
    }
}

/// Extract the 20-byte address from a 32-byte indexed log topic.
fn topic_to_address(topic: &str) -> String {
    let digits = topic.trim_start_matches("0x");
    if digits.len() >= 40 {
        format!("0x{}", &digits[digits.len() - 40..])
    } else {
        topic.to_string()
    }
}

pub(crate) fn is_evm_address(address: &str) -> bool {
    address.len() == 42
        && address.starts_with("0x")
        && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}

pub(crate) fn is_evm_tx_hash(hash: &str) -> bool {
    hash.len() == 66
        && hash.starts_with("0x")
        && hash[2..].chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_evm_address() {
        assert!(is_evm_address("0x742d35Cc6634C0532925a3b8D4C9db96590c6C87"));
        assert!(!is_evm_address("742d35Cc6634C0532925a3b8D4C9db96590c6C87"));
        assert!(!is_evm_address("0x742d35"));
        assert!(!is_evm_address(
            "0xZZZd35Cc6634C0532925a3b8D4C9db96590c6C87"
        ));
    }

    #[test]
    fn test_is_evm_tx_hash() {
        assert!(is_evm_tx_hash(
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef"
        ));
        assert!(!is_evm_tx_hash("0x1234"));
        assert!(!is_evm_tx_hash("nothash"));
    }

    #[test]
    fn test_topic_to_address() {
        let topic = "0x000000000000000000000000742d35cc6634c0532925a3b8d4c9db96590c6c87";
        assert_eq!(
            topic_to_address(topic),
            "0x742d35cc6634c0532925a3b8d4c9db96590c6c87"
        );
    }
}
