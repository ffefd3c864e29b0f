//! Chain-appropriate payment URI generation
//!
//! EIP-681 for EVM chains (native value or an ERC-20 `transfer` request),
//! Solana Pay for Solana. The URI doubles as the QR payload.

use chain_gateway::units::decimal_to_base_units;
use dhansetu_common::{ChainConfig, ChainFamily, Error, Result};
use rust_decimal::Decimal;

/// Default decimals assumed for ERC-20 tokens when the merchant does not
/// supply them.
const DEFAULT_TOKEN_DECIMALS: u32 = 18;

pub fn build_payment_uri(
    chain: &ChainConfig,
    receiving_address: &str,
    amount: Decimal,
    token_address: Option<&str>,
    token_decimals: Option<u32>,
) -> Result<String> {
    match chain.family {
        ChainFamily::Evm => {
            let chain_id = chain
                .chain_id
                .ok_or_else(|| Error::UnsupportedChain(chain.key.clone()))?;

            match token_address {
                None => {
                    let wei = decimal_to_base_units(amount, chain.native_decimals)?;
                    Ok(format!(
                        "ethereum:{receiving_address}@{chain_id}?value={wei}"
                    ))
                }
                Some(token) => {
                    let units = decimal_to_base_units(
                        amount,
                        token_decimals.unwrap_or(DEFAULT_TOKEN_DECIMALS),
                    )?;
                    Ok(format!(
                        "ethereum:{token}@{chain_id}/transfer?address={receiving_address}&uint256={units}"
                    ))
                }
            }
        }
        ChainFamily::Solana => {
            let mut uri = format!("solana:{receiving_address}?amount={amount}");
            if let Some(mint) = token_address {
                uri.push_str(&format!("&spl-token={mint}"));
            }
            uri.push_str("&label=Payment&message=DhanSetu%20Payment");
            Ok(uri)
        }
    }
}
