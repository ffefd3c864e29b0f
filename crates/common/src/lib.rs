//! Shared types for the DhanSetu payment gateway
//!
//! Error taxonomy, the supported-chain registry, prefixed id generation,
//! and HMAC signing used by webhook delivery and verification.

pub mod chain;
pub mod error;
pub mod ids;
pub mod signature;

pub use chain::{chain_config, supported_chains, ChainConfig, ChainFamily};
pub use error::{Error, Result};
