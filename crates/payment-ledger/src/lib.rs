//! Payment Ledger
//!
//! Standalone payment requests: creation with chain-appropriate payment
//! URIs, on-chain settlement validation through the chain gateway, expiry
//! handling, and merchant webhooks.

pub mod models;
pub mod service;
pub mod storage;
pub mod uri;

pub use models::{
    FeeBreakdown, NewPayment, Payment, PaymentFilter, PaymentStats, PaymentStatus,
};
pub use service::{LedgerConfig, PaymentLedger};
pub use storage::{LedgerStore, MemoryLedgerStore, RedisLedgerStore};
