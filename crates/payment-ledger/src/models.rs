//! Payment data model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Payment lifecycle state. Transitions out of `Pending` are one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Confirmed,
    Expired,
    Failed,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PaymentStatus::Pending)
    }
}

/// Gateway fee taken out of a payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub gateway_fee: Decimal,
    pub net_amount: Decimal,
}

/// A standalone on-chain payment request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,

    pub merchant_id: String,

    pub amount: Decimal,

    pub currency: String,

    /// Token contract / mint address; None means native currency
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_address: Option<String>,

    pub chain: String,

    pub status: PaymentStatus,

    /// Address the customer pays into
    pub receiving_address: String,

    /// Hosted payment page URL
    pub payment_url: String,

    /// Chain-appropriate payment URI, rendered as a QR code by the frontend
    pub qr_data: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmed_at: Option<DateTime<Utc>>,

    pub webhook_sent: bool,

    pub webhook_attempts: u32,

    pub fees: FeeBreakdown,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Payment {
    /// A pending payment past its expiry must be observed as expired on
    /// the next read, even before any sweep has run.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.status == PaymentStatus::Pending && self.expires_at <= now
    }
}

/// Request to create a payment.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPayment {
    pub merchant_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub chain: String,
    #[serde(default)]
    pub token_address: Option<String>,
    /// Token decimals for URI generation; defaults to 18 for EVM tokens
    #[serde(default)]
    pub token_decimals: Option<u32>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

/// Listing filter. Empty filter matches everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentFilter {
    #[serde(default)]
    pub status: Option<PaymentStatus>,
    #[serde(default)]
    pub chain: Option<String>,
    #[serde(default)]
    pub merchant_id: Option<String>,
}

impl PaymentFilter {
    pub fn matches(&self, payment: &Payment) -> bool {
        self.status.map_or(true, |s| payment.status == s)
            && self.chain.as_deref().map_or(true, |c| payment.chain == c)
            && self
                .merchant_id
                .as_deref()
                .map_or(true, |m| payment.merchant_id == m)
    }
}

/// Aggregate counters for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentStats {
    pub total_payments: usize,
    pub confirmed_payments: usize,
    pub pending_payments: usize,
    pub failed_payments: usize,
    pub expired_payments: usize,
    /// Sum of confirmed amounts
    pub total_amount: Decimal,
}
