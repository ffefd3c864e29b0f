//! Subscription billing data model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Billing cadence of a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Daily,
    Weekly,
    Monthly,
    Quarterly,
    Yearly,
}

/// A merchant-defined recurring billing plan.
///
/// Financial terms (amount, currency, chain, interval, trial, cycles,
/// setup fee) are immutable after creation; subscribers signed up for
/// them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    pub merchant_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub chain: String,
    pub interval: BillingInterval,
    /// Multiplier on the interval, e.g. every 2 weeks
    pub interval_count: u32,
    /// Free trial length in days; 0 means none
    pub trial_days: u32,
    /// Total cycles before the subscription completes; None = unbounded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_billing_cycles: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub setup_fee: Option<Decimal>,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to create a plan.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPlan {
    pub merchant_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub chain: String,
    pub interval: BillingInterval,
    #[serde(default = "default_interval_count")]
    pub interval_count: u32,
    #[serde(default)]
    pub trial_days: u32,
    #[serde(default)]
    pub max_billing_cycles: Option<u32>,
    #[serde(default)]
    pub setup_fee: Option<Decimal>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

fn default_interval_count() -> u32 {
    1
}

/// Mutable plan fields. Financial terms are deliberately absent.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlanChanges {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Unpaid,
    Paused,
    Canceled,
}

impl SubscriptionStatus {
    /// Canceled subscriptions never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Canceled)
    }

    /// Statuses the billing sweep considers chargeable. PastDue is
    /// included so scheduled retries happen.
    pub fn is_billable(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active
                | SubscriptionStatus::Trialing
                | SubscriptionStatus::PastDue
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: String,
    pub customer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_email: Option<String>,
    pub plan_id: String,
    /// Customer wallet expected to pay the charges
    pub wallet_address: String,
    pub status: SubscriptionStatus,
    pub current_period_start: DateTime<Utc>,
    pub current_period_end: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_start: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_end: Option<DateTime<Utc>>,
    /// Cancellation requested for the period boundary
    pub cancel_at_period_end: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canceled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Completed billing cycles; monotone, capped by the plan's maximum
    pub billing_cycle_count: u32,
    pub total_paid: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_payment_date: Option<DateTime<Utc>>,
    pub next_billing_date: DateTime<Utc>,
    /// Consecutive failed charge attempts since the last settlement
    pub failed_payment_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request to subscribe a customer to a plan.
#[derive(Debug, Clone, Deserialize)]
pub struct NewSubscription {
    pub customer_id: String,
    #[serde(default)]
    pub customer_email: Option<String>,
    pub plan_id: String,
    pub wallet_address: String,
    /// Overrides the plan's trial_days when set
    #[serde(default)]
    pub trial_days_override: Option<u32>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionPaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

/// One charge in a subscription's billing history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionPayment {
    pub id: String,
    pub subscription_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub chain: String,
    pub status: SubscriptionPaymentStatus,
    pub scheduled_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// 1 for the first try of a cycle, grows with retries
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Ledger payment backing this charge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Aggregate counters for the dashboard.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionStats {
    pub total_subscriptions: usize,
    pub active: usize,
    pub trialing: usize,
    pub past_due: usize,
    pub unpaid: usize,
    pub paused: usize,
    pub canceled: usize,
    /// Monthly recurring revenue from active monthly plans
    pub mrr: Decimal,
    pub arr: Decimal,
}

/// What a billing sweep did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    /// Subscriptions that were due
    pub due: usize,
    /// Charge requests successfully created
    pub charged: usize,
    /// Charge attempts that failed
    pub failures: usize,
    /// Cancel-at-period-end intents finalized
    pub finalized_cancellations: usize,
    /// Subscriptions completed by reaching their cycle cap
    pub completed: usize,
    /// Subscriptions skipped because processing errored internally
    pub errors: usize,
}
