//! Subscription Engine
//!
//! Plan management, subscription lifecycle, and the billing sweep state
//! machine. Charges are delegated to the Payment Ledger through the
//! `PaymentPort` seam; on-chain settlement flows back in through
//! `record_settlement`.

use crate::interval::advance;
use crate::models::{
    BillingInterval, NewPlan, NewSubscription, Plan, PlanChanges, Subscription,
    SubscriptionPayment, SubscriptionPaymentStatus, SubscriptionStats, SubscriptionStatus,
    SweepReport,
};
use crate::storage::BillingStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dhansetu_common::{chain_config, ids, Error, Result};
use payment_ledger::{NewPayment, PaymentLedger};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use webhook_dispatcher::{EventType, Notifier, WebhookPayload};

/// Charge request handed to the payment side.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub merchant_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub chain: String,
    pub description: String,
    pub customer_email: Option<String>,
    /// Billing record the resulting payment settles
    pub subscription_payment_id: String,
}

/// Seam between the engine and whatever creates payments.
///
/// Returns the ledger payment id backing the charge.
#[async_trait]
pub trait PaymentPort: Send + Sync {
    async fn create_charge(&self, charge: ChargeRequest) -> Result<String>;
}

#[async_trait]
impl PaymentPort for PaymentLedger {
    async fn create_charge(&self, charge: ChargeRequest) -> Result<String> {
        let payment = self
            .create_payment(NewPayment {
                merchant_id: charge.merchant_id,
                amount: charge.amount,
                currency: charge.currency,
                chain: charge.chain,
                token_address: None,
                token_decimals: None,
                description: Some(charge.description),
                customer_email: charge.customer_email,
                expires_at: None,
                metadata: Some(json!({
                    "subscription_payment_id": charge.subscription_payment_id,
                })),
            })
            .await?;
        Ok(payment.id)
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Merchant webhook endpoint; None disables delivery
    pub webhook_url: Option<String>,
    pub livemode: bool,
    /// Delay before retrying a failed charge
    pub retry_delay: Duration,
    /// Consecutive failures before a subscription goes Unpaid
    pub max_failed_attempts: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            livemode: false,
            retry_delay: Duration::days(3),
            max_failed_attempts: 3,
        }
    }
}

enum BillingOutcome {
    Charged,
    /// Charged and reached the plan's cycle cap
    Completed,
    Failed,
}

pub struct SubscriptionEngine {
    store: Arc<dyn BillingStore>,
    payments: Arc<dyn PaymentPort>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

impl SubscriptionEngine {
    pub fn new(
        store: Arc<dyn BillingStore>,
        payments: Arc<dyn PaymentPort>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            payments,
            notifier,
            config,
        }
    }

    // ----- Plans -----

    pub async fn create_plan(&self, spec: NewPlan) -> Result<Plan> {
        if spec.amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "Plan amount must be positive, got {}",
                spec.amount
            )));
        }
        if spec.interval_count < 1 {
            return Err(Error::Validation(
                "interval_count must be at least 1".to_string(),
            ));
        }
        if spec.max_billing_cycles == Some(0) {
            return Err(Error::Validation(
                "max_billing_cycles must be at least 1 when set".to_string(),
            ));
        }
        if spec.setup_fee.is_some_and(|fee| fee < Decimal::ZERO) {
            return Err(Error::Validation(
                "setup_fee must not be negative".to_string(),
            ));
        }
        if chain_config(&spec.chain).is_none() {
            return Err(Error::UnsupportedChain(spec.chain));
        }

        let now = Utc::now();
        let plan = Plan {
            id: ids::new_plan_id(),
            merchant_id: spec.merchant_id,
            name: spec.name,
            description: spec.description,
            amount: spec.amount,
            currency: spec.currency,
            chain: spec.chain,
            interval: spec.interval,
            interval_count: spec.interval_count,
            trial_days: spec.trial_days,
            max_billing_cycles: spec.max_billing_cycles,
            setup_fee: spec.setup_fee,
            active: true,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
        };

        self.store.insert_plan(&plan).await?;
        info!("Created plan {} ({})", plan.id, plan.name);
        Ok(plan)
    }

    /// Apply non-financial changes; amount, interval, and the other terms
    /// subscribers signed up for never change.
    pub async fn update_plan(&self, id: &str, changes: PlanChanges) -> Result<Plan> {
        let mut plan = self.require_plan(id).await?;

        if let Some(name) = changes.name {
            plan.name = name;
        }
        if let Some(description) = changes.description {
            plan.description = Some(description);
        }
        if let Some(active) = changes.active {
            plan.active = active;
        }
        if let Some(metadata) = changes.metadata {
            plan.metadata = Some(metadata);
        }
        plan.updated_at = Utc::now();

        self.store.update_plan(&plan).await?;
        Ok(plan)
    }

    pub async fn get_plan(&self, id: &str) -> Result<Plan> {
        self.require_plan(id).await
    }

    pub async fn list_plans(&self) -> Result<Vec<Plan>> {
        self.store.all_plans().await
    }

    pub async fn delete_plan(&self, id: &str) -> Result<()> {
        self.require_plan(id).await?;

        let has_live_subscribers = self
            .store
            .all_subscriptions()
            .await?
            .iter()
            .any(|s| s.plan_id == id && !s.status.is_terminal());

        if has_live_subscribers {
            return Err(Error::Conflict(format!(
                "Plan {id} has active subscriptions"
            )));
        }

        self.store.remove_plan(id).await?;
        info!("Deleted plan {}", id);
        Ok(())
    }

    // ----- Subscriptions -----

    pub async fn subscribe(&self, request: NewSubscription) -> Result<Subscription> {
        let plan = self.require_plan(&request.plan_id).await?;
        if !plan.active {
            return Err(Error::NotFound(format!(
                "Plan not available: {}",
                request.plan_id
            )));
        }
        if request.wallet_address.trim().is_empty() {
            return Err(Error::Validation("wallet_address is required".to_string()));
        }

        let duplicate = self.store.all_subscriptions().await?.into_iter().any(|s| {
            s.customer_id == request.customer_id
                && s.plan_id == request.plan_id
                && !s.status.is_terminal()
        });
        if duplicate {
            return Err(Error::Conflict(format!(
                "Customer {} already subscribed to plan {}",
                request.customer_id, request.plan_id
            )));
        }

        let now = Utc::now();
        let trial_days = request.trial_days_override.unwrap_or(plan.trial_days);

        let subscription = if trial_days > 0 {
            let trial_end = now + Duration::days(i64::from(trial_days));
            Subscription {
                id: ids::new_subscription_id(),
                customer_id: request.customer_id,
                customer_email: request.customer_email,
                plan_id: plan.id.clone(),
                wallet_address: request.wallet_address,
                status: SubscriptionStatus::Trialing,
                current_period_start: now,
                current_period_end: trial_end,
                trial_start: Some(now),
                trial_end: Some(trial_end),
                cancel_at_period_end: false,
                canceled_at: None,
                ended_at: None,
                billing_cycle_count: 0,
                total_paid: Decimal::ZERO,
                last_payment_date: None,
                next_billing_date: trial_end,
                failed_payment_attempts: 0,
                metadata: request.metadata,
                created_at: now,
                updated_at: now,
            }
        } else {
            let period_end = advance(now, plan.interval, plan.interval_count);
            Subscription {
                id: ids::new_subscription_id(),
                customer_id: request.customer_id,
                customer_email: request.customer_email,
                plan_id: plan.id.clone(),
                wallet_address: request.wallet_address,
                status: SubscriptionStatus::Active,
                current_period_start: now,
                current_period_end: period_end,
                trial_start: None,
                trial_end: None,
                cancel_at_period_end: false,
                canceled_at: None,
                ended_at: None,
                billing_cycle_count: 0,
                total_paid: Decimal::ZERO,
                last_payment_date: None,
                next_billing_date: period_end,
                failed_payment_attempts: 0,
                metadata: request.metadata,
                created_at: now,
                updated_at: now,
            }
        };

        self.store.insert_subscription(&subscription).await?;
        info!(
            "Created subscription {} to plan {} ({:?})",
            subscription.id, plan.id, subscription.status
        );

        if let Some(fee) = plan.setup_fee.filter(|f| *f > Decimal::ZERO) {
            self.charge_setup_fee(&subscription, &plan, fee, now).await?;
        }

        self.emit(
            EventType::SubscriptionCreated,
            &subscription.id,
            json!({ "subscription": &subscription }),
        );

        Ok(subscription)
    }

    /// One-off setup charge outside the recurring cycle. A failed charge
    /// request is recorded but does not abort the subscription.
    async fn charge_setup_fee(
        &self,
        subscription: &Subscription,
        plan: &Plan,
        fee: Decimal,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut payment = SubscriptionPayment {
            id: ids::new_subscription_payment_id(),
            subscription_id: subscription.id.clone(),
            amount: fee,
            currency: plan.currency.clone(),
            chain: plan.chain.clone(),
            status: SubscriptionPaymentStatus::Pending,
            scheduled_at: now,
            paid_at: None,
            transaction_hash: None,
            period_start: now,
            period_end: now,
            attempt_count: 1,
            failure_reason: None,
            payment_id: None,
            description: Some(format!("Setup fee for {}", plan.name)),
        };
        self.store.insert_payment(&payment).await?;

        let charge = ChargeRequest {
            merchant_id: plan.merchant_id.clone(),
            amount: fee,
            currency: plan.currency.clone(),
            chain: plan.chain.clone(),
            description: format!("Setup fee for {}", plan.name),
            customer_email: subscription.customer_email.clone(),
            subscription_payment_id: payment.id.clone(),
        };

        match self.payments.create_charge(charge).await {
            Ok(ledger_id) => {
                payment.payment_id = Some(ledger_id);
            }
            Err(e) => {
                warn!(
                    "Setup fee charge for subscription {} failed: {}",
                    subscription.id, e
                );
                payment.status = SubscriptionPaymentStatus::Failed;
                payment.failure_reason = Some(e.to_string());
            }
        }
        self.store.update_payment(&payment).await
    }

    pub async fn get_subscription(&self, id: &str) -> Result<Subscription> {
        self.require_subscription(id).await
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.store.all_subscriptions().await
    }

    /// Cancel immediately, or record a cancel-at-period-end intent that the
    /// billing sweep finalizes once the period lapses. Canceling a canceled
    /// subscription is a no-op.
    pub async fn cancel(&self, id: &str, at_period_end: bool) -> Result<Subscription> {
        let mut subscription = self.require_subscription(id).await?;
        if subscription.status.is_terminal() {
            return Ok(subscription);
        }

        let now = Utc::now();
        if at_period_end {
            subscription.cancel_at_period_end = true;
            subscription.canceled_at = Some(now);
            subscription.ended_at = Some(subscription.current_period_end);
            subscription.updated_at = now;
            self.store.update_subscription(&subscription).await?;
            info!(
                "Subscription {} will cancel at period end {}",
                id, subscription.current_period_end
            );
            return Ok(subscription);
        }

        subscription.status = SubscriptionStatus::Canceled;
        subscription.cancel_at_period_end = false;
        subscription.canceled_at = Some(now);
        subscription.ended_at = Some(now);
        subscription.updated_at = now;
        self.store.update_subscription(&subscription).await?;
        info!("Subscription {} canceled", id);

        self.emit(
            EventType::SubscriptionCancelled,
            id,
            json!({ "subscription": &subscription }),
        );
        Ok(subscription)
    }

    /// Active -> Paused; anything else is left alone (`Ok(None)`).
    pub async fn pause(&self, id: &str) -> Result<Option<Subscription>> {
        let mut subscription = self.require_subscription(id).await?;
        if subscription.status != SubscriptionStatus::Active {
            return Ok(None);
        }

        subscription.status = SubscriptionStatus::Paused;
        subscription.updated_at = Utc::now();
        self.store.update_subscription(&subscription).await?;
        info!("Subscription {} paused", id);
        Ok(Some(subscription))
    }

    /// Paused -> Active; anything else is left alone (`Ok(None)`).
    pub async fn resume(&self, id: &str) -> Result<Option<Subscription>> {
        let mut subscription = self.require_subscription(id).await?;
        if subscription.status != SubscriptionStatus::Paused {
            return Ok(None);
        }

        subscription.status = SubscriptionStatus::Active;
        subscription.updated_at = Utc::now();
        self.store.update_subscription(&subscription).await?;
        info!("Subscription {} resumed", id);
        Ok(Some(subscription))
    }

    pub async fn subscription_payments(&self, id: &str) -> Result<Vec<SubscriptionPayment>> {
        self.require_subscription(id).await?;
        self.store.payments_for_subscription(id).await
    }

    // ----- Sweeps -----

    /// One pass of the billing state machine. Per-subscription failures are
    /// isolated; one bad record never aborts the batch.
    pub async fn run_billing_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for subscription in self.store.all_subscriptions().await? {
            let id = subscription.id.clone();

            if subscription.cancel_at_period_end
                && !subscription.status.is_terminal()
                && subscription.current_period_end <= now
            {
                match self.finalize_cancellation(subscription, now).await {
                    Ok(()) => report.finalized_cancellations += 1,
                    Err(e) => {
                        error!("Finalizing cancellation of {} failed: {}", id, e);
                        report.errors += 1;
                    }
                }
                continue;
            }

            if !subscription.status.is_billable() || subscription.next_billing_date > now {
                continue;
            }

            report.due += 1;
            match self.process_billing(subscription, now).await {
                Ok(BillingOutcome::Charged) => report.charged += 1,
                Ok(BillingOutcome::Completed) => {
                    report.charged += 1;
                    report.completed += 1;
                }
                Ok(BillingOutcome::Failed) => report.failures += 1,
                Err(e) => {
                    error!("Billing subscription {} failed: {}", id, e);
                    report.errors += 1;
                }
            }
        }

        info!(
            "Billing sweep: {} due, {} charged, {} failures, {} cancellations finalized, {} completed, {} errors",
            report.due,
            report.charged,
            report.failures,
            report.finalized_cancellations,
            report.completed,
            report.errors
        );
        Ok(report)
    }

    async fn finalize_cancellation(
        &self,
        mut subscription: Subscription,
        now: DateTime<Utc>,
    ) -> Result<()> {
        subscription.status = SubscriptionStatus::Canceled;
        subscription.updated_at = now;
        self.store.update_subscription(&subscription).await?;
        info!(
            "Subscription {} canceled at period end",
            subscription.id
        );

        self.emit(
            EventType::SubscriptionCancelled,
            &subscription.id,
            json!({ "subscription": &subscription }),
        );
        Ok(())
    }

    async fn process_billing(
        &self,
        mut subscription: Subscription,
        now: DateTime<Utc>,
    ) -> Result<BillingOutcome> {
        let plan = self.require_plan(&subscription.plan_id).await?;

        // The period being billed starts where the current one ends.
        let period_start = subscription.current_period_end;
        let period_end = advance(period_start, plan.interval, plan.interval_count);

        let mut charge = SubscriptionPayment {
            id: ids::new_subscription_payment_id(),
            subscription_id: subscription.id.clone(),
            amount: plan.amount,
            currency: plan.currency.clone(),
            chain: plan.chain.clone(),
            status: SubscriptionPaymentStatus::Pending,
            scheduled_at: now,
            paid_at: None,
            transaction_hash: None,
            period_start,
            period_end,
            attempt_count: subscription.failed_payment_attempts + 1,
            failure_reason: None,
            payment_id: None,
            description: Some(format!(
                "{} billing cycle {}",
                plan.name,
                subscription.billing_cycle_count + 1
            )),
        };
        self.store.insert_payment(&charge).await?;

        let request = ChargeRequest {
            merchant_id: plan.merchant_id.clone(),
            amount: plan.amount,
            currency: plan.currency.clone(),
            chain: plan.chain.clone(),
            description: charge.description.clone().unwrap_or_default(),
            customer_email: subscription.customer_email.clone(),
            subscription_payment_id: charge.id.clone(),
        };

        match self.payments.create_charge(request).await {
            Ok(ledger_id) => {
                charge.payment_id = Some(ledger_id);
                self.store.update_payment(&charge).await?;

                // Roll the period from the old boundary, not from `now`,
                // so sweep jitter never shifts the cadence.
                let old_end = subscription.current_period_end;
                subscription.billing_cycle_count += 1;
                subscription.current_period_start = old_end;
                subscription.current_period_end =
                    advance(old_end, plan.interval, plan.interval_count);
                subscription.next_billing_date = subscription.current_period_end;
                subscription.status = SubscriptionStatus::Active;
                subscription.updated_at = now;

                let completed = plan
                    .max_billing_cycles
                    .is_some_and(|max| subscription.billing_cycle_count >= max);
                if completed {
                    subscription.status = SubscriptionStatus::Canceled;
                    subscription.ended_at = Some(now);
                }

                self.store.update_subscription(&subscription).await?;
                info!(
                    "Subscription {} charged for cycle {}",
                    subscription.id, subscription.billing_cycle_count
                );

                self.emit(
                    EventType::SubscriptionPaymentDue,
                    &subscription.id,
                    json!({ "subscription": &subscription, "payment": &charge }),
                );

                if completed {
                    info!(
                        "Subscription {} completed its {} billing cycles",
                        subscription.id, subscription.billing_cycle_count
                    );
                    self.emit(
                        EventType::SubscriptionExpired,
                        &subscription.id,
                        json!({ "subscription": &subscription }),
                    );
                    Ok(BillingOutcome::Completed)
                } else {
                    Ok(BillingOutcome::Charged)
                }
            }
            Err(e) => {
                warn!(
                    "Charge for subscription {} failed (attempt {}): {}",
                    subscription.id, charge.attempt_count, e
                );

                charge.status = SubscriptionPaymentStatus::Failed;
                charge.failure_reason = Some(e.to_string());
                self.store.update_payment(&charge).await?;

                subscription.failed_payment_attempts += 1;
                if subscription.failed_payment_attempts >= self.config.max_failed_attempts {
                    // Unpaid until a settlement or manual action; the
                    // retry date stays frozen.
                    subscription.status = SubscriptionStatus::Unpaid;
                } else {
                    subscription.status = SubscriptionStatus::PastDue;
                    subscription.next_billing_date = now + self.config.retry_delay;
                }
                subscription.updated_at = now;
                self.store.update_subscription(&subscription).await?;

                self.emit(
                    EventType::SubscriptionPaymentFailed,
                    &subscription.id,
                    json!({ "subscription": &subscription, "payment": &charge }),
                );
                Ok(BillingOutcome::Failed)
            }
        }
    }

    /// Move lapsed trials to Active. The next billing pass charges them
    /// (next_billing_date stays at the trial boundary).
    pub async fn run_trial_expiry_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut converted = 0;

        for mut subscription in self.store.all_subscriptions().await? {
            if subscription.status != SubscriptionStatus::Trialing {
                continue;
            }
            let Some(trial_end) = subscription.trial_end else {
                continue;
            };
            if trial_end > now {
                continue;
            }

            subscription.status = SubscriptionStatus::Active;
            subscription.next_billing_date = trial_end;
            subscription.updated_at = now;
            // One bad record must not stall every other expiring trial.
            if let Err(e) = self.store.update_subscription(&subscription).await {
                error!(
                    "Trial expiry for subscription {} failed: {}",
                    subscription.id, e
                );
                continue;
            }
            info!("Subscription {} trial ended", subscription.id);
            converted += 1;
        }

        Ok(converted)
    }

    // ----- Settlement -----

    /// Called when the ledger confirms a subscription-linked payment.
    /// Returns None when the payment id maps to no charge.
    pub async fn record_settlement(
        &self,
        payment_id: &str,
        tx_hash: &str,
    ) -> Result<Option<SubscriptionPayment>> {
        let Some(mut payment) = self.store.payment_by_ledger_id(payment_id).await? else {
            return Ok(None);
        };

        if payment.status == SubscriptionPaymentStatus::Paid {
            return Ok(Some(payment));
        }

        let now = Utc::now();
        payment.status = SubscriptionPaymentStatus::Paid;
        payment.paid_at = Some(now);
        payment.transaction_hash = Some(tx_hash.to_string());
        self.store.update_payment(&payment).await?;

        let mut subscription = self.require_subscription(&payment.subscription_id).await?;
        subscription.total_paid += payment.amount;
        subscription.last_payment_date = Some(now);
        subscription.failed_payment_attempts = 0;
        match subscription.status {
            SubscriptionStatus::PastDue => {
                subscription.status = SubscriptionStatus::Active;
            }
            SubscriptionStatus::Unpaid => {
                // The settled charge covers the outstanding cycle; billing
                // resumes at the period boundary, not the frozen retry date.
                subscription.status = SubscriptionStatus::Active;
                subscription.next_billing_date = subscription.current_period_end;
            }
            _ => {}
        }
        subscription.updated_at = now;
        self.store.update_subscription(&subscription).await?;
        info!(
            "Subscription {} settled payment {} ({})",
            subscription.id, payment.id, tx_hash
        );

        self.emit(
            EventType::SubscriptionPaymentProcessed,
            &subscription.id,
            json!({ "subscription": &subscription, "payment": &payment }),
        );

        Ok(Some(payment))
    }

    /// Manual paid -> refunded.
    pub async fn refund_subscription_payment(&self, id: &str) -> Result<SubscriptionPayment> {
        let mut payment = self
            .store
            .get_payment(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Subscription payment not found: {id}")))?;

        if payment.status != SubscriptionPaymentStatus::Paid {
            return Err(Error::Conflict(format!(
                "Only paid payments can be refunded; {id} is {:?}",
                payment.status
            )));
        }

        payment.status = SubscriptionPaymentStatus::Refunded;
        self.store.update_payment(&payment).await?;

        let mut subscription = self.require_subscription(&payment.subscription_id).await?;
        subscription.total_paid -= payment.amount;
        subscription.updated_at = Utc::now();
        self.store.update_subscription(&subscription).await?;
        info!("Refunded subscription payment {}", id);

        Ok(payment)
    }

    // ----- Stats -----

    pub async fn stats(&self) -> Result<SubscriptionStats> {
        let subscriptions = self.store.all_subscriptions().await?;
        let plans: HashMap<String, Plan> = self
            .store
            .all_plans()
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();

        let mut stats = SubscriptionStats {
            total_subscriptions: subscriptions.len(),
            active: 0,
            trialing: 0,
            past_due: 0,
            unpaid: 0,
            paused: 0,
            canceled: 0,
            mrr: Decimal::ZERO,
            arr: Decimal::ZERO,
        };

        for subscription in &subscriptions {
            match subscription.status {
                SubscriptionStatus::Active => {
                    stats.active += 1;
                    if let Some(plan) = plans.get(&subscription.plan_id) {
                        if plan.interval == BillingInterval::Monthly {
                            stats.mrr += plan.amount / Decimal::from(plan.interval_count);
                        }
                    }
                }
                SubscriptionStatus::Trialing => stats.trialing += 1,
                SubscriptionStatus::PastDue => stats.past_due += 1,
                SubscriptionStatus::Unpaid => stats.unpaid += 1,
                SubscriptionStatus::Paused => stats.paused += 1,
                SubscriptionStatus::Canceled => stats.canceled += 1,
            }
        }

        stats.arr = stats.mrr * Decimal::from(12);
        Ok(stats)
    }

    // ----- Helpers -----

    async fn require_plan(&self, id: &str) -> Result<Plan> {
        self.store
            .get_plan(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Plan not found: {id}")))
    }

    async fn require_subscription(&self, id: &str) -> Result<Subscription> {
        self.store
            .get_subscription(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Subscription not found: {id}")))
    }

    /// Fire-and-continue delivery: spawned so lifecycle operations and
    /// sweep passes never wait on a slow merchant endpoint.
    fn emit(&self, event: EventType, subscription_id: &str, data: Value) {
        let Some(endpoint) = self.config.webhook_url.clone() else {
            return;
        };

        let payload = WebhookPayload::new(
            event,
            subscription_id.to_string(),
            data,
            self.config.livemode,
        );

        let notifier = Arc::clone(&self.notifier);
        let subscription_id = subscription_id.to_string();
        tokio::spawn(async move {
            let receipt = notifier.deliver(&endpoint, &payload).await;
            if !receipt.success {
                warn!(
                    "Webhook {} for subscription {} undelivered after {} attempts",
                    payload.event, subscription_id, receipt.attempts
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryBillingStore;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use webhook_dispatcher::RecordingNotifier;

    /// Payment port that can be scripted to fail the next N charges.
    #[derive(Default)]
    struct ScriptedPort {
        failures: Mutex<u32>,
        charges: Mutex<Vec<ChargeRequest>>,
        counter: AtomicU32,
    }

    impl ScriptedPort {
        fn fail_next(&self, count: u32) {
            *self.failures.lock().unwrap() = count;
        }

        fn charges(&self) -> Vec<ChargeRequest> {
            self.charges.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PaymentPort for ScriptedPort {
        async fn create_charge(&self, charge: ChargeRequest) -> Result<String> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(Error::ExternalService(
                        "RPC endpoint unavailable".to_string(),
                    ));
                }
            }
            self.charges.lock().unwrap().push(charge);
            let n = self.counter.fetch_add(1, Ordering::SeqCst);
            Ok(format!("pay_scripted{n}"))
        }
    }

    struct Harness {
        engine: SubscriptionEngine,
        store: Arc<MemoryBillingStore>,
        port: Arc<ScriptedPort>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryBillingStore::new());
        let port = Arc::new(ScriptedPort::default());
        let notifier = Arc::new(RecordingNotifier::new());
        let engine = SubscriptionEngine::new(
            Arc::clone(&store) as Arc<dyn BillingStore>,
            Arc::clone(&port) as Arc<dyn PaymentPort>,
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            EngineConfig {
                webhook_url: Some("http://merchant.test/hooks".into()),
                ..EngineConfig::default()
            },
        );
        Harness {
            engine,
            store,
            port,
            notifier,
        }
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn monthly_plan_spec() -> NewPlan {
        NewPlan {
            merchant_id: "merch_1".into(),
            name: "Pro".into(),
            description: None,
            amount: dec("10"),
            currency: "USDC".into(),
            chain: "polygon".into(),
            interval: BillingInterval::Monthly,
            interval_count: 1,
            trial_days: 0,
            max_billing_cycles: None,
            setup_fee: None,
            metadata: None,
        }
    }

    fn subscribe_request(plan_id: &str) -> NewSubscription {
        NewSubscription {
            customer_id: "cust_1".into(),
            customer_email: Some("sub@example.com".into()),
            plan_id: plan_id.into(),
            wallet_address: "0xwallet".into(),
            trial_days_override: None,
            metadata: None,
        }
    }

    /// Deliveries run on spawned tasks; let them land before inspecting
    /// the recorder.
    async fn drain_deliveries() {
        tokio::task::yield_now().await;
    }

    /// Pull the subscription's billing date into the past so a sweep at
    /// `Utc::now()` sees it as due.
    async fn make_due(store: &MemoryBillingStore, id: &str) {
        let mut sub = store.get_subscription(id).await.unwrap().unwrap();
        sub.next_billing_date = Utc::now() - Duration::minutes(1);
        store.update_subscription(&sub).await.unwrap();
    }

    #[tokio::test]
    async fn test_plan_validation() {
        let h = harness();

        let mut zero_amount = monthly_plan_spec();
        zero_amount.amount = Decimal::ZERO;
        assert!(matches!(
            h.engine.create_plan(zero_amount).await.unwrap_err(),
            Error::Validation(_)
        ));

        let mut bad_count = monthly_plan_spec();
        bad_count.interval_count = 0;
        assert!(matches!(
            h.engine.create_plan(bad_count).await.unwrap_err(),
            Error::Validation(_)
        ));

        let mut zero_cycles = monthly_plan_spec();
        zero_cycles.max_billing_cycles = Some(0);
        assert!(matches!(
            h.engine.create_plan(zero_cycles).await.unwrap_err(),
            Error::Validation(_)
        ));

        let mut bad_chain = monthly_plan_spec();
        bad_chain.chain = "dogecoin".into();
        assert!(matches!(
            h.engine.create_plan(bad_chain).await.unwrap_err(),
            Error::UnsupportedChain(_)
        ));
    }

    #[tokio::test]
    async fn test_update_plan_leaves_financial_terms() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();

        let updated = h
            .engine
            .update_plan(
                &plan.id,
                PlanChanges {
                    name: Some("Pro Annual".into()),
                    active: Some(false),
                    ..PlanChanges::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "Pro Annual");
        assert!(!updated.active);
        assert_eq!(updated.amount, plan.amount);
        assert_eq!(updated.interval, plan.interval);
        assert!(updated.updated_at >= plan.updated_at);
    }

    #[tokio::test]
    async fn test_delete_plan_blocked_by_live_subscribers() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        assert!(matches!(
            h.engine.delete_plan(&plan.id).await.unwrap_err(),
            Error::Conflict(_)
        ));

        h.engine.cancel(&sub.id, false).await.unwrap();
        h.engine.delete_plan(&plan.id).await.unwrap();
        assert!(matches!(
            h.engine.get_plan(&plan.id).await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_without_trial() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();

        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(sub.id.starts_with("sub_"));
        assert_eq!(sub.billing_cycle_count, 0);
        assert_eq!(sub.next_billing_date, sub.current_period_end);
        assert!(sub.current_period_end > sub.current_period_start);
        drain_deliveries().await;
        assert_eq!(h.notifier.events(), vec!["subscription.created"]);
    }

    #[tokio::test]
    async fn test_subscribe_with_trial() {
        let h = harness();
        let mut spec = monthly_plan_spec();
        spec.trial_days = 14;
        let plan = h.engine.create_plan(spec).await.unwrap();

        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Trialing);
        assert_eq!(sub.trial_end, Some(sub.next_billing_date));
        let trial_len = sub.trial_end.unwrap() - sub.trial_start.unwrap();
        assert_eq!(trial_len, Duration::days(14));
    }

    #[tokio::test]
    async fn test_double_subscribe_conflicts() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        assert!(matches!(
            h.engine
                .subscribe(subscribe_request(&plan.id))
                .await
                .unwrap_err(),
            Error::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_inactive_plan() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        h.engine
            .update_plan(
                &plan.id,
                PlanChanges {
                    active: Some(false),
                    ..PlanChanges::default()
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            h.engine
                .subscribe(subscribe_request(&plan.id))
                .await
                .unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_setup_fee_charged_immediately() {
        let h = harness();
        let mut spec = monthly_plan_spec();
        spec.setup_fee = Some(dec("5"));
        let plan = h.engine.create_plan(spec).await.unwrap();

        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        let history = h.engine.subscription_payments(&sub.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, dec("5"));
        assert_eq!(history[0].status, SubscriptionPaymentStatus::Pending);
        assert!(history[0].payment_id.is_some());

        let charges = h.port.charges();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].amount, dec("5"));
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        let canceled = h.engine.cancel(&sub.id, false).await.unwrap();
        assert_eq!(canceled.status, SubscriptionStatus::Canceled);
        assert!(canceled.ended_at.is_some());
        drain_deliveries().await;
        assert_eq!(h.notifier.count_event("subscription.cancelled"), 1);

        // Cancel again: no-op, no second webhook
        h.engine.cancel(&sub.id, false).await.unwrap();
        drain_deliveries().await;
        assert_eq!(h.notifier.count_event("subscription.cancelled"), 1);

        // Terminal subscriptions cannot pause, resume, or bill
        assert!(h.engine.pause(&sub.id).await.unwrap().is_none());
        assert!(h.engine.resume(&sub.id).await.unwrap().is_none());
        make_due(&h.store, &sub.id).await;
        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn test_cancel_at_period_end_finalized_by_sweep() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        let pending = h.engine.cancel(&sub.id, true).await.unwrap();
        assert_eq!(pending.status, SubscriptionStatus::Active);
        assert!(pending.cancel_at_period_end);
        assert_eq!(pending.ended_at, Some(pending.current_period_end));

        // Period not lapsed yet: nothing happens
        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.finalized_cancellations, 0);

        // Lapse the period, sweep finalizes without charging
        let mut backdated = h.store.get_subscription(&sub.id).await.unwrap().unwrap();
        backdated.current_period_end = Utc::now() - Duration::minutes(1);
        backdated.next_billing_date = backdated.current_period_end;
        h.store.update_subscription(&backdated).await.unwrap();

        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.finalized_cancellations, 1);
        assert_eq!(report.charged, 0);
        assert!(h.port.charges().is_empty());

        let finalized = h.engine.get_subscription(&sub.id).await.unwrap();
        assert_eq!(finalized.status, SubscriptionStatus::Canceled);
        drain_deliveries().await;
        assert_eq!(h.notifier.count_event("subscription.cancelled"), 1);
    }

    #[tokio::test]
    async fn test_monthly_billing_cycle() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();
        let old_period_end = sub.current_period_end;

        make_due(&h.store, &sub.id).await;
        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.due, 1);
        assert_eq!(report.charged, 1);

        let billed = h.engine.get_subscription(&sub.id).await.unwrap();
        assert_eq!(billed.billing_cycle_count, 1);
        assert_eq!(billed.status, SubscriptionStatus::Active);
        // Period rolls from the old boundary, immune to sweep jitter
        assert_eq!(billed.current_period_start, old_period_end);
        assert_eq!(
            billed.current_period_end,
            advance(old_period_end, BillingInterval::Monthly, 1)
        );
        assert_eq!(billed.next_billing_date, billed.current_period_end);

        let history = h.engine.subscription_payments(&sub.id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].amount, dec("10"));
        assert_eq!(history[0].attempt_count, 1);
        drain_deliveries().await;
        assert_eq!(h.notifier.count_event("subscription.payment_due"), 1);

        // Not due again until the new period lapses
        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn test_max_billing_cycles_completes_subscription() {
        let h = harness();
        let mut spec = monthly_plan_spec();
        spec.max_billing_cycles = Some(2);
        let plan = h.engine.create_plan(spec).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        make_due(&h.store, &sub.id).await;
        h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(
            h.engine.get_subscription(&sub.id).await.unwrap().status,
            SubscriptionStatus::Active
        );

        make_due(&h.store, &sub.id).await;
        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.completed, 1);

        let completed = h.engine.get_subscription(&sub.id).await.unwrap();
        assert_eq!(completed.status, SubscriptionStatus::Canceled);
        assert_eq!(completed.billing_cycle_count, 2);
        assert!(completed.ended_at.is_some());
        drain_deliveries().await;
        assert_eq!(h.notifier.count_event("subscription.expired"), 1);

        // No third charge
        make_due(&h.store, &sub.id).await;
        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.due, 0);
        assert_eq!(h.port.charges().len(), 2);
    }

    #[tokio::test]
    async fn test_three_failures_reach_unpaid_with_frozen_retry() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        h.port.fail_next(3);

        make_due(&h.store, &sub.id).await;
        h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        let after_one = h.engine.get_subscription(&sub.id).await.unwrap();
        assert_eq!(after_one.status, SubscriptionStatus::PastDue);
        assert_eq!(after_one.failed_payment_attempts, 1);
        // Retry scheduled ~3 days out
        assert!(after_one.next_billing_date > Utc::now() + Duration::days(2));

        make_due(&h.store, &sub.id).await;
        h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        let after_two = h.engine.get_subscription(&sub.id).await.unwrap();
        assert_eq!(after_two.status, SubscriptionStatus::PastDue);
        assert_eq!(after_two.failed_payment_attempts, 2);

        make_due(&h.store, &sub.id).await;
        let frozen_date = h
            .store
            .get_subscription(&sub.id)
            .await
            .unwrap()
            .unwrap()
            .next_billing_date;
        h.engine.run_billing_sweep(Utc::now()).await.unwrap();

        let after_three = h.engine.get_subscription(&sub.id).await.unwrap();
        assert_eq!(after_three.status, SubscriptionStatus::Unpaid);
        assert_eq!(after_three.failed_payment_attempts, 3);
        assert_eq!(after_three.next_billing_date, frozen_date);
        assert_eq!(after_three.billing_cycle_count, 0);
        drain_deliveries().await;
        assert_eq!(h.notifier.count_event("subscription.payment_failed"), 3);

        // Unpaid is out of the sweep's reach
        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.due, 0);
    }

    #[tokio::test]
    async fn test_failure_isolated_per_subscription() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        let failing = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();
        let mut other_req = subscribe_request(&plan.id);
        other_req.customer_id = "cust_2".into();
        let healthy = h.engine.subscribe(other_req).await.unwrap();

        make_due(&h.store, &failing.id).await;
        make_due(&h.store, &healthy.id).await;
        h.port.fail_next(1);

        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.charged + report.failures, 2);
        assert_eq!(report.failures, 1);
        assert_eq!(report.errors, 0);
    }

    #[tokio::test]
    async fn test_settlement_resets_attempts_and_accumulates() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        make_due(&h.store, &sub.id).await;
        h.engine.run_billing_sweep(Utc::now()).await.unwrap();

        let history = h.engine.subscription_payments(&sub.id).await.unwrap();
        let ledger_id = history[0].payment_id.clone().unwrap();

        // Simulate an intervening failure before settlement lands
        let mut pending = h.store.get_subscription(&sub.id).await.unwrap().unwrap();
        pending.failed_payment_attempts = 2;
        pending.status = SubscriptionStatus::PastDue;
        h.store.update_subscription(&pending).await.unwrap();

        let settled = h
            .engine
            .record_settlement(&ledger_id, "0xsettled")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, SubscriptionPaymentStatus::Paid);
        assert_eq!(settled.transaction_hash.as_deref(), Some("0xsettled"));

        let current = h.engine.get_subscription(&sub.id).await.unwrap();
        assert_eq!(current.status, SubscriptionStatus::Active);
        assert_eq!(current.failed_payment_attempts, 0);
        assert_eq!(current.total_paid, dec("10"));
        assert!(current.last_payment_date.is_some());
        drain_deliveries().await;
        assert_eq!(h.notifier.count_event("subscription.payment_processed"), 1);

        // Settling twice is idempotent
        h.engine
            .record_settlement(&ledger_id, "0xsettled")
            .await
            .unwrap();
        assert_eq!(
            h.engine.get_subscription(&sub.id).await.unwrap().total_paid,
            dec("10")
        );

        // Unknown ledger payments map to nothing
        assert!(h
            .engine
            .record_settlement("pay_unknown", "0x1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_refund_paid_payment() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        make_due(&h.store, &sub.id).await;
        h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        let history = h.engine.subscription_payments(&sub.id).await.unwrap();
        let ledger_id = history[0].payment_id.clone().unwrap();

        // Refunding an unpaid charge is rejected
        assert!(matches!(
            h.engine
                .refund_subscription_payment(&history[0].id)
                .await
                .unwrap_err(),
            Error::Conflict(_)
        ));

        h.engine
            .record_settlement(&ledger_id, "0xsettled")
            .await
            .unwrap();
        let refunded = h
            .engine
            .refund_subscription_payment(&history[0].id)
            .await
            .unwrap();
        assert_eq!(refunded.status, SubscriptionPaymentStatus::Refunded);
        assert_eq!(
            h.engine.get_subscription(&sub.id).await.unwrap().total_paid,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn test_trial_expiry_sweep() {
        let h = harness();
        let mut spec = monthly_plan_spec();
        spec.trial_days = 7;
        let plan = h.engine.create_plan(spec).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        // Trial still running: untouched
        assert_eq!(
            h.engine.run_trial_expiry_sweep(Utc::now()).await.unwrap(),
            0
        );

        let trial_end = Utc::now() - Duration::hours(1);
        let mut lapsed = h.store.get_subscription(&sub.id).await.unwrap().unwrap();
        lapsed.trial_end = Some(trial_end);
        h.store.update_subscription(&lapsed).await.unwrap();

        assert_eq!(
            h.engine.run_trial_expiry_sweep(Utc::now()).await.unwrap(),
            1
        );
        let active = h.engine.get_subscription(&sub.id).await.unwrap();
        assert_eq!(active.status, SubscriptionStatus::Active);
        assert_eq!(active.next_billing_date, trial_end);

        // Now due: the next billing pass charges it
        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.charged, 1);
    }

    #[tokio::test]
    async fn test_pause_resume() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        let paused = h.engine.pause(&sub.id).await.unwrap().unwrap();
        assert_eq!(paused.status, SubscriptionStatus::Paused);

        // Paused subscriptions are not billed
        make_due(&h.store, &sub.id).await;
        let report = h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        assert_eq!(report.due, 0);

        // Double-pause is a no-op
        assert!(h.engine.pause(&sub.id).await.unwrap().is_none());

        let resumed = h.engine.resume(&sub.id).await.unwrap().unwrap();
        assert_eq!(resumed.status, SubscriptionStatus::Active);
        assert!(h.engine.resume(&sub.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_and_mrr() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();

        let active = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();
        let mut second = subscribe_request(&plan.id);
        second.customer_id = "cust_2".into();
        let canceled = h.engine.subscribe(second).await.unwrap();
        h.engine.cancel(&canceled.id, false).await.unwrap();

        let stats = h.engine.stats().await.unwrap();
        assert_eq!(stats.total_subscriptions, 2);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.canceled, 1);
        assert_eq!(stats.mrr, dec("10"));
        assert_eq!(stats.arr, dec("120"));

        h.engine.pause(&active.id).await.unwrap();
        let stats = h.engine.stats().await.unwrap();
        assert_eq!(stats.paused, 1);
        assert_eq!(stats.mrr, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_settlement_reactivates_unpaid_subscription() {
        let h = harness();
        let plan = h.engine.create_plan(monthly_plan_spec()).await.unwrap();
        let sub = h.engine.subscribe(subscribe_request(&plan.id)).await.unwrap();

        // First cycle charges fine; the customer just never pays it.
        make_due(&h.store, &sub.id).await;
        h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        let history = h.engine.subscription_payments(&sub.id).await.unwrap();
        let ledger_id = history[0].payment_id.clone().unwrap();

        // Three failed retries wedge the subscription at Unpaid
        h.port.fail_next(3);
        for _ in 0..3 {
            make_due(&h.store, &sub.id).await;
            h.engine.run_billing_sweep(Utc::now()).await.unwrap();
        }
        let wedged = h.engine.get_subscription(&sub.id).await.unwrap();
        assert_eq!(wedged.status, SubscriptionStatus::Unpaid);

        // The outstanding charge finally settles on-chain
        let settled = h
            .engine
            .record_settlement(&ledger_id, "0xrecovered")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.status, SubscriptionPaymentStatus::Paid);

        let revived = h.engine.get_subscription(&sub.id).await.unwrap();
        assert_eq!(revived.status, SubscriptionStatus::Active);
        assert_eq!(revived.failed_payment_attempts, 0);
        // Billing resumes at the period boundary, not the frozen retry date
        assert_eq!(revived.next_billing_date, revived.current_period_end);
        assert_eq!(revived.total_paid, dec("10"));
    }

    /// Notifier whose deliveries park until the test releases the gate.
    struct GatedNotifier {
        gate: tokio::sync::Semaphore,
        delivered: Mutex<Vec<String>>,
    }

    impl GatedNotifier {
        fn new() -> Self {
            Self {
                gate: tokio::sync::Semaphore::new(0),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Notifier for GatedNotifier {
        async fn deliver(
            &self,
            _endpoint_url: &str,
            payload: &WebhookPayload,
        ) -> webhook_dispatcher::DeliveryReceipt {
            let _permit = self.gate.acquire().await.unwrap();
            self.delivered.lock().unwrap().push(payload.event.clone());
            webhook_dispatcher::DeliveryReceipt {
                success: true,
                status_code: Some(200),
                attempts: 1,
                error: None,
            }
        }
    }

    #[tokio::test]
    async fn test_subscribe_does_not_wait_for_delivery() {
        let store = Arc::new(MemoryBillingStore::new());
        let port = Arc::new(ScriptedPort::default());
        let gated = Arc::new(GatedNotifier::new());
        let engine = SubscriptionEngine::new(
            Arc::clone(&store) as Arc<dyn BillingStore>,
            Arc::clone(&port) as Arc<dyn PaymentPort>,
            Arc::clone(&gated) as Arc<dyn Notifier>,
            EngineConfig {
                webhook_url: Some("http://merchant.test/hooks".into()),
                ..EngineConfig::default()
            },
        );
        let plan = engine.create_plan(monthly_plan_spec()).await.unwrap();

        // Returns while the delivery is still parked behind the gate
        let sub = engine.subscribe(subscribe_request(&plan.id)).await.unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
        assert!(gated.delivered.lock().unwrap().is_empty());

        gated.gate.add_permits(1);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(
            *gated.delivered.lock().unwrap(),
            vec!["subscription.created"]
        );
    }

    /// Store wrapper that refuses subscription writes for one id.
    struct FailingUpdateStore {
        inner: MemoryBillingStore,
        poisoned: Mutex<String>,
    }

    impl FailingUpdateStore {
        fn new() -> Self {
            Self {
                inner: MemoryBillingStore::new(),
                poisoned: Mutex::new(String::new()),
            }
        }

        fn poison(&self, id: &str) {
            *self.poisoned.lock().unwrap() = id.to_string();
        }
    }

    #[async_trait]
    impl BillingStore for FailingUpdateStore {
        async fn insert_plan(&self, plan: &Plan) -> Result<()> {
            self.inner.insert_plan(plan).await
        }
        async fn get_plan(&self, id: &str) -> Result<Option<Plan>> {
            self.inner.get_plan(id).await
        }
        async fn update_plan(&self, plan: &Plan) -> Result<()> {
            self.inner.update_plan(plan).await
        }
        async fn remove_plan(&self, id: &str) -> Result<()> {
            self.inner.remove_plan(id).await
        }
        async fn all_plans(&self) -> Result<Vec<Plan>> {
            self.inner.all_plans().await
        }
        async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
            self.inner.insert_subscription(subscription).await
        }
        async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>> {
            self.inner.get_subscription(id).await
        }
        async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
            if subscription.id == *self.poisoned.lock().unwrap() {
                return Err(Error::Storage("write refused".into()));
            }
            self.inner.update_subscription(subscription).await
        }
        async fn all_subscriptions(&self) -> Result<Vec<Subscription>> {
            self.inner.all_subscriptions().await
        }
        async fn insert_payment(&self, payment: &SubscriptionPayment) -> Result<()> {
            self.inner.insert_payment(payment).await
        }
        async fn get_payment(&self, id: &str) -> Result<Option<SubscriptionPayment>> {
            self.inner.get_payment(id).await
        }
        async fn update_payment(&self, payment: &SubscriptionPayment) -> Result<()> {
            self.inner.update_payment(payment).await
        }
        async fn payments_for_subscription(
            &self,
            subscription_id: &str,
        ) -> Result<Vec<SubscriptionPayment>> {
            self.inner.payments_for_subscription(subscription_id).await
        }
        async fn payment_by_ledger_id(
            &self,
            payment_id: &str,
        ) -> Result<Option<SubscriptionPayment>> {
            self.inner.payment_by_ledger_id(payment_id).await
        }
    }

    #[tokio::test]
    async fn test_trial_expiry_isolates_store_failures() {
        let store = Arc::new(FailingUpdateStore::new());
        let engine = SubscriptionEngine::new(
            Arc::clone(&store) as Arc<dyn BillingStore>,
            Arc::new(ScriptedPort::default()) as Arc<dyn PaymentPort>,
            Arc::new(RecordingNotifier::new()) as Arc<dyn Notifier>,
            EngineConfig::default(),
        );

        let mut spec = monthly_plan_spec();
        spec.trial_days = 7;
        let plan = engine.create_plan(spec).await.unwrap();

        let broken = engine.subscribe(subscribe_request(&plan.id)).await.unwrap();
        let mut second = subscribe_request(&plan.id);
        second.customer_id = "cust_2".into();
        let healthy = engine.subscribe(second).await.unwrap();

        let trial_end = Utc::now() - Duration::hours(1);
        for id in [&broken.id, &healthy.id] {
            let mut sub = store.inner.get_subscription(id).await.unwrap().unwrap();
            sub.trial_end = Some(trial_end);
            store.inner.update_subscription(&sub).await.unwrap();
        }
        store.poison(&broken.id);

        // The refused write is logged and skipped; the other trial converts
        assert_eq!(engine.run_trial_expiry_sweep(Utc::now()).await.unwrap(), 1);
        assert_eq!(
            engine.get_subscription(&healthy.id).await.unwrap().status,
            SubscriptionStatus::Active
        );
        assert_eq!(
            engine.get_subscription(&broken.id).await.unwrap().status,
            SubscriptionStatus::Trialing
        );
    }

    #[tokio::test]
    async fn test_ledger_port_creates_linked_payment() {
        use chain_gateway_port_test::build_ledger;

        let (ledger, _mocks) = build_ledger();
        let ledger = Arc::new(ledger);

        let charge = ChargeRequest {
            merchant_id: "merch_1".into(),
            amount: dec("10"),
            currency: "MATIC".into(),
            chain: "polygon".into(),
            description: "Pro billing cycle 1".into(),
            customer_email: None,
            subscription_payment_id: "subpay_link".into(),
        };

        let payment_id = ledger.create_charge(charge).await.unwrap();
        let payment = ledger.get_payment(&payment_id).await.unwrap();
        assert_eq!(payment.amount, dec("10"));
        assert_eq!(
            payment.metadata.unwrap()["subscription_payment_id"],
            "subpay_link"
        );
    }

    /// Minimal ledger wiring for the PaymentPort integration test.
    mod chain_gateway_port_test {
        use payment_ledger::{LedgerConfig, MemoryLedgerStore, PaymentLedger};
        use std::collections::HashMap;
        use std::sync::Arc;
        use webhook_dispatcher::{Notifier, RecordingNotifier};

        pub fn build_ledger() -> (
            PaymentLedger,
            HashMap<String, Arc<chain_gateway::MockChain>>,
        ) {
            let (router, mocks) = chain_gateway::ChainRouter::mock();
            let mut receiving_addresses = HashMap::new();
            receiving_addresses.insert(
                "polygon".to_string(),
                "0x742d35Cc6634C0532925a3b8D4C9db96590c6C87".to_string(),
            );

            let config = LedgerConfig {
                receiving_addresses,
                ..LedgerConfig::default()
            };

            (
                PaymentLedger::new(
                    Arc::new(MemoryLedgerStore::new()),
                    Arc::new(router),
                    Arc::new(RecordingNotifier::new()) as Arc<dyn Notifier>,
                    config,
                ),
                mocks,
            )
        }
    }
}
