//! Payment Ledger service
//!
//! Owns the payment lifecycle: creation with a chain-appropriate payment
//! URI, on-chain settlement validation, lazy expiry, listing and stats.
//! Webhooks fire after the owning state transition commits and never roll
//! it back.

use crate::models::{
    FeeBreakdown, NewPayment, Payment, PaymentFilter, PaymentStats, PaymentStatus,
};
use crate::storage::LedgerStore;
use crate::uri::build_payment_uri;
use chain_gateway::{ChainRouter, TxStatus};
use chrono::{Duration, Utc};
use dhansetu_common::{ids, Error, Result};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use webhook_dispatcher::{EventType, Notifier, WebhookPayload};

/// Ledger configuration, resolved once at startup.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Base URL for hosted payment pages
    pub base_url: String,
    /// Receiving address per chain key
    pub receiving_addresses: HashMap<String, String>,
    /// Gateway fee rate, e.g. 0.01 for 1%
    pub fee_rate: Decimal,
    /// Default payment lifetime
    pub expiry: Duration,
    /// Merchant webhook endpoint; None disables delivery
    pub webhook_url: Option<String>,
    pub livemode: bool,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            receiving_addresses: HashMap::new(),
            fee_rate: Decimal::ZERO,
            expiry: Duration::hours(24),
            webhook_url: None,
            livemode: false,
        }
    }
}

pub struct PaymentLedger {
    store: Arc<dyn LedgerStore>,
    chains: Arc<ChainRouter>,
    notifier: Arc<dyn Notifier>,
    config: LedgerConfig,
}

impl PaymentLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chains: Arc<ChainRouter>,
        notifier: Arc<dyn Notifier>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            chains,
            notifier,
            config,
        }
    }

    pub fn chains(&self) -> &ChainRouter {
        &self.chains
    }

    pub async fn create_payment(&self, request: NewPayment) -> Result<Payment> {
        if request.amount <= Decimal::ZERO {
            return Err(Error::Validation(format!(
                "Payment amount must be positive, got {}",
                request.amount
            )));
        }

        let gateway = self.chains.for_chain(&request.chain)?;
        let chain = gateway.config();

        let receiving_address = self
            .config
            .receiving_addresses
            .get(&request.chain)
            .cloned()
            .ok_or_else(|| {
                Error::UnsupportedChain(format!(
                    "No receiving address configured for chain: {}",
                    request.chain
                ))
            })?;

        let qr_data = build_payment_uri(
            chain,
            &receiving_address,
            request.amount,
            request.token_address.as_deref(),
            request.token_decimals,
        )?;

        let now = Utc::now();
        let id = ids::new_payment_id();
        let gateway_fee = request.amount * self.config.fee_rate;

        let payment = Payment {
            payment_url: format!("{}/pay/{}", self.config.base_url, id),
            id,
            merchant_id: request.merchant_id,
            amount: request.amount,
            currency: request.currency,
            token_address: request.token_address,
            chain: request.chain,
            status: PaymentStatus::Pending,
            receiving_address,
            qr_data,
            transaction_hash: None,
            customer_address: None,
            customer_email: request.customer_email,
            description: request.description,
            expires_at: request.expires_at.unwrap_or(now + self.config.expiry),
            created_at: now,
            confirmed_at: None,
            webhook_sent: false,
            webhook_attempts: 0,
            fees: FeeBreakdown {
                gateway_fee,
                net_amount: request.amount - gateway_fee,
            },
            metadata: request.metadata,
        };

        self.store.insert(&payment).await?;
        info!(
            "Created payment {} on {} for {} {}",
            payment.id, payment.chain, payment.amount, payment.currency
        );

        self.emit(EventType::PaymentCreated, &payment);
        Ok(payment)
    }

    /// Fetch a payment, observing lapsed pendings as expired.
    pub async fn get_payment(&self, id: &str) -> Result<Payment> {
        let payment = self
            .store
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Payment not found: {id}")))?;

        if payment.is_stale(Utc::now()) {
            if let Some(expired) = self.store.expire_if_pending(id).await? {
                info!("Payment {} expired on read", id);
                self.emit(EventType::PaymentExpired, &expired);
                return Ok(expired);
            }
            // Lost the race; return the winner's view
            return self
                .store
                .get(id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("Payment not found: {id}")));
        }

        Ok(payment)
    }

    pub async fn list_payments(
        &self,
        filter: &PaymentFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Payment>> {
        self.store.list(filter, limit, offset).await
    }

    /// Substring search over id, addresses, tx hash, and customer email.
    pub async fn search_payments(&self, query: &str) -> Result<Vec<Payment>> {
        let needle = query.to_lowercase();

        Ok(self
            .store
            .all()
            .await?
            .into_iter()
            .filter(|p| {
                let fields = [
                    Some(p.id.as_str()),
                    Some(p.receiving_address.as_str()),
                    p.transaction_hash.as_deref(),
                    p.customer_address.as_deref(),
                    p.customer_email.as_deref(),
                ];
                fields
                    .into_iter()
                    .flatten()
                    .any(|f| f.to_lowercase().contains(&needle))
            })
            .collect())
    }

    pub async fn stats(&self) -> Result<PaymentStats> {
        let payments = self.store.all().await?;

        let mut stats = PaymentStats {
            total_payments: payments.len(),
            confirmed_payments: 0,
            pending_payments: 0,
            failed_payments: 0,
            expired_payments: 0,
            total_amount: Decimal::ZERO,
        };

        for payment in &payments {
            match payment.status {
                PaymentStatus::Confirmed => {
                    stats.confirmed_payments += 1;
                    stats.total_amount += payment.amount;
                }
                PaymentStatus::Pending => stats.pending_payments += 1,
                PaymentStatus::Failed => stats.failed_payments += 1,
                PaymentStatus::Expired => stats.expired_payments += 1,
            }
        }

        Ok(stats)
    }

    /// Check `tx_hash` against the chain and settle the payment if it pays
    /// the receiving address in full.
    ///
    /// Fail-closed: missing payments, non-pending records (except a repeat
    /// call with the already-recorded hash), malformed hashes, reverted or
    /// pending transactions, and underpayment all yield `Ok(false)`. Only
    /// RPC transport failures surface as errors, and those never mutate
    /// the record.
    pub async fn validate_payment(&self, id: &str, tx_hash: &str) -> Result<bool> {
        let Some(payment) = self.store.get(id).await? else {
            warn!("validate_payment: unknown payment {}", id);
            return Ok(false);
        };

        if payment.is_stale(Utc::now()) {
            if let Some(expired) = self.store.expire_if_pending(id).await? {
                self.emit(EventType::PaymentExpired, &expired);
            }
            return Ok(false);
        }

        if payment.status != PaymentStatus::Pending {
            // Repeat validation of a settled payment is idempotent
            return Ok(payment.status == PaymentStatus::Confirmed
                && payment.transaction_hash.as_deref() == Some(tx_hash));
        }

        let gateway = self.chains.for_chain(&payment.chain)?;
        let verification = match gateway.transaction(tx_hash).await {
            Ok(v) => v,
            Err(Error::Validation(reason)) => {
                warn!("validate_payment {}: rejected hash: {}", id, reason);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if verification.status != TxStatus::Confirmed {
            return Ok(false);
        }

        let credited =
            verification.credited_amount(&payment.receiving_address, payment.token_address.as_deref());
        if credited < payment.amount {
            warn!(
                "validate_payment {}: credited {} below requested {}",
                id, credited, payment.amount
            );
            return Ok(false);
        }

        match self.store.confirm_if_pending(id, tx_hash, Utc::now()).await? {
            Some(confirmed) => {
                info!("Payment {} confirmed by {}", id, tx_hash);
                self.emit(EventType::PaymentCompleted, &confirmed);
                Ok(true)
            }
            None => {
                // A concurrent validator won; defer to the stored outcome
                let current = self.store.get(id).await?;
                Ok(current.is_some_and(|p| {
                    p.status == PaymentStatus::Confirmed
                        && p.transaction_hash.as_deref() == Some(tx_hash)
                }))
            }
        }
    }

    /// Sweep lapsed pending payments into `Expired`. Returns the number
    /// expired.
    pub async fn expire_stale_payments(&self) -> Result<usize> {
        let now = Utc::now();
        let mut expired = 0;

        for payment in self.store.all().await? {
            if !payment.is_stale(now) {
                continue;
            }
            if let Some(record) = self.store.expire_if_pending(&payment.id).await? {
                info!("Payment {} expired by sweep", record.id);
                self.emit(EventType::PaymentExpired, &record);
                expired += 1;
            }
        }

        Ok(expired)
    }

    /// Fire-and-continue delivery: spawned so the owning state transition
    /// returns without waiting on the merchant endpoint. The receipt is
    /// recorded on the payment from the delivery task.
    fn emit(&self, event: EventType, payment: &Payment) {
        let Some(endpoint) = self.config.webhook_url.clone() else {
            return;
        };

        let payload = WebhookPayload::new(
            event,
            payment.id.clone(),
            json!({ "payment": payment }),
            self.config.livemode,
        );

        let store = Arc::clone(&self.store);
        let notifier = Arc::clone(&self.notifier);
        let payment_id = payment.id.clone();
        let prior_attempts = payment.webhook_attempts;
        tokio::spawn(async move {
            let receipt = notifier.deliver(&endpoint, &payload).await;
            let attempts = prior_attempts + receipt.attempts;
            if let Err(e) = store
                .set_webhook_state(&payment_id, receipt.success, attempts)
                .await
            {
                warn!("Failed to record webhook state for {}: {}", payment_id, e);
            }
        });
    }
}
