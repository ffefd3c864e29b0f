//! Payment storage
//!
//! `LedgerStore` is the injected repository boundary: the ledger logic is
//! storage-agnostic and tested against the in-memory backend, while
//! deployments run the Redis backend.

use crate::models::{Payment, PaymentFilter, PaymentStatus};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dhansetu_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn insert(&self, payment: &Payment) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Payment>>;

    /// Overwrite a record. Status transitions must go through the gated
    /// methods below.
    async fn update(&self, payment: &Payment) -> Result<()>;

    async fn list(
        &self,
        filter: &PaymentFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Payment>>;

    async fn all(&self) -> Result<Vec<Payment>>;

    /// Apply pending -> confirmed. Returns the updated record only for the
    /// single winning writer; any concurrent or repeated caller gets None.
    async fn confirm_if_pending(
        &self,
        id: &str,
        tx_hash: &str,
        confirmed_at: DateTime<Utc>,
    ) -> Result<Option<Payment>>;

    /// Apply pending -> expired with the same single-winner gating.
    async fn expire_if_pending(&self, id: &str) -> Result<Option<Payment>>;

    /// Record webhook delivery bookkeeping without touching status.
    async fn set_webhook_state(&self, id: &str, sent: bool, attempts: u32) -> Result<()>;
}

/// In-memory backend for tests and development.
#[derive(Default)]
pub struct MemoryLedgerStore {
    payments: RwLock<HashMap<String, Payment>>,
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn newest_first(payments: &mut Vec<Payment>) {
    payments.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn insert(&self, payment: &Payment) -> Result<()> {
        let mut payments = self.payments.write().await;
        if payments.contains_key(&payment.id) {
            return Err(Error::Conflict(format!(
                "Payment already exists: {}",
                payment.id
            )));
        }
        payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Payment>> {
        Ok(self.payments.read().await.get(id).cloned())
    }

    async fn update(&self, payment: &Payment) -> Result<()> {
        let mut payments = self.payments.write().await;
        if !payments.contains_key(&payment.id) {
            return Err(Error::NotFound(format!("Payment not found: {}", payment.id)));
        }
        payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn list(
        &self,
        filter: &PaymentFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Payment>> {
        let mut matched: Vec<Payment> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| filter.matches(p))
            .cloned()
            .collect();

        newest_first(&mut matched);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn all(&self) -> Result<Vec<Payment>> {
        let mut payments: Vec<Payment> = self.payments.read().await.values().cloned().collect();
        newest_first(&mut payments);
        Ok(payments)
    }

    async fn confirm_if_pending(
        &self,
        id: &str,
        tx_hash: &str,
        confirmed_at: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let mut payments = self.payments.write().await;
        let Some(payment) = payments.get_mut(id) else {
            return Ok(None);
        };

        if payment.status != PaymentStatus::Pending {
            debug!("Payment {} no longer pending, confirm skipped", id);
            return Ok(None);
        }

        payment.status = PaymentStatus::Confirmed;
        payment.transaction_hash = Some(tx_hash.to_string());
        payment.confirmed_at = Some(confirmed_at);
        Ok(Some(payment.clone()))
    }

    async fn expire_if_pending(&self, id: &str) -> Result<Option<Payment>> {
        let mut payments = self.payments.write().await;
        let Some(payment) = payments.get_mut(id) else {
            return Ok(None);
        };

        if payment.status != PaymentStatus::Pending {
            return Ok(None);
        }

        payment.status = PaymentStatus::Expired;
        Ok(Some(payment.clone()))
    }

    async fn set_webhook_state(&self, id: &str, sent: bool, attempts: u32) -> Result<()> {
        let mut payments = self.payments.write().await;
        let Some(payment) = payments.get_mut(id) else {
            return Err(Error::NotFound(format!("Payment not found: {id}")));
        };
        payment.webhook_sent = sent;
        payment.webhook_attempts = attempts;
        Ok(())
    }
}

/// Redis backend.
///
/// Records are JSON under `payment:{id}` with a `payments:all` index set.
/// The one-way pending transition is guarded by a `SET NX` terminal key so
/// only one writer wins across processes.
pub struct RedisLedgerStore {
    conn: ConnectionManager,
}

fn redis_err(e: redis::RedisError) -> Error {
    Error::Storage(e.to_string())
}

impl RedisLedgerStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Storage(format!("Failed to create Redis client: {e}")))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect to Redis: {e}")))?;

        info!("Connected to Redis at {}", redis_url);
        Ok(Self { conn })
    }

    fn key(id: &str) -> String {
        format!("payment:{id}")
    }

    fn terminal_key(id: &str) -> String {
        format!("payment:{id}:terminal")
    }

    async fn load(&self, id: &str) -> Result<Option<Payment>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(Self::key(id)).await.map_err(redis_err)?;

        json.map(|data| serde_json::from_str(&data).map_err(Error::from))
            .transpose()
    }

    async fn save(&self, payment: &Payment) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(payment)?;
        conn.set::<_, _, ()>(Self::key(&payment.id), json)
            .await
            .map_err(redis_err)
    }

    /// Claim the one-way transition for `id`. True only for the winner.
    async fn claim_terminal(&self, id: &str, state: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = redis::cmd("SET")
            .arg(Self::terminal_key(id))
            .arg(state)
            .arg("NX")
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;

        Ok(claimed.is_some())
    }
}

#[async_trait]
impl LedgerStore for RedisLedgerStore {
    async fn insert(&self, payment: &Payment) -> Result<()> {
        let mut conn = self.conn.clone();

        let exists: bool = conn.exists(Self::key(&payment.id)).await.map_err(redis_err)?;
        if exists {
            return Err(Error::Conflict(format!(
                "Payment already exists: {}",
                payment.id
            )));
        }

        self.save(payment).await?;
        conn.sadd::<_, _, ()>("payments:all", &payment.id)
            .await
            .map_err(redis_err)?;

        info!("Stored payment: {}", payment.id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Payment>> {
        self.load(id).await
    }

    async fn update(&self, payment: &Payment) -> Result<()> {
        if self.load(&payment.id).await?.is_none() {
            return Err(Error::NotFound(format!("Payment not found: {}", payment.id)));
        }
        self.save(payment).await
    }

    async fn list(
        &self,
        filter: &PaymentFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Payment>> {
        let mut matched: Vec<Payment> = self
            .all()
            .await?
            .into_iter()
            .filter(|p| filter.matches(p))
            .collect();

        newest_first(&mut matched);
        Ok(matched.into_iter().skip(offset).take(limit).collect())
    }

    async fn all(&self) -> Result<Vec<Payment>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers("payments:all").await.map_err(redis_err)?;

        let mut payments = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(payment) = self.load(&id).await? {
                payments.push(payment);
            }
        }

        newest_first(&mut payments);
        Ok(payments)
    }

    async fn confirm_if_pending(
        &self,
        id: &str,
        tx_hash: &str,
        confirmed_at: DateTime<Utc>,
    ) -> Result<Option<Payment>> {
        let Some(mut payment) = self.load(id).await? else {
            return Ok(None);
        };

        if payment.status != PaymentStatus::Pending {
            return Ok(None);
        }

        if !self.claim_terminal(id, "confirmed").await? {
            debug!("Payment {} terminal transition already claimed", id);
            return Ok(None);
        }

        payment.status = PaymentStatus::Confirmed;
        payment.transaction_hash = Some(tx_hash.to_string());
        payment.confirmed_at = Some(confirmed_at);
        self.save(&payment).await?;

        Ok(Some(payment))
    }

    async fn expire_if_pending(&self, id: &str) -> Result<Option<Payment>> {
        let Some(mut payment) = self.load(id).await? else {
            return Ok(None);
        };

        if payment.status != PaymentStatus::Pending {
            return Ok(None);
        }

        if !self.claim_terminal(id, "expired").await? {
            return Ok(None);
        }

        payment.status = PaymentStatus::Expired;
        self.save(&payment).await?;

        Ok(Some(payment))
    }

    async fn set_webhook_state(&self, id: &str, sent: bool, attempts: u32) -> Result<()> {
        let Some(mut payment) = self.load(id).await? else {
            return Err(Error::NotFound(format!("Payment not found: {id}")));
        };
        payment.webhook_sent = sent;
        payment.webhook_attempts = attempts;
        self.save(&payment).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FeeBreakdown;
    use chrono::Duration;
    use rust_decimal::Decimal;

    fn sample(id: &str, created_offset_secs: i64) -> Payment {
        Payment {
            id: id.into(),
            merchant_id: "merch_1".into(),
            amount: Decimal::from(10),
            currency: "ETH".into(),
            token_address: None,
            chain: "ethereum".into(),
            status: PaymentStatus::Pending,
            receiving_address: "0xrecv".into(),
            payment_url: format!("http://localhost/pay/{id}"),
            qr_data: "ethereum:0xrecv@1?value=1".into(),
            transaction_hash: None,
            customer_address: None,
            customer_email: None,
            description: None,
            expires_at: Utc::now() + Duration::hours(24),
            created_at: Utc::now() + Duration::seconds(created_offset_secs),
            confirmed_at: None,
            webhook_sent: false,
            webhook_attempts: 0,
            fees: FeeBreakdown {
                gateway_fee: Decimal::ZERO,
                net_amount: Decimal::from(10),
            },
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryLedgerStore::new();
        store.insert(&sample("pay_a", 0)).await.unwrap();

        let loaded = store.get("pay_a").await.unwrap().unwrap();
        assert_eq!(loaded.id, "pay_a");
        assert!(store.get("pay_missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert_conflicts() {
        let store = MemoryLedgerStore::new();
        store.insert(&sample("pay_a", 0)).await.unwrap();

        let err = store.insert(&sample("pay_a", 0)).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_confirm_gating_single_winner() {
        let store = MemoryLedgerStore::new();
        store.insert(&sample("pay_a", 0)).await.unwrap();

        let first = store
            .confirm_if_pending("pay_a", "0xhash", Utc::now())
            .await
            .unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, PaymentStatus::Confirmed);

        // Second writer observes the already-updated record
        let second = store
            .confirm_if_pending("pay_a", "0xother", Utc::now())
            .await
            .unwrap();
        assert!(second.is_none());

        let loaded = store.get("pay_a").await.unwrap().unwrap();
        assert_eq!(loaded.transaction_hash.as_deref(), Some("0xhash"));
    }

    #[tokio::test]
    async fn test_expire_does_not_touch_confirmed() {
        let store = MemoryLedgerStore::new();
        store.insert(&sample("pay_a", 0)).await.unwrap();
        store
            .confirm_if_pending("pay_a", "0xhash", Utc::now())
            .await
            .unwrap();

        assert!(store.expire_if_pending("pay_a").await.unwrap().is_none());
        assert_eq!(
            store.get("pay_a").await.unwrap().unwrap().status,
            PaymentStatus::Confirmed
        );
    }

    #[tokio::test]
    async fn test_list_newest_first_with_paging() {
        let store = MemoryLedgerStore::new();
        store.insert(&sample("pay_old", -30)).await.unwrap();
        store.insert(&sample("pay_mid", -20)).await.unwrap();
        store.insert(&sample("pay_new", -10)).await.unwrap();

        let page = store
            .list(&PaymentFilter::default(), 2, 0)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, "pay_new");
        assert_eq!(page[1].id, "pay_mid");

        let next = store
            .list(&PaymentFilter::default(), 2, 2)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].id, "pay_old");
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_redis_round_trip() {
        let store = RedisLedgerStore::new("redis://127.0.0.1:6379/15")
            .await
            .unwrap();

        let payment = sample("pay_redis_test", 0);
        store.insert(&payment).await.unwrap();

        let loaded = store.get("pay_redis_test").await.unwrap().unwrap();
        assert_eq!(loaded.amount, payment.amount);

        let confirmed = store
            .confirm_if_pending("pay_redis_test", "0xhash", Utc::now())
            .await
            .unwrap();
        assert!(confirmed.is_some());
        assert!(store
            .confirm_if_pending("pay_redis_test", "0xhash", Utc::now())
            .await
            .unwrap()
            .is_none());
    }
}
