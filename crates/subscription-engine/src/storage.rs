//! Billing storage
//!
//! Plans, subscriptions, and subscription payment history behind one
//! `BillingStore` trait, with an in-memory backend for tests and a Redis
//! backend for deployments.

use crate::models::{Plan, Subscription, SubscriptionPayment};
use async_trait::async_trait;
use dhansetu_common::{Error, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn insert_plan(&self, plan: &Plan) -> Result<()>;
    async fn get_plan(&self, id: &str) -> Result<Option<Plan>>;
    async fn update_plan(&self, plan: &Plan) -> Result<()>;
    async fn remove_plan(&self, id: &str) -> Result<()>;
    async fn all_plans(&self) -> Result<Vec<Plan>>;

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()>;
    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>>;
    async fn update_subscription(&self, subscription: &Subscription) -> Result<()>;
    async fn all_subscriptions(&self) -> Result<Vec<Subscription>>;

    async fn insert_payment(&self, payment: &SubscriptionPayment) -> Result<()>;
    async fn get_payment(&self, id: &str) -> Result<Option<SubscriptionPayment>>;
    async fn update_payment(&self, payment: &SubscriptionPayment) -> Result<()>;

    /// Billing history, newest first.
    async fn payments_for_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<SubscriptionPayment>>;

    /// Look up the charge backed by a given ledger payment.
    async fn payment_by_ledger_id(&self, payment_id: &str)
        -> Result<Option<SubscriptionPayment>>;
}

/// In-memory backend for tests and development.
#[derive(Default)]
pub struct MemoryBillingStore {
    plans: RwLock<HashMap<String, Plan>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    payments: RwLock<HashMap<String, SubscriptionPayment>>,
}

impl MemoryBillingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for MemoryBillingStore {
    async fn insert_plan(&self, plan: &Plan) -> Result<()> {
        let mut plans = self.plans.write().await;
        if plans.contains_key(&plan.id) {
            return Err(Error::Conflict(format!("Plan already exists: {}", plan.id)));
        }
        plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn get_plan(&self, id: &str) -> Result<Option<Plan>> {
        Ok(self.plans.read().await.get(id).cloned())
    }

    async fn update_plan(&self, plan: &Plan) -> Result<()> {
        let mut plans = self.plans.write().await;
        if !plans.contains_key(&plan.id) {
            return Err(Error::NotFound(format!("Plan not found: {}", plan.id)));
        }
        plans.insert(plan.id.clone(), plan.clone());
        Ok(())
    }

    async fn remove_plan(&self, id: &str) -> Result<()> {
        let mut plans = self.plans.write().await;
        plans
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(format!("Plan not found: {id}")))
    }

    async fn all_plans(&self) -> Result<Vec<Plan>> {
        let mut plans: Vec<Plan> = self.plans.read().await.values().cloned().collect();
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(plans)
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        if subscriptions.contains_key(&subscription.id) {
            return Err(Error::Conflict(format!(
                "Subscription already exists: {}",
                subscription.id
            )));
        }
        subscriptions.insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.read().await.get(id).cloned())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        if !subscriptions.contains_key(&subscription.id) {
            return Err(Error::NotFound(format!(
                "Subscription not found: {}",
                subscription.id
            )));
        }
        subscriptions.insert(subscription.id.clone(), subscription.clone());
        Ok(())
    }

    async fn all_subscriptions(&self) -> Result<Vec<Subscription>> {
        let mut subscriptions: Vec<Subscription> =
            self.subscriptions.read().await.values().cloned().collect();
        subscriptions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subscriptions)
    }

    async fn insert_payment(&self, payment: &SubscriptionPayment) -> Result<()> {
        let mut payments = self.payments.write().await;
        if payments.contains_key(&payment.id) {
            return Err(Error::Conflict(format!(
                "Subscription payment already exists: {}",
                payment.id
            )));
        }
        payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn get_payment(&self, id: &str) -> Result<Option<SubscriptionPayment>> {
        Ok(self.payments.read().await.get(id).cloned())
    }

    async fn update_payment(&self, payment: &SubscriptionPayment) -> Result<()> {
        let mut payments = self.payments.write().await;
        if !payments.contains_key(&payment.id) {
            return Err(Error::NotFound(format!(
                "Subscription payment not found: {}",
                payment.id
            )));
        }
        payments.insert(payment.id.clone(), payment.clone());
        Ok(())
    }

    async fn payments_for_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<SubscriptionPayment>> {
        let mut payments: Vec<SubscriptionPayment> = self
            .payments
            .read()
            .await
            .values()
            .filter(|p| p.subscription_id == subscription_id)
            .cloned()
            .collect();
        payments.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        Ok(payments)
    }

    async fn payment_by_ledger_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<SubscriptionPayment>> {
        Ok(self
            .payments
            .read()
            .await
            .values()
            .find(|p| p.payment_id.as_deref() == Some(payment_id))
            .cloned())
    }
}

/// Redis backend.
///
/// JSON records under `plan:{id}` / `subscription:{id}` / `subpayment:{id}`
/// with set indexes, plus a `subpayment:ledger:{payment_id}` pointer for
/// settlement lookups.
pub struct RedisBillingStore {
    conn: ConnectionManager,
}

fn redis_err(e: redis::RedisError) -> Error {
    Error::Storage(e.to_string())
}

impl RedisBillingStore {
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| Error::Storage(format!("Failed to create Redis client: {e}")))?;

        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect to Redis: {e}")))?;

        info!("Connected to Redis at {}", redis_url);
        Ok(Self { conn })
    }

    async fn load_json<T: serde::de::DeserializeOwned>(&self, key: String) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(key).await.map_err(redis_err)?;
        json.map(|data| serde_json::from_str(&data).map_err(Error::from))
            .transpose()
    }

    async fn save_json<T: serde::Serialize>(&self, key: String, value: &T) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(value)?;
        conn.set::<_, _, ()>(key, json).await.map_err(redis_err)
    }

    async fn index_add(&self, index: &str, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(index, id).await.map_err(redis_err)
    }

    async fn index_members(&self, index: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        conn.smembers(index).await.map_err(redis_err)
    }

    fn plan_key(id: &str) -> String {
        format!("plan:{id}")
    }

    fn subscription_key(id: &str) -> String {
        format!("subscription:{id}")
    }

    fn payment_key(id: &str) -> String {
        format!("subpayment:{id}")
    }

    fn ledger_index_key(payment_id: &str) -> String {
        format!("subpayment:ledger:{payment_id}")
    }

    /// Keep the ledger-payment pointer current for settlement lookups.
    async fn index_ledger_link(&self, payment: &SubscriptionPayment) -> Result<()> {
        if let Some(ledger_id) = &payment.payment_id {
            let mut conn = self.conn.clone();
            conn.set::<_, _, ()>(Self::ledger_index_key(ledger_id), &payment.id)
                .await
                .map_err(redis_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl BillingStore for RedisBillingStore {
    async fn insert_plan(&self, plan: &Plan) -> Result<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(Self::plan_key(&plan.id))
            .await
            .map_err(redis_err)?;
        if exists {
            return Err(Error::Conflict(format!("Plan already exists: {}", plan.id)));
        }

        self.save_json(Self::plan_key(&plan.id), plan).await?;
        self.index_add("plans:all", &plan.id).await?;
        info!("Stored plan: {}", plan.id);
        Ok(())
    }

    async fn get_plan(&self, id: &str) -> Result<Option<Plan>> {
        self.load_json(Self::plan_key(id)).await
    }

    async fn update_plan(&self, plan: &Plan) -> Result<()> {
        if self.get_plan(&plan.id).await?.is_none() {
            return Err(Error::NotFound(format!("Plan not found: {}", plan.id)));
        }
        self.save_json(Self::plan_key(&plan.id), plan).await
    }

    async fn remove_plan(&self, id: &str) -> Result<()> {
        if self.get_plan(id).await?.is_none() {
            return Err(Error::NotFound(format!("Plan not found: {id}")));
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(Self::plan_key(id)).await.map_err(redis_err)?;
        conn.srem::<_, _, ()>("plans:all", id)
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn all_plans(&self) -> Result<Vec<Plan>> {
        let ids = self.index_members("plans:all").await?;
        let mut plans = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(plan) = self.get_plan(&id).await? {
                plans.push(plan);
            }
        }
        plans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(plans)
    }

    async fn insert_subscription(&self, subscription: &Subscription) -> Result<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(Self::subscription_key(&subscription.id))
            .await
            .map_err(redis_err)?;
        if exists {
            return Err(Error::Conflict(format!(
                "Subscription already exists: {}",
                subscription.id
            )));
        }

        self.save_json(Self::subscription_key(&subscription.id), subscription)
            .await?;
        self.index_add("subscriptions:all", &subscription.id).await?;
        info!("Stored subscription: {}", subscription.id);
        Ok(())
    }

    async fn get_subscription(&self, id: &str) -> Result<Option<Subscription>> {
        self.load_json(Self::subscription_key(id)).await
    }

    async fn update_subscription(&self, subscription: &Subscription) -> Result<()> {
        if self.get_subscription(&subscription.id).await?.is_none() {
            return Err(Error::NotFound(format!(
                "Subscription not found: {}",
                subscription.id
            )));
        }
        self.save_json(Self::subscription_key(&subscription.id), subscription)
            .await
    }

    async fn all_subscriptions(&self) -> Result<Vec<Subscription>> {
        let ids = self.index_members("subscriptions:all").await?;
        let mut subscriptions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(subscription) = self.get_subscription(&id).await? {
                subscriptions.push(subscription);
            }
        }
        subscriptions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(subscriptions)
    }

    async fn insert_payment(&self, payment: &SubscriptionPayment) -> Result<()> {
        let mut conn = self.conn.clone();
        let exists: bool = conn
            .exists(Self::payment_key(&payment.id))
            .await
            .map_err(redis_err)?;
        if exists {
            return Err(Error::Conflict(format!(
                "Subscription payment already exists: {}",
                payment.id
            )));
        }

        self.save_json(Self::payment_key(&payment.id), payment).await?;
        self.index_add(
            &format!("subscription:{}:payments", payment.subscription_id),
            &payment.id,
        )
        .await?;
        self.index_ledger_link(payment).await
    }

    async fn get_payment(&self, id: &str) -> Result<Option<SubscriptionPayment>> {
        self.load_json(Self::payment_key(id)).await
    }

    async fn update_payment(&self, payment: &SubscriptionPayment) -> Result<()> {
        if self.get_payment(&payment.id).await?.is_none() {
            return Err(Error::NotFound(format!(
                "Subscription payment not found: {}",
                payment.id
            )));
        }
        self.save_json(Self::payment_key(&payment.id), payment).await?;
        self.index_ledger_link(payment).await
    }

    async fn payments_for_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<Vec<SubscriptionPayment>> {
        let ids = self
            .index_members(&format!("subscription:{subscription_id}:payments"))
            .await?;

        let mut payments = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(payment) = self.get_payment(&id).await? {
                payments.push(payment);
            }
        }
        payments.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        Ok(payments)
    }

    async fn payment_by_ledger_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<SubscriptionPayment>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn
            .get(Self::ledger_index_key(payment_id))
            .await
            .map_err(redis_err)?;

        match id {
            Some(id) => self.get_payment(&id).await,
            None => Ok(None),
        }
    }
}
