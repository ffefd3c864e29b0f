//! Webhook payload and event taxonomy
//!
//! The payload shape is part of the merchant-facing contract:
//! `{event, id, object, created, data, livemode}` with `created` in unix
//! seconds.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Every event the gateway emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    PaymentCreated,
    PaymentCompleted,
    PaymentFailed,
    PaymentExpired,
    SubscriptionCreated,
    SubscriptionPaymentDue,
    SubscriptionPaymentProcessed,
    SubscriptionPaymentFailed,
    SubscriptionCancelled,
    SubscriptionExpired,
    WebhookTest,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PaymentCreated => "payment.created",
            EventType::PaymentCompleted => "payment.completed",
            EventType::PaymentFailed => "payment.failed",
            EventType::PaymentExpired => "payment.expired",
            EventType::SubscriptionCreated => "subscription.created",
            EventType::SubscriptionPaymentDue => "subscription.payment_due",
            EventType::SubscriptionPaymentProcessed => "subscription.payment_processed",
            EventType::SubscriptionPaymentFailed => "subscription.payment_failed",
            EventType::SubscriptionCancelled => "subscription.cancelled",
            EventType::SubscriptionExpired => "subscription.expired",
            EventType::WebhookTest => "webhook.test",
        }
    }

    /// Top-level `object` discriminator for the payload.
    pub fn object(&self) -> &'static str {
        match self {
            EventType::PaymentCreated
            | EventType::PaymentCompleted
            | EventType::PaymentFailed
            | EventType::PaymentExpired => "payment",
            EventType::SubscriptionCreated
            | EventType::SubscriptionPaymentDue
            | EventType::SubscriptionPaymentProcessed
            | EventType::SubscriptionPaymentFailed
            | EventType::SubscriptionCancelled
            | EventType::SubscriptionExpired => "subscription",
            EventType::WebhookTest => "test",
        }
    }
}

/// Signed payload delivered to a merchant endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub event: String,
    pub id: String,
    pub object: String,
    /// Unix seconds
    pub created: i64,
    pub data: Value,
    pub livemode: bool,
}

impl WebhookPayload {
    pub fn new(event: EventType, id: impl Into<String>, data: Value, livemode: bool) -> Self {
        Self {
            event: event.as_str().to_string(),
            id: id.into(),
            object: event.object().to_string(),
            created: Utc::now().timestamp(),
            data,
            livemode,
        }
    }
}

/// Outcome of a delivery, after retries.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
