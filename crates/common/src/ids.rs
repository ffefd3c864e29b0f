//! Prefixed identifier generation
//!
//! Entity ids carry a short type prefix so logs and webhook payloads stay
//! readable ("pay_", "sub_", ...).

use uuid::Uuid;

fn prefixed(prefix: &str) -> String {
    format!("{}_{}", prefix, Uuid::new_v4().simple())
}

pub fn new_payment_id() -> String {
    prefixed("pay")
}

pub fn new_plan_id() -> String {
    prefixed("plan")
}

pub fn new_subscription_id() -> String {
    prefixed("sub")
}

pub fn new_subscription_payment_id() -> String {
    prefixed("subpay")
}

/// Unique id attached to every webhook delivery attempt batch.
pub fn new_delivery_id() -> String {
    Uuid::new_v4().to_string()
}
