//! Notification Dispatcher
//!
//! Delivers HMAC-signed event payloads to merchant-configured endpoints
//! with bounded retry. Delivery is fire-and-continue: the state transition
//! that triggered an event never waits on, or rolls back for, delivery.

pub mod payload;
pub mod recording;

pub use payload::{DeliveryReceipt, EventType, WebhookPayload};
pub use recording::RecordingNotifier;

use async_trait::async_trait;
use dhansetu_common::{ids, signature, Result};
use std::time::Duration;
use tracing::{info, warn};

/// Delivery seam consumed by the ledger and the subscription engine.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, endpoint_url: &str, payload: &WebhookPayload) -> DeliveryReceipt;
}

/// HTTP dispatcher with HMAC signing and linear retry backoff.
pub struct HttpDispatcher {
    client: reqwest::Client,
    secret: String,
    max_attempts: u32,
    retry_delay: Duration,
}

/// Per-attempt delivery timeout.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(1);

impl HttpDispatcher {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .map_err(|e| {
                dhansetu_common::Error::ExternalService(format!(
                    "Failed to build webhook client: {e}"
                ))
            })?;

        Ok(Self {
            client,
            secret: secret.into(),
            max_attempts: MAX_ATTEMPTS,
            retry_delay: RETRY_DELAY,
        })
    }

    #[cfg(test)]
    fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

#[async_trait]
impl Notifier for HttpDispatcher {
    async fn deliver(&self, endpoint_url: &str, payload: &WebhookPayload) -> DeliveryReceipt {
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => {
                return DeliveryReceipt {
                    success: false,
                    status_code: None,
                    attempts: 0,
                    error: Some(format!("Failed to serialize payload: {e}")),
                }
            }
        };

        let signature = signature::sign_payload(&body, &self.secret);
        let delivery_id = ids::new_delivery_id();

        let mut last_status = None;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let result = self
                .client
                .post(endpoint_url)
                .header("Content-Type", "application/json")
                .header("X-DhanSetu-Signature", &signature)
                .header("X-DhanSetu-Event", &payload.event)
                .header("X-DhanSetu-Delivery", &delivery_id)
                .header("User-Agent", "DhanSetu-Webhook/1.0")
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    info!(
                        "Webhook {} delivered to {} (attempt {}, status {})",
                        payload.event,
                        endpoint_url,
                        attempt,
                        response.status()
                    );
                    return DeliveryReceipt {
                        success: true,
                        status_code: Some(response.status().as_u16()),
                        attempts: attempt,
                        error: None,
                    };
                }
                Ok(response) => {
                    warn!(
                        "Webhook {} to {} returned {} (attempt {})",
                        payload.event,
                        endpoint_url,
                        response.status(),
                        attempt
                    );
                    last_status = Some(response.status().as_u16());
                    last_error = Some(format!("HTTP {}", response.status()));
                }
                Err(e) => {
                    warn!(
                        "Webhook {} to {} failed (attempt {}): {}",
                        payload.event, endpoint_url, attempt, e
                    );
                    last_error = Some(e.to_string());
                }
            }

            if attempt < self.max_attempts {
                // Linear backoff: delay grows with the attempt number.
                tokio::time::sleep(self.retry_delay * attempt).await;
            }
        }

        DeliveryReceipt {
            success: false,
            status_code: last_status,
            attempts: self.max_attempts,
            error: last_error,
        }
    }
}
