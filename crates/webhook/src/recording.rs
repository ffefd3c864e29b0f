//! Recording notifier test double

use crate::{DeliveryReceipt, Notifier, WebhookPayload};
use async_trait::async_trait;
use std::sync::Mutex;

/// Captures deliveries instead of sending them; always reports success.
#[derive(Default)]
pub struct RecordingNotifier {
    deliveries: Mutex<Vec<(String, WebhookPayload)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<(String, WebhookPayload)> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Events delivered so far, in order.
    pub fn events(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, p)| p.event.clone())
            .collect()
    }

    pub fn count_event(&self, event: &str) -> usize {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.event == event)
            .count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(&self, endpoint_url: &str, payload: &WebhookPayload) -> DeliveryReceipt {
        self.deliveries
            .lock()
            .unwrap()
            .push((endpoint_url.to_string(), payload.clone()));

        DeliveryReceipt {
            success: true,
            status_code: Some(200),
            attempts: 1,
            error: None,
        }
    }
}
