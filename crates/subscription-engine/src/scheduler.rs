//! Background sweep scheduler
//!
//! Owns the periodic billing, trial expiry, and payment expiry tasks. The
//! host binary starts it after wiring and stops it on shutdown; tests call
//! the sweep methods directly instead.

use crate::service::SubscriptionEngine;
use chrono::Utc;
use payment_ledger::PaymentLedger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub billing_interval: Duration,
    pub trial_interval: Duration,
    pub payment_expiry_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            billing_interval: Duration::from_secs(3600),
            trial_interval: Duration::from_secs(86400),
            payment_expiry_interval: Duration::from_secs(3600),
        }
    }
}

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(
        engine: Arc<SubscriptionEngine>,
        ledger: Arc<PaymentLedger>,
        config: SchedulerConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut handles = Vec::new();

        {
            let engine = Arc::clone(&engine);
            let mut rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.billing_interval);
                ticker.tick().await; // immediate first tick is skipped
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = engine.run_billing_sweep(Utc::now()).await {
                                error!("Billing sweep failed: {}", e);
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
            }));
        }

        {
            let engine = Arc::clone(&engine);
            let mut rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.trial_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = engine.run_trial_expiry_sweep(Utc::now()).await {
                                error!("Trial expiry sweep failed: {}", e);
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
            }));
        }

        {
            let mut rx = shutdown.subscribe();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(config.payment_expiry_interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            if let Err(e) = ledger.expire_stale_payments().await {
                                error!("Payment expiry sweep failed: {}", e);
                            }
                        }
                        _ = rx.changed() => break,
                    }
                }
            }));
        }

        info!("Scheduler started");
        Self { shutdown, handles }
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }
}
