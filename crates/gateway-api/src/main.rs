//! DhanSetu Gateway Service
//!
//! Main entry point: loads configuration, wires storage, chain gateways,
//! the payment ledger, and the subscription engine, then serves the REST
//! API with the background sweep scheduler running.

use anyhow::{Context, Result};
use chain_gateway::ChainRouter;
use gateway_api::config::{Config, StorageBackend};
use gateway_api::{create_router, AppState};
use payment_ledger::{
    LedgerConfig, LedgerStore, MemoryLedgerStore, PaymentLedger, RedisLedgerStore,
};
use std::sync::Arc;
use std::time::Duration;
use subscription_engine::{
    BillingStore, EngineConfig, MemoryBillingStore, PaymentPort, RedisBillingStore, Scheduler,
    SchedulerConfig, SubscriptionEngine,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use webhook_dispatcher::{HttpDispatcher, Notifier};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,gateway_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting DhanSetu Gateway");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    info!("Configuration loaded");
    info!("  API address: {}", config.api_address());
    info!("  Storage: {:?}", config.storage_backend);
    info!("  Mock chains: {}", config.mock_chains);
    info!("  Livemode: {}", config.livemode);

    // Chain gateways, selected once per chain family
    let chains = if config.mock_chains {
        let (router, _) = ChainRouter::mock();
        router
    } else {
        ChainRouter::from_configs(
            config.chain_configs(),
            Duration::from_secs(config.rpc_timeout_secs),
        )
        .context("Failed to configure chain gateways")?
    };
    let chains = Arc::new(chains);
    info!("Configured chains: {:?}", chains.chain_keys());

    // Storage
    let (ledger_store, billing_store): (Arc<dyn LedgerStore>, Arc<dyn BillingStore>) =
        match config.storage_backend {
            StorageBackend::Memory => (
                Arc::new(MemoryLedgerStore::new()),
                Arc::new(MemoryBillingStore::new()),
            ),
            StorageBackend::Redis => (
                Arc::new(
                    RedisLedgerStore::new(&config.redis_url)
                        .await
                        .context("Failed to connect ledger storage")?,
                ),
                Arc::new(
                    RedisBillingStore::new(&config.redis_url)
                        .await
                        .context("Failed to connect billing storage")?,
                ),
            ),
        };

    // Webhook dispatcher
    let notifier: Arc<dyn Notifier> = Arc::new(
        HttpDispatcher::new(config.webhook_secret.clone())
            .context("Failed to build webhook dispatcher")?,
    );

    // Payment ledger
    let ledger = Arc::new(PaymentLedger::new(
        ledger_store,
        Arc::clone(&chains),
        Arc::clone(&notifier),
        LedgerConfig {
            base_url: config.base_url.clone(),
            receiving_addresses: config.receiving_addresses.clone(),
            fee_rate: config.fee_rate,
            expiry: chrono::Duration::hours(config.payment_expiry_hours),
            webhook_url: config.webhook_url.clone(),
            livemode: config.livemode,
        },
    ));

    // Subscription engine, charging through the ledger
    let engine = Arc::new(SubscriptionEngine::new(
        billing_store,
        Arc::clone(&ledger) as Arc<dyn PaymentPort>,
        Arc::clone(&notifier),
        EngineConfig {
            webhook_url: config.webhook_url.clone(),
            livemode: config.livemode,
            ..EngineConfig::default()
        },
    ));

    // Background sweeps
    let scheduler = Scheduler::start(
        Arc::clone(&engine),
        Arc::clone(&ledger),
        SchedulerConfig {
            billing_interval: Duration::from_secs(config.billing_interval_secs),
            trial_interval: Duration::from_secs(config.trial_interval_secs),
            payment_expiry_interval: Duration::from_secs(config.payment_expiry_interval_secs),
        },
    );

    // REST API
    let app = create_router(AppState {
        ledger,
        engine,
        chains,
        notifier,
        webhook_url: config.webhook_url.clone(),
        livemode: config.livemode,
    });

    let listener = tokio::net::TcpListener::bind(&config.api_address())
        .await
        .with_context(|| format!("Failed to bind to {}", config.api_address()))?;
    info!("DhanSetu Gateway listening on {}", config.api_address());

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("API server error: {:#}", e);
        }
    });

    tokio::select! {
        _ = server => {
            error!("API server terminated unexpectedly");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    scheduler.stop().await;
    info!("Shutting down DhanSetu Gateway");

    Ok(())
}
