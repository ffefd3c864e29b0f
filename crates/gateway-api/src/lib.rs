//! DhanSetu gateway REST API
//!
//! Wires the payment ledger, subscription engine, and chain gateways into
//! one axum application.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `POST/GET /api/payments`, `GET /api/payments/stats`,
//!   `GET /api/payments/search`, `GET /api/payments/{id}`,
//!   `POST /api/payments/{id}/validate`
//! - `POST/GET /api/subscriptions/plans`,
//!   `GET/PATCH/DELETE /api/subscriptions/plans/{id}`
//! - `POST/GET /api/subscriptions`, `GET /api/subscriptions/stats`,
//!   `GET/DELETE /api/subscriptions/{id}`,
//!   `POST /api/subscriptions/{id}/pause|resume`,
//!   `GET /api/subscriptions/{id}/payments`
//! - `GET /api/chains`, `GET /api/chains/{chain}/balance`,
//!   `GET /api/chains/{chain}/gas`,
//!   `POST /api/chains/{chain}/validate-address`
//! - `POST /api/webhooks/test`

pub mod config;
pub mod handlers;

use axum::routing::{get, post};
use axum::Router;
use chain_gateway::ChainRouter;
use payment_ledger::PaymentLedger;
use std::sync::Arc;
use subscription_engine::SubscriptionEngine;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use webhook_dispatcher::Notifier;

/// Application state shared across handlers
pub struct AppState {
    pub ledger: Arc<PaymentLedger>,
    pub engine: Arc<SubscriptionEngine>,
    pub chains: Arc<ChainRouter>,
    pub notifier: Arc<dyn Notifier>,
    pub webhook_url: Option<String>,
    pub livemode: bool,
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    let state = Arc::new(state);

    Router::new()
        // Health check
        .route("/health", get(handlers::health_handler))
        // Payments
        .route(
            "/api/payments",
            post(handlers::create_payment_handler).get(handlers::list_payments_handler),
        )
        .route("/api/payments/stats", get(handlers::payment_stats_handler))
        .route("/api/payments/search", get(handlers::search_payments_handler))
        .route("/api/payments/{id}", get(handlers::get_payment_handler))
        .route(
            "/api/payments/{id}/validate",
            post(handlers::validate_payment_handler),
        )
        // Plans
        .route(
            "/api/subscriptions/plans",
            post(handlers::create_plan_handler).get(handlers::list_plans_handler),
        )
        .route(
            "/api/subscriptions/plans/{id}",
            get(handlers::get_plan_handler)
                .patch(handlers::update_plan_handler)
                .delete(handlers::delete_plan_handler),
        )
        // Subscriptions
        .route(
            "/api/subscriptions",
            post(handlers::create_subscription_handler)
                .get(handlers::list_subscriptions_handler),
        )
        .route(
            "/api/subscriptions/stats",
            get(handlers::subscription_stats_handler),
        )
        .route(
            "/api/subscriptions/{id}",
            get(handlers::get_subscription_handler)
                .delete(handlers::cancel_subscription_handler),
        )
        .route(
            "/api/subscriptions/{id}/pause",
            post(handlers::pause_subscription_handler),
        )
        .route(
            "/api/subscriptions/{id}/resume",
            post(handlers::resume_subscription_handler),
        )
        .route(
            "/api/subscriptions/{id}/payments",
            get(handlers::subscription_payments_handler),
        )
        // Chains
        .route("/api/chains", get(handlers::list_chains_handler))
        .route(
            "/api/chains/{chain}/balance",
            get(handlers::chain_balance_handler),
        )
        .route("/api/chains/{chain}/gas", get(handlers::chain_gas_handler))
        .route(
            "/api/chains/{chain}/validate-address",
            post(handlers::validate_address_handler),
        )
        // Webhooks
        .route("/api/webhooks/test", post(handlers::webhook_test_handler))
        // Middleware
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
