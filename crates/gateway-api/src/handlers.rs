//! HTTP handlers for the gateway REST surface

use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use dhansetu_common::Error;
use payment_ledger::{NewPayment, Payment, PaymentFilter};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use subscription_engine::{NewPlan, NewSubscription, PlanChanges, Subscription};
use tracing::warn;
use webhook_dispatcher::{EventType, WebhookPayload};

/// Error wrapper mapping the shared taxonomy onto HTTP statuses.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::UnsupportedChain(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::ExternalService(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            warn!("Internal error: {}", self.0);
        }

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ----- Health -----

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "dhansetu-gateway",
        "chains": state.chains.chain_keys(),
    }))
}

// ----- Payments -----

pub async fn create_payment_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewPayment>,
) -> ApiResult<(StatusCode, Json<Payment>)> {
    let payment = state.ledger.create_payment(request).await?;
    Ok((StatusCode::CREATED, Json(payment)))
}

#[derive(Debug, Deserialize)]
pub struct ListPaymentsQuery {
    #[serde(default)]
    status: Option<payment_ledger::PaymentStatus>,
    #[serde(default)]
    chain: Option<String>,
    #[serde(default)]
    merchant_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_limit() -> usize {
    50
}

pub async fn list_payments_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListPaymentsQuery>,
) -> ApiResult<Json<Vec<Payment>>> {
    let filter = PaymentFilter {
        status: query.status,
        chain: query.chain,
        merchant_id: query.merchant_id,
    };
    let payments = state
        .ledger
        .list_payments(&filter, query.limit, query.offset)
        .await?;
    Ok(Json(payments))
}

pub async fn payment_stats_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<payment_ledger::PaymentStats>> {
    Ok(Json(state.ledger.stats().await?))
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    q: String,
}

pub async fn search_payments_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Vec<Payment>>> {
    Ok(Json(state.ledger.search_payments(&query.q).await?))
}

pub async fn get_payment_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Payment>> {
    Ok(Json(state.ledger.get_payment(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct ValidatePaymentRequest {
    pub transaction_hash: String,
}

/// Validate a payment against the chain. When the payment settles a
/// subscription charge, the settlement is recorded on the subscription
/// side too.
pub async fn validate_payment_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<ValidatePaymentRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let valid = state
        .ledger
        .validate_payment(&id, &request.transaction_hash)
        .await?;

    if valid {
        // No-op for standalone payments
        if let Err(e) = state
            .engine
            .record_settlement(&id, &request.transaction_hash)
            .await
        {
            warn!("Recording settlement for payment {} failed: {}", id, e);
        }
    }

    let payment = state.ledger.get_payment(&id).await?;
    Ok(Json(json!({ "valid": valid, "payment": payment })))
}

// ----- Plans -----

pub async fn create_plan_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewPlan>,
) -> ApiResult<(StatusCode, Json<subscription_engine::Plan>)> {
    let plan = state.engine.create_plan(request).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn list_plans_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<subscription_engine::Plan>>> {
    Ok(Json(state.engine.list_plans().await?))
}

pub async fn get_plan_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<subscription_engine::Plan>> {
    Ok(Json(state.engine.get_plan(&id).await?))
}

pub async fn update_plan_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(changes): Json<PlanChanges>,
) -> ApiResult<Json<subscription_engine::Plan>> {
    Ok(Json(state.engine.update_plan(&id, changes).await?))
}

pub async fn delete_plan_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete_plan(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ----- Subscriptions -----

pub async fn create_subscription_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<NewSubscription>,
) -> ApiResult<(StatusCode, Json<Subscription>)> {
    let subscription = state.engine.subscribe(request).await?;
    Ok((StatusCode::CREATED, Json(subscription)))
}

pub async fn list_subscriptions_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<Subscription>>> {
    Ok(Json(state.engine.list_subscriptions().await?))
}

pub async fn subscription_stats_handler(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<subscription_engine::SubscriptionStats>> {
    Ok(Json(state.engine.stats().await?))
}

pub async fn get_subscription_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.engine.get_subscription(&id).await?))
}

#[derive(Debug, Deserialize)]
pub struct CancelQuery {
    #[serde(default)]
    at_period_end: bool,
}

pub async fn cancel_subscription_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> ApiResult<Json<Subscription>> {
    Ok(Json(state.engine.cancel(&id, query.at_period_end).await?))
}

pub async fn pause_subscription_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Subscription>> {
    match state.engine.pause(&id).await? {
        Some(subscription) => Ok(Json(subscription)),
        // Not pausable from its current status; report the unchanged record
        None => Ok(Json(state.engine.get_subscription(&id).await?)),
    }
}

pub async fn resume_subscription_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Subscription>> {
    match state.engine.resume(&id).await? {
        Some(subscription) => Ok(Json(subscription)),
        None => Ok(Json(state.engine.get_subscription(&id).await?)),
    }
}

pub async fn subscription_payments_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<subscription_engine::SubscriptionPayment>>> {
    Ok(Json(state.engine.subscription_payments(&id).await?))
}

// ----- Chains -----

pub async fn list_chains_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let chains: Vec<_> = state
        .chains
        .chain_keys()
        .into_iter()
        .filter_map(|key| dhansetu_common::chain_config(&key))
        .collect();
    Json(json!({ "chains": chains }))
}

#[derive(Debug, Deserialize)]
pub struct BalanceQuery {
    address: String,
    #[serde(default)]
    token: Option<String>,
}

pub async fn chain_balance_handler(
    State(state): State<Arc<AppState>>,
    Path(chain): Path<String>,
    Query(query): Query<BalanceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let gateway = state.chains.for_chain(&chain)?;
    let balance = gateway
        .balance(&query.address, query.token.as_deref())
        .await?;
    Ok(Json(json!({
        "chain": chain,
        "address": query.address,
        "token": query.token,
        "balance": balance,
    })))
}

#[derive(Debug, Deserialize)]
pub struct GasQuery {
    to: String,
    #[serde(default)]
    value: Option<Decimal>,
    #[serde(default)]
    data: Option<String>,
}

pub async fn chain_gas_handler(
    State(state): State<Arc<AppState>>,
    Path(chain): Path<String>,
    Query(query): Query<GasQuery>,
) -> ApiResult<Json<chain_gateway::FeeEstimate>> {
    let gateway = state.chains.for_chain(&chain)?;
    let estimate = gateway
        .estimate_fee(
            &query.to,
            query.value.unwrap_or(Decimal::ZERO),
            query.data.as_deref(),
        )
        .await?;
    Ok(Json(estimate))
}

#[derive(Debug, Deserialize)]
pub struct ValidateAddressRequest {
    pub address: String,
}

pub async fn validate_address_handler(
    State(state): State<Arc<AppState>>,
    Path(chain): Path<String>,
    Json(request): Json<ValidateAddressRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let gateway = state.chains.for_chain(&chain)?;
    Ok(Json(json!({
        "chain": chain,
        "address": request.address,
        "valid": gateway.validate_address(&request.address),
    })))
}

// ----- Webhooks -----

#[derive(Debug, Deserialize)]
pub struct WebhookTestRequest {
    /// Overrides the configured endpoint
    #[serde(default)]
    pub url: Option<String>,
}

pub async fn webhook_test_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<WebhookTestRequest>,
) -> ApiResult<Json<webhook_dispatcher::DeliveryReceipt>> {
    let endpoint = request
        .url
        .or_else(|| state.webhook_url.clone())
        .ok_or_else(|| Error::Validation("No webhook URL configured or provided".to_string()))?;

    let payload = WebhookPayload::new(
        EventType::WebhookTest,
        "evt_test",
        json!({ "message": "DhanSetu webhook test" }),
        state.livemode,
    );

    let receipt = state.notifier.deliver(&endpoint, &payload).await;
    Ok(Json(receipt))
}
