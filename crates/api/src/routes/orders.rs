//! Order submission and saga status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{CorrelationKey, CustomerId, Money};
use contracts::addresses::SAGA_QUEUE;
use contracts::{Initiate, Message, MessageEnvelope};
use orchestrator::{Engine, InMemoryBus, OrderSaga, Transport};
use saga_store::SagaStore;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S> {
    pub engine: Engine<S>,
    pub bus: InMemoryBus,
}

// -- Request types --

#[derive(Debug, Deserialize)]
pub struct SubmitOrderRequest {
    /// Generated when absent.
    pub customer_id: Option<String>,
    pub amount_cents: i64,
    #[serde(default)]
    pub digital_only: bool,
    #[serde(default)]
    pub item_ids: Vec<Uuid>,
}

// -- Response types --

#[derive(Debug, Serialize)]
pub struct OrderAcceptedResponse {
    pub correlation_key: String,
}

#[derive(Debug, Serialize)]
pub struct OrderStatusResponse {
    pub correlation_key: String,
    pub state: String,
    pub version: i64,
    pub customer_id: Option<String>,
    pub amount_cents: i64,
    pub digital_only: bool,
    pub payment_reference: Option<String>,
    pub failure_reason: Option<String>,
    pub completed_steps: Vec<String>,
    pub compensations: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<OrderSaga> for OrderStatusResponse {
    fn from(saga: OrderSaga) -> Self {
        Self {
            correlation_key: saga.correlation_key.to_string(),
            state: saga.state.to_string(),
            version: saga.version.as_i64(),
            customer_id: saga.customer_id.map(|c| c.to_string()),
            amount_cents: saga.amount.cents(),
            digital_only: saga.digital_only,
            payment_reference: saga.payment_reference,
            failure_reason: saga.failure_reason,
            completed_steps: saga
                .completed_steps
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
            compensations: saga
                .compensations
                .iter()
                .map(|s| s.as_str().to_string())
                .collect(),
            updated_at: saga.updated_at,
        }
    }
}

// -- Handlers --

/// POST /orders: starts a new order saga.
///
/// The order is only queued here. Its outcome is observed through
/// `GET /orders/{key}`.
#[tracing::instrument(skip(state, req))]
pub async fn submit<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<SubmitOrderRequest>,
) -> Result<(StatusCode, Json<OrderAcceptedResponse>), ApiError> {
    if req.amount_cents <= 0 {
        return Err(ApiError::BadRequest(
            "amount_cents must be positive".to_string(),
        ));
    }

    let customer_id = match req.customer_id.as_deref() {
        Some(raw) => CustomerId::from_uuid(
            Uuid::parse_str(raw)
                .map_err(|e| ApiError::BadRequest(format!("Invalid customer_id: {e}")))?,
        ),
        None => CustomerId::new(),
    };

    let correlation_key = CorrelationKey::new();
    let initiate = Initiate::new(
        correlation_key,
        customer_id,
        Money::from_cents(req.amount_cents),
        req.digital_only,
    )
    .with_items(req.item_ids);

    let envelope = MessageEnvelope::builder(Message::Initiate(initiate))
        .header("source", "api")
        .build();
    state.bus.send(SAGA_QUEUE, &envelope).await?;

    metrics::counter!("api_orders_submitted_total").increment(1);
    tracing::info!(%correlation_key, amount_cents = req.amount_cents, "order submitted");

    Ok((
        StatusCode::ACCEPTED,
        Json(OrderAcceptedResponse {
            correlation_key: correlation_key.to_string(),
        }),
    ))
}

/// GET /orders/{key}: current saga status.
#[tracing::instrument(skip(state))]
pub async fn status<S: SagaStore + Clone + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(key): Path<String>,
) -> Result<Json<OrderStatusResponse>, ApiError> {
    let correlation_key = parse_correlation_key(&key)?;
    let saga = state
        .engine
        .load(correlation_key)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {key} not found")))?;

    Ok(Json(saga.into()))
}

fn parse_correlation_key(raw: &str) -> Result<CorrelationKey, ApiError> {
    raw.parse()
        .map_err(|e| ApiError::BadRequest(format!("Invalid correlation key: {e}")))
}
