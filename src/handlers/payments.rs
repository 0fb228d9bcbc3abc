//! Payment status and processor webhook endpoints.
//!
//! The status endpoint is the read side of payment confirmation: clients
//! poll it (or the checkout session) instead of talking to the gateway. The
//! card webhook is an alternative confirmation path; it verifies the
//! processor's HMAC signature before trusting anything in the payload, and
//! settles the payment through the same compare-and-set transition as the
//! synchronous path, so a webhook arriving after the charge already settled
//! is a no-op.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use hmac::{Hmac, Mac};
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter, QueryOrder};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    entities::{
        order::PaymentStatus,
        payment_attempt::{self, Entity as PaymentAttempt},
    },
    errors::ServiceError,
    AppState,
};

use super::common::success_response;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_HEADER: &str = "stripe-signature";

pub fn routes() -> Router<AppState> {
    Router::new().route("/orders/:id/payment", get(payment_status))
}

/// Webhook routes are mounted outside the authenticated API surface.
pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/webhooks/card", post(card_webhook))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentStatusResponse {
    pub order_id: Uuid,
    pub payment_status: String,
    pub payment_method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_reference: Option<String>,
    pub attempts: Vec<payment_attempt::Model>,
}

/// Fetch the payment state of an order along with its attempt history
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/payment",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Payment state", body = PaymentStatusResponse),
        (status = 404, description = "Order not found")
    ),
    tag = "payments"
)]
pub async fn payment_status(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let details = state.services.orders.get_order(id).await?;
    if details.order.user_id != user.user_id && !user.is_admin() {
        return Err(ServiceError::NotFound(format!("Order {} not found", id)));
    }

    let attempts = PaymentAttempt::find()
        .filter(payment_attempt::Column::OrderId.eq(id))
        .order_by_desc(payment_attempt::Column::CreatedAt)
        .all(&*state.db)
        .await?;

    Ok(success_response(PaymentStatusResponse {
        order_id: id,
        payment_status: details.order.payment_status,
        payment_method: details.order.payment_method,
        payment_reference: details.order.payment_reference,
        attempts,
    }))
}

#[derive(Debug, Deserialize)]
struct WebhookEvent {
    #[serde(rename = "type")]
    event_type: String,
    data: WebhookData,
}

#[derive(Debug, Deserialize)]
struct WebhookData {
    object: WebhookObject,
}

#[derive(Debug, Deserialize)]
struct WebhookObject {
    id: String,
    /// Carries the order id; set when the charge is created
    description: Option<String>,
}

/// Card processor webhook. Verifies the signature, then settles the
/// referenced order's payment.
#[instrument(skip(state, headers, body))]
pub async fn card_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ServiceError::Unauthorized("missing webhook signature".to_string()))?;

    verify_signature(signature, &body, &state.config.card.webhook_secret)?;

    let event: WebhookEvent = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::ValidationError(format!("malformed webhook payload: {}", e)))?;

    let order_id = event
        .data
        .object
        .description
        .as_deref()
        .and_then(|d| Uuid::parse_str(d).ok())
        .ok_or_else(|| {
            ServiceError::ValidationError("webhook does not reference an order".to_string())
        })?;

    match event.event_type.as_str() {
        "payment_intent.succeeded" => {
            let won = state
                .services
                .orders
                .transition_payment_status(
                    order_id,
                    PaymentStatus::Pending,
                    PaymentStatus::Completed,
                    Some(&event.data.object.id),
                )
                .await?;
            if won {
                state.services.orders.mark_confirmed(order_id).await?;
                info!(order_id = %order_id, "payment completed via webhook");
            }
        }
        "payment_intent.payment_failed" => {
            state
                .services
                .orders
                .transition_payment_status(order_id, PaymentStatus::Pending, PaymentStatus::Failed, None)
                .await?;
        }
        other => {
            warn!(event_type = %other, "ignoring unhandled webhook event");
        }
    }

    Ok(success_response(serde_json::json!({ "received": true })))
}

/// Verifies a `t=<unix>,v1=<hex hmac>` signature over `"{t}.{body}"`.
fn verify_signature(header: &str, body: &[u8], secret: &str) -> Result<(), ServiceError> {
    let mut timestamp = None;
    let mut provided = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => timestamp = Some(v),
            Some(("v1", v)) => provided = Some(v),
            _ => {}
        }
    }
    let (timestamp, provided) = match (timestamp, provided) {
        (Some(t), Some(p)) => (t, p),
        _ => {
            return Err(ServiceError::Unauthorized(
                "malformed webhook signature".to_string(),
            ))
        }
    };

    let provided = hex::decode(provided)
        .map_err(|_| ServiceError::Unauthorized("malformed webhook signature".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ServiceError::Unauthorized("webhook secret not configured".to_string()))?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| ServiceError::Unauthorized("webhook signature mismatch".to_string()))
}
