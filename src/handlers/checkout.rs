//! Checkout session endpoints.
//!
//! The flow is: start a session, record address and payment details, apply
//! an optional coupon, submit, then watch the session status until it lands
//! on `confirmed` or `failed`. Push payments sit in `awaiting_confirmation`
//! while the server polls the gateway; the wait can be cancelled and a
//! failed payment retried without creating a second order.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::{post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    errors::ServiceError,
    services::checkout::{CheckoutSession, CouponValidation, PaymentInstrument},
    AppState,
};

use super::common::success_response;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/checkout", post(start_checkout))
        .route("/checkout/:id", axum::routing::get(get_checkout))
        .route("/checkout/:id/address", put(set_address))
        .route("/checkout/:id/payment", put(set_payment_method))
        .route(
            "/checkout/:id/coupon",
            post(apply_coupon).delete(remove_coupon),
        )
        .route("/checkout/:id/submit", post(submit_checkout))
        .route("/checkout/:id/cancel", post(cancel_wait))
        .route("/checkout/:id/retry", post(retry_payment))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct SetAddressRequest {
    pub address_id: Uuid,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ApplyCouponRequest {
    pub code: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApplyCouponResponse {
    pub session: CheckoutSession,
    pub coupon: CouponValidation,
}

/// Optional body for a payment retry; a corrected phone number replaces the
/// one recorded on the session.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RetryPaymentRequest {
    pub phone: Option<String>,
}

/// Start a checkout session for the caller's active cart
#[utoipa::path(
    post,
    path = "/api/v1/checkout",
    responses(
        (status = 201, description = "Checkout session created", body = CheckoutSession),
        (status = 400, description = "Cart is empty")
    ),
    tag = "checkout"
)]
pub async fn start_checkout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state.services.checkout.start(user.user_id).await?;
    Ok(super::common::created_response(session))
}

/// Fetch the current state of a checkout session
#[utoipa::path(
    get,
    path = "/api/v1/checkout/{id}",
    params(("id" = Uuid, Path, description = "Checkout session id")),
    responses(
        (status = 200, description = "Session state", body = CheckoutSession),
        (status = 404, description = "Session not found")
    ),
    tag = "checkout"
)]
pub async fn get_checkout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state.services.checkout.get(id, user.user_id)?;
    Ok(success_response(session))
}

/// Set the shipping address for a checkout session
#[utoipa::path(
    put,
    path = "/api/v1/checkout/{id}/address",
    params(("id" = Uuid, Path, description = "Checkout session id")),
    request_body = SetAddressRequest,
    responses((status = 200, description = "Address recorded", body = CheckoutSession)),
    tag = "checkout"
)]
pub async fn set_address(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<SetAddressRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .set_address(id, user.user_id, payload.address_id)
        .await?;
    Ok(success_response(session))
}

/// Set the payment instrument for a checkout session
#[utoipa::path(
    put,
    path = "/api/v1/checkout/{id}/payment",
    params(("id" = Uuid, Path, description = "Checkout session id")),
    request_body = PaymentInstrument,
    responses(
        (status = 200, description = "Payment method recorded", body = CheckoutSession),
        (status = 400, description = "Invalid phone number or missing token")
    ),
    tag = "checkout"
)]
pub async fn set_payment_method(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(instrument): Json<PaymentInstrument>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state
        .services
        .checkout
        .set_payment_method(id, user.user_id, instrument)
        .await?;
    Ok(success_response(session))
}

/// Validate and apply a coupon code to the session
#[utoipa::path(
    post,
    path = "/api/v1/checkout/{id}/coupon",
    params(("id" = Uuid, Path, description = "Checkout session id")),
    request_body = ApplyCouponRequest,
    responses((status = 200, description = "Validation outcome", body = ApplyCouponResponse)),
    tag = "checkout"
)]
pub async fn apply_coupon(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<ApplyCouponRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let (session, coupon) = state
        .services
        .checkout
        .apply_coupon(id, user.user_id, &payload.code)
        .await?;
    Ok(success_response(ApplyCouponResponse { session, coupon }))
}

/// Remove the applied coupon from the session
#[utoipa::path(
    delete,
    path = "/api/v1/checkout/{id}/coupon",
    params(("id" = Uuid, Path, description = "Checkout session id")),
    responses((status = 200, description = "Coupon removed", body = CheckoutSession)),
    tag = "checkout"
)]
pub async fn remove_coupon(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state.services.checkout.remove_coupon(id, user.user_id).await?;
    Ok(success_response(session))
}

/// Submit the checkout: creates the order and runs the payment
#[utoipa::path(
    post,
    path = "/api/v1/checkout/{id}/submit",
    params(("id" = Uuid, Path, description = "Checkout session id")),
    responses(
        (status = 200, description = "Submitted; session reflects the payment outcome", body = CheckoutSession),
        (status = 402, description = "Payment declined"),
        (status = 422, description = "Insufficient stock")
    ),
    tag = "checkout"
)]
pub async fn submit_checkout(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state.services.checkout.submit(id, user.user_id).await?;
    Ok(success_response(session))
}

/// Stop waiting for a push payment confirmation
#[utoipa::path(
    post,
    path = "/api/v1/checkout/{id}/cancel",
    params(("id" = Uuid, Path, description = "Checkout session id")),
    responses((status = 200, description = "Wait cancelled; payment stays pending", body = CheckoutSession)),
    tag = "checkout"
)]
pub async fn cancel_wait(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let session = state.services.checkout.cancel_wait(id, user.user_id)?;
    Ok(success_response(session))
}

/// Retry payment for a failed checkout, reusing the existing order. A
/// corrected phone number may be supplied for mobile-money retries.
#[utoipa::path(
    post,
    path = "/api/v1/checkout/{id}/retry",
    params(("id" = Uuid, Path, description = "Checkout session id")),
    request_body(content = RetryPaymentRequest, description = "Optional corrected phone number"),
    responses(
        (status = 200, description = "Retry started", body = CheckoutSession),
        (status = 409, description = "Payment already settled")
    ),
    tag = "checkout"
)]
pub async fn retry_payment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    payload: Option<Json<RetryPaymentRequest>>,
) -> Result<impl IntoResponse, ServiceError> {
    let phone = payload.and_then(|Json(p)| p.phone);
    let session = state
        .services
        .checkout
        .retry_payment(id, user.user_id, phone.as_deref())
        .await?;
    Ok(success_response(session))
}
