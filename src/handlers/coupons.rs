use axum::{extract::State, response::IntoResponse, routing::post, Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::ToSchema;
use validator::Validate;

use crate::{auth::AuthenticatedUser, errors::ServiceError, AppState};

use super::common::{success_response, validate_input};

pub fn routes() -> Router<AppState> {
    Router::new().route("/coupons/validate", post(validate_coupon))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct ValidateCouponRequest {
    #[validate(length(min = 1, max = 64))]
    pub code: String,
}

/// Validate a coupon against the caller's current cart subtotal.
/// Inapplicable coupons come back as a structured answer, not an error.
#[utoipa::path(
    post,
    path = "/api/v1/coupons/validate",
    request_body = ValidateCouponRequest,
    responses((status = 200, description = "Validation outcome")),
    tag = "coupons"
)]
pub async fn validate_coupon(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<ValidateCouponRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let cart = state.services.carts.get_or_create_cart(user.user_id).await?;
    let (_, items) = state.services.carts.get_cart_with_items(cart.id).await?;
    let subtotal: Decimal = items
        .iter()
        .map(|i| i.unit_price * Decimal::from(i.quantity))
        .sum();

    let validation = state
        .services
        .coupons
        .validate(&payload.code, subtotal, user.user_id)
        .await?;
    Ok(success_response(validation))
}
