use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthenticatedUser,
    entities::{cart, cart_item},
    errors::ServiceError,
    AppState,
};

use super::common::{created_response, success_response, validate_input};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cart", get(get_cart))
        .route("/cart/items", post(add_item))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AddItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, max = 100))]
    pub quantity: i32,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CartResponse {
    pub cart: cart::Model,
    pub items: Vec<cart_item::Model>,
    pub subtotal: Decimal,
}

fn cart_response(cart: cart::Model, items: Vec<cart_item::Model>) -> CartResponse {
    let subtotal = items
        .iter()
        .map(|i| i.unit_price * Decimal::from(i.quantity))
        .sum();
    CartResponse {
        cart,
        items,
        subtotal,
    }
}

/// Fetch the caller's active cart, creating one if none exists
#[utoipa::path(
    get,
    path = "/api/v1/cart",
    responses((status = 200, description = "Active cart with items", body = CartResponse)),
    tag = "cart"
)]
pub async fn get_cart(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ServiceError> {
    let cart = state.services.carts.get_or_create_cart(user.user_id).await?;
    let (cart, items) = state.services.carts.get_cart_with_items(cart.id).await?;
    Ok(success_response(cart_response(cart, items)))
}

/// Add a product to the caller's cart
#[utoipa::path(
    post,
    path = "/api/v1/cart/items",
    request_body = AddItemRequest,
    responses(
        (status = 201, description = "Item added", body = CartResponse),
        (status = 422, description = "Insufficient stock")
    ),
    tag = "cart"
)]
pub async fn add_item(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<AddItemRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let cart = state.services.carts.get_or_create_cart(user.user_id).await?;
    state
        .services
        .carts
        .add_item(cart.id, payload.product_id, payload.quantity)
        .await?;
    let (cart, items) = state.services.carts.get_cart_with_items(cart.id).await?;
    Ok(created_response(cart_response(cart, items)))
}
