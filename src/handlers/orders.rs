use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use uuid::Uuid;

use crate::{
    auth::AuthenticatedUser,
    errors::ServiceError,
    services::orders::{OrderDetails, UpdateOrderInput},
    AppState,
};

use super::common::{success_response, PaginatedResponse, PaginationParams};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/:id", get(get_order).put(update_order))
}

/// List the caller's orders, newest first
#[utoipa::path(
    get,
    path = "/api/v1/orders",
    params(PaginationParams),
    responses((status = 200, description = "Page of orders")),
    tag = "orders"
)]
pub async fn list_orders(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(pagination): Query<PaginationParams>,
) -> Result<impl IntoResponse, ServiceError> {
    let page = state
        .services
        .orders
        .list_orders(user.user_id, pagination.page, pagination.per_page)
        .await?;
    Ok(success_response(PaginatedResponse::new(
        page.orders,
        page.page,
        page.per_page,
        page.total,
    )))
}

/// Fetch a single order with items and shipping address
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order detail", body = OrderDetails),
        (status = 404, description = "Order not found")
    ),
    tag = "orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let details = state.services.orders.get_order(id).await?;
    if details.order.user_id != user.user_id && !user.is_admin() {
        // Hide the order's existence from other customers
        return Err(ServiceError::NotFound(format!("Order {} not found", id)));
    }
    Ok(success_response(details))
}

/// Update an order's fulfillment fields (admin only)
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = UpdateOrderInput,
    responses(
        (status = 200, description = "Order updated"),
        (status = 400, description = "Transition not allowed"),
        (status = 403, description = "Admin role required")
    ),
    tag = "orders"
)]
pub async fn update_order(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateOrderInput>,
) -> Result<impl IntoResponse, ServiceError> {
    if !user.is_admin() {
        return Err(ServiceError::Forbidden(
            "Order updates require the admin role".to_string(),
        ));
    }
    let updated = state.services.orders.update_order(id, payload).await?;
    Ok(success_response(updated))
}
