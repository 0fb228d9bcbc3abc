use axum::{
    extract::{Path, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, ModelTrait, QueryFilter, QueryOrder, Set,
};
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    auth::AuthenticatedUser,
    entities::address::{self, Entity as Address},
    errors::ServiceError,
    AppState,
};

use super::common::{created_response, no_content_response, success_response, validate_input};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/addresses", get(list_addresses).post(create_address))
        .route("/addresses/:id", axum::routing::delete(delete_address))
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateAddressRequest {
    #[validate(length(min = 1, max = 100))]
    pub first_name: String,
    #[validate(length(min = 1, max = 100))]
    pub last_name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 7, max = 20))]
    pub phone: String,
    #[validate(length(min = 1, max = 255))]
    pub address_line_1: String,
    pub address_line_2: Option<String>,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 100))]
    pub state: String,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    #[validate(length(equal = 2))]
    pub country_code: String,
    #[serde(default)]
    pub is_default: bool,
}

/// List the caller's saved addresses
#[utoipa::path(
    get,
    path = "/api/v1/addresses",
    responses((status = 200, description = "Saved addresses")),
    tag = "addresses"
)]
pub async fn list_addresses(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<impl IntoResponse, ServiceError> {
    let addresses = Address::find()
        .filter(address::Column::UserId.eq(user.user_id))
        .order_by_desc(address::Column::IsDefault)
        .order_by_desc(address::Column::CreatedAt)
        .all(&*state.db)
        .await?;
    Ok(success_response(addresses))
}

/// Save a new shipping address
#[utoipa::path(
    post,
    path = "/api/v1/addresses",
    request_body = CreateAddressRequest,
    responses(
        (status = 201, description = "Address created"),
        (status = 422, description = "Validation failed")
    ),
    tag = "addresses"
)]
pub async fn create_address(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(payload): Json<CreateAddressRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    validate_input(&payload)?;
    let now = Utc::now();
    let created = address::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user.user_id),
        first_name: Set(payload.first_name),
        last_name: Set(payload.last_name),
        email: Set(payload.email),
        phone: Set(payload.phone),
        address_line_1: Set(payload.address_line_1),
        address_line_2: Set(payload.address_line_2),
        city: Set(payload.city),
        state: Set(payload.state),
        postal_code: Set(payload.postal_code),
        country_code: Set(payload.country_code.to_uppercase()),
        is_default: Set(payload.is_default),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&*state.db)
    .await?;
    Ok(created_response(created))
}

/// Delete one of the caller's addresses
#[utoipa::path(
    delete,
    path = "/api/v1/addresses/{id}",
    params(("id" = Uuid, Path, description = "Address id")),
    responses(
        (status = 204, description = "Address deleted"),
        (status = 404, description = "Address not found")
    ),
    tag = "addresses"
)]
pub async fn delete_address(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ServiceError> {
    let found = Address::find_by_id(id)
        .filter(address::Column::UserId.eq(user.user_id))
        .one(&*state.db)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Address {} not found", id)))?;
    found.delete(&*state.db).await?;
    Ok(no_content_response())
}
