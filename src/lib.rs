//! Dukani API Library
//!
//! Checkout, order and payment backend for the Dukani storefront.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod openapi;
pub mod services;

use axum::{
    extract::State,
    http::{HeaderName, HeaderValue},
    response::Json,
    routing::get,
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

pub use crate::errors::ServiceError;
pub use crate::handlers::common::{PaginatedResponse, PaginationParams};

use crate::{
    cache::ResponseCache,
    config::AppConfig,
    events::EventSender,
    services::{
        carts::CartService,
        checkout::CheckoutService,
        coupons::CouponService,
        orders::OrderService,
        payments::{CardPaymentGateway, PushPaymentGateway},
    },
};

const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Service instances shared across handlers
#[derive(Clone)]
pub struct AppServices {
    pub orders: Arc<OrderService>,
    pub carts: Arc<CartService>,
    pub coupons: Arc<CouponService>,
    pub checkout: CheckoutService,
}

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub services: AppServices,
    pub event_sender: EventSender,
    pub cache: ResponseCache,
}

impl AppState {
    /// Wires up the service graph on top of a connected database and the
    /// configured payment gateways.
    pub fn build(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        event_sender: EventSender,
        push_gateway: Arc<dyn PushPaymentGateway>,
        card_gateway: Arc<dyn CardPaymentGateway>,
    ) -> Self {
        let cache = ResponseCache::new(Duration::from_secs(config.cache.default_ttl_secs));
        let coupons = Arc::new(CouponService::new(db.clone()));
        let carts = Arc::new(CartService::new(db.clone()));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            event_sender.clone(),
            cache.clone(),
            coupons.clone(),
        ));
        let checkout = CheckoutService::new(
            db.clone(),
            orders.clone(),
            carts.clone(),
            coupons.clone(),
            push_gateway,
            card_gateway,
            event_sender.clone(),
            config.currency.clone(),
            config.tax_rate,
            config.shipping_flat,
            Duration::from_secs(config.mpesa.poll_interval_secs),
            config.mpesa.max_poll_attempts,
        );

        Self {
            db,
            config,
            services: AppServices {
                orders,
                carts,
                coupons,
                checkout,
            },
            event_sender,
            cache,
        }
    }
}

/// Liveness probe
async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// Readiness probe including a database ping
async fn status_check(State(state): State<AppState>) -> Json<Value> {
    let db_ok = state.db.ping().await.is_ok();
    Json(json!({
        "status": if db_ok { "ok" } else { "degraded" },
        "database": if db_ok { "up" } else { "down" },
        "cached_entries": state.cache.len(),
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

/// All authenticated v1 endpoints
pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .merge(handlers::checkout::routes())
        .merge(handlers::orders::routes())
        .merge(handlers::payments::routes())
        .merge(handlers::carts::routes())
        .merge(handlers::coupons::routes())
        .merge(handlers::addresses::routes())
}

/// Builds the full application router with middleware applied.
pub fn app_router(state: AppState) -> Router {
    let cors = match state
        .config
        .cors_allowed_origins
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        Some(origins) => {
            let parsed = origins
                .split(',')
                .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
                .collect::<Vec<_>>();
            CorsLayer::new()
                .allow_origin(parsed)
                .allow_methods(tower_http::cors::AllowMethods::mirror_request())
                .allow_headers(tower_http::cors::AllowHeaders::mirror_request())
        }
        None => CorsLayer::permissive(),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_check))
        .nest("/api/v1", api_v1_routes())
        .merge(handlers::payments::webhook_routes())
        .merge(openapi::swagger_ui())
        .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(CompressionLayer::new())
        .layer(cors)
        .with_state(state)
}
