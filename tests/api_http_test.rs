//! End-to-end tests over the HTTP surface: routing, authentication,
//! the card checkout flow and the processor webhook.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::str::FromStr;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, EntityTrait, Set};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tower::ServiceExt;
use uuid::Uuid;

use dukani_api::{
    app_router,
    auth::issue_session_token,
    config::AppConfig,
    db,
    entities::{order::Entity as Order, product},
    events,
    services::payments::{SandboxCardGateway, SandboxPushGateway},
    AppState,
};

async fn test_state() -> (AppState, Arc<AppConfig>) {
    let mut opts = ConnectOptions::new("sqlite::memory:");
    opts.max_connections(1);
    let database = Arc::new(Database::connect(opts).await.expect("in-memory db"));
    db::setup_schema(&database).await.expect("schema");

    let mut cfg = AppConfig::for_tests("sqlite::memory:");
    cfg.card.webhook_secret = "whsec_test".to_string();
    let config = Arc::new(cfg);

    let (event_sender, mut rx) = events::channel(256);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });

    let state = AppState::build(
        database,
        config.clone(),
        event_sender,
        Arc::new(SandboxPushGateway::default()),
        Arc::new(SandboxCardGateway::default()),
    );
    (state, config)
}

async fn seed_product(state: &AppState) -> product::Model {
    let now = chrono::Utc::now();
    product::ActiveModel {
        id: Set(Uuid::new_v4()),
        name: Set("Safari Boots".to_string()),
        sku: Set("SKU-BOOTS".to_string()),
        unit_price: Set(dec!(1899.00)),
        stock_quantity: Set(5),
        is_active: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&*state.db)
    .await
    .expect("seed product")
}

/// Money fields serialize as strings whose scale depends on what the
/// database round-tripped; compare values, not representations.
fn money(value: &Value) -> Decimal {
    Decimal::from_str(value.as_str().expect("decimal string")).expect("decimal value")
}

fn bearer(config: &AppConfig, user_id: Uuid) -> String {
    let token =
        issue_session_token(user_id, "customer", &config.jwt_secret, 3600).expect("token");
    format!("Bearer {}", token)
}

async fn send_json(
    app: &axum::Router,
    method: &str,
    uri: &str,
    auth: Option<&str>,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(auth) = auth {
        builder = builder.header(header::AUTHORIZATION, auth);
    }
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn health_endpoint_is_public() {
    let (state, _) = test_state().await;
    let app = app_router(state);
    let (status, body) = send_json(&app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn api_requires_a_session() {
    let (state, _) = test_state().await;
    let app = app_router(state);
    let (status, _) = send_json(&app, "GET", "/api/v1/cart", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn card_checkout_over_http_confirms_the_order() {
    let (state, config) = test_state().await;
    let product = seed_product(&state).await;
    let app = app_router(state);
    let user_id = Uuid::new_v4();
    let auth = bearer(&config, user_id);

    // Save an address
    let (status, address) = send_json(
        &app,
        "POST",
        "/api/v1/addresses",
        Some(&auth),
        Some(json!({
            "first_name": "Wanjiku",
            "last_name": "Kamau",
            "email": "wanjiku@example.com",
            "phone": "0712345678",
            "address_line_1": "Moi Avenue 12",
            "city": "Nairobi",
            "state": "Nairobi",
            "postal_code": "00100",
            "country_code": "ke",
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{:?}", address);
    let address_id = address["id"].as_str().unwrap().to_string();

    // Fill the cart
    let (status, cart) = send_json(
        &app,
        "POST",
        "/api/v1/cart/items",
        Some(&auth),
        Some(json!({ "product_id": product.id, "quantity": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "{:?}", cart);
    assert_eq!(money(&cart["subtotal"]), dec!(1899.00));

    // Walk the checkout flow
    let (status, session) = send_json(&app, "POST", "/api/v1/checkout", Some(&auth), None).await;
    assert_eq!(status, StatusCode::CREATED, "{:?}", session);
    let session_id = session["id"].as_str().unwrap().to_string();
    assert_eq!(session["state"], "collecting_address");

    let (status, session) = send_json(
        &app,
        "PUT",
        &format!("/api/v1/checkout/{}/address", session_id),
        Some(&auth),
        Some(json!({ "address_id": address_id })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{:?}", session);
    assert_eq!(session["state"], "collecting_payment");

    let (status, session) = send_json(
        &app,
        "PUT",
        &format!("/api/v1/checkout/{}/payment", session_id),
        Some(&auth),
        Some(json!({ "method": "card", "payment_token": "tok_visa" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{:?}", session);
    assert_eq!(session["state"], "reviewing");

    let (status, session) = send_json(
        &app,
        "POST",
        &format!("/api/v1/checkout/{}/submit", session_id),
        Some(&auth),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{:?}", session);
    assert_eq!(session["state"], "confirmed");
    assert_eq!(money(&session["totals"]["total"]), dec!(2702.84));
    assert_eq!(session["sandbox"], true);
    let order_id = session["order_id"].as_str().unwrap().to_string();

    // The order is visible to its owner
    let (status, order) = send_json(
        &app,
        "GET",
        &format!("/api/v1/orders/{}", order_id),
        Some(&auth),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(order["order"]["payment_status"], "completed");
    assert_eq!(order["items"].as_array().unwrap().len(), 1);

    // ...but hidden from everyone else
    let stranger = bearer(&config, Uuid::new_v4());
    let (status, _) = send_json(
        &app,
        "GET",
        &format!("/api/v1/orders/{}", order_id),
        Some(&stranger),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

fn sign_webhook(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

#[tokio::test]
async fn webhook_rejects_bad_signatures_and_settles_good_ones() {
    let (state, _) = test_state().await;
    let orders = state.services.orders.clone();
    let database = state.db.clone();
    let product = seed_product(&state).await;
    let app = app_router(state);

    // Place a pending order directly through the services
    let user_id = Uuid::new_v4();
    let now = chrono::Utc::now();
    let address = dukani_api::entities::address::ActiveModel {
        id: Set(Uuid::new_v4()),
        user_id: Set(user_id),
        first_name: Set("Wanjiku".to_string()),
        last_name: Set("Kamau".to_string()),
        email: Set("wanjiku@example.com".to_string()),
        phone: Set("0712345678".to_string()),
        address_line_1: Set("Moi Avenue 12".to_string()),
        address_line_2: Set(None),
        city: Set("Nairobi".to_string()),
        state: Set("Nairobi".to_string()),
        postal_code: Set("00100".to_string()),
        country_code: Set("KE".to_string()),
        is_default: Set(true),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(&*database)
    .await
    .unwrap();

    let tax = (dec!(1899.00) * dec!(0.16)).round_dp(2);
    let order = orders
        .create_order(dukani_api::services::orders::CreateOrderInput {
            user_id,
            payment_method: dukani_api::entities::order::PaymentMethod::Card,
            items: vec![dukani_api::services::orders::OrderItemInput {
                product_id: product.id,
                quantity: 1,
                unit_price: dec!(1899.00),
            }],
            totals: dukani_api::services::orders::OrderTotals {
                subtotal: dec!(1899.00),
                discount: dec!(0),
                shipping: dec!(500),
                tax,
                total: dec!(1899.00) + dec!(500) + tax,
            },
            currency: "KES".to_string(),
            shipping_address_id: address.id,
            coupon_id: None,
            notes: None,
        })
        .await
        .unwrap();

    let payload = serde_json::to_vec(&json!({
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "pi_hook_1", "description": order.id } },
    }))
    .unwrap();

    // Wrong signature is rejected outright
    let bad = Request::builder()
        .method("POST")
        .uri("/webhooks/card")
        .header(header::CONTENT_TYPE, "application/json")
        .header("stripe-signature", "t=1,v1=deadbeef")
        .body(Body::from(payload.clone()))
        .unwrap();
    let response = app.clone().oneshot(bad).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Correctly signed webhook completes the payment
    let signature = sign_webhook("whsec_test", "1724740000", &payload);
    let good = Request::builder()
        .method("POST")
        .uri("/webhooks/card")
        .header(header::CONTENT_TYPE, "application/json")
        .header("stripe-signature", signature)
        .body(Body::from(payload))
        .unwrap();
    let response = app.clone().oneshot(good).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stored = Order::find_by_id(order.id)
        .one(&*database)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.payment_status, "completed");
    assert_eq!(stored.status, "confirmed");
    assert_eq!(stored.payment_reference.as_deref(), Some("pi_hook_1"));
}
