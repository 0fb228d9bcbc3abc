mod common;

use common::TestCtx;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use dukani_api::{
    entities::{
        cart::{self, CartStatus},
        cart_item,
        order::{self, Entity as Order, PaymentStatus},
        payment_attempt::{self, Entity as PaymentAttempt},
        product::Entity as Product,
    },
    services::{
        checkout::{CheckoutService, CheckoutState, PaymentInstrument},
        payments::{SandboxCardGateway, SandboxPushGateway},
    },
    ServiceError,
};

async fn wait_for_state(
    svc: &CheckoutService,
    session_id: Uuid,
    user_id: Uuid,
    expected: CheckoutState,
) -> dukani_api::services::checkout::CheckoutSession {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let session = svc.get(session_id, user_id).expect("session");
        if session.state == expected {
            return session;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "session never reached {:?}; stuck in {:?} ({:?})",
                expected, session.state, session.failure_reason
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Runs a checkout up to the reviewing state and returns the session id.
async fn checkout_to_review(
    ctx: &TestCtx,
    svc: &CheckoutService,
    user_id: Uuid,
    instrument: PaymentInstrument,
) -> Uuid {
    let product = ctx
        .seed_product("Safari Boots", &format!("SKU-{}", Uuid::new_v4()), dec!(1899.00), 5)
        .await;
    let address = ctx.seed_address(user_id).await;
    let cart = ctx.carts.get_or_create_cart(user_id).await.unwrap();
    ctx.carts.add_item(cart.id, product.id, 1).await.unwrap();

    let session = svc.start(user_id).await.unwrap();
    svc.set_address(session.id, user_id, address.id).await.unwrap();
    svc.set_payment_method(session.id, user_id, instrument)
        .await
        .unwrap();
    session.id
}

#[tokio::test]
async fn card_checkout_confirms_synchronously() {
    let ctx = TestCtx::new().await;
    let svc = ctx.checkout_service(
        Arc::new(SandboxPushGateway::default()),
        Arc::new(SandboxCardGateway::default()),
        10,
    );
    let user_id = Uuid::new_v4();

    let session_id = checkout_to_review(
        &ctx,
        &svc,
        user_id,
        PaymentInstrument::Card {
            payment_token: "tok_visa".to_string(),
        },
    )
    .await;

    let session = svc.submit(session_id, user_id).await.unwrap();
    assert_eq!(session.state, CheckoutState::Confirmed);

    let totals = session.totals.unwrap();
    assert_eq!(totals.subtotal, dec!(1899.00));
    assert_eq!(totals.shipping, dec!(500));
    assert_eq!(totals.tax, dec!(303.84));
    assert_eq!(totals.total, dec!(2702.84));

    let order = Order::find_by_id(session.order_id.unwrap())
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.payment_status, "completed");
    assert_eq!(order.status, "confirmed");
    assert_eq!(order.total, dec!(2702.84));
    assert!(order
        .payment_reference
        .as_deref()
        .unwrap()
        .starts_with("sandbox-pi-"));

    // Stock was decremented and the cart converted
    let product = Product::find()
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(product.stock_quantity, 4);

    let cart = cart::Entity::find_by_id(session.cart_id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cart.status, CartStatus::Converted);
    let remaining = cart_item::Entity::find()
        .filter(cart_item::Column::CartId.eq(session.cart_id))
        .count(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(remaining, 0);

    let attempts = PaymentAttempt::find()
        .filter(payment_attempt::Column::OrderId.eq(order.id))
        .all(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, "paid");
}

#[tokio::test]
async fn push_checkout_confirms_after_polling() {
    let ctx = TestCtx::new().await;
    let gateway = Arc::new(SandboxPushGateway::new(3));
    let svc = ctx.checkout_service(
        gateway.clone(),
        Arc::new(SandboxCardGateway::default()),
        10,
    );
    let user_id = Uuid::new_v4();

    let session_id = checkout_to_review(
        &ctx,
        &svc,
        user_id,
        PaymentInstrument::Mpesa {
            phone: "0712345678".to_string(),
        },
    )
    .await;

    let session = svc.submit(session_id, user_id).await.unwrap();
    assert_eq!(session.state, CheckoutState::AwaitingConfirmation);
    assert!(session.checkout_request_id.is_some());

    // While the watcher polls, the payment is still pending
    let order_id = session.order_id.unwrap();
    let order = Order::find_by_id(order_id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.payment_status, "pending");

    let session = wait_for_state(&svc, session_id, user_id, CheckoutState::Confirmed).await;
    let order = Order::find_by_id(session.order_id.unwrap())
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.payment_status, "completed");
    assert_eq!(order.status, "confirmed");
    assert_eq!(
        order.payment_reference,
        session.checkout_request_id
    );

    // Exactly three polls were issued, and none after confirmation
    let checkout_request_id = session.checkout_request_id.unwrap();
    assert_eq!(gateway.polls(&checkout_request_id), 3);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(gateway.polls(&checkout_request_id), 3);
}

#[tokio::test]
async fn cancelling_the_wait_leaves_payment_pending() {
    let ctx = TestCtx::new().await;
    // Gateway that never reports paid within this test
    let svc = ctx.checkout_service(
        Arc::new(SandboxPushGateway::new(1_000_000)),
        Arc::new(SandboxCardGateway::default()),
        1_000_000,
    );
    let user_id = Uuid::new_v4();

    let session_id = checkout_to_review(
        &ctx,
        &svc,
        user_id,
        PaymentInstrument::Mpesa {
            phone: "+254 712 345 678".to_string(),
        },
    )
    .await;

    let session = svc.submit(session_id, user_id).await.unwrap();
    assert_eq!(session.state, CheckoutState::AwaitingConfirmation);

    let session = svc.cancel_wait(session_id, user_id).unwrap();
    assert_eq!(session.state, CheckoutState::Failed);

    // The payment was never settled either way
    tokio::time::sleep(Duration::from_millis(50)).await;
    let order = Order::find_by_id(session.order_id.unwrap())
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.payment_status, "pending");

    // Cart survives an unconfirmed payment
    let cart = cart::Entity::find_by_id(session.cart_id)
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cart.status, CartStatus::Active);
}

#[tokio::test]
async fn confirmation_timeout_fails_the_payment() {
    let ctx = TestCtx::new().await;
    let svc = ctx.checkout_service(
        Arc::new(SandboxPushGateway::new(1_000_000)),
        Arc::new(SandboxCardGateway::default()),
        2,
    );
    let user_id = Uuid::new_v4();

    let session_id = checkout_to_review(
        &ctx,
        &svc,
        user_id,
        PaymentInstrument::Mpesa {
            phone: "0712345678".to_string(),
        },
    )
    .await;

    svc.submit(session_id, user_id).await.unwrap();
    let session = wait_for_state(&svc, session_id, user_id, CheckoutState::Failed).await;

    let order = Order::find_by_id(session.order_id.unwrap())
        .one(&*ctx.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.payment_status, "failed");

    let attempts = PaymentAttempt::find()
        .filter(payment_attempt::Column::OrderId.eq(order.id))
        .all(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status, "timed_out");
}

#[tokio::test]
async fn retry_reuses_the_order_instead_of_creating_another() {
    let ctx = TestCtx::new().await;
    let svc = ctx.checkout_service(
        Arc::new(SandboxPushGateway::default()),
        Arc::new(SandboxCardGateway::new(true)),
        10,
    );
    let user_id = Uuid::new_v4();

    let session_id = checkout_to_review(
        &ctx,
        &svc,
        user_id,
        PaymentInstrument::Card {
            payment_token: "tok_declined".to_string(),
        },
    )
    .await;

    let session = svc.submit(session_id, user_id).await.unwrap();
    assert_eq!(session.state, CheckoutState::Failed);
    let order_id = session.order_id.unwrap();

    let order = Order::find_by_id(order_id).one(&*ctx.db).await.unwrap().unwrap();
    assert_eq!(order.payment_status, "failed");

    let session = svc.retry_payment(session_id, user_id, None).await.unwrap();
    assert_eq!(session.state, CheckoutState::Failed);
    assert_eq!(session.order_id, Some(order_id));

    // Still exactly one order, with one attempt per try
    let order_count = Order::find()
        .filter(order::Column::UserId.eq(user_id))
        .count(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(order_count, 1);

    let attempts = PaymentAttempt::find()
        .filter(payment_attempt::Column::OrderId.eq(order_id))
        .count(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(attempts, 2);
}

#[tokio::test]
async fn submitting_with_insufficient_stock_rejects_the_order() {
    let ctx = TestCtx::new().await;
    let svc = ctx.checkout_service(
        Arc::new(SandboxPushGateway::default()),
        Arc::new(SandboxCardGateway::default()),
        10,
    );
    let user_id = Uuid::new_v4();
    let rival = Uuid::new_v4();

    let product = ctx
        .seed_product("Last One", "SKU-LAST", dec!(250.00), 1)
        .await;
    let address = ctx.seed_address(user_id).await;

    let cart = ctx.carts.get_or_create_cart(user_id).await.unwrap();
    ctx.carts.add_item(cart.id, product.id, 1).await.unwrap();

    let session = svc.start(user_id).await.unwrap();
    svc.set_address(session.id, user_id, address.id).await.unwrap();
    svc.set_payment_method(
        session.id,
        user_id,
        PaymentInstrument::Card {
            payment_token: "tok_visa".to_string(),
        },
    )
    .await
    .unwrap();

    // A rival buys the last unit before submission
    let rival_address = ctx.seed_address(rival).await;
    let rival_cart = ctx.carts.get_or_create_cart(rival).await.unwrap();
    ctx.carts.add_item(rival_cart.id, product.id, 1).await.unwrap();
    let rival_session = svc.start(rival).await.unwrap();
    svc.set_address(rival_session.id, rival, rival_address.id)
        .await
        .unwrap();
    svc.set_payment_method(
        rival_session.id,
        rival,
        PaymentInstrument::Card {
            payment_token: "tok_visa".to_string(),
        },
    )
    .await
    .unwrap();
    svc.submit(rival_session.id, rival).await.unwrap();

    let err = svc.submit(session.id, user_id).await.unwrap_err();
    assert!(matches!(
        err,
        dukani_api::ServiceError::InsufficientStock(_)
    ));

    // No order row was left behind for the losing checkout
    let orders = Order::find()
        .filter(order::Column::UserId.eq(user_id))
        .count(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(orders, 0);

    // The session returns to review with the error surfaced, so the
    // customer can adjust the cart and submit again
    let session = svc.get(session.id, user_id).unwrap();
    assert_eq!(session.state, CheckoutState::Reviewing);
    assert!(session.failure_reason.is_some());
}

#[tokio::test]
async fn retry_accepts_a_corrected_phone_number() {
    let ctx = TestCtx::new().await;
    // Gateway that never reports paid; the first attempt times out
    let svc = ctx.checkout_service(
        Arc::new(SandboxPushGateway::new(1_000_000)),
        Arc::new(SandboxCardGateway::default()),
        1,
    );
    let user_id = Uuid::new_v4();

    let session_id = checkout_to_review(
        &ctx,
        &svc,
        user_id,
        PaymentInstrument::Mpesa {
            phone: "0712345678".to_string(),
        },
    )
    .await;

    svc.submit(session_id, user_id).await.unwrap();
    let session = wait_for_state(&svc, session_id, user_id, CheckoutState::Failed).await;
    let order_id = session.order_id.unwrap();

    // A bogus correction is rejected before anything is re-initiated
    let err = svc
        .retry_payment(session_id, user_id, Some("12345"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::InvalidPhone(_)));
    assert_eq!(
        svc.get(session_id, user_id).unwrap().state,
        CheckoutState::Failed
    );

    let retried = svc
        .retry_payment(session_id, user_id, Some("0110000001"))
        .await
        .unwrap();
    assert_eq!(retried.msisdn.as_deref(), Some("254110000001"));
    assert_eq!(retried.order_id, Some(order_id));

    let attempts = PaymentAttempt::find()
        .filter(payment_attempt::Column::OrderId.eq(order_id))
        .all(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 2);
    assert!(attempts
        .iter()
        .any(|a| a.msisdn.as_deref() == Some("254110000001")));
}

#[tokio::test]
async fn retry_is_rejected_once_the_payment_settled() {
    let ctx = TestCtx::new().await;
    let svc = ctx.checkout_service(
        Arc::new(SandboxPushGateway::new(1_000_000)),
        Arc::new(SandboxCardGateway::default()),
        1_000_000,
    );
    let user_id = Uuid::new_v4();

    let session_id = checkout_to_review(
        &ctx,
        &svc,
        user_id,
        PaymentInstrument::Mpesa {
            phone: "0712345678".to_string(),
        },
    )
    .await;

    svc.submit(session_id, user_id).await.unwrap();
    svc.cancel_wait(session_id, user_id).unwrap();
    let order_id = svc.get(session_id, user_id).unwrap().order_id.unwrap();

    // The customer approves the prompt after the wait was cancelled
    let settled = ctx
        .orders
        .transition_payment_status(
            order_id,
            PaymentStatus::Pending,
            PaymentStatus::Completed,
            Some("MPESA-REF-1"),
        )
        .await
        .unwrap();
    assert!(settled);

    let err = svc.retry_payment(session_id, user_id, None).await.unwrap_err();
    assert!(matches!(err, ServiceError::Conflict(_)));

    // The settled payment was not charged again
    let attempts = PaymentAttempt::find()
        .filter(payment_attempt::Column::OrderId.eq(order_id))
        .count(&*ctx.db)
        .await
        .unwrap();
    assert_eq!(attempts, 1);
}
