//! Checkout sessions.
//!
//! A session is a server-side state machine walking a cart through address
//! and payment collection, review, submission and payment confirmation.
//! Sessions live in an in-process registry keyed by id; the money-moving
//! state (order, payment status) is in the database, so a lost session never
//! loses a payment.
//!
//! Push payments are confirmed by a spawned watcher polling the gateway at a
//! fixed interval, strictly sequentially, with a bounded number of attempts.
//! The watcher races a cancellation signal; cancelling stops the wait but
//! deliberately leaves the order's payment pending, because the customer may
//! still approve the prompt on their phone.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        address::{self, Entity as Address},
        cart_item,
        order::{Entity as Order, PaymentMethod, PaymentStatus},
        payment_attempt::{self, AttemptStatus, Entity as PaymentAttempt},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        carts::CartService,
        coupons::CouponService,
        orders::{CreateOrderInput, OrderItemInput, OrderService, OrderTotals},
        payments::{
            normalize_msisdn, CardPaymentGateway, GatewayError, PushPaymentGateway,
            PushPaymentStatus,
        },
    },
};

pub use crate::services::coupons::CouponValidation;

/// Where a checkout session currently is. Transitions only move forward,
/// except that `failed` can be retried back into payment confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutState {
    CollectingAddress,
    CollectingPayment,
    Reviewing,
    Submitting,
    AwaitingConfirmation,
    Confirmed,
    Failed,
}

impl CheckoutState {
    /// Address, payment method and coupon edits are allowed up to the point
    /// the order is submitted.
    fn is_editable(self) -> bool {
        matches!(
            self,
            CheckoutState::CollectingAddress
                | CheckoutState::CollectingPayment
                | CheckoutState::Reviewing
        )
    }
}

/// Payment details collected from the customer.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PaymentInstrument {
    Mpesa { phone: String },
    Card { payment_token: String },
}

/// Coupon snapshot held on a session once validated.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AppliedCoupon {
    pub coupon_id: Uuid,
    pub code: String,
    pub discount: Decimal,
    pub free_shipping: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CheckoutSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub cart_id: Uuid,
    pub state: CheckoutState,
    pub shipping_address_id: Option<Uuid>,
    pub payment_method: Option<PaymentMethod>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msisdn: Option<String>,
    #[serde(skip)]
    pub payment_token: Option<String>,
    pub coupon: Option<AppliedCoupon>,
    pub totals: Option<OrderTotals>,
    pub order_id: Option<Uuid>,
    /// True when the selected gateway simulates the processor.
    pub sandbox: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkout_request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    orders: Arc<OrderService>,
    carts: Arc<CartService>,
    coupons: Arc<CouponService>,
    push_gateway: Arc<dyn PushPaymentGateway>,
    card_gateway: Arc<dyn CardPaymentGateway>,
    events: EventSender,
    sessions: Arc<DashMap<Uuid, CheckoutSession>>,
    cancels: Arc<DashMap<Uuid, watch::Sender<bool>>>,
    currency: String,
    tax_rate: Decimal,
    shipping_flat: Decimal,
    poll_interval: Duration,
    max_poll_attempts: u32,
}

impl CheckoutService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        orders: Arc<OrderService>,
        carts: Arc<CartService>,
        coupons: Arc<CouponService>,
        push_gateway: Arc<dyn PushPaymentGateway>,
        card_gateway: Arc<dyn CardPaymentGateway>,
        events: EventSender,
        currency: String,
        tax_rate: Decimal,
        shipping_flat: Decimal,
        poll_interval: Duration,
        max_poll_attempts: u32,
    ) -> Self {
        Self {
            db,
            orders,
            carts,
            coupons,
            push_gateway,
            card_gateway,
            events,
            sessions: Arc::new(DashMap::new()),
            cancels: Arc::new(DashMap::new()),
            currency,
            tax_rate,
            shipping_flat,
            poll_interval,
            max_poll_attempts: max_poll_attempts.max(1),
        }
    }

    /// Starts a checkout session for the user's active cart. The cart must
    /// have at least one item.
    #[instrument(skip(self))]
    pub async fn start(&self, user_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let cart = self.carts.get_or_create_cart(user_id).await?;
        let (_, items) = self.carts.get_cart_with_items(cart.id).await?;
        if items.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Cannot check out an empty cart".to_string(),
            ));
        }

        let now = Utc::now();
        let session = CheckoutSession {
            id: Uuid::new_v4(),
            user_id,
            cart_id: cart.id,
            state: CheckoutState::CollectingAddress,
            shipping_address_id: None,
            payment_method: None,
            msisdn: None,
            payment_token: None,
            coupon: None,
            totals: Some(self.compute_totals(&items, None)),
            order_id: None,
            sandbox: false,
            checkout_request_id: None,
            customer_message: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        };
        self.sessions.insert(session.id, session.clone());

        info!(session_id = %session.id, cart_id = %cart.id, "checkout started");
        self.events
            .send(Event::CheckoutStarted {
                session_id: session.id,
                cart_id: cart.id,
            })
            .await;
        Ok(session)
    }

    /// Fetches a session, enforcing ownership.
    pub fn get(&self, session_id: Uuid, user_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let session = self
            .sessions
            .get(&session_id)
            .map(|s| s.clone())
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Checkout session {} not found", session_id))
            })?;
        if session.user_id != user_id {
            return Err(ServiceError::Forbidden(
                "Checkout session belongs to another user".to_string(),
            ));
        }
        Ok(session)
    }

    /// Records the shipping address. The address must belong to the user.
    /// Moves the session forward from address collection; revisiting the
    /// address later in the flow (before submission) is allowed.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn set_address(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        address_id: Uuid,
    ) -> Result<CheckoutSession, ServiceError> {
        let session = self.get(session_id, user_id)?;
        if !session.state.is_editable() {
            return Err(ServiceError::InvalidOperation(
                "Checkout can no longer be edited".to_string(),
            ));
        }

        let owned = Address::find_by_id(address_id)
            .filter(address::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?;
        if owned.is_none() {
            return Err(ServiceError::NotFound(format!(
                "Address {} not found",
                address_id
            )));
        }

        self.update_session(session_id, |s| {
            s.shipping_address_id = Some(address_id);
            if s.state == CheckoutState::CollectingAddress {
                s.state = CheckoutState::CollectingPayment;
            }
        })
    }

    /// Records the payment instrument. Phone numbers are normalized to the
    /// canonical form up front so every later gateway call sees the same
    /// value. Moves the session to review once both address and payment are
    /// present.
    #[instrument(skip(self, instrument), fields(session_id = %session_id))]
    pub async fn set_payment_method(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        instrument: PaymentInstrument,
    ) -> Result<CheckoutSession, ServiceError> {
        let session = self.get(session_id, user_id)?;
        if !session.state.is_editable() {
            return Err(ServiceError::InvalidOperation(
                "Checkout can no longer be edited".to_string(),
            ));
        }
        if session.shipping_address_id.is_none() {
            return Err(ServiceError::InvalidOperation(
                "Set a shipping address before choosing payment".to_string(),
            ));
        }

        let (method, msisdn, token) = match instrument {
            PaymentInstrument::Mpesa { phone } => {
                let canonical = normalize_msisdn(&phone).map_err(ServiceError::from)?;
                (PaymentMethod::Mpesa, Some(canonical), None)
            }
            PaymentInstrument::Card { payment_token } => {
                if payment_token.trim().is_empty() {
                    return Err(ServiceError::ValidationError(
                        "Card payment token is required".to_string(),
                    ));
                }
                (PaymentMethod::Card, None, Some(payment_token))
            }
        };

        self.update_session(session_id, |s| {
            s.payment_method = Some(method);
            s.msisdn = msisdn;
            s.payment_token = token;
            if s.state == CheckoutState::CollectingPayment {
                s.state = CheckoutState::Reviewing;
            }
        })
    }

    /// Validates and applies a coupon to the session. An inapplicable coupon
    /// is reported in the returned validation and leaves the session
    /// unchanged.
    #[instrument(skip(self), fields(session_id = %session_id, code = %code))]
    pub async fn apply_coupon(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        code: &str,
    ) -> Result<(CheckoutSession, CouponValidation), ServiceError> {
        let session = self.get(session_id, user_id)?;
        if !session.state.is_editable() {
            return Err(ServiceError::InvalidOperation(
                "Checkout can no longer be edited".to_string(),
            ));
        }

        let (_, items) = self.carts.get_cart_with_items(session.cart_id).await?;
        let subtotal = subtotal_of(&items);
        let validation = self.coupons.validate(code, subtotal, user_id).await?;

        if !validation.valid {
            return Ok((session, validation));
        }

        let applied = AppliedCoupon {
            // validation.valid guarantees these are populated
            coupon_id: validation.coupon_id.unwrap_or_default(),
            code: validation.code.clone().unwrap_or_default(),
            discount: validation.discount_amount,
            free_shipping: validation.free_shipping,
        };
        let totals = self.compute_totals(&items, Some(&applied));
        let updated = self.update_session(session_id, |s| {
            s.coupon = Some(applied.clone());
            s.totals = Some(totals);
        })?;
        Ok((updated, validation))
    }

    /// Removes any applied coupon and recomputes totals.
    pub async fn remove_coupon(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<CheckoutSession, ServiceError> {
        let session = self.get(session_id, user_id)?;
        if !session.state.is_editable() {
            return Err(ServiceError::InvalidOperation(
                "Checkout can no longer be edited".to_string(),
            ));
        }
        let (_, items) = self.carts.get_cart_with_items(session.cart_id).await?;
        let totals = self.compute_totals(&items, None);
        self.update_session(session_id, |s| {
            s.coupon = None;
            s.totals = Some(totals);
        })
    }

    /// Submits the checkout: creates the order from the current cart
    /// snapshot and runs the selected payment. Card payments settle in this
    /// call; push payments leave the session awaiting confirmation with a
    /// background watcher polling the gateway.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn submit(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> Result<CheckoutSession, ServiceError> {
        let session = self.get(session_id, user_id)?;
        if session.state != CheckoutState::Reviewing {
            return Err(ServiceError::InvalidOperation(format!(
                "Checkout cannot be submitted from state {:?}",
                session.state
            )));
        }
        let shipping_address_id = session.shipping_address_id.ok_or_else(|| {
            ServiceError::InvalidOperation("Shipping address is required".to_string())
        })?;
        let method = session.payment_method.ok_or_else(|| {
            ServiceError::InvalidOperation("Payment method is required".to_string())
        })?;

        let (_, items) = self.carts.get_cart_with_items(session.cart_id).await?;
        if items.is_empty() {
            return Err(ServiceError::InvalidOperation(
                "Cart is empty; nothing to submit".to_string(),
            ));
        }

        // Totals are recomputed from the live cart at submission so edits
        // made after review pricing cannot go stale.
        let totals = self.compute_totals(&items, session.coupon.as_ref());
        self.update_session(session_id, |s| {
            s.state = CheckoutState::Submitting;
            s.totals = Some(totals);
            s.failure_reason = None;
        })?;

        let order = match self
            .orders
            .create_order(CreateOrderInput {
                user_id,
                payment_method: method,
                items: items
                    .iter()
                    .map(|i| OrderItemInput {
                        product_id: i.product_id,
                        quantity: i.quantity,
                        unit_price: i.unit_price,
                    })
                    .collect(),
                totals,
                currency: self.currency.clone(),
                shipping_address_id,
                coupon_id: session.coupon.as_ref().map(|c| c.coupon_id),
                notes: None,
            })
            .await
        {
            Ok(order) => order,
            Err(e) => {
                // No order was created; the session goes back to review so
                // the customer can adjust the cart and submit again.
                let reason = e.to_string();
                self.update_session(session_id, |s| {
                    s.state = CheckoutState::Reviewing;
                    s.failure_reason = Some(reason.clone());
                })?;
                self.events
                    .send(Event::CheckoutFailed { session_id, reason })
                    .await;
                return Err(e);
            }
        };

        let sandbox = self.gateway_is_sandbox(method);
        self.update_session(session_id, |s| {
            s.order_id = Some(order.id);
            s.sandbox = sandbox;
        })?;
        self.events
            .send(Event::CheckoutSubmitted {
                session_id,
                order_id: order.id,
            })
            .await;

        match method {
            PaymentMethod::Card => {
                self.run_card_payment(session_id, order.id, totals.total)
                    .await?;
            }
            PaymentMethod::Mpesa => {
                let msisdn = session.msisdn.clone().ok_or_else(|| {
                    ServiceError::InvalidOperation("Phone number is required".to_string())
                })?;
                self.run_push_payment(session_id, order.id, session.cart_id, &msisdn, totals.total)
                    .await?;
            }
        }

        self.get(session_id, user_id)
    }

    /// Stops the confirmation watcher without touching the payment. The
    /// order stays pending; the customer may still approve the prompt, and a
    /// later status check or retry picks the outcome up.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub fn cancel_wait(&self, session_id: Uuid, user_id: Uuid) -> Result<CheckoutSession, ServiceError> {
        let session = self.get(session_id, user_id)?;
        if session.state != CheckoutState::AwaitingConfirmation {
            return Err(ServiceError::InvalidOperation(
                "No payment confirmation in progress".to_string(),
            ));
        }
        if let Some((_, cancel)) = self.cancels.remove(&session_id) {
            let _ = cancel.send(true);
        }
        self.update_session(session_id, |s| {
            s.state = CheckoutState::Failed;
            s.failure_reason =
                Some("Confirmation wait cancelled; the payment may still complete".to_string());
        })
    }

    /// Retries payment for a failed session. Reuses the existing order,
    /// never creating a second one: the order's payment status is reset to
    /// pending (when it had failed) and a fresh attempt is run. Mobile-money
    /// retries may carry a corrected phone number.
    #[instrument(skip(self), fields(session_id = %session_id))]
    pub async fn retry_payment(
        &self,
        session_id: Uuid,
        user_id: Uuid,
        new_phone: Option<&str>,
    ) -> Result<CheckoutSession, ServiceError> {
        let session = self.get(session_id, user_id)?;
        if session.state != CheckoutState::Failed {
            return Err(ServiceError::InvalidOperation(
                "Only a failed checkout can be retried".to_string(),
            ));
        }
        let order_id = session.order_id.ok_or_else(|| {
            ServiceError::InvalidOperation(
                "Checkout failed before an order was created; start over".to_string(),
            )
        })?;
        let method = session.payment_method.ok_or_else(|| {
            ServiceError::InvalidOperation("Payment method is required".to_string())
        })?;
        let totals = session.totals.ok_or_else(|| {
            ServiceError::InvalidOperation("Session has no totals; start over".to_string())
        })?;

        let corrected = match new_phone {
            Some(raw) => {
                if method != PaymentMethod::Mpesa {
                    return Err(ServiceError::InvalidOperation(
                        "A corrected phone number only applies to mobile money payments"
                            .to_string(),
                    ));
                }
                Some(normalize_msisdn(raw).map_err(ServiceError::from)?)
            }
            None => None,
        };

        // A failed payment is reset to pending; a cancelled or timed-out
        // wait left it pending already, in which case the reset is a no-op.
        self.orders
            .transition_payment_status(
                order_id,
                PaymentStatus::Failed,
                PaymentStatus::Pending,
                None,
            )
            .await?;

        // The payment may have settled while the session sat failed, e.g. a
        // cancelled push the customer approved anyway, or a webhook. A
        // settled payment must not be charged again.
        let order = Order::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        if order.payment_status != PaymentStatus::Pending.to_string() {
            return Err(ServiceError::Conflict(format!(
                "Payment for order {} already settled as {}",
                order_id, order.payment_status
            )));
        }

        let sandbox = self.gateway_is_sandbox(method);
        let corrected_for_session = corrected.clone();
        self.update_session(session_id, |s| {
            s.failure_reason = None;
            s.state = CheckoutState::Submitting;
            s.sandbox = sandbox;
            if corrected_for_session.is_some() {
                s.msisdn = corrected_for_session;
            }
        })?;

        match method {
            PaymentMethod::Card => {
                self.run_card_payment(session_id, order_id, totals.total)
                    .await?;
            }
            PaymentMethod::Mpesa => {
                let msisdn = corrected.or_else(|| session.msisdn.clone()).ok_or_else(|| {
                    ServiceError::InvalidOperation("Phone number is required".to_string())
                })?;
                self.run_push_payment(session_id, order_id, session.cart_id, &msisdn, totals.total)
                    .await?;
            }
        }

        self.get(session_id, user_id)
    }

    /// Computes order totals from cart lines and an optional coupon. Tax
    /// applies to the undiscounted subtotal; free-shipping coupons waive the
    /// flat shipping fee.
    pub fn compute_totals(
        &self,
        items: &[cart_item::Model],
        coupon: Option<&AppliedCoupon>,
    ) -> OrderTotals {
        totals_from_lines(items, coupon, self.tax_rate, self.shipping_flat)
    }

    fn gateway_is_sandbox(&self, method: PaymentMethod) -> bool {
        match method {
            PaymentMethod::Card => self.card_gateway.is_sandbox(),
            PaymentMethod::Mpesa => self.push_gateway.is_sandbox(),
        }
    }

    async fn run_card_payment(
        &self,
        session_id: Uuid,
        order_id: Uuid,
        total: Decimal,
    ) -> Result<(), ServiceError> {
        let token = self
            .sessions
            .get(&session_id)
            .and_then(|s| s.payment_token.clone())
            .ok_or_else(|| {
                ServiceError::InvalidOperation("Card payment token is required".to_string())
            })?;

        let attempt_id = self
            .record_attempt(order_id, PaymentMethod::Card, None, None, total)
            .await?;
        self.events
            .send(Event::PaymentInitiated {
                order_id,
                attempt_id,
                method: PaymentMethod::Card.to_string(),
            })
            .await;

        let minor_units = (total * Decimal::from(100))
            .round()
            .to_i64()
            .ok_or_else(|| {
                ServiceError::InvalidOperation(format!("amount out of range: {}", total))
            })?;

        match self
            .card_gateway
            .charge(order_id, minor_units, &self.currency, &token)
            .await
        {
            Ok(charge) => {
                let cart_id = self
                    .sessions
                    .get(&session_id)
                    .map(|s| s.cart_id)
                    .ok_or_else(|| {
                        ServiceError::NotFound(format!(
                            "Checkout session {} not found",
                            session_id
                        ))
                    })?;
                self.settle_paid(session_id, order_id, cart_id, attempt_id, &charge.reference)
                    .await;
                Ok(())
            }
            Err(GatewayError::Declined(reason)) => {
                self.settle_failed(session_id, order_id, attempt_id, &reason, AttemptStatus::Failed)
                    .await;
                Ok(())
            }
            Err(e) => {
                // The processor was unreachable; the charge did not happen.
                // Leave the payment pending so a retry is clean.
                let reason = e.to_string();
                self.finish_attempt(attempt_id, AttemptStatus::Failed, Some(&reason))
                    .await;
                self.update_session(session_id, |s| {
                    s.state = CheckoutState::Failed;
                    s.failure_reason = Some(reason);
                })?;
                Err(ServiceError::from(e))
            }
        }
    }

    async fn run_push_payment(
        &self,
        session_id: Uuid,
        order_id: Uuid,
        cart_id: Uuid,
        msisdn: &str,
        total: Decimal,
    ) -> Result<(), ServiceError> {
        let attempt_id = self
            .record_attempt(order_id, PaymentMethod::Mpesa, Some(msisdn), None, total)
            .await?;
        self.events
            .send(Event::PaymentInitiated {
                order_id,
                attempt_id,
                method: PaymentMethod::Mpesa.to_string(),
            })
            .await;

        let push = match self.push_gateway.initiate(order_id, msisdn, total).await {
            Ok(push) => push,
            Err(e) => {
                let reason = e.to_string();
                self.finish_attempt(attempt_id, AttemptStatus::Failed, Some(&reason))
                    .await;
                self.update_session(session_id, |s| {
                    s.state = CheckoutState::Failed;
                    s.failure_reason = Some(reason);
                })?;
                return Err(ServiceError::from(e));
            }
        };

        self.set_attempt_checkout_request(attempt_id, &push.checkout_request_id)
            .await;
        self.update_session(session_id, |s| {
            s.state = CheckoutState::AwaitingConfirmation;
            s.checkout_request_id = Some(push.checkout_request_id.clone());
            s.customer_message = push.customer_message.clone();
        })?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.insert(session_id, cancel_tx);

        let watcher = self.clone();
        let checkout_request_id = push.checkout_request_id;
        tokio::spawn(async move {
            watcher
                .watch_confirmation(session_id, order_id, cart_id, attempt_id, checkout_request_id, cancel_rx)
                .await;
        });
        Ok(())
    }

    /// Polls the push gateway until the payment settles, the wait is
    /// cancelled, or the attempt budget runs out. Polls are strictly
    /// sequential; a transient gateway error consumes an attempt and the
    /// loop keeps going.
    async fn watch_confirmation(
        self,
        session_id: Uuid,
        order_id: Uuid,
        cart_id: Uuid,
        attempt_id: Uuid,
        checkout_request_id: String,
        mut cancel_rx: watch::Receiver<bool>,
    ) {
        for poll in 1..=self.max_poll_attempts {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    info!(session_id = %session_id, "confirmation wait cancelled");
                    return;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            match self.push_gateway.query_status(&checkout_request_id).await {
                Ok(PushPaymentStatus::Paid) => {
                    info!(order_id = %order_id, polls = poll, "push payment confirmed");
                    self.settle_paid(session_id, order_id, cart_id, attempt_id, &checkout_request_id)
                        .await;
                    self.cancels.remove(&session_id);
                    return;
                }
                Ok(PushPaymentStatus::Failed(reason)) => {
                    self.settle_failed(
                        session_id,
                        order_id,
                        attempt_id,
                        &reason,
                        AttemptStatus::Failed,
                    )
                    .await;
                    self.cancels.remove(&session_id);
                    return;
                }
                Ok(PushPaymentStatus::Pending) => {}
                Err(e) => {
                    warn!(order_id = %order_id, poll, error = %e, "status poll failed; will retry");
                }
            }
        }

        // Attempt budget exhausted. The push may still settle out of band;
        // the payment is marked failed so the customer can retry cleanly.
        warn!(order_id = %order_id, "push payment confirmation timed out");
        self.settle_failed(
            session_id,
            order_id,
            attempt_id,
            "Payment confirmation timed out",
            AttemptStatus::TimedOut,
        )
        .await;
        self.cancels.remove(&session_id);
    }

    /// Applies the paid outcome: payment status CAS, order confirmation,
    /// cart clearing, attempt bookkeeping, session state. Losing the CAS
    /// means another observer already settled this payment, and everything
    /// downstream is skipped.
    async fn settle_paid(
        &self,
        session_id: Uuid,
        order_id: Uuid,
        cart_id: Uuid,
        attempt_id: Uuid,
        reference: &str,
    ) {
        let won = match self
            .orders
            .transition_payment_status(
                order_id,
                PaymentStatus::Pending,
                PaymentStatus::Completed,
                Some(reference),
            )
            .await
        {
            Ok(won) => won,
            Err(e) => {
                error!(order_id = %order_id, error = %e, "failed to record completed payment");
                return;
            }
        };
        if !won {
            return;
        }

        if let Err(e) = self.orders.mark_confirmed(order_id).await {
            error!(order_id = %order_id, error = %e, "failed to confirm order");
        }
        if let Err(e) = self.carts.clear_cart(cart_id).await {
            warn!(cart_id = %cart_id, error = %e, "failed to clear cart after payment");
        } else {
            self.events.send(Event::CartCleared(cart_id)).await;
        }
        self.finish_attempt(attempt_id, AttemptStatus::Paid, None).await;

        if let Err(e) = self.update_session(session_id, |s| {
            s.state = CheckoutState::Confirmed;
            s.failure_reason = None;
        }) {
            warn!(session_id = %session_id, error = %e, "session gone before confirmation");
        }
    }

    async fn settle_failed(
        &self,
        session_id: Uuid,
        order_id: Uuid,
        attempt_id: Uuid,
        reason: &str,
        attempt_status: AttemptStatus,
    ) {
        match self
            .orders
            .transition_payment_status(order_id, PaymentStatus::Pending, PaymentStatus::Failed, None)
            .await
        {
            Ok(false) => return,
            Ok(true) => {}
            Err(e) => {
                error!(order_id = %order_id, error = %e, "failed to record failed payment");
                return;
            }
        }

        self.finish_attempt(attempt_id, attempt_status, Some(reason))
            .await;
        if let Err(e) = self.update_session(session_id, |s| {
            s.state = CheckoutState::Failed;
            s.failure_reason = Some(reason.to_string());
        }) {
            warn!(session_id = %session_id, error = %e, "session gone before failure recording");
        }
        self.events
            .send(Event::CheckoutFailed {
                session_id,
                reason: reason.to_string(),
            })
            .await;
    }

    async fn record_attempt(
        &self,
        order_id: Uuid,
        method: PaymentMethod,
        msisdn: Option<&str>,
        checkout_request_id: Option<&str>,
        amount: Decimal,
    ) -> Result<Uuid, ServiceError> {
        let now = Utc::now();
        let attempt = payment_attempt::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            method: Set(method.to_string()),
            checkout_request_id: Set(checkout_request_id.map(String::from)),
            msisdn: Set(msisdn.map(String::from)),
            amount: Set(amount),
            status: Set(AttemptStatus::Initiated.to_string()),
            failure_reason: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
        }
        .insert(&*self.db)
        .await?;
        Ok(attempt.id)
    }

    async fn set_attempt_checkout_request(&self, attempt_id: Uuid, checkout_request_id: &str) {
        let result = PaymentAttempt::update_many()
            .col_expr(
                payment_attempt::Column::CheckoutRequestId,
                sea_orm::sea_query::Expr::value(Some(checkout_request_id.to_string())),
            )
            .col_expr(
                payment_attempt::Column::UpdatedAt,
                sea_orm::sea_query::Expr::value(Some(Utc::now())),
            )
            .filter(payment_attempt::Column::Id.eq(attempt_id))
            .exec(&*self.db)
            .await;
        if let Err(e) = result {
            warn!(attempt_id = %attempt_id, error = %e, "failed to record checkout request id");
        }
    }

    async fn finish_attempt(
        &self,
        attempt_id: Uuid,
        status: AttemptStatus,
        failure_reason: Option<&str>,
    ) {
        let result = PaymentAttempt::update_many()
            .col_expr(
                payment_attempt::Column::Status,
                sea_orm::sea_query::Expr::value(status.to_string()),
            )
            .col_expr(
                payment_attempt::Column::FailureReason,
                sea_orm::sea_query::Expr::value(failure_reason.map(String::from)),
            )
            .col_expr(
                payment_attempt::Column::UpdatedAt,
                sea_orm::sea_query::Expr::value(Some(Utc::now())),
            )
            .filter(payment_attempt::Column::Id.eq(attempt_id))
            .exec(&*self.db)
            .await;
        if let Err(e) = result {
            warn!(attempt_id = %attempt_id, error = %e, "failed to finish payment attempt");
        }
    }

    fn update_session<F>(&self, session_id: Uuid, f: F) -> Result<CheckoutSession, ServiceError>
    where
        F: FnOnce(&mut CheckoutSession),
    {
        let mut entry = self.sessions.get_mut(&session_id).ok_or_else(|| {
            ServiceError::NotFound(format!("Checkout session {} not found", session_id))
        })?;
        f(&mut entry);
        entry.updated_at = Utc::now();
        Ok(entry.clone())
    }
}

fn subtotal_of(items: &[cart_item::Model]) -> Decimal {
    items
        .iter()
        .map(|i| i.unit_price * Decimal::from(i.quantity))
        .sum()
}

fn totals_from_lines(
    items: &[cart_item::Model],
    coupon: Option<&AppliedCoupon>,
    tax_rate: Decimal,
    shipping_flat: Decimal,
) -> OrderTotals {
    let subtotal = subtotal_of(items);
    let discount = coupon.map(|c| c.discount).unwrap_or(Decimal::ZERO);
    let shipping = match coupon {
        Some(c) if c.free_shipping => Decimal::ZERO,
        _ => shipping_flat,
    };
    let tax = (subtotal * tax_rate).round_dp(2);
    OrderTotals {
        subtotal,
        discount,
        shipping,
        tax,
        total: subtotal - discount + shipping + tax,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::payments::{SandboxCardGateway, SandboxPushGateway};
    use crate::{cache::ResponseCache, events};
    use rust_decimal_macros::dec;
    use sea_orm::{ConnectOptions, Database};

    async fn service() -> CheckoutService {
        // A pooled in-memory sqlite gives each connection its own database;
        // pin the pool to one connection so the schema is visible everywhere.
        let mut opts = ConnectOptions::new("sqlite::memory:");
        opts.max_connections(1);
        let db = Arc::new(Database::connect(opts).await.expect("in-memory db"));
        crate::db::setup_schema(&db).await.expect("schema");
        let (events, _rx) = events::channel(16);
        let cache = ResponseCache::new(Duration::from_secs(60));
        let coupons = Arc::new(CouponService::new(db.clone()));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            events.clone(),
            cache,
            coupons.clone(),
        ));
        let carts = Arc::new(CartService::new(db.clone()));
        CheckoutService::new(
            db,
            orders,
            carts,
            coupons,
            Arc::new(SandboxPushGateway::default()),
            Arc::new(SandboxCardGateway::default()),
            events,
            "KES".to_string(),
            dec!(0.16),
            dec!(500),
            Duration::from_millis(10),
            5,
        )
    }

    fn line(unit_price: Decimal, quantity: i32) -> cart_item::Model {
        cart_item::Model {
            id: Uuid::new_v4(),
            cart_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            quantity,
            unit_price,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn totals_apply_vat_and_flat_shipping() {
        let svc = service().await;
        let totals = svc.compute_totals(&[line(dec!(1899.00), 1)], None);
        assert_eq!(totals.subtotal, dec!(1899.00));
        assert_eq!(totals.shipping, dec!(500));
        assert_eq!(totals.tax, dec!(303.84));
        assert_eq!(totals.total, dec!(2702.84));
        assert!(totals.is_consistent());
    }

    #[tokio::test]
    async fn free_shipping_coupon_waives_the_flat_fee() {
        let svc = service().await;
        let coupon = AppliedCoupon {
            coupon_id: Uuid::new_v4(),
            code: "SHIPFREE".to_string(),
            discount: Decimal::ZERO,
            free_shipping: true,
        };
        let totals = svc.compute_totals(&[line(dec!(1000), 2)], Some(&coupon));
        assert_eq!(totals.shipping, Decimal::ZERO);
        assert_eq!(totals.total, dec!(2000) + dec!(320.00));
    }

    #[tokio::test]
    async fn discount_reduces_total_but_not_tax_base() {
        let svc = service().await;
        let coupon = AppliedCoupon {
            coupon_id: Uuid::new_v4(),
            code: "MINUS100".to_string(),
            discount: dec!(100),
            free_shipping: false,
        };
        let totals = svc.compute_totals(&[line(dec!(1000), 1)], Some(&coupon));
        assert_eq!(totals.tax, dec!(160.00));
        assert_eq!(totals.total, dec!(1000) - dec!(100) + dec!(500) + dec!(160));
    }

    #[tokio::test]
    async fn starting_checkout_with_empty_cart_is_rejected() {
        let svc = service().await;
        let err = svc.start(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidOperation(_)));
    }

    #[test]
    fn editable_states_end_at_review() {
        assert!(CheckoutState::CollectingAddress.is_editable());
        assert!(CheckoutState::Reviewing.is_editable());
        assert!(!CheckoutState::Submitting.is_editable());
        assert!(!CheckoutState::AwaitingConfirmation.is_editable());
        assert!(!CheckoutState::Confirmed.is_editable());
    }

    mod totals_arithmetic {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// `total = subtotal - discount + shipping + tax` holds for any
            /// cart contents, discount and shipping arrangement.
            #[test]
            fn holds_for_generated_carts(
                lines in proptest::collection::vec((1i64..=1_000_000, 1i32..=20), 1..8),
                discount_cents in 0i64..=500_000,
                free_shipping in any::<bool>(),
            ) {
                let items: Vec<_> = lines
                    .iter()
                    .map(|(cents, qty)| line(Decimal::new(*cents, 2), *qty))
                    .collect();
                let subtotal = subtotal_of(&items);
                let coupon = AppliedCoupon {
                    coupon_id: Uuid::new_v4(),
                    code: "PROP".to_string(),
                    discount: Decimal::new(discount_cents, 2).min(subtotal),
                    free_shipping,
                };
                let totals =
                    totals_from_lines(&items, Some(&coupon), dec!(0.16), dec!(500));

                prop_assert_eq!(
                    totals.total,
                    totals.subtotal - totals.discount + totals.shipping + totals.tax
                );
                prop_assert!(totals.is_consistent());
                if free_shipping {
                    prop_assert_eq!(totals.shipping, Decimal::ZERO);
                }
            }
        }
    }
}
