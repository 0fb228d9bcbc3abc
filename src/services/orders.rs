use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, ModelTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    cache::ResponseCache,
    entities::{
        address,
        order::{self, Entity as OrderEntity, OrderStatus, PaymentMethod, PaymentStatus},
        order_item::{self, Entity as OrderItemEntity},
        product::{self, Entity as Product},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::coupons::CouponService,
};

/// One line of a cart snapshot handed to order creation. `unit_price` is the
/// price frozen at add-to-cart time.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderItemInput {
    pub product_id: Uuid,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Monetary breakdown of an order, computed once at checkout and validated
/// against the arithmetic invariant at creation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct OrderTotals {
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub shipping: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
}

/// Tolerance for the totals invariant, one cent either way.
const TOTALS_TOLERANCE: Decimal = dec!(0.01);

impl OrderTotals {
    /// `total = subtotal - discount + shipping + tax`, within rounding
    /// tolerance.
    pub fn is_consistent(&self) -> bool {
        let expected = self.subtotal - self.discount + self.shipping + self.tax;
        (expected - self.total).abs() <= TOTALS_TOLERANCE
    }
}

#[derive(Debug, Clone)]
pub struct CreateOrderInput {
    pub user_id: Uuid,
    pub payment_method: PaymentMethod,
    pub items: Vec<OrderItemInput>,
    pub totals: OrderTotals,
    pub currency: String,
    pub shipping_address_id: Uuid,
    pub coupon_id: Option<Uuid>,
    pub notes: Option<String>,
}

/// Restricted field set for order updates; everything else on an order is
/// immutable after creation.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct UpdateOrderInput {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub notes: Option<String>,
}

/// Order joined with its items and shipping address.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub shipping_address: Option<address::Model>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OrderListPage {
    pub orders: Vec<order::Model>,
    pub total: u64,
    pub page: u64,
    pub per_page: u64,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DatabaseConnection>,
    events: EventSender,
    cache: ResponseCache,
    coupons: Arc<CouponService>,
}

impl OrderService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        events: EventSender,
        cache: ResponseCache,
        coupons: Arc<CouponService>,
    ) -> Self {
        Self {
            db,
            events,
            cache,
            coupons,
        }
    }

    /// Creates an order from a cart snapshot.
    ///
    /// The whole operation runs in one transaction: stock is re-checked and
    /// conditionally decremented per line (insufficient stock rejects the
    /// order), item snapshots are written with their frozen unit prices, and
    /// the coupon usage counter is incremented. Either the order exists with
    /// a pending payment afterwards, or nothing was written.
    #[instrument(skip(self, input), fields(user_id = %input.user_id))]
    pub async fn create_order(&self, input: CreateOrderInput) -> Result<order::Model, ServiceError> {
        if input.items.is_empty() {
            return Err(ServiceError::ValidationError(
                "Cannot place an order with an empty cart".to_string(),
            ));
        }
        if input.items.iter().any(|item| item.quantity < 1) {
            return Err(ServiceError::ValidationError(
                "Item quantity must be at least 1".to_string(),
            ));
        }
        if !input.totals.is_consistent() {
            return Err(ServiceError::ValidationError(
                "Order totals do not add up".to_string(),
            ));
        }

        let txn = self.db.begin().await?;
        let now = Utc::now();
        let order_id = Uuid::new_v4();

        // Resolve product snapshots and reserve stock. The decrement is
        // guarded on the current quantity so a concurrent purchase cannot
        // push stock negative.
        let mut snapshots = Vec::with_capacity(input.items.len());
        for item in &input.items {
            let prod = Product::find_by_id(item.product_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", item.product_id))
                })?;
            if !prod.is_active {
                return Err(ServiceError::InvalidOperation(format!(
                    "{} is no longer available",
                    prod.name
                )));
            }

            let reserved = Product::update_many()
                .col_expr(
                    product::Column::StockQuantity,
                    Expr::col(product::Column::StockQuantity).sub(item.quantity),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(now))
                .filter(product::Column::Id.eq(item.product_id))
                .filter(product::Column::StockQuantity.gte(item.quantity))
                .exec(&txn)
                .await?;
            if reserved.rows_affected == 0 {
                warn!(product_id = %item.product_id, "insufficient stock at order creation");
                return Err(ServiceError::InsufficientStock(format!(
                    "Not enough stock for {}",
                    prod.name
                )));
            }

            snapshots.push((prod, item.clone()));
        }

        let order_active = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number()),
            user_id: Set(input.user_id),
            status: Set(OrderStatus::Pending.to_string()),
            payment_status: Set(PaymentStatus::Pending.to_string()),
            payment_method: Set(input.payment_method.to_string()),
            payment_reference: Set(None),
            subtotal: Set(input.totals.subtotal),
            discount: Set(input.totals.discount),
            shipping: Set(input.totals.shipping),
            tax: Set(input.totals.tax),
            total: Set(input.totals.total),
            currency: Set(input.currency.clone()),
            shipping_address_id: Set(input.shipping_address_id),
            coupon_id: Set(input.coupon_id),
            tracking_number: Set(None),
            carrier: Set(None),
            notes: Set(input.notes.clone()),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            delivered_at: Set(None),
            version: Set(1),
        };
        let order_model = order_active.insert(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "failed to insert order");
            ServiceError::DatabaseError(e)
        })?;

        for (prod, item) in &snapshots {
            let line_total = item.unit_price * Decimal::from(item.quantity);
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(item.product_id),
                name: Set(prod.name.clone()),
                sku: Set(prod.sku.clone()),
                quantity: Set(item.quantity),
                unit_price: Set(item.unit_price),
                total_price: Set(line_total),
                created_at: Set(now),
            }
            .insert(&txn)
            .await?;
        }

        if let Some(coupon_id) = input.coupon_id {
            self.coupons.increment_usage(&txn, coupon_id).await?;
        }

        txn.commit().await?;

        info!(order_id = %order_id, order_number = %order_model.order_number, "order created");
        self.events.send(Event::OrderCreated(order_id)).await;
        if let Some(coupon_id) = input.coupon_id {
            self.events
                .send(Event::CouponRedeemed {
                    coupon_id,
                    order_id,
                })
                .await;
        }

        Ok(order_model)
    }

    /// Fetches an order with items and address, through the response cache.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderDetails, ServiceError> {
        let cache_key = order_cache_key(order_id);
        if let Some(cached) = self.cache.get::<OrderDetails>(&cache_key) {
            return Ok(cached);
        }

        let order = OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let items = order.find_related(OrderItemEntity).all(&*self.db).await?;
        let shipping_address = order
            .find_related(crate::entities::Address)
            .one(&*self.db)
            .await?;

        let details = OrderDetails {
            order,
            items,
            shipping_address,
        };
        if let Err(e) = self.cache.put(&cache_key, &details) {
            warn!(error = %e, "failed to cache order");
        }
        Ok(details)
    }

    /// Lists a user's orders, newest first.
    pub async fn list_orders(
        &self,
        user_id: Uuid,
        page: u64,
        per_page: u64,
    ) -> Result<OrderListPage, ServiceError> {
        let paginator = OrderEntity::find()
            .filter(order::Column::UserId.eq(user_id))
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db, per_page.max(1));

        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page.saturating_sub(1)).await?;

        Ok(OrderListPage {
            orders,
            total,
            page,
            per_page,
        })
    }

    /// Applies a restricted partial update, enforcing the lifecycle
    /// invariants: fulfillment may not advance past `confirmed` until the
    /// payment completed, and payment status edits through this path are
    /// limited to refunding a completed payment (gateway observation owns
    /// the pending transition).
    #[instrument(skip(self, update), fields(order_id = %order_id))]
    pub async fn update_order(
        &self,
        order_id: Uuid,
        update: UpdateOrderInput,
    ) -> Result<order::Model, ServiceError> {
        let txn = self.db.begin().await?;

        let current = OrderEntity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let current_status = parse_order_status(&current.status)?;
        let current_payment = parse_payment_status(&current.payment_status)?;
        let old_status = current.status.clone();
        let version = current.version;

        let now = Utc::now();
        let mut active: order::ActiveModel = current.into();

        if let Some(new_payment) = update.payment_status {
            ensure_payment_edit_allowed(current_payment, new_payment)?;
            active.payment_status = Set(new_payment.to_string());
        }

        if let Some(new_status) = update.status {
            let effective_payment = update.payment_status.unwrap_or(current_payment);
            ensure_status_transition(current_status, effective_payment, new_status)?;
            active.status = Set(new_status.to_string());
            if new_status == OrderStatus::Delivered {
                active.delivered_at = Set(Some(now));
            }
        }

        if let Some(tracking) = update.tracking_number {
            active.tracking_number = Set(Some(tracking));
        }
        if let Some(carrier) = update.carrier {
            active.carrier = Set(Some(carrier));
        }
        if let Some(notes) = update.notes {
            active.notes = Set(Some(notes));
        }
        active.updated_at = Set(Some(now));
        active.version = Set(version + 1);

        let updated = active.update(&txn).await?;
        txn.commit().await?;

        self.cache.invalidate(&order_cache_key(order_id));

        if updated.status != old_status {
            self.events
                .send(Event::OrderStatusChanged {
                    order_id,
                    old_status,
                    new_status: updated.status.clone(),
                })
                .await;
        }

        Ok(updated)
    }

    /// Compare-and-set on the payment status: the transition is applied only
    /// if the stored value still equals `from`, so two observers can never
    /// both claim the pending-to-terminal edge. Returns whether this caller
    /// won the transition.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn transition_payment_status(
        &self,
        order_id: Uuid,
        from: PaymentStatus,
        to: PaymentStatus,
        payment_reference: Option<&str>,
    ) -> Result<bool, ServiceError> {
        let now = Utc::now();
        let mut update = OrderEntity::update_many()
            .col_expr(order::Column::PaymentStatus, Expr::value(to.to_string()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)));
        if let Some(reference) = payment_reference {
            update = update.col_expr(
                order::Column::PaymentReference,
                Expr::value(Some(reference.to_string())),
            );
        }
        let result = update
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::PaymentStatus.eq(from.to_string()))
            .exec(&*self.db)
            .await?;

        let won = result.rows_affected == 1;
        if won {
            self.cache.invalidate(&order_cache_key(order_id));
            match to {
                PaymentStatus::Completed => {
                    self.events.send(Event::PaymentCompleted(order_id)).await;
                }
                PaymentStatus::Failed => {
                    self.events
                        .send(Event::PaymentFailed {
                            order_id,
                            reason: "gateway reported failure".to_string(),
                        })
                        .await;
                }
                _ => {}
            }
        } else {
            info!(order_id = %order_id, ?from, ?to, "payment status CAS lost; already transitioned");
        }
        Ok(won)
    }

    /// Marks a confirmed order. Used after a completed payment; tolerates
    /// the order already having advanced.
    pub async fn mark_confirmed(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let result = OrderEntity::update_many()
            .col_expr(
                order::Column::Status,
                Expr::value(OrderStatus::Confirmed.to_string()),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending.to_string()))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 1 {
            self.cache.invalidate(&order_cache_key(order_id));
            self.events
                .send(Event::OrderStatusChanged {
                    order_id,
                    old_status: OrderStatus::Pending.to_string(),
                    new_status: OrderStatus::Confirmed.to_string(),
                })
                .await;
        }
        Ok(())
    }
}

fn order_cache_key(order_id: Uuid) -> String {
    format!("order:{}", order_id)
}

fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_uppercase();
    format!("ORD-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

pub(crate) fn parse_order_status(raw: &str) -> Result<OrderStatus, ServiceError> {
    OrderStatus::from_str(raw)
        .map_err(|_| ServiceError::InvalidOperation(format!("unknown order status: {}", raw)))
}

pub(crate) fn parse_payment_status(raw: &str) -> Result<PaymentStatus, ServiceError> {
    PaymentStatus::from_str(raw)
        .map_err(|_| ServiceError::InvalidOperation(format!("unknown payment status: {}", raw)))
}

/// Admin edits to the payment status are limited to refunds of completed
/// payments; the pending-to-terminal edge belongs to gateway observation.
fn ensure_payment_edit_allowed(
    current: PaymentStatus,
    target: PaymentStatus,
) -> Result<(), ServiceError> {
    match (current, target) {
        (PaymentStatus::Completed, PaymentStatus::Refunded) => Ok(()),
        _ => Err(ServiceError::InvalidOperation(format!(
            "payment status cannot be changed from {} to {} here",
            current, target
        ))),
    }
}

/// Fulfillment transitions: forward-only along the ladder (cancellation
/// allowed from any non-terminal state), and nothing past `confirmed`
/// without a completed payment.
fn ensure_status_transition(
    current: OrderStatus,
    payment: PaymentStatus,
    target: OrderStatus,
) -> Result<(), ServiceError> {
    if current == OrderStatus::Cancelled || current == OrderStatus::Delivered {
        return Err(ServiceError::InvalidOperation(format!(
            "order is already {}",
            current
        )));
    }
    if target == OrderStatus::Cancelled {
        return Ok(());
    }
    if target.rank() <= current.rank() {
        return Err(ServiceError::InvalidOperation(format!(
            "cannot move order from {} back to {}",
            current, target
        )));
    }
    if target.rank() > OrderStatus::Confirmed.rank() && payment != PaymentStatus::Completed {
        return Err(ServiceError::InvalidOperation(format!(
            "order cannot be {} until payment completes",
            target
        )));
    }
    Ok(())
}
