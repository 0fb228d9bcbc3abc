//! Shared test harness: an in-memory database with the full schema, the
//! service graph wired against sandbox gateways, and seed helpers.

#![allow(dead_code)]

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, Database, DatabaseConnection, Set};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use dukani_api::{
    cache::ResponseCache,
    db,
    entities::{address, coupon, product},
    events::{self, EventSender},
    services::{
        carts::CartService,
        checkout::CheckoutService,
        coupons::CouponService,
        orders::OrderService,
        payments::{CardPaymentGateway, PushPaymentGateway},
    },
};

pub struct TestCtx {
    pub db: Arc<DatabaseConnection>,
    pub events: EventSender,
    pub cache: ResponseCache,
    pub orders: Arc<OrderService>,
    pub carts: Arc<CartService>,
    pub coupons: Arc<CouponService>,
}

impl TestCtx {
    pub async fn new() -> Self {
        // A pooled in-memory sqlite gives each connection its own database;
        // one connection keeps the schema shared.
        let mut opts = ConnectOptions::new("sqlite::memory:");
        opts.max_connections(1);
        let db = Arc::new(Database::connect(opts).await.expect("in-memory db"));
        db::setup_schema(&db).await.expect("schema bootstrap");

        let (events, mut rx) = events::channel(256);
        // Drain events so the channel never fills up mid-test
        tokio::spawn(async move { while rx.recv().await.is_some() {} });

        let cache = ResponseCache::new(Duration::from_secs(60));
        let coupons = Arc::new(CouponService::new(db.clone()));
        let carts = Arc::new(CartService::new(db.clone()));
        let orders = Arc::new(OrderService::new(
            db.clone(),
            events.clone(),
            cache.clone(),
            coupons.clone(),
        ));

        Self {
            db,
            events,
            cache,
            orders,
            carts,
            coupons,
        }
    }

    /// Builds a checkout service over this context with fast polling so
    /// confirmation tests finish in milliseconds.
    pub fn checkout_service(
        &self,
        push: Arc<dyn PushPaymentGateway>,
        card: Arc<dyn CardPaymentGateway>,
        max_poll_attempts: u32,
    ) -> CheckoutService {
        CheckoutService::new(
            self.db.clone(),
            self.orders.clone(),
            self.carts.clone(),
            self.coupons.clone(),
            push,
            card,
            self.events.clone(),
            "KES".to_string(),
            rust_decimal_macros::dec!(0.16),
            rust_decimal_macros::dec!(500),
            Duration::from_millis(10),
            max_poll_attempts,
        )
    }

    pub async fn seed_product(
        &self,
        name: &str,
        sku: &str,
        unit_price: Decimal,
        stock: i32,
    ) -> product::Model {
        let now = Utc::now();
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            sku: Set(sku.to_string()),
            unit_price: Set(unit_price),
            stock_quantity: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_address(&self, user_id: Uuid) -> address::Model {
        let now = Utc::now();
        address::ActiveModel {
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
        .insert(&*self.db)
        .await
        .expect("seed address")
    }

    pub async fn seed_coupon(
        &self,
        code: &str,
        coupon_type: coupon::CouponType,
        value: Decimal,
        valid_for_days: i64,
    ) -> coupon::Model {
        let now = Utc::now();
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_string()),
            coupon_type: Set(coupon_type),
            value: Set(value),
            min_order_amount: Set(Decimal::ZERO),
            max_discount: Set(None),
            usage_limit: Set(None),
            user_usage_limit: Set(None),
            usage_count: Set(0),
            status: Set(coupon::CouponStatus::Active),
            valid_until: Set(now + ChronoDuration::days(valid_for_days)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("seed coupon")
    }
}
