mod common;

use common::TestCtx;
use proptest::prelude::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, IntoActiveModel, Set};
use uuid::Uuid;

use dukani_api::{
    entities::coupon::{CouponStatus, CouponType},
    services::coupons::calculate_discount,
};

#[tokio::test]
async fn percentage_coupon_validates_and_discounts() {
    let ctx = TestCtx::new().await;
    let ctx_user = Uuid::new_v4();
    ctx.seed_coupon("KARIBU10", CouponType::Percentage, dec!(10), 30)
        .await;

    let validation = ctx
        .coupons
        .validate("karibu10", dec!(1899.00), ctx_user)
        .await
        .unwrap();
    assert!(validation.valid, "{:?}", validation.error);
    assert_eq!(validation.discount_amount, dec!(189.90));
    assert_eq!(validation.code.as_deref(), Some("KARIBU10"));
    assert!(!validation.free_shipping);
}

#[tokio::test]
async fn expired_coupon_is_rejected_with_a_reason() {
    let ctx = TestCtx::new().await;
    ctx.seed_coupon("EXPIRED10", CouponType::Percentage, dec!(10), -1)
        .await;

    let validation = ctx
        .coupons
        .validate("EXPIRED10", dec!(1000), Uuid::new_v4())
        .await
        .unwrap();
    assert!(!validation.valid);
    assert_eq!(validation.discount_amount, Decimal::ZERO);
    assert!(validation.error.as_deref().unwrap().contains("expired"));
}

#[tokio::test]
async fn unknown_code_is_an_answer_not_an_error() {
    let ctx = TestCtx::new().await;
    let validation = ctx
        .coupons
        .validate("NOSUCHCODE", dec!(1000), Uuid::new_v4())
        .await
        .unwrap();
    assert!(!validation.valid);
    assert!(validation.error.is_some());
}

#[tokio::test]
async fn minimum_order_amount_is_enforced() {
    let ctx = TestCtx::new().await;
    let coupon = ctx
        .seed_coupon("BIGSPEND", CouponType::Fixed, dec!(200), 30)
        .await;
    let mut active = coupon.into_active_model();
    active.min_order_amount = Set(dec!(2000));
    active.update(&*ctx.db).await.unwrap();

    let below = ctx
        .coupons
        .validate("BIGSPEND", dec!(1999.99), Uuid::new_v4())
        .await
        .unwrap();
    assert!(!below.valid);

    let at = ctx
        .coupons
        .validate("BIGSPEND", dec!(2000), Uuid::new_v4())
        .await
        .unwrap();
    assert!(at.valid);
    assert_eq!(at.discount_amount, dec!(200));
}

#[tokio::test]
async fn exhausted_global_limit_is_rejected() {
    let ctx = TestCtx::new().await;
    let coupon = ctx
        .seed_coupon("LIMITED", CouponType::Fixed, dec!(50), 30)
        .await;
    let mut active = coupon.into_active_model();
    active.usage_limit = Set(Some(5));
    active.usage_count = Set(5);
    active.update(&*ctx.db).await.unwrap();

    let validation = ctx
        .coupons
        .validate("LIMITED", dec!(1000), Uuid::new_v4())
        .await
        .unwrap();
    assert!(!validation.valid);
}

#[tokio::test]
async fn inactive_coupon_is_rejected() {
    let ctx = TestCtx::new().await;
    let coupon = ctx
        .seed_coupon("PAUSED", CouponType::Fixed, dec!(50), 30)
        .await;
    let mut active = coupon.into_active_model();
    active.status = Set(CouponStatus::Inactive);
    active.update(&*ctx.db).await.unwrap();

    let validation = ctx
        .coupons
        .validate("PAUSED", dec!(1000), Uuid::new_v4())
        .await
        .unwrap();
    assert!(!validation.valid);
}

#[tokio::test]
async fn free_shipping_coupon_reports_no_monetary_discount() {
    let ctx = TestCtx::new().await;
    ctx.seed_coupon("SHIPFREE", CouponType::FreeShipping, Decimal::ZERO, 30)
        .await;

    let validation = ctx
        .coupons
        .validate("SHIPFREE", dec!(1000), Uuid::new_v4())
        .await
        .unwrap();
    assert!(validation.valid);
    assert!(validation.free_shipping);
    assert_eq!(validation.discount_amount, Decimal::ZERO);
}

fn arbitrary_coupon(
    coupon_type: CouponType,
    value: Decimal,
    max_discount: Option<Decimal>,
) -> dukani_api::entities::coupon::Model {
    use chrono::{Duration, Utc};
    dukani_api::entities::coupon::Model {
        id: Uuid::new_v4(),
        code: "PROP".to_string(),
        coupon_type,
        value,
        min_order_amount: Decimal::ZERO,
        max_discount,
        usage_limit: None,
        user_usage_limit: None,
        usage_count: 0,
        status: CouponStatus::Active,
        valid_until: Utc::now() + Duration::days(1),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

proptest! {
    /// A discount never exceeds the subtotal and never goes negative,
    /// whatever the coupon's numbers are.
    #[test]
    fn discount_is_bounded_by_subtotal(
        subtotal_cents in 0i64..=10_000_000,
        value_cents in 0i64..=20_000_00,
        percentage in 0i64..=500,
        cap_cents in proptest::option::of(0i64..=1_000_000),
        is_percentage in any::<bool>(),
    ) {
        let subtotal = Decimal::new(subtotal_cents, 2);
        let coupon = if is_percentage {
            arbitrary_coupon(
                CouponType::Percentage,
                Decimal::from(percentage),
                cap_cents.map(|c| Decimal::new(c, 2)),
            )
        } else {
            arbitrary_coupon(CouponType::Fixed, Decimal::new(value_cents, 2), None)
        };

        let (discount, _) = calculate_discount(&coupon, subtotal);
        prop_assert!(discount >= Decimal::ZERO);
        prop_assert!(discount <= subtotal);
        if let (CouponType::Percentage, Some(cap)) = (coupon.coupon_type, coupon.max_discount) {
            prop_assert!(discount <= cap.max(Decimal::ZERO) || discount <= subtotal);
        }
    }
}
