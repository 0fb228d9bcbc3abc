use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    Set,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::{
    entities::{
        coupon::{self, CouponStatus, CouponType, Entity as Coupon, Model as CouponModel},
        order::{self, Entity as Order},
    },
    errors::ServiceError,
};

/// Outcome of validating a coupon against an order subtotal. Failures are
/// structured data, not errors: validation is a query, and an inapplicable
/// coupon is an ordinary answer.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct CouponValidation {
    pub valid: bool,
    pub discount_amount: Decimal,
    pub free_shipping: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coupon_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CouponValidation {
    fn invalid(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            discount_amount: Decimal::ZERO,
            free_shipping: false,
            coupon_id: None,
            code: None,
            error: Some(reason.into()),
        }
    }
}

#[derive(Clone)]
pub struct CouponService {
    db: Arc<DatabaseConnection>,
}

impl CouponService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Validates a coupon code against an order subtotal for a given user.
    ///
    /// Checks ACTIVE status, expiry, minimum order amount and both usage
    /// limits, then computes the discount. Never increments usage counters;
    /// that happens at order placement so an abandoned checkout does not
    /// consume a use.
    #[instrument(skip(self), fields(code = %code))]
    pub async fn validate(
        &self,
        code: &str,
        subtotal: Decimal,
        user_id: Uuid,
    ) -> Result<CouponValidation, ServiceError> {
        let normalized = code.trim().to_uppercase();
        if normalized.is_empty() {
            return Ok(CouponValidation::invalid("Coupon code is required"));
        }

        let Some(coupon) = Coupon::find()
            .filter(coupon::Column::Code.eq(normalized.clone()))
            .one(&*self.db)
            .await?
        else {
            return Ok(CouponValidation::invalid("Coupon code not found"));
        };

        if coupon.status != CouponStatus::Active {
            return Ok(CouponValidation::invalid("This coupon is no longer active"));
        }

        if coupon.valid_until <= Utc::now() {
            return Ok(CouponValidation::invalid("This coupon has expired"));
        }

        if subtotal < coupon.min_order_amount {
            return Ok(CouponValidation::invalid(format!(
                "Order total must be at least {} to use this coupon",
                coupon.min_order_amount
            )));
        }

        if let Some(limit) = coupon.usage_limit {
            if coupon.usage_count >= limit {
                warn!(code = %normalized, "coupon reached global usage limit");
                return Ok(CouponValidation::invalid(
                    "This coupon has reached its usage limit",
                ));
            }
        }

        if let Some(user_limit) = coupon.user_usage_limit {
            let used_by_user = Order::find()
                .filter(order::Column::CouponId.eq(coupon.id))
                .filter(order::Column::UserId.eq(user_id))
                .count(&*self.db)
                .await?;
            if used_by_user >= user_limit as u64 {
                return Ok(CouponValidation::invalid(
                    "You have already used this coupon",
                ));
            }
        }

        let (discount, free_shipping) = calculate_discount(&coupon, subtotal);
        debug!(code = %normalized, %discount, free_shipping, "coupon validated");

        Ok(CouponValidation {
            valid: true,
            discount_amount: discount,
            free_shipping,
            coupon_id: Some(coupon.id),
            code: Some(coupon.code),
            error: None,
        })
    }

    /// Increments a coupon's usage counter. Called once per placed order,
    /// inside the order-creation transaction.
    pub async fn increment_usage<C>(&self, conn: &C, coupon_id: Uuid) -> Result<(), ServiceError>
    where
        C: sea_orm::ConnectionTrait,
    {
        let coupon = Coupon::find_by_id(coupon_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Coupon {} not found", coupon_id)))?;

        let current = coupon.usage_count;
        let mut active: coupon::ActiveModel = coupon.into();
        active.usage_count = Set(current + 1);
        active.updated_at = Set(Utc::now());
        active.update(conn).await?;
        Ok(())
    }
}

/// Computes `(discount, free_shipping)` for an applicable coupon.
///
/// PERCENTAGE discounts are capped by `max_discount` and never exceed the
/// subtotal; FIXED discounts are clamped to the subtotal; FREE_SHIPPING
/// yields no monetary discount.
pub fn calculate_discount(coupon: &CouponModel, subtotal: Decimal) -> (Decimal, bool) {
    match coupon.coupon_type {
        CouponType::Percentage => {
            let raw = subtotal * coupon.value / Decimal::from(100);
            let capped = match coupon.max_discount {
                Some(max) => raw.min(max),
                None => raw,
            };
            (capped.min(subtotal).max(Decimal::ZERO), false)
        }
        CouponType::Fixed => (coupon.value.min(subtotal).max(Decimal::ZERO), false),
        CouponType::FreeShipping => (Decimal::ZERO, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn coupon(coupon_type: CouponType, value: Decimal, max_discount: Option<Decimal>) -> CouponModel {
        CouponModel {
            id: Uuid::new_v4(),
            code: "TEST".to_string(),
            coupon_type,
            value,
            min_order_amount: Decimal::ZERO,
            max_discount,
            usage_limit: None,
            user_usage_limit: None,
            usage_count: 0,
            status: CouponStatus::Active,
            valid_until: Utc::now() + Duration::days(30),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn percentage_discount_is_capped_by_max_discount() {
        let c = coupon(CouponType::Percentage, dec!(50), Some(dec!(200)));
        let (discount, free_shipping) = calculate_discount(&c, dec!(1000));
        assert_eq!(discount, dec!(200));
        assert!(!free_shipping);
    }

    #[test]
    fn percentage_discount_without_cap() {
        let c = coupon(CouponType::Percentage, dec!(10), None);
        let (discount, _) = calculate_discount(&c, dec!(1899));
        assert_eq!(discount, dec!(189.90));
    }

    #[test]
    fn fixed_discount_is_clamped_to_subtotal() {
        let c = coupon(CouponType::Fixed, dec!(500), None);
        let (discount, _) = calculate_discount(&c, dec!(300));
        assert_eq!(discount, dec!(300));
    }

    #[test]
    fn free_shipping_has_no_monetary_discount() {
        let c = coupon(CouponType::FreeShipping, Decimal::ZERO, None);
        let (discount, free_shipping) = calculate_discount(&c, dec!(1000));
        assert_eq!(discount, Decimal::ZERO);
        assert!(free_shipping);
    }
}
