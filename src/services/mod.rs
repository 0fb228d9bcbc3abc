pub mod carts;
pub mod checkout;
pub mod coupons;
pub mod orders;
pub mod payments;
